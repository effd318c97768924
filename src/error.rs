//! Crate-wide error taxonomy.
//!
//! Individual components (`FrameCodec`, `RateLimiter`, ...) expose their own
//! narrow error types; this module holds the types that cross component
//! boundaries — the ones [`GatewayEngine`](crate::engine::GatewayEngine) and
//! [`fsm::run_once`](crate::fsm::run_once) hand back and forth.

use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};

/// A close code was observed in the never-reconnect set; the engine has
/// given up and will not attempt to reconnect.
#[derive(Debug)]
pub struct FatalGatewayError {
    pub(crate) code: u16,
    pub(crate) reason: Box<str>,
}

impl FatalGatewayError {
    /// The close code that caused the engine to stop reconnecting.
    pub const fn code(&self) -> u16 {
        self.code
    }

    /// The server- or client-supplied reason string, if any.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl Display for FatalGatewayError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(
            f,
            "gateway session closed permanently with code {}: {}",
            self.code, self.reason
        )
    }
}

impl Error for FatalGatewayError {}

/// Sending a command over the session failed.
#[derive(Debug)]
pub struct SendError {
    pub(crate) kind: SendErrorType,
    pub(crate) source: Option<Box<dyn Error + Send + Sync>>,
}

impl SendError {
    /// Immutable reference to the type of error that occurred.
    pub const fn kind(&self) -> &SendErrorType {
        &self.kind
    }
}

impl Display for SendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self.kind {
            SendErrorType::Serializing => f.write_str("failed to serialize command as json"),
            SendErrorType::Sending => f.write_str("failed to send the command over the socket"),
            SendErrorType::SessionInactive => {
                f.write_str("no active connection to send the command over")
            }
        }
    }
}

impl Error for SendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn Error + 'static))
    }
}

/// Type of [`SendError`] that occurred.
#[derive(Debug)]
#[non_exhaustive]
pub enum SendErrorType {
    /// Serializing the command as JSON failed.
    Serializing,
    /// Writing the serialized command to the websocket failed.
    Sending,
    /// There is currently no active connection (the engine is between
    /// connection attempts or has been closed).
    SessionInactive,
}

#[cfg(test)]
mod tests {
    use super::{FatalGatewayError, SendError};
    use static_assertions::assert_impl_all;
    use std::{error::Error, fmt::Debug};

    assert_impl_all!(FatalGatewayError: Error, Send, Sync, Debug);
    assert_impl_all!(SendError: Error, Send, Sync, Debug);
}
