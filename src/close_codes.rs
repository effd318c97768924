//! Classification of gateway close codes into resumable, non-resumable, and
//! never-reconnect sets.
//!
//! The three sets are pairwise disjoint and their union covers every close
//! code this crate recognizes; an unrecognized code is treated as resumable,
//! matching the platform's "when in doubt, just resume" guidance.

/// Disposition assigned to a websocket close code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CloseDisposition {
    /// Reconnect, preserving `session_id` and `seq`, and send RESUME.
    Resumable,
    /// Reconnect, but clear `session_id` and `seq` first, and send IDENTIFY.
    NonResumable,
    /// Do not reconnect at all; surface a fatal error to the caller.
    NeverReconnect,
}

/// Authentication with the token failed.
pub const AUTHENTICATION_FAILED: u16 = 4004;
/// The session sent an invalid sequence number while resuming.
pub const INVALID_SEQ: u16 = 4007;
/// The shard ID/count combination is invalid.
pub const INVALID_SHARD: u16 = 4010;
/// The bot is in too many guilds to use the requested shard count.
pub const SHARDING_REQUIRED: u16 = 4011;
/// The `v=` query parameter names an unsupported API version.
pub const INVALID_API_VERSION: u16 = 4012;
/// The IDENTIFY payload named an invalid intents bitmask.
pub const INVALID_INTENTS: u16 = 4013;
/// The IDENTIFY payload named intents the bot isn't allowed to use.
pub const DISALLOWED_INTENTS: u16 = 4014;

/// Standard WebSocket close code for a normal, requested closure.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Standard WebSocket close code for an abnormal closure (e.g. the
/// transport dropped without a close handshake). Used locally whenever a
/// `TransientNetworkError` forces a reconnect with no close code of its own.
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// Standard WebSocket close code for a protocol violation. Used locally
/// when the gateway breaks its own framing contract (HELLO out of
/// sequence, an unexpected first opcode).
pub const PROTOCOL_VIOLATION: u16 = 1002;
/// Application-defined close code this engine raises itself when the
/// heartbeat controller detects a zombied connection (spec.md §4.3).
pub const ZOMBIED: u16 = 1008;

/// Codes that require clearing `session_id`/`seq` before the next attempt,
/// but do not prevent reconnecting entirely.
const NON_RESUMABLE: &[u16] = &[
    AUTHENTICATION_FAILED,
    INVALID_SEQ,
    INVALID_SHARD,
    SHARDING_REQUIRED,
    INVALID_API_VERSION,
    INVALID_INTENTS,
    DISALLOWED_INTENTS,
];

/// Subset of [`NON_RESUMABLE`] that additionally forbids reconnecting at
/// all; the engine surfaces these as a fatal, terminal error.
const NEVER_RECONNECT: &[u16] = &[
    AUTHENTICATION_FAILED,
    INVALID_SHARD,
    SHARDING_REQUIRED,
    DISALLOWED_INTENTS,
];

/// Classify a close code observed on the underlying websocket.
pub fn classify(code: u16) -> CloseDisposition {
    if NEVER_RECONNECT.contains(&code) {
        CloseDisposition::NeverReconnect
    } else if NON_RESUMABLE.contains(&code) {
        CloseDisposition::NonResumable
    } else {
        CloseDisposition::Resumable
    }
}

#[cfg(test)]
mod tests {
    use super::{classify, CloseDisposition, NEVER_RECONNECT, NON_RESUMABLE};

    #[test]
    fn never_reconnect_is_subset_of_non_resumable() {
        for code in NEVER_RECONNECT {
            assert!(
                NON_RESUMABLE.contains(code),
                "{code} is in NEVER_RECONNECT but not NON_RESUMABLE"
            );
        }
    }

    #[test]
    fn unrecognized_codes_are_resumable() {
        assert_eq!(classify(1000), CloseDisposition::Resumable);
        assert_eq!(classify(4000), CloseDisposition::Resumable);
        assert_eq!(classify(4009), CloseDisposition::Resumable);
    }

    #[test]
    fn auth_failed_never_reconnects() {
        assert_eq!(classify(super::AUTHENTICATION_FAILED), CloseDisposition::NeverReconnect);
    }

    #[test]
    fn invalid_seq_is_non_resumable_but_reconnects() {
        assert_eq!(classify(super::INVALID_SEQ), CloseDisposition::NonResumable);
    }

    #[test]
    fn partition_is_disjoint_and_covers_named_codes() {
        let resumable_named = [1000_u16, 4000, 4001, 4002, 4003, 4005, 4008, 4009];

        for code in resumable_named {
            assert_eq!(classify(code), CloseDisposition::Resumable);
        }

        for code in NON_RESUMABLE {
            let disposition = classify(*code);
            assert_ne!(disposition, CloseDisposition::Resumable);
        }
    }
}
