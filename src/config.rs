//! Immutable engine configuration and its consuming builder.

use crate::{command::IdentifyProperties, ratelimit};
use serde_json::Value;
use std::{borrow::Cow, time::Duration};

/// Configuration used by a [`GatewayEngine`](crate::engine::GatewayEngine)
/// to connect, identify, and operate.
///
/// Build one with [`ConfigBuilder`].
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) host: Cow<'static, str>,
    pub(crate) token: Box<str>,
    pub(crate) api_version: u8,
    pub(crate) shard: Option<[u64; 2]>,
    pub(crate) large_threshold: u64,
    pub(crate) initial_presence: Option<Value>,
    pub(crate) incognito: bool,
    pub(crate) max_persistent_buffer_size: usize,
    pub(crate) command_rate: (u32, Duration),
    pub(crate) identify_properties: Option<IdentifyProperties>,
}

impl Config {
    /// Start building a configuration for the given host and token.
    pub fn builder(host: impl Into<Cow<'static, str>>, token: impl Into<Box<str>>) -> ConfigBuilder {
        ConfigBuilder::new(host, token)
    }

    /// The gateway host URL, e.g. `wss://gateway.example:4949/`.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The `v=` API version query parameter.
    pub const fn api_version(&self) -> u8 {
        self.api_version
    }

    /// This engine's `[id, count]` shard coordinates, or `None` if the
    /// caller never configured one (a single-shard client, per spec.md §8
    /// scenario 4: IDENTIFY then omits the `shard` field entirely rather
    /// than defaulting to `[0, 1]`).
    pub const fn shard(&self) -> Option<[u64; 2]> {
        self.shard
    }

    /// Guild-size cutoff above which member lists are omitted from
    /// GUILD_CREATE.
    pub const fn large_threshold(&self) -> u64 {
        self.large_threshold
    }

    /// Presence to set immediately upon IDENTIFY, if any.
    pub const fn initial_presence(&self) -> Option<&Value> {
        self.initial_presence.as_ref()
    }

    /// Whether the engine reports non-identifying process properties.
    pub const fn incognito(&self) -> bool {
        self.incognito
    }

    /// Boundary above which the inbound receive buffer is replaced rather
    /// than cleared in place.
    pub const fn max_persistent_buffer_size(&self) -> usize {
        self.max_persistent_buffer_size
    }

    /// `(capacity, window)` for the outbound command rate limiter.
    pub const fn command_rate(&self) -> (u32, Duration) {
        self.command_rate
    }

    pub(crate) fn identify_properties(&self) -> IdentifyProperties {
        if self.incognito {
            return IdentifyProperties::incognito();
        }

        self.identify_properties.clone().unwrap_or_else(|| IdentifyProperties {
            os: std::env::consts::OS.into(),
            browser: env!("CARGO_PKG_NAME").into(),
            device: env!("CARGO_PKG_NAME").into(),
        })
    }
}

/// Builder for [`Config`]. Mirrors the teacher's `ShardBuilder`: a consuming
/// builder with panicking setters for invariants that are programmer errors
/// to violate (shard ID out of range, large_threshold out of bounds).
#[derive(Debug)]
#[must_use = "has no effect if not built"]
pub struct ConfigBuilder {
    host: Cow<'static, str>,
    token: Box<str>,
    api_version: u8,
    shard: Option<[u64; 2]>,
    large_threshold: u64,
    initial_presence: Option<Value>,
    incognito: bool,
    max_persistent_buffer_size: usize,
    command_rate: (u32, Duration),
    identify_properties: Option<IdentifyProperties>,
}

/// Default `v=` query parameter used when none is set explicitly.
const DEFAULT_API_VERSION: u8 = 10;

/// Default receive-buffer persistence boundary: 4 MiB, matching the
/// teacher's `zlib-stream` buffer reuse threshold.
const DEFAULT_MAX_PERSISTENT_BUFFER_SIZE: usize = 4 * 1024 * 1024;

impl ConfigBuilder {
    /// Start a new builder for the given gateway host and auth token.
    pub fn new(host: impl Into<Cow<'static, str>>, token: impl Into<Box<str>>) -> Self {
        Self {
            host: host.into(),
            token: token.into(),
            api_version: DEFAULT_API_VERSION,
            shard: None,
            large_threshold: 50,
            initial_presence: None,
            incognito: false,
            max_persistent_buffer_size: DEFAULT_MAX_PERSISTENT_BUFFER_SIZE,
            command_rate: (ratelimit::DEFAULT_CAPACITY, ratelimit::DEFAULT_WINDOW),
            identify_properties: None,
        }
    }

    /// Consume the builder, producing an immutable [`Config`].
    pub fn build(self) -> Config {
        Config {
            host: self.host,
            token: self.token,
            api_version: self.api_version,
            shard: self.shard,
            large_threshold: self.large_threshold,
            initial_presence: self.initial_presence,
            incognito: self.incognito,
            max_persistent_buffer_size: self.max_persistent_buffer_size,
            command_rate: self.command_rate,
            identify_properties: self.identify_properties,
        }
    }

    /// Set the `v=` API version query parameter. Default 10.
    pub const fn api_version(mut self, api_version: u8) -> Self {
        self.api_version = api_version;
        self
    }

    /// Set the shard ID to connect as and the total shard count.
    ///
    /// Leaving this unset omits the `shard` field from IDENTIFY entirely,
    /// per spec.md §8 scenario 4, rather than defaulting to `[0, 1]`.
    ///
    /// # Panics
    ///
    /// Panics if `shard_id >= shard_count`.
    #[track_caller]
    pub fn shard(mut self, shard_id: u64, shard_count: u64) -> Self {
        assert!(
            shard_id < shard_count,
            "shard id {shard_id} must be less than shard count {shard_count}"
        );

        self.shard = Some([shard_id, shard_count]);
        self
    }

    /// Set the guild-size cutoff at which member lists are omitted.
    ///
    /// # Panics
    ///
    /// Panics if the value is below 50 or above 250, matching the
    /// platform-documented bounds.
    #[track_caller]
    pub fn large_threshold(mut self, large_threshold: u64) -> Self {
        assert!(
            (50..=250).contains(&large_threshold),
            "large_threshold {large_threshold} must be between 50 and 250"
        );

        self.large_threshold = large_threshold;
        self
    }

    /// Set the presence to identify with.
    pub fn initial_presence(mut self, presence: Value) -> Self {
        self.initial_presence = Some(presence);
        self
    }

    /// Enable incognito mode: IDENTIFY properties are sent as the literal
    /// strings `"os"`/`"browser"`/`"device"` rather than the real platform
    /// and library identifiers.
    pub const fn incognito(mut self, incognito: bool) -> Self {
        self.incognito = incognito;
        self
    }

    /// Override the platform/library identify properties directly. Ignored
    /// when `incognito` is set.
    pub fn identify_properties(mut self, properties: IdentifyProperties) -> Self {
        self.identify_properties = Some(properties);
        self
    }

    /// Set the receive-buffer persistence boundary, in bytes.
    pub const fn max_persistent_buffer_size(mut self, bytes: usize) -> Self {
        self.max_persistent_buffer_size = bytes;
        self
    }

    /// Set the outbound command rate limit as `(capacity, window)`.
    pub const fn command_rate(mut self, capacity: u32, window: Duration) -> Self {
        self.command_rate = (capacity, window);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, ConfigBuilder};
    use static_assertions::assert_impl_all;
    use std::fmt::Debug;

    assert_impl_all!(Config: Clone, Debug, Send, Sync);
    assert_impl_all!(ConfigBuilder: Debug, Send, Sync);

    #[test]
    fn default_config_has_documented_rate_limit() {
        let config = ConfigBuilder::new("wss://gateway.example:4949/", "token").build();
        assert_eq!(config.command_rate().0, 120);
    }

    #[test]
    #[should_panic(expected = "must be less than shard count")]
    fn shard_id_must_be_below_count() {
        ConfigBuilder::new("wss://gateway.example/", "token").shard(2, 2);
    }

    #[test]
    fn shard_is_unset_unless_explicitly_configured() {
        let config = ConfigBuilder::new("wss://gateway.example/", "token").build();
        assert_eq!(config.shard(), None);

        let config = ConfigBuilder::new("wss://gateway.example/", "token")
            .shard(1, 4)
            .build();
        assert_eq!(config.shard(), Some([1, 4]));
    }

    #[test]
    #[should_panic(expected = "must be between 50 and 250")]
    fn large_threshold_out_of_bounds_panics() {
        ConfigBuilder::new("wss://gateway.example/", "token").large_threshold(10);
    }

    #[test]
    fn incognito_identify_properties_are_the_literal_strings() {
        let config = ConfigBuilder::new("wss://gateway.example/", "token")
            .incognito(true)
            .build();

        let properties = config.identify_properties();
        assert_eq!(&*properties.os, "os");
        assert_eq!(&*properties.browser, "browser");
        assert_eq!(&*properties.device, "device");
    }
}
