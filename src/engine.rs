//! The outer reconnect loop and the crate's public entry point.
//!
//! [`GatewayEngine`] owns the pieces that persist across reconnects
//! ([`SessionState`], the [`RateLimiter`]) and reconstructs everything else —
//! the websocket, the [`FrameCodec`](crate::frame::FrameCodec), the writer
//! task, the [`HeartbeatController`] — on every connection attempt. Grounded
//! on `cluster/impl.rs`'s `Cluster::up`/`down`/`command` shape, folded down
//! from "one task per shard" to "one task for this engine's single session".

use crate::{
    close_codes,
    command::Command,
    config::Config,
    error::{FatalGatewayError, SendError, SendErrorType},
    frame,
    fsm::{self, EventSink, FsmContext, RunOnce, Stage},
    heartbeat::{HeartbeatController, Latency},
    outbound::OutboundSink,
    ratelimit::RateLimiter,
    session::SessionState,
};
use futures_util::StreamExt;
use serde_json::Value;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex as MutexSync,
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch, Notify};
use url::Url;

/// Fixed delay between reconnect attempts.
///
/// spec.md §4.5 only requires "sleep a backoff interval, loop"; the platform
/// this crate targets does not document a required backoff curve the way it
/// documents the command rate limit, so a short fixed delay is used rather
/// than invented exponential/jitter tuning.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// A read-only snapshot of engine state, obtainable without blocking the
/// event loop.
///
/// Mirrors the teacher's `Shard::info()` / `Information` type (SPEC_FULL
/// addition; spec.md doesn't name this but a complete client surfaces it for
/// health checks the same way the teacher does).
#[derive(Clone, Debug)]
pub struct Information {
    stage: Stage,
    latency: Option<Latency>,
    shard: [u64; 2],
    session_id: Option<Box<str>>,
}

impl Information {
    /// Current stage of the connection lifecycle.
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// Rolling heartbeat latency statistics for the current connection
    /// attempt, if one is running.
    pub const fn latency(&self) -> Option<&Latency> {
        self.latency.as_ref()
    }

    /// This engine's `[id, count]` shard coordinates.
    pub const fn shard(&self) -> [u64; 2] {
        self.shard
    }

    /// The current session id, if a session has been established.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

/// Outer driver for a single gateway session.
///
/// Owns the reconnect policy and reconstructs the websocket, the frame
/// codec, and the heartbeat controller on every connection attempt;
/// [`SessionState`] and the [`RateLimiter`] persist across attempts, per
/// spec.md §3's ownership model.
pub struct GatewayEngine {
    config: Config,
    session: Arc<SessionState>,
    rate_limiter: Arc<RateLimiter>,
    stage: Arc<AtomicU8>,
    active_heartbeat: Arc<MutexSync<Option<Arc<HeartbeatController>>>>,
    active_outbound: Arc<MutexSync<Option<OutboundSink>>>,
    event_sink: EventSink,
    close_notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
    running: watch::Sender<bool>,
}

// `EventSink` is `Arc<dyn Fn(...) + Send + Sync>`, which has no `Debug`
// impl, so this is written by hand rather than derived.
impl std::fmt::Debug for GatewayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayEngine")
            .field("config", &self.config)
            .field("session", &self.session)
            .field("stage", &Stage::try_from(self.stage.load(Ordering::Acquire)).ok())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl GatewayEngine {
    /// Construct an engine from `config`. Events are forwarded to
    /// `event_sink` as `(event_name, data)`; it must not block
    /// cooperatively for long, per spec.md §6.
    pub fn new(config: Config, event_sink: impl Fn(&str, Value) + Send + Sync + 'static) -> Self {
        // A caller who never configures a shard is a single-shard client;
        // `[0, 1]` is used here only for internal bookkeeping (`Information`,
        // the session's stored coordinates) — it is NOT what gets sent in
        // IDENTIFY, which threads `config.shard()` through unchanged so an
        // unconfigured shard omits the field entirely (see `fsm.rs`).
        let [shard_id, shard_count] = config.shard().unwrap_or([0, 1]);
        let (rate_capacity, rate_window) = config.command_rate();

        Self {
            session: Arc::new(SessionState::new(shard_id, shard_count)),
            rate_limiter: Arc::new(RateLimiter::new(rate_capacity, rate_window)),
            stage: Arc::new(AtomicU8::new(Stage::Disconnected as u8)),
            active_heartbeat: Arc::new(MutexSync::new(None)),
            active_outbound: Arc::new(MutexSync::new(None)),
            event_sink: Arc::new(event_sink),
            close_notify: Arc::new(Notify::new()),
            closed: Arc::new(AtomicBool::new(false)),
            running: watch::channel(false).0,
            config,
        }
    }

    /// Run connection attempts until [`close`](Self::close) is called or a
    /// never-reconnect close code is observed.
    ///
    /// # Errors
    ///
    /// Returns [`FatalGatewayError`] if the gateway closes the connection
    /// with a close code in the never-reconnect set; the engine does not
    /// attempt to reconnect after that.
    pub async fn start(&self) -> Result<(), FatalGatewayError> {
        // Open Question decision (see DESIGN.md): always clear the close
        // signal on entry, so a close from a previous start/close pair can
        // never silently latch and prevent this run from reconnecting.
        self.closed.store(false, Ordering::Release);
        let _ = self.running.send(true);

        let result = self.run_reconnect_loop().await;

        Stage::Disconnected.store(&self.stage);
        let _ = self.running.send(false);
        result
    }

    async fn run_reconnect_loop(&self) -> Result<(), FatalGatewayError> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(());
            }

            match self.run_connection().await {
                RunOnce::Done => return Ok(()),
                RunOnce::RestartResume { code, reason } => {
                    tracing::info!(code, %reason, "reconnecting, will attempt to resume");
                }
                RunOnce::RestartReidentify { code, reason } => {
                    tracing::info!(code, %reason, "reconnecting, clearing session and reidentifying");
                    self.session.reset();
                }
                RunOnce::Fatal { code, reason } => {
                    tracing::error!(code, %reason, "gateway will not allow reconnecting; giving up");
                    return Err(FatalGatewayError { code, reason });
                }
            }

            if self.closed.load(Ordering::Acquire) {
                return Ok(());
            }

            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    }

    /// Open the websocket, wire up a fresh writer task and heartbeat
    /// controller, and drive exactly one connection attempt through
    /// [`fsm::run_once`].
    async fn run_connection(&self) -> RunOnce {
        Stage::Connecting.store(&self.stage);

        let url = match self.build_url() {
            Ok(url) => url,
            Err(source) => {
                tracing::error!(%source, "failed to construct the gateway url");
                return RunOnce::RestartResume {
                    code: close_codes::ABNORMAL_CLOSURE,
                    reason: "failed to construct gateway url".into(),
                };
            }
        };

        let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((stream, _response)) => stream,
            Err(source) => {
                tracing::warn!(%source, "failed to open the websocket connection");
                return RunOnce::RestartResume {
                    code: close_codes::ABNORMAL_CLOSURE,
                    reason: "failed to open the websocket connection".into(),
                };
            }
        };

        let (write, mut read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel::<Command>();
        let outbound = OutboundSink::new(Arc::clone(&self.rate_limiter), tx);

        self.active_outbound
            .lock()
            .expect("active_outbound lock poisoned")
            .replace(outbound.clone());

        let writer = tokio::spawn(run_writer(write, rx));

        let ctx = FsmContext {
            session: Arc::clone(&self.session),
            token: self.config.token.clone(),
            shard: self.config.shard(),
            large_threshold: self.config.large_threshold(),
            initial_presence: self.config.initial_presence().cloned(),
            identify_properties: self.config.identify_properties(),
            max_persistent_buffer_size: self.config.max_persistent_buffer_size(),
            event_sink: Arc::clone(&self.event_sink),
            stage: Arc::clone(&self.stage),
            active_heartbeat: Arc::clone(&self.active_heartbeat),
        };

        let result = fsm::run_once(&mut read, outbound, &ctx, &self.close_notify).await;

        self.active_outbound
            .lock()
            .expect("active_outbound lock poisoned")
            .take();
        writer.abort();

        result
    }

    /// Build the `wss://host:port/?v=...&encoding=json&compression=zlib-stream`
    /// connection URL, per spec.md §6 and the literal scenario in §8.1.
    fn build_url(&self) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(self.config.host())?;

        url.query_pairs_mut()
            .clear()
            .append_pair("v", &self.config.api_version().to_string())
            .append_pair("encoding", "json")
            .append_pair("compression", "zlib-stream");

        url.set_fragment(None);

        Ok(url)
    }

    /// Request closure of the engine's reconnect loop.
    ///
    /// Idempotent: calling this more than once, including concurrently,
    /// has no additional effect beyond the first call. If `block` is
    /// `true`, waits for the current connection attempt (if any) and the
    /// reconnect loop to finish before returning.
    pub async fn close(&self, block: bool) {
        self.closed.store(true, Ordering::Release);
        self.close_notify.notify_waiters();

        if block {
            let mut running = self.running.subscribe();

            while *running.borrow() {
                if running.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    /// Send a raw command over the current connection, gated by the
    /// [`RateLimiter`].
    ///
    /// # Errors
    ///
    /// Returns [`SendErrorType::SessionInactive`] if there is no active
    /// connection (the engine is between connection attempts or has been
    /// closed).
    pub async fn send_command(&self, command: Command) -> Result<(), SendError> {
        let outbound = self
            .active_outbound
            .lock()
            .expect("active_outbound lock poisoned")
            .clone();

        match outbound {
            Some(outbound) => outbound.send(command).await,
            None => Err(SendError {
                kind: SendErrorType::SessionInactive,
                source: None,
            }),
        }
    }

    /// Request a chunk of a guild's members (opcode 8).
    ///
    /// All id fields are sent to the server as base-10 strings, per
    /// spec.md §4.5's snowflake wire convention.
    pub async fn request_guild_members(
        &self,
        guild_id: u64,
        query: impl Into<Box<str>>,
        limit: u64,
    ) -> Result<(), SendError> {
        self.send_command(Command::RequestGuildMembers {
            guild_id: guild_id.to_string().into(),
            query: query.into(),
            limit,
        })
        .await
    }

    /// Update this session's presence (opcode 3).
    pub async fn update_presence(
        &self,
        idle_since: Option<u64>,
        activity: Option<Value>,
        status: impl Into<Box<str>>,
        afk: bool,
    ) -> Result<(), SendError> {
        self.send_command(Command::PresenceUpdate {
            idle_since,
            activity,
            status: status.into(),
            afk,
        })
        .await
    }

    /// Update this session's voice state (opcode 4).
    pub async fn update_voice_state(
        &self,
        guild_id: u64,
        channel_id: Option<u64>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<(), SendError> {
        self.send_command(Command::VoiceStateUpdate {
            guild_id: guild_id.to_string().into(),
            channel_id: channel_id.map(|id| id.to_string().into()),
            self_mute,
            self_deaf,
        })
        .await
    }

    /// A read-only snapshot of the engine's current state.
    pub fn information(&self) -> Information {
        let stage = Stage::try_from(self.stage.load(Ordering::Acquire)).unwrap_or(Stage::Disconnected);

        let latency = self
            .active_heartbeat
            .lock()
            .expect("active_heartbeat lock poisoned")
            .as_ref()
            .map(|heartbeat| heartbeat.latency());

        Information {
            stage,
            latency,
            shard: self.session.shard(),
            session_id: self.session.id(),
        }
    }
}

/// Drain commands off `rx` and write them to the socket until the channel
/// closes (every [`OutboundSink`] clone for this attempt has been dropped)
/// or a write fails, then perform the close handshake.
///
/// Grounded on `shard/processor/socket_forwarder.rs::SocketForwarder::run`,
/// folded down to the outbound-only half: this crate's inbound reads happen
/// directly on `FrameCodec::decode_next` inside `fsm::run_once` rather than
/// through a second forwarder loop.
async fn run_writer<S>(mut write: S, mut rx: mpsc::UnboundedReceiver<Command>)
where
    S: futures_util::Sink<tokio_tungstenite::tungstenite::Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    use futures_util::SinkExt;

    while let Some(command) = rx.recv().await {
        if let Err(source) = frame::encode_and_send(&mut write, &command).await {
            tracing::warn!(%source, "writing an outbound command failed; ending the writer task");
            break;
        }
    }

    let _ = write.close().await;
}

#[cfg(test)]
mod tests {
    use super::{GatewayEngine, Information};
    use crate::config::ConfigBuilder;
    use static_assertions::assert_impl_all;
    use std::fmt::Debug;

    assert_impl_all!(GatewayEngine: Debug, Send, Sync);
    assert_impl_all!(Information: Clone, Debug, Send, Sync);

    fn engine() -> GatewayEngine {
        let config = ConfigBuilder::new("wss://gateway.example:4949/", "token")
            .api_version(7)
            .build();

        GatewayEngine::new(config, |_name, _data| {})
    }

    #[test]
    fn url_construction_matches_literal_scenario() {
        let engine = engine();
        let url = engine.build_url().unwrap();

        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.host_str(), Some("gateway.example"));
        assert_eq!(url.port(), Some(4949));
        assert_eq!(url.query(), Some("v=7&encoding=json&compression=zlib-stream"));
        assert_eq!(url.fragment(), None);
    }

    #[test]
    fn fresh_engine_has_no_active_connection() {
        let engine = engine();
        let info = engine.information();
        assert_eq!(info.session_id(), None);
        assert!(info.latency().is_none());
    }

    #[tokio::test]
    async fn send_command_without_a_connection_is_session_inactive() {
        let engine = engine();
        let err = engine
            .send_command(crate::command::Command::Heartbeat { seq: None })
            .await
            .unwrap_err();

        assert!(matches!(
            err.kind(),
            crate::error::SendErrorType::SessionInactive
        ));
    }

    #[tokio::test]
    async fn closing_twice_is_idempotent() {
        let engine = engine();
        engine.close(true).await;
        engine.close(true).await;
    }
}
