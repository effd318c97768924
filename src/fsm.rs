//! The central state machine sequencing connect → HELLO → IDENTIFY/RESUME →
//! event loop → close, per spec.md §4.4.

use crate::{
    close_codes::{self, CloseDisposition},
    command::Command,
    frame::{Frame, FrameCodec, FrameErrorType},
    heartbeat::HeartbeatController,
    outbound::OutboundSink,
    session::SessionState,
};
use futures_util::Stream;
use serde::Deserialize;
use serde_json::Value;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// Stage of the connection lifecycle, per spec.md §4.4's state list.
///
/// Mirrors the shape of a typical gateway shard's `Stage` enum: a plain
/// `#[repr(u8)]` that an outer [`Information`](crate::engine::Information)
/// snapshot can load from an `AtomicU8` without taking a lock.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Stage {
    Disconnected = 0,
    Connecting = 1,
    AwaitingHello = 2,
    Identifying = 3,
    Resuming = 4,
    Running = 5,
    Closing = 6,
}

impl Stage {
    pub(crate) fn store(self, cell: &AtomicU8) {
        cell.store(self as u8, Ordering::Release);
    }
}

impl TryFrom<u8> for Stage {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(Self::Disconnected),
            1 => Ok(Self::Connecting),
            2 => Ok(Self::AwaitingHello),
            3 => Ok(Self::Identifying),
            4 => Ok(Self::Resuming),
            5 => Ok(Self::Running),
            6 => Ok(Self::Closing),
            other => Err(other),
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingHello => "awaiting hello",
            Self::Identifying => "identifying",
            Self::Resuming => "resuming",
            Self::Running => "running",
            Self::Closing => "closing",
        };

        f.write_str(name)
    }
}

/// Outcome of driving one connection attempt to completion.
///
/// This is the tagged result variant spec.md §9 calls for in place of the
/// two exception types the original implementation throws from its event
/// loop to unwind back to the reconnect driver.
#[derive(Clone, Debug)]
pub enum RunOnce {
    /// The caller requested a graceful close; do not reconnect.
    Done,
    /// Reconnect, preserving `session_id`/`seq`, and RESUME.
    RestartResume { code: u16, reason: Box<str> },
    /// Reconnect, but clear `session_id`/`seq` first, and IDENTIFY.
    RestartReidentify { code: u16, reason: Box<str> },
    /// A never-reconnect close code was observed; the engine must stop.
    Fatal { code: u16, reason: Box<str> },
}

/// `d` payload of a HELLO frame (opcode 10).
#[derive(Debug, Deserialize)]
struct HelloInfo {
    heartbeat_interval: u64,
    #[serde(default, rename = "_trace")]
    trace: Vec<Box<str>>,
}

/// `d` payload of a READY event, fields this engine actually reads.
#[derive(Debug, Deserialize)]
struct ReadyInfo {
    session_id: Box<str>,
    #[serde(default, rename = "_trace")]
    trace: Vec<Box<str>>,
}

/// Callback receiving `(event_name, data)` for every DISPATCH frame. Must
/// not block the event loop for long, per spec.md §6.
pub type EventSink = Arc<dyn Fn(&str, Value) + Send + Sync>;

/// Everything one connection attempt needs that outlives the attempt
/// itself (shared across reconnects).
pub struct FsmContext {
    pub session: Arc<SessionState>,
    pub token: Box<str>,
    /// `[id, count]` shard coordinates to IDENTIFY with, or `None` if the
    /// caller never configured one — threaded through verbatim rather than
    /// derived from `session.shard()`, so an unconfigured shard omits the
    /// `shard` field from IDENTIFY entirely, per spec.md §8 scenario 4.
    pub shard: Option<[u64; 2]>,
    pub large_threshold: u64,
    pub initial_presence: Option<Value>,
    pub identify_properties: crate::command::IdentifyProperties,
    pub max_persistent_buffer_size: usize,
    pub event_sink: EventSink,
    pub stage: Arc<AtomicU8>,
    /// The currently-running connection attempt's heartbeat controller, if
    /// any. Published here so [`GatewayEngine::information`](crate::engine::GatewayEngine::information)
    /// can read live latency stats without owning the controller itself.
    pub active_heartbeat: Arc<std::sync::Mutex<Option<Arc<HeartbeatController>>>>,
}

/// Run exactly one connection attempt: HELLO, then IDENTIFY or RESUME, then
/// the DISPATCH/opcode event loop, until the socket closes, the caller
/// requests a close, or a protocol signal forces a restart.
pub async fn run_once<S>(
    ws_read: &mut S,
    outbound: OutboundSink,
    ctx: &FsmContext,
    close_notify: &Notify,
) -> RunOnce
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut codec = FrameCodec::new(ctx.max_persistent_buffer_size);

    Stage::Connecting.store(&ctx.stage);
    Stage::AwaitingHello.store(&ctx.stage);

    let hello_frame = match codec.decode_next(ws_read).await {
        Ok(frame) => frame,
        Err(err) => {
            return match err.kind() {
                FrameErrorType::ConnectionClosed { code: Some(code), reason } => {
                    classify_close(*code, reason.clone())
                }
                _ => transient_restart(&err.to_string()),
            };
        }
    };

    if hello_frame.opcode != 10 {
        tracing::warn!(
            opcode = hello_frame.opcode,
            "expected HELLO as the first frame; restarting with resume"
        );
        return RunOnce::RestartResume {
            code: close_codes::PROTOCOL_VIOLATION,
            reason: "first frame was not HELLO".into(),
        };
    }

    let hello: HelloInfo = match serde_json::from_value(hello_frame.data) {
        Ok(hello) => hello,
        Err(source) => {
            tracing::error!(%source, "malformed HELLO payload");
            return RunOnce::RestartReidentify {
                code: close_codes::PROTOCOL_VIOLATION,
                reason: "malformed HELLO payload".into(),
            };
        }
    };

    if hello.heartbeat_interval == 0 {
        tracing::error!("server sent a zero heartbeat_interval");
        return RunOnce::RestartReidentify {
            code: close_codes::PROTOCOL_VIOLATION,
            reason: "heartbeat_interval was zero".into(),
        };
    }

    ctx.session.set_trace(hello.trace);

    let interval = crate::heartbeat::scaled_interval(Duration::from_millis(hello.heartbeat_interval));
    let session_for_heartbeat = Arc::clone(&ctx.session);
    let heartbeat = Arc::new(HeartbeatController::start(
        interval,
        move || session_for_heartbeat.seq(),
        outbound.clone(),
    ));

    ctx.active_heartbeat
        .lock()
        .expect("active_heartbeat lock poisoned")
        .replace(Arc::clone(&heartbeat));

    let result =
        run_handshake_and_loop(ws_read, &mut codec, &outbound, ctx, &heartbeat, close_notify).await;
    heartbeat.stop();
    ctx.active_heartbeat
        .lock()
        .expect("active_heartbeat lock poisoned")
        .take();
    result
}

/// Send IDENTIFY or RESUME, then drive the event loop until the attempt
/// ends. Reuses the single `FrameCodec` (and its never-reset inflator)
/// created for the HELLO read, per spec.md §5.
async fn run_handshake_and_loop<S>(
    ws_read: &mut S,
    codec: &mut FrameCodec,
    outbound: &OutboundSink,
    ctx: &FsmContext,
    heartbeat: &HeartbeatController,
    close_notify: &Notify,
) -> RunOnce
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let resuming = ctx.session.can_resume();

    if resuming {
        Stage::Resuming.store(&ctx.stage);

        let seq = ctx.session.seq().unwrap_or_default();
        let session_id = ctx.session.id().unwrap_or_default();

        if let Err(err) = outbound
            .send(Command::Resume {
                token: ctx.token.clone(),
                session_id,
                seq,
            })
            .await
        {
            tracing::warn!(%err, "failed to send RESUME");
            return transient_restart("failed to send RESUME");
        }
    } else {
        Stage::Identifying.store(&ctx.stage);

        if let Err(err) = outbound
            .send(Command::Identify {
                token: ctx.token.clone(),
                large_threshold: ctx.large_threshold,
                properties: ctx.identify_properties.clone(),
                shard: ctx.shard,
                presence: ctx.initial_presence.clone(),
            })
            .await
        {
            tracing::warn!(%err, "failed to send IDENTIFY");
            return transient_restart("failed to send IDENTIFY");
        }
    }

    loop {
        tokio::select! {
            biased;

            () = close_notify.notified() => {
                Stage::Closing.store(&ctx.stage);
                return RunOnce::Done;
            }

            () = heartbeat.wait_zombied() => {
                tracing::warn!("no heartbeat ack since the last beat; treating the connection as zombied");
                return RunOnce::RestartResume {
                    code: close_codes::ZOMBIED,
                    reason: "heartbeat ack overdue".into(),
                };
            }

            frame = codec.decode_next(ws_read) => {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(err) => {
                        return match err.kind() {
                            FrameErrorType::TypeError => RunOnce::RestartReidentify {
                                code: close_codes::PROTOCOL_VIOLATION,
                                reason: "received a non-object JSON frame".into(),
                            },
                            FrameErrorType::ConnectionClosed { code: Some(code), reason } => {
                                classify_close(*code, reason.clone())
                            }
                            _ => transient_restart(&err.to_string()),
                        };
                    }
                };

                if let Some(outcome) = handle_frame(frame, ctx, outbound, heartbeat).await {
                    return outcome;
                }
            }
        }
    }
}

/// Handle one frame in `Running`/`Identifying`/`Resuming`. Returns `Some`
/// when the connection attempt must end.
async fn handle_frame(
    frame: Frame,
    ctx: &FsmContext,
    outbound: &OutboundSink,
    heartbeat: &HeartbeatController,
) -> Option<RunOnce> {
    match frame.opcode {
        0 => {
            if let Some(seq) = frame.seq {
                ctx.session.set_seq(seq);
            }

            let event_type = frame.event_type.clone().unwrap_or_default();

            if &*event_type == "READY" {
                match serde_json::from_value::<ReadyInfo>(frame.data.clone()) {
                    Ok(ready) => {
                        ctx.session.set_id(ready.session_id);
                        ctx.session.set_trace(ready.trace);
                        Stage::Running.store(&ctx.stage);
                    }
                    Err(source) => {
                        tracing::error!(%source, "malformed READY payload");
                        return Some(RunOnce::RestartReidentify {
                            code: close_codes::PROTOCOL_VIOLATION,
                            reason: "malformed READY payload".into(),
                        });
                    }
                }
            } else if &*event_type == "RESUMED" {
                Stage::Running.store(&ctx.stage);
            }

            (ctx.event_sink)(&event_type, frame.data);
            None
        }
        1 => {
            // Server-requested heartbeat: ACK immediately with the same
            // shape the heartbeat controller uses for its own beats.
            if let Err(err) = outbound
                .send(Command::Heartbeat {
                    seq: ctx.session.seq(),
                })
                .await
            {
                tracing::warn!(%err, "failed to ack a server-requested heartbeat");
            }
            None
        }
        7 => {
            // RECONNECT: the server is asking us to reconnect and
            // reidentify, per spec.md §4.4.
            Some(RunOnce::RestartReidentify {
                code: close_codes::NORMAL_CLOSURE,
                reason: "server requested reconnect".into(),
            })
        }
        9 => {
            let resumable = frame.data.as_bool().unwrap_or(false);

            Some(if resumable {
                RunOnce::RestartResume {
                    code: close_codes::NORMAL_CLOSURE,
                    reason: "invalid session, resumable".into(),
                }
            } else {
                RunOnce::RestartReidentify {
                    code: close_codes::NORMAL_CLOSURE,
                    reason: "invalid session, not resumable".into(),
                }
            })
        }
        10 => Some(RunOnce::RestartReidentify {
            code: close_codes::PROTOCOL_VIOLATION,
            reason: "unexpected HELLO outside the handshake".into(),
        }),
        11 => {
            heartbeat.handle_ack();
            None
        }
        unknown => {
            tracing::trace!(opcode = unknown, "ignoring unrecognized opcode");
            None
        }
    }
}

/// Classify a websocket close code observed on the underlying transport
/// into the appropriate [`RunOnce`] variant.
pub fn classify_close(code: u16, reason: impl Into<Box<str>>) -> RunOnce {
    let reason = reason.into();

    match close_codes::classify(code) {
        CloseDisposition::Resumable => RunOnce::RestartResume { code, reason },
        CloseDisposition::NonResumable => RunOnce::RestartReidentify { code, reason },
        CloseDisposition::NeverReconnect => RunOnce::Fatal { code, reason },
    }
}

fn transient_restart(reason: &str) -> RunOnce {
    RunOnce::RestartResume {
        code: close_codes::ABNORMAL_CLOSURE,
        reason: reason.into(),
    }
}
