//! Outbound command payloads: the `d` bodies the engine sends over the
//! socket, each tagged with its wire opcode.

use serde::{Serialize, Serializer};
use serde_json::Value;

/// Process identification sent as part of IDENTIFY, per spec.md §4.4.
///
/// In incognito mode the three fields are sent verbatim as `"os"`,
/// `"browser"`, `"device"` to frustrate fingerprinting rather than leaking
/// the real platform and library version.
#[derive(Clone, Debug, Serialize)]
pub struct IdentifyProperties {
    #[serde(rename = "$os")]
    pub os: Box<str>,
    #[serde(rename = "$browser")]
    pub browser: Box<str>,
    #[serde(rename = "$device")]
    pub device: Box<str>,
}

impl IdentifyProperties {
    /// The literal, non-identifying properties sent when `incognito` is set.
    pub fn incognito() -> Self {
        Self {
            os: "os".into(),
            browser: "browser".into(),
            device: "device".into(),
        }
    }
}

/// The outbound command envelope: `{"op": ..., "d": ...}`.
///
/// Every variant carries its own `op` via [`Command::opcode`] and serializes
/// through [`crate::json::to_vec`] exactly as shown in spec.md §8 scenarios
/// 3-6; field order matches those literal scenarios so golden-output tests
/// stay stable.
#[derive(Clone, Debug)]
pub enum Command {
    /// Opcode 1. `d` is the last known sequence number, or null if none.
    Heartbeat { seq: Option<u64> },
    /// Opcode 2. Initial handshake, sent when no session can be resumed.
    Identify {
        token: Box<str>,
        large_threshold: u64,
        properties: IdentifyProperties,
        shard: Option<[u64; 2]>,
        presence: Option<Value>,
    },
    /// Opcode 3.
    PresenceUpdate {
        idle_since: Option<u64>,
        activity: Option<Value>,
        status: Box<str>,
        afk: bool,
    },
    /// Opcode 4.
    VoiceStateUpdate {
        guild_id: Box<str>,
        channel_id: Option<Box<str>>,
        self_mute: bool,
        self_deaf: bool,
    },
    /// Opcode 6. Reconnection handshake when `session_id` and `seq` are
    /// both known.
    Resume {
        token: Box<str>,
        session_id: Box<str>,
        seq: u64,
    },
    /// Opcode 8.
    RequestGuildMembers {
        guild_id: Box<str>,
        query: Box<str>,
        limit: u64,
    },
}

impl Command {
    /// The wire opcode for this command.
    pub const fn opcode(&self) -> u8 {
        match self {
            Self::Heartbeat { .. } => 1,
            Self::Identify { .. } => 2,
            Self::PresenceUpdate { .. } => 3,
            Self::VoiceStateUpdate { .. } => 4,
            Self::Resume { .. } => 6,
            Self::RequestGuildMembers { .. } => 8,
        }
    }
}

impl Serialize for Command {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("op", &self.opcode())?;

        match self {
            Self::Heartbeat { seq } => map.serialize_entry("d", seq)?,
            Self::Identify {
                token,
                large_threshold,
                properties,
                shard,
                presence,
            } => {
                #[derive(Serialize)]
                struct Data<'a> {
                    token: &'a str,
                    compress: bool,
                    large_threshold: u64,
                    properties: &'a IdentifyProperties,
                    #[serde(skip_serializing_if = "Option::is_none")]
                    shard: &'a Option<[u64; 2]>,
                    #[serde(skip_serializing_if = "Option::is_none")]
                    presence: &'a Option<Value>,
                }

                map.serialize_entry(
                    "d",
                    &Data {
                        token,
                        compress: false,
                        large_threshold: *large_threshold,
                        properties,
                        shard,
                        presence,
                    },
                )?;
            }
            Self::PresenceUpdate {
                idle_since,
                activity,
                status,
                afk,
            } => {
                #[derive(Serialize)]
                struct Data<'a> {
                    idle: Option<u64>,
                    game: &'a Option<Value>,
                    status: &'a str,
                    afk: bool,
                }

                map.serialize_entry(
                    "d",
                    &Data {
                        idle: *idle_since,
                        game: activity,
                        status,
                        afk: *afk,
                    },
                )?;
            }
            Self::VoiceStateUpdate {
                guild_id,
                channel_id,
                self_mute,
                self_deaf,
            } => {
                #[derive(Serialize)]
                struct Data<'a> {
                    guild_id: &'a str,
                    channel_id: &'a Option<Box<str>>,
                    self_mute: bool,
                    self_deaf: bool,
                }

                map.serialize_entry(
                    "d",
                    &Data {
                        guild_id,
                        channel_id,
                        self_mute: *self_mute,
                        self_deaf: *self_deaf,
                    },
                )?;
            }
            Self::Resume {
                token,
                session_id,
                seq,
            } => {
                #[derive(Serialize)]
                struct Data<'a> {
                    token: &'a str,
                    session_id: &'a str,
                    seq: u64,
                }

                map.serialize_entry(
                    "d",
                    &Data {
                        token,
                        session_id,
                        seq: *seq,
                    },
                )?;
            }
            Self::RequestGuildMembers {
                guild_id,
                query,
                limit,
            } => {
                #[derive(Serialize)]
                struct Data<'a> {
                    guild_id: &'a str,
                    query: &'a str,
                    limit: u64,
                }

                map.serialize_entry(
                    "d",
                    &Data {
                        guild_id,
                        query,
                        limit: *limit,
                    },
                )?;
            }
        }

        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::{Command, IdentifyProperties};
    use serde_json::json;
    use static_assertions::assert_impl_all;
    use std::fmt::Debug;

    assert_impl_all!(Command: Clone, Debug, Send, Sync);

    #[test]
    fn resume_payload_shape() {
        let command = Command::Resume {
            token: "1234".into(),
            session_id: "1234321".into(),
            seq: 69420,
        };

        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(
            value,
            json!({"op": 6, "d": {"token": "1234", "session_id": "1234321", "seq": 69420}})
        );
    }

    #[test]
    fn identify_payload_non_incognito() {
        let command = Command::Identify {
            token: "1234".into(),
            large_threshold: 69,
            properties: IdentifyProperties {
                os: "leenuks".into(),
                browser: "vx.y.z".into(),
                device: "python3".into(),
            },
            shard: None,
            presence: None,
        };

        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(
            value,
            json!({
                "op": 2,
                "d": {
                    "token": "1234",
                    "compress": false,
                    "large_threshold": 69,
                    "properties": {"$os": "leenuks", "$browser": "vx.y.z", "$device": "python3"},
                }
            })
        );
    }

    #[test]
    fn identify_payload_incognito() {
        let command = Command::Identify {
            token: "1234".into(),
            large_threshold: 69,
            properties: IdentifyProperties::incognito(),
            shard: None,
            presence: None,
        };

        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(
            value["d"]["properties"],
            json!({"$os": "os", "$browser": "browser", "$device": "device"})
        );
    }

    #[test]
    fn voice_state_update_payload() {
        let command = Command::VoiceStateUpdate {
            guild_id: "1234".into(),
            channel_id: Some("5678".into()),
            self_mute: false,
            self_deaf: true,
        };

        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(
            value,
            json!({
                "op": 4,
                "d": {"guild_id": "1234", "channel_id": "5678", "self_mute": false, "self_deaf": true},
            })
        );
    }

    #[test]
    fn heartbeat_payload_with_no_seq_yet() {
        let command = Command::Heartbeat { seq: None };
        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(value, json!({"op": 1, "d": null}));
    }

    #[test]
    fn request_guild_members_payload() {
        let command = Command::RequestGuildMembers {
            guild_id: "1234".into(),
            query: "".into(),
            limit: 0,
        };

        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(
            value,
            json!({"op": 8, "d": {"guild_id": "1234", "query": "", "limit": 0}})
        );
    }
}
