//! Gateway wire format.
//!
//! Every frame is a JSON text message of the form `{op, d, s?, t?}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Gateway opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum OpCode {
    /// Inbound dispatch event
    Dispatch,
    /// Heartbeat (both directions)
    Heartbeat,
    /// Start a new session
    Identify,
    /// Update the client presence
    PresenceUpdate,
    /// Join, move or leave voice channels
    VoiceStateUpdate,
    /// Resume a previous session
    Resume,
    /// Server asks the client to reconnect and resume
    Reconnect,
    /// Request guild member chunks
    RequestGuildMembers,
    /// Session was invalidated
    InvalidSession,
    /// First frame after connecting
    Hello,
    /// Heartbeat acknowledgement
    HeartbeatAck,
    /// Opcode not known to this crate
    Unknown(u8),
}

impl From<u8> for OpCode {
    fn from(value: u8) -> Self {
        match value {
            0 => OpCode::Dispatch,
            1 => OpCode::Heartbeat,
            2 => OpCode::Identify,
            3 => OpCode::PresenceUpdate,
            4 => OpCode::VoiceStateUpdate,
            6 => OpCode::Resume,
            7 => OpCode::Reconnect,
            8 => OpCode::RequestGuildMembers,
            9 => OpCode::InvalidSession,
            10 => OpCode::Hello,
            11 => OpCode::HeartbeatAck,
            other => OpCode::Unknown(other),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        match op {
            OpCode::Dispatch => 0,
            OpCode::Heartbeat => 1,
            OpCode::Identify => 2,
            OpCode::PresenceUpdate => 3,
            OpCode::VoiceStateUpdate => 4,
            OpCode::Resume => 6,
            OpCode::Reconnect => 7,
            OpCode::RequestGuildMembers => 8,
            OpCode::InvalidSession => 9,
            OpCode::Hello => 10,
            OpCode::HeartbeatAck => 11,
            OpCode::Unknown(other) => other,
        }
    }
}

/// A single gateway frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPayload {
    /// Opcode
    pub op: OpCode,
    /// Event data
    #[serde(default)]
    pub d: Value,
    /// Sequence number (dispatch only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    /// Event name (dispatch only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    /// Build an outbound frame.
    pub fn new(op: OpCode, d: impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            op,
            d: serde_json::to_value(d)?,
            s: None,
            t: None,
        })
    }

    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Encode to a text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// HELLO data
#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval: u64,
}

/// Connection properties sent with IDENTIFY
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyProperties {
    /// Operating system
    pub os: String,
    /// Library name
    pub browser: String,
    /// Library name
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// IDENTIFY data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identify {
    /// Authentication token
    pub token: String,
    /// Connection properties
    pub properties: IdentifyProperties,
    /// Payload compression (always false)
    pub compress: bool,
    /// Large guild threshold
    pub large_threshold: u32,
    /// `[shard_id, shard_count]`
    pub shard: [u32; 2],
    /// Initial presence
    pub presence: Presence,
    /// Intents bitmask
    pub intents: u64,
}

/// RESUME data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resume {
    /// Authentication token
    pub token: String,
    /// Session being resumed
    pub session_id: String,
    /// Last sequence number received
    pub seq: u64,
}

/// The parts of READY this crate consumes
#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    /// Session identifier used for RESUME
    pub session_id: String,
    /// Gateway URL to use when resuming
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
    /// Guilds this shard is responsible for
    #[serde(default)]
    pub guilds: Vec<Value>,
}

/// Presence status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Online
    #[default]
    Online,
    /// Do not disturb
    Dnd,
    /// Idle
    Idle,
    /// Invisible
    Invisible,
    /// Offline
    Offline,
}

/// A single activity shown in a presence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    /// Activity name
    pub name: String,
    /// Activity type
    #[serde(rename = "type")]
    pub kind: u8,
    /// Stream URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// PRESENCE_UPDATE data
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Presence {
    /// Activities
    pub activities: Vec<Activity>,
    /// Whether the client is AFK
    pub afk: bool,
    /// Unix time (ms) the client went idle
    pub since: Option<u64>,
    /// Status
    pub status: Status,
}

/// REQUEST_GUILD_MEMBERS data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestGuildMembers {
    /// Guild to request members for
    pub guild_id: String,
    /// Username prefix, empty for all members
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Maximum members to return, 0 for no limit
    pub limit: u32,
    /// Include presences
    #[serde(default)]
    pub presences: bool,
    /// Specific members to fetch
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_ids: Vec<String>,
    /// Correlates the returned chunks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_dispatch() {
        let payload = GatewayPayload::decode(
            r#"{"op":0,"d":{"content":"hi"},"s":42,"t":"MESSAGE_CREATE"}"#,
        )
        .unwrap();

        assert_eq!(payload.op, OpCode::Dispatch);
        assert_eq!(payload.s, Some(42));
        assert_eq!(payload.t.as_deref(), Some("MESSAGE_CREATE"));
        assert_eq!(payload.d["content"], "hi");
    }

    #[test]
    fn test_unknown_opcode_is_preserved() {
        let payload = GatewayPayload::decode(r#"{"op":42,"d":null}"#).unwrap();
        assert_eq!(payload.op, OpCode::Unknown(42));
        assert_eq!(u8::from(payload.op), 42);
    }

    #[test]
    fn test_identify_survives_encoding() {
        let identify = Identify {
            token: "Bot secret".to_string(),
            properties: IdentifyProperties::default(),
            compress: false,
            large_threshold: 250,
            shard: [3, 8],
            presence: Presence::default(),
            intents: 513,
        };

        let text = GatewayPayload::new(OpCode::Identify, &identify)
            .unwrap()
            .encode()
            .unwrap();
        let decoded = GatewayPayload::decode(&text).unwrap();
        assert_eq!(decoded.op, OpCode::Identify);

        let back: Identify = serde_json::from_value(decoded.d).unwrap();
        assert_eq!(back.token, "Bot secret");
        assert_eq!(back.shard, [3, 8]);
        assert_eq!(back, identify);
    }

    #[test]
    fn test_resume_survives_encoding() {
        let resume = Resume {
            token: "Bot secret".to_string(),
            session_id: "abc123".to_string(),
            seq: 1337,
        };

        let text = GatewayPayload::new(OpCode::Resume, &resume)
            .unwrap()
            .encode()
            .unwrap();
        assert!(!text.contains("\"s\""));

        let decoded = GatewayPayload::decode(&text).unwrap();
        let back: Resume = serde_json::from_value(decoded.d).unwrap();
        assert_eq!(back, resume);
    }

    #[test]
    fn test_presence_wire_shape() {
        let presence = Presence {
            activities: vec![Activity {
                name: "chess".to_string(),
                kind: 0,
                url: None,
            }],
            afk: false,
            since: None,
            status: Status::Dnd,
        };

        assert_eq!(
            serde_json::to_value(&presence).unwrap(),
            json!({
                "activities": [{"name": "chess", "type": 0}],
                "afk": false,
                "since": null,
                "status": "dnd"
            })
        );
    }
}
