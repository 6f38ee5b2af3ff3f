//! Wire protocol shared by the server and the viewer client
//!
//! All messages are JSON objects tagged with a camelCase `type` field.
//! Binary payloads travel as `{"encoding":"base64","data":"..."}`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Entry identifier, strictly increasing within one feed (room)
pub type EntryId = u64;

/// Severity of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

/// Category of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    #[default]
    Log,
    Trace,
    Metric,
    Event,
    Exception,
}

/// Opaque binary attachment carried by an entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(pub Vec<u8>);

/// Tagged on-the-wire form of a [`Payload`]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WirePayload {
    encoding: String,
    data: String,
}

impl Serialize for Payload {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WirePayload {
            encoding: "base64".to_string(),
            data: BASE64.encode(&self.0),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WirePayload::deserialize(deserializer)?;
        Payload::decode(&wire.encoding, &wire.data).map_err(serde::de::Error::custom)
    }
}

impl Payload {
    /// Decode a payload from its tagged wire representation
    pub fn decode(encoding: &str, data: &str) -> Result<Self, ProtocolError> {
        match encoding {
            "base64" => BASE64
                .decode(data)
                .map(Payload)
                .map_err(|e| ProtocolError::InvalidPayload(e.to_string())),
            "utf8" => Ok(Payload(data.as_bytes().to_vec())),
            other => Err(ProtocolError::UnsupportedEncoding(other.to_string())),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A single log entry as stored and delivered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: EntryId,
    #[serde(default)]
    pub level: LogLevel,
    #[serde(rename = "type", default)]
    pub kind: EntryKind,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub host_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

/// A log entry submitted by a producer, before an id is assigned
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLogEntry {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(rename = "type", default)]
    pub kind: EntryKind,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

impl NewLogEntry {
    /// Stamp the entry with its feed id
    pub fn into_entry(self, id: EntryId) -> LogEntry {
        LogEntry {
            id,
            level: self.level,
            kind: self.kind,
            session_id: self.session_id,
            app_name: self.app_name,
            host_name: self.host_name,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            message: self.message,
            payload: self.payload,
            context: self.context,
        }
    }
}

/// Named point-in-time value; only the latest value per name is kept
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchValue {
    pub name: String,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
}

/// One sample of a high-frequency channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub channel: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

/// Stream sample submitted by a producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStreamEntry {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub data: Value,
}

impl NewStreamEntry {
    pub fn into_entry(self, channel: &str) -> StreamEntry {
        StreamEntry {
            channel: channel.to_string(),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            data: self.data,
        }
    }
}

/// Buffer-clearing commands; each is idempotent at the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ControlCommand {
    ClearLog,
    ClearAll,
    ClearWatches,
}

/// Feed counters sent with `init`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStats {
    pub total_entries: u64,
    pub buffered_entries: usize,
    pub stream_channels: usize,
    pub viewers: usize,
}

/// Producer session seen in a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub app_name: String,
    pub host_name: String,
    pub entry_count: u64,
}

/// Server to viewer messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Init {
        room: String,
        stats: FeedStats,
        watches: Vec<WatchValue>,
        sessions: Vec<SessionSummary>,
        producers: usize,
    },
    Entries {
        entries: Vec<LogEntry>,
    },
    Watch {
        watch: WatchValue,
    },
    Control {
        command: ControlCommand,
    },
    Stream {
        channel: String,
        entries: Vec<StreamEntry>,
    },
    ClientConnect {
        producers: usize,
    },
    ClientDisconnect {
        producers: usize,
    },
    Rooms {
        rooms: Vec<String>,
    },
    RoomCreated {
        room: String,
    },
    RoomSwitched {
        room: String,
    },
    Pong {
        timestamp: i64,
    },
    StreamSubscribed {
        channel: String,
    },
    StreamUnsubscribed {
        channel: String,
    },
    StreamPaused {
        channel: String,
    },
    StreamResumed {
        channel: String,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Viewer to server messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Pause,
    Resume,
    SubscribeStream { channel: String },
    UnsubscribeStream { channel: String },
    PauseStream { channel: String },
    ResumeStream { channel: String },
    Ping { timestamp: i64 },
    SwitchRoom { room: String },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Producer to server messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ProducerMessage {
    Entries { entries: Vec<NewLogEntry> },
    Watch { watch: WatchValue },
    Stream { channel: String, entries: Vec<NewStreamEntry> },
    Control { command: ControlCommand },
}

impl ProducerMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_entry(id: EntryId) -> LogEntry {
        NewLogEntry {
            message: format!("entry {}", id),
            app_name: "api".into(),
            ..Default::default()
        }
        .into_entry(id)
    }

    #[test]
    fn test_payload_is_base64_tagged() {
        let mut entry = sample_entry(1);
        entry.payload = Some(Payload(vec![0xde, 0xad, 0xbe, 0xef]));

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["payload"], json!({"encoding": "base64", "data": "3q2+7w=="}));

        let back: LogEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back.payload, Some(Payload(vec![0xde, 0xad, 0xbe, 0xef])));
    }

    #[test]
    fn test_payload_rejects_unknown_encoding() {
        let err = Payload::decode("hex", "00ff").unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedEncoding(_)));
    }

    #[test]
    fn test_server_message_tags() {
        let msg = ServerMessage::Control { command: ControlCommand::ClearWatches };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "control", "command": "clearWatches"})
        );

        let msg = ServerMessage::StreamPaused { channel: "cpu".into() };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "streamPaused", "channel": "cpu"})
        );
    }

    #[test]
    fn test_client_message_parse() {
        let msg = ClientMessage::parse(r#"{"type":"pauseStream","channel":"gps"}"#).unwrap();
        assert_eq!(msg, ClientMessage::PauseStream { channel: "gps".into() });

        let msg = ClientMessage::parse(r#"{"type":"ping","timestamp":42}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping { timestamp: 42 });

        assert!(ClientMessage::parse("{not json").is_err());
    }

    #[test]
    fn test_entry_wire_field_names() {
        let value = serde_json::to_value(sample_entry(7)).unwrap();
        assert_eq!(value["id"], json!(7));
        assert_eq!(value["type"], json!("log"));
        assert_eq!(value["appName"], json!("api"));
        assert!(value.get("payload").is_none());
        assert!(value.get("context").is_none());
    }

    #[test]
    fn test_producer_entries_default_fields() {
        let msg = ProducerMessage::parse(
            r#"{"type":"entries","entries":[{"message":"hi","level":"warn"}]}"#,
        )
        .unwrap();
        match msg {
            ProducerMessage::Entries { entries } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].level, LogLevel::Warn);
                assert_eq!(entries[0].kind, EntryKind::Log);
                assert!(entries[0].timestamp.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
