//! Wire protocol shared by the server and the client.
//!
//! The control channel carries one JSON object per text frame. Every
//! command is tagged by `type` and answered with `{"type":"<type>_received"}`.
//! The audio channel carries raw PCM as binary frames and a single JSON
//! text frame, `{"type":"synthesis_complete"}`, marking the end of a run.
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A command submitted over the control channel.
///
/// The set is closed: unknown `type` tags fail to parse instead of being
/// silently ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Append a fragment to the pending text buffer.
    Text {
        content: String,
        /// Voice conversion toggle. `None` keeps the current setting.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rvc: Option<bool>,
    },
    /// Finalize the pending text and start a synthesis run.
    Synthesize,
    /// Stop the current run and discard everything buffered.
    Cancel,
    /// Preemption issued when another session becomes active.
    #[serde(alias = "new_connection")]
    NewSession,
}

impl Command {
    pub fn text(content: impl Into<String>, rvc: bool) -> Self {
        Command::Text {
            content: content.into(),
            rvc: Some(rvc),
        }
    }

    /// The wire tag of this command.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Text { .. } => "text",
            Command::Synthesize => "synthesize",
            Command::Cancel => "cancel",
            Command::NewSession => "new_session",
        }
    }

    /// Parse one control frame.
    pub fn parse(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(ProtocolError::Malformed)
    }

    pub fn to_json(&self) -> String {
        // A plain enum with string fields always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Replies sent on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack(&'static str),
    Error(String),
}

impl Reply {
    pub fn ack(command: &Command) -> Self {
        Reply::Ack(command.kind())
    }

    pub fn to_json(&self) -> String {
        match self {
            Reply::Ack(kind) => {
                serde_json::json!({ "type": format!("{kind}_received") }).to_string()
            }
            Reply::Error(message) => {
                serde_json::json!({ "type": "error", "message": message }).to_string()
            }
        }
    }

    /// Parse a reply frame received by a client.
    pub fn parse(frame: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(frame).map_err(ProtocolError::Malformed)?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(ProtocolError::MissingType)?;

        if kind == "error" {
            let message = value
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unspecified error")
                .to_string();
            return Ok(Reply::Error(message));
        }

        let acked = kind
            .strip_suffix("_received")
            .ok_or_else(|| ProtocolError::UnknownType(kind.to_string()))?;
        match acked {
            "text" => Ok(Reply::Ack("text")),
            "synthesize" => Ok(Reply::Ack("synthesize")),
            "cancel" => Ok(Reply::Ack("cancel")),
            "new_session" => Ok(Reply::Ack("new_session")),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

/// Text frames on the audio channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AudioEvent {
    SynthesisComplete,
}

impl AudioEvent {
    pub fn to_json(&self) -> String {
        match self {
            AudioEvent::SynthesisComplete => r#"{"type":"synthesis_complete"}"#.to_string(),
        }
    }

    /// Returns `None` for text frames that are not audio events.
    pub fn parse(frame: &str) -> Option<Self> {
        serde_json::from_str(frame).ok()
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed command: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("message has no type field")]
    MissingType,

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("binary frames are not accepted on the control channel")]
    UnexpectedBinary,

    #[error("invalid command: {0}")]
    Invalid(String),
}
