//! Wire frames of the task log socket.
//!
//! Every text frame carries one JSON object whose `type` field selects the
//! variant. Frames that are valid JSON but do not match the shape of their
//! declared kind decode to [`TaskEvent::Unknown`] so that partial events never
//! reach consumers.

use opman_common::{LogLevel, TaskId};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::DecodeError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskEvent {
    #[serde(rename_all = "camelCase")]
    Welcome {
        #[serde(
            default,
            deserialize_with = "lenient_task_id",
            skip_serializing_if = "Option::is_none"
        )]
        task_id: Option<TaskId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Log {
        #[serde(deserialize_with = "level_from_str")]
        level: LogLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    Progress {
        #[serde(deserialize_with = "percent")]
        progress: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Completion {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Welcome,
    Log,
    Progress,
    Completion,
    Unknown,
}

impl TaskEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TaskEvent::Welcome { .. } => EventKind::Welcome,
            TaskEvent::Log { .. } => EventKind::Log,
            TaskEvent::Progress { .. } => EventKind::Progress,
            TaskEvent::Completion { .. } => EventKind::Completion,
            TaskEvent::Unknown => EventKind::Unknown,
        }
    }

    /// Completion retires the channel.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskEvent::Completion { .. })
    }

    pub fn log(level: LogLevel, message: impl Into<String>, source: Option<&str>) -> Self {
        TaskEvent::Log {
            level,
            message: message.into(),
            source: source.map(str::to_owned),
        }
    }

    pub fn completion(success: bool, output: Option<&str>, error: Option<&str>) -> Self {
        TaskEvent::Completion {
            success,
            output: output.map(str::to_owned),
            error: error.map(str::to_owned),
        }
    }
}

/// Decode one text frame.
///
/// Only malformed JSON is an error; anything else yields an event, possibly
/// [`TaskEvent::Unknown`].
pub fn decode(frame: &str) -> Result<TaskEvent, DecodeError> {
    let value: Value = serde_json::from_str(frame)?;
    Ok(classify(value))
}

fn classify(value: Value) -> TaskEvent {
    let declared = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_owned);

    match serde_json::from_value::<TaskEvent>(value) {
        Ok(TaskEvent::Log { message, .. }) if message.is_empty() => {
            debug!("dropping log frame with empty message");
            TaskEvent::Unknown
        }
        Ok(event) => event,
        Err(err) => {
            debug!(kind = ?declared, "dropping frame with unexpected shape: {}", err);
            TaskEvent::Unknown
        }
    }
}

/// Wire representation of an event, as the server would send it.
pub fn encode(event: &TaskEvent) -> serde_json::Result<String> {
    serde_json::to_string(event)
}

fn level_from_str<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(D::Error::custom)
}

/// A welcome is never rejected over its informational task id.
fn lenient_task_id<'de, D>(deserializer: D) -> Result<Option<TaskId>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(raw).ok())
}

fn percent<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let value = u64::deserialize(deserializer)?;
    if value > 100 {
        return Err(D::Error::custom(format!("progress {} outside 0-100", value)));
    }
    Ok(value as u8)
}
