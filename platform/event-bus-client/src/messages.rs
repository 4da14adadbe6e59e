//! Message kinds shipped with the bus

use serde::{Deserialize, Serialize};

use crate::envelope::{MessageKind, MessageTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Info,
    Warning,
    Error,
    Fatal,
}

/// Operational log line broadcast under the `log` tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub severity: LogSeverity,
    pub message: String,
}

impl LogMessage {
    pub fn new(severity: LogSeverity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
        }
    }
}

impl MessageKind for LogMessage {
    const TAG: MessageTag = MessageTag::Log;
}
