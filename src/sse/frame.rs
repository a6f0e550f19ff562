//! Stream frames and line parsing.

use serde::{Deserialize, Serialize};

/// Literal prefix of content lines.
pub const DATA_PREFIX: &str = "data: ";

/// Payload some servers send to mark the end of a stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One unit of streamed content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFrame {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamFrame {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn done() -> Self {
        Self {
            done: true,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// True when no frame should follow this one.
    pub fn is_terminal(&self) -> bool {
        self.done || self.error.is_some()
    }
}

/// Parses one line of the event stream.
///
/// Only lines starting with `data: ` produce a frame; blank lines, comments
/// and other fields yield `None`. A payload that is not a JSON frame object
/// becomes literal content.
pub fn parse_line(line: &str) -> Option<StreamFrame> {
    let payload = line.strip_prefix(DATA_PREFIX)?;

    if payload.trim() == DONE_SENTINEL {
        return Some(StreamFrame::done());
    }

    match serde_json::from_str::<StreamFrame>(payload) {
        Ok(frame) => Some(frame),
        Err(_) => Some(StreamFrame::content(payload)),
    }
}
