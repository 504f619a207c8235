//! Inbound stream commands.

use serde::{Deserialize, Serialize};

/// What a command asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamAction {
    Start,
    Stop,
    /// Any action this worker does not understand.
    #[serde(other)]
    Unknown,
}

/// A start/stop request for one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamCommand {
    #[serde(default)]
    pub event_id: String,
    pub stream_id: String,
    pub action: StreamAction,
    #[serde(default, alias = "rtmpUrl", alias = "sourceURL")]
    pub source_url: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retry: u32,
    #[serde(default)]
    pub occurred_at: String,
}

impl StreamCommand {
    pub fn start(stream_id: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self::new(stream_id, StreamAction::Start, source_url)
    }

    pub fn stop(stream_id: impl Into<String>) -> Self {
        Self::new(stream_id, StreamAction::Stop, String::new())
    }

    fn new(stream_id: impl Into<String>, action: StreamAction, source_url: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            stream_id: stream_id.into(),
            action,
            source_url: source_url.into(),
            retry_count: 0,
            max_retry: 0,
            occurred_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}
