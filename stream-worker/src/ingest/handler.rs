//! Stream command handler.

use async_trait::async_trait;
use tracing::{debug, warn};

use super::MessageHandler;
use crate::Result;
use crate::lifecycle::{StreamAction, StreamCommand, StreamManager};

/// Topic carrying stream publish/unpublish events.
pub const STREAM_ON_PUBLISH: &str = "stream.on_publish";

/// Decodes stream commands and hands them to the lifecycle manager.
pub struct StreamCommandHandler {
    manager: StreamManager,
}

impl StreamCommandHandler {
    pub fn new(manager: StreamManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl MessageHandler for StreamCommandHandler {
    async fn handle(&self, payload: &[u8]) -> Result<()> {
        let command: StreamCommand = serde_json::from_slice(payload)?;

        if command.action == StreamAction::Unknown {
            warn!(
                stream_id = %command.stream_id,
                event_id = %command.event_id,
                "Unknown action, dropping command"
            );
            return Ok(());
        }

        debug!(
            stream_id = %command.stream_id,
            event_id = %command.event_id,
            action = %command.action,
            "Received stream command"
        );
        self.manager.dispatch(command)
    }
}
