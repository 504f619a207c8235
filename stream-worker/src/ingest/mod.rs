//! Command ingestion.
//!
//! Handlers are registered explicitly: the binary builds a list of
//! [`Registration`]s and passes it to [`IngestRuntime::new`]. Messages are fed
//! per topic; each registration fans its messages out to `consumer_count`
//! concurrent consumers.

pub mod handler;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Error, Result};

pub use handler::{STREAM_ON_PUBLISH, StreamCommandHandler};

/// Processes one message payload.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> Result<()>;
}

/// Binds a handler to the topics it consumes.
#[derive(Clone)]
pub struct Registration {
    pub topics: Vec<String>,
    pub handler: Arc<dyn MessageHandler>,
    pub consumer_count: usize,
}

impl Registration {
    pub fn new(
        topics: impl IntoIterator<Item = impl Into<String>>,
        handler: Arc<dyn MessageHandler>,
        consumer_count: usize,
    ) -> Self {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
            handler,
            consumer_count: consumer_count.max(1),
        }
    }

    fn consumes(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t == topic)
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("topics", &self.topics)
            .field("consumer_count", &self.consumer_count)
            .finish()
    }
}

/// Runs the registered handlers.
pub struct IngestRuntime {
    registrations: Vec<Registration>,
    cancellation_token: CancellationToken,
}

impl IngestRuntime {
    pub fn new(registrations: Vec<Registration>) -> Self {
        Self {
            registrations,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Stop reading input; in-flight messages are still handled.
    pub fn stop(&self) {
        self.cancellation_token.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Feed newline-delimited messages for `topic` from `reader` until EOF or
    /// [`stop`](Self::stop). Returns the number of messages read.
    pub async fn run_lines<R>(&self, reader: R, topic: &str) -> Result<usize>
    where
        R: AsyncBufRead + Unpin,
    {
        let matching: Vec<&Registration> = self
            .registrations
            .iter()
            .filter(|r| r.consumes(topic))
            .collect();
        if matching.is_empty() {
            return Err(Error::config(format!("no handler registered for topic '{topic}'")));
        }

        let mut consumers = JoinSet::new();
        let mut senders = Vec::with_capacity(matching.len());
        for registration in matching {
            let (tx, rx) = mpsc::channel::<Vec<u8>>(registration.consumer_count * 4);
            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            for consumer_id in 0..registration.consumer_count {
                consumers.spawn(consume(
                    topic.to_string(),
                    consumer_id,
                    rx.clone(),
                    registration.handler.clone(),
                ));
            }
            senders.push(tx);
        }

        info!(topic, "Ingest runtime started");

        let mut lines = reader.lines();
        let mut count = 0usize;
        loop {
            let line = tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => break,
                line = lines.next_line() => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(topic, error = %e, "Failed to read input");
                    break;
                }
            };
            let payload = line.trim();
            if payload.is_empty() {
                continue;
            }

            count += 1;
            for tx in &senders {
                if tx.send(payload.as_bytes().to_vec()).await.is_err() {
                    warn!(topic, "Consumers are gone, dropping message");
                }
            }
        }

        drop(senders);
        while consumers.join_next().await.is_some() {}

        info!(topic, messages = count, "Ingest runtime stopped");
        Ok(count)
    }
}

async fn consume(
    topic: String,
    consumer_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>>,
    handler: Arc<dyn MessageHandler>,
) {
    loop {
        let payload = rx.lock().await.recv().await;
        let Some(payload) = payload else {
            break;
        };

        if let Err(e) = handler.handle(&payload).await {
            warn!(topic = %topic, consumer_id, error = %e, "Failed to handle message");
        }
    }
    debug!(topic = %topic, consumer_id, "Consumer stopped");
}
