//! Stream lifecycle: command queue, worker pool, retries.

pub mod command;
pub mod manager;
pub mod retry;

pub use command::{StreamAction, StreamCommand};
pub use manager::{DispatcherConfig, ManagerDeps, StreamManager};
pub use retry::{RetryDecision, RetryPolicy};
