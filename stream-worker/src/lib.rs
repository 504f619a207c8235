//! stream-worker library crate.
//!
//! Turns stream start/stop commands into supervised ffmpeg transcodes, uploads
//! the produced segments and reclaims local disk once streams end.

pub mod config;
pub mod database;
pub mod error;
pub mod gc;
pub mod ingest;
pub mod lifecycle;
pub mod logging;
pub mod storage;
pub mod tracker;
pub mod transcode;
pub mod utils;

pub use error::{Error, Result};
