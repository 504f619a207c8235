//! Database models.

pub mod stream;

pub use stream::*;
