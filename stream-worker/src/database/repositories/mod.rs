//! Repository layer.

pub mod stream;

pub use stream::{SqlxStreamRepository, StreamRepository};
