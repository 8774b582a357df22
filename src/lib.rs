//! Worker process pooling and messaging core.
//!
//! Hosts delegate computation to external interpreter worker processes:
//! this crate launches and pools them, exchanges framed commands and
//! columnar data over their standard streams, and survives crashes and
//! cancellation without leaking processes or corrupting pooled state.

pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod manager;
pub mod pool;
pub mod worker;

pub use error::{Result, WorkerError};
