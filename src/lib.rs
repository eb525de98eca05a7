//! Download Manager Library
//!
//! A background transfer manager: resumable, checksum-verified HTTP
//! downloads driven by per-transfer state machines, optional post-download
//! commands, download groups, and a queue that lets a single transfer hold
//! the network at a time while honouring a mobile-data policy.

pub mod app;
pub mod cli;
pub mod config;
pub mod constants;
pub mod errors;

// Re-export commonly used types for convenience
pub use errors::{AppError, Result};
