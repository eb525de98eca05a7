//! Command-line interface components
//!
//! This module contains CLI-specific code for the download manager,
//! including argument parsing, progress display and the command handlers.

pub mod args;
pub mod commands;
pub mod progress;

pub use args::{Cli, Commands, FetchArgs, GlobalArgs, GroupArgs};
pub use commands::{handle_fetch, handle_group, handle_list, handle_resume, Outcome};
pub use progress::TransferProgress;
