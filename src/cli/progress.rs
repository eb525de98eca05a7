//! Progress display for running transfers
//!
//! One indicatif bar per transfer inside a `MultiProgress`. When stderr is
//! not a terminal, or output is disabled, the bars are hidden and only the
//! final summary lines are printed.
//!
//! # Examples
//!
//! ```rust,no_run
//! use download_manager::cli::TransferProgress;
//! use download_manager::app::TransferId;
//!
//! let id = TransferId::new();
//! let mut display = TransferProgress::new(true);
//! display.add(id, "file.iso");
//! display.update(&id, 512, 2048);
//! display.finish(&id, std::path::Path::new("/tmp/file.iso"));
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::debug;

use crate::app::TransferId;

const BAR_TEMPLATE: &str =
    "{spinner:.green} {prefix:<24!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} {msg}";
const SPINNER_TEMPLATE: &str = "{spinner:.green} {prefix:<24!} {bytes} {bytes_per_sec} {msg}";

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Bars of the transfers a command is waiting for
pub struct TransferProgress {
    multi: MultiProgress,
    bars: HashMap<TransferId, ProgressBar>,
    /// Total size last seen per transfer; 0 until known
    totals: HashMap<TransferId, u64>,
    enabled: bool,
}

impl TransferProgress {
    /// Create the display; bars only render on an interactive stderr
    pub fn new(enabled: bool) -> Self {
        let enabled = enabled && atty::is(atty::Stream::Stderr);
        let multi = if enabled {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        debug!("Progress display enabled: {}", enabled);
        Self {
            multi,
            bars: HashMap::new(),
            totals: HashMap::new(),
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn add(&mut self, id: TransferId, label: &str) {
        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(style(SPINNER_TEMPLATE));
        bar.set_prefix(label.to_string());
        bar.set_message("waiting");
        bar.enable_steady_tick(Duration::from_millis(120));
        self.bars.insert(id, bar);
    }

    /// Received bytes; `total == received` means the size is unknown
    pub fn update(&mut self, id: &TransferId, received: u64, total: u64) {
        let Some(bar) = self.bars.get(id) else {
            return;
        };
        let known = self.totals.entry(*id).or_insert(0);
        if total > received && *known != total {
            *known = total;
            bar.set_style(style(BAR_TEMPLATE));
            bar.set_length(total);
        }
        bar.set_message("");
        bar.set_position(received);
    }

    pub fn processing(&mut self, id: &TransferId) {
        if let Some(bar) = self.bars.get(id) {
            bar.set_message("verifying");
        }
    }

    pub fn paused(&mut self, id: &TransferId) {
        if let Some(bar) = self.bars.get(id) {
            bar.set_message("paused");
        }
    }

    pub fn finish(&mut self, id: &TransferId, path: &Path) {
        if let Some(bar) = self.bars.remove(id) {
            bar.finish_with_message(format!("done -> {}", path.display()));
        }
    }

    pub fn fail(&mut self, id: &TransferId, message: &str) {
        if let Some(bar) = self.bars.remove(id) {
            bar.abandon_with_message(format!("failed: {}", message));
        }
    }

    /// Stop every remaining bar where it is
    pub fn abandon_all(&mut self, message: &str) {
        for (_, bar) in self.bars.drain() {
            bar.abandon_with_message(message.to_string());
        }
    }
}

impl Drop for TransferProgress {
    fn drop(&mut self) {
        for (_, bar) in self.bars.drain() {
            bar.finish_and_clear();
        }
    }
}
