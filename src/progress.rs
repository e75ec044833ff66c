//! Upload progress display for the client
//!
//! The server reports progress as a percentage of its size budget; servers
//! without a budget send no percentage, and the bar falls back to a spinner
//! showing the bytes sent.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

pub struct UploadProgress {
    bar: ProgressBar,
    start_time: Instant,
    bytes: u64,
}

impl UploadProgress {
    pub fn new(file_name: &str) -> Self {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("  {spinner:.green} {prefix} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_prefix(file_name.to_string());
        bar.enable_steady_tick(Duration::from_millis(120));
        Self {
            bar,
            start_time: Instant::now(),
            bytes: 0,
        }
    }

    /// Record one acknowledged chunk.
    pub fn update(&mut self, sent: u64, percent: Option<u8>) {
        self.bytes = sent;
        if let Some(p) = percent {
            self.bar.set_position(u64::from(p));
        }
        self.bar.set_message(format!("{:.1} MB", sent as f64 / 1_048_576.0));
    }

    pub fn finish_success(&self, stored_as: &str) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        self.bar.set_position(100);
        self.bar.finish_with_message(format!(
            "stored as {} ({:.1} MB in {:.1}s)",
            stored_as,
            self.bytes as f64 / 1_048_576.0,
            elapsed
        ));
    }

    pub fn finish_error(&self, msg: &str) {
        self.bar.abandon_with_message(format!("failed: {}", msg));
    }
}
