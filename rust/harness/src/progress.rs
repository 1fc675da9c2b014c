//! Run-level progress in work units.

use std::sync::{
    OnceLock,
    atomic::{AtomicU64, Ordering},
};

use indicatif::{ProgressBar, ProgressStyle};

/// Progress sink for one run. Its length is the sealed plan's total work.
#[derive(Debug)]
pub struct RunProgress {
    worked: AtomicU64,
    total: u64,
    bar: OnceLock<ProgressBar>,
}

impl RunProgress {
    #[must_use]
    pub fn new(total: u64) -> Self {
        Self {
            worked: AtomicU64::new(0),
            total,
            bar: OnceLock::new(),
        }
    }

    /// Mirror progress to a bar. Only the first bar attached is used.
    pub fn attach(&self, bar: ProgressBar) {
        bar.set_length(self.total);
        bar.set_position(self.worked());
        let _ = self.bar.set(bar);
    }

    /// Record `units` more work done.
    pub fn update(&self, units: u64, message: impl Into<String>) {
        let message = message.into();
        let worked = self.worked.fetch_add(units, Ordering::AcqRel) + units;
        tracing::trace!("progress {worked}/{}: {message}", self.total);
        if let Some(bar) = self.bar.get() {
            bar.inc(units);
            bar.set_message(message);
        }
    }

    #[must_use]
    pub fn worked(&self) -> u64 {
        self.worked.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.worked() as f64 / self.total as f64
        }
    }

    pub fn finish(&self, message: impl Into<String>) {
        if let Some(bar) = self.bar.get() {
            bar.finish_with_message(message.into());
        }
    }
}

/// Progress bar styled for a run, counting work units.
#[must_use]
pub fn run_progress_bar(project: &str) -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {msg:42} [{wide_bar:.cyan/blue}] {pos:>5}/{len:5} ({percent:>2}%) [{eta:>5}]")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            // plain chars survive dumb terminals
            .progress_chars("#*-"),
    );
    bar.set_message(format!("{project}: starting"));
    bar.enable_steady_tick(std::time::Duration::from_millis(100));
    bar
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_accumulates() {
        let progress = RunProgress::new(40);
        progress.update(10, "GBM_1");
        progress.update(0, "skipped");
        progress.update(30, "rest");
        assert_eq!(progress.worked(), 40);
        assert_eq!(progress.fraction(), 1.0);
    }

    #[test]
    fn test_attached_bar_follows() {
        let progress = RunProgress::new(100);
        progress.update(5, "before");
        let bar = ProgressBar::hidden();
        progress.attach(bar.clone());
        progress.update(20, "after");
        assert_eq!(bar.position(), 25);
        assert_eq!(bar.length(), Some(100));
    }
}
