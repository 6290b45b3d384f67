//! Progress UI: a textual progress bar plus info/warn/error reporting.
//! The core only ever sees the [`ProgressSink`] trait, never a concrete
//! terminal type, so tests can run against a no-op sink.

use indicatif::{ProgressBar, ProgressStyle};

/// What the orchestrator reports progress against. One instance per
/// `-U` operation.
pub trait ProgressSink {
    fn start(&mut self, total_units: u64, label: &str);
    fn advance(&mut self, units: u64);
    fn finish(&mut self, message: &str);
}

/// Real terminal progress bar, built on `indicatif`.
pub struct TermProgress {
    bar: Option<ProgressBar>,
}

impl TermProgress {
    pub fn new() -> Self {
        Self { bar: None }
    }
}

impl Default for TermProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for TermProgress {
    fn start(&mut self, total_units: u64, label: &str) {
        let bar = ProgressBar::new(total_units);
        bar.set_style(
            ProgressStyle::with_template("{msg} [{bar:40.cyan/blue}] {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_message(label.to_string());
        self.bar = Some(bar);
    }

    fn advance(&mut self, units: u64) {
        if let Some(bar) = &self.bar {
            bar.inc(units);
        }
    }

    fn finish(&mut self, message: &str) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(message.to_string());
        }
    }
}

/// Quiet sink for `-q` and for tests: no terminal output at all.
#[derive(Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn start(&mut self, _total_units: u64, _label: &str) {}
    fn advance(&mut self, _units: u64) {}
    fn finish(&mut self, _message: &str) {}
}

/// Initializes `env_logger` at the configured level. Called once from
/// `main`.
pub fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}
