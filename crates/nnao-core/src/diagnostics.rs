//! Diagnostic sinks and logging setup.
//!
//! The host exposes its own logging channel; plugins report user-facing
//! failures there. [`DiagnosticSink`] is that channel. Internal detail goes
//! through `tracing` as usual.

use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Host diagnostic channel.
pub trait DiagnosticSink {
    fn report(&self, severity: Severity, system: &str, message: &str);

    fn info(&self, system: &str, message: &str) {
        self.report(Severity::Info, system, message);
    }

    fn warning(&self, system: &str, message: &str) {
        self.report(Severity::Warning, system, message);
    }

    fn error(&self, system: &str, message: &str) {
        self.report(Severity::Error, system, message);
    }
}

/// Forwards host diagnostics to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, severity: Severity, system: &str, message: &str) {
        match severity {
            Severity::Info => tracing::info!(system, "{message}"),
            Severity::Warning => tracing::warn!(system, "{message}"),
            Severity::Error => tracing::error!(system, "{message}"),
        }
    }
}

/// Keeps every report in memory, and also forwards it to `tracing`.
#[derive(Debug, Default)]
pub struct RecordingSink {
    entries: Mutex<Vec<(Severity, String)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(Severity, String)> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn errors(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|(severity, _)| *severity == Severity::Error)
            .map(|(_, message)| message)
            .collect()
    }
}

impl DiagnosticSink for RecordingSink {
    fn report(&self, severity: Severity, system: &str, message: &str) {
        TracingSink.report(severity, system, message);
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((severity, message.to_string()));
        }
    }
}

impl<S: DiagnosticSink + ?Sized> DiagnosticSink for std::rc::Rc<S> {
    fn report(&self, severity: Severity, system: &str, message: &str) {
        (**self).report(severity, system, message);
    }
}

/// Install a fmt subscriber. `RUST_LOG` takes precedence over `filter`.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_logging(filter: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init()
        .is_ok()
}
