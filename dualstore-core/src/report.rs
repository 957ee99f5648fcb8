//! Progress reporting
//!
//! The publish run narrates its progress through a [`Report`]. Output is for
//! humans only; nothing in the repository depends on what was reported.

use std::sync::Mutex;

/// Severity of a report line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Note,
    Ok,
    Error,
}

/// Ordered progress sink
pub trait Report: Send + Sync {
    /// Print without ending the line
    fn print(&self, text: &str, severity: Severity);

    /// Print and end the line
    fn print_line(&self, text: &str, severity: Severity);
}

/// Forwards report lines to `tracing`
#[derive(Default)]
pub struct TracingReport {
    pending: Mutex<String>,
}

impl TracingReport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Report for TracingReport {
    fn print(&self, text: &str, _severity: Severity) {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_str(text);
    }

    fn print_line(&self, text: &str, severity: Severity) {
        let line = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let mut line = std::mem::take(&mut *pending);
            line.push_str(text);
            line
        };
        match severity {
            Severity::Note => tracing::debug!("{}", line),
            Severity::Ok => tracing::info!("{}", line),
            Severity::Error => tracing::warn!("{}", line),
        }
    }
}

/// Collects finished lines in memory
#[derive(Default)]
pub struct BufferedReport {
    state: Mutex<(String, Vec<(Severity, String)>)>,
}

impl BufferedReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(Severity, String)> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .1
            .clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|(s, _)| *s == Severity::Error)
            .map(|(_, l)| l)
            .collect()
    }
}

impl Report for BufferedReport {
    fn print(&self, text: &str, _severity: Severity) {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .0
            .push_str(text);
    }

    fn print_line(&self, text: &str, severity: Severity) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut line = std::mem::take(&mut state.0);
        line.push_str(text);
        state.1.push((severity, line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_report_joins_partial_lines() {
        let report = BufferedReport::new();
        report.print("Publishing /a.html ... ", Severity::Note);
        report.print_line("OK", Severity::Ok);
        report.print_line("failed: boom", Severity::Error);
        let lines = report.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], (Severity::Ok, "Publishing /a.html ... OK".to_string()));
        assert_eq!(report.errors(), vec!["failed: boom".to_string()]);
    }
}
