//! Query interface: render the history buffer for the consumer.

use std::fmt::Write;
use std::sync::Arc;

use chrono::{Local, TimeZone};
use serde::Serialize;

use crate::history::HistoryBuffer;
use crate::record::ErrorRecord;

/// The single read operation exposed to the consumer.
pub const GET_BROWSER_LOGS: &str = "get_browser_logs";

/// Stack lines shown per entry.
pub const STACK_PREVIEW_LINES: usize = 3;

const ENTRY_INDENT: &str = "   ";

/// Returned when nothing has been recorded yet.
pub const EMPTY_HISTORY_GUIDANCE: &str = "No browser errors have been recorded yet.\n\
\n\
Errors appear here only when all of the following hold:\n\
  1. The error-reporting instrumentation is attached to the running app.\n\
  2. The app is running in development mode.\n\
  3. At least one error has occurred since the relay started.";

/// Result of a query, with an explicit error flag for the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryResponse {
    pub text: String,
    pub is_error: bool,
}

impl QueryResponse {
    #[must_use]
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    #[must_use]
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }
}

/// Read-only view of the history used by the consumer-facing surface.
#[derive(Debug, Clone)]
pub struct QueryInterface {
    history: Arc<HistoryBuffer>,
}

impl QueryInterface {
    #[must_use]
    pub fn new(history: Arc<HistoryBuffer>) -> Self {
        Self { history }
    }

    /// Names of the operations [`QueryInterface::call`] understands.
    #[must_use]
    pub fn operations() -> &'static [&'static str] {
        &[GET_BROWSER_LOGS]
    }

    /// Snapshot the history and render it.
    #[must_use]
    pub fn get_logs(&self) -> String {
        render_logs(&self.history.snapshot())
    }

    /// Dispatch an operation by name.
    #[must_use]
    pub fn call(&self, operation: &str) -> QueryResponse {
        match operation {
            GET_BROWSER_LOGS => QueryResponse::ok(self.get_logs()),
            other => QueryResponse::error(format!("Unknown operation: {other}")),
        }
    }
}

/// Render a snapshot, or the guidance text when it is empty.
#[must_use]
pub fn render_logs(records: &[ErrorRecord]) -> String {
    if records.is_empty() {
        return EMPTY_HISTORY_GUIDANCE.to_string();
    }

    let mut output = String::new();
    let _ = writeln!(
        output,
        "Recent browser errors ({} total, oldest first):",
        records.len()
    );
    for entry in render_entries(records) {
        output.push('\n');
        output.push_str(&entry);
    }
    output
}

/// One rendered block per record, numbered from 1 in buffer order.
#[must_use]
pub fn render_entries(records: &[ErrorRecord]) -> Vec<String> {
    records
        .iter()
        .enumerate()
        .map(|(idx, record)| render_entry(idx + 1, record))
        .collect()
}

fn render_entry(number: usize, record: &ErrorRecord) -> String {
    let mut entry = String::new();
    let _ = writeln!(
        entry,
        "{number}. [{}] {}: {}",
        format_local_time(record.timestamp),
        record.kind.label(),
        record.message
    );
    if let Some(url) = &record.url {
        let _ = writeln!(entry, "{ENTRY_INDENT}URL: {url}");
    }
    if let Some(stack) = &record.stack {
        for line in stack
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .take(STACK_PREVIEW_LINES)
        {
            let _ = writeln!(entry, "{ENTRY_INDENT}{line}");
        }
    }
    entry
}

/// Local wall-clock time for an epoch-millisecond timestamp.
#[must_use]
pub fn format_local_time(timestamp_ms: i64) -> String {
    match Local.timestamp_millis_opt(timestamp_ms).single() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => format!("{timestamp_ms} ms"),
    }
}
