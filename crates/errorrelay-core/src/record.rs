//! Error records and the inbound wire frame they are parsed from.
//!
//! The reporting client sends one JSON object per error event:
//!
//! ```json
//! {"type":"error","message":"x is undefined","stack":"...","timestamp":1718000000000,"url":"http://localhost:3000/"}
//! ```
//!
//! A frame becomes an [`ErrorRecord`] only when `message` is a non-empty
//! string and `timestamp` is present and non-zero. A zero timestamp counts as
//! missing, matching the loose truthiness check of the reporting side.

use serde::{Deserialize, Serialize};

/// Kind of failure, as reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ErrorKind {
    /// Uncaught exception or console error
    #[default]
    #[serde(rename = "error")]
    RuntimeError,
    /// Unhandled promise rejection
    #[serde(rename = "unhandledrejection")]
    UnhandledRejection,
    /// Renderer or process crash
    #[serde(rename = "crash")]
    Crash,
}

impl ErrorKind {
    /// Wire name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RuntimeError => "error",
            Self::UnhandledRejection => "unhandledrejection",
            Self::Crash => "crash",
        }
    }

    /// Uppercased label used in rendered reports.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::RuntimeError => "ERROR",
            Self::UnhandledRejection => "UNHANDLEDREJECTION",
            Self::Crash => "CRASH",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reported failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Milliseconds since the Unix epoch, as sent by the client.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ErrorRecord {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>, timestamp: i64) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
            timestamp,
            url: None,
        }
    }

    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// Why an inbound frame was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Not JSON, or a field has the wrong type
    Malformed(String),
    /// `message` absent or empty
    MissingMessage,
    /// `timestamp` absent or zero
    MissingTimestamp,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(detail) => write!(f, "malformed frame: {detail}"),
            Self::MissingMessage => f.write_str("missing message"),
            Self::MissingTimestamp => f.write_str("missing timestamp"),
        }
    }
}

/// Raw wire shape; every field optional so validation can name what is missing.
#[derive(Debug, Deserialize)]
struct ReportFrame {
    #[serde(rename = "type", default)]
    kind: Option<ErrorKind>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    stack: Option<String>,
    #[serde(default)]
    timestamp: Option<serde_json::Number>,
    #[serde(default)]
    url: Option<String>,
}

fn timestamp_millis(number: &serde_json::Number) -> i64 {
    if let Some(ms) = number.as_i64() {
        ms
    } else if let Some(ms) = number.as_u64() {
        i64::try_from(ms).unwrap_or(i64::MAX)
    } else {
        number.as_f64().map_or(0, |ms| ms.trunc() as i64)
    }
}

/// Parse and validate one inbound text frame.
pub fn parse_report(text: &str) -> Result<ErrorRecord, RejectReason> {
    let frame: ReportFrame =
        serde_json::from_str(text).map_err(|e| RejectReason::Malformed(e.to_string()))?;

    let message = match frame.message {
        Some(message) if !message.is_empty() => message,
        _ => return Err(RejectReason::MissingMessage),
    };

    let timestamp = frame
        .timestamp
        .as_ref()
        .map(timestamp_millis)
        .filter(|ms| *ms != 0)
        .ok_or(RejectReason::MissingTimestamp)?;

    Ok(ErrorRecord {
        kind: frame.kind.unwrap_or_default(),
        message,
        stack: frame.stack,
        timestamp,
        url: frame.url,
    })
}
