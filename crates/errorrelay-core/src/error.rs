//! Error types for errorrelay-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
    /// Optional platform hint (e.g., "macOS", "Linux")
    pub platform: Option<String>,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
            platform: None,
        });
        self
    }

    #[must_use]
    pub fn platform_command(
        mut self,
        label: impl Into<String>,
        command: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
            platform: Some(platform.into()),
        });
        self
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let label = cmd.platform.as_ref().map_or_else(
                    || cmd.label.clone(),
                    |platform| format!("{} ({platform})", cmd.label),
                );
                let _ = writeln!(output, "    - {label}: {}", cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for errorrelay-core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Report listener errors
    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),

    /// Port arbitration errors
    #[error("Arbiter error: {0}")]
    Arbiter(#[from] ArbiterError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task join failures, closed channels)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Config(err) => Some(err.remediation()),
            Self::Listener(err) => Some(err.remediation()),
            Self::Arbiter(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the config directory exists and is readable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .alternative("Check for trailing commas or invalid UTF-8."),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("Restart the relay.")
                    .command("Restart", "errorrelay serve"),
            ),
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config {path}: {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid config value: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => {
                Remediation::new(format!("Create the config file or pass another path: {path}"))
                    .command("Print defaults", "errorrelay print-config")
                    .alternative("Omit --config to run with built-in defaults.")
            }
            Self::ReadFailed { path, .. } => {
                Remediation::new(format!("Check permissions on {path} and retry."))
                    .platform_command("Inspect", format!("ls -la \"{path}\""), "Unix")
            }
            Self::ParseError(_) => Remediation::new("Fix the TOML syntax in the config file.")
                .command("Print defaults", "errorrelay print-config")
                .alternative("Compare against the default config for valid section names."),
            Self::ValidationError(_) => {
                Remediation::new("Correct the reported value in the config file.")
                    .command("Print defaults", "errorrelay print-config")
            }
        }
    }
}

/// Report listener errors
#[derive(Error, Debug)]
pub enum ListenerError {
    /// Another process holds the address
    #[error("Address {addr} is already in use")]
    AddrInUse { addr: String },

    /// Bind failed for any other reason
    #[error("Failed to bind {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

impl ListenerError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::AddrInUse { addr } => Remediation::new(format!(
                "Another process is listening on {addr}. Stop it or restart the relay so arbitration can reclaim the port."
            ))
            .platform_command("Find owner", "lsof -nP -iTCP -sTCP:LISTEN", "Unix")
            .platform_command("Find owner", "netstat -ano", "Windows")
            .command("Inspect owner", "errorrelay check-port"),
            Self::BindFailed { addr, .. } => {
                Remediation::new(format!("Check that {addr} is a valid local address."))
                    .alternative("Use --host 127.0.0.1 to bind loopback only.")
            }
        }
    }
}

/// Port arbitration errors (inspection tooling failures)
#[derive(Error, Debug)]
pub enum ArbiterError {
    /// An introspection command could not be spawned
    #[error("{tool} could not be run: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    /// Introspection output did not parse
    #[error("Unexpected {tool} output: {detail}")]
    ParseError { tool: String, detail: String },

    /// The platform has no inspector implementation
    #[error("Port inspection is not supported on this platform")]
    Unsupported,
}

impl ArbiterError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::ToolUnavailable { tool, .. } => {
                Remediation::new(format!("Install `{tool}` or make sure it is on PATH."))
                    .platform_command("Install", "sudo apt install lsof", "Linux (Debian/Ubuntu)")
                    .alternative("Disable arbitration with --no-arbitrate and free the port manually.")
            }
            Self::ParseError { tool, .. } => {
                Remediation::new(format!("`{tool}` returned output the relay could not read."))
                    .command("Inspect owner", "errorrelay check-port")
            }
            Self::Unsupported => Remediation::new("Free the relay port manually before starting.")
                .alternative("Run with --no-arbitrate."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remediation_renders_commands_and_alternatives() {
        let text = Remediation::new("Do the thing")
            .command("Status", "errorrelay check-port")
            .platform_command("Find owner", "lsof -i", "Unix")
            .alternative("Try again later")
            .render_plain();
        assert!(text.contains("To fix:"));
        assert!(text.contains("Do the thing"));
        assert!(text.contains("Status: errorrelay check-port"));
        assert!(text.contains("Find owner (Unix): lsof -i"));
        assert!(text.contains("- Try again later"));
    }

    #[test]
    fn every_error_has_remediation() {
        let errors = vec![
            Error::Config(ConfigError::ValidationError("port".into())),
            Error::Listener(ListenerError::AddrInUse {
                addr: "127.0.0.1:9277".into(),
            }),
            Error::Arbiter(ArbiterError::Unsupported),
            Error::Runtime("join".into()),
        ];
        for err in errors {
            assert!(err.remediation().is_some(), "missing remediation for {err}");
        }
    }

    #[test]
    fn addr_in_use_names_address() {
        let err = ListenerError::AddrInUse {
            addr: "127.0.0.1:9277".into(),
        };
        assert_eq!(err.to_string(), "Address 127.0.0.1:9277 is already in use");
        assert!(err.remediation().summary.contains("127.0.0.1:9277"));
    }
}
