//! Error types for handlename-core

use std::fmt::Write;
use std::path::PathBuf;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
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
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
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
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
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

/// Main error type for handlename-core
#[derive(Error, Debug)]
pub enum Error {
    /// Display-name resolution errors
    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    /// Page fetch errors
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Durable store errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Request/broadcast bridge errors
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Logging setup errors
    #[error("Logging error: {0}")]
    Log(#[from] crate::logging::LogError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Resolve(err) => Some(err.remediation()),
            Self::Fetch(_) => Some(
                Remediation::new("Check network connectivity and retry.")
                    .alternative("Raise resolver.request_timeout_secs on slow links."),
            ),
            Self::Storage(err) => Some(err.remediation()),
            Self::Bridge(_) => Some(Remediation::new(
                "The resolver side went away. Restart the session to reconnect.",
            )),
            Self::Config(err) => Some(err.remediation()),
            Self::Log(_) => Some(
                Remediation::new("Check general.log_level and general.log_file.")
                    .alternative("Set RUST_LOG to override the configured level."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Show cache path", "hn cache path"),
            ),
            Self::Json(_) => None,
        }
    }
}

/// Why a single candidate page did not yield a display name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CandidateFailure {
    /// The page answered with a non-success status.
    #[error("HTTP {0}")]
    Status(u16),

    /// The request never produced a response.
    #[error("network error: {0}")]
    Network(String),

    /// The page loaded but no heuristic found a name.
    #[error("no display name found in page")]
    NoDisplayName,
}

/// Resolution errors surfaced to callers of the resolver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// Neither a handle nor a channel id was supplied.
    #[error("No handle or channelId provided")]
    InvalidIdentity,

    /// Every candidate page was tried without producing a name.
    #[error("{}", exhausted_message(.last.as_ref()))]
    Exhausted { last: Option<CandidateFailure> },
}

fn exhausted_message(last: Option<&CandidateFailure>) -> String {
    last.map_or_else(
        || "Resolution failed".to_string(),
        |failure| format!("Resolution failed: {failure}"),
    )
}

impl ResolveError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::InvalidIdentity => Remediation::new("Pass a handle or a channel id.")
                .command("Resolve a handle", "hn resolve @handle")
                .command("Resolve a channel id", "hn resolve --channel UC..."),
            Self::Exhausted { last } => match last {
                Some(CandidateFailure::Status(404)) => {
                    Remediation::new("No channel page exists for this identity.")
                        .alternative("Check the handle spelling.")
                }
                Some(CandidateFailure::Network(_)) => {
                    Remediation::new("Channel pages could not be reached. Check connectivity.")
                        .alternative("Retry later; results are cached once resolved.")
                }
                _ => Remediation::new("The channel pages did not expose a display name.")
                    .command("Inspect a saved page", "hn extract page.html"),
            },
        }
    }
}

/// Page fetch errors
#[derive(Error, Debug)]
pub enum FetchError {
    /// The HTTP client failed before a response arrived
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Transport-level failure reported by a non-HTTP fetcher
    #[error("transport failed: {0}")]
    Transport(String),
}

/// Durable store errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("store contents are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store contents are malformed: {0}")]
    Malformed(String),
}

impl StorageError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Io(_) => Remediation::new(
                "Cache file could not be read or written. Check permissions of the data directory.",
            )
            .command("Show cache path", "hn cache path"),
            Self::Json(_) | Self::Malformed(_) => {
                Remediation::new("Cache file is corrupt. Clear it; names are re-resolved on demand.")
                    .command("Clear cache", "hn cache clear")
            }
        }
    }
}

/// Request/broadcast bridge errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The other side of the bridge is gone
    #[error("bridge disconnected")]
    Disconnected,
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Read { path, .. } => Remediation::new(format!(
                "Make sure {} exists and is readable.",
                path.display()
            ))
            .alternative("Omit --config to use built-in defaults."),
            Self::Parse(_) => Remediation::new("Fix the TOML syntax in the config file.")
                .alternative("Compare against the defaults in the README."),
            Self::Invalid(_) => Remediation::new("Correct the rejected value and retry."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_reports_last_status() {
        let err = ResolveError::Exhausted {
            last: Some(CandidateFailure::Status(404)),
        };
        assert_eq!(err.to_string(), "Resolution failed: HTTP 404");
    }

    #[test]
    fn exhausted_without_attempts_is_generic() {
        let err = ResolveError::Exhausted { last: None };
        assert_eq!(err.to_string(), "Resolution failed");
    }

    #[test]
    fn every_top_level_variant_but_json_has_remediation() {
        let errors = [
            Error::Resolve(ResolveError::InvalidIdentity),
            Error::Fetch(FetchError::Transport("reset".into())),
            Error::Storage(StorageError::Malformed("not an object".into())),
            Error::Bridge(BridgeError::Disconnected),
            Error::Config(ConfigError::Invalid("ttl_secs".into())),
            Error::Io(std::io::Error::other("boom")),
        ];
        for err in errors {
            assert!(err.remediation().is_some(), "missing remediation for {err}");
        }
    }

    #[test]
    fn remediation_renders_commands() {
        let text = ResolveError::InvalidIdentity.remediation().render_plain();
        assert!(text.contains("To fix:"));
        assert!(text.contains("hn resolve @handle"));
    }
}
