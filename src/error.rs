//! Error types for emberdb-stream.

use serde::Deserialize;
use thiserror::Error;

/// Error type for emberdb-stream operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A required option is missing or invalid. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Endpoint/account resolution failed (engine not found, not attached,
    /// not running, account mismatch). Fatal per resolution attempt.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Token acquisition or refresh failed.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// One or more structured errors returned by the backend.
    #[error("{0}")]
    Composite(#[from] CompositeError),

    /// Operation not available on this connection variant.
    #[error("{operation} is not supported on this connection")]
    Unsupported {
        /// Name of the operation that was attempted.
        operation: &'static str,
    },

    /// Failed to parse a response frame or value.
    #[error("Failed to parse value: {message}")]
    Parse {
        /// Description of what failed to parse.
        message: String,
    },

    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Failed to serialize or deserialize JSON.
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error during streaming.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed while this request was in flight.
    #[error("Request cancelled: connection closed")]
    Cancelled,
}

/// Result type alias for emberdb-stream operations.
pub type Result<T> = std::result::Result<T, Error>;

/// One structured error from the backend error payload.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ServerError {
    /// Severity label, e.g. "ERROR" or "WARNING".
    pub severity: Option<String>,
    /// Backend error code.
    pub code: Option<String>,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Source location within the query text, when known.
    pub location: Option<ErrorLocation>,
    /// Suggested resolution.
    pub resolution: Option<String>,
    /// Documentation link.
    #[serde(rename = "helpLink")]
    pub help_link: Option<String>,
}

/// Location of an error within the submitted query text.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ErrorLocation {
    #[serde(rename = "failingLine")]
    pub failing_line: Option<u32>,
    #[serde(rename = "startOffset")]
    pub start_offset: Option<u32>,
    #[serde(rename = "endOffset")]
    pub end_offset: Option<u32>,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(severity) = &self.severity {
            write!(f, "{}: ", severity)?;
        }
        if let Some(code) = &self.code {
            write!(f, "{} ", code)?;
        }
        write!(f, "{}", self.description)?;
        if let Some(loc) = &self.location {
            if let Some(line) = loc.failing_line {
                write!(f, " at line {}", line)?;
            }
        }
        if let Some(resolution) = &self.resolution {
            write!(f, ", resolution: {}", resolution)?;
        }
        if let Some(link) = &self.help_link {
            write!(f, ", see {}", link)?;
        }
        Ok(())
    }
}

/// Aggregate of every structured error from one failed query, rendered in
/// input order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompositeError {
    /// Sub-errors in the order the backend reported them.
    pub errors: Vec<ServerError>,
}

impl CompositeError {
    /// Wrap a list of backend errors.
    pub fn new(errors: Vec<ServerError>) -> Self {
        Self { errors }
    }
}

impl std::fmt::Display for CompositeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Query failed with {} error(s):", self.errors.len())?;
        for e in &self.errors {
            write!(f, "\n  {}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompositeError {}
