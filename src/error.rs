//! Error types for the Power BI MCP Server.
//!
//! `ServerError` is the semantic failure raised by every component. At the
//! dispatch boundary it is reduced to an [`ErrorKind`] plus a human-readable
//! message, which is what the calling agent sees.

use serde::Serialize;
use thiserror::Error;

/// Machine-readable error kind carried in every failed tool response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// Malformed or missing parameters; never reaches the remote server.
    ValidationError,
    /// The operation requires a live session.
    NotConnected,
    /// The identity provider or the remote server rejected the credentials.
    AuthenticationFailed,
    /// The handshake failed for a reason other than credentials.
    ConnectionFailed,
    /// The transport broke mid-session; the session is now failed.
    ConnectionLost,
    /// The remote catalog has no entity with the requested name.
    EntityNotFound,
    /// The remote server rejected the declarative query.
    QuerySyntaxError,
    /// The language model produced unusable output.
    GenerationError,
    /// The operation is not in the dispatch table.
    UnknownOperation,
    /// The protocol-boundary timeout expired.
    Timeout,
    /// Anything else.
    InternalError,
}

impl ErrorKind {
    /// The wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::NotConnected => "NotConnected",
            ErrorKind::AuthenticationFailed => "AuthenticationFailed",
            ErrorKind::ConnectionFailed => "ConnectionFailed",
            ErrorKind::ConnectionLost => "ConnectionLost",
            ErrorKind::EntityNotFound => "EntityNotFound",
            ErrorKind::QuerySyntaxError => "QuerySyntaxError",
            ErrorKind::GenerationError => "GenerationError",
            ErrorKind::UnknownOperation => "UnknownOperation",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::InternalError => "InternalError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Domain-specific errors for the Power BI MCP Server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Parameter validation error
    #[error("Invalid input: {0}")]
    Validation(String),

    /// No live session
    #[error("Not connected to a dataset. Call 'connect' first.")]
    NotConnected,

    /// Credentials rejected
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Handshake or transport failure
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// Transport failure after the session was established
    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    /// Entity missing from the remote catalog
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// Remote server rejected the query
    #[error("Query rejected by server: {message}")]
    QuerySyntax {
        message: String,
        code: Option<String>,
    },

    /// Language model output was unusable
    #[error("Query generation failed: {0}")]
    Generation(String),

    /// Operation not in the dispatch table
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// Protocol-boundary timeout
    #[error("Operation timed out after {timeout_seconds} seconds")]
    Timeout { timeout_seconds: u64 },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-connected error.
    pub fn not_connected() -> Self {
        Self::NotConnected
    }

    /// Create an authentication error.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a connection error with a source.
    pub fn connection_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a connection-lost error.
    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self::ConnectionLost {
            message: msg.into(),
        }
    }

    /// Create an entity not found error.
    pub fn entity_not_found(name: impl Into<String>) -> Self {
        Self::EntityNotFound(name.into())
    }

    /// Create a query error reported by the remote server.
    pub fn query_error(msg: impl Into<String>) -> Self {
        Self::QuerySyntax {
            message: msg.into(),
            code: None,
        }
    }

    /// Create a query error with the server's error code.
    pub fn query_error_with_code(msg: impl Into<String>, code: impl Into<String>) -> Self {
        Self::QuerySyntax {
            message: msg.into(),
            code: Some(code.into()),
        }
    }

    /// Create a generation error.
    pub fn generation(msg: impl Into<String>) -> Self {
        Self::Generation(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout(seconds: u64) -> Self {
        Self::Timeout {
            timeout_seconds: seconds,
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The machine-readable kind reported to callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::Internal(_) => ErrorKind::InternalError,
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::NotConnected => ErrorKind::NotConnected,
            Self::Authentication(_) => ErrorKind::AuthenticationFailed,
            Self::Connection { .. } => ErrorKind::ConnectionFailed,
            Self::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            Self::EntityNotFound(_) => ErrorKind::EntityNotFound,
            Self::QuerySyntax { .. } => ErrorKind::QuerySyntaxError,
            Self::Generation(_) => ErrorKind::GenerationError,
            Self::UnknownOperation(_) => ErrorKind::UnknownOperation,
            Self::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Whether this error, raised by a round trip on a live session,
    /// means the session itself is no longer usable.
    ///
    /// A rejected query leaves the session intact; a broken transport or a
    /// revoked credential does not.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionLost { .. } | Self::Authentication(_)
        )
    }

    /// Check if this error is transient and may succeed on retry.
    ///
    /// Nothing inside the server retries; this is advice for the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionLost { .. } | Self::Timeout { .. }
        )
    }

    /// Get a user-friendly suggestion for how to fix this error.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Config(_) => Some("Check your environment variables and configuration"),
            Self::NotConnected => Some("Call 'connect' with an XMLA endpoint and dataset name"),
            Self::Authentication(_) => Some(
                "Verify the tenant, client id and client secret, and that the service principal has access to the workspace",
            ),
            Self::Connection { .. } => {
                Some("Check the XMLA endpoint, the dataset name and network connectivity")
            }
            Self::ConnectionLost { .. } => Some("The session was dropped. Call 'connect' again"),
            Self::EntityNotFound(_) => Some("Use 'list-entities' to see the available names"),
            Self::QuerySyntax { .. } => {
                Some("Review the DAX syntax and the table and column names used")
            }
            Self::Generation(_) => Some("Rephrase the question or write the DAX query directly"),
            Self::Timeout { .. } => Some("Try a simpler query or increase the timeout limit"),
            _ => None,
        }
    }
}

/// Convert to a protocol-level error.
///
/// Tool failures are reported in the response envelope instead; this is for
/// failures outside any tool call.
impl From<ServerError> for rmcp::ErrorData {
    fn from(e: ServerError) -> Self {
        let data = Some(serde_json::json!({ "kind": e.kind() }));
        match e.kind() {
            ErrorKind::ValidationError | ErrorKind::EntityNotFound | ErrorKind::QuerySyntaxError => {
                rmcp::ErrorData::invalid_params(e.to_string(), data)
            }
            ErrorKind::NotConnected | ErrorKind::UnknownOperation => {
                rmcp::ErrorData::invalid_request(e.to_string(), data)
            }
            _ => rmcp::ErrorData::internal_error(e.to_string(), data),
        }
    }
}

impl From<reqwest::Error> for ServerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ServerError::connection_with_source("Request to remote server timed out", e)
        } else if e.is_connect() {
            ServerError::connection_with_source("Could not reach remote server", e)
        } else if e.is_decode() {
            ServerError::internal(format!("Malformed response body: {}", e))
        } else {
            ServerError::connection_with_source(format!("HTTP error: {}", e), e)
        }
    }
}

impl From<quick_xml::Error> for ServerError {
    fn from(e: quick_xml::Error) -> Self {
        ServerError::internal(format!("Malformed XMLA response: {}", e))
    }
}
