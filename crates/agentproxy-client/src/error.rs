//! Error types for the client library.

use agentproxy_common::BrokerDomainError;
use reqwest::StatusCode;
use thiserror::Error;

/// Maximum number of response-body bytes embedded in an error.
pub const MAX_ERROR_BODY_BYTES: usize = 4096;

/// Errors that can occur while negotiating sessions with the broker.
///
/// Each variant is a distinct failure kind. Callers should branch with the
/// predicate helpers or `matches!`, never on the rendered message.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// Network or HTTP request failure.
    ///
    /// Indicates issues like DNS resolution, connection failures, or socket errors.
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// Middleware layer error.
    ///
    /// Errors from the retry middleware wrapping broker requests.
    #[error("Middleware error: {0}")]
    MiddlewareError(#[from] reqwest_middleware::Error),

    /// JSON response could not be decoded.
    ///
    /// Indicates a contract mismatch with the broker or issuer.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The token issuer rejected the client-credentials exchange.
    #[error("Authentication failed with status {status}: {body}")]
    AuthenticationError {
        /// Status returned by the issuer.
        status: StatusCode,
        /// Truncated response body.
        body: String,
    },

    /// The broker does not know the requested agent (HTTP 404).
    ///
    /// Expected in normal operation when an agent is offline or unknown.
    #[error("Agent not found: {agent_identifier}")]
    AgentNotFound {
        /// Identifier of the agent that was requested.
        agent_identifier: String,
    },

    /// The agent cannot issue cluster credentials (HTTP 422).
    #[error("Agent {agent_identifier} does not support Kubernetes credentials")]
    CapabilityNotSupported {
        /// Identifier of the agent that was requested.
        agent_identifier: String,
    },

    /// The broker answered 200 but reported a failure in the body.
    #[error("Broker reported failure: {0}")]
    BrokerError(#[from] BrokerDomainError),

    /// The broker answered with an unexpected status.
    #[error("Unexpected broker status {status}: {body}")]
    UnexpectedStatus {
        /// Status returned by the broker.
        status: StatusCode,
        /// Truncated response body.
        body: String,
    },

    /// A base64 field could not be decoded.
    #[error("Invalid base64 in {field}: {source}")]
    InvalidBase64 {
        /// Wire name of the offending field.
        field: &'static str,
        /// Underlying decode error.
        source: base64::DecodeError,
    },

    /// A decoded field was not valid UTF-8.
    #[error("Invalid UTF-8 in {field}")]
    InvalidUtf8 {
        /// Wire name of the offending field.
        field: &'static str,
    },

    /// Malformed request rejected before any network call.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Client configuration issue.
    ///
    /// Invalid URLs, or a proxy or transport that cannot be built.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl ClientError {
    /// Check if this is the broker's "agent not found" response.
    pub const fn is_agent_not_found(&self) -> bool {
        matches!(self, Self::AgentNotFound { .. })
    }

    /// Check if the agent lacks the requested capability.
    pub const fn is_capability_not_supported(&self) -> bool {
        matches!(self, Self::CapabilityNotSupported { .. })
    }

    /// Check if this error is a failure embedded in a successful response.
    pub const fn is_broker_error(&self) -> bool {
        matches!(self, Self::BrokerError(_))
    }

    /// Check if this is an authentication error.
    pub const fn is_authentication_error(&self) -> bool {
        matches!(self, Self::AuthenticationError { .. })
    }

    /// Check if this error came from decoding a response.
    pub const fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Self::SerializationError(_) | Self::InvalidBase64 { .. } | Self::InvalidUtf8 { .. }
        )
    }

    /// Check if this error is potentially retryable.
    ///
    /// Returns `true` for network failures and server-side statuses.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError(_) | Self::MiddlewareError(_) => true,
            Self::UnexpectedStatus { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            _ => false,
        }
    }

    /// Get the HTTP status carried by this error, if any.
    pub const fn status(&self) -> Option<StatusCode> {
        match self {
            Self::AuthenticationError { status, .. } | Self::UnexpectedStatus { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

/// Result type alias using `ClientError`.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Reads at most [`MAX_ERROR_BODY_BYTES`] of a response body for diagnostics.
///
/// Read failures are logged and yield whatever was collected so far.
pub(crate) async fn read_bounded_body(mut response: reqwest::Response) -> String {
    let mut body = Vec::new();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let remaining = MAX_ERROR_BODY_BYTES - body.len();
                if chunk.len() >= remaining {
                    body.extend_from_slice(&chunk[..remaining]);
                    break;
                }
                body.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("Failed to read error response body: {e}");
                break;
            }
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}
