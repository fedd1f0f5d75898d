//! Outbound calls to the assistant backend.
//!
//! One call per admitted request, one fixed timeout, no internal retries:
//! the backend is not idempotent, so retrying is a caller decision. Every
//! transport or HTTP outcome maps into the closed [`GatewayError`] taxonomy;
//! a completed round-trip with an unusable payload is a *degraded success*
//! (the fixed fallback text), never a hard failure.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

/// Fallback reply when the backend responds 2xx but the payload is unusable.
pub const DEFAULT_REPLY: &str = "Sorry, I encountered an error.";

// ─── Error taxonomy ──────────────────────────────────────────────────────────

/// Closed set of backend call failures.
///
/// The `Display` text is the user-facing message; each variant is distinct
/// enough to guide action (wait and retry / try again later / contact
/// support). Hard failures never append an Assistant message to history.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("The assistant took too long to respond. Please try again.")]
    Timeout,
    #[error("Could not connect to the assistant. Please try again later.")]
    ConnectionUnavailable,
    #[error("The assistant is handling too many requests right now. Please wait a moment and retry.")]
    ServerOverloaded,
    #[error("The assistant backend returned an error (HTTP {0}). If this keeps happening, contact support.")]
    ServerError(u16),
    #[error("Something unexpected went wrong. Please try again.")]
    Unknown,
}

impl GatewayError {
    /// Stable machine-readable tag for the HTTP surface and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ConnectionUnavailable => "connection_unavailable",
            Self::ServerOverloaded => "server_overloaded",
            Self::ServerError(_) => "server_error",
            Self::Unknown => "unknown",
        }
    }
}

// ─── Gateway trait ───────────────────────────────────────────────────────────

/// A reply from the assistant backend.
#[derive(Debug, Clone)]
pub struct BackendReply {
    pub text: String,
    /// `true` when the round-trip completed but the payload was unusable and
    /// [`DEFAULT_REPLY`] was substituted.
    pub degraded: bool,
}

/// Common interface to the assistant backend.
///
/// The dispatch controller only depends on this trait; tests swap in a mock.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Issue one backend call for an admitted request.
    async fn send(&self, message: &str, session_id: &str) -> Result<BackendReply, GatewayError>;
}

// ─── HTTP implementation ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct BackendResponse {
    reply: Option<String>,
}

/// Gateway speaking the backend's JSON protocol over HTTP.
///
/// Bearer-token auth, JSON body `{"message", "sessionId"}`, and a `reply`
/// string in the response. The backend expects the GET method with a JSON
/// body; unusual, but that is the protocol it serves.
pub struct HttpGateway {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl HttpGateway {
    /// Build the gateway with its single fixed timeout. Default: 120s.
    pub fn new(url: String, api_key: String, timeout_secs: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url,
            api_key,
        })
    }

    fn classify(err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            return GatewayError::Timeout;
        }
        if err.is_connect() {
            return GatewayError::ConnectionUnavailable;
        }
        warn!(err = %err, "backend call failed outside the known taxonomy");
        GatewayError::Unknown
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn send(&self, message: &str, session_id: &str) -> Result<BackendReply, GatewayError> {
        let response = self
            .client
            .get(&self.url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "message": message,
                "sessionId": session_id,
            }))
            .send()
            .await
            .map_err(Self::classify)?;

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            warn!(status = code, "backend returned an error status");
            return Err(match code {
                503 | 429 => GatewayError::ServerOverloaded,
                _ => GatewayError::ServerError(code),
            });
        }

        // 2xx with a missing or unparsable `reply` is a degraded success:
        // the round-trip completed, so the turn is never silently dropped.
        match response.json::<BackendResponse>().await {
            Ok(BackendResponse { reply: Some(text) }) => Ok(BackendReply {
                text,
                degraded: false,
            }),
            Ok(BackendResponse { reply: None }) => {
                debug!("backend response missing `reply` field, substituting default text");
                Ok(BackendReply {
                    text: DEFAULT_REPLY.to_string(),
                    degraded: true,
                })
            }
            Err(e) => {
                debug!(err = %e, "backend response body unparsable, substituting default text");
                Ok(BackendReply {
                    text: DEFAULT_REPLY.to_string(),
                    degraded: true,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_are_stable() {
        assert_eq!(GatewayError::Timeout.kind(), "timeout");
        assert_eq!(GatewayError::ServerError(500).kind(), "server_error");
        assert_eq!(GatewayError::ServerOverloaded.kind(), "server_overloaded");
    }

    #[test]
    fn user_facing_messages_are_distinct() {
        let variants = [
            GatewayError::Timeout,
            GatewayError::ConnectionUnavailable,
            GatewayError::ServerOverloaded,
            GatewayError::ServerError(500),
            GatewayError::Unknown,
        ];
        for (i, a) in variants.iter().enumerate() {
            for b in variants.iter().skip(i + 1) {
                assert_ne!(a.to_string(), b.to_string());
            }
        }
    }
}
