use thiserror::Error;

/// Errors surfaced by the client flows.
///
/// Callers branch on the variant: validation never reaches a retry loop,
/// auth is terminal for the current flow, network and http are retried by
/// the pollers up to their consecutive-error ceiling.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Local input check failed. No request was made.
    #[error("{0}")]
    Validation(String),

    /// No credential available, or refreshing it failed.
    #[error("authentication required: {0}")]
    Auth(String),

    /// The backend answered with a non-2xx status.
    #[error("API error {status}: {message}")]
    Http { status: u16, message: String },

    /// HTTP 402 from the generation endpoints.
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    /// The request never produced a response in time (offline, DNS, TLS,
    /// request timeout).
    #[error("network error: {0}")]
    Network(String),

    /// A 2xx response whose body did not match the expected shape.
    #[error("unexpected response body: {0}")]
    Decode(String),

    /// Push permission, push runtime or object storage failure.
    #[error("{0}")]
    Provider(String),

    /// A project was created but its generation could not be started.
    #[error("project {project_id} was created but generation did not start: {source}")]
    OrphanedProject {
        project_id: String,
        #[source]
        source: Box<ClientError>,
    },
}

impl ClientError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Build an error from a non-2xx status and the backend's error body.
    ///
    /// The backend reports failures as `{"detail": "..."}`; anything else is
    /// kept verbatim.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v["detail"].as_str().map(String::from))
            .unwrap_or_else(|| {
                if body.trim().is_empty() {
                    format!("HTTP {status}")
                } else {
                    body.trim().to_string()
                }
            });
        if status == 402 {
            Self::InsufficientBalance(message)
        } else {
            Self::Http { status, message }
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::InsufficientBalance(_) => Some(402),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_field_becomes_message() {
        let e = ClientError::from_status(404, r#"{"detail":"Job not found"}"#);
        match e {
            ClientError::Http { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "Job not found");
            }
            other => panic!("expected Http, got {other:?}"),
        }
    }

    #[test]
    fn payment_required_maps_to_insufficient_balance() {
        let e = ClientError::from_status(402, r#"{"detail":"Not enough credits"}"#);
        assert!(matches!(e, ClientError::InsufficientBalance(ref m) if m == "Not enough credits"));
        assert_eq!(e.status(), Some(402));
    }

    #[test]
    fn empty_body_falls_back_to_status_text() {
        let e = ClientError::from_status(500, "");
        assert_eq!(e.to_string(), "API error 500: HTTP 500");
    }
}
