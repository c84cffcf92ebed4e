//! Timer-driven reconciliation of remote state: generation jobs and payment
//! charges. Each poller is a plain state object (`begin_attempt` / `observe`)
//! driven by a cancellable watch task, so every termination rule can be
//! exercised without a runtime.

pub mod job;
pub mod payment;

use serde::Serialize;
use std::time::Duration;

use crate::error::{ClientError, ClientResult};

// ---------------------------------------------------------------------------
// Outcome classification
// ---------------------------------------------------------------------------

/// One poll attempt, classified into exactly one bucket.
#[derive(Debug)]
pub enum PollOutcome<T> {
    /// 2xx with a body that decoded.
    Success(T),
    /// Non-2xx from the backend.
    HttpError { status: u16, message: String },
    /// The request threw, or a 2xx body could not be decoded.
    NetworkError(String),
    /// No credential could be obtained.
    AuthMissing(String),
}

impl<T> PollOutcome<T> {
    pub fn classify(result: ClientResult<T>) -> Self {
        match result {
            Ok(v) => Self::Success(v),
            Err(ClientError::Auth(msg)) => Self::AuthMissing(msg),
            Err(e @ (ClientError::Http { .. } | ClientError::InsufficientBalance(_))) => {
                Self::HttpError {
                    status: e.status().unwrap_or_default(),
                    message: e.to_string(),
                }
            }
            Err(e) => Self::NetworkError(e.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::HttpError { .. } | Self::NetworkError(_))
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Multiplicative delay schedule, clamped to `max`. A factor of 1.0 gives a
/// fixed interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl Backoff {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            base: interval,
            factor: 1.0,
            max: interval,
        }
    }

    /// Delay that follows `current`. Never shrinks below `current` and never
    /// exceeds `max`.
    pub fn next(&self, current: Duration) -> Duration {
        let factor = self.factor.max(1.0);
        let next_ms = (current.as_millis() as f64 * factor) as u64;
        Duration::from_millis(next_ms).max(current).min(self.max)
    }
}

// ---------------------------------------------------------------------------
// Consecutive-error tracking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct ErrorStreak {
    count: u32,
    threshold: u32,
}

impl ErrorStreak {
    pub(crate) fn new(threshold: u32) -> Self {
        Self {
            count: 0,
            threshold: threshold.max(1),
        }
    }

    /// Returns true once the threshold is reached.
    pub(crate) fn record(&mut self) -> bool {
        self.count += 1;
        self.count >= self.threshold
    }

    pub(crate) fn reset(&mut self) {
        self.count = 0;
    }

    pub(crate) fn count(&self) -> u32 {
        self.count
    }
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// Actions offered alongside a terminal failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "target", rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    Dashboard,
    ViewProject(String),
    SignIn,
    CheckNow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Attempt ceiling reached.
    Timeout,
    /// Consecutive-error threshold reached.
    Connectivity,
    /// Credential missing or refresh failed.
    Auth,
    /// The backend reported the resource as failed.
    Remote,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_buckets() {
        let ok: PollOutcome<u8> = PollOutcome::classify(Ok(1));
        assert!(matches!(ok, PollOutcome::Success(1)));

        let http: PollOutcome<u8> = PollOutcome::classify(Err(ClientError::from_status(500, "")));
        assert!(matches!(http, PollOutcome::HttpError { status: 500, .. }));

        let decode: PollOutcome<u8> =
            PollOutcome::classify(Err(ClientError::Decode("not json".into())));
        assert!(matches!(decode, PollOutcome::NetworkError(_)));

        let auth: PollOutcome<u8> = PollOutcome::classify(Err(ClientError::Auth("gone".into())));
        assert!(matches!(auth, PollOutcome::AuthMissing(_)));
    }

    #[test]
    fn backoff_grows_and_clamps() {
        let b = Backoff {
            base: Duration::from_secs(3),
            factor: 1.15,
            max: Duration::from_secs(8),
        };
        assert_eq!(b.next(Duration::from_secs(3)), Duration::from_millis(3450));
        assert_eq!(b.next(Duration::from_secs(7)), Duration::from_secs(8));
        assert_eq!(b.next(Duration::from_secs(8)), Duration::from_secs(8));
    }

    #[test]
    fn fixed_backoff_stays_put() {
        let b = Backoff::fixed(Duration::from_secs(5));
        assert_eq!(b.next(b.base), Duration::from_secs(5));
    }

    #[test]
    fn streak_reaches_threshold() {
        let mut s = ErrorStreak::new(3);
        assert!(!s.record());
        assert!(!s.record());
        s.reset();
        assert!(!s.record());
        assert!(!s.record());
        assert!(s.record());
        assert_eq!(s.count(), 3);
    }
}
