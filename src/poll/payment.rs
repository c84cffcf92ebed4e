use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ErrorStreak, FailureReason, PollOutcome, RecoveryAction};
use crate::api::types::{ChargeState, ChargeStatus};
use crate::auth::AuthedApi;
use crate::db::SharedDb;
use crate::error::{ClientError, ClientResult};

const TIMEOUT_MESSAGE: &str =
    "We have not received confirmation yet. Approve the request on your phone, then check again.";
const CONNECTIVITY_MESSAGE: &str =
    "Could not reach the payment service. Your payment may still go through; check again shortly.";
const AUTH_MESSAGE: &str = "Your session has expired. Please sign in again.";
const GENERIC_FAILURE: &str = "Payment failed";

#[async_trait]
pub trait ChargeSource: Send + Sync {
    async fn fetch_charge(&self, tx_ref: &str) -> ClientResult<ChargeStatus>;
}

#[async_trait]
impl ChargeSource for AuthedApi {
    async fn fetch_charge(&self, tx_ref: &str) -> ClientResult<ChargeStatus> {
        let api = &self.api;
        self.call(|token| async move { api.charge_status(tx_ref, &token).await })
            .await
    }
}

#[derive(Debug, Clone)]
pub struct PaymentPollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    pub error_threshold: u32,
}

impl Default for PaymentPollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 24,
            error_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum PaymentPhase {
    Pending,
    Successful { message: String },
    Failed(PaymentFailure),
}

impl PaymentPhase {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Terminal states a later manual check may still overturn: the loop gave
    /// up, the backend never said no.
    pub fn is_reconcilable(&self) -> bool {
        matches!(self, Self::Failed(f) if f.reason != FailureReason::Remote)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentFailure {
    pub reason: FailureReason,
    pub message: String,
    pub recovery: Vec<RecoveryAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentView {
    pub tx_ref: String,
    pub phase: PaymentPhase,
    pub attempts: u32,
    /// Last message the backend attached to a pending charge.
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PaymentStep {
    Continue(Duration),
    Finished(PaymentPhase),
}

#[derive(Debug, Clone)]
pub struct PaymentPoller {
    tx_ref: String,
    policy: PaymentPollPolicy,
    attempts: u32,
    errors: ErrorStreak,
    phase: PaymentPhase,
    message: Option<String>,
}

impl PaymentPoller {
    pub fn new(tx_ref: impl Into<String>, policy: PaymentPollPolicy) -> Self {
        Self {
            tx_ref: tx_ref.into(),
            errors: ErrorStreak::new(policy.error_threshold),
            attempts: 0,
            phase: PaymentPhase::Pending,
            message: None,
            policy,
        }
    }

    pub fn tx_ref(&self) -> &str {
        &self.tx_ref
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn phase(&self) -> &PaymentPhase {
        &self.phase
    }

    pub fn view(&self) -> PaymentView {
        PaymentView {
            tx_ref: self.tx_ref.clone(),
            phase: self.phase.clone(),
            attempts: self.attempts,
            message: self.message.clone(),
        }
    }

    /// Count one timer-driven attempt. Returns the terminal phase when no
    /// request should be made.
    pub fn begin_attempt(&mut self) -> Option<PaymentPhase> {
        if self.phase.is_terminal() {
            return Some(self.phase.clone());
        }
        self.attempts += 1;
        if self.attempts > self.policy.max_attempts {
            return Some(self.fail(FailureReason::Timeout, TIMEOUT_MESSAGE.to_string()));
        }
        None
    }

    /// Fold one classified response into the state. Shared by the timer and
    /// the manual check.
    pub fn observe(&mut self, outcome: PollOutcome<ChargeStatus>) -> PaymentStep {
        if self.phase.is_terminal() {
            return PaymentStep::Finished(self.phase.clone());
        }
        let interval = self.policy.interval;
        match outcome {
            PollOutcome::Success(charge) => {
                self.errors.reset();
                match self.settle(charge) {
                    Some(phase) => PaymentStep::Finished(phase),
                    None => PaymentStep::Continue(interval),
                }
            }
            PollOutcome::AuthMissing(msg) => {
                debug!(tx_ref = %self.tx_ref, "no credential: {msg}");
                PaymentStep::Finished(self.fail(FailureReason::Auth, AUTH_MESSAGE.to_string()))
            }
            PollOutcome::HttpError { .. } | PollOutcome::NetworkError(_) => {
                warn!(
                    tx_ref = %self.tx_ref,
                    attempt = self.attempts,
                    consecutive = self.errors.count() + 1,
                    "charge status check failed: {outcome:?}"
                );
                if self.errors.record() {
                    PaymentStep::Finished(
                        self.fail(FailureReason::Connectivity, CONNECTIVITY_MESSAGE.to_string()),
                    )
                } else {
                    PaymentStep::Continue(interval)
                }
            }
        }
    }

    /// Manual check. Behaves exactly like [`observe`](Self::observe) while
    /// pending; after the loop gave up, only a definitive backend answer
    /// changes the state.
    pub fn observe_manual(&mut self, outcome: PollOutcome<ChargeStatus>) -> PaymentPhase {
        if !self.phase.is_reconcilable() {
            return match self.observe(outcome) {
                PaymentStep::Finished(phase) => phase,
                PaymentStep::Continue(_) => self.phase.clone(),
            };
        }
        if let PollOutcome::Success(charge) = outcome {
            if charge.status != ChargeState::Pending {
                info!(tx_ref = %self.tx_ref, "manual check reconciled payment");
                self.phase = PaymentPhase::Pending;
                self.errors.reset();
                self.settle(charge);
            } else if !charge.message.is_empty() {
                self.message = Some(charge.message);
            }
        }
        self.phase.clone()
    }

    fn settle(&mut self, charge: ChargeStatus) -> Option<PaymentPhase> {
        match charge.status {
            ChargeState::Pending => {
                if !charge.message.is_empty() {
                    self.message = Some(charge.message);
                }
                None
            }
            ChargeState::Successful => {
                info!(tx_ref = %self.tx_ref, attempts = self.attempts, "payment successful");
                self.message = Some(charge.message.clone());
                self.phase = PaymentPhase::Successful {
                    message: charge.message,
                };
                Some(self.phase.clone())
            }
            ChargeState::Failed => {
                let message = if charge.message.trim().is_empty() {
                    GENERIC_FAILURE.to_string()
                } else {
                    charge.message
                };
                Some(self.fail(FailureReason::Remote, message))
            }
        }
    }

    fn fail(&mut self, reason: FailureReason, message: String) -> PaymentPhase {
        let recovery = match reason {
            FailureReason::Auth => vec![RecoveryAction::SignIn],
            FailureReason::Timeout | FailureReason::Connectivity => {
                vec![RecoveryAction::CheckNow, RecoveryAction::Dashboard]
            }
            FailureReason::Remote => vec![RecoveryAction::Retry, RecoveryAction::Dashboard],
        };
        warn!(tx_ref = %self.tx_ref, reason = ?reason, attempts = self.attempts, "{message}");
        self.phase = PaymentPhase::Failed(PaymentFailure {
            reason,
            message,
            recovery,
        });
        self.phase.clone()
    }
}

// ---------------------------------------------------------------------------
// Watch
// ---------------------------------------------------------------------------

struct Shared {
    source: Arc<dyn ChargeSource>,
    poller: Mutex<PaymentPoller>,
    tx: watch::Sender<PaymentView>,
    cancel: CancellationToken,
    store: Option<SharedDb>,
}

impl Shared {
    fn publish(&self, poller: &PaymentPoller) {
        if !self.cancel.is_cancelled() {
            self.tx.send_replace(poller.view());
        }
    }

    fn record(&self, outcome: &PollOutcome<ChargeStatus>) {
        let (Some(db), PollOutcome::Success(charge)) = (&self.store, outcome) else {
            return;
        };
        let Ok(guard) = db.lock() else {
            warn!(tx_ref = %charge.tx_ref, "db lock poisoned, payment status not recorded");
            return;
        };
        let message = Some(charge.message.as_str()).filter(|m| !m.is_empty());
        if let Err(e) = guard.update_payment(&charge.tx_ref, charge.status.as_str(), message) {
            warn!(tx_ref = %charge.tx_ref, "failed to record payment status: {e:#}");
        }
    }
}

/// Mobile-money approval tracker. The timer loop and [`check_now`] share one
/// poller behind an async lock, so at most one request is in flight.
///
/// [`check_now`]: PaymentWatch::check_now
pub struct PaymentWatch {
    shared: Arc<Shared>,
    state: watch::Receiver<PaymentView>,
    task: Option<JoinHandle<Option<PaymentPhase>>>,
}

impl PaymentWatch {
    pub fn start(
        source: Arc<dyn ChargeSource>,
        tx_ref: impl Into<String>,
        policy: PaymentPollPolicy,
        store: Option<SharedDb>,
    ) -> Self {
        let poller = PaymentPoller::new(tx_ref, policy);
        let (tx, rx) = watch::channel(poller.view());
        let shared = Arc::new(Shared {
            source,
            poller: Mutex::new(poller),
            tx,
            cancel: CancellationToken::new(),
            store,
        });
        let task = tokio::spawn(run(Arc::clone(&shared)));
        Self {
            shared,
            state: rx,
            task: Some(task),
        }
    }

    pub fn state(&self) -> PaymentView {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PaymentView> {
        self.state.clone()
    }

    /// One immediate status request, independent of the timer. Waits for an
    /// in-flight timer request to finish first.
    pub async fn check_now(&self) -> ClientResult<PaymentView> {
        let shared = &self.shared;
        let mut poller = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return Err(cancelled()),
            p = shared.poller.lock() => p,
        };
        if matches!(poller.phase(), PaymentPhase::Successful { .. }) {
            return Ok(poller.view());
        }

        debug!(tx_ref = %poller.tx_ref(), "manual charge status check");
        let result = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return Err(cancelled()),
            r = shared.source.fetch_charge(poller.tx_ref()) => r,
        };
        let outcome = PollOutcome::classify(result);
        shared.record(&outcome);
        poller.observe_manual(outcome);
        shared.publish(&poller);
        Ok(poller.view())
    }

    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Wait for the timer loop to end. `None` when it was cancelled.
    pub async fn join(mut self) -> Option<PaymentPhase> {
        let task = self.task.take()?;
        task.await.ok().flatten()
    }
}

impl Drop for PaymentWatch {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

fn cancelled() -> ClientError {
    ClientError::Network("payment check cancelled".into())
}

async fn run(shared: Arc<Shared>) -> Option<PaymentPhase> {
    loop {
        let step = {
            let mut poller = tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => return None,
                p = shared.poller.lock() => p,
            };
            if let Some(terminal) = poller.begin_attempt() {
                shared.publish(&poller);
                return Some(terminal);
            }
            let result = tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => return None,
                r = shared.source.fetch_charge(poller.tx_ref()) => r,
            };
            let outcome = PollOutcome::classify(result);
            shared.record(&outcome);
            let step = poller.observe(outcome);
            if shared.cancel.is_cancelled() {
                return None;
            }
            shared.publish(&poller);
            step
        };

        match step {
            PaymentStep::Continue(delay) => {
                tokio::select! {
                    biased;
                    _ = shared.cancel.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            PaymentStep::Finished(phase) => return Some(phase),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn charge(status: ChargeState, message: &str) -> ChargeStatus {
        ChargeStatus {
            status,
            message: message.into(),
            tx_ref: "tx-1".into(),
        }
    }

    fn ok(status: ChargeState) -> PollOutcome<ChargeStatus> {
        PollOutcome::Success(charge(status, ""))
    }

    fn poller() -> PaymentPoller {
        PaymentPoller::new("tx-1", PaymentPollPolicy::default())
    }

    fn attempt(p: &mut PaymentPoller, outcome: PollOutcome<ChargeStatus>) -> PaymentStep {
        if let Some(t) = p.begin_attempt() {
            return PaymentStep::Finished(t);
        }
        p.observe(outcome)
    }

    #[test]
    fn pending_keeps_a_fixed_interval() {
        let mut p = poller();
        for _ in 0..10 {
            assert_eq!(
                attempt(&mut p, ok(ChargeState::Pending)),
                PaymentStep::Continue(Duration::from_secs(5))
            );
        }
    }

    #[test]
    fn successful_and_failed_are_terminal() {
        let mut p = poller();
        assert!(matches!(
            attempt(&mut p, ok(ChargeState::Successful)),
            PaymentStep::Finished(PaymentPhase::Successful { .. })
        ));

        let mut p = poller();
        match attempt(
            &mut p,
            PollOutcome::Success(charge(ChargeState::Failed, "Insufficient funds")),
        ) {
            PaymentStep::Finished(PaymentPhase::Failed(f)) => {
                assert_eq!(f.reason, FailureReason::Remote);
                assert_eq!(f.message, "Insufficient funds");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn times_out_after_twenty_four_attempts() {
        let mut p = poller();
        for _ in 0..24 {
            assert!(matches!(
                attempt(&mut p, ok(ChargeState::Pending)),
                PaymentStep::Continue(_)
            ));
        }
        match p.begin_attempt() {
            Some(PaymentPhase::Failed(f)) => {
                assert_eq!(f.reason, FailureReason::Timeout);
                assert!(f.recovery.contains(&RecoveryAction::CheckNow));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn consecutive_errors_fail_with_connectivity() {
        let mut p = poller();
        for _ in 0..4 {
            attempt(&mut p, PollOutcome::NetworkError("offline".into()));
        }
        match attempt(
            &mut p,
            PollOutcome::HttpError {
                status: 503,
                message: "down".into(),
            },
        ) {
            PaymentStep::Finished(PaymentPhase::Failed(f)) => {
                assert_eq!(f.reason, FailureReason::Connectivity)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn manual_check_matches_timer_transition_while_pending() {
        let responses = [
            ok(ChargeState::Pending),
            PollOutcome::NetworkError("offline".into()),
            ok(ChargeState::Successful),
        ];
        for outcome in responses {
            let mirror = match &outcome {
                PollOutcome::Success(c) => PollOutcome::Success(c.clone()),
                PollOutcome::NetworkError(m) => PollOutcome::NetworkError(m.clone()),
                _ => unreachable!(),
            };
            let mut timer = poller();
            let mut manual = poller();
            timer.observe(outcome);
            manual.observe_manual(mirror);
            assert_eq!(timer.phase(), manual.phase());
        }
    }

    #[test]
    fn manual_check_after_timeout_reconciles_definitive_answers() {
        let mut p = PaymentPoller::new(
            "tx-1",
            PaymentPollPolicy {
                max_attempts: 1,
                ..Default::default()
            },
        );
        attempt(&mut p, ok(ChargeState::Pending));
        assert!(p.begin_attempt().is_some());

        let phase = p.observe_manual(ok(ChargeState::Pending));
        assert!(matches!(phase, PaymentPhase::Failed(ref f) if f.reason == FailureReason::Timeout));

        let phase = p.observe_manual(ok(ChargeState::Successful));
        assert!(matches!(phase, PaymentPhase::Successful { .. }));
    }

    #[test]
    fn backend_failure_is_not_overturned() {
        let mut p = poller();
        attempt(&mut p, ok(ChargeState::Failed));
        let phase = p.observe_manual(ok(ChargeState::Successful));
        assert!(matches!(phase, PaymentPhase::Failed(ref f) if f.reason == FailureReason::Remote));
    }

    // -- watch driver ------------------------------------------------------

    struct ScriptedCharges {
        script: std::sync::Mutex<VecDeque<ChargeState>>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedCharges {
        fn new(script: Vec<ChargeState>) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ChargeSource for ScriptedCharges {
        async fn fetch_charge(&self, tx_ref: &str) -> ClientResult<ChargeStatus> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let status = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ChargeState::Pending);
            Ok(ChargeStatus {
                status,
                message: String::new(),
                tx_ref: tx_ref.to_string(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn loop_ends_on_success_and_records_it() {
        let db = crate::db::Db::open_in_memory().unwrap().into_shared();
        db.lock()
            .unwrap()
            .insert_payment("tx-1", "pack_basic", "mobile_money")
            .unwrap();
        let source = ScriptedCharges::new(vec![
            ChargeState::Pending,
            ChargeState::Pending,
            ChargeState::Successful,
        ]);
        let watch = PaymentWatch::start(
            source.clone(),
            "tx-1",
            PaymentPollPolicy::default(),
            Some(db.clone()),
        );
        assert!(matches!(
            watch.join().await,
            Some(PaymentPhase::Successful { .. })
        ));
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        let row = db.lock().unwrap().get_payment("tx-1").unwrap().unwrap();
        assert_eq!(row.status, "successful");
    }

    #[tokio::test(start_paused = true)]
    async fn check_now_never_overlaps_the_timer_request() {
        let source = ScriptedCharges::new(vec![ChargeState::Pending, ChargeState::Successful]);
        let watch = PaymentWatch::start(source.clone(), "tx-1", PaymentPollPolicy::default(), None);

        // Timer request is now in flight and holds the poller.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let view = watch.check_now().await.unwrap();

        assert!(matches!(view.phase, PaymentPhase::Successful { .. }));
        assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(matches!(
            watch.join().await,
            Some(PaymentPhase::Successful { .. })
        ));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn check_now_after_timeout_reconciles() {
        let source = ScriptedCharges::new(vec![ChargeState::Pending, ChargeState::Successful]);
        let policy = PaymentPollPolicy {
            max_attempts: 1,
            ..Default::default()
        };
        let watch = PaymentWatch::start(source.clone(), "tx-1", policy, None);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(matches!(
            watch.state().phase,
            PaymentPhase::Failed(ref f) if f.reason == FailureReason::Timeout
        ));
        assert!(watch.is_finished());

        let view = watch.check_now().await.unwrap();
        assert!(matches!(view.phase, PaymentPhase::Successful { .. }));
        assert!(matches!(watch.state().phase, PaymentPhase::Successful { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_timer_and_manual_checks() {
        let source = ScriptedCharges::new(vec![]);
        let watch = PaymentWatch::start(source.clone(), "tx-1", PaymentPollPolicy::default(), None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let before = watch.state();

        watch.cancel();
        tokio::time::sleep(Duration::from_secs(300)).await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(watch.state(), before);
        assert!(watch.check_now().await.is_err());
        assert_eq!(watch.join().await, None);
    }
}
