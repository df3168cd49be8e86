//! Bank-transfer confirmation: a one-second countdown tick, a status poll,
//! and the one-shot transition to `confirmed` that hands the order to the
//! submitter.

use async_trait::async_trait;
use serde::Serialize;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::checkout::scheduler::TaskScheduler;
use crate::config::PaymentStatusConfig;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::payments::status::{ConfirmationHeuristic, PaymentStatusClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Checking,
    Confirmed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Confirmed | SessionStatus::Failed)
    }
}

/// What moved the session to `confirmed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationSource {
    /// The status endpoint reported the transfer as paid.
    StatusEndpoint,
    /// The shopper said they had transferred.
    Shopper,
    /// Degraded-mode simulation.
    Simulated,
}

/// Progress of the order submission triggered by confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubmissionState {
    Idle,
    InFlight,
    Submitted { order_number: String },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub elapsed_seconds: u64,
    pub remaining_seconds: u64,
    pub confirmed_by: Option<ConfirmationSource>,
    pub submission: SubmissionState,
}

/// Creates the order once the transfer is confirmed. Returns the server
/// order number.
#[async_trait]
pub trait SessionFinalizer: Send + Sync {
    async fn finalize(&self, order_ref: &str) -> Result<String, ServiceError>;
}

/// Collaborators of one session.
#[derive(Clone)]
pub struct SessionDeps {
    pub status_client: Arc<dyn PaymentStatusClient>,
    pub finalizer: Arc<dyn SessionFinalizer>,
    pub heuristic: Option<Arc<dyn ConfirmationHeuristic>>,
    pub events: Option<EventSender>,
}

struct SessionState {
    status: SessionStatus,
    elapsed: u64,
    /// Bumped on retry; tasks of an older run stop mutating.
    run: u64,
    endpoint_reached: bool,
    confirmed_by: Option<ConfirmationSource>,
    submission: SubmissionState,
}

struct SessionShared {
    order_ref: String,
    config: PaymentStatusConfig,
    deps: SessionDeps,
    state: Mutex<SessionState>,
    closed: AtomicBool,
    scheduler: Mutex<TaskScheduler>,
    snapshots: watch::Sender<SessionSnapshot>,
}

impl SessionShared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn snapshot_of(&self, state: &SessionState) -> SessionSnapshot {
        SessionSnapshot {
            status: state.status,
            elapsed_seconds: state.elapsed,
            remaining_seconds: self.config.timeout_secs.saturating_sub(state.elapsed),
            confirmed_by: state.confirmed_by,
            submission: state.submission.clone(),
        }
    }

    fn publish(&self, state: &SessionState) {
        self.snapshots.send_replace(self.snapshot_of(state));
    }

    fn is_live(&self, state: &SessionState, run: u64) -> bool {
        !self.closed.load(Ordering::SeqCst) && state.run == run
    }

    fn stop_timers(&self) {
        if let Ok(scheduler) = self.scheduler.lock() {
            scheduler.stop();
        }
    }

    fn emit(&self, event: Event) {
        if let Some(events) = &self.deps.events {
            events.emit(event);
        }
    }

    fn on_tick(&self, run: u64) -> ControlFlow<()> {
        let timed_out = {
            let mut state = self.lock();
            if !self.is_live(&state, run) || state.status.is_terminal() {
                return ControlFlow::Break(());
            }
            state.elapsed += self.config.tick_interval_secs;
            let timed_out =
                state.elapsed >= self.config.timeout_secs && state.status == SessionStatus::Pending;
            if timed_out {
                state.status = SessionStatus::Failed;
            }
            self.publish(&state);
            timed_out
        };

        if !timed_out {
            return ControlFlow::Continue(());
        }
        warn!(order_ref = %self.order_ref, "bank transfer not confirmed before timeout");
        self.stop_timers();
        self.emit(Event::BankTransferTimedOut {
            order_ref: self.order_ref.clone(),
        });
        ControlFlow::Break(())
    }

    async fn on_poll(self: Arc<Self>, run: u64) -> ControlFlow<()> {
        {
            let state = self.lock();
            if !self.is_live(&state, run) || state.status.is_terminal() {
                return ControlFlow::Break(());
            }
            if state.status == SessionStatus::Checking {
                return ControlFlow::Continue(());
            }
        }

        match self.deps.status_client.check(&self.order_ref).await {
            Ok(status) => {
                self.lock().endpoint_reached = true;
                if status.paid() && self.try_confirm(run, ConfirmationSource::StatusEndpoint) {
                    tokio::spawn(self.clone().finalize());
                    return ControlFlow::Break(());
                }
                debug!(order_ref = %self.order_ref, "transfer not yet received");
            }
            Err(err) => {
                warn!(order_ref = %self.order_ref, error = %err, "payment status poll failed");
                if self.simulated_confirmation()
                    && self.try_confirm(run, ConfirmationSource::Simulated)
                {
                    tokio::spawn(self.clone().finalize());
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    }

    /// Degraded mode only, and only while the endpoint has never answered.
    fn simulated_confirmation(&self) -> bool {
        if !self.config.degraded_confirmation {
            return false;
        }
        let Some(heuristic) = self.deps.heuristic.as_ref() else {
            return false;
        };
        let elapsed = {
            let state = self.lock();
            if state.endpoint_reached {
                return false;
            }
            state.elapsed
        };
        heuristic.confirms(elapsed)
    }

    /// The single transition into `confirmed`. Returns true for the caller
    /// that won it, which then owns finalization.
    fn try_confirm(&self, run: u64, source: ConfirmationSource) -> bool {
        let elapsed = {
            let mut state = self.lock();
            if !self.is_live(&state, run) || state.status.is_terminal() {
                return false;
            }
            state.status = SessionStatus::Confirmed;
            state.confirmed_by = Some(source);
            state.submission = SubmissionState::InFlight;
            self.publish(&state);
            state.elapsed
        };

        info!(order_ref = %self.order_ref, ?source, elapsed, "bank transfer confirmed");
        self.stop_timers();
        self.emit(Event::BankTransferConfirmed {
            order_ref: self.order_ref.clone(),
            elapsed_seconds: elapsed,
            optimistic: source != ConfirmationSource::StatusEndpoint,
        });
        true
    }

    async fn finalize(self: Arc<Self>) {
        let outcome = self.deps.finalizer.finalize(&self.order_ref).await;
        let mut state = self.lock();
        state.submission = match outcome {
            Ok(order_number) => SubmissionState::Submitted { order_number },
            Err(err) => {
                error!(order_ref = %self.order_ref, error = %err, "order submission after confirmation failed");
                SubmissionState::Failed {
                    message: err.response_message(),
                }
            }
        };
        self.publish(&state);
    }

    fn start_timers(self: &Arc<Self>, run: u64) {
        let tick = Duration::from_secs(self.config.tick_interval_secs);
        let poll = Duration::from_secs(self.config.poll_interval_secs);
        let scheduler = match self.scheduler.lock() {
            Ok(scheduler) => scheduler,
            Err(poisoned) => poisoned.into_inner(),
        };

        let shared = self.clone();
        scheduler.every("countdown", tick, move || {
            let flow = shared.on_tick(run);
            async move { flow }
        });
        let shared = self.clone();
        scheduler.every("status-poll", poll, move || shared.clone().on_poll(run));
    }
}

/// Owns one bank-transfer session and its timers. Dropping the controller
/// cancels everything it started.
pub struct PaymentSessionController {
    shared: Arc<SessionShared>,
}

impl PaymentSessionController {
    /// Creates the session in `pending` and starts both timers.
    pub fn start(
        order_ref: impl Into<String>,
        config: PaymentStatusConfig,
        deps: SessionDeps,
    ) -> Self {
        let initial = SessionState {
            status: SessionStatus::Pending,
            elapsed: 0,
            run: 0,
            endpoint_reached: false,
            confirmed_by: None,
            submission: SubmissionState::Idle,
        };
        let (snapshots, _) = watch::channel(SessionSnapshot {
            status: SessionStatus::Pending,
            elapsed_seconds: 0,
            remaining_seconds: config.timeout_secs,
            confirmed_by: None,
            submission: SubmissionState::Idle,
        });
        let shared = Arc::new(SessionShared {
            order_ref: order_ref.into(),
            config,
            deps,
            state: Mutex::new(initial),
            closed: AtomicBool::new(false),
            scheduler: Mutex::new(TaskScheduler::new()),
            snapshots,
        });
        info!(order_ref = %shared.order_ref, "bank transfer session started");
        shared.start_timers(0);
        Self { shared }
    }

    pub fn order_ref(&self) -> &str {
        &self.shared.order_ref
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.shared.lock();
        self.shared.snapshot_of(&state)
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.lock().status
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshots.subscribe()
    }

    pub fn active_timers(&self) -> usize {
        self.shared
            .scheduler
            .lock()
            .map(|scheduler| scheduler.active())
            .unwrap_or(0)
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn current_run(&self) -> Result<u64, ServiceError> {
        if self.is_cancelled() {
            return Err(ServiceError::InvalidOperation(
                "This bank transfer session has been closed".to_string(),
            ));
        }
        Ok(self.shared.lock().run)
    }

    /// "I have transferred": confirms without waiting for the next poll and
    /// submits the order right away.
    #[instrument(skip(self), fields(order_ref = %self.shared.order_ref))]
    pub async fn confirm_transfer(&self) -> Result<SessionSnapshot, ServiceError> {
        let run = self.current_run()?;
        match self.status() {
            SessionStatus::Failed => {
                return Err(ServiceError::PaymentTimeout);
            }
            SessionStatus::Confirmed => return Ok(self.snapshot()),
            SessionStatus::Pending | SessionStatus::Checking => {}
        }
        if self.shared.try_confirm(run, ConfirmationSource::Shopper) {
            self.shared.clone().finalize().await;
        }
        Ok(self.snapshot())
    }

    /// One authoritative status call outside the poll cadence. The session is
    /// `checking` meanwhile and returns to `pending` when inconclusive.
    #[instrument(skip(self), fields(order_ref = %self.shared.order_ref))]
    pub async fn check_now(&self) -> Result<SessionStatus, ServiceError> {
        let run = self.current_run()?;
        {
            let mut state = self.shared.lock();
            match state.status {
                SessionStatus::Pending => {
                    state.status = SessionStatus::Checking;
                    self.shared.publish(&state);
                }
                SessionStatus::Checking => {
                    return Err(ServiceError::InvalidOperation(
                        "A payment check is already in progress".to_string(),
                    ))
                }
                terminal => return Ok(terminal),
            }
        }

        let result = self.shared.deps.status_client.check(&self.shared.order_ref).await;
        if result.is_ok() {
            self.shared.lock().endpoint_reached = true;
        }
        if let Ok(status) = &result {
            if status.paid() && self.shared.try_confirm(run, ConfirmationSource::StatusEndpoint) {
                self.shared.clone().finalize().await;
                return Ok(self.status());
            }
        }

        {
            let mut state = self.shared.lock();
            if self.shared.is_live(&state, run) && state.status == SessionStatus::Checking {
                state.status = SessionStatus::Pending;
                self.shared.publish(&state);
            }
        }
        result?;
        Ok(self.status())
    }

    /// Restarts a timed-out session from zero with the same order reference.
    pub fn retry(&self) -> Result<(), ServiceError> {
        if self.is_cancelled() {
            return Err(ServiceError::InvalidOperation(
                "This bank transfer session has been closed".to_string(),
            ));
        }
        let run = {
            let mut state = self.shared.lock();
            if state.status != SessionStatus::Failed {
                return Err(ServiceError::InvalidOperation(
                    "Only an expired bank transfer can be restarted".to_string(),
                ));
            }
            state.status = SessionStatus::Pending;
            state.elapsed = 0;
            state.run += 1;
            state.confirmed_by = None;
            state.submission = SubmissionState::Idle;
            self.shared.publish(&state);
            state.run
        };

        if let Ok(mut scheduler) = self.shared.scheduler.lock() {
            scheduler.stop();
            *scheduler = TaskScheduler::new();
        }
        info!(order_ref = %self.shared.order_ref, "bank transfer session restarted");
        self.shared.start_timers(run);
        Ok(())
    }

    /// Cancels the session unless it is already confirmed, in one step with
    /// respect to confirmation. Returns false, leaving the session running,
    /// when the transfer was confirmed first.
    pub fn cancel_unless_confirmed(&self) -> bool {
        {
            let state = self.shared.lock();
            if state.status == SessionStatus::Confirmed {
                return false;
            }
            if self.shared.closed.swap(true, Ordering::SeqCst) {
                return true;
            }
        }
        self.shared.stop_timers();
        debug!(order_ref = %self.shared.order_ref, "bank transfer session cancelled");
        true
    }

    /// Stops every timer. No state changes after this returns.
    pub fn cancel(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.stop_timers();
        debug!(order_ref = %self.shared.order_ref, "bank transfer session cancelled");
    }
}

impl Drop for PaymentSessionController {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::status::PaymentStatus;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct ScriptedStatus {
        paid_after_calls: Option<usize>,
        unreachable: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PaymentStatusClient for ScriptedStatus {
        async fn check(&self, _order_ref: &str) -> Result<PaymentStatus, ServiceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.unreachable {
                return Err(ServiceError::TransportError("connection refused".into()));
            }
            let is_paid = self.paid_after_calls.map_or(false, |after| n >= after);
            Ok(PaymentStatus {
                success: true,
                is_paid,
            })
        }
    }

    /// Unpaid endpoint whose next call can be made to hang for `stall`.
    struct StallingStatus {
        stall: Duration,
        stall_next: AtomicBool,
        calls: AtomicUsize,
    }

    impl StallingStatus {
        fn new(stall: Duration) -> Self {
            Self {
                stall,
                stall_next: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PaymentStatusClient for StallingStatus {
        async fn check(&self, _order_ref: &str) -> Result<PaymentStatus, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.stall_next.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(self.stall).await;
            }
            Ok(PaymentStatus {
                success: true,
                is_paid: false,
            })
        }
    }

    #[derive(Default)]
    struct CountingFinalizer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SessionFinalizer for CountingFinalizer {
        async fn finalize(&self, order_ref: &str) -> Result<String, ServiceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("SO-{}-{}", order_ref, n))
        }
    }

    struct Always;

    impl ConfirmationHeuristic for Always {
        fn confirms(&self, elapsed_seconds: u64) -> bool {
            elapsed_seconds > 15
        }
    }

    fn session(
        status: Arc<ScriptedStatus>,
        finalizer: Arc<CountingFinalizer>,
        config: PaymentStatusConfig,
        heuristic: Option<Arc<dyn ConfirmationHeuristic>>,
    ) -> PaymentSessionController {
        PaymentSessionController::start(
            "ORD1",
            config,
            SessionDeps {
                status_client: status,
                finalizer,
                heuristic,
                events: None,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_after_window_with_no_timers_left() {
        let status = Arc::new(ScriptedStatus::default());
        let finalizer = Arc::new(CountingFinalizer::default());
        let controller = session(status.clone(), finalizer.clone(), Default::default(), None);
        assert_eq!(controller.active_timers(), 2);

        tokio::time::sleep(Duration::from_secs(599)).await;
        assert_eq!(controller.status(), SessionStatus::Pending);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Failed);
        assert_eq!(snapshot.elapsed_seconds, 600);
        assert_eq!(snapshot.remaining_seconds, 0);
        assert_eq!(controller.active_timers(), 0);
        assert_eq!(finalizer.calls.load(Ordering::SeqCst), 0);
        assert!(status.calls.load(Ordering::SeqCst) >= 119);
    }

    #[tokio::test(start_paused = true)]
    async fn paid_poll_confirms_and_submits_once() {
        let status = Arc::new(ScriptedStatus {
            paid_after_calls: Some(2),
            ..Default::default()
        });
        let finalizer = Arc::new(CountingFinalizer::default());
        let controller = session(status.clone(), finalizer.clone(), Default::default(), None);
        let mut updates = controller.subscribe();

        tokio::time::sleep(Duration::from_secs(11)).await;
        while updates.borrow_and_update().submission == SubmissionState::InFlight {
            updates.changed().await.unwrap();
        }

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Confirmed);
        assert_eq!(snapshot.confirmed_by, Some(ConfirmationSource::StatusEndpoint));
        assert_eq!(
            snapshot.submission,
            SubmissionState::Submitted {
                order_number: "SO-ORD1-1".into()
            }
        );
        assert_eq!(controller.active_timers(), 0);

        // A late manual confirmation does not submit again.
        controller.confirm_transfer().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(finalizer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(status.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shopper_confirmation_submits_immediately() {
        let status = Arc::new(ScriptedStatus::default());
        let finalizer = Arc::new(CountingFinalizer::default());
        let controller = session(status, finalizer.clone(), Default::default(), None);

        tokio::time::sleep(Duration::from_secs(3)).await;
        let snapshot = controller.confirm_transfer().await.unwrap();
        assert_eq!(snapshot.status, SessionStatus::Confirmed);
        assert_eq!(snapshot.confirmed_by, Some(ConfirmationSource::Shopper));
        assert!(matches!(snapshot.submission, SubmissionState::Submitted { .. }));
        assert_eq!(finalizer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(controller.active_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_freezes_state() {
        let status = Arc::new(ScriptedStatus::default());
        let finalizer = Arc::new(CountingFinalizer::default());
        let controller = session(status.clone(), finalizer, Default::default(), None);

        tokio::time::sleep(Duration::from_millis(7_500)).await;
        controller.cancel();
        let frozen = controller.snapshot();
        let polls = status.calls.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(700)).await;
        assert_eq!(controller.snapshot(), frozen);
        assert_eq!(frozen.elapsed_seconds, 7);
        assert_eq!(status.calls.load(Ordering::SeqCst), polls);
        assert_eq!(controller.active_timers(), 0);
        assert!(controller.confirm_transfer().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_session_cannot_be_cancelled_for_a_switch() {
        let status = Arc::new(ScriptedStatus::default());
        let finalizer = Arc::new(CountingFinalizer::default());
        let controller = session(status, finalizer.clone(), Default::default(), None);
        controller.confirm_transfer().await.unwrap();

        assert!(!controller.cancel_unless_confirmed());
        assert!(!controller.is_cancelled());
        assert_eq!(controller.status(), SessionStatus::Confirmed);
        assert_eq!(finalizer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_session_cannot_be_confirmed_afterwards() {
        let status = Arc::new(ScriptedStatus {
            paid_after_calls: Some(1),
            ..Default::default()
        });
        let finalizer = Arc::new(CountingFinalizer::default());
        let controller = session(status.clone(), finalizer.clone(), Default::default(), None);

        assert!(controller.cancel_unless_confirmed());
        assert!(controller.is_cancelled());
        assert_eq!(controller.active_timers(), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(controller.status(), SessionStatus::Pending);
        assert_eq!(status.calls.load(Ordering::SeqCst), 0);
        assert_eq!(finalizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn inconclusive_manual_check_returns_to_pending() {
        let status = Arc::new(ScriptedStatus::default());
        let finalizer = Arc::new(CountingFinalizer::default());
        let controller = session(status, finalizer, Default::default(), None);

        assert_eq!(controller.check_now().await.unwrap(), SessionStatus::Pending);
        assert_eq!(controller.active_timers(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn paid_manual_check_confirms_and_submits_once() {
        let status = Arc::new(ScriptedStatus {
            paid_after_calls: Some(1),
            ..Default::default()
        });
        let finalizer = Arc::new(CountingFinalizer::default());
        let controller = session(status.clone(), finalizer.clone(), Default::default(), None);

        assert_eq!(controller.check_now().await.unwrap(), SessionStatus::Confirmed);
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.confirmed_by, Some(ConfirmationSource::StatusEndpoint));
        assert_eq!(
            snapshot.submission,
            SubmissionState::Submitted {
                order_number: "SO-ORD1-1".into()
            }
        );
        assert_eq!(controller.active_timers(), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(finalizer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(status.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn check_spanning_deadline_fails_on_next_tick() {
        let status = Arc::new(StallingStatus::new(Duration::from_secs(5)));
        let finalizer = Arc::new(CountingFinalizer::default());
        let controller = PaymentSessionController::start(
            "ORD1",
            Default::default(),
            SessionDeps {
                status_client: status.clone(),
                finalizer: finalizer.clone(),
                heuristic: None,
                events: None,
            },
        );

        tokio::time::sleep(Duration::from_millis(598_500)).await;
        status.stall_next.store(true, Ordering::SeqCst);

        // The check runs from 598.5s to 603.5s, across the 600s deadline.
        assert_eq!(controller.check_now().await.unwrap(), SessionStatus::Pending);
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Pending);
        assert_eq!(snapshot.elapsed_seconds, 603);
        assert_eq!(snapshot.remaining_seconds, 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Failed);
        assert_eq!(snapshot.elapsed_seconds, 604);
        assert_eq!(controller.active_timers(), 0);
        assert_eq!(finalizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_manual_check_surfaces_transport_error() {
        let status = Arc::new(ScriptedStatus {
            unreachable: true,
            ..Default::default()
        });
        let finalizer = Arc::new(CountingFinalizer::default());
        let controller = session(status, finalizer, Default::default(), None);

        let err = controller.check_now().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(controller.status(), SessionStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_restarts_failed_session() {
        let status = Arc::new(ScriptedStatus::default());
        let finalizer = Arc::new(CountingFinalizer::default());
        let config = PaymentStatusConfig {
            timeout_secs: 10,
            ..Default::default()
        };
        let controller = session(status, finalizer, config, None);
        assert!(controller.retry().is_err());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(controller.status(), SessionStatus::Failed);
        assert!(matches!(
            controller.confirm_transfer().await,
            Err(ServiceError::PaymentTimeout)
        ));

        controller.retry().unwrap();
        assert_eq!(controller.status(), SessionStatus::Pending);
        assert_eq!(controller.snapshot().elapsed_seconds, 0);
        assert_eq!(controller.active_timers(), 2);

        tokio::time::sleep(Duration::from_millis(4_500)).await;
        assert_eq!(controller.snapshot().elapsed_seconds, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_endpoint_never_confirms_without_degraded_mode() {
        let status = Arc::new(ScriptedStatus {
            unreachable: true,
            ..Default::default()
        });
        let finalizer = Arc::new(CountingFinalizer::default());
        let controller = session(
            status,
            finalizer.clone(),
            Default::default(),
            Some(Arc::new(Always)),
        );

        tokio::time::sleep(Duration::from_secs(601)).await;
        assert_eq!(controller.status(), SessionStatus::Failed);
        assert_eq!(finalizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_mode_simulates_confirmation() {
        let status = Arc::new(ScriptedStatus {
            unreachable: true,
            ..Default::default()
        });
        let finalizer = Arc::new(CountingFinalizer::default());
        let config = PaymentStatusConfig {
            degraded_confirmation: true,
            ..Default::default()
        };
        let controller = session(status, finalizer, config, Some(Arc::new(Always)));

        tokio::time::sleep(Duration::from_secs(21)).await;
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Confirmed);
        assert_eq!(snapshot.confirmed_by, Some(ConfirmationSource::Simulated));
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_mode_is_off_once_endpoint_answered() {
        let status = Arc::new(ScriptedStatus::default());
        let finalizer = Arc::new(CountingFinalizer::default());
        let config = PaymentStatusConfig {
            degraded_confirmation: true,
            timeout_secs: 60,
            ..Default::default()
        };
        let controller = session(status, finalizer, config, Some(Arc::new(Always)));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(controller.status(), SessionStatus::Failed);
    }
}
