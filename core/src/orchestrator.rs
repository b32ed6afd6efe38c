//! Drains the local mutation queue against the remote endpoint.
//!
//! A pass submits queued items one at a time, in queue order, awaiting each
//! response before starting the next. Confirmed items leave the queue
//! immediately; item-scoped rejections are moved to the dead-letter list and the
//! pass continues; anything else that fails stops the pass and leaves the
//! remaining items for the next trigger.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::models::{
    DroppedMutation, MutationPayload, MutationResponse, QueuedMutation, RateLimitStatus,
    RejectReason,
};
use crate::queue::{MutationQueue, QueueError};
use crate::sync_state::SyncStateHandle;

pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitAck {
    pub entity_id: String,
    pub duplicate: bool,
    pub rate_limit: Option<RateLimitStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// Network failure, timeout or server error. The item stays queued.
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("rate limited")]
    RateLimited { reset_at: Option<DateTime<Utc>> },
    /// The caller's credentials were refused; no item can succeed until they change.
    #[error("not authenticated: {0}")]
    Unauthenticated(String),
    /// The caller may not write to the resolved baby; every item would be refused alike.
    #[error("not allowed: {0}")]
    Forbidden(String),
    /// The server refused this item permanently; the rest of the queue is unaffected.
    #[error("rejected ({reason}): {message}")]
    Rejected {
        reason: RejectReason,
        message: String,
    },
}

/// Map an endpoint response onto the drain's success / failure classes.
pub fn interpret_response(response: MutationResponse) -> Result<SubmitAck, SubmitError> {
    match response {
        MutationResponse::Accepted {
            entity_id,
            duplicate,
            rate_limit,
        } => Ok(SubmitAck {
            entity_id,
            duplicate,
            rate_limit,
        }),
        MutationResponse::Rejected {
            reason: RejectReason::RateLimited,
            rate_limit,
            ..
        } => Err(SubmitError::RateLimited {
            reset_at: rate_limit.map(|r| r.reset_at),
        }),
        MutationResponse::Rejected {
            reason: RejectReason::Unauthenticated,
            message,
            ..
        } => Err(SubmitError::Unauthenticated(message)),
        MutationResponse::Rejected {
            reason: RejectReason::Scope,
            message,
            ..
        } => Err(SubmitError::Forbidden(message)),
        MutationResponse::Rejected {
            reason, message, ..
        } => Err(SubmitError::Rejected { reason, message }),
    }
}

/// Delivers one queued mutation to the server.
#[async_trait]
pub trait MutationTransport: Send + Sync {
    async fn submit(&self, mutation: &QueuedMutation) -> Result<SubmitAck, SubmitError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// Connectivity came back. Marks the client online before draining.
    Online,
    Timer,
    Focus,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    Offline,
    AlreadySyncing,
    BackingOff { until: DateTime<Utc> },
    /// Another orchestrator over the same store is draining.
    LeaseHeld,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DrainOutcome {
    /// Every item was confirmed or dropped.
    Completed,
    /// Connectivity was lost; the next item was not started.
    Offline,
    Transient { message: String },
    RateLimited { reset_at: Option<DateTime<Utc>> },
    Unauthenticated { message: String },
    /// The caller lost access to the baby, or never chose one.
    Forbidden { message: String },
    /// Another holder took over the drain lease after ours expired.
    LeaseLost,
    Storage { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrainReport {
    pub trigger: SyncTrigger,
    pub confirmed: Vec<String>,
    pub dropped: Vec<DroppedMutation>,
    pub outcome: DrainOutcome,
    pub remaining: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TriggerResult {
    Ignored(SkipReason),
    Drained(DrainReport),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Upper bound on one submission; expiry counts as a transient failure.
    pub submit_timeout: Duration,
    /// How long a drain lease stays valid without renewal.
    pub lease_ttl: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            submit_timeout: DEFAULT_SUBMIT_TIMEOUT,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }
}

/// Resets the syncing flag and releases the lease however a pass ends.
struct DrainGuard<'a> {
    state: &'a SyncStateHandle,
    queue: &'a MutationQueue,
    holder: &'a str,
    leased: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.leased {
            if let Err(e) = self.queue.release_lease(self.holder) {
                tracing::warn!("failed to release drain lease: {e}");
            }
        }
        self.state.end_sync();
    }
}

pub struct SyncOrchestrator<T> {
    queue: Arc<MutationQueue>,
    transport: T,
    state: SyncStateHandle,
    config: SyncConfig,
    holder: String,
    backoff_until: Mutex<Option<DateTime<Utc>>>,
}

impl<T: MutationTransport> SyncOrchestrator<T> {
    pub fn new(
        queue: Arc<MutationQueue>,
        transport: T,
        state: SyncStateHandle,
        config: SyncConfig,
    ) -> Self {
        let orchestrator = Self {
            queue,
            transport,
            state,
            config,
            holder: Uuid::new_v4().to_string(),
            backoff_until: Mutex::new(None),
        };
        orchestrator.refresh_pending();
        orchestrator
    }

    #[must_use]
    pub fn state(&self) -> &SyncStateHandle {
        &self.state
    }

    #[must_use]
    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Queue a mutation and publish the new pending count.
    pub fn enqueue(&self, payload: MutationPayload) -> Result<QueuedMutation, QueueError> {
        let item = self.queue.enqueue(payload)?;
        self.refresh_pending();
        Ok(item)
    }

    /// Record connectivity. Returns `true` on an offline to online transition.
    pub fn set_online(&self, online: bool) -> bool {
        self.state.set_online(online)
    }

    #[must_use]
    pub fn backoff_until(&self) -> Option<DateTime<Utc>> {
        *self
            .backoff_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_backoff(&self, until: Option<DateTime<Utc>>) {
        *self
            .backoff_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = until;
    }

    fn refresh_pending(&self) {
        match self.queue.count() {
            Ok(count) => self.state.set_pending(count),
            Err(e) => tracing::warn!("failed to count queued mutations: {e}"),
        }
    }

    /// Run one drain pass unless offline, already draining, backing off, or
    /// another process holds the drain lease.
    pub async fn trigger(&self, trigger: SyncTrigger) -> TriggerResult {
        if trigger == SyncTrigger::Online {
            self.state.set_online(true);
        }
        self.refresh_pending();

        if !self.state.snapshot().is_online {
            tracing::debug!(?trigger, "offline, sync skipped");
            return TriggerResult::Ignored(SkipReason::Offline);
        }
        if let Some(until) = self.backoff_until() {
            if Utc::now() < until {
                tracing::debug!(?trigger, %until, "rate limited, sync skipped");
                return TriggerResult::Ignored(SkipReason::BackingOff { until });
            }
            self.set_backoff(None);
        }
        if !self.state.try_begin_sync() {
            tracing::debug!(?trigger, "drain already running, trigger coalesced");
            return TriggerResult::Ignored(SkipReason::AlreadySyncing);
        }

        let mut guard = DrainGuard {
            state: &self.state,
            queue: &self.queue,
            holder: &self.holder,
            leased: false,
        };

        match self.queue.try_acquire_lease(&self.holder, Utc::now(), self.config.lease_ttl) {
            Ok(true) => guard.leased = true,
            Ok(false) => {
                tracing::debug!(?trigger, "drain lease held elsewhere, sync skipped");
                return TriggerResult::Ignored(SkipReason::LeaseHeld);
            }
            Err(e) => {
                tracing::warn!("failed to acquire drain lease: {e}");
                let report = DrainReport {
                    trigger,
                    confirmed: Vec::new(),
                    dropped: Vec::new(),
                    outcome: DrainOutcome::Storage {
                        message: e.to_string(),
                    },
                    remaining: self.state.snapshot().pending_count,
                    rate_limit: None,
                };
                return TriggerResult::Drained(report);
            }
        }

        let mut report = DrainReport {
            trigger,
            confirmed: Vec::new(),
            dropped: Vec::new(),
            outcome: DrainOutcome::Completed,
            remaining: 0,
            rate_limit: None,
        };
        report.outcome = match self.drain(&mut report).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("queue storage failed during drain: {e}");
                DrainOutcome::Storage {
                    message: e.to_string(),
                }
            }
        };
        drop(guard);

        self.refresh_pending();
        report.remaining = self.state.snapshot().pending_count;
        tracing::info!(
            ?trigger,
            confirmed = report.confirmed.len(),
            dropped = report.dropped.len(),
            remaining = report.remaining,
            outcome = ?report.outcome,
            "sync pass finished"
        );
        TriggerResult::Drained(report)
    }

    async fn drain(&self, report: &mut DrainReport) -> Result<DrainOutcome, QueueError> {
        let items = self.queue.list_all()?;

        for item in items {
            if !self.state.snapshot().is_online {
                return Ok(DrainOutcome::Offline);
            }
            // Renew before each item so long passes keep the lease.
            if !self
                .queue
                .try_acquire_lease(&self.holder, Utc::now(), self.config.lease_ttl)?
            {
                return Ok(DrainOutcome::LeaseLost);
            }

            let result = tokio::time::timeout(
                self.config.submit_timeout,
                self.transport.submit(&item),
            )
            .await
            .unwrap_or_else(|_| {
                Err(SubmitError::Transient(format!(
                    "submission timed out after {}s",
                    self.config.submit_timeout.as_secs()
                )))
            });

            match result {
                Ok(ack) => {
                    tracing::debug!(
                        id = %item.id,
                        entity_id = %ack.entity_id,
                        duplicate = ack.duplicate,
                        "mutation confirmed"
                    );
                    self.queue.remove_by_id(&item.id)?;
                    self.refresh_pending();
                    report.confirmed.push(item.id);
                    if ack.rate_limit.is_some() {
                        report.rate_limit = ack.rate_limit;
                    }
                }
                Err(SubmitError::Rejected { reason, message }) => {
                    let dropped = self.queue.drop_rejected(item, reason, message, Utc::now())?;
                    self.refresh_pending();
                    report.dropped.push(dropped);
                }
                Err(SubmitError::Transient(message)) => {
                    tracing::warn!(id = %item.id, "transient sync failure: {message}");
                    return Ok(DrainOutcome::Transient { message });
                }
                Err(SubmitError::RateLimited { reset_at }) => {
                    tracing::warn!(id = %item.id, ?reset_at, "rate limited, pausing sync");
                    self.set_backoff(reset_at);
                    return Ok(DrainOutcome::RateLimited { reset_at });
                }
                Err(SubmitError::Unauthenticated(message)) => {
                    tracing::warn!("server refused credentials: {message}");
                    return Ok(DrainOutcome::Unauthenticated { message });
                }
                Err(SubmitError::Forbidden(message)) => {
                    tracing::warn!("server refused access to the baby: {message}");
                    return Ok(DrainOutcome::Forbidden { message });
                }
            }
        }

        Ok(DrainOutcome::Completed)
    }

    /// Process triggers one at a time until the channel closes, adding a
    /// periodic [`SyncTrigger::Timer`] every `interval`.
    ///
    /// Triggers that arrive while a pass is running are discarded when it ends;
    /// an [`SyncTrigger::Online`] among them still marks the client online.
    pub async fn run(&self, mut triggers: mpsc::Receiver<SyncTrigger>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let trigger = tokio::select! {
                _ = ticker.tick() => SyncTrigger::Timer,
                received = triggers.recv() => match received {
                    Some(trigger) => trigger,
                    None => break,
                },
            };

            if let TriggerResult::Ignored(reason) = self.trigger(trigger).await {
                tracing::debug!(?trigger, ?reason, "trigger ignored");
                continue;
            }

            while let Ok(coalesced) = triggers.try_recv() {
                if coalesced == SyncTrigger::Online {
                    self.state.set_online(true);
                }
                tracing::debug!(trigger = ?coalesced, "trigger coalesced into finished pass");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityType;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct FakeTransport {
        seen: Mutex<Vec<String>>,
        scripted: Mutex<VecDeque<Result<SubmitAck, SubmitError>>>,
        /// Responses keyed by the `amount_ml` field of the submitted payload.
        by_amount: HashMap<i64, SubmitError>,
        go_offline_after: Option<(usize, SyncStateHandle)>,
        block: Option<(Arc<Notify>, Arc<Notify>)>,
        delay: Option<Duration>,
    }

    impl FakeTransport {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }

        fn script(self, responses: Vec<Result<SubmitAck, SubmitError>>) -> Self {
            *self.scripted.lock().unwrap() = responses.into();
            self
        }
    }

    fn ack() -> SubmitAck {
        SubmitAck {
            entity_id: "e".to_string(),
            duplicate: false,
            rate_limit: None,
        }
    }

    #[async_trait]
    impl MutationTransport for FakeTransport {
        async fn submit(&self, mutation: &QueuedMutation) -> Result<SubmitAck, SubmitError> {
            let calls = {
                let mut seen = self.seen.lock().unwrap();
                seen.push(mutation.id.clone());
                seen.len()
            };
            if let Some((entered, release)) = &self.block {
                entered.notify_one();
                release.notified().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some((n, state)) = &self.go_offline_after {
                if calls == *n {
                    state.set_online(false);
                }
            }
            let amount = mutation.payload.fields.get("amount_ml").and_then(serde_json::Value::as_i64);
            if let Some(err) = amount.and_then(|a| self.by_amount.get(&a)) {
                return Err(err.clone());
            }
            self.scripted.lock().unwrap().pop_front().unwrap_or_else(|| Ok(ack()))
        }
    }

    fn feeding(amount: i64) -> MutationPayload {
        let serde_json::Value::Object(fields) = json!({
            "kind": "bottle",
            "started_at": "2025-03-01T08:00:00Z",
            "amount_ml": amount
        }) else {
            unreachable!()
        };
        MutationPayload::create(EntityType::Feeding, None, fields)
    }

    fn orchestrator(transport: FakeTransport) -> SyncOrchestrator<FakeTransport> {
        SyncOrchestrator::new(
            Arc::new(MutationQueue::in_memory()),
            transport,
            SyncStateHandle::default(),
            SyncConfig::default(),
        )
    }

    fn drained(result: TriggerResult) -> DrainReport {
        match result {
            TriggerResult::Drained(report) => report,
            TriggerResult::Ignored(reason) => panic!("expected a drain, got {reason:?}"),
        }
    }

    #[tokio::test]
    async fn test_offline_then_online_drains_in_order() {
        let orch = orchestrator(FakeTransport::default());
        let ids: Vec<String> = (1..=3)
            .map(|i| orch.enqueue(feeding(i * 10)).unwrap().id)
            .collect();

        let result = orch.trigger(SyncTrigger::Manual).await;
        assert_eq!(result, TriggerResult::Ignored(SkipReason::Offline));
        let state = orch.state().snapshot();
        assert_eq!(state.pending_count, 3);
        assert!(!state.is_syncing);

        let report = drained(orch.trigger(SyncTrigger::Online).await);
        assert_eq!(report.outcome, DrainOutcome::Completed);
        assert_eq!(report.confirmed, ids);
        assert_eq!(orch.transport.seen(), ids);
        let state = orch.state().snapshot();
        assert_eq!(state.pending_count, 0);
        assert!(!state.is_syncing);
        assert!(state.is_online);
    }

    #[tokio::test]
    async fn test_rejected_item_dropped_and_drain_continues() {
        let transport = FakeTransport {
            by_amount: HashMap::from([(
                0,
                SubmitError::Rejected {
                    reason: RejectReason::Validation,
                    message: "amount_ml must be greater than 0".to_string(),
                },
            )]),
            ..FakeTransport::default()
        };
        let orch = orchestrator(transport);
        orch.set_online(true);
        let first = orch.enqueue(feeding(60)).unwrap();
        let bad = orch.enqueue(feeding(0)).unwrap();
        let last = orch.enqueue(feeding(90)).unwrap();

        let report = drained(orch.trigger(SyncTrigger::Timer).await);
        assert_eq!(report.outcome, DrainOutcome::Completed);
        assert_eq!(report.confirmed, vec![first.id, last.id]);
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].mutation.id, bad.id);
        assert_eq!(report.remaining, 0);
        assert_eq!(orch.queue().dropped().unwrap().len(), 1);
        assert_eq!(orch.state().snapshot().pending_count, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_stops_pass_and_keeps_items() {
        let transport = FakeTransport::default().script(vec![
            Ok(ack()),
            Err(SubmitError::Transient("connection reset".to_string())),
        ]);
        let orch = orchestrator(transport);
        orch.set_online(true);
        let first = orch.enqueue(feeding(10)).unwrap();
        let second = orch.enqueue(feeding(20)).unwrap();
        let third = orch.enqueue(feeding(30)).unwrap();

        let report = drained(orch.trigger(SyncTrigger::Focus).await);
        assert!(matches!(report.outcome, DrainOutcome::Transient { .. }));
        assert_eq!(report.confirmed, vec![first.id]);
        assert_eq!(report.remaining, 2);
        // The third item is never attempted after the failure.
        assert_eq!(orch.transport.seen().len(), 2);
        let queued: Vec<String> = orch.queue().list_all().unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(queued, vec![second.id, third.id]);

        // The next trigger retries from the failed item.
        let report = drained(orch.trigger(SyncTrigger::Timer).await);
        assert_eq!(report.outcome, DrainOutcome::Completed);
        assert_eq!(report.remaining, 0);
    }

    #[tokio::test]
    async fn test_unauthenticated_stops_and_keeps_items() {
        let transport = FakeTransport::default()
            .script(vec![Err(SubmitError::Unauthenticated("Invalid token".to_string()))]);
        let orch = orchestrator(transport);
        orch.set_online(true);
        orch.enqueue(feeding(10)).unwrap();
        orch.enqueue(feeding(20)).unwrap();

        let report = drained(orch.trigger(SyncTrigger::Manual).await);
        assert!(matches!(report.outcome, DrainOutcome::Unauthenticated { .. }));
        assert_eq!(report.remaining, 2);
        assert!(orch.queue().dropped().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_forbidden_scope_stops_and_keeps_items() {
        let transport = FakeTransport::default().script(vec![
            Ok(ack()),
            Err(SubmitError::Forbidden("Viewers cannot log entries".to_string())),
        ]);
        let orch = orchestrator(transport);
        orch.set_online(true);
        let first = orch.enqueue(feeding(10)).unwrap();
        let second = orch.enqueue(feeding(20)).unwrap();
        let third = orch.enqueue(feeding(30)).unwrap();

        let report = drained(orch.trigger(SyncTrigger::Manual).await);
        assert_eq!(
            report.outcome,
            DrainOutcome::Forbidden {
                message: "Viewers cannot log entries".to_string()
            }
        );
        assert_eq!(report.confirmed, vec![first.id]);
        assert!(report.dropped.is_empty());
        assert_eq!(report.remaining, 2);
        assert_eq!(orch.transport.seen().len(), 2);
        assert!(orch.queue().dropped().unwrap().is_empty());
        let queued: Vec<String> = orch.queue().list_all().unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(queued, vec![second.id, third.id]);
    }

    #[tokio::test]
    async fn test_item_authorization_is_dropped_not_blocking() {
        let transport = FakeTransport {
            by_amount: HashMap::from([(
                20,
                SubmitError::Rejected {
                    reason: RejectReason::Authorization,
                    message: "Entry e9 belongs to another baby".to_string(),
                },
            )]),
            ..FakeTransport::default()
        };
        let orch = orchestrator(transport);
        orch.set_online(true);
        orch.enqueue(feeding(10)).unwrap();
        let foreign = orch.enqueue(feeding(20)).unwrap();
        orch.enqueue(feeding(30)).unwrap();

        let report = drained(orch.trigger(SyncTrigger::Manual).await);
        assert_eq!(report.outcome, DrainOutcome::Completed);
        assert_eq!(report.confirmed.len(), 2);
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].mutation.id, foreign.id);
        assert_eq!(report.dropped[0].reason, RejectReason::Authorization);
    }

    #[tokio::test]
    async fn test_rate_limited_backs_off_until_reset() {
        let reset_at = Utc::now() + chrono::Duration::minutes(10);
        let transport = FakeTransport::default().script(vec![Err(SubmitError::RateLimited {
            reset_at: Some(reset_at),
        })]);
        let orch = orchestrator(transport);
        orch.set_online(true);
        orch.enqueue(feeding(10)).unwrap();

        let report = drained(orch.trigger(SyncTrigger::Manual).await);
        assert_eq!(report.outcome, DrainOutcome::RateLimited { reset_at: Some(reset_at) });
        assert_eq!(report.remaining, 1);
        assert_eq!(orch.backoff_until(), Some(reset_at));

        let result = orch.trigger(SyncTrigger::Timer).await;
        assert_eq!(result, TriggerResult::Ignored(SkipReason::BackingOff { until: reset_at }));
        assert_eq!(orch.transport.seen().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_backoff_allows_drain() {
        let transport = FakeTransport::default().script(vec![Err(SubmitError::RateLimited {
            reset_at: Some(Utc::now() - chrono::Duration::seconds(1)),
        })]);
        let orch = orchestrator(transport);
        orch.set_online(true);
        orch.enqueue(feeding(10)).unwrap();

        drained(orch.trigger(SyncTrigger::Manual).await);
        let report = drained(orch.trigger(SyncTrigger::Timer).await);
        assert_eq!(report.outcome, DrainOutcome::Completed);
        assert_eq!(orch.backoff_until(), None);
    }

    #[tokio::test]
    async fn test_connectivity_loss_stops_before_next_item() {
        let state = SyncStateHandle::default();
        let transport = FakeTransport {
            go_offline_after: Some((1, state.clone())),
            ..FakeTransport::default()
        };
        let orch = SyncOrchestrator::new(
            Arc::new(MutationQueue::in_memory()),
            transport,
            state,
            SyncConfig::default(),
        );
        orch.set_online(true);
        let first = orch.enqueue(feeding(10)).unwrap();
        orch.enqueue(feeding(20)).unwrap();

        let report = drained(orch.trigger(SyncTrigger::Timer).await);
        // The in-flight item still completes.
        assert_eq!(report.confirmed, vec![first.id]);
        assert_eq!(report.outcome, DrainOutcome::Offline);
        assert_eq!(report.remaining, 1);
        assert_eq!(orch.state().snapshot().phase(), crate::models::SyncPhase::Offline);
    }

    #[tokio::test]
    async fn test_concurrent_trigger_is_ignored() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let transport = FakeTransport {
            block: Some((entered.clone(), release.clone())),
            ..FakeTransport::default()
        };
        let orch = Arc::new(orchestrator(transport));
        orch.set_online(true);
        orch.enqueue(feeding(10)).unwrap();

        let first = tokio::spawn({
            let orch = orch.clone();
            async move { orch.trigger(SyncTrigger::Online).await }
        });
        entered.notified().await;
        assert!(orch.state().snapshot().is_syncing);

        let second = orch.trigger(SyncTrigger::Focus).await;
        assert_eq!(second, TriggerResult::Ignored(SkipReason::AlreadySyncing));

        release.notify_one();
        let report = drained(first.await.unwrap());
        assert_eq!(report.confirmed.len(), 1);
        assert_eq!(orch.transport.seen().len(), 1);
        assert!(!orch.state().snapshot().is_syncing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_timeout_is_transient() {
        let transport = FakeTransport {
            delay: Some(Duration::from_secs(60)),
            ..FakeTransport::default()
        };
        let orch = orchestrator(transport);
        orch.set_online(true);
        orch.enqueue(feeding(10)).unwrap();

        let report = drained(orch.trigger(SyncTrigger::Manual).await);
        assert!(matches!(report.outcome, DrainOutcome::Transient { ref message } if message.contains("timed out")));
        assert_eq!(report.remaining, 1);
    }

    #[tokio::test]
    async fn test_lease_held_by_other_instance() {
        let queue = Arc::new(MutationQueue::in_memory());
        let orch = SyncOrchestrator::new(
            queue.clone(),
            FakeTransport::default(),
            SyncStateHandle::default(),
            SyncConfig::default(),
        );
        orch.set_online(true);
        orch.enqueue(feeding(10)).unwrap();
        assert!(queue.try_acquire_lease("other-tab", Utc::now(), DEFAULT_LEASE_TTL).unwrap());

        let result = orch.trigger(SyncTrigger::Manual).await;
        assert_eq!(result, TriggerResult::Ignored(SkipReason::LeaseHeld));
        assert!(!orch.state().snapshot().is_syncing);
        assert!(orch.transport.seen().is_empty());

        queue.release_lease("other-tab").unwrap();
        let report = drained(orch.trigger(SyncTrigger::Manual).await);
        assert_eq!(report.remaining, 0);
        // Our lease is released after the pass.
        assert!(queue.try_acquire_lease("other-tab", Utc::now(), DEFAULT_LEASE_TTL).unwrap());
    }

    #[tokio::test]
    async fn test_run_processes_triggers_until_closed() {
        let orch = orchestrator(FakeTransport::default());
        orch.enqueue(feeding(10)).unwrap();
        orch.enqueue(feeding(20)).unwrap();

        let (tx, rx) = mpsc::channel(8);
        tx.send(SyncTrigger::Online).await.unwrap();
        drop(tx);
        orch.run(rx, Duration::from_secs(3600)).await;

        assert_eq!(orch.state().snapshot().pending_count, 0);
        assert_eq!(orch.transport.seen().len(), 2);
    }

    #[test]
    fn test_interpret_response() {
        let accepted = MutationResponse::Accepted {
            entity_id: "e1".to_string(),
            duplicate: true,
            rate_limit: None,
        };
        assert_eq!(interpret_response(accepted).unwrap().entity_id, "e1");

        let rejected = MutationResponse::rejected(RejectReason::Authorization, "viewer");
        assert_eq!(
            interpret_response(rejected),
            Err(SubmitError::Rejected {
                reason: RejectReason::Authorization,
                message: "viewer".to_string()
            })
        );

        let limited = MutationResponse::rejected(RejectReason::RateLimited, "slow down");
        assert_eq!(interpret_response(limited), Err(SubmitError::RateLimited { reset_at: None }));

        let unauth = MutationResponse::rejected(RejectReason::Unauthenticated, "no token");
        assert!(matches!(interpret_response(unauth), Err(SubmitError::Unauthenticated(_))));

        let viewer = MutationResponse::rejected(RejectReason::Scope, "Viewers cannot log entries");
        assert_eq!(
            interpret_response(viewer),
            Err(SubmitError::Forbidden("Viewers cannot log entries".to_string()))
        );
    }
}
