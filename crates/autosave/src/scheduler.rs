/// Decides when editor content is written through the persistence sink.
///
/// One scheduler per document. Three timers feed `attempt_save`: the
/// debounce timer (reset on every edit), the backup interval and the retry
/// timer. At most one save is in flight; content that arrives meanwhile is
/// re-armed on the debounce timer and saved once the in-flight save resolves.
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use store::EngineConfig;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::{ContentLimits, ContentValidator, PersistenceSink, SaveError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum SavePhase {
    Idle,
    PendingDebounce,
    Saving,
    Retrying { attempt: u32 },
    /// Error streak active; automatic saves wait for new content
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    InFlight,
    Unchanged,
    Superseded,
    Halted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Nothing resolved yet
    Pending,
    Saved,
    SavedWithWarnings(Vec<String>),
    Skipped(SkipReason),
    Failed(SaveError),
}

/// Result of a scheduler call plus the retry bookkeeping behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveAttemptState {
    pub outcome: SaveOutcome,
    pub retry_count: u32,
    pub next_retry_in: Option<Duration>,
    pub last_error: Option<SaveError>,
    pub phase: SavePhase,
}

impl SaveAttemptState {
    pub fn is_saved(&self) -> bool {
        matches!(
            self.outcome,
            SaveOutcome::Saved | SaveOutcome::SavedWithWarnings(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveStatus {
    Saving,
    Saved,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveEvent {
    pub document_id: String,
    pub status: SaveStatus,
    pub manual: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub debounce: Duration,
    pub backup_interval: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub limits: ContentLimits,
}

impl SchedulerConfig {
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            debounce: config.debounce(),
            backup_interval: config.backup_interval(),
            max_retries: config.max_retries,
            backoff_base: config.backoff_base(),
            limits: ContentLimits::from_config(config),
        }
    }

    /// `backoff_base * 2^retries`
    pub fn backoff_delay(&self, retries: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(retries))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Auto,
    Interval,
    Retry,
    Manual,
}

/// A cancellable one-shot timer slot. The generation invalidates a timer
/// task that already woke up but has not claimed the slot yet.
#[derive(Default)]
struct Timer {
    generation: u64,
    handle: Option<JoinHandle<()>>,
    deadline: Option<Instant>,
}

impl Timer {
    fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    fn cancel(&mut self) {
        self.generation += 1;
        self.deadline = None;
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Called by the timer task once it fires; false if it was superseded.
    fn claim(&mut self, generation: u64) -> bool {
        if self.generation != generation {
            return false;
        }
        self.handle = None;
        self.deadline = None;
        true
    }
}

#[derive(Default)]
struct SchedulerState {
    last_saved: Option<String>,
    /// Most recent content handed to the scheduler
    latest: Option<String>,
    in_flight: Option<String>,
    /// Content of the current error streak
    failing: Option<String>,
    retries: u32,
    halted: bool,
    last_error: Option<SaveError>,
    last_outcome: Option<SaveOutcome>,
    debounce: Timer,
    retry: Timer,
    interval: Option<JoinHandle<()>>,
}

impl SchedulerState {
    fn phase(&self) -> SavePhase {
        if self.in_flight.is_some() {
            SavePhase::Saving
        } else if self.retry.is_armed() {
            SavePhase::Retrying {
                attempt: self.retries,
            }
        } else if self.debounce.is_armed() {
            SavePhase::PendingDebounce
        } else if self.halted {
            SavePhase::Halted
        } else {
            SavePhase::Idle
        }
    }

    fn snapshot(&self, outcome: SaveOutcome) -> SaveAttemptState {
        SaveAttemptState {
            outcome,
            retry_count: self.retries,
            next_retry_in: self
                .retry
                .deadline
                .map(|deadline| deadline.saturating_duration_since(Instant::now())),
            last_error: self.last_error.clone(),
            phase: self.phase(),
        }
    }
}

struct Inner {
    document_id: String,
    config: SchedulerConfig,
    validator: Arc<dyn ContentValidator>,
    sink: Arc<dyn PersistenceSink>,
    events: broadcast::Sender<SaveEvent>,
    state: Mutex<SchedulerState>,
}

/// Clears the in-flight marker if a save future is dropped mid-flight.
struct InFlightGuard<'a> {
    state: &'a Mutex<SchedulerState>,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().in_flight = None;
        }
    }
}

impl Inner {
    fn emit(&self, status: SaveStatus, manual: bool, error: Option<&SaveError>, warnings: Vec<String>) {
        let _ = self.events.send(SaveEvent {
            document_id: self.document_id.clone(),
            status,
            manual,
            error: error.map(ToString::to_string),
            warnings,
            at: Utc::now(),
        });
    }

    fn arm_debounce(self: &Arc<Self>, st: &mut SchedulerState, content: String) {
        st.debounce.cancel();
        let generation = st.debounce.generation;
        let delay = self.config.debounce;
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            if !inner.state.lock().debounce.claim(generation) {
                return;
            }
            inner.attempt(content, Trigger::Auto).await;
        });
        st.debounce.handle = Some(handle);
        st.debounce.deadline = Some(Instant::now() + delay);
    }

    fn arm_retry(self: &Arc<Self>, st: &mut SchedulerState, content: String, delay: Duration) {
        st.retry.cancel();
        let generation = st.retry.generation;
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            if !inner.state.lock().retry.claim(generation) {
                return;
            }
            inner.attempt(content, Trigger::Retry).await;
        });
        st.retry.handle = Some(handle);
        st.retry.deadline = Some(Instant::now() + delay);
    }

    async fn attempt(self: &Arc<Self>, content: String, trigger: Trigger) -> SaveAttemptState {
        let manual = trigger == Trigger::Manual;
        {
            let mut st = self.state.lock();
            if let Some(current) = st.in_flight.as_deref() {
                if trigger != Trigger::Retry && current != content {
                    st.latest = Some(content.clone());
                    self.arm_debounce(&mut st, content);
                }
                return st.snapshot(SaveOutcome::Skipped(SkipReason::InFlight));
            }

            match trigger {
                Trigger::Retry => {
                    if st.latest.as_deref() != Some(content.as_str())
                        || st.last_saved.as_deref() == Some(content.as_str())
                    {
                        tracing::debug!(document_id = %self.document_id, "stale retry dropped");
                        return st.snapshot(SaveOutcome::Skipped(SkipReason::Superseded));
                    }
                }
                Trigger::Auto | Trigger::Interval => {
                    st.latest = Some(content.clone());
                    if st.last_saved.as_deref() == Some(content.as_str()) {
                        return st.snapshot(SaveOutcome::Skipped(SkipReason::Unchanged));
                    }
                    if st.halted && st.failing.as_deref() == Some(content.as_str()) {
                        return st.snapshot(SaveOutcome::Skipped(SkipReason::Halted));
                    }
                }
                Trigger::Manual => st.latest = Some(content.clone()),
            }

            // new content starts a fresh error streak
            if st.failing.as_deref() != Some(content.as_str()) {
                st.retries = 0;
                st.halted = false;
            }
            st.in_flight = Some(content.clone());
        }

        let mut guard = InFlightGuard {
            state: &self.state,
            armed: true,
        };
        self.emit(SaveStatus::Saving, manual, None, Vec::new());

        let report = self.validator.validate(&content, &self.config.limits);
        let result = if report.is_valid {
            let to_save = report.content_or(&content);
            self.sink.save(&self.document_id, to_save).await
        } else {
            let first = report.first_error().unwrap_or("content rejected");
            Err(SaveError::Validation(first.to_string()))
        };

        let mut st = self.state.lock();
        st.in_flight = None;
        guard.armed = false;

        let outcome = match result {
            Ok(()) => {
                st.last_saved = Some(content);
                st.failing = None;
                st.retries = 0;
                st.halted = false;
                st.last_error = None;
                st.retry.cancel();
                tracing::debug!(document_id = %self.document_id, manual, "content saved");
                self.emit(SaveStatus::Saved, manual, None, report.warnings.clone());
                if report.warnings.is_empty() {
                    SaveOutcome::Saved
                } else {
                    SaveOutcome::SavedWithWarnings(report.warnings)
                }
            }
            Err(err) => {
                let attempts = st.retries + 1;
                st.failing = Some(content.clone());
                if !manual && err.is_retryable() && st.retries < self.config.max_retries {
                    let delay = self.config.backoff_delay(st.retries);
                    st.retries += 1;
                    st.last_error = Some(err.clone());
                    tracing::warn!(
                        document_id = %self.document_id,
                        attempt = st.retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "save failed, retry scheduled"
                    );
                    self.arm_retry(&mut st, content, delay);
                    SaveOutcome::Failed(err)
                } else {
                    let surfaced = match err {
                        SaveError::Validation(_) => err,
                        other => SaveError::Persistent {
                            attempts,
                            last: other.message().to_string(),
                        },
                    };
                    st.halted = true;
                    st.last_error = Some(surfaced.clone());
                    st.retry.cancel();
                    tracing::error!(document_id = %self.document_id, manual, error = %surfaced, "save failed");
                    self.emit(SaveStatus::Error, manual, Some(&surfaced), Vec::new());
                    SaveOutcome::Failed(surfaced)
                }
            }
        };
        st.last_outcome = Some(outcome.clone());
        st.snapshot(outcome)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        st.debounce.cancel();
        st.retry.cancel();
        if let Some(handle) = st.interval.take() {
            handle.abort();
        }
    }
}

/// Per-document save scheduler. Clones share one state; dropping the last
/// clone cancels every timer.
#[derive(Clone)]
pub struct SaveScheduler {
    inner: Arc<Inner>,
}

impl SaveScheduler {
    pub fn new(
        document_id: impl Into<String>,
        config: SchedulerConfig,
        validator: Arc<dyn ContentValidator>,
        sink: Arc<dyn PersistenceSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                document_id: document_id.into(),
                config,
                validator,
                sink,
                events,
                state: Mutex::new(SchedulerState::default()),
            }),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.inner.document_id
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SaveEvent> {
        self.inner.events.subscribe()
    }

    /// Seeds the last saved content, e.g. with the draft loaded from disk.
    pub fn set_baseline(&self, content: impl Into<String>) {
        let content = content.into();
        let mut st = self.inner.state.lock();
        st.latest = Some(content.clone());
        st.last_saved = Some(content);
    }

    pub fn last_saved_content(&self) -> Option<String> {
        self.inner.state.lock().last_saved.clone()
    }

    pub fn has_unsaved_changes(&self) -> bool {
        let st = self.inner.state.lock();
        st.latest.is_some() && st.latest != st.last_saved
    }

    /// Restarts the debounce timer with `content`; only the last call within
    /// the window is saved.
    pub fn schedule_debounced_save(&self, content: impl Into<String>) -> SaveAttemptState {
        let content = content.into();
        let mut st = self.inner.state.lock();
        st.latest = Some(content.clone());
        self.inner.arm_debounce(&mut st, content);
        st.snapshot(SaveOutcome::Pending)
    }

    /// Starts the backup timer. Each tick saves the latest content when it
    /// differs from the last save and no error streak is active. Calling it
    /// again while running is a no-op.
    pub fn schedule_interval_save(&self) -> SaveAttemptState {
        let mut st = self.inner.state.lock();
        if st.interval.is_none() {
            let period = self.inner.config.backup_interval;
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            st.interval = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(inner) = weak.upgrade() else { break };
                    let content = {
                        let st = inner.state.lock();
                        if st.halted || st.retries > 0 || st.in_flight.is_some() {
                            continue;
                        }
                        match &st.latest {
                            Some(latest) if st.last_saved.as_ref() != Some(latest) => latest.clone(),
                            _ => continue,
                        }
                    };
                    tracing::debug!(document_id = %inner.document_id, "backup interval save");
                    inner.attempt(content, Trigger::Interval).await;
                }
            }));
        }
        let outcome = st.last_outcome.clone().unwrap_or(SaveOutcome::Pending);
        st.snapshot(outcome)
    }

    /// Explicit save: cancels pending debounce and retry timers and saves
    /// immediately. Failures are surfaced, never retried.
    pub async fn force_save(&self, content: impl Into<String>) -> SaveAttemptState {
        {
            let mut st = self.inner.state.lock();
            st.debounce.cancel();
            st.retry.cancel();
        }
        self.inner.attempt(content.into(), Trigger::Manual).await
    }

    pub async fn attempt_save(&self, content: impl Into<String>, manual: bool) -> SaveAttemptState {
        let trigger = if manual { Trigger::Manual } else { Trigger::Auto };
        self.inner.attempt(content.into(), trigger).await
    }

    /// Drops any debounced or retrying save that has not started yet. The
    /// backup interval keeps running.
    pub fn cancel_pending(&self) {
        let mut st = self.inner.state.lock();
        st.debounce.cancel();
        st.retry.cancel();
    }

    /// Cancels the debounce, retry and backup timers.
    pub fn clear_auto_save(&self) {
        let mut st = self.inner.state.lock();
        st.debounce.cancel();
        st.retry.cancel();
        if let Some(handle) = st.interval.take() {
            handle.abort();
        }
        tracing::debug!(document_id = %self.inner.document_id, "auto-save timers cleared");
    }

    pub fn state(&self) -> SaveAttemptState {
        let st = self.inner.state.lock();
        let outcome = st.last_outcome.clone().unwrap_or(SaveOutcome::Pending);
        st.snapshot(outcome)
    }

    pub fn phase(&self) -> SavePhase {
        self.inner.state.lock().phase()
    }
}
