//! Per-run context: lifecycle state, shared state, and progress counters.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::condition::Predicate;
use crate::executor::{Outcome, StepFailure};

/// Run-scoped key-value state visible to every step of a run.
pub type SharedState = serde_json::Map<String, Value>;

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Running,
    Paused,
    WaitingForApproval,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Created => "created",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::WaitingForApproval => "waiting_for_approval",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time snapshot of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub plan_id: String,
    pub state: RunState,
    pub completed_steps: usize,
    pub total_steps: usize,
    /// Most recently started step that is still active.
    pub current_step: Option<String>,
    pub active_steps: Vec<String>,
    pub pending_approvals: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// The failing step and reason when the run failed.
    pub failure: Option<StepFailure>,
    /// A progress write to the plan store failed during the run.
    pub degraded: bool,
}

/// Mutable bookkeeping guarded by one lock.
#[derive(Debug, Default)]
struct Progress {
    completed: HashSet<String>,
    active: Vec<String>,
    pending_approvals: usize,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    failure: Option<StepFailure>,
    degraded: bool,
}

/// State of one in-flight plan execution.
///
/// Lifecycle transitions go through a `watch` channel so suspended units can
/// wait for `Running` without polling. The run's cancellation token is
/// threaded through every blocking wait.
pub struct RunContext {
    plan_id: String,
    total_steps: usize,
    created_at: DateTime<Utc>,
    state: watch::Sender<RunState>,
    cancel: CancellationToken,
    progress: Mutex<Progress>,
    shared: Mutex<SharedState>,
}

impl RunContext {
    pub fn new(plan_id: impl Into<String>, total_steps: usize) -> Self {
        let (state, _) = watch::channel(RunState::Created);
        Self {
            plan_id: plan_id.into(),
            total_steps,
            created_at: Utc::now(),
            state,
            cancel: CancellationToken::new(),
            progress: Mutex::new(Progress::default()),
            shared: Mutex::new(SharedState::new()),
        }
    }

    /// Seed the shared state before the run starts.
    pub fn with_initial_state(self, initial: SharedState) -> Self {
        *self.shared.lock() = initial;
        self
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes when the run is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// `Created` → `Running`. A run paused before it started stays paused.
    pub fn mark_running(&self) {
        let mut progress = self.progress.lock();
        progress.started_at = Some(Utc::now());
        self.state.send_if_modified(|state| {
            if *state == RunState::Created {
                *state = RunState::Running;
                true
            } else {
                false
            }
        });
    }

    /// Request a pause. Returns `false` once the run is terminal.
    pub fn pause(&self) -> bool {
        let _progress = self.progress.lock();
        let mut accepted = false;
        self.state.send_if_modified(|state| match *state {
            RunState::Created | RunState::Running | RunState::WaitingForApproval => {
                *state = RunState::Paused;
                accepted = true;
                true
            }
            RunState::Paused => {
                accepted = true;
                false
            }
            _ => false,
        });
        accepted
    }

    /// Resume a paused run. Returns `false` once the run is terminal.
    pub fn resume(&self) -> bool {
        let progress = self.progress.lock();
        let mut accepted = false;
        self.state.send_if_modified(|state| match *state {
            RunState::Paused => {
                *state = if progress.started_at.is_none() {
                    RunState::Created
                } else if progress.pending_approvals > 0 {
                    RunState::WaitingForApproval
                } else {
                    RunState::Running
                };
                accepted = true;
                true
            }
            RunState::Created | RunState::Running | RunState::WaitingForApproval => {
                accepted = true;
                false
            }
            _ => false,
        });
        accepted
    }

    /// Cancel the run and fire its token. Idempotent while the run drains;
    /// returns `false` once it has completed or failed.
    pub fn cancel(&self) -> bool {
        let _progress = self.progress.lock();
        let mut accepted = false;
        self.state.send_if_modified(|state| match *state {
            RunState::Completed | RunState::Failed => false,
            RunState::Cancelled => {
                accepted = true;
                false
            }
            _ => {
                *state = RunState::Cancelled;
                accepted = true;
                true
            }
        });
        if accepted {
            self.cancel.cancel();
        }
        accepted
    }

    /// Record the run's terminal outcome and return the terminal state.
    ///
    /// A run already cancelled stays `Cancelled` whatever the outcome.
    pub fn finish(&self, outcome: &Outcome) -> RunState {
        let mut progress = self.progress.lock();
        progress.ended_at = Some(Utc::now());
        progress.active.clear();
        if *self.state.borrow() == RunState::Cancelled {
            return RunState::Cancelled;
        }
        let terminal = match outcome {
            Outcome::Success => RunState::Completed,
            Outcome::Failure(failure) => {
                progress.failure = Some(failure.clone());
                RunState::Failed
            }
            Outcome::Cancelled => RunState::Cancelled,
        };
        self.state.send_replace(terminal);
        terminal
    }

    /// Wait while the run is paused.
    ///
    /// Returns `true` when the caller may start its next unit of work and
    /// `false` when the run was cancelled.
    pub async fn checkpoint(&self) -> bool {
        let mut rx = self.state.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let state = *rx.borrow_and_update();
            match state {
                RunState::Paused => {
                    debug!(plan_id = %self.plan_id, "Run paused, waiting for resume");
                }
                RunState::Cancelled => return false,
                _ => return true,
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    // ── Approvals ───────────────────────────────────────────────────────────

    /// A step started waiting on an approval ticket.
    pub fn approval_started(&self) {
        let mut progress = self.progress.lock();
        progress.pending_approvals += 1;
        self.state.send_if_modified(|state| {
            if *state == RunState::Running {
                *state = RunState::WaitingForApproval;
                true
            } else {
                false
            }
        });
    }

    /// A step's approval ticket resolved.
    pub fn approval_finished(&self) {
        let mut progress = self.progress.lock();
        progress.pending_approvals = progress.pending_approvals.saturating_sub(1);
        let pending = progress.pending_approvals;
        self.state.send_if_modified(|state| {
            if *state == RunState::WaitingForApproval && pending == 0 {
                *state = RunState::Running;
                true
            } else {
                false
            }
        });
    }

    // ── Progress ────────────────────────────────────────────────────────────

    pub fn step_started(&self, step_id: &str) {
        self.progress.lock().active.push(step_id.to_string());
    }

    pub fn step_finished(&self, step_id: &str) {
        let mut progress = self.progress.lock();
        if let Some(idx) = progress.active.iter().rposition(|s| s == step_id) {
            progress.active.remove(idx);
        }
    }

    /// Count a step as completed. Returns `true` the first time a step id is
    /// recorded; re-runs inside a loop are not counted again.
    pub fn record_completion(&self, step_id: &str) -> bool {
        self.progress.lock().completed.insert(step_id.to_string())
    }

    pub fn completed_steps(&self) -> usize {
        self.progress.lock().completed.len()
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Flag that a plan store write failed.
    pub fn mark_degraded(&self) {
        self.progress.lock().degraded = true;
    }

    pub fn is_degraded(&self) -> bool {
        self.progress.lock().degraded
    }

    // ── Shared state ────────────────────────────────────────────────────────

    /// Clone of the current shared state.
    pub fn snapshot(&self) -> SharedState {
        self.shared.lock().clone()
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.shared.lock().get(key).cloned()
    }

    pub fn set_value(&self, key: impl Into<String>, value: Value) {
        self.shared.lock().insert(key.into(), value);
    }

    /// Merge a step's output into shared state, last write wins per key.
    ///
    /// With `output_key`, the whole output is stored under that key.
    pub fn apply_output(&self, output_key: Option<&str>, output: SharedState) {
        let mut shared = self.shared.lock();
        match output_key {
            Some(key) => {
                shared.insert(key.to_string(), Value::Object(output));
            }
            None => shared.extend(output),
        }
    }

    /// Evaluate a predicate against the current shared state.
    pub fn evaluate(&self, predicate: &Predicate) -> bool {
        predicate.evaluate(&self.shared.lock())
    }

    /// Snapshot of state and counters.
    pub fn status(&self) -> RunStatus {
        let progress = self.progress.lock();
        RunStatus {
            plan_id: self.plan_id.clone(),
            state: self.state(),
            completed_steps: progress.completed.len().min(self.total_steps),
            total_steps: self.total_steps,
            current_step: progress.active.last().cloned(),
            active_steps: progress.active.clone(),
            pending_approvals: progress.pending_approvals,
            created_at: self.created_at,
            started_at: progress.started_at,
            ended_at: progress.ended_at,
            failure: progress.failure.clone(),
            degraded: progress.degraded,
        }
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("plan_id", &self.plan_id)
            .field("state", &self.state())
            .field("total_steps", &self.total_steps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::executor::FailureKind;
    use serde_json::json;

    #[test]
    fn test_lifecycle_transitions() {
        let run = RunContext::new("p", 2);
        assert_eq!(run.state(), RunState::Created);

        run.mark_running();
        assert_eq!(run.state(), RunState::Running);
        assert!(run.status().started_at.is_some());

        assert!(run.pause());
        assert_eq!(run.state(), RunState::Paused);
        // Pausing twice is accepted and changes nothing
        assert!(run.pause());

        assert!(run.resume());
        assert_eq!(run.state(), RunState::Running);

        run.finish(&Outcome::Success);
        assert_eq!(run.state(), RunState::Completed);
        assert!(!run.pause());
        assert!(!run.resume());
        assert!(!run.cancel());
    }

    #[test]
    fn test_cancel_fires_token() {
        let run = RunContext::new("p", 1);
        run.mark_running();
        assert!(run.cancel());
        assert!(run.is_cancelled());
        assert_eq!(run.state(), RunState::Cancelled);
        // Idempotent while draining
        assert!(run.cancel());
        assert!(!run.resume());
    }

    #[test]
    fn test_approval_state_tracking() {
        let run = RunContext::new("p", 1);
        run.mark_running();

        run.approval_started();
        assert_eq!(run.state(), RunState::WaitingForApproval);
        run.approval_started();
        run.approval_finished();
        // One ticket still open
        assert_eq!(run.state(), RunState::WaitingForApproval);
        run.approval_finished();
        assert_eq!(run.state(), RunState::Running);
    }

    #[test]
    fn test_pause_during_approval_stays_paused() {
        let run = RunContext::new("p", 1);
        run.mark_running();
        run.approval_started();
        assert!(run.pause());
        run.approval_finished();
        assert_eq!(run.state(), RunState::Paused);
        assert!(run.resume());
        assert_eq!(run.state(), RunState::Running);
    }

    #[test]
    fn test_resume_back_to_waiting_for_approval() {
        let run = RunContext::new("p", 1);
        run.mark_running();
        run.approval_started();
        run.pause();
        run.resume();
        assert_eq!(run.state(), RunState::WaitingForApproval);
        assert_eq!(run.status().pending_approvals, 1);
    }

    #[test]
    fn test_completion_counted_by_distinct_step() {
        let run = RunContext::new("p", 2);
        assert!(run.record_completion("a"));
        assert!(!run.record_completion("a"));
        assert!(run.record_completion("b"));
        let status = run.status();
        assert_eq!(status.completed_steps, 2);
        assert_eq!(status.total_steps, 2);
    }

    #[test]
    fn test_active_steps_and_current_step() {
        let run = RunContext::new("p", 3);
        run.step_started("a");
        run.step_started("b");
        assert_eq!(run.status().current_step.as_deref(), Some("b"));
        run.step_finished("b");
        assert_eq!(run.status().current_step.as_deref(), Some("a"));
        run.step_finished("a");
        assert!(run.status().active_steps.is_empty());
        assert!(run.status().current_step.is_none());
    }

    #[test]
    fn test_apply_output() {
        let run = RunContext::new("p", 1);
        let mut out = SharedState::new();
        out.insert("x".into(), json!(1));
        run.apply_output(None, out.clone());
        assert_eq!(run.get_value("x"), Some(json!(1)));

        run.apply_output(Some("result"), out);
        assert_eq!(run.get_value("result"), Some(json!({"x": 1})));

        let mut later = SharedState::new();
        later.insert("x".into(), json!(2));
        run.apply_output(None, later);
        assert_eq!(run.get_value("x"), Some(json!(2)));
    }

    #[test]
    fn test_evaluate_predicate() {
        let run = RunContext::new("p", 1);
        let p = Predicate::parse("done == true").unwrap();
        assert!(!run.evaluate(&p));
        run.set_value("done", json!(true));
        assert!(run.evaluate(&p));
    }

    #[test]
    fn test_finish_with_failure() {
        let run = RunContext::new("p", 1);
        run.mark_running();
        run.step_started("a");
        run.finish(&Outcome::Failure(StepFailure::new(
            "a",
            FailureKind::StepFailed,
            "boom",
        )));
        let status = run.status();
        assert_eq!(status.state, RunState::Failed);
        assert_eq!(status.failure.unwrap().step_id, "a");
        assert!(status.active_steps.is_empty());
        assert!(status.ended_at.is_some());
    }

    #[test]
    fn test_cancel_before_finish_stays_cancelled() {
        let run = RunContext::new("p", 1);
        run.mark_running();
        run.step_started("a");
        assert!(run.cancel());

        assert_eq!(run.finish(&Outcome::Success), RunState::Cancelled);
        assert_eq!(run.state(), RunState::Cancelled);

        let failure = StepFailure::new("a", FailureKind::StepFailed, "late");
        assert_eq!(run.finish(&Outcome::Failure(failure)), RunState::Cancelled);
        let status = run.status();
        assert_eq!(status.state, RunState::Cancelled);
        assert!(status.failure.is_none());
        assert!(status.active_steps.is_empty());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let run = RunContext::new("p", 1);
        let value = serde_json::to_value(run.status()).unwrap();
        assert_eq!(value["state"], json!("created"));
        assert_eq!(value["plan_id"], json!("p"));
    }

    #[tokio::test]
    async fn test_checkpoint_waits_for_resume() {
        let run = Arc::new(RunContext::new("p", 1));
        run.mark_running();
        run.pause();

        let waiter = {
            let run = run.clone();
            tokio::spawn(async move { run.checkpoint().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        run.resume();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_checkpoint_returns_false_on_cancel() {
        let run = Arc::new(RunContext::new("p", 1));
        run.mark_running();
        run.pause();

        let waiter = {
            let run = run.clone();
            tokio::spawn(async move { run.checkpoint().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        run.cancel();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_checkpoint_passes_when_running() {
        let run = RunContext::new("p", 1);
        run.mark_running();
        assert!(run.checkpoint().await);
    }
}
