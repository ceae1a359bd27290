//! Human approval gate.
//!
//! A step that requires approval opens a ticket keyed by `(plan_id, step_id)`
//! and blocks until a decision arrives, the timeout elapses, or the run is
//! cancelled. Each ticket owns a single-use `oneshot` channel; the ticket
//! table lock is only held to insert or remove an entry, never while waiting.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default time a ticket waits for a decision.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

const EVENT_CAPACITY: usize = 64;

/// Status of an approval ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    TimedOut,
    /// The run was cancelled while waiting, or the ticket could not be opened.
    Errored,
}

impl ApprovalStatus {
    pub fn is_approved(self) -> bool {
        self == ApprovalStatus::Approved
    }
}

/// A pending human decision blocking one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalTicket {
    pub plan_id: String,
    pub step_id: String,
    /// Text shown to the approver.
    pub description: String,
    /// Extra context for the approver (capability, params, ...).
    pub context: Value,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Notification stream for approval channels.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalEvent {
    /// A ticket was opened and is waiting for `decide`.
    Requested(ApprovalTicket),
    /// A ticket reached a terminal status and was removed.
    Resolved {
        plan_id: String,
        step_id: String,
        status: ApprovalStatus,
    },
}

type TicketKey = (String, String);

struct OpenTicket {
    id: Uuid,
    ticket: ApprovalTicket,
    decision: oneshot::Sender<bool>,
}

/// Bridges asynchronous human decisions into step execution.
pub struct ApprovalGate {
    tickets: Mutex<HashMap<TicketKey, OpenTicket>>,
    timeout: Duration,
    events: broadcast::Sender<ApprovalEvent>,
}

impl ApprovalGate {
    pub fn new(timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tickets: Mutex::new(HashMap::new()),
            timeout,
            events,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open a ticket and wait for its resolution.
    ///
    /// Returns `Approved` or `Denied` when `decide` is called, `TimedOut` when
    /// no decision arrives in time, and `Errored` when `cancel` fires or a
    /// ticket for the same key is already pending. The ticket is removed
    /// before this returns.
    pub async fn request_approval(
        &self,
        plan_id: &str,
        step_id: &str,
        description: &str,
        context: Value,
        cancel: &CancellationToken,
    ) -> ApprovalStatus {
        let key = (plan_id.to_string(), step_id.to_string());
        let id = Uuid::new_v4();
        let (tx, mut rx) = oneshot::channel();

        let requested_at = Utc::now();
        let expires_at = chrono::Duration::from_std(self.timeout)
            .ok()
            .and_then(|d| requested_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let ticket = ApprovalTicket {
            plan_id: plan_id.to_string(),
            step_id: step_id.to_string(),
            description: description.to_string(),
            context,
            status: ApprovalStatus::Pending,
            requested_at,
            expires_at,
        };

        {
            let mut tickets = self.tickets.lock();
            if tickets.contains_key(&key) {
                warn!(plan_id, step_id, "Approval already pending for this step");
                return ApprovalStatus::Errored;
            }
            tickets.insert(
                key.clone(),
                OpenTicket {
                    id,
                    ticket: ticket.clone(),
                    decision: tx,
                },
            );
        }

        info!(plan_id, step_id, timeout_secs = self.timeout.as_secs(), "Approval requested");
        let _ = self.events.send(ApprovalEvent::Requested(ticket));

        let guard = TicketGuard {
            gate: self,
            key: &key,
            id,
        };

        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => ApprovalStatus::Errored,
            res = tokio::time::timeout(self.timeout, &mut rx) => match res {
                Ok(Ok(true)) => ApprovalStatus::Approved,
                Ok(Ok(false)) => ApprovalStatus::Denied,
                Ok(Err(_)) => ApprovalStatus::Errored,
                Err(_) => ApprovalStatus::TimedOut,
            },
        };

        // Whoever removes the ticket first settles it. If `decide` got there
        // before the timeout or cancel path, its decision is already in `rx`.
        let status = if guard.remove() {
            waited
        } else {
            match rx.try_recv() {
                Ok(true) => ApprovalStatus::Approved,
                Ok(false) => ApprovalStatus::Denied,
                Err(_) => waited,
            }
        };

        match status {
            ApprovalStatus::Approved | ApprovalStatus::Denied => {
                info!(plan_id, step_id, status = ?status, "Approval decided")
            }
            _ => warn!(plan_id, step_id, status = ?status, "Approval not granted"),
        }
        let _ = self.events.send(ApprovalEvent::Resolved {
            plan_id: plan_id.to_string(),
            step_id: step_id.to_string(),
            status,
        });

        status
    }

    /// Boolean form of [`request_approval`](Self::request_approval).
    pub async fn request(
        &self,
        plan_id: &str,
        step_id: &str,
        description: &str,
        context: Value,
        cancel: &CancellationToken,
    ) -> bool {
        self.request_approval(plan_id, step_id, description, context, cancel)
            .await
            .is_approved()
    }

    /// Resolve a pending ticket.
    ///
    /// Returns `false` when no ticket is pending for the key, for example
    /// after a timeout or a previous decision.
    pub fn decide(&self, plan_id: &str, step_id: &str, approved: bool) -> bool {
        let key = (plan_id.to_string(), step_id.to_string());
        let Some(open) = self.tickets.lock().remove(&key) else {
            debug!(plan_id, step_id, "No pending approval to decide");
            return false;
        };
        open.decision.send(approved).is_ok()
    }

    /// All open tickets.
    pub fn pending(&self) -> Vec<ApprovalTicket> {
        let mut tickets: Vec<_> = self
            .tickets
            .lock()
            .values()
            .map(|t| t.ticket.clone())
            .collect();
        tickets.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        tickets
    }

    /// Open tickets for one plan.
    pub fn pending_for(&self, plan_id: &str) -> Vec<ApprovalTicket> {
        self.pending()
            .into_iter()
            .filter(|t| t.plan_id == plan_id)
            .collect()
    }

    pub fn get(&self, plan_id: &str, step_id: &str) -> Option<ApprovalTicket> {
        self.tickets
            .lock()
            .get(&(plan_id.to_string(), step_id.to_string()))
            .map(|t| t.ticket.clone())
    }

    /// Subscribe to ticket events.
    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalEvent> {
        self.events.subscribe()
    }
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new(DEFAULT_APPROVAL_TIMEOUT)
    }
}

/// Removes a ticket on every exit path, including a dropped request future.
struct TicketGuard<'a> {
    gate: &'a ApprovalGate,
    key: &'a TicketKey,
    id: Uuid,
}

impl TicketGuard<'_> {
    /// Remove the ticket if it is still ours. Returns `true` if it was.
    fn remove(&self) -> bool {
        let mut tickets = self.gate.tickets.lock();
        if tickets.get(self.key).is_some_and(|t| t.id == self.id) {
            tickets.remove(self.key);
            true
        } else {
            false
        }
    }
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use serde_json::json;

    async fn wait_for_ticket(gate: &ApprovalGate, plan_id: &str, step_id: &str) {
        while gate.get(plan_id, step_id).is_none() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_approve() {
        let gate = Arc::new(ApprovalGate::default());
        let cancel = CancellationToken::new();

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                gate.request_approval("p", "s", "deploy?", json!({}), &cancel)
                    .await
            })
        };

        wait_for_ticket(&gate, "p", "s").await;
        assert_eq!(gate.pending().len(), 1);
        assert!(gate.decide("p", "s", true));

        assert_eq!(waiter.await.unwrap(), ApprovalStatus::Approved);
        assert!(gate.get("p", "s").is_none());
        // Single use
        assert!(!gate.decide("p", "s", true));
    }

    #[tokio::test]
    async fn test_deny() {
        let gate = Arc::new(ApprovalGate::default());
        let cancel = CancellationToken::new();

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.request("p", "s", "", json!(null), &cancel).await })
        };

        wait_for_ticket(&gate, "p", "s").await;
        assert!(gate.decide("p", "s", false));
        assert!(!waiter.await.unwrap());
        assert!(gate.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_five_minutes() {
        let gate = ApprovalGate::default();
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();

        let status = gate
            .request_approval("p", "s", "", json!({}), &cancel)
            .await;

        assert_eq!(status, ApprovalStatus::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(300));
        assert!(gate.get("p", "s").is_none());
        assert!(!gate.decide("p", "s", true));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let gate = Arc::new(ApprovalGate::default());
        let cancel = CancellationToken::new();

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                gate.request_approval("p", "s", "", json!({}), &cancel)
                    .await
            })
        };

        wait_for_ticket(&gate, "p", "s").await;
        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), ApprovalStatus::Errored);
        assert!(gate.pending().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_request_errors() {
        let gate = Arc::new(ApprovalGate::default());
        let cancel = CancellationToken::new();

        let first = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                gate.request_approval("p", "s", "", json!({}), &cancel)
                    .await
            })
        };
        wait_for_ticket(&gate, "p", "s").await;

        let second = gate
            .request_approval("p", "s", "", json!({}), &cancel)
            .await;
        assert_eq!(second, ApprovalStatus::Errored);
        // The original ticket is untouched
        assert!(gate.get("p", "s").is_some());

        assert!(gate.decide("p", "s", true));
        assert_eq!(first.await.unwrap(), ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn test_decide_unknown_ticket() {
        let gate = ApprovalGate::default();
        assert!(!gate.decide("nope", "nope", true));
    }

    #[tokio::test]
    async fn test_tickets_are_independent() {
        let gate = Arc::new(ApprovalGate::default());
        let cancel = CancellationToken::new();

        let mut waiters = Vec::new();
        for (plan, step) in [("p1", "a"), ("p1", "b"), ("p2", "a")] {
            let gate = gate.clone();
            let cancel = cancel.clone();
            waiters.push(tokio::spawn(async move {
                gate.request_approval(plan, step, "", json!({}), &cancel)
                    .await
            }));
        }
        wait_for_ticket(&gate, "p1", "a").await;
        wait_for_ticket(&gate, "p1", "b").await;
        wait_for_ticket(&gate, "p2", "a").await;

        assert_eq!(gate.pending_for("p1").len(), 2);
        assert_eq!(gate.pending_for("p2").len(), 1);

        assert!(gate.decide("p1", "b", false));
        assert!(gate.decide("p2", "a", true));
        assert!(gate.decide("p1", "a", true));

        let results: Vec<_> = futures::future::join_all(waiters)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(
            results,
            vec![
                ApprovalStatus::Approved,
                ApprovalStatus::Denied,
                ApprovalStatus::Approved
            ]
        );
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let gate = Arc::new(ApprovalGate::default());
        let mut events = gate.subscribe();
        let cancel = CancellationToken::new();

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                gate.request_approval("p", "s", "ship it?", json!({"capability": "deploy"}), &cancel)
                    .await
            })
        };

        let ApprovalEvent::Requested(ticket) = events.recv().await.unwrap() else {
            panic!("expected Requested event");
        };
        assert_eq!(ticket.description, "ship it?");
        assert_eq!(ticket.status, ApprovalStatus::Pending);
        assert_eq!(ticket.context["capability"], json!("deploy"));

        gate.decide("p", "s", true);
        waiter.await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            ApprovalEvent::Resolved {
                plan_id: "p".into(),
                step_id: "s".into(),
                status: ApprovalStatus::Approved,
            }
        );
    }

    #[tokio::test]
    async fn test_dropped_request_removes_ticket() {
        let gate = Arc::new(ApprovalGate::default());
        let cancel = CancellationToken::new();

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                gate.request_approval("p", "s", "", json!({}), &cancel)
                    .await
            })
        };
        wait_for_ticket(&gate, "p", "s").await;
        waiter.abort();
        let _ = waiter.await;

        assert!(gate.get("p", "s").is_none());
    }
}
