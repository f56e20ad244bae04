//! Human approvals that suspend a run until a decision arrives.
//!
//! Each request is keyed by `(run_id, step_name)` and moves from `Pending` to
//! exactly one terminal state: `Resolved(decision)` or `TimedOut`. A second
//! resolution is rejected with [`ApprovalError::AlreadyResolved`]; it never
//! overwrites the first decision.
//!
//! Waiting comes in two flavours over the same registry:
//! [`ApprovalRegistry::await_decision`] parks the calling thread (interactive
//! runs), [`ApprovalRegistry::await_decision_async`] is a future the daemon
//! can await without blocking other runs.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Decision string recorded when nobody answered in time.
pub const TIMED_OUT: &str = "timed_out";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" | "approved" => Ok(Self::Approve),
            "reject" | "rejected" => Ok(Self::Reject),
            other => Err(anyhow::anyhow!(
                "unknown decision '{other}' (expected approve|reject)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApprovalKey {
    pub run_id: String,
    pub step_name: String,
}

impl ApprovalKey {
    pub fn new(run_id: impl Into<String>, step_name: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            step_name: step_name.into(),
        }
    }
}

impl fmt::Display for ApprovalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.run_id, self.step_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApprovalError {
    #[error("no approval request for {0}")]
    NotFound(ApprovalKey),
    #[error("approval {0} was already resolved")]
    AlreadyResolved(ApprovalKey),
    #[error("approval {key} timed out after {timeout:?}")]
    Timeout { key: ApprovalKey, timeout: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "decision", rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Resolved(Decision),
    TimedOut,
}

/// Returned by [`ApprovalRegistry::request`]; pass it to the await methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalHandle {
    pub key: ApprovalKey,
}

/// A request awaiting a decision, for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub run_id: String,
    pub step_name: String,
    pub prompt: String,
    pub requested_at: DateTime<Utc>,
}

struct Entry {
    prompt: String,
    requested_at: DateTime<Utc>,
    state: watch::Sender<ApprovalState>,
}

impl Entry {
    fn current(&self) -> ApprovalState {
        *self.state.borrow()
    }
}

#[derive(Default)]
pub struct ApprovalRegistry {
    entries: Mutex<HashMap<ApprovalKey, Entry>>,
    changed: Condvar,
}

impl ApprovalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ApprovalKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a request. Re-requesting a pending key returns the same request;
    /// re-requesting a finished key starts a fresh one.
    pub fn request(&self, run_id: &str, step_name: &str, prompt: &str) -> ApprovalHandle {
        self.open_request(run_id, step_name, prompt).0
    }

    /// Like [`request`](Self::request), also reporting whether this call
    /// opened the request (`false` when it joined one already pending).
    pub fn open_request(&self, run_id: &str, step_name: &str, prompt: &str) -> (ApprovalHandle, bool) {
        let key = ApprovalKey::new(run_id, step_name);
        let mut entries = self.lock();
        let reuse = entries
            .get(&key)
            .is_some_and(|entry| entry.current() == ApprovalState::Pending);
        if !reuse {
            let (state, _) = watch::channel(ApprovalState::Pending);
            entries.insert(
                key.clone(),
                Entry {
                    prompt: prompt.to_string(),
                    requested_at: Utc::now(),
                    state,
                },
            );
            info!(approval = %key, "approval requested");
        }
        (ApprovalHandle { key }, !reuse)
    }

    /// Record the decision for a pending request.
    pub fn resolve(&self, run_id: &str, step_name: &str, decision: Decision) -> Result<(), ApprovalError> {
        let key = ApprovalKey::new(run_id, step_name);
        let entries = self.lock();
        let entry = entries
            .get(&key)
            .ok_or_else(|| ApprovalError::NotFound(key.clone()))?;
        if entry.current() != ApprovalState::Pending {
            warn!(approval = %key, "ignoring second resolution");
            return Err(ApprovalError::AlreadyResolved(key));
        }
        entry.state.send_replace(ApprovalState::Resolved(decision));
        self.changed.notify_all();
        info!(approval = %key, decision = decision.as_str(), "approval resolved");
        Ok(())
    }

    pub fn state(&self, run_id: &str, step_name: &str) -> Option<ApprovalState> {
        self.lock()
            .get(&ApprovalKey::new(run_id, step_name))
            .map(Entry::current)
    }

    /// Handle for an existing request in any state.
    pub fn handle(&self, run_id: &str, step_name: &str) -> Option<ApprovalHandle> {
        let key = ApprovalKey::new(run_id, step_name);
        self.lock()
            .contains_key(&key)
            .then_some(ApprovalHandle { key })
    }

    /// Wait up to `within` for the request to leave `Pending` and return its
    /// state. Unlike the await methods this never times the request out.
    pub async fn watch_state(
        &self,
        handle: &ApprovalHandle,
        within: Duration,
    ) -> Result<ApprovalState, ApprovalError> {
        let mut rx = {
            let entries = self.lock();
            entries
                .get(&handle.key)
                .ok_or_else(|| ApprovalError::NotFound(handle.key.clone()))?
                .state
                .subscribe()
        };
        let _ = tokio::time::timeout(
            within,
            rx.wait_for(|state| *state != ApprovalState::Pending),
        )
        .await;
        let state = *rx.borrow();
        Ok(state)
    }

    /// Pending requests ordered by request time.
    pub fn pending(&self) -> Vec<PendingApproval> {
        let entries = self.lock();
        let mut pending: Vec<PendingApproval> = entries
            .iter()
            .filter(|(_, entry)| entry.current() == ApprovalState::Pending)
            .map(|(key, entry)| PendingApproval {
                run_id: key.run_id.clone(),
                step_name: key.step_name.clone(),
                prompt: entry.prompt.clone(),
                requested_at: entry.requested_at,
            })
            .collect();
        pending.sort_by(|a, b| {
            (a.requested_at, &a.run_id, &a.step_name).cmp(&(b.requested_at, &b.run_id, &b.step_name))
        });
        pending
    }

    /// Drop every request of a finished run. Returns how many were removed.
    pub fn forget_run(&self, run_id: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, _| key.run_id != run_id);
        before - entries.len()
    }

    /// Block the calling thread until the request is decided or `timeout` passes.
    pub fn await_decision(&self, handle: &ApprovalHandle, timeout: Duration) -> Result<Decision, ApprovalError> {
        let deadline = Instant::now() + timeout;
        let mut entries = self.lock();
        loop {
            let entry = entries
                .get(&handle.key)
                .ok_or_else(|| ApprovalError::NotFound(handle.key.clone()))?;
            match entry.current() {
                ApprovalState::Resolved(decision) => return Ok(decision),
                ApprovalState::TimedOut => {
                    return Err(ApprovalError::Timeout {
                        key: handle.key.clone(),
                        timeout,
                    });
                }
                ApprovalState::Pending => {}
            }
            let now = Instant::now();
            if now >= deadline {
                entry.state.send_replace(ApprovalState::TimedOut);
                self.changed.notify_all();
                warn!(approval = %handle.key, "approval timed out");
                return Err(ApprovalError::Timeout {
                    key: handle.key.clone(),
                    timeout,
                });
            }
            debug!(approval = %handle.key, "waiting for approval");
            entries = self
                .changed
                .wait_timeout(entries, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Await the decision without blocking the executor thread.
    pub async fn await_decision_async(
        &self,
        handle: &ApprovalHandle,
        timeout: Duration,
    ) -> Result<Decision, ApprovalError> {
        let mut rx = {
            let entries = self.lock();
            entries
                .get(&handle.key)
                .ok_or_else(|| ApprovalError::NotFound(handle.key.clone()))?
                .state
                .subscribe()
        };

        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| *state != ApprovalState::Pending),
        )
        .await;
        match waited {
            Ok(Ok(state)) => match *state {
                ApprovalState::Resolved(decision) => Ok(decision),
                _ => Err(ApprovalError::Timeout {
                    key: handle.key.clone(),
                    timeout,
                }),
            },
            // The sender only disappears when the run was forgotten.
            Ok(Err(_)) => Err(ApprovalError::NotFound(handle.key.clone())),
            Err(_) => self.expire(handle, timeout),
        }
    }

    /// Time out a request that is still pending. A decision that raced in
    /// first wins.
    fn expire(&self, handle: &ApprovalHandle, timeout: Duration) -> Result<Decision, ApprovalError> {
        let entries = self.lock();
        let entry = entries
            .get(&handle.key)
            .ok_or_else(|| ApprovalError::NotFound(handle.key.clone()))?;
        match entry.current() {
            ApprovalState::Resolved(decision) => Ok(decision),
            ApprovalState::Pending => {
                entry.state.send_replace(ApprovalState::TimedOut);
                self.changed.notify_all();
                warn!(approval = %handle.key, "approval timed out");
                Err(ApprovalError::Timeout {
                    key: handle.key.clone(),
                    timeout,
                })
            }
            ApprovalState::TimedOut => Err(ApprovalError::Timeout {
                key: handle.key.clone(),
                timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn blocked_waiter_receives_decision_once() {
        let registry = Arc::new(ApprovalRegistry::new());
        let handle = registry.request("r1", "deploy", "ok?");

        let waiter = {
            let registry = Arc::clone(&registry);
            let handle = handle.clone();
            thread::spawn(move || registry.await_decision(&handle, Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        registry
            .resolve("r1", "deploy", Decision::Approve)
            .expect("resolve");

        assert_eq!(waiter.join().expect("join"), Ok(Decision::Approve));
        assert_eq!(
            registry.resolve("r1", "deploy", Decision::Reject),
            Err(ApprovalError::AlreadyResolved(ApprovalKey::new("r1", "deploy")))
        );
        assert_eq!(
            registry.state("r1", "deploy"),
            Some(ApprovalState::Resolved(Decision::Approve))
        );
    }

    #[test]
    fn resolve_unknown_is_not_found() {
        let registry = ApprovalRegistry::new();
        assert!(matches!(
            registry.resolve("r1", "nope", Decision::Approve),
            Err(ApprovalError::NotFound(_))
        ));
    }

    #[test]
    fn timeout_is_distinct_from_rejection_and_terminal() {
        let registry = ApprovalRegistry::new();
        let handle = registry.request("r1", "deploy", "ok?");
        let err = registry
            .await_decision(&handle, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, ApprovalError::Timeout { .. }));
        assert_eq!(registry.state("r1", "deploy"), Some(ApprovalState::TimedOut));
        assert!(matches!(
            registry.resolve("r1", "deploy", Decision::Approve),
            Err(ApprovalError::AlreadyResolved(_))
        ));
        assert!(registry.pending().is_empty());
    }

    #[test]
    fn pending_lists_open_requests_and_rerequest_reuses() {
        let registry = ApprovalRegistry::new();
        let first = registry.request("r1", "deploy", "ok?");
        let again = registry.request("r1", "deploy", "ok?");
        registry.request("r2", "publish", "ship?");
        assert_eq!(first, again);
        let pending = registry.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(registry.forget_run("r1"), 1);
        assert_eq!(registry.pending().len(), 1);
    }

    #[test]
    fn only_the_first_request_opens_a_pending_key() {
        let registry = ApprovalRegistry::new();
        let (first, opened) = registry.open_request("r1", "deploy", "ok?");
        assert!(opened);
        let (joined, opened) = registry.open_request("r1", "deploy", "ok?");
        assert!(!opened);
        assert_eq!(first, joined);

        registry.resolve("r1", "deploy", Decision::Reject).expect("resolve");
        let (_, opened) = registry.open_request("r1", "deploy", "ok?");
        assert!(opened);
        assert_eq!(registry.state("r1", "deploy"), Some(ApprovalState::Pending));
    }

    #[tokio::test]
    async fn async_waiter_resolves_without_blocking() {
        let registry = Arc::new(ApprovalRegistry::new());
        let handle = registry.request("r1", "deploy", "ok?");
        let waiter = {
            let registry = Arc::clone(&registry);
            let handle = handle.clone();
            tokio::spawn(async move {
                registry
                    .await_decision_async(&handle, Duration::from_secs(10))
                    .await
            })
        };
        tokio::task::yield_now().await;
        registry
            .resolve("r1", "deploy", Decision::Reject)
            .expect("resolve");
        assert_eq!(waiter.await.expect("join"), Ok(Decision::Reject));
    }

    #[tokio::test]
    async fn async_waiter_times_out() {
        let registry = ApprovalRegistry::new();
        let handle = registry.request("r1", "deploy", "ok?");
        let result = registry
            .await_decision_async(&handle, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(ApprovalError::Timeout { .. })));
        assert_eq!(registry.state("r1", "deploy"), Some(ApprovalState::TimedOut));
    }

    #[tokio::test]
    async fn watching_does_not_expire_the_request() {
        let registry = ApprovalRegistry::new();
        registry.request("r1", "deploy", "ok?");
        let handle = registry.handle("r1", "deploy").expect("handle");
        let state = registry
            .watch_state(&handle, Duration::from_millis(10))
            .await
            .expect("watch");
        assert_eq!(state, ApprovalState::Pending);
        registry
            .resolve("r1", "deploy", Decision::Approve)
            .expect("resolve");
        let state = registry
            .watch_state(&handle, Duration::from_secs(1))
            .await
            .expect("watch");
        assert_eq!(state, ApprovalState::Resolved(Decision::Approve));
        assert!(registry.handle("r2", "deploy").is_none());
    }
}
