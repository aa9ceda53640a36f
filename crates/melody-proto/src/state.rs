use crate::protocol::{StatusResponse, TaskStatus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Observable state of the task currently being polled.
///
/// `rev` is a monotonically increasing counter incremented on every change.
/// Observers can use it to detect missed updates.  `status == None` means no
/// task is active.  `result` and `error` are mutually exclusive: every
/// update replaces the whole triple with what the backend reported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskSnapshot {
    pub rev: u64,
    pub task_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl TaskSnapshot {
    /// True once the snapshot describes a finished task.
    pub fn is_terminal(&self) -> bool {
        self.status.map(|s| s.is_terminal()).unwrap_or(false)
    }
}

/// Store for the snapshot, with generation tagging.
///
/// Each polling loop holds the generation token returned by `begin`.  Every
/// mutation re-checks the token under the write lock, so a response that
/// arrives after its loop was superseded or stopped is discarded instead of
/// clobbering the successor's state.
pub struct TaskState {
    state: Arc<RwLock<TaskSnapshot>>,
    generation: AtomicU64,
}

impl TaskState {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(TaskSnapshot::default())),
            generation: AtomicU64::new(0),
        }
    }

    pub async fn snapshot(&self) -> TaskSnapshot {
        self.state.read().await.clone()
    }

    /// True while `gen` is still the live generation.
    pub fn is_current(&self, gen: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == gen
    }

    /// Revoke the live generation without touching the snapshot.  Any write
    /// still in flight under the old token will be discarded.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Start tracking a new task: supersede the previous generation and reset
    /// the snapshot to `pending` with no result and no error.  Returns the
    /// token the new polling loop must present on every write.
    pub async fn begin(&self, task_id: &str) -> u64 {
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.state.write().await;
        *state = TaskSnapshot {
            rev: state.rev + 1,
            task_id: Some(task_id.to_string()),
            status: Some(TaskStatus::Pending),
            result: None,
            error: None,
        };
        gen
    }

    /// Replace the status/result/error triple with what the backend reported.
    /// Returns false when `gen` was superseded and the write was discarded.
    pub async fn apply(&self, gen: u64, resp: StatusResponse) -> bool {
        let mut state = self.state.write().await;
        if !self.is_current(gen) {
            debug!("[task] discarding stale status write (generation {} superseded)", gen);
            return false;
        }
        state.status = Some(resp.status);
        state.result = resp.result;
        state.error = resp.error;
        state.rev += 1;
        true
    }

    /// Mark the task failed with a client-side message (transport error,
    /// decode error).  Same staleness rule as `apply`.
    pub async fn fail(&self, gen: u64, message: impl Into<String>) -> bool {
        let mut state = self.state.write().await;
        if !self.is_current(gen) {
            debug!("[task] discarding stale failure write (generation {} superseded)", gen);
            return false;
        }
        state.status = Some(TaskStatus::Failed);
        state.result = None;
        state.error = Some(message.into());
        state.rev += 1;
        true
    }

    /// Forget the current task entirely (back to idle).  Also revokes the
    /// live generation so a straggler loop cannot resurrect the old task.
    pub async fn clear(&self) {
        self.invalidate();
        let mut state = self.state.write().await;
        let rev = state.rev + 1;
        *state = TaskSnapshot {
            rev,
            ..TaskSnapshot::default()
        };
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}
