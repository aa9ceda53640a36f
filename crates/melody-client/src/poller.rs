//! Polling state machine for one long-running backend task.
//!
//! A `TaskPoller` owns at most one polling loop at a time.  `start_polling`
//! supersedes whatever was running before: the previous loop task is aborted
//! and its generation token revoked, so even a response already on the wire
//! cannot write into the new task's state.  The loop terminates itself on
//! the first terminal status; `stop_polling` is the caller-side cancel.

use crate::api::ApiClient;
use melody_proto::config::PollingConfig;
use melody_proto::protocol::TaskStatus;
use melody_proto::state::{TaskSnapshot, TaskState};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Fallback shown when a transport error carries no message of its own.
const POLL_ERROR_FALLBACK: &str = "Failed to get task status";

/// Notifications from the polling loop.  Receivers fetch the actual data
/// from `TaskPoller::snapshot`.
#[derive(Debug, Clone)]
pub enum PollEvent {
    /// The snapshot changed.
    Updated,
    /// The loop reached a terminal status and stopped itself.
    Finished(TaskStatus),
}

pub struct TaskPoller {
    client: Arc<ApiClient>,
    interval: Duration,
    max_transient_retries: u32,
    state: Arc<TaskState>,
    events_tx: broadcast::Sender<PollEvent>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskPoller {
    pub fn new(client: Arc<ApiClient>, polling: &PollingConfig) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            client,
            interval: polling.interval(),
            max_transient_retries: polling.max_transient_retries,
            state: Arc::new(TaskState::new()),
            events_tx,
            loop_handle: Mutex::new(None),
        }
    }

    /// Current observable state.  Never blocks on the polling loop.
    pub async fn snapshot(&self) -> TaskSnapshot {
        self.state.snapshot().await
    }

    /// Subscribe to change notifications.  Subscribe before `start_polling`
    /// to observe every update of the coming task.
    pub fn subscribe(&self) -> broadcast::Receiver<PollEvent> {
        self.events_tx.subscribe()
    }

    /// Start polling `task_id`, superseding whatever was polled before.
    ///
    /// The previous loop (if any) is cancelled unconditionally, the snapshot
    /// resets to `pending` with no result and no error, and one status query
    /// is issued per interval until a terminal status arrives or the caller
    /// stops the poller.  Returns as soon as the loop is spawned.
    pub async fn start_polling(&self, task_id: &str) -> anyhow::Result<()> {
        if task_id.trim().is_empty() {
            anyhow::bail!("task id must not be empty");
        }

        self.abort_loop();
        let gen = self.state.begin(task_id).await;
        let _ = self.events_tx.send(PollEvent::Updated);

        debug!("[poll] generation {} starts for task {}", gen, task_id);

        let client = Arc::clone(&self.client);
        let state = Arc::clone(&self.state);
        let events_tx = self.events_tx.clone();
        let interval = self.interval;
        let retry_budget = self.max_transient_retries;
        let task_id = task_id.to_string();

        let handle = tokio::spawn(async move {
            poll_loop(client, state, events_tx, interval, retry_budget, gen, task_id).await;
        });
        self.store_handle(Some(handle));
        Ok(())
    }

    /// Stop polling.  Idempotent: safe when nothing is running, safe to call
    /// repeatedly.  The live generation is revoked first, so a response
    /// already in flight is discarded instead of applied late.
    pub fn stop_polling(&self) {
        self.state.invalidate();
        self.abort_loop();
    }

    /// Stop polling and forget the task entirely (snapshot back to idle).
    pub async fn reset(&self) {
        self.abort_loop();
        self.state.clear().await;
        let _ = self.events_tx.send(PollEvent::Updated);
    }

    fn abort_loop(&self) {
        if let Some(handle) = self.store_handle(None) {
            handle.abort();
        }
    }

    fn store_handle(&self, handle: Option<JoinHandle<()>>) -> Option<JoinHandle<()>> {
        let mut slot = self
            .loop_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *slot, handle)
    }
}

impl Drop for TaskPoller {
    // The owner may forget to stop; the loop must not outlive the poller.
    fn drop(&mut self) {
        self.state.invalidate();
        self.abort_loop();
    }
}

async fn poll_loop(
    client: Arc<ApiClient>,
    state: Arc<TaskState>,
    events_tx: broadcast::Sender<PollEvent>,
    interval: Duration,
    retry_budget: u32,
    gen: u64,
    task_id: String,
) {
    let mut transient_failures: u32 = 0;

    loop {
        tokio::time::sleep(interval).await;
        if !state.is_current(gen) {
            return;
        }

        match client.task_status(&task_id).await {
            Ok(resp) => {
                transient_failures = 0;
                let status = resp.status;
                if !state.apply(gen, resp).await {
                    // superseded while the request was in flight
                    return;
                }
                let _ = events_tx.send(PollEvent::Updated);
                if status.is_terminal() {
                    debug!("[poll] task {} finished: {}", task_id, status.label());
                    let _ = events_tx.send(PollEvent::Finished(status));
                    return;
                }
            }
            Err(e) => {
                transient_failures += 1;
                if transient_failures <= retry_budget {
                    warn!(
                        "[poll] task {}: transient failure {}/{}: {}",
                        task_id, transient_failures, retry_budget, e
                    );
                    continue;
                }
                let mut message = e.to_string();
                if message.trim().is_empty() {
                    message = POLL_ERROR_FALLBACK.to_string();
                }
                if state.fail(gen, message).await {
                    let _ = events_tx.send(PollEvent::Updated);
                    let _ = events_tx.send(PollEvent::Finished(TaskStatus::Failed));
                }
                return;
            }
        }
    }
}
