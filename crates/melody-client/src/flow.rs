//! Upload-and-poll orchestration: image → prompt → audio.

use crate::api::ApiClient;
use crate::poller::{PollEvent, TaskPoller};
use anyhow::Context;
use melody_proto::config::PollingConfig;
use melody_proto::protocol::{decode_audio_payload, TaskResult, TaskStatus};
use melody_proto::state::TaskSnapshot;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

/// Drives the two sequential backend jobs through one shared poller.
///
/// Job 1 turns an image into a descriptive prompt; job 2 turns a (possibly
/// amended) prompt into an audio clip.  Which meaning a `complete` result
/// carries is decided here, by the job that is active; the poller itself
/// stays payload-agnostic.
pub struct SongFlow {
    client: Arc<ApiClient>,
    poller: TaskPoller,
}

impl SongFlow {
    pub fn new(client: Arc<ApiClient>, polling: &PollingConfig) -> Self {
        let poller = TaskPoller::new(Arc::clone(&client), polling);
        Self { client, poller }
    }

    /// Borrow the poller (status display, tests).
    pub fn poller(&self) -> &TaskPoller {
        &self.poller
    }

    /// Job 1: submit the image and poll until the backend has distilled it
    /// into a prompt.  A submission failure surfaces immediately: no task
    /// is created and no polling starts.
    pub async fn analyze_image(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> anyhow::Result<TaskResult> {
        let submitted = self
            .client
            .submit_image(file_name, bytes)
            .await
            .context("failed to start analysis")?;
        info!("[flow] analysis task {} submitted", submitted.task_id);

        let snap = self.run_to_terminal(&submitted.task_id).await?;
        let value = completed_result(snap)?;
        let prompt = value
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("analysis result is not text"))?;
        Ok(TaskResult::Text(prompt))
    }

    /// Job 2: submit the final prompt and poll until the clip is ready.
    pub async fn generate_music(&self, prompt: &str) -> anyhow::Result<TaskResult> {
        let submitted = self
            .client
            .submit_prompt(prompt)
            .await
            .context("failed to start music generation")?;
        info!("[flow] generation task {} submitted", submitted.task_id);

        let snap = self.run_to_terminal(&submitted.task_id).await?;
        let value = completed_result(snap)?;
        let payload = value
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("generation result is not an audio payload"))?;
        Ok(TaskResult::Audio(decode_audio_payload(payload)?))
    }

    /// Hand `task_id` to the poller and wait for the terminal snapshot.
    async fn run_to_terminal(&self, task_id: &str) -> anyhow::Result<TaskSnapshot> {
        let mut events = self.poller.subscribe();
        self.poller.start_polling(task_id).await?;

        loop {
            match events.recv().await {
                Ok(PollEvent::Finished(_)) => break,
                Ok(PollEvent::Updated) => {
                    let snap = self.poller.snapshot().await;
                    if let Some(status) = snap.status {
                        debug!("[flow] task {}: {}", task_id, status.label());
                    }
                }
                // Missed events are fine: the snapshot is authoritative.
                Err(RecvError::Lagged(_)) => {
                    if self.poller.snapshot().await.is_terminal() {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }

        Ok(self.poller.snapshot().await)
    }
}

/// Combine the analysis prompt with the user's extra instructions (the edit
/// step of the flow).
pub fn combine_prompt(prompt: &str, instructions: Option<&str>) -> String {
    match instructions {
        Some(extra) if !extra.trim().is_empty() => {
            format!("{} {}", prompt.trim(), extra.trim())
        }
        _ => prompt.trim().to_string(),
    }
}

/// Unpack a terminal snapshot into its `complete` result, or surface the
/// backend's failure message.
fn completed_result(snap: TaskSnapshot) -> anyhow::Result<serde_json::Value> {
    match snap.status {
        Some(TaskStatus::Complete) => snap
            .result
            .ok_or_else(|| anyhow::anyhow!("task completed without a result")),
        Some(TaskStatus::Failed) => Err(anyhow::anyhow!(snap
            .error
            .unwrap_or_else(|| "An unknown error occurred.".to_string()))),
        other => Err(anyhow::anyhow!(
            "polling ended before a terminal status (last: {:?})",
            other
        )),
    }
}
