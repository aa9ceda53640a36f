use serde::{Deserialize, Serialize};

/// Lifecycle of one backend task as reported by `GET /status/{task_id}`.
///
/// The submission endpoints park a fresh task at `pending`; the worker then
/// reports whichever phase it is in until the task lands on one of the two
/// terminal states.  The backend deletes a task after its terminal status
/// has been fetched once, so a poller must stop as soon as it sees one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Analyzing,
    GeneratingMusic,
    Complete,
    Failed,
}

impl TaskStatus {
    /// True once no further transitions can occur.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }

    /// Short label for status lines.
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Analyzing => "analyzing",
            TaskStatus::GeneratingMusic => "generating music",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
        }
    }
}

/// 202 body from `POST /analyze-image` and `POST /generate-music-from-text`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    #[serde(default)]
    pub message: String,
    pub task_id: String,
}

/// Body for `POST /generate-music-from-text`.
#[derive(Debug, Clone, Serialize)]
pub struct MusicRequest {
    pub prompt: String,
}

/// Body from `GET /status/{task_id}`.
///
/// The backend omits `result` and `error` until the matching terminal status
/// is reached, and never sends both.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

// ── Completed-task payloads ───────────────────────────────────────────────────

/// What a completed job actually produced.
///
/// Which variant applies is decided by the orchestration layer from the job
/// it submitted, never sniffed from the payload shape.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    /// Image analysis: a descriptive prompt for the music model.
    Text(String),
    /// Music generation: a decoded audio clip.
    Audio(AudioClip),
}

impl TaskResult {
    pub fn into_text(self) -> Option<String> {
        match self {
            TaskResult::Text(text) => Some(text),
            TaskResult::Audio(_) => None,
        }
    }

    pub fn into_audio(self) -> Option<AudioClip> {
        match self {
            TaskResult::Audio(clip) => Some(clip),
            TaskResult::Text(_) => None,
        }
    }
}

/// Decoded audio payload.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    /// Media type from the data URL, e.g. `audio/wav`.
    pub media_type: String,
    pub data: Vec<u8>,
}

impl AudioClip {
    /// File extension matching the media type.
    pub fn extension(&self) -> &'static str {
        match self.media_type.as_str() {
            "audio/mpeg" | "audio/mp3" => "mp3",
            "audio/ogg" => "ogg",
            "audio/flac" => "flac",
            _ => "wav",
        }
    }
}

const DEFAULT_AUDIO_MEDIA_TYPE: &str = "audio/wav";

/// Decode the audio payload of a completed generation task.
///
/// The backend encodes clips as `data:audio/wav;base64,<payload>`.  A bare
/// base64 string (no data-URL wrapper) is accepted and assumed to be wav.
pub fn decode_audio_payload(payload: &str) -> anyhow::Result<AudioClip> {
    use base64::Engine as _;

    let (media_type, b64) = match payload.strip_prefix("data:") {
        Some(rest) => {
            let (meta, data) = rest
                .split_once(',')
                .ok_or_else(|| anyhow::anyhow!("data URL has no payload section"))?;
            let media_type = meta
                .strip_suffix(";base64")
                .ok_or_else(|| anyhow::anyhow!("data URL is not base64-encoded: {}", meta))?;
            (media_type.to_string(), data)
        }
        None => (DEFAULT_AUDIO_MEDIA_TYPE.to_string(), payload),
    };

    let data = base64::engine::general_purpose::STANDARD
        .decode(b64.trim())
        .map_err(|e| anyhow::anyhow!("audio payload base64 decode: {}", e))?;

    if data.is_empty() {
        anyhow::bail!("audio payload is empty");
    }

    Ok(AudioClip { media_type, data })
}
