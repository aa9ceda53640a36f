//! End-to-end flow tests against an in-process double of the imalody
//! backend: submission endpoints hand out fixed task ids, and the status
//! endpoint walks each task through a scripted sequence.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use melody_client::api::ApiClient;
use melody_client::flow::{combine_prompt, SongFlow};
use melody_proto::config::PollingConfig;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

// The silent one-sample wav clip the original mock backend serves.
const TINY_WAV_B64: &str =
    "UklGRigAAABXQVZFZm10IBIAAAABAAEARKwAAIhYAQACABAAAABkYXRhAgAAAAEA";

#[derive(Clone, Default)]
struct MockBackend {
    scripts: Arc<Mutex<HashMap<String, Vec<Value>>>>,
    analyze_bodies: Arc<Mutex<Vec<Vec<u8>>>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl MockBackend {
    fn script(&self, task_id: &str, steps: Vec<Value>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(task_id.to_string(), steps);
    }
}

async fn analyze_handler(
    State(backend): State<MockBackend>,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    backend.analyze_bodies.lock().unwrap().push(body.to_vec());
    (
        StatusCode::ACCEPTED,
        Json(json!({"message": "Analysis started", "task_id": "analysis-1"})),
    )
}

async fn generate_handler(
    State(backend): State<MockBackend>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let prompt = body
        .get("prompt")
        .and_then(|p| p.as_str())
        .unwrap_or_default()
        .to_string();
    backend.prompts.lock().unwrap().push(prompt);
    (
        StatusCode::ACCEPTED,
        Json(json!({"message": "Music generation started", "task_id": "generation-1"})),
    )
}

async fn status_handler(
    State(backend): State<MockBackend>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let step = {
        let mut scripts = backend.scripts.lock().unwrap();
        match scripts.get_mut(&task_id) {
            Some(steps) if steps.len() > 1 => Some(steps.remove(0)),
            Some(steps) => steps.first().cloned(),
            None => None,
        }
    };

    match step {
        Some(step) => Ok(Json(step)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({"detail": "Task not found"})),
        )),
    }
}

async fn serve(backend: MockBackend) -> String {
    let app = Router::new()
        .route("/analyze-image", post(analyze_handler))
        .route("/generate-music-from-text", post(generate_handler))
        .route("/status/:task_id", get(status_handler))
        .with_state(backend);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn flow_for(base_url: &str) -> SongFlow {
    let client = Arc::new(ApiClient::new(base_url, Duration::from_secs(2)).unwrap());
    let polling = PollingConfig {
        interval_ms: 40,
        max_transient_retries: 0,
    };
    SongFlow::new(client, &polling)
}

#[tokio::test]
async fn test_image_to_song_end_to_end() {
    let backend = MockBackend::default();
    backend.script(
        "analysis-1",
        vec![
            json!({"status": "analyzing"}),
            json!({"status": "complete",
                   "result": "A mock description of a serene, calm lake at sunset."}),
        ],
    );
    backend.script(
        "generation-1",
        vec![
            json!({"status": "generating_music"}),
            json!({"status": "complete",
                   "result": format!("data:audio/wav;base64,{}", TINY_WAV_B64)}),
        ],
    );
    let base = serve(backend.clone()).await;
    let flow = flow_for(&base);

    let prompt = flow
        .analyze_image("sunset.png", b"\x89PNG fake image bytes".to_vec())
        .await
        .unwrap()
        .into_text()
        .unwrap();
    assert_eq!(
        prompt,
        "A mock description of a serene, calm lake at sunset."
    );

    // the submission actually carried a multipart `file` field
    let bodies = backend.analyze_bodies.lock().unwrap().clone();
    let body = String::from_utf8_lossy(&bodies[0]).into_owned();
    assert!(body.contains("name=\"file\""));
    assert!(body.contains("sunset.png"));

    let final_prompt = combine_prompt(&prompt, Some("make it more orchestral"));
    let clip = flow
        .generate_music(&final_prompt)
        .await
        .unwrap()
        .into_audio()
        .unwrap();
    assert_eq!(clip.media_type, "audio/wav");
    assert_eq!(&clip.data[..4], b"RIFF");

    let prompts = backend.prompts.lock().unwrap().clone();
    assert_eq!(
        prompts[0],
        "A mock description of a serene, calm lake at sunset. make it more orchestral"
    );
}

#[tokio::test]
async fn test_generation_failure_surfaces_backend_message() {
    let backend = MockBackend::default();
    backend.script(
        "generation-1",
        vec![
            json!({"status": "generating_music"}),
            json!({"status": "failed", "error": "model unavailable"}),
        ],
    );
    let base = serve(backend.clone()).await;
    let flow = flow_for(&base);

    let err = flow.generate_music("some prompt").await.unwrap_err();
    assert_eq!(err.to_string(), "model unavailable");

    let snap = flow.poller().snapshot().await;
    assert!(snap.is_terminal());
    assert!(snap.result.is_none());
}

#[tokio::test]
async fn test_submission_error_starts_no_polling() {
    // A backend with no routes: every submission 404s.
    let app = Router::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let flow = flow_for(&format!("http://{}", addr));
    let err = flow
        .analyze_image("x.png", vec![1, 2, 3])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to start analysis"));

    // no task was created, so the poller never left idle
    let snap = flow.poller().snapshot().await;
    assert!(snap.status.is_none());
    assert_eq!(snap.rev, 0);
}

#[tokio::test]
async fn test_flow_reuses_one_poller_across_jobs() {
    let backend = MockBackend::default();
    backend.script(
        "analysis-1",
        vec![json!({"status": "complete", "result": "first prompt"})],
    );
    backend.script(
        "generation-1",
        vec![json!({"status": "complete", "result": TINY_WAV_B64})],
    );
    let base = serve(backend.clone()).await;
    let flow = flow_for(&base);

    flow.analyze_image("a.png", vec![1]).await.unwrap();
    let snap = flow.poller().snapshot().await;
    assert_eq!(snap.task_id.as_deref(), Some("analysis-1"));

    // bare base64 (no data-URL wrapper) is accepted too
    let clip = flow
        .generate_music("first prompt")
        .await
        .unwrap()
        .into_audio()
        .unwrap();
    assert_eq!(&clip.data[..4], b"RIFF");

    let snap = flow.poller().snapshot().await;
    assert_eq!(snap.task_id.as_deref(), Some("generation-1"));
}
