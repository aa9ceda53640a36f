//! HTTP client for the imalody backend.

use melody_proto::protocol::{MusicRequest, StatusResponse, SubmitResponse};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

/// Error from one backend call.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("backend returned {status}: {body}")]
    Http {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Thin wrapper around `reqwest::Client`, bound to one backend base URL.
///
/// Constructed explicitly and handed to whoever needs it; there is no
/// module-global instance.  Holds no state beyond the connection pool.
/// Every failing call passes through one logging point before the error is
/// returned, so failures are observed even when a caller drops them.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    /// Build a client for `base_url` with the given per-request timeout.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("imalody/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// GET `path` and decode a JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let req = self.http.get(self.url(path));
        self.execute("GET", path, req).await
    }

    /// POST a JSON `body` to `path` and decode a JSON response.
    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let req = self.http.post(self.url(path)).json(body);
        self.execute("POST", path, req).await
    }

    /// POST a multipart form to `path` and decode a JSON response.
    pub async fn post_multipart<T: DeserializeOwned>(
        &self,
        path: &str,
        form: reqwest::multipart::Form,
    ) -> Result<T, ApiError> {
        let req = self.http.post(self.url(path)).multipart(form);
        self.execute("POST", path, req).await
    }

    /// Single funnel for every request: non-2xx responses and decode
    /// failures become `ApiError`, and any failure is logged here.
    async fn execute<T: DeserializeOwned>(
        &self,
        method: &str,
        path: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<T, ApiError> {
        let result = async {
            let response = req.send().await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ApiError::Http { status, body });
            }
            Ok(response.json::<T>().await?)
        }
        .await;

        if let Err(e) = &result {
            error!("[api] {} {} failed: {}", method, path, e);
        }
        result
    }
}

// ── Backend endpoints ─────────────────────────────────────────────────────────

impl ApiClient {
    /// Kick off image analysis.  The multipart field name must be `file`.
    pub async fn submit_image(
        &self,
        file_name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<SubmitResponse, ApiError> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name.into());
        let form = reqwest::multipart::Form::new().part("file", part);
        self.post_multipart("/analyze-image", form).await
    }

    /// Kick off music generation from a finished prompt.
    pub async fn submit_prompt(
        &self,
        prompt: impl Into<String>,
    ) -> Result<SubmitResponse, ApiError> {
        let body = MusicRequest {
            prompt: prompt.into(),
        };
        self.post_json("/generate-music-from-text", &body).await
    }

    /// One status probe for `task_id`.
    pub async fn task_status(&self, task_id: &str) -> Result<StatusResponse, ApiError> {
        self.get_json(&format!("/status/{}", task_id)).await
    }
}
