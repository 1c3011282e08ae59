//! Shared helpers for driving the gateway in-process

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use tempfile::TempDir;
use tower::ServiceExt;

use doc_convert_server::config::BackendConfig;
use doc_convert_server::convert::{BackendClass, CommandTemplate, Invocation};
use doc_convert_server::{app, AppState, Config};

const BOUNDARY: &str = "----doc-convert-test-boundary";

/// A gateway wired to throwaway backends and a private work root
pub struct TestGateway {
    pub app: Router,
    pub state: AppState,
    pub work_dir: PathBuf,
    _temp: TempDir,
}

impl TestGateway {
    /// Every class copies its input to the expected output
    pub async fn new() -> Self {
        Self::with(|config| config).await
    }

    pub async fn with(customize: impl FnOnce(Config) -> Config) -> Self {
        let temp = TempDir::new().unwrap();
        let work_dir = temp.path().join("work");

        let mut config = Config::default();
        config.server.work_dir = work_dir.clone();
        config.limits.max_concurrent_conversions = 8;
        for class in BackendClass::ALL {
            config = config.with_backend(copy_backend(class));
        }
        let config = customize(config);

        let state = AppState::new(config).await.unwrap();
        Self {
            app: app(state.clone()),
            state,
            work_dir,
            _temp: temp,
        }
    }

    pub async fn post_file(&self, uri: &str, file_name: &str, data: &[u8]) -> TestResponse {
        self.send(multipart_request(uri, "file", file_name, data)).await
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        TestResponse {
            status,
            headers,
            body,
        }
    }

    /// Directories currently under the work root
    pub fn leftover_work_areas(&self) -> usize {
        count_entries(&self.work_dir)
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn kind(&self) -> String {
        self.json()["kind"].as_str().unwrap_or("").to_string()
    }
}

pub fn backend(class: BackendClass, template: CommandTemplate, timeout: Duration) -> BackendConfig {
    BackendConfig {
        class,
        enabled: true,
        invocation: Invocation::Command(template),
        timeout,
    }
}

/// `sh -c <script>` with `$1` = input path and `$2` = expected output path
pub fn sh(script: &str) -> CommandTemplate {
    CommandTemplate::new("sh", &["-c", script, "sh", "{input}", "{output}"])
}

pub fn copy_backend(class: BackendClass) -> BackendConfig {
    backend(class, sh("cp \"$1\" \"$2\""), Duration::from_secs(30))
}

pub fn multipart_request(uri: &str, field: &str, file_name: &str, data: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
            BOUNDARY, field, file_name
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

/// A multipart body carrying only a text field
pub fn text_only_request(uri: &str) -> Request<Body> {
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"comment\"\r\n\r\nhello\r\n--{b}--\r\n",
        b = BOUNDARY
    );

    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

/// Deterministic payload of `len` bytes
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

pub fn count_entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}
