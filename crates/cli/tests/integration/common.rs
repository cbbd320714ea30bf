//! Shared test helpers for HTTP integration tests.

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use tempfile::TempDir;
use tower::ServiceExt;

use venv_server_cli::server;
use venv_server_lib::pipeline::{Pipeline, PipelineConfig};
use venv_server_lib::util::testutil::{RecordingEngine, populate};

/// A template root holding `py39`, wired to a recording engine.
pub struct TestServer {
  _templates: TempDir,
  pub engine: Arc<RecordingEngine>,
  pub app: Router,
}

impl TestServer {
  pub fn new() -> Self {
    Self::with_engine(RecordingEngine::new())
  }

  pub fn with_engine(engine: RecordingEngine) -> Self {
    let templates = TempDir::new().unwrap();
    populate(
      &templates.path().join("py39"),
      &[
        (".dockerignore", "*.pyc\n"),
        ("Dockerfile", "FROM python:3.9\nARG VENV\nRUN python -m venv $VENV\n"),
        ("requirements.txt", "\n"),
        ("stale.pyc", "junk"),
      ],
    );

    let engine = Arc::new(engine);
    let pipeline = Pipeline::new(
      engine.clone(),
      PipelineConfig {
        template_root: templates.path().to_path_buf(),
        ..Default::default()
      },
    );

    Self {
      _templates: templates,
      engine,
      app: server::router(pipeline),
    }
  }

  /// Send one request and read the whole response.
  pub async fn send(&self, method: Method, uri: &str, body: &'static [u8]) -> TestResponse {
    let request = Request::builder()
      .method(method)
      .uri(uri)
      .body(Body::from(body))
      .unwrap();
    let response = self.app.clone().oneshot(request).await.unwrap();

    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    TestResponse { status, headers, body }
  }

  pub async fn post(&self, uri: &str, body: &'static [u8]) -> TestResponse {
    self.send(Method::POST, uri, body).await
  }
}

pub struct TestResponse {
  pub status: StatusCode,
  pub headers: HeaderMap,
  pub body: Bytes,
}

impl TestResponse {
  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(name).and_then(|v| v.to_str().ok())
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}
