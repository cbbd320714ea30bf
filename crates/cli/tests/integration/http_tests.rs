use axum::http::{Method, StatusCode};

use venv_server_lib::engine::ContainerId;
use venv_server_lib::util::testutil::{EngineCall, RecordingEngine, read_entries};

use super::common::TestServer;

#[tokio::test]
async fn post_streams_rerooted_archive() {
  let server = TestServer::new();

  let response = server.post("/py39/opt/venv", b"flask==2.0\n").await;

  assert_eq!(response.status, StatusCode::OK, "{}", response.text());
  assert_eq!(response.header("content-type"), Some("application/x-tar"));
  assert_eq!(
    response.header("content-disposition"),
    Some("attachment; filename=\"venv.tar\"")
  );

  let entries = read_entries(&response.body);
  assert!(entries.iter().any(|e| e.path == "opt/venv/bin/activate"));
  assert!(entries.iter().all(|e| e.path.starts_with("opt/venv")));
  assert_eq!(
    server.engine.removals(),
    [ContainerId(RecordingEngine::CONTAINER.to_string())]
  );
}

#[tokio::test]
async fn manifest_and_target_reach_the_build() {
  let server = TestServer::new();

  let response = server.post("/py39/srv/app/env", b"requests==2.31\n").await;
  assert_eq!(response.status, StatusCode::OK, "{}", response.text());

  let context = read_entries(&server.engine.build_context().unwrap());
  let manifest = context.iter().find(|e| e.path == "requirements.txt").unwrap();
  assert_eq!(manifest.data, b"requests==2.31\n");
  assert!(context.iter().all(|e| e.path != "stale.pyc"));

  let calls = server.engine.calls();
  let EngineCall::Build { options, .. } = &calls[0] else {
    panic!("expected build first: {calls:?}");
  };
  assert_eq!(options.build_args.get("VENV").map(String::as_str), Some("/srv/app/env"));
  assert_eq!(response.header("content-disposition"), Some("attachment; filename=\"env.tar\""));
}

#[tokio::test]
async fn unknown_template_is_not_found() {
  let server = TestServer::new();

  let response = server.post("/missing/opt/venv", b"flask\n").await;

  assert_eq!(response.status, StatusCode::NOT_FOUND);
  assert!(response.text().contains("missing"));
  assert!(server.engine.calls().is_empty());
}

#[tokio::test]
async fn root_target_is_bad_request() {
  let server = TestServer::new();

  let response = server.post("/py39/opt/..", b"flask\n").await;

  assert_eq!(response.status, StatusCode::BAD_REQUEST);
  assert!(response.text().contains("invalid target path"));
  assert!(server.engine.calls().is_empty());
}

#[tokio::test]
async fn failed_build_is_server_error() {
  let engine = RecordingEngine::new().fail_build("No matching distribution found for flask==99");
  let server = TestServer::with_engine(engine);

  let response = server.post("/py39/opt/venv", b"flask==99\n").await;

  assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
  assert!(response.text().contains("No matching distribution"));
  assert!(server.engine.removals().is_empty());
}

#[tokio::test]
async fn missing_path_is_server_error_and_container_is_removed() {
  let server = TestServer::with_engine(RecordingEngine::new().missing_path());

  let response = server.post("/py39/opt/venv", b"flask\n").await;

  assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
  assert_eq!(server.engine.removals().len(), 1);
}

#[tokio::test]
async fn only_post_is_routed() {
  let server = TestServer::new();

  let response = server.send(Method::GET, "/py39/opt/venv", b"").await;

  assert_eq!(response.status, StatusCode::METHOD_NOT_ALLOWED);
  assert!(server.engine.calls().is_empty());
}
