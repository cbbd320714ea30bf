//! HTTP surface.
//!
//! `POST /{template}/{target...}` with the manifest as the request body builds
//! `template` and answers with a tar archive of `target`.

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::rejection::BytesRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use venv_server_lib::pipeline::{Pipeline, PipelineError, VenvArchive, VenvRequest};

pub const ARCHIVE_CONTENT_TYPE: &str = "application/x-tar";

#[derive(Clone)]
struct AppState {
  pipeline: Pipeline,
}

/// Build the application router.
pub fn router(pipeline: Pipeline) -> Router {
  Router::new()
    .route("/:template/*target", post(build_venv))
    .layer(TraceLayer::new_for_http())
    .with_state(AppState { pipeline })
}

async fn build_venv(
  State(state): State<AppState>,
  Path((template, target)): Path<(String, String)>,
  body: Result<Bytes, BytesRejection>,
) -> Response {
  let requirements = match body {
    Ok(body) => body,
    Err(rejection) => {
      warn!(%template, error = %rejection, "could not read request body");
      return (StatusCode::BAD_REQUEST, "could not read body\n").into_response();
    }
  };

  // Dropping the handler, e.g. on disconnect, cancels in-flight engine calls.
  let cancel = CancellationToken::new();
  let _cancel_on_drop = cancel.clone().drop_guard();

  let request = VenvRequest {
    template,
    target,
    requirements,
  };
  match state.pipeline.run(request, &cancel).await {
    Ok(archive) => archive_response(archive),
    Err(err) => error_response(&err),
  }
}

fn archive_response(archive: VenvArchive) -> Response {
  info!(target_path = %archive.target, file = %archive.file_name, "streaming environment");
  (
    [
      (header::CONTENT_TYPE, HeaderValue::from_static(ARCHIVE_CONTENT_TYPE)),
      (header::CONTENT_DISPOSITION, content_disposition(&archive.file_name)),
    ],
    Body::from_stream(archive.body),
  )
    .into_response()
}

fn error_response(err: &PipelineError) -> Response {
  let status = match err {
    PipelineError::TemplateNotFound(_) => StatusCode::NOT_FOUND,
    err if err.is_caller_error() => StatusCode::BAD_REQUEST,
    _ => StatusCode::INTERNAL_SERVER_ERROR,
  };

  if status.is_server_error() {
    error!(error = %err, "request failed");
  } else {
    info!(error = %err, "request rejected");
  }
  (status, format!("{err}\n")).into_response()
}

/// `attachment; filename="<name>"`, with anything that cannot appear inside
/// the quoted name replaced by `_`.
fn content_disposition(file_name: &str) -> HeaderValue {
  let safe: String = file_name
    .chars()
    .map(|c| match c {
      '"' | '\\' => '_',
      ' ' => c,
      c if c.is_ascii_graphic() => c,
      _ => '_',
    })
    .collect();
  HeaderValue::from_str(&format!("attachment; filename=\"{safe}\""))
    .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}
