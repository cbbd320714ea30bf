//! [`Engine`] implementation backed by the Docker Engine API.

use std::io;
use std::pin::pin;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{Config, CreateContainerOptions, DownloadFromContainerOptions};
use bollard::errors::Error as BollardError;
use bollard::image::BuildImageOptions;
use bollard::models::{BuildInfo, HostConfig};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt, stream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::{BuildEvent, BuildEvents, BuildOptions, ContainerId, ContainerSpec, Engine, EngineError, ImageId};
use crate::archive::{ArchiveStream, CHANNEL_CAPACITY};

/// Docker Engine client.
///
/// Cheap to clone; clones share one connection pool. Build contexts are
/// buffered in memory in full before the build request is sent.
#[derive(Debug, Clone)]
pub struct DockerEngine {
  docker: Docker,
}

impl DockerEngine {
  /// Connect using the standard environment (`DOCKER_HOST`, falling back to
  /// the local socket).
  pub fn connect() -> Result<Self, EngineError> {
    let docker = Docker::connect_with_defaults().map_err(|e| EngineError::Connect(e.to_string()))?;
    Ok(Self { docker })
  }

  /// Check that the engine answers.
  pub async fn ping(&self) -> Result<(), EngineError> {
    self
      .docker
      .ping()
      .await
      .map(|_| ())
      .map_err(|e| EngineError::Connect(e.to_string()))
  }
}

#[async_trait]
impl Engine for DockerEngine {
  async fn build_image(&self, context: ArchiveStream, options: BuildOptions) -> Result<BuildEvents, EngineError> {
    // bollard 0.17 takes the context as one body.
    let context = collect_context(context).await?;
    debug!(size = context.len(), "submitting build context");

    let options = BuildImageOptions {
      dockerfile: options.dockerfile,
      buildargs: options.build_args,
      rm: options.remove_intermediate,
      ..Default::default()
    };

    let docker = self.docker.clone();
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
      let mut infos = pin!(docker.build_image(options, None, Some(context)));
      while let Some(info) = infos.next().await {
        let event = match info {
          Ok(info) => match build_event(info) {
            Some(event) => Ok(event),
            None => continue,
          },
          Err(err) => Err(engine_error(err)),
        };
        if tx.send(event).await.is_err() {
          debug!("build event consumer went away");
          break;
        }
      }
    });

    Ok(ReceiverStream::new(rx).boxed())
  }

  async fn create_container(&self, image: &ImageId, spec: &ContainerSpec) -> Result<ContainerId, EngineError> {
    let config = Config {
      image: Some(image.0.clone()),
      tty: Some(spec.tty),
      attach_stdin: Some(spec.open_stdin),
      attach_stdout: Some(true),
      attach_stderr: Some(true),
      open_stdin: Some(spec.open_stdin),
      stdin_once: Some(true),
      host_config: Some(HostConfig {
        auto_remove: Some(spec.auto_remove),
        init: Some(spec.init),
        network_mode: Some(spec.network_mode.clone()),
        ..Default::default()
      }),
      ..Default::default()
    };

    let response = self
      .docker
      .create_container(None::<CreateContainerOptions<String>>, config)
      .await
      .map_err(engine_error)?;

    for warning in &response.warnings {
      warn!(container = %response.id, %warning, "engine warning on container create");
    }

    Ok(ContainerId(response.id))
  }

  async fn copy_from_container(&self, container: &ContainerId, path: &str) -> Result<ArchiveStream, EngineError> {
    let docker = self.docker.clone();
    let container = container.0.clone();
    let options = DownloadFromContainerOptions { path: path.to_string() };

    let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
      let mut chunks = pin!(docker.download_from_container(&container, Some(options)));
      while let Some(chunk) = chunks.next().await {
        let failed = chunk.is_err();
        if tx.send(chunk.map_err(engine_error)).await.is_err() || failed {
          break;
        }
      }
    });

    // A missing path only shows up as the first item, so look at it before
    // handing the stream out.
    let first = match rx.recv().await {
      Some(Ok(chunk)) => chunk,
      Some(Err(err)) => return Err(err),
      None => return Ok(stream::empty().boxed()),
    };

    let rest = ReceiverStream::new(rx).map_err(io::Error::other);
    Ok(stream::once(async move { Ok(first) }).chain(rest).boxed())
  }

  async fn remove_container(&self, container: &ContainerId) -> Result<(), EngineError> {
    self
      .docker
      .remove_container(&container.0, None)
      .await
      .map_err(engine_error)
  }
}

async fn collect_context(context: ArchiveStream) -> Result<Bytes, EngineError> {
  let body = context
    .try_fold(BytesMut::new(), |mut body, chunk| async move {
      body.extend_from_slice(&chunk);
      Ok(body)
    })
    .await
    .map_err(EngineError::Context)?;
  Ok(body.freeze())
}

/// Translate one build status message; `None` for messages with nothing to report.
fn build_event(info: BuildInfo) -> Option<BuildEvent> {
  if let Some(detail) = info.error_detail.and_then(|d| d.message) {
    return Some(BuildEvent::Failed(detail));
  }
  if let Some(error) = info.error {
    return Some(BuildEvent::Failed(error));
  }
  if let Some(id) = info.aux.and_then(|aux| aux.id) {
    return Some(BuildEvent::Built(ImageId(id)));
  }
  if let Some(line) = info.stream {
    let line = line.trim_end();
    return (!line.is_empty()).then(|| BuildEvent::Progress(line.to_string()));
  }
  info.status.map(|status| match info.progress {
    Some(progress) => BuildEvent::Progress(format!("{status} {progress}")),
    None => BuildEvent::Progress(status),
  })
}

fn engine_error(err: BollardError) -> EngineError {
  match err {
    BollardError::DockerResponseServerError {
      status_code: 404,
      message,
    } => EngineError::NotFound(message),
    BollardError::DockerStreamError { error } => EngineError::Request(error),
    other => EngineError::Request(other.to_string()),
  }
}

#[cfg(test)]
mod tests {
  use bollard::models::{ErrorDetail, ImageId as AuxImageId};

  use super::*;
  use crate::util::testutil::{TestEntry, failing_stream, stream_from, tar_bytes};

  #[tokio::test]
  async fn context_is_collected_into_one_body() {
    let archive = tar_bytes(&[TestEntry::file("Dockerfile", b"FROM scratch\n")]);
    let body = collect_context(stream_from(archive.clone())).await.unwrap();
    assert_eq!(body.as_ref(), archive.as_slice());
  }

  #[tokio::test]
  async fn context_read_failure_is_reported() {
    let err = collect_context(failing_stream(vec![0; 2048], "walk failed")).await.unwrap_err();
    assert!(matches!(err, EngineError::Context(ref e) if e.to_string() == "walk failed"), "{err:?}");
  }

  #[test]
  fn aux_message_yields_image_id() {
    let info = BuildInfo {
      aux: Some(AuxImageId {
        id: Some("sha256:abc".to_string()),
      }),
      ..Default::default()
    };
    assert_eq!(build_event(info), Some(BuildEvent::Built(ImageId("sha256:abc".to_string()))));
  }

  #[test]
  fn error_detail_wins_over_error_text() {
    let info = BuildInfo {
      error: Some("short".to_string()),
      error_detail: Some(ErrorDetail {
        code: Some(1),
        message: Some("The command '/bin/sh -c pip install' returned a non-zero code: 1".to_string()),
      }),
      ..Default::default()
    };
    assert_eq!(
      build_event(info),
      Some(BuildEvent::Failed(
        "The command '/bin/sh -c pip install' returned a non-zero code: 1".to_string()
      ))
    );
  }

  #[test]
  fn stream_lines_become_progress() {
    let info = BuildInfo {
      stream: Some("Step 1/4 : FROM python:3.9\n".to_string()),
      ..Default::default()
    };
    assert_eq!(build_event(info), Some(BuildEvent::Progress("Step 1/4 : FROM python:3.9".to_string())));
  }

  #[test]
  fn blank_messages_are_skipped() {
    let info = BuildInfo {
      stream: Some("\n".to_string()),
      ..Default::default()
    };
    assert_eq!(build_event(info), None);
    assert_eq!(build_event(BuildInfo::default()), None);
  }

  #[test]
  fn not_found_response_maps_to_not_found() {
    let err = engine_error(BollardError::DockerResponseServerError {
      status_code: 404,
      message: "Could not find the file /opt/venv in container abc".to_string(),
    });
    assert!(matches!(err, EngineError::NotFound(_)));

    let err = engine_error(BollardError::DockerResponseServerError {
      status_code: 500,
      message: "boom".to_string(),
    });
    assert!(matches!(err, EngineError::Request(_)));
  }
}
