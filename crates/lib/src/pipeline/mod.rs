//! Build, run and extract orchestration.
//!
//! [`Pipeline::run`] takes one request through these stages:
//!
//! 1. normalize the target path and resolve the template directory
//! 2. assemble the build context and inject the caller's manifest
//! 3. build the image, draining every build event
//! 4. create a container from the image
//! 5. export the target path from the container
//! 6. re-root the exported archive under the target's parent
//!
//! Nothing reaches the engine before stages 1 and 2 succeed. Once a container
//! exists it is owned by a [`ContainerLease`], which removes it exactly once:
//! right away if a later stage fails, otherwise when the returned body has
//! been read to the end or dropped.
//!
//! Every engine call races the request's [`CancellationToken`]. Removal does
//! not; it runs to completion even for a caller that has gone away.

pub mod lease;
pub mod target;

use std::collections::HashMap;
use std::fmt;
use std::future::{Future, ready};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{StreamExt, stream};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::rewrite::reroot_under;
use crate::archive::{ArchiveStream, inject_file, rewrite_headers};
use crate::consts::{DEFAULT_TEMPLATE_ROOT, DOCKERFILE_NAME, MANIFEST_FILE_NAME, VENV_BUILD_ARG};
use crate::context::{ContextError, assemble_context};
use crate::engine::{BuildEvent, BuildEvents, BuildOptions, ContainerId, ContainerSpec, Engine, EngineError, ImageId};
pub use lease::ContainerLease;
pub use target::{TargetError, TargetPath};

/// Pipeline stage, as reported in logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  Build,
  CreateContainer,
  CopyArtifact,
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Stage::Build => "image build",
      Stage::CreateContainer => "container create",
      Stage::CopyArtifact => "artifact copy",
    };
    f.write_str(name)
  }
}

/// Errors from [`Pipeline::run`].
#[derive(Debug, Error)]
pub enum PipelineError {
  #[error("template '{0}' not found")]
  TemplateNotFound(String),

  #[error("invalid target path: {0}")]
  InvalidTarget(#[from] TargetError),

  #[error("failed to read template '{template}': {source}")]
  ContextRead {
    template: String,
    #[source]
    source: ContextError,
  },

  #[error("image build for template '{template}' failed: {reason}")]
  Build { template: String, reason: String },

  #[error("failed to create container from image {image}: {source}")]
  ContainerCreate {
    image: ImageId,
    #[source]
    source: EngineError,
  },

  #[error("failed to copy '{path}' from container {container}: {source}")]
  ArtifactCopy {
    container: ContainerId,
    path: TargetPath,
    #[source]
    source: EngineError,
  },

  #[error("request cancelled during {0}")]
  Cancelled(Stage),
}

impl PipelineError {
  /// Whether the request itself was at fault rather than the server.
  pub fn is_caller_error(&self) -> bool {
    matches!(self, Self::TemplateNotFound(_) | Self::InvalidTarget(_))
  }
}

/// Pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
  /// Directory whose subdirectories are the templates.
  pub template_root: PathBuf,
  /// Context entry replaced by the request's manifest.
  pub manifest_file: String,
  /// Build argument receiving the target path.
  pub build_arg: String,
  /// Upper bound on the image build, if any.
  pub build_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      template_root: PathBuf::from(DEFAULT_TEMPLATE_ROOT),
      manifest_file: MANIFEST_FILE_NAME.to_string(),
      build_arg: VENV_BUILD_ARG.to_string(),
      build_timeout: None,
    }
  }
}

/// One request: build `template` with `requirements` and export `target`.
#[derive(Debug, Clone)]
pub struct VenvRequest {
  pub template: String,
  pub target: String,
  pub requirements: Bytes,
}

/// The extracted environment.
pub struct VenvArchive {
  /// Download name, `<base name of target>.tar`.
  pub file_name: String,
  pub target: TargetPath,
  /// Archive entries rooted at the target's base name. Holds the container
  /// until it ends or is dropped.
  pub body: ArchiveStream,
}

/// Runs requests against one shared engine.
#[derive(Clone)]
pub struct Pipeline {
  engine: Arc<dyn Engine>,
  config: Arc<PipelineConfig>,
}

impl Pipeline {
  pub fn new(engine: Arc<dyn Engine>, config: PipelineConfig) -> Self {
    Self {
      engine,
      config: Arc::new(config),
    }
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  /// Build, run and export one environment.
  pub async fn run(&self, request: VenvRequest, cancel: &CancellationToken) -> Result<VenvArchive, PipelineError> {
    let VenvRequest {
      template,
      target,
      requirements,
    } = request;

    let target = TargetPath::normalize(&target)?;
    let dir = self.template_dir(&template)?;
    info!(%template, target_path = %target, manifest_bytes = requirements.len(), "building environment");

    let context = assemble_context(&dir).map_err(|source| PipelineError::ContextRead {
      template: template.clone(),
      source,
    })?;
    let context = inject_file(context, self.config.manifest_file.as_str(), requirements);

    let image = self.build(&template, context, &target, cancel).await?;
    info!(%template, %image, "image built");

    let container = cancellable(cancel, Stage::CreateContainer, async {
      self.engine.create_container(&image, &ContainerSpec::isolated()).await
    })
    .await?
    .map_err(|source| PipelineError::ContainerCreate {
      image: image.clone(),
      source,
    })?;
    debug!(%container, %image, "container created");
    let lease = ContainerLease::new(Arc::clone(&self.engine), container.clone());

    let copied = cancellable(cancel, Stage::CopyArtifact, async {
      self.engine.copy_from_container(&container, target.as_str()).await
    })
    .await;
    let export = match copied {
      Ok(Ok(export)) => export,
      Ok(Err(source)) => {
        lease.release().await;
        return Err(PipelineError::ArtifactCopy {
          container,
          path: target,
          source,
        });
      }
      Err(cancelled) => {
        lease.release().await;
        return Err(cancelled);
      }
    };

    let rewritten = rewrite_headers(export, reroot_under(PathBuf::from(target.parent())));
    let cleanup =
      stream::once(async move { lease.release().await }).filter_map(|()| ready(None::<io::Result<Bytes>>));

    Ok(VenvArchive {
      file_name: format!("{}.tar", target.base_name()),
      target,
      body: rewritten.chain(cleanup).boxed(),
    })
  }

  fn template_dir(&self, template: &str) -> Result<PathBuf, PipelineError> {
    let not_found = || PipelineError::TemplateNotFound(template.to_string());
    if matches!(template, "" | "." | "..") || template.contains(['/', '\\']) {
      return Err(not_found());
    }

    let dir = dunce::canonicalize(self.config.template_root.join(template)).map_err(|_| not_found())?;
    if !dir.is_dir() {
      return Err(not_found());
    }
    Ok(dir)
  }

  async fn build(
    &self,
    template: &str,
    context: ArchiveStream,
    target: &TargetPath,
    cancel: &CancellationToken,
  ) -> Result<ImageId, PipelineError> {
    let failed = |reason: String| PipelineError::Build {
      template: template.to_string(),
      reason,
    };

    let options = BuildOptions {
      dockerfile: DOCKERFILE_NAME.to_string(),
      build_args: HashMap::from([(self.config.build_arg.clone(), target.to_string())]),
      remove_intermediate: true,
    };

    let build = async {
      let events = self.engine.build_image(context, options).await?;
      Ok::<_, EngineError>(drain_build(events).await)
    };
    let outcome = match self.config.build_timeout {
      Some(limit) => cancellable(cancel, Stage::Build, tokio::time::timeout(limit, build))
        .await?
        .map_err(|_| failed(format!("timed out after {limit:?}")))?,
      None => cancellable(cancel, Stage::Build, build).await?,
    };

    outcome.map_err(|err| failed(err.to_string()))?.map_err(failed)
  }
}

/// Read build events to the end; the last reported image wins unless any
/// step failed.
async fn drain_build(mut events: BuildEvents) -> Result<ImageId, String> {
  let mut image = None;
  let mut failure = None;

  while let Some(event) = events.next().await {
    match event {
      Ok(BuildEvent::Progress(line)) => debug!("build: {line}"),
      Ok(BuildEvent::Built(id)) => image = Some(id),
      Ok(BuildEvent::Failed(message)) => {
        warn!(%message, "build step failed");
        failure.get_or_insert(message);
      }
      Err(err) => {
        failure.get_or_insert(err.to_string());
      }
    }
  }

  match (failure, image) {
    (Some(message), _) => Err(message),
    (None, Some(image)) => Ok(image),
    (None, None) => Err("build finished without reporting an image".to_string()),
  }
}

/// Await `work` unless `cancel` fires first.
async fn cancellable<T>(
  cancel: &CancellationToken,
  stage: Stage,
  work: impl Future<Output = T>,
) -> Result<T, PipelineError> {
  tokio::select! {
    biased;
    _ = cancel.cancelled() => {
      debug!(%stage, "cancelled");
      Err(PipelineError::Cancelled(stage))
    }
    out = work => Ok(out),
  }
}
