//! Container engine client contract.
//!
//! The pipeline never talks to a container engine directly. It goes through
//! [`Engine`], which covers exactly the four calls a venv extraction needs:
//! build an image, create a container, copy a path out of it, remove it.
//! [`docker::DockerEngine`] is the production implementation.

pub mod docker;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::archive::ArchiveStream;

/// Engine-assigned image identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageId(pub String);

impl fmt::Display for ImageId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Engine-assigned container identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(pub String);

impl fmt::Display for ContainerId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Options for an image build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
  /// Path of the build file inside the context.
  pub dockerfile: String,
  /// Named build-time arguments.
  pub build_args: HashMap<String, String>,
  /// Remove intermediate containers after a successful build.
  pub remove_intermediate: bool,
}

/// One event from an image build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
  /// A line of build output.
  Progress(String),
  /// The build produced this image.
  Built(ImageId),
  /// The build failed.
  Failed(String),
}

/// Events of an image build, in the order the engine reports them.
pub type BuildEvents = BoxStream<'static, Result<BuildEvent, EngineError>>;

/// How the container to extract from is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
  /// Network mode; `none` disables networking.
  pub network_mode: String,
  /// Run an init process as PID 1.
  pub init: bool,
  /// Let the engine remove the container when it exits.
  pub auto_remove: bool,
  /// Allocate a TTY.
  pub tty: bool,
  /// Attach and keep stdin open.
  pub open_stdin: bool,
}

impl ContainerSpec {
  /// A non-networked, non-interactive container that is only removed when
  /// asked to.
  pub fn isolated() -> Self {
    Self {
      network_mode: "none".to_string(),
      init: true,
      auto_remove: false,
      tty: false,
      open_stdin: false,
    }
  }
}

/// Errors reported by an [`Engine`].
#[derive(Debug, Error)]
pub enum EngineError {
  /// The engine could not be reached.
  #[error("failed to connect to container engine: {0}")]
  Connect(String),

  /// The requested object does not exist.
  #[error("not found: {0}")]
  NotFound(String),

  /// The engine rejected or failed a request.
  #[error("engine request failed: {0}")]
  Request(String),

  /// The build context could not be read.
  #[error("failed to read build context: {0}")]
  Context(#[source] std::io::Error),
}

/// Client for a container engine.
///
/// Implementations are shared between concurrent requests behind an `Arc`, so
/// every method takes `&self`. Dropping a returned future or stream abandons
/// the underlying request.
#[async_trait]
pub trait Engine: Send + Sync {
  /// Build an image from the archive `context`.
  ///
  /// An implementation may read the whole context before submitting it;
  /// [`docker::DockerEngine`] does, because its API client only accepts the
  /// build context as a single body. A failed read of `context` is
  /// [`EngineError::Context`].
  ///
  /// The returned events must be drained to learn the outcome.
  async fn build_image(&self, context: ArchiveStream, options: BuildOptions) -> Result<BuildEvents, EngineError>;

  /// Create, without starting, a container from `image`.
  async fn create_container(&self, image: &ImageId, spec: &ContainerSpec) -> Result<ContainerId, EngineError>;

  /// Export `path` from `container` as a tar archive.
  ///
  /// A missing path is reported as [`EngineError::NotFound`] before any
  /// archive bytes are handed out.
  async fn copy_from_container(&self, container: &ContainerId, path: &str) -> Result<ArchiveStream, EngineError>;

  /// Remove `container`.
  async fn remove_container(&self, container: &ContainerId) -> Result<(), EngineError>;
}
