//! Container cleanup.
//!
//! A [`ContainerLease`] owns the right, and the duty, to remove one container.
//! Removal is issued exactly once: either through [`ContainerLease::release`]
//! or, if the lease is dropped unreleased, from a task spawned on drop.

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{Instrument, debug, warn};

use crate::engine::{ContainerId, Engine};

pub struct ContainerLease {
  engine: Arc<dyn Engine>,
  container: Option<ContainerId>,
}

impl ContainerLease {
  pub fn new(engine: Arc<dyn Engine>, container: ContainerId) -> Self {
    Self {
      engine,
      container: Some(container),
    }
  }

  /// Remove the container and wait for the engine to answer.
  ///
  /// The removal runs as its own task, so it completes even when the caller
  /// stops waiting. Failures are logged, never returned.
  pub async fn release(mut self) {
    let Some(container) = self.container.take() else {
      return;
    };
    let task = tokio::spawn(remove(Arc::clone(&self.engine), container).in_current_span());
    if let Err(err) = task.await {
      warn!(error = %err, "container removal task failed");
    }
  }
}

impl Drop for ContainerLease {
  fn drop(&mut self) {
    let Some(container) = self.container.take() else {
      return;
    };
    match Handle::try_current() {
      Ok(handle) => {
        debug!(container = %container, "lease dropped, removing container in background");
        handle.spawn(remove(Arc::clone(&self.engine), container).in_current_span());
      }
      Err(_) => warn!(container = %container, "no runtime left to remove container"),
    }
  }
}

async fn remove(engine: Arc<dyn Engine>, container: ContainerId) {
  match engine.remove_container(&container).await {
    Ok(()) => debug!(container = %container, "removed container"),
    Err(err) => warn!(container = %container, error = %err, "failed to remove container"),
  }
}
