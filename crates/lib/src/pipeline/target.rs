//! Target path normalization.

use std::fmt;

use thiserror::Error;

use crate::util::path::{base_name, clean, parent};

/// Errors normalizing a target path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
  /// The path resolves to the container's filesystem root.
  #[error("'{raw}' resolves to the filesystem root")]
  Root { raw: String },

  #[error("'{raw}' contains a NUL byte")]
  Nul { raw: String },
}

/// An absolute, cleaned path inside a container, never `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetPath(String);

impl TargetPath {
  /// Anchor `raw` at `/` and resolve `.` and `..` lexically.
  pub fn normalize(raw: &str) -> Result<Self, TargetError> {
    if raw.contains('\0') {
      return Err(TargetError::Nul { raw: raw.to_string() });
    }
    let path = clean(&format!("/{raw}"));
    if path == "/" {
      return Err(TargetError::Root { raw: raw.to_string() });
    }
    Ok(Self(path))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Directory the target lives in; the exported archive is rooted here.
  pub fn parent(&self) -> &str {
    parent(&self.0)
  }

  /// Last path element, which names the exported archive's top-level entry.
  pub fn base_name(&self) -> &str {
    base_name(&self.0)
  }
}

impl fmt::Display for TargetPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn anchors_and_cleans() {
    assert_eq!(TargetPath::normalize("opt/venv").unwrap().as_str(), "/opt/venv");
    assert_eq!(TargetPath::normalize("/opt/./lib/../venv/").unwrap().as_str(), "/opt/venv");
    assert_eq!(TargetPath::normalize("//venv").unwrap().as_str(), "/venv");
  }

  #[test]
  fn parent_traversal_cannot_escape_root() {
    assert_eq!(TargetPath::normalize("../../srv/env").unwrap().as_str(), "/srv/env");
  }

  #[test]
  fn root_is_rejected() {
    for raw in ["", "/", ".", "/opt/..", "../.."] {
      assert_eq!(
        TargetPath::normalize(raw),
        Err(TargetError::Root { raw: raw.to_string() }),
        "{raw:?}"
      );
    }
  }

  #[test]
  fn nul_is_rejected() {
    assert!(matches!(TargetPath::normalize("/opt/\0venv"), Err(TargetError::Nul { .. })));
  }

  #[test]
  fn parent_and_base_name() {
    let target = TargetPath::normalize("/opt/venv").unwrap();
    assert_eq!(target.parent(), "/opt");
    assert_eq!(target.base_name(), "venv");

    let top = TargetPath::normalize("/venv").unwrap();
    assert_eq!(top.parent(), "/");
    assert_eq!(top.base_name(), "venv");
  }
}
