//! Lexical path cleaning.
//!
//! Paths handled here name locations inside a container or inside an archive,
//! never on the host, so they are cleaned purely textually with `/` as the
//! separator and without touching any filesystem.

/// Return the shortest path equivalent to `path` by lexical processing.
///
/// - repeated `/` collapse to one
/// - `.` elements are dropped
/// - `..` removes the preceding element; at the root it is dropped, in a
///   relative path with nothing left to remove it is kept
/// - an empty result becomes `.`, or `/` for a rooted path
pub fn clean(path: &str) -> String {
  let rooted = path.starts_with('/');
  let mut parts: Vec<&str> = Vec::new();

  for part in path.split('/') {
    match part {
      "" | "." => {}
      ".." => {
        if parts.last().is_some_and(|last| *last != "..") {
          parts.pop();
        } else if !rooted {
          parts.push("..");
        }
      }
      _ => parts.push(part),
    }
  }

  let joined = parts.join("/");
  match (rooted, joined.is_empty()) {
    (true, _) => format!("/{joined}"),
    (false, true) => ".".to_string(),
    (false, false) => joined,
  }
}

/// Parent directory of a cleaned absolute path; `/` is its own parent.
pub fn parent(path: &str) -> &str {
  match path.rfind('/') {
    Some(0) | None => "/",
    Some(idx) => &path[..idx],
  }
}

/// Last element of a cleaned path.
pub fn base_name(path: &str) -> &str {
  path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn clean_rooted_paths() {
    assert_eq!(clean("/opt/venv"), "/opt/venv");
    assert_eq!(clean("/opt//venv/"), "/opt/venv");
    assert_eq!(clean("/opt/./venv"), "/opt/venv");
    assert_eq!(clean("/opt/lib/../venv"), "/opt/venv");
    assert_eq!(clean("/../.."), "/");
    assert_eq!(clean("/"), "/");
  }

  #[test]
  fn clean_relative_paths() {
    assert_eq!(clean(""), ".");
    assert_eq!(clean("./build"), "build");
    assert_eq!(clean("a/b/.."), "a");
    assert_eq!(clean("../x"), "../x");
    assert_eq!(clean("a/../../x"), "../x");
  }

  #[test]
  fn parent_and_base_name() {
    assert_eq!(parent("/opt/venv"), "/opt");
    assert_eq!(parent("/venv"), "/");
    assert_eq!(parent("/"), "/");
    assert_eq!(base_name("/opt/venv"), "venv");
    assert_eq!(base_name("venv"), "venv");
  }
}
