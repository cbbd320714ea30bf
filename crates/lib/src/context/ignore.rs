//! Ignore-file patterns for build contexts.
//!
//! The format is the conventional one for container build contexts:
//! - one pattern per line; blank lines and lines starting with `#` are skipped
//! - patterns are cleaned and anchored at the context root (a leading `/` is
//!   dropped)
//! - `*` and `?` never match `/`, `**` matches any number of directories
//! - a leading `!` re-includes paths excluded by earlier patterns
//! - a pattern that matches a directory also matches everything below it
//!
//! The last matching pattern decides.

use std::io;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use thiserror::Error;

use crate::util::path::clean;

/// Errors loading an ignore file.
#[derive(Debug, Error)]
pub enum IgnoreError {
  /// The ignore file exists but could not be read.
  #[error("failed to read '{path}': {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  /// A line is not a valid pattern.
  #[error("invalid pattern '{pattern}' on line {line}: {source}")]
  Pattern {
    pattern: String,
    line: usize,
    #[source]
    source: globset::Error,
  },
}

#[derive(Debug, Clone)]
struct Rule {
  pattern: String,
  matcher: GlobMatcher,
  negated: bool,
}

/// Ordered ignore rules for one context directory.
#[derive(Debug, Clone, Default)]
pub struct IgnorePatterns {
  rules: Vec<Rule>,
}

impl IgnorePatterns {
  /// Load `file_name` from `dir`. A missing file means no rules.
  pub fn load(dir: &Path, file_name: &str) -> Result<Self, IgnoreError> {
    let path = dir.join(file_name);
    match std::fs::read_to_string(&path) {
      Ok(content) => Self::parse(&content),
      Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
      Err(source) => Err(IgnoreError::Read { path, source }),
    }
  }

  /// Parse ignore-file content.
  pub fn parse(content: &str) -> Result<Self, IgnoreError> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut patterns = Self::default();

    for (idx, line) in content.lines().enumerate() {
      if line.starts_with('#') {
        continue;
      }
      let line = line.trim();
      if line.is_empty() {
        continue;
      }
      let (negated, raw) = match line.strip_prefix('!') {
        Some(rest) => (true, rest.trim()),
        None => (false, line),
      };
      patterns.push(raw, negated, idx + 1)?;
    }

    Ok(patterns)
  }

  fn push(&mut self, raw: &str, negated: bool, line: usize) -> Result<(), IgnoreError> {
    let cleaned = clean(raw);
    let pattern = cleaned.strip_prefix('/').unwrap_or(&cleaned).to_string();
    let matcher = GlobBuilder::new(&pattern)
      .literal_separator(true)
      .build()
      .map_err(|source| IgnoreError::Pattern {
        pattern: raw.to_string(),
        line,
        source,
      })?
      .compile_matcher();

    self.rules.push(Rule {
      pattern,
      matcher,
      negated,
    });
    Ok(())
  }

  /// Make sure none of `names` is excluded, by appending re-include rules for
  /// those that currently are.
  pub fn keep_always(&mut self, names: &[&str]) -> Result<(), IgnoreError> {
    for name in names {
      if self.is_excluded(name) {
        self.push(name, true, 0)?;
      }
    }
    Ok(())
  }

  /// Whether any rule can re-include a path.
  pub fn has_exceptions(&self) -> bool {
    self.rules.iter().any(|r| r.negated)
  }

  /// Number of rules.
  pub fn len(&self) -> usize {
    self.rules.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rules.is_empty()
  }

  /// Whether `path`, relative to the context root with `/` separators, is
  /// excluded.
  pub fn is_excluded(&self, path: &str) -> bool {
    let path = clean(path);
    let ancestors: Vec<&str> = path.match_indices('/').map(|(idx, _)| &path[..idx]).collect();

    let mut excluded = false;
    for rule in &self.rules {
      // Only a rule that could flip the current verdict is worth evaluating.
      if rule.negated != excluded {
        continue;
      }
      let matched = rule.matcher.is_match(&path) || ancestors.iter().any(|dir| rule.matcher.is_match(dir));
      if matched {
        excluded = !rule.negated;
      }
    }
    excluded
  }

  /// Patterns in order, with `!` restored on re-include rules.
  pub fn patterns(&self) -> impl Iterator<Item = String> + '_ {
    self.rules.iter().map(|r| {
      if r.negated {
        format!("!{}", r.pattern)
      } else {
        r.pattern.clone()
      }
    })
  }
}
