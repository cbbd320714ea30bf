//! Build context assembly.
//!
//! A template directory becomes a tar archive stream that can be handed to an
//! image build. The directory walk and ignore-file handling happen up front, so
//! a broken template fails before anything is sent to the engine; file
//! contents are read lazily while the archive is consumed.

pub mod ignore;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::archive::{ArchiveStream, spawn_producer};
use crate::consts::{ALWAYS_INCLUDED, DOCKERFILE_NAME, IGNORE_FILE_NAME};
pub use ignore::{IgnoreError, IgnorePatterns};

/// Errors assembling a build context.
#[derive(Debug, Error)]
pub enum ContextError {
  /// The ignore file could not be read or parsed.
  #[error("failed to read ignore file: {0}")]
  Ignore(#[from] IgnoreError),

  /// The template directory could not be walked.
  #[error("failed to walk '{path}': {message}")]
  Walk { path: PathBuf, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryKind {
  Dir,
  File,
  Symlink(PathBuf),
}

/// One path selected for the context.
#[derive(Debug, Clone)]
struct ContextEntry {
  relative: PathBuf,
  absolute: PathBuf,
  kind: EntryKind,
}

/// Assemble the build context for `dir`.
///
/// Paths excluded by the directory's ignore file are left out, except the
/// build file and the ignore file itself. Every entry is owned by uid/gid 0.
/// Symbolic links are stored as links, not followed.
///
/// # Panics
///
/// Panics if called outside a tokio runtime.
pub fn assemble_context(dir: &Path) -> Result<ArchiveStream, ContextError> {
  let mut patterns = IgnorePatterns::load(dir, IGNORE_FILE_NAME)?;
  patterns.keep_always(ALWAYS_INCLUDED)?;

  let entries = select_entries(dir, &patterns)?;
  info!(dir = %dir.display(), entries = entries.len(), rules = patterns.len(), "assembled build context");

  Ok(spawn_producer("context", move |writer| write_entries(writer, &entries)))
}

fn select_entries(dir: &Path, patterns: &IgnorePatterns) -> Result<Vec<ContextEntry>, ContextError> {
  let walk_error = |message: String| ContextError::Walk {
    path: dir.to_path_buf(),
    message,
  };

  if !dir.is_dir() {
    return Err(walk_error("not a directory".to_string()));
  }
  if !dir.join(DOCKERFILE_NAME).is_file() {
    debug!(dir = %dir.display(), "template has no {DOCKERFILE_NAME}");
  }

  let mut entries = Vec::new();
  let mut walker = WalkDir::new(dir).min_depth(1).sort_by_file_name().into_iter();

  while let Some(entry) = walker.next() {
    let entry = entry.map_err(|e| walk_error(e.to_string()))?;
    let relative = entry
      .path()
      .strip_prefix(dir)
      .map_err(|e| walk_error(e.to_string()))?
      .to_path_buf();
    let key = slash_path(&relative);
    let file_type = entry.file_type();

    if patterns.is_excluded(&key) {
      // Nothing below an excluded directory can come back without a `!` rule.
      if file_type.is_dir() && !patterns.has_exceptions() {
        walker.skip_current_dir();
      }
      debug!(path = %key, "excluded from context");
      continue;
    }

    let kind = if file_type.is_dir() {
      EntryKind::Dir
    } else if file_type.is_file() {
      EntryKind::File
    } else if file_type.is_symlink() {
      let target = fs::read_link(entry.path()).map_err(|e| walk_error(format!("{key}: {e}")))?;
      EntryKind::Symlink(target)
    } else {
      debug!(path = %key, "skipping special file");
      continue;
    };

    entries.push(ContextEntry {
      relative,
      absolute: entry.path().to_path_buf(),
      kind,
    });
  }

  Ok(entries)
}

fn write_entries<W: Write>(writer: W, entries: &[ContextEntry]) -> io::Result<()> {
  let mut builder = tar::Builder::new(writer);

  for entry in entries {
    let meta = fs::symlink_metadata(&entry.absolute)?;
    let mut header = tar::Header::new_gnu();
    header.set_metadata_in_mode(&meta, tar::HeaderMode::Complete);
    header.set_uid(0);
    header.set_gid(0);

    match &entry.kind {
      EntryKind::Dir => {
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        builder.append_data(&mut header, &entry.relative, io::empty())?;
      }
      EntryKind::File => {
        // Read whole so the declared size always matches what is written.
        let data = fs::read(&entry.absolute)?;
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        builder.append_data(&mut header, &entry.relative, data.as_slice())?;
      }
      EntryKind::Symlink(target) => {
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        builder.append_link(&mut header, &entry.relative, target)?;
      }
    }
  }

  builder.finish()
}

fn slash_path(path: &Path) -> String {
  path
    .components()
    .map(|c| c.as_os_str().to_string_lossy())
    .collect::<Vec<_>>()
    .join("/")
}
