//! Per-entry header rewriting over a live archive stream.

use std::path::{Path, PathBuf};

use super::{ArchiveStream, EntryHeader, spawn_transform};

/// Rewrite every entry header of `input` with `rewrite`.
///
/// Entries keep their order and their content; only what `rewrite` changes in
/// the header differs. The returned stream yields bytes as soon as each entry
/// has been copied, and any read or write failure ends it with that error.
/// PAX records other than the entry names are carried over unchanged.
///
/// # Panics
///
/// Panics if called outside a tokio runtime.
pub fn rewrite_headers<F>(input: ArchiveStream, mut rewrite: F) -> ArchiveStream
where
  F: FnMut(&mut EntryHeader) + Send + 'static,
{
  spawn_transform("rewrite", input, move |reader, writer| {
    let mut archive = tar::Archive::new(reader);
    let mut builder = tar::Builder::new(writer);

    for entry in archive.entries()? {
      let mut entry = entry?;
      let mut header = EntryHeader::from_entry(&mut entry)?;
      rewrite(&mut header);
      header.append(&mut builder, &mut entry)?;
    }

    builder.finish()
  })
}

/// Returns a rewrite function that moves every entry under `parent`.
///
/// `parent` is an absolute in-container directory; the result is relative, so
/// `parent = "/opt"` turns `venv/bin/python` into `opt/venv/bin/python`.
/// Hard-link targets name other entries of the same archive and move with
/// them; symbolic link targets are left alone.
pub fn reroot_under(parent: PathBuf) -> impl FnMut(&mut EntryHeader) + Send + 'static {
  move |header: &mut EntryHeader| {
    header.path = reroot(&parent, &header.path);
    if header.header.entry_type() == tar::EntryType::Link {
      if let Some(target) = header.link_name.take() {
        header.link_name = Some(reroot(&parent, &target));
      }
    }
  }
}

// Directory entries keep their trailing `/`.
fn reroot(parent: &Path, path: &Path) -> PathBuf {
  let mut rerooted = parent.strip_prefix("/").unwrap_or(parent).to_path_buf();
  rerooted.push(path.strip_prefix("/").unwrap_or(path));
  rerooted
}
