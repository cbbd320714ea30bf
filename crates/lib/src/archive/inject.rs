//! Replace the content of one archive entry on the fly.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tracing::debug;

use super::{ArchiveStream, EntryHeader, entry_key, spawn_transform};

/// Permission bits of an injected entry.
pub const INJECTED_MODE: u32 = 0o600;

/// Substitute `content` for the entry at `path` in `input`.
///
/// Every occurrence of `path` gets a fresh root-owned, regular-file header
/// stamped with the current time, followed by `content`. All other entries
/// pass through untouched and in order. If `path` never occurs, the entry is
/// appended after the last input entry.
///
/// `path` is matched with leading `/` and `./` ignored, so `/requirements.txt`
/// matches an entry named `requirements.txt`.
///
/// # Panics
///
/// Panics if called outside a tokio runtime.
pub fn inject_file(input: ArchiveStream, path: impl Into<PathBuf>, content: Bytes) -> ArchiveStream {
  let path = path.into();
  let key = entry_key(&path);

  spawn_transform("inject", input, move |reader, writer| {
    let mut archive = tar::Archive::new(reader);
    let mut builder = tar::Builder::new(writer);
    let mut injected = false;

    for entry in archive.entries()? {
      let mut entry = entry?;
      let header = EntryHeader::from_entry(&mut entry)?;
      if entry_key(&header.path) == key {
        debug!(path = %header.path.display(), size = content.len(), "replacing archive entry");
        append_injected(&mut builder, &header.path, &content)?;
        injected = true;
      } else {
        header.append(&mut builder, &mut entry)?;
      }
    }

    if !injected {
      debug!(path = %key, size = content.len(), "archive entry absent, appending");
      append_injected(&mut builder, Path::new(&key), &content)?;
    }

    builder.finish()
  })
}

/// Header written for injected content.
pub fn injected_header(size: u64) -> tar::Header {
  let now = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or_default();

  let mut header = tar::Header::new_gnu();
  header.set_entry_type(tar::EntryType::Regular);
  header.set_mode(INJECTED_MODE);
  header.set_uid(0);
  header.set_gid(0);
  header.set_mtime(now);
  header.set_size(size);
  header
}

fn append_injected<W: Write>(builder: &mut tar::Builder<W>, path: &Path, content: &Bytes) -> io::Result<()> {
  let mut header = injected_header(content.len() as u64);
  builder.append_data(&mut header, path, content.as_ref())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::testutil::{TestEntry, collect_stream, read_entries, stream_from, tar_bytes};

  fn context() -> Vec<TestEntry> {
    vec![
      TestEntry::file("Dockerfile", b"FROM python:3.9\n"),
      TestEntry::file("requirements.txt", b"placeholder\n").with_mode(0o644).with_uid(1000),
      TestEntry::dir("scripts/"),
      TestEntry::file("scripts/setup.sh", b"#!/bin/sh\n").with_mode(0o755),
    ]
  }

  #[tokio::test]
  async fn replaces_designated_entry() {
    let input = tar_bytes(&context());
    let payload = Bytes::from_static(b"flask==2.0\n");
    let output = collect_stream(inject_file(stream_from(input), "/requirements.txt", payload))
      .await
      .unwrap();

    let entries = read_entries(&output);
    let manifest = &entries[1];
    assert_eq!(manifest.path, "requirements.txt");
    assert_eq!(manifest.data, b"flask==2.0\n");
    assert_eq!(manifest.mode, INJECTED_MODE);
    assert_eq!(manifest.uid, 0);
    assert_eq!(manifest.gid, 0);
    assert_eq!(manifest.kind, tar::EntryType::Regular);
    assert!(manifest.mtime > 0);
  }

  #[tokio::test]
  async fn other_entries_pass_through_unchanged() {
    let input = tar_bytes(&context());
    let output = collect_stream(inject_file(stream_from(input.clone()), "requirements.txt", Bytes::from_static(b"x")))
      .await
      .unwrap();

    let before = read_entries(&input);
    let after = read_entries(&output);
    assert_eq!(before.len(), after.len());
    for (i, (b, a)) in before.iter().zip(&after).enumerate() {
      if i != 1 {
        assert_eq!(a, b);
      }
    }
  }

  #[tokio::test]
  async fn pax_records_survive_on_passed_entries_only() {
    let input = tar_bytes(&[
      TestEntry::file("requirements.txt", b"old\n").with_pax("SCHILY.xattr.user.origin", b"template"),
      TestEntry::file("setup.sh", b"#!/bin/sh\n").with_pax("SCHILY.xattr.user.k", b"v"),
    ]);
    let output = collect_stream(inject_file(stream_from(input), "requirements.txt", Bytes::from_static(b"new\n")))
      .await
      .unwrap();

    let entries = read_entries(&output);
    assert!(entries[0].pax.is_empty());
    assert_eq!(entries[0].data, b"new\n");
    assert_eq!(entries[1].pax, [("SCHILY.xattr.user.k".to_string(), b"v".to_vec())]);
    assert_eq!(entries[1].data, b"#!/bin/sh\n");
  }

  #[tokio::test]
  async fn absent_entry_is_appended() {
    let input = tar_bytes(&[TestEntry::file("Dockerfile", b"FROM scratch\n")]);
    for _ in 0..2 {
      let injected = inject_file(stream_from(input.clone()), "/requirements.txt", Bytes::from_static(b"six\n"));
      let output = collect_stream(injected).await.unwrap();

      let entries = read_entries(&output);
      assert_eq!(entries.len(), 2);
      assert_eq!(entries[0].path, "Dockerfile");
      assert_eq!(entries[1].path, "requirements.txt");
      assert_eq!(entries[1].data, b"six\n");
    }
  }

  #[tokio::test]
  async fn nested_path_does_not_match_root_entry() {
    let input = tar_bytes(&[TestEntry::file("app/requirements.txt", b"keep\n")]);
    let output = collect_stream(inject_file(stream_from(input), "requirements.txt", Bytes::from_static(b"new\n")))
      .await
      .unwrap();

    let entries = read_entries(&output);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].data, b"keep\n");
    assert_eq!(entries[1].path, "requirements.txt");
  }

  #[tokio::test]
  async fn empty_payload_is_injected_as_empty_file() {
    let input = tar_bytes(&context());
    let output = collect_stream(inject_file(stream_from(input), "requirements.txt", Bytes::new()))
      .await
      .unwrap();

    let entries = read_entries(&output);
    assert_eq!(entries[1].size, 0);
    assert!(entries[1].data.is_empty());
  }
}
