//! Streaming tar transforms.
//!
//! Every transform in this module reads a live archive byte stream and produces
//! a new one without buffering the whole archive:
//! - `rewrite`: pass every entry header through a caller-supplied function
//! - `inject`: substitute the content of one designated entry
//!
//! The `tar` crate is synchronous, so each transform runs as a producer on the
//! blocking pool. It reads its input through a [`SyncIoBridge`] and hands
//! finished chunks to the consumer over a bounded channel. A slow consumer
//! blocks the producer, which keeps memory use to a few in-flight chunks.

pub mod inject;
pub mod rewrite;

use std::borrow::Cow;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::debug;

pub use inject::inject_file;
pub use rewrite::rewrite_headers;

/// An archive serialized as a stream of byte chunks.
///
/// Failures of whatever produces the archive are delivered as `Err` items, so
/// the consumer observes them on its next read.
pub type ArchiveStream = BoxStream<'static, io::Result<Bytes>>;

/// Size of the chunks handed from a producer to its consumer.
pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

/// Number of chunks that may be in flight between producer and consumer.
pub(crate) const CHANNEL_CAPACITY: usize = 8;

/// Blocking reader over an [`ArchiveStream`].
pub(crate) type SyncArchiveReader = SyncIoBridge<StreamReader<ArchiveStream, Bytes>>;

/// `io::Write` adapter that forwards buffered chunks over a bounded channel.
///
/// Writes block once [`CHANNEL_CAPACITY`] chunks are waiting. When the
/// consumer has gone away every write fails with `BrokenPipe`.
pub(crate) struct ChannelWriter {
  tx: mpsc::Sender<io::Result<Bytes>>,
  buf: BytesMut,
}

impl ChannelWriter {
  fn new(tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
    Self {
      tx,
      buf: BytesMut::with_capacity(CHUNK_SIZE),
    }
  }

  fn send_buffered(&mut self) -> io::Result<()> {
    if self.buf.is_empty() {
      return Ok(());
    }
    let chunk = self.buf.split().freeze();
    self
      .tx
      .blocking_send(Ok(chunk))
      .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer went away"))
  }

  /// Deliver `err` to the consumer as the final stream item.
  fn fail(self, err: io::Error) {
    // Nobody to tell if the receiver is already gone.
    let _ = self.tx.blocking_send(Err(err));
  }
}

impl Write for ChannelWriter {
  fn write(&mut self, data: &[u8]) -> io::Result<usize> {
    self.buf.extend_from_slice(data);
    if self.buf.len() >= CHUNK_SIZE {
      self.send_buffered()?;
    }
    Ok(data.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    self.send_buffered()
  }
}

/// Run `produce` on the blocking pool and expose everything it writes as an
/// [`ArchiveStream`].
///
/// The producer finishing with `Ok` flushes and ends the stream cleanly. An
/// error is forwarded to the consumer as the last item, except `BrokenPipe`,
/// which only means the consumer stopped reading.
///
/// Must be called from within a tokio runtime.
pub(crate) fn spawn_producer<F>(label: &'static str, produce: F) -> ArchiveStream
where
  F: FnOnce(&mut ChannelWriter) -> io::Result<()> + Send + 'static,
{
  let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

  tokio::task::spawn_blocking(move || {
    let mut writer = ChannelWriter::new(tx);
    match produce(&mut writer).and_then(|()| writer.flush()) {
      Ok(()) => debug!(producer = label, "archive stream complete"),
      Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
        debug!(producer = label, "archive consumer closed the stream early");
      }
      Err(err) => {
        debug!(producer = label, error = %err, "archive stream aborted");
        writer.fail(err);
      }
    }
  });

  ReceiverStream::new(rx).boxed()
}

/// Like [`spawn_producer`], but also hands the producer a blocking reader
/// over `input`.
///
/// The input is dropped, and therefore closed, on every exit path of the
/// producer.
pub(crate) fn spawn_transform<F>(label: &'static str, input: ArchiveStream, transform: F) -> ArchiveStream
where
  F: FnOnce(SyncArchiveReader, &mut ChannelWriter) -> io::Result<()> + Send + 'static,
{
  // The bridge captures the current runtime handle, so build it here rather
  // than on the blocking thread.
  let reader = SyncIoBridge::new(StreamReader::new(input));
  spawn_producer(label, move |writer| transform(reader, writer))
}

/// Header of one archive entry, as seen by a rewrite function.
///
/// `path` and `link_name` are the full values after any long-name or PAX
/// extensions have been applied. `header` is the raw header block; its name
/// fields are overwritten from `path` and `link_name` when the entry is written.
/// `pax` holds the entry's remaining PAX records (xattrs, high-precision times,
/// user names and so on) in their original order.
#[derive(Debug, Clone)]
pub struct EntryHeader {
  pub path: PathBuf,
  pub link_name: Option<PathBuf>,
  pub header: tar::Header,
  pub pax: Vec<(String, Vec<u8>)>,
}

impl EntryHeader {
  pub(crate) fn from_entry<R: Read>(entry: &mut tar::Entry<'_, R>) -> io::Result<Self> {
    // Global extended headers hold their records as entry content.
    let pax = if entry.header().entry_type().is_pax_global_extensions() {
      Vec::new()
    } else {
      pax_records(entry)?
    };
    Ok(Self {
      path: entry.path()?.into_owned(),
      link_name: entry.link_name()?.map(Cow::into_owned),
      header: entry.header().clone(),
      pax,
    })
  }

  /// Whether the raw header block alone still describes this entry.
  fn fits_raw_header(&self) -> io::Result<bool> {
    if self.header.path()? != self.path {
      return Ok(false);
    }
    let raw_link = self.header.link_name()?;
    Ok(raw_link.as_deref() == self.link_name.as_deref())
  }

  /// Write this header followed by `data` to `builder`.
  ///
  /// PAX records go first, in an extended header of their own. Entries whose
  /// names still fit the raw header are then copied byte for byte; anything
  /// else is re-encoded, with GNU long-name records where needed.
  pub(crate) fn append<W: Write, R: Read>(mut self, builder: &mut tar::Builder<W>, data: R) -> io::Result<()> {
    if !self.pax.is_empty() {
      append_pax_header(builder, &self.pax)?;
    }
    if self.fits_raw_header()? {
      return builder.append(&self.header, data);
    }
    match self.link_name {
      Some(ref target) if is_link(self.header.entry_type()) => {
        builder.append_link(&mut self.header, &self.path, target)
      }
      _ => builder.append_data(&mut self.header, &self.path, data),
    }
  }
}

/// Name given to the extended headers written by [`append_pax_header`].
const PAX_HEADER_NAME: &str = "PaxHeader";

/// PAX records attached to `entry`, without `path` and `linkpath`, which
/// travel in [`EntryHeader::path`] and [`EntryHeader::link_name`].
fn pax_records<R: Read>(entry: &mut tar::Entry<'_, R>) -> io::Result<Vec<(String, Vec<u8>)>> {
  let Some(extensions) = entry.pax_extensions()? else {
    return Ok(Vec::new());
  };
  let mut records = Vec::new();
  for extension in extensions {
    let extension = extension?;
    let key = extension
      .key()
      .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, format!("pax key is not utf-8: {err}")))?;
    if key == "path" || key == "linkpath" {
      continue;
    }
    records.push((key.to_string(), extension.value_bytes().to_vec()));
  }
  Ok(records)
}

/// Write a PAX local extended header holding `records`.
pub(crate) fn append_pax_header<W: Write>(
  builder: &mut tar::Builder<W>,
  records: &[(String, Vec<u8>)],
) -> io::Result<()> {
  let mut data = Vec::new();
  for (key, value) in records {
    encode_pax_record(&mut data, key, value);
  }

  let mut header = tar::Header::new_ustar();
  header.set_path(PAX_HEADER_NAME)?;
  header.set_entry_type(tar::EntryType::XHeader);
  header.set_mode(0o644);
  header.set_mtime(0);
  header.set_size(data.len() as u64);
  header.set_cksum();
  builder.append(&header, data.as_slice())
}

// `<len> <key>=<value>\n`, where `len` counts the whole record including its
// own digits.
fn encode_pax_record(out: &mut Vec<u8>, key: &str, value: &[u8]) {
  let body = key.len() + value.len() + 3;
  let mut len = body;
  loop {
    let total = body + len.to_string().len();
    if total == len {
      break;
    }
    len = total;
  }
  out.extend_from_slice(format!("{len} {key}=").as_bytes());
  out.extend_from_slice(value);
  out.push(b'\n');
}

fn is_link(kind: tar::EntryType) -> bool {
  matches!(kind, tar::EntryType::Link | tar::EntryType::Symlink)
}

/// Normalize an entry name for comparison: no leading `/` or `./`, no
/// trailing `/`.
pub(crate) fn entry_key(path: &Path) -> String {
  let raw = path.to_string_lossy();
  let mut key = raw.as_ref();
  loop {
    if let Some(rest) = key.strip_prefix("./") {
      key = rest;
    } else if let Some(rest) = key.strip_prefix('/') {
      key = rest;
    } else {
      break;
    }
  }
  key.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::testutil::{TestEntry, collect_stream, read_entries, stream_from, tar_bytes};

  #[test]
  fn pax_record_length_counts_itself() {
    let mut out = Vec::new();
    encode_pax_record(&mut out, "SCHILY.xattr.user.k", b"v");
    assert_eq!(out, b"25 SCHILY.xattr.user.k=v\n");

    // 99 bytes before the length; two digits would reach 101, so it takes three.
    out.clear();
    encode_pax_record(&mut out, "k", &[b'x'; 95]);
    assert_eq!(out.len(), 102);
    assert!(out.starts_with(b"102 k="));
  }

  #[test]
  fn entry_key_strips_anchors() {
    assert_eq!(entry_key(Path::new("/requirements.txt")), "requirements.txt");
    assert_eq!(entry_key(Path::new("./requirements.txt")), "requirements.txt");
    assert_eq!(entry_key(Path::new("venv/")), "venv");
    assert_eq!(entry_key(Path::new("a/b")), "a/b");
  }

  #[tokio::test]
  async fn producer_output_arrives_in_order() {
    let stream = spawn_producer("test", |writer| {
      for i in 0..3u8 {
        writer.write_all(&vec![i; CHUNK_SIZE])?;
      }
      Ok(())
    });

    let bytes = collect_stream(stream).await.unwrap();
    assert_eq!(bytes.len(), 3 * CHUNK_SIZE);
    assert!(bytes[..CHUNK_SIZE].iter().all(|b| *b == 0));
    assert!(bytes[2 * CHUNK_SIZE..].iter().all(|b| *b == 2));
  }

  #[tokio::test]
  async fn producer_error_reaches_consumer() {
    let stream = spawn_producer("test", |writer| {
      writer.write_all(b"partial")?;
      writer.flush()?;
      Err(io::Error::other("disk on fire"))
    });

    let err = collect_stream(stream).await.unwrap_err();
    assert_eq!(err.to_string(), "disk on fire");
  }

  #[tokio::test]
  async fn dropped_consumer_stops_producer() {
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let stream = spawn_producer("test", move |writer| {
      let result = (0..1024).try_for_each(|_| writer.write_all(&[0u8; CHUNK_SIZE]));
      let _ = done_tx.send(result);
      Ok(())
    });
    drop(stream);

    let result = done_rx.await.unwrap();
    assert_eq!(result.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
  }

  #[tokio::test]
  async fn long_names_survive_reencoding() {
    let long = format!("{}/file.txt", "nested".repeat(30));
    let input = tar_bytes(&[TestEntry::file(&long, b"data")]);

    let stream = spawn_transform("test", stream_from(input), |reader, writer| {
      let mut archive = tar::Archive::new(reader);
      let mut builder = tar::Builder::new(writer);
      for entry in archive.entries()? {
        let mut entry = entry?;
        let mut header = EntryHeader::from_entry(&mut entry)?;
        header.path = PathBuf::from("prefix").join(&header.path);
        header.append(&mut builder, &mut entry)?;
      }
      builder.finish()
    });

    let entries = read_entries(&collect_stream(stream).await.unwrap());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].path, format!("prefix/{long}"));
    assert_eq!(entries[0].data, b"data");
  }
}
