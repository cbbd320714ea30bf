//! Test utilities for venv-server-lib.
//!
//! Helpers to build small tar archives in memory, feed them through the
//! streaming transforms and read the results back, plus [`RecordingEngine`],
//! an in-process [`Engine`] that records every call it receives.

use std::io;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use tempfile::TempDir;

use crate::archive::ArchiveStream;
use crate::engine::{
  BuildEvent, BuildEvents, BuildOptions, ContainerId, ContainerSpec, Engine, EngineError, ImageId,
};

/// Modification time stamped on every [`TestEntry`].
pub const TEST_MTIME: u64 = 1_600_000_000;

/// Size of the chunks [`stream_from`] splits an archive into.
const TEST_CHUNK: usize = 700;

#[derive(Debug, Clone)]
enum TestKind {
  File(Vec<u8>),
  Dir,
  Symlink(String),
  HardLink(String),
}

/// One entry of an archive built by [`tar_bytes`].
#[derive(Debug, Clone)]
pub struct TestEntry {
  path: String,
  kind: TestKind,
  mode: u32,
  uid: u64,
  pax: Vec<(String, Vec<u8>)>,
}

impl TestEntry {
  pub fn file(path: &str, data: &[u8]) -> Self {
    Self::new(path, TestKind::File(data.to_vec()), 0o644)
  }

  pub fn dir(path: &str) -> Self {
    Self::new(path, TestKind::Dir, 0o755)
  }

  pub fn symlink(path: &str, target: &str) -> Self {
    Self::new(path, TestKind::Symlink(target.to_string()), 0o777)
  }

  pub fn hardlink(path: &str, target: &str) -> Self {
    Self::new(path, TestKind::HardLink(target.to_string()), 0o644)
  }

  pub fn with_mode(mut self, mode: u32) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_uid(mut self, uid: u64) -> Self {
    self.uid = uid;
    self
  }

  /// Precede the entry with a PAX extended header carrying `key=value`. A
  /// `path` record replaces the name in the header block, which then holds
  /// only a truncated copy.
  pub fn with_pax(mut self, key: &str, value: &[u8]) -> Self {
    self.pax.push((key.to_string(), value.to_vec()));
    self
  }

  fn new(path: &str, kind: TestKind, mode: u32) -> Self {
    Self {
      path: path.to_string(),
      kind,
      mode,
      uid: 0,
      pax: Vec::new(),
    }
  }
}

/// Serialize `entries` into a GNU tar archive.
pub fn tar_bytes(entries: &[TestEntry]) -> Vec<u8> {
  let mut builder = tar::Builder::new(Vec::new());

  for entry in entries {
    let mut header = tar::Header::new_gnu();
    header.set_mode(entry.mode);
    header.set_uid(entry.uid);
    header.set_gid(entry.uid);
    header.set_mtime(TEST_MTIME);

    if !entry.pax.is_empty() {
      crate::archive::append_pax_header(&mut builder, &entry.pax)
        .unwrap_or_else(|e| panic!("failed to append pax header for '{}': {e}", entry.path));
    }
    let pax_path = entry.pax.iter().any(|(key, _)| key == "path");

    let result = match &entry.kind {
      TestKind::File(data) if pax_path => {
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        let name = entry.path.as_bytes();
        let len = name.len().min(99);
        header.as_old_mut().name[..len].copy_from_slice(&name[..len]);
        header.set_cksum();
        builder.append(&header, data.as_slice())
      }
      TestKind::File(data) => {
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        builder.append_data(&mut header, &entry.path, data.as_slice())
      }
      TestKind::Dir => {
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        builder.append_data(&mut header, &entry.path, io::empty())
      }
      TestKind::Symlink(target) => {
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        builder.append_link(&mut header, &entry.path, target)
      }
      TestKind::HardLink(target) => {
        header.set_entry_type(tar::EntryType::Link);
        header.set_size(0);
        builder.append_link(&mut header, &entry.path, target)
      }
    };
    result.unwrap_or_else(|e| panic!("failed to append test entry '{}': {e}", entry.path));
  }

  builder.into_inner().expect("failed to finish test archive")
}

/// Serve `data` as an [`ArchiveStream`] in small chunks.
pub fn stream_from(data: Vec<u8>) -> ArchiveStream {
  stream::iter(chunks(data).into_iter().map(Ok)).boxed()
}

/// Serve `data`, then fail with `message`.
pub fn failing_stream(data: Vec<u8>, message: &str) -> ArchiveStream {
  let err = io::Error::other(message.to_string());
  stream::iter(chunks(data).into_iter().map(Ok))
    .chain(stream::once(async move { Err(err) }))
    .boxed()
}

fn chunks(data: Vec<u8>) -> Vec<Bytes> {
  let data = Bytes::from(data);
  (0..data.len())
    .step_by(TEST_CHUNK)
    .map(|start| data.slice(start..(start + TEST_CHUNK).min(data.len())))
    .collect()
}

/// Read a whole archive stream into memory.
pub async fn collect_stream(stream: ArchiveStream) -> io::Result<Vec<u8>> {
  stream
    .try_fold(Vec::new(), |mut out, chunk| async move {
      out.extend_from_slice(&chunk);
      Ok(out)
    })
    .await
}

/// An archive entry as read back by [`read_entries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadEntry {
  pub path: String,
  pub link_name: Option<String>,
  pub kind: tar::EntryType,
  pub mode: u32,
  pub uid: u64,
  pub gid: u64,
  pub mtime: u64,
  pub size: u64,
  pub data: Vec<u8>,
  /// PAX records other than `path` and `linkpath`.
  pub pax: Vec<(String, Vec<u8>)>,
}

/// Parse a tar archive, panicking on malformed input.
pub fn read_entries(data: &[u8]) -> Vec<ReadEntry> {
  let mut archive = tar::Archive::new(data);
  let mut out = Vec::new();

  for entry in archive.entries().expect("archive is readable") {
    let mut entry = entry.expect("entry is readable");
    let header = entry.header().clone();
    let path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
    let link_name = entry
      .link_name_bytes()
      .map(|name| String::from_utf8_lossy(&name).into_owned());
    let size = entry.size();
    let pax = read_pax(&mut entry);
    let mut data = Vec::new();
    io::Read::read_to_end(&mut entry, &mut data).expect("entry content is readable");

    out.push(ReadEntry {
      path,
      link_name,
      kind: header.entry_type(),
      mode: header.mode().expect("mode"),
      uid: header.uid().expect("uid"),
      gid: header.gid().expect("gid"),
      mtime: header.mtime().expect("mtime"),
      size,
      data,
      pax,
    });
  }

  out
}

fn read_pax<R: io::Read>(entry: &mut tar::Entry<'_, R>) -> Vec<(String, Vec<u8>)> {
  if entry.header().entry_type().is_pax_global_extensions() {
    return Vec::new();
  }
  let Some(extensions) = entry.pax_extensions().expect("pax extensions are readable") else {
    return Vec::new();
  };
  extensions
    .map(|ext| ext.expect("pax record is well formed"))
    .filter(|ext| !matches!(ext.key_bytes(), b"path" | b"linkpath"))
    .map(|ext| {
      (
        String::from_utf8_lossy(ext.key_bytes()).into_owned(),
        ext.value_bytes().to_vec(),
      )
    })
    .collect()
}

/// Create a template directory holding `files` (relative path, content).
pub fn write_template(files: &[(&str, &str)]) -> TempDir {
  let dir = TempDir::new().expect("failed to create temp dir");
  populate(dir.path(), files);
  dir
}

/// Write `files` below `root`, creating parent directories.
pub fn populate(root: &Path, files: &[(&str, &str)]) {
  for (relative, content) in files {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).expect("failed to create template dirs");
    }
    std::fs::write(&path, content).expect("failed to write template file");
  }
}

/// A call received by [`RecordingEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
  Build { options: BuildOptions, context: Vec<u8> },
  Create { image: ImageId, spec: ContainerSpec },
  Copy { container: ContainerId, path: String },
  Remove { container: ContainerId },
}

/// How a [`RecordingEngine`] answers.
#[derive(Debug, Clone)]
struct Script {
  build_failure: Option<String>,
  build_yields_image: bool,
  stall_build: bool,
  create_failure: Option<String>,
  copy_missing: bool,
  stall_copy: bool,
  remove_failure: Option<String>,
  export: Vec<u8>,
}

/// An [`Engine`] that answers from a fixed script and records every call.
///
/// By default every call succeeds: the build yields [`RecordingEngine::IMAGE`],
/// the container is [`RecordingEngine::CONTAINER`], and the export is a small
/// `venv/` tree as the engine would return it for `/opt/venv`.
#[derive(Debug)]
pub struct RecordingEngine {
  script: Script,
  calls: Mutex<Vec<EngineCall>>,
}

impl Default for RecordingEngine {
  fn default() -> Self {
    Self::new()
  }
}

impl RecordingEngine {
  pub const IMAGE: &'static str = "sha256:0123456789ab";
  pub const CONTAINER: &'static str = "c0ffee";

  pub fn new() -> Self {
    Self {
      script: Script {
        build_failure: None,
        build_yields_image: true,
        stall_build: false,
        create_failure: None,
        copy_missing: false,
        stall_copy: false,
        remove_failure: None,
        export: tar_bytes(&sample_venv()),
      },
      calls: Mutex::new(Vec::new()),
    }
  }

  /// Report `message` as a failed build step.
  pub fn fail_build(mut self, message: &str) -> Self {
    self.script.build_failure = Some(message.to_string());
    self
  }

  /// Finish the build without ever naming an image.
  pub fn without_image(mut self) -> Self {
    self.script.build_yields_image = false;
    self
  }

  /// Never finish the build event stream.
  pub fn stall_build(mut self) -> Self {
    self.script.stall_build = true;
    self
  }

  pub fn fail_create(mut self, message: &str) -> Self {
    self.script.create_failure = Some(message.to_string());
    self
  }

  /// Report the exported path as missing.
  pub fn missing_path(mut self) -> Self {
    self.script.copy_missing = true;
    self
  }

  /// Never answer the export call.
  pub fn stall_copy(mut self) -> Self {
    self.script.stall_copy = true;
    self
  }

  pub fn fail_remove(mut self, message: &str) -> Self {
    self.script.remove_failure = Some(message.to_string());
    self
  }

  /// Export `archive` instead of the default tree.
  pub fn with_export(mut self, archive: Vec<u8>) -> Self {
    self.script.export = archive;
    self
  }

  /// Every call so far, in order.
  pub fn calls(&self) -> Vec<EngineCall> {
    self.lock().clone()
  }

  /// Containers removed so far.
  pub fn removals(&self) -> Vec<ContainerId> {
    self
      .lock()
      .iter()
      .filter_map(|call| match call {
        EngineCall::Remove { container } => Some(container.clone()),
        _ => None,
      })
      .collect()
  }

  /// The build context received by the first build call.
  pub fn build_context(&self) -> Option<Vec<u8>> {
    self.lock().iter().find_map(|call| match call {
      EngineCall::Build { context, .. } => Some(context.clone()),
      _ => None,
    })
  }

  /// Wait until a recorded call satisfies `predicate`, panicking after a few
  /// seconds.
  pub async fn wait_for(&self, predicate: impl Fn(&EngineCall) -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
      while !self.lock().iter().any(&predicate) {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await;
    assert!(waited.is_ok(), "expected engine call never arrived: {:?}", self.calls());
  }

  fn record(&self, call: EngineCall) {
    self.lock().push(call);
  }

  fn lock(&self) -> MutexGuard<'_, Vec<EngineCall>> {
    self.calls.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

#[async_trait]
impl Engine for RecordingEngine {
  async fn build_image(&self, context: ArchiveStream, options: BuildOptions) -> Result<BuildEvents, EngineError> {
    let context = collect_stream(context).await.map_err(EngineError::Context)?;
    self.record(EngineCall::Build { options, context });

    let mut events = vec![Ok(BuildEvent::Progress("Step 1/3 : FROM python:3.9".to_string()))];
    match &self.script.build_failure {
      Some(message) => events.push(Ok(BuildEvent::Failed(message.clone()))),
      None if self.script.build_yields_image => events.push(Ok(BuildEvent::Built(ImageId(Self::IMAGE.to_string())))),
      None => {}
    }

    let events = stream::iter(events);
    if self.script.stall_build {
      return Ok(events.chain(stream::pending()).boxed());
    }
    Ok(events.boxed())
  }

  async fn create_container(&self, image: &ImageId, spec: &ContainerSpec) -> Result<ContainerId, EngineError> {
    self.record(EngineCall::Create {
      image: image.clone(),
      spec: spec.clone(),
    });
    match &self.script.create_failure {
      Some(message) => Err(EngineError::Request(message.clone())),
      None => Ok(ContainerId(Self::CONTAINER.to_string())),
    }
  }

  async fn copy_from_container(&self, container: &ContainerId, path: &str) -> Result<ArchiveStream, EngineError> {
    self.record(EngineCall::Copy {
      container: container.clone(),
      path: path.to_string(),
    });
    if self.script.stall_copy {
      futures::future::pending::<()>().await;
    }
    if self.script.copy_missing {
      return Err(EngineError::NotFound(format!("Could not find the file {path} in container {container}")));
    }
    Ok(stream_from(self.script.export.clone()))
  }

  async fn remove_container(&self, container: &ContainerId) -> Result<(), EngineError> {
    self.record(EngineCall::Remove {
      container: container.clone(),
    });
    match &self.script.remove_failure {
      Some(message) => Err(EngineError::Request(message.clone())),
      None => Ok(()),
    }
  }
}

/// The tree an engine exports for `/opt/venv`: entries named from `venv/`.
pub fn sample_venv() -> Vec<TestEntry> {
  vec![
    TestEntry::dir("venv/"),
    TestEntry::dir("venv/bin/"),
    TestEntry::file("venv/bin/activate", b"# activate\n"),
    TestEntry::file("venv/bin/pip", b"#!/opt/venv/bin/python\n").with_mode(0o755),
    TestEntry::hardlink("venv/bin/pip3", "venv/bin/pip"),
    TestEntry::symlink("venv/bin/python", "/usr/local/bin/python3"),
    TestEntry::file("venv/pyvenv.cfg", b"home = /usr/local/bin\n"),
  ]
}
