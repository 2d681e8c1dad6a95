//! Per-job replication state.
//!
//! A [`Job`] owns the [`Manifest`] and [`Status`] of one job directory behind a
//! single mutex. Every public method takes the lock for its whole duration and
//! then delegates to [`JobState`], whose methods assume the lock is held and
//! only ever call each other. `JobState` is private to this module, so nothing
//! outside can re-enter the locking layer while the lock is held.
//!
//! # Layout
//!
//! ```text
//! <download_root>/<job_id>/
//!     manifest.txt
//!     status.txt
//!     <job files...>
//! ```

pub mod blocks;
pub mod create;
pub mod hash;
pub mod manifest;
pub mod status;

use std::fmt;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

use crate::error::{Result, SwarmError};
pub use blocks::{BlockState, BlockStates, BLOCK_SIZE};
pub use manifest::{FileEntry, Manifest, MANIFEST_FILE};
pub use status::{Status, STATUS_FILE};

/// Longest path the node will construct for a job file.
pub const MAX_PATH_LEN: usize = 4096;

/// Job identifier: lowercase hex SHA-256 of the job's manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobId(String);

impl JobId {
    pub const LEN: usize = 64;

    pub fn parse(s: &str) -> Result<Self> {
        if Self::is_valid(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(SwarmError::InvalidJobId(s.to_string()))
        }
    }

    pub fn is_valid(s: &str) -> bool {
        s.len() == Self::LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }

    /// Id of the manifest content `text`.
    pub fn of_manifest(text: &[u8]) -> Self {
        Self(hash::sha256_hex(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = SwarmError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Resolve `name` inside `dir`, rejecting names that would leave the
/// directory and paths longer than [`MAX_PATH_LEN`].
pub fn job_file_path(dir: &Path, name: &str) -> Result<PathBuf> {
    let mut components = Path::new(name).components();
    let single_normal = matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none();
    if name.is_empty() || !single_normal {
        return Err(SwarmError::InvalidFileName(name.to_string()));
    }

    let path = dir.join(name);
    let len = path.as_os_str().len();
    if len > MAX_PATH_LEN {
        return Err(SwarmError::PathTooLong {
            len,
            max: MAX_PATH_LEN,
        });
    }
    Ok(path)
}

/// Hash and size of each of `files` present in `dir`. Files not produced
/// are skipped.
fn hash_present(dir: &Path, files: Vec<FileEntry>) -> Result<Vec<FileEntry>> {
    let mut hashed = Vec::with_capacity(files.len());
    for mut file in files {
        let path = job_file_path(dir, &file.name)?;
        match hash::hash_and_size(&path).map_err(|e| SwarmError::io("read", e))? {
            Some((hash, size)) => {
                file.hash = hash;
                file.size = size;
                hashed.push(file);
            }
            None => tracing::debug!(file = %file.name, "Dynamic file not produced"),
        }
    }
    Ok(hashed)
}

fn write_at(path: &Path, offset: u64, data: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| SwarmError::io("open", e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| SwarmError::io("seek", e))?;
    file.write_all(data).map_err(|e| SwarmError::io("write", e))
}

/// Block progress of one file.
#[derive(Debug, Clone, Serialize)]
pub struct FileProgress {
    pub name: String,
    pub size: u64,
    pub dynamic: bool,
    pub blocks_done: usize,
    pub blocks_total: usize,
}

pub struct Job {
    id: JobId,
    dir: PathBuf,
    state: Mutex<JobState>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl Job {
    pub fn new(dir: impl Into<PathBuf>, id: JobId) -> Self {
        let dir = dir.into();
        let state = JobState {
            manifest: Manifest::new(dir.join(MANIFEST_FILE)),
            status: Status::new(dir.join(STATUS_FILE)),
            dir: dir.clone(),
            id: id.clone(),
            loaded: false,
        };
        Self {
            id,
            dir,
            state: Mutex::new(state),
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    /// Path of a job file, validated against the job directory.
    pub fn file_path(&self, name: &str) -> Result<PathBuf> {
        job_file_path(&self.dir, name)
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        // state is only mutated through whole operations; a panic mid-way
        // leaves nothing half-applied that a reload would not also see
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Manifest text, or `None` until it has been read.
    pub fn manifest_text(&self) -> Option<String> {
        let state = self.lock();
        state
            .manifest
            .is_read()
            .then(|| state.manifest.text().to_string())
    }

    pub fn read_manifest(&self) -> Result<()> {
        let rehash = self.lock().read_manifest()?;
        // dynamic metadata lives only in memory; rebuild it after a restart
        if rehash {
            self.hash_dynamic_files()?;
        }
        Ok(())
    }

    /// Load manifest and status for inspection only. Nothing is written to
    /// disk and produced files are not re-hashed, so a running node owning
    /// the same directory is left undisturbed. A missing status file reads
    /// as a fresh one.
    pub fn read_snapshot(&self) -> Result<()> {
        self.lock().read_snapshot()
    }

    pub fn is_finished(&self, name: &str) -> bool {
        self.lock().is_finished(name)
    }

    pub fn is_master(&self) -> bool {
        self.lock().status.is_master()
    }

    /// Store one block and mark it done. The bytes land on disk without the
    /// job lock held; only the status update takes it.
    pub fn write_block(&self, name: &str, block: usize, data: &[u8]) -> Result<()> {
        let (path, offset) = self.lock().block_target(name, block, data.len())?;
        write_at(&path, offset, data)?;

        let mut state = self.lock();
        state.status.set_block_state(name, block, BlockState::Done)?;
        state.status.write()
    }

    /// Content of a finished block, `None` if the block is not available.
    pub fn read_block(&self, name: &str, block: usize) -> Result<Option<Vec<u8>>> {
        self.lock().read_block(name, block)
    }

    /// Exact byte length block `block` of `name` must have.
    pub fn block_len(&self, name: &str, block: usize) -> Result<usize> {
        self.lock().block_span(name, block).map(|(_, len)| len)
    }

    pub fn claim_empty_block(&self, name: &str) -> Result<Option<usize>> {
        self.lock().status.claim_empty_block(name)
    }

    pub fn files(&self) -> Result<Vec<FileEntry>> {
        let state = self.lock();
        if !state.manifest.is_read() {
            return Err(SwarmError::ManifestNotRead(self.id.clone()));
        }
        Ok(state.manifest.files())
    }

    /// Mark every block of `name` empty again and persist the status.
    pub fn reset_file(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.status.reset_file(name)?;
        state.status.write()
    }

    /// Merge dynamic file metadata reported by the executing peer.
    pub fn update_dynamic_metadata(&self, files: &[FileEntry]) -> Result<()> {
        self.lock().update_dynamic_metadata(files)
    }

    /// Hash every produced dynamic file and mark it complete. Hashing runs
    /// without the job lock held.
    pub fn hash_dynamic_files(&self) -> Result<()> {
        let dynamic = self.lock().dynamic_files();
        let hashed = hash_present(&self.dir, dynamic)?;
        let mut state = self.lock();
        state.record_dynamic(&hashed)?;
        state.status.write()
    }

    /// Dynamic files with their metadata, once that metadata can be published.
    pub fn dynamic_metadata(&self) -> Option<Vec<FileEntry>> {
        self.lock().dynamic_metadata()
    }

    pub fn exec_cmd(&self) -> String {
        self.lock().manifest.exec_cmd().to_string()
    }

    pub fn execution_finished(&self) -> Result<()> {
        // the executing peer is the authority on its outputs
        let hashed = if self.is_master() {
            Vec::new()
        } else {
            let dynamic = self.lock().dynamic_files();
            hash_present(&self.dir, dynamic).unwrap_or_else(|e| {
                tracing::error!(job_id = %self.id, error = %e, "Failed to hash produced files");
                Vec::new()
            })
        };

        let mut state = self.lock();
        if let Err(e) = state.record_dynamic(&hashed) {
            tracing::error!(job_id = %self.id, error = %e, "Failed to record produced files");
        }
        state.status.set_execution_finished(true);
        state.status.write()
    }

    pub fn is_execution_finished(&self) -> bool {
        self.lock().status.execution_finished()
    }

    pub fn progress(&self) -> Result<Vec<FileProgress>> {
        let state = self.lock();
        if !state.manifest.is_read() {
            return Err(SwarmError::ManifestNotRead(self.id.clone()));
        }
        state
            .manifest
            .files()
            .into_iter()
            .map(|f| {
                let blocks = state.status.blocks(&f.name)?;
                Ok(FileProgress {
                    blocks_done: blocks.done_count(),
                    blocks_total: blocks.len(),
                    name: f.name,
                    size: f.size,
                    dynamic: f.dynamic,
                })
            })
            .collect()
    }
}

/// Lock-held half of [`Job`]. Methods here never take the job lock.
#[derive(Debug)]
struct JobState {
    id: JobId,
    dir: PathBuf,
    manifest: Manifest,
    status: Status,
    loaded: bool,
}

impl JobState {
    /// Load manifest and status. Returns whether dynamic files need to be
    /// re-hashed because execution finished on an earlier run.
    fn read_manifest(&mut self) -> Result<bool> {
        if self.loaded {
            return Ok(false);
        }

        self.manifest.read()?;
        let files = self.manifest.files();
        if !self.status.read(&files)? {
            self.status.init(&files);
            self.status.write()?;
        }
        self.loaded = true;
        Ok(self.status.execution_finished())
    }

    fn read_snapshot(&mut self) -> Result<()> {
        if self.manifest.is_read() {
            return Ok(());
        }
        self.manifest.read()?;
        let files = self.manifest.files();
        if !self.status.read(&files)? {
            self.status.init(&files);
        }
        Ok(())
    }

    fn is_finished(&self, name: &str) -> bool {
        let finished = self
            .manifest
            .file(name)
            .and_then(|file| {
                if !file.has_metadata() {
                    return Ok(false);
                }
                self.status.is_file_finished(name)
            });
        match finished {
            Ok(finished) => finished,
            Err(e) => {
                tracing::warn!(job_id = %self.id, file = name, error = %e, "Cannot check file");
                false
            }
        }
    }

    fn block_span(&self, name: &str, block: usize) -> Result<(u64, usize)> {
        let n_blocks = self.status.block_count(name)?;
        let invalid = || SwarmError::InvalidBlockId {
            file: name.to_string(),
            block,
        };
        if block >= n_blocks {
            return Err(invalid());
        }
        let file = self.manifest.file(name)?;
        blocks::block_span(file.size, block).ok_or_else(invalid)
    }

    /// Path and offset block `block` of `name` is written to, once `len`
    /// is checked against the block's exact size.
    fn block_target(&self, name: &str, block: usize, len: usize) -> Result<(PathBuf, u64)> {
        let (offset, expected) = self.block_span(name, block)?;
        if len != expected {
            return Err(SwarmError::BlockSizeMismatch {
                file: name.to_string(),
                block,
                expected,
                actual: len,
            });
        }
        Ok((job_file_path(&self.dir, name)?, offset))
    }

    fn read_block(&self, name: &str, block: usize) -> Result<Option<Vec<u8>>> {
        if !self.status.has_block(name, block)? {
            return Ok(None);
        }
        let (offset, len) = self.block_span(name, block)?;

        let path = job_file_path(&self.dir, name)?;
        let mut file = std::fs::File::open(&path).map_err(|e| SwarmError::io("open", e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| SwarmError::io("seek", e))?;
        let mut data = vec![0u8; len];
        file.read_exact(&mut data)
            .map_err(|e| SwarmError::io("read", e))?;
        Ok(Some(data))
    }

    fn update_dynamic_metadata(&mut self, files: &[FileEntry]) -> Result<()> {
        if !self.status.is_master() {
            return Err(SwarmError::NotMaster(self.id.clone()));
        }
        if let Some(file) = files.iter().find(|f| !f.dynamic) {
            return Err(SwarmError::NotDynamic(file.name.clone()));
        }

        for file in files {
            match self.manifest.file(&file.name) {
                Ok(known) if !known.dynamic => return Err(SwarmError::NotDynamic(file.name.clone())),
                Ok(_) => {}
                Err(_) => {
                    return Err(SwarmError::Format(format!(
                        "Dynamic file {} is not part of job {}",
                        file.name, self.id
                    )))
                }
            }
            self.status.set_file(file, BlockState::Empty)?;
            self.manifest.add_file(file.clone());
        }
        self.status.write()
    }

    fn dynamic_files(&self) -> Vec<FileEntry> {
        self.manifest.files().into_iter().filter(|f| f.dynamic).collect()
    }

    /// Store freshly computed metadata of produced files, all blocks done.
    fn record_dynamic(&mut self, files: &[FileEntry]) -> Result<()> {
        for file in files {
            self.status.set_file(file, BlockState::Done)?;
            self.manifest.add_file(file.clone());
        }
        Ok(())
    }

    /// Only files with a known hash are published; declared outputs the
    /// executable never produced are left out.
    fn dynamic_metadata(&self) -> Option<Vec<FileEntry>> {
        let dynamic = self.dynamic_files();
        let complete = !dynamic.is_empty() && dynamic.iter().all(FileEntry::has_metadata);
        if self.status.execution_finished() || complete {
            Some(dynamic.into_iter().filter(FileEntry::has_metadata).collect())
        } else {
            None
        }
    }
}
