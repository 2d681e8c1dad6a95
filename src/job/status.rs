use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

use rand::Rng;

use crate::error::{Result, SwarmError};
use crate::job::blocks::{block_count, BlockState, BlockStates};
use crate::job::manifest::FileEntry;

pub const STATUS_FILE: &str = "status.txt";

const INDENT: &str = "   ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Master,
    ExecutionStatus,
    BlockStatusName,
    BlockStatusBits,
}

/// Persisted mutable progress of a job, backed by `status.txt`.
#[derive(Debug)]
pub struct Status {
    path: PathBuf,
    master: bool,
    execution_finished: bool,
    files: BTreeMap<String, BlockStates>,
}

impl Status {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            master: false,
            execution_finished: false,
            files: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_master(&self) -> bool {
        self.master
    }

    pub fn set_master(&mut self, master: bool) {
        self.master = master;
    }

    pub fn execution_finished(&self) -> bool {
        self.execution_finished
    }

    pub fn set_execution_finished(&mut self, finished: bool) {
        self.execution_finished = finished;
    }

    /// Track a file whose content is already complete locally.
    pub fn add_file(&mut self, file: &FileEntry) {
        let mut blocks = BlockStates::default();
        blocks.set_size(block_count(file.size), BlockState::Done);
        self.files.insert(file.name.clone(), blocks);
    }

    /// Resize an already tracked file to match `file.size`, every block set to `state`.
    pub fn set_file(&mut self, file: &FileEntry, state: BlockState) -> Result<()> {
        self.blocks_mut(&file.name)?
            .set_size(block_count(file.size), state);
        Ok(())
    }

    pub fn reset_file(&mut self, name: &str) -> Result<()> {
        self.blocks_mut(name)?.reset();
        Ok(())
    }

    pub fn set_block_state(&mut self, name: &str, block: usize, state: BlockState) -> Result<()> {
        self.blocks_mut(name)?.set(block, state)
    }

    pub fn has_block(&self, name: &str, block: usize) -> Result<bool> {
        Ok(self.blocks(name)?.get(block)? == BlockState::Done)
    }

    pub fn is_file_finished(&self, name: &str) -> Result<bool> {
        Ok(self.blocks(name)?.finished())
    }

    pub fn block_count(&self, name: &str) -> Result<usize> {
        Ok(self.blocks(name)?.len())
    }

    pub fn blocks(&self, name: &str) -> Result<&BlockStates> {
        self.files
            .get(name)
            .ok_or_else(|| SwarmError::FileNotFound(name.to_string()))
    }

    fn blocks_mut(&mut self, name: &str) -> Result<&mut BlockStates> {
        self.files
            .get_mut(name)
            .ok_or_else(|| SwarmError::FileNotFound(name.to_string()))
    }

    /// Claim an empty block of `name` for download, starting the scan at a
    /// random block so concurrent downloaders spread over the file.
    pub fn claim_empty_block(&mut self, name: &str) -> Result<Option<usize>> {
        let blocks = self.blocks_mut(name)?;
        let n = blocks.len();
        if n == 0 {
            return Ok(None);
        }

        let start = rand::thread_rng().gen_range(0..n);
        for block in (start..n).chain(0..start) {
            if blocks.get(block)? == BlockState::Empty {
                blocks.set(block, BlockState::Downloading)?;
                return Ok(Some(block));
            }
        }
        Ok(None)
    }

    /// Fresh state for `files`: not master, not executed, every block empty.
    pub fn init(&mut self, files: &[FileEntry]) {
        self.master = false;
        self.execution_finished = false;
        self.files = files
            .iter()
            .map(|f| (f.name.clone(), BlockStates::for_size(f.size)))
            .collect();
    }

    /// Load the status file and reconcile it with the manifest's `files`.
    /// Returns `false` when no status file exists yet.
    pub fn read(&mut self, files: &[FileEntry]) -> Result<bool> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(SwarmError::io("open", e)),
        };

        self.parse(&text)?;
        self.reconcile(files);
        Ok(true)
    }

    fn parse(&mut self, text: &str) -> Result<()> {
        let mut section = Section::None;
        let mut current = String::new();

        for (idx, raw) in text.lines().enumerate() {
            let nline = idx + 1;
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') {
                section = match line {
                    "[master]" => Section::Master,
                    "[execution_status]" => Section::ExecutionStatus,
                    "[block_status]" => Section::BlockStatusName,
                    _ => return Err(SwarmError::at_line("Invalid header line", STATUS_FILE, nline)),
                };
                continue;
            }

            match section {
                Section::Master => self.master = line == "true",
                Section::ExecutionStatus => self.execution_finished = line == "true",
                Section::BlockStatusName => {
                    current = line.to_string();
                    self.files.entry(current.clone()).or_default();
                    section = Section::BlockStatusBits;
                }
                Section::BlockStatusBits => {
                    let states = line
                        .chars()
                        .map(|c| match BlockState::from_digit(c) {
                            // in-flight claims do not survive a restart
                            Some(BlockState::Downloading) => Some(BlockState::Empty),
                            other => other,
                        })
                        .collect::<Option<Vec<_>>>()
                        .ok_or_else(|| SwarmError::at_line("Invalid block state", STATUS_FILE, nline))?;
                    self.files.entry(current.clone()).or_default().append_states(&states);
                }
                Section::None => {
                    return Err(SwarmError::at_line("Invalid line", STATUS_FILE, nline));
                }
            }
        }
        Ok(())
    }

    fn reconcile(&mut self, files: &[FileEntry]) {
        for file in files {
            let Some(blocks) = self.files.get(&file.name) else {
                self.files
                    .insert(file.name.clone(), BlockStates::for_size(file.size));
                continue;
            };

            // without a hash the size is unknown too, nothing to compare against
            if !file.has_metadata() {
                continue;
            }

            if blocks.len() != block_count(file.size) {
                tracing::warn!(file = %file.name, "File had an invalid amount of blocks, resetting");
                self.files
                    .insert(file.name.clone(), BlockStates::for_size(file.size));
            }
        }

        if self.files.len() != files.len() {
            tracing::warn!(
                status_files = self.files.len(),
                manifest_files = files.len(),
                "Status does not match manifest, rebuilding"
            );
            self.files = files
                .iter()
                .map(|f| (f.name.clone(), BlockStates::for_size(f.size)))
                .collect();
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "[master]\n{}{}\n", INDENT, self.master);
        let _ = writeln!(out, "[execution_status]\n{}{}\n", INDENT, self.execution_finished);
        for (name, blocks) in &self.files {
            let bits: String = blocks.iter().map(BlockState::as_digit).collect();
            let _ = writeln!(out, "[block_status]\n{}{}\n{}{}\n", INDENT, name, INDENT, bits);
        }
        out
    }

    /// Persist to disk. The file is replaced atomically so a crash never
    /// leaves a truncated status behind.
    pub fn write(&self) -> Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, self.render()).map_err(|e| SwarmError::io("write", e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| SwarmError::io("rename", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::blocks::BLOCK_SIZE;
    use std::collections::HashSet;

    fn files() -> Vec<FileEntry> {
        vec![
            FileEntry::new_static("a.bin", "aa", 3 * BLOCK_SIZE),
            FileEntry::new_static("b.bin", "bb", 10),
        ]
    }

    #[test]
    fn claims_are_distinct_until_exhausted() {
        let mut status = Status::new("unused");
        let k = 7;
        status.init(&[FileEntry::new_static("f", "ff", k * BLOCK_SIZE)]);

        let mut seen = HashSet::new();
        for _ in 0..k {
            let block = status.claim_empty_block("f").unwrap().unwrap();
            assert!(seen.insert(block), "block {} claimed twice", block);
        }
        assert_eq!(status.claim_empty_block("f").unwrap(), None);
        assert!(matches!(
            status.claim_empty_block("nope"),
            Err(SwarmError::FileNotFound(_))
        ));
    }

    #[test]
    fn downloading_reads_back_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATUS_FILE);

        let mut status = Status::new(&path);
        status.init(&files());
        status.set_master(true);
        status.set_block_state("a.bin", 0, BlockState::Done).unwrap();
        status.set_block_state("a.bin", 1, BlockState::Downloading).unwrap();
        status.write().unwrap();

        let mut loaded = Status::new(&path);
        assert!(loaded.read(&files()).unwrap());
        assert!(loaded.is_master());
        assert!(!loaded.execution_finished());
        let blocks = loaded.blocks("a.bin").unwrap();
        assert_eq!(blocks.get(0).unwrap(), BlockState::Done);
        assert_eq!(blocks.get(1).unwrap(), BlockState::Empty);
        assert_eq!(blocks.get(2).unwrap(), BlockState::Empty);
    }

    #[test]
    fn missing_file_is_not_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let mut status = Status::new(dir.path().join(STATUS_FILE));
        assert!(!status.read(&files()).unwrap());
    }

    #[test]
    fn reconcile_resets_files_with_wrong_block_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATUS_FILE);
        std::fs::write(
            &path,
            "[master]\n false\n[execution_status]\n true\n\
             [block_status]\n a.bin\n 22\n[block_status]\n b.bin\n 2\n",
        )
        .unwrap();

        let mut status = Status::new(&path);
        assert!(status.read(&files()).unwrap());
        assert!(status.execution_finished());
        assert_eq!(status.block_count("a.bin").unwrap(), 3);
        assert!(!status.is_file_finished("a.bin").unwrap());
        assert!(status.is_file_finished("b.bin").unwrap());
    }

    #[test]
    fn reconcile_adds_missing_and_skips_hashless_dynamic_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATUS_FILE);
        std::fs::write(
            &path,
            "[block_status]\n a.bin\n 222\n[block_status]\n out\n 22\n",
        )
        .unwrap();

        let mut manifest_files = files();
        manifest_files.push(FileEntry::new_dynamic("out"));

        let mut status = Status::new(&path);
        status.read(&manifest_files).unwrap();
        assert!(status.is_file_finished("a.bin").unwrap());
        assert_eq!(status.block_count("b.bin").unwrap(), 1);
        assert_eq!(status.block_count("out").unwrap(), 2);
    }

    #[test]
    fn reconcile_rebuilds_on_file_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATUS_FILE);
        std::fs::write(
            &path,
            "[block_status]\n a.bin\n 222\n[block_status]\n stale\n 2\n[block_status]\n b.bin\n 2\n",
        )
        .unwrap();

        let mut status = Status::new(&path);
        status.read(&files()).unwrap();
        assert!(status.blocks("stale").is_err());
        assert!(!status.is_file_finished("a.bin").unwrap());
        assert!(!status.is_file_finished("b.bin").unwrap());
    }

    #[test]
    fn rejects_bad_headers_and_digits() {
        for text in ["[weird]\n", "true\n", "[block_status]\n a\n 0x2\n"] {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join(STATUS_FILE);
            std::fs::write(&path, text).unwrap();
            let mut status = Status::new(&path);
            assert!(matches!(status.read(&[]), Err(SwarmError::Format(_))), "{:?}", text);
        }
    }

    #[test]
    fn unknown_file_mutations_fail() {
        let mut status = Status::new("unused");
        status.init(&files());
        assert!(matches!(status.reset_file("zz"), Err(SwarmError::FileNotFound(_))));
        assert!(matches!(
            status.set_block_state("zz", 0, BlockState::Done),
            Err(SwarmError::FileNotFound(_))
        ));
        assert!(matches!(
            status.set_file(&FileEntry::new_static("zz", "00", 1), BlockState::Done),
            Err(SwarmError::FileNotFound(_))
        ));
    }
}
