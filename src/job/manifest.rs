use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Result, SwarmError};

pub const MANIFEST_FILE: &str = "manifest.txt";

const INDENT: &str = "    ";

/// One file of a job. Dynamic files carry no hash/size until produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub hash: String,
    pub size: u64,
    pub dynamic: bool,
}

impl FileEntry {
    pub fn new_static(name: impl Into<String>, hash: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            hash: hash.into(),
            size,
            dynamic: false,
        }
    }

    /// Dynamic placeholder with unknown metadata.
    pub fn new_dynamic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hash: String::new(),
            size: 0,
            dynamic: true,
        }
    }

    pub fn has_metadata(&self) -> bool {
        !self.hash.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Files,
    Exec,
    Dynamic,
    Deps,
}

/// Static description of a job, backed by `manifest.txt`.
#[derive(Debug)]
pub struct Manifest {
    path: PathBuf,
    text: String,
    files: BTreeMap<String, FileEntry>,
    exec_cmd: String,
}

impl Manifest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            text: String::new(),
            files: BTreeMap::new(),
            exec_cmd: String::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw manifest text as read from disk; empty until `read` succeeds.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_read(&self) -> bool {
        !self.text.is_empty()
    }

    pub fn file(&self, name: &str) -> Result<&FileEntry> {
        self.files
            .get(name)
            .ok_or_else(|| SwarmError::FileNotFound(name.to_string()))
    }

    pub fn add_file(&mut self, file: FileEntry) {
        self.files.insert(file.name.clone(), file);
    }

    pub fn files(&self) -> Vec<FileEntry> {
        self.files.values().cloned().collect()
    }

    pub fn exec_cmd(&self) -> &str {
        &self.exec_cmd
    }

    pub fn set_exec_cmd(&mut self, exec_cmd: impl Into<String>) {
        self.exec_cmd = exec_cmd.into();
    }

    /// Read and parse the manifest file. A manifest is read at most once.
    pub fn read(&mut self) -> Result<()> {
        if self.is_read() {
            return Err(SwarmError::Format("Manifest already read".to_string()));
        }

        let bytes = std::fs::read(&self.path).map_err(|e| SwarmError::io("open", e))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| SwarmError::Format(format!("{} is not valid UTF-8", MANIFEST_FILE)))?;
        if text.contains('\0') {
            return Err(SwarmError::Format(format!(
                "{} cannot contain a NUL character",
                MANIFEST_FILE
            )));
        }

        let (files, exec_cmd) = parse(&text)?;
        self.files = files;
        self.exec_cmd = exec_cmd;
        self.text = text;
        Ok(())
    }

    /// Serialize to the manifest text format. Dynamic files are written
    /// name-only regardless of known metadata.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("[files]\n");
        for file in self.files.values().filter(|f| !f.dynamic) {
            let _ = writeln!(out, "{}{} {} {}", INDENT, file.name, file.size, file.hash);
        }
        out.push('\n');

        out.push_str("[exec]\n");
        let _ = writeln!(out, "{}{}", INDENT, self.exec_cmd);
        out.push('\n');

        out.push_str("[dynamic]\n");
        for file in self.files.values().filter(|f| f.dynamic) {
            let _ = writeln!(out, "{}{}", INDENT, file.name);
        }
        out
    }

    pub fn write(&self) -> Result<()> {
        std::fs::write(&self.path, self.render()).map_err(|e| SwarmError::io("write", e))
    }
}

fn parse(text: &str) -> Result<(BTreeMap<String, FileEntry>, String)> {
    let mut files = BTreeMap::new();
    let mut exec_cmd = String::new();
    let mut section = Section::None;

    for (idx, raw) in text.lines().enumerate() {
        let nline = idx + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with('[') {
            section = match line {
                "[files]" => Section::Files,
                "[exec]" => Section::Exec,
                "[dynamic]" => Section::Dynamic,
                "[deps]" => Section::Deps,
                _ => return Err(SwarmError::at_line("Invalid header line", MANIFEST_FILE, nline)),
            };
            continue;
        }

        match section {
            Section::Files => {
                let tokens: Vec<&str> = line.split_whitespace().collect();
                if tokens.len() < 3 {
                    return Err(SwarmError::at_line(
                        "Field missing in file line",
                        MANIFEST_FILE,
                        nline,
                    ));
                }
                let hash = tokens[tokens.len() - 1];
                let size: u64 = tokens[tokens.len() - 2]
                    .parse()
                    .map_err(|_| SwarmError::at_line("Invalid size", MANIFEST_FILE, nline))?;
                let name = tokens[..tokens.len() - 2].join(" ");
                files.insert(name.clone(), FileEntry::new_static(name, hash, size));
            }
            Section::Exec => {
                if !exec_cmd.is_empty() {
                    return Err(SwarmError::at_line(
                        "More than 1 exec line",
                        MANIFEST_FILE,
                        nline,
                    ));
                }
                exec_cmd = line.to_string();
            }
            Section::Dynamic => {
                files.insert(line.to_string(), FileEntry::new_dynamic(line));
            }
            Section::Deps => {
                tracing::warn!(line = nline, "Dependencies not supported, ignoring");
            }
            Section::None => {
                return Err(SwarmError::at_line("Invalid line", MANIFEST_FILE, nline));
            }
        }
    }

    Ok((files, exec_cmd))
}
