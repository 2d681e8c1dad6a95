//! Creating new jobs on the master and joining existing ones.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{Result, SwarmError};
use crate::job::hash;
use crate::job::manifest::{FileEntry, Manifest, MANIFEST_FILE};
use crate::job::status::{Status, STATUS_FILE};
use crate::job::{job_file_path, JobId};

/// What goes into a new job.
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    /// Static input files, copied into the job directory under their base name.
    pub files: Vec<PathBuf>,
    /// Job file to execute, relative to the job directory.
    pub exec_cmd: Option<String>,
    /// Names of the files the job produces.
    pub dynamic: Vec<String>,
}

/// Build a job directory under `root` and return its id. The calling node
/// becomes master of the job.
pub fn create_job(root: &Path, spec: &JobSpec) -> Result<JobId> {
    if !spec.dynamic.is_empty() && spec.exec_cmd.as_deref().unwrap_or("").is_empty() {
        return Err(SwarmError::Format(
            "Dynamic files require an exec command".to_string(),
        ));
    }

    std::fs::create_dir_all(root).map_err(|e| SwarmError::io("mkdir", e))?;
    let tmp = root.join(format!(".tmp-{}", Uuid::new_v4()));
    std::fs::create_dir(&tmp).map_err(|e| SwarmError::io("mkdir", e))?;

    let result = populate(&tmp, spec).and_then(|id| {
        let dir = root.join(id.as_str());
        if dir.exists() {
            return Err(SwarmError::Format(format!("Job {} already exists", id)));
        }
        std::fs::rename(&tmp, &dir).map_err(|e| SwarmError::io("rename", e))?;
        Ok(id)
    });

    if result.is_err() {
        if let Err(e) = std::fs::remove_dir_all(&tmp) {
            tracing::warn!(dir = %tmp.display(), error = %e, "Failed to clean up job directory");
        }
    }
    result
}

fn populate(dir: &Path, spec: &JobSpec) -> Result<JobId> {
    let mut manifest = Manifest::new(dir.join(MANIFEST_FILE));

    for source in &spec.files {
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SwarmError::InvalidFileName(source.display().to_string()))?;
        if name == MANIFEST_FILE || name == STATUS_FILE || !survives_manifest(name) {
            return Err(SwarmError::InvalidFileName(name.to_string()));
        }
        if manifest.file(name).is_ok() {
            return Err(SwarmError::Format(format!("Duplicate file {}", name)));
        }

        let dest = job_file_path(dir, name)?;
        std::fs::copy(source, &dest).map_err(|e| SwarmError::io("copy", e))?;
        let (hash, size) = hash::hash_and_size(&dest)
            .map_err(|e| SwarmError::io("read", e))?
            .ok_or_else(|| SwarmError::FileNotFound(name.to_string()))?;
        manifest.add_file(FileEntry::new_static(name, hash, size));
    }

    for name in &spec.dynamic {
        job_file_path(dir, name)?;
        if !survives_manifest(name) {
            return Err(SwarmError::InvalidFileName(name.clone()));
        }
        if manifest.file(name).is_ok() {
            return Err(SwarmError::Format(format!("Duplicate file {}", name)));
        }
        manifest.add_file(FileEntry::new_dynamic(name.clone()));
    }

    if let Some(cmd) = &spec.exec_cmd {
        match manifest.file(cmd) {
            Ok(file) if !file.dynamic => {}
            _ => {
                return Err(SwarmError::Format(format!(
                    "Exec command {} is not a static job file",
                    cmd
                )))
            }
        }
        manifest.set_exec_cmd(cmd.clone());
    }

    let text = manifest.render();
    std::fs::write(manifest.path(), &text).map_err(|e| SwarmError::io("write", e))?;

    // the creator already holds every static file
    let mut status = Status::new(dir.join(STATUS_FILE));
    status.set_master(true);
    for file in manifest.files() {
        if file.dynamic {
            status.add_file(&FileEntry::new_dynamic(file.name));
        } else {
            status.add_file(&file);
        }
    }
    status.write()?;

    Ok(JobId::of_manifest(text.as_bytes()))
}

/// Manifest lines are whitespace-split, so names must use single inner spaces.
fn survives_manifest(name: &str) -> bool {
    name.split_whitespace().collect::<Vec<_>>().join(" ") == name
}

/// Create the empty directory of a job this node should replicate.
pub fn add_job_dir(root: &Path, id: &JobId) -> Result<PathBuf> {
    std::fs::create_dir_all(root).map_err(|e| SwarmError::io("mkdir", e))?;
    let dir = root.join(id.as_str());
    std::fs::create_dir(&dir).map_err(|e| SwarmError::io("mkdir", e))?;
    Ok(dir)
}
