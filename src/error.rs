use thiserror::Error;

use crate::job::JobId;

#[derive(Error, Debug)]
pub enum SwarmError {
    #[error("Format error: {0}")]
    Format(String),

    #[error("{op}(): {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid block id {block} for file {file}")]
    InvalidBlockId { file: String, block: usize },

    #[error("Block {block} of {file} has {actual} bytes, expected {expected}")]
    BlockSizeMismatch {
        file: String,
        block: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Path too long: {len} bytes exceeds maximum {max}")]
    PathTooLong { len: usize, max: usize },

    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("Invalid job id: {0:?}")]
    InvalidJobId(String),

    #[error("Job {0} is not mastered by this node")]
    NotMaster(JobId),

    #[error("File is not dynamic: {0}")]
    NotDynamic(String),

    #[error("Manifest of job {0} has not been read")]
    ManifestNotRead(JobId),

    #[error("Tracker error: {0}")]
    Tracker(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Shutting down")]
    Shutdown,
}

impl SwarmError {
    /// Wrap an OS error with the name of the operation that failed.
    pub fn io(op: &'static str, source: std::io::Error) -> Self {
        SwarmError::Io { op, source }
    }

    /// Format error pointing at a line of a parsed text file.
    pub fn at_line(what: &str, file: &str, line: usize) -> Self {
        SwarmError::Format(format!("{} in {} [line {}]", what, file, line))
    }

    /// Malformed input or a role violation, as opposed to a failed syscall
    /// or an unreachable peer.
    pub fn is_format(&self) -> bool {
        matches!(
            self,
            SwarmError::Format(_)
                | SwarmError::FileNotFound(_)
                | SwarmError::InvalidBlockId { .. }
                | SwarmError::BlockSizeMismatch { .. }
                | SwarmError::InvalidFileName(_)
                | SwarmError::InvalidJobId(_)
                | SwarmError::NotMaster(_)
                | SwarmError::NotDynamic(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SwarmError>;
