use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::error::{Result, SwarmError};
use crate::job::{job_file_path, JobId};

/// rwxr--r--
const EXEC_MODE: u32 = 0o744;

/// Bytes of stdout and of stderr kept in the result. Anything past that is
/// read and discarded.
pub const MAX_CAPTURE: usize = 64 * 1024;

/// Result of job execution
#[derive(Debug)]
pub struct ExecutionResult {
    pub job_id: JobId,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Runs a job's executable inside its job directory.
///
/// The executable is a file of the job itself. It is made executable, run
/// with the job directory as working directory and its base name as
/// `argv[0]`, and waited for. A non-zero exit is reported in the result;
/// only failing to start or wait for the process is an error.
#[derive(Debug, Clone, Default)]
pub struct JobExecutor;

impl JobExecutor {
    pub fn new() -> Self {
        Self
    }

    pub async fn execute(&self, job_id: &JobId, job_dir: &Path, exec_cmd: &str) -> Result<ExecutionResult> {
        let path = job_file_path(job_dir, exec_cmd)?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(EXEC_MODE))
            .await
            .map_err(|e| SwarmError::io("chmod", e))?;

        tracing::info!(job_id = %job_id, command = exec_cmd, "Executing job");

        let mut child = Command::new(&path)
            .arg0(exec_cmd)
            .current_dir(job_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SwarmError::io("execv", e))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (stdout, stderr, status) = tokio::join!(capture(stdout), capture(stderr), child.wait());
        let status = status.map_err(|e| SwarmError::io("waitpid", e))?;

        Ok(Self::process_output(job_id, status, &stdout, &stderr))
    }

    fn process_output(
        job_id: &JobId,
        status: std::process::ExitStatus,
        stdout: &[u8],
        stderr: &[u8],
    ) -> ExecutionResult {
        let stdout = String::from_utf8_lossy(stdout).to_string();
        let stderr = String::from_utf8_lossy(stderr).to_string();
        let exit_code = status.code();
        let success = status.success();

        if success {
            tracing::info!(job_id = %job_id, exit_code = ?exit_code, "Job completed");
        } else {
            tracing::warn!(job_id = %job_id, exit_code = ?exit_code, stderr = %stderr.trim_end(), "Job exited with failure");
        }

        ExecutionResult {
            job_id: job_id.clone(),
            exit_code,
            success,
            output: if stdout.is_empty() { None } else { Some(stdout) },
            error: if stderr.is_empty() { None } else { Some(stderr) },
        }
    }
}

/// Keep the first [`MAX_CAPTURE`] bytes of `stream` and drain the rest, so
/// the child never blocks on a full pipe.
async fn capture<R: AsyncRead + Unpin>(stream: Option<R>) -> Vec<u8> {
    let Some(mut stream) = stream else {
        return Vec::new();
    };
    let mut kept = Vec::new();
    if let Err(e) = (&mut stream).take(MAX_CAPTURE as u64).read_to_end(&mut kept).await {
        tracing::debug!(error = %e, "Failed to read job output");
    }
    if let Err(e) = tokio::io::copy(&mut stream, &mut tokio::io::sink()).await {
        tracing::debug!(error = %e, "Failed to drain job output");
    }
    kept
}
