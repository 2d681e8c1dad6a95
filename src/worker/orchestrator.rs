//! Drives one job from "known id" to "replicated, executed and verified".
//!
//! # Phases
//!
//! 1. Fetch `manifest.txt` from any peer holding the job, if missing
//! 2. Load manifest and status
//! 3. Master only, before execution: hand the job to an idle peer, then
//!    wait for that peer to publish the metadata of the produced files
//! 4. Download every unfinished file block by block
//! 5. Verify content hashes; failed files are reset and phase 4 repeats
//! 6. Non-master only: run the job's executable
//! 7. Mark execution finished
//!
//! Every phase that needs a remote peer retries forever, sleeping the
//! configured retry interval between rounds.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::context::NodeContext;
use crate::error::{Result, SwarmError};
use crate::job::{hash, FileEntry, Job};
use crate::protocol::client::{PeerClient, PeerReply};
use crate::protocol::tracker::{PeerAddr, TrackerKey};
use crate::worker::executor::JobExecutor;
use crate::worker::retry::{NextAction, Outcome, PeerRotation};

pub struct JobWorker {
    ctx: Arc<NodeContext>,
    job: Arc<Job>,
    shutdown: CancellationToken,
}

impl JobWorker {
    pub fn new(ctx: Arc<NodeContext>, job: Arc<Job>, shutdown: CancellationToken) -> Self {
        Self { ctx, job, shutdown }
    }

    pub async fn run(&self) -> Result<()> {
        let job_id = self.job.id().clone();
        tracing::info!(job_id = %job_id, "Job worker starting");

        self.acquire_manifest().await?;
        self.blocking(|job| job.read_manifest()).await?;

        if self.job.is_master() && !self.job.is_execution_finished() {
            self.inform_idle_worker().await?;
            self.ingest_dynamic_metadata().await?;
        }

        loop {
            self.replicate().await?;
            if self.verify().await? {
                break;
            }
        }

        if !self.job.is_master() && !self.job.is_execution_finished() {
            self.execute().await?;
        }

        self.blocking(|job| job.execution_finished()).await?;
        tracing::info!(job_id = %job_id, "Job worker finished");
        Ok(())
    }

    async fn acquire_manifest(&self) -> Result<()> {
        let path = self.job.manifest_path();
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|e| SwarmError::io("lstat", e))?;
        if exists {
            return Ok(());
        }

        let id = self.job.id().clone();
        let manifest = self
            .until_served(TrackerKey::from(&id), "manifest", |client| {
                let id = id.clone();
                async move { client.get_manifest(&id).await }
            })
            .await?;

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, &manifest)
            .await
            .map_err(|e| SwarmError::io("write", e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| SwarmError::io("rename", e))?;
        tracing::info!(job_id = %id, "Manifest downloaded");
        Ok(())
    }

    async fn inform_idle_worker(&self) -> Result<()> {
        let id = self.job.id().clone();
        let peer = self
            .until_served(TrackerKey::Idle, "idle worker", |client| {
                let id = id.clone();
                async move {
                    match client.inform_job(&id).await {
                        PeerReply::Ready(()) => PeerReply::Ready(client.addr().clone()),
                        PeerReply::Declined => PeerReply::Declined,
                        PeerReply::Failed(e) => PeerReply::Failed(e),
                    }
                }
            })
            .await?;
        tracing::info!(job_id = %id, peer = %peer, "Job handed to idle worker");
        Ok(())
    }

    async fn ingest_dynamic_metadata(&self) -> Result<()> {
        let id = self.job.id().clone();
        let files = self
            .until_served(TrackerKey::from(&id), "dynamic metadata", |client| {
                let id = id.clone();
                async move { client.get_dynamic_metadata(&id).await }
            })
            .await?;

        tracing::info!(job_id = %id, files = files.len(), "Received dynamic metadata");
        self.blocking(move |job| job.update_dynamic_metadata(&files))
            .await
    }

    async fn replicate(&self) -> Result<()> {
        let is_master = self.job.is_master();
        for file in self.job.files()? {
            if file.dynamic && !is_master {
                continue;
            }
            if self.job.is_finished(&file.name) {
                continue;
            }
            self.download_file(&file).await?;
            tracing::info!(job_id = %self.job.id(), file = %file.name, "File downloaded");
        }
        Ok(())
    }

    async fn download_file(&self, file: &FileEntry) -> Result<()> {
        let id = self.job.id().clone();
        while let Some(block) = self.job.claim_empty_block(&file.name)? {
            let expected = self.job.block_len(&file.name, block)?;
            let what = format!("block {}:{}", file.name, block);
            let data = self
                .until_served(TrackerKey::from(&id), &what, |client| {
                    let id = id.clone();
                    let name = file.name.clone();
                    async move {
                        match client.get_block(&id, &name, block).await {
                            PeerReply::Ready(data) if data.len() != expected => PeerReply::Failed(
                                format!("block has {} bytes, expected {}", data.len(), expected),
                            ),
                            other => other,
                        }
                    }
                })
                .await?;

            let name = file.name.clone();
            self.blocking(move |job| job.write_block(&name, block, &data))
                .await?;
            tracing::debug!(job_id = %id, file = %file.name, block, "Block stored");
        }
        Ok(())
    }

    /// Re-hash every file with a known hash. Returns false if any file had
    /// to be reset.
    async fn verify(&self) -> Result<bool> {
        let is_master = self.job.is_master();
        let mut clean = true;

        for file in self.job.files()? {
            if !file.has_metadata() {
                if is_master {
                    tracing::warn!(job_id = %self.job.id(), file = %file.name, "Skipping check, metadata is missing");
                }
                continue;
            }

            let path = self.job.file_path(&file.name)?;
            let size = file.size;
            let hashed = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
                match hash::hash_and_size(&path).map_err(|e| SwarmError::io("read", e))? {
                    Some((hash, _)) => Ok(Some(hash)),
                    // empty files have no blocks, so no download ever creates them
                    None if size == 0 => {
                        std::fs::write(&path, b"").map_err(|e| SwarmError::io("write", e))?;
                        Ok(Some(hash::sha256_hex(b"")))
                    }
                    None => Ok(None),
                }
            })
            .await
            .map_err(|e| SwarmError::Task(e.to_string()))??;

            if hashed.as_deref() != Some(file.hash.as_str()) {
                tracing::warn!(job_id = %self.job.id(), file = %file.name, "File failed to verify");
                let name = file.name.clone();
                self.blocking(move |job| job.reset_file(&name)).await?;
                clean = false;
            }
        }

        if clean {
            tracing::info!(job_id = %self.job.id(), "Files verified");
        }
        Ok(clean)
    }

    async fn execute(&self) -> Result<()> {
        let exec_cmd = self.job.exec_cmd();
        if exec_cmd.is_empty() {
            tracing::info!(job_id = %self.job.id(), "Job has nothing to execute");
            return Ok(());
        }

        JobExecutor::new()
            .execute(self.job.id(), self.job.dir(), &exec_cmd)
            .await?;
        Ok(())
    }

    /// Ask the peers serving `key` until one of them delivers. Sleeps the
    /// retry interval whenever every peer has been tried.
    async fn until_served<T, F, Fut>(&self, key: TrackerKey, what: &str, mut request: F) -> Result<T>
    where
        F: FnMut(PeerClient) -> Fut,
        Fut: Future<Output = PeerReply<T>>,
    {
        loop {
            let mut rotation = PeerRotation::new(self.query(&key).await);
            let mut outcome = Outcome::Start;
            let mut served = None;

            loop {
                match rotation.next(outcome) {
                    NextAction::TryPeer(peer) => {
                        outcome = match request(self.client(peer.clone())).await {
                            PeerReply::Ready(value) => {
                                served = Some(value);
                                Outcome::Succeeded
                            }
                            PeerReply::Declined => {
                                tracing::debug!(job_id = %self.job.id(), peer = %peer, what, "Peer declined");
                                Outcome::Failed
                            }
                            PeerReply::Failed(e) => {
                                tracing::debug!(job_id = %self.job.id(), peer = %peer, what, error = %e, "Peer failed");
                                Outcome::Failed
                            }
                        };
                    }
                    NextAction::Done | NextAction::BackOff => break,
                }
            }

            if let Some(value) = served {
                return Ok(value);
            }

            tracing::info!(
                job_id = %self.job.id(),
                what,
                retry_secs = self.ctx.config.retry_interval.as_secs_f64(),
                "Not available from any peer, retrying"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(SwarmError::Shutdown),
                _ = tokio::time::sleep(self.ctx.config.retry_interval) => {}
            }
        }
    }

    async fn query(&self, key: &TrackerKey) -> Vec<PeerAddr> {
        match self.ctx.tracker.query(key.clone()).await {
            Ok(peers) => peers,
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Tracker query failed");
                Vec::new()
            }
        }
    }

    fn client(&self, peer: PeerAddr) -> PeerClient {
        PeerClient::new(peer, self.ctx.config.connect_timeout)
    }

    /// Run a disk-bound job operation off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Job) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let job = Arc::clone(&self.job);
        tokio::task::spawn_blocking(move || f(&job))
            .await
            .map_err(|e| SwarmError::Task(e.to_string()))?
    }
}
