use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::context::NodeContext;
use crate::error::{Result, SwarmError};
use crate::job::JobId;
use crate::lockfile::InstanceLock;
use crate::protocol::server::PeerServer;
use crate::protocol::tracker::TrackerKey;
use crate::worker::spawn_workers;

/// Main node that orchestrates all components
pub struct Node {
    ctx: Arc<NodeContext>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            ctx: NodeContext::new(config),
        }
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    /// Run the node until `shutdown` is cancelled.
    ///
    /// 1. Takes the instance lock of the download root; if another node
    ///    already owns it, returns immediately
    /// 2. Registers and announces every job directory found on disk
    /// 3. Binds the peer protocol listener
    /// 4. Spawns the worker pool, the download root watcher and the server
    ///
    /// # Errors
    ///
    /// Returns an error if the download root or the listener cannot be set
    /// up. Failures of individual jobs are logged by the workers.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Some(_lock) = self.lock_root()? else {
            return Ok(());
        };
        let addr = format!("0.0.0.0:{}", self.ctx.config.listen_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| SwarmError::io("bind", e))?;
        self.serve(listener, shutdown).await
    }

    /// Same as [`Node::run`], serving on an already bound listener.
    pub async fn run_with_listener(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let Some(_lock) = self.lock_root()? else {
            return Ok(());
        };
        self.serve(listener, shutdown).await
    }

    fn lock_root(&self) -> Result<Option<InstanceLock>> {
        let root = &self.ctx.config.download_root;
        std::fs::create_dir_all(root).map_err(|e| SwarmError::io("mkdir", e))?;
        let lock = InstanceLock::acquire(root)?;
        if lock.is_none() {
            tracing::info!(
                root = %root.display(),
                "Another node is already running on this download root"
            );
        }
        Ok(lock)
    }

    async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let root = &self.ctx.config.download_root;
        let found = scan_jobs(&self.ctx).await?;
        tracing::info!(
            root = %root.display(),
            jobs = found,
            workers = self.ctx.config.n_workers,
            tracker = %format!("{}:{}", self.ctx.config.tracker.host, self.ctx.config.tracker.port),
            "Starting swarmjob node"
        );

        let workers = spawn_workers(&self.ctx, &shutdown);

        let watch_ctx = Arc::clone(&self.ctx);
        let watch_shutdown = shutdown.clone();
        let watcher = tokio::spawn(async move {
            watch_loop(watch_ctx, watch_shutdown).await;
        });

        let server = PeerServer::new(Arc::clone(&self.ctx));
        let server_result = server.run(listener, shutdown.clone()).await;

        // workers stop at their next wait; a running executable is not waited for
        shutdown.cancel();
        let _ = watcher.await;
        for worker in workers {
            worker.abort();
        }

        tracing::info!("Node stopped");
        server_result
    }
}

/// Register job directories of the download root that are not known yet,
/// announcing each to the tracker. Returns the number of new jobs.
pub async fn scan_jobs(ctx: &NodeContext) -> Result<usize> {
    let root = &ctx.config.download_root;
    let mut entries = tokio::fs::read_dir(root)
        .await
        .map_err(|e| SwarmError::io("opendir", e))?;

    let mut added = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| SwarmError::io("readdir", e))?
    {
        let name = entry.file_name();
        let Some(id) = name.to_str().and_then(|n| JobId::parse(n).ok()) else {
            continue;
        };
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        if !is_dir || ctx.registry.contains(&id) {
            continue;
        }

        if ctx.registry.add_job(&entry.path(), id.clone()) {
            added += 1;
            tracing::info!(job_id = %id, "New job found on disk");
            if let Err(e) = ctx.tracker.announce(TrackerKey::from(&id)).await {
                tracing::warn!(job_id = %id, error = %e, "Failed to announce job");
            }
        }
    }
    Ok(added)
}

async fn watch_loop(ctx: Arc<NodeContext>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(ctx.config.watch_interval) => {}
        }
        if let Err(e) = scan_jobs(&ctx).await {
            tracing::warn!(error = %e, "Scanning download root failed");
        }
    }
}
