use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::context::NodeContext;
use crate::error::{Result, SwarmError};
use crate::job::{Job, JobId};
use crate::protocol::client::render_metadata;
use crate::protocol::tracker::TrackerKey;
use crate::protocol::wire::{self, Request, Response};

/// Answers peer requests against the local job registry.
#[derive(Debug, Clone)]
pub struct PeerServer {
    ctx: Arc<NodeContext>,
}

impl PeerServer {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Accept connections until `shutdown` is cancelled. Each connection is
    /// served on its own task.
    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local = listener
            .local_addr()
            .map_err(|e| SwarmError::io("getsockname", e))?;
        tracing::info!(addr = %local, "Peer server listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Peer server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.serve_connection(stream, peer).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }
    }

    /// Serve requests from one peer, in order, until it hangs up.
    async fn serve_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        loop {
            let line = match wire::read_line(&mut reader).await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "Dropping connection");
                    break;
                }
            };

            let response = match Request::parse(&line) {
                Some(request) => self.handle(request).await,
                None => {
                    tracing::debug!(peer = %peer, line = %line, "Unknown request");
                    Response::False
                }
            };

            if let Err(e) = wire::write_response(&mut write, &response).await {
                tracing::debug!(peer = %peer, error = %e, "Failed to send response");
                break;
            }
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::HasJob(id) => self.job(&id).is_some().into(),
            Request::GetManifest(id) => match self.job(&id).and_then(|job| job.manifest_text()) {
                Some(text) => Response::Payload(text.into_bytes()),
                None => Response::False,
            },
            Request::GetBlock {
                job_id,
                file,
                block,
            } => match self.job(&job_id) {
                Some(job) => read_block(job, file, block).await,
                None => Response::False,
            },
            Request::GetDynamicMetadata(id) => {
                match self.job(&id).and_then(|job| job.dynamic_metadata()) {
                    Some(files) => Response::Payload(render_metadata(&files)),
                    None => Response::False,
                }
            }
            Request::InformJob(id) => self.inform_job(&id).await.into(),
        }
    }

    fn job(&self, id: &str) -> Option<Arc<Job>> {
        let id = JobId::parse(id).ok()?;
        self.ctx.registry.get(&id)
    }

    /// Accept a job a master wants executed, if a worker slot is free.
    async fn inform_job(&self, id: &str) -> bool {
        let Ok(id) = JobId::parse(id) else {
            return false;
        };
        if self.ctx.registry.contains(&id) || self.ctx.registry.idle_workers() == 0 {
            return false;
        }

        let dir = self.ctx.config.download_root.join(id.as_str());
        if let Err(e) = tokio::fs::create_dir(&dir).await {
            tracing::debug!(job_id = %id, error = %e, "Cannot create job directory");
            return false;
        }
        // the download root watcher may register the new directory first,
        // announcing it itself
        if self.ctx.registry.add_job(&dir, id.clone()) {
            if let Err(e) = self.ctx.tracker.announce(TrackerKey::from(&id)).await {
                tracing::warn!(job_id = %id, error = %e, "Failed to announce accepted job");
            }
        }
        tracing::info!(job_id = %id, "Accepted job from master");
        true
    }
}

async fn read_block(job: Arc<Job>, file: String, block: usize) -> Response {
    let result = tokio::task::spawn_blocking(move || job.read_block(&file, block)).await;
    match result {
        Ok(Ok(Some(data))) => Response::Payload(data),
        Ok(Ok(None)) => Response::False,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "Cannot serve block");
            Response::False
        }
        Err(e) => {
            tracing::error!(error = %e, "Block read task failed");
            Response::False
        }
    }
}
