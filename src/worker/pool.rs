use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::NodeContext;
use crate::error::SwarmError;
use crate::protocol::tracker::TrackerKey;
use crate::worker::orchestrator::JobWorker;

/// Spawn `n_workers` worker tasks sharing `ctx`.
pub fn spawn_workers(ctx: &Arc<NodeContext>, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
    (0..ctx.config.n_workers)
        .map(|index| {
            let ctx = Arc::clone(ctx);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker_loop(ctx, index, shutdown).await })
        })
        .collect()
}

/// Random delay in `[0, max]`, so workers of nodes started together do not
/// poll in lockstep.
fn startup_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let millis = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
    Duration::from_millis(millis)
}

async fn worker_loop(ctx: Arc<NodeContext>, index: usize, shutdown: CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => return,
        _ = tokio::time::sleep(startup_jitter(ctx.config.startup_jitter)) => {}
    }
    tracing::debug!(worker = index, "Worker started");

    while !shutdown.is_cancelled() {
        let Some(id) = ctx.registry.claim_unfinished() else {
            if ctx.idle.due() {
                if let Err(e) = ctx.tracker.announce(TrackerKey::Idle).await {
                    tracing::debug!(worker = index, error = %e, "Failed to announce idle");
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(ctx.config.poll_interval) => {}
            }
            continue;
        };

        if ctx.registry.idle_workers() == 0 {
            ctx.idle.reset();
            if let Err(e) = ctx.tracker.withdraw(TrackerKey::Idle).await {
                tracing::debug!(worker = index, error = %e, "Failed to withdraw idle");
            }
        }

        if let Some(job) = ctx.registry.get(&id) {
            let worker = JobWorker::new(Arc::clone(&ctx), job, shutdown.clone());
            match worker.run().await {
                Ok(()) => {}
                Err(SwarmError::Shutdown) => break,
                Err(e) => {
                    tracing::error!(worker = index, job_id = %id, error = %e, "Job failed");
                }
            }
        }
        ctx.registry.mark_finished(&id);
    }

    tracing::debug!(worker = index, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_bounds() {
        assert_eq!(startup_jitter(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            assert!(startup_jitter(Duration::from_millis(20)) <= Duration::from_millis(20));
        }
    }
}
