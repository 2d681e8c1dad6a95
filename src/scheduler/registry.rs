use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::job::{Job, JobId};
use crate::scheduler::queue::WorkQueue;

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Arc<Job>>,
    queue: WorkQueue,
}

/// Process-wide table of known jobs and their scheduling state.
///
/// Jobs are handed out as `Arc<Job>` so callers drop the registry lock
/// before locking an individual job.
#[derive(Debug)]
pub struct JobRegistry {
    inner: Mutex<Inner>,
    n_workers: usize,
}

impl JobRegistry {
    pub fn new(n_workers: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            n_workers,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register the job stored in `dir`. Returns false if the id is already known.
    pub fn add_job(&self, dir: &Path, id: JobId) -> bool {
        let mut inner = self.lock();
        if inner.jobs.contains_key(&id) {
            return false;
        }
        inner.queue.push(id.clone());
        inner.jobs.insert(id.clone(), Arc::new(Job::new(dir, id.clone())));
        tracing::info!(job_id = %id, "Job registered");
        true
    }

    pub fn get(&self, id: &JobId) -> Option<Arc<Job>> {
        self.lock().jobs.get(id).cloned()
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.lock().jobs.contains_key(id)
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.lock().jobs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Take an unfinished job for a worker, `None` when there is nothing to do.
    pub fn claim_unfinished(&self) -> Option<JobId> {
        self.lock().queue.claim()
    }

    pub fn mark_finished(&self, id: &JobId) {
        if !self.lock().queue.finish(id) {
            tracing::warn!(job_id = %id, "Finished job was not being worked on");
        }
    }

    /// Worker slots not currently running a job.
    pub fn idle_workers(&self) -> usize {
        self.n_workers
            .saturating_sub(self.lock().queue.working_count())
    }

    pub fn n_workers(&self) -> usize {
        self.n_workers
    }
}
