use std::collections::BTreeSet;

use crate::job::JobId;

/// Tracks which jobs still need a worker.
///
/// Every known job id is in exactly one of the three sets.
#[derive(Debug, Default)]
pub struct WorkQueue {
    unfinished: BTreeSet<JobId>,
    working: BTreeSet<JobId>,
    finished: BTreeSet<JobId>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a newly discovered job. Returns false if the id is already tracked.
    pub fn push(&mut self, id: JobId) -> bool {
        if self.contains(&id) {
            return false;
        }
        self.unfinished.insert(id)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.unfinished.contains(id) || self.working.contains(id) || self.finished.contains(id)
    }

    /// Move some unfinished job to working and return it.
    pub fn claim(&mut self) -> Option<JobId> {
        let id = self.unfinished.pop_first()?;
        self.working.insert(id.clone());
        Some(id)
    }

    /// Move a job from working to finished. Returns false if it was not being worked on.
    pub fn finish(&mut self, id: &JobId) -> bool {
        if !self.working.remove(id) {
            return false;
        }
        self.finished.insert(id.clone())
    }

    pub fn unfinished_count(&self) -> usize {
        self.unfinished.len()
    }

    pub fn working_count(&self) -> usize {
        self.working.len()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.len()
    }

    /// Returns the total number of tracked jobs
    pub fn len(&self) -> usize {
        self.unfinished.len() + self.working.len() + self.finished.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(c: char) -> JobId {
        JobId::parse(&c.to_string().repeat(64)).unwrap()
    }

    #[test]
    fn jobs_move_through_states_once() {
        let mut queue = WorkQueue::new();
        assert!(queue.push(id('a')));
        assert!(queue.push(id('b')));
        assert!(!queue.push(id('a')));

        let first = queue.claim().unwrap();
        assert_eq!(queue.working_count(), 1);
        assert!(!queue.push(first.clone()));

        assert!(queue.finish(&first));
        assert!(!queue.finish(&first));
        assert!(!queue.push(first));
        assert_eq!(queue.finished_count(), 1);

        let second = queue.claim().unwrap();
        assert!(queue.claim().is_none());
        assert!(queue.finish(&second));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.unfinished_count(), 0);
    }

    #[test]
    fn finishing_unclaimed_job_is_rejected() {
        let mut queue = WorkQueue::new();
        queue.push(id('c'));
        assert!(!queue.finish(&id('c')));
        assert_eq!(queue.unfinished_count(), 1);
    }
}
