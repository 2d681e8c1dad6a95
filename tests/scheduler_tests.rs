
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use swarmjob::context::NodeContext;
use swarmjob::job::JobId;
use swarmjob::node::scan_jobs;
use swarmjob::scheduler::JobRegistry;
use test_harness::{create_test_job, test_config, MockTracker};

fn job_id(n: usize) -> JobId {
    JobId::parse(&format!("{:064x}", n)).unwrap()
}

#[test]
fn test_concurrent_claims_hand_out_each_job_once() {
    let root = tempfile::tempdir().unwrap();
    let registry = Arc::new(JobRegistry::new(4));
    for n in 0..100 {
        let id = job_id(n);
        assert!(registry.add_job(&root.path().join(id.as_str()), id));
    }

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let mut claimed = Vec::new();
                while let Some(id) = registry.claim_unfinished() {
                    registry.mark_finished(&id);
                    claimed.push(id);
                }
                claimed
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(seen.insert(id), "job claimed twice");
        }
    }
    assert_eq!(seen.len(), 100);
    assert_eq!(registry.idle_workers(), 4);
}

#[test]
fn test_idle_workers_follow_claims() {
    let root = tempfile::tempdir().unwrap();
    let registry = JobRegistry::new(2);
    for n in 0..3 {
        let id = job_id(n);
        registry.add_job(&root.path().join(id.as_str()), id);
    }

    let first = registry.claim_unfinished().unwrap();
    assert_eq!(registry.idle_workers(), 1);
    let second = registry.claim_unfinished().unwrap();
    assert_eq!(registry.idle_workers(), 0);
    assert_ne!(first, second);

    registry.mark_finished(&first);
    assert_eq!(registry.idle_workers(), 1);

    // finished jobs stay known and are never handed out again
    assert!(registry.contains(&first));
    assert!(!registry.add_job(&root.path().join(first.as_str()), first.clone()));
    let third = registry.claim_unfinished().unwrap();
    assert_ne!(third, first);
    assert!(registry.claim_unfinished().is_none());
}

#[tokio::test]
async fn test_scan_registers_and_announces_job_dirs() {
    let tracker = MockTracker::start().await;
    let root = tempfile::tempdir().unwrap();
    let id = create_test_job(root.path(), &[("a.txt", b"alpha")], None, &[]);

    // neither of these is a job
    std::fs::create_dir(root.path().join("not-a-job")).unwrap();
    std::fs::write(root.path().join("f".repeat(64)), b"file, not dir").unwrap();

    let ctx = NodeContext::new(test_config(root.path(), 4242, tracker.port));
    assert_eq!(scan_jobs(&ctx).await.unwrap(), 1);
    assert_eq!(ctx.registry.job_ids(), vec![id.clone()]);
    assert_eq!(tracker.ports(id.as_str()), vec![4242]);

    // a second scan finds nothing new
    assert_eq!(scan_jobs(&ctx).await.unwrap(), 0);

    let added = job_id(7);
    std::fs::create_dir(root.path().join(added.as_str())).unwrap();
    assert_eq!(scan_jobs(&ctx).await.unwrap(), 1);
    assert!(ctx.registry.contains(&added));
    assert_eq!(
        tracker.requests(),
        vec![
            format!("INFORM 4242 {}", id),
            format!("INFORM 4242 {}", added),
        ]
    );
}
