//! Peer protocol tests against a running `PeerServer` backed by a mock tracker.


use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use swarmjob::context::NodeContext;
use swarmjob::job::hash::sha256_hex;
use swarmjob::job::{FileEntry, JobId, BLOCK_SIZE};
use swarmjob::protocol::{PeerAddr, PeerClient, PeerReply, PeerServer};
use test_harness::{create_test_job, pattern, test_config, MockTracker};

struct TestServer {
    ctx: Arc<NodeContext>,
    client: PeerClient,
    port: u16,
    shutdown: CancellationToken,
}

impl TestServer {
    async fn start(root: &Path, tracker: &MockTracker) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let ctx = NodeContext::new(test_config(root, port, tracker.port));

        let shutdown = CancellationToken::new();
        let server = PeerServer::new(Arc::clone(&ctx));
        tokio::spawn(server.run(listener, shutdown.clone()));

        Self {
            ctx,
            client: PeerClient::new(PeerAddr::new("127.0.0.1", port), Duration::from_secs(2)),
            port,
            shutdown,
        }
    }

    /// Register a job already on disk, with its manifest loaded.
    fn load(&self, root: &Path, id: &JobId) {
        assert!(self.ctx.registry.add_job(&root.join(id.as_str()), id.clone()));
        self.ctx.registry.get(id).unwrap().read_manifest().unwrap();
    }

    /// Send raw request lines on one connection and collect the reply lines.
    async fn raw(&self, lines: &[&str]) -> Vec<String> {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        let mut replies = Vec::new();
        for line in lines {
            write.write_all(line.as_bytes()).await.unwrap();
            let mut reply = String::new();
            reader.read_line(&mut reply).await.unwrap();
            replies.push(reply);
        }
        replies
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[tokio::test]
async fn test_serves_manifest_and_blocks() {
    let tracker = MockTracker::start().await;
    let root = tempfile::tempdir().unwrap();
    let content = pattern(BLOCK_SIZE as usize + 100);
    let id = create_test_job(root.path(), &[("my data.bin", content.as_slice())], None, &[]);

    let server = TestServer::start(root.path(), &tracker).await;
    let unknown = JobId::parse(&"0".repeat(64)).unwrap();
    assert_eq!(server.client.has_job(&id).await, PeerReply::Declined);

    server.load(root.path(), &id);
    assert!(server.client.has_job(&id).await.is_ready());
    assert_eq!(server.client.has_job(&unknown).await, PeerReply::Declined);

    let manifest = server.client.get_manifest(&id).await.ready().unwrap();
    assert_eq!(JobId::of_manifest(&manifest), id);
    assert_eq!(server.client.get_manifest(&unknown).await, PeerReply::Declined);

    let first = server.client.get_block(&id, "my data.bin", 0).await.ready().unwrap();
    let second = server.client.get_block(&id, "my data.bin", 1).await.ready().unwrap();
    assert_eq!(first.len(), BLOCK_SIZE as usize);
    assert_eq!(second.len(), 100);
    assert_eq!([first, second].concat(), content);

    assert_eq!(
        server.client.get_block(&id, "my data.bin", 2).await,
        PeerReply::Declined
    );
    assert_eq!(
        server.client.get_block(&id, "nope.bin", 0).await,
        PeerReply::Declined
    );
}

#[tokio::test]
async fn test_unknown_requests_get_false() {
    let tracker = MockTracker::start().await;
    let root = tempfile::tempdir().unwrap();
    let server = TestServer::start(root.path(), &tracker).await;

    let replies = server
        .raw(&[
            "HELLO\n",
            "HAS_JOB\n",
            "GET_BLOCK abc 1\n",
            "GET_BLOCK abc file notanumber\n",
            "HAS_JOB not-a-job-id\n",
        ])
        .await;
    assert_eq!(replies, vec!["FALSE\n"; 5]);
}

#[tokio::test]
async fn test_oversized_request_line_drops_connection() {
    let tracker = MockTracker::start().await;
    let root = tempfile::tempdir().unwrap();
    let server = TestServer::start(root.path(), &tracker).await;

    let mut stream = TcpStream::connect(("127.0.0.1", server.port)).await.unwrap();
    let line = format!("HAS_JOB {}\n", "a".repeat(64 * 1024));
    // the server may close before reading everything
    let _ = stream.write_all(line.as_bytes()).await;

    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .expect("server should hang up");
    assert!(read.is_err() || rest.is_empty());
}

#[tokio::test]
async fn test_inform_job_accepts_only_valid_new_jobs() {
    let tracker = MockTracker::start().await;
    let root = tempfile::tempdir().unwrap();
    let server = TestServer::start(root.path(), &tracker).await;

    let short = "a".repeat(63);
    let replies = server.raw(&[&format!("INFORM_JOB {}\n", short)]).await;
    assert_eq!(replies, vec!["FALSE\n"]);
    assert!(server.ctx.registry.job_ids().is_empty());
    assert!(!root.path().join(&short).exists());

    let id = JobId::parse(&"b".repeat(64)).unwrap();
    assert!(server.client.inform_job(&id).await.is_ready());
    assert!(server.ctx.registry.contains(&id));
    assert!(root.path().join(id.as_str()).is_dir());
    assert_eq!(tracker.ports(id.as_str()), vec![server.port]);

    // already known
    assert_eq!(server.client.inform_job(&id).await, PeerReply::Declined);
}

#[tokio::test]
async fn test_inform_job_declined_without_free_worker() {
    let tracker = MockTracker::start().await;
    let root = tempfile::tempdir().unwrap();
    let server = TestServer::start(root.path(), &tracker).await;

    // test_config runs two workers
    for c in ['1', '2'] {
        let id = JobId::parse(&c.to_string().repeat(64)).unwrap();
        server.ctx.registry.add_job(&root.path().join(id.as_str()), id);
        server.ctx.registry.claim_unfinished().unwrap();
    }
    assert_eq!(server.ctx.registry.idle_workers(), 0);

    let id = JobId::parse(&"c".repeat(64)).unwrap();
    assert_eq!(server.client.inform_job(&id).await, PeerReply::Declined);
    assert!(!server.ctx.registry.contains(&id));
    assert!(!root.path().join(id.as_str()).exists());
}

#[tokio::test]
async fn test_dynamic_metadata_published_after_ingest() {
    let tracker = MockTracker::start().await;
    let root = tempfile::tempdir().unwrap();
    let id = create_test_job(
        root.path(),
        &[("run.sh", &b"#!/bin/sh\necho hi > 'out file.txt'\n"[..])],
        Some("run.sh"),
        &["out file.txt"],
    );

    let server = TestServer::start(root.path(), &tracker).await;
    server.load(root.path(), &id);
    assert_eq!(
        server.client.get_dynamic_metadata(&id).await,
        PeerReply::Declined
    );

    let entry = FileEntry {
        dynamic: true,
        ..FileEntry::new_static("out file.txt", sha256_hex(b"hi\n"), 3)
    };
    server
        .ctx
        .registry
        .get(&id)
        .unwrap()
        .update_dynamic_metadata(&[entry.clone()])
        .unwrap();

    let replies = server
        .raw(&[&format!("GET_DYNAMIC_METADATA {}\n", id)])
        .await;
    let expected = format!("out file.txt {} 3\n", sha256_hex(b"hi\n"));
    assert_eq!(replies, vec![format!("{}\n", expected.len())]);

    assert_eq!(
        server.client.get_dynamic_metadata(&id).await,
        PeerReply::Ready(vec![entry])
    );
}
