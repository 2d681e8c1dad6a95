//! Client of the peer discovery tracker.
//!
//! Every call opens one connection and sends one request line:
//!
//! ```text
//! INFORM <port> <job_id|idle>   -> OK
//! DELETE <port> <job_id|idle>   -> OK
//! QUERY <job_id|idle>           -> "<host> <port>\n"... until close
//! ```

use std::fmt;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::TrackerConfig;
use crate::error::{Result, SwarmError};
use crate::job::JobId;

/// Largest tracker reply read before giving up.
const MAX_REPLY_LEN: u64 = 1024 * 1024;

/// Address of another node's protocol server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// What a node announces itself for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TrackerKey {
    /// The node has a free worker slot.
    Idle,
    Job(JobId),
}

impl TrackerKey {
    pub fn parse(s: &str) -> Result<Self> {
        if s == "idle" {
            Ok(TrackerKey::Idle)
        } else {
            JobId::parse(s).map(TrackerKey::Job)
        }
    }
}

impl From<JobId> for TrackerKey {
    fn from(id: JobId) -> Self {
        TrackerKey::Job(id)
    }
}

impl From<&JobId> for TrackerKey {
    fn from(id: &JobId) -> Self {
        TrackerKey::Job(id.clone())
    }
}

impl fmt::Display for TrackerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerKey::Idle => f.write_str("idle"),
            TrackerKey::Job(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerClient {
    host: String,
    port: u16,
    /// Port of the local protocol server, sent with announcements.
    listen_port: u16,
    timeout: Duration,
}

impl TrackerClient {
    pub fn new(config: &TrackerConfig, listen_port: u16, timeout: Duration) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            listen_port,
            timeout,
        }
    }

    /// Tell the tracker this node serves `key`.
    pub async fn announce(&self, key: impl Into<TrackerKey>) -> Result<()> {
        let key = key.into();
        let reply = self
            .request(&format!("INFORM {} {}\n", self.listen_port, key))
            .await?;
        expect_ok(&reply)?;
        tracing::debug!(key = %key, "Announced to tracker");
        Ok(())
    }

    /// Tell the tracker this node no longer serves `key`.
    pub async fn withdraw(&self, key: impl Into<TrackerKey>) -> Result<()> {
        let key = key.into();
        let reply = self
            .request(&format!("DELETE {} {}\n", self.listen_port, key))
            .await?;
        expect_ok(&reply)?;
        tracing::debug!(key = %key, "Withdrawn from tracker");
        Ok(())
    }

    /// Peers serving `key`, in random order.
    pub async fn query(&self, key: impl Into<TrackerKey>) -> Result<Vec<PeerAddr>> {
        let key = key.into();
        let reply = self.request(&format!("QUERY {}\n", key)).await?;
        if reply == "FAILED\n" {
            return Err(SwarmError::Tracker("Query failed".to_string()));
        }

        let mut peers = parse_peers(&reply)?;
        peers.shuffle(&mut rand::thread_rng());
        Ok(peers)
    }

    async fn request(&self, line: &str) -> Result<String> {
        let addr = (self.host.as_str(), self.port);
        let exchange = async {
            let mut stream = TcpStream::connect(addr)
                .await
                .map_err(|e| SwarmError::io("connect", e))?;
            stream
                .write_all(line.as_bytes())
                .await
                .map_err(|e| SwarmError::io("send", e))?;

            let mut reply = Vec::new();
            (&mut stream)
                .take(MAX_REPLY_LEN)
                .read_to_end(&mut reply)
                .await
                .map_err(|e| SwarmError::io("recv", e))?;
            String::from_utf8(reply)
                .map_err(|_| SwarmError::Tracker("Reply is not UTF-8".to_string()))
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| SwarmError::Tracker(format!("{}:{} timed out", self.host, self.port)))?
    }
}

fn expect_ok(reply: &str) -> Result<()> {
    if reply == "OK\n" {
        Ok(())
    } else {
        Err(SwarmError::Tracker(format!(
            "Response not OK: {:?}",
            reply.trim_end()
        )))
    }
}

fn parse_peers(reply: &str) -> Result<Vec<PeerAddr>> {
    reply
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let (host, port) = line
                .trim()
                .split_once(' ')
                .ok_or_else(|| SwarmError::Tracker(format!("Invalid peer line {:?}", line)))?;
            let port = port
                .trim()
                .parse()
                .map_err(|_| SwarmError::Tracker(format!("Invalid port in {:?}", line)))?;
            Ok(PeerAddr::new(host, port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_render_and_validate() {
        assert_eq!(TrackerKey::parse("idle").unwrap(), TrackerKey::Idle);
        assert_eq!(TrackerKey::Idle.to_string(), "idle");
        let id = "c".repeat(64);
        assert_eq!(TrackerKey::parse(&id).unwrap().to_string(), id);
        assert!(matches!(
            TrackerKey::parse(&"c".repeat(63)),
            Err(SwarmError::InvalidJobId(_))
        ));
        assert!(TrackerKey::parse("IDLE").is_err());
    }

    #[test]
    fn parses_peer_lists() {
        let peers = parse_peers("10.0.0.1 42069\n\nexample.org 7\n").unwrap();
        assert_eq!(
            peers,
            vec![PeerAddr::new("10.0.0.1", 42069), PeerAddr::new("example.org", 7)]
        );
        assert!(parse_peers("").unwrap().is_empty());
        assert!(parse_peers("10.0.0.1\n").is_err());
        assert!(parse_peers("10.0.0.1 70000\n").is_err());
    }

    #[test]
    fn only_exact_ok_is_accepted() {
        assert!(expect_ok("OK\n").is_ok());
        assert!(expect_ok("OK").is_err());
        assert!(expect_ok("FAILED\n").is_err());
    }
}
