use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::job::blocks::BLOCK_SIZE;
use crate::job::{FileEntry, JobId};
use crate::protocol::tracker::PeerAddr;
use crate::protocol::wire::{self, Header, Request, MAX_PAYLOAD_LEN};

/// Outcome of asking a remote peer for something.
///
/// None of these are local errors: a peer that cannot or will not help is
/// an ordinary event the caller retries around.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerReply<T> {
    Ready(T),
    /// The peer answered `FALSE`.
    Declined,
    /// The peer was unreachable or sent something unusable.
    Failed(String),
}

impl<T> PeerReply<T> {
    pub fn ready(self) -> Option<T> {
        match self {
            PeerReply::Ready(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, PeerReply::Ready(_))
    }
}

/// Talks to one remote peer, one connection per request.
#[derive(Debug, Clone)]
pub struct PeerClient {
    addr: PeerAddr,
    timeout: Duration,
}

enum Answer {
    Flag(bool),
    Payload(Vec<u8>),
}

impl PeerClient {
    pub fn new(addr: PeerAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    pub fn addr(&self) -> &PeerAddr {
        &self.addr
    }

    pub async fn has_job(&self, id: &JobId) -> PeerReply<()> {
        self.flag(Request::HasJob(id.to_string())).await
    }

    /// Ask the peer to work on `id`.
    pub async fn inform_job(&self, id: &JobId) -> PeerReply<()> {
        self.flag(Request::InformJob(id.to_string())).await
    }

    /// Manifest text of `id`. Replies whose hash does not match the id are
    /// treated as failures.
    pub async fn get_manifest(&self, id: &JobId) -> PeerReply<Vec<u8>> {
        match self
            .payload(Request::GetManifest(id.to_string()), MAX_PAYLOAD_LEN)
            .await
        {
            PeerReply::Ready(data) if JobId::of_manifest(&data) != *id => {
                PeerReply::Failed("manifest does not match job id".to_string())
            }
            other => other,
        }
    }

    pub async fn get_block(&self, id: &JobId, file: &str, block: usize) -> PeerReply<Vec<u8>> {
        let request = Request::GetBlock {
            job_id: id.to_string(),
            file: file.to_string(),
            block,
        };
        self.payload(request, BLOCK_SIZE as usize).await
    }

    pub async fn get_dynamic_metadata(&self, id: &JobId) -> PeerReply<Vec<FileEntry>> {
        match self
            .payload(Request::GetDynamicMetadata(id.to_string()), MAX_PAYLOAD_LEN)
            .await
        {
            PeerReply::Ready(data) => match parse_metadata(&data) {
                Some(files) => PeerReply::Ready(files),
                None => PeerReply::Failed("malformed dynamic metadata".to_string()),
            },
            PeerReply::Declined => PeerReply::Declined,
            PeerReply::Failed(e) => PeerReply::Failed(e),
        }
    }

    async fn flag(&self, request: Request) -> PeerReply<()> {
        match self.exchange(&request, 0).await {
            Ok(Answer::Flag(true)) => PeerReply::Ready(()),
            Ok(Answer::Flag(false)) => PeerReply::Declined,
            Ok(Answer::Payload(_)) => PeerReply::Failed("unexpected payload".to_string()),
            Err(e) => PeerReply::Failed(e),
        }
    }

    async fn payload(&self, request: Request, limit: usize) -> PeerReply<Vec<u8>> {
        match self.exchange(&request, limit).await {
            Ok(Answer::Payload(data)) => PeerReply::Ready(data),
            Ok(Answer::Flag(false)) => PeerReply::Declined,
            Ok(Answer::Flag(true)) => PeerReply::Failed("unexpected TRUE".to_string()),
            Err(e) => PeerReply::Failed(e),
        }
    }

    async fn exchange(&self, request: &Request, limit: usize) -> Result<Answer, String> {
        let result = tokio::time::timeout(self.timeout, self.send(request, limit))
            .await
            .unwrap_or_else(|_| Err("timed out".to_string()));
        if let Err(e) = &result {
            tracing::debug!(peer = %self.addr, request = ?request, error = %e, "Peer request failed");
        }
        result
    }

    async fn send(&self, request: &Request, limit: usize) -> Result<Answer, String> {
        let mut stream = TcpStream::connect((self.addr.host.as_str(), self.addr.port))
            .await
            .map_err(|e| format!("connect(): {}", e))?;
        stream
            .write_all(request.encode().as_bytes())
            .await
            .map_err(|e| format!("send(): {}", e))?;

        let mut reader = BufReader::new(stream);
        let line = wire::read_line(&mut reader)
            .await
            .map_err(|e| format!("recv(): {}", e))?
            .ok_or_else(|| "connection closed".to_string())?;

        match Header::parse(&line) {
            Some(Header::True) => Ok(Answer::Flag(true)),
            Some(Header::False) => Ok(Answer::Flag(false)),
            Some(Header::Length(len)) if len <= limit => {
                let data = wire::read_payload(&mut reader, len)
                    .await
                    .map_err(|e| format!("recv(): {}", e))?;
                Ok(Answer::Payload(data))
            }
            Some(Header::Length(len)) => Err(format!("payload of {} bytes too large", len)),
            None => Err(format!("invalid response {:?}", line)),
        }
    }
}

/// Parse `name hash size` lines. Names may contain spaces.
pub fn parse_metadata(data: &[u8]) -> Option<Vec<FileEntry>> {
    let text = std::str::from_utf8(data).ok()?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 3 {
                return None;
            }
            let size = tokens[tokens.len() - 1].parse().ok()?;
            let hash = tokens[tokens.len() - 2];
            Some(FileEntry {
                name: tokens[..tokens.len() - 2].join(" "),
                hash: hash.to_string(),
                size,
                dynamic: true,
            })
        })
        .collect()
}

/// Inverse of [`parse_metadata`].
pub fn render_metadata(files: &[FileEntry]) -> Vec<u8> {
    files
        .iter()
        .map(|f| format!("{} {} {}\n", f.name, f.hash, f.size))
        .collect::<String>()
        .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_lines_allow_spaces_in_names() {
        let files = parse_metadata(b"my out.txt abcd 12\nlog 00 0\n").unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "my out.txt");
        assert_eq!(files[0].hash, "abcd");
        assert_eq!(files[0].size, 12);
        assert!(files[0].dynamic);
        assert_eq!(render_metadata(&files), b"my out.txt abcd 12\nlog 00 0\n");
    }

    #[test]
    fn malformed_metadata_is_rejected() {
        assert!(parse_metadata(b"name hash\n").is_none());
        assert!(parse_metadata(b"name hash big\n").is_none());
        assert!(parse_metadata(&[0xff, 0xfe]).is_none());
        assert_eq!(parse_metadata(b"").unwrap(), vec![]);
    }

    #[test]
    fn reply_helpers() {
        assert_eq!(PeerReply::Ready(3).ready(), Some(3));
        assert_eq!(PeerReply::<u8>::Declined.ready(), None);
        assert!(!PeerReply::<u8>::Failed("x".into()).is_ready());
    }
}
