//! Line framing of the peer protocol.
//!
//! A request is one line, `COMMAND arg...\n`. A response is either a
//! `TRUE`/`FALSE` line, or a decimal length line followed by exactly that
//! many raw payload bytes.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest request or header line accepted, newline included.
pub const MAX_LINE_LEN: usize = 8 * 1024;

/// Largest manifest or metadata payload accepted from a peer.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    HasJob(String),
    GetManifest(String),
    GetBlock {
        job_id: String,
        file: String,
        block: usize,
    },
    GetDynamicMetadata(String),
    InformJob(String),
}

impl Request {
    /// Parse a request line without its newline. Returns `None` for unknown
    /// commands and wrong argument counts.
    pub fn parse(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        let command = tokens.next()?;
        let args: Vec<&str> = tokens.collect();

        let single = |args: &[&str]| match args {
            [id] => Some(id.to_string()),
            _ => None,
        };

        match command {
            "HAS_JOB" => single(&args).map(Request::HasJob),
            "GET_MANIFEST" => single(&args).map(Request::GetManifest),
            "GET_DYNAMIC_METADATA" => single(&args).map(Request::GetDynamicMetadata),
            "INFORM_JOB" => single(&args).map(Request::InformJob),
            "GET_BLOCK" => {
                // file names may contain spaces: first token is the job, last the block
                if args.len() < 3 {
                    return None;
                }
                let block = args[args.len() - 1].parse().ok()?;
                Some(Request::GetBlock {
                    job_id: args[0].to_string(),
                    file: args[1..args.len() - 1].join(" "),
                    block,
                })
            }
            _ => None,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Request::HasJob(id) => format!("HAS_JOB {}\n", id),
            Request::GetManifest(id) => format!("GET_MANIFEST {}\n", id),
            Request::GetBlock {
                job_id,
                file,
                block,
            } => format!("GET_BLOCK {} {} {}\n", job_id, file, block),
            Request::GetDynamicMetadata(id) => format!("GET_DYNAMIC_METADATA {}\n", id),
            Request::InformJob(id) => format!("INFORM_JOB {}\n", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    True,
    False,
    Payload(Vec<u8>),
}

impl From<bool> for Response {
    fn from(value: bool) -> Self {
        if value {
            Response::True
        } else {
            Response::False
        }
    }
}

/// First line of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    True,
    False,
    Length(usize),
}

impl Header {
    pub fn parse(line: &str) -> Option<Self> {
        match line {
            "TRUE" => Some(Header::True),
            "FALSE" => Some(Header::False),
            _ if !line.is_empty() && line.bytes().all(|b| b.is_ascii_digit()) => {
                line.parse().ok().map(Header::Length)
            }
            _ => None,
        }
    }
}

/// Read one `\n`-terminated line, without the terminator. Returns `None` on
/// a clean end of stream.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE_LEN as u64)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        let kind = if n >= MAX_LINE_LEN {
            io::ErrorKind::InvalidData
        } else {
            io::ErrorKind::UnexpectedEof
        };
        return Err(io::Error::new(kind, "unterminated line"));
    }

    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "line is not UTF-8"))
}

/// Read exactly `len` payload bytes.
pub async fn read_payload<R>(reader: &mut R, len: usize) -> io::Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(data)
}

pub async fn write_response<W>(writer: &mut W, response: &Response) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match response {
        Response::True => writer.write_all(b"TRUE\n").await?,
        Response::False => writer.write_all(b"FALSE\n").await?,
        Response::Payload(data) => {
            writer
                .write_all(format!("{}\n", data.len()).as_bytes())
                .await?;
            writer.write_all(data).await?;
        }
    }
    writer.flush().await
}
