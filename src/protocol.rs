//! Wire format shared by the server and its clients.
//!
//! Request:  `[op u8][len u32 LE][JSON body]`
//! Response: `[status u8][len u32 LE][JSON body]`

use std::io::{self, Read, Write};
use std::net::TcpStream;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::artifact::ReviewKind;
use crate::model::{CollectionKind, Metadata, Scope};
use crate::Error;

// --- OpCodes ---
pub const OP_STORE: u8   = 0x01;
pub const OP_QUERY: u8   = 0x02;
pub const OP_CONTEXT: u8 = 0x03;
pub const OP_STATS: u8   = 0x04;
pub const OP_PURGE: u8   = 0x05;
pub const OP_GET: u8     = 0x06;
pub const OP_COMPACT: u8 = 0x07;
pub const OP_CLEAR: u8   = 0x08;

pub const STATUS_OK: u8  = 0x00;
pub const STATUS_ERR: u8 = 0x01;

/// Upper bound on one body; code submissions can be large.
pub const MAX_BODY: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRequest {
    pub collection: CollectionKind,
    #[serde(default)]
    pub id: Option<String>,
    pub document: String,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreReply {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub collection: CollectionKind,
    pub text: String,
    #[serde(flatten)]
    pub scope: Scope,
    #[serde(default)]
    pub n_results: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRequest {
    pub user_id: String,
    pub project_id: String,
    pub code: String,
    pub review_type: ReviewKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsRequest {
    #[serde(default)]
    pub scope: Option<Scope>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurgeRequest {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetRequest {
    pub collection: CollectionKind,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearRequest {
    pub collection: CollectionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearReply {
    pub removed: usize,
}

/// Body of every `STATUS_ERR` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub kind: String,
    pub message: String,
    /// Collections already purged when a purge stopped part-way.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleared: Option<Vec<(CollectionKind, usize)>>,
}

impl ErrorReply {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
            cleared: None,
        }
    }
}

impl From<&Error> for ErrorReply {
    fn from(e: &Error) -> Self {
        let mut reply = ErrorReply::new(e.kind(), e.to_string());
        if let Error::PartialDeletion(partial) = e {
            reply.cleared = Some(partial.cleared.clone());
        }
        reply
    }
}

impl std::fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

fn header(tag: u8, len: usize) -> io::Result<[u8; 5]> {
    if len > MAX_BODY {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("body of {len} bytes exceeds the {MAX_BODY} byte limit"),
        ));
    }
    let mut out = [0u8; 5];
    out[0] = tag;
    out[1..].copy_from_slice(&(len as u32).to_le_bytes());
    Ok(out)
}

fn body_len(len_buf: [u8; 4]) -> io::Result<usize> {
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_BODY {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("payload too large: {len} bytes (max {MAX_BODY})"),
        ));
    }
    Ok(len)
}

/// Reads one frame; `None` on a clean end of stream before the tag byte.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<(u8, Vec<u8>)>> {
    let mut tag = [0u8; 1];
    match reader.read_exact(&mut tag).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let mut body = vec![0u8; body_len(len_buf)?];
    reader.read_exact(&mut body).await?;
    Ok(Some((tag[0], body)))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, tag: u8, body: &[u8]) -> io::Result<()> {
    writer.write_all(&header(tag, body.len())?).await?;
    writer.write_all(body).await?;
    Ok(())
}

/// Blocking client for one server connection.
pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Sends one request and decodes the reply, mapping error replies to `Err`.
    pub fn call<Req, Resp>(&mut self, op: u8, request: &Req) -> Result<Resp, ErrorReply>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(request).map_err(|e| ErrorReply::new("client", e.to_string()))?;
        let (status, reply) = self
            .round_trip(op, &body)
            .map_err(|e| ErrorReply::new("io", e.to_string()))?;

        if status == STATUS_OK {
            serde_json::from_slice(&reply).map_err(|e| ErrorReply::new("client", e.to_string()))
        } else {
            Err(serde_json::from_slice(&reply)
                .unwrap_or_else(|_| ErrorReply::new("server", String::from_utf8_lossy(&reply))))
        }
    }

    fn round_trip(&mut self, op: u8, body: &[u8]) -> io::Result<(u8, Vec<u8>)> {
        self.stream.write_all(&header(op, body.len())?)?;
        self.stream.write_all(body)?;
        self.stream.flush()?;

        let mut head = [0u8; 5];
        self.stream.read_exact(&mut head)?;
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&head[1..]);
        let mut reply = vec![0u8; body_len(len_buf)?];
        self.stream.read_exact(&mut reply)?;
        Ok((head[0], reply))
    }
}
