use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Chunked payload flowing to or from the remote side.
pub type ByteStream = BoxStream<'static, Result<Bytes, RemoteError>>;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server replied {code}: {message}")]
    Reply { code: u16, message: String },
    #[error("connection closed")]
    Closed,
}

impl RemoteError {
    /// Protocol-level reply code, when the server answered at all.
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            RemoteError::Reply { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// A negative reply leaves the connection usable; everything else
    /// (network failure, timeout surfaced as I/O, closed socket) does not.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self, RemoteError::Reply { .. } | RemoteError::Url(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    pub endpoint: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Folder,
}

/// One established session against the remote server. Implementations keep
/// whatever per-connection state the protocol needs (an authenticated HTTP
/// session, a control socket, ...). Listing a missing path yields an empty
/// entry set rather than an error, so callers can verify deletions by
/// listing.
#[async_trait]
pub trait RemoteConnection: Send {
    async fn list(&mut self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError>;

    /// Acquire the content of a remote file as a byte stream. The caller is
    /// responsible for draining it under its own timing discipline.
    async fn retrieve(&mut self, path: &str) -> Result<ByteStream, RemoteError>;

    async fn store(&mut self, path: &str, body: ByteStream, len: u64) -> Result<(), RemoteError>;

    async fn delete_file(&mut self, path: &str) -> Result<(), RemoteError>;

    /// Create a folder, including missing intermediate folders.
    async fn make_dir(&mut self, path: &str) -> Result<(), RemoteError>;

    /// Remove a folder and everything under it.
    async fn remove_dir(&mut self, path: &str) -> Result<(), RemoteError>;
}

/// Factory for [`RemoteConnection`]s. `connect` performs whatever handshake
/// the protocol requires and fails fast on bad credentials.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: RemoteConnection + 'static;

    async fn connect(&self, params: &ConnectionParams) -> Result<Self::Conn, RemoteError>;
}
