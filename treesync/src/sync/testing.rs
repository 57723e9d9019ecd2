//! In-memory connectors for exercising the scheduler and the session
//! without a server.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use treesync_core::{
    ByteStream, ConnectionParams, Connector, EntryKind, RemoteConnection, RemoteEntry, RemoteError,
};

use crate::console::UserInterface;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    List(String),
    Retrieve(String),
    Store(String),
    Delete(String),
    MakeDir(String),
    RemoveDir(String),
}

pub enum FakeResponse {
    Entries(Vec<RemoteEntry>),
    Data(Vec<u8>),
    Done,
    Fail(RemoteError),
    /// Never answers; lets timeout paths fire under paused time.
    Hang,
    /// Opens a stream that never yields a chunk.
    StallStream,
}

#[derive(Default)]
pub struct FakeStats {
    pub connects: AtomicUsize,
    pub active: AtomicUsize,
    pub peak: AtomicUsize,
    pub calls: Mutex<Vec<FakeCall>>,
}

impl FakeStats {
    /// Calls recorded so far, in settlement-dispatch order.
    pub fn calls(&self) -> Vec<FakeCall> {
        self.calls.lock().unwrap().clone()
    }
}

/// Scripted connector: the handler sees each call plus how many identical
/// calls preceded it, so a script can fail the first attempt and pass the
/// second.
#[derive(Clone)]
pub struct FakeConnector {
    pub handler: Arc<dyn Fn(&FakeCall, usize) -> FakeResponse + Send + Sync>,
    pub stats: Arc<FakeStats>,
}

impl FakeConnector {
    pub fn new(handler: impl Fn(&FakeCall, usize) -> FakeResponse + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
            stats: Arc::new(FakeStats::default()),
        }
    }
}

pub struct FakeConnection {
    handler: Arc<dyn Fn(&FakeCall, usize) -> FakeResponse + Send + Sync>,
    stats: Arc<FakeStats>,
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeConnection {
    fn respond(&self, call: FakeCall) -> FakeResponse {
        let mut calls = self.stats.calls.lock().unwrap();
        let nth = calls.iter().filter(|c| **c == call).count();
        let response = (self.handler)(&call, nth);
        calls.push(call);
        response
    }

    async fn unary(&self, call: FakeCall) -> Result<(), RemoteError> {
        match self.respond(call) {
            FakeResponse::Done => Ok(()),
            FakeResponse::Fail(err) => Err(err),
            FakeResponse::Hang => std::future::pending().await,
            _ => panic!("unary call scripted with a non-unary response"),
        }
    }
}

#[async_trait]
impl RemoteConnection for FakeConnection {
    async fn list(&mut self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        match self.respond(FakeCall::List(path.to_string())) {
            FakeResponse::Entries(entries) => Ok(entries),
            FakeResponse::Fail(err) => Err(err),
            FakeResponse::Hang => std::future::pending().await,
            _ => panic!("list scripted with a non-listing response"),
        }
    }

    async fn retrieve(&mut self, path: &str) -> Result<ByteStream, RemoteError> {
        match self.respond(FakeCall::Retrieve(path.to_string())) {
            FakeResponse::Data(data) => {
                Ok(futures_util::stream::iter(vec![Ok(Bytes::from(data))]).boxed())
            }
            FakeResponse::StallStream => Ok(futures_util::stream::pending().boxed()),
            FakeResponse::Fail(err) => Err(err),
            FakeResponse::Hang => std::future::pending().await,
            _ => panic!("retrieve scripted with a non-stream response"),
        }
    }

    async fn store(
        &mut self,
        path: &str,
        mut body: ByteStream,
        _len: u64,
    ) -> Result<(), RemoteError> {
        match self.respond(FakeCall::Store(path.to_string())) {
            FakeResponse::Done => {
                while let Some(chunk) = body.next().await {
                    chunk?;
                }
                Ok(())
            }
            FakeResponse::Fail(err) => Err(err),
            // consume nothing so the idle watchdog sees a dead transfer
            FakeResponse::Hang => std::future::pending().await,
            _ => panic!("store scripted with a non-unary response"),
        }
    }

    async fn delete_file(&mut self, path: &str) -> Result<(), RemoteError> {
        self.unary(FakeCall::Delete(path.to_string())).await
    }

    async fn make_dir(&mut self, path: &str) -> Result<(), RemoteError> {
        self.unary(FakeCall::MakeDir(path.to_string())).await
    }

    async fn remove_dir(&mut self, path: &str) -> Result<(), RemoteError> {
        self.unary(FakeCall::RemoveDir(path.to_string())).await
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Conn = FakeConnection;

    async fn connect(&self, _params: &ConnectionParams) -> Result<Self::Conn, RemoteError> {
        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak.fetch_max(active, Ordering::SeqCst);
        Ok(FakeConnection {
            handler: Arc::clone(&self.handler),
            stats: Arc::clone(&self.stats),
        })
    }
}

/// Stateful remote filesystem keyed by absolute path, for end-to-end
/// session runs.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    pub folders: BTreeSet<String>,
    pub files: BTreeMap<String, Vec<u8>>,
}

impl MemoryRemote {
    fn children(&self, path: &str) -> Vec<RemoteEntry> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let direct = |full: &str| -> Option<String> {
            let rest = full.strip_prefix(&prefix)?;
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        };
        let mut entries = Vec::new();
        for folder in &self.folders {
            if let Some(name) = direct(folder) {
                entries.push(RemoteEntry {
                    name,
                    kind: EntryKind::Folder,
                    size: 0,
                });
            }
        }
        for (file, data) in &self.files {
            if let Some(name) = direct(file) {
                entries.push(RemoteEntry {
                    name,
                    kind: EntryKind::File,
                    size: data.len() as u64,
                });
            }
        }
        entries
    }
}

#[derive(Clone, Default)]
pub struct MemoryConnector {
    pub state: Arc<Mutex<MemoryRemote>>,
}

impl MemoryConnector {
    pub fn with_root(root: &str) -> Self {
        let connector = Self::default();
        connector
            .state
            .lock()
            .unwrap()
            .folders
            .insert(root.trim_end_matches('/').to_string());
        connector
    }
}

pub struct MemoryConnection {
    state: Arc<Mutex<MemoryRemote>>,
}

fn ancestor_chain(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for part in path.split('/').filter(|part| !part.is_empty()) {
        current.push('/');
        current.push_str(part);
        out.push(current.clone());
    }
    out
}

#[async_trait]
impl RemoteConnection for MemoryConnection {
    async fn list(&mut self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let state = self.state.lock().unwrap();
        if let Some(data) = state.files.get(path) {
            let name = path.rsplit('/').next().unwrap_or(path).to_string();
            return Ok(vec![RemoteEntry {
                name,
                kind: EntryKind::File,
                size: data.len() as u64,
            }]);
        }
        Ok(state.children(path))
    }

    async fn retrieve(&mut self, path: &str) -> Result<ByteStream, RemoteError> {
        let data = self
            .state
            .lock()
            .unwrap()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| RemoteError::Reply {
                code: 404,
                message: format!("no such file: {path}"),
            })?;
        Ok(futures_util::stream::iter(vec![Ok(Bytes::from(data))]).boxed())
    }

    async fn store(
        &mut self,
        path: &str,
        mut body: ByteStream,
        _len: u64,
    ) -> Result<(), RemoteError> {
        let mut data = Vec::new();
        while let Some(chunk) = body.next().await {
            data.extend_from_slice(&chunk?);
        }
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), data);
        Ok(())
    }

    async fn delete_file(&mut self, path: &str) -> Result<(), RemoteError> {
        match self.state.lock().unwrap().files.remove(path) {
            Some(_) => Ok(()),
            None => Err(RemoteError::Reply {
                code: 550,
                message: format!("no such file: {path}"),
            }),
        }
    }

    async fn make_dir(&mut self, path: &str) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        for ancestor in ancestor_chain(path) {
            state.folders.insert(ancestor);
        }
        Ok(())
    }

    async fn remove_dir(&mut self, path: &str) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        let prefix = format!("{}/", path.trim_end_matches('/'));
        state
            .folders
            .retain(|folder| folder != path && !folder.starts_with(&prefix));
        state.files.retain(|file, _| !file.starts_with(&prefix));
        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Conn = MemoryConnection;

    async fn connect(&self, _params: &ConnectionParams) -> Result<Self::Conn, RemoteError> {
        Ok(MemoryConnection {
            state: Arc::clone(&self.state),
        })
    }
}

/// Scripted interactive surface: pops confirm answers front to back and
/// falls back to the prompt default.
pub struct AutoUi {
    pub answers: Mutex<VecDeque<char>>,
    pub secret: String,
}

impl AutoUi {
    pub fn new(answers: &[char]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().copied().collect()),
            secret: "hunter2".to_string(),
        }
    }
}

#[async_trait]
impl UserInterface for AutoUi {
    async fn confirm(&self, _prompt: &str, _options: &[char], default: Option<char>) -> char {
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .or(default)
            .unwrap_or('N')
    }

    async fn input_secret(&self, _prompt: &str) -> String {
        self.secret.clone()
    }

    fn milestone(&self, _message: &str) {}
}
