use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::UNIX_EPOCH;

use futures_util::future::BoxFuture;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use treesync_core::{Connector, EntryKind};
use walkdir::WalkDir;

use super::action::{ActionSpec, Evaluation, run_action};
use super::paths;
use super::pool::{Command, CommandPool, Reply, Verb};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Walk(#[from] walkdir::Error),
    #[error(transparent)]
    Pattern(#[from] globset::Error),
    #[error("remote listing failed for {0}")]
    Listing(String),
    #[error("unsupported path: {0}")]
    Path(String),
}

/// Metadata kept per file in a tree snapshot. Remote listings only yield
/// sizes; modification time and hash are filled in where known.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub size: u64,
    /// Milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<u64>,
    /// Lowercase hex md5 digest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// One side of the comparison: every folder and file under a root, keyed by
/// root-relative `/`-separated path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentSnapshot {
    pub folders: BTreeSet<String>,
    pub files: BTreeMap<String, FileRecord>,
}

impl ContentSnapshot {
    pub fn insert_folder_with_ancestors(&mut self, rel: &str) {
        for ancestor in paths::ancestors_inclusive(rel) {
            self.folders.insert(ancestor);
        }
    }

    /// Drop a folder together with everything recorded beneath it.
    pub fn remove_subtree(&mut self, folder: &str) {
        self.folders
            .retain(|f| f != folder && !paths::is_under(f, folder));
        self.files.retain(|f, _| !paths::is_under(f, folder));
    }
}

/// Cached local metadata from a previous run, used to skip re-hashing
/// files whose size and mtime are unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFile {
    pub size: u64,
    pub mtime: u64,
    pub hash: String,
}

pub type LocalFileCache = BTreeMap<String, CachedFile>;

/// Compiled exclusion globs, matched against root-relative paths. A matched
/// folder prunes its whole subtree.
#[derive(Debug, Clone)]
pub struct ExcludeSet {
    set: GlobSet,
}

impl ExcludeSet {
    pub fn empty() -> Self {
        Self {
            set: GlobSet::empty(),
        }
    }

    pub fn compile(patterns: &[String]) -> Result<Self, SnapshotError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            set: builder.build()?,
        })
    }

    pub fn matches(&self, rel: &str) -> bool {
        self.set.is_match(rel)
    }
}

fn mtime_millis(meta: &std::fs::Metadata) -> Option<u64> {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
}

fn hash_file(path: &Path, rel: &str, on_unreadable: &dyn Fn(&str, &std::io::Error)) -> Option<String> {
    match std::fs::read(path) {
        Ok(data) => Some(format!("{:x}", md5::compute(&data))),
        Err(err) => {
            on_unreadable(rel, &err);
            None
        }
    }
}

/// Walk the local root into a snapshot. Hashes every file, reusing cache
/// entries whose size and mtime still match. A file that cannot be read
/// keeps its record without a digest, the comparison then treats it as a
/// mismatch and the failure surfaces on that file alone.
pub fn scan_local(
    root: &Path,
    excludes: &ExcludeSet,
    cache: &LocalFileCache,
    on_unreadable: &dyn Fn(&str, &std::io::Error),
) -> Result<ContentSnapshot, SnapshotError> {
    let mut snapshot = ContentSnapshot::default();
    let walker = WalkDir::new(root).min_depth(1).into_iter();
    let filtered = walker.filter_entry(|entry| {
        match paths::relative_to(root, entry.path()) {
            Ok(rel) => !excludes.matches(&rel),
            Err(_) => false,
        }
    });
    for entry in filtered {
        let entry = entry?;
        let rel = paths::relative_to(root, entry.path())
            .map_err(|_| SnapshotError::Path(entry.path().display().to_string()))?;
        if entry.file_type().is_dir() {
            snapshot.folders.insert(rel);
        } else if entry.file_type().is_file() {
            let meta = entry.metadata()?;
            let size = meta.len();
            let mtime = mtime_millis(&meta);
            let hash = match (cache.get(&rel), mtime) {
                (Some(cached), Some(mtime)) if cached.size == size && cached.mtime == mtime => {
                    Some(cached.hash.clone())
                }
                _ => hash_file(entry.path(), &rel, on_unreadable),
            };
            snapshot.files.insert(rel, FileRecord { size, mtime, hash });
        }
    }
    Ok(snapshot)
}

/// Recursively list the remote root into a snapshot. Each listing runs at
/// the full action retry budget; a listing that still fails aborts the
/// whole scan, a partial remote picture is worse than none.
pub async fn scan_remote<C: Connector>(
    pool: &CommandPool<C>,
    remote_root: &str,
    excludes: &ExcludeSet,
    action_retry_limit: u32,
    on_listed: &(dyn Fn(&str) + Sync),
) -> Result<ContentSnapshot, SnapshotError> {
    let mut snapshot = ContentSnapshot::default();
    scan_remote_into(
        pool,
        remote_root,
        String::new(),
        excludes,
        action_retry_limit,
        on_listed,
        &mut snapshot,
    )
    .await?;
    Ok(snapshot)
}

fn scan_remote_into<'a, C: Connector>(
    pool: &'a CommandPool<C>,
    remote_root: &'a str,
    rel: String,
    excludes: &'a ExcludeSet,
    action_retry_limit: u32,
    on_listed: &'a (dyn Fn(&str) + Sync),
    snapshot: &'a mut ContentSnapshot,
) -> BoxFuture<'a, Result<(), SnapshotError>> {
    Box::pin(async move {
        let remote_path = paths::join_remote(remote_root, &rel);
        let outcome = run_action(
            pool,
            ActionSpec {
                main: {
                    let remote_path = remote_path.clone();
                    Box::new(move || {
                        Command::new(Verb::List {
                            path: remote_path.clone(),
                        })
                    })
                },
                evaluation: Evaluation::AssumeSuccess,
                on_error: None,
                retry_limit: action_retry_limit,
            },
        )
        .await;
        let Some(Reply::Entries(entries)) = outcome.reply else {
            return Err(SnapshotError::Listing(remote_path));
        };
        on_listed(&rel);

        let mut folders = Vec::new();
        for entry in entries {
            if entry.name == "." || entry.name == ".." {
                continue;
            }
            let child = paths::join_rel(&rel, &entry.name);
            if excludes.matches(&child) {
                continue;
            }
            match entry.kind {
                EntryKind::Folder => {
                    snapshot.folders.insert(child.clone());
                    folders.push(child);
                }
                EntryKind::File => {
                    snapshot.files.insert(
                        child,
                        FileRecord {
                            size: entry.size,
                            mtime: None,
                            hash: None,
                        },
                    );
                }
            }
        }
        for child in folders {
            scan_remote_into(
                pool,
                remote_root,
                child,
                excludes,
                action_retry_limit,
                on_listed,
                snapshot,
            )
            .await?;
        }
        Ok(())
    })
}
