use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use treesync_core::{Connector, EntryKind};

use crate::config::SyncConfig;
use crate::console::{ConsoleReporter, UserInterface};
use crate::session_log::SessionLog;

use super::action::{ActionSpec, Evaluation, run_action};
use super::paths;
use super::plan::{ActionPlan, finalize, plan_differences};
use super::pool::{Command, CommandPool, ProgressFn, Reply, TransientParams, Verb};
use super::snapshot::{
    CachedFile, ContentSnapshot, ExcludeSet, FileRecord, LocalFileCache, SnapshotError,
};
use super::workers::{ItemStatus, Progress, ProgressHandle, run_items};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    BuildingSnapshots,
    Planning,
    AwaitingConfirmation,
    Executing,
    Persisting,
    Done,
    Aborted,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection check failed: {0}")]
    Connect(String),
    #[error("remote content could not be scanned")]
    RemoteScan,
    #[error("cancelled before execution")]
    Cancelled,
    #[error("keep-content data unusable: {0}")]
    Keep(String),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// State persisted between runs: the local hash cache and the remote tree
/// as of the last completed session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeepContent {
    pub local_files: LocalFileCache,
    pub remote_content: ContentSnapshot,
}

#[derive(Debug)]
pub struct SessionReport {
    pub plan: ActionPlan,
    /// Items still failed after every granted retry round.
    pub failed: Vec<String>,
}

/// Everything a spawned work item needs; cheap to clone into 'static
/// futures.
struct SessionShared<C: Connector> {
    pool: CommandPool<C>,
    log: Arc<SessionLog>,
    local_root: PathBuf,
    remote_root: String,
    action_retry_limit: u32,
    local: Arc<Mutex<ContentSnapshot>>,
    remote: Arc<Mutex<ContentSnapshot>>,
}

impl<C: Connector> Clone for SessionShared<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            log: Arc::clone(&self.log),
            local_root: self.local_root.clone(),
            remote_root: self.remote_root.clone(),
            action_retry_limit: self.action_retry_limit,
            local: Arc::clone(&self.local),
            remote: Arc::clone(&self.remote),
        }
    }
}

impl<C: Connector> SessionShared<C> {
    fn remote_path(&self, rel: &str) -> String {
        paths::join_remote(&self.remote_root, rel)
    }

    async fn local_hash(&self, rel: &str) -> Option<String> {
        match tokio::fs::read(paths::local_path(&self.local_root, rel)).await {
            Ok(data) => Some(format!("{:x}", md5::compute(&data))),
            Err(err) => {
                self.log
                    .error(&format!("read local file {rel}: {err}"), Some("hash"));
                None
            }
        }
    }

    /// Remote digest for one file, downloading it when the snapshot does
    /// not know it yet. The learned digest is stored back.
    async fn remote_hash(&self, rel: &str) -> Option<String> {
        if let Some(hash) = self
            .remote
            .lock()
            .await
            .files
            .get(rel)
            .and_then(|record| record.hash.clone())
        {
            return Some(hash);
        }
        let path = self.remote_path(rel);
        let outcome = run_action(
            &self.pool,
            ActionSpec {
                main: Box::new(move || {
                    Command::new(Verb::Retrieve { path: path.clone() })
                }),
                evaluation: Evaluation::AssumeSuccess,
                on_error: None,
                retry_limit: self.action_retry_limit,
            },
        )
        .await;
        let Some(Reply::Data(data)) = outcome.reply else {
            return None;
        };
        let hash = format!("{:x}", md5::compute(&data));
        if let Some(record) = self.remote.lock().await.files.get_mut(rel) {
            record.hash = Some(hash.clone());
        }
        Some(hash)
    }

    /// Remove a remote file and keep removing until a listing confirms it
    /// is gone. Used before re-uploading a file that verified wrong.
    async fn delete_until_gone(&self, rel: &str) -> bool {
        let path = self.remote_path(rel);
        let probe_path = path.clone();
        let outcome = run_action(
            &self.pool,
            ActionSpec {
                main: Box::new(move || Command::new(Verb::Delete { path: path.clone() })),
                evaluation: Evaluation::Verify {
                    probe: Box::new(move || {
                        Command::new(Verb::List {
                            path: probe_path.clone(),
                        })
                    }),
                    accept: Box::new(|reply| {
                        Box::pin(async move {
                            match reply {
                                Reply::Entries(entries) => Some(entries.is_empty()),
                                _ => Some(false),
                            }
                        })
                    }),
                },
                on_error: None,
                retry_limit: self.action_retry_limit,
            },
        )
        .await;
        if outcome.success {
            self.remote.lock().await.files.remove(rel);
        }
        outcome.success
    }
}

pub struct SyncSession<C: Connector> {
    config: SyncConfig,
    pool: CommandPool<C>,
    log: Arc<SessionLog>,
    ui: Arc<dyn UserInterface>,
    state: SessionState,
}

impl<C: Connector> SyncSession<C> {
    pub fn new(connector: C, config: SyncConfig, ui: Arc<dyn UserInterface>) -> Self {
        let pool = CommandPool::new(connector, config.pool_config());
        let log = Arc::new(SessionLog::new(config.log.clone()));
        Self {
            config,
            pool,
            log,
            ui,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run one full mirror pass. With `use_cached_remote` the remote tree
    /// comes from the keep-content file instead of a fresh scan; that mode
    /// is only sound when nobody touched the remote side since the last
    /// completed run.
    pub async fn run(&mut self, use_cached_remote: bool) -> Result<SessionReport, SessionError> {
        self.state = SessionState::Connecting;
        self.check_connect().await?;

        self.log.begin();
        self.log.service(
            &format!(
                "START SYNCHRONIZE {} -> {}",
                self.config.local_root.display(),
                self.config.remote_root
            ),
            None,
        );

        self.ui.milestone(&format!(
            "synchronizing {} -> {}",
            self.config.local_root.display(),
            self.config.remote_root
        ));

        self.state = SessionState::BuildingSnapshots;
        let excludes = ExcludeSet::compile(&self.config.exclude)?;
        let keep = self.load_keep(use_cached_remote)?;
        let cache = keep
            .as_ref()
            .map(|keep| keep.local_files.clone())
            .unwrap_or_default();

        let remote_snapshot = match keep {
            Some(keep) if use_cached_remote => keep.remote_content,
            _ => self.scan_remote_with_retries(&excludes).await?,
        };
        let local_snapshot = super::snapshot::scan_local(
            &self.config.local_root,
            &excludes,
            &cache,
            &|rel, err| {
                self.log
                    .error(&format!("read local file {rel}: {err}"), Some("hash"));
            },
        )?;

        self.state = SessionState::Planning;
        self.log.service("ANALYSIS CONTENTS DIFFERENCES", None);
        let draft = plan_differences(&local_snapshot, &remote_snapshot);
        let hash_candidates = draft.hash_candidates.clone();

        let shared = SessionShared {
            pool: self.pool.clone(),
            log: Arc::clone(&self.log),
            local_root: self.config.local_root.clone(),
            remote_root: self.config.remote_root.clone(),
            action_retry_limit: self.config.remote.action_retry_limit,
            local: Arc::new(Mutex::new(local_snapshot)),
            remote: Arc::new(Mutex::new(remote_snapshot)),
        };

        self.task_fetch_remote_hashes(&shared, &hash_candidates)
            .await;
        let mut mismatches = Vec::new();
        for rel in &hash_candidates {
            let remote = shared.remote.lock().await.files.get(rel).and_then(|r| r.hash.clone());
            let local = shared.local.lock().await.files.get(rel).and_then(|r| r.hash.clone());
            // an unreadable side counts as a mismatch, upload settles it
            if remote.is_none() || local.is_none() || remote != local {
                mismatches.push(rel.clone());
            }
        }
        let plan = finalize(draft, mismatches);
        self.log.service(&plan.summary(), None);
        self.ui.milestone(&format!("plan: {}", plan.summary()));

        if self.config.confirm_actions && !plan.is_empty() {
            self.state = SessionState::AwaitingConfirmation;
            let answer = self
                .ui
                .confirm(
                    &format!("Apply: {}? [Y/N]", plan.summary()),
                    &['Y', 'N'],
                    Some('N'),
                )
                .await;
            if answer != 'Y' {
                self.state = SessionState::Aborted;
                self.log.warning("synchronize cancelled by user");
                return Err(SessionError::Cancelled);
            }
        }

        self.state = SessionState::Executing;
        let mut failed = Vec::new();
        failed.extend(self.task_delete_files(&shared, &plan.files_to_delete).await);
        failed.extend(
            self.task_delete_folders(&shared, &plan.folders_to_delete)
                .await,
        );
        failed.extend(
            self.task_create_folders(&shared, &plan.folders_to_create)
                .await,
        );
        failed.extend(self.task_upload_files(&shared, &plan.files_to_upload).await);
        self.pool.close_all().await;

        self.state = SessionState::Persisting;
        self.log.service("SAVE KEEP REMOTE DATA", None);
        self.persist_keep(&shared).await?;

        self.state = SessionState::Done;
        self.log.service("COMPLETE", None);
        self.ui.milestone("synchronize complete");
        Ok(SessionReport { plan, failed })
    }

    /// Validate credentials with a one-shot listing probe before anything
    /// is logged or scanned. The probe carries its own connection
    /// parameters; the pool adopts them once they are proven.
    async fn check_connect(&mut self) -> Result<(), SessionError> {
        let mut connection = self.config.remote.connection.clone();
        if connection.password.is_empty() {
            connection.password = self
                .ui
                .input_secret(&format!("Password for {}:", connection.username))
                .await;
        }
        let probe_path = paths::join_remote(&self.config.remote_root, "");
        let transient = TransientParams {
            connection: Some(connection.clone()),
            request_timeout: Some(Duration::from_millis(7000)),
            retry_limit: Some(1),
        };
        let outcome = run_action(
            &self.pool,
            ActionSpec {
                main: Box::new(move || {
                    Command::new(Verb::List {
                        path: probe_path.clone(),
                    })
                    .with_transient(transient.clone())
                }),
                evaluation: Evaluation::AssumeSuccess,
                on_error: None,
                retry_limit: 1,
            },
        )
        .await;
        if !outcome.success {
            self.state = SessionState::Aborted;
            return Err(SessionError::Connect(
                "remote did not answer the probe listing".to_string(),
            ));
        }
        self.pool.set_connection(connection);
        self.ui.milestone("connection check passed");
        Ok(())
    }

    /// Cached mode insists on a readable keep file; a fresh scan merely
    /// loses the hash cache when it is missing or unreadable.
    fn load_keep(&self, required: bool) -> Result<Option<KeepContent>, SessionError> {
        let path = &self.config.keep_content_file;
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if required => return Err(SessionError::Keep(err.to_string())),
            Err(_) => return Ok(None),
        };
        match serde_json::from_str(&text) {
            Ok(keep) => Ok(Some(keep)),
            Err(err) if required => Err(SessionError::Keep(err.to_string())),
            Err(err) => {
                self.log
                    .warning(&format!("keep-content file ignored: {err}"));
                Ok(None)
            }
        }
    }

    async fn scan_remote_with_retries(
        &mut self,
        excludes: &ExcludeSet,
    ) -> Result<ContentSnapshot, SessionError> {
        loop {
            let listed = {
                let ui = Arc::clone(&self.ui);
                move |rel: &str| {
                    if !rel.is_empty() {
                        ui.milestone(&format!("listed {rel}"));
                    }
                }
            };
            match super::snapshot::scan_remote(
                &self.pool,
                &self.config.remote_root,
                excludes,
                self.config.remote.action_retry_limit,
                &listed,
            )
            .await
            {
                Ok(snapshot) => return Ok(snapshot),
                Err(err) => {
                    self.log.error(&err.to_string(), Some("remote-scan"));
                    let answer = self
                        .ui
                        .confirm("Fail get remote content. Try again? [Y/N]", &['Y', 'N'], None)
                        .await;
                    if answer != 'Y' {
                        self.state = SessionState::Aborted;
                        return Err(SessionError::RemoteScan);
                    }
                }
            }
        }
    }

    fn task_header(&self, title: &str, names: &[String]) {
        self.log.service(
            &format!("\n\t{}\n", names.join(", ")),
            Some(&format!("{title} (x{})", names.len())),
        );
    }

    async fn run_task<F>(&self, title: &str, names: &[String], execute: F) -> Vec<String>
    where
        F: Fn(usize, ProgressHandle) -> futures_util::future::BoxFuture<'static, bool>,
    {
        if names.is_empty() {
            return Vec::new();
        }
        self.task_header(title, names);
        let reporter = ConsoleReporter {
            title: title.to_string(),
            ui: Arc::clone(&self.ui),
        };
        let items = run_items(names, self.config.remote.num_workers.max(1), execute, &reporter)
            .await;
        eprintln!();
        items
            .iter()
            .filter(|item| item.status == ItemStatus::Failed)
            .map(|item| item.name.clone())
            .collect()
    }

    /// Download every rewrite candidate the snapshot has no digest for.
    /// Failures only log; the file then counts as a mismatch and gets
    /// re-uploaded.
    async fn task_fetch_remote_hashes(&self, shared: &SessionShared<C>, names: &[String]) {
        let todo: Vec<String> = {
            let remote = shared.remote.lock().await;
            names
                .iter()
                .filter(|rel| {
                    remote
                        .files
                        .get(*rel)
                        .is_none_or(|record| record.hash.is_none())
                })
                .cloned()
                .collect()
        };
        self.run_task("CHECK HASH FILES", &todo, |index, handle| {
            let shared = shared.clone();
            let rel = todo[index].clone();
            Box::pin(async move {
                let size = shared
                    .remote
                    .lock()
                    .await
                    .files
                    .get(&rel)
                    .map(|record| record.size)
                    .unwrap_or(0);
                let loaded = Arc::new(AtomicU64::new(0));
                let path = shared.remote_path(&rel);
                let progress: ProgressFn = {
                    let loaded = Arc::clone(&loaded);
                    Arc::new(move |chunk| {
                        loaded.fetch_add(chunk, Ordering::Relaxed);
                        let done = loaded.load(Ordering::Relaxed);
                        let pct = if size > 0 {
                            (done * 100 / size).min(100) as u8
                        } else {
                            100
                        };
                        handle.report(index, Progress::Percent(pct));
                    })
                };
                let log = Arc::clone(&shared.log);
                let rel_for_log = rel.clone();
                let loaded_for_reset = Arc::clone(&loaded);
                let outcome = run_action(
                    &shared.pool,
                    ActionSpec {
                        main: Box::new(move || {
                            Command::new(Verb::Retrieve { path: path.clone() })
                                .with_progress(Arc::clone(&progress))
                        }),
                        evaluation: Evaluation::AssumeSuccess,
                        on_error: Some(Box::new(move |_, _, exhausted| {
                            loaded_for_reset.store(0, Ordering::Relaxed);
                            if exhausted {
                                log.error(
                                    &format!("Fail get hash by file - {rel_for_log}"),
                                    Some("hash"),
                                );
                            }
                        })),
                        retry_limit: shared.action_retry_limit,
                    },
                )
                .await;
                let Some(Reply::Data(data)) = outcome.reply else {
                    return false;
                };
                let hash = format!("{:x}", md5::compute(&data));
                if let Some(record) = shared.remote.lock().await.files.get_mut(&rel) {
                    record.hash = Some(hash);
                }
                true
            })
        })
        .await;
    }

    /// Delete each file, verified by a listing that must come back empty.
    async fn task_delete_files(
        &self,
        shared: &SessionShared<C>,
        names: &[String],
    ) -> Vec<String> {
        self.run_task("DELETE FILES", names, |index, _| {
            let shared = shared.clone();
            let rel = names[index].clone();
            Box::pin(async move {
                let path = shared.remote_path(&rel);
                let probe_path = path.clone();
                let log = Arc::clone(&shared.log);
                let rel_for_log = rel.clone();
                let outcome = run_action(
                    &shared.pool,
                    ActionSpec {
                        main: Box::new(move || {
                            Command::new(Verb::Delete { path: path.clone() })
                        }),
                        evaluation: Evaluation::Verify {
                            probe: Box::new(move || {
                                Command::new(Verb::List {
                                    path: probe_path.clone(),
                                })
                            }),
                            accept: Box::new(|reply| {
                                Box::pin(async move {
                                    match reply {
                                        Reply::Entries(entries) => Some(entries.is_empty()),
                                        _ => Some(false),
                                    }
                                })
                            }),
                        },
                        on_error: Some(Box::new(move |_, error, exhausted| {
                            if exhausted {
                                let detail = error
                                    .map(|err| err.to_string())
                                    .unwrap_or_else(|| "still listed".to_string());
                                log.error(
                                    &format!("Fail delete file - {rel_for_log}: {detail}"),
                                    Some("delete"),
                                );
                            }
                        })),
                        retry_limit: shared.action_retry_limit,
                    },
                )
                .await;
                if outcome.success {
                    shared.remote.lock().await.files.remove(&rel);
                }
                outcome.success
            })
        })
        .await
    }

    /// Remove each folder recursively; a settled command is trusted and the
    /// subtree is pruned from the snapshot.
    async fn task_delete_folders(
        &self,
        shared: &SessionShared<C>,
        names: &[String],
    ) -> Vec<String> {
        self.run_task("DELETE FOLDERS", names, |index, _| {
            let shared = shared.clone();
            let rel = names[index].clone();
            Box::pin(async move {
                let path = shared.remote_path(&rel);
                let log = Arc::clone(&shared.log);
                let rel_for_log = rel.clone();
                let prune = shared.clone();
                let rel_for_prune = rel.clone();
                let outcome = run_action(
                    &shared.pool,
                    ActionSpec {
                        main: Box::new(move || {
                            Command::new(Verb::RemoveDir { path: path.clone() })
                        }),
                        evaluation: Evaluation::ForEach(Box::new(move |_reply| {
                            let prune = prune.clone();
                            let rel = rel_for_prune.clone();
                            Box::pin(async move {
                                prune.remote.lock().await.remove_subtree(&rel);
                                None
                            })
                        })),
                        on_error: Some(Box::new(move |_, error, exhausted| {
                            if exhausted {
                                let detail = error
                                    .map(|err| err.to_string())
                                    .unwrap_or_else(|| "rejected".to_string());
                                log.error(
                                    &format!("Fail delete folder - {rel_for_log}: {detail}"),
                                    Some("rmdir"),
                                );
                            }
                        })),
                        retry_limit: shared.action_retry_limit,
                    },
                )
                .await;
                outcome.success
            })
        })
        .await
    }

    /// Create each missing folder; intermediate folders come with it, so
    /// the snapshot records the whole ancestor chain.
    async fn task_create_folders(
        &self,
        shared: &SessionShared<C>,
        names: &[String],
    ) -> Vec<String> {
        self.run_task("CREATE FOLDERS", names, |index, _| {
            let shared = shared.clone();
            let rel = names[index].clone();
            Box::pin(async move {
                let path = shared.remote_path(&rel);
                let log = Arc::clone(&shared.log);
                let rel_for_log = rel.clone();
                let record = shared.clone();
                let rel_for_record = rel.clone();
                let outcome = run_action(
                    &shared.pool,
                    ActionSpec {
                        main: Box::new(move || {
                            Command::new(Verb::MakeDir { path: path.clone() })
                        }),
                        evaluation: Evaluation::ForEach(Box::new(move |_reply| {
                            let record = record.clone();
                            let rel = rel_for_record.clone();
                            Box::pin(async move {
                                record
                                    .remote
                                    .lock()
                                    .await
                                    .insert_folder_with_ancestors(&rel);
                                None
                            })
                        })),
                        on_error: Some(Box::new(move |_, error, exhausted| {
                            if exhausted {
                                let detail = error
                                    .map(|err| err.to_string())
                                    .unwrap_or_else(|| "rejected".to_string());
                                log.error(
                                    &format!("Fail create folder - {rel_for_log}: {detail}"),
                                    Some("mkdir"),
                                );
                            }
                        })),
                        retry_limit: shared.action_retry_limit,
                    },
                )
                .await;
                outcome.success
            })
        })
        .await
    }

    /// Upload each file, verify it by listing and digest comparison, and
    /// clean up a wrong upload before the next attempt.
    async fn task_upload_files(
        &self,
        shared: &SessionShared<C>,
        names: &[String],
    ) -> Vec<String> {
        self.run_task("UPLOAD FILES", names, |index, handle| {
            let shared = shared.clone();
            let rel = names[index].clone();
            Box::pin(async move {
                let size = shared
                    .local
                    .lock()
                    .await
                    .files
                    .get(&rel)
                    .map(|record| record.size)
                    .unwrap_or(0);
                let source = paths::local_path(&shared.local_root, &rel);
                let path = shared.remote_path(&rel);
                let probe_path = path.clone();
                let loaded = Arc::new(AtomicU64::new(0));
                let sent = Arc::clone(&loaded);
                let progress_handle = handle.clone();
                let progress: ProgressFn = Arc::new(move |chunk| {
                    sent.fetch_add(chunk, Ordering::Relaxed);
                    let done = sent.load(Ordering::Relaxed);
                    let pct = if size > 0 {
                        (done * 100 / size).min(100) as u8
                    } else {
                        100
                    };
                    progress_handle.report(index, Progress::Percent(pct));
                });

                let verify = shared.clone();
                let rel_for_verify = rel.clone();
                let tag_handle = handle.clone();
                let log = Arc::clone(&shared.log);
                let rel_for_log = rel.clone();
                let loaded_for_reset = Arc::clone(&loaded);
                let outcome = run_action(
                    &shared.pool,
                    ActionSpec {
                        main: Box::new(move || {
                            Command::new(Verb::Store {
                                source: source.clone(),
                                path: path.clone(),
                            })
                            .with_progress(Arc::clone(&progress))
                        }),
                        evaluation: Evaluation::Verify {
                            probe: Box::new(move || {
                                Command::new(Verb::List {
                                    path: probe_path.clone(),
                                })
                            }),
                            accept: Box::new(move |reply| {
                                let shared = verify.clone();
                                let rel = rel_for_verify.clone();
                                let handle = tag_handle.clone();
                                Box::pin(async move {
                                    let Reply::Entries(entries) = reply else {
                                        return Some(false);
                                    };
                                    // exactly the uploaded file, nothing else
                                    let [entry] = entries.as_slice() else {
                                        return Some(false);
                                    };
                                    if entry.kind != EntryKind::File {
                                        return Some(false);
                                    }
                                    let listed_size = entry.size;
                                    handle.report(index, Progress::Tag("TEST".to_string()));
                                    let local = shared.local_hash(&rel).await;
                                    {
                                        let mut remote = shared.remote.lock().await;
                                        if let Some(record) = remote.files.get_mut(&rel) {
                                            record.hash = None;
                                        }
                                    }
                                    let remote = shared.remote_hash(&rel).await;
                                    if local.is_some() && local == remote {
                                        shared.remote.lock().await.files.insert(
                                            rel.clone(),
                                            FileRecord {
                                                size: listed_size,
                                                mtime: None,
                                                hash: local,
                                            },
                                        );
                                        Some(true)
                                    } else {
                                        // wrong content on the server, take
                                        // it down before the retry
                                        shared.delete_until_gone(&rel).await;
                                        Some(false)
                                    }
                                })
                            }),
                        },
                        on_error: Some(Box::new(move |_, error, exhausted| {
                            loaded_for_reset.store(0, Ordering::Relaxed);
                            if exhausted {
                                let detail = error
                                    .map(|err| err.to_string())
                                    .unwrap_or_else(|| "verification failed".to_string());
                                log.error(
                                    &format!("Fail upload file - {rel_for_log}: {detail}"),
                                    Some("upload"),
                                );
                            }
                        })),
                        retry_limit: shared.action_retry_limit,
                    },
                )
                .await;
                outcome.success
            })
        })
        .await
    }

    /// Write the keep-content file: the remote tree as executed plus a hash
    /// cache rebuilt from the local snapshot.
    async fn persist_keep(&self, shared: &SessionShared<C>) -> Result<(), SessionError> {
        let local_files: LocalFileCache = shared
            .local
            .lock()
            .await
            .files
            .iter()
            .filter_map(|(rel, record)| match (&record.mtime, &record.hash) {
                (Some(mtime), Some(hash)) => Some((
                    rel.clone(),
                    CachedFile {
                        size: record.size,
                        mtime: *mtime,
                        hash: hash.clone(),
                    },
                )),
                _ => None,
            })
            .collect();
        let keep = KeepContent {
            local_files,
            remote_content: shared.remote.lock().await.clone(),
        };
        let text = serde_json::to_string_pretty(&keep)
            .map_err(|err| SessionError::Keep(err.to_string()))?;
        std::fs::write(&self.config.keep_content_file, text)?;
        Ok(())
    }
}
