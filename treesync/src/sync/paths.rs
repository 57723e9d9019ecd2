use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("path contains an unsupported component")]
    UnsupportedComponent,
    #[error("path is outside the scanned root")]
    OutsideRoot,
}

/// Root-relative form of `path`, `/`-separated, no leading or trailing
/// separator. This is the canonical key used by snapshots and plans.
pub fn relative_to(root: &Path, path: &Path) -> Result<String, PathError> {
    let stripped = path.strip_prefix(root).map_err(|_| PathError::OutsideRoot)?;
    normalize(stripped)
}

pub fn normalize(path: &Path) -> Result<String, PathError> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                parts.push(part.to_str().ok_or(PathError::UnsupportedComponent)?)
            }
            Component::CurDir | Component::RootDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    if parts.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(parts.join("/"))
}

/// Append one entry name to a relative path.
pub fn join_rel(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{base}/{name}")
    }
}

/// Absolute remote path for a root-relative one.
pub fn join_remote(remote_root: &str, rel: &str) -> String {
    let mut out = remote_root.trim_end_matches('/').to_string();
    if !rel.is_empty() {
        out.push('/');
        out.push_str(rel);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Local filesystem path for a root-relative one.
pub fn local_path(root: &Path, rel: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in rel.split('/').filter(|part| !part.is_empty()) {
        out.push(part);
    }
    out
}

/// True when `path` is strictly inside `folder`.
pub fn is_under(path: &str, folder: &str) -> bool {
    path.strip_prefix(folder)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// The path itself plus every proper ancestor, shallowest first.
pub fn ancestors_inclusive(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for part in path.split('/') {
        if !current.is_empty() {
            current.push('/');
        }
        current.push_str(part);
        out.push(current.clone());
    }
    out
}

pub fn depth(path: &str) -> usize {
    path.split('/').count()
}
