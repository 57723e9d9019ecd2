use super::paths;
use super::snapshot::ContentSnapshot;

/// Differences before hash verification: rewrite candidates still need
/// their remote hashes fetched and compared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DraftPlan {
    pub files_to_delete: Vec<String>,
    pub folders_to_delete: Vec<String>,
    pub folders_to_create: Vec<String>,
    pub files_to_upload: Vec<String>,
    /// Present on both sides with differing sizes; rewritten outright.
    pub size_mismatches: Vec<String>,
    /// Present on both sides with equal size; hashes decide.
    pub hash_candidates: Vec<String>,
}

/// Final executable plan, in application order: delete files, delete
/// folders, create folders, upload files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionPlan {
    pub files_to_delete: Vec<String>,
    pub folders_to_delete: Vec<String>,
    pub folders_to_create: Vec<String>,
    pub files_to_upload: Vec<String>,
    /// Upload entries that replace an existing remote file, so they appear
    /// in the delete list too.
    pub files_to_rewrite: Vec<String>,
}

impl ActionPlan {
    pub fn is_empty(&self) -> bool {
        self.files_to_delete.is_empty()
            && self.folders_to_delete.is_empty()
            && self.folders_to_create.is_empty()
            && self.files_to_upload.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "delete {} file(s), remove {} folder(s), create {} folder(s), upload {} file(s)",
            self.files_to_delete.len(),
            self.folders_to_delete.len(),
            self.folders_to_create.len(),
            self.files_to_upload.len()
        )
    }
}

fn under_any(path: &str, folders: &[String]) -> bool {
    folders.iter().any(|folder| paths::is_under(path, folder))
}

/// Compare the two snapshots into a draft plan. Size differences mark a
/// rewrite outright; equal sizes defer to hash comparison. Remote files
/// inside a folder already scheduled for deletion are not deleted one by
/// one, removing the folder covers them.
pub fn plan_differences(local: &ContentSnapshot, remote: &ContentSnapshot) -> DraftPlan {
    let mut draft = DraftPlan::default();

    let folders_to_delete: Vec<String> = remote
        .folders
        .iter()
        .filter(|folder| !local.folders.contains(*folder))
        .cloned()
        .collect();
    draft.folders_to_delete = collapse_to_shallowest(&folders_to_delete);

    let folders_to_create: Vec<String> = local
        .folders
        .iter()
        .filter(|folder| !remote.folders.contains(*folder))
        .cloned()
        .collect();
    draft.folders_to_create = collapse_to_deepest(&folders_to_create);

    for (path, remote_record) in &remote.files {
        match local.files.get(path) {
            None => {
                if !under_any(path, &draft.folders_to_delete) {
                    draft.files_to_delete.push(path.clone());
                }
            }
            Some(local_record) => {
                if local_record.size != remote_record.size {
                    draft.size_mismatches.push(path.clone());
                } else {
                    draft.hash_candidates.push(path.clone());
                }
            }
        }
    }
    for path in local.files.keys() {
        if !remote.files.contains_key(path) {
            draft.files_to_upload.push(path.clone());
        }
    }
    draft.files_to_upload.sort();
    draft
}

/// Keep only folders whose ancestors are not themselves in the set;
/// removing the shallowest folder recursively covers the rest.
pub fn collapse_to_shallowest(folders: &[String]) -> Vec<String> {
    let mut out: Vec<String> = folders
        .iter()
        .filter(|folder| !under_any(folder, &folders.to_vec()))
        .cloned()
        .collect();
    out.sort_by_key(|f| (paths::depth(f), f.clone()));
    out
}

/// Keep only folders that are not an ancestor of another in the set;
/// creating the deepest folder with intermediates covers the rest.
pub fn collapse_to_deepest(folders: &[String]) -> Vec<String> {
    let mut out: Vec<String> = folders
        .iter()
        .filter(|folder| {
            !folders
                .iter()
                .any(|other| paths::is_under(other, folder))
        })
        .cloned()
        .collect();
    out.sort_by_key(|f| (paths::depth(f), f.clone()));
    out
}

/// Fold the rewrites into the draft: size mismatches found during planning
/// and verified hash mismatches each get listed for deletion and upload
/// both, the stale remote copy goes down before the fresh one goes up.
pub fn finalize(draft: DraftPlan, hash_mismatches: Vec<String>) -> ActionPlan {
    let mut rewrites = draft.size_mismatches;
    rewrites.extend(hash_mismatches);
    rewrites.sort();
    let mut plan = ActionPlan {
        files_to_delete: draft.files_to_delete,
        folders_to_delete: draft.folders_to_delete,
        folders_to_create: draft.folders_to_create,
        files_to_upload: draft.files_to_upload,
        files_to_rewrite: rewrites,
    };
    for path in &plan.files_to_rewrite {
        plan.files_to_delete.push(path.clone());
        plan.files_to_upload.push(path.clone());
    }
    plan.files_to_delete.sort();
    plan.files_to_upload.sort();
    plan
}
