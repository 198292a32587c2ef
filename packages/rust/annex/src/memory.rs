//! In-process [`VersionStore`] backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use sha2::{Digest, Sha256};

use harvester_shared::{HarvesterError, Result};

use crate::store::{ObjectId, Tree, VersionStore};

#[derive(Debug, Clone)]
struct CommitObject {
    tree: Tree,
    parents: Vec<ObjectId>,
}

#[derive(Debug, Default)]
struct Inner {
    blobs: HashMap<ObjectId, Vec<u8>>,
    commits: HashMap<ObjectId, CommitObject>,
    branches: BTreeMap<String, ObjectId>,
    annex: HashMap<String, Vec<u8>>,
    checked_out: Option<String>,
}

/// SHA-256 addressed store living entirely in memory.
///
/// Used by tests and dry runs; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The branch last passed to [`VersionStore::checkout`].
    pub fn checked_out(&self) -> Option<String> {
        self.lock().checked_out.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn digest(parts: &[&[u8]]) -> ObjectId {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}

impl VersionStore for MemoryStore {
    fn branch_names(&self) -> Result<Vec<String>> {
        Ok(self.lock().branches.keys().cloned().collect())
    }

    fn branch_head(&self, branch: &str) -> Result<Option<ObjectId>> {
        Ok(self.lock().branches.get(branch).cloned())
    }

    fn read_tree(&self, commit: &str) -> Result<Tree> {
        self.lock()
            .commits
            .get(commit)
            .map(|c| c.tree.clone())
            .ok_or_else(|| HarvesterError::Storage(format!("unknown commit {commit}")))
    }

    fn commit_parents(&self, commit: &str) -> Result<Vec<ObjectId>> {
        self.lock()
            .commits
            .get(commit)
            .map(|c| c.parents.clone())
            .ok_or_else(|| HarvesterError::Storage(format!("unknown commit {commit}")))
    }

    fn write_blob(&self, data: &[u8]) -> Result<ObjectId> {
        let id = digest(&[&b"blob\0"[..], data]);
        self.lock()
            .blobs
            .entry(id.clone())
            .or_insert_with(|| data.to_vec());
        Ok(id)
    }

    fn read_blob(&self, id: &str) -> Result<Vec<u8>> {
        self.lock()
            .blobs
            .get(id)
            .cloned()
            .ok_or_else(|| HarvesterError::Storage(format!("unknown blob {id}")))
    }

    fn commit(
        &self,
        branch: &str,
        tree: &Tree,
        parents: &[ObjectId],
        message: &str,
    ) -> Result<ObjectId> {
        let mut inner = self.lock();
        for parent in parents {
            if !inner.commits.contains_key(parent) {
                return Err(HarvesterError::Storage(format!("unknown parent {parent}")));
            }
        }

        let mut parts: Vec<&[u8]> = vec![&b"commit\0"[..], message.as_bytes()];
        for parent in parents {
            parts.push(b"\0parent ");
            parts.push(parent.as_bytes());
        }
        for (path, id) in tree {
            parts.push(b"\0");
            parts.push(path.as_bytes());
            parts.push(b" ");
            parts.push(id.as_bytes());
        }
        let id = digest(&parts);

        inner.commits.insert(
            id.clone(),
            CommitObject {
                tree: tree.clone(),
                parents: parents.to_vec(),
            },
        );
        inner.branches.insert(branch.to_string(), id.clone());
        Ok(id)
    }

    fn set_branch(&self, branch: &str, commit: &str) -> Result<()> {
        let mut inner = self.lock();
        if !inner.commits.contains_key(commit) {
            return Err(HarvesterError::Storage(format!("unknown commit {commit}")));
        }
        inner.branches.insert(branch.to_string(), commit.to_string());
        Ok(())
    }

    fn put_annex_object(&self, key: &str, data: &[u8]) -> Result<()> {
        self.lock().annex.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn has_annex_object(&self, key: &str) -> Result<bool> {
        Ok(self.lock().annex.contains_key(key))
    }

    fn read_annex_object(&self, key: &str) -> Result<Vec<u8>> {
        self.lock()
            .annex
            .get(key)
            .cloned()
            .ok_or_else(|| HarvesterError::Storage(format!("annex object {key} not present")))
    }

    fn checkout(&self, branch: &str) -> Result<()> {
        let mut inner = self.lock();
        if !inner.branches.contains_key(branch) {
            return Err(HarvesterError::Storage(format!("no branch {branch}")));
        }
        inner.checked_out = Some(branch.to_string());
        Ok(())
    }
}
