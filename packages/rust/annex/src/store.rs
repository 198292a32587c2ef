//! The version-control interface the annexator commits through.

use std::collections::BTreeMap;

use harvester_shared::Result;

/// Object identifier (hex digest) of a blob or commit.
pub type ObjectId = String;

/// A flattened tree: repository-relative path → blob id.
pub type Tree = BTreeMap<String, ObjectId>;

/// Minimal content store with named branches.
///
/// Implementations must be content-addressed: writing the same bytes twice
/// yields the same blob id. `commit` both creates the commit and points
/// `branch` at it.
pub trait VersionStore: Send + Sync {
    /// Names of all local branches.
    fn branch_names(&self) -> Result<Vec<String>>;

    /// The commit `branch` points at, or `None` if it does not exist.
    fn branch_head(&self, branch: &str) -> Result<Option<ObjectId>>;

    /// Full file listing of a commit.
    fn read_tree(&self, commit: &str) -> Result<Tree>;

    /// Parent commits, first parent first.
    fn commit_parents(&self, commit: &str) -> Result<Vec<ObjectId>>;

    fn write_blob(&self, data: &[u8]) -> Result<ObjectId>;

    fn read_blob(&self, id: &str) -> Result<Vec<u8>>;

    /// Record `tree` as a new commit on `branch` and advance the branch.
    fn commit(
        &self,
        branch: &str,
        tree: &Tree,
        parents: &[ObjectId],
        message: &str,
    ) -> Result<ObjectId>;

    /// Point `branch` at an existing commit.
    fn set_branch(&self, branch: &str, commit: &str) -> Result<()>;

    /// Store annexed content under `key`.
    fn put_annex_object(&self, key: &str, data: &[u8]) -> Result<()>;

    fn has_annex_object(&self, key: &str) -> Result<bool>;

    fn read_annex_object(&self, key: &str) -> Result<Vec<u8>>;

    /// Make `branch` the checked-out branch, updating any working tree.
    fn checkout(&self, _branch: &str) -> Result<()> {
        Ok(())
    }
}

/// Head commit and tree of `branch`, if it exists.
pub fn branch_tree(store: &dyn VersionStore, branch: &str) -> Result<Option<(ObjectId, Tree)>> {
    match store.branch_head(branch)? {
        Some(head) => {
            let tree = store.read_tree(&head)?;
            Ok(Some((head, tree)))
        }
        None => Ok(None),
    }
}

/// Replay the changes between `old` and `new` onto `base`.
///
/// Paths changed or added in `new` take `new`'s blob; paths present in
/// `old` but gone from `new` are removed. Everything else in `base` stays.
pub fn apply_diff(base: &mut Tree, old: &Tree, new: &Tree) {
    for (path, id) in new {
        if old.get(path) != Some(id) {
            base.insert(path.clone(), id.clone());
        }
    }
    for path in old.keys() {
        if !new.contains_key(path) {
            base.remove(path);
        }
    }
}
