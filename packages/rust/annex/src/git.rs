//! [`VersionStore`] backed by a real git repository.
//!
//! Everything goes through git plumbing so commits can be made on any
//! branch without touching the user's index or working tree; only
//! [`VersionStore::checkout`] updates the working tree.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use harvester_shared::{HarvesterError, Result};

use crate::key::AnnexKey;
use crate::store::{ObjectId, Tree, VersionStore};

const COMMITTER_NAME: &str = "Harvester";
const COMMITTER_EMAIL: &str = "harvester@localhost";

/// A git repository driven through the `git` executable.
#[derive(Debug, Clone)]
pub struct GitStore {
    root: PathBuf,
}

impl GitStore {
    /// Whether `path` holds a git repository.
    pub fn exists(path: &Path) -> bool {
        path.join(".git").is_dir()
    }

    /// Open an existing repository.
    pub fn open(path: &Path) -> Result<Self> {
        if !Self::exists(path) {
            return Err(HarvesterError::config(format!(
                "{} is not a git repository",
                path.display()
            )));
        }
        Ok(Self {
            root: path.to_path_buf(),
        })
    }

    /// Create a repository at `path` (and the directory itself if needed).
    pub fn init(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path).map_err(|e| HarvesterError::io(path, e))?;
        let store = Self {
            root: path.to_path_buf(),
        };
        if !Self::exists(path) {
            store.git(&["init", "-q"])?;
            store.git(&["symbolic-ref", "HEAD", "refs/heads/master"])?;
            debug!(path = %path.display(), "initialized git repository");
        }
        Ok(store)
    }

    /// Whether a usable `git` executable is on `PATH`.
    pub fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn git_dir(&self) -> PathBuf {
        self.root.join(".git")
    }

    fn annex_object_path(&self, key: &str) -> PathBuf {
        self.git_dir().join("annex").join("objects").join(key)
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.root)
            .args(args)
            .env("GIT_AUTHOR_NAME", COMMITTER_NAME)
            .env("GIT_AUTHOR_EMAIL", COMMITTER_EMAIL)
            .env("GIT_COMMITTER_NAME", COMMITTER_NAME)
            .env("GIT_COMMITTER_EMAIL", COMMITTER_EMAIL);
        cmd
    }

    fn spawn(&self, mut cmd: Command, stdin: Option<&[u8]>) -> Result<Output> {
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| HarvesterError::VersionControl(format!("failed to run git: {e}")))?;
        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(data)
                .map_err(|e| HarvesterError::VersionControl(format!("git stdin: {e}")))?;
        }
        child
            .wait_with_output()
            .map_err(|e| HarvesterError::VersionControl(format!("git did not finish: {e}")))
    }

    fn checked(&self, args: &[&str], output: Output) -> Result<Vec<u8>> {
        if !output.status.success() {
            return Err(HarvesterError::VersionControl(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    fn git(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = self.spawn(self.command(args), None)?;
        self.checked(args, output)
    }

    fn git_with_input(&self, args: &[&str], input: &[u8]) -> Result<Vec<u8>> {
        let output = self.spawn(self.command(args), Some(input))?;
        self.checked(args, output)
    }

    fn git_line(&self, args: &[&str]) -> Result<String> {
        let out = self.git(args)?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    /// Build a tree object from `tree` using a throwaway index file.
    fn write_tree(&self, tree: &Tree) -> Result<ObjectId> {
        let index = self
            .git_dir()
            .join(format!("harvester-index-{}", Uuid::now_v7()));
        let index_env = index.to_string_lossy().to_string();

        let mut listing = Vec::new();
        for (path, id) in tree {
            listing.extend_from_slice(format!("100644 {id}\t{path}").as_bytes());
            listing.push(0);
        }

        let result = (|| -> Result<ObjectId> {
            let mut cmd = self.command(&["read-tree", "--empty"]);
            cmd.env("GIT_INDEX_FILE", &index_env);
            let output = self.spawn(cmd, None)?;
            self.checked(&["read-tree", "--empty"], output)?;

            let args = ["update-index", "--add", "-z", "--index-info"];
            let mut cmd = self.command(&args);
            cmd.env("GIT_INDEX_FILE", &index_env);
            let output = self.spawn(cmd, Some(&listing))?;
            self.checked(&args, output)?;

            let mut cmd = self.command(&["write-tree"]);
            cmd.env("GIT_INDEX_FILE", &index_env);
            let output = self.spawn(cmd, None)?;
            let out = self.checked(&["write-tree"], output)?;
            Ok(String::from_utf8_lossy(&out).trim().to_string())
        })();

        let _ = std::fs::remove_file(&index);
        result
    }
}

impl VersionStore for GitStore {
    fn branch_names(&self) -> Result<Vec<String>> {
        let out = self.git(&["for-each-ref", "--format=%(refname:short)", "refs/heads/"])?;
        Ok(String::from_utf8_lossy(&out)
            .lines()
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    fn branch_head(&self, branch: &str) -> Result<Option<ObjectId>> {
        let refname = format!("refs/heads/{branch}");
        let args = ["rev-parse", "--verify", "-q", refname.as_str()];
        let output = self.spawn(self.command(&args), None)?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
    }

    fn read_tree(&self, commit: &str) -> Result<Tree> {
        let out = self.git(&["ls-tree", "-r", "-z", commit])?;
        let mut tree = Tree::new();
        for entry in out.split(|b| *b == 0).filter(|e| !e.is_empty()) {
            // <mode> SP <type> SP <object> TAB <path>
            let entry = String::from_utf8_lossy(entry);
            let Some((meta, path)) = entry.split_once('\t') else {
                continue;
            };
            let mut fields = meta.split(' ');
            let (Some(_mode), Some(kind), Some(id)) = (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if kind == "blob" {
                tree.insert(path.to_string(), id.to_string());
            }
        }
        Ok(tree)
    }

    fn commit_parents(&self, commit: &str) -> Result<Vec<ObjectId>> {
        let line = self.git_line(&["show", "-s", "--format=%P", commit])?;
        Ok(line.split_whitespace().map(String::from).collect())
    }

    fn write_blob(&self, data: &[u8]) -> Result<ObjectId> {
        let out = self.git_with_input(&["hash-object", "-w", "--stdin"], data)?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    fn read_blob(&self, id: &str) -> Result<Vec<u8>> {
        self.git(&["cat-file", "blob", id])
    }

    fn commit(
        &self,
        branch: &str,
        tree: &Tree,
        parents: &[ObjectId],
        message: &str,
    ) -> Result<ObjectId> {
        let tree_id = self.write_tree(tree)?;

        let mut args = vec!["commit-tree".to_string(), tree_id];
        for parent in parents {
            args.push("-p".into());
            args.push(parent.clone());
        }
        args.push("-m".into());
        args.push(message.to_string());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let date = format!("{} +0000", Utc::now().timestamp());
        let mut cmd = self.command(&args);
        cmd.env("GIT_AUTHOR_DATE", &date)
            .env("GIT_COMMITTER_DATE", &date);
        let output = self.spawn(cmd, None)?;
        let commit = String::from_utf8_lossy(&self.checked(&args, output)?)
            .trim()
            .to_string();

        self.set_branch(branch, &commit)?;
        debug!(branch, %commit, "committed");
        Ok(commit)
    }

    fn set_branch(&self, branch: &str, commit: &str) -> Result<()> {
        let refname = format!("refs/heads/{branch}");
        self.git(&["update-ref", refname.as_str(), commit])?;
        Ok(())
    }

    fn put_annex_object(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.annex_object_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HarvesterError::io(parent, e))?;
        }
        std::fs::write(&path, data).map_err(|e| HarvesterError::io(&path, e))
    }

    fn has_annex_object(&self, key: &str) -> Result<bool> {
        Ok(self.annex_object_path(key).is_file())
    }

    fn read_annex_object(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.annex_object_path(key);
        std::fs::read(&path).map_err(|e| HarvesterError::io(&path, e))
    }

    /// Switch `HEAD` to `branch` and materialize its tree, replacing pointer
    /// files whose content is present with that content.
    fn checkout(&self, branch: &str) -> Result<()> {
        let refname = format!("refs/heads/{branch}");
        self.git(&["symbolic-ref", "HEAD", refname.as_str()])?;
        self.git(&["read-tree", "--reset", "-u", refname.as_str()])?;

        let Some(head) = self.branch_head(branch)? else {
            return Ok(());
        };
        for (path, id) in self.read_tree(&head)? {
            let Some(key) = AnnexKey::from_pointer(&self.read_blob(&id)?) else {
                continue;
            };
            if self.has_annex_object(key.as_str())? {
                let target = self.root.join(&path);
                let content = self.read_annex_object(key.as_str())?;
                std::fs::write(&target, content).map_err(|e| HarvesterError::io(&target, e))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_repo() -> PathBuf {
        std::env::temp_dir().join(format!("hv-git-test-{}", Uuid::now_v7()))
    }

    #[test]
    fn open_requires_a_repository() {
        let dir = temp_repo();
        let err = GitStore::open(&dir).unwrap_err();
        assert!(matches!(err, HarvesterError::Config { .. }));
    }

    #[test]
    fn commits_on_branches_without_touching_the_index() {
        if !GitStore::git_available() {
            return;
        }
        let dir = temp_repo();
        let store = GitStore::init(&dir).unwrap();

        let readme = store.write_blob(b"hello\n").unwrap();
        let nested = store.write_blob(b"nested\n").unwrap();
        let tree: Tree = [
            ("README".to_string(), readme.clone()),
            ("releases/1.0/notes.txt".to_string(), nested),
        ]
        .into_iter()
        .collect();

        let first = store.commit("incoming", &tree, &[], "first").unwrap();
        assert_eq!(store.branch_head("incoming").unwrap(), Some(first.clone()));
        assert_eq!(store.branch_head("master").unwrap(), None);
        assert_eq!(store.read_tree(&first).unwrap(), tree);
        assert_eq!(store.read_blob(&readme).unwrap(), b"hello\n");
        assert!(!dir.join(".git/index").exists());

        let second = store
            .commit("master", &Tree::new(), &[first.clone()], "second")
            .unwrap();
        assert_eq!(store.commit_parents(&second).unwrap(), vec![first]);

        let mut names = store.branch_names().unwrap();
        names.sort();
        assert_eq!(names, vec!["incoming", "master"]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn checkout_materializes_annexed_content() {
        if !GitStore::git_available() {
            return;
        }
        let dir = temp_repo();
        let store = GitStore::init(&dir).unwrap();

        let key = AnnexKey::for_content("data.bin", b"binary payload");
        store.put_annex_object(key.as_str(), b"binary payload").unwrap();
        let pointer = store.write_blob(key.pointer().as_bytes()).unwrap();
        let text = store.write_blob(b"plain\n").unwrap();
        let tree: Tree = [
            ("data.bin".to_string(), pointer),
            ("notes.txt".to_string(), text),
        ]
        .into_iter()
        .collect();
        store.commit("master", &tree, &[], "content").unwrap();

        store.checkout("master").unwrap();
        assert_eq!(std::fs::read(dir.join("data.bin")).unwrap(), b"binary payload");
        assert_eq!(std::fs::read(dir.join("notes.txt")).unwrap(), b"plain\n");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
