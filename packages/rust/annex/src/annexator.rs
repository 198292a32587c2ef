//! Materializes crawled resources into a versioned dataset.
//!
//! Downloads land on the `incoming` branch. Finalizing merges them into
//! `incoming-processed`, where `.tar.gz` archives are replaced by their
//! extracted members, then advances `master`: a fast-forward when master
//! only ever followed the processed branch, a merge commit when somebody
//! committed on master in between. Large content is stored as annex objects
//! and tracked on the `git-annex` branch.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use harvester_crawler::{Fetcher, parse_url};
use harvester_pipeline::nodes::url_filename;
use harvester_pipeline::{Node, NodeOutput, RunContext};
use harvester_shared::{AnnexConfig, Counter, HarvesterError, Record, Result, fields};

use crate::archives::{extract, is_archive};
use crate::git::GitStore;
use crate::key::AnnexKey;
use crate::largefiles::LargeFiles;
use crate::store::{ObjectId, Tree, VersionStore, apply_diff, branch_tree};

/// Bookkeeping branch holding uuid and location logs.
pub const ANNEX_BRANCH: &str = "git-annex";

/// Where a dataset records how it is crawled.
pub const CRAWL_CONFIG_PATH: &str = ".harvester/crawl.toml";

const GITATTRIBUTES: &str = ".gitattributes";
const UUID_LOG: &str = "uuid.log";
const DEFAULT_FILENAME: &str = "index.html";

/// How to open a dataset.
#[derive(Debug, Clone, Default)]
pub struct AnnexOptions {
    /// Create the repository (and annex bookkeeping) when missing.
    pub create: bool,
    /// Branch names and the largefiles expression.
    pub config: AnnexConfig,
}

impl AnnexOptions {
    pub fn new(config: AnnexConfig) -> Self {
        Self {
            create: false,
            config,
        }
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn largefiles(mut self, expr: impl Into<String>) -> Self {
        self.config.largefiles = Some(expr.into());
        self
    }
}

/// The crawl template recorded in a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetInit {
    pub template: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

/// Heads produced by a finalize that had something to commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalized {
    pub incoming: ObjectId,
    pub processed: ObjectId,
    pub master: ObjectId,
    /// Master simply moved to the processed head.
    pub fast_forward: bool,
}

#[derive(Debug, Default)]
struct Staging {
    /// Pending `incoming` tree, loaded on first use.
    incoming: Option<Tree>,
    dirty: bool,
    /// Log path on the annex branch → lines to append.
    logs: BTreeMap<String, String>,
}

/// Stages downloaded files into a dataset and commits them on finalize.
pub struct Annexator {
    store: Arc<dyn VersionStore>,
    config: AnnexConfig,
    largefiles: LargeFiles,
    fetcher: Arc<Fetcher>,
    uuid: String,
    staging: Mutex<Staging>,
}

impl std::fmt::Debug for Annexator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Annexator")
            .field("uuid", &self.uuid)
            .field("largefiles", &self.largefiles.source())
            .finish_non_exhaustive()
    }
}

impl Annexator {
    /// Open the git-backed dataset at `path`.
    ///
    /// Without `options.create`, a missing repository is a configuration
    /// error reported before anything is downloaded.
    pub fn open(path: &Path, options: AnnexOptions, fetcher: Arc<Fetcher>) -> Result<Self> {
        let store = if GitStore::exists(path) {
            GitStore::open(path)?
        } else if options.create {
            GitStore::init(path)?
        } else {
            return Err(HarvesterError::config(format!(
                "no dataset at {}; initialize it first or set `create = true`",
                path.display()
            )));
        };
        Self::with_store(Arc::new(store), options, fetcher)
    }

    /// Use an arbitrary store, bootstrapping it when `options.create` is set.
    pub fn with_store(
        store: Arc<dyn VersionStore>,
        options: AnnexOptions,
        fetcher: Arc<Fetcher>,
    ) -> Result<Self> {
        let config = options.config;
        let explicit = config
            .largefiles
            .as_deref()
            .map(LargeFiles::parse)
            .transpose()?;

        let (uuid, largefiles) = match read_uuid(store.as_ref())? {
            Some(uuid) => {
                let largefiles = match explicit {
                    Some(lf) => lf,
                    None => recorded_largefiles(store.as_ref(), &config.master_branch)?
                        .unwrap_or_default(),
                };
                (uuid, largefiles)
            }
            None if options.create => {
                let largefiles = explicit.unwrap_or_default();
                let uuid = bootstrap(store.as_ref(), &config.master_branch, &largefiles)?;
                (uuid, largefiles)
            }
            None => {
                return Err(HarvesterError::config(
                    "repository has no annex bookkeeping; open it with `create = true`",
                ));
            }
        };

        debug!(%uuid, largefiles = %largefiles, "annex ready");
        Ok(Self {
            store,
            config,
            largefiles,
            fetcher,
            uuid,
            staging: Mutex::new(Staging::default()),
        })
    }

    pub fn store(&self) -> &Arc<dyn VersionStore> {
        &self.store
    }

    pub fn config(&self) -> &AnnexConfig {
        &self.config
    }

    pub fn largefiles(&self) -> &LargeFiles {
        &self.largefiles
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// The node committing staged work; place it after everything that annexes.
    pub fn finalize(self: &Arc<Self>) -> Finalize {
        Finalize {
            annex: Arc::clone(self),
        }
    }

    /// Read a committed file, resolving annexed content.
    pub fn read_file(&self, branch: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let Some((_, tree)) = branch_tree(self.store.as_ref(), branch)? else {
            return Ok(None);
        };
        match tree.get(path) {
            Some(id) => self.resolve_blob(id).map(Some),
            None => Ok(None),
        }
    }

    /// Record `init` in the dataset's crawl configuration on master.
    pub fn initiate(&self, init: &DatasetInit) -> Result<ObjectId> {
        let content = toml::to_string_pretty(init)
            .map_err(|e| HarvesterError::config(format!("failed to encode crawl config: {e}")))?;
        let master = &self.config.master_branch;
        let (head, mut tree) = branch_tree(self.store.as_ref(), master)?
            .ok_or_else(|| HarvesterError::Storage(format!("branch {master} does not exist")))?;

        let blob = self.store.write_blob(content.as_bytes())?;
        if tree.get(CRAWL_CONFIG_PATH) == Some(&blob) {
            return Ok(head);
        }
        tree.insert(CRAWL_CONFIG_PATH.to_string(), blob);
        let commit = self.store.commit(
            master,
            &tree,
            &[head],
            &format!("[HARVESTER] Initialize crawling with template {}", init.template),
        )?;
        self.store.checkout(master)?;
        info!(template = %init.template, "dataset initialized");
        Ok(commit)
    }

    /// The crawl configuration recorded on master, if any.
    pub fn dataset_init(&self) -> Result<Option<DatasetInit>> {
        let Some(raw) = self.read_file(&self.config.master_branch, CRAWL_CONFIG_PATH)? else {
            return Ok(None);
        };
        let text = String::from_utf8(raw)
            .map_err(|e| HarvesterError::parse(format!("{CRAWL_CONFIG_PATH}: {e}")))?;
        toml::from_str(&text)
            .map(Some)
            .map_err(|e| HarvesterError::parse(format!("{CRAWL_CONFIG_PATH}: {e}")))
    }

    async fn annex_record(&self, record: &Record, ctx: &RunContext) -> Result<Record> {
        let raw = record.get_str(fields::URL).ok_or_else(|| {
            HarvesterError::validation("annex: record has no `url` to download")
        })?;
        let url = parse_url(raw)?;
        let filename = match record.get_str(fields::FILENAME) {
            Some(name) => name.to_string(),
            None => url_filename(url.as_str()).unwrap_or_else(|| DEFAULT_FILENAME.to_string()),
        };
        let filepath = repo_path(record.get_str(fields::PATH), &filename)?;

        let data = self.fetcher.fetch_bytes(&url).await?;
        ctx.stats.add_bytes(data.len() as u64);

        let key = self.stage(&url, &filepath, &data, ctx).await?;
        let mut out = record.with(fields::FILEPATH, filepath);
        if let Some(key) = key {
            out.insert(fields::ANNEX_KEY, key.to_string());
        }
        Ok(out)
    }

    /// Put `data` at `filepath` in the pending incoming tree.
    async fn stage(
        &self,
        url: &Url,
        filepath: &str,
        data: &[u8],
        ctx: &RunContext,
    ) -> Result<Option<AnnexKey>> {
        let (blob, key) = self.store_content(filepath, data)?;

        let mut guard = self.staging.lock().await;
        let staging = &mut *guard;
        let tree = load_incoming(&mut staging.incoming, self.store.as_ref(), &self.config)?;

        let previous = tree.get(filepath).cloned();
        if previous.as_ref() == Some(&blob) {
            ctx.stats.bump(Counter::Skipped);
            debug!(filepath, "content unchanged, skipping");
            return Ok(key);
        }

        tree.insert(filepath.to_string(), blob);
        staging.dirty = true;
        if previous.is_some() {
            ctx.stats.bump(Counter::Overwritten);
        }
        ctx.stats.bump(Counter::Materialized);

        match &key {
            Some(key) => {
                ctx.stats.bump(Counter::AddAnnex);
                self.log_present(&mut staging.logs, key);
                staging
                    .logs
                    .entry(key.web_log())
                    .or_default()
                    .push_str(&format!("{}s 1 {url}\n", Utc::now().timestamp()));
                info!(filepath, %key, "annexed");
            }
            None => {
                ctx.stats.bump(Counter::AddGit);
                info!(filepath, "added to git");
            }
        }
        Ok(key)
    }

    /// Write `data` as the blob for `filepath`: an annex pointer when the
    /// largefiles expression selects it, the content itself otherwise.
    fn store_content(&self, filepath: &str, data: &[u8]) -> Result<(ObjectId, Option<AnnexKey>)> {
        let key = self
            .largefiles
            .matches(filepath, data.len() as u64)
            .then(|| AnnexKey::for_content(filepath, data));

        let blob = match &key {
            Some(key) => {
                if !self.store.has_annex_object(key.as_str())? {
                    self.store.put_annex_object(key.as_str(), data)?;
                }
                self.store.write_blob(key.pointer().as_bytes())?
            }
            None => self.store.write_blob(data)?,
        };
        Ok((blob, key))
    }

    fn log_present(&self, logs: &mut BTreeMap<String, String>, key: &AnnexKey) {
        logs.entry(key.location_log())
            .or_default()
            .push_str(&format!("{}s 1 {}\n", Utc::now().timestamp(), self.uuid));
    }

    /// Content of a committed blob, following annex pointers.
    fn resolve_blob(&self, id: &str) -> Result<Vec<u8>> {
        let blob = self.store.read_blob(id)?;
        match AnnexKey::from_pointer(&blob) {
            Some(key) => self.store.read_annex_object(key.as_str()),
            None => Ok(blob),
        }
    }

    /// The entries that differ between `old` and `new` incoming trees, as
    /// they look on the processed branch: archives are replaced by their
    /// members, placed next to where the archive was.
    fn processed_changes(
        &self,
        old: &Tree,
        new: &Tree,
        logs: &mut BTreeMap<String, String>,
    ) -> Result<(Tree, Tree)> {
        let mut before = Tree::new();
        for (path, id) in old.iter().filter(|(p, id)| new.get(*p) != Some(*id)) {
            self.expand_into(&mut before, path, id, None)?;
        }
        let mut after = Tree::new();
        for (path, id) in new.iter().filter(|(p, id)| old.get(*p) != Some(*id)) {
            self.expand_into(&mut after, path, id, Some(&mut *logs))?;
        }
        Ok((before, after))
    }

    fn expand_into(
        &self,
        tree: &mut Tree,
        path: &str,
        id: &ObjectId,
        logs: Option<&mut BTreeMap<String, String>>,
    ) -> Result<()> {
        if !is_archive(path) {
            tree.insert(path.to_string(), id.clone());
            return Ok(());
        }
        let members = match extract(&self.resolve_blob(id)?) {
            Ok(members) => members,
            Err(e) => {
                warn!(path, error = %e, "cannot extract archive, keeping it as is");
                tree.insert(path.to_string(), id.clone());
                return Ok(());
            }
        };

        let dir = path.rsplit_once('/').map(|(dir, _)| dir);
        let mut keys = Vec::new();
        for (member, content) in members {
            let target = match dir {
                Some(dir) => format!("{dir}/{member}"),
                None => member,
            };
            let (blob, key) = self.store_content(&target, &content)?;
            keys.extend(key);
            tree.insert(target, blob);
        }
        if let Some(logs) = logs {
            debug!(path, annexed = keys.len(), "extracted archive");
            for key in &keys {
                self.log_present(logs, key);
            }
        }
        Ok(())
    }

    /// Commit everything staged so far. Returns `None` when nothing changed.
    #[instrument(skip(self))]
    pub async fn commit_pending(&self) -> Result<Option<Finalized>> {
        let mut guard = self.staging.lock().await;
        let staging = &mut *guard;
        if !staging.dirty {
            debug!("nothing staged, no commits");
            return Ok(None);
        }
        let Some(new_incoming) = staging.incoming.clone() else {
            return Ok(None);
        };

        let store = self.store.as_ref();
        let cfg = &self.config;
        let master = branch_tree(store, &cfg.master_branch)?;

        // incoming continues from its own head, or forks off master
        let (incoming_parents, old_incoming) = match branch_tree(store, &cfg.incoming_branch)? {
            Some((head, tree)) => (vec![head], tree),
            None => match &master {
                Some((head, tree)) => (vec![head.clone()], tree.clone()),
                None => (Vec::new(), Tree::new()),
            },
        };
        let incoming = store.commit(
            &cfg.incoming_branch,
            &new_incoming,
            &incoming_parents,
            "[HARVESTER] Add crawled files to incoming",
        )?;

        let (extracted_old, extracted_new) =
            self.processed_changes(&old_incoming, &new_incoming, &mut staging.logs)?;
        self.commit_logs(&staging.logs)?;

        let (processed_base, old_processed) = match branch_tree(store, &cfg.processed_branch)? {
            Some((head, tree)) => (Some(head), tree),
            None => match &master {
                Some((head, tree)) => (Some(head.clone()), tree.clone()),
                None => (None, Tree::new()),
            },
        };
        let mut processed_tree = old_processed.clone();
        apply_diff(&mut processed_tree, &extracted_old, &extracted_new);
        let mut parents: Vec<ObjectId> = processed_base.iter().cloned().collect();
        parents.push(incoming.clone());
        let processed = store.commit(
            &cfg.processed_branch,
            &processed_tree,
            &parents,
            &format!(
                "[HARVESTER] Merge {} into {}",
                cfg.incoming_branch, cfg.processed_branch
            ),
        )?;

        let (master_head, fast_forward) = match &master {
            Some((head, tree)) if Some(head) != processed_base.as_ref() => {
                let mut merged = tree.clone();
                apply_diff(&mut merged, &old_processed, &processed_tree);
                let commit = store.commit(
                    &cfg.master_branch,
                    &merged,
                    &[head.clone(), processed.clone()],
                    &format!(
                        "[HARVESTER] Merge {} into {}",
                        cfg.processed_branch, cfg.master_branch
                    ),
                )?;
                (commit, false)
            }
            _ => {
                store.set_branch(&cfg.master_branch, &processed)?;
                (processed.clone(), true)
            }
        };
        store.checkout(&cfg.master_branch)?;

        staging.incoming = None;
        staging.logs.clear();
        staging.dirty = false;

        info!(%incoming, %processed, master = %master_head, fast_forward, "finalized");
        Ok(Some(Finalized {
            incoming,
            processed,
            master: master_head,
            fast_forward,
        }))
    }

    fn commit_logs(&self, logs: &BTreeMap<String, String>) -> Result<()> {
        if logs.is_empty() {
            return Ok(());
        }
        let store = self.store.as_ref();
        let (parents, mut tree) = match branch_tree(store, ANNEX_BRANCH)? {
            Some((head, tree)) => (vec![head], tree),
            None => (Vec::new(), Tree::new()),
        };
        for (path, lines) in logs {
            let mut content = match tree.get(path) {
                Some(id) => store.read_blob(id)?,
                None => Vec::new(),
            };
            content.extend_from_slice(lines.as_bytes());
            tree.insert(path.clone(), store.write_blob(&content)?);
        }
        store.commit(ANNEX_BRANCH, &tree, &parents, "update")?;
        Ok(())
    }
}

#[async_trait]
impl Node for Annexator {
    fn name(&self) -> &str {
        "annex"
    }

    async fn call(&self, record: &Record, ctx: &RunContext) -> Result<NodeOutput> {
        Ok(NodeOutput::one(self.annex_record(record, ctx).await?))
    }

    /// Commit whatever a run staged but never reached a finalize node.
    async fn on_run_end(&self, _ctx: &RunContext) -> Result<()> {
        if self.commit_pending().await?.is_some() {
            info!("committed content staged before the run ended");
        }
        Ok(())
    }
}

/// Node committing what an [`Annexator`] staged; passes its input through.
pub struct Finalize {
    annex: Arc<Annexator>,
}

#[async_trait]
impl Node for Finalize {
    fn name(&self) -> &str {
        "annex_finalize"
    }

    async fn call(&self, record: &Record, _ctx: &RunContext) -> Result<NodeOutput> {
        self.annex.commit_pending().await?;
        Ok(NodeOutput::one(record.clone()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Repository-relative path for `filename` under an optional directory.
fn repo_path(dir: Option<&str>, filename: &str) -> Result<String> {
    let joined = match dir.map(str::trim).filter(|d| !d.is_empty()) {
        Some(dir) => format!("{dir}/{filename}"),
        None => filename.to_string(),
    };
    if joined.starts_with('/') || joined.starts_with('\\') {
        return Err(HarvesterError::validation(format!(
            "path {joined:?} must be relative to the dataset"
        )));
    }

    let parts: Vec<&str> = joined
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    if parts.contains(&"..") {
        return Err(HarvesterError::validation(format!(
            "path {joined:?} escapes the dataset"
        )));
    }
    match parts.first() {
        None => Err(HarvesterError::validation("empty target path")),
        Some(&".git") => Err(HarvesterError::validation(format!(
            "path {joined:?} points into .git"
        ))),
        Some(_) => Ok(parts.join("/")),
    }
}

fn load_incoming<'a>(
    slot: &'a mut Option<Tree>,
    store: &dyn VersionStore,
    config: &AnnexConfig,
) -> Result<&'a mut Tree> {
    if slot.is_none() {
        let base = match branch_tree(store, &config.incoming_branch)? {
            Some((_, tree)) => tree,
            None => branch_tree(store, &config.master_branch)?
                .map(|(_, tree)| tree)
                .unwrap_or_default(),
        };
        *slot = Some(base);
    }
    Ok(slot.get_or_insert_with(Tree::new))
}

fn read_uuid(store: &dyn VersionStore) -> Result<Option<String>> {
    let Some((_, tree)) = branch_tree(store, ANNEX_BRANCH)? else {
        return Ok(None);
    };
    let Some(id) = tree.get(UUID_LOG) else {
        return Ok(None);
    };
    let log = store.read_blob(id)?;
    Ok(String::from_utf8_lossy(&log)
        .split_whitespace()
        .next()
        .map(String::from))
}

fn recorded_largefiles(store: &dyn VersionStore, master: &str) -> Result<Option<LargeFiles>> {
    let Some((_, tree)) = branch_tree(store, master)? else {
        return Ok(None);
    };
    let Some(id) = tree.get(GITATTRIBUTES) else {
        return Ok(None);
    };
    let content = store.read_blob(id)?;
    LargeFiles::from_gitattributes(&String::from_utf8_lossy(&content)).transpose()
}

/// Create the annex branch and, when missing, the initial master commit.
fn bootstrap(store: &dyn VersionStore, master: &str, largefiles: &LargeFiles) -> Result<String> {
    let uuid = Uuid::now_v7().to_string();
    let log = format!("{uuid} harvester timestamp={}s\n", Utc::now().timestamp());
    let tree: Tree = [(UUID_LOG.to_string(), store.write_blob(log.as_bytes())?)]
        .into_iter()
        .collect();
    store.commit(ANNEX_BRANCH, &tree, &[], "branch created")?;

    if store.branch_head(master)?.is_none() {
        let attrs = store.write_blob(largefiles.gitattributes_line().as_bytes())?;
        let tree: Tree = [(GITATTRIBUTES.to_string(), attrs)].into_iter().collect();
        store.commit(master, &tree, &[], "[HARVESTER] Initialize dataset")?;
        store.checkout(master)?;
    }
    info!(%uuid, "annex initialized");
    Ok(uuid)
}

#[cfg(test)]
mod tests {
    use harvester_pipeline::Pipeline;
    use harvester_shared::{ActivityStats, FetchConfig};

    use super::*;
    use crate::archives::tests::tarball;
    use crate::memory::MemoryStore;

    const CHANGELOG: &str = "1.0.0 initial release\n";
    const ARCHIVE: &[u8] = b"\x1f\x8b pretend tarball";

    fn fetcher() -> Arc<Fetcher> {
        Arc::new(
            Fetcher::new(FetchConfig {
                allow_private_hosts: true,
                ..FetchConfig::default()
            })
            .unwrap(),
        )
    }

    async fn serve(server: &wiremock::MockServer, path: &str, body: Vec<u8>) {
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path(path))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_bytes(body))
            .mount(server)
            .await;
    }

    async fn site() -> wiremock::MockServer {
        let server = wiremock::MockServer::start().await;
        serve(&server, "/ds666/release_history.txt", CHANGELOG.into()).await;
        serve(&server, "/ds666/ds666_R1.0.0.tar.gz", ARCHIVE.to_vec()).await;
        server
    }

    fn annexator(store: &Arc<MemoryStore>) -> Arc<Annexator> {
        let store: Arc<dyn VersionStore> = store.clone();
        let options = AnnexOptions::default()
            .create(true)
            .largefiles("exclude=*.txt and exclude=README");
        Arc::new(Annexator::with_store(store, options, fetcher()).unwrap())
    }

    fn changelog(server: &wiremock::MockServer) -> Record {
        Record::new()
            .with("url", format!("{}/ds666/release_history.txt", server.uri()))
            .with("filename", "changelog.txt")
    }

    fn archive(server: &wiremock::MockServer) -> Record {
        Record::new()
            .with("url", format!("{}/ds666/ds666_R1.0.0.tar.gz", server.uri()))
            .with("path", "releases/1.0.0")
    }

    async fn stage_one(annex: &Annexator, record: Record, ctx: &RunContext) -> Record {
        match annex.call(&record, ctx).await.unwrap() {
            NodeOutput::Emit(mut records) => records.remove(0),
            NodeOutput::Finish => panic!("annex never finishes"),
        }
    }

    fn head(store: &MemoryStore, branch: &str) -> ObjectId {
        store.branch_head(branch).unwrap().unwrap()
    }

    #[test]
    fn bootstrap_records_uuid_and_largefiles() {
        let store = Arc::new(MemoryStore::new());
        let annex = annexator(&store);

        assert_eq!(store.branch_names().unwrap(), vec!["git-annex", "master"]);
        let attrs = annex.read_file("master", ".gitattributes").unwrap().unwrap();
        assert_eq!(
            String::from_utf8(attrs).unwrap(),
            "* annex.largefiles=(exclude=*.txt)and(exclude=README)\n"
        );
        let uuid_log = annex.read_file("git-annex", "uuid.log").unwrap().unwrap();
        assert!(String::from_utf8(uuid_log).unwrap().starts_with(annex.uuid()));
        assert_eq!(store.checked_out().as_deref(), Some("master"));
    }

    #[test]
    fn reopening_reuses_uuid_and_recorded_largefiles() {
        let store = Arc::new(MemoryStore::new());
        let first = annexator(&store);

        let dyn_store: Arc<dyn VersionStore> = store.clone();
        let again = Annexator::with_store(dyn_store, AnnexOptions::default(), fetcher()).unwrap();
        assert_eq!(again.uuid(), first.uuid());
        assert!(!again.largefiles().matches("changelog.txt", 10));
        assert!(again.largefiles().matches("data.tar.gz", 10));
    }

    #[test]
    fn missing_bookkeeping_without_create_is_a_config_error() {
        let store: Arc<dyn VersionStore> = Arc::new(MemoryStore::new());
        let err = Annexator::with_store(store, AnnexOptions::default(), fetcher()).unwrap_err();
        assert!(matches!(err, HarvesterError::Config { .. }));
    }

    #[test]
    fn open_without_create_fails_before_touching_disk() {
        let path = std::env::temp_dir().join(format!("hv-missing-{}", Uuid::now_v7()));
        let err = Annexator::open(&path, AnnexOptions::default(), fetcher()).unwrap_err();
        assert!(matches!(err, HarvesterError::Config { .. }));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn first_run_populates_all_branches() {
        let server = site().await;
        let store = Arc::new(MemoryStore::new());
        let annex = annexator(&store);
        let initial_master = head(&store, "master");
        let ctx = RunContext::default();

        let text = annex.call(&changelog(&server), &ctx).await.unwrap();
        let NodeOutput::Emit(text) = text else {
            panic!("expected a record");
        };
        assert_eq!(text[0].get_str("filepath"), Some("changelog.txt"));
        assert!(!text[0].contains("annex_key"));

        let big = stage_one(&annex, archive(&server), &ctx).await;
        assert_eq!(big.get_str("filepath"), Some("releases/1.0.0/ds666_R1.0.0.tar.gz"));
        assert!(big.get_str("annex_key").unwrap().ends_with(".tar.gz"));

        let done = annex.commit_pending().await.unwrap().unwrap();
        assert!(done.fast_forward);

        assert_eq!(
            store.branch_names().unwrap(),
            vec!["git-annex", "incoming", "incoming-processed", "master"]
        );
        assert_eq!(head(&store, "master"), head(&store, "incoming-processed"));
        assert_ne!(head(&store, "incoming"), head(&store, "incoming-processed"));
        assert_eq!(
            store.commit_parents(&done.processed).unwrap(),
            vec![initial_master.clone(), done.incoming.clone()]
        );
        assert_eq!(store.commit_parents(&done.incoming).unwrap(), vec![initial_master]);

        // text in git verbatim, the archive through a pointer
        let master_tree = store.read_tree(&head(&store, "master")).unwrap();
        let text_blob = store.read_blob(&master_tree["changelog.txt"]).unwrap();
        assert_eq!(text_blob, CHANGELOG.as_bytes());
        let pointer = store
            .read_blob(&master_tree["releases/1.0.0/ds666_R1.0.0.tar.gz"])
            .unwrap();
        assert!(AnnexKey::from_pointer(&pointer).is_some());
        assert_eq!(
            annex
                .read_file("master", "releases/1.0.0/ds666_R1.0.0.tar.gz")
                .unwrap()
                .unwrap(),
            ARCHIVE
        );
        assert!(master_tree.contains_key(".gitattributes"));

        assert_eq!(ctx.stats.get(Counter::Materialized), 2);
        assert_eq!(ctx.stats.get(Counter::AddGit), 1);
        assert_eq!(ctx.stats.get(Counter::AddAnnex), 1);
        assert_eq!(ctx.stats.snapshot().downloaded_bytes, (CHANGELOG.len() + ARCHIVE.len()) as u64);
        assert_eq!(store.checked_out().as_deref(), Some("master"));
    }

    #[tokio::test]
    async fn annexed_keys_are_logged_on_the_annex_branch() {
        let server = site().await;
        let store = Arc::new(MemoryStore::new());
        let annex = annexator(&store);
        let ctx = RunContext::default();

        let big = stage_one(&annex, archive(&server), &ctx).await;
        annex.commit_pending().await.unwrap();

        let key = AnnexKey::from_pointer(
            format!("/annex/objects/{}\n", big.get_str("annex_key").unwrap()).as_bytes(),
        )
        .unwrap();
        let location = annex.read_file(ANNEX_BRANCH, &key.location_log()).unwrap().unwrap();
        assert!(String::from_utf8(location).unwrap().contains(annex.uuid()));
        let web = annex.read_file(ANNEX_BRANCH, &key.web_log()).unwrap().unwrap();
        assert!(String::from_utf8(web).unwrap().contains("/ds666/ds666_R1.0.0.tar.gz"));
    }

    #[tokio::test]
    async fn rerunning_an_unchanged_crawl_commits_nothing() {
        let server = site().await;
        let store = Arc::new(MemoryStore::new());

        let first = annexator(&store);
        let ctx = RunContext::default();
        stage_one(&first, changelog(&server), &ctx).await;
        stage_one(&first, archive(&server), &ctx).await;
        first.commit_pending().await.unwrap();

        let heads: Vec<_> = store
            .branch_names()
            .unwrap()
            .iter()
            .map(|b| head(&store, b))
            .collect();

        let second = annexator(&store);
        let ctx = RunContext::new(Arc::new(ActivityStats::new()));
        stage_one(&second, changelog(&server), &ctx).await;
        stage_one(&second, archive(&server), &ctx).await;
        assert_eq!(second.commit_pending().await.unwrap(), None);

        let after: Vec<_> = store
            .branch_names()
            .unwrap()
            .iter()
            .map(|b| head(&store, b))
            .collect();
        assert_eq!(heads, after);
        assert_eq!(ctx.stats.get(Counter::Skipped), 2);
        assert_eq!(ctx.stats.get(Counter::Materialized), 0);
    }

    #[tokio::test]
    async fn changed_content_overwrites_and_fast_forwards() {
        let server = site().await;
        let store = Arc::new(MemoryStore::new());
        let annex_node = annexator(&store);
        let ctx = RunContext::default();
        stage_one(&annex_node, changelog(&server), &ctx).await;
        let first = annex_node.commit_pending().await.unwrap().unwrap();

        server.reset().await;
        serve(&server, "/ds666/release_history.txt", b"1.0.1 fixes\n".to_vec()).await;
        stage_one(&annex_node, changelog(&server), &ctx).await;
        let second = annex_node.commit_pending().await.unwrap().unwrap();

        assert!(second.fast_forward);
        assert_eq!(store.commit_parents(&second.incoming).unwrap(), vec![first.incoming]);
        assert_eq!(
            store.commit_parents(&second.processed).unwrap(),
            vec![first.processed, second.incoming.clone()]
        );
        assert_eq!(ctx.stats.get(Counter::Overwritten), 1);
        assert_eq!(
            annex_node.read_file("master", "changelog.txt").unwrap().unwrap(),
            b"1.0.1 fixes\n"
        );
    }

    #[tokio::test]
    async fn custom_master_edits_are_merged_not_clobbered() {
        let server = site().await;
        let store = Arc::new(MemoryStore::new());
        let annex_node = annexator(&store);
        let ctx = RunContext::default();
        stage_one(&annex_node, changelog(&server), &ctx).await;
        annex_node.commit_pending().await.unwrap();

        // a curator commits on master
        let master = head(&store, "master");
        let mut tree = store.read_tree(&master).unwrap();
        tree.insert("NOTES.md".into(), store.write_blob(b"curated\n").unwrap());
        let custom = store.commit("master", &tree, &[master], "curate").unwrap();

        stage_one(&annex_node, archive(&server), &ctx).await;
        let done = annex_node.commit_pending().await.unwrap().unwrap();

        assert!(!done.fast_forward);
        assert_eq!(
            store.commit_parents(&done.master).unwrap(),
            vec![custom, done.processed.clone()]
        );
        let merged = store.read_tree(&done.master).unwrap();
        assert!(merged.contains_key("NOTES.md"));
        assert!(merged.contains_key("changelog.txt"));
        assert!(merged.contains_key("releases/1.0.0/ds666_R1.0.0.tar.gz"));
        // the processed branch never sees the curator's file
        assert!(!store.read_tree(&done.processed).unwrap().contains_key("NOTES.md"));
    }

    #[tokio::test]
    async fn finalize_node_passes_records_through() {
        let server = site().await;
        let store = Arc::new(MemoryStore::new());
        let annex_node = annexator(&store);

        let pipeline = Pipeline::builder()
            .node_arc(annex_node.clone())
            .node(annex_node.finalize())
            .build();
        let report = harvester_pipeline::Runner::default()
            .run_with_seed(&pipeline, changelog(&server))
            .await
            .unwrap();

        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].get_str("filepath"), Some("changelog.txt"));
        assert!(store.branch_head("incoming").unwrap().is_some());
    }

    /// Emits one record per file served under `/files/`.
    struct Files {
        base: String,
        count: usize,
    }

    #[async_trait]
    impl Node for Files {
        fn name(&self) -> &str {
            "files"
        }

        async fn call(&self, _record: &Record, _ctx: &RunContext) -> Result<NodeOutput> {
            Ok(NodeOutput::Emit(
                (0..self.count)
                    .map(|i| {
                        Record::new()
                            .with("url", format!("{}/files/f{i}.txt", self.base))
                            .with("filename", format!("f{i}.txt"))
                    })
                    .collect(),
            ))
        }
    }

    #[tokio::test]
    async fn interrupted_run_still_commits_everything_staged() {
        let server = wiremock::MockServer::start().await;
        for i in 0..3 {
            serve(&server, &format!("/files/f{i}.txt"), format!("file {i}\n").into_bytes()).await;
        }
        let store = Arc::new(MemoryStore::new());
        let annex_node = annexator(&store);

        let pipeline = Pipeline::builder()
            .node(Files {
                base: server.uri(),
                count: 3,
            })
            .branch(Pipeline::builder().node_arc(annex_node.clone()).build())
            .node(harvester_pipeline::nodes::InterruptIf::after(2))
            .node(annex_node.finalize())
            .build();
        let report = harvester_pipeline::Runner::default()
            .run(&pipeline)
            .await
            .unwrap();

        assert!(report.finished_early);
        assert_eq!(report.stats.materialized, 3);
        let master = store.read_tree(&head(&store, "master")).unwrap();
        for name in ["f0.txt", "f1.txt", "f2.txt"] {
            assert!(master.contains_key(name), "{name} missing from master");
        }
        assert_eq!(head(&store, "master"), head(&store, "incoming-processed"));
        assert_eq!(annex_node.commit_pending().await.unwrap(), None);
    }

    #[tokio::test]
    async fn archives_are_extracted_on_the_processed_branch() {
        let server = wiremock::MockServer::start().await;
        let release = tarball(&[
            ("ds666/sub-1/anat/sub-1_T1w.dat", "mighty load 1.0.0"),
            ("ds666/README", "about ds666"),
        ]);
        serve(&server, "/ds666/ds666_R1.0.0.tar.gz", release.clone()).await;
        let store = Arc::new(MemoryStore::new());
        let annex_node = annexator(&store);
        let ctx = RunContext::default();

        stage_one(&annex_node, archive(&server), &ctx).await;
        let done = annex_node.commit_pending().await.unwrap().unwrap();

        let incoming = store.read_tree(&done.incoming).unwrap();
        assert!(incoming.contains_key("releases/1.0.0/ds666_R1.0.0.tar.gz"));
        assert!(!incoming.contains_key("releases/1.0.0/sub-1/anat/sub-1_T1w.dat"));
        assert_eq!(
            annex_node
                .read_file("incoming", "releases/1.0.0/ds666_R1.0.0.tar.gz")
                .unwrap()
                .unwrap(),
            release
        );

        for branch in ["incoming-processed", "master"] {
            let (_, tree) = branch_tree(store.as_ref(), branch).unwrap().unwrap();
            assert!(tree.contains_key("releases/1.0.0/sub-1/anat/sub-1_T1w.dat"), "{branch}");
            assert!(tree.contains_key("releases/1.0.0/README"), "{branch}");
            assert!(!tree.contains_key("releases/1.0.0/ds666_R1.0.0.tar.gz"), "{branch}");
        }
        assert_eq!(
            annex_node
                .read_file("master", "releases/1.0.0/sub-1/anat/sub-1_T1w.dat")
                .unwrap()
                .unwrap(),
            b"mighty load 1.0.0"
        );
        // README stays in git, the data member is annexed and logged
        let master = store.read_tree(&done.master).unwrap();
        let readme = store.read_blob(&master["releases/1.0.0/README"]).unwrap();
        assert_eq!(readme, b"about ds666");
        let pointer = store
            .read_blob(&master["releases/1.0.0/sub-1/anat/sub-1_T1w.dat"])
            .unwrap();
        let key = AnnexKey::from_pointer(&pointer).unwrap();
        assert!(annex_node.read_file(ANNEX_BRANCH, &key.location_log()).unwrap().is_some());
    }

    #[tokio::test]
    async fn unreadable_archives_are_kept_as_is() {
        let server = site().await;
        let store = Arc::new(MemoryStore::new());
        let annex_node = annexator(&store);
        stage_one(&annex_node, archive(&server), &RunContext::default()).await;
        let done = annex_node.commit_pending().await.unwrap().unwrap();

        let master = store.read_tree(&done.master).unwrap();
        assert!(master.contains_key("releases/1.0.0/ds666_R1.0.0.tar.gz"));
    }

    #[tokio::test]
    async fn records_without_url_are_rejected() {
        let store = Arc::new(MemoryStore::new());
        let annex_node = annexator(&store);
        let err = annex_node
            .call(&Record::new().with("filename", "x"), &RunContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HarvesterError::Validation { .. }));
    }

    #[test]
    fn target_paths_stay_inside_the_dataset() {
        assert_eq!(repo_path(None, "a.txt").unwrap(), "a.txt");
        assert_eq!(repo_path(Some("releases/1.0/"), "a.tgz").unwrap(), "releases/1.0/a.tgz");
        assert_eq!(repo_path(Some("./x//y"), "z").unwrap(), "x/y/z");
        assert!(repo_path(Some("/etc"), "passwd").is_err());
        assert!(repo_path(Some("a/../.."), "b").is_err());
        assert!(repo_path(None, "../b").is_err());
        assert!(repo_path(Some(".git"), "config").is_err());
    }

    #[test]
    fn initiate_records_the_template() {
        let store = Arc::new(MemoryStore::new());
        let annex_node = annexator(&store);
        assert_eq!(annex_node.dataset_init().unwrap(), None);

        let init = DatasetInit {
            template: "openfmri".into(),
            args: [("dataset".to_string(), "ds000001".to_string())]
                .into_iter()
                .collect(),
        };
        let commit = annex_node.initiate(&init).unwrap();
        assert_eq!(annex_node.dataset_init().unwrap(), Some(init.clone()));
        // identical config is not committed twice
        assert_eq!(annex_node.initiate(&init).unwrap(), commit);
    }

    #[tokio::test]
    async fn git_backed_dataset_end_to_end() {
        if !GitStore::git_available() {
            return;
        }
        let server = site().await;
        let path = std::env::temp_dir().join(format!("hv-annex-test-{}", Uuid::now_v7()));
        let options = AnnexOptions::default()
            .create(true)
            .largefiles("exclude=*.txt");
        let annex_node = Arc::new(Annexator::open(&path, options, fetcher()).unwrap());

        let ctx = RunContext::default();
        stage_one(&annex_node, changelog(&server), &ctx).await;
        stage_one(&annex_node, archive(&server), &ctx).await;
        let done = annex_node.commit_pending().await.unwrap().unwrap();
        assert!(done.fast_forward);

        assert_eq!(std::fs::read_to_string(path.join("changelog.txt")).unwrap(), CHANGELOG);
        assert_eq!(
            std::fs::read(path.join("releases/1.0.0/ds666_R1.0.0.tar.gz")).unwrap(),
            ARCHIVE
        );
        let store = annex_node.store();
        assert_eq!(
            store.branch_head("master").unwrap(),
            store.branch_head("incoming-processed").unwrap()
        );

        // reopening without create works once the dataset exists
        let reopened = Annexator::open(&path, AnnexOptions::default(), fetcher()).unwrap();
        assert_eq!(reopened.uuid(), annex_node.uuid());

        let _ = std::fs::remove_dir_all(&path);
    }
}
