//! Activity counters shared by every node of a pipeline run.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Named counters tracked by [`ActivityStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// URLs fetched by crawl nodes.
    Urls,
    /// Files written into the repository tree.
    Materialized,
    /// Files stored directly in git.
    AddGit,
    /// Files stored as annexed objects.
    AddAnnex,
    /// Files whose previous content was replaced.
    Overwritten,
    /// Records skipped because nothing changed.
    Skipped,
    /// Records a node gave up on.
    Failed,
}

/// Append-only counters threaded through a run.
///
/// Not owned by any node; everyone holds an `Arc` and increments atomically.
#[derive(Debug, Default)]
pub struct ActivityStats {
    urls: AtomicUsize,
    materialized: AtomicUsize,
    add_git: AtomicUsize,
    add_annex: AtomicUsize,
    overwritten: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    downloaded_bytes: AtomicU64,
}

impl ActivityStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one.
    pub fn bump(&self, counter: Counter) {
        self.slot(counter).fetch_add(1, Ordering::Relaxed);
    }

    /// Account for downloaded payload bytes.
    pub fn add_bytes(&self, n: u64) {
        self.downloaded_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value of a counter.
    pub fn get(&self, counter: Counter) -> usize {
        self.slot(counter).load(Ordering::Relaxed)
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            urls: self.get(Counter::Urls),
            materialized: self.get(Counter::Materialized),
            add_git: self.get(Counter::AddGit),
            add_annex: self.get(Counter::AddAnnex),
            overwritten: self.get(Counter::Overwritten),
            skipped: self.get(Counter::Skipped),
            failed: self.get(Counter::Failed),
            downloaded_bytes: self.downloaded_bytes.load(Ordering::Relaxed),
        }
    }

    fn slot(&self, counter: Counter) -> &AtomicUsize {
        match counter {
            Counter::Urls => &self.urls,
            Counter::Materialized => &self.materialized,
            Counter::AddGit => &self.add_git,
            Counter::AddAnnex => &self.add_annex,
            Counter::Overwritten => &self.overwritten,
            Counter::Skipped => &self.skipped,
            Counter::Failed => &self.failed,
        }
    }
}

/// Serializable view of [`ActivityStats`], read at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub urls: usize,
    pub materialized: usize,
    pub add_git: usize,
    pub add_annex: usize,
    pub overwritten: usize,
    pub skipped: usize,
    pub failed: usize,
    pub downloaded_bytes: u64,
}

impl StatsSnapshot {
    /// Whether any file content changed during the run.
    pub fn changed(&self) -> bool {
        self.materialized > 0
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "URLs processed: {}, files: {} (git: {}, annex: {}, overwritten: {}), skipped: {}, failed: {}, downloaded: {} bytes",
            self.urls,
            self.materialized,
            self.add_git,
            self.add_annex,
            self.overwritten,
            self.skipped,
            self.failed,
            self.downloaded_bytes,
        )
    }
}
