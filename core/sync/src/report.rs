//! Results of sync passes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use harborsync_common::Collection;

/// What a sync pass covered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "collection", rename_all = "kebab-case")]
pub enum SyncScope {
    /// Every configured collection.
    All,
    /// A single collection.
    Collection(Collection),
    /// Queue drain only, no pull.
    Pending,
}

impl fmt::Display for SyncScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncScope::All => f.write_str("all"),
            SyncScope::Collection(c) => write!(f, "{}", c),
            SyncScope::Pending => f.write_str("pending"),
        }
    }
}

/// Outcome of a pass over one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionResult {
    pub collection: Collection,
    /// No pass error and no request failed.
    pub success: bool,
    /// Requests acknowledged by the backend.
    pub processed: usize,
    /// Conflicts detected.
    pub conflicts: usize,
    /// Requests that gave up in this pass.
    pub failed: usize,
    /// Local records refreshed or removed by the pull.
    pub pulled: usize,
    /// Why the pass stopped early, if it did.
    pub error: Option<String>,
}

impl CollectionResult {
    pub fn new(collection: Collection) -> Self {
        Self {
            collection,
            success: true,
            processed: 0,
            conflicts: 0,
            failed: 0,
            pulled: 0,
            error: None,
        }
    }

    /// Settle the success flag once the pass is over.
    pub(crate) fn finish(&mut self) {
        self.success = self.error.is_none() && self.failed == 0;
    }
}

/// Overall verdict of a multi-collection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncOutcome {
    AllSucceeded,
    PartialSuccess,
    AllFailed,
}

/// Per-collection results of a pass, keyed by collection name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAllReport {
    pub results: BTreeMap<Collection, CollectionResult>,
    pub outcome: SyncOutcome,
    pub duration: Duration,
    /// When the earliest backed-off request becomes eligible again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry: Option<DateTime<Utc>>,
}

impl SyncAllReport {
    pub fn new(results: BTreeMap<Collection, CollectionResult>, duration: Duration) -> Self {
        let outcome = Self::outcome_of(&results);
        Self {
            results,
            outcome,
            duration,
            next_retry: None,
        }
    }

    pub fn with_next_retry(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_retry = at;
        self
    }

    fn outcome_of(results: &BTreeMap<Collection, CollectionResult>) -> SyncOutcome {
        let succeeded = results.values().filter(|r| r.success).count();
        if succeeded == results.len() {
            SyncOutcome::AllSucceeded
        } else if succeeded == 0 {
            SyncOutcome::AllFailed
        } else {
            SyncOutcome::PartialSuccess
        }
    }

    pub fn processed(&self) -> usize {
        self.results.values().map(|r| r.processed).sum()
    }

    pub fn conflicts(&self) -> usize {
        self.results.values().map(|r| r.conflicts).sum()
    }

    pub fn failed(&self) -> usize {
        self.results.values().map(|r| r.failed).sum()
    }

    /// First pass error, if any collection stopped early.
    pub fn first_error(&self) -> Option<&str> {
        self.results.values().find_map(|r| r.error.as_deref())
    }
}
