//! Conflict detection and resolution choices.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use harborsync_common::json::merge_patch;
use harborsync_common::{Method, Revision};
use harborsync_store::{QueuedRequest, StoredRecord, SyncState};

/// What the client knows about its copy of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalVersion {
    /// Server revision the local copy was derived from.
    pub base: Option<Revision>,
    /// Local changes not yet acknowledged by the backend.
    pub dirty: bool,
}

impl LocalVersion {
    pub fn new(base: Option<Revision>, dirty: bool) -> Self {
        Self { base, dirty }
    }

    pub fn of(record: &StoredRecord) -> Self {
        Self {
            base: record.revision,
            dirty: record.sync_state != SyncState::Synced,
        }
    }
}

/// How a local copy relates to the server's current revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionOrdering {
    Equal,
    /// Only the client changed.
    LocalNewer,
    /// Only the server changed.
    RemoteNewer,
    /// Both sides changed since the common base.
    Diverged,
}

/// Compare a local copy with the server's current revision.
///
/// Revisions are only compared for equality: any revision other than the
/// base means the server moved on.
pub fn compare(local: LocalVersion, remote: Option<Revision>) -> VersionOrdering {
    match (local.base == remote, local.dirty) {
        (true, false) => VersionOrdering::Equal,
        (true, true) => VersionOrdering::LocalNewer,
        (false, false) => VersionOrdering::RemoteNewer,
        (false, true) => VersionOrdering::Diverged,
    }
}

/// Whether the server already holds the effect of `request`.
///
/// A request replayed after a crash, or one whose acknowledgment was lost,
/// fails the revision check although the server state is exactly what it
/// asked for. Such a rejection is not a conflict.
pub fn is_replay(request: &QueuedRequest, server: Option<&Value>) -> bool {
    match (request.method, server) {
        (Method::Delete, server) => server.is_none(),
        (_, None) => false,
        (Method::Post | Method::Put, Some(server)) => request.body.as_ref() == Some(server),
        (Method::Patch, Some(server)) => {
            let mut patched = server.clone();
            if let Some(patch) = &request.body {
                merge_patch(&mut patched, patch);
            }
            &patched == server
        }
    }
}

/// User decision for a conflict held by the manual strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "keep", content = "value", rename_all = "kebab-case")]
pub enum Resolution {
    /// Overwrite the server with the local value.
    KeepLocal,
    /// Discard the local change.
    KeepServer,
    /// Overwrite the server with a value combined by the user.
    Merged(Value),
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::KeepLocal => "keep-local",
            Resolution::KeepServer => "keep-server",
            Resolution::Merged(_) => "merged",
        }
    }
}
