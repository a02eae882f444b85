//! Push event log interface.
//!
//! Every push attempt against a hosted repository is recorded with a
//! monotonic identifier, accepted or not. The engine uses the most recent
//! identifier as the post-write version, so the version is a "most recent
//! activity" cursor rather than a count of accepted pushes.

use crate::identity::RepositoryId;
use crate::store::StoreError;

pub trait PushEventLog: Send + Sync {
    /// Identifier of the most recent push event recorded for a repository,
    /// or `None` when the repository has never seen a push.
    fn most_recent_event_id(&self, repo: &RepositoryId) -> Result<Option<i64>, StoreError>;
}
