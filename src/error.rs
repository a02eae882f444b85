use std::path::PathBuf;

use thiserror::Error;

use crate::fetch::FetchError;
use crate::repo::VcsFamily;
use crate::store::StoreError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without operator or configuration changes.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Malformed identifier.
#[derive(Error, Debug)]
#[error("invalid {kind} identifier {raw:?}: {reason}")]
pub struct InvalidId {
    pub kind: &'static str,
    pub raw: String,
    pub reason: &'static str,
}

/// Errors surfaced by the synchronization engine entry points.
///
/// The variants are the cluster failure taxonomy, not a grab bag: callers
/// branch on them to decide between retrying, fixing configuration, and
/// paging an operator.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EngineError {
    /// Lock wait exceeded or other transient contention. Retry the whole
    /// entry point.
    #[error("{0}")]
    Transient(String),

    /// A previous write was interrupted, or a completed write could not
    /// clear its durable marker. Writes stay blocked until an operator
    /// clears the marker row.
    #[error("repository \"{display}\" is frozen: {reason}")]
    Frozen { display: String, reason: String },

    /// Cluster configuration prevents synchronization from proceeding.
    #[error("cluster configuration error: {0}")]
    Config(String),

    /// No active, fetchable device holds the required version.
    #[error("unable to synchronize: {0}")]
    LeaderLost(String),

    /// The local working copy has not been materialized yet.
    #[error(
        "working copy {path:?} does not exist on this device; \
         materialize the working copy before synchronizing"
    )]
    NotInitialized { path: PathBuf },

    /// A non-Git repository reached a Git-only code path.
    #[error("repository family {family} is not supported by cluster synchronization")]
    Unsupported { family: VcsFamily },

    /// Engine invariant violated by the caller.
    #[error("engine invariant violated: {0}")]
    Programmer(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl EngineError {
    /// Whether retrying the entry point may succeed.
    pub fn transience(&self) -> Transience {
        match self {
            EngineError::Transient(_) | EngineError::LeaderLost(_) => Transience::Retryable,

            EngineError::Frozen { .. }
            | EngineError::Config(_)
            | EngineError::NotInitialized { .. }
            | EngineError::Unsupported { .. }
            | EngineError::Programmer(_) => Transience::Permanent,

            EngineError::Store(e) => e.transience(),
            EngineError::Fetch(e) => e.transience(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_transience() {
        assert!(
            EngineError::Transient("lock".into())
                .transience()
                .is_retryable()
        );
        assert!(
            EngineError::LeaderLost("no peers".into())
                .transience()
                .is_retryable()
        );
        assert_eq!(
            EngineError::Config("no service".into()).transience(),
            Transience::Permanent
        );
        assert_eq!(
            EngineError::Frozen {
                display: "r".into(),
                reason: "interrupted".into()
            }
            .transience(),
            Transience::Permanent
        );
    }

    #[test]
    fn frozen_message_names_repository() {
        let err = EngineError::Frozen {
            display: "Main Sources".into(),
            reason: "previous write interrupted".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Main Sources"));
        assert!(msg.contains("frozen"));
    }
}
