//! Repository metadata consumed by the engine.
//!
//! The metadata store itself lives outside this crate; callers hand the
//! engine a read-only snapshot of the fields that matter for cluster
//! synchronization.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::identity::{RepositoryId, ServiceId};

/// Version control family of a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VcsFamily {
    Git,
    Mercurial,
    Subversion,
}

impl VcsFamily {
    pub fn is_git(self) -> bool {
        matches!(self, VcsFamily::Git)
    }
}

impl fmt::Display for VcsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VcsFamily::Git => "git",
            VcsFamily::Mercurial => "mercurial",
            VcsFamily::Subversion => "subversion",
        };
        write!(f, "{name}")
    }
}

/// Read-only snapshot of one repository's cluster-relevant metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub id: RepositoryId,
    /// Human-readable name, surfaced in operator-facing errors.
    pub display_name: String,
    /// Local working copy directory on this device.
    pub work_dir: PathBuf,
    /// Path component peers serve this repository under; joined onto a
    /// binding's host when building fetch URIs.
    pub remote_path: String,
    pub family: VcsFamily,
    /// Hosted repositories accept writes here; observed repositories are
    /// mirrors of an external master and are never synchronized.
    pub hosted: bool,
    /// Cluster service this repository is bound to, if any.
    pub cluster_service: Option<ServiceId>,
}

impl RepositoryInfo {
    /// The cluster service, or a `Config`-shaped explanation of why
    /// synchronization cannot proceed.
    pub fn service(&self) -> Result<&ServiceId, String> {
        self.cluster_service.as_ref().ok_or_else(|| {
            format!(
                "repository \"{}\" is not bound to a cluster service",
                self.display_name
            )
        })
    }
}
