//! Fetch driver: pulls the local working copy forward from a cluster leader.
//!
//! The wire-level pull is delegated to a [`FetchExecutor`]; this module owns
//! transport filtering, leader failover, and the working-copy preconditions.

use std::path::PathBuf;

use thiserror::Error;

use crate::cluster::Binding;
use crate::error::{EngineError, Transience};
use crate::identity::DeviceId;
use crate::log::EngineLog;
use crate::repo::RepositoryInfo;

/// Refspec used for intracluster pulls: mirror every ref, with prunes.
pub const FETCH_REFSPEC: &str = "+refs/*:refs/*";

/// One wire-level pull to execute.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Working copy directory the fetch runs in.
    pub work_dir: PathBuf,
    /// Source URI on the leader device.
    pub uri: String,
    pub refspec: String,
    pub prune: bool,
    /// Device identity to authenticate as.
    pub device: DeviceId,
}

/// Executes a single pull. Implementations run in the working-copy
/// directory, authenticate as the device, and run privileged-to-daemon.
pub trait FetchExecutor: Send + Sync {
    fn fetch(&self, request: &FetchRequest) -> Result<(), FetchError>;
}

/// Wire-level fetch failure.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FetchError {
    #[error("failed to open working copy {path:?}: {reason}")]
    OpenWorkingCopy { path: PathBuf, reason: String },

    #[error("fetch from {uri} failed: {reason}")]
    Wire { uri: String, reason: String },
}

impl FetchError {
    pub fn transience(&self) -> Transience {
        // Peer outages and network failures dominate both shapes; a retry
        // against the same or another leader may succeed.
        Transience::Retryable
    }
}

/// Per-operation fetch driver.
pub struct FetchDriver<'a> {
    pub repo: &'a RepositoryInfo,
    pub device: &'a DeviceId,
    pub executor: &'a dyn FetchExecutor,
    pub log: &'a EngineLog,
}

impl FetchDriver<'_> {
    /// Pull from one of the given leader bindings, trying each fetchable
    /// leader in order until one succeeds.
    pub fn fetch_from(&self, leaders: &[Binding]) -> Result<(), EngineError> {
        let fetchable: Vec<&Binding> = leaders
            .iter()
            .filter(|binding| binding.protocol.is_ssh_family())
            .collect();

        if fetchable.is_empty() {
            return Err(EngineError::LeaderLost(format!(
                "repository \"{}\" has no up-to-date fetchable nodes: \
                 no active cluster leader is reachable over a fetchable protocol",
                self.repo.display_name
            )));
        }

        let mut last_err = None;
        for binding in fetchable {
            self.log.say(&format!(
                "Fetching from cluster device \"{}\"...",
                binding.device
            ));
            match self.fetch_one(binding) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        device = %binding.device,
                        "fetch from cluster leader failed: {err}"
                    );
                    self.log.say(&format!(
                        "Fetch from device \"{}\" failed: {err}",
                        binding.device
                    ));
                    last_err = Some(err);
                }
            }
        }

        // All fetchable leaders failed; surface the last failure.
        Err(last_err.expect("at least one fetch was attempted"))
    }

    fn fetch_one(&self, binding: &Binding) -> Result<(), EngineError> {
        if !self.repo.family.is_git() {
            return Err(EngineError::Unsupported {
                family: self.repo.family,
            });
        }

        if !self.repo.work_dir.is_dir() {
            return Err(EngineError::NotInitialized {
                path: self.repo.work_dir.clone(),
            });
        }

        let request = FetchRequest {
            work_dir: self.repo.work_dir.clone(),
            uri: binding.fetch_uri(&self.repo.remote_path),
            refspec: FETCH_REFSPEC.to_string(),
            prune: true,
            device: self.device.clone(),
        };

        self.executor.fetch(&request)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Protocol;
    use crate::identity::RepositoryId;
    use crate::repo::VcsFamily;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedExecutor {
        requests: Mutex<Vec<FetchRequest>>,
        /// Hosts that fail when fetched from.
        failing_hosts: Vec<String>,
    }

    impl FetchExecutor for ScriptedExecutor {
        fn fetch(&self, request: &FetchRequest) -> Result<(), FetchError> {
            self.requests.lock().unwrap().push(request.clone());
            if self.failing_hosts.iter().any(|h| request.uri.contains(h)) {
                return Err(FetchError::Wire {
                    uri: request.uri.clone(),
                    reason: "connection refused".into(),
                });
            }
            Ok(())
        }
    }

    fn repo(work_dir: PathBuf, family: VcsFamily) -> RepositoryInfo {
        RepositoryInfo {
            id: RepositoryId::new("R1").unwrap(),
            display_name: "Main".into(),
            work_dir,
            remote_path: "diffusion/R1".into(),
            family,
            hosted: true,
            cluster_service: None,
        }
    }

    fn binding(device: &str, protocol: Protocol, host: &str) -> Binding {
        Binding {
            device: DeviceId::new(device).unwrap(),
            protocol,
            host: host.into(),
        }
    }

    #[test]
    fn http_only_leaders_are_not_fetchable() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(dir.path().to_path_buf(), VcsFamily::Git);
        let device = DeviceId::new("repo001").unwrap();
        let executor = ScriptedExecutor::default();
        let log = EngineLog::disabled();
        let driver = FetchDriver {
            repo: &repo,
            device: &device,
            executor: &executor,
            log: &log,
        };

        let err = driver
            .fetch_from(&[binding("repo002", Protocol::Http, "b.example")])
            .unwrap_err();
        assert!(matches!(err, EngineError::LeaderLost(_)));
        assert!(executor.requests.lock().unwrap().is_empty());
    }

    #[test]
    fn fails_over_to_next_leader() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(dir.path().to_path_buf(), VcsFamily::Git);
        let device = DeviceId::new("repo001").unwrap();
        let executor = ScriptedExecutor {
            failing_hosts: vec!["b.example".into()],
            ..ScriptedExecutor::default()
        };
        let log = EngineLog::disabled();
        let driver = FetchDriver {
            repo: &repo,
            device: &device,
            executor: &executor,
            log: &log,
        };

        driver
            .fetch_from(&[
                binding("repo002", Protocol::Ssh, "b.example"),
                binding("repo003", Protocol::Ssh, "c.example"),
            ])
            .unwrap();

        let requests = executor.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].uri, "ssh://b.example/diffusion/R1");
        assert_eq!(requests[1].uri, "ssh://c.example/diffusion/R1");
        assert_eq!(requests[1].refspec, FETCH_REFSPEC);
        assert!(requests[1].prune);
    }

    #[test]
    fn missing_working_copy_is_actionable() {
        let repo = repo(PathBuf::from("/nonexistent/work/copy"), VcsFamily::Git);
        let device = DeviceId::new("repo001").unwrap();
        let executor = ScriptedExecutor::default();
        let log = EngineLog::disabled();
        let driver = FetchDriver {
            repo: &repo,
            device: &device,
            executor: &executor,
            log: &log,
        };

        let err = driver
            .fetch_from(&[binding("repo002", Protocol::Ssh, "b.example")])
            .unwrap_err();
        assert!(matches!(err, EngineError::NotInitialized { .. }));
    }

    #[test]
    fn non_git_family_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(dir.path().to_path_buf(), VcsFamily::Mercurial);
        let device = DeviceId::new("repo001").unwrap();
        let executor = ScriptedExecutor::default();
        let log = EngineLog::disabled();
        let driver = FetchDriver {
            repo: &repo,
            device: &device,
            executor: &executor,
            log: &log,
        };

        let err = driver
            .fetch_from(&[binding("repo002", Protocol::Ssh, "b.example")])
            .unwrap_err();
        assert!(matches!(err, EngineError::Unsupported { .. }));
    }
}
