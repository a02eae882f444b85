//! git2-backed fetch executor.

use git2::{AutotagOption, FetchOptions, FetchPrune, RemoteCallbacks, Repository};

use crate::fetch::{FetchError, FetchExecutor, FetchRequest};

/// Executes intracluster pulls with libgit2.
///
/// SSH credentials come from the agent, under the device's user name unless
/// the URI carries one.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitFetcher;

impl FetchExecutor for GitFetcher {
    fn fetch(&self, request: &FetchRequest) -> Result<(), FetchError> {
        let repo =
            Repository::open(&request.work_dir).map_err(|e| FetchError::OpenWorkingCopy {
                path: request.work_dir.clone(),
                reason: e.message().to_string(),
            })?;

        let mut remote =
            repo.remote_anonymous(&request.uri)
                .map_err(|e| FetchError::Wire {
                    uri: request.uri.clone(),
                    reason: e.message().to_string(),
                })?;

        let device = request.device.clone();
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |_url, username_from_url, allowed| {
            if allowed.is_ssh_key() {
                let user = username_from_url.unwrap_or(device.as_str());
                return git2::Cred::ssh_key_from_agent(user);
            }
            git2::Cred::default()
        });

        let mut options = FetchOptions::new();
        options.remote_callbacks(callbacks);
        options.download_tags(AutotagOption::All);
        if request.prune {
            options.prune(FetchPrune::On);
        }

        remote
            .fetch(&[request.refspec.as_str()], Some(&mut options), None)
            .map_err(|e| FetchError::Wire {
                uri: request.uri.clone(),
                reason: e.message().to_string(),
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FETCH_REFSPEC;
    use crate::identity::DeviceId;
    use std::path::PathBuf;
    use std::process::Command;

    fn git(dir: &std::path::Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .expect("run git");
        assert!(status.success(), "git {args:?} failed");
    }

    #[test]
    fn missing_working_copy_reports_open_failure() {
        let request = FetchRequest {
            work_dir: PathBuf::from("/nonexistent/work/copy"),
            uri: "ssh://peer.example/diffusion/R1".into(),
            refspec: FETCH_REFSPEC.into(),
            prune: true,
            device: DeviceId::new("repo001").unwrap(),
        };
        let err = GitFetcher.fetch(&request).unwrap_err();
        assert!(matches!(err, FetchError::OpenWorkingCopy { .. }));
    }

    #[test]
    fn fetches_all_refs_from_local_peer() {
        let peer = tempfile::tempdir().unwrap();
        git(peer.path(), &["init", "--bare", "--initial-branch=main", "."]);

        let seed = tempfile::tempdir().unwrap();
        git(seed.path(), &["init", "--initial-branch=main", "."]);
        git(seed.path(), &["config", "user.email", "t@t"]);
        git(seed.path(), &["config", "user.name", "t"]);
        std::fs::write(seed.path().join("f"), "contents").unwrap();
        git(seed.path(), &["add", "f"]);
        git(seed.path(), &["commit", "-m", "seed"]);
        git(
            seed.path(),
            &[
                "push",
                peer.path().to_str().unwrap(),
                "main:refs/heads/main",
            ],
        );

        let local = tempfile::tempdir().unwrap();
        git(local.path(), &["init", "--bare", "--initial-branch=main", "."]);

        let request = FetchRequest {
            work_dir: local.path().to_path_buf(),
            uri: peer.path().to_str().unwrap().to_string(),
            refspec: FETCH_REFSPEC.into(),
            prune: true,
            device: DeviceId::new("repo001").unwrap(),
        };
        GitFetcher.fetch(&request).unwrap();

        let local_repo = Repository::open(local.path()).unwrap();
        assert!(local_repo.refname_to_id("refs/heads/main").is_ok());
    }
}
