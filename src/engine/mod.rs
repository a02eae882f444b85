//! Engine facade: the four lifecycle entry points and per-operation state.
//!
//! One `ClusterEngine` value drives one repository operation. Concurrency is
//! inter-process, mediated entirely by the version store's advisory locks
//! and rows; nothing here spawns threads.

mod read;
mod write;

use std::sync::Arc;
use std::time::Duration;

use crate::cluster::{Binding, ClusterDirectory, DirectoryError};
use crate::clock::TimeSource;
use crate::config::SyncTimeouts;
use crate::error::EngineError;
use crate::events::PushEventLog;
use crate::fetch::FetchExecutor;
use crate::identity::{DeviceId, UserId};
use crate::log::{EngineLog, LogWriter};
use crate::repo::RepositoryInfo;
use crate::store::{LockName, OwnerToken, StoreConnection, VersionStore};

/// Shared services an engine operates against. Cheap to clone; one context
/// typically serves every repository a process touches.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn VersionStore>,
    pub directory: Arc<dyn ClusterDirectory>,
    pub fetcher: Arc<dyn FetchExecutor>,
    pub events: Arc<dyn PushEventLog>,
    pub clock: Arc<dyn TimeSource>,
    /// Which device this process runs on, when known.
    pub local_device: Option<DeviceId>,
    pub timeouts: SyncTimeouts,
}

/// Held write-lock state between `before_write` and `after_write`.
///
/// The connection pins the advisory write lock; dropping the ticket drops
/// the connection and with it the lock.
struct WriteTicket {
    conn: Box<dyn StoreConnection>,
    /// Cluster maximum version observed under the write lock.
    version: i64,
    owner: OwnerToken,
}

/// Per-repository cluster synchronization engine.
pub struct ClusterEngine {
    context: EngineContext,
    repo: RepositoryInfo,
    acting_user: Option<UserId>,
    log: EngineLog,
    write: Option<WriteTicket>,
}

impl ClusterEngine {
    pub fn new(context: EngineContext, repo: RepositoryInfo) -> Self {
        Self {
            context,
            repo,
            acting_user: None,
            log: EngineLog::disabled(),
            write: None,
        }
    }

    /// Route sync progress lines to a writer (usually the wire protocol of
    /// the in-flight request).
    pub fn set_sync_log(&mut self, writer: Arc<dyn LogWriter>) {
        self.log = EngineLog::new(writer);
    }

    /// Record the user the current operation acts on behalf of; stored in
    /// the write properties for operator forensics.
    pub fn set_acting_user(&mut self, user: Option<UserId>) {
        self.acting_user = user;
    }

    pub fn repository(&self) -> &RepositoryInfo {
        &self.repo
    }

    /// Whether this engine currently holds the cluster write lock.
    pub fn holds_write_lock(&self) -> bool {
        self.write.is_some()
    }

    /// Synchronization runs only for hosted Git repositories bound to a
    /// cluster service, on a process that knows its device identity.
    /// Read-only and idempotent.
    pub fn enabled(&self) -> bool {
        self.repo.cluster_service.is_some()
            && self.repo.family.is_git()
            && self.repo.hosted
            && self.context.local_device.is_some()
    }

    /// Initialize a version 0 row for every active binding, so later reads
    /// can unambiguously pick leaders.
    pub fn after_creation(&self) -> Result<(), EngineError> {
        if !self.enabled() {
            return Ok(());
        }
        let bindings = self.active_bindings()?;
        for binding in &bindings {
            self.context
                .store
                .update_version(&self.repo.id, &binding.device, 0)?;
        }
        Ok(())
    }

    /// Bring this device's working copy up to the freshest known version.
    ///
    /// Returns the version the local working copy now represents, or `None`
    /// when synchronization is disabled for this repository.
    pub fn before_read(&self) -> Result<Option<i64>, EngineError> {
        if !self.enabled() {
            return Ok(None);
        }
        self.synchronize_before_read().map(Some)
    }

    /// Acquire the cluster write lock, verify no prior write was
    /// interrupted, catch this device up, and persist the durable write
    /// marker.
    pub fn before_write(&mut self) -> Result<(), EngineError> {
        if !self.enabled() {
            return Ok(());
        }
        self.synchronize_before_write()
    }

    /// Clear the durable marker with the post-write version and release the
    /// cluster write lock.
    pub fn after_write(&mut self) -> Result<(), EngineError> {
        if !self.enabled() {
            return Ok(());
        }
        self.synchronize_after_write()
    }

    fn this_device(&self) -> Result<DeviceId, EngineError> {
        self.context
            .local_device
            .clone()
            .ok_or(EngineError::Programmer(
                "synchronization requires a device identity",
            ))
    }

    fn active_bindings(&self) -> Result<Vec<Binding>, EngineError> {
        let service = self.repo.service().map_err(EngineError::Config)?;
        self.context
            .directory
            .active_bindings(service)
            .map_err(|err| match err {
                e @ DirectoryError::ServiceNotFound { .. } => EngineError::Config(e.to_string()),
                e @ DirectoryError::Lookup { .. } => EngineError::Transient(e.to_string()),
            })
    }

    /// Acquire a named advisory lock with a bounded wait, narrating the
    /// wait to the sync log.
    fn acquire_lock(
        &self,
        conn: &mut dyn StoreConnection,
        name: &LockName,
        wait: Duration,
        what: &str,
    ) -> Result<(), EngineError> {
        self.log.say(&format!(
            "Waiting up to {} second(s) for cluster {what} lock \"{name}\"...",
            wait.as_secs()
        ));

        let started_ms = self.context.clock.now_ms();
        let acquired = conn.acquire(name, wait)?;
        if !acquired {
            return Err(EngineError::Transient(format!(
                "failed to acquire cluster {what} lock \"{name}\" after waiting {} second(s); \
                 another process may be holding it",
                wait.as_secs()
            )));
        }

        let elapsed_ms = self.context.clock.now_ms().saturating_sub(started_ms);
        self.log.say(&format!(
            "Acquired {what} lock after {} second(s).",
            elapsed_ms / 1_000
        ));
        Ok(())
    }

    fn frozen(&self, reason: String) -> EngineError {
        EngineError::Frozen {
            display: self.repo.display_name.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{RepositoryId, ServiceId};
    use crate::repo::VcsFamily;
    use crate::store::memory::MemoryVersionStore;
    use std::path::PathBuf;

    struct EmptyDirectory;
    impl ClusterDirectory for EmptyDirectory {
        fn active_bindings(
            &self,
            _service: &crate::identity::ServiceId,
        ) -> Result<Vec<Binding>, DirectoryError> {
            Ok(Vec::new())
        }
    }

    struct NoFetch;
    impl FetchExecutor for NoFetch {
        fn fetch(&self, _request: &crate::fetch::FetchRequest) -> Result<(), crate::fetch::FetchError> {
            Ok(())
        }
    }

    struct NoEvents;
    impl PushEventLog for NoEvents {
        fn most_recent_event_id(
            &self,
            _repo: &RepositoryId,
        ) -> Result<Option<i64>, crate::store::StoreError> {
            Ok(None)
        }
    }

    fn context(device: Option<&str>) -> EngineContext {
        EngineContext {
            store: Arc::new(MemoryVersionStore::new()),
            directory: Arc::new(EmptyDirectory),
            fetcher: Arc::new(NoFetch),
            events: Arc::new(NoEvents),
            clock: Arc::new(crate::clock::SystemClock),
            local_device: device.map(|d| DeviceId::new(d).unwrap()),
            timeouts: SyncTimeouts::default(),
        }
    }

    fn repo(
        family: VcsFamily,
        hosted: bool,
        service: Option<&str>,
    ) -> RepositoryInfo {
        RepositoryInfo {
            id: RepositoryId::new("R1").unwrap(),
            display_name: "Main".into(),
            work_dir: PathBuf::from("/var/repo/main"),
            remote_path: "diffusion/R1".into(),
            family,
            hosted,
            cluster_service: service.map(|s| ServiceId::new(s).unwrap()),
        }
    }

    #[test]
    fn enablement_requires_all_four_conditions() {
        let enabled = ClusterEngine::new(
            context(Some("repo001")),
            repo(VcsFamily::Git, true, Some("svc")),
        );
        assert!(enabled.enabled());

        let no_service =
            ClusterEngine::new(context(Some("repo001")), repo(VcsFamily::Git, true, None));
        assert!(!no_service.enabled());

        let not_git = ClusterEngine::new(
            context(Some("repo001")),
            repo(VcsFamily::Mercurial, true, Some("svc")),
        );
        assert!(!not_git.enabled());

        let observed = ClusterEngine::new(
            context(Some("repo001")),
            repo(VcsFamily::Git, false, Some("svc")),
        );
        assert!(!observed.enabled());

        let no_device =
            ClusterEngine::new(context(None), repo(VcsFamily::Git, true, Some("svc")));
        assert!(!no_device.enabled());
    }

    #[test]
    fn disabled_entry_points_are_no_ops() {
        let mut engine =
            ClusterEngine::new(context(None), repo(VcsFamily::Git, true, Some("svc")));
        engine.after_creation().unwrap();
        assert_eq!(engine.before_read().unwrap(), None);
        engine.before_write().unwrap();
        engine.after_write().unwrap();
        assert!(!engine.holds_write_lock());
    }

    #[test]
    fn after_write_without_lock_is_a_programmer_error() {
        let mut engine = ClusterEngine::new(
            context(Some("repo001")),
            repo(VcsFamily::Git, true, Some("svc")),
        );
        let err = engine.after_write().unwrap_err();
        assert!(matches!(err, EngineError::Programmer(_)));
    }
}
