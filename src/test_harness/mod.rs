//! Deterministic multi-device test harness.
//!
//! Builds engines for several simulated devices over one shared in-memory
//! version store, with a manual clock, a scripted cluster directory, a
//! recording fetch executor, and a capturing sync log. Integration tests in
//! `tests/` drive whole cluster scenarios through this module.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cluster::{Binding, ClusterDirectory, DirectoryError, Protocol};
use crate::clock::TimeSource;
use crate::config::SyncTimeouts;
use crate::engine::{ClusterEngine, EngineContext};
use crate::events::PushEventLog;
use crate::fetch::{FetchError, FetchExecutor, FetchRequest};
use crate::identity::{DeviceId, RepositoryId, ServiceId};
use crate::log::LogWriter;
use crate::repo::{RepositoryInfo, VcsFamily};
use crate::store::StoreError;
use crate::store::VersionStore;
use crate::store::memory::MemoryVersionStore;

/// Manual clock. `sleep` advances time instantly and fires any scheduled
/// actions that come due, so wall-clock retry budgets run in microseconds.
pub struct TestClock {
    now: Arc<AtomicU64>,
    scheduled: Mutex<Vec<(u64, Box<dyn FnOnce() + Send>)>>,
}

impl TestClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
            scheduled: Mutex::new(Vec::new()),
        }
    }

    pub fn advance_ms(&self, delta_ms: u64) {
        let now = self.now.fetch_add(delta_ms, Ordering::SeqCst) + delta_ms;
        self.run_due(now);
    }

    /// Run `action` once the clock reaches `at_ms`. Used to model events
    /// like "the database comes back five seconds into the outage".
    pub fn schedule_at(&self, at_ms: u64, action: impl FnOnce() + Send + 'static) {
        self.scheduled.lock().unwrap().push((at_ms, Box::new(action)));
    }

    fn run_due(&self, now: u64) {
        let due: Vec<Box<dyn FnOnce() + Send>> = {
            let mut scheduled = self.scheduled.lock().unwrap();
            let mut due = Vec::new();
            scheduled.retain_mut(|(at, action)| {
                if *at <= now {
                    // Replace with a no-op so the real action can move out.
                    let action = std::mem::replace(action, Box::new(|| {}));
                    due.push(action);
                    false
                } else {
                    true
                }
            });
            due
        };
        for action in due {
            action();
        }
    }
}

impl TimeSource for TestClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) {
        self.advance_ms(duration.as_millis() as u64);
    }
}

/// Cluster directory backed by a mutable binding list.
#[derive(Default)]
pub struct StaticDirectory {
    bindings: Mutex<Vec<Binding>>,
}

impl StaticDirectory {
    pub fn set_bindings(&self, bindings: Vec<Binding>) {
        *self.bindings.lock().unwrap() = bindings;
    }
}

impl ClusterDirectory for StaticDirectory {
    fn active_bindings(&self, _service: &ServiceId) -> Result<Vec<Binding>, DirectoryError> {
        Ok(self.bindings.lock().unwrap().clone())
    }
}

/// Fetch executor that records every request instead of touching the wire.
#[derive(Default)]
pub struct RecordingFetch {
    requests: Mutex<Vec<FetchRequest>>,
    failing_hosts: Mutex<Vec<String>>,
}

impl RecordingFetch {
    pub fn fail_host(&self, host: &str) {
        self.failing_hosts.lock().unwrap().push(host.to_string());
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl FetchExecutor for RecordingFetch {
    fn fetch(&self, request: &FetchRequest) -> Result<(), FetchError> {
        self.requests.lock().unwrap().push(request.clone());
        let failing = self.failing_hosts.lock().unwrap();
        if failing.iter().any(|host| request.uri.contains(host)) {
            return Err(FetchError::Wire {
                uri: request.uri.clone(),
                reason: "simulated peer outage".into(),
            });
        }
        Ok(())
    }
}

/// Push event log returning a scripted most-recent identifier.
#[derive(Default)]
pub struct ScriptedEvents {
    latest: Mutex<BTreeMap<RepositoryId, i64>>,
}

impl ScriptedEvents {
    pub fn record_push(&self, repo: &RepositoryId, event_id: i64) {
        self.latest.lock().unwrap().insert(repo.clone(), event_id);
    }
}

impl PushEventLog for ScriptedEvents {
    fn most_recent_event_id(&self, repo: &RepositoryId) -> Result<Option<i64>, StoreError> {
        Ok(self.latest.lock().unwrap().get(repo).copied())
    }
}

/// Sync log capturing emitted lines.
#[derive(Default)]
pub struct CollectingLog {
    lines: Mutex<Vec<String>>,
}

impl CollectingLog {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl LogWriter for CollectingLog {
    fn write_log(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}

/// One simulated cluster: a shared store plus scripted collaborators.
pub struct TestCluster {
    pub store: MemoryVersionStore,
    pub directory: Arc<StaticDirectory>,
    pub fetcher: Arc<RecordingFetch>,
    pub events: Arc<ScriptedEvents>,
    pub clock: Arc<TestClock>,
    pub repo_id: RepositoryId,
    pub service: ServiceId,
    /// Lock waits are zero by default: uncontended locks still acquire, and
    /// contended ones time out immediately instead of stalling the test.
    pub timeouts: SyncTimeouts,
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            store: MemoryVersionStore::new(),
            directory: Arc::new(StaticDirectory::default()),
            fetcher: Arc::new(RecordingFetch::default()),
            events: Arc::new(ScriptedEvents::default()),
            clock: Arc::new(TestClock::new(1_700_000_000_000)),
            repo_id: RepositoryId::new("R1").expect("valid repository id"),
            service: ServiceId::new("svc-main").expect("valid service id"),
            timeouts: SyncTimeouts {
                read_lock_wait_secs: 0,
                write_lock_wait_secs: 0,
                ..SyncTimeouts::default()
            },
        }
    }

    pub fn device(name: &str) -> DeviceId {
        DeviceId::new(name).expect("valid device id")
    }

    /// Declare the active bindings, all SSH unless marked otherwise.
    pub fn bind(&self, devices: &[(&str, Protocol)]) {
        let bindings = devices
            .iter()
            .map(|(name, protocol)| Binding {
                device: Self::device(name),
                protocol: *protocol,
                host: format!("{name}.example.net"),
            })
            .collect();
        self.directory.set_bindings(bindings);
    }

    pub fn bind_ssh(&self, devices: &[&str]) {
        let pairs: Vec<(&str, Protocol)> =
            devices.iter().map(|name| (*name, Protocol::Ssh)).collect();
        self.bind(&pairs);
    }

    /// Seed a version row directly.
    pub fn seed_version(&self, device: &str, version: i64) {
        self.store
            .update_version(&self.repo_id, &Self::device(device), version)
            .expect("store is online");
    }

    pub fn version_of(&self, device: &str) -> Option<i64> {
        self.store
            .load_versions(&self.repo_id)
            .expect("store is online")
            .get(&Self::device(device))
            .map(|row| row.version)
    }

    pub fn repo_for(&self, work_dir: &Path) -> RepositoryInfo {
        RepositoryInfo {
            id: self.repo_id.clone(),
            display_name: "Main Sources".into(),
            work_dir: work_dir.to_path_buf(),
            remote_path: format!("diffusion/{}", self.repo_id),
            family: VcsFamily::Git,
            hosted: true,
            cluster_service: Some(self.service.clone()),
        }
    }

    /// Build an engine running on `device` with its working copy at
    /// `work_dir`.
    pub fn engine_on(&self, device: &str, work_dir: &Path) -> ClusterEngine {
        let context = EngineContext {
            store: Arc::new(self.store.clone()),
            directory: self.directory.clone(),
            fetcher: self.fetcher.clone(),
            events: self.events.clone(),
            clock: self.clock.clone(),
            local_device: Some(Self::device(device)),
            timeouts: self.timeouts.clone(),
        };
        ClusterEngine::new(context, self.repo_for(work_dir))
    }
}
