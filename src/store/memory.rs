//! In-memory version store.
//!
//! Single-process implementation of the store contracts, faithful enough to
//! stand in for the real database in tests and simulations: advisory locks
//! are connection-owned, and an outage switch models a database restart that
//! kills connections and drops every held lock.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::identity::{DeviceId, RepositoryId};
use crate::store::{
    LockName, OwnerToken, StoreConnection, StoreError, VersionRow, VersionStore, WriteProperties,
};

#[derive(Default)]
struct State {
    rows: BTreeMap<(RepositoryId, DeviceId), VersionRow>,
    /// Held advisory locks, keyed by name, valued by connection id.
    locks: BTreeMap<LockName, u64>,
    /// Bumped on every simulated outage; connections from older epochs are
    /// dead and fail with `ConnectionLost`.
    epoch: u64,
    online: bool,
}

struct Shared {
    state: Mutex<State>,
    lock_released: Condvar,
    next_conn: AtomicU64,
}

/// In-memory [`VersionStore`] with outage injection.
#[derive(Clone)]
pub struct MemoryVersionStore {
    shared: Arc<Shared>,
}

impl Default for MemoryVersionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryVersionStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    online: true,
                    ..State::default()
                }),
                lock_released: Condvar::new(),
                next_conn: AtomicU64::new(1),
            }),
        }
    }

    /// Simulate database availability.
    ///
    /// Going offline kills every open connection and drops all advisory
    /// locks, like a server restart. Rows survive: they are the durable
    /// state.
    pub fn set_online(&self, online: bool) {
        let mut state = self.shared.state.lock().unwrap();
        if !online && state.online {
            state.epoch += 1;
            state.locks.clear();
        }
        state.online = online;
        drop(state);
        self.shared.lock_released.notify_all();
    }

    /// Operator intervention: clear a stuck `is_writing` marker without
    /// touching the version.
    pub fn clear_write_marker(&self, repo: &RepositoryId, device: &DeviceId) {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(row) = state.rows.get_mut(&(repo.clone(), device.clone())) {
            row.is_writing = false;
            row.write_properties = None;
            row.write_owner = None;
        }
    }

    /// Whether any connection currently holds the named lock.
    pub fn lock_is_held(&self, name: &LockName) -> bool {
        self.shared.state.lock().unwrap().locks.contains_key(name)
    }

    fn guard_online(state: &State) -> Result<(), StoreError> {
        if state.online {
            Ok(())
        } else {
            Err(StoreError::connection_lost("store is offline"))
        }
    }
}

impl VersionStore for MemoryVersionStore {
    fn connect(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        let state = self.shared.state.lock().unwrap();
        Self::guard_online(&state)?;
        let epoch = state.epoch;
        drop(state);

        Ok(Box::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
            id: self.shared.next_conn.fetch_add(1, Ordering::Relaxed),
            epoch,
            held: BTreeSet::new(),
        }))
    }

    fn load_versions(
        &self,
        repo: &RepositoryId,
    ) -> Result<BTreeMap<DeviceId, VersionRow>, StoreError> {
        let state = self.shared.state.lock().unwrap();
        Self::guard_online(&state)?;
        Ok(state
            .rows
            .iter()
            .filter(|((r, _), _)| r == repo)
            .map(|((_, d), row)| (d.clone(), row.clone()))
            .collect())
    }

    fn update_version(
        &self,
        repo: &RepositoryId,
        device: &DeviceId,
        version: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.shared.state.lock().unwrap();
        Self::guard_online(&state)?;
        state
            .rows
            .insert((repo.clone(), device.clone()), VersionRow::at(version));
        Ok(())
    }

    fn did_write(
        &self,
        repo: &RepositoryId,
        device: &DeviceId,
        _old_version: i64,
        new_version: i64,
        owner: &OwnerToken,
    ) -> Result<bool, StoreError> {
        let mut state = self.shared.state.lock().unwrap();
        Self::guard_online(&state)?;
        let Some(row) = state.rows.get_mut(&(repo.clone(), device.clone())) else {
            return Ok(false);
        };
        if row.write_owner.as_ref() != Some(owner) {
            return Ok(false);
        }
        row.version = new_version;
        row.is_writing = false;
        row.write_properties = None;
        row.write_owner = None;
        Ok(true)
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    id: u64,
    epoch: u64,
    held: BTreeSet<LockName>,
}

impl MemoryConnection {
    fn guard_alive(&self, state: &State) -> Result<(), StoreError> {
        MemoryVersionStore::guard_online(state)?;
        if state.epoch != self.epoch {
            return Err(StoreError::connection_lost("connection closed by server"));
        }
        Ok(())
    }
}

impl StoreConnection for MemoryConnection {
    fn acquire(&mut self, name: &LockName, wait: Duration) -> Result<bool, StoreError> {
        let deadline = Instant::now() + wait;
        let mut state = self.shared.state.lock().unwrap();
        loop {
            self.guard_alive(&state)?;
            let holder = state.locks.get(name).copied();
            match holder {
                None => {
                    state.locks.insert(name.clone(), self.id);
                    self.held.insert(name.clone());
                    return Ok(true);
                }
                Some(holder) if holder == self.id => return Ok(true),
                Some(_) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    let (next, timeout) = self
                        .shared
                        .lock_released
                        .wait_timeout(state, deadline - now)
                        .unwrap();
                    state = next;
                    if timeout.timed_out() && state.locks.contains_key(name) {
                        return Ok(false);
                    }
                }
            }
        }
    }

    fn release(&mut self, name: &LockName) -> Result<bool, StoreError> {
        let mut state = self.shared.state.lock().unwrap();
        self.guard_alive(&state)?;
        self.held.remove(name);
        if state.locks.get(name) == Some(&self.id) {
            state.locks.remove(name);
            drop(state);
            self.shared.lock_released.notify_all();
            return Ok(true);
        }
        Ok(false)
    }

    fn will_write(
        &mut self,
        repo: &RepositoryId,
        device: &DeviceId,
        properties: WriteProperties,
        owner: &OwnerToken,
    ) -> Result<(), StoreError> {
        let mut state = self.shared.state.lock().unwrap();
        self.guard_alive(&state)?;
        let row = state
            .rows
            .entry((repo.clone(), device.clone()))
            .or_insert_with(|| VersionRow::at(0));
        row.is_writing = true;
        row.write_properties = Some(properties);
        row.write_owner = Some(owner.clone());
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        let mut released = false;
        for name in std::mem::take(&mut self.held) {
            if state.locks.get(&name) == Some(&self.id) {
                state.locks.remove(&name);
                released = true;
            }
        }
        drop(state);
        if released {
            self.shared.lock_released.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::UserId;

    fn ids() -> (RepositoryId, DeviceId) {
        (
            RepositoryId::new("R1").unwrap(),
            DeviceId::new("repo001").unwrap(),
        )
    }

    fn props(device: &DeviceId) -> WriteProperties {
        WriteProperties {
            user: Some(UserId::new("alice").unwrap()),
            epoch_secs: 1_700_000_000,
            device: device.clone(),
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn locks_are_exclusive_and_die_with_connection() {
        let store = MemoryVersionStore::new();
        let (repo, _) = ids();
        let name = LockName::write(&repo);

        let mut a = store.connect().unwrap();
        let mut b = store.connect().unwrap();
        assert!(a.acquire(&name, Duration::from_millis(10)).unwrap());
        assert!(!b.acquire(&name, Duration::from_millis(10)).unwrap());

        drop(a);
        assert!(b.acquire(&name, Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn did_write_requires_matching_owner() {
        let store = MemoryVersionStore::new();
        let (repo, device) = ids();
        let owner = OwnerToken::mint();
        let other = OwnerToken::mint();

        let mut conn = store.connect().unwrap();
        conn.will_write(&repo, &device, props(&device), &owner)
            .unwrap();

        assert!(!store.did_write(&repo, &device, 0, 9, &other).unwrap());
        let row = &store.load_versions(&repo).unwrap()[&device];
        assert!(row.is_writing);
        assert_eq!(row.version, 0);

        assert!(store.did_write(&repo, &device, 0, 9, &owner).unwrap());
        let row = &store.load_versions(&repo).unwrap()[&device];
        assert!(!row.is_writing);
        assert_eq!(row.version, 9);
        assert!(row.write_owner.is_none());
    }

    #[test]
    fn outage_drops_locks_but_keeps_rows() {
        let store = MemoryVersionStore::new();
        let (repo, device) = ids();
        let name = LockName::write(&repo);
        let owner = OwnerToken::mint();

        let mut conn = store.connect().unwrap();
        assert!(conn.acquire(&name, Duration::from_millis(10)).unwrap());
        conn.will_write(&repo, &device, props(&device), &owner)
            .unwrap();

        store.set_online(false);
        assert!(store.load_versions(&repo).unwrap_err().is_connection_loss());

        store.set_online(true);
        assert!(!store.lock_is_held(&name));
        // The old connection is dead even after recovery.
        let err = conn.release(&name).unwrap_err();
        assert!(err.is_connection_loss());
        // The durable marker survived the restart.
        let row = &store.load_versions(&repo).unwrap()[&device];
        assert!(row.is_writing);
        assert_eq!(row.write_owner, Some(owner));
    }
}
