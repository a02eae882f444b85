//! Read synchronizer.
//!
//! On return the local working copy is at a version at least as fresh as
//! any version recorded for an active device, and this device's row says
//! so.

use super::ClusterEngine;
use crate::cluster::Binding;
use crate::error::EngineError;
use crate::fetch::FetchDriver;
use crate::identity::DeviceId;
use crate::store::LockName;

impl ClusterEngine {
    pub(super) fn synchronize_before_read(&self) -> Result<i64, EngineError> {
        let device = self.this_device()?;
        let mut conn = self.context.store.connect()?;
        let name = LockName::read(&self.repo.id, &device);
        self.acquire_lock(
            conn.as_mut(),
            &name,
            self.context.timeouts.read_lock_wait(),
            "read",
        )?;

        let result = self.read_locked(&device);

        // The lock dies with the connection anyway; the explicit release
        // just surrenders it as early as possible.
        let _ = conn.release(&name);
        result
    }

    fn read_locked(&self, device: &DeviceId) -> Result<i64, EngineError> {
        let versions = self.context.store.load_versions(&self.repo.id)?;
        if versions.is_empty() {
            return self.bootstrap_sole_authority(device);
        }

        let this_version = versions.get(device).map(|row| row.version).unwrap_or(-1);
        let max_version = versions
            .values()
            .map(|row| row.version)
            .max()
            .expect("versions is nonempty");

        if max_version <= this_version {
            self.log.say(&format!(
                "Device \"{device}\" is already at cluster version {max_version} \
                 and does not need to be synchronized."
            ));
            return Ok(max_version);
        }

        self.log.say(&format!(
            "Device \"{device}\" is at version {this_version}; \
             the cluster leaders are at version {max_version}. Synchronizing..."
        ));

        let leaders: Vec<&DeviceId> = versions
            .iter()
            .filter(|(_, row)| row.version == max_version)
            .map(|(leader, _)| leader)
            .collect();
        let leader_bindings: Vec<Binding> = self
            .active_bindings()?
            .into_iter()
            .filter(|binding| leaders.contains(&&binding.device))
            .collect();

        let driver = FetchDriver {
            repo: &self.repo,
            device,
            executor: self.context.fetcher.as_ref(),
            log: &self.log,
        };
        driver.fetch_from(&leader_bindings)?;

        // If this update fails the next read retries the pull; version
        // bookkeeping is idempotent.
        self.context
            .store
            .update_version(&self.repo.id, device, max_version)?;

        Ok(max_version)
    }

    /// No version rows exist, so no device is a leader. Refuse to guess:
    /// only a sole bound device may claim authority.
    fn bootstrap_sole_authority(&self, device: &DeviceId) -> Result<i64, EngineError> {
        let bindings = self.active_bindings()?;

        if bindings.len() > 1 {
            let names: Vec<String> = bindings
                .iter()
                .map(|binding| format!("\"{}\"", binding.device))
                .collect();
            return Err(EngineError::Config(format!(
                "repository \"{}\" has no recorded working copy versions, but more than \
                 one device is bound to its cluster service ({}); unable to determine \
                 which working copy is authoritative. Remove all but one device from \
                 service to designate an authority, then retry.",
                self.repo.display_name,
                names.join(", ")
            )));
        }

        match bindings.first() {
            None => Err(EngineError::Config(format!(
                "repository \"{}\" has no recorded working copy versions and no device \
                 is actively bound to its cluster service",
                self.repo.display_name
            ))),
            Some(binding) if binding.device != *device => Err(EngineError::Config(format!(
                "repository \"{}\" has no recorded working copy versions and this device \
                 (\"{device}\") is not bound to its cluster service; the sole active \
                 device is \"{}\"",
                self.repo.display_name, binding.device
            ))),
            Some(_) => {
                self.log.say(&format!(
                    "Device \"{device}\" is the sole bound device; \
                     initializing it as the authoritative working copy at version 0."
                ));
                self.context
                    .store
                    .update_version(&self.repo.id, device, 0)?;
                Ok(0)
            }
        }
    }
}
