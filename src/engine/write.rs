//! Write synchronizer.
//!
//! Writes are serialized per repository by the cluster write lock; an
//! interrupted write leaves a durable marker behind that freezes the
//! repository instead of silently losing consistency.

use std::collections::BTreeMap;

use super::{ClusterEngine, WriteTicket};
use crate::error::EngineError;
use crate::store::{LockName, OwnerToken, WriteProperties};

impl ClusterEngine {
    pub(super) fn synchronize_before_write(&mut self) -> Result<(), EngineError> {
        if self.write.is_some() {
            return Err(EngineError::Programmer(
                "before_write called while a write lock is already held",
            ));
        }
        let device = self.this_device()?;

        // Dedicated connection: the advisory lock and the durable marker
        // commit must live on the same connection.
        let mut conn = self.context.store.connect()?;
        let name = LockName::write(&self.repo.id);
        self.acquire_lock(
            conn.as_mut(),
            &name,
            self.context.timeouts.write_lock_wait(),
            "write",
        )?;

        // Freeze check before anything else: a lingering marker means some
        // working copy may be ahead of the version table.
        let versions = self.context.store.load_versions(&self.repo.id)?;
        if let Some((interrupted_device, _)) = versions.iter().find(|(_, row)| row.is_writing) {
            // The advisory lock is tied to `conn` and dies with it on
            // return; the error must surface immediately.
            return Err(self.frozen(format!(
                "a previous write to this repository was interrupted on device \
                 \"{interrupted_device}\"; an operator must verify the working copies \
                 and clear the write marker before writes can continue"
            )));
        }

        // Catch this device up to the cluster maximum while we exclude
        // other writers. Failures release the write lock via `conn`.
        let max_version = self.synchronize_before_read()?;

        let owner = OwnerToken::mint();
        let properties = WriteProperties {
            user: self.acting_user.clone(),
            epoch_secs: self.context.clock.epoch_secs(),
            device: device.clone(),
            extra: BTreeMap::new(),
        };

        // The durable lock: even if the advisory lock is lost later, the
        // marker plus matching owner token lets only this process complete
        // the write.
        conn.will_write(&self.repo.id, &device, properties, &owner)?;

        self.write = Some(WriteTicket {
            conn,
            version: max_version,
            owner,
        });
        Ok(())
    }

    pub(super) fn synchronize_after_write(&mut self) -> Result<(), EngineError> {
        let device = self.this_device()?;
        let Some(ticket) = self.write.take() else {
            return Err(EngineError::Programmer(
                "after_write called without a held write lock",
            ));
        };
        let WriteTicket {
            mut conn,
            version: old_version,
            owner,
        } = ticket;

        // The version advances whenever any push event was recorded,
        // rejected or not: it is a most-recent-activity cursor, not a count
        // of accepted pushes.
        let new_version = self
            .context
            .events
            .most_recent_event_id(&self.repo.id)?
            .unwrap_or(old_version);

        let clock = self.context.clock.as_ref();
        let budget_ms = self.context.timeouts.release_budget().as_millis() as u64;
        let started_ms = clock.now_ms();
        let mut released = false;
        let mut outage_logged = false;

        // The advisory lock may already be gone (database restarted
        // mid-write); clearing the durable marker is the release that
        // matters, so keep reconnecting until the budget runs out.
        loop {
            match self.context.store.did_write(
                &self.repo.id,
                &device,
                old_version,
                new_version,
                &owner,
            ) {
                Ok(_) => {
                    released = true;
                    break;
                }
                Err(err) if err.is_connection_loss() => {
                    if !outage_logged {
                        tracing::error!(
                            repo = %self.repo.id,
                            "lost database connection while releasing durable write lock: {err}"
                        );
                        self.log.say(&format!(
                            "CRITICAL: lost database connection while releasing the \
                             durable write lock: {err}. Retrying..."
                        ));
                        outage_logged = true;
                    }
                    if clock.now_ms().saturating_sub(started_ms) >= budget_ms {
                        break;
                    }
                    clock.sleep(self.context.timeouts.release_retry_delay());
                }
                Err(err) => return Err(err.into()),
            }
        }

        if !released {
            return Err(self.frozen(
                "unable to durably release the write lock within the reconnect budget; \
                 the repository stays frozen until an operator clears the write marker"
                    .to_string(),
            ));
        }

        // Best-effort advisory unlock; an already-lost lock is expected and
        // tolerated.
        let name = LockName::write(&self.repo.id);
        let _ = conn.release(&name);
        Ok(())
    }
}
