//! Version store adapter: per-(repository, device) version rows and the
//! named advisory locks that serialize access to them.
//!
//! The database itself is an external collaborator. This module fixes the
//! row shapes, lock naming, and trait contracts the engine relies on;
//! [`memory::MemoryVersionStore`] is an in-tree implementation with the same
//! semantics.

pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Transience;
use crate::identity::{DeviceId, RepositoryId, UserId};

/// Descriptor of an in-flight write, persisted while `is_writing` is set.
///
/// Operators read this to decide who to chase when a repository freezes.
/// Unknown fields round-trip untouched so newer writers do not lose data
/// through older readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteProperties {
    /// Acting user, if the write was performed on behalf of one.
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user: Option<UserId>,
    /// Wall-clock epoch seconds when the write began.
    #[serde(rename = "epoch")]
    pub epoch_secs: u64,
    /// Device the write originated on.
    #[serde(rename = "deviceId")]
    pub device: DeviceId,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Per-write-attempt token authorizing the matching `did_write`.
///
/// Shape: `<pid>.<12 random alphanumerics>`. Only equality matters; the pid
/// prefix exists for operator forensics.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerToken(String);

impl OwnerToken {
    pub fn mint() -> Self {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        Self(format!("{}.{}", std::process::id(), suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerToken({:?})", self.0)
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One (repository, device) version row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRow {
    /// Monotonic non-negative working copy version.
    pub version: i64,
    /// True between a successful `will_write` and the matching `did_write`
    /// or an explicit operator clear.
    pub is_writing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_properties: Option<WriteProperties>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_owner: Option<OwnerToken>,
}

impl VersionRow {
    pub fn at(version: i64) -> Self {
        Self {
            version,
            is_writing: false,
            write_properties: None,
            write_owner: None,
        }
    }
}

/// Named advisory lock identifier.
///
/// The write lock is single-instance per repository; the read lock is per
/// (repository, device).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockName(String);

impl LockName {
    pub fn read(repo: &RepositoryId, device: &DeviceId) -> Self {
        Self(format!("repository-read-{repo}-{device}"))
    }

    pub fn write(repo: &RepositoryId) -> Self {
        Self(format!("repository-write-{repo}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockName({:?})", self.0)
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A dedicated database connection.
///
/// Advisory locks are owned by the connection: dropping it releases them.
/// `will_write` lives here rather than on [`VersionStore`] so the durable
/// marker commit shares the connection that holds the write lock.
pub trait StoreConnection: Send {
    /// Acquire a named advisory lock, waiting up to `wait`.
    ///
    /// Returns `false` when the wait deadline passes without acquisition.
    fn acquire(&mut self, name: &LockName, wait: Duration) -> Result<bool, StoreError>;

    /// Release a named advisory lock held by this connection.
    ///
    /// Returns `false` when the lock was not held here, which callers on
    /// best-effort paths tolerate.
    fn release(&mut self, name: &LockName) -> Result<bool, StoreError>;

    /// Upsert the row with `is_writing = true` and the given properties and
    /// owner token, on this connection.
    fn will_write(
        &mut self,
        repo: &RepositoryId,
        device: &DeviceId,
        properties: WriteProperties,
        owner: &OwnerToken,
    ) -> Result<(), StoreError>;
}

/// The version store: rows plus connection handles.
pub trait VersionStore: Send + Sync {
    /// Open a dedicated connection for lock-holding work.
    fn connect(&self) -> Result<Box<dyn StoreConnection>, StoreError>;

    /// Read all version rows for a repository. Non-locking.
    fn load_versions(
        &self,
        repo: &RepositoryId,
    ) -> Result<BTreeMap<DeviceId, VersionRow>, StoreError>;

    /// Upsert a device's version, clearing any marker fields.
    ///
    /// Only valid when not holding a write: marker clearing outside
    /// `did_write` is reserved for operators.
    fn update_version(
        &self,
        repo: &RepositoryId,
        device: &DeviceId,
        version: i64,
    ) -> Result<(), StoreError>;

    /// Atomically complete a write: if the row's owner token matches, set
    /// `version = new_version` and clear the marker, returning `true`.
    /// A mismatched or missing token leaves the row untouched and returns
    /// `false`, which makes retries safe and tolerates takeover by another
    /// actor.
    fn did_write(
        &self,
        repo: &RepositoryId,
        device: &DeviceId,
        old_version: i64,
        new_version: i64,
        owner: &OwnerToken,
    ) -> Result<bool, StoreError>;
}

/// Version store failure.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// The database connection was lost. Drives the post-write release
    /// retry loop; everything else propagates.
    #[error("database connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("version store query failed: {reason}")]
    Query { reason: String },
}

impl StoreError {
    pub fn connection_lost(reason: impl Into<String>) -> Self {
        StoreError::ConnectionLost {
            reason: reason.into(),
        }
    }

    pub fn is_connection_loss(&self) -> bool {
        matches!(self, StoreError::ConnectionLost { .. })
    }

    pub fn transience(&self) -> Transience {
        match self {
            StoreError::ConnectionLost { .. } => Transience::Retryable,
            StoreError::Query { .. } => Transience::Unknown,
        }
    }
}
