//! Cluster services, device bindings, and the directory that resolves them.
//!
//! A cluster service is a named group of devices collectively hosting one
//! repository. Binding lifecycle is managed elsewhere; this crate only reads
//! the active set.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Transience;
use crate::identity::{DeviceId, ServiceId};

/// Transport protocol a binding is reachable over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ssh,
    Http,
}

impl Protocol {
    /// Whether working copies can be fetched over this transport.
    ///
    /// Intracluster fetches run over the SSH family only; the predicate is
    /// the single place to widen if that ever changes.
    pub fn is_ssh_family(self) -> bool {
        matches!(self, Protocol::Ssh)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ssh => write!(f, "ssh"),
            Protocol::Http => write!(f, "http"),
        }
    }
}

/// One device's active binding to a cluster service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub device: DeviceId,
    pub protocol: Protocol,
    /// Host address the device is reachable at, `host` or `host:port`.
    pub host: String,
}

impl Binding {
    /// Build the URI a peer fetch should pull from.
    pub fn fetch_uri(&self, remote_path: &str) -> String {
        format!(
            "{}://{}/{}",
            self.protocol,
            self.host,
            remote_path.trim_start_matches('/')
        )
    }
}

/// Read access to the set of devices currently bound to a cluster service.
pub trait ClusterDirectory: Send + Sync {
    /// Enumerate active bindings for a service.
    ///
    /// Disabled bindings must not be returned; an empty vector means the
    /// service exists but no device is currently in service.
    fn active_bindings(&self, service: &ServiceId) -> Result<Vec<Binding>, DirectoryError>;
}

/// Failure to resolve a cluster service's bindings.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DirectoryError {
    #[error("cluster service {service} does not exist")]
    ServiceNotFound { service: ServiceId },

    #[error("cluster directory lookup failed: {reason}")]
    Lookup { reason: String },
}

impl DirectoryError {
    pub fn transience(&self) -> Transience {
        match self {
            DirectoryError::ServiceNotFound { .. } => Transience::Permanent,
            DirectoryError::Lookup { .. } => Transience::Retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_uri_joins_host_and_path() {
        let binding = Binding {
            device: DeviceId::new("repo001").unwrap(),
            protocol: Protocol::Ssh,
            host: "repo001.example.net:2222".into(),
        };
        assert_eq!(
            binding.fetch_uri("/diffusion/R42"),
            "ssh://repo001.example.net:2222/diffusion/R42"
        );
    }

    #[test]
    fn only_ssh_is_fetchable() {
        assert!(Protocol::Ssh.is_ssh_family());
        assert!(!Protocol::Http.is_ssh_family());
    }
}
