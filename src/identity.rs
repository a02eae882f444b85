//! Identity atoms.
//!
//! RepositoryId: logical repository identifier
//! DeviceId: cluster device self-identification
//! ServiceId: cluster service grouping devices
//! UserId: acting user recorded on in-flight writes

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::InvalidId;

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident, $kind:literal) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Result<Self, InvalidId> {
                let s = s.into();
                if s.is_empty() {
                    return Err(InvalidId {
                        kind: $kind,
                        raw: s,
                        reason: "empty",
                    });
                }
                if s.contains(char::is_whitespace) {
                    return Err(InvalidId {
                        kind: $kind,
                        raw: s,
                        reason: "contains whitespace",
                    });
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:?})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(
    /// Logical repository identifier.
    ///
    /// Externally minted; the engine never generates one. Used verbatim in
    /// advisory lock names, so it must be stable across processes.
    RepositoryId,
    "repository"
);

id_newtype!(
    /// Device identifier - one physical node holding a working copy.
    DeviceId,
    "device"
);

id_newtype!(
    /// Cluster service identifier - the named grouping of devices that
    /// collectively host one repository.
    ServiceId,
    "service"
);

id_newtype!(
    /// Acting user, recorded in write properties for operator forensics.
    UserId,
    "user"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_identifiers() {
        let repo = RepositoryId::new("R42").unwrap();
        assert_eq!(repo.as_str(), "R42");
        assert_eq!(format!("{repo}"), "R42");
        assert_eq!(format!("{repo:?}"), "RepositoryId(\"R42\")");
    }

    #[test]
    fn rejects_empty_and_whitespace() {
        assert!(DeviceId::new("").is_err());
        assert!(DeviceId::new("db 001").is_err());
    }
}
