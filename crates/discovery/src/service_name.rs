use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const SEPARATOR: char = '@';

/// Addressing key for discovery and dispatch: `group@version@interface`.
///
/// Group and version may be empty, so two implementations (or two
/// incompatible versions) of the same interface never collide while the
/// unqualified case stays `@@interface`.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ServiceName {
    group: String,
    version: String,
    interface: String,
}

/// The string was not of the form `group@version@interface`.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("invalid service name '{0}': expected group@version@interface")]
pub struct InvalidServiceName(pub String);

impl ServiceName {
    /// Creates a service name from its three parts.
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        interface: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            interface: interface.into(),
        }
    }

    /// The implementation group.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// The interface version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The fully qualified interface name.
    #[must_use]
    pub fn interface(&self) -> &str {
        &self.interface
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.group, self.version, self.interface
        )
    }
}

impl FromStr for ServiceName {
    type Err = InvalidServiceName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, SEPARATOR);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(group), Some(version), Some(interface))
                if !interface.is_empty() && !interface.contains(SEPARATOR) =>
            {
                Ok(Self::new(group, version, interface))
            }
            _ => Err(InvalidServiceName(s.to_string())),
        }
    }
}
