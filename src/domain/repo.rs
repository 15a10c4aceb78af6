//! Repository identity and schedule classification types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, UpdaterError};

/// Numeric repository identifier assigned by the surrounding system
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoId(pub u32);

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for RepoId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Fully qualified repository name, e.g. `github.com/org/repo`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoName(pub String);

impl RepoName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// External origin (code host) a repository is fetched from
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(pub String);

impl HostId {
    pub fn new(host: impl Into<String>) -> Self {
        Self(host.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A repository known to the surrounding system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRecord {
    pub id: RepoId,
    pub name: RepoName,
    pub host: HostId,
    /// Clone URL handed to the execution backend
    #[serde(default)]
    pub url: String,
}

impl RepoRecord {
    pub fn new(id: u32, name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: RepoId(id),
            name: RepoName::new(name),
            host: HostId::new(host),
            url: String::new(),
        }
    }

    /// Set the clone URL
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Reject records that cannot safely name a working copy or be handed to a
    /// fetch command.
    ///
    /// Names are relative slash-separated paths of `[A-Za-z0-9._-]` components;
    /// no component may be empty, `.`, `..`, or start with `-`. URLs may not
    /// contain whitespace or control characters, or start with `-`.
    pub fn validate(&self) -> Result<()> {
        if self.id.0 == 0 {
            return Err(UpdaterError::InvalidRequest("repository id must be positive".to_string()));
        }

        let name = self.name.as_str();
        if name.trim().is_empty() {
            return Err(UpdaterError::InvalidRequest("repository name must not be empty".to_string()));
        }
        for component in name.split('/') {
            let valid = !component.is_empty()
                && component != "."
                && component != ".."
                && !component.starts_with('-')
                && component
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
            if !valid {
                return Err(UpdaterError::InvalidRequest(format!("invalid repository name {:?}", name)));
            }
        }

        if self.url.starts_with('-') || self.url.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(UpdaterError::InvalidRequest(format!(
                "invalid clone URL {:?} for {}",
                self.url, name
            )));
        }
        Ok(())
    }
}

/// Reference to a repository as supplied by RPC callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RepoRef {
    Id(RepoId),
    Name(RepoName),
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepoRef::Id(id) => write!(f, "id {}", id),
            RepoRef::Name(name) => write!(f, "{}", name),
        }
    }
}

/// Dispatch class. Higher classes always run ahead of lower ones.
///
/// Variant order matters: the derived `Ord` makes `Manual > Normal > Low`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityClass {
    Low,
    #[default]
    Normal,
    Manual,
}

impl PriorityClass {
    /// All classes, highest first
    pub const DESCENDING: [PriorityClass; 3] = [PriorityClass::Manual, PriorityClass::Normal, PriorityClass::Low];

    /// Dense index used for per-class storage
    pub fn index(self) -> usize {
        match self {
            PriorityClass::Low => 0,
            PriorityClass::Normal => 1,
            PriorityClass::Manual => 2,
        }
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PriorityClass::Low => "low",
            PriorityClass::Normal => "normal",
            PriorityClass::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a schedule entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Waiting for its due time
    Queued,
    /// Held by exactly one dispatcher worker
    InFlight,
    /// Explicitly taken out of rotation
    Disabled,
}

impl EntryState {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, EntryState::InFlight)
    }
}
