//! Identifiers for jobs, agents and builds.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A time-ordered identifier minted by the coordinator.
///
/// Jobs and agents travel over the wire as plain strings, so most of the
/// system works with `String` ids; this type is what produces them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ResourceId(Uuid);

impl ResourceId {
    /// Create a new UUIDv7 identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Render as a prefixed string id, e.g. `job-0190...`.
    pub fn prefixed(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.0.simple())
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ResourceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::str::FromStr for ResourceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Mint a fresh job id.
pub fn new_job_id() -> String {
    ResourceId::new().prefixed("job")
}

/// Mint a fresh agent id.
pub fn new_agent_id() -> String {
    ResourceId::new().prefixed("agent")
}
