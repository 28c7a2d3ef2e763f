//! Strongly-typed identifiers used across the queue.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a task (unit of schedulable work).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
    /// for determinism.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for TaskId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for TaskId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<TaskId> for Uuid {
    fn from(value: TaskId) -> Self {
        value.0
    }
}

impl FromStr for TaskId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s)
            .map_err(|e| DomainError::invalid_id(format!("TaskId: {}", e)))?;
        Ok(Self(uuid))
    }
}

macro_rules! impl_str_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create from any string-like value. Must be non-empty.
            pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(DomainError::invalid_id(concat!($name, ": empty")));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

/// Identifier of a worker process (e.g. `host:pid`). Opaque to the queue;
/// only ever compared for equality in ownership checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

/// Identifier of the external entity a task operates on (e.g. a repository).
/// Not unique on its own; uniqueness is scoped per task type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceRef(String);

/// Key of a resource lock: resource plus lock purpose, unique per lock row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockKey(String);

impl_str_newtype!(WorkerId, "WorkerId");
impl_str_newtype!(ResourceRef, "ResourceRef");
impl_str_newtype!(LockKey, "LockKey");

impl LockKey {
    /// Build the conventional `<resource>/<purpose>` key.
    pub fn scoped(resource: &ResourceRef, purpose: &str) -> Result<Self, DomainError> {
        Self::new(format!("{}/{}", resource.as_str(), purpose))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_time_ordered() {
        let a = TaskId::new();
        let b = TaskId::new();
        assert_ne!(a, b);
        // UUIDv7 sorts by creation time.
        assert!(a.as_uuid() < b.as_uuid());
    }

    #[test]
    fn empty_worker_id_is_rejected() {
        assert!(WorkerId::new("  ").is_err());
        assert!(WorkerId::new("worker-1").is_ok());
    }

    #[test]
    fn scoped_lock_key_joins_resource_and_purpose() {
        let resource = ResourceRef::new("org/repo").unwrap();
        let key = LockKey::scoped(&resource, "mirror-sync").unwrap();
        assert_eq!(key.as_str(), "org/repo/mirror-sync");
    }
}
