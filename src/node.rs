//! Node Role and Resource Selection
//!
//! Answers the two questions the cursor asks about its own node: is it
//! currently a secondary, and does it replicate a given resource.

use std::collections::HashSet;
use std::path::PathBuf;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// Deployment role of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Writes the event log
    Primary,
    /// Consumes the event log
    Secondary,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Primary => write!(f, "PRIMARY"),
            NodeRole::Secondary => write!(f, "SECONDARY"),
        }
    }
}

impl std::str::FromStr for NodeRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(NodeRole::Primary),
            "secondary" => Ok(NodeRole::Secondary),
            other => Err(Error::Config(format!("unknown node role '{}'", other))),
        }
    }
}

/// Reports the node's current role; the answer may change between calls
#[async_trait::async_trait]
pub trait RoleOracle: Send + Sync {
    async fn current_role(&self) -> Result<NodeRole>;

    async fn is_secondary(&self) -> Result<bool> {
        Ok(self.current_role().await? == NodeRole::Secondary)
    }
}

/// Role that only changes when told to
pub struct StaticRole {
    role: RwLock<NodeRole>,
}

impl StaticRole {
    pub fn new(role: NodeRole) -> Self {
        Self { role: RwLock::new(role) }
    }

    pub async fn set(&self, role: NodeRole) {
        *self.role.write().await = role;
    }
}

#[async_trait::async_trait]
impl RoleOracle for StaticRole {
    async fn current_role(&self) -> Result<NodeRole> {
        Ok(*self.role.read().await)
    }
}

/// Role read from a file on every check, falling back to a fixed role
/// while the file does not exist
pub struct RoleFile {
    path: PathBuf,
    fallback: NodeRole,
}

impl RoleFile {
    pub fn new(path: PathBuf, fallback: NodeRole) -> Self {
        Self { path, fallback }
    }
}

#[async_trait::async_trait]
impl RoleOracle for RoleFile {
    async fn current_role(&self) -> Result<NodeRole> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content.parse(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(self.fallback),
            Err(e) => Err(e.into()),
        }
    }
}

/// Decides whether events for a resource are replayed on this node
#[async_trait::async_trait]
pub trait ResourcePolicy: Send + Sync {
    /// Whether the resource still exists on the primary
    async fn resource_exists(&self, resource_id: i64) -> Result<bool>;

    /// Whether this node is configured to replicate the resource
    async fn resource_relevant(&self, resource_id: i64) -> Result<bool>;
}

/// In-memory resource policy
#[derive(Default)]
pub struct StaticResourcePolicy {
    existing: RwLock<HashSet<i64>>,
    /// `None` replicates everything
    selected: Option<HashSet<i64>>,
}

impl StaticResourcePolicy {
    /// Every existing resource is relevant
    pub fn all(existing: impl IntoIterator<Item = i64>) -> Self {
        Self {
            existing: RwLock::new(existing.into_iter().collect()),
            selected: None,
        }
    }

    /// Only `selected` resources are relevant
    pub fn selective(
        existing: impl IntoIterator<Item = i64>,
        selected: impl IntoIterator<Item = i64>,
    ) -> Self {
        Self {
            existing: RwLock::new(existing.into_iter().collect()),
            selected: Some(selected.into_iter().collect()),
        }
    }

    /// Forget a resource, as if it was deleted on the primary
    pub async fn delete(&self, resource_id: i64) {
        self.existing.write().await.remove(&resource_id);
    }
}

#[async_trait::async_trait]
impl ResourcePolicy for StaticResourcePolicy {
    async fn resource_exists(&self, resource_id: i64) -> Result<bool> {
        Ok(self.existing.read().await.contains(&resource_id))
    }

    async fn resource_relevant(&self, resource_id: i64) -> Result<bool> {
        Ok(self
            .selected
            .as_ref()
            .map_or(true, |selected| selected.contains(&resource_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_role() {
        assert_eq!("secondary\n".parse::<NodeRole>().unwrap(), NodeRole::Secondary);
        assert_eq!("PRIMARY".parse::<NodeRole>().unwrap(), NodeRole::Primary);
        assert!("replica".parse::<NodeRole>().is_err());
    }

    #[tokio::test]
    async fn test_role_file_changes_at_runtime() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("role");
        let oracle = RoleFile::new(path.clone(), NodeRole::Primary);

        assert!(!oracle.is_secondary().await.unwrap());

        std::fs::write(&path, "secondary").unwrap();
        assert!(oracle.is_secondary().await.unwrap());

        std::fs::write(&path, "primary").unwrap();
        assert!(!oracle.is_secondary().await.unwrap());
    }

    #[tokio::test]
    async fn test_selective_policy() {
        let policy = StaticResourcePolicy::selective([1, 2, 3], [2]);
        assert!(!policy.resource_relevant(1).await.unwrap());
        assert!(policy.resource_relevant(2).await.unwrap());

        policy.delete(3).await;
        assert!(!policy.resource_exists(3).await.unwrap());
        assert!(policy.resource_exists(1).await.unwrap());
    }
}
