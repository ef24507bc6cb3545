//! Denormalized sandbox metadata capability.
//!
//! The control plane is authoritative through cluster resources; this store
//! only holds lookup rows for pagination-friendly listing and ownership
//! checks. Losing it never corrupts the control plane.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::errors::Error;

/// One denormalized sandbox row.
#[derive(Debug, Clone)]
pub struct SandboxRecord {
    pub id: String,
    pub user_id: String,
    pub runtime: String,
    pub created_at: DateTime<Utc>,
}

/// Metadata capability consumed by the façade for listing enrichment.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn create_sandbox_metadata(
        &self,
        id: &str,
        user_id: &str,
        runtime: &str,
    ) -> Result<(), Error>;

    /// Rows for one user plus the total count before pagination.
    async fn list_sandboxes(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<SandboxRecord>, usize), Error>;

    async fn delete_sandbox_metadata(&self, id: &str) -> Result<(), Error>;

    /// True when the given user owns the resource.
    async fn check_resource_ownership(
        &self,
        user_id: &str,
        kind: &str,
        id: &str,
    ) -> Result<bool, Error>;
}

/// In-memory store used by tests and by deployments without an external
/// metadata database.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    rows: RwLock<Vec<SandboxRecord>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn create_sandbox_metadata(
        &self,
        id: &str,
        user_id: &str,
        runtime: &str,
    ) -> Result<(), Error> {
        let mut rows = self.rows.write().await;
        rows.retain(|r| r.id != id);
        rows.push(SandboxRecord {
            id: id.to_string(),
            user_id: user_id.to_string(),
            runtime: runtime.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_sandboxes(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<SandboxRecord>, usize), Error> {
        let rows = self.rows.read().await;
        let matching: Vec<SandboxRecord> = rows
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        let total = matching.len();
        let page = matching
            .into_iter()
            .skip(offset)
            .take(if limit == 0 { usize::MAX } else { limit })
            .collect();
        Ok((page, total))
    }

    async fn delete_sandbox_metadata(&self, id: &str) -> Result<(), Error> {
        self.rows.write().await.retain(|r| r.id != id);
        Ok(())
    }

    async fn check_resource_ownership(
        &self,
        user_id: &str,
        _kind: &str,
        id: &str,
    ) -> Result<bool, Error> {
        let rows = self.rows.read().await;
        Ok(rows.iter().any(|r| r.id == id && r.user_id == user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_pagination_and_count() {
        let store = InMemoryMetadataStore::new();
        for i in 0..5 {
            store
                .create_sandbox_metadata(&format!("sb-{}", i), "alice", "python:3.10")
                .await
                .unwrap();
        }
        store
            .create_sandbox_metadata("sb-bob", "bob", "node:20")
            .await
            .unwrap();

        let (page, total) = store.list_sandboxes("alice", 2, 2).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, "sb-2");

        let (all, total) = store.list_sandboxes("alice", 0, 0).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn test_ownership_check() {
        let store = InMemoryMetadataStore::new();
        store
            .create_sandbox_metadata("sb-1", "alice", "python:3.10")
            .await
            .unwrap();
        assert!(
            store
                .check_resource_ownership("alice", "sandbox", "sb-1")
                .await
                .unwrap()
        );
        assert!(
            !store
                .check_resource_ownership("bob", "sandbox", "sb-1")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = InMemoryMetadataStore::new();
        store
            .create_sandbox_metadata("sb-1", "alice", "python:3.10")
            .await
            .unwrap();
        store.delete_sandbox_metadata("sb-1").await.unwrap();
        store.delete_sandbox_metadata("sb-1").await.unwrap();
        let (_, total) = store.list_sandboxes("alice", 0, 0).await.unwrap();
        assert_eq!(total, 0);
    }
}
