//! Storage aggregates: object metadata, capability tokens, quotas

use async_trait::async_trait;
use uuid::Uuid;

use super::error::RepositoryResult;
use crate::storage::model::{DownloadToken, QuotaRecord, StorageObject, UploadToken};

/// Repository for object metadata
#[async_trait]
pub trait ObjectRepo: Send + Sync {
    async fn insert(&self, object: &StorageObject) -> RepositoryResult<()>;

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<StorageObject>>;

    async fn delete(&self, id: Uuid) -> RepositoryResult<()>;

    async fn rename(&self, id: Uuid, object_key: &str) -> RepositoryResult<()>;

    async fn touch_viewed(&self, id: Uuid) -> RepositoryResult<()>;

    /// Objects in a bucket, optionally restricted to one owner
    async fn list_bucket(
        &self,
        bucket: &str,
        owner: Option<Uuid>,
    ) -> RepositoryResult<Vec<StorageObject>>;

    /// Direct children of a folder (None = bucket root)
    async fn list_children(
        &self,
        bucket: &str,
        owner: Uuid,
        parent: Option<Uuid>,
    ) -> RepositoryResult<Vec<StorageObject>>;

    /// `(object count, total bytes)` owned by a user
    async fn stats_for_user(&self, user_id: Uuid) -> RepositoryResult<(i64, i64)>;

    /// Distinct bucket names visible to an owner (all buckets for admins)
    async fn list_buckets(&self, owner: Option<Uuid>) -> RepositoryResult<Vec<String>>;
}

/// Repository for capability tokens
///
/// Consumption is linearizable per token: `try_claim_*` performs an atomic
/// update predicated on `completed_at IS NULL`, so two concurrent consumers
/// resolve with exactly one success.
#[async_trait]
pub trait CapabilityTokenRepo: Send + Sync {
    async fn insert_download(&self, token: &DownloadToken) -> RepositoryResult<()>;

    async fn insert_upload(&self, token: &UploadToken) -> RepositoryResult<()>;

    async fn find_download(&self, token: &str) -> RepositoryResult<Option<DownloadToken>>;

    async fn find_upload(&self, token: &str) -> RepositoryResult<Option<UploadToken>>;

    /// Claim a download token; `false` means it was already consumed
    async fn try_claim_download(&self, id: Uuid) -> RepositoryResult<bool>;

    /// Claim an upload token; `false` means it was already consumed
    async fn try_claim_upload(&self, id: Uuid) -> RepositoryResult<bool>;

    /// Record bytes served and the completion callback time
    async fn finish_download(&self, id: Uuid, bytes_served: i64) -> RepositoryResult<()>;

    /// Record bytes uploaded after a completed token upload
    async fn finish_upload(&self, id: Uuid, bytes_uploaded: i64) -> RepositoryResult<()>;
}

/// Repository for quota records
#[async_trait]
pub trait QuotaRepo: Send + Sync {
    async fn get(&self, subject_key: &str) -> RepositoryResult<Option<QuotaRecord>>;

    /// Fetch the subject's record, creating an empty one if absent
    async fn ensure(&self, subject_key: &str) -> RepositoryResult<QuotaRecord>;

    /// Upsert explicit limits (role defaults, per-user overrides)
    async fn set_limits(
        &self,
        subject_key: &str,
        max_storage_bytes: Option<i64>,
        max_bandwidth_bytes: Option<i64>,
    ) -> RepositoryResult<()>;

    /// Atomically add to `storage_used` (delta may be negative; floor at 0)
    async fn add_storage(&self, subject_key: &str, delta: i64) -> RepositoryResult<()>;

    /// Atomically add to `bandwidth_used`, applying the monthly reset when
    /// the cutoff has passed, in the same write
    async fn add_bandwidth(&self, subject_key: &str, bytes: i64) -> RepositoryResult<()>;

    async fn list(&self) -> RepositoryResult<Vec<QuotaRecord>>;
}
