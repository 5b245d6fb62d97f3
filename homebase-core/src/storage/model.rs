//! Storage domain types: objects, capability tokens, quota records

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The internal per-user namespace where ownership checks apply strictly
pub const INTERNAL_BUCKET: &str = "int_storage";

/// Object metadata row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageObject {
    pub id: Uuid,
    pub bucket: String,
    pub object_key: String,
    pub parent_folder_id: Option<Uuid>,
    /// Owner
    pub user_id: Uuid,
    pub app_id: Option<String>,
    pub size: i64,
    pub content_type: String,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_viewed: Option<DateTime<Utc>>,
}

/// Single-use download capability token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadToken {
    pub id: Uuid,
    /// Opaque URL-safe token string (unique)
    pub token: String,
    /// Principal recorded at mint time; accounting is charged to them
    pub user_id: Option<Uuid>,
    pub bucket: String,
    pub object_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub callback_at: Option<DateTime<Utc>>,
    pub bytes_served: i64,
}

/// Single-use upload capability token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadToken {
    pub id: Uuid,
    pub token: String,
    pub user_id: Option<Uuid>,
    pub bucket: String,
    pub object_key: String,
    pub parent_folder_id: Option<Uuid>,
    pub max_size: Option<i64>,
    pub content_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub bytes_uploaded: i64,
}

/// Per-subject quota and usage counters
///
/// `subject_key` is either `user:<id>` (override + usage) or `role:<name>`
/// (default limits). Usage counters are only meaningful on user rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub subject_key: String,
    pub max_storage_bytes: Option<i64>,
    pub max_bandwidth_bytes: Option<i64>,
    pub storage_used: i64,
    pub bandwidth_used: i64,
    pub bandwidth_reset_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QuotaRecord {
    /// Fresh record for a subject with no explicit limits yet
    pub fn empty(subject_key: String) -> Self {
        let now = Utc::now();
        Self {
            subject_key,
            max_storage_bytes: None,
            max_bandwidth_bytes: None,
            storage_used: 0,
            bandwidth_used: 0,
            bandwidth_reset_at: next_bandwidth_reset(now),
            updated_at: now,
        }
    }
}

/// Subject key for a user's quota row
pub fn user_subject(user_id: Uuid) -> String {
    format!("user:{}", user_id)
}

/// Subject key for a role's default-quota row
pub fn role_subject(role: &str) -> String {
    format!("role:{}", role)
}

/// The monthly bandwidth cutoff following `now`
pub fn next_bandwidth_reset(now: DateTime<Utc>) -> DateTime<Utc> {
    now + Months::new(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_keys() {
        let id = Uuid::nil();
        assert_eq!(user_subject(id), format!("user:{}", id));
        assert_eq!(role_subject("admin"), "role:admin");
    }

    #[test]
    fn test_bandwidth_reset_advances_one_month() {
        let now = Utc::now();
        let reset = next_bandwidth_reset(now);
        assert!(reset > now);
        assert!(reset <= now + chrono::Duration::days(32));
    }
}
