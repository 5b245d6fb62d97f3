//! Capability-token service
//!
//! Mints, validates, consumes, and retires single-use upload/download
//! tokens. A capability token lets a third party move exactly one object
//! within a short TTL without presenting a bearer credential; the principal
//! recorded at mint time is who accounting is charged to.
//!
//! Consumption is linearizable per token: the claim is one atomic update
//! predicated on `completed_at IS NULL`, so of two concurrent consumers
//! exactly one succeeds and the other sees 409.

use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::api_keys::random_urlsafe_token;
use crate::error::{Error, Result};
use crate::repository::{CapabilityTokenRepo, RepositoryError};
use crate::storage::model::{DownloadToken, StorageObject, UploadToken};

/// The capability-token service
pub struct CapabilityTokens {
    repo: Arc<dyn CapabilityTokenRepo>,
    ttl: Duration,
}

impl CapabilityTokens {
    /// `ttl_secs` is capped at one hour by config validation
    pub fn new(repo: Arc<dyn CapabilityTokenRepo>, ttl_secs: i64) -> Self {
        Self {
            repo,
            ttl: Duration::seconds(ttl_secs.min(3600)),
        }
    }

    /// Mint a download token bound to one specific object
    pub async fn mint_download(
        &self,
        user_id: Option<Uuid>,
        object: &StorageObject,
    ) -> Result<DownloadToken> {
        let now = Utc::now();
        let token = DownloadToken {
            id: Uuid::new_v4(),
            token: random_urlsafe_token(),
            user_id,
            bucket: object.bucket.clone(),
            object_id: object.id,
            created_at: now,
            expires_at: now + self.ttl,
            completed_at: None,
            callback_at: None,
            bytes_served: 0,
        };
        self.repo.insert_download(&token).await?;
        Ok(token)
    }

    /// Mint an upload token bound to a target key and size ceiling
    pub async fn mint_upload(
        &self,
        user_id: Option<Uuid>,
        bucket: &str,
        object_key: &str,
        max_size: Option<i64>,
        content_type: Option<String>,
        parent_folder_id: Option<Uuid>,
    ) -> Result<UploadToken> {
        let now = Utc::now();
        let token = UploadToken {
            id: Uuid::new_v4(),
            token: random_urlsafe_token(),
            user_id,
            bucket: bucket.to_string(),
            object_key: object_key.to_string(),
            parent_folder_id,
            max_size,
            content_type,
            created_at: now,
            expires_at: now + self.ttl,
            completed_at: None,
            bytes_uploaded: 0,
        };
        self.repo.insert_upload(&token).await?;
        Ok(token)
    }

    /// Validate and consume a download token
    ///
    /// Order matters for the outward error: a missing token is 404, an
    /// expired one 401, a replayed one 409.
    pub async fn consume_download(&self, token: &str) -> Result<DownloadToken> {
        let record = self
            .repo
            .find_download(token)
            .await?
            .ok_or_else(|| Error::NotFound("Token not found".to_string()))?;

        if Utc::now() >= record.expires_at {
            return Err(Error::Unauthorized("Token has expired".to_string()));
        }
        if !self.repo.try_claim_download(record.id).await? {
            return Err(RepositoryError::AlreadyUsed.into());
        }
        Ok(record)
    }

    /// Validate and consume an upload token for an incoming body
    pub async fn consume_upload(&self, token: &str, incoming: i64) -> Result<UploadToken> {
        let record = self
            .repo
            .find_upload(token)
            .await?
            .ok_or_else(|| Error::NotFound("Token not found".to_string()))?;

        if Utc::now() >= record.expires_at {
            return Err(Error::Unauthorized("Token has expired".to_string()));
        }
        if let Some(max_size) = record.max_size {
            if record.bytes_uploaded + incoming > max_size {
                return Err(Error::ValidationError(
                    "Upload exceeds the token size limit".to_string(),
                ));
            }
        }
        if !self.repo.try_claim_upload(record.id).await? {
            return Err(RepositoryError::AlreadyUsed.into());
        }
        Ok(record)
    }

    /// Retire a consumed download token with the bytes actually served
    pub async fn complete_download(&self, id: Uuid, bytes_served: i64) -> Result<()> {
        Ok(self.repo.finish_download(id, bytes_served).await?)
    }

    /// Retire a consumed upload token with the bytes actually written
    pub async fn complete_upload(&self, id: Uuid, bytes_uploaded: i64) -> Result<()> {
        Ok(self.repo.finish_upload(id, bytes_uploaded).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryCapabilityTokenRepo;
    use crate::storage::model::INTERNAL_BUCKET;

    fn object(owner: Uuid) -> StorageObject {
        let now = Utc::now();
        StorageObject {
            id: Uuid::new_v4(),
            bucket: INTERNAL_BUCKET.to_string(),
            object_key: "report.pdf".to_string(),
            parent_folder_id: None,
            user_id: owner,
            app_id: None,
            size: 42,
            content_type: "application/pdf".to_string(),
            checksum: String::new(),
            created_at: now,
            updated_at: now,
            last_viewed: None,
        }
    }

    fn service() -> CapabilityTokens {
        CapabilityTokens::new(Arc::new(InMemoryCapabilityTokenRepo::default()), 3600)
    }

    #[tokio::test]
    async fn test_download_token_single_use() {
        let service = service();
        let owner = Uuid::new_v4();
        let minted = service
            .mint_download(Some(owner), &object(owner))
            .await
            .unwrap();
        assert!(minted.token.len() >= 32);

        let consumed = service.consume_download(&minted.token).await.unwrap();
        assert_eq!(consumed.object_id, minted.object_id);

        assert!(matches!(
            service.consume_download(&minted.token).await,
            Err(Error::Repository(RepositoryError::AlreadyUsed))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_consumers_resolve_one_winner() {
        let service = Arc::new(service());
        let owner = Uuid::new_v4();
        let minted = service
            .mint_download(Some(owner), &object(owner))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = Arc::clone(&service);
            let token = minted.token.clone();
            handles.push(tokio::spawn(async move {
                service.consume_download(&token).await.is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_expired_token_refused() {
        let repo = Arc::new(InMemoryCapabilityTokenRepo::default());
        let service = CapabilityTokens {
            repo: Arc::clone(&repo) as _,
            ttl: Duration::seconds(-1),
        };
        let owner = Uuid::new_v4();
        let minted = service
            .mint_download(Some(owner), &object(owner))
            .await
            .unwrap();

        assert!(matches!(
            service.consume_download(&minted.token).await,
            Err(Error::Unauthorized(msg)) if msg == "Token has expired"
        ));
    }

    #[tokio::test]
    async fn test_unknown_token_is_not_found() {
        let service = service();
        assert!(matches!(
            service.consume_download("nope").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_upload_token_size_ceiling() {
        let service = service();
        let minted = service
            .mint_upload(
                Some(Uuid::new_v4()),
                INTERNAL_BUCKET,
                "big.bin",
                Some(100),
                None,
                None,
            )
            .await
            .unwrap();

        assert!(matches!(
            service.consume_upload(&minted.token, 101).await,
            Err(Error::ValidationError(_))
        ));

        // The oversized attempt must not have consumed the token.
        let consumed = service.consume_upload(&minted.token, 80).await.unwrap();
        assert_eq!(consumed.id, minted.id);

        service.complete_upload(minted.id, 80).await.unwrap();
    }
}
