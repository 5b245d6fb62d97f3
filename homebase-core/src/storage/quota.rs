//! Quota and bandwidth enforcement
//!
//! Admission runs at `BeforeUpload` and vetoes uploads that would overflow
//! the subject's storage budget; accounting runs at `AfterUpload` /
//! `AfterDownload` through atomic counter increments. Admission fails
//! closed when the quota store is unreachable; accounting fails open (a
//! transfer that already happened is never refused retroactively, the
//! missed increment is logged).

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::hooks::{HookContext, HookError, HookHandler};
use crate::repository::{QuotaRepo, RoleRepo};
use crate::storage::model::{role_subject, user_subject, QuotaRecord};

/// Configured fallback limits when neither role rows nor overrides exist
#[derive(Debug, Clone, Copy)]
pub struct QuotaDefaults {
    pub storage_bytes: i64,
    pub bandwidth_bytes: i64,
}

/// Quota summary returned by `GET /api/storage/quota`
#[derive(Debug, Clone, Serialize)]
pub struct QuotaSummary {
    pub used: i64,
    pub total: i64,
    pub percentage: f64,
    pub bandwidth_used: i64,
    pub bandwidth_total: i64,
}

/// The quota and bandwidth enforcer
pub struct QuotaEnforcer {
    quotas: Arc<dyn QuotaRepo>,
    roles: Arc<dyn RoleRepo>,
    defaults: QuotaDefaults,
}

impl QuotaEnforcer {
    pub fn new(
        quotas: Arc<dyn QuotaRepo>,
        roles: Arc<dyn RoleRepo>,
        defaults: QuotaDefaults,
    ) -> Self {
        Self {
            quotas,
            roles,
            defaults,
        }
    }

    /// Effective `(storage, bandwidth)` limits for a user
    ///
    /// Starts from the configured defaults, takes the highest limit among
    /// the user's roles' default rows, then applies the per-user override
    /// when one is set.
    pub async fn effective_limits(&self, user_id: Uuid) -> Result<(i64, i64)> {
        let mut storage = self.defaults.storage_bytes;
        let mut bandwidth = self.defaults.bandwidth_bytes;

        for role in self.roles.roles_for_user(user_id).await? {
            if let Some(record) = self.quotas.get(&role_subject(&role.name)).await? {
                if let Some(limit) = record.max_storage_bytes {
                    storage = storage.max(limit);
                }
                if let Some(limit) = record.max_bandwidth_bytes {
                    bandwidth = bandwidth.max(limit);
                }
            }
        }

        if let Some(record) = self.quotas.get(&user_subject(user_id)).await? {
            if let Some(limit) = record.max_storage_bytes {
                storage = limit;
            }
            if let Some(limit) = record.max_bandwidth_bytes {
                bandwidth = limit;
            }
        }

        Ok((storage, bandwidth))
    }

    /// Current usage record for a user, created on first touch
    pub async fn usage(&self, user_id: Uuid) -> Result<QuotaRecord> {
        Ok(self.quotas.ensure(&user_subject(user_id)).await?)
    }

    /// Pre-upload admission: would `incoming` bytes overflow the budget?
    ///
    /// Unreachable quota store means deny (fail-closed).
    pub async fn admit(&self, user_id: Uuid, incoming: i64) -> Result<()> {
        let (max_storage, _) = self.effective_limits(user_id).await?;
        let usage = self.usage(user_id).await?;

        if usage.storage_used + incoming > max_storage {
            return Err(Error::QuotaExceeded(format!(
                "Upload of {} bytes exceeds the storage quota ({} of {} bytes used)",
                incoming, usage.storage_used, max_storage
            )));
        }
        Ok(())
    }

    /// Post-upload accounting; errors are logged, never surfaced
    pub async fn charge_storage(&self, user_id: Uuid, bytes: i64) {
        if let Err(e) = self.quotas.add_storage(&user_subject(user_id), bytes).await {
            tracing::error!(user = %user_id, bytes, "storage accounting failed: {}", e);
        }
    }

    /// Release storage after a deletion; errors are logged, never surfaced
    pub async fn release_storage(&self, user_id: Uuid, bytes: i64) {
        if let Err(e) = self
            .quotas
            .add_storage(&user_subject(user_id), -bytes)
            .await
        {
            tracing::error!(user = %user_id, bytes, "storage release failed: {}", e);
        }
    }

    /// Post-download accounting; errors are logged, never surfaced
    pub async fn charge_bandwidth(&self, user_id: Uuid, bytes: i64) {
        if let Err(e) = self
            .quotas
            .add_bandwidth(&user_subject(user_id), bytes)
            .await
        {
            tracing::error!(user = %user_id, bytes, "bandwidth accounting failed: {}", e);
        }
    }

    /// Summary for the quota endpoint
    pub async fn summary(&self, user_id: Uuid) -> Result<QuotaSummary> {
        let (total, bandwidth_total) = self.effective_limits(user_id).await?;
        let usage = self.usage(user_id).await?;
        let percentage = if total > 0 {
            (usage.storage_used as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        Ok(QuotaSummary {
            used: usage.storage_used,
            total,
            percentage,
            bandwidth_used: usage.bandwidth_used,
            bandwidth_total,
        })
    }

    /// Admin override of a user's limits
    pub async fn set_user_override(
        &self,
        user_id: Uuid,
        max_storage_bytes: Option<i64>,
        max_bandwidth_bytes: Option<i64>,
    ) -> Result<()> {
        Ok(self
            .quotas
            .set_limits(&user_subject(user_id), max_storage_bytes, max_bandwidth_bytes)
            .await?)
    }

    /// Admin override of a role's default limits
    pub async fn set_role_default(
        &self,
        role: &str,
        max_storage_bytes: Option<i64>,
        max_bandwidth_bytes: Option<i64>,
    ) -> Result<()> {
        Ok(self
            .quotas
            .set_limits(&role_subject(role), max_storage_bytes, max_bandwidth_bytes)
            .await?)
    }

    pub async fn list_records(&self) -> Result<Vec<QuotaRecord>> {
        Ok(self.quotas.list().await?)
    }
}

/// `BeforeUpload` handler performing quota admission
pub struct AdmissionHook {
    enforcer: Arc<QuotaEnforcer>,
}

impl AdmissionHook {
    pub fn new(enforcer: Arc<QuotaEnforcer>) -> Self {
        Self { enforcer }
    }
}

#[async_trait]
impl HookHandler for AdmissionHook {
    fn name(&self) -> &str {
        "quota-admission"
    }

    async fn handle(&self, ctx: &HookContext) -> std::result::Result<(), HookError> {
        let Some(user_id) = ctx.user_id else {
            return Ok(());
        };
        let incoming = ctx.size.unwrap_or(0);
        self.enforcer
            .admit(user_id, incoming)
            .await
            .map_err(|e| match e {
                Error::QuotaExceeded(msg) => HookError::new(msg),
                other => {
                    // Store outage: admission fails closed.
                    tracing::error!("quota admission unavailable: {}", other);
                    HookError::new("Storage quota could not be verified")
                }
            })
    }
}

/// `AfterUpload` handler charging storage usage
pub struct UploadAccountingHook {
    enforcer: Arc<QuotaEnforcer>,
}

impl UploadAccountingHook {
    pub fn new(enforcer: Arc<QuotaEnforcer>) -> Self {
        Self { enforcer }
    }
}

#[async_trait]
impl HookHandler for UploadAccountingHook {
    fn name(&self) -> &str {
        "quota-upload-accounting"
    }

    async fn handle(&self, ctx: &HookContext) -> std::result::Result<(), HookError> {
        if let (Some(user_id), Some(size)) = (ctx.user_id, ctx.size) {
            self.enforcer.charge_storage(user_id, size).await;
        }
        Ok(())
    }
}

/// `AfterDownload` handler charging bandwidth
pub struct DownloadAccountingHook {
    enforcer: Arc<QuotaEnforcer>,
}

impl DownloadAccountingHook {
    pub fn new(enforcer: Arc<QuotaEnforcer>) -> Self {
        Self { enforcer }
    }
}

#[async_trait]
impl HookHandler for DownloadAccountingHook {
    fn name(&self) -> &str {
        "quota-download-accounting"
    }

    async fn handle(&self, ctx: &HookContext) -> std::result::Result<(), HookError> {
        if let (Some(user_id), Some(size)) = (ctx.user_id, ctx.size) {
            self.enforcer.charge_bandwidth(user_id, size).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::{InMemoryQuotaRepo, InMemoryRoleRepo};

    const KIB: i64 = 1024;

    fn enforcer() -> (Arc<QuotaEnforcer>, Arc<InMemoryQuotaRepo>) {
        let quotas = Arc::new(InMemoryQuotaRepo::default());
        let roles = Arc::new(InMemoryRoleRepo::default());
        let enforcer = Arc::new(QuotaEnforcer::new(
            Arc::clone(&quotas) as _,
            roles,
            QuotaDefaults {
                storage_bytes: 1024 * KIB,
                bandwidth_bytes: 10 * 1024 * KIB,
            },
        ));
        (enforcer, quotas)
    }

    #[tokio::test]
    async fn test_admission_boundary() {
        let (enforcer, _) = enforcer();
        let user = Uuid::new_v4();

        enforcer.charge_storage(user, 900 * KIB).await;

        // 900 KiB used of 1 MiB: 200 KiB does not fit, 100 KiB does.
        assert!(matches!(
            enforcer.admit(user, 200 * KIB).await,
            Err(Error::QuotaExceeded(_))
        ));
        assert!(enforcer.admit(user, 100 * KIB).await.is_ok());

        // Deleting 150 KiB frees room for the 200 KiB upload.
        enforcer.release_storage(user, 150 * KIB).await;
        assert!(enforcer.admit(user, 200 * KIB).await.is_ok());
    }

    #[tokio::test]
    async fn test_user_override_beats_default() {
        let (enforcer, _) = enforcer();
        let user = Uuid::new_v4();

        enforcer
            .set_user_override(user, Some(10 * KIB), None)
            .await
            .unwrap();

        let (storage, bandwidth) = enforcer.effective_limits(user).await.unwrap();
        assert_eq!(storage, 10 * KIB);
        assert_eq!(bandwidth, 10 * 1024 * KIB);

        assert!(enforcer.admit(user, 11 * KIB).await.is_err());
        assert!(enforcer.admit(user, 9 * KIB).await.is_ok());
    }

    #[tokio::test]
    async fn test_admission_fails_closed_when_store_down() {
        let (enforcer, quotas) = enforcer();
        quotas.set_unavailable(true);

        assert!(enforcer.admit(Uuid::new_v4(), 1).await.is_err());
    }

    #[tokio::test]
    async fn test_accounting_fails_open_when_store_down() {
        let (enforcer, quotas) = enforcer();
        quotas.set_unavailable(true);

        // Must not panic or surface an error.
        enforcer.charge_storage(Uuid::new_v4(), 100).await;
        enforcer.charge_bandwidth(Uuid::new_v4(), 100).await;
    }

    #[tokio::test]
    async fn test_admission_hook_vetoes_with_quota_message() {
        let (enforcer, _) = enforcer();
        let user = Uuid::new_v4();
        enforcer.charge_storage(user, 1024 * KIB).await;

        let hook = AdmissionHook::new(Arc::clone(&enforcer));
        let ctx = HookContext::for_user(user).with_size(KIB);

        let veto = hook.handle(&ctx).await.unwrap_err();
        assert!(veto.message.contains("quota"));
    }

    #[tokio::test]
    async fn test_summary_percentage() {
        let (enforcer, _) = enforcer();
        let user = Uuid::new_v4();
        enforcer.charge_storage(user, 512 * KIB).await;

        let summary = enforcer.summary(user).await.unwrap();
        assert_eq!(summary.used, 512 * KIB);
        assert_eq!(summary.total, 1024 * KIB);
        assert!((summary.percentage - 50.0).abs() < 0.01);
    }
}
