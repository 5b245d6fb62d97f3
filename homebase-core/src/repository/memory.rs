//! In-memory repository implementations
//!
//! Used by the test suite and by ephemeral (no-database) deployments. Locking
//! is coarse per aggregate; none of the methods hold a lock across an await
//! point.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use super::credentials::{OAuthLink, OAuthLinkRepo, RefreshSession, SessionRepo};
use super::error::{RepositoryError, RepositoryResult};
use super::iam::{AuditLogRepo, PolicyRepo, RoleRepo};
use super::storage::{CapabilityTokenRepo, ObjectRepo, QuotaRepo};
use super::users::{User, UserProfileUpdate, UserRepo};
use crate::auth::api_keys::ApiKey;
use crate::iam::model::{AuditEntry, AuditFilter, Grouping, Role, Rule, UserRole};
use crate::repository::credentials::ApiKeyRepo;
use crate::storage::model::{
    next_bandwidth_reset, DownloadToken, QuotaRecord, StorageObject, UploadToken,
};

/// In-memory user repository
#[derive(Default)]
pub struct InMemoryUserRepo {
    users: Mutex<HashMap<Uuid, User>>,
}

#[async_trait]
impl UserRepo for InMemoryUserRepo {
    async fn create(&self, user: &User) -> RepositoryResult<()> {
        let mut users = self.users.lock().unwrap();
        if users
            .values()
            .any(|u| u.email.eq_ignore_ascii_case(&user.email))
        {
            return Err(RepositoryError::Conflict(format!(
                "email {} already registered",
                user.email
            )));
        }
        users.insert(user.id, user.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<User>> {
        Ok(self.users.lock().unwrap().get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> RepositoryResult<Option<User>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn update_profile(&self, id: Uuid, update: &UserProfileUpdate) -> RepositoryResult<()> {
        let mut users = self.users.lock().unwrap();
        let user = users.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        if let Some(name) = &update.display_name {
            user.display_name = name.clone();
        }
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn set_password_hash(&self, id: Uuid, hash: &str) -> RepositoryResult<()> {
        let mut users = self.users.lock().unwrap();
        let user = users.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        user.password_hash = Some(hash.to_string());
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn set_confirmed(&self, id: Uuid, confirmed: bool) -> RepositoryResult<()> {
        let mut users = self.users.lock().unwrap();
        let user = users.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        user.confirmed = confirmed;
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn set_active(&self, id: Uuid, active: bool) -> RepositoryResult<()> {
        let mut users = self.users.lock().unwrap();
        let user = users.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        user.active = active;
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn list(&self, limit: i64, offset: i64) -> RepositoryResult<Vec<User>> {
        let users = self.users.lock().unwrap();
        let mut all: Vec<User> = users.values().cloned().collect();
        all.sort_by_key(|u| u.created_at);
        Ok(all
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count(&self) -> RepositoryResult<i64> {
        Ok(self.users.lock().unwrap().len() as i64)
    }
}

/// In-memory OAuth link repository
#[derive(Default)]
pub struct InMemoryOAuthLinkRepo {
    links: Mutex<HashMap<(String, String), OAuthLink>>,
}

#[async_trait]
impl OAuthLinkRepo for InMemoryOAuthLinkRepo {
    async fn upsert(&self, link: &OAuthLink) -> RepositoryResult<()> {
        self.links.lock().unwrap().insert(
            (link.provider.clone(), link.provider_user_id.clone()),
            link.clone(),
        );
        Ok(())
    }

    async fn find(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> RepositoryResult<Option<OAuthLink>> {
        Ok(self
            .links
            .lock()
            .unwrap()
            .get(&(provider.to_string(), provider_user_id.to_string()))
            .cloned())
    }

    async fn list_for_user(&self, user_id: Uuid) -> RepositoryResult<Vec<OAuthLink>> {
        Ok(self
            .links
            .lock()
            .unwrap()
            .values()
            .filter(|l| l.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn delete(&self, user_id: Uuid, provider: &str) -> RepositoryResult<()> {
        self.links
            .lock()
            .unwrap()
            .retain(|_, l| !(l.user_id == user_id && l.provider == provider));
        Ok(())
    }
}

/// In-memory refresh session repository
#[derive(Default)]
pub struct InMemorySessionRepo {
    sessions: Mutex<HashMap<Uuid, RefreshSession>>,
}

#[async_trait]
impl SessionRepo for InMemorySessionRepo {
    async fn create(&self, session: &RefreshSession) -> RepositoryResult<()> {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn find_by_token_hash(&self, hash: &str) -> RepositoryResult<Option<RefreshSession>> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .values()
            .find(|s| s.refresh_token_hash == hash)
            .cloned())
    }

    async fn revoke(&self, id: Uuid) -> RepositoryResult<()> {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(&id) {
            session.revoked_at.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    async fn revoke_family(&self, family_id: Uuid) -> RepositoryResult<u64> {
        let mut count = 0;
        for session in self.sessions.lock().unwrap().values_mut() {
            if session.family_id == family_id && session.revoked_at.is_none() {
                session.revoked_at = Some(Utc::now());
                count += 1;
            }
        }
        Ok(count)
    }

    async fn revoke_all_for_user(&self, user_id: Uuid) -> RepositoryResult<u64> {
        let mut count = 0;
        for session in self.sessions.lock().unwrap().values_mut() {
            if session.user_id == user_id && session.revoked_at.is_none() {
                session.revoked_at = Some(Utc::now());
                count += 1;
            }
        }
        Ok(count)
    }
}

/// In-memory API key repository
#[derive(Default)]
pub struct InMemoryApiKeyRepo {
    keys: Mutex<HashMap<Uuid, ApiKey>>,
}

#[async_trait]
impl ApiKeyRepo for InMemoryApiKeyRepo {
    async fn create(&self, key: &ApiKey) -> RepositoryResult<()> {
        self.keys.lock().unwrap().insert(key.id, key.clone());
        Ok(())
    }

    async fn find_by_hash(&self, key_hash: &str) -> RepositoryResult<Option<ApiKey>> {
        Ok(self
            .keys
            .lock()
            .unwrap()
            .values()
            .find(|k| k.key_hash == key_hash)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<ApiKey>> {
        Ok(self.keys.lock().unwrap().get(&id).cloned())
    }

    async fn list_by_user(&self, user_id: Uuid) -> RepositoryResult<Vec<ApiKey>> {
        let mut keys: Vec<ApiKey> = self
            .keys
            .lock()
            .unwrap()
            .values()
            .filter(|k| k.user_id == user_id)
            .cloned()
            .collect();
        keys.sort_by_key(|k| k.created_at);
        Ok(keys)
    }

    async fn revoke(&self, id: Uuid) -> RepositoryResult<()> {
        if let Some(key) = self.keys.lock().unwrap().get_mut(&id) {
            key.revoked_at.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    async fn touch_usage(&self, id: Uuid, ip: &str) -> RepositoryResult<()> {
        if let Some(key) = self.keys.lock().unwrap().get_mut(&id) {
            key.last_used_at = Some(Utc::now());
            key.last_used_ip = Some(ip.to_string());
        }
        Ok(())
    }
}

/// In-memory role repository
#[derive(Default)]
pub struct InMemoryRoleRepo {
    roles: Mutex<HashMap<Uuid, Role>>,
    bindings: Mutex<HashMap<(Uuid, Uuid), UserRole>>,
}

#[async_trait]
impl RoleRepo for InMemoryRoleRepo {
    async fn create(&self, role: &Role) -> RepositoryResult<()> {
        let mut roles = self.roles.lock().unwrap();
        if roles.values().any(|r| r.name == role.name) {
            return Err(RepositoryError::Conflict(format!(
                "role {} already exists",
                role.name
            )));
        }
        roles.insert(role.id, role.clone());
        Ok(())
    }

    async fn update(&self, role: &Role) -> RepositoryResult<()> {
        let mut roles = self.roles.lock().unwrap();
        if !roles.contains_key(&role.id) {
            return Err(RepositoryError::NotFound);
        }
        roles.insert(role.id, role.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> RepositoryResult<()> {
        self.roles.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<Role>> {
        Ok(self.roles.lock().unwrap().get(&id).cloned())
    }

    async fn find_by_name(&self, name: &str) -> RepositoryResult<Option<Role>> {
        Ok(self
            .roles
            .lock()
            .unwrap()
            .values()
            .find(|r| r.name == name)
            .cloned())
    }

    async fn list(&self) -> RepositoryResult<Vec<Role>> {
        let mut roles: Vec<Role> = self.roles.lock().unwrap().values().cloned().collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roles)
    }

    async fn count(&self) -> RepositoryResult<i64> {
        Ok(self.roles.lock().unwrap().len() as i64)
    }

    async fn assign(&self, binding: &UserRole) -> RepositoryResult<()> {
        self.bindings
            .lock()
            .unwrap()
            .entry((binding.user_id, binding.role_id))
            .or_insert_with(|| binding.clone());
        Ok(())
    }

    async fn unassign(&self, user_id: Uuid, role_id: Uuid) -> RepositoryResult<()> {
        self.bindings.lock().unwrap().remove(&(user_id, role_id));
        Ok(())
    }

    async fn roles_for_user(&self, user_id: Uuid) -> RepositoryResult<Vec<Role>> {
        let bindings = self.bindings.lock().unwrap();
        let roles = self.roles.lock().unwrap();
        let now = Utc::now();
        Ok(bindings
            .values()
            .filter(|b| b.user_id == user_id)
            .filter(|b| b.expires_at.map_or(true, |at| now < at))
            .filter_map(|b| roles.get(&b.role_id).cloned())
            .collect())
    }

    async fn remove_assignments_for_role(&self, role_id: Uuid) -> RepositoryResult<u64> {
        let mut bindings = self.bindings.lock().unwrap();
        let before = bindings.len();
        bindings.retain(|_, b| b.role_id != role_id);
        Ok((before - bindings.len()) as u64)
    }
}

/// In-memory policy repository
///
/// `set_unavailable` simulates a disconnected policy store for fail-closed
/// tests.
#[derive(Default)]
pub struct InMemoryPolicyRepo {
    rules: Mutex<Vec<Rule>>,
    groupings: Mutex<Vec<Grouping>>,
    unavailable: AtomicBool,
}

impl InMemoryPolicyRepo {
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> RepositoryResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RepositoryError::Unavailable(
                "policy store disconnected".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PolicyRepo for InMemoryPolicyRepo {
    async fn load_rules(&self) -> RepositoryResult<Vec<Rule>> {
        self.check_available()?;
        Ok(self.rules.lock().unwrap().clone())
    }

    async fn load_groupings(&self) -> RepositoryResult<Vec<Grouping>> {
        self.check_available()?;
        Ok(self.groupings.lock().unwrap().clone())
    }

    async fn add_rule(&self, rule: &Rule) -> RepositoryResult<()> {
        self.check_available()?;
        let mut rules = self.rules.lock().unwrap();
        if !rules.contains(rule) {
            rules.push(rule.clone());
        }
        Ok(())
    }

    async fn remove_rule(&self, rule: &Rule) -> RepositoryResult<()> {
        self.check_available()?;
        self.rules.lock().unwrap().retain(|r| r != rule);
        Ok(())
    }

    async fn remove_rules_for_subject(&self, subject: &str) -> RepositoryResult<u64> {
        self.check_available()?;
        let mut rules = self.rules.lock().unwrap();
        let before = rules.len();
        rules.retain(|r| r.subject != subject);
        Ok((before - rules.len()) as u64)
    }

    async fn add_grouping(&self, grouping: &Grouping) -> RepositoryResult<()> {
        self.check_available()?;
        let mut groupings = self.groupings.lock().unwrap();
        if !groupings.contains(grouping) {
            groupings.push(grouping.clone());
        }
        Ok(())
    }

    async fn remove_grouping(&self, grouping: &Grouping) -> RepositoryResult<()> {
        self.check_available()?;
        self.groupings.lock().unwrap().retain(|g| g != grouping);
        Ok(())
    }

    async fn remove_groupings_for_role(&self, role: &str) -> RepositoryResult<u64> {
        self.check_available()?;
        let mut groupings = self.groupings.lock().unwrap();
        let before = groupings.len();
        groupings.retain(|g| g.role != role);
        Ok((before - groupings.len()) as u64)
    }

    async fn groupings_for_user(&self, user_id: Uuid) -> RepositoryResult<Vec<String>> {
        self.check_available()?;
        Ok(self
            .groupings
            .lock()
            .unwrap()
            .iter()
            .filter(|g| g.user_id == user_id)
            .map(|g| g.role.clone())
            .collect())
    }
}

/// In-memory audit log
#[derive(Default)]
pub struct InMemoryAuditLogRepo {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditLogRepo {
    /// Snapshot of everything appended so far (test helper)
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditLogRepo for InMemoryAuditLogRepo {
    async fn append(&self, entry: &AuditEntry) -> RepositoryResult<()> {
        let mut entries = self.entries.lock().unwrap();
        let mut entry = entry.clone();
        entry.id = entries.len() as i64 + 1;
        entries.push(entry);
        Ok(())
    }

    async fn list(&self, filter: &AuditFilter) -> RepositoryResult<Vec<AuditEntry>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .rev()
            .filter(|e| filter.user_id.map_or(true, |id| e.user_id == Some(id)))
            .filter(|e| filter.result.as_ref().map_or(true, |r| &e.result == r))
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

/// In-memory object metadata repository
#[derive(Default)]
pub struct InMemoryObjectRepo {
    objects: Mutex<HashMap<Uuid, StorageObject>>,
}

#[async_trait]
impl ObjectRepo for InMemoryObjectRepo {
    async fn insert(&self, object: &StorageObject) -> RepositoryResult<()> {
        let mut objects = self.objects.lock().unwrap();
        if objects.values().any(|o| {
            o.bucket == object.bucket
                && o.user_id == object.user_id
                && o.object_key == object.object_key
        }) {
            return Err(RepositoryError::Conflict(format!(
                "object {} already exists in {}",
                object.object_key, object.bucket
            )));
        }
        objects.insert(object.id, object.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<StorageObject>> {
        Ok(self.objects.lock().unwrap().get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> RepositoryResult<()> {
        self.objects.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn rename(&self, id: Uuid, object_key: &str) -> RepositoryResult<()> {
        let mut objects = self.objects.lock().unwrap();
        let object = objects.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        object.object_key = object_key.to_string();
        object.updated_at = Utc::now();
        Ok(())
    }

    async fn touch_viewed(&self, id: Uuid) -> RepositoryResult<()> {
        if let Some(object) = self.objects.lock().unwrap().get_mut(&id) {
            object.last_viewed = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_bucket(
        &self,
        bucket: &str,
        owner: Option<Uuid>,
    ) -> RepositoryResult<Vec<StorageObject>> {
        let mut objects: Vec<StorageObject> = self
            .objects
            .lock()
            .unwrap()
            .values()
            .filter(|o| o.bucket == bucket)
            .filter(|o| owner.map_or(true, |id| o.user_id == id))
            .cloned()
            .collect();
        objects.sort_by(|a, b| a.object_key.cmp(&b.object_key));
        Ok(objects)
    }

    async fn list_children(
        &self,
        bucket: &str,
        owner: Uuid,
        parent: Option<Uuid>,
    ) -> RepositoryResult<Vec<StorageObject>> {
        let mut objects: Vec<StorageObject> = self
            .objects
            .lock()
            .unwrap()
            .values()
            .filter(|o| o.bucket == bucket && o.user_id == owner && o.parent_folder_id == parent)
            .cloned()
            .collect();
        objects.sort_by(|a, b| a.object_key.cmp(&b.object_key));
        Ok(objects)
    }

    async fn stats_for_user(&self, user_id: Uuid) -> RepositoryResult<(i64, i64)> {
        let objects = self.objects.lock().unwrap();
        let owned = objects.values().filter(|o| o.user_id == user_id);
        let (count, bytes) = owned.fold((0i64, 0i64), |(c, b), o| (c + 1, b + o.size));
        Ok((count, bytes))
    }

    async fn list_buckets(&self, owner: Option<Uuid>) -> RepositoryResult<Vec<String>> {
        let objects = self.objects.lock().unwrap();
        let mut buckets: Vec<String> = objects
            .values()
            .filter(|o| owner.map_or(true, |id| o.user_id == id))
            .map(|o| o.bucket.clone())
            .collect();
        buckets.sort();
        buckets.dedup();
        Ok(buckets)
    }
}

/// In-memory capability token repository
#[derive(Default)]
pub struct InMemoryCapabilityTokenRepo {
    downloads: Mutex<HashMap<Uuid, DownloadToken>>,
    uploads: Mutex<HashMap<Uuid, UploadToken>>,
}

#[async_trait]
impl CapabilityTokenRepo for InMemoryCapabilityTokenRepo {
    async fn insert_download(&self, token: &DownloadToken) -> RepositoryResult<()> {
        self.downloads
            .lock()
            .unwrap()
            .insert(token.id, token.clone());
        Ok(())
    }

    async fn insert_upload(&self, token: &UploadToken) -> RepositoryResult<()> {
        self.uploads.lock().unwrap().insert(token.id, token.clone());
        Ok(())
    }

    async fn find_download(&self, token: &str) -> RepositoryResult<Option<DownloadToken>> {
        Ok(self
            .downloads
            .lock()
            .unwrap()
            .values()
            .find(|t| t.token == token)
            .cloned())
    }

    async fn find_upload(&self, token: &str) -> RepositoryResult<Option<UploadToken>> {
        Ok(self
            .uploads
            .lock()
            .unwrap()
            .values()
            .find(|t| t.token == token)
            .cloned())
    }

    async fn try_claim_download(&self, id: Uuid) -> RepositoryResult<bool> {
        let mut downloads = self.downloads.lock().unwrap();
        let token = downloads.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        if token.completed_at.is_some() {
            return Ok(false);
        }
        token.completed_at = Some(Utc::now());
        Ok(true)
    }

    async fn try_claim_upload(&self, id: Uuid) -> RepositoryResult<bool> {
        let mut uploads = self.uploads.lock().unwrap();
        let token = uploads.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        if token.completed_at.is_some() {
            return Ok(false);
        }
        token.completed_at = Some(Utc::now());
        Ok(true)
    }

    async fn finish_download(&self, id: Uuid, bytes_served: i64) -> RepositoryResult<()> {
        let mut downloads = self.downloads.lock().unwrap();
        let token = downloads.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        token.bytes_served = bytes_served;
        token.callback_at = Some(Utc::now());
        Ok(())
    }

    async fn finish_upload(&self, id: Uuid, bytes_uploaded: i64) -> RepositoryResult<()> {
        let mut uploads = self.uploads.lock().unwrap();
        let token = uploads.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        token.bytes_uploaded = bytes_uploaded;
        Ok(())
    }
}

/// In-memory quota repository
#[derive(Default)]
pub struct InMemoryQuotaRepo {
    records: Mutex<HashMap<String, QuotaRecord>>,
    unavailable: AtomicBool,
}

impl InMemoryQuotaRepo {
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> RepositoryResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RepositoryError::Unavailable(
                "quota store disconnected".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl QuotaRepo for InMemoryQuotaRepo {
    async fn get(&self, subject_key: &str) -> RepositoryResult<Option<QuotaRecord>> {
        self.check_available()?;
        Ok(self.records.lock().unwrap().get(subject_key).cloned())
    }

    async fn ensure(&self, subject_key: &str) -> RepositoryResult<QuotaRecord> {
        self.check_available()?;
        let mut records = self.records.lock().unwrap();
        Ok(records
            .entry(subject_key.to_string())
            .or_insert_with(|| QuotaRecord::empty(subject_key.to_string()))
            .clone())
    }

    async fn set_limits(
        &self,
        subject_key: &str,
        max_storage_bytes: Option<i64>,
        max_bandwidth_bytes: Option<i64>,
    ) -> RepositoryResult<()> {
        self.check_available()?;
        let mut records = self.records.lock().unwrap();
        let record = records
            .entry(subject_key.to_string())
            .or_insert_with(|| QuotaRecord::empty(subject_key.to_string()));
        record.max_storage_bytes = max_storage_bytes;
        record.max_bandwidth_bytes = max_bandwidth_bytes;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn add_storage(&self, subject_key: &str, delta: i64) -> RepositoryResult<()> {
        self.check_available()?;
        let mut records = self.records.lock().unwrap();
        let record = records
            .entry(subject_key.to_string())
            .or_insert_with(|| QuotaRecord::empty(subject_key.to_string()));
        record.storage_used = (record.storage_used + delta).max(0);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn add_bandwidth(&self, subject_key: &str, bytes: i64) -> RepositoryResult<()> {
        self.check_available()?;
        let mut records = self.records.lock().unwrap();
        let record = records
            .entry(subject_key.to_string())
            .or_insert_with(|| QuotaRecord::empty(subject_key.to_string()));
        let now = Utc::now();
        if now >= record.bandwidth_reset_at {
            record.bandwidth_used = bytes.max(0);
            record.bandwidth_reset_at = next_bandwidth_reset(record.bandwidth_reset_at);
        } else {
            record.bandwidth_used += bytes.max(0);
        }
        record.updated_at = now;
        Ok(())
    }

    async fn list(&self) -> RepositoryResult<Vec<QuotaRecord>> {
        self.check_available()?;
        let mut records: Vec<QuotaRecord> =
            self.records.lock().unwrap().values().cloned().collect();
        records.sort_by(|a, b| a.subject_key.cmp(&b.subject_key));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_email_is_case_insensitive() {
        let repo = InMemoryUserRepo::default();
        let user = User::new("User@Example.com", None, "u");
        repo.create(&user).await.unwrap();

        let duplicate = User::new("user@example.com", None, "u2");
        assert!(matches!(
            repo.create(&duplicate).await,
            Err(RepositoryError::Conflict(_))
        ));

        let found = repo.find_by_email("USER@EXAMPLE.COM").await.unwrap();
        assert_eq!(found.unwrap().id, user.id);
    }

    #[tokio::test]
    async fn test_assign_twice_leaves_single_binding() {
        let repo = InMemoryRoleRepo::default();
        let role = Role {
            id: Uuid::new_v4(),
            name: "user".to_string(),
            display_name: "User".to_string(),
            description: String::new(),
            role_type: crate::iam::model::RoleType::System,
            metadata: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        repo.create(&role).await.unwrap();

        let binding = UserRole {
            user_id: Uuid::new_v4(),
            role_id: role.id,
            granted_by: None,
            granted_at: Utc::now(),
            expires_at: None,
        };
        repo.assign(&binding).await.unwrap();
        repo.assign(&binding).await.unwrap();

        let roles = repo.roles_for_user(binding.user_id).await.unwrap();
        assert_eq!(roles.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_download_is_single_use() {
        let repo = InMemoryCapabilityTokenRepo::default();
        let token = DownloadToken {
            id: Uuid::new_v4(),
            token: "t".to_string(),
            user_id: None,
            bucket: "b".to_string(),
            object_id: Uuid::new_v4(),
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            completed_at: None,
            callback_at: None,
            bytes_served: 0,
        };
        repo.insert_download(&token).await.unwrap();

        assert!(repo.try_claim_download(token.id).await.unwrap());
        assert!(!repo.try_claim_download(token.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_bandwidth_reset_rolls_over() {
        let repo = InMemoryQuotaRepo::default();
        let key = "user:x";
        repo.ensure(key).await.unwrap();

        // Force the cutoff into the past, then account some bytes.
        {
            let mut records = repo.records.lock().unwrap();
            let record = records.get_mut(key).unwrap();
            record.bandwidth_used = 500;
            record.bandwidth_reset_at = Utc::now() - chrono::Duration::days(1);
        }
        repo.add_bandwidth(key, 100).await.unwrap();

        let record = repo.get(key).await.unwrap().unwrap();
        assert_eq!(record.bandwidth_used, 100);
        assert!(record.bandwidth_reset_at > Utc::now());
    }

    #[tokio::test]
    async fn test_storage_usage_floors_at_zero() {
        let repo = InMemoryQuotaRepo::default();
        repo.add_storage("user:y", 100).await.unwrap();
        repo.add_storage("user:y", -500).await.unwrap();
        assert_eq!(repo.get("user:y").await.unwrap().unwrap().storage_used, 0);
    }
}
