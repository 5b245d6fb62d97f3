//! Object-access mediator
//!
//! Every object operation runs the same protocol: ownership check (admins
//! bypass), synchronous `Before*` hooks that may veto, the storage
//! operation itself, then detached `After*` hooks carrying the real byte
//! counts. Download bodies are wrapped in a counting stream that reports
//! the bytes handed to the client, including on mid-stream disconnect.

use axum::body::{Body, Bytes};
use futures::Stream;
use sha2::{Digest, Sha256};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::{Error, Result};
use crate::hooks::{HookBus, HookContext, HookPoint};
use crate::repository::ObjectRepo;
use crate::storage::backend::StorageBackend;
use crate::storage::model::StorageObject;

/// Called with the number of bytes that reached the client
pub type CompletionFn = Box<dyn FnOnce(u64) + Send>;

/// The object-access mediator
pub struct ObjectMediator {
    objects: Arc<dyn ObjectRepo>,
    backend: Arc<dyn StorageBackend>,
    hooks: Arc<HookBus>,
}

impl ObjectMediator {
    pub fn new(
        objects: Arc<dyn ObjectRepo>,
        backend: Arc<dyn StorageBackend>,
        hooks: Arc<HookBus>,
    ) -> Self {
        Self {
            objects,
            backend,
            hooks,
        }
    }

    /// Ownership check: owners only, scoped by app when the object carries
    /// one. Administrators bypass.
    pub fn ensure_access(&self, principal: &Principal, object: &StorageObject) -> Result<()> {
        if principal.is_admin() {
            return Ok(());
        }
        if object.user_id != principal.id {
            return Err(Error::access_denied());
        }
        if let Some(app_id) = &object.app_id {
            if principal.app_id.as_deref() != Some(app_id.as_str()) {
                return Err(Error::access_denied());
            }
        }
        Ok(())
    }

    /// Load an object and verify the principal may act on it
    pub async fn load_owned(
        &self,
        principal: &Principal,
        object_id: Uuid,
    ) -> Result<StorageObject> {
        let object = self
            .objects
            .find_by_id(object_id)
            .await?
            .ok_or_else(|| Error::NotFound("Object not found".to_string()))?;
        self.ensure_access(principal, &object)?;
        Ok(object)
    }

    /// Authenticated upload path
    pub async fn upload(
        &self,
        principal: &Principal,
        bucket: &str,
        filename: &str,
        content_type: &str,
        parent_folder_id: Option<Uuid>,
        data: &[u8],
    ) -> Result<StorageObject> {
        let ctx = HookContext::default()
            .with_principal(principal)
            .with_bucket(bucket)
            .with_filename(filename)
            .with_size(data.len() as i64)
            .with_content_type(content_type);
        self.hooks
            .dispatch(HookPoint::BeforeUpload, &ctx)
            .await
            .map_err(|veto| Error::QuotaExceeded(veto.message))?;

        self.store(
            principal.id,
            principal.app_id.clone(),
            bucket,
            filename,
            content_type,
            parent_folder_id,
            data,
        )
        .await
    }

    /// Capability-token upload path; the hooks fire with the user recorded
    /// in the token
    pub async fn upload_for_user(
        &self,
        user_id: Uuid,
        bucket: &str,
        filename: &str,
        content_type: &str,
        parent_folder_id: Option<Uuid>,
        data: &[u8],
    ) -> Result<StorageObject> {
        let ctx = HookContext::for_user(user_id)
            .with_bucket(bucket)
            .with_filename(filename)
            .with_size(data.len() as i64)
            .with_content_type(content_type);
        self.hooks
            .dispatch(HookPoint::BeforeUpload, &ctx)
            .await
            .map_err(|veto| Error::QuotaExceeded(veto.message))?;

        self.store(
            user_id,
            None,
            bucket,
            filename,
            content_type,
            parent_folder_id,
            data,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn store(
        &self,
        user_id: Uuid,
        app_id: Option<String>,
        bucket: &str,
        filename: &str,
        content_type: &str,
        parent_folder_id: Option<Uuid>,
        data: &[u8],
    ) -> Result<StorageObject> {
        let now = chrono::Utc::now();
        let object = StorageObject {
            id: Uuid::new_v4(),
            bucket: bucket.to_string(),
            object_key: filename.to_string(),
            parent_folder_id,
            user_id,
            app_id,
            size: data.len() as i64,
            content_type: content_type.to_string(),
            checksum: hex_sha256(data),
            created_at: now,
            updated_at: now,
            last_viewed: None,
        };

        // Bytes live under the object id; metadata holds the visible key.
        self.backend
            .put(bucket, &object.id.to_string(), data)
            .await?;
        if let Err(e) = self.objects.insert(&object).await {
            // Roll the orphaned bytes back before surfacing the error.
            let _ = self
                .backend
                .delete(bucket, &object.id.to_string())
                .await;
            return Err(e.into());
        }

        let after = HookContext::for_user(user_id)
            .with_bucket(bucket)
            .with_object(object.id)
            .with_filename(filename)
            .with_size(object.size);
        self.hooks.dispatch_detached(HookPoint::AfterUpload, after);

        Ok(object)
    }

    /// Authenticated download path: ownership check, `BeforeDownload` veto,
    /// then a counted stream
    pub async fn download(
        &self,
        principal: &Principal,
        object_id: Uuid,
    ) -> Result<(StorageObject, Body)> {
        let object = self.load_owned(principal, object_id).await?;
        let body = self.open_counted(&object, Some(principal.id), None).await?;
        Ok((object, body))
    }

    /// Capability-token download path; accounting goes to `charge_user` and
    /// `on_complete` retires the token with the served byte count
    pub async fn download_for_token(
        &self,
        object_id: Uuid,
        charge_user: Option<Uuid>,
        on_complete: CompletionFn,
    ) -> Result<(StorageObject, Body)> {
        let object = self
            .objects
            .find_by_id(object_id)
            .await?
            .ok_or_else(|| Error::NotFound("Object not found".to_string()))?;
        let body = self
            .open_counted(&object, charge_user, Some(on_complete))
            .await?;
        Ok((object, body))
    }

    async fn open_counted(
        &self,
        object: &StorageObject,
        charge_user: Option<Uuid>,
        on_complete: Option<CompletionFn>,
    ) -> Result<Body> {
        let before = HookContext {
            user_id: charge_user,
            ..HookContext::default()
        }
        .with_bucket(&object.bucket)
        .with_object(object.id)
        .with_size(object.size);
        self.hooks
            .dispatch(HookPoint::BeforeDownload, &before)
            .await
            .map_err(|veto| Error::Forbidden(veto.message))?;

        let reader = self
            .backend
            .open(&object.bucket, &object.id.to_string())
            .await?;

        {
            let objects = Arc::clone(&self.objects);
            let id = object.id;
            tokio::spawn(async move {
                let _ = objects.touch_viewed(id).await;
            });
        }

        let hooks = Arc::clone(&self.hooks);
        let after_ctx = HookContext {
            user_id: charge_user,
            ..HookContext::default()
        }
        .with_bucket(&object.bucket)
        .with_object(object.id);

        let stream = CountingStream::new(ReaderStream::new(reader), move |bytes| {
            if let Some(on_complete) = on_complete {
                on_complete(bytes);
            }
            hooks.dispatch_detached(HookPoint::AfterDownload, after_ctx.with_size(bytes as i64));
        });

        Ok(Body::from_stream(stream))
    }

    /// Delete an object's bytes and row; the caller releases quota with the
    /// returned size
    pub async fn delete(&self, principal: &Principal, object_id: Uuid) -> Result<StorageObject> {
        let object = self.load_owned(principal, object_id).await?;
        self.backend
            .delete(&object.bucket, &object.id.to_string())
            .await?;
        self.objects.delete(object.id).await?;
        Ok(object)
    }

    pub async fn rename(
        &self,
        principal: &Principal,
        object_id: Uuid,
        new_key: &str,
    ) -> Result<StorageObject> {
        let object = self.load_owned(principal, object_id).await?;
        self.objects.rename(object.id, new_key).await?;
        Ok(StorageObject {
            object_key: new_key.to_string(),
            ..object
        })
    }

    /// Object metadata, for the metadata endpoint
    pub async fn metadata(
        &self,
        principal: &Principal,
        object_id: Uuid,
    ) -> Result<StorageObject> {
        self.load_owned(principal, object_id).await
    }

    /// List a bucket: admins see everything, owners see their objects
    pub async fn list_bucket(
        &self,
        principal: &Principal,
        bucket: &str,
    ) -> Result<Vec<StorageObject>> {
        let owner = if principal.is_admin() {
            None
        } else {
            Some(principal.id)
        };
        Ok(self.objects.list_bucket(bucket, owner).await?)
    }

    pub async fn list_buckets(&self, principal: &Principal) -> Result<Vec<String>> {
        let owner = if principal.is_admin() {
            None
        } else {
            Some(principal.id)
        };
        Ok(self.objects.list_buckets(owner).await?)
    }
}

fn hex_sha256(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Stream adapter counting the bytes handed to the client
///
/// The completion callback fires exactly once, when the stream ends or is
/// dropped, so a client disconnect mid-download still reports whatever was
/// flushed.
struct CountingStream<S> {
    inner: S,
    counted: u64,
    on_complete: Option<CompletionFn>,
}

impl<S> CountingStream<S> {
    fn new(inner: S, on_complete: impl FnOnce(u64) + Send + 'static) -> Self {
        Self {
            inner,
            counted: 0,
            on_complete: Some(Box::new(on_complete)),
        }
    }
}

impl<S> Stream for CountingStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.counted += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

impl<S> Drop for CountingStream<S> {
    fn drop(&mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(self.counted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthMethod;
    use crate::repository::memory::InMemoryObjectRepo;
    use crate::storage::backend::InMemoryBackend;
    use crate::storage::model::INTERNAL_BUCKET;
    use http_body_util::BodyExt;

    fn principal(id: Uuid, roles: &[&str]) -> Principal {
        Principal {
            id,
            email: "p@example.com".to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            app_id: None,
            method: AuthMethod::Password,
        }
    }

    fn mediator() -> ObjectMediator {
        ObjectMediator::new(
            Arc::new(InMemoryObjectRepo::default()),
            Arc::new(InMemoryBackend::default()),
            Arc::new(HookBus::new()),
        )
    }

    #[tokio::test]
    async fn test_upload_then_download_round_trip() {
        let mediator = mediator();
        let owner = principal(Uuid::new_v4(), &["user"]);

        let object = mediator
            .upload(&owner, INTERNAL_BUCKET, "notes.txt", "text/plain", None, b"contents")
            .await
            .unwrap();
        assert_eq!(object.size, 8);
        assert_eq!(object.checksum.len(), 64);

        let (_, body) = mediator.download(&owner, object.id).await.unwrap();
        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"contents");
    }

    #[tokio::test]
    async fn test_cross_user_access_denied() {
        let mediator = mediator();
        let owner = principal(Uuid::new_v4(), &["user"]);
        let stranger = principal(Uuid::new_v4(), &["user"]);

        let object = mediator
            .upload(&owner, INTERNAL_BUCKET, "secret.txt", "text/plain", None, b"x")
            .await
            .unwrap();

        assert!(matches!(
            mediator.download(&stranger, object.id).await,
            Err(Error::Forbidden(_))
        ));
        assert!(matches!(
            mediator.delete(&stranger, object.id).await,
            Err(Error::Forbidden(_))
        ));
        assert!(matches!(
            mediator.rename(&stranger, object.id, "y").await,
            Err(Error::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_admin_bypasses_ownership() {
        let mediator = mediator();
        let owner = principal(Uuid::new_v4(), &["user"]);
        let admin = principal(Uuid::new_v4(), &["admin"]);

        let object = mediator
            .upload(&owner, INTERNAL_BUCKET, "secret.txt", "text/plain", None, b"x")
            .await
            .unwrap();

        assert!(mediator.download(&admin, object.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_app_scoped_object_requires_matching_app() {
        let mediator = ObjectMediator::new(
            Arc::new(InMemoryObjectRepo::default()),
            Arc::new(InMemoryBackend::default()),
            Arc::new(HookBus::new()),
        );
        let user_id = Uuid::new_v4();
        let mut owner = principal(user_id, &["user"]);
        owner.app_id = Some("app-a".to_string());

        let object = mediator
            .upload(&owner, INTERNAL_BUCKET, "scoped.txt", "text/plain", None, b"x")
            .await
            .unwrap();
        // The object inherits the uploader's app scope.
        assert_eq!(object.app_id.as_deref(), Some("app-a"));

        let mut other_app = principal(user_id, &["user"]);
        other_app.app_id = Some("app-b".to_string());
        assert!(mediator.ensure_access(&other_app, &object).is_err());

        let no_app = principal(user_id, &["user"]);
        assert!(mediator.ensure_access(&no_app, &object).is_err());
        assert!(mediator.ensure_access(&owner, &object).is_ok());
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let mediator = mediator();
        let someone = principal(Uuid::new_v4(), &["user"]);
        assert!(matches!(
            mediator.download(&someone, Uuid::new_v4()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_counting_stream_reports_bytes_on_drop() {
        let (tx, rx) = std::sync::mpsc::channel();
        {
            let chunks: Vec<std::io::Result<Bytes>> =
                vec![Ok(Bytes::from_static(b"abc")), Ok(Bytes::from_static(b"defg"))];
            let mut stream = CountingStream::new(futures::stream::iter(chunks), move |bytes| {
                tx.send(bytes).unwrap();
            });

            use futures::StreamExt;
            assert_eq!(stream.next().await.unwrap().unwrap().len(), 3);
            // Dropped mid-stream: only the flushed bytes count.
        }
        assert_eq!(rx.recv().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_before_download_veto_maps_to_forbidden() {
        use crate::hooks::{HookError, HookHandler};

        struct Veto;

        #[async_trait::async_trait]
        impl HookHandler for Veto {
            fn name(&self) -> &str {
                "veto"
            }
            async fn handle(&self, _ctx: &HookContext) -> std::result::Result<(), HookError> {
                Err(HookError::new("not today"))
            }
        }

        let hooks = Arc::new(HookBus::new());
        hooks.register(HookPoint::BeforeDownload, Arc::new(Veto));
        let mediator = ObjectMediator::new(
            Arc::new(InMemoryObjectRepo::default()),
            Arc::new(InMemoryBackend::default()),
            hooks,
        );

        let owner = principal(Uuid::new_v4(), &["user"]);
        let object = mediator
            .upload(&owner, INTERNAL_BUCKET, "f.txt", "text/plain", None, b"x")
            .await
            .unwrap();

        assert!(matches!(
            mediator.download(&owner, object.id).await,
            Err(Error::Forbidden(msg)) if msg == "not today"
        ));
    }
}
