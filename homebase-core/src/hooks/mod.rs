//! Extension hook bus
//!
//! Named hook points around login and object transfer. Handlers at `Before*`
//! points and `PostLogin` run synchronously in registration order and may
//! veto the parent operation; the first veto wins. Handlers at `After*`
//! points run in a detached task and their errors are logged, never surfaced.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::auth::Principal;

/// Named extension slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    PostLogin,
    BeforeUpload,
    AfterUpload,
    BeforeDownload,
    AfterDownload,
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PostLogin => "post_login",
            Self::BeforeUpload => "before_upload",
            Self::AfterUpload => "after_upload",
            Self::BeforeDownload => "before_download",
            Self::AfterDownload => "after_download",
        };
        write!(f, "{}", name)
    }
}

/// Context handed to every hook handler
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    /// The acting principal, when one is known
    pub principal: Option<Principal>,

    /// User the operation is attributed to (owner for capability transfers)
    pub user_id: Option<Uuid>,

    pub bucket: Option<String>,
    pub object_id: Option<Uuid>,
    pub filename: Option<String>,

    /// Declared size at `Before*`, actual transferred bytes at `After*`
    pub size: Option<i64>,

    pub content_type: Option<String>,

    /// Free-form data shared between handlers of one dispatch
    pub data: Map<String, Value>,
}

impl HookContext {
    pub fn for_user(user_id: Uuid) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::default()
        }
    }

    pub fn with_principal(mut self, principal: &Principal) -> Self {
        self.user_id = Some(principal.id);
        self.principal = Some(principal.clone());
        self
    }

    pub fn with_bucket(mut self, bucket: &str) -> Self {
        self.bucket = Some(bucket.to_string());
        self
    }

    pub fn with_object(mut self, object_id: Uuid) -> Self {
        self.object_id = Some(object_id);
        self
    }

    pub fn with_filename(mut self, filename: &str) -> Self {
        self.filename = Some(filename.to_string());
        self
    }

    pub fn with_size(mut self, size: i64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }
}

/// Veto raised by a synchronous hook handler
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct HookError {
    /// Handler-provided message, surfaced to the client on vetoed operations
    pub message: String,
}

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A registered hook handler
#[async_trait]
pub trait HookHandler: Send + Sync {
    /// Stable handler name for logs
    fn name(&self) -> &str;

    async fn handle(&self, ctx: &HookContext) -> Result<(), HookError>;
}

/// Registry of hook handlers, dispatching per named point
#[derive(Default)]
pub struct HookBus {
    handlers: RwLock<HashMap<HookPoint, Vec<Arc<dyn HookHandler>>>>,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler at a hook point; dispatch order is registration order
    pub fn register(&self, point: HookPoint, handler: Arc<dyn HookHandler>) {
        self.handlers
            .write()
            .unwrap()
            .entry(point)
            .or_default()
            .push(handler);
    }

    fn handlers_at(&self, point: HookPoint) -> Vec<Arc<dyn HookHandler>> {
        self.handlers
            .read()
            .unwrap()
            .get(&point)
            .cloned()
            .unwrap_or_default()
    }

    /// Run all handlers synchronously; the first veto aborts and is returned
    pub async fn dispatch(&self, point: HookPoint, ctx: &HookContext) -> Result<(), HookError> {
        for handler in self.handlers_at(point) {
            if let Err(veto) = handler.handle(ctx).await {
                tracing::debug!(hook = %point, handler = handler.name(), "hook veto: {}", veto);
                return Err(veto);
            }
        }
        Ok(())
    }

    /// Run all handlers in a detached task; errors are logged only
    pub fn dispatch_detached(self: &Arc<Self>, point: HookPoint, ctx: HookContext) {
        let bus = Arc::clone(self);
        let run = async move {
            for handler in bus.handlers_at(point) {
                if let Err(e) = handler.handle(&ctx).await {
                    tracing::warn!(hook = %point, handler = handler.name(), "hook failed: {}", e);
                }
            }
        };
        // Fired from response-body drop as well as handlers; the runtime may
        // already be gone during shutdown.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(run);
            }
            Err(_) => tracing::warn!(hook = %point, "detached hook dropped, no runtime"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        name: &'static str,
        calls: Arc<AtomicUsize>,
        veto: bool,
    }

    #[async_trait]
    impl HookHandler for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn handle(&self, _ctx: &HookContext) -> Result<(), HookError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.veto {
                Err(HookError::new("vetoed"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order_until_veto() {
        let bus = Arc::new(HookBus::new());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let third = Arc::new(AtomicUsize::new(0));

        bus.register(
            HookPoint::BeforeUpload,
            Arc::new(Recorder {
                name: "first",
                calls: first.clone(),
                veto: false,
            }),
        );
        bus.register(
            HookPoint::BeforeUpload,
            Arc::new(Recorder {
                name: "second",
                calls: second.clone(),
                veto: true,
            }),
        );
        bus.register(
            HookPoint::BeforeUpload,
            Arc::new(Recorder {
                name: "third",
                calls: third.clone(),
                veto: false,
            }),
        );

        let result = bus
            .dispatch(HookPoint::BeforeUpload, &HookContext::default())
            .await;

        assert!(result.is_err());
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(third.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_detached_dispatch_swallows_errors() {
        let bus = Arc::new(HookBus::new());
        let calls = Arc::new(AtomicUsize::new(0));
        bus.register(
            HookPoint::AfterUpload,
            Arc::new(Recorder {
                name: "observer",
                calls: calls.clone(),
                veto: true,
            }),
        );

        bus.dispatch_detached(HookPoint::AfterUpload, HookContext::default());

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_empty_point_allows_operation() {
        let bus = HookBus::new();
        assert!(bus
            .dispatch(HookPoint::BeforeDownload, &HookContext::default())
            .await
            .is_ok());
    }
}
