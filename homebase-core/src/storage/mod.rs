//! Object access, capability tokens, and quota governance
//!
//! The mediator fronts every object operation with ownership checks and hook
//! dispatch; the capability-token service covers the unauthenticated
//! single-use transfer paths; the quota enforcer registers at the upload and
//! download hook points.

pub mod backend;
pub mod mediator;
pub mod model;
pub mod quota;
pub mod tokens;

pub use backend::{InMemoryBackend, LocalFsBackend, StorageBackend};
pub use mediator::ObjectMediator;
pub use model::{DownloadToken, QuotaRecord, StorageObject, UploadToken, INTERNAL_BUCKET};
pub use quota::{
    AdmissionHook, DownloadAccountingHook, QuotaDefaults, QuotaEnforcer, UploadAccountingHook,
};
pub use tokens::CapabilityTokens;
