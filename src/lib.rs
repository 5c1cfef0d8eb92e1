//! `reqx-resume` is a policy layer for API SDKs: retries with backoff,
//! credential refresh with a single replay, and resumable chunked uploads on
//! top of any [`Transport`].
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use bytes::Bytes;
//! use reqx_resume::prelude::*;
//! use serde::Deserialize;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug, Deserialize)]
//! struct Item {
//!     id: String,
//! }
//!
//! async fn run(transport: impl Transport + 'static) -> Result<(), Box<dyn std::error::Error>> {
//!     let executor = RequestExecutor::builder(transport)
//!         .client_name("my-sdk")
//!         .request_timeout(Duration::from_secs(3))
//!         .retry_policy(
//!             RetryPolicy::standard()
//!                 .max_attempts(3)
//!                 .base_delay(Duration::from_millis(100))
//!                 .max_delay(Duration::from_millis(800)),
//!         )
//!         .interceptor(JsonCodec)
//!         .build();
//!     let cancel = CancellationToken::new();
//!
//!     let created: Item = executor
//!         .execute_json(
//!             RequestDescriptor::post("https://api.example.com/v1/items")?
//!                 .idempotency_key("create-item-001")?
//!                 .json(&serde_json::json!({ "name": "demo" }))?,
//!             &cancel,
//!         )
//!         .await?;
//!     println!("created id={}", created.id);
//!
//!     let uploads = ChunkedUploadManager::new(
//!         executor,
//!         Arc::new(MemorySessionStore::new()),
//!         UploadTarget::new(
//!             "https://api.example.com/v1/uploads/chunk",
//!             "https://api.example.com/v1/uploads/finalize",
//!         )?,
//!     );
//!     let session = uploads
//!         .start_upload(Bytes::from(vec![0_u8; 4 << 20]), UploadOptions::new(), &cancel)
//!         .await?;
//!     println!("uploaded {} chunks", session.chunk_count());
//!     Ok(())
//! }
//! ```
//!
//! # Recommended Defaults
//!
//! - Use `RetryPolicy::standard()` for SDK traffic.
//! - For `POST` retries, always set `idempotency_key(...)`.
//! - Keep the upload id of a failed or paused upload; `resume_upload` only
//!   re-sends chunks the server has not acknowledged.

pub(crate) const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

mod auth;
mod config;
mod error;
mod executor;
mod interceptor;
mod metrics;
mod observe;
mod outcome;
mod progress;
mod request;
mod response;
mod retry;
mod session;
mod store;
mod transport;
mod upload;
mod util;

pub use crate::auth::{CredentialRefreshGuard, CredentialStore, Credentials, RefreshState};
pub use crate::config::{ClientProfile, ProfileDefaults};
pub use crate::error::{Error, ErrorKind, RefreshError, TransportError, TransportErrorKind};
pub use crate::executor::{RequestExecutor, RequestExecutorBuilder, RequestPhase};
pub use crate::interceptor::{
    BearerAuth, DefaultHeaders, Interceptor, InterceptorChain, InterceptorChainBuilder,
    InterceptorError, JsonCodec, Logging, RequestContext,
};
pub use crate::metrics::ExecutorMetricsSnapshot;
pub use crate::observe::Observer;
pub use crate::outcome::{Failure, Outcome};
pub use crate::progress::{ProgressEvent, ProgressPhase, ProgressReporter, Subscription};
pub use crate::request::{Method, RequestBody, RequestDescriptor};
pub use crate::response::{ResponseBody, ResponseDescriptor};
pub use crate::retry::{
    Backoff, PermissiveRetryEligibility, RetryClassifier, RetryDecision, RetryEligibility,
    RetryPolicy, RetryState, StrictRetryEligibility,
};
pub use crate::session::{
    ChecksumAlgorithm, ChunkDescriptor, ChunkState, InvalidChunkTransition, SessionState,
    UPLOAD_SESSION_VERSION, UploadSession,
};
pub use crate::store::{FileSessionStore, MemorySessionStore, SessionStore, SessionStoreError};
pub use crate::transport::{Transport, TransportResponse};
pub use crate::upload::{
    CHUNK_CHECKSUM_HEADER, CHUNK_COUNT_HEADER, CHUNK_INDEX_HEADER, ChunkedUploadManager,
    UPLOAD_ID_HEADER, UPLOAD_META_HEADER_PREFIX, UploadError, UploadOptions, UploadTarget,
};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        ChunkedUploadManager, ClientProfile, CredentialStore, Credentials, Error, ErrorKind,
        Failure, JsonCodec, MemorySessionStore, Method, Outcome, ProgressEvent, ProgressPhase,
        ProgressReporter, RequestDescriptor, RequestExecutor, ResponseDescriptor, RetryPolicy,
        SessionStore, Transport, TransportError, TransportResponse, UploadError, UploadOptions,
        UploadSession, UploadTarget,
    };
}
