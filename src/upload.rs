use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use http::header::{CONTENT_RANGE, CONTENT_TYPE, HeaderName, HeaderValue};
use rand::RngExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use url::Url;

use crate::config::ClientProfile;
use crate::error::{Error, ErrorKind, TransportErrorKind};
use crate::executor::RequestExecutor;
use crate::progress::{ProgressEvent, ProgressPhase, ProgressReporter};
use crate::request::{Method, RequestDescriptor};
use crate::retry::RetryState;
use crate::session::{
    ChecksumAlgorithm, ChunkState, SessionState, UPLOAD_SESSION_VERSION, UploadSession, slice_of,
};
use crate::store::{SessionStore, SessionStoreError};
use crate::util::{lock_unpoisoned, parse_header_name, parse_header_value, parse_http_url};

pub const UPLOAD_ID_HEADER: &str = "x-upload-id";
pub const CHUNK_INDEX_HEADER: &str = "x-chunk-index";
pub const CHUNK_COUNT_HEADER: &str = "x-chunk-count";
pub const CHUNK_CHECKSUM_HEADER: &str = "x-chunk-checksum";
pub const UPLOAD_META_HEADER_PREFIX: &str = "x-upload-meta-";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadTarget {
    chunk_url: Url,
    finalize_url: Url,
}

impl UploadTarget {
    pub fn new(chunk_url: &str, finalize_url: &str) -> crate::Result<Self> {
        Ok(Self {
            chunk_url: parse_http_url(chunk_url)?,
            finalize_url: parse_http_url(finalize_url)?,
        })
    }

    pub fn chunk_url(&self) -> &Url {
        &self.chunk_url
    }

    pub fn finalize_url(&self) -> &Url {
        &self.finalize_url
    }
}

#[derive(Clone, Debug)]
pub struct UploadOptions {
    chunk_size: usize,
    max_concurrent_chunks: usize,
    max_chunk_attempts: usize,
    checksum_algorithm: Option<ChecksumAlgorithm>,
    metadata: BTreeMap<String, String>,
    upload_id: Option<String>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self::from_profile(ClientProfile::default())
    }
}

impl UploadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_profile(profile: ClientProfile) -> Self {
        let defaults = profile.defaults();
        Self {
            chunk_size: defaults.chunk_size,
            max_concurrent_chunks: defaults.max_concurrent_chunks,
            max_chunk_attempts: defaults.max_chunk_attempts,
            checksum_algorithm: None,
            metadata: BTreeMap::new(),
            upload_id: None,
        }
    }

    /// Zero is rejected when the upload starts.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_max_concurrent_chunks(mut self, max_concurrent_chunks: usize) -> Self {
        self.max_concurrent_chunks = max_concurrent_chunks.max(1);
        self
    }

    pub fn with_max_chunk_attempts(mut self, max_chunk_attempts: usize) -> Self {
        self.max_chunk_attempts = max_chunk_attempts.max(1);
        self
    }

    pub fn with_checksum_algorithm(mut self, checksum_algorithm: ChecksumAlgorithm) -> Self {
        self.checksum_algorithm = Some(checksum_algorithm);
        self
    }

    pub fn without_checksum_algorithm(mut self) -> Self {
        self.checksum_algorithm = None;
        self
    }

    /// Sent as `x-upload-meta-<field>` with the first chunk.
    pub fn with_metadata(mut self, field: &str, value: &str) -> crate::Result<Self> {
        let field = field.trim().to_ascii_lowercase();
        let header = format!("{UPLOAD_META_HEADER_PREFIX}{field}");
        parse_header_name(&header)?;
        parse_header_value(&header, value)?;
        self.metadata.insert(field, value.to_owned());
        Ok(self)
    }

    pub fn with_upload_id(mut self, upload_id: impl Into<String>) -> Self {
        self.upload_id = Some(upload_id.into());
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn max_concurrent_chunks(&self) -> usize {
        self.max_concurrent_chunks
    }

    pub fn max_chunk_attempts(&self) -> usize {
        self.max_chunk_attempts
    }

    pub fn checksum_algorithm(&self) -> Option<ChecksumAlgorithm> {
        self.checksum_algorithm
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

#[derive(Clone, Debug, Error)]
pub enum UploadError {
    #[error("upload chunk size must be greater than zero")]
    InvalidChunkSize,
    #[error("upload payload is empty")]
    EmptyPayload,
    #[error("upload session `{upload_id}` not found")]
    SessionNotFound { upload_id: String },
    #[error("upload `{upload_id}` is already running")]
    AlreadyRunning { upload_id: String },
    #[error(
        "unsupported upload session version {session_version}; max supported is {max_supported_version}"
    )]
    UnsupportedSessionVersion {
        session_version: u32,
        max_supported_version: u32,
    },
    #[error("payload has {payload_size} bytes but session expects {session_size}")]
    PayloadMismatch {
        payload_size: u64,
        session_size: u64,
        session: Box<UploadSession>,
    },
    #[error("session chunk layout does not match chunk size {chunk_size}")]
    ChunkSizeMismatch {
        chunk_size: usize,
        session: Box<UploadSession>,
    },
    #[error("{source}")]
    SessionStore {
        #[source]
        source: SessionStoreError,
        session: Option<Box<UploadSession>>,
    },
    #[error("{source}")]
    Chunk {
        #[source]
        source: Error,
        session: Box<UploadSession>,
    },
    #[error("failed to finalize upload: {source}")]
    Finalize {
        #[source]
        source: Error,
        session: Box<UploadSession>,
    },
    #[error("upload `{upload_id}` cancelled")]
    Cancelled {
        upload_id: String,
        session: Box<UploadSession>,
    },
    #[error("upload `{upload_id}` aborted")]
    Aborted {
        upload_id: String,
        session: Box<UploadSession>,
    },
}

impl UploadError {
    pub fn session(&self) -> Option<&UploadSession> {
        match self {
            Self::PayloadMismatch { session, .. }
            | Self::ChunkSizeMismatch { session, .. }
            | Self::Chunk { session, .. }
            | Self::Finalize { session, .. }
            | Self::Cancelled { session, .. }
            | Self::Aborted { session, .. } => Some(&**session),
            Self::SessionStore { session, .. } => session.as_deref(),
            _ => None,
        }
    }

    pub fn into_session(self) -> Option<UploadSession> {
        match self {
            Self::PayloadMismatch { session, .. }
            | Self::ChunkSizeMismatch { session, .. }
            | Self::Chunk { session, .. }
            | Self::Finalize { session, .. }
            | Self::Cancelled { session, .. }
            | Self::Aborted { session, .. } => Some(*session),
            Self::SessionStore { session, .. } => session.map(|session| *session),
            _ => None,
        }
    }

    pub fn chunk_index(&self) -> Option<usize> {
        match self {
            Self::Chunk {
                source: Error::ChunkUpload { chunk_index, .. },
                ..
            } => Some(*chunk_index),
            _ => None,
        }
    }
}

fn normalize_checksum(value: &str) -> String {
    value
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_ascii_lowercase()
}

fn generate_upload_id() -> String {
    let mut rng = rand::rng();
    format!("upload-{:016x}", rng.random_range(0..=u64::MAX))
}

#[derive(Serialize)]
struct FinalizeBody<'a> {
    upload_id: &'a str,
}

struct ChunkJob {
    upload_id: String,
    index: usize,
    chunk_count: usize,
    content_range: String,
    checksum: Option<String>,
    metadata: Option<BTreeMap<String, String>>,
    body: Bytes,
    delay: Duration,
}

impl ChunkJob {
    fn request(&self, chunk_url: &Url) -> crate::Result<RequestDescriptor> {
        let mut headers = HeaderMap::new();
        headers.insert(UPLOAD_ID_HEADER, parse_header_value(UPLOAD_ID_HEADER, &self.upload_id)?);
        headers.insert(CHUNK_INDEX_HEADER, HeaderValue::from(self.index));
        headers.insert(CHUNK_COUNT_HEADER, HeaderValue::from(self.chunk_count));
        headers.insert(
            CONTENT_RANGE,
            parse_header_value(CONTENT_RANGE.as_str(), &self.content_range)?,
        );
        if let Some(checksum) = &self.checksum {
            headers.insert(
                CHUNK_CHECKSUM_HEADER,
                parse_header_value(CHUNK_CHECKSUM_HEADER, checksum)?,
            );
        }
        if let Some(metadata) = &self.metadata {
            for (field, value) in metadata {
                let name = format!("{UPLOAD_META_HEADER_PREFIX}{field}");
                let value = parse_header_value(&name, value)?;
                headers.insert(parse_header_name(&name)?, value);
            }
        }

        let mut request = RequestDescriptor::with_url(Method::Put, chunk_url.clone())
            .with_id(format!("{}:chunk:{}", self.upload_id, self.index))
            .body(self.body.clone());
        *request.headers_mut() = headers;
        Ok(request)
    }
}

struct ChunkReport {
    index: usize,
    result: Result<(), Error>,
}

/// One attempt for one chunk. Retries are scheduled by the manager so that
/// every attempt passes through the session's chunk state machine.
async fn upload_chunk(
    executor: RequestExecutor,
    chunk_url: Url,
    job: ChunkJob,
    cancel: CancellationToken,
) -> ChunkReport {
    let cancelled = || Error::Cancelled {
        method: Method::Put,
        url: chunk_url.to_string(),
    };
    if !job.delay.is_zero() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return ChunkReport {
                    index: job.index,
                    result: Err(cancelled()),
                };
            }
            _ = sleep(job.delay) => {}
        }
    }

    let result = match job.request(&chunk_url) {
        Ok(request) => executor
            .execute(request, &cancel)
            .await
            .into_result()
            .map(|_| ())
            .map_err(|failure| failure.into_error()),
        Err(error) => Err(error),
    };
    ChunkReport {
        index: job.index,
        result,
    }
}

struct ChunkSchedule {
    queue: VecDeque<(usize, Duration)>,
    in_flight: HashMap<tokio::task::Id, usize>,
    attempts_this_run: HashMap<usize, usize>,
    max_attempts: usize,
    failure: Option<Error>,
}

impl ChunkSchedule {
    fn new(outstanding: Vec<usize>, max_attempts: usize) -> Self {
        Self {
            queue: outstanding
                .into_iter()
                .map(|index| (index, Duration::ZERO))
                .collect(),
            in_flight: HashMap::new(),
            attempts_this_run: HashMap::new(),
            max_attempts: max_attempts.max(1),
            failure: None,
        }
    }

    fn fail(&mut self, error: Error) {
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }
}

struct RunningUpload {
    cancel: CancellationToken,
    aborted: Arc<AtomicBool>,
    lease: Arc<tokio::sync::Mutex<()>>,
}

struct Registration<'a> {
    running: &'a Mutex<HashMap<String, RunningUpload>>,
    upload_id: String,
    lease: Arc<tokio::sync::Mutex<()>>,
    _held: OwnedMutexGuard<()>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut running = lock_unpoisoned(self.running);
        if running
            .get(&self.upload_id)
            .is_some_and(|entry| Arc::ptr_eq(&entry.lease, &self.lease))
        {
            running.remove(&self.upload_id);
        }
    }
}

/// Uploads a payload as independently retried chunks, at most
/// `max_concurrent_chunks` at a time, then issues a finalize request once
/// every chunk is acknowledged. Sessions are persisted through a
/// [`SessionStore`] so interrupted uploads can be resumed by id.
pub struct ChunkedUploadManager {
    executor: RequestExecutor,
    store: Arc<dyn SessionStore>,
    target: UploadTarget,
    defaults: UploadOptions,
    progress: Option<ProgressReporter>,
    running: Mutex<HashMap<String, RunningUpload>>,
}

impl std::fmt::Debug for ChunkedUploadManager {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ChunkedUploadManager")
            .field("target", &self.target)
            .field("defaults", &self.defaults)
            .field("running", &lock_unpoisoned(&self.running).len())
            .finish()
    }
}

impl ChunkedUploadManager {
    pub fn new(
        executor: RequestExecutor,
        store: Arc<dyn SessionStore>,
        target: UploadTarget,
    ) -> Self {
        let progress = executor.progress().cloned();
        Self {
            executor,
            store,
            target,
            defaults: UploadOptions::default(),
            progress,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Concurrency and per-chunk attempts used by [`Self::resume_upload`].
    pub fn with_default_options(mut self, defaults: UploadOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_progress_reporter(mut self, progress: ProgressReporter) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn target(&self) -> &UploadTarget {
        &self.target
    }

    pub fn is_running(&self, upload_id: &str) -> bool {
        lock_unpoisoned(&self.running).contains_key(upload_id)
    }

    pub async fn start_upload(
        &self,
        payload: Bytes,
        options: UploadOptions,
        cancel: &CancellationToken,
    ) -> Result<UploadSession, UploadError> {
        if options.chunk_size == 0 {
            return Err(UploadError::InvalidChunkSize);
        }
        if payload.is_empty() {
            return Err(UploadError::EmptyPayload);
        }

        let upload_id = options
            .upload_id
            .clone()
            .unwrap_or_else(generate_upload_id);
        let mut session = UploadSession::new(upload_id, payload.len() as u64, options.chunk_size)
            .with_metadata(options.metadata.clone());
        if let Some(algorithm) = options.checksum_algorithm {
            session.attach_checksums(&payload, algorithm);
        }

        info!(
            upload_id = %session.upload_id,
            total_size = session.total_size,
            chunks = session.chunk_count(),
            "starting chunked upload"
        );
        self.drive(session, payload, &options, cancel).await
    }

    pub async fn resume_upload(
        &self,
        upload_id: &str,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> Result<UploadSession, UploadError> {
        let options = self.defaults.clone();
        self.resume_upload_with_options(upload_id, payload, options, cancel)
            .await
    }

    pub async fn resume_upload_with_options(
        &self,
        upload_id: &str,
        payload: Bytes,
        options: UploadOptions,
        cancel: &CancellationToken,
    ) -> Result<UploadSession, UploadError> {
        let mut session = self
            .store
            .load_session(upload_id)
            .await
            .map_err(|source| UploadError::SessionStore {
                source,
                session: None,
            })?
            .ok_or_else(|| UploadError::SessionNotFound {
                upload_id: upload_id.to_owned(),
            })?;

        if session.version == 0 || session.version > UPLOAD_SESSION_VERSION {
            return Err(UploadError::UnsupportedSessionVersion {
                session_version: session.version,
                max_supported_version: UPLOAD_SESSION_VERSION,
            });
        }
        if session.state == SessionState::Completed {
            return Ok(session);
        }
        if payload.len() as u64 != session.total_size {
            return Err(UploadError::PayloadMismatch {
                payload_size: payload.len() as u64,
                session_size: session.total_size,
                session: Box::new(session),
            });
        }
        if !session.layout_matches(session.chunk_size) {
            return Err(UploadError::ChunkSizeMismatch {
                chunk_size: session.chunk_size,
                session: Box::new(session),
            });
        }

        session.reset_in_flight();
        self.reverify_checksums(&mut session, &payload);

        info!(
            upload_id = %session.upload_id,
            acked = session.acked_count(),
            chunks = session.chunk_count(),
            "resuming chunked upload"
        );
        self.drive(session, payload, &options, cancel).await
    }

    /// Cancels a running upload and removes its persisted session.
    pub async fn abort_upload(&self, upload_id: &str) -> Result<(), UploadError> {
        let lease = {
            let running = lock_unpoisoned(&self.running);
            running.get(upload_id).map(|entry| {
                entry.aborted.store(true, Ordering::SeqCst);
                entry.cancel.cancel();
                Arc::clone(&entry.lease)
            })
        };

        if let Some(lease) = lease {
            let _finished = lease.lock().await;
        } else {
            let persisted = self
                .store
                .load_session(upload_id)
                .await
                .map_err(|source| UploadError::SessionStore {
                    source,
                    session: None,
                })?;
            if persisted.is_none() {
                return Err(UploadError::SessionNotFound {
                    upload_id: upload_id.to_owned(),
                });
            }
        }

        self.store
            .delete_session(upload_id)
            .await
            .map_err(|source| UploadError::SessionStore {
                source,
                session: None,
            })?;
        info!(upload_id, "upload aborted");
        Ok(())
    }

    fn reverify_checksums(&self, session: &mut UploadSession, payload: &[u8]) {
        let Some(algorithm) = session.checksum_algorithm else {
            return;
        };
        for index in 0..session.chunk_count() {
            let Some(chunk) = session.chunk(index) else {
                continue;
            };
            let actual = algorithm.compute_hex(slice_of(payload, chunk));
            let recorded = chunk.checksum.as_deref().map(normalize_checksum);
            if recorded.as_deref() == Some(actual.as_str()) {
                continue;
            }
            if chunk.state == ChunkState::Acked {
                warn!(
                    upload_id = %session.upload_id,
                    chunk_index = index,
                    "payload changed since chunk was acknowledged; re-uploading"
                );
            }
            session.invalidate_chunk(index, Some(actual));
        }
    }

    async fn register(
        &self,
        upload_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(Registration<'_>, CancellationToken, Arc<AtomicBool>), UploadError> {
        let lease = Arc::new(tokio::sync::Mutex::new(()));
        // Fresh lease, never contended.
        let held = Arc::clone(&lease).lock_owned().await;
        let run_cancel = cancel.child_token();
        let aborted = Arc::new(AtomicBool::new(false));

        let mut running = lock_unpoisoned(&self.running);
        if running.contains_key(upload_id) {
            return Err(UploadError::AlreadyRunning {
                upload_id: upload_id.to_owned(),
            });
        }
        running.insert(
            upload_id.to_owned(),
            RunningUpload {
                cancel: run_cancel.clone(),
                aborted: Arc::clone(&aborted),
                lease: Arc::clone(&lease),
            },
        );
        Ok((
            Registration {
                running: &self.running,
                upload_id: upload_id.to_owned(),
                lease,
                _held: held,
            },
            run_cancel,
            aborted,
        ))
    }

    async fn drive(
        &self,
        mut session: UploadSession,
        payload: Bytes,
        options: &UploadOptions,
        cancel: &CancellationToken,
    ) -> Result<UploadSession, UploadError> {
        let upload_id = session.upload_id.clone();
        let (_registration, run_cancel, aborted) = self.register(&upload_id, cancel).await?;

        session.state = SessionState::Active;
        self.persist(&session).await?;

        let span = info_span!("reqx.upload", upload_id = %upload_id);
        let chunk_failure = self
            .run_chunks(&mut session, &payload, options, &run_cancel, &aborted)
            .instrument(span.clone())
            .await;
        session.reset_in_flight();

        if aborted.load(Ordering::SeqCst) {
            session.state = SessionState::Aborted;
            return Err(UploadError::Aborted {
                upload_id,
                session: Box::new(session),
            });
        }
        if let Some(source) = chunk_failure {
            session.state = SessionState::Aborted;
            self.persist(&session).await?;
            warn!(upload_id = %upload_id, error = %source, "upload aborted after chunk failure");
            return Err(UploadError::Chunk {
                source,
                session: Box::new(session),
            });
        }
        if run_cancel.is_cancelled() {
            return self.pause(session).await;
        }

        self.finalize(session, &run_cancel, &aborted)
            .instrument(span)
            .await
    }

    async fn run_chunks(
        &self,
        session: &mut UploadSession,
        payload: &Bytes,
        options: &UploadOptions,
        cancel: &CancellationToken,
        aborted: &AtomicBool,
    ) -> Option<Error> {
        self.report(session, ProgressPhase::Started);

        let semaphore = Arc::new(Semaphore::new(options.max_concurrent_chunks));
        let mut workers = JoinSet::new();
        let mut schedule = ChunkSchedule::new(session.outstanding_chunks(), options.max_chunk_attempts);

        loop {
            if schedule.failure.is_some() || cancel.is_cancelled() {
                break;
            }
            let Some((index, delay)) = schedule.queue.pop_front() else {
                // Nothing queued; a running chunk may still queue a retry.
                let Some(joined) = workers.join_next_with_id().await else {
                    break;
                };
                self.record(session, &mut schedule, joined, aborted).await;
                continue;
            };

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                break;
            };
            while let Some(joined) = workers.try_join_next_with_id() {
                self.record(session, &mut schedule, joined, aborted).await;
            }
            if schedule.failure.is_some() || cancel.is_cancelled() {
                break;
            }

            if let Err(error) = session.begin_chunk(index) {
                warn!(error = %error, "skipping chunk");
                continue;
            }
            *schedule.attempts_this_run.entry(index).or_default() += 1;
            let Some(job) = self.chunk_job(session, payload, index, delay) else {
                continue;
            };
            debug!(chunk_index = index, "dispatching chunk");
            let handle = workers.spawn(
                {
                    let worker = upload_chunk(
                        self.executor.clone(),
                        self.target.chunk_url.clone(),
                        job,
                        cancel.clone(),
                    );
                    async move {
                        let report = worker.await;
                        drop(permit);
                        report
                    }
                }
                .in_current_span(),
            );
            schedule.in_flight.insert(handle.id(), index);
        }

        while let Some(joined) = workers.join_next_with_id().await {
            self.record(session, &mut schedule, joined, aborted).await;
        }
        schedule.failure
    }

    fn chunk_job(
        &self,
        session: &UploadSession,
        payload: &Bytes,
        index: usize,
        delay: Duration,
    ) -> Option<ChunkJob> {
        let chunk = session.chunk(index)?;
        let checksum = match (session.checksum_algorithm, &chunk.checksum) {
            (Some(algorithm), Some(checksum)) => Some(format!("{}={checksum}", algorithm.as_str())),
            _ => None,
        };
        Some(ChunkJob {
            upload_id: session.upload_id.clone(),
            index,
            chunk_count: session.chunk_count(),
            content_range: chunk.content_range(session.total_size),
            checksum,
            metadata: (index == 0 && !session.metadata.is_empty()).then(|| session.metadata.clone()),
            body: payload.slice(chunk.start as usize..chunk.end as usize),
            delay,
        })
    }

    async fn record(
        &self,
        session: &mut UploadSession,
        schedule: &mut ChunkSchedule,
        joined: Result<(tokio::task::Id, ChunkReport), tokio::task::JoinError>,
        aborted: &AtomicBool,
    ) {
        let (index, result, may_retry) = match joined {
            Ok((id, report)) => {
                schedule.in_flight.remove(&id);
                (report.index, report.result, true)
            }
            Err(join_error) => {
                let stopped = Error::Transport {
                    kind: TransportErrorKind::Other,
                    method: Method::Put,
                    url: self.target.chunk_url.to_string(),
                    message: format!("chunk worker stopped: {join_error}"),
                };
                let Some(index) = schedule.in_flight.remove(&join_error.id()) else {
                    warn!(error = %stopped, "untracked chunk worker stopped");
                    schedule.fail(stopped);
                    return;
                };
                (index, Err(stopped), false)
            }
        };

        let error = match result {
            Ok(()) => {
                match session.mark_acked(index) {
                    Ok(true) => {
                        debug!(
                            chunk_index = index,
                            acked = session.acked_count(),
                            chunks = session.chunk_count(),
                            "chunk acknowledged"
                        );
                        self.report(session, ProgressPhase::Transferring);
                        self.checkpoint(session, aborted).await;
                    }
                    Ok(false) => debug!(chunk_index = index, "duplicate chunk ack ignored"),
                    Err(error) => warn!(error = %error, "unexpected chunk ack"),
                }
                return;
            }
            Err(error) if error.kind() == ErrorKind::Cancelled => return,
            Err(error) => error,
        };

        if let Err(transition) = session.mark_failed(index) {
            warn!(error = %transition, "unexpected chunk failure");
        }
        let attempts = session.chunk(index).map_or(0, |chunk| chunk.attempts);
        let attempts_this_run = schedule
            .attempts_this_run
            .get(&index)
            .copied()
            .unwrap_or(attempts);
        let policy = self.executor.retry_policy();
        let retryable = may_retry
            && attempts_this_run < schedule.max_attempts
            && policy.is_retryable(
                &RetryState::at_attempt(attempts_this_run, schedule.max_attempts),
                &error,
            );

        if retryable {
            let delay = policy.backoff_for_retry(attempts_this_run);
            warn!(
                chunk_index = index,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying chunk"
            );
            schedule.queue.push_back((index, delay));
            self.checkpoint(session, aborted).await;
            return;
        }

        warn!(
            chunk_index = index,
            attempts,
            error = %error,
            "chunk upload failed"
        );
        schedule.fail(Error::ChunkUpload {
            chunk_index: index,
            attempts,
            source: Box::new(error),
        });
    }

    async fn checkpoint(&self, session: &UploadSession, aborted: &AtomicBool) {
        if aborted.load(Ordering::SeqCst) {
            return;
        }
        if let Err(error) = self.store.save_session(session).await {
            warn!(error = %error, "failed to checkpoint upload session");
        }
    }

    async fn finalize(
        &self,
        mut session: UploadSession,
        cancel: &CancellationToken,
        aborted: &AtomicBool,
    ) -> Result<UploadSession, UploadError> {
        let request = match self.finalize_request(&session.upload_id) {
            Ok(request) => request,
            Err(source) => {
                return Err(UploadError::Finalize {
                    source,
                    session: Box::new(session),
                });
            }
        };

        let outcome = self.executor.execute(request, cancel).await;
        if aborted.load(Ordering::SeqCst) {
            session.state = SessionState::Aborted;
            return Err(UploadError::Aborted {
                upload_id: session.upload_id.clone(),
                session: Box::new(session),
            });
        }
        match outcome.into_result() {
            Ok(_) => {}
            Err(failure) if failure.kind() == ErrorKind::Cancelled => {
                return self.pause(session).await;
            }
            Err(failure) => {
                session.state = SessionState::Paused;
                self.persist(&session).await?;
                return Err(UploadError::Finalize {
                    source: failure.into_error(),
                    session: Box::new(session),
                });
            }
        }

        session.state = SessionState::Completed;
        if let Err(source) = self.store.delete_session(&session.upload_id).await {
            return Err(UploadError::SessionStore {
                source,
                session: Some(Box::new(session)),
            });
        }
        self.report(&session, ProgressPhase::Completed);
        info!(
            upload_id = %session.upload_id,
            total_size = session.total_size,
            chunks = session.chunk_count(),
            "upload completed"
        );
        Ok(session)
    }

    fn finalize_request(&self, upload_id: &str) -> crate::Result<RequestDescriptor> {
        let body = serde_json::to_vec(&FinalizeBody { upload_id }).map_err(|source| {
            Error::SerializeJson {
                message: source.to_string(),
            }
        })?;
        let upload_id_value = parse_header_value(UPLOAD_ID_HEADER, upload_id)?;
        let request = RequestDescriptor::with_url(Method::Post, self.target.finalize_url.clone())
            .with_id(format!("{upload_id}:finalize"))
            .idempotency_key(upload_id)?
            .header(HeaderName::from_static(UPLOAD_ID_HEADER), upload_id_value)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(body);
        Ok(request)
    }

    async fn pause(&self, mut session: UploadSession) -> Result<UploadSession, UploadError> {
        session.state = SessionState::Paused;
        self.persist(&session).await?;
        info!(
            upload_id = %session.upload_id,
            acked = session.acked_count(),
            chunks = session.chunk_count(),
            "upload paused"
        );
        Err(UploadError::Cancelled {
            upload_id: session.upload_id.clone(),
            session: Box::new(session),
        })
    }

    async fn persist(&self, session: &UploadSession) -> Result<(), UploadError> {
        self.store
            .save_session(session)
            .await
            .map_err(|source| UploadError::SessionStore {
                source,
                session: Some(Box::new(session.clone())),
            })
    }

    /// Progress is counted in chunks. The event with `loaded == total` is
    /// reserved for completion, so the ack of the last chunk is not reported
    /// until finalize succeeds.
    fn report(&self, session: &UploadSession, phase: ProgressPhase) {
        let Some(progress) = &self.progress else {
            return;
        };
        let loaded = session.acked_count() as u64;
        let total = session.chunk_count() as u64;
        if phase != ProgressPhase::Completed && loaded >= total {
            return;
        }
        progress.emit(ProgressEvent::new(
            session.upload_id.clone(),
            loaded,
            total,
            phase,
        ));
    }
}
