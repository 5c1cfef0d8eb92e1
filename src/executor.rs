use std::sync::Arc;
use std::time::{Duration, Instant};

use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use serde::de::DeserializeOwned;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::Result;
use crate::auth::{CredentialRefreshGuard, CredentialStore, RefreshState, RefreshVerdict};
use crate::config::ClientProfile;
use crate::error::{Error, ErrorKind};
use crate::interceptor::{
    BearerAuth, DefaultHeaders, Interceptor, InterceptorChain, InterceptorChainBuilder,
    RequestContext, bearer_token,
};
use crate::metrics::{ExecutorMetrics, ExecutorMetricsSnapshot};
use crate::observe::Observer;
use crate::outcome::{Failure, Outcome};
use crate::progress::{ProgressEvent, ProgressPhase, ProgressReporter};
use crate::request::{RequestBody, RequestDescriptor};
use crate::response::{ResponseBody, ResponseDescriptor};
use crate::retry::{
    PermissiveRetryEligibility, RetryDecision, RetryEligibility, RetryPolicy, RetryState,
    StrictRetryEligibility,
};
use crate::transport::Transport;
use crate::util::{parse_header_name, parse_header_value, redact_url_for_logs, truncate_body};

const DEFAULT_CLIENT_NAME: &str = "reqx-resume";

/// Lifecycle of a single attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestPhase {
    Idle,
    Sent,
    HeadersReceived,
    Loading,
    Done,
    Failed,
}

impl RequestPhase {
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Sent)
                | (Self::Idle, Self::Failed)
                | (Self::Sent, Self::HeadersReceived)
                | (Self::Sent, Self::Failed)
                | (Self::HeadersReceived, Self::Loading)
                | (Self::HeadersReceived, Self::Failed)
                | (Self::Loading, Self::Done)
                | (Self::Loading, Self::Failed)
        )
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

struct ExecutorInner {
    transport: Arc<dyn Transport>,
    interceptors: InterceptorChain,
    retry_policy: RetryPolicy,
    retry_eligibility: Arc<dyn RetryEligibility>,
    refresh_guard: Option<Arc<CredentialRefreshGuard>>,
    observer: Option<Arc<dyn Observer>>,
    progress: Option<ProgressReporter>,
    request_timeout: Duration,
    client_name: String,
    metrics: ExecutorMetrics,
}

/// Drives one logical request through interceptors, transport, credential
/// refresh and retries. Cheap to clone; clones share configuration and
/// metrics.
#[derive(Clone)]
pub struct RequestExecutor {
    inner: Arc<ExecutorInner>,
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RequestExecutor")
            .field("client_name", &self.inner.client_name)
            .field("interceptors", &self.inner.interceptors)
            .field("retry_policy", &self.inner.retry_policy)
            .field("request_timeout", &self.inner.request_timeout)
            .field("refresh_guard", &self.inner.refresh_guard.is_some())
            .finish()
    }
}

impl RequestExecutor {
    pub fn builder<T>(transport: T) -> RequestExecutorBuilder
    where
        T: Transport + 'static,
    {
        RequestExecutorBuilder::new(Arc::new(transport))
    }

    pub fn builder_arc(transport: Arc<dyn Transport>) -> RequestExecutorBuilder {
        RequestExecutorBuilder::new(transport)
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry_policy
    }

    pub fn refresh_guard(&self) -> Option<&Arc<CredentialRefreshGuard>> {
        self.inner.refresh_guard.as_ref()
    }

    pub fn progress(&self) -> Option<&ProgressReporter> {
        self.inner.progress.as_ref()
    }

    pub fn metrics_snapshot(&self) -> ExecutorMetricsSnapshot {
        let mut snapshot = self.inner.metrics.snapshot();
        if let Some(guard) = &self.inner.refresh_guard {
            snapshot.refreshes = guard.refresh_count() as u64;
        }
        snapshot
    }

    pub async fn execute_json<T>(
        &self,
        request: RequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let response = self
            .execute(request, cancel)
            .await
            .into_result()
            .map_err(Failure::into_error)?;
        response.json()
    }

    pub async fn execute(&self, request: RequestDescriptor, cancel: &CancellationToken) -> Outcome {
        let started_at = Instant::now();
        self.inner.metrics.record_request_started();
        let _in_flight = self.inner.metrics.enter_in_flight();

        let eligible = self
            .inner
            .retry_eligibility
            .supports_retry(request.method(), request.headers());
        let max_attempts = if eligible {
            self.inner.retry_policy.configured_max_attempts()
        } else {
            1
        };
        let mut state = RetryState::new(max_attempts);
        let mut refresh_state = RefreshState::Armed;
        let redacted_url = redact_url_for_logs(request.url());
        let total_bytes = request
            .body_ref()
            .and_then(RequestBody::len)
            .unwrap_or(0) as u64;
        let mut request = request;

        self.emit_progress(request.id(), 0, total_bytes, ProgressPhase::Started);

        let (outcome, context) = loop {
            request.set_attempt(state.attempt());
            let context = RequestContext::new(
                request.id().to_owned(),
                request.method(),
                redacted_url.clone(),
                state.attempt(),
                state.max_attempts(),
                state.replays(),
            );
            if let Some(observer) = &self.inner.observer {
                observer.on_request_start(&context);
            }

            let span = info_span!(
                "reqx.request",
                client = %self.inner.client_name,
                request_id = %request.id(),
                method = %request.method(),
                url = %redacted_url,
                attempt = state.attempt(),
                max_attempts = state.max_attempts()
            );
            let mut used_token = None;
            let error = match self
                .attempt_once(&request, &context, cancel, &mut used_token)
                .instrument(span)
                .await
            {
                Ok(response) => break (Outcome::Success(response), context),
                Err(error) => error,
            };
            state.record_failure(error.kind());

            match error.kind() {
                ErrorKind::Cancelled | ErrorKind::Interceptor => {
                    break (self.failure(error, &state), context);
                }
                ErrorKind::AuthExpired => {
                    let (method, url) = (request.method(), redacted_url.clone());
                    let Some(guard) = &self.inner.refresh_guard else {
                        break (self.failure(error, &state), context);
                    };
                    match guard
                        .recover(&mut refresh_state, used_token.as_deref())
                        .await
                    {
                        RefreshVerdict::Replay => {
                            if cancel.is_cancelled() {
                                let cancelled = Error::Cancelled { method, url };
                                break (self.failure(cancelled, &state), context);
                            }
                            debug!(
                                request_id = context.request_id(),
                                "replaying request with refreshed credentials"
                            );
                            state.record_replay();
                            self.inner.metrics.record_replay();
                            if let Some(observer) = &self.inner.observer {
                                observer.on_replay(&context);
                            }
                            continue;
                        }
                        RefreshVerdict::AlreadyReplayed => {
                            break (self.failure(error, &state), context);
                        }
                        RefreshVerdict::Failed(refresh_error) => {
                            let expired = Error::AuthExpired {
                                method,
                                url,
                                detail: refresh_error.to_string(),
                            };
                            break (self.failure(expired, &state), context);
                        }
                    }
                }
                _ => {}
            }

            let failure = self.failure(error, &state);
            match self.inner.retry_policy.should_retry(&state, &failure) {
                RetryDecision::GiveUp => break (failure, context),
                RetryDecision::Retry(delay) => {
                    if let Outcome::Failure(current) = &failure {
                        warn!(
                            request_id = context.request_id(),
                            attempt = state.attempt(),
                            delay_ms = delay.as_millis() as u64,
                            error = %current.error(),
                            "retrying request"
                        );
                        if let Some(observer) = &self.inner.observer {
                            observer.on_retry_scheduled(&context, current.error(), delay);
                        }
                    }
                    self.inner.metrics.record_retry();
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            let cancelled = Error::Cancelled {
                                method: request.method(),
                                url: redacted_url.clone(),
                            };
                            break (self.failure(cancelled, &state), context);
                        }
                        _ = sleep(delay) => {}
                    }
                    state.advance_after_delay(delay);
                }
            }
        };

        self.inner
            .metrics
            .record_request_completed(&outcome, started_at.elapsed());
        if outcome.is_success() {
            self.emit_progress(
                context.request_id(),
                total_bytes,
                total_bytes,
                ProgressPhase::Completed,
            );
        } else {
            self.emit_progress(context.request_id(), 0, total_bytes, ProgressPhase::Failed);
        }
        if let Some(observer) = &self.inner.observer {
            observer.on_request_complete(&context, &outcome);
        }
        outcome
    }

    fn failure(&self, error: Error, state: &RetryState) -> Outcome {
        Outcome::Failure(Failure::new(error, state.attempt(), state.replays()))
    }

    /// `used_token` receives the bearer token the prepared request carried.
    async fn attempt_once(
        &self,
        request: &RequestDescriptor,
        context: &RequestContext,
        cancel: &CancellationToken,
        used_token: &mut Option<String>,
    ) -> std::result::Result<ResponseDescriptor, Error> {
        let mut phase = RequestPhase::Idle;
        let method = request.method();
        let url = context.url().to_owned();

        let prepared = match self.inner.interceptors.apply_request(context, request.clone()) {
            Ok(prepared) => Arc::new(prepared),
            Err(error) => {
                self.transition(&mut phase, RequestPhase::Failed, context);
                return Err(error);
            }
        };
        *used_token = bearer_token(prepared.headers());
        if cancel.is_cancelled() {
            self.transition(&mut phase, RequestPhase::Failed, context);
            return Err(Error::Cancelled { method, url });
        }

        let timeout_value = prepared
            .timeout_value()
            .unwrap_or(self.inner.request_timeout);
        self.transition(&mut phase, RequestPhase::Sent, context);
        debug!("sending request");

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.transition(&mut phase, RequestPhase::Failed, context);
                return Err(Error::Cancelled { method, url });
            }
            sent = timeout(timeout_value, self.inner.transport.send(&prepared, cancel)) => sent,
        };
        let response = match sent {
            Ok(Ok(response)) => response,
            Ok(Err(source)) => {
                self.transition(&mut phase, RequestPhase::Failed, context);
                return Err(Error::Transport {
                    kind: source.kind,
                    method,
                    url,
                    message: source.message,
                });
            }
            Err(_) => {
                self.transition(&mut phase, RequestPhase::Failed, context);
                return Err(Error::Timeout {
                    timeout_ms: timeout_value.as_millis(),
                    method,
                    url,
                });
            }
        };

        self.transition(&mut phase, RequestPhase::HeadersReceived, context);
        let sent_bytes = prepared
            .body_ref()
            .and_then(RequestBody::len)
            .unwrap_or(0) as u64;
        self.emit_progress(
            context.request_id(),
            sent_bytes,
            sent_bytes,
            ProgressPhase::HeadersReceived,
        );

        self.transition(&mut phase, RequestPhase::Loading, context);
        let status = response.status;
        let raw_body = response.body.clone();
        let descriptor = ResponseDescriptor::new(
            status,
            response.headers,
            ResponseBody::Bytes(response.body),
            Arc::clone(&prepared),
        );
        let descriptor = match self.inner.interceptors.apply_response(context, descriptor) {
            Ok(descriptor) => descriptor,
            Err(error) => {
                self.transition(&mut phase, RequestPhase::Failed, context);
                return Err(error);
            }
        };
        self.transition(&mut phase, RequestPhase::Done, context);

        if status.is_success() {
            return Ok(descriptor);
        }
        if status == http::StatusCode::UNAUTHORIZED {
            return Err(Error::AuthExpired {
                method,
                url,
                detail: format!("server answered 401: {}", truncate_body(&raw_body)),
            });
        }
        Err(Error::HttpStatus {
            status: status.as_u16(),
            method,
            url,
            body: truncate_body(&raw_body),
        })
    }

    fn transition(&self, phase: &mut RequestPhase, next: RequestPhase, context: &RequestContext) {
        debug_assert!(
            phase.can_transition_to(next),
            "invalid request phase transition {phase:?} -> {next:?}"
        );
        debug!(from = ?*phase, to = ?next, "request phase");
        *phase = next;
        if let Some(observer) = &self.inner.observer {
            observer.on_phase_change(context, next);
        }
    }

    fn emit_progress(&self, subject_id: &str, loaded: u64, total: u64, phase: ProgressPhase) {
        if let Some(progress) = &self.inner.progress {
            progress.emit(ProgressEvent::new(subject_id, loaded, total, phase));
        }
    }
}

pub struct RequestExecutorBuilder {
    transport: Arc<dyn Transport>,
    default_headers: HeaderMap,
    interceptors: InterceptorChainBuilder,
    retry_policy: RetryPolicy,
    retry_eligibility: Arc<dyn RetryEligibility>,
    credential_store: Option<Arc<dyn CredentialStore>>,
    inject_bearer_auth: bool,
    observer: Option<Arc<dyn Observer>>,
    progress: Option<ProgressReporter>,
    request_timeout: Duration,
    client_name: String,
}

impl RequestExecutorBuilder {
    fn new(transport: Arc<dyn Transport>) -> Self {
        let defaults = ClientProfile::default().defaults();
        Self {
            transport,
            default_headers: HeaderMap::new(),
            interceptors: InterceptorChain::builder(),
            retry_policy: defaults.retry_policy,
            retry_eligibility: Arc::new(StrictRetryEligibility),
            credential_store: None,
            inject_bearer_auth: true,
            observer: None,
            progress: None,
            request_timeout: defaults.request_timeout,
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
        }
    }

    pub fn profile(mut self, profile: ClientProfile) -> Self {
        let defaults = profile.defaults();
        self.request_timeout = defaults.request_timeout;
        self.retry_policy = defaults.retry_policy;
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn interceptor<I>(mut self, interceptor: I) -> Self
    where
        I: Interceptor + 'static,
    {
        self.interceptors = self.interceptors.with(interceptor);
        self
    }

    pub fn interceptor_arc(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors = self.interceptors.with_arc(interceptor);
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn retry_eligibility(mut self, retry_eligibility: Arc<dyn RetryEligibility>) -> Self {
        self.retry_eligibility = retry_eligibility;
        self
    }

    /// Retries POST and PATCH like idempotent methods.
    pub fn allow_non_idempotent_retries(mut self, allow: bool) -> Self {
        self.retry_eligibility = if allow {
            Arc::new(PermissiveRetryEligibility)
        } else {
            Arc::new(StrictRetryEligibility)
        };
        self
    }

    pub fn credential_store(mut self, credential_store: Arc<dyn CredentialStore>) -> Self {
        self.credential_store = Some(credential_store);
        self
    }

    /// When disabled, a custom interceptor is expected to place the
    /// credentials on the request.
    pub fn inject_bearer_auth(mut self, inject: bool) -> Self {
        self.inject_bearer_auth = inject;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn progress_reporter(mut self, progress: ProgressReporter) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn build(self) -> RequestExecutor {
        let mut chain = InterceptorChain::builder();
        if !self.default_headers.is_empty() {
            chain = chain.with(DefaultHeaders::new(self.default_headers));
        }
        if let Some(store) = &self.credential_store
            && self.inject_bearer_auth
        {
            chain = chain.with(BearerAuth::new(Arc::clone(store)));
        }
        chain = chain.extend(self.interceptors);

        let refresh_guard = self
            .credential_store
            .map(|store| Arc::new(CredentialRefreshGuard::new(store)));

        RequestExecutor {
            inner: Arc::new(ExecutorInner {
                transport: self.transport,
                interceptors: chain.build(),
                retry_policy: self.retry_policy,
                retry_eligibility: self.retry_eligibility,
                refresh_guard,
                observer: self.observer,
                progress: self.progress,
                request_timeout: self.request_timeout,
                client_name: self.client_name,
                metrics: ExecutorMetrics::default(),
            }),
        }
    }
}
