use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use http::StatusCode;
use http::header::AUTHORIZATION;
use reqx_resume::prelude::*;
use reqx_resume::{
    Interceptor, InterceptorError, Observer, RefreshError, RequestContext, RequestPhase,
    TransportErrorKind,
};
use tokio_util::sync::CancellationToken;

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Clone, Debug)]
enum Step {
    Respond(u16, &'static str),
    Fail(TransportErrorKind),
    Hang,
}

#[derive(Clone, Debug)]
struct SeenRequest {
    method: Method,
    authorization: Option<String>,
    attempt: usize,
}

type Responder = Box<dyn Fn(&RequestDescriptor) -> Step + Send + Sync>;

struct MockTransport {
    script: Mutex<VecDeque<Step>>,
    responder: Option<Responder>,
    seen: Mutex<Vec<SeenRequest>>,
}

impl MockTransport {
    fn scripted(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into_iter().collect()),
            responder: None,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn responding<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&RequestDescriptor) -> Step + Send + Sync + 'static,
    {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            responder: Some(Box::new(responder)),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<SeenRequest> {
        lock_unpoisoned(&self.seen).clone()
    }

    fn calls(&self) -> usize {
        lock_unpoisoned(&self.seen).len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        request: &RequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse, TransportError> {
        lock_unpoisoned(&self.seen).push(SeenRequest {
            method: request.method(),
            authorization: request
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned),
            attempt: request.attempt(),
        });
        let step = match &self.responder {
            Some(responder) => responder(request),
            None => lock_unpoisoned(&self.script)
                .pop_front()
                .unwrap_or(Step::Respond(200, "{}")),
        };
        match step {
            Step::Respond(status, body) => Ok(TransportResponse::new(
                StatusCode::from_u16(status).expect("valid status"),
                body,
            )),
            Step::Fail(kind) => Err(TransportError::new(kind, "scripted transport failure")),
            Step::Hang => {
                cancel.cancelled().await;
                Err(TransportError::new(TransportErrorKind::Other, "hung up"))
            }
        }
    }
}

struct RotatingStore {
    credentials: Mutex<Credentials>,
    refreshes: AtomicUsize,
    fail: bool,
    delay: Duration,
}

impl RotatingStore {
    fn new(token: &str) -> Arc<Self> {
        Self::build(token, false, Duration::ZERO)
    }

    fn build(token: &str, fail: bool, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            credentials: Mutex::new(Credentials::new(token).with_refresh_token("refresh-1")),
            refreshes: AtomicUsize::new(0),
            fail,
            delay,
        })
    }

    fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialStore for RotatingStore {
    fn current(&self) -> Option<Credentials> {
        Some(lock_unpoisoned(&self.credentials).clone())
    }

    async fn refresh(&self, expired: Credentials) -> Result<Credentials, RefreshError> {
        let generation = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(RefreshError::new("refresh token revoked"));
        }
        assert_eq!(expired.refresh_token.as_deref(), Some("refresh-1"));
        Ok(Credentials::new(format!("token-{}", generation + 1)).with_refresh_token("refresh-1"))
    }

    fn replace(&self, credentials: Credentials) {
        *lock_unpoisoned(&self.credentials) = credentials;
    }
}

#[derive(Default)]
struct RecordingObserver {
    phases: Mutex<Vec<RequestPhase>>,
    retries: AtomicUsize,
    replays: AtomicUsize,
    completed: AtomicUsize,
}

impl Observer for RecordingObserver {
    fn on_phase_change(&self, _context: &RequestContext, phase: RequestPhase) {
        lock_unpoisoned(&self.phases).push(phase);
    }

    fn on_retry_scheduled(&self, _context: &RequestContext, _error: &Error, _delay: Duration) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    fn on_replay(&self, _context: &RequestContext) {
        self.replays.fetch_add(1, Ordering::SeqCst);
    }

    fn on_request_complete(&self, _context: &RequestContext, _outcome: &Outcome) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

fn fast_retries() -> RetryPolicy {
    RetryPolicy::standard()
        .base_delay(Duration::from_millis(10))
        .max_delay(Duration::from_millis(100))
        .jitter_ratio(0.0)
}

const ITEMS_URL: &str = "https://api.example.com/v1/items";

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn server_errors_are_retried_until_success() {
    let transport = MockTransport::scripted([
        Step::Respond(503, "busy"),
        Step::Respond(503, "busy"),
        Step::Respond(200, "{\"id\":\"item-1\"}"),
    ]);
    let observer = Arc::new(RecordingObserver::default());
    let executor = RequestExecutor::builder_arc(transport.clone())
        .retry_policy(fast_retries())
        .observer(observer.clone())
        .build();

    let started = tokio::time::Instant::now();
    let outcome = executor
        .execute(
            RequestDescriptor::get(ITEMS_URL).expect("request should build"),
            &CancellationToken::new(),
        )
        .await;

    let response = outcome.into_result().expect("third attempt should succeed");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.request().attempt(), 3);
    assert_eq!(transport.calls(), 3);
    let attempts: Vec<usize> = transport.seen().iter().map(|seen| seen.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    // linear backoff: 10ms then 20ms
    assert!(started.elapsed() >= Duration::from_millis(30));

    assert_eq!(observer.retries.load(Ordering::SeqCst), 2);
    assert_eq!(observer.completed.load(Ordering::SeqCst), 1);
    let metrics = executor.metrics_snapshot();
    assert_eq!(metrics.requests_succeeded, 1);
    assert_eq!(metrics.retries, 2);
    assert_eq!(metrics.in_flight, 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn exhausted_retries_surface_last_status() {
    let transport = MockTransport::scripted([
        Step::Respond(500, "boom-1"),
        Step::Respond(502, "boom-2"),
        Step::Respond(503, "boom-3"),
        Step::Respond(200, "never reached"),
    ]);
    let executor = RequestExecutor::builder_arc(transport.clone())
        .retry_policy(fast_retries())
        .build();

    let failure = executor
        .execute(
            RequestDescriptor::get(ITEMS_URL).expect("request should build"),
            &CancellationToken::new(),
        )
        .await
        .into_result()
        .expect_err("all attempts fail");

    assert_eq!(failure.attempts(), 3);
    assert_eq!(failure.status(), Some(503));
    match failure.error() {
        Error::HttpStatus { status, body, .. } => {
            assert_eq!(*status, 503);
            assert_eq!(body, "boom-3");
        }
        other => panic!("unexpected error variant: {other}"),
    }
    assert_eq!(transport.calls(), 3);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn client_errors_are_not_retried() {
    let transport = MockTransport::scripted([Step::Respond(404, "missing")]);
    let observer = Arc::new(RecordingObserver::default());
    let executor = RequestExecutor::builder_arc(transport.clone())
        .retry_policy(fast_retries())
        .observer(observer.clone())
        .build();

    let failure = executor
        .execute(
            RequestDescriptor::get(ITEMS_URL).expect("request should build"),
            &CancellationToken::new(),
        )
        .await
        .into_result()
        .expect_err("404 is terminal");

    assert_eq!(failure.kind(), ErrorKind::HttpStatus);
    assert_eq!(failure.attempts(), 1);
    assert_eq!(transport.calls(), 1);
    assert_eq!(
        *lock_unpoisoned(&observer.phases),
        vec![
            RequestPhase::Sent,
            RequestPhase::HeadersReceived,
            RequestPhase::Loading,
            RequestPhase::Done,
        ]
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn transport_errors_are_retried() {
    let transport = MockTransport::scripted([
        Step::Fail(TransportErrorKind::Connect),
        Step::Respond(200, "ok"),
    ]);
    let executor = RequestExecutor::builder_arc(transport.clone())
        .retry_policy(fast_retries())
        .build();

    let outcome = executor
        .execute(
            RequestDescriptor::delete(ITEMS_URL).expect("request should build"),
            &CancellationToken::new(),
        )
        .await;

    assert!(outcome.is_success());
    assert_eq!(transport.calls(), 2);
    assert_eq!(executor.metrics_snapshot().transport_errors, 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn post_without_idempotency_key_is_attempted_once() {
    let transport = MockTransport::scripted([Step::Respond(503, "busy")]);
    let executor = RequestExecutor::builder_arc(transport.clone())
        .retry_policy(fast_retries())
        .build();

    let failure = executor
        .execute(
            RequestDescriptor::post(ITEMS_URL).expect("request should build"),
            &CancellationToken::new(),
        )
        .await
        .into_result()
        .expect_err("single attempt fails");
    assert_eq!(failure.attempts(), 1);
    assert_eq!(transport.calls(), 1);

    let keyed = MockTransport::scripted([Step::Respond(503, "busy"), Step::Respond(201, "{}")]);
    let executor = RequestExecutor::builder_arc(keyed.clone())
        .retry_policy(fast_retries())
        .build();
    let outcome = executor
        .execute(
            RequestDescriptor::post(ITEMS_URL)
                .expect("request should build")
                .idempotency_key("create-1")
                .expect("key should parse"),
            &CancellationToken::new(),
        )
        .await;
    assert!(outcome.is_success());
    assert_eq!(keyed.calls(), 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn expired_credentials_refresh_once_and_replay_post() {
    let transport = MockTransport::scripted([
        Step::Respond(401, "token expired"),
        Step::Respond(201, "{\"id\":\"item-7\"}"),
    ]);
    let store = RotatingStore::new("token-1");
    let observer = Arc::new(RecordingObserver::default());
    let executor = RequestExecutor::builder_arc(transport.clone())
        .retry_policy(fast_retries())
        .credential_store(store.clone())
        .observer(observer.clone())
        .build();

    let response = executor
        .execute(
            RequestDescriptor::post(ITEMS_URL)
                .expect("request should build")
                .body("{\"name\":\"demo\"}"),
            &CancellationToken::new(),
        )
        .await
        .into_result()
        .expect("replay should succeed");

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.request().attempt(), 1);
    let seen = transport.seen();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|request| request.method == Method::Post));
    assert_eq!(seen[0].authorization.as_deref(), Some("Bearer token-1"));
    assert_eq!(seen[1].authorization.as_deref(), Some("Bearer token-2"));
    assert_eq!(store.refreshes(), 1);
    assert_eq!(observer.replays.load(Ordering::SeqCst), 1);

    let metrics = executor.metrics_snapshot();
    assert_eq!(metrics.replays, 1);
    assert_eq!(metrics.refreshes, 1);
    assert_eq!(metrics.retries, 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn second_unauthorized_after_replay_is_terminal() {
    let transport = MockTransport::scripted([
        Step::Respond(401, "expired"),
        Step::Respond(401, "still expired"),
        Step::Respond(200, "never reached"),
    ]);
    let store = RotatingStore::new("token-1");
    let executor = RequestExecutor::builder_arc(transport.clone())
        .retry_policy(fast_retries())
        .credential_store(store.clone())
        .build();

    let failure = executor
        .execute(
            RequestDescriptor::get(ITEMS_URL).expect("request should build"),
            &CancellationToken::new(),
        )
        .await
        .into_result()
        .expect_err("second 401 ends the call");

    assert_eq!(failure.kind(), ErrorKind::AuthExpired);
    assert_eq!(failure.replays(), 1);
    assert_eq!(failure.attempts(), 1);
    assert_eq!(transport.calls(), 2);
    assert_eq!(store.refreshes(), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn failed_refresh_reports_auth_expired_without_retry() {
    let transport = MockTransport::scripted([Step::Respond(401, "expired")]);
    let store = RotatingStore::build("token-1", true, Duration::ZERO);
    let executor = RequestExecutor::builder_arc(transport.clone())
        .retry_policy(fast_retries())
        .credential_store(store.clone())
        .build();

    let failure = executor
        .execute(
            RequestDescriptor::get(ITEMS_URL).expect("request should build"),
            &CancellationToken::new(),
        )
        .await
        .into_result()
        .expect_err("refresh failure is terminal");

    match failure.error() {
        Error::AuthExpired { detail, .. } => {
            assert!(detail.contains("refresh token revoked"), "{detail}");
        }
        other => panic!("unexpected error variant: {other}"),
    }
    assert_eq!(transport.calls(), 1);
    assert_eq!(failure.replays(), 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn concurrent_unauthorized_requests_share_one_refresh() {
    let transport = MockTransport::responding(|request| {
        let authorization = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        if authorization == Some("Bearer token-2") {
            Step::Respond(200, "{}")
        } else {
            Step::Respond(401, "expired")
        }
    });
    let store = RotatingStore::build("token-1", false, Duration::from_millis(50));
    let executor = RequestExecutor::builder_arc(transport.clone())
        .retry_policy(fast_retries())
        .credential_store(store.clone())
        .build();
    let cancel = CancellationToken::new();

    let outcomes = join_all((0..5).map(|_| {
        let executor = executor.clone();
        let cancel = cancel.clone();
        async move {
            executor
                .execute(
                    RequestDescriptor::get(ITEMS_URL).expect("request should build"),
                    &cancel,
                )
                .await
        }
    }))
    .await;

    assert!(outcomes.iter().all(Outcome::is_success));
    assert_eq!(store.refreshes(), 1);
    assert_eq!(transport.calls(), 10);
    assert_eq!(executor.metrics_snapshot().replays, 5);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn slow_transport_times_out() {
    let transport = MockTransport::scripted([Step::Hang]);
    let executor = RequestExecutor::builder_arc(transport.clone())
        .retry_policy(RetryPolicy::disabled())
        .request_timeout(Duration::from_millis(200))
        .build();

    let failure = executor
        .execute(
            RequestDescriptor::get(ITEMS_URL).expect("request should build"),
            &CancellationToken::new(),
        )
        .await
        .into_result()
        .expect_err("hung transport should time out");

    match failure.error() {
        Error::Timeout { timeout_ms, .. } => assert_eq!(*timeout_ms, 200),
        other => panic!("unexpected error variant: {other}"),
    }
    assert_eq!(executor.metrics_snapshot().timeouts, 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn per_request_timeout_overrides_default() {
    let transport = MockTransport::scripted([Step::Hang, Step::Respond(200, "ok")]);
    let executor = RequestExecutor::builder_arc(transport.clone())
        .retry_policy(fast_retries())
        .request_timeout(Duration::from_secs(30))
        .build();

    let started = tokio::time::Instant::now();
    let outcome = executor
        .execute(
            RequestDescriptor::get(ITEMS_URL)
                .expect("request should build")
                .timeout(Duration::from_millis(50)),
            &CancellationToken::new(),
        )
        .await;

    assert!(outcome.is_success());
    assert_eq!(transport.calls(), 2);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn cancellation_interrupts_in_flight_send() {
    let transport = MockTransport::scripted([Step::Hang]);
    let executor = RequestExecutor::builder_arc(transport.clone())
        .retry_policy(fast_retries())
        .build();
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let failure = executor
        .execute(
            RequestDescriptor::get(ITEMS_URL).expect("request should build"),
            &cancel,
        )
        .await
        .into_result()
        .expect_err("cancelled call fails");

    assert_eq!(failure.kind(), ErrorKind::Cancelled);
    assert_eq!(transport.calls(), 1);
    assert_eq!(executor.metrics_snapshot().cancelled, 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn cancellation_skips_pending_backoff() {
    let transport = MockTransport::scripted([Step::Respond(503, "busy")]);
    let executor = RequestExecutor::builder_arc(transport.clone())
        .retry_policy(
            RetryPolicy::standard()
                .base_delay(Duration::from_secs(10))
                .jitter_ratio(0.0),
        )
        .build();
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        canceller.cancel();
    });

    let started = tokio::time::Instant::now();
    let failure = executor
        .execute(
            RequestDescriptor::get(ITEMS_URL).expect("request should build"),
            &cancel,
        )
        .await
        .into_result()
        .expect_err("cancelled during backoff");

    assert_eq!(failure.kind(), ErrorKind::Cancelled);
    assert_eq!(transport.calls(), 1);
    assert!(started.elapsed() < Duration::from_secs(10));
}

struct RequireTenant;

impl Interceptor for RequireTenant {
    fn name(&self) -> &str {
        "require_tenant"
    }

    fn on_request(
        &self,
        _context: &RequestContext,
        request: RequestDescriptor,
    ) -> Result<RequestDescriptor, InterceptorError> {
        if request.headers().contains_key("x-tenant") {
            Ok(request)
        } else {
            Err(InterceptorError::new("x-tenant header is required"))
        }
    }
}

#[tokio::test(flavor = "current_thread")]
async fn interceptor_failure_never_reaches_transport() {
    let transport = MockTransport::scripted([Step::Respond(200, "ok")]);
    let executor = RequestExecutor::builder_arc(transport.clone())
        .retry_policy(fast_retries())
        .interceptor(RequireTenant)
        .build();

    let failure = executor
        .execute(
            RequestDescriptor::get(ITEMS_URL).expect("request should build"),
            &CancellationToken::new(),
        )
        .await
        .into_result()
        .expect_err("interceptor should reject");

    match failure.error() {
        Error::Interceptor {
            interceptor,
            message,
            ..
        } => {
            assert_eq!(interceptor, "require_tenant");
            assert_eq!(message, "x-tenant header is required");
        }
        other => panic!("unexpected error variant: {other}"),
    }
    assert_eq!(transport.calls(), 0);

    let outcome = executor
        .execute(
            RequestDescriptor::get(ITEMS_URL)
                .expect("request should build")
                .try_header("x-tenant", "acme")
                .expect("header should parse"),
            &CancellationToken::new(),
        )
        .await;
    assert!(outcome.is_success());
}

#[tokio::test(flavor = "current_thread")]
async fn execute_json_decodes_success_body() {
    #[derive(Debug, serde::Deserialize)]
    struct Item {
        id: String,
    }

    let transport = MockTransport::scripted([Step::Respond(200, "{\"id\":\"item-9\"}")]);
    let executor = RequestExecutor::builder_arc(transport.clone())
        .interceptor(JsonCodec)
        .try_default_header("x-client", "integration-test")
        .expect("default header should parse")
        .build();

    let item: Item = executor
        .execute_json(
            RequestDescriptor::get(ITEMS_URL).expect("request should build"),
            &CancellationToken::new(),
        )
        .await
        .expect("body should decode");
    assert_eq!(item.id, "item-9");
}

#[tokio::test(flavor = "current_thread")]
async fn request_progress_completes_with_full_body() {
    let transport = MockTransport::scripted([Step::Respond(200, "ok")]);
    let progress = ProgressReporter::new();
    let (_subscription, mut events) = progress.subscribe_channel();
    let executor = RequestExecutor::builder_arc(transport.clone())
        .progress_reporter(progress)
        .build();

    let request = RequestDescriptor::put(ITEMS_URL)
        .expect("request should build")
        .body(vec![7_u8; 64]);
    let subject = request.id().to_owned();
    let outcome = executor.execute(request, &CancellationToken::new()).await;
    assert!(outcome.is_success());

    let delivered: Vec<ProgressEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert!(delivered.iter().all(|event| event.subject_id == subject));
    let phases: Vec<ProgressPhase> = delivered.iter().map(|event| event.phase).collect();
    assert_eq!(
        phases,
        vec![
            ProgressPhase::Started,
            ProgressPhase::HeadersReceived,
            ProgressPhase::Completed,
        ]
    );
    let last = delivered.last().expect("completed event");
    assert_eq!((last.loaded, last.total), (64, 64));
}

/// Authorizes the first attempt from a stale cached token and later
/// attempts from the store.
struct StaleFirstAuth {
    store: Arc<RotatingStore>,
}

impl Interceptor for StaleFirstAuth {
    fn name(&self) -> &str {
        "stale_first_auth"
    }

    fn on_request(
        &self,
        context: &RequestContext,
        mut request: RequestDescriptor,
    ) -> Result<RequestDescriptor, InterceptorError> {
        let token = if context.replays() == 0 {
            "token-0".to_owned()
        } else {
            self.store
                .current()
                .map(|credentials| credentials.access_token)
                .unwrap_or_default()
        };
        let value = http::HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| InterceptorError::new("token is not a valid header value"))?;
        request.headers_mut().insert(AUTHORIZATION, value);
        Ok(request)
    }
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn unauthorized_stale_token_replays_with_current_token_without_refresh() {
    let transport = MockTransport::responding(|request| {
        let authorized = request
            .headers()
            .get(AUTHORIZATION)
            .is_some_and(|value| value == "Bearer token-1");
        if authorized {
            Step::Respond(200, "{}")
        } else {
            Step::Respond(401, "token expired")
        }
    });
    let store = RotatingStore::new("token-1");
    let executor = RequestExecutor::builder_arc(transport.clone())
        .retry_policy(fast_retries())
        .credential_store(store.clone())
        .inject_bearer_auth(false)
        .interceptor(StaleFirstAuth {
            store: store.clone(),
        })
        .build();

    let outcome = executor
        .execute(
            RequestDescriptor::get(ITEMS_URL).expect("request should build"),
            &CancellationToken::new(),
        )
        .await;

    assert!(outcome.is_success());
    let seen = transport.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].authorization.as_deref(), Some("Bearer token-0"));
    assert_eq!(seen[1].authorization.as_deref(), Some("Bearer token-1"));
    assert_eq!(store.refreshes(), 0);
}

#[tokio::test(flavor = "current_thread")]
async fn request_progress_ends_with_failed_phase() {
    let transport = MockTransport::scripted([Step::Respond(404, "missing")]);
    let progress = ProgressReporter::new();
    let (_subscription, mut events) = progress.subscribe_channel();
    let executor = RequestExecutor::builder_arc(transport.clone())
        .progress_reporter(progress.clone())
        .build();

    let request = RequestDescriptor::put(ITEMS_URL)
        .expect("request should build")
        .body(vec![7_u8; 16]);
    let subject = request.id().to_owned();
    let outcome = executor.execute(request, &CancellationToken::new()).await;
    assert!(!outcome.is_success());

    let phases: Vec<ProgressPhase> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|event| event.phase)
        .collect();
    assert_eq!(
        phases,
        vec![
            ProgressPhase::Started,
            ProgressPhase::HeadersReceived,
            ProgressPhase::Failed,
        ]
    );
    assert!(progress.emit(ProgressEvent::new(subject, 0, 16, ProgressPhase::Started)));
    assert_eq!(events.try_recv().map(|event| event.loaded).ok(), Some(0));
}
