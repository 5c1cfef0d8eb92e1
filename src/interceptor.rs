use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderName, HeaderValue};
use thiserror::Error;
use tracing::debug;

use crate::auth::CredentialStore;
use crate::error::Error;
use crate::request::{Method, RequestBody, RequestDescriptor};
use crate::response::{ResponseBody, ResponseDescriptor};

#[derive(Clone, Debug)]
pub struct RequestContext {
    request_id: String,
    method: Method,
    url: String,
    attempt: usize,
    max_attempts: usize,
    replays: usize,
}

impl RequestContext {
    pub(crate) fn new(
        request_id: String,
        method: Method,
        url: String,
        attempt: usize,
        max_attempts: usize,
        replays: usize,
    ) -> Self {
        Self {
            request_id,
            method,
            url,
            attempt,
            max_attempts,
            replays,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Redacted target url, safe to log.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn replays(&self) -> usize {
        self.replays
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct InterceptorError {
    pub message: String,
}

impl InterceptorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A transform applied to every attempt. Each call receives its own copy of
/// the descriptor; implementations must not keep per-request state.
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn on_request(
        &self,
        _context: &RequestContext,
        request: RequestDescriptor,
    ) -> Result<RequestDescriptor, InterceptorError> {
        Ok(request)
    }

    fn on_response(
        &self,
        _context: &RequestContext,
        response: ResponseDescriptor,
    ) -> Result<ResponseDescriptor, InterceptorError> {
        Ok(response)
    }
}

/// Requests run through interceptors in registration order, responses in
/// reverse order.
#[derive(Clone)]
pub struct InterceptorChain {
    interceptors: Arc<[Arc<dyn Interceptor>]>,
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_list()
            .entries(self.interceptors.iter().map(|interceptor| interceptor.name()))
            .finish()
    }
}

impl Default for InterceptorChain {
    fn default() -> Self {
        Self {
            interceptors: Arc::from(Vec::new()),
        }
    }
}

impl InterceptorChain {
    pub fn builder() -> InterceptorChainBuilder {
        InterceptorChainBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn apply_request(
        &self,
        context: &RequestContext,
        mut request: RequestDescriptor,
    ) -> Result<RequestDescriptor, Error> {
        for interceptor in self.interceptors.iter() {
            request = interceptor
                .on_request(context, request)
                .map_err(|error| interceptor_error(interceptor.as_ref(), context, error))?;
        }
        Ok(request)
    }

    pub fn apply_response(
        &self,
        context: &RequestContext,
        mut response: ResponseDescriptor,
    ) -> Result<ResponseDescriptor, Error> {
        for interceptor in self.interceptors.iter().rev() {
            response = interceptor
                .on_response(context, response)
                .map_err(|error| interceptor_error(interceptor.as_ref(), context, error))?;
        }
        Ok(response)
    }
}

fn interceptor_error(
    interceptor: &dyn Interceptor,
    context: &RequestContext,
    error: InterceptorError,
) -> Error {
    Error::Interceptor {
        interceptor: interceptor.name().to_owned(),
        method: context.method(),
        url: context.url().to_owned(),
        message: error.message,
    }
}

#[derive(Default)]
pub struct InterceptorChainBuilder {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChainBuilder {
    pub fn with<I>(self, interceptor: I) -> Self
    where
        I: Interceptor + 'static,
    {
        self.with_arc(Arc::new(interceptor))
    }

    pub fn with_arc(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn extend(mut self, other: InterceptorChainBuilder) -> Self {
        self.interceptors.extend(other.interceptors);
        self
    }

    pub fn build(self) -> InterceptorChain {
        InterceptorChain {
            interceptors: Arc::from(self.interceptors),
        }
    }
}

/// Inserts headers the request does not already carry.
#[derive(Clone, Debug, Default)]
pub struct DefaultHeaders {
    headers: HeaderMap,
}

impl DefaultHeaders {
    pub fn new(headers: HeaderMap) -> Self {
        Self { headers }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

impl Interceptor for DefaultHeaders {
    fn name(&self) -> &str {
        "default_headers"
    }

    fn on_request(
        &self,
        _context: &RequestContext,
        mut request: RequestDescriptor,
    ) -> Result<RequestDescriptor, InterceptorError> {
        for (name, value) in &self.headers {
            if !request.headers().contains_key(name) {
                request.headers_mut().insert(name.clone(), value.clone());
            }
        }
        Ok(request)
    }
}

/// Sets `authorization: Bearer <token>` from the store's current
/// credentials. Never triggers a refresh.
pub struct BearerAuth {
    store: Arc<dyn CredentialStore>,
}

impl BearerAuth {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }
}

impl Interceptor for BearerAuth {
    fn name(&self) -> &str {
        "bearer_auth"
    }

    fn on_request(
        &self,
        _context: &RequestContext,
        mut request: RequestDescriptor,
    ) -> Result<RequestDescriptor, InterceptorError> {
        let Some(credentials) = self.store.current() else {
            return Ok(request);
        };
        let mut value = HeaderValue::from_str(&format!("Bearer {}", credentials.access_token))
            .map_err(|_| InterceptorError::new("access token is not a valid header value"))?;
        value.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, value);
        Ok(request)
    }
}

/// The token carried by an `authorization: Bearer <token>` header.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_owned())
}

/// Encodes JSON request bodies and decodes JSON success responses.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

fn is_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            let essence = value.split(';').next().unwrap_or_default().trim();
            essence.eq_ignore_ascii_case("application/json") || essence.ends_with("+json")
        })
}

impl Interceptor for JsonCodec {
    fn name(&self) -> &str {
        "json_codec"
    }

    fn on_request(
        &self,
        _context: &RequestContext,
        mut request: RequestDescriptor,
    ) -> Result<RequestDescriptor, InterceptorError> {
        if let Some(RequestBody::Json(value)) = request.body_ref() {
            let encoded = serde_json::to_vec(value)
                .map_err(|source| InterceptorError::new(format!("encode json body: {source}")))?;
            request.set_body(Some(RequestBody::Bytes(Bytes::from(encoded))));
            if !request.headers().contains_key(CONTENT_TYPE) {
                request
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
        }
        if !request.headers().contains_key(ACCEPT) {
            request
                .headers_mut()
                .insert(ACCEPT, HeaderValue::from_static("application/json"));
        }
        Ok(request)
    }

    fn on_response(
        &self,
        _context: &RequestContext,
        mut response: ResponseDescriptor,
    ) -> Result<ResponseDescriptor, InterceptorError> {
        if !response.status().is_success() || !is_json_content_type(response.headers()) {
            return Ok(response);
        }
        let ResponseBody::Bytes(bytes) = response.body() else {
            return Ok(response);
        };
        if bytes.is_empty() {
            return Ok(response);
        }
        let value = serde_json::from_slice(bytes)
            .map_err(|source| InterceptorError::new(format!("decode json response: {source}")))?;
        response.set_body(ResponseBody::Json(value));
        Ok(response)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Logging;

impl Interceptor for Logging {
    fn name(&self) -> &str {
        "logging"
    }

    fn on_request(
        &self,
        context: &RequestContext,
        request: RequestDescriptor,
    ) -> Result<RequestDescriptor, InterceptorError> {
        debug!(
            request_id = context.request_id(),
            method = %context.method(),
            url = context.url(),
            attempt = context.attempt(),
            body_bytes = request.body_ref().and_then(RequestBody::len),
            "outbound request"
        );
        Ok(request)
    }

    fn on_response(
        &self,
        context: &RequestContext,
        response: ResponseDescriptor,
    ) -> Result<ResponseDescriptor, InterceptorError> {
        debug!(
            request_id = context.request_id(),
            method = %context.method(),
            url = context.url(),
            status = response.status().as_u16(),
            "inbound response"
        );
        Ok(response)
    }
}
