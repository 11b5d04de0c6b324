//! Delivery of request payloads to the completion endpoint.
//!
//! The [`Transport`] trait is the seam between the session and the network: it sends one
//! serialized payload and hands back the raw status, headers and body.  [`TransportClient`]
//! wraps a transport with per-attempt timeouts, response decoding and the retry loop.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client as ReqwestClient, Response};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::decoder::decode;
use crate::error::{Error, Result};
use crate::observability::{
    CLIENT_ATTEMPTS, CLIENT_FATAL_FAILURES, CLIENT_RATE_LIMITED, CLIENT_REQUEST_DURATION,
    CLIENT_REQUEST_RETRIES, CLIENT_REQUESTS, CLIENT_RETRY_BACKOFF, CLIENT_TRANSIENT_FAILURES,
};
use crate::types::{ReplyResult, RequestPayload};

/// The default completion endpoint base.
pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1/";
/// How long one attempt may take before it is abandoned.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of a raw response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawBody {
    /// The body was read in one piece.
    Complete(Bytes),
    /// The body was read as a sequence of chunks, in arrival order.
    Streamed(Vec<Bytes>),
}

/// What came back from one attempt, before any interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// HTTP status code.
    pub status: u16,
    /// The server's `retry-after` hint.
    pub retry_after: Option<Duration>,
    /// The server's request identifier.
    pub request_id: Option<String>,
    /// The response body.
    pub body: RawBody,
}

impl RawResponse {
    /// A response with a complete body.
    pub fn json(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            retry_after: None,
            request_id: None,
            body: RawBody::Complete(body.into()),
        }
    }

    /// A response whose body arrived in chunks.
    pub fn streamed(status: u16, chunks: Vec<Bytes>) -> Self {
        Self {
            status,
            retry_after: None,
            request_id: None,
            body: RawBody::Streamed(chunks),
        }
    }

    /// Attach a `retry-after` hint.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Attach a request identifier.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Sends one serialized payload to the completion endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute a single attempt.
    ///
    /// `stream` says whether the payload asked for a streamed reply.  Errors are reserved for
    /// failures below HTTP (connect, TLS, timeouts); any HTTP status is a [`RawResponse`].
    async fn execute(&self, body: Bytes, stream: bool) -> Result<RawResponse>;
}

/// HTTP transport for the chat completions endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    api_key: String,
    client: ReqwestClient,
    base_url: String,
}

impl HttpTransport {
    /// Create a transport for the default endpoint.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Self::with_options(api_key, None)
    }

    /// Create a transport with a custom base URL.
    pub fn with_options(api_key: impl Into<String>, base_url: Option<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(Error::authentication("API key is empty"));
        }
        HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|_| {
            Error::authentication("API key contains characters not allowed in a header")
        })?;
        let client = ReqwestClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| {
                Error::http_client(
                    format!("Failed to build HTTP client: {e}"),
                    Some(Box::new(e)),
                )
            })?;
        let mut base_url = base_url.unwrap_or_else(|| DEFAULT_API_URL.to_string());
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Ok(Self {
            api_key,
            client,
            base_url,
        })
    }

    /// The endpoint base, always ending in `/`.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn headers(&self, stream: bool) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static(if stream {
                "text/event-stream"
            } else {
                "application/json"
            }),
        );
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key)).map_err(|_| {
            Error::authentication("API key contains characters not allowed in a header")
        })?;
        headers.insert(header::AUTHORIZATION, bearer);
        Ok(headers)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, body: Bytes, stream: bool) -> Result<RawResponse> {
        let url = format!("{}chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .headers(self.headers(stream)?)
            .body(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let request_id = header_str(&response, "x-request-id");
        let retry_after = header_str(&response, "retry-after-ms")
            .and_then(|ms| parse_retry_after(&ms).map(|d| d / 1000))
            .or_else(|| header_str(&response, "retry-after").and_then(|s| parse_retry_after(&s)));

        let body = if stream && status.is_success() {
            let mut chunks = Vec::new();
            let mut byte_stream = response.bytes_stream();
            while let Some(chunk) = byte_stream.next().await {
                chunks.push(chunk.map_err(map_reqwest_error)?);
            }
            RawBody::Streamed(chunks)
        } else {
            RawBody::Complete(response.bytes().await.map_err(map_reqwest_error)?)
        };
        Ok(RawResponse {
            status: status.as_u16(),
            retry_after,
            request_id,
            body,
        })
    }
}

fn header_str(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|val| val.to_str().ok())
        .map(String::from)
}

fn map_reqwest_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::timeout(format!("Request timed out: {e}"), None)
    } else if e.is_connect() || e.is_request() || e.is_body() {
        Error::connection(format!("Connection error: {e}"), Some(Box::new(e)))
    } else {
        Error::http_client(format!("Request failed: {e}"), Some(Box::new(e)))
    }
}

/// Parse a `retry-after` value given in (possibly fractional) seconds.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs = value.trim().parse::<f64>().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.  Zero sends exactly once.
    pub max_retries: u32,
    /// Wait before the first retry, doubled for each one after.
    pub base_delay: Duration,
    /// Ceiling on any single wait, server hints included.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Create a retry policy.
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// The wait before retry number `retry` (zero-based).
    ///
    /// The wait is `base * 2^retry` plus jitter of up to half that amount, raised to the server's
    /// hint when one is given, and capped at `max_delay`.  `jitter_unit` is a sample from
    /// `[0, 1)`.  Below the cap the waits strictly increase whatever the jitter.
    pub fn delay_for(&self, retry: u32, jitter_unit: f64, hint: Option<Duration>) -> Duration {
        let exponential = self.base_delay.saturating_mul(2u32.saturating_pow(retry));
        let jitter = exponential.mul_f64(jitter_unit.clamp(0.0, 0.999_999) / 2.0);
        let computed = exponential.saturating_add(jitter);
        let wanted = match hint {
            Some(hint) => computed.max(hint),
            None => computed,
        };
        wanted.min(self.max_delay)
    }
}

fn jitter_unit() -> f64 {
    rand::random::<f64>()
}

fn describe(result: &ReplyResult) -> String {
    match result {
        ReplyResult::Success(_) => "success".to_string(),
        ReplyResult::RateLimited(hint) => format!("rate limited: {}", hint.message),
        ReplyResult::TransientFailure(err) | ReplyResult::FatalFailure(err) => err.to_string(),
    }
}

/// A transport with retries, timeouts and decoding.
#[derive(Debug, Clone)]
pub struct TransportClient<T: Transport> {
    transport: T,
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl<T: Transport> TransportClient<T> {
    /// Wrap a transport using the default retry policy and attempt timeout.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            policy: RetryPolicy::default(),
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the per-attempt timeout.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// The retry policy in force.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    /// The per-attempt timeout in force.
    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// The wrapped transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Deliver a payload, retrying transient failures.
    ///
    /// The payload is serialized once and the same bytes are sent on every attempt.  Fatal
    /// outcomes return after the attempt that produced them.  A rate limit that outlasts the
    /// retry budget is reported as a transient failure.
    pub async fn send(&self, payload: &RequestPayload) -> ReplyResult {
        CLIENT_REQUESTS.click();
        let started = Instant::now();
        let body = match payload.to_bytes() {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) => {
                CLIENT_FATAL_FAILURES.click();
                error!(error = %err, "could not serialize request");
                return ReplyResult::FatalFailure(err);
            }
        };
        let stream = payload.stream();

        let mut retry = 0;
        let result = loop {
            CLIENT_ATTEMPTS.click();
            debug!(
                attempt = retry + 1,
                stream,
                bytes = body.len(),
                "sending completion request"
            );
            let result = self.attempt(body.clone(), stream).await;
            if !result.is_retryable() || retry >= self.policy.max_retries {
                break result;
            }
            let hint = match &result {
                ReplyResult::RateLimited(hint) => {
                    CLIENT_RATE_LIMITED.click();
                    hint.retry_after
                }
                _ => None,
            };
            let delay = self.policy.delay_for(retry, jitter_unit(), hint);
            warn!(
                attempt = retry + 1,
                delay_ms = delay.as_millis() as u64,
                reason = %describe(&result),
                "retrying completion request"
            );
            CLIENT_REQUEST_RETRIES.click();
            CLIENT_RETRY_BACKOFF.add(delay.as_secs_f64());
            tokio::time::sleep(delay).await;
            retry += 1;
        };
        CLIENT_REQUEST_DURATION.add(started.elapsed().as_secs_f64());

        match result {
            ReplyResult::RateLimited(hint) => {
                CLIENT_TRANSIENT_FAILURES.click();
                let err = hint.into_error();
                error!(attempts = retry + 1, error = %err, "completion request failed");
                ReplyResult::TransientFailure(err)
            }
            ReplyResult::TransientFailure(err) => {
                CLIENT_TRANSIENT_FAILURES.click();
                error!(attempts = retry + 1, error = %err, "completion request failed");
                ReplyResult::TransientFailure(err)
            }
            ReplyResult::FatalFailure(err) => {
                CLIENT_FATAL_FAILURES.click();
                error!(attempts = retry + 1, error = %err, "completion request failed");
                ReplyResult::FatalFailure(err)
            }
            success => success,
        }
    }

    async fn attempt(&self, body: Bytes, stream: bool) -> ReplyResult {
        match tokio::time::timeout(self.attempt_timeout, self.transport.execute(body, stream)).await
        {
            Err(_) => ReplyResult::TransientFailure(Error::timeout(
                format!(
                    "no response within {:.1} seconds",
                    self.attempt_timeout.as_secs_f64()
                ),
                Some(self.attempt_timeout.as_secs_f64()),
            )),
            Ok(Err(err)) => ReplyResult::from_error(err),
            Ok(Ok(raw)) => decode(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Turn;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeTransport {
        responses: Arc<Mutex<VecDeque<Result<RawResponse>>>>,
        calls: Arc<Mutex<Vec<(Instant, Bytes)>>>,
        stall: Option<Duration>,
    }

    impl FakeTransport {
        fn with(responses: Vec<Result<RawResponse>>) -> Self {
            Self {
                responses: Arc::new(Mutex::new(responses.into())),
                ..Self::default()
            }
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().iter().map(|(t, _)| *t).collect()
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn execute(&self, body: Bytes, _stream: bool) -> Result<RawResponse> {
            self.calls.lock().unwrap().push((Instant::now(), body));
            if let Some(stall) = self.stall {
                tokio::time::sleep(stall).await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(RawResponse::json(500, "")))
        }
    }

    fn ok_body(text: &str) -> RawResponse {
        RawResponse::json(
            200,
            serde_json::json!({
                "choices": [{"index": 0, "message": {"role": "assistant", "content": text}}]
            })
            .to_string(),
        )
    }

    fn payload() -> RequestPayload {
        RequestPayload::new(
            "gpt-4",
            vec![Turn::user("hello")],
            Some(0.2),
            None,
            None,
            false,
        )
    }

    fn gaps(times: &[Instant]) -> Vec<Duration> {
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }

    #[test]
    fn delay_doubles_without_jitter() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0, 0.0, None), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1, 0.0, None), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2, 0.0, None), Duration::from_millis(2000));
    }

    #[test]
    fn delay_strictly_increases_under_any_jitter() {
        let policy = RetryPolicy::default();
        for retry in 0..5 {
            let worst_now = policy.delay_for(retry, 0.999_999_9, None);
            let best_next = policy.delay_for(retry + 1, 0.0, None);
            assert!(worst_now < best_next, "retry {retry}");
        }
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(20, 0.5, None), Duration::from_secs(30));
        assert_eq!(policy.delay_for(u32::MAX, 0.5, None), Duration::from_secs(30));
    }

    #[test]
    fn delay_honours_hint_up_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for(0, 0.0, Some(Duration::from_secs(4))),
            Duration::from_secs(4)
        );
        assert_eq!(
            policy.delay_for(0, 0.0, Some(Duration::from_millis(10))),
            Duration::from_millis(500)
        );
        assert_eq!(
            policy.delay_for(0, 0.0, Some(Duration::from_secs(600))),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn retry_after_parsing() {
        assert_eq!(parse_retry_after("3"), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after(" 1.5 "), Some(Duration::from_millis(1500)));
        assert_eq!(parse_retry_after("-1"), None);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn http_transport_rejects_bad_keys() {
        assert!(HttpTransport::new("").unwrap_err().is_authentication());
        assert!(HttpTransport::new("sk-\nbad").unwrap_err().is_authentication());
        let transport =
            HttpTransport::with_options("sk-test", Some("http://localhost:8080/v1".to_string()))
                .unwrap();
        assert_eq!(transport.base_url(), "http://localhost:8080/v1/");
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_first_attempt() {
        let transport = FakeTransport::with(vec![Ok(ok_body("hi"))]);
        let client = TransportClient::new(transport.clone());
        let result = client.send(&payload()).await;
        assert_eq!(result.reply().map(|r| r.text.as_str()), Some("hi"));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_strictly_increase_until_exhausted() {
        let transport = FakeTransport::with(vec![
            Ok(RawResponse::json(503, "")),
            Ok(RawResponse::json(503, "")),
            Ok(RawResponse::json(503, "")),
            Ok(RawResponse::json(503, "")),
        ]);
        let client = TransportClient::new(transport.clone());
        let result = client.send(&payload()).await;
        assert!(matches!(result, ReplyResult::TransientFailure(_)));
        let times = transport.call_times();
        assert_eq!(times.len(), 4);
        let gaps = gaps(&times);
        assert!(gaps[0] >= Duration::from_millis(500));
        assert!(gaps.windows(2).all(|w| w[0] < w[1]), "{gaps:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn three_failures_then_success() {
        let transport = FakeTransport::with(vec![
            Ok(RawResponse::json(500, "")),
            Err(Error::connection("reset by peer", None)),
            Ok(RawResponse::json(502, "")),
            Ok(ok_body("finally")),
        ]);
        let client = TransportClient::new(transport.clone());
        let result = client.send(&payload()).await;
        assert_eq!(result.reply().map(|r| r.text.as_str()), Some("finally"));
        assert_eq!(transport.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn every_attempt_sends_identical_bytes() {
        let transport = FakeTransport::with(vec![
            Ok(RawResponse::json(500, "")),
            Ok(ok_body("ok")),
        ]);
        let client = TransportClient::new(transport.clone());
        let payload = payload();
        client.send(&payload).await;
        let calls = transport.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, calls[1].1);
        assert_eq!(calls[0].1.as_ref(), payload.to_bytes().unwrap().as_slice());
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_is_not_retried() {
        let transport = FakeTransport::with(vec![
            Ok(RawResponse::json(400, r#"{"error":{"message":"bad"}}"#)),
            Ok(ok_body("never")),
        ]);
        let client = TransportClient::new(transport.clone());
        let result = client.send(&payload()).await;
        assert!(matches!(result, ReplyResult::FatalFailure(ref e) if e.is_bad_request()));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_hint_is_honoured() {
        let transport = FakeTransport::with(vec![
            Ok(RawResponse::json(429, "").with_retry_after(Duration::from_secs(5))),
            Ok(ok_body("ok")),
        ]);
        let client = TransportClient::new(transport.clone());
        assert!(client.send(&payload()).await.is_success());
        let gaps = gaps(&transport.call_times());
        assert!(gaps[0] >= Duration::from_secs(5), "{gaps:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_rate_limit_is_transient() {
        let transport = FakeTransport::with(
            (0..4).map(|_| Ok(RawResponse::json(429, ""))).collect(),
        );
        let client = TransportClient::new(transport.clone());
        match client.send(&payload()).await {
            ReplyResult::TransientFailure(err) => assert!(err.is_rate_limit()),
            other => panic!("expected transient failure, got {other:?}"),
        }
        assert_eq!(transport.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_sends_once() {
        let transport = FakeTransport::with(vec![Ok(RawResponse::json(503, ""))]);
        let client = TransportClient::new(transport.clone()).with_retry_policy(RetryPolicy::none());
        assert!(matches!(
            client.send(&payload()).await,
            ReplyResult::TransientFailure(_)
        ));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_attempt_times_out() {
        let transport = FakeTransport {
            stall: Some(Duration::from_secs(3600)),
            ..FakeTransport::with(vec![Ok(ok_body("late"))])
        };
        let client = TransportClient::new(transport.clone())
            .with_retry_policy(RetryPolicy::none())
            .with_attempt_timeout(Duration::from_secs(2));
        let started = Instant::now();
        match client.send(&payload()).await {
            ReplyResult::TransientFailure(err) => assert!(err.is_timeout()),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
