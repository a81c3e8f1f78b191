//! Rate-limited REST dispatcher.
//!
//! Every request is keyed to a canonical route. Each route owns one
//! [`SequentialBucket`], so requests on a route run one at a time in
//! submission order, retries included. A global rate limit holds all
//! authenticated requests at the [`GlobalGate`] until it clears.

use super::global::GlobalGate;
use super::latency::LatencyRef;
use super::request::RestRequest;
use super::route;
use super::transport::{HttpBody, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use crate::bucket::{BucketPermit, SequentialBucket};
use crate::config::RestConfig;
use crate::error::{ApiError, Error, FieldError, HttpError, TimeoutKind};
use crate::metrics::Metrics;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HOST, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method};
use parking_lot::Mutex;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Server buckets start out allowing a single request.
const DEFAULT_ROUTE_LIMIT: u32 = 1;

/// Bounds of the jittered delay before retrying a 502.
const BAD_GATEWAY_DELAY_MS: std::ops::Range<u64> = 100..2000;

/// Longest reset or retry delay taken from a response.
const MAX_RESET_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Reaction routes report one-second windows that really last this long.
const REACTION_RESET_MS: i64 = 250;

/// REST client that honors per-route and global rate limits.
///
/// # Example
///
/// ```ignore
/// use shardwire::rest::{Dispatcher, RestRequest};
///
/// let rest = Dispatcher::new("Bot token", RestConfig::default(), metrics)?;
/// let me = rest.request(RestRequest::get("/users/@me")).await?;
/// ```
pub struct Dispatcher<T: HttpTransport = ReqwestTransport> {
    transport: T,
    config: RestConfig,
    token: String,
    host: Option<String>,
    routes: Mutex<HashMap<String, SequentialBucket>>,
    latency: Arc<LatencyRef>,
    global: Arc<GlobalGate>,
    metrics: Arc<Metrics>,
}

impl Dispatcher<ReqwestTransport> {
    /// Creates a dispatcher backed by `reqwest`.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the HTTP client cannot be created.
    pub fn new(
        token: impl Into<String>,
        config: RestConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self, Error> {
        Ok(Self::with_transport(
            token,
            config,
            ReqwestTransport::new()?,
            metrics,
        ))
    }
}

impl<T: HttpTransport> Dispatcher<T> {
    /// Creates a dispatcher over any transport.
    pub fn with_transport(
        token: impl Into<String>,
        config: RestConfig,
        transport: T,
        metrics: Arc<Metrics>,
    ) -> Self {
        let host = url::Url::parse(&config.base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));
        let latency = Arc::new(LatencyRef::new(
            config.ratelimiter_offset,
            config.latency_threshold,
        ));

        Self {
            transport,
            config,
            token: token.into(),
            host,
            routes: Mutex::new(HashMap::new()),
            latency,
            global: Arc::new(GlobalGate::new()),
            metrics,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RestConfig {
        &self.config
    }

    /// Rolling request latency.
    pub fn latency(&self) -> Duration {
        self.latency.latency()
    }

    /// Estimated milliseconds the server clock runs ahead of ours.
    pub fn time_offset(&self) -> i64 {
        self.latency.time_offset()
    }

    /// Whether a global rate limit is holding requests.
    pub fn is_globally_blocked(&self) -> bool {
        self.global.is_blocked()
    }

    /// Number of routes seen so far.
    pub fn route_count(&self) -> usize {
        self.routes.lock().len()
    }

    /// Send a request and decode its JSON body into `R`.
    ///
    /// A `204 No Content` decodes from `null`.
    pub async fn request_json<R: DeserializeOwned>(&self, request: RestRequest) -> Result<R, Error> {
        let value = self.request(request).await?.unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)?)
    }

    /// Send a request, waiting out rate limits and retrying 429 and 502.
    ///
    /// Returns `None` for `204 No Content` or an empty body.
    ///
    /// # Errors
    ///
    /// - `Api` when the error body carries a vendor code
    /// - `Http` for any other status above 300
    /// - `Timeout` when the response misses the request deadline
    /// - `Transport` when the request could not be sent
    pub async fn request(&self, request: RestRequest) -> Result<Option<Value>, Error> {
        let route = route::canonicalize(
            &request.method,
            &request.path,
            unix_ms(),
            self.latency.latency_ms(),
        );
        let http_request = self.build_request(&request)?;

        if request.auth {
            self.global.wait(request.priority).await;
        }

        let bucket = self.bucket(&route);
        let permit = bucket.acquire(request.priority).await?;
        let mut bad_gateway_attempts = 0u32;

        loop {
            let response = self.send(&request, http_request.clone()).await?;
            let retry_after = self.update_bucket(&route, &request, &permit, &response);

            match response.status {
                429 => {
                    self.metrics.record_rate_limited();
                    let global = response.header("x-ratelimit-global").is_some();
                    let mut delay = retry_after;
                    if response.header("x-ratelimit-scope") == Some("shared") {
                        delay = shared_retry_after(&response.body).or(delay);
                    }
                    warn!(
                        method = %request.method,
                        route = %route,
                        delay_ms = delay.map_or(0, |d| d.as_millis() as u64),
                        "{} 429",
                        if global { "Global" } else { "Unexpected" }
                    );

                    if let Some(delay) = delay.filter(|d| !d.is_zero()) {
                        tokio::time::sleep(delay).await;
                    }
                    if request.auth {
                        self.global.wait(true).await;
                    }
                }
                502 if bad_gateway_attempts < self.config.max_bad_gateway_retries => {
                    bad_gateway_attempts += 1;
                    self.metrics.record_bad_gateway_retry();
                    let delay =
                        Duration::from_millis(rand::thread_rng().gen_range(BAD_GATEWAY_DELAY_MS));
                    debug!(
                        method = %request.method,
                        route = %route,
                        attempt = bad_gateway_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Bad gateway, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                status if status > 300 => {
                    return Err(classify(&request, &route, &response));
                }
                _ => return decode_body(&response),
            }

            // The retry still counts against the route window
            permit.wait_reset().await;
        }
    }

    fn bucket(&self, route: &str) -> SequentialBucket {
        self.routes
            .lock()
            .entry(route.to_string())
            .or_insert_with(|| SequentialBucket::new(DEFAULT_ROUTE_LIMIT, Arc::clone(&self.latency)))
            .clone()
    }

    fn build_request(&self, request: &RestRequest) -> Result<HttpRequest, Error> {
        let mut url = format!(
            "{}{}{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.base_path(),
            request.path
        );
        if !request.query.is_empty() {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(request.query.iter().map(|(k, v)| (k, v)))
                .finish();
            url.push('?');
            url.push_str(&query);
        }

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, header_value(&self.config.user_agent)?);
        if request.auth {
            if self.token.is_empty() {
                return Err(Error::MissingToken);
            }
            headers.insert(AUTHORIZATION, header_value(&self.token)?);
        }
        if let Some(reason) = &request.reason {
            headers.insert("x-audit-log-reason", header_value(&encode_reason(reason))?);
        }
        if let Some(host) = &self.host {
            headers.insert(HOST, header_value(host)?);
        }
        if let Some(properties) = &self.config.super_properties {
            headers.insert("x-super-properties", header_value(properties)?);
        }

        let body = if !request.files.is_empty() {
            HttpBody::Multipart {
                payload_json: request.body.as_ref().map(serde_json::to_string).transpose()?,
                files: request.files.clone(),
            }
        } else if let Some(body) = &request.body {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            HttpBody::Json(serde_json::to_string(body)?)
        } else {
            HttpBody::Empty
        };

        Ok(HttpRequest {
            method: request.method.clone(),
            url,
            headers,
            body,
        })
    }

    async fn send(&self, request: &RestRequest, http_request: HttpRequest) -> Result<HttpResponse, Error> {
        self.metrics.record_rest_request();
        let started = Instant::now();

        let response = match tokio::time::timeout(
            self.config.request_timeout,
            self.transport.send(http_request),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    method = %request.method,
                    path = %request.path,
                    timeout_ms = self.config.request_timeout.as_millis() as u64,
                    "Request timed out"
                );
                return Err(Error::Timeout {
                    kind: TimeoutKind::Request,
                    context: Some(format!("{} {}", request.method, request.path)),
                });
            }
        };

        self.latency.record_latency(started.elapsed());
        if let Some(date) = response.header("date") {
            if let Ok(server) = chrono::DateTime::parse_from_rfc2822(date) {
                self.latency
                    .record_server_date(server.timestamp_millis(), unix_ms());
            }
        }

        debug!(
            method = %request.method,
            path = %request.path,
            status = response.status,
            latency_ms = started.elapsed().as_millis() as u64,
            "Request completed"
        );
        Ok(response)
    }

    /// Apply the rate limit headers to the route and return the
    /// header-derived retry delay, if any.
    fn update_bucket(
        &self,
        route: &str,
        request: &RestRequest,
        permit: &BucketPermit,
        response: &HttpResponse,
    ) -> Option<Duration> {
        let limit = response.header("x-ratelimit-limit");
        let remaining = response.header("x-ratelimit-remaining");

        if let Some(limit) = limit.and_then(|v| v.parse::<u32>().ok()) {
            permit.set_limit(limit);
        }
        if request.method != Method::GET
            && (limit.is_none() || remaining.is_none())
            && permit.limit() != DEFAULT_ROUTE_LIMIT
        {
            debug!(
                route = %route,
                limit = permit.limit(),
                "Missing ratelimit headers for route with non-default limit"
            );
        }
        permit.set_remaining(match remaining {
            None => 1,
            Some(v) => v.parse::<f64>().map_or(0, |r| r.max(0.0) as u32),
        });

        let retry_after = response
            .header("x-ratelimit-reset-after")
            .or_else(|| response.header("retry-after"))
            .and_then(|v| v.parse::<f64>().ok())
            .and_then(secs_to_duration);

        let now = Instant::now();
        if let Some(retry_after) = retry_after {
            let delay = retry_after.max(Duration::from_millis(1));
            if response.header("x-ratelimit-global").is_some() {
                self.metrics.record_global_block();
                self.global.block(delay);
            } else {
                permit.set_reset_at(now + delay);
            }
        } else if let Some(reset) = response
            .header("x-ratelimit-reset")
            .and_then(|v| v.parse::<f64>().ok())
        {
            let wait_ms = reset_wait_ms(
                route,
                (reset * 1000.0) as i64,
                unix_ms(),
                self.latency.latency_ms(),
            );
            let wait = Duration::from_millis(wait_ms as u64).min(MAX_RESET_WAIT);
            permit.set_reset_at(now + wait);
        } else {
            permit.set_reset_at(now);
        }

        retry_after
    }
}

/// Milliseconds until a route resets, given the absolute reset time.
fn reset_wait_ms(route: &str, reset_ms: i64, now_ms: i64, latency_ms: i64) -> i64 {
    if route.ends_with("/reactions/:id") && reset_ms.saturating_sub(now_ms) == 1000 {
        return REACTION_RESET_MS;
    }
    reset_ms
        .saturating_sub(latency_ms)
        .saturating_sub(now_ms)
        .max(0)
}

/// Server-provided seconds as a delay, clamped to [`MAX_RESET_WAIT`].
fn secs_to_duration(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(
        Duration::try_from_secs_f64(secs)
            .map_or(MAX_RESET_WAIT, |delay| delay.min(MAX_RESET_WAIT)),
    )
}

fn unix_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn header_value(value: &str) -> Result<HeaderValue, Error> {
    HeaderValue::from_str(value).map_err(|e| Error::Transport(format!("Invalid header value: {e}")))
}

/// Percent-encode an audit log reason, spaces as `%20`.
fn encode_reason(reason: &str) -> String {
    // `+` in the input is already escaped as %2B
    url::form_urlencoded::byte_serialize(reason.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

fn shared_retry_after(body: &[u8]) -> Option<Duration> {
    serde_json::from_slice::<Value>(body)
        .ok()?
        .get("retry_after")?
        .as_f64()
        .and_then(secs_to_duration)
}

fn decode_body(response: &HttpResponse) -> Result<Option<Value>, Error> {
    if response.status == 204 || response.body.is_empty() {
        return Ok(None);
    }
    if response.is_json() {
        Ok(Some(serde_json::from_slice(&response.body)?))
    } else {
        Ok(Some(Value::String(
            String::from_utf8_lossy(&response.body).into_owned(),
        )))
    }
}

fn classify(request: &RestRequest, route: &str, response: &HttpResponse) -> Error {
    if response.is_json() {
        if let Ok(body) = serde_json::from_slice::<Value>(&response.body) {
            if let Some(code) = body.get("code").and_then(Value::as_u64).filter(|c| *c != 0) {
                let mut errors = Vec::new();
                if let Some(fields) = body.get("errors") {
                    flatten_errors(fields, "", &mut errors);
                }
                return Error::Api(ApiError {
                    status: response.status,
                    code,
                    message: body
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    method: request.method.to_string(),
                    path: request.path.clone(),
                    errors,
                });
            }
        }
    }

    Error::Http(HttpError {
        status: response.status,
        method: request.method.to_string(),
        path: request.path.clone(),
        route: route.to_string(),
        body: String::from_utf8_lossy(&response.body).into_owned(),
    })
}

fn flatten_errors(value: &Value, prefix: &str, out: &mut Vec<FieldError>) {
    let Value::Object(fields) = value else {
        return;
    };

    for (key, child) in fields {
        if key == "message" || key == "code" {
            continue;
        }
        if key == "_errors" {
            for item in child.as_array().into_iter().flatten() {
                out.push(FieldError {
                    path: prefix.to_string(),
                    code: item
                        .get("code")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    message: item
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
            continue;
        }

        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match child {
            Value::Array(messages) => {
                for message in messages.iter().filter_map(Value::as_str) {
                    out.push(FieldError {
                        path: path.clone(),
                        code: String::new(),
                        message: message.to_string(),
                    });
                }
            }
            _ => flatten_errors(child, &path, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use bytes::Bytes;
    use http::HeaderName;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Reply {
        status: u16,
        headers: Vec<(&'static str, String)>,
        body: String,
        delay: Duration,
    }

    impl Reply {
        fn json(status: u16, body: Value) -> Self {
            Self {
                status,
                headers: vec![("content-type", "application/json".to_string())],
                body: body.to_string(),
                delay: Duration::ZERO,
            }
        }

        fn empty(status: u16) -> Self {
            Self {
                status,
                headers: Vec::new(),
                body: String::new(),
                delay: Duration::ZERO,
            }
        }

        fn header(mut self, name: &'static str, value: impl ToString) -> Self {
            self.headers.push((name, value.to_string()));
            self
        }

        fn delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn into_response(self) -> HttpResponse {
            let mut headers = HeaderMap::new();
            for (name, value) in self.headers {
                headers.insert(
                    HeaderName::from_static(name),
                    HeaderValue::from_str(&value).unwrap(),
                );
            }
            HttpResponse {
                status: self.status,
                headers,
                body: Bytes::from(self.body),
            }
        }
    }

    #[derive(Default)]
    struct MockTransport {
        replies: Mutex<VecDeque<Reply>>,
        seen: Mutex<Vec<HttpRequest>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MockTransport {
        fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                ..Default::default()
            }
        }
    }

    impl HttpTransport for MockTransport {
        fn send(&self, request: HttpRequest) -> impl Future<Output = Result<HttpResponse, Error>> + Send {
            async move {
                let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(current, Ordering::SeqCst);
                let reply = self
                    .replies
                    .lock()
                    .pop_front()
                    .unwrap_or_else(|| Reply::json(200, json!({})));
                self.seen.lock().push(request);

                tokio::time::sleep(reply.delay).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(reply.into_response())
            }
        }
    }

    fn dispatcher(replies: Vec<Reply>) -> Dispatcher<MockTransport> {
        Dispatcher::with_transport(
            "Bot abc",
            RestConfig::default(),
            MockTransport::new(replies),
            Arc::new(Metrics::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_route_runs_in_submission_order() {
        let replies = (0..10)
            .map(|n| Reply::json(200, json!({ "n": n })).delay(Duration::from_millis(10)))
            .collect();
        let rest = dispatcher(replies);

        let calls = (0..10).map(|n| {
            rest.request(RestRequest::get("/channels/81384788765712384/messages").query("n", n))
        });
        let results = futures_util::future::join_all(calls).await;

        for (n, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), Some(json!({ "n": n })));
        }
        let seen = rest.transport.seen.lock();
        for (n, request) in seen.iter().enumerate() {
            assert!(request.url.ends_with(&format!("?n={n}")), "{}", request.url);
        }
        assert_eq!(rest.transport.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(rest.route_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_429_waits_body_retry_after() {
        let rest = dispatcher(vec![
            Reply::json(429, json!({ "retry_after": 2.5, "global": false, "message": "limited" }))
                .header("x-ratelimit-scope", "shared")
                .header("retry-after", "1"),
            Reply::json(200, json!({ "id": "1" })),
        ]);
        let start = Instant::now();

        let result = rest.request(RestRequest::get("/users/@me")).await.unwrap();

        assert_eq!(result, Some(json!({ "id": "1" })));
        assert!(start.elapsed() >= Duration::from_millis(2500));
        assert_eq!(rest.metrics.rate_limited(), 1);
        assert_eq!(rest.metrics.rest_requests(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_gateway_retried_three_times() {
        let rest = dispatcher(vec![
            Reply::empty(502),
            Reply::empty(502),
            Reply::empty(502),
            Reply::json(200, json!({ "ok": true })),
        ]);

        let result = rest.request(RestRequest::get("/gateway/bot")).await.unwrap();

        assert_eq!(result, Some(json!({ "ok": true })));
        assert_eq!(rest.metrics.bad_gateway_retries(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fourth_bad_gateway_surfaces() {
        let rest = dispatcher((0..4).map(|_| Reply::empty(502)).collect());

        let err = rest.request(RestRequest::get("/gateway/bot")).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Http);
        assert_eq!(err.status(), Some(502));
        assert_eq!(rest.metrics.rest_requests(), 4);
    }

    #[tokio::test]
    async fn test_structured_api_error() {
        let rest = dispatcher(vec![Reply::json(
            400,
            json!({
                "code": 50035,
                "message": "Invalid Form Body",
                "errors": {
                    "content": { "_errors": [
                        { "code": "BASE_TYPE_MAX_LENGTH", "message": "Must be 2000 or fewer in length." }
                    ] },
                    "embeds": { "0": { "title": { "_errors": [
                        { "code": "BASE_TYPE_REQUIRED", "message": "This field is required" }
                    ] } } }
                }
            }),
        )]);

        let err = rest
            .request(RestRequest::post("/channels/1/messages").json(json!({ "content": "x" })))
            .await
            .unwrap_err();

        match err {
            Error::Api(api) => {
                assert_eq!(api.status, 400);
                assert_eq!(api.code, 50035);
                assert_eq!(api.method, "POST");
                assert_eq!(api.errors.len(), 2);
                assert_eq!(api.errors[0].path, "content");
                assert_eq!(api.errors[1].path, "embeds.0.title");
                assert_eq!(api.errors[1].code, "BASE_TYPE_REQUIRED");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unstructured_http_error() {
        let rest = dispatcher(vec![Reply::empty(404).header("content-type", "text/plain")]);

        let err = rest
            .request(RestRequest::get("/channels/81384788765712384/messages/175928847299117063"))
            .await
            .unwrap_err();

        match err {
            Error::Http(http) => {
                assert_eq!(http.status, 404);
                assert_eq!(http.route, "/channels/81384788765712384/messages/:id");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_content() {
        let rest = dispatcher(vec![Reply::empty(204)]);

        let result = rest
            .request(RestRequest::delete("/channels/1/pins/2"))
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_not_retried() {
        let rest = dispatcher(vec![Reply::empty(200).delay(Duration::from_secs(20))]);

        let err = rest.request(RestRequest::get("/users/@me")).await.unwrap_err();

        assert!(matches!(
            err,
            Error::Timeout {
                kind: TimeoutKind::Request,
                ..
            }
        ));
        assert_eq!(rest.transport.seen.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_route_waits_for_reset() {
        let rest = dispatcher(vec![
            Reply::json(200, json!({}))
                .header("x-ratelimit-limit", 5)
                .header("x-ratelimit-remaining", 0)
                .header("x-ratelimit-reset-after", "2.0"),
            Reply::json(200, json!({})),
        ]);
        let start = Instant::now();

        rest.request(RestRequest::get("/users/@me")).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(2000));

        rest.request(RestRequest::get("/users/@me")).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(2000));
        assert_eq!(rest.bucket("/users/@me").limit(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_429_blocks_then_retries() {
        let rest = dispatcher(vec![
            Reply::json(429, json!({ "retry_after": 1.0, "global": true }))
                .header("x-ratelimit-global", "true")
                .header("retry-after", "1"),
            Reply::json(200, json!({ "id": "1" })),
        ]);
        let start = Instant::now();

        let result = rest.request(RestRequest::get("/users/@me")).await.unwrap();

        assert_eq!(result, Some(json!({ "id": "1" })));
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert_eq!(rest.metrics.global_blocks(), 1);
        assert!(!rest.is_globally_blocked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_block_defers_authenticated_requests_only() {
        let rest = dispatcher(Vec::new());
        rest.global.block(Duration::from_secs(3));
        assert!(rest.is_globally_blocked());
        let start = Instant::now();

        rest.request(RestRequest::get("/gateway").unauthenticated())
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(3));
        assert!(rest.transport.seen.lock()[0].headers.get(AUTHORIZATION).is_none());

        rest.request(RestRequest::get("/users/@me")).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(!rest.is_globally_blocked());
    }

    #[tokio::test]
    async fn test_request_headers() {
        let rest = dispatcher(Vec::new());

        rest.request(
            RestRequest::patch("/guilds/1/members/2")
                .json(json!({ "nick": "x" }))
                .reason("spring cleaning ✓"),
        )
        .await
        .unwrap();

        let seen = rest.transport.seen.lock();
        let request = &seen[0];
        assert_eq!(request.url, "https://discord.com/api/v10/guilds/1/members/2");
        assert_eq!(request.headers[AUTHORIZATION], "Bot abc");
        assert_eq!(request.headers[HOST], "discord.com");
        assert_eq!(request.headers[CONTENT_TYPE], "application/json");
        assert_eq!(
            request.headers["x-audit-log-reason"],
            "spring%20cleaning%20%E2%9C%93"
        );
        assert!(request.headers.contains_key(USER_AGENT));
        assert_eq!(request.body, HttpBody::Json(r#"{"nick":"x"}"#.to_string()));
    }

    #[tokio::test]
    async fn test_missing_token_rejected() {
        let rest = Dispatcher::with_transport(
            "",
            RestConfig::default(),
            MockTransport::default(),
            Arc::new(Metrics::new()),
        );

        let err = rest.request(RestRequest::get("/users/@me")).await.unwrap_err();
        assert!(matches!(err, Error::MissingToken));
        assert!(rest.transport.seen.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_with_only_reset_header_waits_for_window() {
        let reset = (unix_ms() + 2000) as f64 / 1000.0;
        let rest = dispatcher(vec![
            Reply::json(429, json!({ "message": "limited" }))
                .header("x-ratelimit-limit", 5)
                .header("x-ratelimit-remaining", 0)
                .header("x-ratelimit-reset", format!("{reset:.3}")),
            Reply::json(200, json!({ "id": "1" })),
        ]);
        let start = Instant::now();

        let result = rest.request(RestRequest::get("/users/@me")).await.unwrap();

        assert_eq!(result, Some(json!({ "id": "1" })));
        assert!(start.elapsed() >= Duration::from_millis(1500));
        assert_eq!(rest.transport.seen.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_gateway_retry_waits_for_exhausted_window() {
        let rest = dispatcher(vec![
            Reply::empty(502)
                .header("x-ratelimit-limit", 5)
                .header("x-ratelimit-remaining", 0)
                .header("x-ratelimit-reset-after", "3.0"),
            Reply::json(200, json!({})),
        ]);
        let start = Instant::now();

        rest.request(RestRequest::get("/gateway/bot")).await.unwrap();

        assert!(start.elapsed() >= Duration::from_millis(3000));
        assert_eq!(rest.metrics.bad_gateway_retries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_reset_values_are_clamped() {
        let rest = dispatcher(vec![
            Reply::json(200, json!({})).header("retry-after", "1e30"),
            Reply::json(200, json!({}))
                .header("x-ratelimit-remaining", 1)
                .header("x-ratelimit-reset", "1e300"),
        ]);

        rest.request(RestRequest::get("/users/@me")).await.unwrap();
        let reset_at = rest.bucket("/users/@me").reset_at().unwrap();
        assert!(reset_at <= Instant::now() + MAX_RESET_WAIT);

        rest.request(RestRequest::get("/users/@me")).await.unwrap();
        let reset_at = rest.bucket("/users/@me").reset_at().unwrap();
        assert!(reset_at <= Instant::now() + MAX_RESET_WAIT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_429_with_oversized_body_retry_after() {
        let rest = dispatcher(vec![
            Reply::json(429, json!({ "retry_after": 1e300, "global": false }))
                .header("x-ratelimit-scope", "shared"),
            Reply::json(200, json!({ "id": "1" })),
        ]);
        let start = Instant::now();

        let result = rest.request(RestRequest::get("/users/@me")).await.unwrap();

        assert_eq!(result, Some(json!({ "id": "1" })));
        assert!(start.elapsed() >= MAX_RESET_WAIT);
    }

    #[test]
    fn test_secs_to_duration() {
        assert_eq!(secs_to_duration(1.5), Some(Duration::from_millis(1500)));
        assert_eq!(secs_to_duration(1e30), Some(MAX_RESET_WAIT));
        assert_eq!(secs_to_duration(-1.0), None);
        assert_eq!(secs_to_duration(f64::NAN), None);
    }

    #[tokio::test]
    async fn test_status_300_is_not_an_error() {
        let rest = dispatcher(vec![Reply::json(300, json!({ "choices": [] }))]);

        let result = rest.request(RestRequest::get("/users/@me")).await.unwrap();
        assert_eq!(result, Some(json!({ "choices": [] })));

        let rest = dispatcher(vec![Reply::empty(301)]);
        let err = rest.request(RestRequest::get("/users/@me")).await.unwrap_err();
        assert_eq!(err.status(), Some(301));
    }

    #[test]
    fn test_reaction_reset_pad_ignores_latency() {
        let route = "/channels/1/messages/2/reactions/:id";
        assert_eq!(reset_wait_ms(route, 11_000, 10_000, 80), 250);
        assert_eq!(reset_wait_ms(route, 12_000, 10_000, 80), 1920);
        assert_eq!(reset_wait_ms("/channels/1/messages", 11_000, 10_000, 80), 920);
        assert_eq!(reset_wait_ms("/channels/1/messages", 9_000, 10_000, 80), 0);
        assert_eq!(reset_wait_ms("/channels/1/messages", i64::MIN, 10_000, 80), 0);
    }

    #[test]
    fn test_encode_reason() {
        assert_eq!(encode_reason("a b+c/d"), "a%20b%2Bc%2Fd");
    }
}
