use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Uri};
use tokio::time::{sleep, timeout};
use tracing::{Instrument, debug, info_span, warn};

use crate::auth::{AuthProvider, Credential};
use crate::config::{PipelineConfig, PipelineProfile, TransportConfig};
use crate::error::{Error, ErrorCode, FailureClass, TransportErrorKind};
use crate::limiters::CallLimiter;
use crate::metrics::{PipelineMetrics, PipelineMetricsSnapshot};
use crate::policy::{Interceptor, RequestContext};
use crate::request::{Request, RequestBuilder};
use crate::response::Response;
use crate::retry::{
    PermissiveRetryEligibility, RetryAction, RetryDecision, RetryEligibility, RetryPolicy,
};
use crate::transport::{HyperTransport, Transport};
use crate::util::{
    bounded_retry_delay, deadline_exceeded_error, merge_headers, parse_header_name,
    parse_header_value, parse_retry_after, phase_timeout, redact_uri_for_logs, resolve_uri,
    same_endpoint, truncate_body,
};

const DEFAULT_CLIENT_NAME: &str = "authpipe";

/// Per-call overrides of the pipeline defaults.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    pub request_timeout: Option<Duration>,
    pub total_timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Response(StatusCode),
    Error(ErrorCode),
}

/// Record of one send, handed to interceptors and then dropped.
#[derive(Clone, Debug)]
pub struct Attempt {
    pub index: usize,
    pub after_refresh: bool,
    pub refresh_triggered: bool,
    pub elapsed: Duration,
    pub method: Method,
    pub uri: String,
    pub outcome: AttemptOutcome,
}

enum CallState {
    Sending { attempt: usize },
    Refreshing { attempt: usize, refresh_attempt: usize },
    Resending { attempt: usize },
    Waiting { delay: Duration, resume: Box<CallState> },
    Succeeded(Response),
    Failed(Error),
}

struct Call {
    method: Method,
    uri: Uri,
    redacted_uri: String,
    headers: HeaderMap,
    body: Bytes,
    retry_policy: RetryPolicy,
    retry_allowed: bool,
    request_timeout: Duration,
    total_timeout: Option<Duration>,
    started_at: Instant,
    targets_auth_endpoint: bool,
    used_credential: Option<Arc<Credential>>,
    refreshed: bool,
    unauthorized_body: String,
}

impl Call {
    fn max_attempts(&self) -> usize {
        if self.retry_allowed {
            self.retry_policy.configured_max_retries().saturating_add(1)
        } else {
            1
        }
    }

    fn deadline_exceeded(&self) -> Error {
        deadline_exceeded_error(self.total_timeout, &self.method, &self.redacted_uri)
    }

    fn deadline_passed(&self) -> bool {
        self.total_timeout
            .is_some_and(|total_timeout| self.started_at.elapsed() >= total_timeout)
    }

    fn status_error(&self, status: StatusCode, body: &[u8]) -> Error {
        let body = truncate_body(body);
        if status.is_server_error() {
            Error::ServerStatus {
                status: status.as_u16(),
                method: self.method.clone(),
                uri: self.redacted_uri.clone(),
                body,
            }
        } else {
            Error::ClientStatus {
                status: status.as_u16(),
                method: self.method.clone(),
                uri: self.redacted_uri.clone(),
                body,
            }
        }
    }
}

/// Runs logical calls: credential attachment, one-shot refresh on 401 and
/// bounded retries of transient failures.
#[derive(Clone)]
pub struct Pipeline {
    base_url: String,
    client_name: String,
    default_headers: HeaderMap,
    request_timeout: Duration,
    total_timeout: Option<Duration>,
    retry_policy: RetryPolicy,
    refresh_retry_policy: RetryPolicy,
    retry_eligibility: Arc<dyn RetryEligibility>,
    auth_provider: Option<AuthProvider>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    limiter: Option<CallLimiter>,
    transport: Arc<dyn Transport>,
    metrics: PipelineMetrics,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Pipeline")
            .field("base_url", &self.base_url)
            .field("client_name", &self.client_name)
            .field("request_timeout", &self.request_timeout)
            .field("total_timeout", &self.total_timeout)
            .field("retry_policy", &self.retry_policy)
            .field("refresh_retry_policy", &self.refresh_retry_policy)
            .field("auth_provider", &self.auth_provider)
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

pub struct PipelineBuilder {
    base_url: String,
    client_name: String,
    default_headers: HeaderMap,
    request_timeout: Duration,
    total_timeout: Option<Duration>,
    retry_policy: RetryPolicy,
    refresh_retry_policy: RetryPolicy,
    retry_eligibility: Arc<dyn RetryEligibility>,
    auth_provider: Option<AuthProvider>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    max_in_flight: Option<usize>,
    transport: Option<Arc<dyn Transport>>,
    transport_config: TransportConfig,
}

impl PipelineBuilder {
    pub(crate) fn new(base_url: impl Into<String>) -> Self {
        let defaults = PipelineProfile::Standard.defaults();
        Self {
            base_url: base_url.into(),
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            default_headers: HeaderMap::new(),
            request_timeout: defaults.request_timeout,
            total_timeout: defaults.total_timeout,
            retry_policy: defaults.retry_policy,
            refresh_retry_policy: defaults.refresh_retry_policy,
            retry_eligibility: Arc::new(PermissiveRetryEligibility),
            auth_provider: None,
            interceptors: Vec::new(),
            max_in_flight: None,
            transport: None,
            transport_config: defaults.transport,
        }
    }

    /// Builder preloaded from an external configuration document.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let mut builder = Self::new(config.base_url.clone());
        if let Some(client_name) = &config.client_name {
            builder = builder.client_name(client_name.clone());
        }
        if let Some(ms) = config.request_timeout_ms {
            builder = builder.request_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = config.total_timeout_ms {
            builder = builder.total_timeout(Duration::from_millis(ms));
        }
        if let Some(max_connections) = config.max_connections {
            builder = builder.max_in_flight(max_connections);
        }
        builder.transport_config = config.transport_config(builder.transport_config);
        builder.retry_policy = config.retry_policy(builder.retry_policy);
        builder.refresh_retry_policy = config.refresh_retry_policy(builder.refresh_retry_policy);
        builder
    }

    /// Replaces timeouts, retry budgets and transport settings with a preset.
    pub fn profile(mut self, profile: PipelineProfile) -> Self {
        let defaults = profile.defaults();
        self.request_timeout = defaults.request_timeout;
        self.total_timeout = defaults.total_timeout;
        self.retry_policy = defaults.retry_policy;
        self.refresh_retry_policy = defaults.refresh_retry_policy;
        self.transport_config = defaults.transport;
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn total_timeout(mut self, total_timeout: Duration) -> Self {
        self.total_timeout = Some(total_timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn refresh_retry_policy(mut self, refresh_retry_policy: RetryPolicy) -> Self {
        self.refresh_retry_policy = refresh_retry_policy;
        self
    }

    /// Every method is retried by default. Pass [`crate::StrictRetryEligibility`]
    /// to limit retries to idempotent methods and keyed requests.
    pub fn retry_eligibility(mut self, retry_eligibility: Arc<dyn RetryEligibility>) -> Self {
        self.retry_eligibility = retry_eligibility;
        self
    }

    pub fn auth_provider(mut self, auth_provider: AuthProvider) -> Self {
        self.auth_provider = Some(auth_provider);
        self
    }

    /// Appends a stage. Stages run in insertion order.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = Some(max_in_flight.max(1));
        self
    }

    pub fn transport<T>(mut self, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Settings for the default [`HyperTransport`]. Ignored when a custom
    /// transport is supplied.
    pub fn transport_config(mut self, transport_config: TransportConfig) -> Self {
        self.transport_config = transport_config;
        self
    }

    pub fn build(self) -> crate::Result<Pipeline> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new(&self.transport_config)?),
        };
        Ok(Pipeline {
            base_url: self.base_url,
            client_name: self.client_name,
            default_headers: self.default_headers,
            request_timeout: self.request_timeout,
            total_timeout: self.total_timeout,
            retry_policy: self.retry_policy,
            refresh_retry_policy: self.refresh_retry_policy,
            retry_eligibility: self.retry_eligibility,
            auth_provider: self.auth_provider,
            interceptors: self.interceptors,
            limiter: CallLimiter::new(self.max_in_flight),
            transport,
            metrics: PipelineMetrics::default(),
        })
    }
}

impl Pipeline {
    pub fn builder(base_url: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(base_url)
    }

    pub fn auth_provider(&self) -> Option<&AuthProvider> {
        self.auth_provider.as_ref()
    }

    pub fn metrics_snapshot(&self) -> PipelineMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn available_call_permits(&self) -> Option<usize> {
        self.limiter.as_ref().map(CallLimiter::available_permits)
    }

    pub fn request(&self, method: Method, path: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, path.into())
    }

    pub fn get(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, path)
    }

    pub(crate) fn resolve(&self, path: &str) -> crate::Result<Uri> {
        resolve_uri(&self.base_url, path)
    }

    /// Runs one logical call with the pipeline defaults.
    pub async fn execute(&self, request: Request) -> crate::Result<Response> {
        self.execute_with(request, CallOptions::default()).await
    }

    pub async fn execute_with(
        &self,
        request: Request,
        options: CallOptions,
    ) -> crate::Result<Response> {
        let _permit = match &self.limiter {
            Some(limiter) => Some(limiter.acquire().await?),
            None => None,
        };

        self.metrics.record_call_started();
        let _in_flight = self.metrics.enter_in_flight();
        let started_at = Instant::now();
        let result = self.run(self.prepare(request, options, started_at)).await;
        self.metrics.record_call_completed(&result, started_at.elapsed());
        result
    }

    fn prepare(&self, request: Request, options: CallOptions, started_at: Instant) -> Call {
        let (method, uri, headers, body) = request.into_parts();
        let headers = merge_headers(&self.default_headers, &headers);
        let retry_allowed = self.retry_eligibility.supports_retry(&method, &headers);
        let targets_auth_endpoint = self
            .auth_provider
            .as_ref()
            .is_some_and(|provider| same_endpoint(provider.endpoint().uri(), &uri));
        Call {
            redacted_uri: redact_uri_for_logs(&uri.to_string()),
            method,
            uri,
            headers,
            body,
            retry_policy: options
                .retry_policy
                .unwrap_or_else(|| self.retry_policy.clone()),
            retry_allowed,
            request_timeout: options
                .request_timeout
                .unwrap_or(self.request_timeout)
                .max(Duration::from_millis(1)),
            total_timeout: options.total_timeout.or(self.total_timeout),
            started_at,
            targets_auth_endpoint,
            used_credential: None,
            refreshed: false,
            unauthorized_body: String::new(),
        }
    }

    async fn run(&self, mut call: Call) -> crate::Result<Response> {
        let mut state = CallState::Sending { attempt: 1 };
        loop {
            state = match state {
                CallState::Sending { attempt } => self.send_attempt(&mut call, attempt).await,
                CallState::Refreshing {
                    attempt,
                    refresh_attempt,
                } => {
                    self.refresh_credential(&mut call, attempt, refresh_attempt)
                        .await
                }
                CallState::Resending { attempt } => self.send_attempt(&mut call, attempt).await,
                CallState::Waiting { delay, resume } => {
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    *resume
                }
                CallState::Succeeded(response) => return Ok(response),
                CallState::Failed(error) => return Err(error),
            };
        }
    }

    async fn send_attempt(&self, call: &mut Call, attempt: usize) -> CallState {
        let span = info_span!(
            "authpipe.request",
            client = %self.client_name,
            method = %call.method,
            uri = %call.redacted_uri,
            attempt = attempt,
            max_attempts = call.max_attempts(),
            after_refresh = call.refreshed
        );
        self.send_attempt_inner(call, attempt).instrument(span).await
    }

    async fn send_attempt_inner(&self, call: &mut Call, attempt: usize) -> CallState {
        let Some(send_timeout) =
            phase_timeout(call.request_timeout, call.total_timeout, call.started_at)
        else {
            return CallState::Failed(call.deadline_exceeded());
        };

        let context = RequestContext::new(
            call.method.clone(),
            call.redacted_uri.clone(),
            attempt,
            call.max_attempts(),
            call.refreshed,
        );
        let mut headers = call.headers.clone();
        for interceptor in &self.interceptors {
            interceptor.on_request(&context, &mut headers);
        }

        let credential = self
            .auth_provider
            .as_ref()
            .and_then(AuthProvider::current_credential);
        let mut request = Request::new(call.method.clone(), call.uri.clone())
            .with_headers(headers)
            .with_body(call.body.clone());
        if let Some(credential) = &credential {
            request = match request.with_bearer(credential.token()) {
                Ok(request) => request,
                Err(error) => return CallState::Failed(error),
            };
        }
        call.used_credential = credential;

        debug!("sending request");
        self.metrics.record_send();
        let sent_at = Instant::now();
        let sent = timeout(send_timeout, self.transport.send(request)).await;
        let result = match sent {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(source)) => Err(Error::Transport {
                kind: source.kind(),
                method: call.method.clone(),
                uri: call.redacted_uri.clone(),
                source: source.into_source(),
            }),
            Err(_) if call.deadline_passed() => Err(call.deadline_exceeded()),
            Err(_) => Err(Error::Transport {
                kind: TransportErrorKind::ReadTimeout,
                method: call.method.clone(),
                uri: call.redacted_uri.clone(),
                source: format!("no response within {}ms", send_timeout.as_millis()).into(),
            }),
        };

        let (next, outcome, refresh_triggered) = match result {
            Ok(response) => {
                let status = response.status();
                debug!(status = status.as_u16(), "request completed");
                for interceptor in &self.interceptors {
                    interceptor.on_response(&context, status, response.headers());
                }
                let outcome = AttemptOutcome::Response(status);
                match FailureClass::from_status(status) {
                    None => (CallState::Succeeded(response), outcome, false),
                    Some(FailureClass::Unauthorized) => {
                        self.metrics.record_unauthorized();
                        if self.may_refresh(call) {
                            debug!("unauthorized, refreshing credential");
                            call.unauthorized_body = truncate_body(response.body());
                            let next = CallState::Refreshing {
                                attempt,
                                refresh_attempt: 1,
                            };
                            (next, outcome, true)
                        } else {
                            let error = Error::Unauthorized {
                                method: call.method.clone(),
                                uri: call.redacted_uri.clone(),
                                body: truncate_body(response.body()),
                                after_refresh: call.refreshed,
                            };
                            self.notify_error(&context, &error);
                            (CallState::Failed(error), outcome, false)
                        }
                    }
                    Some(_) => {
                        let error = call.status_error(status, response.body());
                        self.notify_error(&context, &error);
                        let retry_after =
                            parse_retry_after(response.headers(), SystemTime::now());
                        (self.after_failure(call, attempt, error, retry_after), outcome, false)
                    }
                }
            }
            Err(error) => {
                self.notify_error(&context, &error);
                let outcome = AttemptOutcome::Error(error.code());
                (self.after_failure(call, attempt, error, None), outcome, false)
            }
        };

        let record = Attempt {
            index: attempt,
            after_refresh: call.refreshed,
            refresh_triggered,
            elapsed: sent_at.elapsed(),
            method: call.method.clone(),
            uri: call.redacted_uri.clone(),
            outcome,
        };
        for interceptor in &self.interceptors {
            interceptor.on_attempt(&record);
        }
        next
    }

    fn may_refresh(&self, call: &Call) -> bool {
        !call.refreshed && self.auth_provider.is_some() && !call.targets_auth_endpoint
    }

    fn notify_error(&self, context: &RequestContext, error: &Error) {
        for interceptor in &self.interceptors {
            interceptor.on_error(context, error);
        }
    }

    fn after_failure(
        &self,
        call: &Call,
        attempt: usize,
        error: Error,
        retry_after: Option<Duration>,
    ) -> CallState {
        if !call.retry_allowed {
            return CallState::Failed(error);
        }

        let decision = RetryDecision {
            attempt,
            max_retries: call.retry_policy.configured_max_retries(),
            method: call.method.clone(),
            uri: call.redacted_uri.clone(),
            failure: error.failure_class(),
        };
        match call.retry_policy.decide(&decision) {
            RetryAction::RetryAfter(backoff) => {
                let retry_delay = retry_after.unwrap_or(backoff);
                let Some(retry_delay) =
                    bounded_retry_delay(retry_delay, call.total_timeout, call.started_at)
                else {
                    return CallState::Failed(call.deadline_exceeded());
                };
                warn!(
                    delay_ms = retry_delay.as_millis() as u64,
                    error = %error,
                    "retrying request"
                );
                self.metrics.record_retry();
                CallState::Waiting {
                    delay: retry_delay,
                    resume: Box::new(CallState::Sending {
                        attempt: attempt + 1,
                    }),
                }
            }
            RetryAction::Stop if attempt > 1 && call.retry_policy.permits(&decision) => {
                CallState::Failed(Error::RetryBudgetExhausted {
                    attempts: attempt,
                    method: call.method.clone(),
                    uri: call.redacted_uri.clone(),
                    last: Box::new(error),
                })
            }
            RetryAction::Stop => CallState::Failed(error),
        }
    }

    async fn refresh_credential(
        &self,
        call: &mut Call,
        attempt: usize,
        refresh_attempt: usize,
    ) -> CallState {
        let Some(provider) = &self.auth_provider else {
            return CallState::Failed(Error::Unauthorized {
                method: call.method.clone(),
                uri: call.redacted_uri.clone(),
                body: String::new(),
                after_refresh: false,
            });
        };
        call.refreshed = true;
        self.metrics.record_refresh();

        let stale = call.used_credential.clone();
        let refreshed = match call.total_timeout {
            Some(total_timeout) => {
                let Some(remaining) =
                    phase_timeout(total_timeout, Some(total_timeout), call.started_at)
                else {
                    return CallState::Failed(call.deadline_exceeded());
                };
                match timeout(remaining, provider.refresh_after(stale.as_deref())).await {
                    Ok(refreshed) => refreshed,
                    Err(_) => return CallState::Failed(call.deadline_exceeded()),
                }
            }
            None => provider.refresh_after(stale.as_deref()).await,
        };

        let source = match refreshed {
            Ok(credential) => {
                debug!(
                    generation = credential.generation(),
                    "resending with refreshed credential"
                );
                return CallState::Resending { attempt };
            }
            Err(source) => source,
        };

        self.metrics.record_refresh_failure();
        let decision = RetryDecision {
            attempt: refresh_attempt,
            max_retries: self.refresh_retry_policy.configured_max_retries(),
            method: call.method.clone(),
            uri: call.redacted_uri.clone(),
            failure: FailureClass::AuthRefresh,
        };
        if let RetryAction::RetryAfter(delay) = self.refresh_retry_policy.decide(&decision) {
            let Some(delay) = bounded_retry_delay(delay, call.total_timeout, call.started_at)
            else {
                return CallState::Failed(call.deadline_exceeded());
            };
            warn!(
                refresh_attempt = refresh_attempt,
                delay_ms = delay.as_millis() as u64,
                error = %source,
                "retrying credential refresh"
            );
            self.metrics.record_refresh_retry();
            return CallState::Waiting {
                delay,
                resume: Box::new(CallState::Refreshing {
                    attempt,
                    refresh_attempt: refresh_attempt + 1,
                }),
            };
        }

        warn!(error = %source, "credential refresh budget exhausted");
        CallState::Failed(Error::AuthRefresh {
            unauthorized_status: StatusCode::UNAUTHORIZED.as_u16(),
            unauthorized_body: std::mem::take(&mut call.unauthorized_body),
            method: call.method.clone(),
            uri: call.redacted_uri.clone(),
            source,
        })
    }
}
