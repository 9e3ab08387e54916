use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwapOption;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{Method, Uri};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{Instrument, debug, info_span, warn};

use crate::error::AuthError;
use crate::request::Request;
use crate::transport::Transport;
use crate::util::{lock_unpoisoned, redact_uri_for_logs, truncate_body};

const DEFAULT_TOKEN_FIELD: &str = "access_token";
const FALLBACK_TOKEN_FIELD: &str = "token";

/// A bearer token minted by one authentication exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    minted_at: SystemTime,
    generation: u64,
}

impl Credential {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn minted_at(&self) -> SystemTime {
        self.minted_at
    }

    /// Strictly increasing per provider; a larger value is a newer credential.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("minted_at", &self.minted_at)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Turns a successful auth response body into a bearer token.
pub trait TokenParser: Send + Sync {
    fn parse_token(&self, body: &[u8]) -> Option<String>;
}

/// Reads a string field from a JSON object body. Falls back to `token` when
/// the configured field is absent.
#[derive(Clone, Debug)]
pub struct JsonTokenParser {
    field: String,
}

impl JsonTokenParser {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl Default for JsonTokenParser {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_FIELD)
    }
}

impl TokenParser for JsonTokenParser {
    fn parse_token(&self, body: &[u8]) -> Option<String> {
        let value: serde_json::Value = serde_json::from_slice(body).ok()?;
        [self.field.as_str(), FALLBACK_TOKEN_FIELD]
            .into_iter()
            .filter_map(|field| value.get(field).and_then(serde_json::Value::as_str))
            .map(str::trim)
            .find(|token| !token.is_empty())
            .map(str::to_owned)
    }
}

/// Treats the whole trimmed body as the token.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlainTextTokenParser;

impl TokenParser for PlainTextTokenParser {
    fn parse_token(&self, body: &[u8]) -> Option<String> {
        let text = std::str::from_utf8(body).ok()?.trim();
        (!text.is_empty()).then(|| text.to_owned())
    }
}

/// Where and how to obtain a fresh credential.
#[derive(Clone)]
pub struct AuthEndpoint {
    request: Request,
    parser: Arc<dyn TokenParser>,
}

impl std::fmt::Debug for AuthEndpoint {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AuthEndpoint")
            .field("method", self.request.method())
            .field("uri", self.request.uri())
            .finish()
    }
}

impl AuthEndpoint {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            parser: Arc::new(JsonTokenParser::default()),
        }
    }

    /// `POST` to `uri` with an empty JSON object body.
    pub fn post(uri: Uri) -> Self {
        Self::new(
            Request::post(uri)
                .with_body("{}")
                .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json")),
        )
    }

    pub fn try_post(uri: &str) -> crate::Result<Self> {
        let request = Request::try_new(Method::POST, uri)?;
        Ok(Self::post(request.uri().clone()))
    }

    pub fn token_parser(mut self, parser: Arc<dyn TokenParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn uri(&self) -> &Uri {
        self.request.uri()
    }
}

pub type RefreshResult = Result<Arc<Credential>, Arc<AuthError>>;

enum Joined {
    Current(Arc<Credential>),
    Pending(watch::Receiver<Option<RefreshResult>>),
}

/// Owns the current credential and coalesces refreshes.
///
/// Cloning is cheap; clones share the credential and the in-flight exchange.
#[derive(Clone)]
pub struct AuthProvider {
    inner: Arc<AuthProviderInner>,
}

struct AuthProviderInner {
    transport: Arc<dyn Transport>,
    endpoint: AuthEndpoint,
    request_timeout: Option<Duration>,
    credential: ArcSwapOption<Credential>,
    next_generation: AtomicU64,
    exchanges: AtomicU64,
    in_flight: Mutex<Option<watch::Receiver<Option<RefreshResult>>>>,
}

impl std::fmt::Debug for AuthProvider {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AuthProvider")
            .field("endpoint", &self.inner.endpoint)
            .field("request_timeout", &self.inner.request_timeout)
            .field("credential", &self.inner.credential.load_full())
            .finish()
    }
}

impl AuthProvider {
    pub fn new<T>(transport: T, endpoint: AuthEndpoint) -> Self
    where
        T: Transport + 'static,
    {
        Self::build(Arc::new(transport), endpoint, None, None)
    }

    /// Seeds an initial credential. Call before sharing the provider.
    pub fn with_credential(self, token: impl Into<String>) -> Self {
        self.inner.store(token.into());
        self
    }

    pub fn request_timeout(self, request_timeout: Duration) -> Self {
        let inner = &self.inner;
        Self::build(
            inner.transport.clone(),
            inner.endpoint.clone(),
            Some(request_timeout.max(Duration::from_millis(1))),
            inner.credential.load_full(),
        )
    }

    fn build(
        transport: Arc<dyn Transport>,
        endpoint: AuthEndpoint,
        request_timeout: Option<Duration>,
        credential: Option<Arc<Credential>>,
    ) -> Self {
        let next_generation = credential.as_ref().map_or(0, |item| item.generation);
        Self {
            inner: Arc::new(AuthProviderInner {
                transport,
                endpoint,
                request_timeout,
                credential: ArcSwapOption::new(credential),
                next_generation: AtomicU64::new(next_generation),
                exchanges: AtomicU64::new(0),
                in_flight: Mutex::new(None),
            }),
        }
    }

    pub fn endpoint(&self) -> &AuthEndpoint {
        &self.inner.endpoint
    }

    /// Lock-free snapshot of the stored credential.
    pub fn current_credential(&self) -> Option<Arc<Credential>> {
        self.inner.credential.load_full()
    }

    /// Number of exchanges actually sent to the auth endpoint.
    pub fn exchange_count(&self) -> u64 {
        self.inner.exchanges.load(Ordering::Relaxed)
    }

    /// Joins the in-flight exchange or starts one. Every caller joined to the
    /// same exchange observes the same result.
    pub async fn refresh(&self) -> RefreshResult {
        match self.subscribe_or_start(None) {
            Joined::Current(credential) => Ok(credential),
            Joined::Pending(receiver) => self.wait(receiver).await,
        }
    }

    /// Refreshes only if nobody replaced `stale` yet; otherwise hands back the
    /// newer credential without touching the network.
    pub async fn refresh_after(&self, stale: Option<&Credential>) -> RefreshResult {
        // Generations start at 1, so 0 means any stored credential is newer.
        let stale_generation = stale.map_or(0, |stale| stale.generation);
        match self.subscribe_or_start(Some(stale_generation)) {
            Joined::Current(credential) => {
                debug!(
                    generation = credential.generation,
                    "credential already replaced, skipping exchange"
                );
                Ok(credential)
            }
            Joined::Pending(receiver) => self.wait(receiver).await,
        }
    }

    async fn wait(&self, mut receiver: watch::Receiver<Option<RefreshResult>>) -> RefreshResult {
        match receiver.wait_for(Option::is_some).await {
            Ok(outcome) => Option::clone(&outcome).unwrap_or_else(|| Err(self.abandoned())),
            Err(_) => Err(self.abandoned()),
        }
    }

    /// Reads the slot before the credential. An exchange stores its credential
    /// before publishing, so a finished slot means the newer generation is
    /// already visible here.
    fn subscribe_or_start(&self, stale_generation: Option<u64>) -> Joined {
        let mut slot = lock_unpoisoned(&self.inner.in_flight);
        let pending = slot
            .as_ref()
            .filter(|receiver| receiver.borrow().is_none() && receiver.has_changed().is_ok())
            .cloned();

        if let Some(stale_generation) = stale_generation
            && let Some(current) = self.current_credential()
            && current.generation > stale_generation
        {
            return Joined::Current(current);
        }
        if let Some(receiver) = pending {
            return Joined::Pending(receiver);
        }

        let (sender, receiver) = watch::channel(None);
        *slot = Some(receiver.clone());
        drop(slot);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let outcome = inner.exchange().await;
            sender.send_replace(Some(outcome));
        });
        Joined::Pending(receiver)
    }

    fn abandoned(&self) -> Arc<AuthError> {
        Arc::new(AuthError::Abandoned {
            uri: self.inner.redacted_uri(),
        })
    }
}

impl AuthProviderInner {
    fn redacted_uri(&self) -> String {
        redact_uri_for_logs(&self.endpoint.uri().to_string())
    }

    fn store(&self, token: String) -> Arc<Credential> {
        let generation = self.next_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let credential = Arc::new(Credential {
            token,
            minted_at: SystemTime::now(),
            generation,
        });
        self.credential.store(Some(credential.clone()));
        credential
    }

    async fn exchange(&self) -> RefreshResult {
        let uri = self.redacted_uri();
        let span = info_span!("authpipe.refresh", uri = %uri);
        async {
            self.exchanges.fetch_add(1, Ordering::Relaxed);
            debug!("starting credential exchange");
            match self.exchange_once(&uri).await {
                Ok(credential) => {
                    debug!(generation = credential.generation, "credential refreshed");
                    Ok(credential)
                }
                Err(error) => {
                    warn!(error = %error, "credential exchange failed");
                    Err(Arc::new(error))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn exchange_once(&self, uri: &str) -> Result<Arc<Credential>, AuthError> {
        let send = self.transport.send(self.endpoint.request.clone());
        let sent = match self.request_timeout {
            Some(request_timeout) => match timeout(request_timeout, send).await {
                Ok(sent) => sent,
                Err(_) => {
                    return Err(AuthError::Timeout {
                        uri: uri.to_owned(),
                        timeout_ms: request_timeout.as_millis(),
                    });
                }
            },
            None => send.await,
        };
        let response = sent.map_err(|source| AuthError::Transport {
            uri: uri.to_owned(),
            source,
        })?;

        if !response.status().is_success() {
            return Err(AuthError::Status {
                status: response.status().as_u16(),
                uri: uri.to_owned(),
                body: truncate_body(response.body()),
            });
        }

        let token = self
            .endpoint
            .parser
            .parse_token(response.body())
            .ok_or_else(|| AuthError::MissingToken {
                uri: uri.to_owned(),
            })?;
        Ok(self.store(token))
    }
}
