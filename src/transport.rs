use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;

use crate::config::TransportConfig;
use crate::error::{TransportError, TransportErrorKind};
use crate::request::Request;
use crate::response::Response;
use crate::util::classify_transport_error;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A dumb conduit: one request in, one response or transport failure out.
///
/// Implementations must not retry, follow redirects or touch credentials.
pub trait Transport: Send + Sync {
    fn send(&self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>>;
}

impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    fn send(&self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>> {
        (**self).send(request)
    }
}

#[cfg(feature = "tls-rustls-ring")]
type Connector = hyper_rustls::HttpsConnector<HttpConnector>;
#[cfg(not(feature = "tls-rustls-ring"))]
type Connector = HttpConnector;

/// [`Transport`] backed by the pooled `hyper-util` legacy client.
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<Connector, Full<Bytes>>,
    read_timeout: Duration,
    max_response_body_bytes: usize,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HyperTransport")
            .field("read_timeout", &self.read_timeout)
            .field("max_response_body_bytes", &self.max_response_body_bytes)
            .finish()
    }
}

impl HyperTransport {
    pub fn new(config: &TransportConfig) -> crate::Result<Self> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_connect_timeout(Some(config.connect_timeout));

        let connector = build_connector(http)?;
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .http2_only(config.http2_only)
            .build(connector);

        Ok(Self {
            client,
            read_timeout: config.read_timeout,
            max_response_body_bytes: config.max_response_body_bytes,
        })
    }

    async fn exchange(&self, request: Request) -> Result<Response, TransportError> {
        let (method, uri, headers, body) = request.into_parts();
        let mut builder = http::Request::builder().method(method).uri(uri);
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        let http_request = builder
            .body(Full::new(body))
            .map_err(|source| TransportError::new(TransportErrorKind::OtherIo, source))?;

        let response = self.client.request(http_request).await.map_err(|error| {
            let kind = classify_transport_error(&error);
            TransportError::new(kind, error)
        })?;
        let (parts, body) = response.into_parts();
        let body = read_all_body_limited(body, self.max_response_body_bytes).await?;
        Ok(Response::new(parts.status, parts.headers, body))
    }
}

impl Transport for HyperTransport {
    fn send(&self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>> {
        Box::pin(async move {
            match timeout(self.read_timeout, self.exchange(request)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::new(
                    TransportErrorKind::ReadTimeout,
                    format!(
                        "no complete response within {}ms",
                        self.read_timeout.as_millis()
                    ),
                )),
            }
        })
    }
}

#[cfg(feature = "tls-rustls-ring")]
fn build_connector(http: HttpConnector) -> crate::Result<Connector> {
    let builder = hyper_rustls::HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
        .map_err(|error| crate::error::Error::TransportBuild {
            message: error.to_string(),
        })?;
    Ok(builder
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http))
}

#[cfg(not(feature = "tls-rustls-ring"))]
fn build_connector(http: HttpConnector) -> crate::Result<Connector> {
    Ok(http)
}

async fn read_all_body_limited(
    mut body: Incoming,
    max_bytes: usize,
) -> Result<Bytes, TransportError> {
    let mut collected = Vec::new();

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|source| {
            let kind = if source.is_timeout() {
                TransportErrorKind::ReadTimeout
            } else {
                TransportErrorKind::OtherIo
            };
            TransportError::new(kind, source)
        })?;
        if let Some(data) = frame.data_ref() {
            if collected.len().saturating_add(data.len()) > max_bytes {
                return Err(TransportError::new(
                    TransportErrorKind::OtherIo,
                    format!("response body exceeds {max_bytes} bytes"),
                ));
            }
            collected.extend_from_slice(data);
        }
    }

    Ok(Bytes::from(collected))
}
