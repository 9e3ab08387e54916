use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use authpipe::prelude::{
    AuthEndpoint, AuthProvider, Interceptor, Pipeline, Request, Response, RetryPolicy, Transport,
    TransportError,
};
use authpipe::{Attempt, BoxFuture};
use bytes::Bytes;
use http::header::AUTHORIZATION;
use http::{HeaderMap, StatusCode};

/// Stand-in backend: `/auth` mints `token-N`, `/image` rejects anything but the
/// latest token and answers its first authorized send with `503`.
#[derive(Default)]
struct DemoBackend {
    minted: AtomicUsize,
    image_sends: AtomicUsize,
    issued: Mutex<Option<String>>,
}

impl DemoBackend {
    fn respond(&self, request: &Request) -> Response {
        if request.uri().path() == "/auth" {
            let minted = self.minted.fetch_add(1, Ordering::SeqCst) + 1;
            let token = format!("token-{minted}");
            if let Ok(mut issued) = self.issued.lock() {
                *issued = Some(format!("Bearer {token}"));
            }
            return reply(StatusCode::OK, format!(r#"{{"access_token":"{token}"}}"#));
        }

        let presented = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        let issued = self.issued.lock().ok().and_then(|issued| issued.clone());
        if presented.is_none() || presented != issued.as_deref() {
            return reply(StatusCode::UNAUTHORIZED, "token expired");
        }
        if self.image_sends.fetch_add(1, Ordering::SeqCst) == 0 {
            return reply(StatusCode::SERVICE_UNAVAILABLE, "warming up");
        }
        reply(StatusCode::OK, "image stored")
    }
}

fn reply(status: StatusCode, body: impl Into<Bytes>) -> Response {
    Response::new(status, HeaderMap::new(), body.into())
}

#[derive(Clone)]
struct DemoTransport(Arc<DemoBackend>);

impl Transport for DemoTransport {
    fn send(&self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>> {
        Box::pin(async move { Ok(self.0.respond(&request)) })
    }
}

struct PrintAttempts;

impl Interceptor for PrintAttempts {
    fn on_attempt(&self, attempt: &Attempt) {
        println!(
            "attempt={} after_refresh={} refresh_triggered={} outcome={:?}",
            attempt.index, attempt.after_refresh, attempt.refresh_triggered, attempt.outcome
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let transport = DemoTransport(Arc::new(DemoBackend::default()));
    let auth = AuthProvider::new(
        transport.clone(),
        AuthEndpoint::try_post("http://demo.local/auth")?,
    )
    .with_credential("stale-token");

    let pipeline = Pipeline::builder("http://demo.local")
        .client_name("authpipe-example-refresh")
        .retry_policy(RetryPolicy::fixed_delay(3, Duration::from_millis(100)))
        .refresh_retry_policy(RetryPolicy::fixed_delay(3, Duration::from_millis(100)))
        .auth_provider(auth)
        .interceptor(Arc::new(PrintAttempts))
        .transport(transport)
        .build()?;

    let response = pipeline.post("/image").body("{}").send().await?;
    println!("status={} body={}", response.status(), response.text_lossy());

    let metrics = pipeline.metrics_snapshot();
    println!(
        "sends={} refreshes={} retries={}",
        metrics.sends, metrics.refreshes, metrics.retries
    );
    Ok(())
}
