//! `authpipe` runs HTTP calls through a pipeline that attaches bearer
//! credentials, refreshes them once on `401 Unauthorized` and retries transient
//! failures within bounded budgets.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use authpipe::prelude::{AuthEndpoint, AuthProvider, HyperTransport, Pipeline, RetryPolicy};
//! use authpipe::TransportConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = HyperTransport::new(&TransportConfig::default())?;
//!     let auth = AuthProvider::new(
//!         transport.clone(),
//!         AuthEndpoint::try_post("https://api.example.com/auth")?,
//!     );
//!
//!     let pipeline = Pipeline::builder("https://api.example.com")
//!         .client_name("my-sdk")
//!         .request_timeout(Duration::from_secs(3))
//!         .total_timeout(Duration::from_secs(8))
//!         .retry_policy(RetryPolicy::fixed_delay(3, Duration::from_secs(1)))
//!         .refresh_retry_policy(RetryPolicy::fixed_delay(3, Duration::from_secs(1)))
//!         .auth_provider(auth)
//!         .transport(transport)
//!         .build()?;
//!
//!     let response = pipeline.get("/test").send().await?;
//!     println!("{}", response.text_lossy());
//!     Ok(())
//! }
//! ```
//!
//! # Guarantees
//!
//! - At most one credential refresh per logical call. A second `401` fails
//!   with [`Error::Unauthorized`].
//! - Concurrent calls that hit `401` together share one auth exchange.
//! - Main-request retries and refresh retries draw from separate budgets.
//! - Transient failures are retried for every method by default.
//!   [`StrictRetryEligibility`] limits retries to idempotent methods and
//!   requests carrying an `idempotency-key` header.

pub(crate) const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

mod auth;
mod config;
mod error;
mod limiters;
mod metrics;
mod pipeline;
mod policy;
mod request;
mod response;
mod retry;
mod transport;
mod util;

pub use crate::auth::{
    AuthEndpoint, AuthProvider, Credential, JsonTokenParser, PlainTextTokenParser, RefreshResult,
    TokenParser,
};
pub use crate::config::{PipelineConfig, PipelineProfile, ProfileDefaults, TransportConfig};
pub use crate::error::{
    AuthError, Error, ErrorCode, FailureClass, TransportError, TransportErrorKind,
};
pub use crate::metrics::PipelineMetricsSnapshot;
pub use crate::pipeline::{Attempt, AttemptOutcome, CallOptions, Pipeline, PipelineBuilder};
pub use crate::policy::{Interceptor, RequestContext};
pub use crate::request::{Request, RequestBuilder};
pub use crate::response::Response;
pub use crate::retry::{
    PermissiveRetryEligibility, RetryAction, RetryClassifier, RetryDecision, RetryEligibility,
    RetryPolicy, StrictRetryEligibility,
};
pub use crate::transport::{BoxFuture, HyperTransport, Transport};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        AuthEndpoint, AuthError, AuthProvider, Credential, Error, ErrorCode, FailureClass,
        HyperTransport, Interceptor, Pipeline, PipelineConfig, PipelineMetricsSnapshot,
        PipelineProfile, Request, RequestContext, Response, Result, RetryAction, RetryPolicy,
        Transport, TransportError, TransportErrorKind,
    };
}

#[cfg(test)]
mod tests;
