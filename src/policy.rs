use http::{HeaderMap, Method, StatusCode};

use crate::error::Error;
use crate::pipeline::Attempt;

/// Per-attempt view handed to every [`Interceptor`] stage.
#[derive(Clone, Debug)]
pub struct RequestContext {
    method: Method,
    uri: String,
    attempt: usize,
    max_attempts: usize,
    after_refresh: bool,
}

impl RequestContext {
    pub(crate) fn new(
        method: Method,
        uri: String,
        attempt: usize,
        max_attempts: usize,
        after_refresh: bool,
    ) -> Self {
        Self {
            method,
            uri,
            attempt,
            max_attempts,
            after_refresh,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Redacted target URI.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn after_refresh(&self) -> bool {
        self.after_refresh
    }
}

/// An ordered pipeline stage. Stages may rewrite outgoing headers and observe
/// outcomes; they cannot trigger a refresh or a retry.
///
/// `on_request` runs before the credential is attached, so a stage cannot
/// see or replace the bearer token.
pub trait Interceptor: Send + Sync {
    fn on_request(&self, _context: &RequestContext, _headers: &mut HeaderMap) {}

    fn on_response(&self, _context: &RequestContext, _status: StatusCode, _headers: &HeaderMap) {}

    fn on_error(&self, _context: &RequestContext, _error: &Error) {}

    /// Called once per send after its outcome is classified.
    fn on_attempt(&self, _attempt: &Attempt) {}
}
