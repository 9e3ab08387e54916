use std::time::Duration;

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::IDEMPOTENCY_KEY_HEADER;
use crate::error::Error;
use crate::pipeline::{CallOptions, Pipeline};
use crate::response::Response;
use crate::retry::RetryPolicy;
use crate::util::{bearer_header_value, parse_header_name, parse_header_value};

/// An immutable HTTP request. Header rewrites produce a modified copy.
#[derive(Clone, Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(uri: Uri) -> Self {
        Self::new(Method::GET, uri)
    }

    pub fn post(uri: Uri) -> Self {
        Self::new(Method::POST, uri)
    }

    pub fn try_new(method: Method, uri: &str) -> crate::Result<Self> {
        let uri = uri.parse().map_err(|_| Error::InvalidUri {
            uri: uri.to_owned(),
        })?;
        Ok(Self::new(method, uri))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_with_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.with_header(name, value))
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_json<T>(self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|source| Error::Serialize { source })?;
        Ok(self
            .with_body(body)
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json")))
    }

    /// Copy of this request carrying `Authorization: Bearer <token>`.
    pub fn with_bearer(&self, token: &str) -> crate::Result<Self> {
        let value = bearer_header_value(token)?;
        Ok(self.clone().with_header(AUTHORIZATION, value))
    }

    pub(crate) fn into_parts(self) -> (Method, Uri, HeaderMap, Bytes) {
        (self.method, self.uri, self.headers, self.body)
    }
}

/// Convenience builder issued by [`Pipeline::request`] and friends.
pub struct RequestBuilder<'a> {
    pipeline: &'a Pipeline,
    method: Method,
    path: String,
    headers: HeaderMap,
    body: Bytes,
    options: CallOptions,
    error: Option<Error>,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(pipeline: &'a Pipeline, method: Method, path: String) -> Self {
        Self {
            pipeline,
            method,
            path,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            options: CallOptions::default(),
            error: None,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn idempotency_key(self, key: &str) -> crate::Result<Self> {
        self.try_header(IDEMPOTENCY_KEY_HEADER, key)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn json<T>(mut self, payload: &T) -> Self
    where
        T: Serialize + ?Sized,
    {
        match serde_json::to_vec(payload) {
            Ok(body) => {
                self.body = Bytes::from(body);
                self.headers
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
            Err(source) => self.error = Some(Error::Serialize { source }),
        }
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.request_timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn total_timeout(mut self, total_timeout: Duration) -> Self {
        self.options.total_timeout = Some(total_timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.options.retry_policy = Some(retry_policy);
        self
    }

    pub fn build(self) -> crate::Result<Request> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let uri = self.pipeline.resolve(&self.path)?;
        Ok(Request::new(self.method, uri)
            .with_headers(self.headers)
            .with_body(self.body))
    }

    pub async fn send(self) -> crate::Result<Response> {
        let pipeline = self.pipeline;
        let options = self.options.clone();
        let request = self.build()?;
        pipeline.execute_with(request, options).await
    }

    pub async fn send_json<T>(self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        let response = self.send().await?;
        response.json()
    }
}
