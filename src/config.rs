use std::time::Duration;

use serde::Deserialize;

use crate::retry::RetryPolicy;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;
const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Settings handed to [`HyperTransport`](crate::HyperTransport). Pool behaviour
/// belongs to the transport; the pipeline never inspects it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub http2_only: bool,
    pub max_response_body_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            http2_only: false,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = pool_idle_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.pool_max_idle_per_host = pool_max_idle_per_host.max(1);
        self
    }

    pub fn http2_only(mut self, http2_only: bool) -> Self {
        self.http2_only = http2_only;
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PipelineProfile {
    #[default]
    Standard,
    LowLatency,
    HighThroughput,
}

#[derive(Clone, Debug)]
pub struct ProfileDefaults {
    pub request_timeout: Duration,
    pub total_timeout: Option<Duration>,
    pub retry_policy: RetryPolicy,
    pub refresh_retry_policy: RetryPolicy,
    pub transport: TransportConfig,
}

impl PipelineProfile {
    pub fn defaults(self) -> ProfileDefaults {
        match self {
            Self::Standard => ProfileDefaults {
                request_timeout: Duration::from_secs(10),
                total_timeout: None,
                retry_policy: RetryPolicy::fixed_delay(3, Duration::from_secs(1)),
                refresh_retry_policy: RetryPolicy::fixed_delay(3, Duration::from_secs(1)),
                transport: TransportConfig::default(),
            },
            Self::LowLatency => ProfileDefaults {
                request_timeout: Duration::from_secs(2),
                total_timeout: Some(Duration::from_secs(5)),
                retry_policy: RetryPolicy::standard()
                    .max_retries(1)
                    .base_backoff(Duration::from_millis(50))
                    .max_backoff(Duration::from_millis(300)),
                refresh_retry_policy: RetryPolicy::fixed_delay(1, Duration::from_millis(100)),
                transport: TransportConfig::default()
                    .connect_timeout(Duration::from_secs(1))
                    .read_timeout(Duration::from_secs(2)),
            },
            Self::HighThroughput => ProfileDefaults {
                request_timeout: Duration::from_secs(20),
                total_timeout: Some(Duration::from_secs(60)),
                retry_policy: RetryPolicy::standard()
                    .max_retries(4)
                    .base_backoff(Duration::from_millis(150))
                    .max_backoff(Duration::from_secs(3)),
                refresh_retry_policy: RetryPolicy::fixed_delay(3, Duration::from_secs(1)),
                transport: TransportConfig::default()
                    .pool_max_idle_per_host(64)
                    .max_response_body_bytes(32 * 1024 * 1024),
            },
        }
    }
}

/// Externally supplied configuration surface. Durations are milliseconds.
///
/// ```
/// let config: authpipe::PipelineConfig = serde_json::from_str(
///     r#"{ "base_url": "http://127.0.0.1:8080", "max_retries": 3, "retry_delay_ms": 1000 }"#,
/// )
/// .unwrap();
/// assert_eq!(config.max_retries, Some(3));
/// ```
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub base_url: String,
    pub client_name: Option<String>,
    pub max_connections: Option<usize>,
    pub pool_idle_timeout_ms: Option<u64>,
    pub pool_max_idle_per_host: Option<usize>,
    pub connect_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub total_timeout_ms: Option<u64>,
    pub max_retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
    pub max_refresh_retries: Option<usize>,
    pub refresh_retry_delay_ms: Option<u64>,
}

impl PipelineConfig {
    pub fn from_json_str(text: &str) -> crate::Result<Self> {
        serde_json::from_str(text).map_err(|source| crate::Error::Deserialize {
            source,
            body: crate::util::truncate_body(text.as_bytes()),
        })
    }

    pub(crate) fn transport_config(&self, base: TransportConfig) -> TransportConfig {
        let mut transport = base;
        if let Some(ms) = self.connect_timeout_ms {
            transport = transport.connect_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.pool_idle_timeout_ms {
            transport = transport.pool_idle_timeout(Duration::from_millis(ms));
        }
        if let Some(count) = self.pool_max_idle_per_host {
            transport = transport.pool_max_idle_per_host(count);
        }
        transport
    }

    pub(crate) fn retry_policy(&self, base: RetryPolicy) -> RetryPolicy {
        override_fixed_delay(base, self.max_retries, self.retry_delay_ms)
    }

    pub(crate) fn refresh_retry_policy(&self, base: RetryPolicy) -> RetryPolicy {
        override_fixed_delay(base, self.max_refresh_retries, self.refresh_retry_delay_ms)
    }
}

fn override_fixed_delay(
    base: RetryPolicy,
    max_retries: Option<usize>,
    delay_ms: Option<u64>,
) -> RetryPolicy {
    match (max_retries, delay_ms) {
        (None, None) => base,
        (retries, Some(delay_ms)) => RetryPolicy::fixed_delay(
            retries.unwrap_or_else(|| base.configured_max_retries()),
            Duration::from_millis(delay_ms),
        ),
        (Some(retries), None) => base.max_retries(retries),
    }
}
