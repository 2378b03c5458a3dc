//! Configuration types for client connections

use std::time::Duration;

/// What to do with in-flight requests when the connection drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryStrategy {
    /// Fail every unacknowledged request with a null reply on disconnect.
    /// No command is ever written to the wire twice.
    #[default]
    NoRetries,
    /// Replay unacknowledged requests on reconnect, but fail any request
    /// older than the given duration at reconnect time.
    WithTimeout(Duration),
    /// Replay unacknowledged requests on reconnect, forever.
    InfiniteRetries,
}

impl RetryStrategy {
    /// Whether any replay happens at all
    #[must_use]
    pub const fn active(&self) -> bool {
        !matches!(self, Self::NoRetries)
    }
}

/// How `execute()` behaves when too many requests are unacknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureStrategy {
    /// Never block producers
    Infinite,
    /// Block producers once this many requests are unacknowledged
    RateLimitPendingRequests(usize),
}

/// Default pending-request limit
pub const DEFAULT_PENDING_REQUEST_LIMIT: usize = 262_144;

impl Default for BackpressureStrategy {
    fn default() -> Self {
        Self::RateLimitPendingRequests(DEFAULT_PENDING_REQUEST_LIMIT)
    }
}

impl BackpressureStrategy {
    /// The pending-request limit, if rate limiting is active
    #[must_use]
    pub const fn limit(&self) -> Option<usize> {
        match self {
            Self::Infinite => None,
            Self::RateLimitPendingRequests(n) => Some(*n),
        }
    }
}

/// TLS material handed to the transport adapter. The adapter itself is
/// pluggable; this struct only carries configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// Whether TLS is requested at all
    pub active: bool,
    /// Path to the client certificate, PEM
    pub certificate_path: Option<String>,
    /// Path to the client key, PEM
    pub key_path: Option<String>,
    /// Path to the CA bundle, PEM
    pub ca_path: Option<String>,
}

/// Reconnection backoff starts here.
pub const BACKOFF_INITIAL: Duration = Duration::from_millis(1);
/// Reconnection backoff doubles up to this cap.
pub const BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Connection options for a client instance.
#[derive(Debug, Clone)]
pub struct Options {
    /// Follow `MOVED` redirects transparently instead of surfacing them
    pub transparent_redirects: bool,

    /// In-flight request handling across reconnects
    pub retry_strategy: RetryStrategy,

    /// Producer throttling
    pub backpressure: BackpressureStrategy,

    /// TLS material for the transport adapter
    pub tls: TlsConfig,

    /// Per-endpoint connect timeout
    pub connect_timeout: Duration,

    /// TCP keepalive interval, if any
    pub tcp_keepalive: Option<Duration>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            transparent_redirects: false,
            retry_strategy: RetryStrategy::default(),
            backpressure: BackpressureStrategy::default(),
            tls: TlsConfig::default(),
            connect_timeout: Duration::from_secs(5),
            tcp_keepalive: Some(Duration::from_secs(60)),
        }
    }
}

impl Options {
    /// Enable transparent MOVED redirect handling
    #[must_use]
    pub const fn with_transparent_redirects(mut self, enabled: bool) -> Self {
        self.transparent_redirects = enabled;
        self
    }

    /// Set the retry strategy
    #[must_use]
    pub const fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = strategy;
        self
    }

    /// Set the backpressure strategy
    #[must_use]
    pub const fn with_backpressure(mut self, strategy: BackpressureStrategy) -> Self {
        self.backpressure = strategy;
        self
    }

    /// Set the TLS configuration
    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Set the per-endpoint connect timeout
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}
