use crate::payload::Presence;
use std::time::Duration;

/// Gateway protocol version spoken by this crate
pub const GATEWAY_VERSION: u8 = 10;

/// Configuration for a [`Client`](crate::Client)
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bot token, sent verbatim in IDENTIFY/RESUME and the `Authorization` header
    pub token: String,
    /// Gateway (sharded socket) settings
    pub gateway: GatewayConfig,
    /// REST dispatcher settings
    pub rest: RestConfig,
}

impl ClientConfig {
    /// Create a new builder for configuration
    pub fn builder(token: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder {
            config: ClientConfig {
                token: token.into(),
                gateway: GatewayConfig::default(),
                rest: RestConfig::default(),
            },
        }
    }
}

/// Builder for ClientConfig
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Set gateway configuration
    pub fn gateway(mut self, config: GatewayConfig) -> Self {
        self.config.gateway = config;
        self
    }

    /// Set REST configuration
    pub fn rest(mut self, config: RestConfig) -> Self {
        self.config.rest = config;
        self
    }

    /// Set the gateway intents bitmask
    pub fn intents(mut self, intents: u64) -> Self {
        self.config.gateway.intents = intents;
        self
    }

    /// Set the identify concurrency
    pub fn concurrency(mut self, concurrency: Concurrency) -> Self {
        self.config.gateway.concurrency = concurrency;
        self
    }

    /// Set the total shard count
    pub fn shard_count(mut self, count: ShardCount) -> Self {
        self.config.gateway.shard_count = count;
        self
    }

    /// Restrict this process to a range of shard IDs
    pub fn shard_range(mut self, first: u32, last: u32) -> Self {
        self.config.gateway.first_shard_id = first;
        self.config.gateway.last_shard_id = Some(last);
        self
    }

    /// Enable or disable automatic reconnection
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.gateway.auto_reconnect = enabled;
        self
    }

    /// Set the initial presence sent with IDENTIFY
    pub fn presence(mut self, presence: Presence) -> Self {
        self.config.gateway.presence = presence;
        self
    }

    /// Build the configuration with validation.
    pub fn build(mut self) -> Result<ClientConfig, ConfigError> {
        if self.config.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }

        self.config.gateway.validate()?;
        self.config.rest.validate()?;

        // Out-of-range concurrency falls back to the server-advertised value
        if let Concurrency::Fixed(0) = self.config.gateway.concurrency {
            self.config.gateway.concurrency = Concurrency::Auto;
        }

        Ok(self.config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Token missing or blank
    #[error("Token must not be empty")]
    MissingToken,
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// Invalid shard configuration
    #[error("Invalid shard configuration: {0}")]
    InvalidShards(String),
    /// Invalid bucket configuration
    #[error("Invalid bucket configuration: {0}")]
    InvalidBucket(String),
    /// Invalid REST configuration
    #[error("Invalid REST configuration: {0}")]
    InvalidRest(String),
}

/// Identify concurrency quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Concurrency {
    /// Use the value advertised by `GET /gateway/bot`
    #[default]
    Auto,
    /// Use a fixed number of concurrency keys
    Fixed(u32),
}

impl Concurrency {
    /// Resolve against the server-advertised value, normalizing values below 1.
    pub fn resolve(self, advertised: Option<u32>) -> u32 {
        match self {
            Concurrency::Fixed(n) if n >= 1 => n,
            _ => advertised.filter(|n| *n >= 1).unwrap_or(1),
        }
    }
}

/// Total number of shards across all processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardCount {
    /// Use the recommended count from `GET /gateway/bot`
    #[default]
    Auto,
    /// Use a fixed count
    Fixed(u32),
}

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Override for the gateway URL (otherwise discovered via REST)
    pub url: Option<String>,
    /// Gateway protocol version
    pub version: u8,
    /// Intents bitmask
    pub intents: u64,
    /// Member count above which a guild is considered large
    pub large_threshold: u32,
    /// Total shards
    pub shard_count: ShardCount,
    /// First shard ID handled by this process
    pub first_shard_id: u32,
    /// Last shard ID handled by this process (defaults to `shard_count - 1`)
    pub last_shard_id: Option<u32>,
    /// Identify concurrency
    pub concurrency: Concurrency,
    /// Reconnect automatically after recoverable disconnects
    pub auto_reconnect: bool,
    /// Deadline for the socket to reach HELLO
    pub connect_timeout: Duration,
    /// Resume attempts before the session is invalidated
    pub max_resume_attempts: u32,
    /// Backoff used while the session is not resumable
    pub backoff: BackoffConfig,
    /// Per-shard outbound frame pacing
    pub frame_bucket: BucketConfig,
    /// Pacing for PRESENCE_UPDATE frames
    pub presence_bucket: BucketConfig,
    /// Presence sent with IDENTIFY and restored on hard reset
    pub presence: Presence,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: None,
            version: GATEWAY_VERSION,
            intents: 0,
            large_threshold: 250,
            shard_count: ShardCount::Auto,
            first_shard_id: 0,
            last_shard_id: None,
            concurrency: Concurrency::Auto,
            auto_reconnect: true,
            connect_timeout: Duration::from_secs(30),
            max_resume_attempts: 10,
            backoff: BackoffConfig::default(),
            frame_bucket: BucketConfig {
                capacity: 120,
                window: Duration::from_secs(60),
                reserved: 5,
            },
            presence_bucket: BucketConfig {
                capacity: 5,
                window: Duration::from_secs(20),
                reserved: 0,
            },
            presence: Presence::default(),
        }
    }
}

impl GatewayConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.backoff.validate()?;
        self.frame_bucket.validate()?;
        self.presence_bucket.validate()?;

        if let ShardCount::Fixed(0) = self.shard_count {
            return Err(ConfigError::InvalidShards(
                "shard_count cannot be 0".to_string(),
            ));
        }

        if let Some(last) = self.last_shard_id {
            if last < self.first_shard_id {
                return Err(ConfigError::InvalidShards(
                    "last_shard_id must be >= first_shard_id".to_string(),
                ));
            }
            if let ShardCount::Fixed(count) = self.shard_count {
                if last >= count {
                    return Err(ConfigError::InvalidShards(format!(
                        "last_shard_id {} is outside shard_count {}",
                        last, count
                    )));
                }
            }
        }

        Ok(())
    }

    /// Build the connect URL for a base gateway URL.
    pub fn connect_url(&self, base: &str) -> String {
        format!(
            "{}/?v={}&encoding=json",
            base.split('?').next().unwrap_or(base).trim_end_matches('/'),
            self.version
        )
    }
}

/// Token bucket pacing configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketConfig {
    /// Tokens available per window
    pub capacity: u32,
    /// Window length
    pub window: Duration,
    /// Tokens held back for priority callers
    pub reserved: u32,
}

impl BucketConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::InvalidBucket(
                "capacity cannot be 0".to_string(),
            ));
        }
        if self.reserved >= self.capacity {
            return Err(ConfigError::InvalidBucket(
                "reserved must be < capacity".to_string(),
            ));
        }
        if self.window.is_zero() {
            return Err(ConfigError::InvalidBucket(
                "window must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Backoff configuration for reconnects of non-resumable sessions
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial delay, restored after READY/RESUMED
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts
    pub max_delay: Duration,
    /// Grow by a random factor in [1, 3) instead of doubling
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter: true,
        }
    }
}

impl BackoffConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_delay.is_zero() {
            return Err(ConfigError::InvalidBackoff(
                "initial_delay must be > 0".to_string(),
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::InvalidBackoff(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }
        Ok(())
    }

    /// Calculate the interval that follows `current`.
    ///
    /// With jitter the interval grows by `round(current * (random * 2 + 1))`,
    /// otherwise it doubles. Either way it is capped at `max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let current_ms = current.as_millis() as f64;
        let factor = if self.jitter {
            rand::random::<f64>() * 2.0 + 1.0
        } else {
            2.0
        };
        let next = (current_ms * factor).round();
        let capped = next.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// REST dispatcher configuration
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// API origin
    pub base_url: String,
    /// API version segment (`/api/v{n}`)
    pub api_version: u8,
    /// Per-request deadline
    pub request_timeout: Duration,
    /// Clock drift above which a warning is logged
    pub latency_threshold: Duration,
    /// Initial latency estimate, also seeds every sample slot
    pub ratelimiter_offset: Duration,
    /// Additional attempts after a 502
    pub max_bad_gateway_retries: u32,
    /// User agent string
    pub user_agent: String,
    /// Optional `X-Super-Properties` header value
    pub super_properties: Option<String>,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: "https://discord.com".to_string(),
            api_version: GATEWAY_VERSION,
            request_timeout: Duration::from_secs(15),
            latency_threshold: Duration::from_secs(30),
            ratelimiter_offset: Duration::ZERO,
            max_bad_gateway_retries: 3,
            user_agent: format!(
                "DiscordBot (https://github.com/shardwire/shardwire, {})",
                env!("CARGO_PKG_VERSION")
            ),
            super_properties: None,
        }
    }
}

impl RestConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if url::Url::parse(&self.base_url).is_err() {
            return Err(ConfigError::InvalidRest(format!(
                "base_url '{}' is not a valid URL",
                self.base_url
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidRest(
                "request_timeout must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Path prefix for every request
    pub fn base_path(&self) -> String {
        format!("/api/v{}", self.api_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_without_jitter_doubles_and_caps() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter: false,
        };

        assert_eq!(config.next_delay(Duration::from_millis(1000)), Duration::from_millis(2000));
        assert_eq!(config.next_delay(Duration::from_millis(8000)), Duration::from_millis(16_000));
        assert_eq!(config.next_delay(Duration::from_millis(20_000)), Duration::from_millis(30_000));
    }

    #[test]
    fn test_backoff_with_jitter_stays_in_range() {
        let config = BackoffConfig::default();

        let mut delay = config.initial_delay;
        for _ in 0..50 {
            let next = config.next_delay(delay);
            assert!(next >= delay.min(config.max_delay));
            assert!(next <= Duration::from_millis(30_000));
            delay = next;
        }
        assert_eq!(delay, Duration::from_millis(30_000));
    }

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::builder("Bot abc")
            .intents(513)
            .shard_count(ShardCount::Fixed(4))
            .shard_range(0, 1)
            .auto_reconnect(false)
            .build()
            .expect("valid config");

        assert_eq!(config.gateway.intents, 513);
        assert_eq!(config.gateway.last_shard_id, Some(1));
        assert!(!config.gateway.auto_reconnect);
        assert_eq!(config.rest.request_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_config_builder_rejects_empty_token() {
        assert!(matches!(
            ClientConfig::builder("  ").build(),
            Err(ConfigError::MissingToken)
        ));
    }

    #[test]
    fn test_config_builder_rejects_range_outside_count() {
        let result = ClientConfig::builder("Bot abc")
            .shard_count(ShardCount::Fixed(2))
            .shard_range(0, 2)
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn test_zero_concurrency_normalizes_to_auto() {
        let config = ClientConfig::builder("Bot abc")
            .concurrency(Concurrency::Fixed(0))
            .build()
            .expect("valid config");

        assert_eq!(config.gateway.concurrency, Concurrency::Auto);
        assert_eq!(config.gateway.concurrency.resolve(Some(16)), 16);
        assert_eq!(Concurrency::Auto.resolve(None), 1);
        assert_eq!(Concurrency::Fixed(4).resolve(Some(16)), 4);
    }

    #[test]
    fn test_connect_url_strips_query_and_adds_slash() {
        let config = GatewayConfig::default();
        assert_eq!(
            config.connect_url("wss://gateway.example.gg?v=9"),
            "wss://gateway.example.gg/?v=10&encoding=json"
        );
        assert_eq!(
            config.connect_url("wss://gateway-us-east1-b.example.gg/"),
            "wss://gateway-us-east1-b.example.gg/?v=10&encoding=json"
        );
    }
}
