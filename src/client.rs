use crate::config::{ClientConfig, ConfigError, GatewayConfig, ShardCount};
use crate::error::Error;
use crate::events::{EventEmitter, GatewayEvent};
use crate::manager::ShardManager;
use crate::metrics::Metrics;
use crate::rest::{Dispatcher, GatewayBot};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

/// Where and how many shards to run, after discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPlan {
    /// Gateway URL without query string
    pub url: String,
    /// Total shards across all processes
    pub shard_count: u32,
    /// First shard run by this process
    pub first_shard_id: u32,
    /// Last shard run by this process
    pub last_shard_id: u32,
    /// Resolved identify concurrency
    pub concurrency: u32,
}

impl ShardPlan {
    /// Resolve the gateway settings against a discovery response.
    ///
    /// `bot` is required when the URL or shard count is left to the server.
    pub fn resolve(config: &GatewayConfig, bot: Option<&GatewayBot>) -> Result<Self, Error> {
        let url = match (&config.url, bot) {
            (Some(url), _) => url.clone(),
            (None, Some(bot)) if !bot.url.is_empty() => bot.url.clone(),
            _ => {
                return Err(Error::ConnectionFailed(
                    "Invalid response from gateway REST call".to_string(),
                ))
            }
        };
        let url = url.split('?').next().unwrap_or_default().to_string();

        let shard_count = match (config.shard_count, bot) {
            (ShardCount::Fixed(count), _) => count,
            (ShardCount::Auto, Some(bot)) if bot.shards > 0 => bot.shards,
            (ShardCount::Auto, _) => {
                return Err(Error::ConnectionFailed(
                    "Invalid response from gateway REST call".to_string(),
                ))
            }
        };

        let last_shard_id = config.last_shard_id.unwrap_or(shard_count - 1);
        if last_shard_id >= shard_count || config.first_shard_id > last_shard_id {
            return Err(Error::Config(ConfigError::InvalidShards(format!(
                "shards {}..={} do not fit shard_count {}",
                config.first_shard_id, last_shard_id, shard_count
            ))));
        }

        let advertised = bot.map(|b| b.session_start_limit.max_concurrency);

        Ok(Self {
            url,
            shard_count,
            first_shard_id: config.first_shard_id,
            last_shard_id,
            concurrency: config.concurrency.resolve(advertised),
        })
    }
}

/// Owns the REST dispatcher and, once connected, the shard manager.
///
/// ```ignore
/// let client = Client::new(ClientConfig::builder("Bot token").intents(513).build()?)?;
/// let mut events = client.subscribe();
/// client.connect().await?;
/// ```
pub struct Client {
    config: ClientConfig,
    rest: Arc<Dispatcher>,
    emitter: EventEmitter,
    metrics: Arc<Metrics>,
    shards: RwLock<Option<Arc<ShardManager>>>,
    /// Serializes connect and shutdown.
    lifecycle_lock: Mutex<()>,
}

impl Client {
    /// Creates a client. Nothing connects until [`Client::connect`].
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the HTTP client cannot be created.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        let metrics = Arc::new(Metrics::new());
        let rest = Dispatcher::new(
            config.token.clone(),
            config.rest.clone(),
            Arc::clone(&metrics),
        )?;

        Ok(Self {
            config,
            rest: Arc::new(rest),
            emitter: EventEmitter::default(),
            metrics,
            shards: RwLock::new(None),
            lifecycle_lock: Mutex::new(()),
        })
    }

    /// REST dispatcher
    pub fn rest(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.rest)
    }

    /// Shard manager, once connected
    pub fn shards(&self) -> Option<Arc<ShardManager>> {
        self.shards.read().clone()
    }

    /// Subscribe to gateway events
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.emitter.subscribe()
    }

    /// Get the metrics for this client
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Discover the gateway if needed and queue every shard of this process.
    ///
    /// # Errors
    ///
    /// Returns `ExistingConnection` if already connected, or the discovery
    /// error.
    pub async fn connect(&self) -> Result<(), Error> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;
        if self.shards.read().is_some() {
            return Err(Error::ExistingConnection);
        }

        let gateway = &self.config.gateway;
        let needs_discovery = gateway.url.is_none()
            || gateway.shard_count == ShardCount::Auto
            || gateway.concurrency == crate::config::Concurrency::Auto;
        let bot = if needs_discovery {
            let bot = self.rest.gateway_bot().await?;
            debug!(
                url = %bot.url,
                shards = bot.shards,
                max_concurrency = bot.session_start_limit.max_concurrency,
                "Gateway discovered"
            );
            Some(bot)
        } else {
            None
        };

        let plan = ShardPlan::resolve(gateway, bot.as_ref())?;
        info!(
            "Starting shards {}..={} of {} (concurrency {})",
            plan.first_shard_id, plan.last_shard_id, plan.shard_count, plan.concurrency
        );

        let manager = Arc::new(ShardManager::new(
            self.config.token.clone(),
            plan.url,
            plan.shard_count,
            plan.concurrency,
            gateway.clone(),
            self.emitter.clone(),
            Arc::clone(&self.metrics),
        ));
        for id in plan.first_shard_id..=plan.last_shard_id {
            manager.spawn(id)?;
        }

        *self.shards.write() = Some(manager);
        Ok(())
    }

    /// Wait for every shard task to end.
    pub async fn wait(&self) -> Result<(), Error> {
        match self.shards() {
            Some(manager) => manager.wait().await,
            None => Ok(()),
        }
    }

    /// Disconnect every shard for good.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;
        let manager = self.shards.write().take();
        match manager {
            Some(manager) => manager.shutdown().await,
            None => Ok(()),
        }
    }
}
