//! Gateway discovery.

use super::dispatcher::Dispatcher;
use super::request::RestRequest;
use super::transport::HttpTransport;
use crate::error::Error;
use serde::Deserialize;

/// Identify limits for the current bot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionStartLimit {
    /// Identifies allowed per reset window
    pub total: u32,
    /// Identifies left in the window
    pub remaining: u32,
    /// Milliseconds until the window resets
    pub reset_after: u64,
    /// Identifies allowed in parallel (one per concurrency key)
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
}

fn default_max_concurrency() -> u32 {
    1
}

/// Response of `GET /gateway/bot`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayBot {
    /// Gateway URL
    pub url: String,
    /// Recommended shard count
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

#[derive(Debug, Deserialize)]
struct Gateway {
    url: String,
}

impl<T: HttpTransport> Dispatcher<T> {
    /// Gateway URL, recommended shard count and identify limits.
    pub async fn gateway_bot(&self) -> Result<GatewayBot, Error> {
        self.request_json(RestRequest::get("/gateway/bot")).await
    }

    /// Gateway URL without authentication.
    pub async fn gateway_url(&self) -> Result<String, Error> {
        let gateway: Gateway = self
            .request_json(RestRequest::get("/gateway").unauthenticated())
            .await?;
        Ok(gateway.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_gateway_bot_decodes() {
        let bot: GatewayBot = serde_json::from_value(json!({
            "url": "wss://gateway.discord.gg",
            "shards": 9,
            "session_start_limit": {
                "total": 1000,
                "remaining": 999,
                "reset_after": 14400000,
                "max_concurrency": 16
            }
        }))
        .unwrap();

        assert_eq!(bot.url, "wss://gateway.discord.gg");
        assert_eq!(bot.shards, 9);
        assert_eq!(bot.session_start_limit.max_concurrency, 16);
    }

    #[test]
    fn test_max_concurrency_defaults_to_one() {
        let limit: SessionStartLimit = serde_json::from_value(json!({
            "total": 1000,
            "remaining": 1000,
            "reset_after": 0
        }))
        .unwrap();

        assert_eq!(limit.max_concurrency, 1);
    }
}
