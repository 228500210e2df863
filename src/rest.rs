use crate::error::Error;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// `GET /gateway`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayInfo {
    pub url: String,
}

/// `GET /gateway/bot`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayBotInfo {
    pub url: String,
    /// Recommended shard count
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

/// Identify budget for the current window
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    /// Milliseconds until the budget resets
    pub reset_after: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
}

fn default_max_concurrency() -> u32 {
    1
}

impl SessionStartLimit {
    pub fn reset_after(&self) -> Duration {
        Duration::from_millis(self.reset_after)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}

/// Where the client learns the gateway URL and recommended shard count.
///
/// The gateway core only blocks on this during bootstrap.
pub trait GatewaySource: Send + Sync + 'static {
    fn gateway(&self) -> impl Future<Output = Result<GatewayInfo, Error>> + Send;

    fn gateway_bot(&self) -> impl Future<Output = Result<GatewayBotInfo, Error>> + Send;
}

/// Minimal REST client for the gateway bootstrap endpoints
#[derive(Clone)]
pub struct RestClient {
    http: Client,
    api_base: String,
    token: String,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("api_base", &self.api_base)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl RestClient {
    pub fn new(api_base: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(Client::new(), api_base, token)
    }

    /// Reuse an existing reqwest client (connection pool, proxies, timeouts)
    pub fn with_client(http: Client, api_base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, Error> {
        let url = format!("{}{}", self.api_base, endpoint);
        debug!("GET {}", url);

        let response = self
            .http
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, format!("Bot {}", self.token))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::Rest {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}

impl GatewaySource for RestClient {
    async fn gateway(&self) -> Result<GatewayInfo, Error> {
        self.get("/gateway").await
    }

    async fn gateway_bot(&self) -> Result<GatewayBotInfo, Error> {
        self.get("/gateway/bot").await
    }
}
