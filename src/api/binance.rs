use governor::{Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use crate::execution::PriceSource;
use crate::{Result, TpslError};

const BINANCE_API_BASE: &str = "https://api.binance.com";
const RATE_LIMIT_PER_SECOND: u32 = 10;
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 200;
const REQUEST_TIMEOUT_SECS: u64 = 5;

type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Spot ticker price client (`GET /api/v3/ticker/price`)
///
/// Cloneable; clones share the rate limiter.
#[derive(Clone)]
pub struct BinanceTickerClient {
    client: Client,
    base_url: String,
    rate_limiter: Arc<BinanceRateLimiter>,
    max_retries: u32,
    initial_backoff: Duration,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    symbol: String,
    price: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

/// What a single attempt ended with
enum Attempt {
    Done(f64),
    Retry(String),
    Fail(String),
}

impl BinanceTickerClient {
    pub fn new() -> Result<Self> {
        Self::with_base_url(BINANCE_API_BASE)
    }

    /// Client against another host (testnet, mock server)
    pub fn with_base_url(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| TpslError::Config(format!("failed to build HTTP client: {}", e)))?;

        let per_second = NonZeroU32::new(RATE_LIMIT_PER_SECOND).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            rate_limiter,
            max_retries: MAX_RETRIES,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    pub fn with_retries(mut self, max_retries: u32, initial_backoff: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.initial_backoff = initial_backoff;
        self
    }

    /// Latest price for `symbol`, retrying rate limits, server and network errors
    pub async fn fetch_price(&self, symbol: &str) -> Result<f64> {
        let symbol = symbol.to_uppercase();
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=self.max_retries {
            match self.fetch_once(&symbol).await {
                Attempt::Done(price) => {
                    if attempt > 1 {
                        tracing::info!(symbol = %symbol, attempt, "Fetched price after retry");
                    }
                    return Ok(price);
                }
                Attempt::Fail(reason) => return Err(TpslError::data_unavailable(&symbol, reason)),
                Attempt::Retry(reason) => {
                    last_error = reason;
                    if attempt < self.max_retries {
                        let backoff = self.initial_backoff * 2_u32.pow(attempt - 1);
                        tracing::warn!(
                            symbol = %symbol,
                            attempt,
                            max_retries = self.max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %last_error,
                            "Ticker request failed, retrying"
                        );
                        sleep(backoff).await;
                    }
                }
            }
        }

        Err(TpslError::data_unavailable(
            &symbol,
            format!("failed after {} attempts: {}", self.max_retries, last_error),
        ))
    }

    async fn fetch_once(&self, symbol: &str) -> Attempt {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/api/v3/ticker/price", self.base_url);
        let response = match self
            .client
            .get(&url)
            .query(&[("symbol", symbol)])
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Attempt::Retry(format!("network error: {}", e)),
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Attempt::Retry(format!("HTTP {}", status));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = match serde_json::from_str::<ApiError>(&body) {
                Ok(err) => format!("HTTP {} ({}: {})", status, err.code, err.msg),
                Err(_) => format!("HTTP {}", status),
            };
            return Attempt::Fail(detail);
        }

        let ticker: TickerPrice = match response.json().await {
            Ok(ticker) => ticker,
            Err(e) => return Attempt::Fail(format!("malformed ticker response: {}", e)),
        };

        if !ticker.symbol.eq_ignore_ascii_case(symbol) {
            return Attempt::Fail(format!("response for {} instead", ticker.symbol));
        }

        match ticker.price.parse::<f64>() {
            Ok(price) if price.is_finite() && price > 0.0 => Attempt::Done(price),
            _ => Attempt::Fail(format!("invalid price {:?}", ticker.price)),
        }
    }
}

impl PriceSource for BinanceTickerClient {
    fn get_price(&self, symbol: &str) -> impl Future<Output = Result<f64>> + Send {
        let symbol = symbol.to_string();
        async move { self.fetch_price(&symbol).await }
    }
}
