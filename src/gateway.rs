//! Exchange Gateway — signed REST calls, rate limiting, and a ticker stream
//! subscription, constructed and torn down per bot.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::{Mutex, Semaphore};

use crate::error::GatewayError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderAck {
    #[serde(rename = "orderId")]
    pub order_id: i64,
    pub status: String,
    #[serde(deserialize_with = "de_f64_from_str")]
    pub price: f64,
    #[serde(rename = "origQty", deserialize_with = "de_f64_from_str")]
    pub orig_qty: f64,
}

#[derive(Debug, Clone)]
pub struct SymbolFilters {
    pub tick_size: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub step_size: f64,
    pub min_qty: f64,
    pub max_qty: f64,
    pub min_notional: f64,
    pub max_notional: f64,
}

impl SymbolFilters {
    pub fn round_price(&self, price: f64) -> f64 {
        round_to_step(price, self.tick_size)
    }

    pub fn round_qty(&self, qty: f64) -> f64 {
        round_to_step(qty, self.step_size)
    }

    pub fn validate_notional(&self, price: f64, qty: f64) -> Result<(), GatewayError> {
        let notional = price * qty;
        if notional < self.min_notional || notional > self.max_notional {
            return Err(GatewayError::Rejected(format!(
                "notional {notional} outside [{}, {}]",
                self.min_notional, self.max_notional
            )));
        }
        Ok(())
    }
}

fn round_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    (value / step).round() * step
}

/// Global sliding-window limiter shared across all bots for cancel/status
/// polls (§5: "5 requests/second, sliding window").
pub struct GlobalThrottle {
    window: Mutex<VecDeque<Instant>>,
    max_per_sec: u32,
}

impl GlobalThrottle {
    pub fn new(max_per_sec: u32) -> Self {
        Self {
            window: Mutex::new(VecDeque::new()),
            max_per_sec,
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut w = self.window.lock().await;
                let now = Instant::now();
                while w.front().map_or(false, |t| now.duration_since(*t) > Duration::from_secs(1)) {
                    w.pop_front();
                }
                if (w.len() as u32) < self.max_per_sec {
                    w.push_back(now);
                    None
                } else {
                    let oldest = *w.front().unwrap();
                    Some(Duration::from_secs(1).saturating_sub(now.duration_since(oldest)))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

pub struct ExchangeGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    recv_window_ms: u64,
    widened_recv_window_ms: u64,
    order_semaphore: Semaphore,
    global_throttle: Arc<GlobalThrottle>,
}

impl ExchangeGateway {
    pub fn new(
        base_url: String,
        api_key: String,
        api_secret: String,
        order_permits: usize,
        recv_window_ms: u64,
        widened_recv_window_ms: u64,
        global_throttle: Arc<GlobalThrottle>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build exchange http client")?;
        Ok(Self {
            client,
            base_url,
            api_key,
            api_secret,
            recv_window_ms,
            widened_recv_window_ms,
            order_semaphore: Semaphore::new(order_permits),
            global_throttle,
        })
    }

    fn sign(&self, params: &BTreeMapInsertionOrder) -> String {
        let canonical = params.canonical_query_string();
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("hmac accepts key of any length");
        mac.update(canonical.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn now_ms() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_millis()
    }

    pub async fn get_price(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, symbol);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("exchange price request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("exchange returned {} for get_price", resp.status());
        }
        #[derive(Deserialize)]
        struct PriceResp {
            #[serde(deserialize_with = "de_f64_from_str")]
            price: f64,
        }
        let parsed: PriceResp = resp
            .json()
            .await
            .context("failed to parse price response")?;
        Ok(parsed.price)
    }

    pub async fn get_symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        let url = format!("{}/api/v3/exchangeInfo?symbol={}", self.base_url, symbol);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("exchangeInfo request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("exchange returned {} for exchangeInfo", resp.status());
        }
        let raw: ExchangeInfoResponse = resp
            .json()
            .await
            .context("failed to parse exchangeInfo response")?;
        let symbol_info = raw
            .symbols
            .into_iter()
            .next()
            .context("symbol not found in exchangeInfo")?;

        let mut tick_size = None;
        let mut min_price = None;
        let mut max_price = None;
        let mut step_size = None;
        let mut min_qty = None;
        let mut max_qty = None;
        let mut min_notional = None;
        let mut max_notional = None;

        for filter in symbol_info.filters {
            match filter.filter_type.as_str() {
                "PRICE_FILTER" => {
                    tick_size = filter.tick_size.and_then(|s| s.parse().ok());
                    min_price = filter.min_price.and_then(|s| s.parse().ok());
                    max_price = filter.max_price.and_then(|s| s.parse().ok());
                }
                "LOT_SIZE" => {
                    step_size = filter.step_size.and_then(|s| s.parse().ok());
                    min_qty = filter.min_qty.and_then(|s| s.parse().ok());
                    max_qty = filter.max_qty.and_then(|s| s.parse().ok());
                }
                "NOTIONAL" | "MIN_NOTIONAL" => {
                    min_notional = filter.min_notional.and_then(|s| s.parse().ok());
                    max_notional = filter.max_notional.and_then(|s| s.parse().ok());
                }
                _ => {}
            }
        }

        Ok(SymbolFilters {
            tick_size: tick_size.context("missing PRICE_FILTER.tickSize")?,
            min_price: min_price.unwrap_or(0.0),
            max_price: max_price.unwrap_or(f64::MAX),
            step_size: step_size.context("missing LOT_SIZE.stepSize")?,
            min_qty: min_qty.unwrap_or(0.0),
            max_qty: max_qty.unwrap_or(f64::MAX),
            min_notional: min_notional.unwrap_or(0.0),
            max_notional: max_notional.unwrap_or(f64::MAX),
        })
    }

    pub async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
    ) -> Result<OrderAck, GatewayError> {
        let _permit = self.order_semaphore.acquire().await.expect("semaphore not closed");
        self.place_limit_order_with_window(symbol, side, qty, price, self.recv_window_ms)
            .await
    }

    async fn place_limit_order_with_window(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
        recv_window_ms: u64,
    ) -> Result<OrderAck, GatewayError> {
        let mut params = BTreeMapInsertionOrder::new();
        params.insert("symbol", symbol.to_string());
        params.insert("side", side.as_str().to_string());
        params.insert("type", "LIMIT".to_string());
        params.insert("timeInForce", "GTC".to_string());
        params.insert("quantity", format!("{qty}"));
        params.insert("price", format!("{price}"));
        params.insert("recvWindow", recv_window_ms.to_string());
        params.insert("timestamp", Self::now_ms().to_string());
        let signature = self.sign(&params);
        params.insert("signature", signature);

        let url = format!("{}/api/v3/order?{}", self.base_url, params.canonical_query_string());
        let resp = self
            .client
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        if resp.status().as_u16() == 200 {
            let ack: OrderAck = resp
                .json()
                .await
                .map_err(|e| GatewayError::Transient(e.to_string()))?;
            if ack.status == "EXPIRED_IN_MATCH" {
                return Err(GatewayError::ExpiredInMatch);
            }
            return Ok(ack);
        }

        let body: ErrorBody = resp
            .json()
            .await
            .unwrap_or(ErrorBody { code: 0, msg: "unknown exchange error".into() });
        if body.code == -1021 {
            return Err(GatewayError::TimestampSkew);
        }
        Err(GatewayError::Rejected(body.msg))
    }

    /// Retries once with a widened `recvWindow` on `-1021` timestamp skew,
    /// matching §4.A's failure semantics.
    pub async fn place_limit_order_with_retry(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
    ) -> Result<OrderAck, GatewayError> {
        let _permit = self.order_semaphore.acquire().await.expect("semaphore not closed");
        match self
            .place_limit_order_with_window(symbol, side, qty, price, self.recv_window_ms)
            .await
        {
            Err(GatewayError::TimestampSkew) => {
                self.place_limit_order_with_window(symbol, side, qty, price, self.widened_recv_window_ms)
                    .await
            }
            other => other,
        }
    }

    /// Cancels a single resting order, returning the exchange's cancellation
    /// ack (status `CANCELED`).
    async fn cancel_order_ack(&self, symbol: &str, order_id: i64) -> Result<OrderAck, GatewayError> {
        self.global_throttle.acquire().await;
        let mut params = BTreeMapInsertionOrder::new();
        params.insert("symbol", symbol.to_string());
        params.insert("orderId", order_id.to_string());
        params.insert("timestamp", Self::now_ms().to_string());
        let signature = self.sign(&params);
        params.insert("signature", signature);

        let url = format!("{}/api/v3/order?{}", self.base_url, params.canonical_query_string());
        let resp = self
            .client
            .delete(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(GatewayError::Rejected(format!("cancel failed: {}", resp.status())));
        }
        resp.json().await.map_err(|e| GatewayError::Transient(e.to_string()))
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), GatewayError> {
        self.cancel_order_ack(symbol, order_id).await.map(|_| ())
    }

    /// Cancels each of `order_ids` in turn, collecting one result per id —
    /// the exchange has no endpoint that cancels an arbitrary id set in a
    /// single call, so this is the Gateway's batch contract over the
    /// per-id one.
    pub async fn cancel_order_ids(&self, symbol: &str, order_ids: &[i64]) -> Vec<Result<OrderAck, GatewayError>> {
        let mut acks = Vec::with_capacity(order_ids.len());
        for &order_id in order_ids {
            acks.push(self.cancel_order_ack(symbol, order_id).await);
        }
        acks
    }

    /// Cancels every open order on `symbol` in one exchange call.
    pub async fn cancel_all_open(&self, symbol: &str) -> Result<Vec<OrderAck>, GatewayError> {
        self.global_throttle.acquire().await;
        let mut params = BTreeMapInsertionOrder::new();
        params.insert("symbol", symbol.to_string());
        params.insert("timestamp", Self::now_ms().to_string());
        let signature = self.sign(&params);
        params.insert("signature", signature);

        let url = format!("{}/api/v3/openOrders?{}", self.base_url, params.canonical_query_string());
        let resp = self
            .client
            .delete(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(GatewayError::Rejected(format!("cancel-all failed: {}", resp.status())));
        }
        resp.json().await.map_err(|e| GatewayError::Transient(e.to_string()))
    }

    pub async fn get_order_status(&self, symbol: &str, order_id: i64) -> Result<String, GatewayError> {
        self.global_throttle.acquire().await;
        let mut params = BTreeMapInsertionOrder::new();
        params.insert("symbol", symbol.to_string());
        params.insert("orderId", order_id.to_string());
        params.insert("timestamp", Self::now_ms().to_string());
        let signature = self.sign(&params);
        params.insert("signature", signature);

        let url = format!("{}/api/v3/order?{}", self.base_url, params.canonical_query_string());
        let resp = self
            .client
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(GatewayError::Rejected(format!("status query failed: {}", resp.status())));
        }
        #[derive(Deserialize)]
        struct StatusResp {
            status: String,
        }
        let parsed: StatusResp = resp
            .json()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;
        Ok(parsed.status)
    }

    pub async fn get_account_balances(&self) -> Result<HashMap<String, f64>> {
        let mut params = BTreeMapInsertionOrder::new();
        params.insert("timestamp", Self::now_ms().to_string());
        let signature = self.sign(&params);
        params.insert("signature", signature);

        let url = format!("{}/api/v3/account?{}", self.base_url, params.canonical_query_string());
        let resp = self
            .client
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .context("account request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("exchange returned {} for get_account_balances", resp.status());
        }
        #[derive(Deserialize)]
        struct Balance {
            asset: String,
            #[serde(deserialize_with = "de_f64_from_str")]
            free: f64,
        }
        #[derive(Deserialize)]
        struct AccountResp {
            balances: Vec<Balance>,
        }
        let parsed: AccountResp = resp
            .json()
            .await
            .context("failed to parse account response")?;
        Ok(parsed.balances.into_iter().map(|b| (b.asset, b.free)).collect())
    }
}

/// Preserves insertion order for canonical query-string construction
/// (never sorted — §4.A.1).
struct BTreeMapInsertionOrder {
    entries: Vec<(String, String)>,
}

impl BTreeMapInsertionOrder {
    fn new() -> Self {
        Self { entries: Vec::new() }
    }

    fn insert(&mut self, key: &str, value: String) {
        self.entries.push((key.to_string(), value));
    }

    fn canonical_query_string(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    code: i64,
    msg: String,
}

#[derive(Deserialize)]
struct ExchangeInfoResponse {
    symbols: Vec<SymbolInfo>,
}

#[derive(Deserialize)]
struct SymbolInfo {
    filters: Vec<FilterEntry>,
}

#[derive(Deserialize)]
struct FilterEntry {
    #[serde(rename = "filterType")]
    filter_type: String,
    #[serde(rename = "tickSize")]
    tick_size: Option<String>,
    #[serde(rename = "minPrice")]
    min_price: Option<String>,
    #[serde(rename = "maxPrice")]
    max_price: Option<String>,
    #[serde(rename = "stepSize")]
    step_size: Option<String>,
    #[serde(rename = "minQty")]
    min_qty: Option<String>,
    #[serde(rename = "maxQty")]
    max_qty: Option<String>,
    #[serde(rename = "minNotional")]
    min_notional: Option<String>,
    #[serde(rename = "maxNotional")]
    max_notional: Option<String>,
}

fn de_f64_from_str<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse::<f64>().map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_query_string_preserves_insertion_order() {
        let mut p = BTreeMapInsertionOrder::new();
        p.insert("symbol", "ETHUSDT".into());
        p.insert("side", "BUY".into());
        p.insert("timestamp", "123".into());
        assert_eq!(p.canonical_query_string(), "symbol=ETHUSDT&side=BUY&timestamp=123");
    }

    #[test]
    fn round_to_step_snaps_to_tick() {
        assert_eq!(round_to_step(1999.23, 0.1), 1999.2);
        assert_eq!(round_to_step(0.0, 0.01), 0.0);
    }

    #[test]
    fn symbol_filters_reject_out_of_bounds_notional() {
        let f = SymbolFilters {
            tick_size: 0.01,
            min_price: 0.0,
            max_price: 1_000_000.0,
            step_size: 0.0001,
            min_qty: 0.0,
            max_qty: 1_000_000.0,
            min_notional: 10.0,
            max_notional: 1_000_000.0,
        };
        assert!(f.validate_notional(100.0, 0.05).is_err());
        assert!(f.validate_notional(100.0, 1.0).is_ok());
    }
}
