//! Grid Strategy Engine — the core state machine. Builds a symmetric price
//! grid, places paired limit orders, detects fills by polling status, spawns
//! counter-orders, tracks two-legged trades, and resets the grid on
//! deviation breach.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::gateway::{ExchangeGateway, Side, SymbolFilters};
use crate::logger::AsyncLogger;
use crate::notifications::NotificationBus;
use crate::price_stream::PriceStream;
use crate::store::{OrderSide, OrderStatus, Store, TradeType};

use super::{StatusCell, StatusSnapshot, StrategyStatus};

const INITIAL_BATCH_SIZE: usize = 5;
const INITIAL_BATCH_PAUSE: Duration = Duration::from_secs(1);
const STEADY_STATE_PACING: Duration = Duration::from_secs(1);
const COUNTER_ORDER_MAX_RETRIES: u32 = 10;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GridParams {
    pub symbol: String,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub testnet: bool,
    pub asset_a_funds: f64,
    pub asset_b_funds: f64,
    pub grids: u32,
    pub deviation_threshold: f64,
    #[serde(default)]
    pub growth_factor: f64,
    #[serde(default)]
    pub use_granular_distribution: bool,
    #[serde(default = "default_true")]
    pub trail_price: bool,
    #[serde(default)]
    pub only_profitable_trades: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone)]
struct BuyPosition {
    order_id: i64,
    price: f64,
    quantity: f64,
}

#[derive(Debug, Clone)]
struct SellPosition {
    order_id: i64,
    price: f64,
    quantity: f64,
}

#[derive(Debug, Clone)]
struct OpenTrade {
    trade_id: i64,
    trade_type: TradeType,
    buy_order_id: i64,
    sell_order_id: i64,
    buy_price: f64,
    sell_price: f64,
    quantity: f64,
}

pub struct GridHandle {
    status: Arc<StatusCell>,
    stop_flag: Arc<AtomicBool>,
}

impl GridHandle {
    pub fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }
}

impl StrategyStatus for GridHandle {
    fn status_snapshot(&self) -> StatusSnapshot {
        self.status.get()
    }
}

pub struct GridEngine {
    bot_id: i64,
    params: GridParams,
    gateway: ExchangeGateway,
    filters: SymbolFilters,
    store: Store,
    logger: AsyncLogger,
    price_stream: PriceStream,
    notifications: Arc<NotificationBus>,
    status: Arc<StatusCell>,
    stop_flag: Arc<AtomicBool>,

    initial_price: Option<f64>,
    last_observed_price: Option<f64>,
    step: f64,
    buy_positions: Vec<BuyPosition>,
    sell_positions: Vec<SellPosition>,
    open_trades: Vec<OpenTrade>,
    realized_profit_quote: f64,
    realized_profit_base: f64,
}

impl GridEngine {
    #[allow(clippy::too_many_arguments)]
    pub async fn construct(
        bot_id: i64,
        params: GridParams,
        gateway: ExchangeGateway,
        store: Store,
        logger: AsyncLogger,
        price_stream: PriceStream,
        notifications: Arc<NotificationBus>,
    ) -> Result<(Arc<GridHandle>, Self)> {
        let filters = gateway.get_symbol_filters(&params.symbol).await?;
        let status = Arc::new(StatusCell::new(StatusSnapshot {
            initial_parameters: serde_json::to_value(&params).unwrap_or_default(),
            ..Default::default()
        }));
        let stop_flag = Arc::new(AtomicBool::new(false));
        let handle = Arc::new(GridHandle {
            status: status.clone(),
            stop_flag: stop_flag.clone(),
        });
        let engine = Self {
            bot_id,
            params,
            gateway,
            filters,
            store,
            logger,
            price_stream,
            notifications,
            status,
            stop_flag,
            initial_price: None,
            last_observed_price: None,
            step: 0.0,
            buy_positions: Vec::new(),
            sell_positions: Vec::new(),
            open_trades: Vec::new(),
            realized_profit_quote: 0.0,
            realized_profit_base: 0.0,
        };
        Ok((handle, engine))
    }

    pub async fn run(mut self) {
        info!(bot_id = self.bot_id, "grid engine starting for {}", self.params.symbol);

        // Wait for the first non-null price tick, then initialize the grid.
        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                self.stop_strategy().await;
                return;
            }
            if let Some(price) = self.price_stream.current_price() {
                self.initialize(price).await;
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }
            let price = match self.price_stream.current_price() {
                Some(p) => p,
                None => {
                    tokio::time::sleep(STEADY_STATE_PACING).await;
                    continue;
                }
            };
            if Some(price) != self.last_observed_price {
                self.last_observed_price = Some(price);
                self.steady_state_iteration(price).await;
            }
            tokio::time::sleep(STEADY_STATE_PACING).await;
        }

        self.stop_strategy().await;
        info!(bot_id = self.bot_id, "grid engine stopped");
    }

    fn publish_status(&self) {
        let deviation = match self.initial_price {
            Some(ip) if ip != 0.0 => self
                .last_observed_price
                .map(|p| (p - ip) / ip),
            _ => None,
        };
        self.status.set(StatusSnapshot {
            status: "active".to_string(),
            current_price: self.last_observed_price,
            initial_price: self.initial_price,
            deviation,
            realized_profit_a: self.realized_profit_quote,
            realized_profit_b: self.realized_profit_base,
            active_orders_count: self.buy_positions.len() + self.sell_positions.len(),
            completed_trades_count: 0,
            initial_parameters: serde_json::to_value(&self.params).unwrap_or_default(),
        });
    }

    // ── initialization ────────────────────────────────────

    async fn initialize(&mut self, initial_price: f64) {
        self.initial_price = Some(initial_price);
        self.step = (self.params.deviation_threshold / self.params.grids as f64) * initial_price;
        self.logger
            .log(format!("initial price set to {initial_price}, step={}", self.step))
            .await;

        let buy_levels: Vec<f64> = (1..=self.params.grids)
            .map(|i| initial_price - i as f64 * self.step)
            .collect();
        let sell_levels: Vec<f64> = (1..=self.params.grids)
            .map(|i| initial_price + i as f64 * self.step)
            .collect();

        let (buy_sizes, sell_sizes) = self.compute_order_sizes(initial_price, &buy_levels);

        self.place_initial_batch(&buy_levels, &buy_sizes, OrderSide::Buy).await;
        self.place_initial_batch(&sell_levels, &sell_sizes, OrderSide::Sell).await;
        self.publish_status();
    }

    /// Returns `(buy_quantities_base, sell_quantities_base)`.
    fn compute_order_sizes(&self, current_price: f64, buy_levels: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let n = self.params.grids;
        if self.params.use_granular_distribution {
            let g = self.params.growth_factor;
            let buy_notional = granular_sizes(self.params.asset_a_funds, g, n);
            let sell_sizes = granular_sizes(self.params.asset_b_funds, g, n);
            let buy_sizes = buy_notional.into_iter().map(|v| v / current_price).collect();
            (buy_sizes, sell_sizes)
        } else {
            let per_level_quote = self.params.asset_a_funds / n as f64;
            let buy_sizes = buy_levels.iter().map(|level_price| per_level_quote / level_price).collect();
            let sell_sizes = vec![self.params.asset_b_funds / n as f64; n as usize];
            (buy_sizes, sell_sizes)
        }
    }

    async fn place_initial_batch(&mut self, levels: &[f64], sizes: &[f64], side: OrderSide) {
        for chunk_start in (0..levels.len()).step_by(INITIAL_BATCH_SIZE) {
            let chunk_end = (chunk_start + INITIAL_BATCH_SIZE).min(levels.len());
            for i in chunk_start..chunk_end {
                self.place_initial_order(levels[i], sizes[i], side).await;
            }
            if chunk_end < levels.len() {
                tokio::time::sleep(INITIAL_BATCH_PAUSE).await;
            }
        }
    }

    async fn place_initial_order(&mut self, price: f64, quantity: f64, side: OrderSide) {
        let price = self.filters.round_price(price);
        let quantity = self.filters.round_qty(quantity);
        if let Err(e) = self.filters.validate_notional(price, quantity) {
            self.logger.fatal(format!("filter violation placing initial {side:?} at {price}: {e}")).await;
        }

        let gw_side = match side {
            OrderSide::Buy => Side::Buy,
            OrderSide::Sell => Side::Sell,
        };
        match self.gateway.place_limit_order_with_retry(&self.params.symbol, gw_side, quantity, price).await {
            Ok(ack) => {
                let _ = self
                    .store
                    .upsert_active_order(self.bot_id, ack.order_id, side, true, ack.price, ack.orig_qty)
                    .await;
                let _ = self
                    .store
                    .upsert_order_history(self.bot_id, ack.order_id, side, true, ack.price, ack.orig_qty, OrderStatus::Open)
                    .await;
                match side {
                    OrderSide::Buy => self.buy_positions.push(BuyPosition { order_id: ack.order_id, price: ack.price, quantity: ack.orig_qty }),
                    OrderSide::Sell => self.sell_positions.push(SellPosition { order_id: ack.order_id, price: ack.price, quantity: ack.orig_qty }),
                }
            }
            Err(e) => {
                warn!(bot_id = self.bot_id, "initial {side:?} placement failed at {price}: {e}");
                self.logger.log(format!("initial {side:?} placement failed at {price}: {e}")).await;
            }
        }
    }

    // ── steady state ──────────────────────────────────────

    async fn steady_state_iteration(&mut self, price: f64) {
        let initial_price = match self.initial_price {
            Some(p) => p,
            None => return,
        };
        let deviation = (price - initial_price) / initial_price;

        if deviation.abs() >= self.params.deviation_threshold {
            info!(bot_id = self.bot_id, "deviation {deviation:.4} breached threshold, resetting grid");
            self.grid_reset(price).await;
            return;
        }

        self.scan_initial_buys().await;
        self.scan_initial_sells().await;
        self.scan_open_trades().await;
        self.publish_status();
    }

    async fn scan_initial_buys(&mut self) {
        let positions = self.buy_positions.clone();
        for pos in positions {
            let status = match self.gateway.get_order_status(&self.params.symbol, pos.order_id).await {
                Ok(s) => s,
                Err(e) => {
                    let _ = self.logger.panic(format!("status query failed for buy {}: {e}", pos.order_id)).await;
                    continue;
                }
            };
            if status != "FILLED" {
                continue;
            }
            let _ = self.store.set_order_history_status(self.bot_id, pos.order_id, OrderStatus::Filled).await;
            self.buy_positions.retain(|p| p.order_id != pos.order_id);
            let _ = self.store.remove_active_order(self.bot_id, pos.order_id).await;

            let sell_price = self.filters.round_price(pos.price + self.step);
            match self.place_counter_order(Side::Sell, pos.quantity, sell_price).await {
                Some(ack) => {
                    let _ = self
                        .store
                        .upsert_active_order(self.bot_id, ack.order_id, OrderSide::Sell, false, ack.price, ack.orig_qty)
                        .await;
                    let _ = self
                        .store
                        .upsert_order_history(self.bot_id, ack.order_id, OrderSide::Sell, false, ack.price, ack.orig_qty, OrderStatus::Open)
                        .await;
                    let trade_id = self
                        .store
                        .insert_open_trade(self.bot_id, TradeType::BuySell, pos.price, ack.price, ack.orig_qty, "quote", pos.order_id, ack.order_id)
                        .await
                        .unwrap_or(-1);
                    self.open_trades.push(OpenTrade {
                        trade_id,
                        trade_type: TradeType::BuySell,
                        buy_order_id: pos.order_id,
                        sell_order_id: ack.order_id,
                        buy_price: pos.price,
                        sell_price: ack.price,
                        quantity: ack.orig_qty,
                    });
                    self.notifications
                        .send("new_trade", self.bot_id, serde_json::json!({"trade_type": "BUY_SELL", "buy_price": pos.price, "sell_price": ack.price}))
                        .await;
                }
                None => {
                    self.logger.log(format!("counter sell for buy {} exhausted retries", pos.order_id)).await;
                }
            }
        }
    }

    async fn scan_initial_sells(&mut self) {
        let positions = self.sell_positions.clone();
        for pos in positions {
            let status = match self.gateway.get_order_status(&self.params.symbol, pos.order_id).await {
                Ok(s) => s,
                Err(e) => {
                    let _ = self.logger.panic(format!("status query failed for sell {}: {e}", pos.order_id)).await;
                    continue;
                }
            };
            if status != "FILLED" {
                continue;
            }
            let _ = self.store.set_order_history_status(self.bot_id, pos.order_id, OrderStatus::Filled).await;
            self.sell_positions.retain(|p| p.order_id != pos.order_id);
            let _ = self.store.remove_active_order(self.bot_id, pos.order_id).await;

            let buy_price = self.filters.round_price(pos.price - self.step);
            match self.place_counter_order(Side::Buy, pos.quantity, buy_price).await {
                Some(ack) => {
                    let _ = self
                        .store
                        .upsert_active_order(self.bot_id, ack.order_id, OrderSide::Buy, false, ack.price, ack.orig_qty)
                        .await;
                    let _ = self
                        .store
                        .upsert_order_history(self.bot_id, ack.order_id, OrderSide::Buy, false, ack.price, ack.orig_qty, OrderStatus::Open)
                        .await;
                    let trade_id = self
                        .store
                        .insert_open_trade(self.bot_id, TradeType::SellBuy, ack.price, pos.price, ack.orig_qty, "base", ack.order_id, pos.order_id)
                        .await
                        .unwrap_or(-1);
                    self.open_trades.push(OpenTrade {
                        trade_id,
                        trade_type: TradeType::SellBuy,
                        buy_order_id: ack.order_id,
                        sell_order_id: pos.order_id,
                        buy_price: ack.price,
                        sell_price: pos.price,
                        quantity: ack.orig_qty,
                    });
                    self.notifications
                        .send("new_trade", self.bot_id, serde_json::json!({"trade_type": "SELL_BUY", "buy_price": ack.price, "sell_price": pos.price}))
                        .await;
                }
                None => {
                    self.logger.log(format!("counter buy for sell {} exhausted retries", pos.order_id)).await;
                }
            }
        }
    }

    /// Places a counter order, retrying up to `COUNTER_ORDER_MAX_RETRIES`
    /// times with exponential backoff, widening `recvWindow` on timestamp
    /// skew and nudging the limit price on `EXPIRED_IN_MATCH`.
    async fn place_counter_order(&self, side: Side, quantity: f64, mut price: f64) -> Option<crate::gateway::OrderAck> {
        let mut attempt = 0;
        loop {
            price = self.filters.round_price(price);
            let quantity = self.filters.round_qty(quantity);
            match self.gateway.place_limit_order_with_retry(&self.params.symbol, side, quantity, price).await {
                Ok(ack) => return Some(ack),
                Err(GatewayError::ExpiredInMatch) => {
                    price = match side {
                        Side::Buy => price * 1.0001,
                        Side::Sell => price * 0.9999,
                    };
                }
                Err(e) => {
                    warn!("counter order attempt {attempt} failed: {e}");
                }
            }
            attempt += 1;
            if attempt >= COUNTER_ORDER_MAX_RETRIES {
                return None;
            }
            let backoff_ms = 200u64.saturating_mul(1u64 << attempt.min(8));
            let jitter = rand::thread_rng().gen_range(0..100);
            tokio::time::sleep(Duration::from_millis(backoff_ms + jitter)).await;
        }
    }

    async fn scan_open_trades(&mut self) {
        let trades = self.open_trades.clone();
        for trade in trades {
            let leg_order_id = match trade.trade_type {
                TradeType::BuySell => trade.sell_order_id,
                TradeType::SellBuy => trade.buy_order_id,
            };
            let status = match self.gateway.get_order_status(&self.params.symbol, leg_order_id).await {
                Ok(s) => s,
                Err(e) => {
                    let _ = self.logger.panic(format!("status query failed for counter leg {leg_order_id}: {e}")).await;
                    continue;
                }
            };
            if status != "FILLED" {
                continue;
            }

            let profit = match trade.trade_type {
                TradeType::BuySell => (trade.sell_price - trade.buy_price) * trade.quantity,
                TradeType::SellBuy => trade.quantity * ((trade.sell_price / trade.buy_price) - 1.0),
            };

            let matched = self
                .store
                .find_open_trade_by_buy(self.bot_id, trade.buy_price, trade.quantity)
                .await
                .ok()
                .flatten();
            match matched {
                Some(row) => {
                    let _ = self.store.close_trade(row.id, profit).await;
                    let _ = self.store.set_order_history_status(self.bot_id, leg_order_id, OrderStatus::Filled).await;
                    let _ = self.store.remove_active_order(self.bot_id, leg_order_id).await;
                    match trade.trade_type {
                        TradeType::BuySell => self.realized_profit_quote += profit,
                        TradeType::SellBuy => self.realized_profit_base += profit,
                    }
                }
                None => {
                    self.logger.log(format!(
                        "trade-close anomaly: no OPEN row for buy_price={} quantity={}",
                        trade.buy_price, trade.quantity
                    )).await;
                }
            }
            self.open_trades.retain(|t| t.trade_id != trade.trade_id);
        }
    }

    // ── grid reset ─────────────────────────────────────────

    async fn grid_reset(&mut self, current_price: f64) {
        let initial_orders = self.store.list_initial_active_orders(self.bot_id).await.unwrap_or_default();
        let order_ids: Vec<i64> = initial_orders.iter().map(|row| row.order_id).collect();
        let acks = self.gateway.cancel_order_ids(&self.params.symbol, &order_ids).await;
        for (row, ack) in initial_orders.into_iter().zip(acks) {
            if ack.is_ok() {
                let _ = self.store.set_order_history_status(self.bot_id, row.order_id, OrderStatus::Canceled).await;
                let _ = self.store.remove_active_order(self.bot_id, row.order_id).await;
            }
        }
        self.buy_positions.clear();
        self.sell_positions.clear();

        self.initialize(current_price).await;
    }

    // ── lifecycle ──────────────────────────────────────────

    /// Idempotent: cancels all open orders for the symbol, clears ephemeral
    /// state, deletes ActiveOrder rows, and drains the logger.
    pub async fn stop_strategy(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let orders = self.store.list_active_orders(self.bot_id).await.unwrap_or_default();
        let order_ids: Vec<i64> = orders.iter().map(|row| row.order_id).collect();
        let _ = self.gateway.cancel_order_ids(&self.params.symbol, &order_ids).await;
        let _ = self.store.delete_active_orders_for_bot(self.bot_id).await;
        self.buy_positions.clear();
        self.sell_positions.clear();
        self.open_trades.clear();
        let _ = self.store.set_bot_status(self.bot_id, crate::store::BotStatus::Inactive).await;
    }
}

fn granular_sizes(total: f64, growth_factor: f64, grids: u32) -> Vec<f64> {
    let n = grids as f64;
    let denom = n + growth_factor * n * (n - 1.0) / 2.0;
    let x1 = if denom == 0.0 { 0.0 } else { total / denom };
    (1..=grids).map(|i| x1 * (1.0 + growth_factor * i as f64)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granular_sizes_sum_to_total_capital() {
        let sizes = granular_sizes(1000.0, 0.5, 10);
        let total: f64 = sizes.iter().sum();
        assert!((total - 1000.0).abs() < 1e-6, "got {total}");
    }

    #[test]
    fn granular_sizes_grow_monotonically_with_positive_growth() {
        let sizes = granular_sizes(1000.0, 0.5, 5);
        for w in sizes.windows(2) {
            assert!(w[1] > w[0]);
        }
    }

    #[test]
    fn zero_growth_factor_yields_equal_sizes() {
        let sizes = granular_sizes(1000.0, 0.0, 4);
        for s in &sizes {
            assert!((s - 250.0).abs() < 1e-9);
        }
    }

    #[test]
    fn buy_sell_profit_formulas_match_spec() {
        let buy_price = 1999.2_f64;
        let sell_price = 2000.0_f64;
        let qty = 0.05_f64;
        let profit = (sell_price - buy_price) * qty;
        assert!((profit - 0.8 * qty).abs() < 1e-9);

        let sell_buy_profit = qty * ((sell_price / buy_price) - 1.0);
        assert!(sell_buy_profit > 0.0);
    }
}
