//! Index Fund variant — maintains a two-asset internal ratio and rebalances
//! funds into that ratio before re-anchoring the grid on deviation breach.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::gateway::{ExchangeGateway, Side, SymbolFilters};
use crate::logger::AsyncLogger;
use crate::notifications::NotificationBus;
use crate::price_stream::PriceStream;
use crate::store::{OrderSide, OrderStatus, Store, TradeType};

use super::grid::GridParams;
use super::{StatusCell, StatusSnapshot, StrategyStatus};

const INITIAL_BATCH_SIZE: usize = 5;
const INITIAL_BATCH_PAUSE: Duration = Duration::from_secs(1);
const STEADY_STATE_PACING: Duration = Duration::from_secs(1);
const COUNTER_ORDER_MAX_RETRIES: u32 = 10;

// No `deny_unknown_fields` here: serde rejects that attribute on a struct
// using `#[serde(flatten)]`, since the flattened field has to absorb
// whatever the outer struct doesn't recognize.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexFundParams {
    #[serde(flatten)]
    pub grid: GridParams,
    #[serde(default = "default_index_deviation_threshold")]
    pub index_deviation_threshold: f64,
}

fn default_index_deviation_threshold() -> f64 {
    0.01
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

pub struct IndexFundHandle {
    status: Arc<StatusCell>,
    stop_flag: Arc<AtomicBool>,
}

impl IndexFundHandle {
    pub fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }
}

impl StrategyStatus for IndexFundHandle {
    fn status_snapshot(&self) -> StatusSnapshot {
        self.status.get()
    }
}

pub struct IndexFundEngine {
    bot_id: i64,
    params: IndexFundParams,
    quote_funds: f64,
    base_funds: f64,
    internal_ratio: f64,
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

impl IndexFundEngine {
    #[allow(clippy::too_many_arguments)]
    pub async fn construct(
        bot_id: i64,
        params: IndexFundParams,
        gateway: ExchangeGateway,
        store: Store,
        logger: AsyncLogger,
        price_stream: PriceStream,
        notifications: Arc<NotificationBus>,
    ) -> Result<(Arc<IndexFundHandle>, Self)> {
        let filters = gateway.get_symbol_filters(&params.grid.symbol).await?;
        let quote_funds = params.grid.asset_a_funds;
        let base_funds = params.grid.asset_b_funds;
        let internal_ratio = if quote_funds != 0.0 { base_funds / quote_funds } else { 0.0 };
        let status = Arc::new(StatusCell::new(StatusSnapshot {
            initial_parameters: serde_json::to_value(&params).unwrap_or_default(),
            ..Default::default()
        }));
        let stop_flag = Arc::new(AtomicBool::new(false));
        let handle = Arc::new(IndexFundHandle {
            status: status.clone(),
            stop_flag: stop_flag.clone(),
        });
        let engine = Self {
            bot_id,
            params,
            quote_funds,
            base_funds,
            internal_ratio,
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
        info!(bot_id = self.bot_id, "index fund engine starting for {}", self.params.grid.symbol);

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
        info!(bot_id = self.bot_id, "index fund engine stopped");
    }

    fn publish_status(&self) {
        let deviation = match self.initial_price {
            Some(ip) if ip != 0.0 => self.last_observed_price.map(|p| (p - ip) / ip),
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

    // ── sizing (§4.F.1) ────────────────────────────────────

    /// Returns `(buy_sizes_base, sell_sizes_base)` per the exact arithmetic
    /// resolved from the donor's Index Fund revision: target ratios bracket
    /// the internal ratio by `±index_deviation_threshold`, and the delta
    /// between current and target base holdings is spread evenly over the
    /// grid's levels.
    fn compute_index_fund_sizes(&self) -> (f64, f64) {
        let target_ratio_low = self.internal_ratio * (1.0 - self.params.index_deviation_threshold);
        let target_ratio_high = self.internal_ratio * (1.0 + self.params.index_deviation_threshold);
        let target_base_low = self.quote_funds * target_ratio_low;
        let target_base_high = self.quote_funds * target_ratio_high;
        let delta_base_low = self.base_funds - target_base_low;
        let delta_base_high = target_base_high - self.base_funds;
        let grids = self.params.grid.grids as f64;
        (delta_base_low / grids, delta_base_high / grids)
    }

    async fn initialize(&mut self, initial_price: f64) {
        self.initial_price = Some(initial_price);
        let grids = self.params.grid.grids;
        self.step = (self.params.grid.deviation_threshold / grids as f64) * initial_price;

        let buy_levels: Vec<f64> = (1..=grids).map(|i| initial_price - i as f64 * self.step).collect();
        let sell_levels: Vec<f64> = (1..=grids).map(|i| initial_price + i as f64 * self.step).collect();

        let (buy_size, sell_size) = self.compute_index_fund_sizes();
        self.logger
            .log(format!("index fund order sizes: buy={buy_size}, sell={sell_size} per grid"))
            .await;

        let buy_sizes = vec![buy_size; grids as usize];
        let sell_sizes = vec![sell_size; grids as usize];

        self.place_initial_batch(&buy_levels, &buy_sizes, OrderSide::Buy).await;
        self.place_initial_batch(&sell_levels, &sell_sizes, OrderSide::Sell).await;
        self.publish_status();
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
        let quantity = self.filters.round_qty(quantity.abs());
        if let Err(e) = self.filters.validate_notional(price, quantity) {
            self.logger.fatal(format!("filter violation placing initial {side:?} at {price}: {e}")).await;
        }
        let gw_side = match side {
            OrderSide::Buy => Side::Buy,
            OrderSide::Sell => Side::Sell,
        };
        match self.gateway.place_limit_order_with_retry(&self.params.grid.symbol, gw_side, quantity, price).await {
            Ok(ack) => {
                let _ = self.store.upsert_active_order(self.bot_id, ack.order_id, side, true, ack.price, ack.orig_qty).await;
                let _ = self.store.upsert_order_history(self.bot_id, ack.order_id, side, true, ack.price, ack.orig_qty, OrderStatus::Open).await;
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

    async fn steady_state_iteration(&mut self, price: f64) {
        let initial_price = match self.initial_price {
            Some(p) => p,
            None => return,
        };
        let deviation = (price - initial_price) / initial_price;

        if deviation.abs() >= self.params.grid.deviation_threshold {
            info!(bot_id = self.bot_id, "index fund deviation {deviation:.4} breached, rebalancing");
            self.rebalance_and_restart(price).await;
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
            let status = match self.gateway.get_order_status(&self.params.grid.symbol, pos.order_id).await {
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
            if let Some(ack) = self.place_counter_order(Side::Sell, pos.quantity, sell_price).await {
                let _ = self.store.upsert_active_order(self.bot_id, ack.order_id, OrderSide::Sell, false, ack.price, ack.orig_qty).await;
                let _ = self.store.upsert_order_history(self.bot_id, ack.order_id, OrderSide::Sell, false, ack.price, ack.orig_qty, OrderStatus::Open).await;
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
                self.notifications.send("new_trade", self.bot_id, serde_json::json!({"trade_type": "BUY_SELL"})).await;
            }
        }
    }

    async fn scan_initial_sells(&mut self) {
        let positions = self.sell_positions.clone();
        for pos in positions {
            let status = match self.gateway.get_order_status(&self.params.grid.symbol, pos.order_id).await {
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
            if let Some(ack) = self.place_counter_order(Side::Buy, pos.quantity, buy_price).await {
                let _ = self.store.upsert_active_order(self.bot_id, ack.order_id, OrderSide::Buy, false, ack.price, ack.orig_qty).await;
                let _ = self.store.upsert_order_history(self.bot_id, ack.order_id, OrderSide::Buy, false, ack.price, ack.orig_qty, OrderStatus::Open).await;
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
                self.notifications.send("new_trade", self.bot_id, serde_json::json!({"trade_type": "SELL_BUY"})).await;
            }
        }
    }

    async fn place_counter_order(&self, side: Side, quantity: f64, mut price: f64) -> Option<crate::gateway::OrderAck> {
        let mut attempt = 0;
        loop {
            price = self.filters.round_price(price);
            let quantity = self.filters.round_qty(quantity);
            match self.gateway.place_limit_order_with_retry(&self.params.grid.symbol, side, quantity, price).await {
                Ok(ack) => return Some(ack),
                Err(GatewayError::ExpiredInMatch) => {
                    price = match side {
                        Side::Buy => price * 1.0001,
                        Side::Sell => price * 0.9999,
                    };
                }
                Err(e) => warn!("counter order attempt {attempt} failed: {e}"),
            }
            attempt += 1;
            if attempt >= COUNTER_ORDER_MAX_RETRIES {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(200 * (1u64 << attempt.min(8)))).await;
        }
    }

    async fn scan_open_trades(&mut self) {
        let trades = self.open_trades.clone();
        for trade in trades {
            let leg_order_id = match trade.trade_type {
                TradeType::BuySell => trade.sell_order_id,
                TradeType::SellBuy => trade.buy_order_id,
            };
            let status = match self.gateway.get_order_status(&self.params.grid.symbol, leg_order_id).await {
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
            let matched = self.store.find_open_trade_by_buy(self.bot_id, trade.buy_price, trade.quantity).await.ok().flatten();
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

    /// Folds realized profit into the configured funds, recomputes the
    /// internal ratio, then re-anchors and re-sizes — in that order, per
    /// the resolved donor arithmetic (§4.F.1).
    async fn rebalance_and_restart(&mut self, current_price: f64) {
        let initial_orders = self.store.list_initial_active_orders(self.bot_id).await.unwrap_or_default();
        let order_ids: Vec<i64> = initial_orders.iter().map(|row| row.order_id).collect();
        let acks = self.gateway.cancel_order_ids(&self.params.grid.symbol, &order_ids).await;
        for (row, ack) in initial_orders.into_iter().zip(acks) {
            if ack.is_ok() {
                let _ = self.store.set_order_history_status(self.bot_id, row.order_id, OrderStatus::Canceled).await;
                let _ = self.store.remove_active_order(self.bot_id, row.order_id).await;
            }
        }
        self.buy_positions.clear();
        self.sell_positions.clear();

        self.quote_funds += self.realized_profit_quote;
        self.base_funds += self.realized_profit_base;
        self.internal_ratio = if self.quote_funds != 0.0 { self.base_funds / self.quote_funds } else { 0.0 };

        self.initialize(current_price).await;
    }

    pub async fn stop_strategy(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let orders = self.store.list_active_orders(self.bot_id).await.unwrap_or_default();
        let order_ids: Vec<i64> = orders.iter().map(|row| row.order_id).collect();
        let _ = self.gateway.cancel_order_ids(&self.params.grid.symbol, &order_ids).await;
        let _ = self.store.delete_active_orders_for_bot(self.bot_id).await;
        self.buy_positions.clear();
        self.sell_positions.clear();
        self.open_trades.clear();
        let _ = self.store.set_bot_status(self.bot_id, crate::store::BotStatus::Inactive).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_params(grids: u32, threshold: f64) -> IndexFundParams {
        IndexFundParams {
            grid: GridParams {
                symbol: "ETHUSDT".into(),
                api_key: "k".into(),
                api_secret: "s".into(),
                testnet: true,
                asset_a_funds: 1000.0,
                asset_b_funds: 0.5,
                grids,
                deviation_threshold: 0.004,
                growth_factor: 0.0,
                use_granular_distribution: false,
                trail_price: true,
                only_profitable_trades: false,
            },
            index_deviation_threshold: threshold,
        }
    }

    #[test]
    fn rebalance_arithmetic_matches_resolved_formula() {
        let params = make_params(10, 0.01);
        let quote_funds = params.grid.asset_a_funds;
        let base_funds = params.grid.asset_b_funds;
        let internal_ratio = base_funds / quote_funds;

        let target_low = internal_ratio * (1.0 - params.index_deviation_threshold);
        let target_high = internal_ratio * (1.0 + params.index_deviation_threshold);
        let target_base_low = quote_funds * target_low;
        let target_base_high = quote_funds * target_high;
        let delta_low = base_funds - target_base_low;
        let delta_high = target_base_high - base_funds;

        assert!(delta_low > 0.0);
        assert!(delta_high > 0.0);
        assert!((delta_high - delta_low).abs() < 1e-9);
    }
}
