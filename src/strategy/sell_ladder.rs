//! Sell Ladder variant — a static ascending wall of sell orders between
//! `min_price` and `max_price`. No counter-orders: each fill is a single
//! leg. The whole wall below the current price re-seeds if price drops far
//! enough below the last fill.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::gateway::{ExchangeGateway, Side, SymbolFilters};
use crate::logger::AsyncLogger;
use crate::notifications::NotificationBus;
use crate::price_stream::PriceStream;
use crate::store::{OrderSide, OrderStatus, Store};

use super::{StatusCell, StatusSnapshot, StrategyStatus};

const INITIAL_BATCH_SIZE: usize = 5;
const INITIAL_BATCH_PAUSE: Duration = Duration::from_secs(1);
const STEADY_STATE_PACING: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SellLadderParams {
    pub symbol: String,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub testnet: bool,
    pub min_price: f64,
    pub max_price: f64,
    pub grids: u32,
    pub batch_size: f64,
    #[serde(default = "default_reset_threshold_pct")]
    pub reset_threshold_pct: f64,
}

fn default_reset_threshold_pct() -> f64 {
    1.0
}

#[derive(Debug, Clone)]
struct Level {
    price: f64,
    quantity: f64,
    order_id: Option<i64>,
}

pub struct SellLadderHandle {
    status: Arc<StatusCell>,
    stop_flag: Arc<AtomicBool>,
}

impl SellLadderHandle {
    pub fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }
}

impl StrategyStatus for SellLadderHandle {
    fn status_snapshot(&self) -> StatusSnapshot {
        self.status.get()
    }
}

pub struct SellLadderEngine {
    bot_id: i64,
    params: SellLadderParams,
    gateway: ExchangeGateway,
    filters: SymbolFilters,
    store: Store,
    logger: AsyncLogger,
    price_stream: PriceStream,
    notifications: Arc<NotificationBus>,
    status: Arc<StatusCell>,
    stop_flag: Arc<AtomicBool>,

    levels: Vec<Level>,
    last_filled_price: Option<f64>,
    last_observed_price: Option<f64>,
    realized_quote: f64,
    filled_count: usize,
}

impl SellLadderEngine {
    #[allow(clippy::too_many_arguments)]
    pub async fn construct(
        bot_id: i64,
        params: SellLadderParams,
        gateway: ExchangeGateway,
        store: Store,
        logger: AsyncLogger,
        price_stream: PriceStream,
        notifications: Arc<NotificationBus>,
    ) -> Result<(Arc<SellLadderHandle>, Self)> {
        let filters = gateway.get_symbol_filters(&params.symbol).await?;
        let status = Arc::new(StatusCell::new(StatusSnapshot {
            initial_parameters: serde_json::to_value(&params).unwrap_or_default(),
            ..Default::default()
        }));
        let stop_flag = Arc::new(AtomicBool::new(false));
        let handle = Arc::new(SellLadderHandle {
            status: status.clone(),
            stop_flag: stop_flag.clone(),
        });
        let levels = build_levels(&params);
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
            levels,
            last_filled_price: None,
            last_observed_price: None,
            realized_quote: 0.0,
            filled_count: 0,
        };
        Ok((handle, engine))
    }

    pub async fn run(mut self) {
        info!(bot_id = self.bot_id, "sell ladder engine starting for {}", self.params.symbol);

        self.place_initial_wall().await;
        self.publish_status();

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
        info!(bot_id = self.bot_id, "sell ladder engine stopped");
    }

    fn publish_status(&self) {
        self.status.set(StatusSnapshot {
            status: "active".to_string(),
            current_price: self.last_observed_price,
            initial_price: Some(self.params.min_price),
            deviation: None,
            realized_profit_a: self.realized_quote,
            realized_profit_b: 0.0,
            active_orders_count: self.levels.iter().filter(|l| l.order_id.is_some()).count(),
            completed_trades_count: self.filled_count,
            initial_parameters: serde_json::to_value(&self.params).unwrap_or_default(),
        });
    }

    async fn place_initial_wall(&mut self) {
        let levels: Vec<usize> = (0..self.levels.len()).collect();
        for chunk_start in (0..levels.len()).step_by(INITIAL_BATCH_SIZE) {
            let chunk_end = (chunk_start + INITIAL_BATCH_SIZE).min(levels.len());
            for i in chunk_start..chunk_end {
                self.place_level_order(i).await;
            }
            if chunk_end < levels.len() {
                tokio::time::sleep(INITIAL_BATCH_PAUSE).await;
            }
        }
    }

    async fn place_level_order(&mut self, index: usize) {
        let price = self.filters.round_price(self.levels[index].price);
        let quantity = self.filters.round_qty(self.levels[index].quantity);
        if let Err(e) = self.filters.validate_notional(price, quantity) {
            self.logger.fatal(format!("filter violation placing ladder level at {price}: {e}")).await;
        }
        match self.gateway.place_limit_order_with_retry(&self.params.symbol, Side::Sell, quantity, price).await {
            Ok(ack) => {
                self.levels[index].order_id = Some(ack.order_id);
                let _ = self.store.upsert_active_order(self.bot_id, ack.order_id, OrderSide::Sell, true, ack.price, ack.orig_qty).await;
                let _ = self.store.upsert_order_history(self.bot_id, ack.order_id, OrderSide::Sell, true, ack.price, ack.orig_qty, OrderStatus::Open).await;
            }
            Err(e) => {
                warn!(bot_id = self.bot_id, "ladder level placement failed at {price}: {e}");
                self.logger.log(format!("ladder level placement failed at {price}: {e}")).await;
            }
        }
    }

    async fn steady_state_iteration(&mut self, price: f64) {
        self.scan_fills().await;

        if let Some(last) = self.last_filled_price {
            if price < last * (1.0 - self.params.reset_threshold_pct / 100.0) {
                info!(bot_id = self.bot_id, "price dropped below reset threshold, re-seeding ladder");
                self.reseed_below(price).await;
            }
        }
        self.publish_status();
    }

    async fn scan_fills(&mut self) {
        let resting: Vec<(usize, i64, f64, f64)> = self
            .levels
            .iter()
            .enumerate()
            .filter_map(|(i, l)| l.order_id.map(|oid| (i, oid, l.price, l.quantity)))
            .collect();

        for (index, order_id, price, quantity) in resting {
            let status = match self.gateway.get_order_status(&self.params.symbol, order_id).await {
                Ok(s) => s,
                Err(e) => {
                    let _ = self.logger.panic(format!("status query failed for ladder order {order_id}: {e}")).await;
                    continue;
                }
            };
            if status != "FILLED" {
                continue;
            }
            let _ = self.store.set_order_history_status(self.bot_id, order_id, OrderStatus::Filled).await;
            let _ = self.store.remove_active_order(self.bot_id, order_id).await;
            let _ = self.store.insert_single_leg_trade(self.bot_id, order_id, price, quantity).await;

            self.levels[index].order_id = None;
            self.last_filled_price = Some(price);
            self.realized_quote += price * quantity;
            self.filled_count += 1;
            self.notifications
                .send("new_trade", self.bot_id, serde_json::json!({"trade_type": "SELL", "price": price, "quantity": quantity}))
                .await;
        }
    }

    /// Re-seeds every level at or below `current_price` that has no resting
    /// order, matching the resolved reset semantics (§4.F.2).
    async fn reseed_below(&mut self, current_price: f64) {
        let to_reseed: Vec<usize> = self
            .levels
            .iter()
            .enumerate()
            .filter(|(_, l)| l.price <= current_price && l.order_id.is_none())
            .map(|(i, _)| i)
            .collect();
        for index in to_reseed {
            self.place_level_order(index).await;
        }
    }

    pub async fn stop_strategy(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let orders = self.store.list_active_orders(self.bot_id).await.unwrap_or_default();
        let order_ids: Vec<i64> = orders.iter().map(|row| row.order_id).collect();
        let _ = self.gateway.cancel_order_ids(&self.params.symbol, &order_ids).await;
        let _ = self.store.delete_active_orders_for_bot(self.bot_id).await;
        for level in &mut self.levels {
            level.order_id = None;
        }
        let _ = self.store.set_bot_status(self.bot_id, crate::store::BotStatus::Inactive).await;
    }
}

fn build_levels(params: &SellLadderParams) -> Vec<Level> {
    let n = params.grids;
    (0..n)
        .map(|i| {
            let price = if n == 1 {
                params.min_price
            } else {
                params.min_price + i as f64 * (params.max_price - params.min_price) / (n - 1) as f64
            };
            Level {
                price,
                quantity: params.batch_size,
                order_id: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_params(grids: u32) -> SellLadderParams {
        SellLadderParams {
            symbol: "BTCUSDT".into(),
            api_key: "k".into(),
            api_secret: "s".into(),
            testnet: true,
            min_price: 100.0,
            max_price: 200.0,
            grids,
            batch_size: 2.0,
            reset_threshold_pct: 1.0,
        }
    }

    #[test]
    fn levels_span_min_to_max_inclusive() {
        let params = make_params(5);
        let levels = build_levels(&params);
        assert_eq!(levels.len(), 5);
        assert!((levels.first().unwrap().price - 100.0).abs() < 1e-9);
        assert!((levels.last().unwrap().price - 200.0).abs() < 1e-9);
    }

    #[test]
    fn levels_are_evenly_spaced() {
        let params = make_params(5);
        let levels = build_levels(&params);
        let step = levels[1].price - levels[0].price;
        for w in levels.windows(2) {
            assert!((w[1].price - w[0].price - step).abs() < 1e-9);
        }
    }

    #[test]
    fn single_grid_places_at_min_price() {
        let params = make_params(1);
        let levels = build_levels(&params);
        assert_eq!(levels.len(), 1);
        assert!((levels[0].price - 100.0).abs() < 1e-9);
    }
}
