//! Bot Supervisor — a process-wide dispatcher mapping `bot_id` to a running
//! strategy task. Holds no domain state of its own: only the registry,
//! status handles, and start times needed to enforce one instance per bot
//! and answer status/uptime queries.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::gateway::{ExchangeGateway, GlobalThrottle};
use crate::logger::AsyncLogger;
use crate::notifications::NotificationBus;
use crate::price_stream::PriceStream;
use crate::store::{BotStatus, Store};
use crate::strategy::grid::{GridEngine, GridHandle};
use crate::strategy::index_fund::{IndexFundEngine, IndexFundHandle};
use crate::strategy::sell_ladder::{SellLadderEngine, SellLadderHandle};
use crate::strategy::{BotParams, StrategyStatus};

enum Handle {
    Grid(Arc<GridHandle>),
    IndexFund(Arc<IndexFundHandle>),
    SellBot(Arc<SellLadderHandle>),
}

impl Handle {
    fn status(&self) -> Arc<dyn StrategyStatus> {
        match self {
            Handle::Grid(h) => h.clone(),
            Handle::IndexFund(h) => h.clone(),
            Handle::SellBot(h) => h.clone(),
        }
    }

    fn request_stop(&self) {
        match self {
            Handle::Grid(h) => h.request_stop(),
            Handle::IndexFund(h) => h.request_stop(),
            Handle::SellBot(h) => h.request_stop(),
        }
    }
}

struct RunningBot {
    handle: Handle,
    task: JoinHandle<()>,
    started_at: DateTime<Utc>,
}

pub struct Supervisor {
    bots: Mutex<HashMap<i64, RunningBot>>,
    config: Config,
    store: Store,
    notifications: Arc<NotificationBus>,
    global_throttle: Arc<GlobalThrottle>,
}

impl Supervisor {
    pub fn new(config: Config, store: Store, notifications: Arc<NotificationBus>) -> Arc<Self> {
        let global_throttle = Arc::new(GlobalThrottle::new(config.global_rate_limit_per_sec));
        Arc::new(Self {
            bots: Mutex::new(HashMap::new()),
            config,
            store,
            notifications,
            global_throttle,
        })
    }

    /// Starts a bot under a fresh id, enforcing single-instance-per-id by
    /// construction (the id is minted here, not supplied by the caller).
    pub async fn start_bot(self: &Arc<Self>, params: BotParams) -> Result<i64> {
        let bot_id = self
            .store
            .insert_bot(
                params.bot_type().as_str(),
                params.symbol(),
                params.api_key(),
                params.api_secret(),
                params.testnet(),
            )
            .await
            .context("failed to register bot row")?;

        if let Err(e) = self.spawn(bot_id, params).await {
            let _ = self.store.delete_bot(bot_id).await;
            return Err(e);
        }
        Ok(bot_id)
    }

    async fn spawn(self: &Arc<Self>, bot_id: i64, params: BotParams) -> Result<()> {
        let gateway = ExchangeGateway::new(
            self.config.exchange_rest_base.clone(),
            params.api_key().to_string(),
            params.api_secret().to_string(),
            self.config.order_semaphore_permits,
            self.config.default_recv_window_ms,
            self.config.widened_recv_window_ms,
            self.global_throttle.clone(),
        )?;
        let logger = AsyncLogger::new(&self.config.log_dir, bot_id).await?;
        let price_stream = PriceStream::start(&self.config.exchange_ws_base, params.symbol());

        let (handle, task) = match params {
            BotParams::Grid(grid_params) => {
                let (h, engine) = GridEngine::construct(
                    bot_id,
                    grid_params,
                    gateway,
                    self.store.clone(),
                    logger,
                    price_stream,
                    self.notifications.clone(),
                )
                .await?;
                (Handle::Grid(h), tokio::spawn(engine.run()))
            }
            BotParams::IndexFund(params) => {
                let (h, engine) = IndexFundEngine::construct(
                    bot_id,
                    params,
                    gateway,
                    self.store.clone(),
                    logger,
                    price_stream,
                    self.notifications.clone(),
                )
                .await?;
                (Handle::IndexFund(h), tokio::spawn(engine.run()))
            }
            BotParams::SellBot(params) => {
                let (h, engine) = SellLadderEngine::construct(
                    bot_id,
                    params,
                    gateway,
                    self.store.clone(),
                    logger,
                    price_stream,
                    self.notifications.clone(),
                )
                .await?;
                (Handle::SellBot(h), tokio::spawn(engine.run()))
            }
        };

        let mut bots = self.bots.lock().await;
        bots.insert(
            bot_id,
            RunningBot {
                handle,
                task,
                started_at: Utc::now(),
            },
        );
        info!(bot_id, "bot registered with supervisor");
        Ok(())
    }

    /// Sets the stop flag and awaits the task's completion — idempotent:
    /// stopping an already-stopped bot is a no-op rather than an error, per
    /// the resolved lifecycle contract.
    pub async fn stop_bot(self: &Arc<Self>, bot_id: i64) -> Result<()> {
        let running = {
            let mut bots = self.bots.lock().await;
            bots.remove(&bot_id)
        };
        match running {
            Some(running) => {
                running.handle.request_stop();
                let _ = running.task.await;
                Ok(())
            }
            None => {
                self.store.set_bot_status(bot_id, BotStatus::Inactive).await?;
                Ok(())
            }
        }
    }

    pub async fn delete_bot(self: &Arc<Self>, bot_id: i64) -> Result<()> {
        if self.is_running(bot_id).await {
            self.stop_bot(bot_id).await?;
        }
        self.store.delete_bot(bot_id).await?;
        Ok(())
    }

    pub async fn is_running(&self, bot_id: i64) -> bool {
        self.bots.lock().await.contains_key(&bot_id)
    }

    /// A merged status+uptime snapshot for the status fan-out channel and
    /// HTTP status endpoint. `None` if the bot isn't currently running.
    pub async fn get_current_parameters(&self, bot_id: i64) -> Option<Value> {
        let bots = self.bots.lock().await;
        let running = bots.get(&bot_id)?;
        let snapshot = running.handle.status().status_snapshot();
        let running_seconds = (Utc::now() - running.started_at).num_seconds().max(0);
        Some(serde_json::json!({
            "bot_id": bot_id,
            "status": snapshot.status,
            "current_price": snapshot.current_price,
            "initial_price": snapshot.initial_price,
            "deviation": snapshot.deviation,
            "realized_profit_a": snapshot.realized_profit_a,
            "realized_profit_b": snapshot.realized_profit_b,
            "active_orders_count": snapshot.active_orders_count,
            "completed_trades_count": snapshot.completed_trades_count,
            "initial_parameters": snapshot.initial_parameters,
            "running_time_seconds": running_seconds,
        }))
    }

    pub async fn shutdown_all(self: &Arc<Self>) {
        let ids: Vec<i64> = self.bots.lock().await.keys().copied().collect();
        for id in ids {
            let _ = self.stop_bot(id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_variants_cover_all_bot_types() {
        // Compile-time check that Handle's match arms stay exhaustive as
        // BotParams grows — see the match in `spawn`.
        fn _assert(h: &Handle) -> Arc<dyn StrategyStatus> {
            h.status()
        }
    }
}
