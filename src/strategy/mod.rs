//! Shared strategy types: the status-snapshot contract the Supervisor polls,
//! ephemeral grid bookkeeping structures, and the per-bot-type parameter
//! variants decoded at the Control Surface boundary.

pub mod grid;
pub mod index_fund;
pub mod sell_ladder;

use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A freshly-derived snapshot of a running strategy's state, read
/// synchronously by the Supervisor and fan-out status worker. Never stale —
/// the engine loop overwrites it every iteration.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub status: String,
    pub current_price: Option<f64>,
    pub initial_price: Option<f64>,
    pub deviation: Option<f64>,
    pub realized_profit_a: f64,
    pub realized_profit_b: f64,
    pub active_orders_count: usize,
    pub completed_trades_count: usize,
    pub initial_parameters: Value,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            status: "active".to_string(),
            current_price: None,
            initial_price: None,
            deviation: None,
            realized_profit_a: 0.0,
            realized_profit_b: 0.0,
            active_orders_count: 0,
            completed_trades_count: 0,
            initial_parameters: Value::Null,
        }
    }
}

/// Shared slot the engine loop writes into and the Supervisor reads from
/// without crossing an await point — a plain std `RwLock` is correct here
/// because it is never held across `.await`.
pub struct StatusCell(RwLock<StatusSnapshot>);

impl StatusCell {
    pub fn new(initial: StatusSnapshot) -> Self {
        Self(RwLock::new(initial))
    }

    pub fn set(&self, snapshot: StatusSnapshot) {
        *self.0.write().expect("status cell poisoned") = snapshot;
    }

    pub fn get(&self) -> StatusSnapshot {
        self.0.read().expect("status cell poisoned").clone()
    }
}

pub trait StrategyStatus: Send + Sync {
    fn status_snapshot(&self) -> StatusSnapshot;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotType {
    Grid,
    IndexFund,
    SellBot,
}

impl BotType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotType::Grid => "grid",
            BotType::IndexFund => "indexfund",
            BotType::SellBot => "sellbot",
        }
    }
}

/// Per-variant construction parameters, tagged by `type`. HTTP decoding
/// performs the tag discrimination (via serde's internally-tagged enum) and
/// rejects unknown fields, per the dynamic-typed-config-blob resolution.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum BotParams {
    Grid(grid::GridParams),
    IndexFund(index_fund::IndexFundParams),
    SellBot(sell_ladder::SellLadderParams),
}

impl BotParams {
    pub fn symbol(&self) -> &str {
        match self {
            BotParams::Grid(p) => &p.symbol,
            BotParams::IndexFund(p) => &p.grid.symbol,
            BotParams::SellBot(p) => &p.symbol,
        }
    }

    pub fn api_key(&self) -> &str {
        match self {
            BotParams::Grid(p) => &p.api_key,
            BotParams::IndexFund(p) => &p.grid.api_key,
            BotParams::SellBot(p) => &p.api_key,
        }
    }

    pub fn api_secret(&self) -> &str {
        match self {
            BotParams::Grid(p) => &p.api_secret,
            BotParams::IndexFund(p) => &p.grid.api_secret,
            BotParams::SellBot(p) => &p.api_secret,
        }
    }

    pub fn testnet(&self) -> bool {
        match self {
            BotParams::Grid(p) => p.testnet,
            BotParams::IndexFund(p) => p.grid.testnet,
            BotParams::SellBot(p) => p.testnet,
        }
    }

    pub fn bot_type(&self) -> BotType {
        match self {
            BotParams::Grid(_) => BotType::Grid,
            BotParams::IndexFund(_) => BotType::IndexFund,
            BotParams::SellBot(_) => BotType::SellBot,
        }
    }

    /// `(base asset amount required, quote asset amount required)` for the
    /// Balance Precheck.
    pub fn required_funds(&self) -> (f64, f64) {
        match self {
            BotParams::Grid(p) => (p.asset_b_funds, p.asset_a_funds),
            BotParams::IndexFund(p) => (p.grid.asset_b_funds, p.grid.asset_a_funds),
            BotParams::SellBot(p) => (p.batch_size * p.grids as f64, 0.0),
        }
    }
}
