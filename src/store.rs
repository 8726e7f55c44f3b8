//! Persistence Store — durable tables scoped by `bot_id`.
//!
//! Every method takes `bot_id` as its first argument (aside from the bot
//! table itself) and is a single query, or — where multiple statements must
//! be atomic — a transaction that never suspends on anything but the next
//! query in the same unit of work.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BotStatus {
    Active,
    Inactive,
}

impl BotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotStatus::Active => "active",
            BotStatus::Inactive => "inactive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrderStatus {
    Open,
    Filled,
    Canceled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "OPEN",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TradeType {
    BuySell,
    SellBuy,
}

impl TradeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeType::BuySell => "BUY_SELL",
            TradeType::SellBuy => "SELL_BUY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TradeStatus {
    Open,
    Closed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "OPEN",
            TradeStatus::Closed => "CLOSED",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BotRow {
    pub id: i64,
    pub bot_type: String,
    pub symbol: String,
    pub api_key: String,
    #[serde(skip_serializing)]
    pub api_secret: String,
    pub testnet: bool,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ActiveOrderRow {
    pub order_id: i64,
    pub bot_id: i64,
    pub order_type: String,
    pub is_initial: bool,
    pub price: f64,
    pub quantity: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct OrderHistoryRow {
    pub order_id: i64,
    pub bot_id: i64,
    pub order_type: String,
    pub is_initial: bool,
    pub price: f64,
    pub quantity: f64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TradeHistoryRow {
    pub id: i64,
    pub bot_id: i64,
    pub trade_type: String,
    pub buy_price: f64,
    pub sell_price: f64,
    pub quantity: f64,
    pub profit: f64,
    pub profit_asset: String,
    pub status: String,
    pub buy_order_id: i64,
    pub sell_order_id: i64,
    pub executed_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await
            .context("failed to connect to persistence store")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bots (
                id BIGSERIAL PRIMARY KEY,
                bot_type TEXT NOT NULL,
                symbol TEXT NOT NULL,
                api_key TEXT NOT NULL,
                api_secret TEXT NOT NULL,
                testnet BOOLEAN NOT NULL DEFAULT false,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE TABLE IF NOT EXISTS active_orders (
                order_id BIGINT NOT NULL,
                bot_id BIGINT NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
                order_type TEXT NOT NULL,
                is_initial BOOLEAN NOT NULL,
                price DOUBLE PRECISION NOT NULL,
                quantity DOUBLE PRECISION NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE (bot_id, order_id)
            );
            CREATE TABLE IF NOT EXISTS order_history (
                order_id BIGINT NOT NULL,
                bot_id BIGINT NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
                order_type TEXT NOT NULL,
                is_initial BOOLEAN NOT NULL,
                price DOUBLE PRECISION NOT NULL,
                quantity DOUBLE PRECISION NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE (bot_id, order_id)
            );
            CREATE TABLE IF NOT EXISTS trade_history (
                id BIGSERIAL PRIMARY KEY,
                bot_id BIGINT NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
                trade_type TEXT NOT NULL,
                buy_price DOUBLE PRECISION NOT NULL,
                sell_price DOUBLE PRECISION NOT NULL,
                quantity DOUBLE PRECISION NOT NULL,
                profit DOUBLE PRECISION NOT NULL DEFAULT 0,
                profit_asset TEXT NOT NULL,
                status TEXT NOT NULL,
                buy_order_id BIGINT NOT NULL,
                sell_order_id BIGINT NOT NULL,
                executed_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to run persistence store migrations")?;
        Ok(())
    }

    // ── bots ──────────────────────────────────────────────

    pub async fn insert_bot(
        &self,
        bot_type: &str,
        symbol: &str,
        api_key: &str,
        api_secret: &str,
        testnet: bool,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO bots (bot_type, symbol, api_key, api_secret, testnet, status) \
             VALUES ($1, $2, $3, $4, $5, 'active') RETURNING id",
        )
        .bind(bot_type)
        .bind(symbol)
        .bind(api_key)
        .bind(api_secret)
        .bind(testnet)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert bot row")?;
        Ok(row.0)
    }

    pub async fn get_bot(&self, bot_id: i64) -> Result<Option<BotRow>> {
        let row = sqlx::query_as::<_, BotRow>("SELECT * FROM bots WHERE id = $1")
            .bind(bot_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch bot row")?;
        Ok(row)
    }

    pub async fn list_bots(&self) -> Result<Vec<BotRow>> {
        let rows = sqlx::query_as::<_, BotRow>("SELECT * FROM bots ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("failed to list bots")?;
        Ok(rows)
    }

    pub async fn set_bot_status(&self, bot_id: i64, status: BotStatus) -> Result<()> {
        sqlx::query("UPDATE bots SET status = $1, updated_at = now() WHERE id = $2")
            .bind(status.as_str())
            .bind(bot_id)
            .execute(&self.pool)
            .await
            .context("failed to update bot status")?;
        Ok(())
    }

    pub async fn delete_bot(&self, bot_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM bots WHERE id = $1")
            .bind(bot_id)
            .execute(&self.pool)
            .await
            .context("failed to delete bot row")?;
        Ok(())
    }

    // ── active orders ─────────────────────────────────────

    pub async fn upsert_active_order(
        &self,
        bot_id: i64,
        order_id: i64,
        order_type: OrderSide,
        is_initial: bool,
        price: f64,
        quantity: f64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO active_orders (order_id, bot_id, order_type, is_initial, price, quantity) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (bot_id, order_id) DO UPDATE SET \
                order_type = EXCLUDED.order_type, is_initial = EXCLUDED.is_initial, \
                price = EXCLUDED.price, quantity = EXCLUDED.quantity",
        )
        .bind(order_id)
        .bind(bot_id)
        .bind(order_type.as_str())
        .bind(is_initial)
        .bind(price)
        .bind(quantity)
        .execute(&self.pool)
        .await
        .context("failed to upsert active order")?;
        Ok(())
    }

    pub async fn remove_active_order(&self, bot_id: i64, order_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM active_orders WHERE bot_id = $1 AND order_id = $2")
            .bind(bot_id)
            .bind(order_id)
            .execute(&self.pool)
            .await
            .context("failed to remove active order")?;
        Ok(())
    }

    pub async fn list_active_orders(&self, bot_id: i64) -> Result<Vec<ActiveOrderRow>> {
        let rows = sqlx::query_as::<_, ActiveOrderRow>(
            "SELECT * FROM active_orders WHERE bot_id = $1 ORDER BY created_at",
        )
        .bind(bot_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list active orders")?;
        Ok(rows)
    }

    pub async fn list_initial_active_orders(&self, bot_id: i64) -> Result<Vec<ActiveOrderRow>> {
        let rows = sqlx::query_as::<_, ActiveOrderRow>(
            "SELECT * FROM active_orders WHERE bot_id = $1 AND is_initial = true ORDER BY created_at",
        )
        .bind(bot_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list initial active orders")?;
        Ok(rows)
    }

    pub async fn delete_active_orders_for_bot(&self, bot_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM active_orders WHERE bot_id = $1")
            .bind(bot_id)
            .execute(&self.pool)
            .await
            .context("failed to clear active orders for bot")?;
        Ok(())
    }

    // ── order history ─────────────────────────────────────

    pub async fn upsert_order_history(
        &self,
        bot_id: i64,
        order_id: i64,
        order_type: OrderSide,
        is_initial: bool,
        price: f64,
        quantity: f64,
        status: OrderStatus,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO order_history (order_id, bot_id, order_type, is_initial, price, quantity, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (bot_id, order_id) DO UPDATE SET \
                status = EXCLUDED.status, updated_at = now()",
        )
        .bind(order_id)
        .bind(bot_id)
        .bind(order_type.as_str())
        .bind(is_initial)
        .bind(price)
        .bind(quantity)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .context("failed to upsert order history")?;
        Ok(())
    }

    pub async fn set_order_history_status(
        &self,
        bot_id: i64,
        order_id: i64,
        status: OrderStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE order_history SET status = $1, updated_at = now() \
             WHERE bot_id = $2 AND order_id = $3",
        )
        .bind(status.as_str())
        .bind(bot_id)
        .bind(order_id)
        .execute(&self.pool)
        .await
        .context("failed to update order history status")?;
        Ok(())
    }

    pub async fn list_order_history(&self, bot_id: i64) -> Result<Vec<OrderHistoryRow>> {
        let rows = sqlx::query_as::<_, OrderHistoryRow>(
            "SELECT * FROM order_history WHERE bot_id = $1 ORDER BY created_at DESC",
        )
        .bind(bot_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list order history")?;
        Ok(rows)
    }

    // ── trade history ─────────────────────────────────────

    pub async fn insert_open_trade(
        &self,
        bot_id: i64,
        trade_type: TradeType,
        buy_price: f64,
        sell_price: f64,
        quantity: f64,
        profit_asset: &str,
        buy_order_id: i64,
        sell_order_id: i64,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO trade_history \
                (bot_id, trade_type, buy_price, sell_price, quantity, profit, profit_asset, \
                 status, buy_order_id, sell_order_id) \
             VALUES ($1, $2, $3, $4, $5, 0, $6, 'OPEN', $7, $8) RETURNING id",
        )
        .bind(bot_id)
        .bind(trade_type.as_str())
        .bind(buy_price)
        .bind(sell_price)
        .bind(quantity)
        .bind(profit_asset)
        .bind(buy_order_id)
        .bind(sell_order_id)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert open trade")?;
        Ok(row.0)
    }

    /// Locates the most recent OPEN trade row matching `(bot_id, buy_price, quantity)`.
    /// Returns `None` on no match rather than erroring — the caller treats an
    /// absent match as a logged anomaly, never a crash.
    pub async fn find_open_trade_by_buy(
        &self,
        bot_id: i64,
        buy_price: f64,
        quantity: f64,
    ) -> Result<Option<TradeHistoryRow>> {
        let row = sqlx::query_as::<_, TradeHistoryRow>(
            "SELECT * FROM trade_history \
             WHERE bot_id = $1 AND buy_price = $2 AND quantity = $3 AND status = 'OPEN' \
             ORDER BY executed_at DESC LIMIT 1",
        )
        .bind(bot_id)
        .bind(buy_price)
        .bind(quantity)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up open trade")?;
        Ok(row)
    }

    pub async fn close_trade(&self, trade_id: i64, profit: f64) -> Result<()> {
        sqlx::query("UPDATE trade_history SET status = 'CLOSED', profit = $1 WHERE id = $2")
            .bind(profit)
            .bind(trade_id)
            .execute(&self.pool)
            .await
            .context("failed to close trade")?;
        Ok(())
    }

    pub async fn insert_single_leg_trade(
        &self,
        bot_id: i64,
        order_id: i64,
        price: f64,
        quantity: f64,
    ) -> Result<i64> {
        // Sell Ladder fills have no paired leg; both price columns carry the
        // same value and the row is recorded already CLOSED.
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO trade_history \
                (bot_id, trade_type, buy_price, sell_price, quantity, profit, profit_asset, \
                 status, buy_order_id, sell_order_id) \
             VALUES ($1, 'BUY_SELL', $2, $2, $3, 0, 'n/a', 'CLOSED', $4, $4) RETURNING id",
        )
        .bind(bot_id)
        .bind(price)
        .bind(quantity)
        .bind(order_id)
        .fetch_one(&self.pool)
        .await
        .context("failed to record single-leg trade")?;
        Ok(row.0)
    }

    pub async fn list_trade_history(&self, bot_id: i64) -> Result<Vec<TradeHistoryRow>> {
        let rows = sqlx::query_as::<_, TradeHistoryRow>(
            "SELECT * FROM trade_history WHERE bot_id = $1 ORDER BY executed_at DESC",
        )
        .bind(bot_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list trade history")?;
        Ok(rows)
    }
}
