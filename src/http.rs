//! Control Surface — thin axum handlers invoking the Supervisor and Store.
//! No domain logic lives here beyond request decoding, the Balance
//! Precheck, and error-to-status mapping.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::EngineError;
use crate::fanout::run_client_session;
use crate::gateway::{ExchangeGateway, GlobalThrottle};
use crate::notifications::NotificationBus;
use crate::store::Store;
use crate::strategy::BotParams;
use crate::supervisor::Supervisor;
use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub store: Store,
    pub notifications: Arc<NotificationBus>,
    pub config: Config,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/bot/start", post(start_bot))
        .route("/bot/:id/stop", post(stop_bot))
        .route("/bot/:id", delete(delete_bot))
        .route("/bots", get(list_bots))
        .route("/balance", post(get_balance))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct StartBotResponse {
    bot_id: i64,
}

/// Splits a symbol like `ETHUSDT` into `(base, quote)` by stripping the
/// longest matching quote-asset suffix from a small known list. The
/// exchange's own symbol filters carry no asset-boundary field, so this is
/// a heuristic, not derived from authoritative metadata.
fn split_symbol(symbol: &str) -> (String, String) {
    const QUOTES: &[&str] = &["USDT", "BUSD", "USDC", "BTC", "ETH", "BNB"];
    for q in QUOTES {
        if symbol.len() > q.len() && symbol.ends_with(q) {
            return (symbol[..symbol.len() - q.len()].to_string(), q.to_string());
        }
    }
    (symbol.to_string(), "USDT".to_string())
}

async fn balance_precheck(
    config: &Config,
    params: &BotParams,
) -> Result<(), EngineError> {
    let global_throttle = Arc::new(GlobalThrottle::new(config.global_rate_limit_per_sec));
    let gateway = ExchangeGateway::new(
        config.exchange_rest_base.clone(),
        params.api_key().to_string(),
        params.api_secret().to_string(),
        config.order_semaphore_permits,
        config.default_recv_window_ms,
        config.widened_recv_window_ms,
        global_throttle,
    )
    .map_err(EngineError::Internal)?;

    let balances = gateway
        .get_account_balances()
        .await
        .map_err(EngineError::Internal)?;
    let (base, quote) = split_symbol(params.symbol());
    let (base_needed, quote_needed) = params.required_funds();

    let base_free = balances.get(&base).copied().unwrap_or(0.0);
    let quote_free = balances.get(&quote).copied().unwrap_or(0.0);

    if base_free < base_needed {
        return Err(EngineError::InsufficientFunds {
            asset: base,
            needed: base_needed,
            available: base_free,
        });
    }
    if quote_free < quote_needed {
        return Err(EngineError::InsufficientFunds {
            asset: quote,
            needed: quote_needed,
            available: quote_free,
        });
    }
    Ok(())
}

async fn start_bot(
    State(state): State<AppState>,
    Json(params): Json<BotParams>,
) -> Result<impl IntoResponse, EngineError> {
    balance_precheck(&state.config, &params).await?;
    let bot_id = state
        .supervisor
        .start_bot(params)
        .await
        .map_err(EngineError::Internal)?;
    info!(bot_id, "bot started via control surface");
    Ok(Json(StartBotResponse { bot_id }))
}

async fn stop_bot(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, EngineError> {
    state
        .supervisor
        .stop_bot(id)
        .await
        .map_err(EngineError::Internal)?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn delete_bot(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, EngineError> {
    state
        .supervisor
        .delete_bot(id)
        .await
        .map_err(EngineError::Internal)?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct BotListEntry {
    id: i64,
    bot_type: String,
    symbol: String,
    status: String,
    uptime_seconds: Option<i64>,
}

async fn list_bots(State(state): State<AppState>) -> Result<impl IntoResponse, EngineError> {
    let rows = state.store.list_bots().await.map_err(EngineError::Internal)?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let uptime_seconds = state
            .supervisor
            .get_current_parameters(row.id)
            .await
            .and_then(|v| v.get("running_time_seconds").and_then(|n| n.as_i64()));
        out.push(BotListEntry {
            id: row.id,
            bot_type: row.bot_type,
            symbol: row.symbol,
            status: row.status,
            uptime_seconds,
        });
    }
    Ok(Json(out))
}

#[derive(Debug, Deserialize)]
struct BalanceRequest {
    api_key: String,
    api_secret: String,
}

async fn get_balance(
    State(state): State<AppState>,
    Json(req): Json<BalanceRequest>,
) -> Result<impl IntoResponse, EngineError> {
    let global_throttle = Arc::new(GlobalThrottle::new(state.config.global_rate_limit_per_sec));
    let gateway = ExchangeGateway::new(
        state.config.exchange_rest_base.clone(),
        req.api_key,
        req.api_secret,
        state.config.order_semaphore_permits,
        state.config.default_recv_window_ms,
        state.config.widened_recv_window_ms,
        global_throttle,
    )
    .map_err(EngineError::Internal)?;
    let balances = gateway.get_account_balances().await.map_err(EngineError::Internal)?;
    let nonzero: std::collections::HashMap<_, _> = balances.into_iter().filter(|(_, v)| *v > 0.0).collect();
    Ok(Json(nonzero))
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let exchange_rest_base = state.config.exchange_rest_base.clone();
    ws.on_upgrade(move |socket| {
        run_client_session(socket, state.supervisor, state.store, state.notifications, exchange_rest_base)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_symbol_strips_known_quote_suffix() {
        assert_eq!(split_symbol("ETHUSDT"), ("ETH".to_string(), "USDT".to_string()));
        assert_eq!(split_symbol("BNBBTC"), ("BNB".to_string(), "BTC".to_string()));
    }

    #[test]
    fn split_symbol_falls_back_to_usdt_quote() {
        let (base, quote) = split_symbol("XYZ");
        assert_eq!(base, "XYZ");
        assert_eq!(quote, "USDT");
    }
}
