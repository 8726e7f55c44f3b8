//! Price Stream — one long-lived ticker subscription per bot, exposing the
//! latest price as a cheap atomic read. A sampler, not a log: no delivery
//! guarantee on any single tick, only eventual freshness.

use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct TickerFrame {
    #[serde(rename = "c")]
    close: String,
}

pub struct PriceStream {
    rx: watch::Receiver<Option<f64>>,
}

impl PriceStream {
    pub fn start(ws_base: &str, symbol: &str) -> Self {
        let (tx, rx) = watch::channel(None);
        let url = format!("{}/ws/{}@ticker", ws_base, symbol.to_lowercase());
        tokio::spawn(run_loop(url, tx));
        Self { rx }
    }

    pub fn current_price(&self) -> Option<f64> {
        *self.rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<f64>> {
        self.rx.clone()
    }
}

async fn run_loop(url: String, tx: watch::Sender<Option<f64>>) {
    loop {
        match connect_async(&url).await {
            Ok((mut ws, _)) => {
                debug!("price stream connected: {url}");
                while let Some(msg) = ws.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            if let Ok(frame) = serde_json::from_str::<TickerFrame>(&text) {
                                if let Ok(price) = frame.close.parse::<f64>() {
                                    let _ = tx.send(Some(price));
                                }
                            }
                        }
                        Ok(Message::Close(_)) => break,
                        Err(e) => {
                            warn!("price stream read error: {e}");
                            break;
                        }
                        _ => {}
                    }
                }
            }
            Err(e) => {
                warn!("price stream connect failed: {e}");
            }
        }
        tokio::time::sleep(RECONNECT_BACKOFF).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_frame_parses_close_price() {
        let frame: TickerFrame = serde_json::from_str(r#"{"c":"2000.50"}"#).unwrap();
        assert_eq!(frame.close.parse::<f64>().unwrap(), 2000.50);
    }
}
