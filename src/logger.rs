//! Per-bot Async Logger — dual bounded queue, background batched flush,
//! synchronous `fatal`/`panic` escape hatches that bypass the queue entirely.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, warn};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};

const QUEUE_CAPACITY: usize = 1024;
const FLUSH_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Info,
    Debug,
}

struct LogLine {
    tier: Tier,
    text: String,
}

pub struct AsyncLogger {
    bot_id: i64,
    tx: mpsc::Sender<LogLine>,
    drain_handle: tokio::task::JoinHandle<()>,
    info_writer: NonBlocking,
    debug_writer: NonBlocking,
    _info_guard: Arc<WorkerGuard>,
    _debug_guard: Arc<WorkerGuard>,
}

impl AsyncLogger {
    pub async fn new(log_dir: &str, bot_id: i64) -> Result<Self> {
        let dir = PathBuf::from(log_dir).join(format!("bot_{bot_id}"));
        tokio::fs::create_dir_all(&dir)
            .await
            .context("failed to create bot log directory")?;
        let info_path = dir.join("trades.log");
        let debug_path = dir.join("debug.log");

        let info_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&info_path)
            .context("failed to open trades log file")?;
        let debug_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&debug_path)
            .context("failed to open debug log file")?;

        let (info_writer, info_guard) = tracing_appender::non_blocking(info_file);
        let (debug_writer, debug_guard) = tracing_appender::non_blocking(debug_file);

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let drain_handle = tokio::spawn(drain_loop(rx, info_writer.clone(), debug_writer.clone()));

        Ok(Self {
            bot_id,
            tx,
            drain_handle,
            info_writer,
            debug_writer,
            _info_guard: Arc::new(info_guard),
            _debug_guard: Arc::new(debug_guard),
        })
    }

    pub async fn log(&self, msg: impl Into<String>) {
        let line = LogLine {
            tier: Tier::Info,
            text: format_line(msg.into()),
        };
        if self.tx.send(line).await.is_err() {
            warn!(bot_id = self.bot_id, "log queue closed, dropping info entry");
        }
    }

    pub async fn debug(&self, msg: impl Into<String>) {
        let line = LogLine {
            tier: Tier::Debug,
            text: format_line(msg.into()),
        };
        if self.tx.send(line).await.is_err() {
            warn!(bot_id = self.bot_id, "log queue closed, dropping debug entry");
        }
    }

    /// Writes immediately, bypassing the queue, then terminates the process.
    pub async fn fatal(&self, msg: impl Into<String>) -> ! {
        let line = format_line(msg.into());
        let mut w = self.info_writer.clone();
        let _ = w.write_all(line.as_bytes());
        let _ = w.write_all(b"\n");
        error!(bot_id = self.bot_id, "FATAL: {}", line);
        std::process::exit(1);
    }

    /// Writes immediately, bypassing the queue, then surfaces a runtime
    /// failure to the caller instead of terminating the process.
    pub async fn panic(&self, msg: impl Into<String>) -> anyhow::Error {
        let line = format_line(msg.into());
        let mut w = self.debug_writer.clone();
        let _ = w.write_all(line.as_bytes());
        let _ = w.write_all(b"\n");
        error!(bot_id = self.bot_id, "PANIC: {}", line);
        anyhow::anyhow!("{}", line)
    }

    /// Drains both queues before returning.
    pub async fn close(self) {
        drop(self.tx);
        let _ = self.drain_handle.await;
    }
}

fn format_line(msg: String) -> String {
    format!("{} {}", Utc::now().to_rfc3339(), msg)
}

async fn drain_loop(mut rx: mpsc::Receiver<LogLine>, mut info_writer: NonBlocking, mut debug_writer: NonBlocking) {
    let mut batch: Vec<LogLine> = Vec::with_capacity(FLUSH_BATCH_SIZE);
    loop {
        let received = rx.recv_many(&mut batch, FLUSH_BATCH_SIZE).await;
        if received == 0 {
            break;
        }
        let mut info_buf = String::new();
        let mut debug_buf = String::new();
        for line in batch.drain(..) {
            match line.tier {
                Tier::Info => {
                    info_buf.push_str(&line.text);
                    info_buf.push('\n');
                }
                Tier::Debug => {
                    debug_buf.push_str(&line.text);
                    debug_buf.push('\n');
                }
            }
        }
        if !info_buf.is_empty() {
            let _ = info_writer.write_all(info_buf.as_bytes());
        }
        if !debug_buf.is_empty() {
            let _ = debug_writer.write_all(debug_buf.as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logger_creates_files_and_drains_on_close() {
        let tmp = std::env::temp_dir().join(format!("gridbot_logger_test_{}", uuid::Uuid::new_v4()));
        let dir = tmp.to_string_lossy().to_string();
        let logger = AsyncLogger::new(&dir, 1).await.unwrap();
        logger.log("hello").await;
        logger.debug("world").await;
        logger.close().await;

        let trades = tokio::fs::read_to_string(tmp.join("bot_1/trades.log")).await.unwrap();
        assert!(trades.contains("hello"));
        let debug = tokio::fs::read_to_string(tmp.join("bot_1/debug.log")).await.unwrap();
        assert!(debug.contains("world"));

        let _ = tokio::fs::remove_dir_all(tmp).await;
    }
}
