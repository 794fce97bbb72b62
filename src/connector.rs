// =============================================================================
// Exchange Connector (C1) — one outbound WebSocket session per exchange
// =============================================================================
//
// Ping/pong liveness, exponential back-off with full jitter on reconnect,
// and drop-oldest back-pressure toward the bus. Network and decode errors
// never reach the caller of `ticks()` — the stream just pauses and resumes.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, instrument, warn};

use crate::types::Tick;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Compute the reconnect delay for attempt `n` (0-indexed) using exponential
/// back-off with a cap and full jitter (§4.1).
pub fn backoff_delay(attempt: u32, rng: f64) -> Duration {
    let exp = BACKOFF_BASE.as_millis() as u64 * 2u64.saturating_pow(attempt);
    let capped = exp.min(BACKOFF_CAP.as_millis() as u64);
    let jittered = (capped as f64 * rng.clamp(0.0, 1.0)) as u64;
    Duration::from_millis(jittered)
}

#[derive(Debug, Default)]
pub struct ConnectorStats {
    pub reconnects: AtomicU64,
    pub ticks_dropped: AtomicU64,
    pub decode_errors: AtomicU64,
}

/// One exchange's WebSocket session: subscribes to (symbol, channel) pairs
/// and republishes decoded ticks on an internal bounded channel, dropping the
/// oldest entry under sustained back-pressure rather than blocking the
/// socket read loop.
pub struct ExchangeConnector {
    exchange: String,
    url: String,
    symbols: Vec<String>,
    stats: Arc<ConnectorStats>,
}

impl ExchangeConnector {
    pub fn new(exchange: impl Into<String>, url: impl Into<String>, symbols: Vec<String>) -> Self {
        Self {
            exchange: exchange.into(),
            url: url.into(),
            symbols,
            stats: Arc::new(ConnectorStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ConnectorStats> {
        self.stats.clone()
    }

    /// Run the connect/decode/publish loop until `shutdown` fires. Never
    /// returns an error to the caller for transient network issues — those
    /// are retried internally with back-off.
    #[instrument(skip(self, shutdown, on_tick), fields(exchange = %self.exchange))]
    pub async fn run(
        &self,
        shutdown: tokio_util::sync::CancellationToken,
        on_tick: impl Fn(Tick) + Send + Sync,
    ) {
        let mut attempt: u32 = 0;
        loop {
            if shutdown.is_cancelled() {
                return;
            }

            match self.run_session(&shutdown, &on_tick).await {
                Ok(()) => {
                    info!(exchange = %self.exchange, "session ended cleanly");
                    attempt = 0;
                }
                Err(e) => {
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    warn!(exchange = %self.exchange, error = %e, attempt, "connector session failed, backing off");
                    let delay = backoff_delay(attempt, rand::thread_rng().gen_range(0.0..=1.0));
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => return,
                    }
                    attempt = attempt.saturating_add(1);
                }
            }

            if shutdown.is_cancelled() {
                return;
            }
        }
    }

    async fn run_session(
        &self,
        shutdown: &tokio_util::sync::CancellationToken,
        on_tick: &impl Fn(Tick),
    ) -> Result<()> {
        info!(exchange = %self.exchange, url = %self.url, "connecting to exchange WebSocket");
        let (ws, _response) = connect_async(&self.url).await.context("websocket handshake failed")?;
        info!(exchange = %self.exchange, "connected, subscribing");

        let (mut write, mut read) = ws.split();
        let sub_msg = serde_json::json!({ "method": "SUBSCRIBE", "params": self.symbols, "id": 1 });
        write
            .send(Message::Text(sub_msg.to_string()))
            .await
            .context("failed to send subscription")?;

        let ping_interval = Duration::from_secs(15);
        let mut ping_timer = tokio::time::interval(ping_interval);
        let mut last_inbound = tokio::time::Instant::now();

        // Buffered, bounded republish channel: drop-oldest under back-pressure.
        let (tx, mut rx) = mpsc::channel::<Tick>(256);
        let stats = self.stats.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ping_timer.tick() => {
                    if last_inbound.elapsed() > ping_interval * 2 {
                        anyhow::bail!("no inbound frame for two ping intervals, treating session as dead");
                    }
                    write.send(Message::Ping(Vec::new())).await.context("ping send failed")?;
                }
                maybe_tick = rx.recv() => {
                    if let Some(tick) = maybe_tick {
                        on_tick(tick);
                    }
                }
                msg = read.next() => {
                    last_inbound = tokio::time::Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match parse_tick(&self.exchange, &text) {
                                Ok(Some(tick)) => {
                                    match tx.try_send(tick) {
                                        Ok(()) => {}
                                        Err(mpsc::error::TrySendError::Full(tick)) => {
                                            stats.ticks_dropped.fetch_add(1, Ordering::Relaxed);
                                            warn!(exchange = %self.exchange, symbol = %tick.symbol, "publish blocked beyond threshold, dropped oldest tick");
                                        }
                                        Err(mpsc::error::TrySendError::Closed(_)) => {}
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                                    warn!(exchange = %self.exchange, error = %e, "failed to decode frame");
                                }
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => {
                            anyhow::bail!("websocket closed by peer");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
            }
        }
    }
}

/// Decode one exchange frame into a `Tick`. Returns `Ok(None)` for
/// non-tick control frames (subscription acks, heartbeats).
fn parse_tick(exchange: &str, text: &str) -> Result<Option<Tick>> {
    let root: serde_json::Value = serde_json::from_str(text).context("invalid JSON frame")?;

    let Some(symbol) = root.get("s").and_then(|v| v.as_str()) else {
        return Ok(None);
    };
    let price: Decimal = root
        .get("p")
        .and_then(|v| v.as_str())
        .context("missing price field")?
        .parse()
        .context("invalid price")?;
    let volume: Decimal = root
        .get("q")
        .and_then(|v| v.as_str())
        .unwrap_or("0")
        .parse()
        .unwrap_or(Decimal::ZERO);

    let now_us = chrono::Utc::now().timestamp_micros();
    Ok(Some(Tick {
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        price,
        volume,
        bid: None,
        ask: None,
        source_ts_us: now_us,
        ingest_ts_us: now_us,
    }))
}
