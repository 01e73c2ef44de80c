//! WebSocket market data feed
//!
//! One connection per instrument subscription. Text frames carry a JSON tick
//! object or an array of them; binary frames are ignored.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::SinkExt as _;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::agents::{Tick, TickFeed, TickStream};
use crate::error::{OrraError, Result};

/// How often to send ping frames
const PING_INTERVAL_SECS: u64 = 30;

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Ticks buffered between the socket task and the consumer
const CHANNEL_CAPACITY: usize = 1024;

pub struct WsTickFeed {
    ws_url: String,
}

impl WsTickFeed {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }
}

fn subscribe_frames(instrument_token: u32) -> [String; 2] {
    [
        serde_json::json!({ "a": "subscribe", "v": [instrument_token] }).to_string(),
        serde_json::json!({ "a": "mode", "v": ["quote", [instrument_token]] }).to_string(),
    ]
}

/// Extract ticks for `instrument_token` from one text frame
pub fn parse_frame(text: &str, instrument_token: u32) -> Vec<Tick> {
    let ticks = if text.trim_start().starts_with('[') {
        serde_json::from_str::<Vec<Tick>>(text).ok()
    } else {
        serde_json::from_str::<Tick>(text).ok().map(|t| vec![t])
    };

    match ticks {
        Some(ticks) => ticks
            .into_iter()
            .filter(|t| t.instrument_token == instrument_token)
            .collect(),
        None => {
            let preview: String = text.chars().take(100).collect();
            debug!("Unrecognized market data frame: {}", preview);
            Vec::new()
        }
    }
}

#[async_trait]
impl TickFeed for WsTickFeed {
    async fn subscribe(&self, instrument_token: u32) -> Result<TickStream> {
        let url = Url::parse(&self.ws_url)
            .map_err(|e| OrraError::Configuration(format!("Invalid WebSocket URL: {}", e)))?;

        info!(instrument_token, "Connecting to market data WebSocket: {}", url);

        let (ws_stream, _) = tokio::time::timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            connect_async(url.as_str()),
        )
        .await
        .map_err(|_| OrraError::TransientIo("market data connection timeout".to_string()))??;

        let (mut write, mut read) = ws_stream.split();
        for frame in subscribe_frames(instrument_token) {
            write.send(Message::Text(frame)).await?;
        }

        let (mut tx, rx) = mpsc::channel::<Result<Tick>>(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut ping_interval = interval(Duration::from_secs(PING_INTERVAL_SECS));
            loop {
                tokio::select! {
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                for tick in parse_frame(&text, instrument_token) {
                                    if tx.send(Ok(tick)).await.is_err() {
                                        debug!(instrument_token, "Tick consumer gone, closing socket");
                                        return;
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if let Err(e) = write.send(Message::Pong(data)).await {
                                    error!("Failed to send pong: {}", e);
                                }
                            }
                            Some(Ok(Message::Close(_))) => {
                                info!(instrument_token, "Received close frame");
                                return;
                            }
                            Some(Err(e)) => {
                                warn!(instrument_token, error = %e, "Market data socket error");
                                let _ = tx.send(Err(OrraError::WebSocket(e))).await;
                                return;
                            }
                            None => {
                                info!(instrument_token, "Market data socket ended");
                                return;
                            }
                            _ => {}
                        }
                    }
                    _ = ping_interval.tick() => {
                        if tx.is_closed() {
                            return;
                        }
                        if let Err(e) = write.send(Message::Ping(vec![])).await {
                            error!("Failed to send ping: {}", e);
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx.boxed())
    }
}
