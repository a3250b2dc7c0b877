use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::auth::BybitAuth;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECONNECT_DELAY_SECS: u64 = 5;
const PING_INTERVAL_SECS: u64 = 20;
const AUTH_EXPIRY_MS: i64 = 10_000;

/// A filled order reported on the private `order` topic.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderFill {
    pub symbol: String,
    pub order_id: String,
    /// Bybit `stopOrderType`, e.g. "TakeProfit", "StopLoss", "Stop", or empty.
    pub stop_order_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderUpdate {
    symbol: String,
    order_id: String,
    order_status: String,
    #[serde(default)]
    stop_order_type: String,
}

#[derive(Debug, Deserialize)]
struct TopicMessage {
    topic: Option<String>,
    #[serde(default)]
    data: Vec<OrderUpdate>,
}

/// Private websocket feed that forwards order fills to the OCO dispatcher.
pub struct OrderStream {
    url: String,
    auth: BybitAuth,
}

impl OrderStream {
    pub fn new(url: String, auth: BybitAuth) -> Self {
        Self { url, auth }
    }

    /// Runs until the receiving side of `fills` is dropped.
    pub async fn run(self, fills: mpsc::Sender<OrderFill>) -> Result<()> {
        loop {
            match self.connect().await {
                Ok(ws_stream) => match self.handle_stream(ws_stream, &fills).await {
                    Ok(()) if fills.is_closed() => {
                        info!("Fill receiver dropped, stopping order stream");
                        return Ok(());
                    }
                    Ok(()) => warn!("Order stream ended, reconnecting in {}s", RECONNECT_DELAY_SECS),
                    Err(e) => error!("Order stream error: {:#}, reconnecting in {}s", e, RECONNECT_DELAY_SECS),
                },
                Err(e) => error!("Order stream connection failed: {:#}", e),
            }
            tokio::time::sleep(tokio::time::Duration::from_secs(RECONNECT_DELAY_SECS)).await;
        }
    }

    async fn connect(&self) -> Result<WsStream> {
        info!("Connecting to Bybit private stream: {}", self.url);
        let (ws_stream, response) = connect_async(&self.url)
            .await
            .context("websocket handshake failed")?;
        info!("Private stream connected: {:?}", response.status());
        Ok(ws_stream)
    }

    async fn handle_stream(&self, ws_stream: WsStream, fills: &mpsc::Sender<OrderFill>) -> Result<()> {
        let (write, mut read) = ws_stream.split();
        let write = std::sync::Arc::new(tokio::sync::Mutex::new(write));

        let expires = chrono::Utc::now().timestamp_millis() + AUTH_EXPIRY_MS;
        let auth_msg = serde_json::json!({ "op": "auth", "args": self.auth.ws_auth_args(expires) });
        let sub_msg = serde_json::json!({ "op": "subscribe", "args": ["order"] });
        {
            let mut w = write.lock().await;
            w.send(Message::Text(auth_msg.to_string())).await?;
            w.send(Message::Text(sub_msg.to_string())).await?;
        }
        info!("Subscribed to private order topic");

        let ping_task = {
            let write = write.clone();
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(tokio::time::Duration::from_secs(PING_INTERVAL_SECS));
                loop {
                    interval.tick().await;
                    let mut w = write.lock().await;
                    if w.send(Message::Ping(vec![])).await.is_err() {
                        break;
                    }
                }
            })
        };

        let outcome = forward_fills(&mut read, fills).await;

        ping_task.abort();
        outcome
    }
}

async fn forward_fills(
    read: &mut futures::stream::SplitStream<WsStream>,
    fills: &mpsc::Sender<OrderFill>,
) -> Result<()> {
    while let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => {
                for fill in parse_fills(&text) {
                    if fills.send(fill).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Message::Pong(_) => debug!("Pong received"),
            Message::Close(_) => {
                warn!("Private stream closed by server");
                break;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Extract filled orders from a raw `order` topic frame. Control frames
/// (auth/subscribe acks, pongs) and non-fill updates yield nothing.
pub fn parse_fills(text: &str) -> Vec<OrderFill> {
    let msg: TopicMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("Ignoring non-order frame: {}", e);
            return Vec::new();
        }
    };

    if msg.topic.as_deref() != Some("order") {
        return Vec::new();
    }

    msg.data
        .into_iter()
        .filter(|u| u.order_status == "Filled")
        .map(|u| OrderFill {
            symbol: u.symbol,
            order_id: u.order_id,
            stop_order_type: u.stop_order_type,
        })
        .collect()
}
