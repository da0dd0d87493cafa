//! Binary high-rate channel: 3-byte depth records over a plain WebSocket.
//!
//! Backed by a `tokio::sync::broadcast` channel: with no subscriber the
//! send fails and the record is discarded; a slow subscriber lags and
//! skips, never queuing unboundedly.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Depth-of-queue before a slow subscriber starts dropping.
pub const RAW_CHANNEL_DEPTH: usize = 256;

pub type RawSender = broadcast::Sender<[u8; 3]>;

pub fn raw_channel() -> RawSender {
    broadcast::channel(RAW_CHANNEL_DEPTH).0
}

/// `GET /raw` — upgrade and stream records until the client goes away.
pub async fn raw_ws_handler(ws: WebSocketUpgrade, State(tx): State<RawSender>) -> Response {
    ws.on_upgrade(move |socket| forward_records(socket, tx.subscribe()))
}

async fn forward_records(mut socket: WebSocket, mut rx: broadcast::Receiver<[u8; 3]>) {
    info!("raw: subscriber connected");
    loop {
        match rx.recv().await {
            Ok(rec) => {
                if socket.send(Message::Binary(rec.to_vec())).await.is_err() {
                    // Dead socket: drop the subscription, sender side is untouched.
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!("raw: subscriber lagged, {n} records skipped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    info!("raw: subscriber disconnected");
}
