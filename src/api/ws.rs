//! WebSocket event streaming.
//!
//! Each connection subscribes to the in-process bus with its requested
//! topic patterns and receives matching events as JSON text frames. The
//! forwarding loop ends when the client disconnects or the bus closes.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::StreamExt;

use crate::events::{InProcessBus, UniversalEvent};

pub async fn stream_events(socket: WebSocket, bus: Arc<InProcessBus>, patterns: Vec<String>) {
    let (mut sink, mut source) = socket.split();

    // One bus subscription per pattern, fanned into a single channel.
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<UniversalEvent>();
    for pattern in &patterns {
        let mut subscription = bus.subscribe(pattern);
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                if tx.send(event).is_err() {
                    return;
                }
            }
        });
    }
    drop(tx);
    log::debug!("[Ws] client subscribed to {:?}", patterns);

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if futures::SinkExt::send(&mut sink, Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = source.next() => {
                match incoming {
                    // Ignore client chatter; only close ends the stream.
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    log::debug!("[Ws] client disconnected");
}
