use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::AppState;

/// Envelope pushed to clients: `{"type": ..., "payload": {...}}`.
///
/// Events only signal that something changed; clients refetch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PushEvent {
    NewBankCardReady { item_id: String },
    TransactionsUpdated { item_id: String, inserted: usize },
}

#[derive(Clone, Default)]
pub struct Notifier {
    subscribers: Arc<RwLock<HashMap<Uuid, mpsc::UnboundedSender<PushEvent>>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self) -> (Uuid, mpsc::UnboundedReceiver<PushEvent>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().await.insert(id, tx);
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        self.subscribers.write().await.remove(&id);
    }

    #[cfg(test)]
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Sends `event` to every open subscriber and returns how many got it.
    pub async fn broadcast(&self, event: PushEvent) -> usize {
        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|id, tx| {
            let open = tx.send(event.clone()).is_ok();
            if !open {
                tracing::debug!("Dropping closed push subscriber {}", id);
            }
            open
        });

        tracing::info!("Broadcast {:?} to {} clients", &event, subscribers.len());
        subscribers.len()
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let notifier = state.notifier.clone();
    ws.on_upgrade(move |socket| handle_socket(notifier, socket))
}

async fn handle_socket(notifier: Notifier, socket: WebSocket) {
    let (id, mut events) = notifier.subscribe().await;
    let (mut sender, mut receiver) = socket.split();

    tracing::info!("Push client {} connected", id);

    let forward_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(err) => {
                    tracing::error!("Failed to serialise push event: {}", err);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::error!("Push client {} errored: {}", id, err);
                break;
            }
        }
    }

    forward_task.abort();
    notifier.unsubscribe(id).await;

    tracing::info!("Push client {} disconnected", id);
}
