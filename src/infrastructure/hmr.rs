use crate::core::interfaces::{LiveUpdateChannel, LiveUpdateMessage};
use crate::utils::{KilnError, Logger, Result};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct HmrClient {
    pub id: String,
    pub addr: SocketAddr,
    pub connected_at: SystemTime,
}

/// Fans live-update messages out to in-process subscribers and websocket
/// clients. Publishing with nobody listening is not an error.
#[derive(Clone)]
pub struct HmrBroadcaster {
    clients: Arc<DashMap<String, HmrClient>>,
    sender: broadcast::Sender<LiveUpdateMessage>,
}

impl Default for HmrBroadcaster {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl HmrBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            clients: Arc::new(DashMap::new()),
            sender,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveUpdateMessage> {
        self.sender.subscribe()
    }

    pub fn clients(&self) -> Vec<HmrClient> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Bind `addr` and push every message to connected websocket clients
    pub async fn listen(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| KilnError::build(format!("HMR server bind failed: {}", e)))?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!("🔥 HMR server started on ws://{}", addr);
        }

        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| KilnError::build(format!("HMR accept failed: {}", e)))?;

            let clients = self.clients.clone();
            let updates = self.sender.subscribe();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_client(stream, addr, clients, updates).await {
                    Logger::warn(&format!("HMR client error {}: {}", addr, e));
                }
            });
        }
    }

    async fn handle_client(
        stream: TcpStream,
        addr: SocketAddr,
        clients: Arc<DashMap<String, HmrClient>>,
        mut updates: broadcast::Receiver<LiveUpdateMessage>,
    ) -> Result<()> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| KilnError::build(format!("WebSocket handshake failed: {}", e)))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let client_id = Uuid::new_v4().to_string();
        clients.insert(
            client_id.clone(),
            HmrClient {
                id: client_id.clone(),
                addr,
                connected_at: SystemTime::now(),
            },
        );
        tracing::info!("🔌 HMR client connected: {}", client_id);

        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Ok(message) => {
                        let text = serde_json::to_string(&message)?;
                        if ws_sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        Logger::warn(&format!("HMR client {} skipped {} updates", client_id, skipped));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                incoming = ws_receiver.next() => match incoming {
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws_sender.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                },
            }
        }

        clients.remove(&client_id);
        tracing::info!("🔌 HMR client disconnected: {}", client_id);
        Ok(())
    }
}

impl LiveUpdateChannel for HmrBroadcaster {
    fn publish(&self, message: LiveUpdateMessage) {
        // no receivers yet
        let _ = self.sender.send(message);
    }
}
