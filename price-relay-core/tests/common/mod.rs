//! Mock price service WebSocket endpoint for integration tests.
//!
//! Accepts any number of connections, records every text frame together with
//! the index of the connection it arrived on, acknowledges requests, and lets
//! the test push frames, send pings, or drop every open connection.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};

#[derive(Debug, Clone)]
enum Command {
    Text(String),
    Drop,
}

pub struct MockPriceService {
    addr: SocketAddr,
    commands: broadcast::Sender<Command>,
    messages: Arc<Mutex<Vec<(u32, String)>>>,
    connections: Arc<Mutex<u32>>,
}

impl MockPriceService {
    /// Starts a server. With `ping_every`, each connection is pinged on that
    /// interval; otherwise the server stays silent.
    pub async fn start(ping_every: Option<Duration>) -> Self {
        Self::start_at("127.0.0.1:0".parse().unwrap(), ping_every).await
    }

    /// Starts a server on a fixed address, e.g. one a client is already
    /// trying to reach.
    pub async fn start_at(addr: SocketAddr, ping_every: Option<Duration>) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (commands, _) = broadcast::channel(64);
        let messages = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(Mutex::new(0u32));

        let server_commands = commands.clone();
        let server_messages = messages.clone();
        let server_connections = connections.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let index = {
                    let mut count = server_connections.lock().await;
                    *count += 1;
                    *count
                };
                tokio::spawn(handle_connection(
                    stream,
                    index,
                    server_commands.subscribe(),
                    server_messages.clone(),
                    ping_every,
                ));
            }
        });

        Self {
            addr,
            commands,
            messages,
            connections,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn connection_count(&self) -> u32 {
        *self.connections.lock().await
    }

    pub async fn received_messages(&self) -> Vec<(u32, String)> {
        self.messages.lock().await.clone()
    }

    /// Sends a text frame to every open connection.
    pub fn push(&self, text: String) {
        let _ = self.commands.send(Command::Text(text));
    }

    /// Drops every open connection without a close handshake.
    pub fn drop_connections(&self) {
        let _ = self.commands.send(Command::Drop);
    }

    pub async fn wait_for_connections(&self, count: u32) {
        let started = Instant::now();
        while self.connection_count().await < count {
            assert!(
                started.elapsed() < Duration::from_secs(10),
                "expected {} connections",
                count
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Waits for a recorded frame matching `predicate` and returns it.
    pub async fn wait_for_message(&self, predicate: impl Fn(u32, &serde_json::Value) -> bool) -> serde_json::Value {
        let started = Instant::now();
        loop {
            for (connection, text) in self.received_messages().await {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
                    if predicate(connection, &value) {
                        return value;
                    }
                }
            }
            assert!(
                started.elapsed() < Duration::from_secs(10),
                "expected message was not received"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    index: u32,
    mut commands: broadcast::Receiver<Command>,
    messages: Arc<Mutex<Vec<(u32, String)>>>,
    ping_every: Option<Duration>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };
    let (mut write, mut read) = ws_stream.split();
    let mut ping = tokio::time::interval(ping_every.unwrap_or(Duration::from_secs(3600)));
    ping.tick().await;

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    messages.lock().await.push((index, text.clone()));
                    let ack = serde_json::json!({"type": "response", "status": "success"});
                    let _ = write.send(Message::Text(ack.to_string())).await;
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            command = commands.recv() => match command {
                Ok(Command::Text(text)) => {
                    let _ = write.send(Message::Text(text)).await;
                }
                Ok(Command::Drop) | Err(_) => break,
            },
            _ = ping.tick(), if ping_every.is_some() => {
                let _ = write.send(Message::Ping(Vec::new())).await;
            }
        }
    }
}

/// A local address nothing listens on yet.
pub fn unused_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// A `price_update` frame for `id`.
pub fn price_update(id: &str, price: i64, conf: u64, publish_time: i64) -> String {
    serde_json::json!({
        "type": "price_update",
        "price_feed": {
            "id": id,
            "price": {
                "price": price.to_string(),
                "conf": conf.to_string(),
                "expo": -8,
                "publish_time": publish_time,
            }
        }
    })
    .to_string()
}

/// Sorted ids of a subscribe/unsubscribe request.
pub fn request_ids(value: &serde_json::Value) -> Vec<String> {
    let mut ids: Vec<String> = value["ids"]
        .as_array()
        .map(|ids| {
            ids.iter()
                .filter_map(|id| id.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    ids.sort();
    ids
}
