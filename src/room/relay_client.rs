//! Websocket client for the relay wire format.

use super::signaling::Signaling;
use crate::error::RoomError;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use meshsync_proto::RelayMessage;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// A persistent websocket connection to a relay.
#[derive(Debug)]
pub struct RelayClient {
    url: String,
    outgoing: mpsc::UnboundedSender<Message>,
    topics: Arc<DashMap<String, mpsc::UnboundedSender<Value>>>,
    closed: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RelayClient {
    /// Connect and start the reader, writer and keepalive tasks.
    pub async fn connect(url: &str, ping_interval: Duration) -> Result<Self, RoomError> {
        let (ws, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut sink, mut stream) = ws.split();
        let (outgoing, mut rx) = mpsc::unbounded_channel::<Message>();
        let topics: Arc<DashMap<String, mpsc::UnboundedSender<Value>>> = Arc::new(DashMap::new());
        let closed = CancellationToken::new();

        {
            let closed = closed.clone();
            let url = url.to_string();
            tokio::spawn(async move {
                let mut keepalive = tokio::time::interval(ping_interval);
                keepalive.tick().await;
                loop {
                    // Queued messages drain before a close takes effect.
                    let msg = tokio::select! {
                        biased;
                        msg = rx.recv() => match msg {
                            Some(msg) => msg,
                            None => break,
                        },
                        _ = closed.cancelled() => break,
                        _ = keepalive.tick() => Message::Text(RelayMessage::Ping.to_json()),
                    };
                    if let Err(e) = sink.send(msg).await {
                        warn!(url = %url, error = %e, "Relay send failed");
                        break;
                    }
                }
                let _ = tokio::time::timeout(CLOSE_GRACE, sink.close()).await;
                closed.cancel();
            });
        }

        let reader = {
            let closed = closed.clone();
            let topics = Arc::clone(&topics);
            let outgoing = outgoing.clone();
            let url = url.to_string();
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        _ = closed.cancelled() => break,
                        frame = stream.next() => frame,
                    };
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(url = %url, "Relay closed the connection");
                            break;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!(url = %url, error = %e, "Relay read failed");
                            break;
                        }
                    };
                    match RelayMessage::from_json(&text) {
                        Ok(RelayMessage::Publish { topic, data, .. }) => {
                            if let Some(tx) = topics.get(&topic) {
                                let _ = tx.send(data);
                            }
                        }
                        Ok(RelayMessage::Ping) => {
                            let _ = outgoing.send(Message::Text(RelayMessage::Pong.to_json()));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            crate::metrics::record_decode_fault("relay");
                            debug!(url = %url, error = %e, "Dropping malformed relay message");
                        }
                    }
                }
                topics.clear();
                closed.cancel();
            })
        };

        Ok(Self {
            url: url.to_string(),
            outgoing,
            topics,
            closed,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn send(&self, msg: RelayMessage) -> Result<(), RoomError> {
        if self.closed.is_cancelled() {
            return Err(RoomError::Closed);
        }
        self.outgoing
            .send(Message::Text(msg.to_json()))
            .map_err(|_| RoomError::Closed)
    }
}

impl Signaling for RelayClient {
    fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<Value>, RoomError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics.insert(topic.to_string(), tx);
        self.send(RelayMessage::Subscribe {
            topics: vec![topic.to_string()],
        })?;
        Ok(rx)
    }

    fn unsubscribe(&self, topic: &str) {
        self.topics.remove(topic);
        let _ = self.send(RelayMessage::Unsubscribe {
            topics: vec![topic.to_string()],
        });
    }

    fn publish(&self, topic: &str, data: Value) -> Result<(), RoomError> {
        self.send(RelayMessage::publish(topic, data))
    }

    fn close(&self) {
        self.closed.cancel();
        self.topics.clear();
        // The writer flushes what is queued and exits on its own; the reader
        // is dropped now so no further input is delivered.
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.close();
    }
}
