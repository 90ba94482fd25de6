//! Local relay server.
//!
//! The LAN host runs this relay; every device on the segment (the host
//! included) connects to it as a websocket client. The relay keeps a topic
//! table and forwards each `publish` to every *other* subscriber of the topic,
//! stamping the subscriber count into `clients`.

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use meshsync_proto::RelayMessage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

type ConnId = u64;

#[derive(Debug, Default)]
struct RelayState {
    next_id: AtomicU64,
    /// topic -> subscriber connections
    topics: DashMap<String, HashMap<ConnId, mpsc::UnboundedSender<Message>>>,
    /// connection -> (outbound queue, task)
    conns: DashMap<ConnId, (mpsc::UnboundedSender<Message>, Option<JoinHandle<()>>)>,
}

impl RelayState {
    fn dispatch(&self, conn: ConnId, text: &str) {
        let msg = match RelayMessage::from_json(text) {
            Ok(msg) => msg,
            Err(e) => {
                crate::metrics::record_decode_fault("relay");
                debug!(conn, error = %e, "Dropping malformed relay message");
                return;
            }
        };
        let Some(tx) = self.conns.get(&conn).map(|c| c.0.clone()) else {
            return;
        };

        match msg {
            RelayMessage::Subscribe { topics } => {
                for topic in topics {
                    self.topics.entry(topic).or_default().insert(conn, tx.clone());
                }
            }
            RelayMessage::Unsubscribe { topics } => {
                for topic in topics {
                    self.leave_topic(conn, &topic);
                }
            }
            RelayMessage::Publish { topic, data, .. } => {
                let targets: Vec<mpsc::UnboundedSender<Message>> = match self.topics.get(&topic) {
                    Some(subs) => subs
                        .iter()
                        .filter(|(id, _)| **id != conn)
                        .map(|(_, tx)| tx.clone())
                        .collect(),
                    None => return,
                };
                let clients = self.topics.get(&topic).map_or(0, |subs| subs.len());
                let out = RelayMessage::Publish {
                    topic,
                    data,
                    clients: Some(clients),
                }
                .to_json();
                for target in targets {
                    let _ = target.send(Message::Text(out.clone()));
                }
            }
            RelayMessage::Ping => {
                let _ = tx.send(Message::Text(RelayMessage::Pong.to_json()));
            }
            RelayMessage::Pong => {}
        }
    }

    fn leave_topic(&self, conn: ConnId, topic: &str) {
        if let Some(mut subs) = self.topics.get_mut(topic) {
            subs.remove(&conn);
        }
        self.topics.remove_if(topic, |_, subs| subs.is_empty());
    }

    fn remove_conn(&self, conn: ConnId) {
        for mut subs in self.topics.iter_mut() {
            subs.remove(&conn);
        }
        self.topics.retain(|_, subs| !subs.is_empty());
        if self.conns.remove(&conn).is_some() {
            crate::metrics::relay_client_disconnected();
        }
    }
}

/// A running relay.
#[derive(Debug)]
pub struct RelayServer {
    local_addr: SocketAddr,
    state: Arc<RelayState>,
    shutdown: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayServer {
    /// Bind the listener and start accepting clients.
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Relay listener bound");

        let state = Arc::new(RelayState::default());
        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&state),
            shutdown.clone(),
        ));

        Ok(Self {
            local_addr,
            state,
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connected websocket clients.
    pub fn clients(&self) -> usize {
        self.state.conns.len()
    }

    /// Subscribers of a topic.
    pub fn subscribers(&self, topic: &str) -> usize {
        self.state.topics.get(topic).map_or(0, |subs| subs.len())
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Stop accepting and drop every client connection now.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!(local_addr = %self.local_addr, "Relay shutting down");
        self.shutdown.cancel();
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        let ids: Vec<ConnId> = self.state.conns.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, (_, task))) = self.state.conns.remove(&id) {
                if let Some(task) = task {
                    task.abort();
                }
                crate::metrics::relay_client_disconnected();
            }
        }
        self.state.topics.clear();
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<RelayState>, shutdown: CancellationToken) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Failed to accept relay connection");
                    continue;
                }
            },
        };

        let id = state.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        state.conns.insert(id, (tx, None));
        crate::metrics::relay_client_connected();

        let span = crate::telemetry::spans::relay_client(&addr.to_string());
        let task = tokio::spawn(
            serve_client(stream, id, Arc::clone(&state), rx, shutdown.clone()).instrument(span),
        );
        match state.conns.get_mut(&id) {
            Some(mut conn) => conn.1 = Some(task),
            // Already gone (handshake failed before we got here).
            None => drop(task),
        }
    }
}

async fn serve_client(
    stream: TcpStream,
    id: ConnId,
    state: Arc<RelayState>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    shutdown: CancellationToken,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "Websocket handshake failed");
            state.remove_conn(id);
            return;
        }
    };
    debug!("Relay client connected");
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            out = rx.recv() => match out {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        debug!(error = %e, "Relay client send failed");
                        break;
                    }
                }
                None => break,
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => state.dispatch(id, &text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "Relay client read failed");
                    break;
                }
            },
        }
    }

    state.remove_conn(id);
    debug!("Relay client disconnected");
}
