//! Per-feed WebSocket fan-out of encoded MPEG-TS chunks.
//!
//! One task owns the client registry and serialises accept, broadcast and
//! disconnect, so the set needs no locking. Producers hand chunks in through
//! an unbounded command channel and return immediately; each client has a
//! capacity-1 queue and is dropped, never awaited, when it cannot keep up.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

const PING_INTERVAL: Duration = Duration::from_secs(20);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

enum Command {
    Register {
        id: u64,
        addr: SocketAddr,
        tx: mpsc::Sender<Bytes>,
    },
    Unregister {
        id: u64,
    },
    Broadcast(Bytes),
}

/// The broadcaster's view of one connected client
struct ClientHandle {
    addr: SocketAddr,
    tx: mpsc::Sender<Bytes>,
}

/// Client set owned by the broadcaster task. Fan-out never blocks: a client
/// whose queue is full or closed is removed on the spot.
pub(crate) struct ClientRegistry {
    stream_id: u32,
    clients: HashMap<u64, ClientHandle>,
    client_count: Arc<AtomicUsize>,
}

impl ClientRegistry {
    fn new(stream_id: u32, client_count: Arc<AtomicUsize>) -> Self {
        ClientRegistry {
            stream_id,
            clients: HashMap::new(),
            client_count,
        }
    }

    fn register(&mut self, id: u64, addr: SocketAddr, tx: mpsc::Sender<Bytes>) {
        self.clients.insert(id, ClientHandle { addr, tx });
        self.client_count.store(self.clients.len(), Ordering::Relaxed);
        info!(
            stream_id = self.stream_id,
            %addr,
            total = self.clients.len(),
            "WebSocket client connected"
        );
    }

    fn unregister(&mut self, id: u64) {
        if let Some(client) = self.clients.remove(&id) {
            self.client_count.store(self.clients.len(), Ordering::Relaxed);
            info!(
                stream_id = self.stream_id,
                addr = %client.addr,
                remaining = self.clients.len(),
                "WebSocket client disconnected"
            );
        }
    }

    /// Hand `data` to every live client. Returns the number of clients that
    /// accepted the chunk; the rest are removed. Dropping a client's sender
    /// ends its writer task, which closes the socket.
    pub(crate) fn broadcast(&mut self, data: &Bytes) -> usize {
        let mut slow = Vec::new();
        let mut delivered = 0;

        for (&id, client) in &self.clients {
            match client.tx.try_send(data.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => slow.push(id),
            }
        }

        for id in slow {
            if let Some(client) = self.clients.remove(&id) {
                debug!(
                    stream_id = self.stream_id,
                    addr = %client.addr,
                    "Dropping slow or dead WebSocket client"
                );
            }
        }
        self.client_count.store(self.clients.len(), Ordering::Relaxed);
        delivered
    }

    pub(crate) fn len(&self) -> usize {
        self.clients.len()
    }
}

/// Handle used by the encoder's stdout reader to fan chunks out
#[derive(Clone)]
pub struct WsBroadcaster {
    cmd_tx: mpsc::UnboundedSender<Command>,
    client_count: Arc<AtomicUsize>,
    local_addr: SocketAddr,
}

impl WsBroadcaster {
    /// Bind `0.0.0.0:port` and start the broadcaster's own loop. Returns once
    /// the listener is bound, so a failure to grab the port is a startup
    /// error, not a background log line.
    pub async fn start(
        stream_id: u32,
        port: u16,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        info!(stream_id, port = local_addr.port(), "WebSocket broadcaster listening");

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let client_count = Arc::new(AtomicUsize::new(0));

        // Registry loop: the single owner of the client set
        let registry_shutdown = shutdown.clone();
        let registry_count = Arc::clone(&client_count);
        tokio::spawn(async move {
            let mut registry = ClientRegistry::new(stream_id, registry_count);
            let mut shutdown = registry_shutdown;
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(Command::Register { id, addr, tx }) => registry.register(id, addr, tx),
                        Some(Command::Unregister { id }) => registry.unregister(id),
                        Some(Command::Broadcast(data)) => {
                            registry.broadcast(&data);
                        }
                        None => break,
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(stream_id, "WebSocket registry loop stopped");
        });

        // Accept loop
        let accept_cmd_tx = cmd_tx.clone();
        tokio::spawn(async move {
            let mut next_client_id: u64 = 0;
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, addr) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(stream_id, error = %e, "WebSocket accept failed");
                                continue;
                            }
                        };
                        let id = next_client_id;
                        next_client_id += 1;
                        let cmd_tx = accept_cmd_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_client(stream_id, id, addr, stream, cmd_tx).await {
                                debug!(stream_id, %addr, error = %e, "WebSocket client ended");
                            }
                        });
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(stream_id, "WebSocket accept loop stopped");
        });

        Ok(WsBroadcaster {
            cmd_tx,
            client_count,
            local_addr,
        })
    }

    /// Queue a chunk for fan-out and return immediately
    pub fn broadcast(&self, data: Bytes) {
        let _ = self.cmd_tx.send(Command::Broadcast(data));
    }

    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::Relaxed)
    }

    /// The address the listener actually bound, for port-0 callers
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// One connected client: forwards queued chunks as binary messages, pings
/// every 20 s, and gives up if no pong arrives within 10 s.
async fn serve_client(
    stream_id: u32,
    id: u64,
    addr: SocketAddr,
    stream: tokio::net::TcpStream,
    cmd_tx: mpsc::UnboundedSender<Command>,
) -> anyhow::Result<()> {
    let ws = accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (chunk_tx, mut chunk_rx) = mpsc::channel::<Bytes>(1);
    cmd_tx.send(Command::Register { id, addr, tx: chunk_tx })?;

    let mut ping_interval =
        tokio::time::interval_at(tokio::time::Instant::now() + PING_INTERVAL, PING_INTERVAL);
    let mut pong_deadline: Option<tokio::time::Instant> = None;

    loop {
        let pong_timer = async {
            match pong_deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            chunk = chunk_rx.recv() => match chunk {
                Some(data) => {
                    if ws_tx.send(Message::Binary(data.to_vec())).await.is_err() {
                        break;
                    }
                }
                // Registry dropped us (slow client or shutdown)
                None => break,
            },
            _ = ping_interval.tick() => {
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                if pong_deadline.is_none() {
                    pong_deadline = Some(tokio::time::Instant::now() + PONG_TIMEOUT);
                }
            }
            _ = pong_timer => {
                debug!(stream_id, %addr, "WebSocket client missed pong deadline");
                break;
            }
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Pong(_))) => pong_deadline = None,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            }
        }
    }

    let _ = cmd_tx.send(Command::Unregister { id });
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws_tx.send(Message::Close(None))).await;
    Ok(())
}
