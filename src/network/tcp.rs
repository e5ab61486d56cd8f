use crate::network::messages::{read_message, write_message, DataMessage, FrameError, Message};
use crate::transport::{
    ConnectionInfo, ConnectionMode, EventSender, Peer, PeerId, PeerIdentity, PeerState,
    TransportEvent,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, timeout, Duration, Instant};

// ── Constants ───────────────────────────────────────────────────────────────

/// A connection that has not said `Hello` within this window is dropped.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Peer ids are unique for the life of the process, so events still queued
/// from a stopped service can never be mistaken for a newer connection.
static NEXT_PEER_ID: AtomicU32 = AtomicU32::new(1);

pub fn next_peer_id() -> PeerId {
    PeerId(NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy)]
pub struct TcpSettings {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            heartbeat_timeout: Duration::from_secs(6),
        }
    }
}

// ── Outbound queue ──────────────────────────────────────────────────────────

/// Work for a connection's writer task. Frames go out in queue order, so a
/// `Goodbye` queued before `Close` always reaches the remote first.
#[derive(Debug)]
enum Outbound {
    Frame(Message),
    Close,
}

fn spawn_writer(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    label: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = queue.recv().await {
            match item {
                Outbound::Frame(msg) => {
                    if let Err(e) = write_message(&mut writer, &msg).await {
                        log::info!("{label}: write failed: {e}");
                        break;
                    }
                }
                Outbound::Close => break,
            }
        }
        let _ = writer.shutdown().await;
    })
}

// ── TcpHost ─────────────────────────────────────────────────────────────────

/// A live connection as the host tracks it.
struct Link {
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Tells the reader the host dropped this peer; carries the reason.
    stop: Option<oneshot::Sender<String>>,
}

struct Shared {
    links: Mutex<HashMap<PeerId, Link>>,
    mode: ConnectionMode,
    events: EventSender,
    settings: TcpSettings,
}

/// Host-side TCP server: accepts connections, performs the `Hello`
/// handshake, and forwards everything else as transport events.
pub struct TcpHost {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    accept_handle: Option<JoinHandle<()>>,
    heartbeat_handle: Option<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl TcpHost {
    /// Bind and start accepting connections.
    pub async fn bind(
        addr: SocketAddr,
        mode: ConnectionMode,
        events: EventSender,
        settings: TcpSettings,
    ) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("TCP host ({mode}) listening on {local_addr}");

        let shared = Arc::new(Shared {
            links: Mutex::new(HashMap::new()),
            mode,
            events,
            settings,
        });
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let accept_handle = {
            let shared = shared.clone();
            let shutdown_tx = shutdown_tx.clone();
            tokio::spawn(async move {
                loop {
                    let (stream, remote) = match listener.accept().await {
                        Ok(v) => v,
                        Err(e) => {
                            log::error!("TCP accept error: {e}");
                            continue;
                        }
                    };
                    Self::handle_connection(&shared, stream, remote, shutdown_tx.subscribe());
                }
            })
        };

        let heartbeat_handle = {
            let shared = shared.clone();
            let mut sd_rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut interval = time::interval(shared.settings.heartbeat_interval);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            for link in shared.links.lock().values() {
                                let _ = link.outbound.send(Outbound::Frame(Message::Heartbeat));
                            }
                        }
                        _ = sd_rx.recv() => break,
                    }
                }
            })
        };

        Ok(Self {
            shared,
            local_addr,
            accept_handle: Some(accept_handle),
            heartbeat_handle: Some(heartbeat_handle),
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn handle_connection(
        shared: &Arc<Shared>,
        stream: TcpStream,
        remote: SocketAddr,
        sd_rx: broadcast::Receiver<()>,
    ) {
        let peer_id = next_peer_id();
        log::info!("{peer_id} connected from {remote}, waiting for Hello");

        let (reader, writer) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        spawn_writer(writer, out_rx, peer_id.to_string());

        shared.links.lock().insert(
            peer_id,
            Link {
                outbound: out_tx,
                stop: Some(stop_tx),
            },
        );

        let shared = shared.clone();
        tokio::spawn(async move {
            Self::read_loop(shared, peer_id, reader, stop_rx, sd_rx).await;
        });
    }

    async fn read_loop(
        shared: Arc<Shared>,
        peer_id: PeerId,
        mut reader: OwnedReadHalf,
        mut stop_rx: oneshot::Receiver<String>,
        mut sd_rx: broadcast::Receiver<()>,
    ) {
        let (identity, match_game_id) = match timeout(HANDSHAKE_TIMEOUT, read_message(&mut reader)).await {
            Ok(Ok(Message::Hello { identity, match_game_id })) => (identity, match_game_id),
            Ok(Ok(other)) => {
                log::info!("{peer_id}: expected Hello, got {other:?}");
                Self::drop_link(&shared, peer_id);
                return;
            }
            Ok(Err(e)) => {
                log::info!("{peer_id}: handshake read failed: {e}");
                Self::drop_link(&shared, peer_id);
                return;
            }
            Err(_) => {
                log::info!("{peer_id}: handshake timed out");
                Self::drop_link(&shared, peer_id);
                return;
            }
        };

        let mut peer = Peer {
            id: peer_id,
            identity,
            state: PeerState::Connected,
            mode: shared.mode,
        };
        log::info!("{peer_id}: Hello from {} <{}>", peer.identity.name, peer.identity.email);
        let _ = shared.events.send(TransportEvent::ConnectionReceived {
            peer: peer.clone(),
            info: ConnectionInfo { match_game_id },
        });

        let mut last_received = Instant::now();
        let reason = loop {
            tokio::select! {
                result = read_message(&mut reader) => match result {
                    Ok(Message::Data(message)) => {
                        last_received = Instant::now();
                        let _ = shared.events.send(TransportEvent::DataReceived { message, peer: peer_id });
                    }
                    Ok(Message::Heartbeat) => last_received = Instant::now(),
                    Ok(Message::Goodbye { reason }) => {
                        break reason.unwrap_or_else(|| "left the session".into());
                    }
                    Ok(Message::Hello { .. }) => {
                        log::debug!("{peer_id}: ignoring repeated Hello");
                    }
                    Err(FrameError::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        break "connection closed".into();
                    }
                    Err(e) => break format!("read error: {e}"),
                },
                _ = time::sleep_until(last_received + shared.settings.heartbeat_timeout) => {
                    break "heartbeat timeout".into();
                }
                reason = &mut stop_rx => {
                    break reason.unwrap_or_else(|_| "disconnected by host".into());
                }
                _ = sd_rx.recv() => {
                    log::debug!("{peer_id}: service shutting down");
                    return;
                }
            }
        };

        log::info!("{peer_id}: disconnected ({reason})");
        Self::drop_link(&shared, peer_id);
        peer.state = PeerState::NotConnected;
        let _ = shared.events.send(TransportEvent::StateChanged {
            peer,
            reason: Some(reason),
        });
    }

    fn drop_link(shared: &Shared, peer_id: PeerId) {
        if let Some(link) = shared.links.lock().remove(&peer_id) {
            let _ = link.outbound.send(Outbound::Close);
        }
    }

    /// Queue a data message for one peer. Returns false if the peer is gone.
    pub fn send(&self, peer_id: PeerId, message: DataMessage) -> bool {
        match self.shared.links.lock().get(&peer_id) {
            Some(link) => link.outbound.send(Outbound::Frame(Message::Data(message))).is_ok(),
            None => false,
        }
    }

    /// Send `Goodbye` with `reason`, then close. Unknown peers are ignored.
    pub fn disconnect(&self, peer_id: PeerId, reason: Option<String>) {
        let Some(mut link) = self.shared.links.lock().remove(&peer_id) else {
            return;
        };
        let _ = link.outbound.send(Outbound::Frame(Message::Goodbye {
            reason: reason.clone(),
        }));
        let _ = link.outbound.send(Outbound::Close);
        if let Some(stop) = link.stop.take() {
            let _ = stop.send(reason.unwrap_or_else(|| "disconnected by host".into()));
        }
        log::info!("{peer_id} disconnected by host");
    }

    pub fn connected_peer_ids(&self) -> Vec<PeerId> {
        self.shared.links.lock().keys().copied().collect()
    }

    /// Stop accepting, end every reader, close every connection.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.accept_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.heartbeat_handle.take() {
            handle.abort();
        }
        let _ = self.shutdown_tx.send(());
        for (peer_id, link) in self.shared.links.lock().drain() {
            let _ = link.outbound.send(Outbound::Frame(Message::Goodbye {
                reason: Some("The host ended the session".into()),
            }));
            let _ = link.outbound.send(Outbound::Close);
            log::info!("{peer_id} disconnected (host shutdown)");
        }
    }
}

impl Drop for TcpHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── TcpRemote ───────────────────────────────────────────────────────────────

/// The remote side of a session connection: says `Hello`, keeps the link
/// alive with heartbeats, and surfaces everything the host sends.
pub struct TcpRemote {
    outbound: mpsc::UnboundedSender<Outbound>,
    inbox: mpsc::UnboundedReceiver<Message>,
    reader_handle: JoinHandle<()>,
    heartbeat_handle: JoinHandle<()>,
}

impl TcpRemote {
    pub async fn connect(
        addr: SocketAddr,
        identity: PeerIdentity,
        match_game_id: Option<String>,
        heartbeat_interval: Duration,
    ) -> Result<Self, std::io::Error> {
        let stream = TcpStream::connect(addr).await?;
        log::info!("Connected to host at {addr} as {}", identity.email);

        let (mut reader, writer) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        spawn_writer(writer, out_rx, format!("remote {}", identity.email));
        let _ = out_tx.send(Outbound::Frame(Message::Hello {
            identity,
            match_game_id,
        }));

        let (in_tx, inbox) = mpsc::unbounded_channel();
        let reader_handle = tokio::spawn(async move {
            loop {
                match read_message(&mut reader).await {
                    Ok(Message::Heartbeat) => {}
                    Ok(msg) => {
                        if in_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::debug!("Remote reader finished: {e}");
                        break;
                    }
                }
            }
        });

        let heartbeat_handle = {
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let mut interval = time::interval(heartbeat_interval);
                loop {
                    interval.tick().await;
                    if out_tx.send(Outbound::Frame(Message::Heartbeat)).is_err() {
                        break;
                    }
                }
            })
        };

        Ok(Self {
            outbound: out_tx,
            inbox,
            reader_handle,
            heartbeat_handle,
        })
    }

    pub fn send(&self, message: DataMessage) -> bool {
        self.outbound
            .send(Outbound::Frame(Message::Data(message)))
            .is_ok()
    }

    /// Next non-heartbeat frame from the host, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbox.recv().await
    }

    /// Leave politely: `Goodbye`, then close.
    pub fn close(&mut self) {
        self.heartbeat_handle.abort();
        let _ = self.outbound.send(Outbound::Frame(Message::Goodbye { reason: None }));
        let _ = self.outbound.send(Outbound::Close);
    }
}

impl Drop for TcpRemote {
    fn drop(&mut self) {
        self.heartbeat_handle.abort();
        self.reader_handle.abort();
        let _ = self.outbound.send(Outbound::Close);
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
