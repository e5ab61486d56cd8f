//! Transport-agnostic view of remote participants.
//!
//! Three services carry a session: [`nearby`] (LAN, advertised over mDNS),
//! [`online`] (invite-based, reachable by address) and [`loopback`]
//! (in-process simulated players). Each implements [`ConnectionService`] and
//! reports back through [`TransportEvent`]s, which [`dispatch`] hands to a
//! [`ServiceDelegate`].
//!
//! Every service accepts every completed handshake. Whether a participant
//! may stay is decided one layer up, and a refused participant is told why
//! via [`ConnectionService::disconnect`] before the connection closes.

mod listener;
pub mod loopback;
pub mod nearby;
pub mod online;

use crate::network::messages::DataMessage;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{mpsc, oneshot};

pub use loopback::{LoopbackHub, LoopbackRemote, LoopbackService};
pub use nearby::NearbyService;
pub use online::{Invitation, InvitationSink, OnlineService};

// ── Identity & state ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub device_id: String,
    pub email: String,
    pub name: String,
}

/// Transport handle for one connection. Unique within a started service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    NotConnected,
    Connecting,
    Connected,
    Reconnecting,
    Recovering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionMode {
    Unknown,
    Nearby,
    Online,
    Loopback,
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionMode::Unknown => "unknown",
            ConnectionMode::Nearby => "nearby",
            ConnectionMode::Online => "online",
            ConnectionMode::Loopback => "loopback",
        };
        f.write_str(name)
    }
}

/// A remote participant as the transport currently sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: PeerId,
    pub identity: PeerIdentity,
    pub state: PeerState,
    pub mode: ConnectionMode,
}

/// Extra detail carried by a connection attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub match_game_id: Option<String>,
}

// ── Events ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum TransportEvent {
    ServiceStarted {
        mode: ConnectionMode,
    },
    ServiceFailed {
        mode: ConnectionMode,
        error: String,
    },
    ConnectionReceived {
        peer: Peer,
        info: ConnectionInfo,
    },
    StateChanged {
        peer: Peer,
        reason: Option<String>,
    },
    DataReceived {
        message: DataMessage,
        peer: PeerId,
    },
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Signalled once when a service has finished stopping.
pub type Completion = oneshot::Sender<()>;

/// Receiving side of the transport callbacks.
pub trait ServiceDelegate {
    fn service_started(&mut self, mode: ConnectionMode);
    fn service_failed(&mut self, mode: ConnectionMode, error: &str);
    /// Returns whether the transport should keep the connection. Services
    /// accept regardless; the answer is informational.
    fn connection_received(&mut self, peer: &Peer, info: &ConnectionInfo) -> bool;
    fn state_changed(&mut self, peer: &Peer, reason: Option<&str>);
    /// Returns whether the message was consumed.
    fn data_received(&mut self, message: DataMessage, peer: PeerId) -> bool;
}

/// Hand one transport event to `delegate`.
pub fn dispatch<D: ServiceDelegate + ?Sized>(delegate: &mut D, event: TransportEvent) {
    match event {
        TransportEvent::ServiceStarted { mode } => delegate.service_started(mode),
        TransportEvent::ServiceFailed { mode, error } => delegate.service_failed(mode, &error),
        TransportEvent::ConnectionReceived { peer, info } => {
            if !delegate.connection_received(&peer, &info) {
                log::debug!("{} refused by delegate", peer.id);
            }
        }
        TransportEvent::StateChanged { peer, reason } => {
            delegate.state_changed(&peer, reason.as_deref())
        }
        TransportEvent::DataReceived { message, peer } => {
            let descriptor = message.descriptor();
            if !delegate.data_received(message, peer) {
                log::debug!("Unconsumed {descriptor:?} from {peer}");
            }
        }
    }
}

// ── Services ────────────────────────────────────────────────────────────────

/// What a service needs to open a session.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub identity: PeerIdentity,
    /// Emails to invite; only meaningful for online sessions.
    pub invite_list: Option<Vec<PeerIdentity>>,
    pub recovery_mode: bool,
    pub match_game_id: Option<String>,
}

/// Uniform contract over the three transports.
///
/// `start` returns immediately; success or failure arrives later as
/// [`TransportEvent::ServiceStarted`] / [`TransportEvent::ServiceFailed`].
/// `stop` and `disconnect` are safe to repeat.
pub trait ConnectionService: Send {
    fn mode(&self) -> ConnectionMode;
    fn start(&mut self, request: StartRequest);
    fn stop(&mut self, completion: Completion);
    fn disconnect(&mut self, peer: PeerId, reason: Option<String>);
    /// Queue `message` for `peer`. Returns false if the peer is gone.
    fn send(&self, peer: PeerId, message: DataMessage) -> bool;
    /// The visible player count changed.
    fn players_changed(&mut self, _players: usize) {}
}

/// The service backing the current session, chosen once per connection mode.
pub enum Service {
    Nearby(NearbyService),
    Online(OnlineService),
    Loopback(LoopbackService),
}

impl Service {
    fn inner(&self) -> &dyn ConnectionService {
        match self {
            Service::Nearby(s) => s,
            Service::Online(s) => s,
            Service::Loopback(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn ConnectionService {
        match self {
            Service::Nearby(s) => s,
            Service::Online(s) => s,
            Service::Loopback(s) => s,
        }
    }
}

impl ConnectionService for Service {
    fn mode(&self) -> ConnectionMode {
        self.inner().mode()
    }

    fn start(&mut self, request: StartRequest) {
        self.inner_mut().start(request)
    }

    fn stop(&mut self, completion: Completion) {
        self.inner_mut().stop(completion)
    }

    fn disconnect(&mut self, peer: PeerId, reason: Option<String>) {
        self.inner_mut().disconnect(peer, reason)
    }

    fn send(&self, peer: PeerId, message: DataMessage) -> bool {
        self.inner().send(peer, message)
    }

    fn players_changed(&mut self, players: usize) {
        self.inner_mut().players_changed(players)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
