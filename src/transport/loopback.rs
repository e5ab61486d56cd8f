//! In-process transport. Simulated participants live in the same process as
//! the host and talk to it through a shared hub; no runtime is needed.

use crate::error::TransportError;
use crate::network::messages::{DataMessage, Message};
use crate::network::tcp::next_peer_id;
use crate::transport::{
    Completion, ConnectionInfo, ConnectionMode, ConnectionService, EventSender, Peer, PeerId,
    PeerIdentity, PeerState, StartRequest, TransportEvent,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

type Inbox = Arc<Mutex<VecDeque<Message>>>;

struct Link {
    peer: Peer,
    inbox: Inbox,
}

#[derive(Default)]
struct HubState {
    events: Option<EventSender>,
    running: bool,
    links: HashMap<PeerId, Link>,
}

impl HubState {
    fn emit(&self, event: TransportEvent) {
        if let Some(events) = self.events.as_ref() {
            let _ = events.send(event);
        }
    }
}

/// Meeting point between a [`LoopbackService`] and its [`LoopbackRemote`]s.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a simulated participant. Fails unless the service is running.
    pub fn connect(
        &self,
        identity: PeerIdentity,
        match_game_id: Option<String>,
    ) -> Result<LoopbackRemote, TransportError> {
        let mut state = self.state.lock();
        if !state.running {
            return Err(TransportError::NotRunning(ConnectionMode::Loopback));
        }

        let peer = Peer {
            id: next_peer_id(),
            identity,
            state: PeerState::Connected,
            mode: ConnectionMode::Loopback,
        };
        let inbox: Inbox = Arc::default();
        state.links.insert(
            peer.id,
            Link {
                peer: peer.clone(),
                inbox: inbox.clone(),
            },
        );
        log::info!("Loopback: {} joined as {}", peer.identity.name, peer.id);
        state.emit(TransportEvent::ConnectionReceived {
            peer: peer.clone(),
            info: ConnectionInfo { match_game_id },
        });

        Ok(LoopbackRemote {
            hub: self.clone(),
            id: peer.id,
            inbox,
        })
    }

    pub fn connected_count(&self) -> usize {
        self.state.lock().links.len()
    }
}

// ── LoopbackService ─────────────────────────────────────────────────────────

pub struct LoopbackService {
    hub: LoopbackHub,
    events: EventSender,
}

impl LoopbackService {
    pub fn new(hub: LoopbackHub, events: EventSender) -> Self {
        Self { hub, events }
    }
}

impl ConnectionService for LoopbackService {
    fn mode(&self) -> ConnectionMode {
        ConnectionMode::Loopback
    }

    fn start(&mut self, _request: StartRequest) {
        let mut state = self.hub.state.lock();
        if state.running {
            log::debug!("loopback service already started");
            return;
        }
        state.events = Some(self.events.clone());
        state.running = true;
        state.emit(TransportEvent::ServiceStarted {
            mode: ConnectionMode::Loopback,
        });
        log::info!("Loopback service started");
    }

    fn stop(&mut self, completion: Completion) {
        let mut state = self.hub.state.lock();
        if state.running {
            state.running = false;
            for (_, link) in state.links.drain() {
                link.inbox.lock().push_back(Message::Goodbye {
                    reason: Some("The host ended the session".into()),
                });
            }
            state.events = None;
            log::info!("Loopback service stopped");
        }
        let _ = completion.send(());
    }

    fn disconnect(&mut self, peer: PeerId, reason: Option<String>) {
        let mut state = self.hub.state.lock();
        let Some(mut link) = state.links.remove(&peer) else {
            return;
        };
        link.inbox.lock().push_back(Message::Goodbye {
            reason: reason.clone(),
        });
        link.peer.state = PeerState::NotConnected;
        log::info!("{peer} disconnected by host");
        state.emit(TransportEvent::StateChanged {
            peer: link.peer,
            reason: Some(reason.unwrap_or_else(|| "disconnected by host".into())),
        });
    }

    fn send(&self, peer: PeerId, message: DataMessage) -> bool {
        match self.hub.state.lock().links.get(&peer) {
            Some(link) => {
                link.inbox.lock().push_back(Message::Data(message));
                true
            }
            None => false,
        }
    }
}

// ── LoopbackRemote ──────────────────────────────────────────────────────────

/// A simulated participant's end of the link.
pub struct LoopbackRemote {
    hub: LoopbackHub,
    id: PeerId,
    inbox: Inbox,
}

impl LoopbackRemote {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.hub.state.lock().links.contains_key(&self.id)
    }

    /// Deliver data to the host. Returns false once the link is gone.
    pub fn send(&self, message: DataMessage) -> bool {
        let state = self.hub.state.lock();
        if !state.links.contains_key(&self.id) {
            return false;
        }
        state.emit(TransportEvent::DataReceived {
            message,
            peer: self.id,
        });
        true
    }

    /// Report a connection state change, as a flaky network would.
    pub fn set_state(&self, new_state: PeerState) {
        let mut state = self.hub.state.lock();
        let peer = match new_state {
            PeerState::NotConnected => match state.links.remove(&self.id) {
                Some(mut link) => {
                    link.peer.state = new_state;
                    link.peer
                }
                None => return,
            },
            _ => match state.links.get_mut(&self.id) {
                Some(link) => {
                    link.peer.state = new_state;
                    link.peer.clone()
                }
                None => return,
            },
        };
        state.emit(TransportEvent::StateChanged { peer, reason: None });
    }

    /// Vanish without a goodbye.
    pub fn drop_connection(&self) {
        let mut state = self.hub.state.lock();
        let Some(mut link) = state.links.remove(&self.id) else {
            return;
        };
        link.peer.state = PeerState::NotConnected;
        state.emit(TransportEvent::StateChanged {
            peer: link.peer,
            reason: Some("connection closed".into()),
        });
    }

    pub fn try_recv(&self) -> Option<Message> {
        self.inbox.lock().pop_front()
    }

    pub fn drain(&self) -> Vec<Message> {
        self.inbox.lock().drain(..).collect()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::{mpsc, oneshot};

    fn identity(email: &str) -> PeerIdentity {
        PeerIdentity {
            device_id: "sim".into(),
            email: email.into(),
            name: "Sim".into(),
        }
    }

    fn start_request() -> StartRequest {
        StartRequest {
            identity: identity("host@example.com"),
            invite_list: None,
            recovery_mode: false,
            match_game_id: None,
        }
    }

    #[test]
    fn test_connect_requires_running_service() {
        let hub = LoopbackHub::new();
        assert!(matches!(
            hub.connect(identity("p1@example.com"), None),
            Err(TransportError::NotRunning(ConnectionMode::Loopback))
        ));
    }

    #[test]
    fn test_events_flow_without_runtime() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hub = LoopbackHub::new();
        let mut service = LoopbackService::new(hub.clone(), tx);
        service.start(start_request());
        assert!(matches!(rx.try_recv(), Ok(TransportEvent::ServiceStarted { .. })));

        let remote = hub.connect(identity("p1@example.com"), None).unwrap();
        assert!(matches!(
            rx.try_recv(),
            Ok(TransportEvent::ConnectionReceived { ref peer, .. }) if peer.id == remote.id()
        ));

        assert!(remote.send(DataMessage::RefreshRequest));
        assert!(matches!(rx.try_recv(), Ok(TransportEvent::DataReceived { .. })));

        assert!(service.send(remote.id(), DataMessage::Status { message: "hi".into() }));
        assert!(matches!(remote.try_recv(), Some(Message::Data(DataMessage::Status { .. }))));
    }

    #[test]
    fn test_disconnect_delivers_reason_then_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hub = LoopbackHub::new();
        let mut service = LoopbackService::new(hub.clone(), tx);
        service.start(start_request());
        let remote = hub.connect(identity("p1@example.com"), None).unwrap();
        while rx.try_recv().is_ok() {}

        service.disconnect(remote.id(), Some("p1 has already joined".into()));
        service.disconnect(remote.id(), Some("p1 has already joined".into()));

        assert_eq!(
            remote.drain(),
            vec![Message::Goodbye {
                reason: Some("p1 has already joined".into())
            }]
        );
        match rx.try_recv() {
            Ok(TransportEvent::StateChanged { peer, reason }) => {
                assert_eq!(peer.state, PeerState::NotConnected);
                assert_eq!(reason.as_deref(), Some("p1 has already joined"));
            }
            other => panic!("expected StateChanged, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
        assert!(!remote.send(DataMessage::RefreshRequest));
    }

    #[test]
    fn test_stop_fires_completion_every_time() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let hub = LoopbackHub::new();
        let mut service = LoopbackService::new(hub.clone(), tx);
        service.start(start_request());
        let remote = hub.connect(identity("p1@example.com"), None).unwrap();

        for _ in 0..2 {
            let (done_tx, mut done_rx) = oneshot::channel();
            service.stop(done_tx);
            assert!(done_rx.try_recv().is_ok());
        }
        assert!(!remote.is_connected());
        assert!(matches!(remote.try_recv(), Some(Message::Goodbye { .. })));
    }

    #[test]
    fn test_state_changes_reach_the_host() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hub = LoopbackHub::new();
        let mut service = LoopbackService::new(hub.clone(), tx);
        service.start(start_request());
        let remote = hub.connect(identity("p1@example.com"), None).unwrap();
        while rx.try_recv().is_ok() {}

        remote.set_state(PeerState::Reconnecting);
        remote.drop_connection();

        let states: Vec<PeerState> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|event| match event {
                TransportEvent::StateChanged { peer, .. } => Some(peer.state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![PeerState::Reconnecting, PeerState::NotConnected]);
        assert_eq!(hub.connected_count(), 0);
    }
}
