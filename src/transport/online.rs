use crate::error::TransportError;
use crate::network::messages::DataMessage;
use crate::network::tcp::TcpSettings;
use crate::transport::listener::Listener;
use crate::transport::{
    Completion, ConnectionMode, ConnectionService, EventSender, PeerId, PeerIdentity,
    StartRequest,
};
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// An invitation to join an online session, handed to whatever delivers
/// invitations (a matchmaking service, a push relay, a test).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    pub match_game_id: String,
    pub host: PeerIdentity,
    pub invitee: PeerIdentity,
    pub address: SocketAddr,
}

pub type InvitationSink = mpsc::UnboundedSender<Invitation>;

/// Invite-based sessions: a TCP listener that is not advertised. Invitees
/// learn the address from their [`Invitation`] and must present its match id.
pub struct OnlineService {
    listener: Listener,
    invitations: Option<InvitationSink>,
}

impl OnlineService {
    pub fn new(
        bind: SocketAddr,
        settings: TcpSettings,
        events: EventSender,
        invitations: Option<InvitationSink>,
    ) -> Self {
        Self {
            listener: Listener::new(ConnectionMode::Online, bind, settings, events),
            invitations,
        }
    }
}

impl ConnectionService for OnlineService {
    fn mode(&self) -> ConnectionMode {
        self.listener.mode()
    }

    fn start(&mut self, request: StartRequest) {
        let sink = self.invitations.clone();
        let invitees = request.invite_list.unwrap_or_default();
        let match_game_id = request.match_game_id.unwrap_or_default();
        let host = request.identity;
        let recovering = request.recovery_mode;

        self.listener.start(Box::new(move |address| {
            let sink = sink.ok_or(TransportError::NoInvitationSink)?;
            for invitee in invitees {
                log::info!(
                    "Inviting {} to {match_game_id}{}",
                    invitee.email,
                    if recovering { " (recovery)" } else { "" }
                );
                sink.send(Invitation {
                    match_game_id: match_game_id.clone(),
                    host: host.clone(),
                    invitee,
                    address,
                })
                .map_err(|_| TransportError::InvitationSinkClosed)?;
            }
            Ok(None)
        }));
    }

    fn stop(&mut self, completion: Completion) {
        self.listener.stop(completion);
    }

    fn disconnect(&mut self, peer: PeerId, reason: Option<String>) {
        self.listener.disconnect(peer, reason);
    }

    fn send(&self, peer: PeerId, message: DataMessage) -> bool {
        self.listener.send(peer, message)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
