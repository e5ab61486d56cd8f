use crate::network::mdns::{Advertisement, MdnsBroadcaster};
use crate::network::messages::DataMessage;
use crate::network::tcp::TcpSettings;
use crate::transport::listener::Listener;
use crate::transport::{
    Completion, ConnectionMode, ConnectionService, EventSender, PeerId, StartRequest,
};
use std::net::SocketAddr;

/// LAN sessions: a TCP listener advertised over mDNS. Anyone on the network
/// who finds the advertisement may connect.
pub struct NearbyService {
    listener: Listener,
    session_name: String,
    max_players: usize,
    advert: Option<Advertisement>,
}

impl NearbyService {
    pub fn new(
        bind: SocketAddr,
        settings: TcpSettings,
        events: EventSender,
        session_name: String,
        max_players: usize,
    ) -> Self {
        Self {
            listener: Listener::new(ConnectionMode::Nearby, bind, settings, events),
            session_name,
            max_players,
            advert: None,
        }
    }
}

impl ConnectionService for NearbyService {
    fn mode(&self) -> ConnectionMode {
        self.listener.mode()
    }

    fn start(&mut self, request: StartRequest) {
        let mut advert = Advertisement {
            session_name: self.session_name.clone(),
            host_name: request.identity.name.clone(),
            host_email: request.identity.email.clone(),
            port: 0,
            players: 1,
            max_players: self.max_players,
        };
        self.advert = Some(advert.clone());

        self.listener.start(Box::new(move |addr| {
            advert.port = addr.port();
            Ok(Some(MdnsBroadcaster::register(&advert)?))
        }));
    }

    fn stop(&mut self, completion: Completion) {
        self.advert = None;
        self.listener.stop(completion);
    }

    fn disconnect(&mut self, peer: PeerId, reason: Option<String>) {
        self.listener.disconnect(peer, reason);
    }

    fn send(&self, peer: PeerId, message: DataMessage) -> bool {
        self.listener.send(peer, message)
    }

    fn players_changed(&mut self, players: usize) {
        let Some(advert) = self.advert.as_mut() else {
            return;
        };
        if advert.players == players {
            return;
        }
        advert.players = players;
        let advert = advert.clone();
        self.listener.with_advert(|broadcaster| {
            let mut current = advert;
            current.port = broadcaster.port();
            if let Err(e) = broadcaster.update(&current) {
                log::warn!("mDNS: could not update player count: {e}");
            }
        });
    }
}
