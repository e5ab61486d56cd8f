//! TCP listener shared by the nearby and online services.

use crate::error::TransportError;
use crate::network::mdns::MdnsBroadcaster;
use crate::network::messages::DataMessage;
use crate::network::tcp::{TcpHost, TcpSettings};
use crate::transport::{Completion, ConnectionMode, EventSender, PeerId, TransportEvent};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Runs once the socket is bound. Returning `Err` fails the start.
pub(crate) type OnBound =
    Box<dyn FnOnce(SocketAddr) -> Result<Option<MdnsBroadcaster>, TransportError> + Send>;

#[derive(Default)]
struct Slot {
    host: Option<TcpHost>,
    advert: Option<MdnsBroadcaster>,
    /// Set by `stop`; a start that finishes afterwards tears itself down.
    stopped: bool,
}

pub(crate) struct Listener {
    mode: ConnectionMode,
    bind: SocketAddr,
    settings: TcpSettings,
    events: EventSender,
    slot: Arc<Mutex<Slot>>,
    start_task: Option<JoinHandle<()>>,
}

impl Listener {
    pub(crate) fn new(
        mode: ConnectionMode,
        bind: SocketAddr,
        settings: TcpSettings,
        events: EventSender,
    ) -> Self {
        Self {
            mode,
            bind,
            settings,
            events,
            slot: Arc::new(Mutex::new(Slot::default())),
            start_task: None,
        }
    }

    pub(crate) fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub(crate) fn is_running(&self) -> bool {
        self.slot.lock().host.is_some()
    }

    pub(crate) fn start(&mut self, on_bound: OnBound) {
        if self.start_task.is_some() || self.is_running() {
            log::debug!("{} service already started", self.mode);
            return;
        }
        self.slot.lock().stopped = false;

        let (mode, bind, settings) = (self.mode, self.bind, self.settings);
        let events = self.events.clone();
        let slot = self.slot.clone();

        self.start_task = Some(tokio::spawn(async move {
            let mut host = match TcpHost::bind(bind, mode, events.clone(), settings).await {
                Ok(h) => h,
                Err(source) => {
                    let e = TransportError::Bind { addr: bind, source };
                    log::warn!("{mode} service: {e}");
                    let _ = events.send(TransportEvent::ServiceFailed {
                        mode,
                        error: e.to_string(),
                    });
                    return;
                }
            };

            let advert = match on_bound(host.local_addr()) {
                Ok(advert) => advert,
                Err(e) => {
                    log::warn!("{mode} service failed to start: {e}");
                    host.shutdown();
                    let _ = events.send(TransportEvent::ServiceFailed {
                        mode,
                        error: e.to_string(),
                    });
                    return;
                }
            };

            let mut guard = slot.lock();
            if guard.stopped {
                drop(guard);
                host.shutdown();
                if let Some(advert) = advert {
                    let _ = advert.unregister();
                }
                return;
            }
            guard.host = Some(host);
            guard.advert = advert;
            drop(guard);

            let _ = events.send(TransportEvent::ServiceStarted { mode });
        }));
    }

    pub(crate) fn stop(&mut self, completion: Completion) {
        if let Some(task) = self.start_task.take() {
            if !task.is_finished() {
                task.abort();
            }
        }
        let (host, advert) = {
            let mut slot = self.slot.lock();
            slot.stopped = true;
            (slot.host.take(), slot.advert.take())
        };

        if let Some(mut host) = host {
            host.shutdown();
            log::info!("{} service stopped", self.mode);
        }

        match advert {
            // Unregistering waits on the mDNS daemon; keep that off the caller.
            Some(advert) => {
                tokio::task::spawn_blocking(move || {
                    if let Err(e) = advert.unregister() {
                        log::warn!("mDNS unregister failed: {e}");
                    }
                    let _ = completion.send(());
                });
            }
            None => {
                let _ = completion.send(());
            }
        }
    }

    pub(crate) fn disconnect(&self, peer: PeerId, reason: Option<String>) {
        if let Some(host) = self.slot.lock().host.as_ref() {
            host.disconnect(peer, reason);
        }
    }

    pub(crate) fn send(&self, peer: PeerId, message: DataMessage) -> bool {
        self.slot
            .lock()
            .host
            .as_ref()
            .is_some_and(|host| host.send(peer, message))
    }

    pub(crate) fn with_advert(&self, f: impl FnOnce(&MdnsBroadcaster)) {
        if let Some(advert) = self.slot.lock().advert.as_ref() {
            f(advert);
        }
    }
}
