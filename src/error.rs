use crate::game::GameError;
use crate::recovery::StoreError;
use crate::session::roster::RosterError;
use crate::session::Phase;
use crate::transport::ConnectionMode;
use std::net::SocketAddr;
use thiserror::Error;

/// Why a connection service could not start.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("could not advertise session: {0}")]
    Advertise(#[from] mdns_sd::Error),
    #[error("no invitation channel is configured")]
    NoInvitationSink,
    #[error("invitation channel closed")]
    InvitationSinkClosed,
    #[error("{0} service is not running")]
    NotRunning(ConnectionMode),
}

/// Misuse of a coordinator operation. Transport trouble never surfaces here;
/// it becomes a notice or a per-peer disconnect instead.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot {operation} while {phase:?}")]
    InvalidPhase {
        operation: &'static str,
        phase: Phase,
    },
    #[error("no connection mode has been chosen")]
    NoConnectionMode,
    #[error("not enough players are connected to start")]
    NotReady,
    #[error("online sessions need at least one invited player")]
    NoInvitees,
    #[error("nothing to recover")]
    NothingToRecover,
    #[error(transparent)]
    Roster(#[from] RosterError),
    #[error(transparent)]
    Game(#[from] GameError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("session host has stopped")]
    HostStopped,
}
