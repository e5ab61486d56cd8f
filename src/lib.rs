pub mod config;
pub mod error;
pub mod game;
pub mod logging;
pub mod network;
pub mod recovery;
pub mod session;
pub mod status;
pub mod transport;

pub use config::HostConfig;
pub use error::{SessionError, TransportError};
pub use session::{Phase, SessionEvent, SessionHandle, SessionHost, SessionView, SummaryChoice};
pub use transport::{ConnectionMode, PeerIdentity};
