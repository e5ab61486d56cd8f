//! Who is at the table and what the session is doing.
//!
//! [`coordinator::SessionCoordinator`] is the synchronous state machine;
//! [`host::SessionHost`] runs it on a tokio task behind a [`host::SessionHandle`].

pub mod admission;
pub mod coordinator;
pub mod host;
pub mod outbox;
pub mod roster;

pub use coordinator::{
    Phase, ServiceState, SessionCoordinator, SessionEvent, SessionState, SessionView,
    SummaryChoice, Transports,
};
pub use host::{Command, SessionHandle, SessionHost};
pub use roster::{InviteStatus, PlayerRecord, PlayerUpdate, ProfileRef, Roster, RosterError};
