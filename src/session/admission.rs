//! Whether enough players are connected for the host to start.

use crate::config::MIN_PLAYERS;
use crate::session::roster::Roster;
use crate::transport::ConnectionMode;

/// Mode-specific readiness rule.
///
/// A recovering session, like a loopback one, needs exactly the players it
/// expects. Online sessions need everyone on the roster connected; nearby
/// sessions start as soon as enough people have turned up.
pub fn can_start_game(
    mode: ConnectionMode,
    recovery_mode: bool,
    roster: &Roster,
    expected_players: usize,
) -> bool {
    if recovery_mode || mode == ConnectionMode::Loopback {
        return mode != ConnectionMode::Unknown && roster.connected_count() == expected_players;
    }
    match mode {
        ConnectionMode::Online => {
            roster.len() >= MIN_PLAYERS && roster.players().iter().all(|p| p.is_connected())
        }
        ConnectionMode::Nearby => roster.connected_count() >= MIN_PLAYERS,
        ConnectionMode::Loopback | ConnectionMode::Unknown => false,
    }
}
