//! Human-readable session status, and the read-only companion feed.

use crate::game::GameState;
use crate::transport::ConnectionMode;
use serde::Serialize;
use tokio::sync::watch;

pub const READY: &str = "Ready to start game";
pub const WAITING_FOR_HOST: &str = "Waiting for the host to start the game";
pub const WAITING_TO_CONNECT: &str = "Waiting for other players to connect...";
pub const WAITING_FOR_INVITED: &str = "Waiting for invited players to connect...";
pub const WAITING_TO_RECONNECT: &str = "Waiting for other players to reconnect...";

/// Local and remote status for the given session state. The two only differ
/// once the host could start.
pub fn compute(
    mode: ConnectionMode,
    recovery_mode: bool,
    can_start_game: bool,
) -> (&'static str, &'static str) {
    if can_start_game {
        return (READY, WAITING_FOR_HOST);
    }
    let waiting = if recovery_mode {
        WAITING_TO_RECONNECT
    } else if mode == ConnectionMode::Online {
        WAITING_FOR_INVITED
    } else {
        WAITING_TO_CONNECT
    };
    (waiting, waiting)
}

/// What changed since the last [`StatusNotifier::update`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub local: Option<String>,
    pub remote: Option<String>,
}

impl StatusUpdate {
    pub fn is_empty(&self) -> bool {
        self.local.is_none() && self.remote.is_none()
    }
}

/// Remembers the last strings handed out so unchanged status is never resent.
#[derive(Debug, Default)]
pub struct StatusNotifier {
    local: Option<String>,
    remote: Option<String>,
}

impl StatusNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(
        &mut self,
        mode: ConnectionMode,
        recovery_mode: bool,
        can_start_game: bool,
    ) -> StatusUpdate {
        let (local, remote) = compute(mode, recovery_mode, can_start_game);
        StatusUpdate {
            local: replace_if_changed(&mut self.local, local),
            remote: replace_if_changed(&mut self.remote, remote),
        }
    }

    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    /// Last status sent to remotes; a late joiner gets this directly.
    pub fn remote(&self) -> Option<&str> {
        self.remote.as_deref()
    }

    pub fn reset(&mut self) {
        self.local = None;
        self.remote = None;
    }
}

fn replace_if_changed(slot: &mut Option<String>, value: &str) -> Option<String> {
    if slot.as_deref() == Some(value) {
        return None;
    }
    *slot = Some(value.to_string());
    slot.clone()
}

// ── Companion channel ───────────────────────────────────────────────────────

/// Snapshot pushed to attached observers such as a watch display. Every
/// field is empty or `None` while no game is running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompanionState {
    pub in_progress: bool,
    pub complete: bool,
    /// One-based round number.
    pub round: Option<usize>,
    pub cards: Option<usize>,
    pub trump_suit: Option<String>,
    pub player_names: Vec<String>,
    pub player_bids: Vec<Option<u8>>,
    pub player_made: Vec<u8>,
    /// Scores of the last finished round.
    pub player_scores: Vec<i32>,
    pub player_totals: Vec<i32>,
}

impl CompanionState {
    pub fn from_game(game: Option<&GameState>, player_names: Vec<String>) -> Self {
        let Some(game) = game else {
            return Self::default();
        };
        let made = game
            .deal
            .as_ref()
            .map(|d| d.tricks_won.clone())
            .unwrap_or_default();
        Self {
            in_progress: !game.complete,
            complete: game.complete,
            round: (!game.complete).then_some(game.round.round + 1),
            cards: (!game.complete).then(|| game.cards()),
            trump_suit: (!game.complete).then(|| {
                game.trump()
                    .map_or("No trumps", |s| s.name())
                    .to_string()
            }),
            player_names,
            player_bids: game.round.bids.clone(),
            player_made: made,
            player_scores: game
                .round
                .history
                .last()
                .map(|r| r.scores.clone())
                .unwrap_or_default(),
            player_totals: game.totals(),
        }
    }
}

pub struct CompanionChannel {
    tx: watch::Sender<CompanionState>,
}

impl Default for CompanionChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl CompanionChannel {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(CompanionState::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<CompanionState> {
        self.tx.subscribe()
    }

    /// Publish `state` if it differs from the last one. Returns whether
    /// observers were notified.
    pub fn publish(&self, state: CompanionState) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::RoundPlan;
    use uuid::Uuid;

    #[test]
    fn test_identical_status_reported_once() {
        let mut notifier = StatusNotifier::new();
        let first = notifier.update(ConnectionMode::Nearby, false, false);
        assert_eq!(first.local.as_deref(), Some(WAITING_TO_CONNECT));
        assert_eq!(first.remote.as_deref(), Some(WAITING_TO_CONNECT));

        assert!(notifier.update(ConnectionMode::Nearby, false, false).is_empty());
    }

    #[test]
    fn test_ready_splits_local_and_remote() {
        let mut notifier = StatusNotifier::new();
        notifier.update(ConnectionMode::Online, false, false);
        let ready = notifier.update(ConnectionMode::Online, false, true);
        assert_eq!(ready.local.as_deref(), Some(READY));
        assert_eq!(ready.remote.as_deref(), Some(WAITING_FOR_HOST));
        assert_eq!(notifier.remote(), Some(WAITING_FOR_HOST));
    }

    #[test]
    fn test_status_strings_by_mode() {
        assert_eq!(compute(ConnectionMode::Online, false, false).0, WAITING_FOR_INVITED);
        assert_eq!(compute(ConnectionMode::Nearby, true, false).0, WAITING_TO_RECONNECT);
        assert_eq!(compute(ConnectionMode::Loopback, false, false).0, WAITING_TO_CONNECT);
    }

    #[test]
    fn test_reset_forgets_last_status() {
        let mut notifier = StatusNotifier::new();
        notifier.update(ConnectionMode::Nearby, false, false);
        let update = notifier.update(ConnectionMode::Nearby, true, false);
        assert!(update.local.is_some() && update.remote.is_some());
        assert!(notifier.update(ConnectionMode::Nearby, true, false).is_empty());
        notifier.reset();
        assert_eq!(notifier.local(), None);
    }

    #[test]
    fn test_companion_without_game_is_empty() {
        let state = CompanionState::from_game(None, vec!["Hana".into()]);
        assert_eq!(state, CompanionState::default());
    }

    #[test]
    fn test_companion_publishes_only_changes() {
        let channel = CompanionChannel::new();
        let mut rx = channel.subscribe();

        let mut game = GameState::new(Uuid::new_v4(), 3, RoundPlan::default());
        game.deal().unwrap();
        let names = vec!["Hana".to_string(), "Pat".into(), "Sam".into()];
        let state = CompanionState::from_game(Some(&game), names);
        assert_eq!(state.round, Some(1));
        assert_eq!(state.cards, Some(13));
        assert_eq!(state.trump_suit.as_deref(), Some("Clubs"));

        assert!(channel.publish(state.clone()));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        assert!(!channel.publish(state));
        assert!(!rx.has_changed().unwrap());
    }
}
