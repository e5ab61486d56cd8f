//! Persisted state that lets a relaunched host pick an interrupted game back up.

pub mod store;

pub use store::{FileStore, MemoryStore, SnapshotStore, StoreError};

use crate::game::{DealState, GameError, GameState, RoundAdvance, RoundPlan, RoundState};
use crate::transport::ConnectionMode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One seat of the game, identified independently of roster position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedPlayer {
    pub player_uuid: Uuid,
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySnapshot {
    pub game_uuid: Uuid,
    pub connection_mode: ConnectionMode,
    pub match_game_id: Option<String>,
    /// Seat order of the game.
    pub selected_players: Vec<SelectedPlayer>,
    pub plan: RoundPlan,
    pub round_state: RoundState,
    pub deal_state: Option<DealState>,
    pub expected_players: usize,
}

impl RecoverySnapshot {
    pub fn capture(
        game: &GameState,
        connection_mode: ConnectionMode,
        match_game_id: Option<String>,
        selected_players: Vec<SelectedPlayer>,
    ) -> Self {
        Self {
            game_uuid: game.game_uuid,
            connection_mode,
            match_game_id,
            expected_players: selected_players.len(),
            selected_players,
            plan: game.plan.clone(),
            round_state: game.round.clone(),
            deal_state: game.deal.clone(),
        }
    }

    /// Seat of the player with this stable id, falling back to email.
    pub fn seat_of(&self, player_uuid: Option<Uuid>, email: &str) -> Option<usize> {
        seat_of(&self.selected_players, player_uuid, email)
    }
}

/// Seat lookup by stable id first, then by email.
pub fn seat_of(
    seats: &[SelectedPlayer],
    player_uuid: Option<Uuid>,
    email: &str,
) -> Option<usize> {
    player_uuid
        .and_then(|id| seats.iter().position(|s| s.player_uuid == id))
        .or_else(|| seats.iter().position(|s| s.email.eq_ignore_ascii_case(email)))
}

/// Rebuild the game from a snapshot. A hand that was played out before the
/// interruption is scored and the game moves to the next round; the returned
/// flag says whether that happened.
pub fn resume_game(snapshot: &RecoverySnapshot) -> Result<(GameState, bool), GameError> {
    let mut game = GameState::restore(
        snapshot.game_uuid,
        snapshot.plan.clone(),
        snapshot.round_state.clone(),
        snapshot.deal_state.clone(),
    )?;
    if snapshot.selected_players.len() != game.players {
        return Err(GameError::Inconsistent("seat list does not match the game"));
    }
    if !game.hand_complete() {
        return Ok((game, false));
    }
    match game.advance_round()? {
        RoundAdvance::NextRound => log::info!(
            "Recovered hand was finished; moving on to round {}",
            game.round.round + 1
        ),
        RoundAdvance::GameComplete => log::info!("Recovered hand was the last one"),
    }
    Ok((game, true))
}
