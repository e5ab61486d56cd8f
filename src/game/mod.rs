//! Contract Whist game state: rounds, bidding, trick play and scoring.
//!
//! The host owns one [`GameState`] per game. Remote devices never mutate it
//! directly; their bids and plays arrive as data messages and are applied
//! here after validation.

pub mod cards;

pub use cards::{Card, Suit};

use crate::config::MIN_PLAYERS;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Points awarded on top of tricks taken when a bid is made exactly.
pub const EXACT_BID_BONUS: i32 = 10;

// ── GameError ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GameError {
    #[error("no hand has been dealt")]
    NotDealt,
    #[error("the current hand is still being played")]
    AlreadyDealt,
    #[error("player {0} is not seated at this table")]
    NoSuchPlayer(usize),
    #[error("it is player {expected}'s turn, not player {player}'s")]
    NotYourTurn { expected: usize, player: usize },
    #[error("bid {bid} is out of range for a {cards} card hand")]
    InvalidBid { bid: u8, cards: usize },
    #[error("the dealer may not bid so that bids total {0}")]
    DealerBidRestricted(usize),
    #[error("bidding is not complete")]
    BiddingIncomplete,
    #[error("card {0} is not in the player's hand")]
    CardNotInHand(Card),
    #[error("player must follow {0:?}")]
    MustFollowSuit(Suit),
    #[error("the hand is not complete")]
    HandNotComplete,
    #[error("the game is over")]
    GameComplete,
    #[error("saved game is inconsistent: {0}")]
    Inconsistent(&'static str),
}

// ── RoundPlan ───────────────────────────────────────────────────────────────

/// Cards per round: counts down (or up) from `start_cards` to `end_cards`,
/// and back again when `bounce` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundPlan {
    pub start_cards: usize,
    pub end_cards: usize,
    pub bounce: bool,
}

impl Default for RoundPlan {
    fn default() -> Self {
        Self {
            start_cards: 13,
            end_cards: 1,
            bounce: false,
        }
    }
}

impl RoundPlan {
    fn sequence(&self) -> Vec<usize> {
        let leg: Vec<usize> = if self.start_cards >= self.end_cards {
            (self.end_cards..=self.start_cards).rev().collect()
        } else {
            (self.start_cards..=self.end_cards).collect()
        };
        let mut all = leg.clone();
        if self.bounce && leg.len() > 1 {
            all.extend(leg.iter().rev().skip(1));
        }
        all
    }

    pub fn rounds(&self) -> usize {
        self.sequence().len()
    }

    pub fn cards_for_round(&self, round: usize) -> Option<usize> {
        self.sequence().get(round).copied()
    }
}

// ── Round / deal state ──────────────────────────────────────────────────────

/// Outcome of one finished round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundResult {
    pub bids: Vec<u8>,
    pub made: Vec<u8>,
    pub scores: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundState {
    /// Zero-based round counter.
    pub round: usize,
    pub dealer: usize,
    pub bids: Vec<Option<u8>>,
    pub history: Vec<RoundResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealState {
    pub hands: Vec<Vec<Card>>,
    /// Cards on the table for the trick in progress, in play order.
    pub trick: Vec<(usize, Card)>,
    pub leader: usize,
    pub tricks_won: Vec<u8>,
}

impl DealState {
    pub fn all_hands_empty(&self) -> bool {
        self.hands.iter().all(Vec::is_empty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    Played,
    TrickWon { winner: usize },
    HandComplete { winner: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundAdvance {
    NextRound,
    GameComplete,
}

// ── GameState ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameState {
    pub game_uuid: Uuid,
    pub players: usize,
    pub plan: RoundPlan,
    pub round: RoundState,
    pub deal: Option<DealState>,
    pub complete: bool,
}

impl GameState {
    pub fn new(game_uuid: Uuid, players: usize, plan: RoundPlan) -> Self {
        Self {
            game_uuid,
            players,
            plan,
            round: RoundState {
                round: 0,
                dealer: 0,
                bids: vec![None; players],
                history: Vec::new(),
            },
            deal: None,
            complete: false,
        }
    }

    /// Rebuild a game from persisted round and deal state. Every per-player
    /// vector must agree on the player count.
    pub fn restore(
        game_uuid: Uuid,
        plan: RoundPlan,
        round: RoundState,
        deal: Option<DealState>,
    ) -> Result<Self, GameError> {
        let players = round.bids.len();
        if players < MIN_PLAYERS {
            return Err(GameError::Inconsistent("too few players"));
        }
        if round.dealer >= players {
            return Err(GameError::Inconsistent("dealer is not seated"));
        }
        let history_fits = round
            .history
            .iter()
            .all(|r| r.bids.len() == players && r.made.len() == players && r.scores.len() == players);
        if !history_fits {
            return Err(GameError::Inconsistent("round history has the wrong width"));
        }
        if let Some(deal) = &deal {
            if deal.hands.len() != players || deal.tricks_won.len() != players {
                return Err(GameError::Inconsistent("deal has the wrong number of hands"));
            }
            if deal.leader >= players || deal.trick.iter().any(|&(p, _)| p >= players) {
                return Err(GameError::Inconsistent("trick names a seat that does not exist"));
            }
        }
        let complete = round.round >= plan.rounds();
        Ok(Self {
            game_uuid,
            players,
            plan,
            round,
            deal,
            complete,
        })
    }

    pub fn cards(&self) -> usize {
        self.plan.cards_for_round(self.round.round).unwrap_or(0)
    }

    pub fn trump(&self) -> Option<Suit> {
        cards::trump_for_round(self.round.round)
    }

    pub fn is_final_round(&self) -> bool {
        self.round.round + 1 >= self.plan.rounds()
    }

    fn seed(&self) -> u64 {
        let (hi, lo) = self.game_uuid.as_u64_pair();
        cards::dealing_seed(hi ^ lo, self.round.round)
    }

    /// Deal the current round. A finished hand that has not been advanced
    /// past yet still blocks a new deal.
    pub fn deal(&mut self) -> Result<(), GameError> {
        if self.complete {
            return Err(GameError::GameComplete);
        }
        if self.deal.is_some() {
            return Err(GameError::AlreadyDealt);
        }
        let hands = cards::deal_hands(self.seed(), self.players, self.cards());
        self.round.bids = vec![None; self.players];
        self.deal = Some(DealState {
            hands,
            trick: Vec::new(),
            leader: (self.round.dealer + 1) % self.players,
            tricks_won: vec![0; self.players],
        });
        log::debug!(
            "Dealt round {} ({} cards) for game {}",
            self.round.round + 1,
            self.cards(),
            self.game_uuid
        );
        Ok(())
    }

    pub fn hand(&self, player: usize) -> &[Card] {
        self.deal
            .as_ref()
            .and_then(|d| d.hands.get(player))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn hand_complete(&self) -> bool {
        self.deal.as_ref().is_some_and(DealState::all_hands_empty)
    }

    /// Next player to bid, or `None` once everyone has bid.
    pub fn next_to_bid(&self) -> Option<usize> {
        self.deal.as_ref()?;
        (1..=self.players)
            .map(|offset| (self.round.dealer + offset) % self.players)
            .find(|&p| self.round.bids[p].is_none())
    }

    pub fn bid(&mut self, player: usize, bid: u8) -> Result<(), GameError> {
        if player >= self.players {
            return Err(GameError::NoSuchPlayer(player));
        }
        let expected = self.next_to_bid().ok_or(match self.deal {
            None => GameError::NotDealt,
            Some(_) => GameError::NotYourTurn {
                expected: self.round.dealer,
                player,
            },
        })?;
        if expected != player {
            return Err(GameError::NotYourTurn { expected, player });
        }
        let cards = self.cards();
        if bid as usize > cards {
            return Err(GameError::InvalidBid { bid, cards });
        }
        if player == self.round.dealer {
            let others: usize = self.round.bids.iter().flatten().map(|&b| b as usize).sum();
            if others + bid as usize == cards {
                return Err(GameError::DealerBidRestricted(cards));
            }
        }
        self.round.bids[player] = Some(bid);
        Ok(())
    }

    /// Next player to lay a card, or `None` while bidding or once the hand is over.
    pub fn next_to_play(&self) -> Option<usize> {
        let deal = self.deal.as_ref()?;
        if self.next_to_bid().is_some() || deal.all_hands_empty() {
            return None;
        }
        Some((deal.leader + deal.trick.len()) % self.players)
    }

    /// Cards `player` may legally lay right now.
    pub fn legal_cards(&self, player: usize) -> Vec<Card> {
        let Some(deal) = self.deal.as_ref() else {
            return Vec::new();
        };
        let hand = &deal.hands[player];
        match deal.trick.first() {
            Some(&(_, led)) if hand.iter().any(|c| c.suit() == led.suit()) => hand
                .iter()
                .copied()
                .filter(|c| c.suit() == led.suit())
                .collect(),
            _ => hand.clone(),
        }
    }

    pub fn play(&mut self, player: usize, card: Card) -> Result<PlayOutcome, GameError> {
        if player >= self.players {
            return Err(GameError::NoSuchPlayer(player));
        }
        if self.deal.is_none() {
            return Err(GameError::NotDealt);
        }
        if self.next_to_bid().is_some() {
            return Err(GameError::BiddingIncomplete);
        }
        let expected = self.next_to_play().ok_or(GameError::HandNotComplete)?;
        if expected != player {
            return Err(GameError::NotYourTurn { expected, player });
        }
        let trump = self.trump();
        let players = self.players;
        let deal = self.deal.as_mut().ok_or(GameError::NotDealt)?;

        let hand = &mut deal.hands[player];
        let pos = hand
            .iter()
            .position(|&c| c == card)
            .ok_or(GameError::CardNotInHand(card))?;
        if let Some(&(_, led)) = deal.trick.first() {
            if card.suit() != led.suit() && hand.iter().any(|c| c.suit() == led.suit()) {
                return Err(GameError::MustFollowSuit(led.suit()));
            }
        }
        hand.remove(pos);
        deal.trick.push((player, card));

        if deal.trick.len() < players {
            return Ok(PlayOutcome::Played);
        }

        let winner = trick_winner(&deal.trick, trump);
        deal.tricks_won[winner] += 1;
        deal.trick.clear();
        deal.leader = winner;

        if deal.all_hands_empty() {
            Ok(PlayOutcome::HandComplete { winner })
        } else {
            Ok(PlayOutcome::TrickWon { winner })
        }
    }

    /// Score the finished hand and move to the next round.
    pub fn advance_round(&mut self) -> Result<RoundAdvance, GameError> {
        if self.complete {
            return Err(GameError::GameComplete);
        }
        let deal = self.deal.take().ok_or(GameError::NotDealt)?;
        if !deal.all_hands_empty() {
            self.deal = Some(deal);
            return Err(GameError::HandNotComplete);
        }

        let bids: Vec<u8> = self.round.bids.iter().map(|b| b.unwrap_or(0)).collect();
        let scores = bids
            .iter()
            .zip(&deal.tricks_won)
            .map(|(&bid, &made)| score(bid, made))
            .collect();
        self.round.history.push(RoundResult {
            bids,
            made: deal.tricks_won,
            scores,
        });

        self.round.round += 1;
        self.round.dealer = (self.round.dealer + 1) % self.players;
        self.round.bids = vec![None; self.players];

        if self.round.round >= self.plan.rounds() {
            self.complete = true;
            Ok(RoundAdvance::GameComplete)
        } else {
            Ok(RoundAdvance::NextRound)
        }
    }

    pub fn totals(&self) -> Vec<i32> {
        let mut totals = vec![0; self.players];
        for result in &self.round.history {
            for (total, s) in totals.iter_mut().zip(&result.scores) {
                *total += s;
            }
        }
        totals
    }
}

/// Tricks taken, plus the bonus when the bid is made exactly.
pub fn score(bid: u8, made: u8) -> i32 {
    let bonus = if bid == made { EXACT_BID_BONUS } else { 0 };
    made as i32 + bonus
}

/// Seat that takes a complete trick: highest trump, else highest of the led suit.
pub fn trick_winner(trick: &[(usize, Card)], trump: Option<Suit>) -> usize {
    let mut best = trick[0];
    for &(player, card) in &trick[1..] {
        let beats = match trump {
            Some(t) if card.suit() == t && best.1.suit() != t => true,
            _ => card.suit() == best.1.suit() && card.rank() > best.1.rank(),
        };
        if beats {
            best = (player, card);
        }
    }
    best.0
}

// ── Tests ───────────────────────────────────────────────────────────────────
