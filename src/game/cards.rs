//! Cards, suits and the deterministic deal.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DECK_SIZE: u8 = 52;

const RANKS_PER_SUIT: u8 = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Suit {
    Clubs,
    Diamonds,
    Hearts,
    Spades,
}

impl Suit {
    const ALL: [Suit; 4] = [Suit::Clubs, Suit::Diamonds, Suit::Hearts, Suit::Spades];

    pub fn name(self) -> &'static str {
        match self {
            Suit::Clubs => "Clubs",
            Suit::Diamonds => "Diamonds",
            Suit::Hearts => "Hearts",
            Suit::Spades => "Spades",
        }
    }
}

/// A card encoded as `suit * 13 + rank`, rank 0 being the two and 12 the ace.
/// This is the integer that travels in `played` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Card(u8);

impl Card {
    pub fn from_index(index: u8) -> Option<Card> {
        (index < DECK_SIZE).then_some(Card(index))
    }

    pub fn new(suit: Suit, rank: u8) -> Card {
        debug_assert!(rank < RANKS_PER_SUIT);
        Card(suit as u8 * RANKS_PER_SUIT + rank)
    }

    pub fn index(self) -> u8 {
        self.0
    }

    pub fn suit(self) -> Suit {
        Suit::ALL[(self.0 / RANKS_PER_SUIT) as usize]
    }

    pub fn rank(self) -> u8 {
        self.0 % RANKS_PER_SUIT
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const FACES: &[u8; 13] = b"23456789TJQKA";
        write!(f, "{}{}", FACES[self.rank() as usize] as char, &self.suit().name()[..1])
    }
}

/// Trumps rotate Clubs, Diamonds, Hearts, Spades, then a no-trump round.
pub fn trump_for_round(round: usize) -> Option<Suit> {
    Suit::ALL.get(round % 5).copied()
}

/// Seed for dealing a given round of a given game.
pub fn dealing_seed(game_seed: u64, round: usize) -> u64 {
    game_seed
        .wrapping_add((round as u64).wrapping_mul(1_000_000))
        .wrapping_add(2)
}

/// Shuffle a full deck with `seed` and deal `cards` to each of `players`.
/// Hands come back sorted.
pub fn deal_hands(seed: u64, players: usize, cards: usize) -> Vec<Vec<Card>> {
    let mut deck: Vec<Card> = (0..DECK_SIZE).map(Card).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    deck.shuffle(&mut rng);

    let mut hands: Vec<Vec<Card>> = (0..players)
        .map(|p| deck.iter().skip(p).step_by(players).take(cards).copied().collect())
        .collect();
    for hand in &mut hands {
        hand.sort();
    }
    hands
}
