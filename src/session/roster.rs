//! Ordered players of the hosted session, host first.
//!
//! Records with a disconnect reason are kept as placeholders at the end of
//! the list so that seat numbers of visible players stay contiguous.

use crate::transport::{Peer, PeerId, PeerState};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RosterError {
    #[error("the session is full ({max} players)")]
    Full { max: usize },
    #[error("the host cannot be removed")]
    HostRemoval,
    #[error("there is no player {0}")]
    NoSuchPlayer(usize),
    #[error("the session already has a host")]
    HostAlreadySet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InviteStatus {
    NotInvited,
    Invited,
    Accepted,
    Declined,
}

/// Link to the player's locally stored profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileRef(pub Uuid);

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerRecord {
    pub display_name: String,
    pub email: String,
    pub profile: Option<ProfileRef>,
    pub peer: Option<Peer>,
    pub invite_status: InviteStatus,
    pub disconnect_reason: Option<String>,
    pub is_host: bool,
    /// Set while the remote may hold stale state; cleared by its refresh request.
    pub refresh_required: bool,
    pub unique_seq: u64,
}

impl PlayerRecord {
    /// The host is always connected to itself.
    pub fn is_connected(&self) -> bool {
        self.is_host
            || (self.peer.as_ref().is_some_and(|p| p.state == PeerState::Connected)
                && !self.refresh_required)
    }

    pub fn is_visible(&self) -> bool {
        self.disconnect_reason.is_none()
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer.as_ref().map(|p| p.id)
    }

    /// A remote we may send game data to.
    pub fn usable_peer(&self) -> Option<PeerId> {
        match &self.peer {
            Some(peer) if !self.is_host && self.is_connected() => Some(peer.id),
            _ => None,
        }
    }

    pub fn matches_email(&self, email: &str) -> bool {
        self.email.eq_ignore_ascii_case(email)
    }
}

/// Fields to apply in [`Roster::add_or_update`]. Unset optionals leave an
/// existing record's value alone.
#[derive(Debug, Clone)]
pub struct PlayerUpdate {
    email: String,
    name: String,
    profile: Option<ProfileRef>,
    peer: Option<Peer>,
    invite_status: Option<InviteStatus>,
    disconnect_reason: Option<String>,
    is_host: bool,
}

impl PlayerUpdate {
    pub fn new(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: name.into(),
            profile: None,
            peer: None,
            invite_status: None,
            disconnect_reason: None,
            is_host: false,
        }
    }

    pub fn host(mut self) -> Self {
        self.is_host = true;
        self
    }

    pub fn profile(mut self, profile: ProfileRef) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn peer(mut self, peer: Peer) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn invite_status(mut self, status: InviteStatus) -> Self {
        self.invite_status = Some(status);
        self
    }

    pub fn disconnect_reason(mut self, reason: impl Into<String>) -> Self {
        self.disconnect_reason = Some(reason.into());
        self
    }
}

// ── Roster ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Roster {
    players: Vec<PlayerRecord>,
    max_players: usize,
    next_seq: u64,
}

impl Roster {
    pub fn new(max_players: usize) -> Self {
        Self {
            players: Vec::new(),
            max_players,
            next_seq: 1,
        }
    }

    pub fn players(&self) -> &[PlayerRecord] {
        &self.players
    }

    pub fn get(&self, index: usize) -> Option<&PlayerRecord> {
        self.players.get(index)
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn max_players(&self) -> usize {
        self.max_players
    }

    pub fn host(&self) -> Option<&PlayerRecord> {
        self.players.first().filter(|p| p.is_host)
    }

    pub fn connected_count(&self) -> usize {
        self.players.iter().filter(|p| p.is_connected()).count()
    }

    /// Players without a disconnect reason.
    pub fn visible_count(&self) -> usize {
        self.players.iter().filter(|p| p.is_visible()).count()
    }

    pub fn is_full(&self) -> bool {
        self.visible_count() >= self.max_players
    }

    pub fn find_by_email(&self, email: &str) -> Option<usize> {
        self.players.iter().position(|p| p.matches_email(email))
    }

    pub fn find_by_peer(&self, peer: PeerId) -> Option<usize> {
        self.players.iter().position(|p| p.peer_id() == Some(peer))
    }

    /// Insert a player, or update the record that already has this email.
    /// Returns the record's index afterwards.
    pub fn add_or_update(&mut self, update: PlayerUpdate) -> Result<usize, RosterError> {
        let Some(index) = self.find_by_email(&update.email) else {
            return self.insert(update);
        };

        let record = &mut self.players[index];
        if !update.name.is_empty() {
            record.display_name = update.name;
        }
        if update.profile.is_some() {
            record.profile = update.profile;
        }
        if update.peer.is_some() {
            record.peer = update.peer;
        }
        if let Some(status) = update.invite_status {
            record.invite_status = status;
        }
        match update.disconnect_reason {
            Some(reason) => self.set_disconnect_reason(index, Some(reason)),
            None => Ok(index),
        }
    }

    fn insert(&mut self, update: PlayerUpdate) -> Result<usize, RosterError> {
        let visible = update.disconnect_reason.is_none();
        if update.is_host && self.host().is_some() {
            return Err(RosterError::HostAlreadySet);
        }
        if visible && self.is_full() {
            return Err(RosterError::Full {
                max: self.max_players,
            });
        }

        let record = PlayerRecord {
            display_name: update.name,
            email: update.email,
            profile: update.profile,
            peer: update.peer,
            invite_status: update.invite_status.unwrap_or(InviteStatus::NotInvited),
            disconnect_reason: update.disconnect_reason,
            is_host: update.is_host,
            refresh_required: false,
            unique_seq: self.next_seq,
        };
        self.next_seq += 1;

        let index = if record.is_host {
            0
        } else if visible {
            self.visible_count().max(self.host_offset())
        } else {
            self.players.len()
        };
        self.players.insert(index, record);
        Ok(index)
    }

    fn host_offset(&self) -> usize {
        usize::from(self.host().is_some())
    }

    /// Remove by 1-based player number. Player 1 is the host.
    pub fn remove(&mut self, player_number: usize) -> Result<PlayerRecord, RosterError> {
        let index = player_number
            .checked_sub(1)
            .filter(|&i| i < self.players.len())
            .ok_or(RosterError::NoSuchPlayer(player_number))?;
        if self.players[index].is_host {
            return Err(RosterError::HostRemoval);
        }
        Ok(self.players.remove(index))
    }

    /// Setting a reason parks the record at the end; clearing it brings the
    /// record back among the visible players. Returns the new index.
    pub fn set_disconnect_reason(
        &mut self,
        index: usize,
        reason: Option<String>,
    ) -> Result<usize, RosterError> {
        let record = self
            .players
            .get(index)
            .ok_or(RosterError::NoSuchPlayer(index + 1))?;
        if record.is_host || (reason.is_none() && record.is_visible()) {
            return Ok(index);
        }
        if reason.is_none() && self.is_full() {
            return Err(RosterError::Full {
                max: self.max_players,
            });
        }
        let mut record = self.players.remove(index);
        let target = if reason.is_some() {
            self.players.len()
        } else {
            self.visible_count().max(self.host_offset())
        };
        record.disconnect_reason = reason;
        self.players.insert(target, record);
        Ok(target)
    }

    /// Replace the transport view of a player.
    pub fn set_peer(&mut self, index: usize, peer: Option<Peer>) {
        if let Some(record) = self.players.get_mut(index) {
            record.peer = peer;
        }
    }

    pub fn set_refresh_required(&mut self, index: usize, required: bool) {
        if let Some(record) = self.players.get_mut(index) {
            record.refresh_required = required;
        }
    }

    pub fn set_invite_status(&mut self, index: usize, status: InviteStatus) {
        if let Some(record) = self.players.get_mut(index) {
            record.invite_status = status;
        }
    }

    /// Drop everybody but the host.
    pub fn clear_guests(&mut self) {
        self.players.retain(|p| p.is_host);
    }

    /// Cut every guest loose from its transport. Guests who were never
    /// invited are dropped unless `keep_uninvited` is set.
    pub fn detach_guests(&mut self, keep_uninvited: bool) {
        self.players.retain(|p| {
            p.is_host || keep_uninvited || p.invite_status != InviteStatus::NotInvited
        });
        for record in self.players.iter_mut().filter(|p| !p.is_host) {
            record.peer = None;
        }
    }

    /// Seats of connected remotes that are safe to send to.
    pub fn usable_peers(&self) -> impl Iterator<Item = (usize, PeerId)> + '_ {
        self.players
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.usable_peer().map(|id| (i, id)))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
