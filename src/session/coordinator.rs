//! The session state machine.
//!
//! One [`SessionCoordinator`] owns the roster, the session state, the active
//! connection service and the game. Transport callbacks and host operations
//! both land here, one at a time; nothing in this module awaits.

use crate::config::HostConfig;
use crate::error::SessionError;
use crate::game::{Card, GameState, PlayOutcome, RoundAdvance, RoundPlan};
use crate::network::messages::{DataMessage, RemotePlayer, ScoreSheet, StateSync};
use crate::network::tcp::TcpSettings;
use crate::recovery::{self, RecoverySnapshot, SelectedPlayer, SnapshotStore, StoreError};
use crate::session::admission;
use crate::session::outbox::Outbox;
use crate::session::roster::{InviteStatus, PlayerRecord, PlayerUpdate, ProfileRef, Roster};
use crate::status::{CompanionChannel, CompanionState, StatusNotifier};
use crate::transport::{
    ConnectionInfo, ConnectionMode, ConnectionService, EventSender, InvitationSink, LoopbackHub,
    LoopbackService, NearbyService, OnlineService, Peer, PeerId, PeerIdentity, PeerState,
    Service, ServiceDelegate, StartRequest,
};
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

// ── Rejection reasons ───────────────────────────────────────────────────────

const GAME_IN_PROGRESS: &str = "A game is already in progress";
const GAME_FULL: &str = "This game is full";
const REMOVED_BY_HOST: &str = "The host removed you from the game";
const DID_NOT_JOIN: &str = "Did not join";

fn already_joined(email: &str) -> String {
    format!("{email} has already joined this game from another device")
}

fn not_invited(email: &str) -> String {
    format!("{email} has not been invited to this game")
}

// ── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    SelectingPlayers,
    Previewing,
    Admitting,
    Playing,
    Summarizing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    NotStarted,
    Starting,
    Inviting,
    Invited,
    Advertising,
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub connection_mode: ConnectionMode,
    pub service_state: ServiceState,
    pub can_start_game: bool,
    pub game_in_progress: bool,
    pub recovery_mode: bool,
    pub last_status_message: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            connection_mode: ConnectionMode::Unknown,
            service_state: ServiceState::NotStarted,
            can_start_game: false,
            game_in_progress: false,
            recovery_mode: false,
            last_status_message: None,
        }
    }
}

/// Read-only snapshot for views.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub phase: Phase,
    pub state: SessionState,
    pub players: Vec<PlayerRecord>,
}

/// Notifications for the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Local status line changed.
    Status(String),
    /// Something the user should be told about once.
    Notice(String),
    PhaseChanged(Phase),
    RosterChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryChoice {
    NewGame,
    Exit,
}

// ── Transports ──────────────────────────────────────────────────────────────

/// What the coordinator needs to build a connection service on demand.
#[derive(Clone)]
pub struct Transports {
    pub bind: SocketAddr,
    pub tcp: TcpSettings,
    pub session_name: String,
    pub max_players: usize,
    pub loopback: LoopbackHub,
    pub invitations: Option<InvitationSink>,
}

impl Transports {
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            bind: SocketAddr::new(config.bind_addr, config.tcp_port),
            tcp: TcpSettings {
                heartbeat_interval: config.heartbeat_interval,
                heartbeat_timeout: config.heartbeat_timeout,
            },
            session_name: config.session_name.clone(),
            max_players: config.max_players,
            loopback: LoopbackHub::new(),
            invitations: None,
        }
    }

    fn build(&self, mode: ConnectionMode, events: EventSender) -> Option<Service> {
        match mode {
            ConnectionMode::Nearby => Some(Service::Nearby(NearbyService::new(
                self.bind,
                self.tcp,
                events,
                self.session_name.clone(),
                self.max_players,
            ))),
            ConnectionMode::Online => Some(Service::Online(OnlineService::new(
                self.bind,
                self.tcp,
                events,
                self.invitations.clone(),
            ))),
            ConnectionMode::Loopback => Some(Service::Loopback(LoopbackService::new(
                self.loopback.clone(),
                events,
            ))),
            ConnectionMode::Unknown => None,
        }
    }
}

// ── SessionCoordinator ──────────────────────────────────────────────────────

pub struct SessionCoordinator {
    identity: PeerIdentity,
    plan: RoundPlan,
    loopback_players: usize,
    transports: Transports,
    transport_events: EventSender,

    phase: Phase,
    state: SessionState,
    roster: Roster,
    service: Option<Service>,
    invitees: Vec<PeerIdentity>,
    match_game_id: Option<String>,
    expected_players: usize,

    game: Option<GameState>,
    seats: Vec<SelectedPlayer>,
    store: Box<dyn SnapshotStore>,

    outbox: Outbox,
    status: StatusNotifier,
    companion: CompanionChannel,
    view: watch::Sender<SessionView>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionCoordinator {
    /// `transport_events` is handed to every service this coordinator starts;
    /// the caller feeds what arrives on its receiver back through
    /// [`crate::transport::dispatch`].
    pub fn new(
        config: &HostConfig,
        identity: PeerIdentity,
        transports: Transports,
        store: Box<dyn SnapshotStore>,
        transport_events: EventSender,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let mut roster = Roster::new(config.max_players);
        if let Err(e) = roster.add_or_update(
            PlayerUpdate::new(identity.email.as_str(), identity.name.as_str()).host(),
        ) {
            log::error!("Could not seat the host: {e}");
        }
        let (events, events_rx) = mpsc::unbounded_channel();
        let (view, _) = watch::channel(SessionView {
            phase: Phase::Idle,
            state: SessionState::default(),
            players: roster.players().to_vec(),
        });

        let coordinator = Self {
            identity,
            plan: config.round_plan.clone(),
            loopback_players: config.loopback_players(),
            transports,
            transport_events,
            phase: Phase::Idle,
            state: SessionState::default(),
            roster,
            service: None,
            invitees: Vec::new(),
            match_game_id: None,
            expected_players: 0,
            game: None,
            seats: Vec::new(),
            store,
            outbox: Outbox::new(),
            status: StatusNotifier::new(),
            companion: CompanionChannel::new(),
            view,
            events,
        };
        (coordinator, events_rx)
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn game(&self) -> Option<&GameState> {
        self.game.as_ref()
    }

    pub fn seats(&self) -> &[SelectedPlayer] {
        &self.seats
    }

    pub fn expected_players(&self) -> usize {
        self.expected_players
    }

    pub fn subscribe_view(&self) -> watch::Receiver<SessionView> {
        self.view.subscribe()
    }

    pub fn subscribe_companion(&self) -> watch::Receiver<CompanionState> {
        self.companion.subscribe()
    }

    // ── Host operations ─────────────────────────────────────────────────

    /// Pick how players will connect. Online play goes on to player
    /// selection; nearby and loopback open their service straight away.
    pub fn choose_mode(&mut self, mode: ConnectionMode) -> Result<(), SessionError> {
        self.expect_phase("choose a connection mode", &[Phase::Idle])?;
        if mode == ConnectionMode::Unknown {
            return Err(SessionError::NoConnectionMode);
        }
        self.state.connection_mode = mode;
        if mode == ConnectionMode::Online {
            self.set_phase(Phase::SelectingPlayers);
            return Ok(());
        }
        self.set_phase(Phase::Previewing);
        self.set_connection_mode(mode)
    }

    /// Confirm the players to invite to an online game and send the invites.
    pub fn select_players(&mut self, invitees: Vec<PeerIdentity>) -> Result<(), SessionError> {
        self.expect_phase("select players", &[Phase::SelectingPlayers])?;
        if invitees.is_empty() {
            return Err(SessionError::NoInvitees);
        }

        self.roster.clear_guests();
        for invitee in &invitees {
            if invitee.email.eq_ignore_ascii_case(&self.identity.email) {
                continue;
            }
            self.roster.add_or_update(
                PlayerUpdate::new(invitee.email.as_str(), invitee.name.as_str())
                    .invite_status(InviteStatus::Invited),
            )?;
        }
        self.invitees = invitees;
        self.match_game_id = Some(Uuid::new_v4().to_string());
        self.set_phase(Phase::Previewing);
        self.set_connection_mode(ConnectionMode::Online)
    }

    /// Start (or switch to) the service for `mode` and begin admitting players.
    pub fn set_connection_mode(&mut self, mode: ConnectionMode) -> Result<(), SessionError> {
        self.expect_phase("open a connection", &[Phase::Previewing, Phase::Admitting])?;
        if mode == ConnectionMode::Unknown {
            return Err(SessionError::NoConnectionMode);
        }
        if self.service.as_ref().is_some_and(|s| s.mode() == mode) {
            log::debug!("{mode} service already active");
            return Ok(());
        }
        if self.service.is_some() {
            // Connections made through the old service mean nothing to the new one.
            drop(self.stop_service());
            self.detach_guests();
        }

        self.state.connection_mode = mode;
        if mode == ConnectionMode::Loopback && !self.state.recovery_mode {
            self.expected_players = self.loopback_players;
        }
        let Some(mut service) = self.transports.build(mode, self.transport_events.clone()) else {
            return Err(SessionError::NoConnectionMode);
        };
        self.state.service_state = if mode == ConnectionMode::Online {
            ServiceState::Inviting
        } else {
            ServiceState::Starting
        };
        let invite_list = (mode == ConnectionMode::Online).then(|| self.invitees.clone());
        service.start(StartRequest {
            identity: self.identity.clone(),
            invite_list,
            recovery_mode: self.state.recovery_mode,
            match_game_id: self.match_game_id.clone(),
        });
        self.service = Some(service);
        log::info!("Opening {mode} session");

        self.set_phase(Phase::Admitting);
        self.roster_changed();
        Ok(())
    }

    /// Deal and play. In recovery this resumes the saved game instead.
    pub fn start_game(&mut self) -> Result<(), SessionError> {
        self.expect_phase("start the game", &[Phase::Admitting])?;
        if !self.state.can_start_game {
            return Err(SessionError::NotReady);
        }

        if self.state.recovery_mode {
            self.state.recovery_mode = false;
            self.status.reset();
            log::info!("Resuming recovered game");
        } else {
            self.begin_new_game();
        }
        self.state.can_start_game = false;
        self.state.game_in_progress = true;

        let finished = self.game.as_ref().is_some_and(|g| g.complete);
        if finished {
            self.finish_game();
        } else {
            if let Some(game) = self.game.as_mut() {
                if game.deal.is_none() {
                    game.deal()?;
                }
            }
            self.save_snapshot();
            self.set_phase(Phase::Playing);
        }

        // Every remote starts from a clean slate.
        self.outbox.clear();
        self.broadcast_refresh();
        self.publish();
        Ok(())
    }

    fn begin_new_game(&mut self) {
        let mut seats = Vec::new();
        for record in self.roster.players().iter().filter(|p| p.is_connected()) {
            let player_uuid = record.profile.map_or_else(Uuid::new_v4, |p| p.0);
            seats.push(SelectedPlayer {
                player_uuid,
                email: record.email.clone(),
                name: record.display_name.clone(),
            });
        }
        for seat in &seats {
            if let Err(e) = self.roster.add_or_update(
                PlayerUpdate::new(seat.email.as_str(), "").profile(ProfileRef(seat.player_uuid)),
            ) {
                log::warn!("Could not record profile for {}: {e}", seat.email);
            }
        }
        let game = GameState::new(Uuid::new_v4(), seats.len(), self.plan.clone());
        log::info!(
            "Starting game {} with {} players in {} mode",
            game.game_uuid,
            seats.len(),
            self.state.connection_mode
        );
        self.expected_players = seats.len();
        self.seats = seats;
        self.game = Some(game);
    }

    /// Record a bid for `player` (a seat number).
    pub fn bid(&mut self, player: usize, bid: u8) -> Result<(), SessionError> {
        self.expect_phase("bid", &[Phase::Playing])?;
        let game = self.game.as_mut().ok_or(SessionError::InvalidPhase {
            operation: "bid",
            phase: self.phase,
        })?;
        game.bid(player, bid)?;
        log::info!("Seat {player} bids {bid}");

        self.save_snapshot();
        self.broadcast_event(DataMessage::Bid { player, bid });
        self.broadcast_game();
        self.publish();
        Ok(())
    }

    /// Lay `card` for `player` (a seat number). A finished hand is scored
    /// and the next one dealt, or the game moves to its summary.
    pub fn play_card(&mut self, player: usize, card: Card) -> Result<PlayOutcome, SessionError> {
        self.expect_phase("play a card", &[Phase::Playing])?;
        let game = self.game.as_mut().ok_or(SessionError::InvalidPhase {
            operation: "play a card",
            phase: self.phase,
        })?;
        let outcome = game.play(player, card)?;
        log::debug!("Seat {player} plays {card}");

        self.save_snapshot();
        self.broadcast_event(DataMessage::Played {
            player,
            card: card.index(),
        });

        if let PlayOutcome::HandComplete { .. } = outcome {
            self.complete_hand()?;
        } else {
            self.broadcast_game();
        }
        self.publish();
        Ok(outcome)
    }

    fn complete_hand(&mut self) -> Result<(), SessionError> {
        let Some(game) = self.game.as_mut() else {
            return Ok(());
        };
        match game.advance_round()? {
            RoundAdvance::NextRound => {
                game.deal()?;
                log::info!("Round {} dealt", game.round.round + 1);
                self.save_snapshot();
                self.broadcast_game();
            }
            RoundAdvance::GameComplete => self.finish_game(),
        }
        Ok(())
    }

    fn finish_game(&mut self) {
        log::info!("Game complete");
        self.state.game_in_progress = false;
        if let Err(e) = self.store.clear() {
            log::warn!("Could not clear recovery snapshot: {e}");
        }
        self.set_phase(Phase::Summarizing);
        self.broadcast_game();
    }

    /// Leave the summary: play again with the same players, or end the session.
    pub fn finish_summary(
        &mut self,
        choice: SummaryChoice,
    ) -> Result<Option<oneshot::Receiver<()>>, SessionError> {
        self.expect_phase("leave the summary", &[Phase::Summarizing])?;
        match choice {
            SummaryChoice::Exit => Ok(Some(self.exit())),
            SummaryChoice::NewGame => {
                self.game = None;
                self.seats.clear();
                self.state.game_in_progress = false;
                self.set_phase(Phase::Admitting);
                self.roster_changed();
                Ok(None)
            }
        }
    }

    /// Remove a player by 1-based number. The host is player 1.
    pub fn remove_player(&mut self, player_number: usize) -> Result<PlayerRecord, SessionError> {
        self.expect_phase(
            "remove a player",
            &[Phase::SelectingPlayers, Phase::Previewing, Phase::Admitting],
        )?;
        let record = self.roster.remove(player_number)?;
        log::info!("Removed {} from the session", record.email);
        if let Some(peer) = record.peer_id() {
            if let Some(service) = self.service.as_mut() {
                service.disconnect(peer, Some(REMOVED_BY_HOST.into()));
            }
        }
        self.invitees.retain(|i| !i.email.eq_ignore_ascii_case(&record.email));
        self.outbox.forget(&record.email);
        self.roster_changed();
        Ok(record)
    }

    /// End the session from any phase. The receiver fires once the service
    /// has fully stopped.
    pub fn exit(&mut self) -> oneshot::Receiver<()> {
        log::info!("Leaving session");
        let stopped = self.stop_service();
        if let Err(e) = self.store.clear() {
            log::warn!("Could not clear recovery snapshot: {e}");
        }
        self.reset_session();
        self.set_phase(Phase::Idle);
        self.publish();
        stopped
    }

    /// Resume an interrupted game from `snapshot`.
    pub fn recover(&mut self, snapshot: RecoverySnapshot) -> Result<(), SessionError> {
        self.expect_phase("recover a game", &[Phase::Idle])?;
        if snapshot.connection_mode == ConnectionMode::Unknown {
            return Err(SessionError::NothingToRecover);
        }
        let (game, advanced) = recovery::resume_game(&snapshot).map_err(|e| {
            log::warn!("Cannot recover game {}: {e}", snapshot.game_uuid);
            SessionError::NothingToRecover
        })?;
        log::info!(
            "Recovering game {} ({} mode, round {})",
            snapshot.game_uuid,
            snapshot.connection_mode,
            game.round.round + 1
        );

        self.roster.clear_guests();
        for seat in &snapshot.selected_players {
            let mut update = PlayerUpdate::new(seat.email.as_str(), seat.name.as_str())
                .profile(ProfileRef(seat.player_uuid));
            if snapshot.connection_mode == ConnectionMode::Online {
                update = update.invite_status(InviteStatus::Invited);
            }
            if seat.email.eq_ignore_ascii_case(&self.identity.email) {
                update = PlayerUpdate::new(seat.email.as_str(), "")
                    .profile(ProfileRef(seat.player_uuid));
            }
            self.roster.add_or_update(update)?;
        }
        self.invitees = snapshot
            .selected_players
            .iter()
            .filter(|s| !s.email.eq_ignore_ascii_case(&self.identity.email))
            .map(|s| PeerIdentity {
                device_id: String::new(),
                email: s.email.clone(),
                name: s.name.clone(),
            })
            .collect();

        self.match_game_id = snapshot.match_game_id.clone();
        self.expected_players = snapshot.expected_players;
        self.seats = snapshot.selected_players.clone();
        self.game = Some(game);
        self.state.recovery_mode = true;
        self.state.game_in_progress = true;
        self.state.connection_mode = snapshot.connection_mode;
        self.outbox.clear();
        if advanced {
            self.save_snapshot();
        }

        self.set_phase(Phase::Previewing);
        self.set_connection_mode(snapshot.connection_mode)
    }

    /// Recover from the store if it holds a snapshot. Returns whether a game
    /// was recovered. A corrupt snapshot is discarded.
    pub fn resume_from_store(&mut self) -> Result<bool, SessionError> {
        let snapshot = match self.store.load() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Ok(false),
            Err(StoreError::Corrupt) => {
                log::warn!("Discarding corrupt recovery snapshot");
                self.store.clear()?;
                return Err(StoreError::Corrupt.into());
            }
            Err(e) => return Err(e.into()),
        };
        match self.recover(snapshot) {
            Ok(()) => Ok(true),
            Err(SessionError::NothingToRecover) => {
                log::warn!("Discarding unusable recovery snapshot");
                self.store.clear()?;
                Err(SessionError::NothingToRecover)
            }
            Err(e) => Err(e),
        }
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn expect_phase(&self, operation: &'static str, allowed: &[Phase]) -> Result<(), SessionError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(SessionError::InvalidPhase {
                operation,
                phase: self.phase,
            })
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase == phase {
            return;
        }
        log::info!("Session phase {:?} -> {phase:?}", self.phase);
        self.phase = phase;
        self.emit(SessionEvent::PhaseChanged(phase));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn stop_service(&mut self) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel();
        match self.service.take() {
            Some(mut service) => {
                log::info!("Stopping {} service", service.mode());
                service.stop(done_tx);
                self.state.service_state = ServiceState::Stopped;
            }
            None => {
                let _ = done_tx.send(());
            }
        }
        done_rx
    }

    /// Cut guests loose from a service that is going away. Recovered seats
    /// and invitees stay on the roster to reconnect; anyone else has to join
    /// again.
    fn detach_guests(&mut self) {
        let keep_everyone = self.state.recovery_mode;
        self.roster.detach_guests(keep_everyone);
        self.outbox.clear();
    }

    fn reset_session(&mut self) {
        self.roster.clear_guests();
        self.invitees.clear();
        self.match_game_id = None;
        self.expected_players = 0;
        self.game = None;
        self.seats.clear();
        self.outbox.clear();
        self.status.reset();
        self.state = SessionState {
            service_state: self.state.service_state,
            ..SessionState::default()
        };
    }

    fn save_snapshot(&mut self) {
        let Some(game) = self.game.as_ref() else {
            return;
        };
        let snapshot = RecoverySnapshot::capture(
            game,
            self.state.connection_mode,
            self.match_game_id.clone(),
            self.seats.clone(),
        );
        if let Err(e) = self.store.save(&snapshot) {
            log::error!("Could not save recovery snapshot: {e}");
            self.emit(SessionEvent::Notice(
                "This game could not be saved for recovery".into(),
            ));
        }
    }

    fn seat_of(&self, record: &PlayerRecord) -> Option<usize> {
        recovery::seat_of(&self.seats, record.profile.map(|p| p.0), &record.email)
    }

    /// Recompute admission and push everything that depends on the roster.
    fn roster_changed(&mut self) {
        self.state.can_start_game = self.phase == Phase::Admitting
            && admission::can_start_game(
                self.state.connection_mode,
                self.state.recovery_mode,
                &self.roster,
                self.expected_players,
            );

        if self.phase == Phase::Admitting {
            let update = self.status.update(
                self.state.connection_mode,
                self.state.recovery_mode,
                self.state.can_start_game,
            );
            if let Some(local) = update.local {
                self.state.last_status_message = Some(local.clone());
                self.emit(SessionEvent::Status(local));
            }
            if let Some(remote) = update.remote {
                for index in self.usable_indices() {
                    self.send_to(index, DataMessage::Status { message: remote.clone() }, false);
                }
            }
        }

        let players = self.remote_players();
        for index in self.usable_indices() {
            self.send_to(index, DataMessage::Players(players.clone()), false);
        }
        let visible = self.roster.visible_count();
        if let Some(service) = self.service.as_mut() {
            service.players_changed(visible);
        }
        self.emit(SessionEvent::RosterChanged);
        self.publish();
    }

    fn publish(&mut self) {
        let view = SessionView {
            phase: self.phase,
            state: self.state.clone(),
            players: self.roster.players().to_vec(),
        };
        self.view.send_if_modified(|current| {
            if *current == view {
                return false;
            }
            *current = view;
            true
        });

        let names = if self.game.is_some() {
            self.seats.iter().map(|s| s.name.clone()).collect()
        } else {
            Vec::new()
        };
        self.companion
            .publish(CompanionState::from_game(self.game.as_ref(), names));
    }

    fn usable_indices(&self) -> Vec<usize> {
        self.roster.usable_peers().map(|(index, _)| index).collect()
    }

    fn send_to(&mut self, index: usize, message: DataMessage, force: bool) -> bool {
        let Some(record) = self.roster.get(index) else {
            return false;
        };
        let Some(peer) = record.usable_peer() else {
            return false;
        };
        if !self.outbox.should_send(&record.email, &message, force) {
            return false;
        }
        self.service
            .as_ref()
            .is_some_and(|service| service.send(peer, message))
    }

    /// One-off events (a bid, a card) always go out.
    fn broadcast_event(&mut self, message: DataMessage) {
        for index in self.usable_indices() {
            self.send_to(index, message.clone(), true);
        }
    }

    fn broadcast_game(&mut self) {
        for index in self.usable_indices() {
            self.send_game(index, false);
        }
    }

    fn broadcast_refresh(&mut self) {
        for index in self.usable_indices() {
            self.send_full_refresh(index);
        }
    }

    fn send_game(&mut self, index: usize, force: bool) {
        let seat = self.roster.get(index).and_then(|r| self.seat_of(r));
        if let Some(state) = seat.and_then(|s| self.state_sync(s)) {
            self.send_to(index, DataMessage::State(state), force);
        }
        if let Some(scores) = self.score_sheet() {
            self.send_to(index, DataMessage::Scores(scores), force);
        }
    }

    /// Everything a remote needs to rebuild its view. Callers forget the
    /// recipient in the outbox first; whatever already went out since is
    /// not repeated.
    fn send_full_refresh(&mut self, index: usize) {
        self.send_to(index, DataMessage::Players(self.remote_players()), false);
        if let Some(status) = self.status.remote().map(str::to_owned) {
            if self.phase == Phase::Admitting {
                self.send_to(index, DataMessage::Status { message: status }, false);
            }
        }
        self.send_game(index, false);
    }

    fn remote_players(&self) -> Vec<RemotePlayer> {
        self.roster
            .players()
            .iter()
            .filter(|p| p.is_visible())
            .map(|p| RemotePlayer {
                name: p.display_name.clone(),
                email: p.email.clone(),
                is_host: p.is_host,
                connected: p.is_connected(),
            })
            .collect()
    }

    fn state_sync(&self, seat: usize) -> Option<StateSync> {
        let game = self.game.as_ref()?;
        let deal = game.deal.as_ref()?;
        Some(StateSync {
            game_uuid: game.game_uuid.to_string(),
            round: game.round.round,
            cards: game.cards(),
            dealer: game.round.dealer,
            seat,
            hand: game.hand(seat).iter().map(|c| c.index()).collect(),
            trick: deal.trick.iter().map(|&(p, c)| (p, c.index())).collect(),
            bids: game.round.bids.clone(),
            next_to_bid: game.next_to_bid(),
            next_to_play: game.next_to_play(),
        })
    }

    fn score_sheet(&self) -> Option<ScoreSheet> {
        let game = self.game.as_ref()?;
        let history = &game.round.history;
        if history.is_empty() {
            return None;
        }
        Some(ScoreSheet {
            round: history.len(),
            bids: history.iter().map(|r| r.bids.clone()).collect(),
            made: history.iter().map(|r| r.made.clone()).collect(),
            scores: history.iter().map(|r| r.scores.clone()).collect(),
            totals: game.totals(),
        })
    }

    fn reject(&mut self, peer: &Peer, reason: String) {
        log::info!("Refusing {} <{}>: {reason}", peer.id, peer.identity.email);
        if let Some(service) = self.service.as_mut() {
            service.disconnect(peer.id, Some(reason));
        }
    }

    /// An invitee whose attempt failed before it ever reached the roster.
    fn pending_invitee(&self, peer: &Peer) -> Option<usize> {
        if peer.mode != ConnectionMode::Online || peer.state != PeerState::NotConnected {
            return None;
        }
        let index = self.roster.find_by_email(&peer.identity.email)?;
        let record = self.roster.get(index)?;
        (record.peer.is_none() && record.invite_status == InviteStatus::Invited).then_some(index)
    }

    fn is_current(&self, mode: ConnectionMode) -> bool {
        self.service.as_ref().is_some_and(|s| s.mode() == mode)
    }

    /// A known player came back: adopt the new connection.
    fn readmit(&mut self, index: usize, peer: &Peer) -> bool {
        let mut index = index;
        if let Some(record) = self.roster.get(index) {
            if !record.is_visible() {
                match self.roster.set_disconnect_reason(index, None) {
                    Ok(i) => index = i,
                    Err(_) => {
                        self.reject(peer, GAME_FULL.into());
                        return false;
                    }
                }
            }
        }
        let stale = self.roster.get(index).and_then(|r| r.peer_id());
        if let Some(stale) = stale.filter(|&id| id != peer.id) {
            if let Some(service) = self.service.as_mut() {
                service.disconnect(stale, Some("Replaced by a newer connection".into()));
            }
        }

        self.roster.set_peer(index, Some(peer.clone()));
        let invited = self
            .roster
            .get(index)
            .is_some_and(|r| r.invite_status != InviteStatus::NotInvited);
        if invited {
            self.roster.set_invite_status(index, InviteStatus::Accepted);
        }
        if self.state.game_in_progress || self.state.recovery_mode {
            self.roster.set_refresh_required(index, true);
        }
        log::info!("{} <{}> reconnected", peer.id, peer.identity.email);
        true
    }

    fn admit_new(&mut self, peer: &Peer) -> bool {
        let email = peer.identity.email.as_str();
        if self.state.game_in_progress {
            self.reject(peer, GAME_IN_PROGRESS.into());
            return false;
        }
        if self.roster.is_full() {
            self.reject(peer, GAME_FULL.into());
            return false;
        }
        match self.roster.add_or_update(
            PlayerUpdate::new(email, peer.identity.name.as_str()).peer(peer.clone()),
        ) {
            Ok(_) => {
                log::info!("{} <{email}> joined", peer.id);
                true
            }
            Err(e) => {
                self.reject(peer, e.to_string());
                false
            }
        }
    }

    fn handle_remote_bid(&mut self, seat: usize, player: usize, bid: u8) {
        if seat != player {
            log::warn!("Seat {seat} tried to bid for seat {player}");
            return;
        }
        if let Err(e) = self.bid(player, bid) {
            log::warn!("Rejected bid from seat {seat}: {e}");
        }
    }

    fn handle_remote_play(&mut self, seat: usize, player: usize, card: u8) {
        if seat != player {
            log::warn!("Seat {seat} tried to play for seat {player}");
            return;
        }
        let Some(card) = Card::from_index(card) else {
            log::warn!("Seat {seat} played unknown card {card}");
            return;
        };
        if let Err(e) = self.play_card(player, card) {
            log::warn!("Rejected card from seat {seat}: {e}");
        }
    }
}

// ── Transport callbacks ─────────────────────────────────────────────────────

impl ServiceDelegate for SessionCoordinator {
    fn service_started(&mut self, mode: ConnectionMode) {
        if !self.is_current(mode) {
            log::debug!("Ignoring start of stale {mode} service");
            return;
        }
        self.state.service_state = match mode {
            ConnectionMode::Online => ServiceState::Invited,
            ConnectionMode::Nearby => ServiceState::Advertising,
            _ => ServiceState::Running,
        };
        log::info!("{mode} service ready ({:?})", self.state.service_state);
        self.roster_changed();
    }

    fn service_failed(&mut self, mode: ConnectionMode, error: &str) {
        if !self.is_current(mode) {
            log::debug!("Ignoring failure of stale {mode} service: {error}");
            return;
        }
        let headline = match self.state.service_state {
            ServiceState::Inviting | ServiceState::Invited => "Invitation failed",
            _ => "Connection failed",
        };
        log::warn!("{headline}: {error}");
        self.emit(SessionEvent::Notice(format!("{headline}: {error}")));

        // A recovery snapshot stays in the store, so the attempt can be retried.
        drop(self.stop_service());
        self.reset_session();
        self.set_phase(Phase::Idle);
        self.roster_changed();
    }

    fn connection_received(&mut self, peer: &Peer, info: &ConnectionInfo) -> bool {
        if !self.is_current(peer.mode) {
            log::debug!("Ignoring {} from stale {} service", peer.id, peer.mode);
            return false;
        }
        let email = peer.identity.email.as_str();
        let online = peer.mode == ConnectionMode::Online;

        let accepted = match self.roster.find_by_email(email) {
            Some(index) => {
                let record = &self.roster.players()[index];
                let duplicate = record.is_host
                    || record.peer.as_ref().is_some_and(|p| {
                        p.state != PeerState::NotConnected
                            && p.identity.device_id != peer.identity.device_id
                    });
                if duplicate {
                    self.reject(peer, already_joined(email));
                    false
                } else if online && info.match_game_id != self.match_game_id {
                    self.reject(peer, not_invited(email));
                    false
                } else {
                    self.readmit(index, peer)
                }
            }
            None if online => {
                self.reject(peer, not_invited(email));
                false
            }
            None => self.admit_new(peer),
        };
        if accepted {
            self.outbox.forget(email);
        }

        if accepted {
            self.roster_changed();
            if let Some(index) = self.roster.find_by_peer(peer.id) {
                self.send_full_refresh(index);
            }
        }
        accepted
    }

    fn state_changed(&mut self, peer: &Peer, reason: Option<&str>) {
        if !self.is_current(peer.mode) {
            log::debug!("Ignoring {} state from stale {} service", peer.id, peer.mode);
            return;
        }
        let Some(index) = self
            .roster
            .find_by_peer(peer.id)
            .or_else(|| self.pending_invitee(peer))
        else {
            return;
        };
        let was_connected = self
            .roster
            .get(index)
            .and_then(|r| r.peer.as_ref())
            .is_some_and(|p| p.state == PeerState::Connected);
        self.roster.set_peer(index, Some(peer.clone()));
        let reason = reason.unwrap_or("disconnected");
        log::info!("{} <{}> is now {:?} ({reason})", peer.id, peer.identity.email, peer.state);

        match peer.state {
            PeerState::NotConnected => {
                self.outbox.forget(&peer.identity.email);
                let in_game = self.state.game_in_progress || self.state.recovery_mode;
                let invite = self.roster.get(index).map(|r| r.invite_status);
                if peer.mode == ConnectionMode::Nearby && !in_game {
                    if let Err(e) = self.roster.remove(index + 1) {
                        log::warn!("Could not remove {}: {e}", peer.identity.email);
                    }
                } else if peer.mode == ConnectionMode::Online
                    && invite == Some(InviteStatus::Invited)
                {
                    self.roster.set_invite_status(index, InviteStatus::Declined);
                    let parked = format!("{DID_NOT_JOIN}: {reason}");
                    if let Err(e) = self.roster.set_disconnect_reason(index, Some(parked)) {
                        log::warn!("Could not park {}: {e}", peer.identity.email);
                    }
                }
            }
            PeerState::Connected if !was_connected && self.state.game_in_progress => {
                self.roster.set_refresh_required(index, true);
            }
            _ => {}
        }
        self.roster_changed();
    }

    fn data_received(&mut self, message: DataMessage, peer: PeerId) -> bool {
        let Some(index) = self.roster.find_by_peer(peer) else {
            return false;
        };
        let Some(record) = self.roster.get(index) else {
            return false;
        };
        if !record.peer.as_ref().is_some_and(|p| self.is_current(p.mode)) {
            log::debug!("Ignoring {} from {peer} on a stale service", message.descriptor());
            return false;
        }
        let seat = self.seat_of(record);
        let refresh_required = record.refresh_required;
        let email = record.email.clone();

        if let DataMessage::RefreshRequest = message {
            log::info!("{peer} asked for a refresh");
            self.outbox.forget(&email);
            self.roster.set_refresh_required(index, false);
            self.roster_changed();
            self.send_full_refresh(index);
            return true;
        }
        if refresh_required {
            log::debug!("Ignoring {} from {peer} until it refreshes", message.descriptor());
            return false;
        }

        match (message, seat) {
            (DataMessage::Bid { player, bid }, Some(seat)) => {
                self.handle_remote_bid(seat, player, bid);
                true
            }
            (DataMessage::Played { player, card }, Some(seat)) => {
                self.handle_remote_play(seat, player, card);
                true
            }
            (_, _) => false,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::messages::Message;
    use crate::recovery::MemoryStore;
    use crate::status::{READY, WAITING_FOR_HOST, WAITING_TO_CONNECT, WAITING_TO_RECONNECT};
    use crate::network::tcp::next_peer_id;
    use crate::transport::{dispatch, EventReceiver, LoopbackRemote, TransportEvent};

    struct Harness {
        coordinator: SessionCoordinator,
        transport_rx: EventReceiver,
        session_rx: mpsc::UnboundedReceiver<SessionEvent>,
        hub: LoopbackHub,
        store: MemoryStore,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(HostConfig {
                round_plan: RoundPlan {
                    start_cards: 2,
                    end_cards: 1,
                    bounce: false,
                },
                ..HostConfig::default()
            })
        }

        fn with_config(config: HostConfig) -> Self {
            let (transport_tx, transport_rx) = mpsc::unbounded_channel();
            let transports = Transports::from_config(&config);
            let hub = transports.loopback.clone();
            let store = MemoryStore::new();
            let (coordinator, session_rx) = SessionCoordinator::new(
                &config,
                identity("host@example.com", "host-device"),
                transports,
                Box::new(store.clone()),
                transport_tx,
            );
            Self {
                coordinator,
                transport_rx,
                session_rx,
                hub,
                store,
            }
        }

        /// Deliver every queued transport event, as the host task would.
        fn pump(&mut self) {
            while let Ok(event) = self.transport_rx.try_recv() {
                dispatch(&mut self.coordinator, event);
            }
        }

        fn join(&mut self, email: &str, device: &str) -> LoopbackRemote {
            let remote = self
                .hub
                .connect(identity(email, device), self.coordinator.match_game_id.clone())
                .unwrap();
            self.pump();
            remote
        }

        fn session_events(&mut self) -> Vec<SessionEvent> {
            std::iter::from_fn(|| self.session_rx.try_recv().ok()).collect()
        }

        fn loopback_session(&mut self) -> (LoopbackRemote, LoopbackRemote) {
            self.coordinator.choose_mode(ConnectionMode::Loopback).unwrap();
            self.pump();
            let p1 = self.join("p1@example.com", "d1");
            let p2 = self.join("p2@example.com", "d2");
            (p1, p2)
        }
    }

    fn identity(email: &str, device: &str) -> PeerIdentity {
        PeerIdentity {
            device_id: device.into(),
            email: email.into(),
            name: email.split('@').next().unwrap_or_default().into(),
        }
    }

    /// A connection as a TCP-backed service would report it.
    fn remote_peer(mode: ConnectionMode, email: &str, device: &str) -> Peer {
        Peer {
            id: next_peer_id(),
            identity: identity(email, device),
            state: PeerState::Connected,
            mode,
        }
    }

    /// TCP-backed services spawn their listener; nothing here drives it.
    fn idle_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    fn goodbye_reason(remote: &LoopbackRemote) -> Option<String> {
        remote.drain().into_iter().find_map(|m| match m {
            Message::Goodbye { reason } => reason,
            _ => None,
        })
    }

    fn statuses(remote: &LoopbackRemote) -> Vec<String> {
        remote
            .drain()
            .into_iter()
            .filter_map(|m| match m {
                Message::Data(DataMessage::Status { message }) => Some(message),
                _ => None,
            })
            .collect()
    }

    fn play_out_hand(h: &mut Harness) {
        loop {
            let game = h.coordinator.game().unwrap();
            if let Some(seat) = game.next_to_bid() {
                // Zero is only refused when the dealer would make the bids add up.
                if h.coordinator.bid(seat, 0).is_err() {
                    h.coordinator.bid(seat, 1).unwrap();
                }
                continue;
            }
            let Some(seat) = game.next_to_play() else {
                return;
            };
            let card = game.legal_cards(seat)[0];
            let outcome = h.coordinator.play_card(seat, card).unwrap();
            if let PlayOutcome::HandComplete { .. } = outcome {
                return;
            }
        }
    }

    // ── Mode selection & admission ──────────────────────────────────────

    #[test]
    fn test_loopback_admission_needs_expected_players() {
        let mut h = Harness::new();
        h.coordinator.choose_mode(ConnectionMode::Loopback).unwrap();
        h.pump();
        assert_eq!(h.coordinator.phase(), Phase::Admitting);
        assert_eq!(h.coordinator.state().service_state, ServiceState::Running);
        assert_eq!(h.coordinator.expected_players(), 3);

        h.join("p1@example.com", "d1");
        assert!(!h.coordinator.state().can_start_game);
        assert!(matches!(h.coordinator.start_game(), Err(SessionError::NotReady)));

        h.join("p2@example.com", "d2");
        assert!(h.coordinator.state().can_start_game);
        assert_eq!(h.coordinator.state().last_status_message.as_deref(), Some(READY));
    }

    #[test]
    fn test_operations_check_phase() {
        let mut h = Harness::new();
        assert!(matches!(
            h.coordinator.start_game(),
            Err(SessionError::InvalidPhase { phase: Phase::Idle, .. })
        ));
        assert!(matches!(
            h.coordinator.choose_mode(ConnectionMode::Unknown),
            Err(SessionError::NoConnectionMode)
        ));
        h.coordinator.choose_mode(ConnectionMode::Online).unwrap();
        assert_eq!(h.coordinator.phase(), Phase::SelectingPlayers);
        assert!(matches!(h.coordinator.select_players(Vec::new()), Err(SessionError::NoInvitees)));
    }

    #[test]
    fn test_join_adds_player_and_sends_player_list() {
        let mut h = Harness::new();
        let (p1, _p2) = h.loopback_session();
        assert_eq!(h.coordinator.roster().len(), 3);

        let received = p1.drain();
        assert!(received
            .iter()
            .any(|m| matches!(m, Message::Data(DataMessage::Players(list)) if !list.is_empty())));
        let events = h.session_events();
        assert!(events.contains(&SessionEvent::PhaseChanged(Phase::Admitting)));
        assert!(events.contains(&SessionEvent::Status(WAITING_TO_CONNECT.into())));
    }

    #[test]
    fn test_status_sent_once_per_change() {
        let mut h = Harness::new();
        h.coordinator.choose_mode(ConnectionMode::Loopback).unwrap();
        h.pump();
        let p1 = h.join("p1@example.com", "d1");
        assert_eq!(statuses(&p1), vec![WAITING_TO_CONNECT.to_string()]);

        // A roster change that leaves the status alone sends nothing new.
        p1.set_state(PeerState::Reconnecting);
        p1.set_state(PeerState::Connected);
        h.pump();
        assert!(statuses(&p1).is_empty());

        let p2 = h.join("p2@example.com", "d2");
        assert_eq!(statuses(&p1), vec![WAITING_FOR_HOST.to_string()]);
        assert_eq!(statuses(&p2), vec![WAITING_FOR_HOST.to_string()]);

        // A refresh request resends the current status exactly once.
        p1.send(DataMessage::RefreshRequest);
        h.pump();
        assert_eq!(statuses(&p1), vec![WAITING_FOR_HOST.to_string()]);
        assert!(statuses(&p2).is_empty());
    }

    #[test]
    fn test_mode_switch_drops_players_of_old_service() {
        let mut h = Harness::new();
        let (p1, p2) = h.loopback_session();
        assert!(h.coordinator.state().can_start_game);

        let runtime = idle_runtime();
        let _guard = runtime.enter();
        h.coordinator.set_connection_mode(ConnectionMode::Online).unwrap();

        assert_eq!(h.coordinator.state().connection_mode, ConnectionMode::Online);
        assert_eq!(h.coordinator.roster().len(), 1);
        assert_eq!(h.coordinator.roster().connected_count(), 1);
        assert!(!h.coordinator.state().can_start_game);
        assert!(matches!(h.coordinator.start_game(), Err(SessionError::NotReady)));
        assert!(!p1.is_connected());
        assert!(!p2.is_connected());

        // Late news from the loopback service changes nothing.
        let old = Peer {
            id: p1.id(),
            identity: identity("p1@example.com", "d1"),
            state: PeerState::Connected,
            mode: ConnectionMode::Loopback,
        };
        h.coordinator.state_changed(&old, None);
        assert!(!h.coordinator.data_received(DataMessage::RefreshRequest, p1.id()));
        assert_eq!(h.coordinator.roster().len(), 1);
    }

    // ── Reconnects and rejections ───────────────────────────────────────

    #[test]
    fn test_reconnect_same_device_keeps_single_entry() {
        let mut h = Harness::new();
        let (p1, _p2) = h.loopback_session();
        let before = h.coordinator.roster().len();

        p1.drop_connection();
        h.pump();
        let again = h.join("p1@example.com", "d1");

        assert_eq!(h.coordinator.roster().len(), before);
        let index = h.coordinator.roster().find_by_email("p1@example.com").unwrap();
        let record = h.coordinator.roster().get(index).unwrap();
        assert_eq!(record.peer_id(), Some(again.id()));
        assert!(again.is_connected());
        assert_eq!(goodbye_reason(&again), None);
    }

    #[test]
    fn test_second_device_rejected_as_already_joined() {
        let mut h = Harness::new();
        let (p1, _p2) = h.loopback_session();

        let intruder = h.join("p1@example.com", "other-device");

        let reason = goodbye_reason(&intruder).unwrap();
        assert!(reason.contains("already joined"), "{reason}");
        assert!(!intruder.is_connected());
        assert!(p1.is_connected());
        assert_eq!(h.coordinator.roster().len(), 3);
    }

    #[test]
    fn test_host_email_cannot_join_as_guest() {
        let mut h = Harness::new();
        h.loopback_session();
        let twin = h.join("HOST@example.com", "d9");
        assert!(goodbye_reason(&twin).unwrap().contains("already joined"));
    }

    #[test]
    fn test_full_session_rejects_newcomer() {
        let mut h = Harness::with_config(HostConfig {
            max_players: 3,
            round_plan: RoundPlan {
                start_cards: 2,
                end_cards: 1,
                bounce: false,
            },
            ..HostConfig::default()
        });
        h.loopback_session();
        let late = h.join("p3@example.com", "d3");
        assert_eq!(goodbye_reason(&late).as_deref(), Some(GAME_FULL));
    }

    #[test]
    fn test_unknown_player_rejected_during_game() {
        let mut h = Harness::new();
        h.loopback_session();
        h.coordinator.start_game().unwrap();
        let late = h.join("p9@example.com", "d9");
        assert_eq!(goodbye_reason(&late).as_deref(), Some(GAME_IN_PROGRESS));
    }

    #[test]
    fn test_refresh_required_until_refresh_request() {
        let mut h = Harness::new();
        let (p1, _p2) = h.loopback_session();
        h.coordinator.start_game().unwrap();
        assert_eq!(h.coordinator.phase(), Phase::Playing);

        p1.drop_connection();
        h.pump();
        let back = h.join("p1@example.com", "d1");
        let index = h.coordinator.roster().find_by_email("p1@example.com").unwrap();
        let record = h.coordinator.roster().get(index).unwrap();
        assert!(record.refresh_required);
        assert!(!record.is_connected());
        back.drain();

        // Nothing goes to a peer that still owes a refresh request.
        h.coordinator.broadcast_game();
        assert!(back.drain().is_empty());

        back.send(DataMessage::RefreshRequest);
        h.pump();
        let record = h.coordinator.roster().get(index).unwrap();
        assert!(!record.refresh_required);
        assert!(record.is_connected());
        let refreshed = back.drain();
        assert!(refreshed
            .iter()
            .any(|m| matches!(m, Message::Data(DataMessage::State(s)) if s.seat == 1)));
    }

    #[test]
    fn test_remote_removal_sends_reason() {
        let mut h = Harness::new();
        let (_p1, p2) = h.loopback_session();
        assert!(matches!(
            h.coordinator.remove_player(1),
            Err(SessionError::Roster(crate::session::roster::RosterError::HostRemoval))
        ));
        let removed = h.coordinator.remove_player(3).unwrap();
        assert_eq!(removed.email, "p2@example.com");
        assert_eq!(goodbye_reason(&p2).as_deref(), Some(REMOVED_BY_HOST));
        assert!(!h.coordinator.state().can_start_game);
    }

    // ── Online ──────────────────────────────────────────────────────────

    #[test]
    fn test_online_without_invitation_sink_fails_back_to_idle() {
        let mut h = Harness::new();
        h.coordinator.choose_mode(ConnectionMode::Online).unwrap();
        // The online listener spawns onto a runtime; the failure itself is
        // delivered straight to the delegate.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        h.coordinator
            .select_players(vec![identity("p1@example.com", ""), identity("p2@example.com", "")])
            .unwrap();
        assert_eq!(h.coordinator.state().service_state, ServiceState::Inviting);
        assert_eq!(h.coordinator.roster().len(), 3);

        h.coordinator.service_failed(ConnectionMode::Online, "no invitation channel is configured");

        assert_eq!(h.coordinator.phase(), Phase::Idle);
        assert_eq!(h.coordinator.state().connection_mode, ConnectionMode::Unknown);
        let notices: Vec<String> = h
            .session_events()
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Notice(n) => Some(n),
                _ => None,
            })
            .collect();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].starts_with("Invitation failed"));
    }

    fn online_harness(runtime: &tokio::runtime::Runtime) -> Harness {
        let mut h = Harness::new();
        let _guard = runtime.enter();
        h.coordinator.choose_mode(ConnectionMode::Online).unwrap();
        h.coordinator
            .select_players(vec![identity("p1@example.com", ""), identity("p2@example.com", "")])
            .unwrap();
        h
    }

    #[test]
    fn test_online_peer_with_wrong_match_id_is_not_invited() {
        let runtime = idle_runtime();
        let mut h = online_harness(&runtime);
        let _guard = runtime.enter();

        let stranger = remote_peer(ConnectionMode::Online, "p1@example.com", "d1");
        dispatch(
            &mut h.coordinator,
            TransportEvent::ConnectionReceived {
                peer: stranger,
                info: ConnectionInfo {
                    match_game_id: Some("some-other-game".into()),
                },
            },
        );
        let index = h.coordinator.roster().find_by_email("p1@example.com").unwrap();
        let record = h.coordinator.roster().get(index).unwrap();
        assert!(record.peer.is_none());
        assert_eq!(record.invite_status, InviteStatus::Invited);

        let invitee = remote_peer(ConnectionMode::Online, "p1@example.com", "d1");
        let match_game_id = h.coordinator.match_game_id.clone();
        dispatch(
            &mut h.coordinator,
            TransportEvent::ConnectionReceived {
                peer: invitee.clone(),
                info: ConnectionInfo {
                    match_game_id,
                },
            },
        );
        let record = h.coordinator.roster().get(index).unwrap();
        assert_eq!(record.peer_id(), Some(invitee.id));
        assert_eq!(record.invite_status, InviteStatus::Accepted);
        assert!(record.is_connected());
    }

    #[test]
    fn test_invitee_failing_before_connecting_is_declined() {
        let runtime = idle_runtime();
        let mut h = online_harness(&runtime);
        let _guard = runtime.enter();
        assert_eq!(h.coordinator.roster().find_by_email("p1@example.com"), Some(1));

        let failed = Peer {
            state: PeerState::NotConnected,
            ..remote_peer(ConnectionMode::Online, "p1@example.com", "d1")
        };
        dispatch(
            &mut h.coordinator,
            TransportEvent::StateChanged {
                peer: failed,
                reason: Some("connection refused".into()),
            },
        );

        let roster = h.coordinator.roster();
        let index = roster.find_by_email("p1@example.com").unwrap();
        assert_eq!(index, roster.len() - 1);
        let record = roster.get(index).unwrap();
        assert_eq!(record.invite_status, InviteStatus::Declined);
        assert_eq!(
            record.disconnect_reason.as_deref(),
            Some("Did not join: connection refused")
        );
        assert!(!h.coordinator.state().can_start_game);
    }

    #[test]
    fn test_nearby_player_leaving_before_start_is_removed() {
        let runtime = idle_runtime();
        let _guard = runtime.enter();
        let mut h = Harness::new();
        h.coordinator.choose_mode(ConnectionMode::Nearby).unwrap();

        let walker = remote_peer(ConnectionMode::Nearby, "p1@example.com", "d1");
        dispatch(
            &mut h.coordinator,
            TransportEvent::ConnectionReceived {
                peer: walker.clone(),
                info: ConnectionInfo::default(),
            },
        );
        assert_eq!(h.coordinator.roster().len(), 2);

        dispatch(
            &mut h.coordinator,
            TransportEvent::StateChanged {
                peer: Peer {
                    state: PeerState::NotConnected,
                    ..walker
                },
                reason: Some("connection closed".into()),
            },
        );
        assert_eq!(h.coordinator.roster().len(), 1);
        assert_eq!(h.coordinator.roster().find_by_email("p1@example.com"), None);
    }

    // ── Game flow ───────────────────────────────────────────────────────

    #[test]
    fn test_remote_bids_only_for_own_seat() {
        let mut h = Harness::new();
        let (p1, _p2) = h.loopback_session();
        h.coordinator.start_game().unwrap();

        // Dealer is seat 0, so seat 1 bids first.
        p1.send(DataMessage::Bid { player: 2, bid: 0 });
        h.pump();
        assert_eq!(h.coordinator.game().unwrap().round.bids[2], None);

        p1.send(DataMessage::Bid { player: 1, bid: 1 });
        h.pump();
        assert_eq!(h.coordinator.game().unwrap().round.bids[1], Some(1));
    }

    #[test]
    fn test_game_runs_to_summary_and_clears_store() {
        let mut h = Harness::new();
        h.loopback_session();
        h.coordinator.start_game().unwrap();
        assert!(h.store.snapshot().is_some());

        play_out_hand(&mut h);
        assert_eq!(h.coordinator.game().unwrap().round.round, 1);
        assert!(h.coordinator.game().unwrap().deal.is_some());

        play_out_hand(&mut h);
        assert_eq!(h.coordinator.phase(), Phase::Summarizing);
        assert!(h.store.snapshot().is_none());
        assert!(!h.coordinator.state().game_in_progress);

        assert!(h.coordinator.finish_summary(SummaryChoice::NewGame).unwrap().is_none());
        assert_eq!(h.coordinator.phase(), Phase::Admitting);
        assert!(h.coordinator.state().can_start_game);
    }

    #[test]
    fn test_exit_stops_service_and_resets() {
        let mut h = Harness::new();
        let (p1, _p2) = h.loopback_session();
        h.coordinator.start_game().unwrap();

        let mut stopped = h.coordinator.exit();
        assert!(stopped.try_recv().is_ok());
        assert_eq!(h.coordinator.phase(), Phase::Idle);
        assert_eq!(h.coordinator.roster().len(), 1);
        assert!(h.store.snapshot().is_none());
        assert!(!p1.is_connected());
    }

    // ── Recovery ────────────────────────────────────────────────────────

    fn finished_hand_snapshot() -> RecoverySnapshot {
        let plan = RoundPlan {
            start_cards: 2,
            end_cards: 1,
            bounce: false,
        };
        let mut game = GameState::new(Uuid::new_v4(), 3, plan);
        game.deal().unwrap();
        let deal = game.deal.as_mut().unwrap();
        for hand in &mut deal.hands {
            hand.clear();
        }
        deal.tricks_won = vec![1, 1, 0];
        game.round.bids = vec![Some(1), Some(0), Some(0)];
        let seats = ["host", "p1", "p2"]
            .iter()
            .map(|n| SelectedPlayer {
                player_uuid: Uuid::new_v4(),
                email: format!("{n}@example.com"),
                name: n.to_string(),
            })
            .collect();
        RecoverySnapshot::capture(&game, ConnectionMode::Loopback, None, seats)
    }

    #[test]
    fn test_recovery_advances_finished_hand() {
        let mut h = Harness::new();
        let snapshot = finished_hand_snapshot();
        let saved_round = snapshot.round_state.round;

        h.coordinator.recover(snapshot).unwrap();
        h.pump();

        let game = h.coordinator.game().unwrap();
        assert_eq!(game.round.round, saved_round + 1);
        assert!(game.deal.is_none());
        assert_eq!(h.coordinator.phase(), Phase::Admitting);
        assert!(h.coordinator.state().recovery_mode);
        assert_eq!(h.coordinator.roster().len(), 3);
        assert_eq!(
            h.coordinator.state().last_status_message.as_deref(),
            Some(WAITING_TO_RECONNECT)
        );
        assert_eq!(h.store.snapshot().unwrap().round_state.round, saved_round + 1);
    }

    #[test]
    fn test_recovered_players_must_refresh_before_admission() {
        let mut h = Harness::new();
        h.coordinator.recover(finished_hand_snapshot()).unwrap();
        h.pump();

        let p1 = h.join("p1@example.com", "d1");
        let p2 = h.join("p2@example.com", "d2");
        assert!(!h.coordinator.state().can_start_game);

        p1.send(DataMessage::RefreshRequest);
        p2.send(DataMessage::RefreshRequest);
        h.pump();
        assert!(h.coordinator.state().can_start_game);

        p1.drain();
        h.coordinator.start_game().unwrap();
        assert_eq!(h.coordinator.phase(), Phase::Playing);
        assert!(!h.coordinator.state().recovery_mode);
        let game = h.coordinator.game().unwrap();
        assert_eq!(game.round.round, 1);
        assert!(game.deal.is_some());

        // Forced full refresh: players, state and scores all resent.
        let resent: Vec<&'static str> = p1
            .drain()
            .into_iter()
            .filter_map(|m| match m {
                Message::Data(d) => Some(d.descriptor()),
                _ => None,
            })
            .collect();
        assert!(resent.contains(&"players"));
        assert!(resent.contains(&"state"));
        assert!(resent.contains(&"scores"));
    }

    #[test]
    fn test_inconsistent_snapshot_is_refused() {
        let mut h = Harness::new();
        let mut snapshot = finished_hand_snapshot();
        snapshot.round_state.bids.clear();

        assert!(matches!(
            h.coordinator.recover(snapshot.clone()),
            Err(SessionError::NothingToRecover)
        ));
        assert_eq!(h.coordinator.phase(), Phase::Idle);
        assert!(h.coordinator.game().is_none());

        // From the store, the unusable snapshot is discarded.
        let mut store = h.store.clone();
        store.save(&snapshot).unwrap();
        assert!(matches!(
            h.coordinator.resume_from_store(),
            Err(SessionError::NothingToRecover)
        ));
        assert!(h.store.snapshot().is_none());
    }

    #[test]
    fn test_resume_from_store() {
        let mut h = Harness::new();
        assert!(!h.coordinator.resume_from_store().unwrap());

        let mut store = h.store.clone();
        store.save(&finished_hand_snapshot()).unwrap();
        assert!(h.coordinator.resume_from_store().unwrap());
        assert_eq!(h.coordinator.state().connection_mode, ConnectionMode::Loopback);
        assert_eq!(h.coordinator.expected_players(), 3);
    }
}
