use crate::config::HostConfig;
use crate::error::SessionError;
use crate::game::{Card, PlayOutcome};
use crate::recovery::{FileStore, RecoverySnapshot, SnapshotStore};
use crate::session::coordinator::{
    SessionCoordinator, SessionEvent, SessionView, SummaryChoice, Transports,
};
use crate::session::roster::PlayerRecord;
use crate::status::CompanionState;
use crate::transport::{dispatch, ConnectionMode, EventReceiver, PeerIdentity};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

// ── Commands ────────────────────────────────────────────────────────────────

/// One host operation, carried to the coordination task with its reply slot.
pub enum Command {
    ChooseMode(ConnectionMode, Reply<()>),
    SelectPlayers(Vec<PeerIdentity>, Reply<()>),
    SetConnectionMode(ConnectionMode, Reply<()>),
    StartGame(Reply<()>),
    Bid {
        player: usize,
        bid: u8,
        reply: Reply<()>,
    },
    PlayCard {
        player: usize,
        card: Card,
        reply: Reply<PlayOutcome>,
    },
    FinishSummary(SummaryChoice, Reply<()>),
    RemovePlayer(usize, Reply<PlayerRecord>),
    Recover(Box<RecoverySnapshot>, Reply<()>),
    ResumeFromStore(Reply<bool>),
    /// Answered once the connection service has fully stopped.
    Exit(oneshot::Sender<()>),
}

// ── SessionHandle ───────────────────────────────────────────────────────────

/// Cloneable front end to a running [`SessionHost`].
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<SessionView>,
    companion: watch::Receiver<CompanionState>,
}

impl SessionHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| SessionError::HostStopped)?;
        rx.await.map_err(|_| SessionError::HostStopped)?
    }

    pub async fn choose_mode(&self, mode: ConnectionMode) -> Result<(), SessionError> {
        self.request(|r| Command::ChooseMode(mode, r)).await
    }

    pub async fn select_players(&self, invitees: Vec<PeerIdentity>) -> Result<(), SessionError> {
        self.request(|r| Command::SelectPlayers(invitees, r)).await
    }

    pub async fn set_connection_mode(&self, mode: ConnectionMode) -> Result<(), SessionError> {
        self.request(|r| Command::SetConnectionMode(mode, r)).await
    }

    pub async fn start_game(&self) -> Result<(), SessionError> {
        self.request(Command::StartGame).await
    }

    pub async fn bid(&self, player: usize, bid: u8) -> Result<(), SessionError> {
        self.request(|reply| Command::Bid { player, bid, reply }).await
    }

    pub async fn play_card(&self, player: usize, card: Card) -> Result<PlayOutcome, SessionError> {
        self.request(|reply| Command::PlayCard {
            player,
            card,
            reply,
        })
        .await
    }

    pub async fn finish_summary(&self, choice: SummaryChoice) -> Result<(), SessionError> {
        self.request(|r| Command::FinishSummary(choice, r)).await
    }

    pub async fn remove_player(&self, player_number: usize) -> Result<PlayerRecord, SessionError> {
        self.request(|r| Command::RemovePlayer(player_number, r)).await
    }

    pub async fn recover(&self, snapshot: RecoverySnapshot) -> Result<(), SessionError> {
        self.request(|r| Command::Recover(Box::new(snapshot), r)).await
    }

    pub async fn resume_from_store(&self) -> Result<bool, SessionError> {
        self.request(Command::ResumeFromStore).await
    }

    /// End the session and wait for the transport to wind down.
    pub async fn exit(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Exit(tx))
            .map_err(|_| SessionError::HostStopped)?;
        rx.await.map_err(|_| SessionError::HostStopped)
    }

    pub fn view(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    pub fn companion(&self) -> watch::Receiver<CompanionState> {
        self.companion.clone()
    }
}

// ── SessionHost ─────────────────────────────────────────────────────────────

/// Owns the coordination task. Dropping every [`SessionHandle`] ends the
/// session and the task.
pub struct SessionHost {
    pub handle: SessionHandle,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub task: JoinHandle<()>,
}

impl SessionHost {
    /// Spawn with the on-disk recovery store named by `config`.
    pub fn spawn_from_config(config: &HostConfig, identity: PeerIdentity) -> Self {
        let store = FileStore::new(config.recovery_file.clone());
        Self::spawn(config, identity, Transports::from_config(config), Box::new(store))
    }

    pub fn spawn(
        config: &HostConfig,
        identity: PeerIdentity,
        transports: Transports,
        store: Box<dyn SnapshotStore>,
    ) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (coordinator, events) =
            SessionCoordinator::new(config, identity, transports, store, transport_tx);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let handle = SessionHandle {
            commands: command_tx,
            view: coordinator.subscribe_view(),
            companion: coordinator.subscribe_companion(),
        };
        let task = tokio::spawn(run(coordinator, transport_rx, command_rx));
        log::info!("Session host started");

        Self {
            handle,
            events,
            task,
        }
    }
}

async fn run(
    mut coordinator: SessionCoordinator,
    mut transport_rx: EventReceiver,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
) {
    loop {
        tokio::select! {
            Some(event) = transport_rx.recv() => dispatch(&mut coordinator, event),
            command = command_rx.recv() => match command {
                Some(command) => handle_command(&mut coordinator, command),
                None => break,
            },
        }
    }

    log::info!("All session handles dropped; shutting down");
    let _ = coordinator.exit().await;
}

fn handle_command(coordinator: &mut SessionCoordinator, command: Command) {
    match command {
        Command::ChooseMode(mode, reply) => {
            let _ = reply.send(coordinator.choose_mode(mode));
        }
        Command::SelectPlayers(invitees, reply) => {
            let _ = reply.send(coordinator.select_players(invitees));
        }
        Command::SetConnectionMode(mode, reply) => {
            let _ = reply.send(coordinator.set_connection_mode(mode));
        }
        Command::StartGame(reply) => {
            let _ = reply.send(coordinator.start_game());
        }
        Command::Bid { player, bid, reply } => {
            let _ = reply.send(coordinator.bid(player, bid));
        }
        Command::PlayCard {
            player,
            card,
            reply,
        } => {
            let _ = reply.send(coordinator.play_card(player, card));
        }
        Command::FinishSummary(choice, reply) => match coordinator.finish_summary(choice) {
            Ok(Some(stopped)) => {
                tokio::spawn(async move {
                    let _ = stopped.await;
                    let _ = reply.send(Ok(()));
                });
            }
            Ok(None) => {
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        },
        Command::RemovePlayer(number, reply) => {
            let _ = reply.send(coordinator.remove_player(number));
        }
        Command::Recover(snapshot, reply) => {
            let _ = reply.send(coordinator.recover(*snapshot));
        }
        Command::ResumeFromStore(reply) => {
            let _ = reply.send(coordinator.resume_from_store());
        }
        Command::Exit(reply) => {
            let stopped = coordinator.exit();
            // Keep serving while the transport winds down.
            tokio::spawn(async move {
                let _ = stopped.await;
                let _ = reply.send(());
            });
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
