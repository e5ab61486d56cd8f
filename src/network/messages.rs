use crate::transport::PeerIdentity;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ── Wire messages ───────────────────────────────────────────────────────────

/// Frames exchanged between the host and a remote device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Message {
    /// First frame from a remote: who it is and which game it thinks it is joining.
    Hello {
        identity: PeerIdentity,
        match_game_id: Option<String>,
    },
    /// Last frame before the host closes a connection.
    Goodbye { reason: Option<String> },
    Heartbeat,
    Data(DataMessage),
}

/// Application-level payloads. Each variant has a stable descriptor string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DataMessage {
    Players(Vec<RemotePlayer>),
    Status { message: String },
    /// Generic state sync; `hand` is the recipient's own cards.
    State(StateSync),
    Scores(ScoreSheet),
    Played { player: usize, card: u8 },
    Bid { player: usize, bid: u8 },
    RefreshRequest,
}

impl DataMessage {
    pub fn descriptor(&self) -> &'static str {
        match self {
            DataMessage::Players(_) => "players",
            DataMessage::Status { .. } => "status",
            DataMessage::State(_) => "state",
            DataMessage::Scores(_) => "scores",
            DataMessage::Played { .. } => "played",
            DataMessage::Bid { .. } => "bid",
            DataMessage::RefreshRequest => "refreshRequest",
        }
    }
}

// ── Supporting structs ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemotePlayer {
    pub name: String,
    pub email: String,
    pub is_host: bool,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSync {
    pub game_uuid: String,
    pub round: usize,
    pub cards: usize,
    pub dealer: usize,
    /// Seat the recipient occupies.
    pub seat: usize,
    pub hand: Vec<u8>,
    pub trick: Vec<(usize, u8)>,
    pub bids: Vec<Option<u8>>,
    pub next_to_bid: Option<usize>,
    pub next_to_play: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreSheet {
    pub round: usize,
    pub bids: Vec<Vec<u8>>,
    pub made: Vec<Vec<u8>>,
    pub scores: Vec<Vec<i32>>,
    pub totals: Vec<i32>,
}

// ── Message framing ─────────────────────────────────────────────────────────
//
// Wire format: [length: u32 LE][bincode payload]

/// Maximum frame size: 1 MB. Session payloads are small; anything larger is garbage.
pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// Errors that can occur during message framing.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[source] bincode::Error),
    #[error("deserialization error: {0}")]
    Deserialize(#[source] bincode::Error),
    #[error("message too large: {0} bytes")]
    MessageTooLarge(u32),
}

/// Serialize `msg` with bincode, write a little-endian u32 length prefix,
/// then the payload bytes.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), FrameError> {
    let payload = bincode::serialize(msg).map_err(FrameError::Serialize)?;
    let len = payload.len() as u32;
    if len > MAX_MESSAGE_SIZE {
        return Err(FrameError::MessageTooLarge(len));
    }
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed message from the stream.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);

    if len > MAX_MESSAGE_SIZE {
        return Err(FrameError::MessageTooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    bincode::deserialize(&payload).map_err(FrameError::Deserialize)
}

// ── Tests ───────────────────────────────────────────────────────────────────
