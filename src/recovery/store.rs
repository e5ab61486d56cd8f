use crate::recovery::RecoverySnapshot;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

const DIGEST_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("could not encode snapshot: {0}")]
    Encode(#[from] bincode::Error),
    #[error("snapshot is corrupt")]
    Corrupt,
}

/// Where the recovery snapshot lives between launches.
pub trait SnapshotStore: Send {
    fn save(&mut self, snapshot: &RecoverySnapshot) -> Result<(), StoreError>;
    fn load(&self) -> Result<Option<RecoverySnapshot>, StoreError>;
    fn clear(&mut self) -> Result<(), StoreError>;
}

// ── MemoryStore ─────────────────────────────────────────────────────────────

/// Keeps the snapshot in memory. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    slot: Arc<Mutex<Option<RecoverySnapshot>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<RecoverySnapshot> {
        self.slot.lock().clone()
    }
}

impl SnapshotStore for MemoryStore {
    fn save(&mut self, snapshot: &RecoverySnapshot) -> Result<(), StoreError> {
        *self.slot.lock() = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<RecoverySnapshot>, StoreError> {
        Ok(self.slot.lock().clone())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        *self.slot.lock() = None;
        Ok(())
    }
}

// ── FileStore ───────────────────────────────────────────────────────────────

/// On-disk snapshot: a SHA-256 digest followed by the bincode payload.
/// Writes go to a sibling temp file that is then renamed over the target,
/// so a crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("tmp")
    }
}

impl SnapshotStore for FileStore {
    fn save(&mut self, snapshot: &RecoverySnapshot) -> Result<(), StoreError> {
        let payload = bincode::serialize(snapshot)?;
        let mut bytes = Vec::with_capacity(DIGEST_LEN + payload.len());
        bytes.extend_from_slice(&compute_sha256(&payload));
        bytes.extend_from_slice(&payload);

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let temp = self.temp_path();
        fs::write(&temp, &bytes)?;
        fs::rename(&temp, &self.path)?;
        log::debug!(
            "Saved recovery snapshot for game {} ({} bytes)",
            snapshot.game_uuid,
            bytes.len()
        );
        Ok(())
    }

    fn load(&self) -> Result<Option<RecoverySnapshot>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.len() < DIGEST_LEN {
            return Err(StoreError::Corrupt);
        }
        let (digest, payload) = bytes.split_at(DIGEST_LEN);
        if compute_sha256(payload) != digest {
            log::warn!("Recovery snapshot at {} failed its checksum", self.path.display());
            return Err(StoreError::Corrupt);
        }
        bincode::deserialize(payload)
            .map(Some)
            .map_err(|_| StoreError::Corrupt)
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub fn compute_sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{GameState, RoundPlan};
    use crate::recovery::SelectedPlayer;
    use crate::transport::ConnectionMode;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn snapshot() -> RecoverySnapshot {
        let mut game = GameState::new(Uuid::new_v4(), 3, RoundPlan::default());
        game.deal().unwrap();
        let players = ["host", "p1", "p2"]
            .iter()
            .map(|n| SelectedPlayer {
                player_uuid: Uuid::new_v4(),
                email: format!("{n}@example.com"),
                name: n.to_string(),
            })
            .collect();
        RecoverySnapshot::capture(&game, ConnectionMode::Nearby, None, players)
    }

    #[test]
    fn test_sha256_known_value() {
        // echo -n "hello" | sha256sum
        let hash = compute_sha256(b"hello");
        assert_eq!(hash[..4], [0x2c, 0xf2, 0x4d, 0xba]);
        assert_eq!(hash[28..], [0x93, 0x8b, 0x98, 0x24]);
    }

    #[test]
    fn test_file_store_save_load_clear() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::new(dir.path().join("recovery").join("game.bin"));
        assert_eq!(store.load().unwrap(), None);

        let saved = snapshot();
        store.save(&saved).unwrap();
        assert_eq!(store.load().unwrap(), Some(saved));
        assert!(!store.temp_path().exists());

        store.clear().unwrap();
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_file_store_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("game.bin");
        let mut store = FileStore::new(&path);
        store.save(&snapshot()).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(store.load(), Err(StoreError::Corrupt)));

        fs::write(&path, b"short").unwrap();
        assert!(matches!(store.load(), Err(StoreError::Corrupt)));
    }

    #[test]
    fn test_memory_store_clones_share_slot() {
        let mut store = MemoryStore::new();
        let observer = store.clone();
        store.save(&snapshot()).unwrap();
        assert!(observer.snapshot().is_some());
        store.clear().unwrap();
        assert!(observer.load().unwrap().is_none());
    }
}
