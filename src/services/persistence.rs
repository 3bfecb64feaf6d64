//! Snapshot persistence. Latest snapshot wins; no snapshot history is kept.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SimError};
use crate::models::fleet::FleetSnapshot;
use crate::services::backtest::Backtest;

/// Current snapshot envelope version.
pub const SNAPSHOT_VERSION: u16 = 1;

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Overwrites whatever was stored before.
    async fn save(&self, snapshot: &FleetSnapshot) -> Result<()>;
    async fn load(&self) -> Result<Option<FleetSnapshot>>;
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u16,
    saved_at: DateTime<Utc>,
    snapshot: &'a FleetSnapshot,
}

#[derive(Deserialize)]
struct Envelope {
    version: u16,
    #[allow(dead_code)]
    saved_at: DateTime<Utc>,
    snapshot: FleetSnapshot,
}

/// JSON file on local disk, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn save(&self, snapshot: &FleetSnapshot) -> Result<()> {
        let envelope = EnvelopeRef { version: SNAPSHOT_VERSION, saved_at: Utc::now(), snapshot };
        let bytes = serde_json::to_vec_pretty(&envelope).map_err(unavailable)?;
        write_atomic(&self.path, &self.temp_path(), &bytes).await?;
        debug!(path = %self.path.display(), tick = snapshot.tick, "snapshot saved");
        Ok(())
    }

    async fn load(&self) -> Result<Option<FleetSnapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(unavailable(e)),
        };
        let envelope: Envelope = serde_json::from_slice(&bytes).map_err(unavailable)?;
        if envelope.version != SNAPSHOT_VERSION {
            return Err(SimError::PersistenceUnavailable(format!(
                "unsupported snapshot version {} in {}",
                envelope.version,
                self.path.display()
            )));
        }
        Ok(Some(envelope.snapshot))
    }
}

/// Writes the generated history (records, metrics, financials) as JSON.
pub async fn write_history(path: impl AsRef<Path>, backtest: &Backtest) -> Result<()> {
    let path = path.as_ref();
    let bytes = serde_json::to_vec(backtest).map_err(unavailable)?;
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    write_atomic(path, Path::new(&tmp), &bytes).await
}

async fn write_atomic(path: &Path, tmp: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(unavailable)?;
        }
    }
    tokio::fs::write(tmp, bytes).await.map_err(unavailable)?;
    tokio::fs::rename(tmp, path).await.map_err(unavailable)?;
    Ok(())
}

fn unavailable(e: impl std::fmt::Display) -> SimError {
    SimError::PersistenceUnavailable(e.to_string())
}
