//! Durable per-collection sync watermarks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

use twinsync_common::{Collection, Error, Result};

/// Which half of a collection's reconciliation a watermark guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    /// Local changes pushed to the remote store.
    Upload,
    /// Remote changes pulled into the local store.
    Download,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Upload, Direction::Download];

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The watermark of a never-synced collection.
pub fn initial_watermark() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Whether `at` is the first-sync value.
pub fn is_initial(at: DateTime<Utc>) -> bool {
    at <= initial_watermark()
}

/// All watermarks, keyed `"<collection>.<direction>"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Watermarks {
    entries: BTreeMap<String, DateTime<Utc>>,
}

impl Watermarks {
    fn key(collection: Collection, direction: Direction) -> String {
        format!("{}.{}", collection, direction)
    }

    /// Watermark for a pair, defaulting to the initial value.
    pub fn get(&self, collection: Collection, direction: Direction) -> DateTime<Utc> {
        self.entries
            .get(&Self::key(collection, direction))
            .copied()
            .unwrap_or_else(initial_watermark)
    }

    pub fn set(&mut self, collection: Collection, direction: Direction, at: DateTime<Utc>) {
        self.entries.insert(Self::key(collection, direction), at);
    }

    /// Every pair with its current value, initial ones included.
    pub fn pairs(&self) -> Vec<(Collection, Direction, DateTime<Utc>)> {
        Collection::ALL
            .iter()
            .flat_map(|c| Direction::ALL.iter().map(move |d| (*c, *d, self.get(*c, *d))))
            .collect()
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Storage for watermarks.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get(&self, collection: Collection, direction: Direction) -> Result<DateTime<Utc>>;

    async fn set(&self, collection: Collection, direction: Direction, at: DateTime<Utc>)
        -> Result<()>;

    async fn all(&self) -> Result<Watermarks>;

    /// Forget everything; the next pass is a first sync.
    async fn reset(&self) -> Result<()>;
}

/// Watermarks held in memory only.
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    marks: RwLock<Watermarks>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn get(&self, collection: Collection, direction: Direction) -> Result<DateTime<Utc>> {
        Ok(self.marks.read().await.get(collection, direction))
    }

    async fn set(
        &self,
        collection: Collection,
        direction: Direction,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.marks.write().await.set(collection, direction, at);
        Ok(())
    }

    async fn all(&self) -> Result<Watermarks> {
        Ok(self.marks.read().await.clone())
    }

    async fn reset(&self) -> Result<()> {
        *self.marks.write().await = Watermarks::default();
        Ok(())
    }
}

/// Watermarks persisted as a JSON document in a state directory.
pub struct FileWatermarkStore {
    path: PathBuf,
    marks: RwLock<Watermarks>,
}

impl FileWatermarkStore {
    const FILE_NAME: &'static str = "watermarks.json";

    /// Open (or create) the store under `state_dir`.
    pub async fn open(state_dir: impl AsRef<Path>) -> Result<Self> {
        let state_dir = state_dir.as_ref();
        fs::create_dir_all(state_dir).await.map_err(Error::Io)?;

        let path = state_dir.join(Self::FILE_NAME);
        let marks = if fs::try_exists(&path).await.map_err(Error::Io)? {
            let content = fs::read_to_string(&path).await.map_err(Error::Io)?;
            Watermarks::from_json(&content)?
        } else {
            Watermarks::default()
        };

        Ok(Self {
            path,
            marks: RwLock::new(marks),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write via a temporary file and rename, so readers never see a torn file.
    async fn persist(&self, marks: &Watermarks) -> Result<()> {
        let json = marks.to_json()?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await.map_err(Error::Io)?;
        fs::rename(&tmp, &self.path).await.map_err(Error::Io)?;
        debug!("Persisted watermarks to {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn get(&self, collection: Collection, direction: Direction) -> Result<DateTime<Utc>> {
        Ok(self.marks.read().await.get(collection, direction))
    }

    async fn set(
        &self,
        collection: Collection,
        direction: Direction,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut marks = self.marks.write().await;
        let mut updated = marks.clone();
        updated.set(collection, direction, at);
        self.persist(&updated).await?;
        *marks = updated;
        Ok(())
    }

    async fn all(&self) -> Result<Watermarks> {
        Ok(self.marks.read().await.clone())
    }

    async fn reset(&self) -> Result<()> {
        let mut marks = self.marks.write().await;
        self.persist(&Watermarks::default()).await?;
        *marks = Watermarks::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_is_initial() {
        let marks = Watermarks::default();
        for (_, _, at) in marks.pairs() {
            assert!(is_initial(at));
        }
        assert_eq!(marks.pairs().len(), 4);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryWatermarkStore::new();
        let now = Utc::now();
        store.set(Collection::Contacts, Direction::Upload, now).await.unwrap();

        assert_eq!(store.get(Collection::Contacts, Direction::Upload).await.unwrap(), now);
        assert!(is_initial(
            store.get(Collection::Contacts, Direction::Download).await.unwrap()
        ));

        store.reset().await.unwrap();
        assert!(is_initial(
            store.get(Collection::Contacts, Direction::Upload).await.unwrap()
        ));
    }

    #[tokio::test]
    async fn test_file_store_persists() {
        let temp = TempDir::new().unwrap();
        let now = Utc::now();

        {
            let store = FileWatermarkStore::open(temp.path()).await.unwrap();
            store.set(Collection::Records, Direction::Download, now).await.unwrap();
        }

        {
            let store = FileWatermarkStore::open(temp.path()).await.unwrap();
            assert_eq!(
                store.get(Collection::Records, Direction::Download).await.unwrap(),
                now
            );
            assert!(store.path().exists());
        }
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_state() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("watermarks.json"), "{ not json").unwrap();
        assert!(matches!(
            FileWatermarkStore::open(temp.path()).await,
            Err(Error::Serialization(_))
        ));
    }
}
