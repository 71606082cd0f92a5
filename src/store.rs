//! Durable local storage for voice packages and the phrase history.
//!
//! Raw package bytes live in the `voices` tree keyed by voice name; a small
//! JSON metadata record (save time, size) lives under the same key in
//! `voice_meta`. Both are written in one transaction so a package never
//! exists without its metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::TransactionError;
use sled::Transactional;
use std::path::Path;

use crate::error::StoreError;

const PACKAGES_TREE: &str = "voices";
const META_TREE: &str = "voice_meta";
const STATE_TREE: &str = "state";
const HISTORY_KEY: &str = "phrase_history";

/// One stored voice package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoicePackage {
    pub name: String,
    pub raw_bytes: Vec<u8>,
    pub saved_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct PackageMeta {
    saved_at_millis: i64,
    size: u64,
}

/// Persistence used by the lifecycle controller.
///
/// Every failure surfaces as a [`StoreError`]; callers treat them as
/// non-fatal and continue without persistence.
pub trait LocalStore: Send + Sync {
    /// Persists `bytes` under `name`, replacing any earlier package.
    fn save(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError>;

    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.load_record(name)?.map(|p| p.raw_bytes))
    }

    fn load_record(&self, name: &str) -> Result<Option<VoicePackage>, StoreError>;

    /// All stored voice names. Order is unspecified.
    fn list_names(&self) -> Result<Vec<String>, StoreError>;

    /// Removes `name`. Deleting an absent name is not an error.
    fn delete(&self, name: &str) -> Result<(), StoreError>;

    /// The most recently saved package, used to pick the startup voice.
    fn latest(&self) -> Result<Option<String>, StoreError>;

    fn load_history(&self) -> Result<Vec<String>, StoreError>;

    fn save_history(&self, entries: &[String]) -> Result<(), StoreError>;
}

pub struct SledStore {
    db: sled::Db,
    packages: sled::Tree,
    meta: sled::Tree,
    state: sled::Tree,
}

impl SledStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// An in-memory store that is discarded on drop.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            packages: db.open_tree(PACKAGES_TREE)?,
            meta: db.open_tree(META_TREE)?,
            state: db.open_tree(STATE_TREE)?,
            db,
        })
    }

    fn read_meta(&self, name: &str) -> Result<Option<PackageMeta>, StoreError> {
        match self.meta.get(name.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Best-effort request for durable storage. Failure only degrades
    /// durability, so it is logged and swallowed.
    fn request_durability(&self) {
        if let Err(e) = self.db.flush() {
            log::warn!("Could not flush voice store to disk: {}", e);
        }
    }
}

impl LocalStore for SledStore {
    fn save(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let meta = serde_json::to_vec(&PackageMeta {
            saved_at_millis: Utc::now().timestamp_millis(),
            size: bytes.len() as u64,
        })?;

        (&self.packages, &self.meta)
            .transaction(|(packages, meta_tree)| {
                packages.insert(name.as_bytes(), bytes)?;
                meta_tree.insert(name.as_bytes(), meta.as_slice())?;
                Ok(())
            })
            .map_err(|e: TransactionError<()>| match e {
                TransactionError::Abort(()) => {
                    StoreError::StorageUnavailable("save transaction aborted".to_string())
                }
                TransactionError::Storage(e) => StoreError::from(e),
            })?;

        log::info!("Saved voice package '{}' ({} bytes)", name, bytes.len());
        self.request_durability();
        Ok(())
    }

    fn load_record(&self, name: &str) -> Result<Option<VoicePackage>, StoreError> {
        let raw = match self.packages.get(name.as_bytes())? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let saved_at = self
            .read_meta(name)?
            .and_then(|m| DateTime::from_timestamp_millis(m.saved_at_millis))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        Ok(Some(VoicePackage {
            name: name.to_string(),
            raw_bytes: raw.to_vec(),
            saved_at,
        }))
    }

    fn list_names(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        for key in self.packages.iter().keys() {
            let key = key?;
            names.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(names)
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.packages.remove(name.as_bytes())?;
        self.meta.remove(name.as_bytes())?;
        log::info!("Deleted voice package '{}'", name);
        Ok(())
    }

    fn latest(&self) -> Result<Option<String>, StoreError> {
        let mut newest: Option<(i64, String)> = None;
        for name in self.list_names()? {
            let saved = self.read_meta(&name)?.map(|m| m.saved_at_millis).unwrap_or(0);
            if newest.as_ref().map_or(true, |(ts, _)| saved >= *ts) {
                newest = Some((saved, name));
            }
        }
        Ok(newest.map(|(_, name)| name))
    }

    fn load_history(&self) -> Result<Vec<String>, StoreError> {
        match self.state.get(HISTORY_KEY)? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    fn save_history(&self, entries: &[String]) -> Result<(), StoreError> {
        self.state.insert(HISTORY_KEY, serde_json::to_vec(entries)?)?;
        Ok(())
    }
}
