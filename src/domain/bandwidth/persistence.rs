use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::domain::bandwidth::allocation::SubscriptionRetrieval;
use crate::domain::bandwidth::subscription::BandwidthSubscription;
use crate::error::{Error, Result};
use crate::utils::id::SubscriptionName;

/// Everything persisted for one subscription snapshot: the snapshot itself
/// plus its retrieval rows. Bucket state is not persisted separately; it is
/// rebuilt from the retrievals' bucket assignments on recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSubscription {
    pub snapshot: BandwidthSubscription,
    pub retrievals: Vec<SubscriptionRetrieval>,
}

/// CRUD over the scheduling state, required to survive a process restart.
///
/// `save` replaces the full row set of one subscription atomically; a failed
/// save leaves the previous rows untouched, which is what lets `schedule()`
/// roll back cleanly.
pub trait BandwidthDao: std::fmt::Debug + Send + Sync {
    fn save(&self, subscription: &PersistedSubscription) -> Result<()>;

    /// Replaces the row sets of several subscriptions in one transaction.
    /// Implementations with a cheaper all-or-nothing write should override
    /// the row-by-row default.
    fn save_all(&self, subscriptions: &[PersistedSubscription]) -> Result<()> {
        for subscription in subscriptions {
            self.save(subscription)?;
        }
        Ok(())
    }

    fn delete(&self, name: &SubscriptionName) -> Result<()>;

    fn load_all(&self) -> Result<Vec<PersistedSubscription>>;
}

/// In-memory DAO. Serves tests and embedded use without a backing file.
#[derive(Debug, Clone)]
pub struct InMemoryBandwidthDao {
    rows: Arc<RwLock<HashMap<SubscriptionName, PersistedSubscription>>>,
}

impl InMemoryBandwidthDao {
    pub fn new() -> Self {
        Self { rows: Arc::new(RwLock::new(HashMap::new())) }
    }
}

impl BandwidthDao for InMemoryBandwidthDao {
    fn save(&self, subscription: &PersistedSubscription) -> Result<()> {
        let mut guard = self.rows.write().expect("RwLock poisoned");
        guard.insert(subscription.snapshot.name.clone(), subscription.clone());
        Ok(())
    }

    fn delete(&self, name: &SubscriptionName) -> Result<()> {
        let mut guard = self.rows.write().expect("RwLock poisoned");
        guard.remove(name);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<PersistedSubscription>> {
        let guard = self.rows.read().expect("RwLock poisoned");
        Ok(guard.values().cloned().collect())
    }
}

/// DAO snapshotting the full state to a JSON file after every write.
///
/// Adequate for a single scheduler process; a write failure surfaces as
/// `Error::Persistence` and the in-memory rows are rolled back so the caller
/// sees a clean transaction boundary.
#[derive(Debug, Clone)]
pub struct JsonFileBandwidthDao {
    path: PathBuf,
    rows: Arc<RwLock<HashMap<SubscriptionName, PersistedSubscription>>>,
}

impl JsonFileBandwidthDao {
    /// Opens (or creates) the snapshot file and loads any existing rows.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let rows = if path.exists() {
            let data = fs::read_to_string(&path)?;
            let loaded: Vec<PersistedSubscription> = serde_json::from_str(&data)?;
            loaded.into_iter().map(|row| (row.snapshot.name.clone(), row)).collect()
        } else {
            HashMap::new()
        };

        Ok(Self { path, rows: Arc::new(RwLock::new(rows)) })
    }

    fn flush(&self, rows: &HashMap<SubscriptionName, PersistedSubscription>) -> Result<()> {
        let serialized = serde_json::to_string_pretty(&rows.values().collect::<Vec<_>>())?;
        fs::write(&self.path, serialized).map_err(|e| Error::Persistence(format!("Failed to write {}: {}", self.path.display(), e)))
    }
}

impl BandwidthDao for JsonFileBandwidthDao {
    fn save(&self, subscription: &PersistedSubscription) -> Result<()> {
        let mut guard = self.rows.write().expect("RwLock poisoned");
        let previous = guard.insert(subscription.snapshot.name.clone(), subscription.clone());

        if let Err(e) = self.flush(&guard) {
            // Restore the pre-save row so memory and file stay in step.
            match previous {
                Some(row) => guard.insert(row.snapshot.name.clone(), row),
                None => guard.remove(&subscription.snapshot.name),
            };
            return Err(e);
        }

        Ok(())
    }

    fn save_all(&self, subscriptions: &[PersistedSubscription]) -> Result<()> {
        let mut guard = self.rows.write().expect("RwLock poisoned");

        let mut previous = Vec::new();
        for subscription in subscriptions {
            let name = subscription.snapshot.name.clone();
            previous.push((name.clone(), guard.insert(name, subscription.clone())));
        }

        if let Err(e) = self.flush(&guard) {
            for (name, old) in previous.into_iter().rev() {
                match old {
                    Some(row) => guard.insert(name, row),
                    None => guard.remove(&name),
                };
            }
            return Err(e);
        }

        Ok(())
    }

    fn delete(&self, name: &SubscriptionName) -> Result<()> {
        let mut guard = self.rows.write().expect("RwLock poisoned");
        let previous = guard.remove(name);

        if let Err(e) = self.flush(&guard) {
            if let Some(row) = previous {
                guard.insert(row.snapshot.name.clone(), row);
            }
            return Err(e);
        }

        Ok(())
    }

    fn load_all(&self) -> Result<Vec<PersistedSubscription>> {
        let guard = self.rows.read().expect("RwLock poisoned");
        Ok(guard.values().cloned().collect())
    }
}
