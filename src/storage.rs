//! Per-node storage engine: a sled database of clocked entries.
//!
//! The engine stores one record per key, encoded with bincode as the value
//! string plus the clock it was written under. sled synchronises concurrent
//! access internally, so callers never lock around individual operations.
//!
//! Overwrites are clock-gated: a record may only be replaced by one with an
//! equal or greater clock. The coordinator always writes monotonically, so a
//! `StaleWrite` rejection means another writer already won the key with a
//! newer clock.
use crate::error::{MeridianError, MeridianResult};
use crate::types::{ClockValue, ClockedEntry, Entry};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// On-disk record: everything in a `ClockedEntry` except the key, which is
/// the sled key itself.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    value: String,
    clock: ClockValue,
}

/// Handle to a node's local database.
#[derive(Debug, Clone)]
pub struct Storage {
    db: sled::Db,
}

impl Storage {
    /// Open (or create) the database under `path`.
    pub fn open(path: impl AsRef<Path>) -> MeridianResult<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Open a temporary in-memory database. Test fixtures only need this to
    /// avoid touching disk.
    pub fn open_temporary() -> MeridianResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Fetch the clocked entry stored for `key`, if any.
    pub fn get(&self, key: &str) -> MeridianResult<Option<ClockedEntry>> {
        let Some(bytes) = self.db.get(key.as_bytes())? else {
            return Ok(None);
        };
        let record: StoredRecord = bincode::deserialize(&bytes)?;
        Ok(Some(ClockedEntry::new(
            Entry::new(key, record.value),
            record.clock,
        )))
    }

    /// Store a clocked entry, replacing an existing record only if the
    /// incoming clock is equal or greater.
    ///
    /// A compare-and-swap loop keeps the check-then-write atomic under
    /// concurrent writers to the same key.
    pub fn set(&self, entry: &ClockedEntry) -> MeridianResult<()> {
        let key = entry.entry.key.as_bytes();
        let new_bytes = bincode::serialize(&StoredRecord {
            value: entry.entry.value.clone(),
            clock: entry.clock,
        })?;

        loop {
            let current = self.db.get(key)?;
            if let Some(bytes) = &current {
                let existing: StoredRecord = bincode::deserialize(bytes)?;
                if existing.clock > entry.clock {
                    return Err(MeridianError::StaleWrite {
                        stored: existing.clock,
                        proposed: entry.clock,
                    });
                }
            }

            match self
                .db
                .compare_and_swap(key, current, Some(new_bytes.clone()))?
            {
                Ok(()) => return Ok(()),
                // Lost a race against another writer; re-check its clock.
                Err(_) => continue,
            }
        }
    }

    /// Enumerate all stored keys, in sled's (byte-ordered) iteration order.
    pub fn keys(&self) -> MeridianResult<Vec<String>> {
        let mut keys = Vec::new();
        for item in self.db.iter() {
            let (key, _) = item?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }

    /// Flush buffered writes to disk.
    pub fn flush(&self) -> MeridianResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Flush and release the database. Called on TERM/INT before exit.
    pub fn close(&self) -> MeridianResult<()> {
        self.flush()
    }
}
