//! Timestamp oracle: a single clock server per node issuing `(epoch,
//! counter)` pairs.
//!
//! Only the epoch is durable. It lives in a small file as decimal ASCII and
//! is incremented-and-rewritten on every startup before the server becomes
//! reachable, so every value issued after a restart strictly dominates every
//! value issued before it. The counter is in-memory only and resets to 1.
//!
//! The whole clock sits behind one async mutex. Reads take a snapshot;
//! writes adopt larger epochs (persisting the epoch before acknowledging)
//! and advance equal-epoch counters. Regressions are silent no-ops, never
//! errors: a refused `set` simply means the caller's clock was already
//! stale.
use crate::error::{MeridianError, MeridianResult};
use crate::types::ClockValue;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// The clock server's state: current value plus the epoch file path.
#[derive(Debug)]
pub struct ClockServer {
    epoch_path: PathBuf,
    value: Mutex<ClockValue>,
}

impl ClockServer {
    /// Initialise the clock from its epoch file.
    ///
    /// A missing file starts the epoch at 1; an existing file is parsed,
    /// incremented, and rewritten before this returns. Unreadable or
    /// unparsable files are fatal.
    pub async fn open(epoch_path: impl Into<PathBuf>) -> MeridianResult<Self> {
        let epoch_path = epoch_path.into();
        let epoch = create_or_increment_epoch_file(&epoch_path).await?;
        tracing::info!(epoch, "clock server initialised");
        Ok(Self {
            epoch_path,
            value: Mutex::new(ClockValue::new(epoch, 1)),
        })
    }

    /// Snapshot the current clock value.
    pub async fn get(&self) -> ClockValue {
        *self.value.lock().await
    }

    /// Advance the clock to at least `proposed`.
    ///
    /// A larger epoch is adopted wholesale (both fields), and the new epoch
    /// is persisted before this returns success; if persisting fails the
    /// in-memory state is left unchanged. Within the current epoch only a
    /// larger counter advances. Anything else is a successful no-op.
    pub async fn set(&self, proposed: ClockValue) -> MeridianResult<()> {
        let mut value = self.value.lock().await;

        if proposed.epoch > value.epoch {
            write_epoch_file(&self.epoch_path, proposed.epoch).await?;
            *value = proposed;
            tracing::info!(clock = %*value, "clock adopted new epoch");
        } else if proposed.epoch == value.epoch && proposed.counter > value.counter {
            value.counter = proposed.counter;
            tracing::debug!(clock = %*value, "clock advanced");
        }

        Ok(())
    }
}

async fn create_or_increment_epoch_file(path: &Path) -> MeridianResult<u64> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let epoch = 1;
            write_epoch_file(path, epoch).await?;
            return Ok(epoch);
        }
        Err(err) => {
            return Err(MeridianError::ClockInit(format!(
                "error reading epoch file: {err}"
            )))
        }
    };

    let epoch: u64 = raw
        .trim()
        .parse()
        .map_err(|err| MeridianError::ClockInit(format!("error parsing epoch file: {err}")))?;

    let epoch = epoch
        .checked_add(1)
        .ok_or_else(|| MeridianError::ClockInit("epoch file overflowed".to_string()))?;
    write_epoch_file(path, epoch).await?;
    Ok(epoch)
}

async fn write_epoch_file(path: &Path, epoch: u64) -> MeridianResult<()> {
    tokio::fs::write(path, epoch.to_string())
        .await
        .map_err(|err| MeridianError::ClockInit(format!("unable to write epoch file: {err}")))
}
