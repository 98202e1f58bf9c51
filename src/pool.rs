//! Pooled, retrying client connections to peers.
//!
//! Every peer address gets a fixed-size pool of lazily-opened connections; a
//! round-robin counter picks a slot per call. Transport failures are retried
//! with exponential backoff, and idle pools can be garbage-collected after a
//! configurable quiet period (by default they live forever).
//!
//! A slot's connection is moved out of the slot for the duration of a
//! request. Quorum phases cancel their outstanding calls once the outcome is
//! decided, and a cancelled call must not leave a half-read response behind
//! for the next caller; taking the connection means cancellation simply
//! drops the socket and the slot reconnects on next use.
use crate::error::{MeridianError, MeridianResult};
use crate::network::{Connection, Message};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};

/// Attempts per call, transport failures only.
const CALL_ATTEMPTS: u32 = 3;
/// Backoff before the second attempt; quadruples per attempt (0.1 s, 0.4 s).
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const BACKOFF_MULTIPLIER: u32 = 4;

/// Manager of per-address connection pools.
pub struct ConnManager {
    pool_size: usize,
    remove_unused_after: Option<Duration>,
    pools: DashMap<String, Arc<ConnPool>>,
    last_used: DashMap<String, Instant>,
}

impl ConnManager {
    /// Create a manager. `pool_size` is clamped to at least 1;
    /// `remove_unused_after = None` means idle pools are never closed.
    pub fn new(pool_size: usize, remove_unused_after: Option<Duration>) -> Self {
        Self {
            pool_size: pool_size.max(1),
            remove_unused_after,
            pools: DashMap::new(),
            last_used: DashMap::new(),
        }
    }

    /// Issue a request to `address` and await its response, retrying
    /// transport-level failures up to three times (0.1 s → 0.4 s backoff
    /// between attempts). Non-transport errors are returned immediately.
    pub async fn call(&self, address: &str, message: &Message) -> MeridianResult<Message> {
        let pool = self.pool(address);
        self.last_used.insert(address.to_string(), Instant::now());

        let mut backoff = INITIAL_BACKOFF;
        for _ in 1..CALL_ATTEMPTS {
            match pool.call_once(message).await {
                Err(MeridianError::Transport(reason)) => {
                    tracing::debug!(%address, %reason, "retrying after transport failure");
                    tokio::time::sleep(backoff).await;
                    backoff *= BACKOFF_MULTIPLIER;
                }
                other => return other,
            }
        }
        pool.call_once(message).await
    }

    /// Spawn the background task that closes idle pools. Does nothing when
    /// no idle timeout is configured.
    pub fn spawn_gc(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let Some(max_idle) = self.remove_unused_after else {
            return;
        };
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(max_idle);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.garbage_collect(max_idle),
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    fn pool(&self, address: &str) -> Arc<ConnPool> {
        self.pools
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(ConnPool::new(address.to_string(), self.pool_size)))
            .clone()
    }

    fn garbage_collect(&self, max_idle: Duration) {
        let stale: Vec<String> = self
            .last_used
            .iter()
            .filter(|item| item.value().elapsed() >= max_idle)
            .map(|item| item.key().clone())
            .collect();

        for address in stale {
            self.pools.remove(&address);
            self.last_used.remove(&address);
            tracing::debug!(%address, "closed idle connection pool");
        }
    }
}

/// A fixed-size pool of connections to one address.
struct ConnPool {
    address: String,
    slots: Vec<Mutex<Option<Connection>>>,
    next: AtomicUsize,
}

impl ConnPool {
    fn new(address: String, size: usize) -> Self {
        Self {
            address,
            slots: (0..size).map(|_| Mutex::new(None)).collect(),
            next: AtomicUsize::new(0),
        }
    }

    async fn call_once(&self, message: &Message) -> MeridianResult<Message> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let mut slot = self.slots[index].lock().await;

        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => Connection::connect(&self.address).await?,
        };

        // On failure the connection is dropped and the slot stays empty.
        let response = conn.request(message).await?;
        *slot = Some(conn);
        Ok(response)
    }
}
