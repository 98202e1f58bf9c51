//! Liveness tracking: health probing and the derived "online" view.
//!
//! Two background tasks run per node. The probe task sends `Health` to every
//! roster member on a fixed cadence, with a short timeout, and stamps
//! `last_seen` only when the peer answers with the expected node id. The
//! reconcile task recomputes the online set once a second from the stamps'
//! age. Entries are never removed on failure; they simply age out.
//!
//! The online view feeds `Info` for humans. The quorum read/write paths do
//! not consult it; they always contact all chosen replicas.
use crate::config::{ClusterDescription, NodeDescription};
use crate::network::Message;
use crate::pool::ConnManager;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::interval;

/// Timeout for a single health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
/// Cadence of the online-set recomputation.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

/// Tunables for the liveness subsystem.
#[derive(Debug, Clone, Copy)]
pub struct LivenessSettings {
    /// How often every peer is probed.
    pub gossip_regularity: Duration,
    /// How long after its last successful probe a node counts as online.
    pub node_timeout_after: Duration,
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            gossip_regularity: Duration::from_secs(1),
            node_timeout_after: Duration::from_secs(2),
        }
    }
}

/// Probe stamps and the online set derived from them.
#[derive(Debug, Default)]
struct LivenessTable {
    last_seen: HashMap<String, DateTime<Utc>>,
    online: BTreeSet<String>,
}

/// Per-node liveness tracker.
pub struct Liveness {
    cluster: Arc<ClusterDescription>,
    conns: Arc<ConnManager>,
    settings: LivenessSettings,
    table: Mutex<LivenessTable>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Liveness {
    pub fn new(
        cluster: Arc<ClusterDescription>,
        conns: Arc<ConnManager>,
        settings: LivenessSettings,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            cluster,
            conns,
            settings,
            table: Mutex::new(LivenessTable::default()),
            shutdown_tx,
        }
    }

    /// Ids of nodes currently considered online, ascending.
    pub async fn online_nodes(&self) -> Vec<String> {
        self.table.lock().await.online.iter().cloned().collect()
    }

    /// Start the probe and reconcile background tasks.
    pub fn start(self: &Arc<Self>) {
        let liveness = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(liveness.settings.gossip_regularity);
            loop {
                tokio::select! {
                    _ = ticker.tick() => liveness.probe_all().await,
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        let liveness = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(RECONCILE_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => liveness.reconcile().await,
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Stop the background tasks.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Probe every roster member in parallel.
    async fn probe_all(&self) {
        let probes = self.cluster.nodes.values().map(|node| self.probe_node(node));
        futures::future::join_all(probes).await;
    }

    async fn probe_node(&self, node: &NodeDescription) {
        let probe = self.conns.call(&node.remote_address, &Message::Health);
        match tokio::time::timeout(PROBE_TIMEOUT, probe).await {
            Ok(Ok(Message::HealthAck { node_id, .. })) => {
                if node_id != node.id {
                    tracing::warn!(
                        expected = %node.id,
                        received = %node_id,
                        "health response did not match node id"
                    );
                    return;
                }
                self.table
                    .lock()
                    .await
                    .last_seen
                    .insert(node.id.clone(), Utc::now());
            }
            Ok(Ok(other)) => {
                tracing::warn!(node = %node.id, "unexpected health response: {other:?}");
            }
            Ok(Err(err)) => {
                tracing::debug!(node = %node.id, "error probing node: {err}");
            }
            Err(_) => {
                tracing::debug!(node = %node.id, "health probe timed out");
            }
        }
    }

    /// Recompute the online set from probe stamp ages.
    async fn reconcile(&self) {
        let timeout =
            chrono::Duration::from_std(self.settings.node_timeout_after).unwrap_or_default();
        let now = Utc::now();

        let mut table = self.table.lock().await;
        let mut online = BTreeSet::new();
        for id in self.cluster.nodes.keys() {
            if let Some(seen) = table.last_seen.get(id) {
                if now - *seen < timeout {
                    online.insert(id.clone());
                }
            }
        }
        table.online = online;
    }
}
