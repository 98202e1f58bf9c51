//! Per-node RPC server.
//!
//! One listener serves every service a node exposes: health and
//! introspection, the clocked storage operations used by coordinators, the
//! clock (timestamp oracle) operations, and the cluster front door that
//! clients talk to. The node has no idea which keys "belong" to it; replica
//! placement is entirely the callers' job.
use crate::clock::ClockServer;
use crate::coordinator::Coordinator;
use crate::error::{MeridianError, MeridianResult};
use crate::liveness::Liveness;
use crate::network::{Connection, Listener, Message, NodeStatus};
use crate::storage::Storage;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// A node's RPC server: storage, clock, and cluster services behind one
/// listener.
pub struct NodeServer {
    node_id: String,
    storage: Arc<Storage>,
    clock: Arc<ClockServer>,
    coordinator: Arc<Coordinator>,
    liveness: Arc<Liveness>,
    started_at: Instant,
    shutdown_tx: broadcast::Sender<()>,
}

impl NodeServer {
    pub fn new(
        node_id: impl Into<String>,
        storage: Arc<Storage>,
        clock: Arc<ClockServer>,
        coordinator: Arc<Coordinator>,
        liveness: Arc<Liveness>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            node_id: node_id.into(),
            storage,
            clock,
            coordinator,
            liveness,
            started_at: Instant::now(),
            shutdown_tx,
        }
    }

    /// Accept and serve connections until [`stop`](Self::stop) is called.
    pub async fn serve(self: Arc<Self>, listener: Listener) -> MeridianResult<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tracing::info!(
            node = %self.node_id,
            address = %listener.local_addr(),
            "node server listening"
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok(conn) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(err) = server.handle_connection(conn).await {
                                    tracing::debug!("connection error: {err}");
                                }
                            });
                        }
                        Err(err) => tracing::warn!("failed to accept connection: {err}"),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        Ok(())
    }

    /// Signal the accept loop to stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    async fn handle_connection(&self, mut conn: Connection) -> MeridianResult<()> {
        loop {
            let message = match conn.receive().await {
                Ok(message) => message,
                Err(_) => break, // connection closed
            };
            let response = self.handle_message(message).await;
            conn.send(&response).await?;
        }
        Ok(())
    }

    async fn handle_message(&self, message: Message) -> Message {
        match message {
            Message::Health => Message::HealthAck {
                node_id: self.node_id.clone(),
                status: NodeStatus::Online,
                uptime: self.uptime(),
            },

            Message::Info => match self.storage.keys() {
                Ok(keys) => Message::InfoAck {
                    node_id: self.node_id.clone(),
                    uptime: self.uptime(),
                    online_nodes: self.liveness.online_nodes().await,
                    keys,
                },
                Err(err) => error_response(&err),
            },

            Message::NodeGet { key } => match self.storage.get(&key) {
                Ok(entry) => Message::NodeGetAck { entry },
                Err(err) => error_response(&err),
            },

            Message::NodeSet { entry } => match self.storage.set(&entry) {
                Ok(()) => Message::NodeSetAck,
                Err(err) => error_response(&err),
            },

            Message::ClockGet => Message::ClockGetAck {
                value: self.clock.get().await,
            },

            Message::ClockSet { value } => match self.clock.set(value).await {
                Ok(()) => Message::ClockSetAck,
                Err(err) => error_response(&err),
            },

            Message::ClusterGet { key } => match self.coordinator.read(&key).await {
                Ok(entry) => Message::ClusterGetAck { entry },
                Err(err) => {
                    tracing::warn!("error getting value from cluster: {err}");
                    error_response(&err)
                }
            },

            Message::ClusterSet { entry } => match self.coordinator.write(entry).await {
                Ok(()) => Message::ClusterSetAck,
                Err(err) => {
                    tracing::warn!("error setting value in cluster: {err}");
                    error_response(&err)
                }
            },

            other => Message::Error {
                message: format!("unexpected request: {other:?}"),
            },
        }
    }

    fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

fn error_response(err: &MeridianError) -> Message {
    Message::Error {
        message: err.to_string(),
    }
}
