//! Wire protocol for node-to-node and client-to-node communication.
//!
//! Meridian uses a request-response protocol over TCP. Each message is a
//! 4-byte big-endian length header followed by a JSON-encoded [`Message`].
//! One listener per process serves every logical service (node storage,
//! clock, cluster front door, or the ticket issuer), dispatching on the
//! message variant.
//!
//! All operations are async and usable from Tokio's multi-threaded runtime.
use crate::error::{MeridianError, MeridianResult};
use crate::types::{ClockValue, ClockedEntry, Entry};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Maximum message size (64 MiB).
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Reported health of a responding node. A reachable, non-crashed node is
/// always online.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Online,
}

/// Protocol messages. Requests and their acks are paired variants; every
/// request receives exactly one response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ─────────────────────────────────────────────────────────────────────
    // Node service: health, introspection, clocked storage
    // ─────────────────────────────────────────────────────────────────────
    /// Liveness probe.
    Health,
    HealthAck {
        node_id: String,
        status: NodeStatus,
        uptime: Duration,
    },

    /// Node introspection: online view and locally stored keys.
    Info,
    InfoAck {
        node_id: String,
        uptime: Duration,
        online_nodes: Vec<String>,
        keys: Vec<String>,
    },

    /// Fetch this node's clocked entry for a key.
    NodeGet { key: String },
    NodeGetAck { entry: Option<ClockedEntry> },

    /// Store a clocked entry on this node.
    NodeSet { entry: ClockedEntry },
    NodeSetAck,

    // ─────────────────────────────────────────────────────────────────────
    // Clock service (timestamp oracle)
    // ─────────────────────────────────────────────────────────────────────
    ClockGet,
    ClockGetAck { value: ClockValue },

    ClockSet { value: ClockValue },
    ClockSetAck,

    // ─────────────────────────────────────────────────────────────────────
    // Cluster front door: quorum reads and writes
    // ─────────────────────────────────────────────────────────────────────
    ClusterGet { key: String },
    ClusterGetAck { entry: Option<Entry> },

    ClusterSet { entry: Entry },
    ClusterSetAck,

    // ─────────────────────────────────────────────────────────────────────
    // Ticket issuer
    // ─────────────────────────────────────────────────────────────────────
    TicketHealth,
    TicketHealthAck { uptime: Duration },

    IssueTicket { user_id: u64 },
    IssueTicketAck { ticketed: bool },

    // ─────────────────────────────────────────────────────────────────────
    // Errors
    // ─────────────────────────────────────────────────────────────────────
    /// Error response.
    Error { message: String },
}

impl Message {
    /// Serialize message to bytes.
    pub fn to_bytes(&self) -> MeridianResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(MeridianError::Serialization)
    }

    /// Deserialize message from bytes.
    pub fn from_bytes(bytes: &[u8]) -> MeridianResult<Self> {
        serde_json::from_slice(bytes).map_err(MeridianError::Serialization)
    }
}

/// A single TCP connection to a peer.
pub struct Connection {
    stream: TcpStream,
    peer_addr: String,
}

impl Connection {
    /// Wrap an accepted TCP stream.
    pub fn new(stream: TcpStream, peer_addr: String) -> Self {
        Self { stream, peer_addr }
    }

    /// Connect to a peer.
    pub async fn connect(addr: &str) -> MeridianResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| MeridianError::Transport(format!("failed to connect to {addr}: {e}")))?;
        Ok(Self::new(stream, addr.to_string()))
    }

    /// Address of the peer this connection talks to.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Send a message to the peer.
    pub async fn send(&mut self, message: &Message) -> MeridianResult<()> {
        let bytes = message.to_bytes()?;

        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(MeridianError::Transport(format!(
                "message too large: {} bytes (max: {})",
                bytes.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let len = bytes.len() as u32;
        self.stream
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| MeridianError::Transport(format!("failed to write message length: {e}")))?;
        self.stream
            .write_all(&bytes)
            .await
            .map_err(|e| MeridianError::Transport(format!("failed to write message body: {e}")))?;
        self.stream
            .flush()
            .await
            .map_err(|e| MeridianError::Transport(format!("failed to flush stream: {e}")))?;

        Ok(())
    }

    /// Receive a message from the peer.
    pub async fn receive(&mut self) -> MeridianResult<Message> {
        let mut len_bytes = [0u8; 4];
        self.stream
            .read_exact(&mut len_bytes)
            .await
            .map_err(|e| MeridianError::Transport(format!("failed to read message length: {e}")))?;

        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(MeridianError::Transport(format!(
                "message too large: {len} bytes (max: {MAX_MESSAGE_SIZE})"
            )));
        }

        let mut bytes = vec![0u8; len];
        self.stream
            .read_exact(&mut bytes)
            .await
            .map_err(|e| MeridianError::Transport(format!("failed to read message body: {e}")))?;

        Message::from_bytes(&bytes)
    }

    /// Send a message and wait for the response.
    pub async fn request(&mut self, message: &Message) -> MeridianResult<Message> {
        self.send(message).await?;
        self.receive().await
    }
}

/// TCP listener for incoming connections.
pub struct Listener {
    listener: TcpListener,
    local_addr: String,
}

impl Listener {
    /// Bind to an address and start listening.
    pub async fn bind(addr: &str) -> MeridianResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| MeridianError::Transport(format!("failed to bind to {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| MeridianError::Transport(format!("failed to get local address: {e}")))?
            .to_string();

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// The bound address. Useful when binding to port 0.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Accept an incoming connection.
    pub async fn accept(&self) -> MeridianResult<Connection> {
        let (stream, peer_addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| MeridianError::Transport(format!("failed to accept connection: {e}")))?;

        Ok(Connection::new(stream, peer_addr.to_string()))
    }
}
