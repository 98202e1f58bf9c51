//! # Meridian
//!
//! A small distributed key-value store. Cluster members own disjoint key
//! ranges by rendezvous hashing, every write is replicated to a
//! deterministic subset of nodes, and a timestamp oracle supplies the
//! monotonic logical clock that orders conflicting writes.
//!
//! ## Architecture
//!
//! Each node process hosts four cooperating pieces in one address space:
//!
//! 1. **Storage** (`storage`) — a sled database of clocked entries
//! 2. **Clock server** (`clock`) — the timestamp oracle, epoch on disk
//! 3. **Coordinator** (`coordinator`) — quorum reads/writes over replicas
//!    chosen by the **selector** (`selector`, rendezvous hashing)
//! 4. **Liveness** (`liveness`) — health probing and the online view
//!
//! Everything talks over one framed-JSON TCP protocol (`network`), through
//! pooled retrying client connections (`pool`). The `ticket` module is an
//! independent service issuing scarce tickets against sharded Redis
//! counters.
//!
//! ## Write path
//!
//! A `Cluster.Set` selects the key's R replicas, collects a quorum of clock
//! values, proposes `max + 1`, advances a quorum of clocks, and writes the
//! clocked entry to a quorum. Readers return the entry with the greatest
//! clock among a quorum of responses, so after a successful write every
//! successful read observes a clock at least as new.
//!
//! ## Quick start
//!
//! ```ignore
//! meridian node --node-config node_a.yaml --cluster-config cluster.yaml
//! meridian set --addr 127.0.0.1:7001 some-key some-value
//! meridian get --addr 127.0.0.1:7001 some-key
//! ```

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod liveness;
pub mod network;
pub mod pool;
pub mod selector;
pub mod server;
pub mod storage;
pub mod ticket;
pub mod types;

// Public API exports
pub use clock::ClockServer;
pub use config::{ClusterDescription, NodeConfig, NodeDescription, TicketIssuerConfig};
pub use coordinator::Coordinator;
pub use error::{MeridianError, MeridianResult};
pub use liveness::{Liveness, LivenessSettings};
pub use network::{Connection, Listener, Message, NodeStatus};
pub use pool::ConnManager;
pub use selector::{find_nodes_for_key, FoundNode};
pub use server::NodeServer;
pub use storage::Storage;
pub use ticket::{TicketIssuer, TicketOutcome};
pub use types::{ClockValue, ClockedEntry, Entry};

/// Initialize the logging system.
///
/// Call once at application startup. The log level is controlled via the
/// `MERIDIAN_LOG` environment variable (`error`, `warn`, `info`, `debug`,
/// `trace`); the default is `info`.
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("MERIDIAN_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
