//! YAML configuration for nodes, clusters, and the ticket issuer.
//!
//! The cluster roster is static for a process lifetime: every node loads the
//! same cluster file, and each node's 32-bit identity hash is precomputed at
//! load time so replica selection never re-hashes node ids.
use crate::error::{MeridianError, MeridianResult};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};

/// Per-node settings: identity, bind address, and on-disk state locations.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Stable node identifier; must match a key in the cluster roster.
    pub id: String,
    /// Address the node's RPC listener binds to.
    pub local_address: String,
    /// Directory for the sled database.
    pub data_dir: PathBuf,
    /// Path of the clock server's persistent epoch file.
    pub epoch_file: PathBuf,
}

#[derive(Debug, Deserialize)]
struct NodeConfigFile {
    node: NodeConfig,
}

impl NodeConfig {
    /// Load a node config from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> MeridianResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| MeridianError::Config(format!("error reading config file: {e}")))?;
        let parsed: NodeConfigFile = serde_yaml::from_str(&raw)
            .map_err(|e| MeridianError::Config(format!("error deserialising config file: {e}")))?;
        Ok(parsed.node)
    }
}

/// A member of the static cluster roster.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeDescription {
    /// Node id, copied from the roster key at load time.
    #[serde(skip)]
    pub id: String,
    /// Address other nodes use to reach this node.
    pub remote_address: String,
    /// `murmur3_32(id, cluster seed)`, precomputed at load time. Used as the
    /// per-node seed for replica selection and as the deterministic
    /// tie-break when replicas answer a read with equal clocks.
    #[serde(skip)]
    pub hash: u32,
}

impl NodeDescription {
    pub fn new(remote_address: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            remote_address: remote_address.into(),
            hash: 0,
        }
    }
}

/// The immutable description of a cluster: hash seed, replication factor,
/// and the full node roster.
///
/// Nodes live in a `BTreeMap` so every iteration over the roster is
/// deterministic across processes; replica selection depends on that.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterDescription {
    pub seed: u32,
    pub replica_count: usize,
    pub nodes: BTreeMap<String, NodeDescription>,
}

#[derive(Debug, Deserialize)]
struct ClusterConfigFile {
    cluster: ClusterDescription,
}

impl ClusterDescription {
    /// Build a cluster description, computing node hashes and validating.
    pub fn new(
        seed: u32,
        replica_count: usize,
        nodes: BTreeMap<String, NodeDescription>,
    ) -> MeridianResult<Self> {
        let mut cluster = Self {
            seed,
            replica_count,
            nodes,
        };
        cluster.initialise();
        cluster.validate()?;
        Ok(cluster)
    }

    /// Load a cluster description from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> MeridianResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| MeridianError::Config(format!("error reading config file: {e}")))?;
        let parsed: ClusterConfigFile = serde_yaml::from_str(&raw)
            .map_err(|e| MeridianError::Config(format!("error deserialising config file: {e}")))?;
        let mut cluster = parsed.cluster;
        cluster.initialise();
        cluster.validate()?;
        Ok(cluster)
    }

    /// Look up a node's description by id.
    pub fn node(&self, id: &str) -> Option<&NodeDescription> {
        self.nodes.get(id)
    }

    fn initialise(&mut self) {
        let seed = self.seed;
        for (id, node) in self.nodes.iter_mut() {
            node.id = id.clone();
            node.hash = id_hash(id, seed);
        }
    }

    fn validate(&self) -> MeridianResult<()> {
        if self.replica_count < 1 {
            return Err(MeridianError::Config(
                "replica_count must be at least 1".to_string(),
            ));
        }
        if self.nodes.len() < self.replica_count {
            return Err(MeridianError::Config(format!(
                "cluster has {} nodes but replica_count is {}",
                self.nodes.len(),
                self.replica_count
            )));
        }
        Ok(())
    }
}

/// Settings for the ticket issuer service.
#[derive(Debug, Clone, Deserialize)]
pub struct TicketIssuerConfig {
    /// Address the issuer's RPC listener binds to.
    pub bind_address: String,
    /// Cap on tickets issued per shard.
    #[serde(alias = "max_tickets_per_redis_shard")]
    pub max_tickets_per_shard: i64,
    /// Redis connection URLs, one per shard. User ids are pinned to shards
    /// by `user_id % shard count`, so the list order matters.
    pub redis_shard_urls: Vec<String>,
}

impl TicketIssuerConfig {
    /// Load a ticket issuer config from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> MeridianResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| MeridianError::Config(format!("error reading config file: {e}")))?;
        let config: TicketIssuerConfig = serde_yaml::from_str(&raw)
            .map_err(|e| MeridianError::Config(format!("error deserialising config file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> MeridianResult<()> {
        if self.redis_shard_urls.is_empty() {
            return Err(MeridianError::Config(
                "config must specify at least one redis shard".to_string(),
            ));
        }
        Ok(())
    }
}

/// 32-bit seeded hash of a node id, shared by replica selection and read
/// tie-breaking.
pub(crate) fn id_hash(id: &str, seed: u32) -> u32 {
    let mut cursor = Cursor::new(id.as_bytes());
    // Hashing an in-memory buffer cannot fail.
    murmur3::murmur3_32(&mut cursor, seed).expect("in-memory hash")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(ids: &[&str]) -> BTreeMap<String, NodeDescription> {
        ids.iter()
            .map(|id| (id.to_string(), NodeDescription::new(format!("{id}:7000"))))
            .collect()
    }

    #[test]
    fn test_cluster_initialise_sets_ids_and_hashes() {
        let cluster = ClusterDescription::new(42, 2, roster(&["a", "b", "c"])).unwrap();

        for (id, node) in &cluster.nodes {
            assert_eq!(&node.id, id);
            assert_eq!(node.hash, id_hash(id, 42));
        }
        // Different ids hash differently under the same seed.
        assert_ne!(cluster.nodes["a"].hash, cluster.nodes["b"].hash);
    }

    #[test]
    fn test_hash_depends_on_seed() {
        assert_ne!(id_hash("a", 1), id_hash("a", 2));
        assert_eq!(id_hash("a", 7), id_hash("a", 7));
    }

    #[test]
    fn test_replica_count_validation() {
        assert!(ClusterDescription::new(1, 0, roster(&["a"])).is_err());
        assert!(ClusterDescription::new(1, 2, roster(&["a"])).is_err());
        assert!(ClusterDescription::new(1, 1, roster(&["a"])).is_ok());
    }

    #[test]
    fn test_cluster_yaml_parsing() {
        let yaml = r#"
cluster:
  seed: 42
  replica_count: 2
  nodes:
    a:
      remote_address: "127.0.0.1:7001"
    b:
      remote_address: "127.0.0.1:7002"
    c:
      remote_address: "127.0.0.1:7003"
"#;
        let parsed: ClusterConfigFile = serde_yaml::from_str(yaml).unwrap();
        let mut cluster = parsed.cluster;
        cluster.initialise();
        cluster.validate().unwrap();

        assert_eq!(cluster.seed, 42);
        assert_eq!(cluster.replica_count, 2);
        assert_eq!(cluster.nodes.len(), 3);
        assert_eq!(cluster.nodes["b"].remote_address, "127.0.0.1:7002");
        assert_eq!(cluster.nodes["b"].id, "b");
    }

    #[test]
    fn test_node_yaml_parsing() {
        let yaml = r#"
node:
  id: a
  local_address: "127.0.0.1:7001"
  data_dir: /tmp/meridian/node_a
  epoch_file: /tmp/meridian/node_a/epoch
"#;
        let parsed: NodeConfigFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed.node.id, "a");
        assert_eq!(parsed.node.local_address, "127.0.0.1:7001");
        assert_eq!(parsed.node.epoch_file, PathBuf::from("/tmp/meridian/node_a/epoch"));
    }

    #[test]
    fn test_ticket_issuer_yaml_parsing() {
        let yaml = r#"
bind_address: "127.0.0.1:7100"
max_tickets_per_redis_shard: 100
redis_shard_urls:
  - "redis://127.0.0.1:6379/0"
  - "redis://127.0.0.1:6379/1"
"#;
        let config: TicketIssuerConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.max_tickets_per_shard, 100);
        assert_eq!(config.redis_shard_urls.len(), 2);
    }

    #[test]
    fn test_ticket_issuer_requires_shards() {
        let config = TicketIssuerConfig {
            bind_address: "127.0.0.1:7100".to_string(),
            max_tickets_per_shard: 10,
            redis_shard_urls: vec![],
        };
        assert!(config.validate().is_err());
    }
}
