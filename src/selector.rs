//! Replica selection by rendezvous (highest-random-weight) hashing.
//!
//! Every node ranks the whole roster for a key by hashing the key with each
//! node's identity hash as the seed, and takes the top `replica_count`.
//! Because the hash family and the roster are identical everywhere, every
//! node computes the same ordered replica set without coordination, and
//! removing one node only moves the keys that ranked it highest.
use crate::config::{ClusterDescription, NodeDescription};
use std::io::Cursor;

/// A node chosen for a key, with the combined hash that ranked it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundNode {
    pub combined_hash: u64,
    pub node: NodeDescription,
}

/// Rank the cluster's nodes for `key` and return the top `replica_count`,
/// ordered by combined hash descending.
///
/// Hash collisions between nodes are broken by node id ascending, so the
/// ordering is fully deterministic for a given cluster description.
pub fn find_nodes_for_key(key: &str, cluster: &ClusterDescription) -> Vec<FoundNode> {
    let key_bytes = key.as_bytes();

    let mut ranked: Vec<FoundNode> = cluster
        .nodes
        .values()
        .map(|node| FoundNode {
            combined_hash: combined_hash(key_bytes, node.hash),
            node: node.clone(),
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.combined_hash
            .cmp(&a.combined_hash)
            .then_with(|| a.node.id.cmp(&b.node.id))
    });
    ranked.truncate(cluster.replica_count);
    ranked
}

/// 64-bit seeded hash of a key: the low half of murmur3's x64-128 output,
/// which matches `Sum64WithSeed` in other murmur3 implementations.
fn combined_hash(key: &[u8], seed: u32) -> u64 {
    let mut cursor = Cursor::new(key);
    // Hashing an in-memory buffer cannot fail.
    murmur3::murmur3_x64_128(&mut cursor, seed).expect("in-memory hash") as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeDescription;
    use proptest::prelude::*;
    use std::collections::{BTreeMap, HashMap};

    fn cluster(seed: u32, replica_count: usize, ids: &[&str]) -> ClusterDescription {
        let nodes: BTreeMap<String, NodeDescription> = ids
            .iter()
            .map(|id| (id.to_string(), NodeDescription::new(format!("{id}:7000"))))
            .collect();
        ClusterDescription::new(seed, replica_count, nodes).unwrap()
    }

    #[test]
    fn test_selection_is_deterministic() {
        let c = cluster(42, 2, &["a", "b", "c"]);
        let first = find_nodes_for_key("user:1", &c);
        let second = find_nodes_for_key("user:1", &c);
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn test_selection_ignores_roster_insertion_order() {
        // The same nodes inserted in a different order must select the same
        // ordered replica set.
        let forward = cluster(42, 2, &["a", "b", "c"]);
        let reversed = cluster(42, 2, &["c", "b", "a"]);

        let from_forward = find_nodes_for_key("user:1", &forward);
        let from_reversed = find_nodes_for_key("user:1", &reversed);

        let ids_forward: Vec<&str> = from_forward.iter().map(|f| f.node.id.as_str()).collect();
        let ids_reversed: Vec<&str> = from_reversed.iter().map(|f| f.node.id.as_str()).collect();
        assert_eq!(ids_forward, ids_reversed);
    }

    #[test]
    fn test_selection_returns_distinct_nodes() {
        let c = cluster(7, 3, &["a", "b", "c", "d", "e"]);
        for key in ["k1", "k2", "k3", "some/longer/key", ""] {
            let found = find_nodes_for_key(key, &c);
            assert_eq!(found.len(), 3);
            let mut ids: Vec<&str> = found.iter().map(|f| f.node.id.as_str()).collect();
            ids.sort_unstable();
            ids.dedup();
            assert_eq!(ids.len(), 3, "replicas for {key:?} must be distinct");
        }
    }

    #[test]
    fn test_single_replica_cluster() {
        let c = cluster(1, 1, &["only"]);
        let found = find_nodes_for_key("anything", &c);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].node.id, "only");
    }

    #[test]
    fn test_removing_a_node_only_moves_its_own_keys() {
        let full = cluster(42, 1, &["a", "b", "c", "d"]);

        for i in 0..200 {
            let key = format!("key-{i}");
            let primary = find_nodes_for_key(&key, &full)[0].node.id.clone();

            // Remove some *other* node: the key's primary must not move.
            let survivor_ids: Vec<&str> = ["a", "b", "c", "d"]
                .into_iter()
                .filter(|id| *id != primary)
                .collect();
            let removed = survivor_ids[i % survivor_ids.len()];
            let remaining: Vec<&str> = ["a", "b", "c", "d"]
                .into_iter()
                .filter(|id| *id != removed)
                .collect();
            let shrunk = cluster(42, 1, &remaining);

            assert_eq!(
                find_nodes_for_key(&key, &shrunk)[0].node.id,
                primary,
                "removing {removed} moved {key} away from {primary}"
            );
        }
    }

    #[test]
    fn test_balance_is_roughly_uniform() {
        let c = cluster(42, 2, &["a", "b", "c", "d"]);
        let mut counts: HashMap<String, usize> = HashMap::new();

        let samples = 4000;
        for i in 0..samples {
            for found in find_nodes_for_key(&format!("key-{i}"), &c) {
                *counts.entry(found.node.id).or_default() += 1;
            }
        }

        // Each node should carry about R/N = 2/4 of selections; allow wide
        // tolerance to keep the test stable.
        let expected = samples * 2 / 4;
        for (id, count) in counts {
            assert!(
                count > expected / 2 && count < expected * 2,
                "node {id} selected {count} times, expected about {expected}"
            );
        }
    }

    proptest! {
        #[test]
        fn prop_selection_deterministic_and_distinct(
            key in ".{0,64}",
            seed in any::<u32>(),
        ) {
            let c = cluster(seed, 3, &["a", "b", "c", "d", "e"]);
            let first = find_nodes_for_key(&key, &c);
            let second = find_nodes_for_key(&key, &c);
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.len(), 3);

            let mut ids: Vec<&str> = first.iter().map(|f| f.node.id.as_str()).collect();
            ids.sort_unstable();
            ids.dedup();
            prop_assert_eq!(ids.len(), 3);
        }
    }
}
