//! Partition-range placement.
//!
//! Forms ranges of `partition_num_per_range` partitions over
//! `[0, partition_num)` and assigns each range `replica` distinct servers,
//! round-robin over the candidate set ordered by increasing load, with a
//! rotating start index so successive ranges land on different servers.

use std::collections::BTreeMap;

use skein_types::{PartitionId, PartitionRange, ServerId, ShuffleServerInfo};

use crate::CoordinatorError;
use crate::registry::ServerNode;

/// Both projections of one placement decision.
#[derive(Debug, Clone)]
pub struct Assignments {
    /// partition → ordered replica servers (length = `replica`).
    pub partition_to_servers: Vec<(PartitionId, Vec<ShuffleServerInfo>)>,
    /// server → ranges it must pre-allocate buffers for.
    pub server_to_ranges: Vec<(ShuffleServerInfo, Vec<PartitionRange>)>,
}

/// Computes a placement over the given candidates.
///
/// Fails with [`CoordinatorError::InsufficientServers`] when fewer than
/// `replica` candidates exist, since replicas must be pairwise distinct.
pub fn assign(
    mut candidates: Vec<ServerNode>,
    partition_num: u32,
    partition_num_per_range: u32,
    replica: u32,
) -> Result<Assignments, CoordinatorError> {
    if partition_num == 0 || partition_num_per_range == 0 || replica == 0 {
        return Err(CoordinatorError::InvalidAssignment(format!(
            "partition_num={partition_num}, partition_num_per_range={partition_num_per_range}, \
             replica={replica} must all be positive"
        )));
    }
    if candidates.len() < replica as usize {
        return Err(CoordinatorError::InsufficientServers {
            need: replica as usize,
            have: candidates.len(),
        });
    }

    // Least-loaded first; server id breaks ties deterministically.
    candidates.sort_by(|a, b| {
        a.load_key()
            .cmp(&b.load_key())
            .then_with(|| a.info.id.cmp(&b.info.id))
    });
    let n = candidates.len();

    let mut partition_to_servers = Vec::with_capacity(partition_num as usize);
    let mut ranges_by_server: BTreeMap<ServerId, (ShuffleServerInfo, Vec<PartitionRange>)> =
        BTreeMap::new();

    for (range_idx, start) in (0..partition_num).step_by(partition_num_per_range as usize).enumerate() {
        let end = (start + partition_num_per_range).min(partition_num);
        let range = PartitionRange::new(start, end);

        // Rotate the starting index so successive ranges spread load.
        let rotation = (range_idx * replica as usize) % n;
        let servers: Vec<ShuffleServerInfo> = (0..replica as usize)
            .map(|j| candidates[(rotation + j) % n].info.clone())
            .collect();

        for server in &servers {
            ranges_by_server
                .entry(server.id.clone())
                .or_insert_with(|| (server.clone(), Vec::new()))
                .1
                .push(range);
        }
        for partition in start..end {
            partition_to_servers.push((PartitionId::new(partition), servers.clone()));
        }
    }

    Ok(Assignments {
        partition_to_servers,
        server_to_ranges: ranges_by_server.into_values().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_wire::ServerLoadStats;
    use std::collections::HashSet;
    use std::time::Duration;

    fn nodes(count: usize) -> Vec<ServerNode> {
        use crate::registry::ServerRegistry;
        let registry = ServerRegistry::new(Duration::from_secs(60));
        for i in 0..count {
            registry.heartbeat(
                skein_types::ShuffleServerInfo::new(format!("host-{i}"), 19999),
                ServerLoadStats {
                    used_memory: (i as u64) * 100,
                    ..ServerLoadStats::default()
                },
            );
        }
        registry.candidates(&std::collections::BTreeSet::new())
    }

    #[test]
    fn every_partition_gets_replica_distinct_servers() {
        let assignments = assign(nodes(5), 16, 4, 3).unwrap();
        assert_eq!(assignments.partition_to_servers.len(), 16);
        for (_, servers) in &assignments.partition_to_servers {
            assert_eq!(servers.len(), 3);
            let unique: HashSet<_> = servers.iter().map(|s| s.id.clone()).collect();
            assert_eq!(unique.len(), 3, "replicas must be pairwise distinct");
        }
    }

    #[test]
    fn ranges_cover_partition_space_without_overlap() {
        let assignments = assign(nodes(4), 10, 4, 2).unwrap();
        // Ranges are 0-4, 4-8, 8-10.
        let mut covered = vec![false; 10];
        for (server, ranges) in &assignments.server_to_ranges {
            assert!(!server.id.as_str().is_empty());
            for range in ranges {
                for p in range.start()..range.end() {
                    covered[p as usize] = true;
                }
            }
        }
        assert!(covered.iter().all(|&c| c));
    }

    #[test]
    fn successive_ranges_rotate_across_servers() {
        let assignments = assign(nodes(6), 6, 1, 2).unwrap();
        // 6 single-partition ranges over 6 servers with replica 2: the
        // first replica of consecutive ranges must differ.
        let firsts: Vec<_> = assignments
            .partition_to_servers
            .iter()
            .map(|(_, servers)| servers[0].id.clone())
            .collect();
        assert_ne!(firsts[0], firsts[1]);
    }

    #[test]
    fn least_loaded_servers_are_picked_first() {
        let assignments = assign(nodes(4), 2, 2, 2).unwrap();
        // nodes() gives host-0 the least used memory; the single range's
        // first replica must be host-0.
        let (_, servers) = &assignments.partition_to_servers[0];
        assert_eq!(servers[0].host, "host-0");
    }

    #[test]
    fn too_few_candidates_fail() {
        let err = assign(nodes(2), 4, 2, 3).unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::InsufficientServers { need: 3, have: 2 }
        ));
    }

    #[test]
    fn zero_partitions_are_invalid() {
        let err = assign(nodes(3), 0, 2, 1).unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidAssignment(_)));
    }
}
