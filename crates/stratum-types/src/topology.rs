//! Rank topology: nodes, groups, ring neighbors.
//!
//! Every process derives the same picture from the rank count and the
//! configuration; there is no negotiation. Neighbors in the group ring are
//! nodes, and the peer on a neighbor node is the application rank with the
//! same node rank.

use stratum_error::{Result, StratumError};

use crate::Config;

/// Topology of the current process, derived once at init.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Total number of processes.
    pub nb_proc: u32,
    /// Total number of nodes.
    pub nb_nodes: u32,
    /// My rank in the global communicator.
    pub my_rank: u32,
    /// My rank in the split (application or head) communicator.
    pub split_rank: u32,
    /// Processes per node.
    pub node_size: u32,
    /// Dedicated head processes per node (0 or 1).
    pub nb_heads: u32,
    /// Application processes per node.
    pub nb_approcs: u32,
    /// Nodes per group.
    pub group_size: u32,
    /// Index of the sector (block of `group_size` nodes) this node sits in.
    pub sector_id: u32,
    /// Node index of this process.
    pub node_id: u32,
    /// Position of this node in its group ring.
    pub group_rank: u32,
    /// Whether this process is a head.
    pub am_head: bool,
    /// Global rank of the head on this node, if any.
    pub head_rank: Option<u32>,
    /// My rank within the node (0-based over all processes of the node).
    pub node_rank: u32,
    /// Global rank of my peer on the left ring neighbor node.
    pub left: u32,
    /// Global rank of my peer on the right ring neighbor node.
    pub right: u32,
    /// Global ranks of the application processes on this node.
    pub body: Vec<u32>,
}

impl Topology {
    /// Derive the topology for `my_rank` out of `nb_proc` ranks.
    ///
    /// Fails with `ConfigInvalid` when the rank count does not tile into
    /// nodes, nodes do not tile into groups, or the group size is
    /// incompatible with the scheduled levels.
    pub fn derive(cfg: &Config, nb_proc: u32, my_rank: u32) -> Result<Self> {
        let node_size = cfg.node_size;
        let nb_heads = cfg.heads_per_node;
        let group_size = cfg.group_size.max(1);

        if nb_proc == 0 || my_rank >= nb_proc {
            return Err(StratumError::config(format!(
                "rank {my_rank} outside communicator of size {nb_proc}"
            )));
        }
        if nb_proc % node_size != 0 {
            return Err(StratumError::config(format!(
                "number of ranks ({nb_proc}) is not a multiple of the node size ({node_size})"
            )));
        }
        let nb_nodes = nb_proc / node_size;
        if nb_nodes % group_size != 0 {
            return Err(StratumError::config(format!(
                "number of nodes ({nb_nodes}) is not a multiple of the group size ({group_size})"
            )));
        }
        let l2_scheduled = cfg.level_scheduled(1);
        let l3_scheduled = cfg.level_scheduled(2);
        if group_size <= 2 && (l2_scheduled || l3_scheduled) {
            return Err(StratumError::config(format!(
                "group size ({group_size}) must be bigger than 2"
            )));
        }
        if group_size >= 32 && l3_scheduled {
            return Err(StratumError::config(format!(
                "group size ({group_size}) must be lower than 32"
            )));
        }

        let nb_approcs = node_size - nb_heads;
        let node_id = my_rank / node_size;
        let node_rank = my_rank % node_size;
        let am_head = node_rank < nb_heads;
        let head_rank = (nb_heads == 1).then(|| node_id * node_size);

        let sector_id = node_id / group_size;
        let group_rank = node_id % group_size;
        let sector_base = sector_id * group_size;
        let left_node = sector_base + (group_rank + group_size - 1) % group_size;
        let right_node = sector_base + (group_rank + 1) % group_size;
        let left = left_node * node_size + node_rank;
        let right = right_node * node_size + node_rank;

        let split_rank = if am_head {
            node_id
        } else {
            node_id * nb_approcs + (node_rank - nb_heads)
        };

        let body = (nb_heads..node_size)
            .map(|slot| node_id * node_size + slot)
            .collect();

        Ok(Self {
            nb_proc,
            nb_nodes,
            my_rank,
            split_rank,
            node_size,
            nb_heads,
            nb_approcs,
            group_size,
            sector_id,
            node_id,
            group_rank,
            am_head,
            head_rank,
            node_rank,
            left,
            right,
            body,
        })
    }

    /// Global ranks of my Reed-Solomon group, ordered by ring position.
    /// The members are my peers (same node rank) on the sector's nodes.
    #[must_use]
    pub fn group_members(&self) -> Vec<u32> {
        let sector_base = self.sector_id * self.group_size;
        (0..self.group_size)
            .map(|pos| (sector_base + pos) * self.node_size + self.node_rank)
            .collect()
    }

    /// The rank holding my L2 backup (peer on the right ring neighbor).
    #[must_use]
    pub const fn partner_holder(&self) -> u32 {
        self.right
    }

    /// The rank whose L2 backup this process holds (peer on the left).
    #[must_use]
    pub const fn partner_owned(&self) -> u32 {
        self.left
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(node_size: u32, heads: u32, group_size: u32) -> Config {
        Config {
            node_size,
            heads_per_node: heads,
            group_size,
            ..Config::default()
        }
    }

    #[test]
    fn test_flat_four_node_ring() {
        let cfg = cfg(1, 0, 4);
        let topo = Topology::derive(&cfg, 4, 1).unwrap();
        assert_eq!(topo.nb_nodes, 4);
        assert_eq!(topo.node_id, 1);
        assert_eq!(topo.group_rank, 1);
        assert_eq!(topo.left, 0);
        assert_eq!(topo.right, 2);
        assert_eq!(topo.group_members(), vec![0, 1, 2, 3]);
        assert!(!topo.am_head);
        assert_eq!(topo.head_rank, None);
    }

    #[test]
    fn test_ring_wraps_at_sector_boundary() {
        let cfg = cfg(1, 0, 4);
        let topo = Topology::derive(&cfg, 4, 0).unwrap();
        assert_eq!(topo.left, 3, "left neighbor of ring position 0 wraps");
        assert_eq!(topo.right, 1);
        let topo = Topology::derive(&cfg, 4, 3).unwrap();
        assert_eq!(topo.right, 0, "right neighbor of last position wraps");
    }

    #[test]
    fn test_heads_split_node_population() {
        let cfg = cfg(4, 1, 1);
        // 8 ranks, 2 nodes of 4, one head each.
        let head = Topology::derive(&cfg, 8, 4).unwrap();
        assert!(head.am_head);
        assert_eq!(head.node_id, 1);
        assert_eq!(head.split_rank, 1);
        assert_eq!(head.body, vec![5, 6, 7]);

        let app = Topology::derive(&cfg, 8, 6).unwrap();
        assert!(!app.am_head);
        assert_eq!(app.nb_approcs, 3);
        assert_eq!(app.head_rank, Some(4));
        assert_eq!(app.node_rank, 2);
        assert_eq!(app.split_rank, 1 * 3 + 1);
    }

    #[test]
    fn test_rank_count_must_tile_into_nodes() {
        let cfg = cfg(4, 0, 1);
        let err = Topology::derive(&cfg, 6, 0).unwrap_err();
        assert!(matches!(err, StratumError::ConfigInvalid { .. }));
    }

    #[test]
    fn test_nodes_must_tile_into_groups() {
        let cfg = cfg(1, 0, 4);
        let err = Topology::derive(&cfg, 6, 0).unwrap_err();
        assert!(matches!(err, StratumError::ConfigInvalid { .. }));
    }

    #[test]
    fn test_group_size_bounds_against_scheduled_levels() {
        let mut small = cfg(1, 0, 2);
        small.ckpt_interval[1] = Some(5);
        assert!(Topology::derive(&small, 4, 0).is_err());

        let mut large = cfg(1, 0, 32);
        large.ckpt_interval[2] = Some(5);
        assert!(Topology::derive(&large, 32, 0).is_err());

        // Same group sizes are fine when nothing is scheduled on L2/L3.
        let quiet = cfg(1, 0, 2);
        assert!(Topology::derive(&quiet, 4, 0).is_ok());
    }

    #[test]
    fn test_group_members_track_node_rank() {
        let cfg = cfg(2, 0, 2);
        // 8 ranks, 4 nodes of 2, groups of 2 nodes.
        let topo = Topology::derive(&cfg, 8, 5).unwrap();
        assert_eq!(topo.node_id, 2);
        assert_eq!(topo.sector_id, 1);
        assert_eq!(topo.node_rank, 1);
        assert_eq!(topo.group_members(), vec![5, 7]);
    }

    #[test]
    fn test_partner_roles_are_symmetric() {
        let cfg = cfg(1, 0, 4);
        for rank in 0..4 {
            let topo = Topology::derive(&cfg, 4, rank).unwrap();
            let holder = Topology::derive(&cfg, 4, topo.partner_holder()).unwrap();
            assert_eq!(holder.partner_owned(), rank);
        }
    }
}
