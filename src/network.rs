//! Social network over agents.
//!
//! The network decides observability: an edge `i → j` means agent `i`
//! observes agent `j`'s actions and outcomes. The graph is passed to agents as
//! data; nothing downstream assumes a particular topology.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use rand::Rng;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{PolarisError, Result};
use crate::types::AgentId;

/// Shape of the observability graph.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case", tag = "kind"))]
pub enum Topology {
    /// Every agent observes every other agent.
    Complete,
    /// Agent `i` observes `i - 1` and `i + 1` (mod n).
    Ring,
    /// Every agent observes `center`; `center` observes everyone.
    Star { center: AgentId },
    /// Each pair is linked independently with `edge_probability`.
    Random { edge_probability: f64 },
    /// Explicit `(observer, observed)` pairs.
    Custom { edges: Vec<(AgentId, AgentId)> },
}

/// Network configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NetworkConfig {
    pub topology: Topology,
    /// When false every edge is mirrored, so observability is symmetric.
    pub directed: bool,
    /// Resample [`Topology::Random`] graphs at every episode reset.
    pub dynamic: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            topology: Topology::Complete,
            directed: false,
            dynamic: false,
        }
    }
}

impl NetworkConfig {
    /// Checks the configuration against the number of agents.
    pub fn validate(&self, num_agents: usize) -> Result<()> {
        match &self.topology {
            Topology::Star { center } if *center >= num_agents => Err(PolarisError::config(
                "network.topology",
                format!("star center {} out of range for {} agents", center, num_agents),
            )),
            Topology::Random { edge_probability }
                if !(0.0..=1.0).contains(edge_probability) =>
            {
                Err(PolarisError::config(
                    "network.topology",
                    format!("edge probability {} outside [0, 1]", edge_probability),
                ))
            }
            Topology::Custom { edges } => {
                for &(from, to) in edges {
                    if from >= num_agents || to >= num_agents {
                        return Err(PolarisError::config(
                            "network.topology",
                            format!("edge ({}, {}) references unknown agent", from, to),
                        ));
                    }
                    if from == to {
                        return Err(PolarisError::config(
                            "network.topology",
                            format!("self-loop on agent {}", from),
                        ));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Returns true when resets should redraw the graph.
    pub fn resamples(&self) -> bool {
        self.dynamic && matches!(self.topology, Topology::Random { .. })
    }
}

/// Directed observability graph over agents `0..n`.
///
/// # Invariants
///
/// - Node `i` carries agent id `i`.
/// - No self-loops, no parallel edges.
/// - Neighbor lookups for unknown agents return an empty set.
#[derive(Debug, Clone)]
pub struct SocialNetwork {
    graph: DiGraph<AgentId, ()>,
}

impl SocialNetwork {
    /// Builds the network described by `config` for `num_agents` agents.
    pub fn build<R: Rng + ?Sized>(
        num_agents: usize,
        config: &NetworkConfig,
        rng: &mut R,
    ) -> Result<Self> {
        config.validate(num_agents)?;
        let mut graph = DiGraph::with_capacity(num_agents, num_agents * num_agents);
        for i in 0..num_agents {
            graph.add_node(i);
        }
        let mut net = Self { graph };

        let link = |net: &mut Self, i: AgentId, j: AgentId| {
            net.add_edge(i, j);
            if !config.directed {
                net.add_edge(j, i);
            }
        };

        match &config.topology {
            Topology::Complete => {
                for i in 0..num_agents {
                    for j in 0..num_agents {
                        if i != j {
                            link(&mut net, i, j);
                        }
                    }
                }
            }
            Topology::Ring => {
                if num_agents > 1 {
                    for i in 0..num_agents {
                        link(&mut net, i, (i + 1) % num_agents);
                        link(&mut net, i, (i + num_agents - 1) % num_agents);
                    }
                }
            }
            Topology::Star { center } => {
                for i in (0..num_agents).filter(|i| i != center) {
                    link(&mut net, i, *center);
                    link(&mut net, *center, i);
                }
            }
            Topology::Random { edge_probability } => {
                for i in 0..num_agents {
                    let start = if config.directed { 0 } else { i + 1 };
                    for j in start..num_agents {
                        if i != j && rng.gen_bool(*edge_probability) {
                            link(&mut net, i, j);
                        }
                    }
                }
            }
            Topology::Custom { edges } => {
                for &(i, j) in edges {
                    link(&mut net, i, j);
                }
            }
        }
        Ok(net)
    }

    fn add_edge(&mut self, observer: AgentId, observed: AgentId) {
        if observer != observed {
            self.graph
                .update_edge(NodeIndex::new(observer), NodeIndex::new(observed), ());
        }
    }

    pub fn num_agents(&self) -> usize {
        self.graph.node_count()
    }

    /// Agents whose actions `agent` observes, in ascending id order.
    pub fn neighbors(&self, agent: AgentId) -> Vec<AgentId> {
        if agent >= self.num_agents() {
            return Vec::new();
        }
        let mut out: Vec<AgentId> = self
            .graph
            .neighbors_directed(NodeIndex::new(agent), Direction::Outgoing)
            .map(|n| self.graph[n])
            .collect();
        out.sort_unstable();
        out
    }

    /// Number of agents `agent` observes.
    pub fn degree(&self, agent: AgentId) -> usize {
        if agent >= self.num_agents() {
            return 0;
        }
        self.graph
            .neighbors_directed(NodeIndex::new(agent), Direction::Outgoing)
            .count()
    }

    /// True when `agent` observes nobody (autarky).
    pub fn is_isolated(&self, agent: AgentId) -> bool {
        self.degree(agent) == 0
    }

    /// Returns true if `observer` sees `observed`.
    pub fn observes(&self, observer: AgentId, observed: AgentId) -> bool {
        observer < self.num_agents()
            && observed < self.num_agents()
            && self
                .graph
                .contains_edge(NodeIndex::new(observer), NodeIndex::new(observed))
    }

    /// Adjacency lists, one per agent.
    pub fn adjacency(&self) -> Vec<Vec<AgentId>> {
        (0..self.num_agents()).map(|i| self.neighbors(i)).collect()
    }

    pub fn num_edges(&self) -> usize {
        self.graph.edge_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn build(n: usize, topology: Topology, directed: bool) -> SocialNetwork {
        let config = NetworkConfig {
            topology,
            directed,
            dynamic: false,
        };
        SocialNetwork::build(n, &config, &mut StdRng::seed_from_u64(0)).unwrap()
    }

    #[test]
    fn complete_network() {
        let net = build(4, Topology::Complete, false);
        assert_eq!(net.neighbors(0), vec![1, 2, 3]);
        assert_eq!(net.num_edges(), 12);
        assert!(!net.observes(2, 2));
    }

    #[test]
    fn ring_network() {
        let net = build(5, Topology::Ring, false);
        assert_eq!(net.neighbors(0), vec![1, 4]);
        assert_eq!(net.degree(3), 2);
    }

    #[test]
    fn two_agent_ring_has_no_duplicates() {
        let net = build(2, Topology::Ring, false);
        assert_eq!(net.neighbors(0), vec![1]);
        assert_eq!(net.num_edges(), 2);
    }

    #[test]
    fn star_network() {
        let net = build(4, Topology::Star { center: 0 }, false);
        assert_eq!(net.neighbors(0), vec![1, 2, 3]);
        assert_eq!(net.neighbors(2), vec![0]);
    }

    #[test]
    fn directed_custom_network() {
        let net = build(3, Topology::Custom { edges: vec![(0, 1)] }, true);
        assert!(net.observes(0, 1));
        assert!(!net.observes(1, 0));
        assert!(net.is_isolated(2));
    }

    #[test]
    fn unknown_agent_has_no_neighbors() {
        let net = build(3, Topology::Complete, false);
        assert!(net.neighbors(10).is_empty());
        assert_eq!(net.degree(10), 0);
    }

    #[test]
    fn rejects_bad_custom_edges() {
        let config = NetworkConfig {
            topology: Topology::Custom {
                edges: vec![(0, 0)],
            },
            ..NetworkConfig::default()
        };
        assert!(config.validate(2).is_err());
        let config = NetworkConfig {
            topology: Topology::Custom {
                edges: vec![(0, 5)],
            },
            ..NetworkConfig::default()
        };
        assert!(matches!(
            config.validate(2),
            Err(PolarisError::Configuration { .. })
        ));
    }

    #[test]
    fn random_network_is_symmetric_when_undirected() {
        let net = build(
            8,
            Topology::Random {
                edge_probability: 0.5,
            },
            false,
        );
        for i in 0..8 {
            for j in net.neighbors(i) {
                assert!(net.observes(j, i));
            }
        }
    }
}
