//! Abstract computation graphs made up of nodes connected with tubes.
//!
//! # Tubes
//!
//! A tube is a named, directed, FIFO channel between two nodes. Multiple
//! tubes can share a name as long as they connect different pairs of nodes,
//! but on any single node the names of incoming tubes must be unique, and
//! so must the names of outgoing tubes. This way a node can always refer to
//! a tube by name alone.

use std::collections::BTreeMap;

use fnv::FnvHashSet;

use crate::error::{Error, Result};
use crate::machine::Machine;
use crate::resource::ResourceType;

/// Index of a node within a task, unique in `0..node_count`.
pub type NodeIndex = usize;

/// Single participant in a distributed task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub index: NodeIndex,
    pub machine: Machine,
    pub resource_type: ResourceType,
    /// Worker slot the node is bound to on its machine, known once the
    /// machine has accepted the task
    pub local_unit_index: Option<usize>,
}

/// Directed, named edge of a topology.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tube {
    pub name: String,
    pub source: NodeIndex,
    pub target: NodeIndex,
}

/// Tubes attached to a single node, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTubes {
    /// Incoming tube name mapped to the source node
    pub incoming: BTreeMap<String, NodeIndex>,
    /// Outgoing tube name mapped to the target node
    pub outgoing: BTreeMap<String, NodeIndex>,
}

/// Full set of tubes defining a task's communication graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    tubes: Vec<Tube>,
}

impl Topology {
    pub fn new() -> Self {
        Self { tubes: Vec::new() }
    }

    /// Builder-style variant of `add`.
    pub fn with(mut self, name: &str, source: NodeIndex, target: NodeIndex) -> Self {
        self.add(name, source, target);
        self
    }

    pub fn add(&mut self, name: &str, source: NodeIndex, target: NodeIndex) {
        self.tubes.push(Tube {
            name: name.to_string(),
            source,
            target,
        });
    }

    pub fn tubes(&self) -> &[Tube] {
        &self.tubes
    }

    pub fn is_empty(&self) -> bool {
        self.tubes.is_empty()
    }

    /// Checks that all the tubes connect existing nodes and that tube names
    /// are unambiguous on every node.
    pub fn validate(&self, node_count: usize) -> Result<()> {
        let mut triples = FnvHashSet::default();
        let mut incoming = FnvHashSet::default();
        let mut outgoing = FnvHashSet::default();
        for tube in &self.tubes {
            if tube.source >= node_count || tube.target >= node_count {
                return Err(Error::InvalidTopology(format!(
                    "tube \"{}\" ({} -> {}) references a node outside 0..{}",
                    tube.name, tube.source, tube.target, node_count
                )));
            }
            if !triples.insert((&tube.name, tube.source, tube.target)) {
                return Err(Error::InvalidTopology(format!(
                    "duplicate tube \"{}\" ({} -> {})",
                    tube.name, tube.source, tube.target
                )));
            }
            if !outgoing.insert((&tube.name, tube.source)) {
                return Err(Error::InvalidTopology(format!(
                    "node {} has more than one outgoing tube named \"{}\"",
                    tube.source, tube.name
                )));
            }
            if !incoming.insert((&tube.name, tube.target)) {
                return Err(Error::InvalidTopology(format!(
                    "node {} has more than one incoming tube named \"{}\"",
                    tube.target, tube.name
                )));
            }
        }
        Ok(())
    }

    /// Incoming tube names of a node mapped to their source nodes.
    pub fn incoming(&self, node: NodeIndex) -> BTreeMap<String, NodeIndex> {
        self.tubes
            .iter()
            .filter(|t| t.target == node)
            .map(|t| (t.name.clone(), t.source))
            .collect()
    }

    /// Outgoing tube names of a node mapped to their target nodes.
    pub fn outgoing(&self, node: NodeIndex) -> BTreeMap<String, NodeIndex> {
        self.tubes
            .iter()
            .filter(|t| t.source == node)
            .map(|t| (t.name.clone(), t.target))
            .collect()
    }

    /// Finds the node at the other end of an outgoing tube.
    pub fn target_of(&self, source: NodeIndex, name: &str) -> Option<NodeIndex> {
        self.tubes
            .iter()
            .find(|t| t.source == source && t.name == name)
            .map(|t| t.target)
    }

    /// Collects the tubes attached to the given node.
    pub fn tubes_for(&self, node: NodeIndex) -> NodeTubes {
        NodeTubes {
            incoming: self.incoming(node),
            outgoing: self.outgoing(node),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_names_on_disjoint_pairs() {
        // every node sends "next" to its neighbour
        let topology = Topology::new()
            .with("next", 0, 1)
            .with("next", 1, 2)
            .with("next", 2, 0);
        assert!(topology.validate(3).is_ok());
        let tubes = topology.tubes_for(1);
        assert_eq!(tubes.incoming.get("next"), Some(&0));
        assert_eq!(tubes.outgoing.get("next"), Some(&2));
        assert_eq!(topology.target_of(2, "next"), Some(0));
    }

    #[test]
    fn ambiguous_names_rejected() {
        let topology = Topology::new().with("out", 0, 1).with("out", 0, 2);
        assert!(topology.validate(3).is_err());
        let topology = Topology::new().with("in", 1, 0).with("in", 2, 0);
        assert!(topology.validate(3).is_err());
        let topology = Topology::new().with("a", 0, 1).with("a", 0, 1);
        assert!(topology.validate(2).is_err());
    }

    #[test]
    fn out_of_range_rejected() {
        let topology = Topology::new().with("a", 0, 2);
        assert!(topology.validate(2).is_err());
        assert!(topology.validate(3).is_ok());
    }
}
