//! A generic, insertion-ordered directed graph with topological sort,
//! transitive downstream closure, and three-color cycle detection.

use indexmap::{IndexMap, IndexSet};
use snafu::{OptionExt, Snafu};
use std::fmt::Debug;
use std::hash::Hash;

#[derive(Debug, Snafu)]
pub enum DigraphError<N: Debug> {
    #[snafu(display("unknown node {node:?}"))]
    UnknownNode { node: N },

    #[snafu(display("cycle detected: {cycle:?}"))]
    Cycle { cycle: Vec<N> },
}

pub type Result<T, N> = std::result::Result<T, DigraphError<N>>;

/// A node key. Opaque labels in practice (strings), but kept generic so the
/// graph itself carries no assumptions about identity representation.
pub trait Node: Clone + Eq + Hash + Ord + Debug {}
impl<T: Clone + Eq + Hash + Ord + Debug> Node for T {}

#[derive(Debug, Clone, Default)]
pub struct Digraph<N: Node> {
    nodes: IndexSet<N>,
    succ: IndexMap<N, IndexSet<N>>,
    pred: IndexMap<N, IndexSet<N>>,
}

impl<N: Node> Digraph<N> {
    pub fn new() -> Self {
        Self {
            nodes: IndexSet::new(),
            succ: IndexMap::new(),
            pred: IndexMap::new(),
        }
    }

    pub fn contains_node(&self, node: &N) -> bool {
        self.nodes.contains(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &N> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_node(&mut self, node: N) {
        if self.nodes.insert(node.clone()) {
            self.succ.insert(node.clone(), IndexSet::new());
            self.pred.insert(node, IndexSet::new());
        }
    }

    /// Removes a node and prunes every edge that referred to it.
    pub fn delete_node(&mut self, node: &N) {
        if !self.nodes.swap_remove(node) {
            return;
        }

        if let Some(successors) = self.succ.swap_remove(node) {
            for s in &successors {
                if let Some(p) = self.pred.get_mut(s) {
                    p.swap_remove(node);
                }
            }
        }

        if let Some(predecessors) = self.pred.swap_remove(node) {
            for p in &predecessors {
                if let Some(s) = self.succ.get_mut(p) {
                    s.swap_remove(node);
                }
            }
        }
    }

    /// Adds an edge, auto-adding both endpoints. Idempotent.
    pub fn add_edge(&mut self, src: N, dst: N) {
        self.add_node(src.clone());
        self.add_node(dst.clone());
        self.succ.get_mut(&src).unwrap().insert(dst.clone());
        self.pred.get_mut(&dst).unwrap().insert(src);
    }

    pub fn delete_edge(&mut self, src: &N, dst: &N) {
        if let Some(s) = self.succ.get_mut(src) {
            s.swap_remove(dst);
        }
        if let Some(p) = self.pred.get_mut(dst) {
            p.swap_remove(src);
        }
    }

    pub fn predecessors(&self, node: &N) -> Result<Vec<N>, N> {
        self.pred
            .get(node)
            .map(|p| p.iter().cloned().collect())
            .context(UnknownNodeSnafu { node: node.clone() })
    }

    /// One hop downstream, in insertion order.
    pub fn downstream(&self, node: &N) -> Result<Vec<N>, N> {
        self.succ
            .get(node)
            .map(|s| s.iter().cloned().collect())
            .context(UnknownNodeSnafu { node: node.clone() })
    }

    /// Transitive closure of `downstream`, as an (unordered) set that does
    /// not include `node` itself unless a cycle loops back to it.
    pub fn all_downstreams(&self, node: &N) -> Result<IndexSet<N>, N> {
        let start = self.downstream(node)?;

        let mut seen: IndexSet<N> = IndexSet::new();
        let mut queue: Vec<N> = start;
        while let Some(n) = queue.pop() {
            if seen.insert(n.clone()) {
                if let Some(next) = self.succ.get(&n) {
                    queue.extend(next.iter().cloned());
                }
            }
        }

        Ok(seen)
    }

    /// Nodes with no incoming edge, in insertion order.
    pub fn ind_nodes(&self) -> Vec<N> {
        self.nodes
            .iter()
            .filter(|n| self.pred.get(*n).map(|p| p.is_empty()).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Three-color (white/grey/black) depth-first topological sort. Uses an
    /// explicit stack rather than recursion so a discovered cycle's path can
    /// be reconstructed without unwinding call frames.
    pub fn topological_sort(&self) -> Result<Vec<N>, N> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }

        let mut color: IndexMap<N, Color> =
            self.nodes.iter().map(|n| (n.clone(), Color::White)).collect();
        let mut order: Vec<N> = Vec::with_capacity(self.nodes.len());
        // Stack of (node, next successor index to visit), mirroring the
        // grey path from the DFS root to the node currently being expanded.
        let mut stack: Vec<(N, usize)> = Vec::new();

        for root in self.nodes.iter() {
            if color[root] != Color::White {
                continue;
            }

            stack.push((root.clone(), 0));
            color.insert(root.clone(), Color::Grey);

            while let Some((node, idx)) = stack.last().cloned() {
                let successors = self
                    .succ
                    .get(&node)
                    .map(|s| s.iter().cloned().collect::<Vec<_>>())
                    .unwrap_or_default();

                if idx >= successors.len() {
                    color.insert(node.clone(), Color::Black);
                    order.push(node);
                    stack.pop();
                    continue;
                }

                stack.last_mut().unwrap().1 += 1;
                let next = &successors[idx];

                match color.get(next).copied().unwrap_or(Color::White) {
                    Color::White => {
                        color.insert(next.clone(), Color::Grey);
                        stack.push((next.clone(), 0));
                    }
                    Color::Grey => {
                        let mut cycle: Vec<N> =
                            stack.iter().map(|(n, _)| n.clone()).collect();
                        while cycle.first() != Some(next) {
                            cycle.remove(0);
                        }
                        cycle.push(next.clone());
                        return CycleSnafu { cycle }.fail();
                    }
                    Color::Black => {}
                }
            }
        }

        order.reverse();
        Ok(order)
    }

    pub fn is_acyclic(&self) -> bool {
        self.topological_sort().is_ok()
    }

    pub fn reset_graph(&mut self) {
        self.nodes.clear();
        self.succ.clear();
        self.pred.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn chain() -> Digraph<String> {
        let mut g = Digraph::new();
        g.add_edge("a".into(), "b".into());
        g.add_edge("b".into(), "c".into());
        g
    }

    #[test]
    fn topo_sort_respects_edge_order() {
        let g = chain();
        let order = g.topological_sort().unwrap();
        let idx = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(idx("a") < idx("b"));
        assert!(idx("b") < idx("c"));
    }

    #[test]
    fn ind_nodes_has_no_incoming() {
        let g = chain();
        assert_eq!(g.ind_nodes(), vec!["a".to_string()]);
    }

    #[test]
    fn all_downstreams_is_transitive() {
        let g = chain();
        let down = g.all_downstreams(&"a".to_string()).unwrap();
        assert!(down.contains("b"));
        assert!(down.contains("c"));
    }

    #[test]
    fn delete_node_prunes_edges() {
        let mut g = chain();
        g.delete_node(&"b".to_string());
        assert!(g.downstream(&"a".to_string()).unwrap().is_empty());
        assert!(g.predecessors(&"c".to_string()).unwrap().is_empty());
    }

    #[test]
    fn cycle_is_detected_with_full_path() {
        let mut g = Digraph::new();
        g.add_edge("a".into(), "b".into());
        g.add_edge("b".into(), "c".into());
        g.add_edge("c".into(), "a".into());

        let err = g.topological_sort().unwrap_err();
        match err {
            DigraphError::Cycle { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
            }
            _ => panic!("expected a cycle error"),
        }
        assert!(!g.is_acyclic());
    }

    #[test]
    fn downstream_of_unknown_node_raises() {
        let g = chain();
        let err = g.downstream(&"z".to_string()).unwrap_err();
        matches!(err, DigraphError::UnknownNode { .. });
    }

    #[test]
    fn reset_graph_clears_everything() {
        let mut g = chain();
        g.reset_graph();
        assert!(g.is_empty());
        assert!(g.ind_nodes().is_empty());
    }

    #[test]
    fn add_edge_is_idempotent() {
        let mut g = Digraph::new();
        g.add_edge("a".into(), "b".into());
        g.add_edge("a".into(), "b".into());
        assert_eq!(g.downstream(&"a".to_string()).unwrap(), vec!["b".to_string()]);
    }
}
