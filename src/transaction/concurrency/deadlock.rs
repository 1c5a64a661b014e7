use std::collections::{BTreeMap, BTreeSet};

use crate::common::types::TxnId;

/// Directed waits-for graph over active transactions: an edge u → v means
/// u is waiting on a lock granted to v. Adjacency is kept ordered so cycle
/// search is deterministic (nodes and neighbors visited in ascending txn id).
#[derive(Default)]
pub struct WaitsForGraph {
    edges: BTreeMap<TxnId, BTreeSet<TxnId>>,
}

impl WaitsForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&mut self, from: TxnId, to: TxnId) {
        self.edges.entry(from).or_default().insert(to);
    }

    pub fn remove_edge(&mut self, from: TxnId, to: TxnId) {
        if let Some(targets) = self.edges.get_mut(&from) {
            targets.remove(&to);
        }
    }

    /// Drop a transaction's node and every edge touching it
    pub fn remove_txn(&mut self, txn_id: TxnId) {
        self.edges.remove(&txn_id);
        for targets in self.edges.values_mut() {
            targets.remove(&txn_id);
        }
    }

    /// All edges in ascending (from, to) order
    pub fn edge_list(&self) -> Vec<(TxnId, TxnId)> {
        self.edges
            .iter()
            .flat_map(|(&from, targets)| targets.iter().map(move |&to| (from, to)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.values().all(|targets| targets.is_empty())
    }

    /// Find one cycle, or None if the graph is acyclic. DFS roots and
    /// neighbors are visited in ascending txn id, so the same graph always
    /// yields the same cycle.
    pub fn find_cycle(&self) -> Option<Vec<TxnId>> {
        let mut done = BTreeSet::new();
        for &start in self.edges.keys() {
            if done.contains(&start) {
                continue;
            }
            let mut path = Vec::new();
            let mut on_path = BTreeSet::new();
            if let Some(cycle) = self.dfs(start, &mut path, &mut on_path, &mut done) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs(
        &self,
        node: TxnId,
        path: &mut Vec<TxnId>,
        on_path: &mut BTreeSet<TxnId>,
        done: &mut BTreeSet<TxnId>,
    ) -> Option<Vec<TxnId>> {
        path.push(node);
        on_path.insert(node);

        if let Some(targets) = self.edges.get(&node) {
            for &next in targets {
                if on_path.contains(&next) {
                    // Back edge: the cycle is the path suffix from `next`
                    let start = path.iter().position(|&n| n == next).unwrap();
                    return Some(path[start..].to_vec());
                }
                if done.contains(&next) {
                    continue;
                }
                if let Some(cycle) = self.dfs(next, path, on_path, done) {
                    return Some(cycle);
                }
            }
        }

        path.pop();
        on_path.remove(&node);
        done.insert(node);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_cycle_in_dag() {
        let mut graph = WaitsForGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(2, 3);
        graph.add_edge(1, 3);
        assert_eq!(graph.find_cycle(), None);
    }

    #[test]
    fn test_two_txn_cycle() {
        let mut graph = WaitsForGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(2, 1);
        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle.len(), 2);
        assert!(cycle.contains(&1) && cycle.contains(&2));
    }

    #[test]
    fn test_cycle_excludes_tail() {
        // 1 → 2 → 3 → 2: the cycle is {2, 3}, not the lead-in from 1
        let mut graph = WaitsForGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(2, 3);
        graph.add_edge(3, 2);
        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle, vec![2, 3]);
    }

    #[test]
    fn test_removing_victim_breaks_cycle() {
        let mut graph = WaitsForGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(2, 1);
        let cycle = graph.find_cycle().unwrap();
        let victim = *cycle.iter().max().unwrap();
        assert_eq!(victim, 2);

        graph.remove_txn(victim);
        assert_eq!(graph.find_cycle(), None);
    }

    #[test]
    fn test_two_independent_cycles() {
        let mut graph = WaitsForGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(2, 1);
        graph.add_edge(5, 6);
        graph.add_edge(6, 5);

        // Deterministic order: the lowest-id cycle surfaces first
        let first = graph.find_cycle().unwrap();
        assert!(first.contains(&1));
        graph.remove_txn(*first.iter().max().unwrap());

        let second = graph.find_cycle().unwrap();
        assert!(second.contains(&5));
        graph.remove_txn(*second.iter().max().unwrap());
        assert_eq!(graph.find_cycle(), None);
    }

    #[test]
    fn test_edge_list_is_sorted() {
        let mut graph = WaitsForGraph::new();
        graph.add_edge(3, 1);
        graph.add_edge(1, 2);
        graph.add_edge(1, 3);
        assert_eq!(graph.edge_list(), vec![(1, 2), (1, 3), (3, 1)]);

        graph.remove_edge(1, 3);
        assert_eq!(graph.edge_list(), vec![(1, 2), (3, 1)]);
    }
}
