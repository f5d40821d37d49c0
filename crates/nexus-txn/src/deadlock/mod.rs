//! Deadlock prevention using a waits-for graph.
//!
//! Nodes are transactions; an edge `T1 -> T2` means T1 is queued on a lock
//! that T2 currently owns. A request is only allowed to wait if adding its
//! edges keeps the graph acyclic, so a deadlock is refused at the moment it
//! would form instead of being found later:
//!
//! ```text
//! T1 waits for T2:  T1 -> T2
//! T2 waits for T3:  T2 -> T3
//! T3 asks for T1:   T3 -> T1 would close T1 -> T2 -> T3 -> T1, rejected
//! ```
//!
//! The graph itself does no locking. The lock manager keeps it behind a
//! single mutex so that a check and the commit of its edges form one step.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use nexus_common::types::TxnId;

/// The waits-for graph.
#[derive(Default, Clone)]
pub struct WaitForGraph {
    /// Transactions known to the graph.
    nodes: HashSet<TxnId>,
    /// Edges: waiter -> set of holders it's waiting for.
    edges: HashMap<TxnId, HashSet<TxnId>>,
}

impl WaitForGraph {
    /// Creates a new empty waits-for graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a transaction to the graph. Returns false if it was present.
    pub fn add_node(&mut self, txn_id: TxnId) -> bool {
        self.nodes.insert(txn_id)
    }

    /// Returns true if the transaction is a node of the graph.
    pub fn contains_node(&self, txn_id: TxnId) -> bool {
        self.nodes.contains(&txn_id)
    }

    /// Removes a transaction along with every edge touching it.
    pub fn remove_node(&mut self, txn_id: TxnId) -> bool {
        self.edges.remove(&txn_id);
        self.edges.retain(|_, holders| {
            holders.remove(&txn_id);
            !holders.is_empty()
        });
        self.nodes.remove(&txn_id)
    }

    /// Returns true if inserting `from -> to` would close a cycle, i.e. `to`
    /// already reaches `from`.
    pub fn would_create_cycle(&self, from: TxnId, to: TxnId) -> bool {
        self.find_path(to, from).is_some()
    }

    /// Inserts the edge `waiter -> holder`, adding missing nodes.
    ///
    /// The caller must have checked [`would_create_cycle`](Self::would_create_cycle)
    /// under the same lock.
    pub fn add_edge(&mut self, waiter: TxnId, holder: TxnId) {
        debug_assert!(
            !self.would_create_cycle(waiter, holder),
            "edge {waiter} -> {holder} closes a cycle"
        );
        self.nodes.insert(waiter);
        self.nodes.insert(holder);
        self.edges.entry(waiter).or_default().insert(holder);
    }

    /// Removes the edge `waiter -> holder`.
    #[cfg(test)]
    pub(crate) fn remove_edge(&mut self, waiter: TxnId, holder: TxnId) -> bool {
        let Some(holders) = self.edges.get_mut(&waiter) else {
            return false;
        };
        let removed = holders.remove(&holder);
        if holders.is_empty() {
            self.edges.remove(&waiter);
        }
        removed
    }

    /// Drops every outgoing edge of `waiter`.
    pub fn clear_waits(&mut self, waiter: TxnId) {
        self.edges.remove(&waiter);
    }

    /// Replaces the outgoing edges of `waiter` with `holders`.
    ///
    /// Used when the owners of the lock `waiter` is queued on change. The new
    /// holders have just been granted and wait on nothing, so the result
    /// stays acyclic.
    pub fn set_waits(&mut self, waiter: TxnId, holders: impl IntoIterator<Item = TxnId>) {
        self.edges.remove(&waiter);
        for holder in holders {
            if holder != waiter {
                self.add_edge(waiter, holder);
            }
        }
    }

    /// Returns the holders `waiter` currently waits for.
    pub fn waits_for(&self, waiter: TxnId) -> Vec<TxnId> {
        let mut holders: Vec<TxnId> = self
            .edges
            .get(&waiter)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        holders.sort_unstable();
        holders
    }

    /// Checks if a transaction has outgoing edges.
    pub fn is_waiting(&self, txn_id: TxnId) -> bool {
        self.edges.contains_key(&txn_id)
    }

    /// Checks if any transaction waits for `txn_id`.
    #[cfg(test)]
    pub(crate) fn is_waited_on(&self, txn_id: TxnId) -> bool {
        self.edges.values().any(|holders| holders.contains(&txn_id))
    }

    /// Finds a shortest path `from -> ... -> to` by breadth-first search.
    ///
    /// The returned path starts with `from` and ends with `to`.
    pub fn find_path(&self, from: TxnId, to: TxnId) -> Option<Vec<TxnId>> {
        if from == to {
            return Some(vec![from]);
        }

        let mut parents: HashMap<TxnId, TxnId> = HashMap::new();
        let mut queue = VecDeque::from([from]);

        while let Some(txn) = queue.pop_front() {
            let Some(holders) = self.edges.get(&txn) else {
                continue;
            };
            for &holder in holders {
                if holder == from || parents.contains_key(&holder) {
                    continue;
                }
                parents.insert(holder, txn);
                if holder == to {
                    let mut path = vec![to];
                    let mut cur = to;
                    while let Some(&prev) = parents.get(&cur) {
                        path.push(prev);
                        cur = prev;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(holder);
            }
        }

        None
    }

    /// Returns a cycle through `start`, if one exists.
    ///
    /// The cycle is listed from `start` without repeating it at the end. The
    /// lock manager never commits a cycle, so this is a diagnostic.
    pub fn find_cycle(&self, start: TxnId) -> Option<Vec<TxnId>> {
        let holders = self.edges.get(&start)?;
        let mut best: Option<Vec<TxnId>> = None;
        for &holder in holders {
            if let Some(mut path) = self.find_path(holder, start) {
                path.pop();
                path.insert(0, start);
                if best.as_ref().map_or(true, |b| path.len() < b.len()) {
                    best = Some(path);
                }
            }
        }
        best
    }

    /// Returns true if the graph contains any cycle.
    #[cfg(test)]
    pub(crate) fn has_cycle(&self) -> bool {
        self.edges.keys().any(|&txn| self.find_cycle(txn).is_some())
    }

    /// Returns all edges, sorted.
    pub fn edges(&self) -> Vec<(TxnId, TxnId)> {
        let mut edges: Vec<(TxnId, TxnId)> = self
            .edges
            .iter()
            .flat_map(|(&waiter, holders)| holders.iter().map(move |&holder| (waiter, holder)))
            .collect();
        edges.sort_unstable();
        edges
    }

    /// Returns the number of transactions in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the number of wait edges.
    pub fn edge_count(&self) -> usize {
        self.edges.values().map(HashSet::len).sum()
    }

    /// Returns true if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl fmt::Debug for WaitForGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitForGraph")
            .field("node_count", &self.node_count())
            .field("edge_count", &self.edge_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(id: u64) -> TxnId {
        TxnId::new(id)
    }

    #[test]
    fn test_add_node_idempotent() {
        let mut wfg = WaitForGraph::new();

        assert!(wfg.add_node(t(1)));
        assert!(!wfg.add_node(t(1)));
        assert!(wfg.contains_node(t(1)));
        assert!(!wfg.contains_node(t(2)));
        assert_eq!(wfg.node_count(), 1);
    }

    #[test]
    fn test_add_remove_edge() {
        let mut wfg = WaitForGraph::new();

        wfg.add_edge(t(1), t(2));
        assert_eq!(wfg.edge_count(), 1);
        assert_eq!(wfg.node_count(), 2);
        assert!(wfg.is_waiting(t(1)));
        assert!(wfg.is_waited_on(t(2)));

        assert!(wfg.remove_edge(t(1), t(2)));
        assert!(!wfg.remove_edge(t(1), t(2)));
        assert_eq!(wfg.edge_count(), 0);
        assert!(!wfg.is_waiting(t(1)));
    }

    #[test]
    fn test_no_cycle_on_chain() {
        let mut wfg = WaitForGraph::new();

        // T1 -> T2 -> T3
        wfg.add_edge(t(1), t(2));
        wfg.add_edge(t(2), t(3));

        assert!(!wfg.would_create_cycle(t(1), t(3)));
        assert!(!wfg.would_create_cycle(t(4), t(1)));
        assert!(!wfg.has_cycle());
    }

    #[test]
    fn test_two_way_cycle() {
        let mut wfg = WaitForGraph::new();

        wfg.add_edge(t(1), t(2));
        assert!(wfg.would_create_cycle(t(2), t(1)));
    }

    #[test]
    fn test_three_way_cycle() {
        let mut wfg = WaitForGraph::new();

        // T1 -> T2 -> T3, then T3 -> T1 closes the loop
        wfg.add_edge(t(1), t(2));
        wfg.add_edge(t(2), t(3));

        assert!(wfg.would_create_cycle(t(3), t(1)));
        assert!(wfg.would_create_cycle(t(3), t(2)));
        assert!(!wfg.would_create_cycle(t(1), t(3)));
    }

    #[test]
    fn test_self_edge_is_cycle() {
        let wfg = WaitForGraph::new();
        assert!(wfg.would_create_cycle(t(1), t(1)));
    }

    #[test]
    fn test_unknown_nodes_never_cycle() {
        let wfg = WaitForGraph::new();
        assert!(!wfg.would_create_cycle(t(1), t(2)));
    }

    #[test]
    fn test_find_path() {
        let mut wfg = WaitForGraph::new();

        wfg.add_edge(t(1), t(2));
        wfg.add_edge(t(2), t(3));
        wfg.add_edge(t(1), t(4));

        assert_eq!(wfg.find_path(t(1), t(3)), Some(vec![t(1), t(2), t(3)]));
        assert_eq!(wfg.find_path(t(3), t(1)), None);
    }

    #[test]
    fn test_find_cycle_on_cloned_graph() {
        let mut wfg = WaitForGraph::new();
        wfg.add_edge(t(1), t(2));
        wfg.add_edge(t(2), t(3));

        // Force a cycle into a scratch copy to exercise the diagnostic.
        let mut scratch = wfg.clone();
        scratch.edges.entry(t(3)).or_default().insert(t(1));

        assert_eq!(scratch.find_cycle(t(1)), Some(vec![t(1), t(2), t(3)]));
        assert!(scratch.has_cycle());
        assert_eq!(wfg.find_cycle(t(1)), None);
    }

    #[test]
    fn test_set_and_clear_waits() {
        let mut wfg = WaitForGraph::new();

        wfg.set_waits(t(1), [t(2), t(3), t(1)]);
        assert_eq!(wfg.waits_for(t(1)), vec![t(2), t(3)]);

        wfg.set_waits(t(1), [t(4)]);
        assert_eq!(wfg.waits_for(t(1)), vec![t(4)]);

        wfg.clear_waits(t(1));
        assert!(wfg.waits_for(t(1)).is_empty());
        assert!(!wfg.is_waiting(t(1)));
    }

    #[test]
    fn test_remove_node_drops_incident_edges() {
        let mut wfg = WaitForGraph::new();

        wfg.add_edge(t(1), t(2));
        wfg.add_edge(t(3), t(2));
        wfg.add_edge(t(2), t(4));

        assert!(wfg.remove_node(t(2)));
        assert!(!wfg.contains_node(t(2)));
        assert_eq!(wfg.edge_count(), 0);
        assert!(!wfg.is_waiting(t(1)));
        assert!(!wfg.is_waiting(t(3)));
        assert!(!wfg.remove_node(t(2)));
    }

    #[test]
    fn test_edges_sorted() {
        let mut wfg = WaitForGraph::new();

        wfg.add_edge(t(3), t(1));
        wfg.add_edge(t(1), t(2));
        wfg.add_edge(t(3), t(2));

        assert_eq!(
            wfg.edges(),
            vec![(t(1), t(2)), (t(3), t(1)), (t(3), t(2))]
        );
    }
}
