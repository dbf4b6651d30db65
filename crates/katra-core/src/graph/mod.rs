//! Graph Store - The associative structure over memories
//!
//! An in-memory node arena: record ids map to indices into a node vector,
//! and each node keeps outgoing and incoming adjacency lists. Deleting a node
//! is a swap-remove with index fix-up rather than a pointer chase. Edges are
//! unique per (from, to, type); re-adding one updates its strength.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{KatraError, Result};

/// Cap on distinct simple paths returned by `find_paths`
pub const MAX_PATHS: usize = 16;

// ============================================================================
// EDGE TYPES
// ============================================================================

/// Kind of association between two memories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeType {
    /// Embedding cosine put the two memories near each other
    Similar,
    /// The memories happened back-to-back in the same CI's stream
    Sequential,
    /// A caller linked them on purpose
    Explicit,
    /// One memory caused the other (the `related_to` chain)
    Causal,
}

impl EdgeType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Similar => "similar",
            EdgeType::Sequential => "sequential",
            EdgeType::Explicit => "explicit",
            EdgeType::Causal => "causal",
        }
    }
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// AUTO-EDGE CONFIGURATION
// ============================================================================

/// Write-time edge creation knobs. Auto-edges are opt-in: a deployment that
/// wants them turns them on and keeps the thresholds it can afford.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Create Sequential/Similar edges automatically at store time
    pub auto_edges: bool,
    /// Max seconds between consecutive memories for a Sequential edge
    pub temporal_window_secs: i64,
    /// Minimum cosine for an automatic Similar edge
    pub similarity_threshold: f32,
    /// Cap on Similar edges per stored memory
    pub max_similar_edges: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            auto_edges: false,
            temporal_window_secs: 3600,
            similarity_threshold: 0.6,
            max_similar_edges: 5,
        }
    }
}

impl GraphConfig {
    /// Enable write-time Sequential/Similar edge creation
    pub fn with_auto_edges(mut self) -> Self {
        self.auto_edges = true;
        self
    }
}

// ============================================================================
// GRAPH ENTITIES
// ============================================================================

/// Half-edge stored in an adjacency list. `peer` is the other endpoint's
/// arena index: the target for outgoing entries, the source for incoming.
#[derive(Debug, Clone)]
struct HalfEdge {
    peer: usize,
    edge_type: EdgeType,
    strength: f64,
}

/// Arena slot wrapping one record id plus its centrality caches
#[derive(Debug)]
struct GraphNode {
    record_id: String,
    outgoing: Vec<HalfEdge>,
    incoming: Vec<HalfEdge>,
    centrality: f64,
    connection_count: usize,
}

impl GraphNode {
    fn new(record_id: String) -> Self {
        Self {
            record_id,
            outgoing: Vec::new(),
            incoming: Vec::new(),
            centrality: 0.0,
            connection_count: 0,
        }
    }

    fn weighted_degree(&self) -> f64 {
        self.outgoing.iter().map(|e| e.strength).sum::<f64>()
            + self.incoming.iter().map(|e| e.strength).sum::<f64>()
    }

    fn degree(&self) -> usize {
        self.outgoing.len() + self.incoming.len()
    }
}

/// One step discovered by a traversal
#[derive(Debug, Clone)]
pub struct TraversalHit {
    /// Visited record
    pub record_id: String,
    /// First-seen depth from the start node
    pub depth: usize,
    /// Product of edge strengths along the discovery path
    pub cumulative_strength: f64,
    /// Edge kind that reached this node; `None` for the start
    pub edge_type: Option<EdgeType>,
}

/// Whole-graph statistics
#[derive(Debug, Clone, Default)]
pub struct GraphStats {
    /// Nodes in the arena
    pub node_count: usize,
    /// Directed edges
    pub edge_count: usize,
    /// Mean (in + out) degree
    pub avg_degree: f64,
}

// ============================================================================
// MEMORY GRAPH
// ============================================================================

/// The associative graph over one engine's memories
#[derive(Debug, Default)]
pub struct MemoryGraph {
    index: HashMap<String, usize>,
    nodes: Vec<GraphNode>,
}

impl MemoryGraph {
    /// Empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Nodes in the arena
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Whether a record has a node
    pub fn contains(&self, record_id: &str) -> bool {
        self.index.contains_key(record_id)
    }

    /// Ensure a node exists for the record; idempotent
    pub fn upsert_node(&mut self, record_id: &str) {
        if !self.index.contains_key(record_id) {
            self.index
                .insert(record_id.to_string(), self.nodes.len());
            self.nodes.push(GraphNode::new(record_id.to_string()));
        }
    }

    /// Add or refresh a directed edge.
    ///
    /// Unique per (from, to, type): a duplicate add updates the strength
    /// instead of growing the adjacency lists. Endpoints are upserted.
    pub fn add_edge(
        &mut self,
        from: &str,
        to: &str,
        edge_type: EdgeType,
        strength: f64,
    ) -> Result<()> {
        if from == to {
            return Err(KatraError::InvalidParams(
                "self-edges are not allowed".to_string(),
            ));
        }
        let strength = strength.clamp(0.0, 1.0);
        self.upsert_node(from);
        self.upsert_node(to);
        let from_idx = self.index[from];
        let to_idx = self.index[to];

        let existing = self.nodes[from_idx]
            .outgoing
            .iter_mut()
            .find(|e| e.peer == to_idx && e.edge_type == edge_type);
        match existing {
            Some(edge) => {
                edge.strength = strength;
                if let Some(back) = self.nodes[to_idx]
                    .incoming
                    .iter_mut()
                    .find(|e| e.peer == from_idx && e.edge_type == edge_type)
                {
                    back.strength = strength;
                }
            }
            None => {
                self.nodes[from_idx].outgoing.push(HalfEdge {
                    peer: to_idx,
                    edge_type,
                    strength,
                });
                self.nodes[to_idx].incoming.push(HalfEdge {
                    peer: from_idx,
                    edge_type,
                    strength,
                });
            }
        }
        Ok(())
    }

    /// Remove one directed edge; returns whether it existed
    pub fn delete_edge(&mut self, from: &str, to: &str, edge_type: EdgeType) -> bool {
        let (Some(&from_idx), Some(&to_idx)) = (self.index.get(from), self.index.get(to)) else {
            return false;
        };
        let before = self.nodes[from_idx].outgoing.len();
        self.nodes[from_idx]
            .outgoing
            .retain(|e| !(e.peer == to_idx && e.edge_type == edge_type));
        let removed = self.nodes[from_idx].outgoing.len() < before;
        if removed {
            self.nodes[to_idx]
                .incoming
                .retain(|e| !(e.peer == from_idx && e.edge_type == edge_type));
        }
        removed
    }

    /// Remove a node and every edge touching it.
    ///
    /// Swap-remove: the arena's last node moves into the vacated slot and all
    /// indices referring to it are fixed up.
    pub fn delete_node(&mut self, record_id: &str) -> bool {
        let Some(idx) = self.index.remove(record_id) else {
            return false;
        };

        // Detach from every peer first
        let outgoing_peers: Vec<usize> = self.nodes[idx].outgoing.iter().map(|e| e.peer).collect();
        for peer in outgoing_peers {
            self.nodes[peer].incoming.retain(|e| e.peer != idx);
        }
        let incoming_peers: Vec<usize> = self.nodes[idx].incoming.iter().map(|e| e.peer).collect();
        for peer in incoming_peers {
            self.nodes[peer].outgoing.retain(|e| e.peer != idx);
        }

        let last_idx = self.nodes.len() - 1;
        self.nodes.swap_remove(idx);

        if idx != last_idx {
            // The node formerly at last_idx now lives at idx
            let moved_id = self.nodes[idx].record_id.clone();
            self.index.insert(moved_id, idx);

            let moved_outgoing: Vec<usize> =
                self.nodes[idx].outgoing.iter().map(|e| e.peer).collect();
            for peer in moved_outgoing {
                for edge in &mut self.nodes[peer].incoming {
                    if edge.peer == last_idx {
                        edge.peer = idx;
                    }
                }
            }
            let moved_incoming: Vec<usize> =
                self.nodes[idx].incoming.iter().map(|e| e.peer).collect();
            for peer in moved_incoming {
                for edge in &mut self.nodes[peer].outgoing {
                    if edge.peer == last_idx {
                        edge.peer = idx;
                    }
                }
            }
        }
        true
    }

    /// BFS over outgoing edges from `start`, visiting each node at most once.
    ///
    /// The start node is included at depth 0 with strength 1.0; every other
    /// hit carries its first-seen depth and the product of edge strengths
    /// along its discovery path.
    pub fn traverse(&self, start: &str, max_depth: usize) -> Vec<TraversalHit> {
        let Some(&start_idx) = self.index.get(start) else {
            return Vec::new();
        };

        let mut hits = Vec::new();
        let mut visited: HashSet<usize> = HashSet::new();
        let mut queue: VecDeque<(usize, usize, f64)> = VecDeque::new();

        visited.insert(start_idx);
        queue.push_back((start_idx, 0, 1.0));
        hits.push(TraversalHit {
            record_id: start.to_string(),
            depth: 0,
            cumulative_strength: 1.0,
            edge_type: None,
        });

        while let Some((idx, depth, strength)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for edge in &self.nodes[idx].outgoing {
                if !visited.insert(edge.peer) {
                    continue;
                }
                let cumulative = strength * edge.strength;
                hits.push(TraversalHit {
                    record_id: self.nodes[edge.peer].record_id.clone(),
                    depth: depth + 1,
                    cumulative_strength: cumulative,
                    edge_type: Some(edge.edge_type),
                });
                queue.push_back((edge.peer, depth + 1, cumulative));
            }
        }
        hits
    }

    /// Up to [`MAX_PATHS`] distinct simple paths from `from` to `to`.
    ///
    /// DFS with a current-path set for cycle avoidance.
    pub fn find_paths(&self, from: &str, to: &str, max_depth: usize) -> Vec<Vec<String>> {
        let (Some(&from_idx), Some(&to_idx)) = (self.index.get(from), self.index.get(to)) else {
            return Vec::new();
        };
        let mut paths = Vec::new();
        let mut on_path: HashSet<usize> = HashSet::new();
        let mut current: Vec<usize> = Vec::new();
        self.dfs_paths(from_idx, to_idx, max_depth, &mut on_path, &mut current, &mut paths);
        paths
    }

    fn dfs_paths(
        &self,
        at: usize,
        target: usize,
        depth_left: usize,
        on_path: &mut HashSet<usize>,
        current: &mut Vec<usize>,
        paths: &mut Vec<Vec<String>>,
    ) {
        if paths.len() >= MAX_PATHS {
            return;
        }
        on_path.insert(at);
        current.push(at);

        if at == target && current.len() > 1 {
            paths.push(
                current
                    .iter()
                    .map(|&i| self.nodes[i].record_id.clone())
                    .collect(),
            );
        } else if depth_left > 0 {
            for edge in &self.nodes[at].outgoing {
                if !on_path.contains(&edge.peer) {
                    self.dfs_paths(edge.peer, target, depth_left - 1, on_path, current, paths);
                }
            }
        }

        current.pop();
        on_path.remove(&at);
    }

    /// Neighbors with edges in both directions relative to `record_id`
    pub fn strongly_connected(&self, record_id: &str) -> Vec<String> {
        let Some(&idx) = self.index.get(record_id) else {
            return Vec::new();
        };
        let node = &self.nodes[idx];
        let out: HashSet<usize> = node.outgoing.iter().map(|e| e.peer).collect();
        let mut mutual: Vec<String> = node
            .incoming
            .iter()
            .filter(|e| out.contains(&e.peer))
            .map(|e| self.nodes[e.peer].record_id.clone())
            .collect();
        mutual.sort();
        mutual.dedup();
        mutual
    }

    /// Recompute centrality and connection counts for the given records.
    ///
    /// Centrality is the node's strength-weighted degree normalized by the
    /// largest weighted degree in the graph: 1.0 means "hub of this corpus".
    pub fn recompute_centrality(&mut self, record_ids: &[String]) -> Vec<(String, f64, usize)> {
        let max_weighted = self
            .nodes
            .iter()
            .map(GraphNode::weighted_degree)
            .fold(0.0_f64, f64::max);

        let mut out = Vec::with_capacity(record_ids.len());
        for record_id in record_ids {
            let Some(&idx) = self.index.get(record_id) else {
                continue;
            };
            let weighted = self.nodes[idx].weighted_degree();
            let centrality = if max_weighted > 0.0 {
                (weighted / max_weighted).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let degree = self.nodes[idx].degree();
            self.nodes[idx].centrality = centrality;
            self.nodes[idx].connection_count = degree;
            out.push((record_id.clone(), centrality, degree));
        }
        out
    }

    /// Cached (centrality, connection_count) for one record
    pub fn centrality_of(&self, record_id: &str) -> Option<(f64, usize)> {
        self.index
            .get(record_id)
            .map(|&idx| (self.nodes[idx].centrality, self.nodes[idx].connection_count))
    }

    /// Records ranked by cached centrality, best first
    pub fn top_by_centrality(&self, limit: usize) -> Vec<(String, f64)> {
        let mut ranked: Vec<(String, f64)> = self
            .nodes
            .iter()
            .map(|n| (n.record_id.clone(), n.centrality))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(limit);
        ranked
    }

    /// Whole-graph statistics
    pub fn stats(&self) -> GraphStats {
        let node_count = self.nodes.len();
        let edge_count: usize = self.nodes.iter().map(|n| n.outgoing.len()).sum();
        let avg_degree = if node_count > 0 {
            (2 * edge_count) as f64 / node_count as f64
        } else {
            0.0
        };
        GraphStats {
            node_count,
            edge_count,
            avg_degree,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> MemoryGraph {
        let mut g = MemoryGraph::new();
        g.add_edge("a", "b", EdgeType::Sequential, 0.9).unwrap();
        g.add_edge("b", "c", EdgeType::Sequential, 0.5).unwrap();
        g.add_edge("a", "c", EdgeType::Similar, 0.4).unwrap();
        g
    }

    #[test]
    fn test_edge_upsert_is_idempotent() {
        let mut g = MemoryGraph::new();
        g.add_edge("a", "b", EdgeType::Similar, 0.3).unwrap();
        g.add_edge("a", "b", EdgeType::Similar, 0.8).unwrap();

        assert_eq!(g.stats().edge_count, 1);
        let hits = g.traverse("a", 1);
        assert_eq!(hits.len(), 2);
        assert!((hits[1].cumulative_strength - 0.8).abs() < 1e-9);

        // Different type is a distinct edge
        g.add_edge("a", "b", EdgeType::Explicit, 0.5).unwrap();
        assert_eq!(g.stats().edge_count, 2);
    }

    #[test]
    fn test_traverse_depth_and_strength() {
        let g = chain();
        let hits = g.traverse("a", 2);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].record_id, "a");
        assert_eq!(hits[0].depth, 0);
        assert!((hits[0].cumulative_strength - 1.0).abs() < 1e-9);

        let c = hits.iter().find(|h| h.record_id == "c").unwrap();
        // First-seen via the direct Similar edge at depth 1
        assert_eq!(c.depth, 1);
    }

    #[test]
    fn test_traverse_terminates_on_cycles() {
        let mut g = MemoryGraph::new();
        g.add_edge("a", "b", EdgeType::Sequential, 1.0).unwrap();
        g.add_edge("b", "c", EdgeType::Sequential, 1.0).unwrap();
        g.add_edge("c", "a", EdgeType::Sequential, 1.0).unwrap();

        let hits = g.traverse("a", 50);
        assert_eq!(hits.len(), 3);
        let unique: HashSet<&str> = hits.iter().map(|h| h.record_id.as_str()).collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn test_find_paths_simple_and_capped() {
        let g = chain();
        let paths = g.find_paths("a", "c", 3);
        assert_eq!(paths.len(), 2);
        assert!(paths.contains(&vec!["a".to_string(), "c".to_string()]));
        assert!(paths.contains(&vec![
            "a".to_string(),
            "b".to_string(),
            "c".to_string()
        ]));

        let none = g.find_paths("c", "a", 3);
        assert!(none.is_empty());
    }

    #[test]
    fn test_strongly_connected_requires_both_directions() {
        let mut g = MemoryGraph::new();
        g.add_edge("a", "b", EdgeType::Explicit, 1.0).unwrap();
        g.add_edge("b", "a", EdgeType::Explicit, 1.0).unwrap();
        g.add_edge("a", "c", EdgeType::Explicit, 1.0).unwrap();

        assert_eq!(g.strongly_connected("a"), vec!["b".to_string()]);
        assert!(g.strongly_connected("c").is_empty());
    }

    #[test]
    fn test_delete_node_swap_remove_fixup() {
        let mut g = MemoryGraph::new();
        g.add_edge("a", "b", EdgeType::Sequential, 1.0).unwrap();
        g.add_edge("b", "c", EdgeType::Sequential, 1.0).unwrap();
        g.add_edge("c", "d", EdgeType::Sequential, 1.0).unwrap();

        // Deleting an interior node moves the last arena slot into its place
        assert!(g.delete_node("b"));
        assert_eq!(g.node_count(), 3);
        assert!(!g.contains("b"));

        // Surviving edge c -> d must still resolve after the fix-up
        let hits = g.traverse("c", 1);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[1].record_id, "d");
        assert!(g.traverse("a", 3).len() == 1);
    }

    #[test]
    fn test_centrality_hub_scores_one() {
        let mut g = MemoryGraph::new();
        for peer in ["b", "c", "d"] {
            g.add_edge("hub", peer, EdgeType::Similar, 1.0).unwrap();
        }
        g.add_edge("b", "c", EdgeType::Similar, 0.2).unwrap();

        let ids: Vec<String> = ["hub", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let scores = g.recompute_centrality(&ids);

        let hub = scores.iter().find(|(id, _, _)| id == "hub").unwrap();
        assert!((hub.1 - 1.0).abs() < 1e-9);
        assert_eq!(hub.2, 3);

        let d = scores.iter().find(|(id, _, _)| id == "d").unwrap();
        assert!(d.1 < hub.1);
        assert_eq!(g.centrality_of("hub").unwrap().0, hub.1);
    }

    #[test]
    fn test_delete_edge() {
        let mut g = chain();
        assert!(g.delete_edge("a", "c", EdgeType::Similar));
        assert!(!g.delete_edge("a", "c", EdgeType::Similar));
        assert_eq!(g.stats().edge_count, 2);

        // c is now only reachable through b, at depth 2
        let c = g
            .traverse("a", 3)
            .into_iter()
            .find(|h| h.record_id == "c")
            .unwrap();
        assert_eq!(c.depth, 2);
    }

    #[test]
    fn test_rejects_self_edges() {
        let mut g = MemoryGraph::new();
        assert!(g.add_edge("a", "a", EdgeType::Explicit, 1.0).is_err());
    }

    #[test]
    fn test_stats() {
        let g = chain();
        let stats = g.stats();
        assert_eq!(stats.node_count, 3);
        assert_eq!(stats.edge_count, 3);
        assert!((stats.avg_degree - 2.0).abs() < 1e-9);
    }
}
