//! Directed graph over dense integer node ids with PageRank power iteration.
//!
//! Nodes are `u32` ids handed out by the caller, in practice `0..n` in order
//! of first sight. Parallel links accumulate weight.
//!
//! # Example
//!
//! ```
//! use coderank_index::graph::RankGraph;
//!
//! let mut graph = RankGraph::new();
//! graph.link(1, 0, 1.0);
//! graph.link(2, 0, 1.0);
//! let ranks = graph.rank(0.85, 0.0001);
//! assert!(ranks[&0] > ranks[&1]);
//! ```

use std::collections::{BTreeMap, HashMap};

use tracing::warn;

/// Hard stop for pathological inputs that never meet the tolerance.
pub const MAX_ITERATIONS: usize = 1000;

#[derive(Debug, Clone, Default)]
struct Node {
    /// Total outbound link weight
    outbound: f64,
}

/// Weighted directed graph used for rank propagation.
#[derive(Debug, Clone, Default)]
pub struct RankGraph {
    nodes: BTreeMap<u32, Node>,
    /// source -> target -> weight
    edges: BTreeMap<u32, BTreeMap<u32, f64>>,
}

impl RankGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct nodes seen.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of distinct `(source, target)` pairs.
    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add `weight` to the link `source -> target`, registering both nodes.
    pub fn link(&mut self, source: u32, target: u32, weight: f64) {
        self.nodes.entry(source).or_default().outbound += weight;
        self.nodes.entry(target).or_default();
        *self
            .edges
            .entry(source)
            .or_default()
            .entry(target)
            .or_insert(0.0) += weight;
    }

    /// Run PageRank with follow probability `alpha` until the L1 change
    /// between iterations drops to `epsilon`.
    ///
    /// Rank held by nodes without outbound links is spread evenly over all
    /// nodes, so the result always sums to 1.
    pub fn rank(&self, alpha: f64, epsilon: f64) -> HashMap<u32, f64> {
        let n = self.nodes.len();
        if n == 0 {
            return HashMap::new();
        }

        let ids: Vec<u32> = self.nodes.keys().copied().collect();
        let index: HashMap<u32, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        // Normalized outbound weights as (source, target, share) triples.
        let mut links = Vec::with_capacity(self.edge_count());
        for (source, targets) in &self.edges {
            let outbound = self.nodes[source].outbound;
            if outbound <= 0.0 {
                continue;
            }
            for (target, weight) in targets {
                links.push((index[source], index[target], weight / outbound));
            }
        }
        let dangling: Vec<usize> = ids
            .iter()
            .enumerate()
            .filter(|(_, id)| self.nodes[*id].outbound <= 0.0)
            .map(|(i, _)| i)
            .collect();

        let inverse = 1.0 / n as f64;
        let mut ranks = vec![inverse; n];
        let mut next = vec![0.0; n];

        for iteration in 0.. {
            let leak: f64 = alpha * dangling.iter().map(|&i| ranks[i]).sum::<f64>();
            let base = (1.0 - alpha) * inverse + leak * inverse;
            next.iter_mut().for_each(|r| *r = base);
            for &(source, target, share) in &links {
                next[target] += alpha * ranks[source] * share;
            }

            let delta: f64 = next.iter().zip(&ranks).map(|(a, b)| (a - b).abs()).sum();
            std::mem::swap(&mut ranks, &mut next);

            if delta <= epsilon {
                break;
            }
            if iteration + 1 >= MAX_ITERATIONS {
                warn!(nodes = n, delta, "PageRank did not converge, using last iteration");
                break;
            }
        }

        ids.into_iter().zip(ranks).collect()
    }
}
