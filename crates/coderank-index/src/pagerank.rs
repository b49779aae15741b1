//! PageRank over a streaming file reference graph.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;
use crate::graph::RankGraph;
use crate::streaming::StreamingGraph;

/// Probability of following a link rather than jumping to a random node.
pub const DAMPING_FACTOR: f64 = 0.85;

/// L1 change between iterations at which ranking stops.
pub const TOLERANCE: f64 = 0.0001;

/// File path -> stored rank vector, as written to the rank store.
pub type DocumentRanks = HashMap<String, Vec<f64>>;

/// Assigns dense ids to paths in order of first sight.
#[derive(Debug, Default)]
struct PathIds {
    ids: HashMap<String, u32>,
    names: Vec<String>,
}

impl PathIds {
    fn id_of(&mut self, path: String) -> u32 {
        if let Some(&id) = self.ids.get(&path) {
            return id;
        }
        let id = self.names.len() as u32;
        self.names.push(path.clone());
        self.ids.insert(path, id);
        id
    }
}

/// Raw PageRank scores keyed by path.
#[derive(Debug, Clone, Default)]
pub struct PathRanks {
    /// Probability mass per path; sums to 1 over a non-empty graph
    pub raw: HashMap<String, f64>,
}

impl PathRanks {
    /// Stored form: a one-element vector holding `1 - rank` per path.
    pub fn document_ranks(&self) -> DocumentRanks {
        self.raw
            .iter()
            .map(|(path, rank)| (path.clone(), vec![1.0 - rank]))
            .collect()
    }
}

/// PageRank parameters.
#[derive(Debug, Clone)]
pub struct PageRanker {
    pub damping_factor: f64,
    pub tolerance: f64,
}

impl Default for PageRanker {
    fn default() -> Self {
        Self {
            damping_factor: DAMPING_FACTOR,
            tolerance: TOLERANCE,
        }
    }
}

impl PageRanker {
    /// Consume `graph` and rank every path that appears on either end of an edge.
    ///
    /// Cancellation while edges are still arriving aborts with
    /// [`RankingError::Cancelled`](crate::RankingError::Cancelled); the partial
    /// graph is dropped.
    pub async fn rank(&self, cancel: &CancellationToken, mut graph: StreamingGraph) -> Result<PathRanks> {
        let mut paths = PathIds::default();
        let mut rank_graph = RankGraph::new();

        while let Some(edge) = graph.next_edge(cancel).await? {
            let from = paths.id_of(edge.from);
            let to = paths.id_of(edge.to);
            rank_graph.link(from, to, 1.0);
        }

        debug!(
            nodes = rank_graph.node_count(),
            edges = rank_graph.edge_count(),
            "ranking file reference graph"
        );

        let (alpha, epsilon) = (self.damping_factor, self.tolerance);
        let ranks = tokio::task::spawn_blocking(move || rank_graph.rank(alpha, epsilon)).await?;

        let raw = ranks
            .into_iter()
            .map(|(id, rank)| (paths.names[id as usize].clone(), rank))
            .collect();
        Ok(PathRanks { raw })
    }
}

/// Rank `graph` with the default parameters and return the stored form.
pub async fn page_rank_from_streaming_graph(
    cancel: &CancellationToken,
    graph: StreamingGraph,
) -> Result<DocumentRanks> {
    Ok(PageRanker::default().rank(cancel, graph).await?.document_ranks())
}
