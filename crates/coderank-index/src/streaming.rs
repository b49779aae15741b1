//! Single-pass, cancellable edge stream between a graph producer and its consumer.
//!
//! The producer (usually a blocking archive scan) owns an [`EdgeSender`]; the
//! consumer pulls edges from the [`StreamingGraph`]. The channel is bounded so
//! a slow consumer applies backpressure instead of buffering a whole
//! repository. A producer failure travels down the same channel as a terminal
//! error.
//!
//! Edges from one file arrive together, in the deterministic order produced by
//! [`referenced_paths`](crate::tokenizer::referenced_paths) rather than the
//! order symbols occur in the file. Nothing is guaranteed across files.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{RankingError, Result};

/// `from` references a symbol defined in `to`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Producer half of a [`StreamingGraph`].
#[derive(Debug, Clone)]
pub struct EdgeSender {
    tx: mpsc::Sender<Result<Edge>>,
    cancel: CancellationToken,
}

impl EdgeSender {
    /// True once the consumer has gone away or the operation was cancelled.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.cancel.is_cancelled()
    }

    /// Send from a blocking thread. Returns false when the consumer is gone.
    pub fn send_blocking(&self, edge: Edge) -> bool {
        !self.cancel.is_cancelled() && self.tx.blocking_send(Ok(edge)).is_ok()
    }

    /// Forward a terminal error from a blocking thread.
    pub fn fail_blocking(&self, err: RankingError) {
        if self.tx.blocking_send(Err(err)).is_err() {
            debug!("edge consumer gone before producer error could be delivered");
        }
    }

    /// Send from async code, giving up if cancellation fires first.
    pub async fn send(&self, edge: Edge) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(Ok(edge)) => sent.is_ok(),
        }
    }
}

/// Consumer half: a finite stream of edges plus a terminal error slot.
#[derive(Debug)]
pub struct StreamingGraph {
    rx: Option<mpsc::Receiver<Result<Edge>>>,
    producer: Option<JoinHandle<()>>,
}

impl StreamingGraph {
    /// A graph with no edges.
    pub fn empty() -> Self {
        Self {
            rx: None,
            producer: None,
        }
    }

    /// Create a bounded graph channel whose producer observes `cancel`.
    pub fn channel(capacity: usize, cancel: CancellationToken) -> (EdgeSender, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            EdgeSender { tx, cancel },
            Self {
                rx: Some(rx),
                producer: None,
            },
        )
    }

    /// Stream a fixed list of edges from a background task.
    pub fn from_edges(edges: Vec<Edge>, cancel: CancellationToken) -> Self {
        let (sender, mut graph) = Self::channel(16, cancel);
        graph.attach_producer(tokio::spawn(async move {
            for edge in edges {
                if !sender.send(edge).await {
                    break;
                }
            }
        }));
        graph
    }

    /// Track the producer so a panic surfaces as an error instead of a short stream.
    pub fn attach_producer(&mut self, handle: JoinHandle<()>) {
        self.producer = Some(handle);
    }

    /// Next edge, `Ok(None)` at the end of the stream.
    ///
    /// Cancellation wins over a ready edge. After an error or cancellation the
    /// stream is closed, which also stops the producer.
    pub async fn next_edge(&mut self, cancel: &CancellationToken) -> Result<Option<Edge>> {
        let Some(rx) = self.rx.as_mut() else {
            return Ok(None);
        };

        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.close();
                return Err(RankingError::Cancelled);
            }
            item = rx.recv() => item,
        };

        match item {
            Some(Ok(edge)) => Ok(Some(edge)),
            Some(Err(err)) => {
                self.close();
                Err(err)
            }
            None => {
                self.rx = None;
                if let Some(producer) = self.producer.take() {
                    producer.await?;
                }
                Ok(None)
            }
        }
    }

    /// Drain the remaining edges into memory.
    pub async fn collect(mut self, cancel: &CancellationToken) -> Result<Vec<Edge>> {
        let mut edges = Vec::new();
        while let Some(edge) = self.next_edge(cancel).await? {
            edges.push(edge);
        }
        Ok(edges)
    }

    fn close(&mut self) {
        self.rx = None;
        self.producer = None;
    }
}
