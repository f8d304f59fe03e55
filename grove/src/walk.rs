//! Concurrent evaluation of a [`Graph`].

use crate::{
    diagnostics::{Diagnostic, Diagnostics},
    graph::{Graph, Vertex},
};
use petgraph::graph::NodeIndex;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    future::Future,
    sync::Arc,
};
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexStatus {
    Unvisited,
    /// All dependencies are done; waiting for a slot.
    Ready,
    Evaluating,
    Done,
    Errored,
    /// A dependency errored, so this vertex was never evaluated.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    Completed,
    Errored,
    /// Cancelled before every vertex could be evaluated. Vertices that were
    /// in flight at the time ran to completion.
    Cancelled,
}

#[derive(Debug)]
pub struct WalkReport {
    pub outcome: WalkOutcome,
    pub diagnostics: Diagnostics,
    pub statuses: BTreeMap<Vertex, VertexStatus>,
    /// Vertices in the order their evaluation started.
    pub started: Vec<Vertex>,
}

impl WalkReport {
    pub fn status(&self, v: &Vertex) -> Option<VertexStatus> {
        self.statuses.get(v).copied()
    }
}

/// Evaluate every vertex of `graph`, each only after all of its dependencies
/// are done, with at most `parallelism` evaluations in flight.
///
/// An error marks every transitive dependent as skipped; independent parts of
/// the graph keep going. After `cancel` fires no new evaluation starts.
pub async fn walk<F, Fut>(graph: &Graph, parallelism: usize, cancel: &CancellationToken, evaluate: F) -> WalkReport
where
    F: Fn(Vertex) -> Fut,
    Fut: Future<Output = Result<(), Diagnostics>> + Send + 'static,
{
    let g = graph.inner();
    let mut status = vec![VertexStatus::Unvisited; g.node_count()];
    let mut waiting_on: Vec<usize> = g
        .node_indices()
        .map(|ix| g.neighbors_directed(ix, petgraph::Direction::Incoming).count())
        .collect();
    let mut ready: BTreeSet<NodeIndex> = BTreeSet::new();
    for ix in g.node_indices() {
        if waiting_on[ix.index()] == 0 {
            status[ix.index()] = VertexStatus::Ready;
            ready.insert(ix);
        }
    }

    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut tasks = JoinSet::new();
    let mut running: HashMap<tokio::task::Id, NodeIndex> = HashMap::new();
    let mut diagnostics = Diagnostics::new();
    let mut started = Vec::new();

    loop {
        while !cancel.is_cancelled() {
            let Some(&ix) = ready.first() else {
                break;
            };
            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                break;
            };
            ready.remove(&ix);
            status[ix.index()] = VertexStatus::Evaluating;
            let vertex = g[ix].clone();
            trace!(vertex = %vertex, "starting");
            started.push(vertex.clone());
            let fut = evaluate(vertex);
            let handle = tasks.spawn(async move {
                let result = fut.await;
                drop(permit);
                result
            });
            running.insert(handle.id(), ix);
        }

        let Some(joined) = tasks.join_next_with_id().await else {
            break;
        };
        let (id, result) = match joined {
            Ok((id, result)) => (id, result),
            Err(e) => {
                let message = if e.is_panic() { "panicked" } else { "was aborted" };
                let ix = running.get(&e.id()).copied();
                let what = ix.map(|ix| g[ix].to_string()).unwrap_or_default();
                (
                    e.id(),
                    Err(Diagnostic::internal(format!("evaluation of {} {}", what, message)).into()),
                )
            }
        };
        let Some(ix) = running.remove(&id) else {
            continue;
        };
        match result {
            Ok(()) => {
                trace!(vertex = %g[ix], "done");
                status[ix.index()] = VertexStatus::Done;
                for next in g.neighbors(ix) {
                    waiting_on[next.index()] -= 1;
                    if waiting_on[next.index()] == 0 && status[next.index()] == VertexStatus::Unvisited {
                        status[next.index()] = VertexStatus::Ready;
                        ready.insert(next);
                    }
                }
            }
            Err(diags) => {
                warn!(vertex = %g[ix], errors = diags.len(), "evaluation failed");
                status[ix.index()] = VertexStatus::Errored;
                diagnostics.extend(diags);
                let mut stack: Vec<NodeIndex> = g.neighbors(ix).collect();
                while let Some(next) = stack.pop() {
                    if status[next.index()] == VertexStatus::Unvisited {
                        debug!(vertex = %g[next], "skipped because a dependency failed");
                        status[next.index()] = VertexStatus::Skipped;
                        stack.extend(g.neighbors(next));
                    }
                }
            }
        }
    }

    let unfinished = status
        .iter()
        .any(|s| matches!(s, VertexStatus::Unvisited | VertexStatus::Ready));
    let outcome = if cancel.is_cancelled() && unfinished {
        WalkOutcome::Cancelled
    } else if diagnostics.has_errors() {
        WalkOutcome::Errored
    } else {
        WalkOutcome::Completed
    };
    debug!(?outcome, started = started.len(), total = g.node_count(), "walk finished");

    WalkReport {
        outcome,
        diagnostics,
        statuses: g.node_indices().map(|ix| (g[ix].clone(), status[ix.index()])).collect(),
        started,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_core::addrs::ModulePath;
    use std::sync::Mutex;

    fn v(name: &str) -> Vertex {
        Vertex::Output(ModulePath::root(), name.to_string())
    }

    fn chain(names: &[&str]) -> Graph {
        let mut g = Graph::new();
        for n in names {
            g.add(v(n));
        }
        for pair in names.windows(2) {
            g.connect(&v(pair[0]), &v(pair[1]));
        }
        g
    }

    #[tokio::test]
    async fn runs_in_dependency_order() {
        let g = chain(&["a", "b", "c"]);
        let log = Arc::new(Mutex::new(Vec::new()));
        let report = walk(&g, 4, &CancellationToken::new(), |vertex| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(vertex.to_string());
                Ok(())
            }
        })
        .await;
        assert_eq!(report.outcome, WalkOutcome::Completed);
        assert_eq!(*log.lock().unwrap(), vec!["output.a", "output.b", "output.c"]);
    }

    #[tokio::test]
    async fn errors_skip_dependents_only() {
        let mut g = chain(&["a", "b", "c"]);
        g.add(v("other"));
        let report = walk(&g, 1, &CancellationToken::new(), |vertex| async move {
            if vertex == v("a") {
                Err(Diagnostic::internal("boom").into())
            } else {
                Ok(())
            }
        })
        .await;
        assert_eq!(report.outcome, WalkOutcome::Errored);
        assert_eq!(report.status(&v("a")), Some(VertexStatus::Errored));
        assert_eq!(report.status(&v("b")), Some(VertexStatus::Skipped));
        assert_eq!(report.status(&v("c")), Some(VertexStatus::Skipped));
        assert_eq!(report.status(&v("other")), Some(VertexStatus::Done));
        assert_eq!(report.diagnostics.to_string(), "internal error: boom");
    }

    #[tokio::test]
    async fn cancellation_stops_dispatch() {
        let g = chain(&["a", "b", "c"]);
        let cancel = CancellationToken::new();
        let report = walk(&g, 1, &cancel, |vertex| {
            let cancel = cancel.clone();
            async move {
                if vertex == v("a") {
                    cancel.cancel();
                }
                Ok(())
            }
        })
        .await;
        assert_eq!(report.outcome, WalkOutcome::Cancelled);
        assert_eq!(report.started, vec![v("a")]);
        assert_eq!(report.status(&v("a")), Some(VertexStatus::Done));
        assert_eq!(report.status(&v("b")), Some(VertexStatus::Ready));
    }

    #[tokio::test]
    async fn panics_become_diagnostics() {
        let g = chain(&["a", "b"]);
        let report = walk(&g, 1, &CancellationToken::new(), |vertex| async move {
            if vertex == v("a") {
                panic!("provider bug");
            }
            Ok(())
        })
        .await;
        assert_eq!(report.outcome, WalkOutcome::Errored);
        assert_eq!(report.status(&v("b")), Some(VertexStatus::Skipped));
    }
}
