//! Risk-weighted best-first search over the road graph.
//!
//! Labels are ordered lexicographically by (cost, edge count, risk). All three
//! components only ever grow along a path, so the usual settle-once argument
//! holds and each node is expanded at most once: the total work is bounded by
//! the number of arcs in the graph.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Instant;

use petgraph::graph::NodeIndex;

use crate::cell::haversine_m;
use crate::error::QueryError;
use crate::graph::{RoadGraph, Traversal};

const LIMIT_CHECK_INTERVAL: usize = 256;
/// Relative tolerance under which two accumulated costs count as a tie.
const COST_TOLERANCE: f64 = 1e-9;

/// Caller-supplied bounds on a single search.
#[derive(Debug, Clone, Default)]
pub struct SearchLimits {
    pub deadline: Option<Instant>,
    pub cancel: Option<Arc<AtomicBool>>,
}

impl SearchLimits {
    fn exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
            || self
                .cancel
                .as_ref()
                .is_some_and(|flag| flag.load(AtomicOrdering::Relaxed))
    }
}

/// Cost of reaching a node.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Label {
    cost: f64,
    edges: usize,
    risk: f64,
}

impl Label {
    /// Costs and risks within [`COST_TOLERANCE`] compare equal, so sums
    /// taken in a different order still fall through to the edge count.
    fn cmp(&self, other: &Self) -> Ordering {
        approx_cmp(self.cost, other.cost)
            .then(self.edges.cmp(&other.edges))
            .then(approx_cmp(self.risk, other.risk))
    }
}

fn approx_cmp(a: f64, b: f64) -> Ordering {
    if (a - b).abs() <= COST_TOLERANCE * a.abs().max(b.abs()).max(1.0) {
        Ordering::Equal
    } else {
        a.total_cmp(&b)
    }
}

struct QueueEntry {
    estimate: f64,
    label: Label,
    node: NodeIndex,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // Reversed: BinaryHeap is a max-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .estimate
            .total_cmp(&self.estimate)
            .then(other.label.edges.cmp(&self.label.edges))
            .then(other.label.risk.total_cmp(&self.label.risk))
            .then(other.node.index().cmp(&self.node.index()))
    }
}

/// One traversed arc with the risk it contributed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredArc {
    pub arc: Traversal,
    pub risk: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Path {
    pub arcs: Vec<ScoredArc>,
    pub total_cost: f64,
    pub total_risk: f64,
    /// Nodes settled by the search.
    pub expanded: usize,
}

pub struct Router<'g> {
    graph: &'g RoadGraph,
    risk_aversion: f64,
    max_speed_mps: Option<f64>,
}

impl<'g> Router<'g> {
    pub const fn new(graph: &'g RoadGraph, risk_aversion: f64) -> Self {
        Self {
            graph,
            risk_aversion,
            max_speed_mps: None,
        }
    }

    /// Enables the straight-line time lower bound. `speed` must be at least
    /// the fastest speed any edge allows or the result may be suboptimal.
    #[must_use]
    pub const fn with_max_speed(mut self, speed: Option<f64>) -> Self {
        self.max_speed_mps = speed;
        self
    }

    fn heuristic(&self, node: NodeIndex, target: NodeIndex) -> f64 {
        self.max_speed_mps.map_or(0.0, |speed| {
            haversine_m(self.graph.node(node).location, self.graph.node(target).location) / speed
        })
    }

    /// Finds the cheapest path from `source` to `target`, where each edge
    /// costs `base_cost + λ * risk_of(edge)`.
    ///
    /// # Errors
    ///
    /// [`QueryError::NoRoute`] if `target` is unreachable,
    /// [`QueryError::Timeout`] if `limits` trip mid-search.
    pub fn search(
        &self,
        source: NodeIndex,
        target: NodeIndex,
        mut risk_of: impl FnMut(usize) -> f64,
        limits: &SearchLimits,
    ) -> Result<Path, QueryError> {
        if limits.exceeded() {
            return Err(QueryError::Timeout);
        }
        if source == target {
            return Ok(Path::default());
        }

        let n = self.graph.node_count();
        let mut best: Vec<Option<Label>> = vec![None; n];
        let mut previous: Vec<Option<(NodeIndex, ScoredArc)>> = vec![None; n];
        let mut settled = vec![false; n];
        let mut edge_risk: HashMap<usize, f64> = HashMap::new();
        let mut queue = BinaryHeap::new();
        let mut expanded = 0;

        best[source.index()] = Some(Label::default());
        queue.push(QueueEntry {
            estimate: self.heuristic(source, target),
            label: Label::default(),
            node: source,
        });

        while let Some(QueueEntry { node, .. }) = queue.pop() {
            if settled[node.index()] {
                continue;
            }
            // The queue may hold an older near-tie; `best` has the winner.
            let Some(label) = best[node.index()] else {
                continue;
            };
            settled[node.index()] = true;
            expanded += 1;
            if expanded % LIMIT_CHECK_INTERVAL == 0 && limits.exceeded() {
                log::debug!("route search aborted after {expanded} expansions");
                return Err(QueryError::Timeout);
            }
            if node == target {
                return Ok(self.unwind(target, label, &previous, expanded));
            }

            for step in self.graph.neighbors(node) {
                if settled[step.target.index()] {
                    continue;
                }
                let edge = self.graph.edge(step.arc.edge);
                let risk = *edge_risk
                    .entry(step.arc.edge)
                    .or_insert_with(|| risk_of(step.arc.edge));
                let candidate = Label {
                    cost: label.cost + edge.base_cost + self.risk_aversion * risk,
                    edges: label.edges + 1,
                    risk: label.risk + risk,
                };

                let slot = &mut best[step.target.index()];
                if slot.is_none_or(|current| candidate.cmp(&current) == Ordering::Less) {
                    *slot = Some(candidate);
                    previous[step.target.index()] = Some((node, ScoredArc { arc: step.arc, risk }));
                    queue.push(QueueEntry {
                        estimate: candidate.cost + self.heuristic(step.target, target),
                        label: candidate,
                        node: step.target,
                    });
                }
            }
        }

        Err(QueryError::NoRoute)
    }

    fn unwind(
        &self,
        target: NodeIndex,
        label: Label,
        previous: &[Option<(NodeIndex, ScoredArc)>],
        expanded: usize,
    ) -> Path {
        let mut arcs = Vec::with_capacity(label.edges);
        let mut node = target;
        while let Some((from, arc)) = previous[node.index()] {
            arcs.push(arc);
            node = from;
        }
        arcs.reverse();

        Path {
            arcs,
            total_cost: label.cost,
            total_risk: label.risk,
            expanded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{RoadEdge, RoadNode};
    use crate::model::Location;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn node(id: u64, lat: f64, lng: f64) -> RoadNode {
        RoadNode {
            id,
            location: Location::new(lat, lng),
        }
    }

    fn edge(id: u64, from: u64, to: u64, base_cost: f64) -> RoadEdge {
        RoadEdge {
            id,
            from,
            to,
            base_cost,
            length_m: base_cost * 1.4,
            bidirectional: true,
            geometry: vec![],
        }
    }

    /// A-B (5, safe), A-C (3, risk 10), C-D (3, risk 10), B-D (4, safe).
    fn diamond() -> (RoadGraph, HashMap<u64, f64>) {
        let graph = RoadGraph::build(
            vec![
                node(1, 0.0, 0.0),
                node(2, 0.001, 0.0),
                node(3, 0.0, 0.001),
                node(4, 0.001, 0.001),
            ],
            vec![edge(12, 1, 2, 5.0), edge(13, 1, 3, 3.0), edge(34, 3, 4, 3.0), edge(24, 2, 4, 4.0)],
        )
        .unwrap();
        let risks = HashMap::from([(12, 0.0), (13, 10.0), (34, 10.0), (24, 0.0)]);
        (graph, risks)
    }

    fn route(graph: &RoadGraph, risks: &HashMap<u64, f64>, lambda: f64) -> Result<(Vec<u64>, Path), QueryError> {
        let path = Router::new(graph, lambda).search(
            graph.node_by_id(1).unwrap(),
            graph.node_by_id(4).unwrap(),
            |e| risks[&graph.edge(e).id],
            &SearchLimits::default(),
        )?;
        let ids = path.arcs.iter().map(|a| graph.edge(a.arc.edge).id).collect();
        Ok((ids, path))
    }

    #[test]
    fn zero_aversion_takes_the_fastest_path() {
        let (graph, risks) = diamond();
        let (ids, path) = route(&graph, &risks, 0.0).unwrap();
        assert_eq!(ids, vec![13, 34]);
        assert_eq!(path.total_cost, 6.0);
        assert_eq!(path.total_risk, 20.0);
    }

    #[test]
    fn risk_aversion_detours_around_risky_edges() {
        let (graph, risks) = diamond();
        let (ids, path) = route(&graph, &risks, 1.0).unwrap();
        assert_eq!(ids, vec![12, 24]);
        assert_eq!(path.total_cost, 9.0);
        assert_eq!(path.total_risk, 0.0);
    }

    #[test]
    fn chosen_risk_never_grows_with_aversion() {
        let (graph, risks) = diamond();
        let mut previous = f64::INFINITY;
        for lambda in [0.0, 0.1, 0.15, 0.2, 0.5, 1.0, 10.0] {
            let (_, path) = route(&graph, &risks, lambda).unwrap();
            assert!(path.total_risk <= previous);
            previous = path.total_risk;
        }
    }

    #[test]
    fn equal_cost_prefers_fewer_edges_then_lower_risk() {
        // 1-4 direct (cost 6, risk 1) vs 1-2-4 (cost 6, risk 0): fewer edges wins.
        let graph = RoadGraph::build(
            vec![node(1, 0.0, 0.0), node(2, 0.001, 0.0), node(4, 0.001, 0.001)],
            vec![edge(12, 1, 2, 3.0), edge(24, 2, 4, 3.0), edge(14, 1, 4, 5.0)],
        )
        .unwrap();
        let risks = HashMap::from([(12, 0.0), (24, 0.0), (14, 1.0)]);
        let (ids, _) = route(&graph, &risks, 1.0).unwrap();
        assert_eq!(ids, vec![14]);
    }

    #[test]
    fn float_summation_ties_still_prefer_fewer_edges() {
        // 0.15 + 0.15 == 0.3 exactly, while the direct edge costs
        // 0.1 + 0.2 == 0.30000000000000004.
        let graph = RoadGraph::build(
            vec![node(1, 0.0, 0.0), node(2, 0.001, 0.0), node(4, 0.001, 0.001)],
            vec![edge(12, 1, 2, 0.15), edge(24, 2, 4, 0.15), edge(14, 1, 4, 0.1 + 0.2)],
        )
        .unwrap();
        let risks = HashMap::from([(12, 0.0), (24, 0.0), (14, 0.0)]);
        let (ids, _) = route(&graph, &risks, 0.0).unwrap();
        assert_eq!(ids, vec![14]);
    }

    #[test]
    fn unreachable_target_is_no_route() {
        let graph = RoadGraph::build(
            vec![node(1, 0.0, 0.0), node(2, 0.001, 0.0), node(4, 1.0, 1.0)],
            vec![edge(12, 1, 2, 3.0)],
        )
        .unwrap();
        let risks = HashMap::from([(12, 0.0)]);
        assert_eq!(route(&graph, &risks, 1.0).err(), Some(QueryError::NoRoute));
    }

    #[test]
    fn same_source_and_target_is_trivial() {
        let (graph, _) = diamond();
        let a = graph.node_by_id(1).unwrap();
        let path = Router::new(&graph, 1.0)
            .search(a, a, |_| 0.0, &SearchLimits::default())
            .unwrap();
        assert_eq!(path, Path::default());
    }

    #[test]
    fn expired_deadline_reports_timeout() {
        let (graph, risks) = diamond();
        let limits = SearchLimits {
            deadline: Some(Instant::now() - Duration::from_millis(1)),
            cancel: None,
        };
        let result = Router::new(&graph, 0.0).search(
            graph.node_by_id(1).unwrap(),
            graph.node_by_id(4).unwrap(),
            |e| risks[&graph.edge(e).id],
            &limits,
        );
        assert_eq!(result, Err(QueryError::Timeout));
    }

    #[test]
    fn heuristic_does_not_change_the_optimum() {
        let (graph, risks) = diamond();
        let path = Router::new(&graph, 1.0)
            .with_max_speed(Some(1_000.0))
            .search(
                graph.node_by_id(1).unwrap(),
                graph.node_by_id(4).unwrap(),
                |e| risks[&graph.edge(e).id],
                &SearchLimits::default(),
            )
            .unwrap();
        assert_eq!(path.total_cost, 9.0);
    }
}
