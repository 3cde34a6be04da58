use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use rstar::RTree;
use rstar::primitives::GeomWithData;
use serde::{Deserialize, Serialize};

use crate::cell::haversine_m;
use crate::error::GraphError;
use crate::model::Location;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoadNode {
    pub id: u64,
    pub location: Location,
}

/// A road segment as supplied by the map-data provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoadEdge {
    pub id: u64,
    pub from: u64,
    pub to: u64,
    /// Travel time in seconds.
    pub base_cost: f64,
    pub length_m: f64,
    #[serde(default = "default_bidirectional")]
    pub bidirectional: bool,
    /// Intermediate shape points between `from` and `to`, endpoints excluded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub geometry: Vec<Location>,
}

const fn default_bidirectional() -> bool {
    true
}

/// Node/edge dataset in the JSON load format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDataset {
    pub nodes: Vec<RoadNode>,
    pub edges: Vec<RoadEdge>,
}

impl GraphDataset {
    /// # Errors
    ///
    /// Returns [`GraphError::Io`] if the file cannot be read or parsed.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, GraphError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| GraphError::Io(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&raw).map_err(|e| GraphError::Io(format!("{}: {e}", path.display())))
    }
}

/// One traversable direction of a [`RoadEdge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Traversal {
    pub edge: usize,
    pub forward: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub arc: Traversal,
    pub target: NodeIndex,
}

/// Candidates pulled from the projected index before re-ranking by
/// great-circle distance.
const SNAP_CANDIDATES: usize = 8;

/// Read-only road network with neighbor and nearest-node lookups.
pub struct RoadGraph {
    graph: DiGraph<RoadNode, Traversal>,
    edges: Vec<RoadEdge>,
    by_id: HashMap<u64, NodeIndex>,
    /// Points are `[lng * lng_scale, lat]`, an equirectangular projection
    /// around the mean node latitude.
    rtree: RTree<GeomWithData<[f64; 2], NodeIndex>>,
    lng_scale: f64,
}

impl RoadGraph {
    /// Validates and indexes a node/edge dataset.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError`] on duplicate ids, edges referencing unknown
    /// nodes, invalid coordinates, or negative/non-finite weights.
    pub fn build(nodes: Vec<RoadNode>, edges: Vec<RoadEdge>) -> Result<Self, GraphError> {
        let mut graph = DiGraph::with_capacity(nodes.len(), edges.len() * 2);
        let mut by_id = HashMap::with_capacity(nodes.len());

        for node in nodes {
            if !node.location.is_valid() {
                return Err(GraphError::InvalidNodeLocation(node.id));
            }
            match by_id.entry(node.id) {
                Entry::Occupied(_) => return Err(GraphError::DuplicateNode(node.id)),
                Entry::Vacant(slot) => {
                    slot.insert(graph.add_node(node));
                }
            }
        }

        let mut seen = HashSet::with_capacity(edges.len());
        for (index, edge) in edges.iter().enumerate() {
            if !seen.insert(edge.id) {
                return Err(GraphError::DuplicateEdge(edge.id));
            }
            for (field, value) in [("base_cost", edge.base_cost), ("length_m", edge.length_m)] {
                if !value.is_finite() || value < 0.0 {
                    return Err(GraphError::InvalidEdgeWeight {
                        edge: edge.id,
                        field,
                        value,
                    });
                }
            }
            let lookup = |node: u64| {
                by_id
                    .get(&node)
                    .copied()
                    .ok_or(GraphError::UnknownNode { edge: edge.id, node })
            };
            let (from, to) = (lookup(edge.from)?, lookup(edge.to)?);

            graph.add_edge(from, to, Traversal { edge: index, forward: true });
            if edge.bidirectional {
                graph.add_edge(to, from, Traversal { edge: index, forward: false });
            }
        }

        let lng_scale = projection_scale(graph.node_weights().map(|n| n.location.lat));
        let rtree = RTree::bulk_load(
            graph
                .node_indices()
                .map(|ix| {
                    let Location { lat, lng } = graph[ix].location;
                    GeomWithData::new([lng * lng_scale, lat], ix)
                })
                .collect(),
        );

        log::info!(
            "road graph built: {} nodes, {} edges ({} arcs)",
            graph.node_count(),
            edges.len(),
            graph.edge_count()
        );

        Ok(Self {
            graph,
            edges,
            by_id,
            rtree,
            lng_scale,
        })
    }

    /// # Errors
    ///
    /// See [`RoadGraph::build`].
    pub fn from_dataset(dataset: GraphDataset) -> Result<Self, GraphError> {
        Self::build(dataset.nodes, dataset.edges)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn node(&self, ix: NodeIndex) -> &RoadNode {
        &self.graph[ix]
    }

    pub fn node_by_id(&self, id: u64) -> Option<NodeIndex> {
        self.by_id.get(&id).copied()
    }

    pub fn edges(&self) -> &[RoadEdge] {
        &self.edges
    }

    pub fn edge(&self, index: usize) -> &RoadEdge {
        &self.edges[index]
    }

    /// Outgoing traversals from `node`.
    pub fn neighbors(&self, node: NodeIndex) -> impl Iterator<Item = Step> + '_ {
        self.graph.edges(node).map(|e| Step {
            arc: *e.weight(),
            target: e.target(),
        })
    }

    /// Closest node to `location` by great-circle distance. Equal distances
    /// resolve to the lower node index.
    pub fn nearest_node(&self, location: Location) -> Option<NodeIndex> {
        self.rtree
            .nearest_neighbor_iter(&[location.lng * self.lng_scale, location.lat])
            .take(SNAP_CANDIDATES)
            .map(|entry| (haversine_m(location, self.graph[entry.data].location), entry.data))
            .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)))
            .map(|(_, ix)| ix)
    }

    /// Full polyline of an edge including endpoints, in edge order.
    pub fn edge_geometry(&self, index: usize) -> Vec<Location> {
        let edge = &self.edges[index];
        let endpoint = |id: u64| self.by_id.get(&id).map(|&ix| self.graph[ix].location);

        let mut points = Vec::with_capacity(edge.geometry.len() + 2);
        points.extend(endpoint(edge.from));
        points.extend(edge.geometry.iter().copied());
        points.extend(endpoint(edge.to));
        points
    }

    /// Polyline of an arc in travel direction.
    pub fn arc_geometry(&self, arc: Traversal) -> Vec<Location> {
        let mut points = self.edge_geometry(arc.edge);
        if !arc.forward {
            points.reverse();
        }
        points
    }
}

fn projection_scale(lats: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = lats.fold((0.0, 0_usize), |(sum, count), lat| (sum + lat, count + 1));
    if count == 0 {
        return 1.0;
    }
    // Clamped so polar extracts still get a usable projection.
    (sum / count as f64).to_radians().cos().max(0.01)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn node(id: u64, lat: f64, lng: f64) -> RoadNode {
        RoadNode {
            id,
            location: Location::new(lat, lng),
        }
    }

    fn edge(id: u64, from: u64, to: u64) -> RoadEdge {
        RoadEdge {
            id,
            from,
            to,
            base_cost: 10.0,
            length_m: 14.0,
            bidirectional: true,
            geometry: vec![],
        }
    }

    #[test]
    fn rejects_edge_to_unknown_node() {
        let result = RoadGraph::build(vec![node(1, 0.0, 0.0)], vec![edge(7, 1, 2)]);
        assert_eq!(result.err(), Some(GraphError::UnknownNode { edge: 7, node: 2 }));
    }

    #[test]
    fn rejects_duplicate_edge_ids() {
        let nodes = vec![node(1, 0.0, 0.0), node(2, 0.0, 0.001)];
        let result = RoadGraph::build(nodes, vec![edge(7, 1, 2), edge(7, 2, 1)]);
        assert_eq!(result.err(), Some(GraphError::DuplicateEdge(7)));
    }

    #[test]
    fn rejects_negative_cost() {
        let nodes = vec![node(1, 0.0, 0.0), node(2, 0.0, 0.001)];
        let mut bad = edge(7, 1, 2);
        bad.base_cost = -1.0;
        assert!(matches!(
            RoadGraph::build(nodes, vec![bad]),
            Err(GraphError::InvalidEdgeWeight { edge: 7, field: "base_cost", .. })
        ));
    }

    #[test]
    fn directed_edges_are_one_way() {
        let nodes = vec![node(1, 0.0, 0.0), node(2, 0.0, 0.001)];
        let mut one_way = edge(7, 1, 2);
        one_way.bidirectional = false;
        let graph = RoadGraph::build(nodes, vec![one_way]).unwrap();

        let a = graph.node_by_id(1).unwrap();
        let b = graph.node_by_id(2).unwrap();
        assert_eq!(graph.neighbors(a).count(), 1);
        assert_eq!(graph.neighbors(b).count(), 0);
    }

    #[test]
    fn snaps_to_nearest_node() {
        let graph = RoadGraph::build(vec![node(1, 30.0, 76.0), node(2, 30.01, 76.01)], vec![]).unwrap();
        let snapped = graph.nearest_node(Location::new(30.009, 76.0095)).unwrap();
        assert_eq!(graph.node(snapped).id, 2);
    }

    #[test]
    fn snapping_measures_ground_distance_at_high_latitude() {
        // At 60°N a degree of longitude is half a degree of latitude on the
        // ground: node 2 is ~83 m east, node 1 ~100 m north.
        let graph = RoadGraph::build(vec![node(1, 60.0009, 10.0), node(2, 60.0, 10.0015)], vec![]).unwrap();
        let snapped = graph.nearest_node(Location::new(60.0, 10.0)).unwrap();
        assert_eq!(graph.node(snapped).id, 2);
    }

    #[test]
    fn empty_graph_has_no_nearest_node() {
        let graph = RoadGraph::build(vec![], vec![]).unwrap();
        assert_eq!(graph.nearest_node(Location::new(0.0, 0.0)), None);
    }

    #[test]
    fn reversed_arc_geometry_runs_backwards() {
        let nodes = vec![node(1, 0.0, 0.0), node(2, 0.0, 0.002)];
        let mut shaped = edge(7, 1, 2);
        shaped.geometry = vec![Location::new(0.0005, 0.001)];
        let graph = RoadGraph::build(nodes, vec![shaped]).unwrap();

        let back = graph.arc_geometry(Traversal { edge: 0, forward: false });
        assert_eq!(
            back,
            vec![Location::new(0.0, 0.002), Location::new(0.0005, 0.001), Location::new(0.0, 0.0)]
        );
    }

    #[test]
    fn loads_dataset_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(
            &path,
            r#"{
                "nodes": [
                    {"id": 1, "location": {"lat": 0.0, "lng": 0.0}},
                    {"id": 2, "location": {"lat": 0.0, "lng": 0.001}}
                ],
                "edges": [
                    {"id": 10, "from": 1, "to": 2, "base_cost": 80.0, "length_m": 111.0}
                ]
            }"#,
        )
        .unwrap();

        let graph = RoadGraph::from_dataset(GraphDataset::from_json_file(&path).unwrap()).unwrap();
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);
        assert!(graph.edge(0).bidirectional);
    }
}
