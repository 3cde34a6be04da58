//! Walkable road network import from OpenStreetMap PBF extracts.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use osmpbf::{Element, ElementReader};

use crate::cell::haversine_m;
use crate::error::GraphError;
use crate::graph::{GraphDataset, RoadEdge, RoadNode};
use crate::model::Location;

/// Whether a way with these tags can be walked.
pub fn is_walkable(tags: &HashMap<&str, &str>) -> bool {
    let highway = tags.get("highway").copied().unwrap_or("");
    let foot = tags.get("foot").copied().unwrap_or("");
    let sidewalk = tags.get("sidewalk").copied().unwrap_or("");

    if matches!(foot, "no" | "private") {
        return false;
    }

    let is_walkable_type = matches!(
        highway,
        "footway" | "path" | "steps" | "pedestrian" | "living_street" | "residential" | "tertiary" | "service" | "unclassified"
    );
    let is_motor_road = matches!(highway, "motorway" | "trunk" | "primary" | "secondary");
    let foot_allowed = matches!(foot, "yes" | "designated" | "permissive");
    let has_sidewalk = matches!(sidewalk, "both" | "left" | "right" | "yes" | "separate");

    is_walkable_type || (is_motor_road && (foot_allowed || has_sidewalk))
}

/// Reads a PBF file in two passes (node coordinates, then walkable ways) and
/// produces one bidirectional edge per consecutive node pair of each way.
///
/// # Errors
///
/// Returns [`GraphError::Io`] if the file cannot be read or decoded.
pub fn load_pbf(path: impl AsRef<Path>, walking_speed_mps: f64) -> Result<GraphDataset, GraphError> {
    let path = path.as_ref();
    let io_err = |e: osmpbf::Error| GraphError::Io(format!("{}: {e}", path.display()));
    log::info!("parsing OSM PBF: {}", path.display());

    // pass 1: node coordinates
    let mut coords: HashMap<i64, Location> = HashMap::new();
    ElementReader::from_path(path)
        .map_err(io_err)?
        .for_each(|element| match element {
            Element::Node(node) => {
                coords.insert(node.id(), Location::new(node.lat(), node.lon()));
            }
            Element::DenseNode(node) => {
                coords.insert(node.id(), Location::new(node.lat(), node.lon()));
            }
            _ => {}
        })
        .map_err(io_err)?;
    log::info!("loaded {} OSM nodes, building edges", coords.len());

    // pass 2: walkable ways
    let mut used: HashSet<i64> = HashSet::new();
    let mut edges = Vec::new();
    ElementReader::from_path(path)
        .map_err(io_err)?
        .for_each(|element| {
            let Element::Way(way) = element else {
                return;
            };
            let tags: HashMap<&str, &str> = way.tags().collect();
            if !is_walkable(&tags) {
                return;
            }

            let refs: Vec<i64> = way.refs().collect();
            for window in refs.windows(2) {
                let (id_a, id_b) = (window[0], window[1]);
                let (Some(&a), Some(&b)) = (coords.get(&id_a), coords.get(&id_b)) else {
                    continue;
                };
                let (Ok(from), Ok(to)) = (u64::try_from(id_a), u64::try_from(id_b)) else {
                    continue;
                };
                let length_m = haversine_m(a, b);
                used.insert(id_a);
                used.insert(id_b);
                edges.push(RoadEdge {
                    id: edges.len() as u64,
                    from,
                    to,
                    base_cost: length_m / walking_speed_mps,
                    length_m,
                    bidirectional: true,
                    geometry: Vec::new(),
                });
            }
        })
        .map_err(io_err)?;

    let mut nodes: Vec<RoadNode> = used
        .into_iter()
        .filter_map(|id| {
            let location = *coords.get(&id)?;
            Some(RoadNode {
                id: u64::try_from(id).ok()?,
                location,
            })
        })
        .collect();
    nodes.sort_unstable_by_key(|n| n.id);

    log::info!("OSM import: {} nodes, {} edges", nodes.len(), edges.len());
    Ok(GraphDataset { nodes, edges })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags<'a>(pairs: &[(&'a str, &'a str)]) -> HashMap<&'a str, &'a str> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn footways_and_residential_streets_are_walkable() {
        assert!(is_walkable(&tags(&[("highway", "footway")])));
        assert!(is_walkable(&tags(&[("highway", "residential")])));
    }

    #[test]
    fn motor_roads_need_sidewalk_or_foot_access() {
        assert!(!is_walkable(&tags(&[("highway", "primary")])));
        assert!(is_walkable(&tags(&[("highway", "primary"), ("sidewalk", "both")])));
        assert!(is_walkable(&tags(&[("highway", "trunk"), ("foot", "designated")])));
    }

    #[test]
    fn explicit_foot_ban_wins() {
        assert!(!is_walkable(&tags(&[("highway", "service"), ("foot", "no")])));
        assert!(!is_walkable(&tags(&[("building", "yes")])));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_pbf(dir.path().join("missing.osm.pbf"), 1.4);
        assert!(matches!(result, Err(GraphError::Io(_))));
    }
}
