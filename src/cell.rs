//! H3 cell helpers shared by the incident store and the risk grid.

use std::collections::BTreeMap;

use geo::{ChamberlainDuquetteArea, Distance, Haversine};
use h3o::geom::{ContainmentMode, TilerBuilder};
use h3o::{CellIndex, LatLng, Resolution};

use crate::error::QueryError;
use crate::model::{Location, Region};

/// Fraction of an edge's length that lies inside one cell.
pub type Footprint = Vec<(CellIndex, f64)>;

pub fn cell_of(location: Location, resolution: Resolution) -> Option<CellIndex> {
    LatLng::new(location.lat, location.lng)
        .ok()
        .map(|ll| ll.to_cell(resolution))
}

pub fn cell_center(cell: CellIndex) -> Location {
    let center = LatLng::from(cell);
    Location::new(center.lat(), center.lng())
}

pub fn haversine_m(a: Location, b: Location) -> f64 {
    Haversine.distance(a.to_point(), b.to_point())
}

/// All cells intersecting `region`, sorted and deduplicated.
///
/// Regions whose area is far beyond `max_cells` average cells are refused
/// up front; h3o traces a region's outline eagerly. Otherwise the tiler is
/// drained lazily and stops one cell past `max_cells`.
///
/// # Errors
///
/// Returns [`QueryError::InvalidRequest`] for degenerate regions and for
/// regions covering more than `max_cells` cells.
pub fn cells_in_region(
    region: &Region,
    resolution: Resolution,
    max_cells: usize,
) -> Result<Vec<CellIndex>, QueryError> {
    if !region.is_valid() {
        return Err(QueryError::InvalidRequest(
            "region has invalid coordinates".to_string(),
        ));
    }

    let polygon = region.to_polygon();
    let estimate = polygon.chamberlain_duquette_unsigned_area() / resolution.area_m2();
    if estimate > 2.0 * max_cells as f64 {
        return Err(too_many_cells(max_cells, resolution));
    }

    let mut tiler = TilerBuilder::new(resolution)
        .containment_mode(ContainmentMode::IntersectsBoundary)
        .build();
    tiler
        .add(polygon)
        .map_err(|e| QueryError::InvalidRequest(format!("failure adding region to h3 tiler: {e}")))?;

    let mut cells: Vec<CellIndex> = tiler.into_coverage().take(max_cells.saturating_add(1)).collect();
    if cells.len() > max_cells {
        return Err(too_many_cells(max_cells, resolution));
    }
    cells.sort_unstable();
    cells.dedup();
    Ok(cells)
}

fn too_many_cells(max_cells: usize, resolution: Resolution) -> QueryError {
    QueryError::InvalidRequest(format!(
        "region covers more than {max_cells} cells at resolution {resolution}"
    ))
}

/// Splits a polyline into per-cell length fractions summing to 1.
///
/// Each segment is sampled in steps of a quarter cell edge; a step is
/// attributed to the cell containing its midpoint. Degenerate (zero length)
/// geometry is attributed entirely to the cell of its first point.
pub fn footprint(points: &[Location], resolution: Resolution) -> Footprint {
    let Some(&first) = points.first() else {
        return Vec::new();
    };

    let total: f64 = points.windows(2).map(|w| haversine_m(w[0], w[1])).sum();
    if total <= 0.0 {
        return cell_of(first, resolution)
            .map(|cell| vec![(cell, 1.0)])
            .unwrap_or_default();
    }

    let step = resolution.edge_length_m() / 4.0;
    let mut shares: BTreeMap<CellIndex, f64> = BTreeMap::new();

    for w in points.windows(2) {
        let (a, b) = (w[0], w[1]);
        let len = haversine_m(a, b);
        if len <= 0.0 {
            continue;
        }
        let steps = (len / step).ceil().max(1.0) as usize;
        let share = len / steps as f64 / total;
        for i in 0..steps {
            let t = (i as f64 + 0.5) / steps as f64;
            // Linear interpolation is accurate at street-segment scale.
            let mid = Location::new(a.lat + (b.lat - a.lat) * t, a.lng + (b.lng - a.lng) * t);
            if let Some(cell) = cell_of(mid, resolution) {
                *shares.entry(cell).or_insert(0.0) += share;
            }
        }
    }

    shares.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RES: Resolution = Resolution::Nine;

    #[test]
    fn footprint_fractions_sum_to_one() {
        let line = [
            Location::new(28.6139, 77.2090),
            Location::new(28.6200, 77.2150),
            Location::new(28.6250, 77.2100),
        ];
        let fp = footprint(&line, RES);
        assert!(fp.len() > 1);
        let sum: f64 = fp.iter().map(|(_, f)| f).sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn footprint_of_single_point_is_its_cell() {
        let p = Location::new(30.3398, 76.3869);
        let fp = footprint(&[p, p], RES);
        assert_eq!(fp, vec![(cell_of(p, RES).unwrap(), 1.0)]);
    }

    #[test]
    fn region_cells_cover_interior_points() {
        let region = Region::bbox(Location::new(28.61, 77.20), Location::new(28.62, 77.22));
        let cells = cells_in_region(&region, RES, 10_000).unwrap();
        let inner = cell_of(Location::new(28.615, 77.21), RES).unwrap();
        assert!(cells.contains(&inner));
        assert!(cells.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn invalid_region_is_rejected() {
        let region = Region::Polygon {
            exterior: vec![Location::new(0.0, 0.0)],
        };
        assert!(cells_in_region(&region, RES, 10_000).is_err());
    }

    #[test]
    fn region_over_the_cell_limit_is_rejected() {
        let region = Region::bbox(Location::new(28.61, 77.20), Location::new(28.62, 77.22));
        let all = cells_in_region(&region, RES, 10_000).unwrap();
        assert!(all.len() > 3);
        assert_eq!(cells_in_region(&region, RES, all.len()).unwrap(), all);
        assert!(matches!(
            cells_in_region(&region, RES, 3),
            Err(QueryError::InvalidRequest(_))
        ));
    }

    #[test]
    fn continent_sized_region_stops_at_the_limit() {
        let region = Region::bbox(Location::new(-60.0, -170.0), Location::new(60.0, 170.0));
        assert!(cells_in_region(&region, RES, 1_000).is_err());
    }
}
