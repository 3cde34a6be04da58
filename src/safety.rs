use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use h3o::{CellIndex, Resolution};
use serde::Serialize;

use crate::cell::{self, Footprint};
use crate::config::EngineConfig;
use crate::error::QueryError;
use crate::incident::IncidentStore;
use crate::model::{CategoryId, Location, Region, Timestamp};

/// Share of an incident's severity still counted after `age_secs`.
///
/// `decay(0) == 1`, non-increasing, tends to 0.
pub fn decay(age_secs: f64, half_life_secs: f64) -> f64 {
    if age_secs <= 0.0 {
        1.0
    } else {
        0.5_f64.powf(age_secs / half_life_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CategoryRisk {
    pub risk: f64,
    pub incidents: usize,
}

/// Per-category view of one grid cell at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskCell {
    pub cell: CellIndex,
    pub center: Location,
    pub categories: BTreeMap<CategoryId, CategoryRisk>,
}

impl RiskCell {
    pub fn total(&self) -> f64 {
        self.categories.values().map(|c| c.risk).sum()
    }
}

/// Decay-weighted risk surface over the incident store.
///
/// Nothing is cached: every value is summed from the store at call time, so
/// it reflects every incident whose ingestion completed before the call.
pub struct RiskGrid {
    store: Arc<IncidentStore>,
    half_lives: HashMap<CategoryId, f64>,
    default_half_life: f64,
}

impl RiskGrid {
    pub fn new(store: Arc<IncidentStore>, config: &EngineConfig) -> Self {
        let half_lives = config
            .categories
            .keys()
            .map(|id| (id.clone(), config.half_life_secs(id)))
            .collect();
        Self {
            store,
            half_lives,
            default_half_life: config.default_half_life_days * 86_400.0,
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.store.resolution()
    }

    fn half_life(&self, category: &CategoryId) -> f64 {
        self.half_lives
            .get(category)
            .copied()
            .unwrap_or(self.default_half_life)
    }

    pub fn risk_at(&self, cell: CellIndex, categories: &BTreeSet<CategoryId>, as_of: Timestamp) -> f64 {
        if categories.is_empty() {
            return 0.0;
        }
        self.store.with_cell(cell, as_of, |incidents| {
            incidents
                .iter()
                .filter(|i| categories.contains(&i.category))
                .map(|i| i.severity * decay(age_secs(as_of, i.timestamp), self.half_life(&i.category)))
                .sum()
        })
    }

    pub fn cell_summary(&self, cell: CellIndex, categories: &BTreeSet<CategoryId>, as_of: Timestamp) -> RiskCell {
        let mut per_category: BTreeMap<CategoryId, CategoryRisk> = BTreeMap::new();
        self.store.with_cell(cell, as_of, |incidents| {
            for i in incidents.iter().filter(|i| categories.contains(&i.category)) {
                let entry = per_category.entry(i.category.clone()).or_default();
                entry.risk += i.severity * decay(age_secs(as_of, i.timestamp), self.half_life(&i.category));
                entry.incidents += 1;
            }
        });
        RiskCell {
            cell,
            center: cell::cell_center(cell),
            categories: per_category,
        }
    }

    /// # Errors
    ///
    /// Returns [`QueryError::InvalidRequest`] if the region is degenerate or
    /// too large.
    pub fn cells_in_region(&self, region: &Region) -> Result<Vec<CellIndex>, QueryError> {
        cell::cells_in_region(region, self.resolution(), self.store.max_region_cells())
    }

    pub fn footprint(&self, geometry: &[Location]) -> Footprint {
        cell::footprint(geometry, self.resolution())
    }

    /// Length-weighted risk along an edge footprint.
    pub fn edge_risk(&self, footprint: &[(CellIndex, f64)], categories: &BTreeSet<CategoryId>, as_of: Timestamp) -> f64 {
        footprint
            .iter()
            .map(|&(cell, share)| self.risk_at(cell, categories, as_of) * share)
            .sum()
    }
}

fn age_secs(as_of: Timestamp, timestamp: Timestamp) -> f64 {
    let millis = (as_of - timestamp).num_milliseconds() as f64;
    millis / 1_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::cell_of;
    use crate::incident::IncidentReport;
    use chrono::{Duration, TimeZone, Utc};

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn grid() -> (Arc<IncidentStore>, RiskGrid) {
        let config = EngineConfig::default();
        let store = Arc::new(IncidentStore::new(&config).unwrap());
        let grid = RiskGrid::new(Arc::clone(&store), &config);
        (store, grid)
    }

    fn theft(severity: f64, at: Timestamp) -> IncidentReport {
        IncidentReport {
            category: "thefts".into(),
            location: Location::new(30.3398, 76.3869),
            timestamp: at,
            severity,
        }
    }

    fn cats(ids: &[&str]) -> BTreeSet<CategoryId> {
        ids.iter().map(|&id| CategoryId::from(id)).collect()
    }

    #[test]
    fn decay_is_one_at_zero_and_halves_per_half_life() {
        assert_eq!(decay(0.0, 10.0), 1.0);
        assert!((decay(10.0, 10.0) - 0.5).abs() < 1e-12);
        assert!(decay(1e9, 10.0) < 1e-6);
    }

    #[test]
    fn fresh_incident_counts_its_full_severity() {
        let (store, grid) = grid();
        store.ingest(theft(0.7, now())).unwrap();
        let cell = cell_of(Location::new(30.3398, 76.3869), grid.resolution()).unwrap();
        assert!(grid.risk_at(cell, &cats(&["thefts"]), now()) >= 0.7);
    }

    #[test]
    fn risk_is_non_increasing_over_time() {
        let (store, grid) = grid();
        store.ingest(theft(0.9, now())).unwrap();
        store.ingest(theft(0.3, now() - Duration::days(20))).unwrap();
        let cell = cell_of(Location::new(30.3398, 76.3869), grid.resolution()).unwrap();

        let mut previous = f64::INFINITY;
        for days in [0, 1, 7, 30, 120, 364, 366] {
            let risk = grid.risk_at(cell, &cats(&["thefts"]), now() + Duration::days(days));
            assert!(risk <= previous, "risk grew at +{days}d");
            previous = risk;
        }
    }

    #[test]
    fn categories_filter_the_aggregate() {
        let (store, grid) = grid();
        store.ingest(theft(0.5, now())).unwrap();
        let cell = cell_of(Location::new(30.3398, 76.3869), grid.resolution()).unwrap();
        assert_eq!(grid.risk_at(cell, &cats(&["assaults"]), now()), 0.0);
        assert_eq!(grid.risk_at(cell, &BTreeSet::new(), now()), 0.0);

        let summary = grid.cell_summary(cell, &cats(&["thefts", "assaults"]), now());
        assert_eq!(summary.categories.len(), 1);
        assert_eq!(summary.categories[&CategoryId::from("thefts")].incidents, 1);
        assert!((summary.total() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn edge_risk_weights_cells_by_length_share() {
        let (store, grid) = grid();
        store.ingest(theft(1.0, now())).unwrap();
        let cell = cell_of(Location::new(30.3398, 76.3869), grid.resolution()).unwrap();
        let risk = grid.edge_risk(&[(cell, 0.25)], &cats(&["thefts"]), now());
        assert!((risk - 0.25).abs() < 1e-12);
    }
}
