//! Incident store: raw, timestamped, categorized reports indexed by H3 cell.
//!
//! Cells are spread over a fixed number of shards, each behind its own
//! `RwLock`. Ingestion write-locks exactly one shard, so reports landing in
//! different shards are applied in parallel and readers only ever wait on a
//! writer touching the same shard. Within a cell incidents are kept sorted by
//! timestamp so retention windows are a pair of binary searches.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use h3o::{CellIndex, Resolution};
use serde::{Deserialize, Serialize};

use crate::cell::{cell_of, cells_in_region};
use crate::config::{BoundsConfig, EngineConfig};
use crate::error::{ConfigError, QueryError, ValidationError};
use crate::model::{CategoryId, Location, PreparedRegion, Region, Timestamp};

pub type IncidentId = u64;

/// An ingestion input record, as delivered by an external reporting source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentReport {
    pub category: CategoryId,
    pub location: Location,
    pub timestamp: Timestamp,
    pub severity: f64,
}

/// A recorded incident. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub category: CategoryId,
    pub location: Location,
    pub timestamp: Timestamp,
    pub severity: f64,
}

/// Outcome of a batch ingestion. Rejected records keep their batch index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub accepted: Vec<IncidentId>,
    pub rejected: Vec<(usize, ValidationError)>,
}

#[derive(Default)]
struct Shard {
    cells: HashMap<CellIndex, Vec<Incident>>,
}

pub struct IncidentStore {
    shards: Vec<RwLock<Shard>>,
    resolution: Resolution,
    retention: chrono::Duration,
    bounds: Option<BoundsConfig>,
    categories: BTreeSet<CategoryId>,
    max_region_cells: usize,
    next_id: AtomicU64,
}

impl IncidentStore {
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configured resolution or retention is
    /// invalid.
    pub fn new(config: &EngineConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            shards: (0..config.shard_count.max(1))
                .map(|_| RwLock::new(Shard::default()))
                .collect(),
            resolution: config.h3_resolution()?,
            retention: config.retention()?,
            bounds: config.bounds,
            categories: config.categories.keys().cloned().collect(),
            max_region_cells: config.max_region_cells,
            next_id: AtomicU64::new(1),
        })
    }

    pub const fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub const fn retention(&self) -> chrono::Duration {
        self.retention
    }

    pub const fn max_region_cells(&self) -> usize {
        self.max_region_cells
    }

    pub fn knows_category(&self, category: &CategoryId) -> bool {
        self.categories.contains(category)
    }

    /// Validates and stores a single report.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the severity is outside `[0, 1]`, the
    /// location is invalid or out of bounds, or the category is unknown.
    pub fn ingest(&self, report: IncidentReport) -> Result<IncidentId, ValidationError> {
        let cell = self.validate(&report)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let incident = Incident {
            id,
            category: report.category,
            location: report.location,
            timestamp: report.timestamp,
            severity: report.severity,
        };

        let mut shard = self.shard(cell).write().unwrap_or_else(PoisonError::into_inner);
        let incidents = shard.cells.entry(cell).or_default();
        let at = incidents.partition_point(|i| i.timestamp <= incident.timestamp);
        incidents.insert(at, incident);

        Ok(id)
    }

    /// Ingests each report independently; a rejected record never stops the
    /// batch.
    pub fn ingest_batch(&self, reports: impl IntoIterator<Item = IncidentReport>) -> BatchReport {
        let mut outcome = BatchReport::default();
        for (index, report) in reports.into_iter().enumerate() {
            match self.ingest(report) {
                Ok(id) => outcome.accepted.push(id),
                Err(e) => {
                    log::warn!("rejected incident record {index}: {e}");
                    outcome.rejected.push((index, e));
                }
            }
        }
        outcome
    }

    fn validate(&self, report: &IncidentReport) -> Result<CellIndex, ValidationError> {
        if !report.severity.is_finite() || !(0.0..=1.0).contains(&report.severity) {
            return Err(ValidationError::Severity(report.severity));
        }
        let Location { lat, lng } = report.location;
        if !report.location.is_valid() {
            return Err(ValidationError::InvalidLocation { lat, lng });
        }
        if let Some(bounds) = &self.bounds {
            if !bounds.contains(report.location) {
                return Err(ValidationError::OutOfBounds { lat, lng });
            }
        }
        if !self.categories.is_empty() && !self.categories.contains(&report.category) {
            return Err(ValidationError::UnknownCategory(report.category.to_string()));
        }
        cell_of(report.location, self.resolution).ok_or(ValidationError::InvalidLocation { lat, lng })
    }

    fn shard(&self, cell: CellIndex) -> &RwLock<Shard> {
        let mut hasher = DefaultHasher::new();
        cell.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    /// Exclusive lower edge of the retention window. Clamps to the earliest
    /// representable instant instead of overflowing.
    fn window_start(&self, as_of: Timestamp) -> Timestamp {
        as_of
            .checked_sub_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Runs `f` over the incidents of `cell` that are visible at `as_of`,
    /// i.e. with `as_of - retention < timestamp <= as_of`, under a read lock.
    pub fn with_cell<R>(&self, cell: CellIndex, as_of: Timestamp, f: impl FnOnce(&[Incident]) -> R) -> R {
        let oldest_excluded = self.window_start(as_of);
        let shard = self.shard(cell).read().unwrap_or_else(PoisonError::into_inner);
        let incidents = shard.cells.get(&cell).map_or(&[][..], Vec::as_slice);
        let start = incidents.partition_point(|i| i.timestamp <= oldest_excluded);
        let end = incidents.partition_point(|i| i.timestamp <= as_of);
        f(&incidents[start..end.max(start)])
    }

    /// Incidents inside `region` with a category in `categories`, visible at
    /// `as_of`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidRequest`] if the region is degenerate or
    /// covers more than `max_region_cells` cells.
    pub fn query<'a>(
        &'a self,
        region: &Region,
        categories: &BTreeSet<CategoryId>,
        as_of: Timestamp,
    ) -> Result<IncidentQuery<'a>, QueryError> {
        Ok(IncidentQuery {
            store: self,
            cells: cells_in_region(region, self.resolution, self.max_region_cells)?,
            region: region.prepare(),
            categories: categories.clone(),
            as_of,
        })
    }

    /// Drops incidents that fell out of the retention window at `now`.
    /// Returns how many were removed.
    pub fn purge(&self, now: Timestamp) -> usize {
        let oldest_excluded = self.window_start(now);
        let mut purged = 0;
        for shard in &self.shards {
            let mut shard = shard.write().unwrap_or_else(PoisonError::into_inner);
            shard.cells.retain(|_, incidents| {
                let expired = incidents.partition_point(|i| i.timestamp <= oldest_excluded);
                incidents.drain(..expired);
                purged += expired;
                !incidents.is_empty()
            });
        }
        if purged > 0 {
            log::info!("purged {purged} expired incidents");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .cells
                    .values()
                    .map(Vec::len)
                    .sum::<usize>()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A lazy, restartable incident query. Each call to [`IncidentQuery::iter`]
/// re-reads the store one cell at a time.
pub struct IncidentQuery<'a> {
    store: &'a IncidentStore,
    cells: Vec<CellIndex>,
    region: PreparedRegion,
    categories: BTreeSet<CategoryId>,
    as_of: Timestamp,
}

impl IncidentQuery<'_> {
    pub fn iter(&self) -> impl Iterator<Item = Incident> + '_ {
        self.cells.iter().flat_map(move |&cell| {
            self.store.with_cell(cell, self.as_of, |incidents| {
                incidents
                    .iter()
                    .filter(|i| self.categories.contains(&i.category) && self.region.contains(i.location))
                    .cloned()
                    .collect::<Vec<_>>()
            })
        })
    }
}

impl<'q> IntoIterator for &'q IncidentQuery<'_> {
    type Item = Incident;
    type IntoIter = Box<dyn Iterator<Item = Incident> + 'q>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}
