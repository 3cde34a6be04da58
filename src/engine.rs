//! The query facade: the only surface the presentation layer talks to.
//!
//! `plan_route` and `heatmap` are pure functions of the current store
//! contents and their arguments. The road graph sits behind an
//! `RwLock<Arc<_>>` so a reload swaps it without blocking in-flight queries;
//! the lock is only held long enough to clone the `Arc`.

use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use h3o::CellIndex;
use itertools::Itertools;
use serde::Serialize;

use crate::cell::{self, Footprint};
use crate::config::EngineConfig;
use crate::error::{ConfigError, QueryError, ValidationError};
use crate::graph::RoadGraph;
use crate::incident::{BatchReport, IncidentId, IncidentQuery, IncidentReport, IncidentStore};
use crate::model::{CategoryId, Location, Region, Timestamp};
use crate::router::{Router, SearchLimits};
use crate::safety::{RiskCell, RiskGrid};
use crate::scorer::{SafetyRating, SafetyScorer, summarize};

/// Graph plus the per-edge cell footprints derived from it.
struct Network {
    graph: RoadGraph,
    footprints: Vec<Footprint>,
}

impl Network {
    fn new(graph: RoadGraph, grid: &RiskGrid) -> Self {
        let footprints = (0..graph.edge_count())
            .map(|ix| grid.footprint(&graph.edge_geometry(ix)))
            .collect();
        Self { graph, footprints }
    }
}

/// Per-request routing knobs. Everything defaults to the engine config.
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    pub risk_aversion: Option<f64>,
    pub timeout: Option<Duration>,
    pub cancel: Option<Arc<AtomicBool>>,
}

/// One road segment of a planned route, in travel direction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteLeg {
    pub edge_id: u64,
    pub from_node: u64,
    pub to_node: u64,
    pub length_m: f64,
    pub duration_s: f64,
    pub risk: f64,
    pub geometry: Vec<Location>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteResult {
    pub legs: Vec<RouteLeg>,
    /// Concatenated leg geometry without repeated joints.
    pub geometry: Vec<Location>,
    pub total_distance_m: f64,
    pub total_duration_s: f64,
    pub total_risk: f64,
    pub risk_density: f64,
    pub safety_rating: SafetyRating,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeatmapCell {
    pub cell: CellIndex,
    pub center: Location,
    pub risk: f64,
}

pub struct SafetyEngine {
    config: EngineConfig,
    store: Arc<IncidentStore>,
    grid: RiskGrid,
    scorer: SafetyScorer,
    network: RwLock<Arc<Network>>,
}

impl SafetyEngine {
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    pub fn new(config: EngineConfig, graph: RoadGraph) -> Result<Self, ConfigError> {
        config.validate()?;
        let store = Arc::new(IncidentStore::new(&config)?);
        let grid = RiskGrid::new(Arc::clone(&store), &config);
        let scorer = SafetyScorer::new(&config.safety)?;
        let network = Network::new(graph, &grid);

        log::info!(
            "safety engine ready: resolution {}, {} categories, lambda {}",
            config.resolution,
            config.categories.len(),
            config.risk_aversion
        );

        Ok(Self {
            config,
            store,
            grid,
            scorer,
            network: RwLock::new(Arc::new(network)),
        })
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn categories(&self) -> impl Iterator<Item = &CategoryId> {
        self.config.categories.keys()
    }

    pub const fn store(&self) -> &Arc<IncidentStore> {
        &self.store
    }

    pub const fn grid(&self) -> &RiskGrid {
        &self.grid
    }

    /// Replaces the road graph. In-flight queries finish on the old one.
    pub fn reload_graph(&self, graph: RoadGraph) {
        let network = Arc::new(Network::new(graph, &self.grid));
        *self.network.write().unwrap_or_else(PoisonError::into_inner) = network;
        log::info!("road graph reloaded");
    }

    fn network(&self) -> Arc<Network> {
        Arc::clone(&self.network.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// # Errors
    ///
    /// See [`IncidentStore::ingest`].
    pub fn ingest(&self, report: IncidentReport) -> Result<IncidentId, ValidationError> {
        self.store.ingest(report)
    }

    pub fn ingest_batch(&self, reports: impl IntoIterator<Item = IncidentReport>) -> BatchReport {
        let outcome = self.store.ingest_batch(reports);
        log::debug!(
            "ingested batch: {} accepted, {} rejected",
            outcome.accepted.len(),
            outcome.rejected.len()
        );
        outcome
    }

    pub fn purge(&self, now: Timestamp) -> usize {
        self.store.purge(now)
    }

    /// Unknown category ids are dropped rather than rejected, so stale
    /// client-side filter sets keep working.
    pub fn enabled_categories<'a>(&self, requested: impl IntoIterator<Item = &'a CategoryId>) -> BTreeSet<CategoryId> {
        requested
            .into_iter()
            .filter(|c| self.store.knows_category(c))
            .cloned()
            .collect()
    }

    /// # Errors
    ///
    /// See [`SafetyEngine::plan_route_with`].
    pub fn plan_route<'a>(
        &self,
        origin: Location,
        destination: Location,
        categories: impl IntoIterator<Item = &'a CategoryId>,
        as_of: Timestamp,
    ) -> Result<RouteResult, QueryError> {
        self.plan_route_with(origin, destination, categories, as_of, &RouteOptions::default())
    }

    /// Plans the route minimizing `travel time + λ * risk` between the graph
    /// nodes nearest to `origin` and `destination`.
    ///
    /// # Errors
    ///
    /// [`QueryError::InvalidRequest`] for bad coordinates or λ,
    /// [`QueryError::NoRoute`] if the points are not connected,
    /// [`QueryError::Timeout`] if the deadline or cancel flag trips.
    pub fn plan_route_with<'a>(
        &self,
        origin: Location,
        destination: Location,
        categories: impl IntoIterator<Item = &'a CategoryId>,
        as_of: Timestamp,
        options: &RouteOptions,
    ) -> Result<RouteResult, QueryError> {
        if !origin.is_valid() || !destination.is_valid() {
            return Err(QueryError::InvalidRequest(
                "origin and destination must be valid coordinates".to_string(),
            ));
        }
        let lambda = options.risk_aversion.unwrap_or(self.config.risk_aversion);
        if !lambda.is_finite() || lambda < 0.0 {
            return Err(QueryError::InvalidRequest(format!(
                "risk aversion must be a finite value >= 0, got {lambda}"
            )));
        }
        let timeout = options
            .timeout
            .unwrap_or_else(|| Duration::from_millis(self.config.routing.default_timeout_ms));
        let limits = SearchLimits {
            deadline: Instant::now().checked_add(timeout),
            cancel: options.cancel.clone(),
        };

        let enabled = self.enabled_categories(categories);
        let network = self.network();
        let graph = &network.graph;

        let (Some(source), Some(target)) = (graph.nearest_node(origin), graph.nearest_node(destination)) else {
            return Err(QueryError::NoRoute);
        };

        let path = Router::new(graph, lambda)
            .with_max_speed(self.config.routing.max_speed_mps)
            .search(
                source,
                target,
                |edge| self.grid.edge_risk(&network.footprints[edge], &enabled, as_of),
                &limits,
            )?;

        let legs: Vec<RouteLeg> = path
            .arcs
            .iter()
            .map(|scored| {
                let edge = graph.edge(scored.arc.edge);
                let (from_node, to_node) = if scored.arc.forward {
                    (edge.from, edge.to)
                } else {
                    (edge.to, edge.from)
                };
                RouteLeg {
                    edge_id: edge.id,
                    from_node,
                    to_node,
                    length_m: edge.length_m,
                    duration_s: edge.base_cost,
                    risk: scored.risk,
                    geometry: graph.arc_geometry(scored.arc),
                }
            })
            .collect();

        let geometry = if legs.is_empty() {
            vec![graph.node(source).location]
        } else {
            legs.iter()
                .flat_map(|leg| leg.geometry.iter().copied())
                .dedup()
                .collect()
        };
        let total_distance_m: f64 = legs.iter().map(|l| l.length_m).sum();
        let total_duration_s: f64 = legs.iter().map(|l| l.duration_s).sum();
        let total_risk = path.total_risk;
        let risk_density = self.scorer.density(total_risk, total_distance_m);
        let safety_rating = self.scorer.band(risk_density);

        log::debug!(
            "planned route: {} legs, {total_distance_m:.0} m, risk {total_risk:.3}, {safety_rating} ({} nodes expanded)",
            legs.len(),
            path.expanded
        );

        Ok(RouteResult {
            summary: summarize(safety_rating, total_distance_m, total_duration_s),
            legs,
            geometry,
            total_distance_m,
            total_duration_s,
            total_risk,
            risk_density,
            safety_rating,
        })
    }

    /// Cells intersecting `region` with their aggregate risk. Cells without
    /// any risk are skipped. Risk is evaluated lazily, one cell per step.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidRequest`] if the region is degenerate.
    pub fn heatmap<'a>(
        &self,
        region: &Region,
        categories: impl IntoIterator<Item = &'a CategoryId>,
        as_of: Timestamp,
    ) -> Result<impl Iterator<Item = HeatmapCell> + '_, QueryError> {
        let enabled = self.enabled_categories(categories);
        let cells = self.grid.cells_in_region(region)?;
        Ok(cells.into_iter().filter_map(move |cell| {
            let risk = self.grid.risk_at(cell, &enabled, as_of);
            (risk > 0.0).then(|| HeatmapCell {
                cell,
                center: cell::cell_center(cell),
                risk,
            })
        }))
    }

    /// Full per-category breakdown of one cell.
    pub fn cell_detail<'a>(
        &self,
        cell: CellIndex,
        categories: impl IntoIterator<Item = &'a CategoryId>,
        as_of: Timestamp,
    ) -> RiskCell {
        self.grid.cell_summary(cell, &self.enabled_categories(categories), as_of)
    }

    /// # Errors
    ///
    /// Returns [`QueryError::InvalidRequest`] if the region is degenerate.
    pub fn incidents<'a>(
        &self,
        region: &Region,
        categories: impl IntoIterator<Item = &'a CategoryId>,
        as_of: Timestamp,
    ) -> Result<IncidentQuery<'_>, QueryError> {
        self.store.query(region, &self.enabled_categories(categories), as_of)
    }
}
