//! Safety-aware route scoring and heatmap aggregation.
//!
//! Incident reports are aggregated into a decayed, per-category risk surface
//! over H3 cells. Routes trade travel time against accumulated risk on that
//! surface and come back with a Safe / Moderate / Risky rating.

pub mod api;
pub mod cell;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod incident;
pub mod model;
pub mod osm;
pub mod router;
pub mod safety;
pub mod scorer;

pub use config::EngineConfig;
pub use engine::{HeatmapCell, RouteOptions, RouteResult, SafetyEngine};
pub use error::{ConfigError, GraphError, QueryError, ValidationError};
pub use graph::{GraphDataset, RoadEdge, RoadGraph, RoadNode};
pub use incident::{Incident, IncidentReport};
pub use model::{CategoryId, Location, Region, Timestamp};
pub use scorer::SafetyRating;
