use thiserror::Error;

/// A single incident record was rejected at ingestion. The record is skipped;
/// the rest of a batch continues.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("severity {0} is outside [0, 1]")]
    Severity(f64),
    #[error("location ({lat}, {lng}) is not a valid coordinate")]
    InvalidLocation { lat: f64, lng: f64 },
    #[error("location ({lat}, {lng}) is outside the configured bounds")]
    OutOfBounds { lat: f64, lng: f64 },
    #[error("unknown incident category `{0}`")]
    UnknownCategory(String),
}

/// Malformed road graph input. Fatal at load.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("duplicate node id {0}")]
    DuplicateNode(u64),
    #[error("duplicate edge id {0}")]
    DuplicateEdge(u64),
    #[error("edge {edge} references unknown node {node}")]
    UnknownNode { edge: u64, node: u64 },
    #[error("node {0} has an invalid location")]
    InvalidNodeLocation(u64),
    #[error("edge {edge} has invalid {field}: {value}")]
    InvalidEdgeWeight {
        edge: u64,
        field: &'static str,
        value: f64,
    },
    #[error("failed to read graph data: {0}")]
    Io(String),
}

/// Invalid engine configuration. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("safety thresholds must satisfy 0 <= safe < risky (safe = {safe}, risky = {risky})")]
    Thresholds { safe: f64, risky: f64 },
    #[error("{name} must be a finite value > 0, got {value}")]
    NotPositive { name: String, value: f64 },
    #[error("risk aversion must be a finite value >= 0, got {0}")]
    RiskAversion(f64),
    #[error("retention_days {0} is beyond the representable time range")]
    Retention(f64),
    #[error("invalid H3 resolution {0}")]
    Resolution(u8),
    #[error("invalid bounds: {0}")]
    Bounds(String),
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Query-time outcomes that are not a result. None of these are fatal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error("no route exists between the requested points")]
    NoRoute,
    #[error("route search exceeded its deadline")]
    Timeout,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
