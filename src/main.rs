use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use safewalk::api::{self, AppState};
use safewalk::graph::{GraphDataset, RoadGraph};
use safewalk::incident::IncidentReport;
use safewalk::{EngineConfig, SafetyEngine, osm};

#[derive(Debug, Parser)]
#[command(name = "safewalk", about = "Safety-aware routing and heatmap API")]
struct Args {
    /// TOML engine configuration. Built-in defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Road graph as a JSON node/edge dataset.
    #[arg(long, conflicts_with = "osm")]
    graph: Option<PathBuf>,
    /// Road graph imported from an OpenStreetMap PBF extract.
    #[arg(long)]
    osm: Option<PathBuf>,
    /// JSON array of incident reports ingested at startup.
    #[arg(long)]
    incidents: Option<PathBuf>,
    /// Overrides `server.bind` from the configuration.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    // 1. Configuration
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    config.validate()?;

    // 2. Road graph
    let dataset = match (&args.graph, &args.osm) {
        (Some(path), _) => GraphDataset::from_json_file(path)?,
        (None, Some(path)) => osm::load_pbf(path, config.routing.walking_speed_mps)?,
        (None, None) => {
            log::warn!("no road graph supplied; routes will report no route until one is loaded");
            GraphDataset::default()
        }
    };
    let graph = RoadGraph::from_dataset(dataset)?;

    let bind = args.bind.clone().unwrap_or_else(|| config.server.bind.clone());
    let engine = SafetyEngine::new(config, graph)?;

    // 3. Seed incidents
    if let Some(path) = &args.incidents {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let reports: Vec<IncidentReport> =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        let outcome = engine.ingest_batch(reports);
        log::info!(
            "seeded {} incidents ({} rejected)",
            outcome.accepted.len(),
            outcome.rejected.len()
        );
    }

    // 4. Serve
    let app = api::router(Arc::new(AppState { engine }));
    log::info!("API server running on http://{bind}");
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
