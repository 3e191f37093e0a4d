//! Headless driver for the tile manager.
//!
//! Places a camera at a geodetic position, starts streaming, and runs a fixed
//! number of update ticks while logging every handler call.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use earthtile::{
    DEFAULT_API_URL, LoggingHandlers, ManagerConfig, TileManager, geodetic_to_ecef, z_up_to_y_up,
};

/// Default camera latitude (NYC).
const DEFAULT_LAT: f64 = 40.7;
/// Default camera longitude (NYC).
const DEFAULT_LON: f64 = -74.0;
/// Default camera altitude in meters.
const DEFAULT_ALTITUDE: f64 = 500.0;

#[derive(Parser)]
#[command(about = "Stream Google 3D Tiles around a fixed camera position")]
struct Args {
    /// Map Tiles API key.
    #[arg(long, env = "GOOGLE_MAPS_API_KEY")]
    api_key: String,

    /// API base URL.
    #[arg(long, default_value = DEFAULT_API_URL)]
    api_url: String,

    /// Camera latitude in degrees.
    #[arg(long, default_value_t = DEFAULT_LAT)]
    lat: f64,

    /// Camera longitude in degrees.
    #[arg(long, default_value_t = DEFAULT_LON)]
    lon: f64,

    /// Camera altitude above the ellipsoid in meters.
    #[arg(long, default_value_t = DEFAULT_ALTITUDE)]
    alt: f64,

    /// Number of update ticks to run.
    #[arg(long, default_value_t = 8)]
    ticks: u32,

    /// Pause between ticks, in milliseconds.
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> earthtile::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ManagerConfig::new(args.api_key).with_api_url(args.api_url);
    let manager = TileManager::new(config, Arc::new(LoggingHandlers))?;

    let camera = z_up_to_y_up(geodetic_to_ecef(args.lon, args.lat, args.alt));
    tracing::info!(lat = args.lat, lon = args.lon, alt = args.alt, "camera placed");

    let root = manager.start().await?;
    tracing::info!(%root, session = manager.session().as_deref(), "started");

    for tick in 0..args.ticks {
        manager.update(camera);
        manager.settle().await;

        let stats = manager.stats();
        tracing::info!(
            tick,
            nodes = stats.nodes,
            expanded = stats.expanded,
            loaded = stats.loaded,
            hidden = stats.hidden,
            "tick complete"
        );

        if args.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
        }
    }

    let stats = manager.stats();
    tracing::info!(?stats, "done");
    Ok(())
}
