//! VesselSight headless runner: capture, segment and pair until Ctrl-C

use color_eyre::Result;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use vesselsight::capture::SourceSpec;
use vesselsight::display::SnapshotSurface;
use vesselsight::{Config, Pipeline};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("VesselSight launching...");

    let config = Config::load()?;
    let spec: SourceSpec = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config.capture.source.clone())
        .parse()?;
    let screenshot_dir = config.display.screenshot_dir.clone();

    let mut pipeline = Pipeline::new(config)?;
    let mut surface = SnapshotSurface::new();

    let source = match pipeline.open_source(&spec, &mut surface) {
        Ok(source) => source,
        Err(e) => {
            pipeline.shutdown();
            return Err(e.into());
        }
    };
    info!("Using video source: {}", source);

    pipeline
        .run(&mut surface, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    if let Some(dir) = screenshot_dir {
        match surface.save_screenshot_in(&dir) {
            Ok(path) => info!("Final frame saved to {}", path.display()),
            Err(e) => warn!("No screenshot written: {:#}", e),
        }
    }

    for line in pipeline.annotation_log().lines() {
        info!("{}", line);
    }
    info!(
        "Shown {} pairs and {} raw frames",
        surface.pairs_shown, surface.frames_shown
    );

    pipeline.shutdown();
    info!("VesselSight shutting down");
    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vesselsight=info"));
    let fmt = tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime());
    let registry = tracing_subscriber::registry().with(filter).with(fmt);

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}
