//! Plant camera: daily stills, on-demand captures and an MJPEG live view

use std::path::PathBuf;
use std::thread;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use plantcam::capture::{FrameSource, NoIllumination};
use plantcam::pipeline::{CaptureOrchestrator, CaptureScheduler, SystemClock};
use plantcam::server::HttpServer;
use plantcam::storage::DirectoryStore;
use plantcam::{Config, SensorKind};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "PLANTCAM_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Local hour (0-23) of the daily capture
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=23))]
    capture_hour: Option<u8>,

    /// Directory for stored images
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// Use the synthetic sensor instead of real hardware
    #[arg(long)]
    simulated: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("plantcam=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let args = Args::parse();
    info!("Plant camera launching...");

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(hour) = args.capture_hour {
        config.schedule.capture_hour = hour;
    }
    if let Some(dir) = args.storage_dir {
        config.storage.dir = dir;
    }
    if args.simulated {
        config.capture.sensor = SensorKind::Simulated;
    }
    config.validate()?;

    let sensor = config.open_sensor()?;
    let illumination = config.open_illumination().unwrap_or_else(|e| {
        warn!("Flash unavailable, continuing without it: {}", e);
        Box::new(NoIllumination)
    });
    let source = FrameSource::new(
        sensor,
        illumination,
        config.capture.pool_size,
        config.capture.grab_policy,
        config.still_profile(),
    )?;

    let store = DirectoryStore::open(
        &config.storage.dir,
        &config.storage.prefix,
        &config.storage.extension,
        config.storage.naming,
    )?
    .with_utc_offset(config.utc_offset());
    let catalog = store.catalog();

    let scheduler = match &config.schedule.state_file {
        Some(path) => CaptureScheduler::with_state_file(config.schedule.capture_hour, path),
        None => CaptureScheduler::new(config.schedule.capture_hour),
    };
    let clock = SystemClock::new(config.utc_offset());

    let (orchestrator, handle) = CaptureOrchestrator::new(
        source,
        scheduler,
        Box::new(clock),
        Box::new(store),
        config.orchestrator_settings(),
    );
    let core = thread::Builder::new()
        .name("capture-core".into())
        .spawn(move || orchestrator.run())?;

    info!(
        capture_hour = config.schedule.capture_hour,
        storage = %config.storage.dir.display(),
        "Capture loop running"
    );

    let server = HttpServer::bind(
        (config.server.bind.as_str(), config.server.port),
        handle.clone(),
        Some(catalog),
        config.server.stream_buffer,
    )
    .await?;

    tokio::select! {
        result = server.serve() => {
            if let Err(e) = result {
                error!("HTTP server failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received");
        }
    }

    handle.shutdown();
    tokio::task::spawn_blocking(move || core.join())
        .await?
        .map_err(|_| eyre!("capture thread panicked"))?;

    info!("Plant camera shutting down");
    Ok(())
}
