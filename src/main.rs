use anyhow::Result;

use clap::Parser;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use namestore::{
    config::{Cli, Config},
    service::StoreService,
    snapshot::SnapshotFile,
    worker::{WorkerOptions, spawn_worker},
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    run_server(cli.config).await
}

async fn run_server(config: Config) -> Result<()> {
    let worker = spawn_worker(
        SnapshotFile::new(config.snapshot_path()),
        WorkerOptions {
            flush_interval: config.flush_interval(),
        },
    )?;
    let service = StoreService::new(worker.client(), config.read_timeout());

    let app = namestore::http::build_router(service)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    info!(
        bind = %config.bind,
        data_dir = %config.data_dir.display(),
        flush_interval_secs = config.flush_interval_secs,
        version = namestore::version::VERSION,
        "starting namestore"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let report = tokio::task::spawn_blocking(move || worker.shutdown()).await??;
    if report.persisted {
        info!("persistence worker stopped; state is on disk");
    } else {
        warn!(name = %report.name, "persistence worker stopped with unflushed changes");
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
