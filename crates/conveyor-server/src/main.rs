mod handlers;
mod ingress;

use std::path::Path;
use std::sync::Arc;

use conveyor_core::trigger::{ImageMetadataProcessor, LocalObjectStore};
use conveyor_core::{Conveyor, ConveyorConfig, Handlers, RocksDbStorage};
use tracing::{info, warn};

use handlers::OrderProcessor;

fn load_config() -> (ConveyorConfig, Option<&'static str>) {
    let paths = ["conveyor.toml", "/etc/conveyor/conveyor.toml"];

    for path in paths {
        if Path::new(path).exists() {
            match ConveyorConfig::load(path) {
                Ok(config) => return (config, Some(path)),
                Err(e) => {
                    eprintln!("error loading {path}: {e}");
                    std::process::exit(1);
                }
            }
        }
    }

    (ConveyorConfig::default(), None)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (mut config, source) = load_config();
    conveyor_core::telemetry::init_tracing(&config.server.log_level);
    match source {
        Some(path) => info!(path, "loaded configuration"),
        None => info!("no config file found, using defaults"),
    }

    if let Ok(data_dir) = std::env::var("CONVEYOR_DATA_DIR") {
        config.server.data_dir = data_dir;
    }
    let storage = Arc::new(RocksDbStorage::open(&config.server.data_dir)?);
    info!(data_dir = %config.server.data_dir, "storage opened");

    let processor = Arc::new(OrderProcessor);
    let handlers = Handlers {
        worker: processor.clone(),
        function: processor,
        object_store: Arc::new(LocalObjectStore::new(&config.server.object_root)),
        object_processor: Arc::new(ImageMetadataProcessor::new(config.image.clone())),
    };
    let conveyor = Conveyor::start(&config, storage, handlers).await?;

    tokio::select! {
        res = ingress::run(&conveyor) => {
            if let Err(e) = res {
                warn!(error = %e, "ingress failed");
            }
            info!("ingress closed, waiting for shutdown signal");
            shutdown_signal().await;
        }
        _ = shutdown_signal() => {}
    }

    conveyor.shutdown().await?;
    info!("conveyor stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler, waiting for ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    info!("received shutdown signal");
}
