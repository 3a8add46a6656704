// src/main.rs
mod api;
mod blocking;
mod config;
mod error;
mod geometry;
mod middleware;
mod model;
mod occupancy;
mod persistence;
mod planner;
mod reconciler;
mod store;
mod types;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use api::AppState;
use config::AppConfig;
use middleware::{Dispatcher, HttpDispatcher};
use store::Warehouse;

#[tokio::main]
async fn main() {
    let env_result = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rackflow=info")),
        )
        .init();

    if let Err(err) = env_result {
        if !matches!(err, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            warn!("Could not load .env: {}", err);
        }
    }

    let app_config = AppConfig::from_env();

    let warehouse = match app_config.storage.state_path() {
        Some(path) => match persistence::load_snapshot(path) {
            Ok(Some(warehouse)) => warehouse,
            Ok(None) => {
                info!("No snapshot at {}; starting empty", path.display());
                Warehouse::new()
            }
            Err(err) => {
                tracing::error!("Refusing to start: {}", err);
                std::process::exit(1);
            }
        },
        None => {
            warn!("RACKFLOW_STATE_PATH is not set; warehouse state lives in memory only");
            Warehouse::new()
        }
    };

    let dispatcher: Option<Arc<dyn Dispatcher>> = match app_config.middleware.clone() {
        Some(config) => match HttpDispatcher::new(config) {
            Ok(dispatcher) => {
                info!("Middleware dispatch enabled at {}", dispatcher.config().url());
                let dispatcher: Arc<dyn Dispatcher> = Arc::new(dispatcher);
                Some(dispatcher)
            }
            Err(err) => {
                warn!("Middleware dispatch disabled: {}", err);
                None
            }
        },
        None => {
            warn!("RACKFLOW_MIDDLEWARE_URL is not set; planning endpoints answer 503");
            None
        }
    };

    info!("Warehouse service starting...");
    let state = AppState::new(warehouse, &app_config, dispatcher);
    api::start_api_server(app_config.api.clone(), state).await;
}
