/// Storefront Order Backend
///
/// Entry point of the checkout service. It places orders atomically,
/// serves order history and manages shipping addresses, including the
/// one-primary-address-per-user rule.
///
/// # Architecture
///
/// - Repository layer for data access (PostgreSQL or in-memory)
/// - Service layer for checkout and address logic
/// - API layer for HTTP endpoints
/// - Metrics for monitoring
///
use std::sync::Arc;

use anyhow::{Context, Result};
use app_config::{AppConfig, StorageKind};
use repository::{AddressesRepository, MemoryStore, OrdersRepository, PgStore, TransactionalStore};
use server::Server;
use service::{AddressServiceImpl, OrderServiceImpl};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
///
/// `RUST_LOG` wins over the configured level.
fn init_logger(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .context("Invalid log filter")?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}

/// Wires one store into both services and the HTTP server.
fn build_server<St>(config: &AppConfig, store: St) -> Server
where
    St: AddressesRepository + OrdersRepository + TransactionalStore + Clone + 'static,
{
    let order_service = Arc::new(OrderServiceImpl::new(store.clone(), store.clone()));
    let address_service = Arc::new(AddressServiceImpl::new(store.clone(), store));
    Server::new(config.http_port, order_service, address_service)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AppConfig::load().context("Failed to load configuration")?;

    if let Err(err) = init_logger(&config.log_level) {
        eprintln!("Failed to initialize logger: {err:#}");
        return Err(err);
    }

    info!("Storefront order backend starting...");

    let http_server = match config.storage {
        StorageKind::Postgres => {
            let db_pool = match db::init_db_pool(&config).await {
                Ok(pool) => {
                    info!("Database initialized successfully");
                    pool
                }
                Err(e) => {
                    error!("Failed to initialize database: {:#}", e);
                    return Err(e.context("Failed to initialize database"));
                }
            };
            build_server(&config, PgStore::new(db_pool))
        }
        StorageKind::Memory => {
            warn!("Using in-memory storage; data will not survive a restart");
            build_server(&config, MemoryStore::new())
        }
    };

    if let Err(err) = http_server.start(config.shutdown_timeout).await {
        error!("HTTP server error: {:#}", err);
        return Err(err);
    }

    info!("Application stopped");
    Ok(())
}
