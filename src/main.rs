use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use agndb::catalog::FieldCatalog;
use agndb::config::Settings;
use agndb::error::{PortalError, Result};
use agndb::interface::QueryInterface;
use agndb::persist::Store;
use agndb::server;

#[tokio::main]
async fn main() {
    // an optional settings file may be given as the only argument
    let path = std::env::args().nth(1);
    let settings = match Settings::load(path.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Could not load settings: {e}");
            std::process::exit(2);
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(settings).await {
        error!(error = %e, "server stopped");
        std::process::exit(1);
    }
}

async fn run(settings: Settings) -> Result<()> {
    let limits = settings.limits()?;
    let store = Store::open(settings.persistence_mode())?;
    if settings.database.seed_demo_sources > 0 {
        store.seed_demo(settings.database.seed_demo_sources, settings.database.seed)?;
    }
    let interface = Arc::new(QueryInterface::new(FieldCatalog::agn(), store, limits));
    let app = server::router(interface, &settings.allowed_origins);

    let listener = tokio::net::TcpListener::bind(&settings.bind_address)
        .await
        .map_err(|e| PortalError::Config(format!("cannot bind {}: {e}", settings.bind_address)))?;
    info!(address = %settings.bind_address, "listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| PortalError::Invariant(format!("server error: {e}")))
}
