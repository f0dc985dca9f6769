use anyhow::Context;
use interbank::oracle::HttpOracle;
use interbank::store::{EventStore, MemoryEventStore, PgEventStore};
use interbank::transport::HttpTransport;
use interbank::{logging, server, Collaborators, Config, Orchestrator};
use ledger_core::Ledger;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = match std::env::var("INTERBANK_CONFIG") {
        Ok(path) => {
            let mut config = Config::from_file(&path)
                .with_context(|| format!("loading configuration from {}", path))?;
            config.apply_env()?;
            config
        }
        Err(_) => Config::from_env()?,
    };

    logging::init(&config.logging);
    config.validate()?;

    info!(
        routing_number = config.bank.routing_number,
        peer = %config.peer.url,
        public_url = %config.server.public_url,
        "Interbank node starting..."
    );

    let store: Arc<dyn EventStore> = match &config.database.url {
        Some(url) => {
            let store = PgEventStore::connect(url, config.database.max_connections).await?;
            store.migrate().await?;
            info!("Event store connected to PostgreSQL");
            Arc::new(store)
        }
        None => {
            warn!("No database configured, events are kept in memory");
            Arc::new(MemoryEventStore::new())
        }
    };

    let ledger = Arc::new(Ledger::start(ledger_core::Config::from_env()?));
    let transport = Arc::new(HttpTransport::new(config.delivery.request_timeout())?);
    let oracle = Arc::new(HttpOracle::new(
        Arc::new(HttpTransport::new(config.oracle.request_timeout())?),
        config.oracle.url.clone(),
    ));

    let orchestrator = Orchestrator::start(
        &config,
        Collaborators {
            store,
            ledger: ledger.clone(),
            currencies: ledger.clone(),
            oracle,
            transport,
        },
    );

    info!("Interbank node initialized successfully");

    server::run(&config, orchestrator.clone()).await?;

    orchestrator.shutdown();
    ledger.shutdown().await?;
    info!("Interbank node stopped");

    Ok(())
}
