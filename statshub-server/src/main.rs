use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use statshub::auth::StaticAuthenticator;
use statshub::{schema, Hub, HubConfig, HubServer, HubStores, ServiceEvent};
use statshub_storage::{JsonlStore, RecordStore};

#[derive(Parser, Debug)]
#[command(name = "statshub-server")]
#[command(about = "Statshub cluster coordination server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "statshub.toml")]
    config: String,

    /// Override the configured bind address
    #[arg(long, env = "STATSHUB_BIND")]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,statshub=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    tracing::info!("Config file: {}", args.config);

    let mut config = HubConfig::load_or_create(std::path::Path::new(&args.config))?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    let auth = StaticAuthenticator::from_file(&config.users_path)
        .with_context(|| format!("loading user table {}", config.users_path.display()))?;

    // A schema that fails validation is a deployment error; refuse to start.
    let schema = schema::load_document(&config.schema_path)
        .with_context(|| format!("loading schema document {}", config.schema_path.display()))?;

    let data_dir = &config.storage.data_dir;
    let aggregates = Arc::new(JsonlStore::new(data_dir, "aggregates"));
    let logs = Arc::new(JsonlStore::new(data_dir, "logs"));
    let errors = Arc::new(JsonlStore::new(data_dir, "errors"));
    for store in [&aggregates, &logs, &errors] {
        store
            .ping()
            .await
            .with_context(|| format!("record store under {}", data_dir.display()))?;
    }
    let stores = HubStores {
        aggregates,
        logs,
        errors,
    };

    let hub = Arc::new(Hub::new(config, schema, Arc::new(auth), stores));

    let mut events = hub.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ServiceEvent::Authenticated {
                    index,
                    fleet_size,
                    user,
                } => tracing::info!(index, fleet_size, %user, "cluster joined"),
                ServiceEvent::Disconnected { index, code } => {
                    tracing::info!(index, code = code.as_str(), "cluster left")
                }
                ServiceEvent::Data { index, kind, .. } => {
                    tracing::debug!(index, kind = kind.as_str(), "data accepted")
                }
            }
        }
    });

    let server = HubServer::bind(Arc::clone(&hub)).await?;
    tracing::info!("Listening on {}", server.local_addr()?);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            hub.server_closing();
        }
    }

    Ok(())
}
