use anyhow::{Context, Result};
use attend_store::{Seal, SqliteStore};
use config::{BusKind, Config};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod inbox;

fn open_seal(config: &Config) -> Result<Option<Seal>> {
    match &config.embedding_key_file {
        Some(path) => {
            let seal = Seal::from_key_file(path)
                .with_context(|| format!("loading embedding key from {}", path.display()))?;
            Ok(Some(seal))
        }
        None => {
            tracing::warn!("no embedding key configured; embeddings are stored unencrypted");
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("attendd starting");

    let config = Config::load()?;
    tracing::info!(
        db = %config.db_path.display(),
        threshold = config.threshold,
        metric = ?config.metric,
        cooldown_secs = config.cooldown_secs,
        confirmations = config.confirmations_required,
        "configuration loaded"
    );

    // Enrollment and the attendance ledger use separate connections to one file.
    let store = SqliteStore::open(&config.db_path, open_seal(&config)?)
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    let ledger = SqliteStore::open(&config.db_path, None)
        .with_context(|| format!("opening {}", config.db_path.display()))?;

    let engine = engine::spawn_engine(&config, store, ledger)?;
    let service = dbus_interface::AttendService::new(engine.clone());

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(dbus_interface::BUS_NAME)?
        .serve_at(dbus_interface::OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = dbus_interface::BUS_NAME, "attendd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("attendd shutting down");
    engine.shutdown().await;

    Ok(())
}
