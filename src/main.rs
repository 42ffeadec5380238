use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use eddie_sync::adapters::sqlite::SqliteStore;
use eddie_sync::config::{AccountConfig, AppConfig};
use eddie_sync::engine::{ChannelOwner, OwnerEvent};
use eddie_sync::services::logger;
use eddie_sync::state::SyncManager;
use eddie_sync::store::SyncStore;
use eddie_sync::transport::HttpTransport;
use eddie_sync::types::{Credential, ServerRecord};
use eddie_sync::Result;

#[tokio::main]
async fn main() {
    logger::init();
    info!("Starting eddie-sync ...");

    if let Err(e) = run().await {
        error!("eddie-sync failed: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Optional first argument: path to a config file
    let config = match std::env::args().nth(1) {
        Some(path) => AppConfig::load_from_path(&PathBuf::from(path))?,
        None => AppConfig::load()?,
    };

    let store: Arc<dyn SyncStore> = Arc::new(SqliteStore::new(&config.database.path)?);
    for account in &config.accounts {
        seed_account(&store, account)?;
    }

    let transport = Arc::new(HttpTransport::new(&config.engine)?);
    let (owner, events) = ChannelOwner::new();
    let manager = SyncManager::new(&config, store, transport, Arc::new(owner))?;
    manager.init();

    for account in &config.accounts {
        let engine = manager.get_or_create(&account.id).await?;
        if let Err(e) = engine.start() {
            error!(account = %account.id, "Failed to start engine: {}", e);
        }
    }
    info!(accounts = config.accounts.len(), "Accounts started");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            event = events.recv_async() => match event {
                Ok(event) => log_owner_event(&event),
                Err(_) => break,
            },
        }
    }

    manager.shutdown().await;
    Ok(())
}

/// Store the server and credentials given in the config file
fn seed_account(store: &Arc<dyn SyncStore>, account: &AccountConfig) -> Result<()> {
    store.run_in_transaction(|tx| {
        if let Some(server) = &account.server {
            tx.save_server_record(&ServerRecord {
                account_id: account.id.clone(),
                host: server.host.clone(),
                port: server.port,
                path: server.path.clone(),
                scheme: server.scheme.clone(),
            })?;
        }
        if let Some(credentials) = &account.credentials {
            tx.save_credential(&Credential {
                account_id: account.id.clone(),
                username: credentials.username.clone(),
                secret: credentials.secret.clone(),
            })?;
        }
        Ok(())
    })
}

fn log_owner_event(event: &OwnerEvent) {
    match event {
        OwnerEvent::CredRequest { account_id, error } => {
            warn!(account = %account_id, "Credentials needed: {}", error)
        }
        OwnerEvent::ServConfRequest { account_id } => {
            warn!(account = %account_id, "Server configuration needed")
        }
        OwnerEvent::HardFailure { account_id, error } => {
            error!(account = %account_id, "Engine stopped: {}", error)
        }
        OwnerEvent::SoftFailure { account_id, error } => {
            warn!(account = %account_id, "Operation failed: {}", error)
        }
    }
}
