//! Sync manager state
//!
//! Owns one protocol engine per account plus the comm health tracker they
//! all share.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::codec::TokenTable;
use crate::config::AppConfig;
use crate::engine::{EngineContext, ProtocolControl, ProtocolOwner};
use crate::error::Result;
use crate::health::CommHealthTracker;
use crate::store::SyncStore;
use crate::transport::Transport;

pub struct SyncManager {
    engines: RwLock<HashMap<String, Arc<ProtocolControl>>>,
    ctx: EngineContext,
    ticker_cancel: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl SyncManager {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn SyncStore>,
        transport: Arc<dyn Transport>,
        owner: Arc<dyn ProtocolOwner>,
    ) -> Result<Self> {
        let ctx = EngineContext {
            store,
            tracker: Arc::new(CommHealthTracker::new(config.health.clone())),
            transport,
            owner,
            tokens: Arc::new(TokenTable::builtin()?),
            engine: config.engine.clone(),
            codec: config.codec.clone(),
        };

        Ok(Self {
            engines: RwLock::new(HashMap::new()),
            ctx,
            ticker_cancel: CancellationToken::new(),
            ticker: Mutex::new(None),
        })
    }

    /// Start background work shared by all accounts
    pub fn init(&self) {
        let mut ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner());
        if ticker.is_none() {
            *ticker = Some(self.ctx.tracker.spawn_ticker(self.ticker_cancel.clone()));
            info!("Comm health ticker started");
        }
    }

    pub fn tracker(&self) -> &Arc<CommHealthTracker> {
        &self.ctx.tracker
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.ctx.store
    }

    /// Get or create the engine for an account
    pub async fn get_or_create(&self, account_id: &str) -> Result<Arc<ProtocolControl>> {
        {
            let engines = self.engines.read().await;
            if let Some(engine) = engines.get(account_id) {
                return Ok(engine.clone());
            }
        }

        let mut engines = self.engines.write().await;
        // Someone may have won the race while we waited for the write lock
        if let Some(engine) = engines.get(account_id) {
            return Ok(engine.clone());
        }

        info!("Creating protocol engine for account: {}", account_id);
        let engine = ProtocolControl::new(account_id, self.ctx.clone())?;
        engines.insert(account_id.to_string(), engine.clone());
        Ok(engine)
    }

    /// Get the engine for an account (if exists)
    pub async fn get(&self, account_id: &str) -> Option<Arc<ProtocolControl>> {
        let engines = self.engines.read().await;
        engines.get(account_id).cloned()
    }

    /// Remove the engine for an account, stopping it first
    pub async fn remove(&self, account_id: &str) {
        let mut engines = self.engines.write().await;
        if let Some(engine) = engines.remove(account_id) {
            engine.shutdown();
        }
    }

    pub async fn get_account_ids(&self) -> Vec<String> {
        let engines = self.engines.read().await;
        engines.keys().cloned().collect()
    }

    pub async fn get_all_engines(&self) -> Vec<Arc<ProtocolControl>> {
        let engines = self.engines.read().await;
        engines.values().cloned().collect()
    }

    /// Stop every engine and the health ticker
    pub async fn shutdown(&self) {
        let engines: Vec<Arc<ProtocolControl>> = {
            let mut engines = self.engines.write().await;
            engines.drain().map(|(_, engine)| engine).collect()
        };
        for engine in &engines {
            engine.shutdown();
        }

        self.ticker_cancel.cancel();
        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = ticker {
            if let Err(e) = handle.await {
                warn!("Comm health ticker ended abnormally: {}", e);
            }
        }
        info!(engines = engines.len(), "Sync manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::SqliteStore;
    use crate::engine::ChannelOwner;
    use crate::fsm::{ST_START, ST_STOP};
    use crate::transport::mock::ScriptedTransport;

    fn manager() -> SyncManager {
        let store: Arc<dyn SyncStore> =
            Arc::new(SqliteStore::in_memory().expect("Failed to create database"));
        let (owner, _rx) = ChannelOwner::new();
        SyncManager::new(
            &AppConfig::default(),
            store,
            Arc::new(ScriptedTransport::new()),
            Arc::new(owner),
        )
        .expect("manager")
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_engine() {
        let manager = manager();
        let first = manager.get_or_create("a").await.expect("create");
        let second = manager.get_or_create("a").await.expect("get");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.state(), ST_START);

        manager.get_or_create("b").await.expect("create b");
        let mut ids = manager.get_account_ids().await;
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(manager.get("c").await.is_none());
    }

    #[tokio::test]
    async fn test_remove_stops_engine() {
        let manager = manager();
        let engine = manager.get_or_create("a").await.expect("create");
        manager.remove("a").await;
        assert_eq!(engine.state(), ST_STOP);
        assert!(manager.get("a").await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_ticker_and_engines() {
        let manager = manager();
        manager.init();
        manager.init();
        let engine = manager.get_or_create("a").await.expect("create");

        manager.shutdown().await;
        assert_eq!(engine.state(), ST_STOP);
        assert!(manager.get_all_engines().await.is_empty());
    }
}
