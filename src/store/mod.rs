//! Transactional store contract
//!
//! Everything the sync core persists goes through [`SyncStore`]: a unit of
//! work receives a [`StoreTx`] and either all of its writes commit or none
//! do. The shipped implementation is [`crate::adapters::sqlite::SqliteStore`].

use crate::error::{Result, SyncError};
use crate::pending::{OperationKind, PendingOperation, PendingState};
use crate::types::{Credential, Folder, Item, ProtocolState, ServerRecord};

/// Predicate over pending operations; unset fields match anything
#[derive(Debug, Clone, Default)]
pub struct PendingQuery {
    pub kind: Option<OperationKind>,
    pub state: Option<PendingState>,
    pub server_id: Option<String>,
    pub parent_id: Option<String>,
    pub display_name: Option<String>,
    /// Matches server, parent or destination
    pub references: Option<String>,
}

impl PendingQuery {
    pub fn kind(mut self, kind: OperationKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn state(mut self, state: PendingState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn server_id(mut self, id: &str) -> Self {
        self.server_id = Some(id.to_string());
        self
    }

    pub fn parent_id(mut self, id: &str) -> Self {
        self.parent_id = Some(id.to_string());
        self
    }

    pub fn display_name(mut self, name: &str) -> Self {
        self.display_name = Some(name.to_string());
        self
    }

    pub fn references(mut self, id: &str) -> Self {
        self.references = Some(id.to_string());
        self
    }
}

/// Reads and writes available inside a transaction
pub trait StoreTx {
    // ========== Protocol State ==========

    fn protocol_state(&mut self, account_id: &str) -> Result<Option<ProtocolState>>;
    fn save_protocol_state(&mut self, state: &ProtocolState) -> Result<()>;

    // ========== Pending Operations ==========

    /// Insert and return the operation with its id assigned
    fn insert_pending(&mut self, op: &PendingOperation) -> Result<PendingOperation>;
    fn update_pending(&mut self, op: &PendingOperation) -> Result<()>;
    fn delete_pending(&mut self, id: i64) -> Result<()>;
    fn pending(&mut self, id: i64) -> Result<Option<PendingOperation>>;
    /// Matching operations of the account in creation order
    fn query_pending(&mut self, account_id: &str, query: &PendingQuery)
        -> Result<Vec<PendingOperation>>;

    // ========== Folders ==========

    fn insert_folder(&mut self, folder: &Folder) -> Result<Folder>;
    fn update_folder(&mut self, folder: &Folder) -> Result<()>;
    fn delete_folder(&mut self, account_id: &str, server_id: &str) -> Result<()>;
    fn folder(&mut self, account_id: &str, server_id: &str) -> Result<Option<Folder>>;
    fn folders(&mut self, account_id: &str) -> Result<Vec<Folder>>;
    fn child_folders(&mut self, account_id: &str, parent_id: &str) -> Result<Vec<Folder>>;
    /// Change a folder's server id and every parent reference to it
    fn rewrite_folder_id(&mut self, account_id: &str, old_id: &str, new_id: &str) -> Result<()>;

    // ========== Items ==========

    fn insert_item(&mut self, item: &Item) -> Result<Item>;
    fn delete_item(&mut self, account_id: &str, server_id: &str) -> Result<()>;
    fn item(&mut self, account_id: &str, server_id: &str) -> Result<Option<Item>>;
    fn items_in_folder(&mut self, account_id: &str, parent_id: &str) -> Result<Vec<Item>>;
    fn move_item(&mut self, account_id: &str, server_id: &str, new_parent: &str) -> Result<()>;
    fn rewrite_item_id(&mut self, account_id: &str, old_id: &str, new_id: &str) -> Result<()>;

    // ========== Server and Credentials ==========

    fn server_record(&mut self, account_id: &str) -> Result<Option<ServerRecord>>;
    fn save_server_record(&mut self, record: &ServerRecord) -> Result<()>;
    fn credential(&mut self, account_id: &str) -> Result<Option<Credential>>;
    fn save_credential(&mut self, credential: &Credential) -> Result<()>;
}

pub trait SyncStore: Send + Sync {
    /// Run `work` in one transaction: commit when it returns Ok, roll back
    /// when it returns Err
    fn transaction(&self, work: &mut dyn FnMut(&mut dyn StoreTx) -> Result<()>) -> Result<()>;
}

impl dyn SyncStore {
    /// Typed wrapper over [`SyncStore::transaction`]
    pub fn run_in_transaction<T>(
        &self,
        work: impl FnOnce(&mut dyn StoreTx) -> Result<T>,
    ) -> Result<T> {
        let mut work = Some(work);
        let mut output = None;
        self.transaction(&mut |tx| {
            let work = work
                .take()
                .ok_or_else(|| SyncError::InvalidState("transaction body ran twice".into()))?;
            output = Some(work(tx)?);
            Ok(())
        })?;
        output.ok_or_else(|| SyncError::InvalidState("transaction produced no result".into()))
    }
}
