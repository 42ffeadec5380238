//! Pending operations: local edits the server has not confirmed yet
//!
//! - `queue`: lifecycle (Eligible -> Dispatched -> Resolved) and FIFO selection
//! - `rewrite`: propagating id changes across the whole queue
//! - `reconcile`: folding server deltas into the queue and the model

pub mod queue;
pub mod reconcile;
pub mod rewrite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

pub use queue::{DeferOutcome, PendingQueue};
pub use reconcile::{folder_subtree, ReconcileOutcome, ReconcileReport, Reconciler, ServerCommand};
pub use rewrite::{apply_rules, RewriteAction, RewriteField, RewriteRule, RewriteSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    FolderCreate,
    FolderUpdate,
    FolderDelete,
    ItemSend,
    ItemMove,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::FolderCreate => "folder_create",
            OperationKind::FolderUpdate => "folder_update",
            OperationKind::FolderDelete => "folder_delete",
            OperationKind::ItemSend => "item_send",
            OperationKind::ItemMove => "item_move",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "folder_create" => Ok(OperationKind::FolderCreate),
            "folder_update" => Ok(OperationKind::FolderUpdate),
            "folder_delete" => Ok(OperationKind::FolderDelete),
            "item_send" => Ok(OperationKind::ItemSend),
            "item_move" => Ok(OperationKind::ItemMove),
            other => Err(SyncError::Parse(format!("unknown operation kind {}", other))),
        }
    }

    pub fn is_folder_op(&self) -> bool {
        matches!(
            self,
            OperationKind::FolderCreate | OperationKind::FolderUpdate | OperationKind::FolderDelete
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    Success,
    HardFail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingState {
    Eligible,
    Dispatched,
    Resolved(Resolution),
}

impl PendingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingState::Eligible => "eligible",
            PendingState::Dispatched => "dispatched",
            PendingState::Resolved(Resolution::Success) => "resolved_success",
            PendingState::Resolved(Resolution::HardFail) => "resolved_hard_fail",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "eligible" => Ok(PendingState::Eligible),
            "dispatched" => Ok(PendingState::Dispatched),
            "resolved_success" => Ok(PendingState::Resolved(Resolution::Success)),
            "resolved_hard_fail" => Ok(PendingState::Resolved(Resolution::HardFail)),
            other => Err(SyncError::Parse(format!("unknown pending state {}", other))),
        }
    }
}

/// A queued local mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Row id; also the creation sequence, strictly increasing, 0 until inserted
    pub id: i64,
    pub account_id: String,
    pub kind: OperationKind,
    pub state: PendingState,
    /// The folder or item acted on
    pub server_id: Option<String>,
    /// Parent of a created folder, new parent of an updated one, source folder of a move
    pub parent_id: Option<String>,
    /// Destination folder of a move
    pub dest_parent_id: Option<String>,
    pub display_name: Option<String>,
    pub folder_type: Option<i32>,
    /// Opaque item data (e.g. the MIME of a message to send)
    pub payload: Option<serde_json::Value>,
    /// Set once the operation has been partially applied
    pub staged: bool,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl PendingOperation {
    pub fn new(account_id: &str, kind: OperationKind) -> Self {
        Self {
            id: 0,
            account_id: account_id.to_string(),
            kind,
            state: PendingState::Eligible,
            server_id: None,
            parent_id: None,
            dest_parent_id: None,
            display_name: None,
            folder_type: None,
            payload: None,
            staged: false,
            last_error: None,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn folder_create(
        account_id: &str,
        provisional_id: &str,
        parent_id: &str,
        display_name: &str,
        folder_type: i32,
    ) -> Self {
        Self {
            server_id: Some(provisional_id.to_string()),
            parent_id: Some(parent_id.to_string()),
            display_name: Some(display_name.to_string()),
            folder_type: Some(folder_type),
            ..Self::new(account_id, OperationKind::FolderCreate)
        }
    }

    pub fn folder_update(
        account_id: &str,
        server_id: &str,
        parent_id: &str,
        display_name: &str,
    ) -> Self {
        Self {
            server_id: Some(server_id.to_string()),
            parent_id: Some(parent_id.to_string()),
            display_name: Some(display_name.to_string()),
            ..Self::new(account_id, OperationKind::FolderUpdate)
        }
    }

    pub fn folder_delete(account_id: &str, server_id: &str) -> Self {
        Self {
            server_id: Some(server_id.to_string()),
            ..Self::new(account_id, OperationKind::FolderDelete)
        }
    }

    pub fn item_send(account_id: &str, client_id: &str, mime: &str) -> Self {
        Self {
            server_id: Some(client_id.to_string()),
            payload: Some(serde_json::json!({ "mime": mime })),
            ..Self::new(account_id, OperationKind::ItemSend)
        }
    }

    pub fn item_move(account_id: &str, item_id: &str, src_folder: &str, dest_folder: &str) -> Self {
        Self {
            server_id: Some(item_id.to_string()),
            parent_id: Some(src_folder.to_string()),
            dest_parent_id: Some(dest_folder.to_string()),
            ..Self::new(account_id, OperationKind::ItemMove)
        }
    }

    /// Operations with the same key act on the same logical entity and
    /// must not be in flight together
    pub fn target_key(&self) -> String {
        let scope = if self.kind.is_folder_op() {
            "folder"
        } else if self.kind == OperationKind::ItemSend {
            "send"
        } else {
            "item"
        };
        format!("{}:{}", scope, self.server_id.as_deref().unwrap_or(""))
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.state, PendingState::Resolved(_))
    }

    /// True if any of the id fields equals `id`
    pub fn references(&self, id: &str) -> bool {
        [&self.server_id, &self.parent_id, &self.dest_parent_id]
            .iter()
            .any(|f| f.as_deref() == Some(id))
    }
}
