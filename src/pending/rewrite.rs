use serde::{Deserialize, Serialize};
use tracing::debug;

use super::PendingOperation;
use crate::error::Result;
use crate::store::{PendingQuery, StoreTx};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewriteAction {
    /// Swap the matched value for the replacement
    Replace,
    /// The referenced entity is gone: drop the operation
    MatchAndCancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewriteField {
    ServerId,
    ParentId,
    DestParentId,
}

impl RewriteField {
    pub const ALL: [RewriteField; 3] = [
        RewriteField::ServerId,
        RewriteField::ParentId,
        RewriteField::DestParentId,
    ];

    fn slot<'a>(&self, op: &'a mut PendingOperation) -> &'a mut Option<String> {
        match self {
            RewriteField::ServerId => &mut op.server_id,
            RewriteField::ParentId => &mut op.parent_id,
            RewriteField::DestParentId => &mut op.dest_parent_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteRule {
    pub action: RewriteAction,
    pub field: RewriteField,
    pub match_value: String,
    pub replacement: Option<String>,
}

impl RewriteRule {
    pub fn replace(field: RewriteField, old: &str, new: &str) -> Self {
        Self {
            action: RewriteAction::Replace,
            field,
            match_value: old.to_string(),
            replacement: Some(new.to_string()),
        }
    }

    pub fn cancel(field: RewriteField, id: &str) -> Self {
        Self {
            action: RewriteAction::MatchAndCancel,
            field,
            match_value: id.to_string(),
            replacement: None,
        }
    }

    /// Rules moving `old` to `new` in every id field
    pub fn replace_everywhere(old: &str, new: &str) -> Vec<Self> {
        RewriteField::ALL
            .iter()
            .map(|f| Self::replace(*f, old, new))
            .collect()
    }

    /// Rules cancelling any operation that mentions `id`
    pub fn cancel_everywhere(id: &str) -> Vec<Self> {
        RewriteField::ALL.iter().map(|f| Self::cancel(*f, id)).collect()
    }
}

/// What applying a batch of rules did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RewriteSummary {
    pub rewritten: Vec<i64>,
    pub cancelled: Vec<i64>,
}

/// Apply `rules` to every unresolved operation of the account, inside the
/// caller's transaction
pub fn apply_rules(
    tx: &mut dyn StoreTx,
    account_id: &str,
    rules: &[RewriteRule],
) -> Result<RewriteSummary> {
    let mut summary = RewriteSummary::default();
    if rules.is_empty() {
        return Ok(summary);
    }

    for mut op in tx.query_pending(account_id, &PendingQuery::default())? {
        if op.is_resolved() {
            continue;
        }

        let mut changed = false;
        let mut cancelled = false;
        for rule in rules {
            let slot = rule.field.slot(&mut op);
            if slot.as_deref() != Some(rule.match_value.as_str()) {
                continue;
            }
            match rule.action {
                RewriteAction::Replace => {
                    *slot = rule.replacement.clone();
                    changed = true;
                }
                RewriteAction::MatchAndCancel => {
                    cancelled = true;
                    break;
                }
            }
        }

        if cancelled {
            debug!(op_id = op.id, kind = ?op.kind, "Cancelling pending operation");
            tx.delete_pending(op.id)?;
            summary.cancelled.push(op.id);
        } else if changed {
            debug!(op_id = op.id, kind = ?op.kind, "Rewriting pending operation");
            tx.update_pending(&op)?;
            summary.rewritten.push(op.id);
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::SqliteStore;
    use crate::store::SyncStore;
    use std::sync::Arc;

    #[test]
    fn test_replace_and_cancel() {
        let store: Arc<dyn SyncStore> =
            Arc::new(SqliteStore::in_memory().expect("Failed to create database"));

        let summary = store
            .run_in_transaction(|tx| {
                tx.insert_pending(&PendingOperation::folder_create("a", "tmp", "0", "New", 12))?;
                tx.insert_pending(&PendingOperation::item_move("a", "m1", "3", "tmp"))?;
                tx.insert_pending(&PendingOperation::folder_delete("a", "gone"))?;
                tx.insert_pending(&PendingOperation::folder_update("a", "8", "0", "Keep"))?;

                let mut rules = RewriteRule::replace_everywhere("tmp", "55");
                rules.extend(RewriteRule::cancel_everywhere("gone"));
                apply_rules(tx, "a", &rules)
            })
            .expect("apply");

        assert_eq!(summary.rewritten.len(), 2);
        assert_eq!(summary.cancelled.len(), 1);

        let remaining = store
            .run_in_transaction(|tx| tx.query_pending("a", &PendingQuery::default()))
            .expect("query");
        assert_eq!(remaining.len(), 3);
        assert_eq!(remaining[0].server_id.as_deref(), Some("55"));
        assert_eq!(remaining[1].dest_parent_id.as_deref(), Some("55"));
        assert_eq!(remaining[2].display_name.as_deref(), Some("Keep"));
    }
}
