//! Pending operation lifecycle
//!
//! Eligible -> Dispatched -> Resolved(Success | HardFail). A transient
//! failure sends a Dispatched operation back to Eligible with its retry count
//! bumped; once retries run out it is resolved as a hard failure. Resolved
//! operations are removed from the store.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{OperationKind, PendingOperation, PendingState, Resolution};
use crate::error::{Result, SyncError};
use crate::store::{PendingQuery, StoreTx, SyncStore};

/// Result of sending an operation back after a transient failure
#[derive(Debug, Clone, PartialEq)]
pub enum DeferOutcome {
    /// Eligible again, will be retried
    Deferred(PendingOperation),
    /// Out of retries, resolved as a hard failure
    Exhausted(PendingOperation),
}

pub struct PendingQueue {
    store: Arc<dyn SyncStore>,
    account_id: String,
    max_retries: u32,
}

impl PendingQueue {
    pub fn new(store: Arc<dyn SyncStore>, account_id: &str, max_retries: u32) -> Self {
        Self {
            store,
            account_id: account_id.to_string(),
            max_retries,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Add an operation inside an existing transaction
    pub fn enqueue_in(tx: &mut dyn StoreTx, op: &PendingOperation) -> Result<PendingOperation> {
        let mut op = op.clone();
        op.state = PendingState::Eligible;
        let inserted = tx.insert_pending(&op)?;
        debug!(op_id = inserted.id, kind = ?inserted.kind, "Queued pending operation");
        Ok(inserted)
    }

    pub fn enqueue(&self, op: &PendingOperation) -> Result<PendingOperation> {
        self.store.run_in_transaction(|tx| Self::enqueue_in(tx, op))
    }

    /// Unresolved operations in creation order
    pub fn list(&self) -> Result<Vec<PendingOperation>> {
        let account_id = self.account_id.clone();
        self.store.run_in_transaction(|tx| {
            Ok(tx
                .query_pending(&account_id, &PendingQuery::default())?
                .into_iter()
                .filter(|op| !op.is_resolved())
                .collect())
        })
    }

    /// Oldest Eligible operation, optionally of one kind, whose target has
    /// nothing in flight
    pub fn next_eligible(&self, kind: Option<OperationKind>) -> Result<Option<PendingOperation>> {
        let ops = self.list()?;

        let busy: HashSet<String> = ops
            .iter()
            .filter(|op| op.state == PendingState::Dispatched)
            .map(|op| op.target_key())
            .collect();

        Ok(ops.into_iter().find(|op| {
            op.state == PendingState::Eligible
                && kind.map_or(true, |k| op.kind == k)
                && !busy.contains(&op.target_key())
        }))
    }

    /// Eligible -> Dispatched. Fails if the operation is already in flight
    /// or another operation on the same target is.
    pub fn mark_dispatched(&self, id: i64) -> Result<PendingOperation> {
        let account_id = self.account_id.clone();
        self.store.run_in_transaction(|tx| {
            let mut op = load(tx, id)?;
            match op.state {
                PendingState::Eligible => {}
                PendingState::Dispatched => return Err(SyncError::AlreadyDispatched(id)),
                PendingState::Resolved(_) => {
                    return Err(SyncError::InvalidState(format!(
                        "pending operation {} is already resolved",
                        id
                    )))
                }
            }

            let key = op.target_key();
            let in_flight = tx.query_pending(
                &account_id,
                &PendingQuery::default().state(PendingState::Dispatched),
            )?;
            if in_flight.iter().any(|other| other.target_key() == key) {
                return Err(SyncError::TargetBusy(key));
            }

            op.state = PendingState::Dispatched;
            tx.update_pending(&op)?;
            Ok(op)
        })
    }

    /// Dispatched -> Eligible after a transient failure
    pub fn defer(&self, id: i64, error: &str) -> Result<DeferOutcome> {
        let max_retries = self.max_retries;
        self.store.run_in_transaction(|tx| {
            let mut op = load(tx, id)?;
            expect_dispatched(&op)?;

            op.retry_count += 1;
            op.last_error = Some(error.to_string());

            if op.retry_count > max_retries {
                warn!(op_id = id, retries = op.retry_count, "Pending operation out of retries");
                op.state = PendingState::Resolved(Resolution::HardFail);
                tx.delete_pending(id)?;
                return Ok(DeferOutcome::Exhausted(op));
            }

            op.state = PendingState::Eligible;
            tx.update_pending(&op)?;
            Ok(DeferOutcome::Deferred(op))
        })
    }

    /// Dispatched -> Eligible without counting a retry (e.g. cancelled)
    pub fn release(&self, id: i64) -> Result<PendingOperation> {
        self.store.run_in_transaction(|tx| {
            let mut op = load(tx, id)?;
            expect_dispatched(&op)?;
            op.state = PendingState::Eligible;
            tx.update_pending(&op)?;
            Ok(op)
        })
    }

    pub fn resolve_success(&self, id: i64) -> Result<PendingOperation> {
        self.store
            .run_in_transaction(|tx| Self::resolve_in(tx, id, Resolution::Success, None))
    }

    pub fn resolve_hard_fail(&self, id: i64, error: &str) -> Result<PendingOperation> {
        self.store.run_in_transaction(|tx| {
            Self::resolve_in(tx, id, Resolution::HardFail, Some(error))
        })
    }

    /// Resolve inside an existing transaction, e.g. together with the model
    /// change the server confirmed
    pub fn resolve_in(
        tx: &mut dyn StoreTx,
        id: i64,
        resolution: Resolution,
        error: Option<&str>,
    ) -> Result<PendingOperation> {
        let mut op = load(tx, id)?;
        expect_dispatched(&op)?;
        op.state = PendingState::Resolved(resolution);
        op.last_error = error.map(|e| e.to_string());
        tx.delete_pending(id)?;
        debug!(op_id = id, resolution = ?resolution, "Resolved pending operation");
        Ok(op)
    }

    /// Put every Dispatched operation back to Eligible. Run at startup: a
    /// crash mid-command must not leave the queue wedged.
    pub fn reset_dispatched(&self) -> Result<usize> {
        let account_id = self.account_id.clone();
        let count = self.store.run_in_transaction(|tx| {
            let dispatched = tx.query_pending(
                &account_id,
                &PendingQuery::default().state(PendingState::Dispatched),
            )?;
            for mut op in dispatched.iter().cloned() {
                op.state = PendingState::Eligible;
                tx.update_pending(&op)?;
            }
            Ok(dispatched.len())
        })?;
        if count > 0 {
            info!(account = %self.account_id, count, "Reset dispatched operations to eligible");
        }
        Ok(count)
    }
}

fn load(tx: &mut dyn StoreTx, id: i64) -> Result<PendingOperation> {
    tx.pending(id)?
        .ok_or_else(|| SyncError::NotFound(format!("pending operation {}", id)))
}

fn expect_dispatched(op: &PendingOperation) -> Result<()> {
    if op.state != PendingState::Dispatched {
        return Err(SyncError::InvalidState(format!(
            "pending operation {} is {}, not dispatched",
            op.id,
            op.state.as_str()
        )));
    }
    Ok(())
}
