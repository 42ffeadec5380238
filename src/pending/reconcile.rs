//! Server command reconciliation
//!
//! A server delta (folder add/update/delete, item delete) may collide with
//! local edits still sitting in the pending queue. For each command we scan
//! the queue for operations on the same logical entity, decide per operation
//! whether to leave it, rewrite it or drop it, then apply the delta to the
//! model. All of it happens inside the caller's transaction, so the queue
//! and the model never disagree.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::rewrite::{apply_rules, RewriteRule, RewriteSummary};
use super::{OperationKind, PendingOperation, PendingState};
use crate::error::Result;
use crate::store::{PendingQuery, StoreTx, SyncStore};
use crate::types::Folder;

pub const CLIENT_CREATED_SUFFIX: &str = " Client-Created";
pub const CLIENT_MOVED_SUFFIX: &str = " Client-Moved";

/// Guards ancestry walks against a corrupt (cyclic) folder tree
const MAX_FOLDER_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerCommand {
    FolderAdd {
        server_id: String,
        parent_id: String,
        display_name: String,
        folder_type: i32,
    },
    FolderUpdate {
        server_id: String,
        parent_id: String,
        display_name: String,
        folder_type: i32,
    },
    FolderDelete {
        server_id: String,
    },
    ItemDelete {
        server_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Delta written to the model
    Applied,
    /// Superseded by a pending delete; model untouched
    Dropped,
    /// The server echoed one of our pending creates; the provisional record
    /// took the server id
    AdoptedPendingCreate { pending_id: i64, provisional_id: String },
    /// Identical record already present
    AlreadyPresent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub outcome: ReconcileOutcome,
    pub deleted_ops: Vec<i64>,
    pub updated_ops: Vec<i64>,
    pub rewrites: RewriteSummary,
}

enum PendingAction {
    Update(PendingOperation),
    Delete(i64),
}

/// `root` and every folder below it, parents before children
pub fn folder_subtree(tx: &mut dyn StoreTx, account_id: &str, root: &str) -> Result<Vec<String>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut queue = VecDeque::from([root.to_string()]);
    let mut ids = Vec::new();
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        for child in tx.child_folders(account_id, &id)? {
            queue.push_back(child.entity.server_id);
        }
        ids.push(id);
    }
    Ok(ids)
}

/// Folds server commands into the queue and model of one account
pub struct Reconciler<'a> {
    tx: &'a mut dyn StoreTx,
    account_id: &'a str,
    actions: Vec<PendingAction>,
    rules: Vec<RewriteRule>,
}

impl<'a> Reconciler<'a> {
    pub fn new(tx: &'a mut dyn StoreTx, account_id: &'a str) -> Self {
        Self {
            tx,
            account_id,
            actions: Vec::new(),
            rules: Vec::new(),
        }
    }

    /// Reconcile a batch in one transaction of its own
    pub fn apply_all(
        store: &dyn SyncStore,
        account_id: &str,
        commands: &[ServerCommand],
    ) -> Result<Vec<ReconcileReport>> {
        let mut reports = Vec::new();
        store.transaction(&mut |tx| {
            reports.clear();
            for command in commands {
                reports.push(Reconciler::new(tx, account_id).apply(command)?);
            }
            Ok(())
        })?;
        Ok(reports)
    }

    pub fn apply(mut self, command: &ServerCommand) -> Result<ReconcileReport> {
        debug!(account = self.account_id, ?command, "Reconciling server command");
        let outcome = match command {
            ServerCommand::FolderAdd {
                server_id,
                parent_id,
                display_name,
                folder_type,
            } => {
                let folder = Folder::new(
                    self.account_id,
                    server_id,
                    parent_id,
                    display_name,
                    *folder_type,
                );
                self.folder_add(folder)?
            }
            ServerCommand::FolderUpdate {
                server_id,
                parent_id,
                display_name,
                folder_type,
            } => {
                let folder = Folder::new(
                    self.account_id,
                    server_id,
                    parent_id,
                    display_name,
                    *folder_type,
                );
                self.folder_update(folder)?
            }
            ServerCommand::FolderDelete { server_id } => self.folder_delete(server_id)?,
            ServerCommand::ItemDelete { server_id } => self.item_delete(server_id)?,
        };
        self.finish(outcome)
    }

    fn finish(self, outcome: ReconcileOutcome) -> Result<ReconcileReport> {
        let mut deleted_ops = Vec::new();
        let mut updated_ops = Vec::new();
        for action in &self.actions {
            match action {
                PendingAction::Delete(id) => {
                    self.tx.delete_pending(*id)?;
                    deleted_ops.push(*id);
                }
                PendingAction::Update(op) => {
                    self.tx.update_pending(op)?;
                    updated_ops.push(op.id);
                }
            }
        }
        let rewrites = apply_rules(self.tx, self.account_id, &self.rules)?;

        Ok(ReconcileReport {
            outcome,
            deleted_ops,
            updated_ops,
            rewrites,
        })
    }

    fn eligible(&mut self, query: PendingQuery) -> Result<Vec<PendingOperation>> {
        self.tx
            .query_pending(self.account_id, &query.state(PendingState::Eligible))
    }

    /// True when `ancestor` is `id` or one of its ancestors
    fn dominates(&mut self, ancestor: &str, id: &str) -> Result<bool> {
        let mut current = id.to_string();
        for _ in 0..MAX_FOLDER_DEPTH {
            if current == ancestor {
                return Ok(true);
            }
            match self.tx.folder(self.account_id, &current)? {
                Some(folder) if folder.parent_id != current => current = folder.parent_id,
                _ => return Ok(false),
            }
        }
        Ok(false)
    }

    /// Is `id` under a folder some pending delete is about to remove?
    fn under_pending_delete(&mut self, ids: &[&str]) -> Result<bool> {
        let deletes = self.eligible(PendingQuery::default().kind(OperationKind::FolderDelete))?;
        for delete in deletes {
            let Some(doomed) = delete.server_id.as_deref() else {
                continue;
            };
            for id in ids {
                if self.dominates(doomed, id)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Move an existing record off `server_id` so the server's can take it
    fn migrate_folder(&mut self, server_id: &str) -> Result<String> {
        let fresh = format!("migrated-{}", Uuid::new_v4());
        warn!(
            account = self.account_id,
            server_id,
            fresh = %fresh,
            "Server id collides with a different local folder, migrating"
        );
        self.tx.rewrite_folder_id(self.account_id, server_id, &fresh)?;
        apply_rules(
            self.tx,
            self.account_id,
            &RewriteRule::replace_everywhere(server_id, &fresh),
        )?;
        Ok(fresh)
    }

    fn rename_local_folder(&mut self, server_id: Option<&str>, name: &str) -> Result<()> {
        let Some(server_id) = server_id else {
            return Ok(());
        };
        if let Some(mut folder) = self.tx.folder(self.account_id, server_id)? {
            folder.display_name = name.to_string();
            self.tx.update_folder(&folder)?;
        }
        Ok(())
    }

    fn folder_add(&mut self, incoming: Folder) -> Result<ReconcileOutcome> {
        let server_id = incoming.server_id().to_string();

        if self.under_pending_delete(&[incoming.parent_id.as_str()])? {
            info!(account = self.account_id, server_id = %server_id, "Dropping add under pending delete");
            return Ok(ReconcileOutcome::Dropped);
        }

        let creates = self.eligible(
            PendingQuery::default()
                .kind(OperationKind::FolderCreate)
                .display_name(&incoming.display_name)
                .parent_id(&incoming.parent_id),
        )?;

        // Oldest matching create of the same type is the one the server echoes
        if let Some(create) = creates
            .iter()
            .find(|op| op.folder_type == Some(incoming.folder_type))
        {
            return self.adopt_create(create.clone(), incoming);
        }

        for mut create in creates {
            let renamed = format!(
                "{}{}",
                create.display_name.as_deref().unwrap_or_default(),
                CLIENT_CREATED_SUFFIX
            );
            self.rename_local_folder(create.server_id.as_deref(), &renamed)?;
            create.display_name = Some(renamed);
            self.actions.push(PendingAction::Update(create));
        }

        let updates = self.eligible(
            PendingQuery::default()
                .kind(OperationKind::FolderUpdate)
                .display_name(&incoming.display_name)
                .parent_id(&incoming.parent_id),
        )?;
        for mut update in updates {
            if update.server_id.as_deref() == Some(server_id.as_str()) {
                continue;
            }
            let renamed = format!(
                "{}{}",
                update.display_name.as_deref().unwrap_or_default(),
                CLIENT_MOVED_SUFFIX
            );
            self.rename_local_folder(update.server_id.as_deref(), &renamed)?;
            update.display_name = Some(renamed);
            self.actions.push(PendingAction::Update(update));
        }

        if let Some(existing) = self.tx.folder(self.account_id, &server_id)? {
            if existing.same_content(&incoming) && !existing.awaiting_create {
                return Ok(ReconcileOutcome::AlreadyPresent);
            }
            self.migrate_folder(&server_id)?;
        }

        self.tx.insert_folder(&incoming)?;
        Ok(ReconcileOutcome::Applied)
    }

    fn adopt_create(
        &mut self,
        create: PendingOperation,
        incoming: Folder,
    ) -> Result<ReconcileOutcome> {
        let server_id = incoming.server_id().to_string();
        let provisional = create.server_id.clone().unwrap_or_default();

        info!(
            account = self.account_id,
            provisional = %provisional,
            server_id = %server_id,
            "Server echoed pending folder create"
        );

        self.actions.push(PendingAction::Delete(create.id));

        if provisional != server_id {
            if let Some(existing) = self.tx.folder(self.account_id, &server_id)? {
                if !existing.awaiting_create {
                    self.migrate_folder(&server_id)?;
                }
            }
            self.tx
                .rewrite_folder_id(self.account_id, &provisional, &server_id)?;
            self.rules
                .extend(RewriteRule::replace_everywhere(&provisional, &server_id));
        }

        match self.tx.folder(self.account_id, &server_id)? {
            Some(mut folder) => {
                folder.awaiting_create = false;
                folder.parent_id = incoming.parent_id;
                folder.display_name = incoming.display_name;
                folder.folder_type = incoming.folder_type;
                self.tx.update_folder(&folder)?;
            }
            None => {
                self.tx.insert_folder(&incoming)?;
            }
        }

        Ok(ReconcileOutcome::AdoptedPendingCreate {
            pending_id: create.id,
            provisional_id: provisional,
        })
    }

    fn folder_update(&mut self, incoming: Folder) -> Result<ReconcileOutcome> {
        let server_id = incoming.server_id().to_string();

        if self.under_pending_delete(&[server_id.as_str(), incoming.parent_id.as_str()])? {
            info!(account = self.account_id, server_id = %server_id, "Dropping update under pending delete");
            return Ok(ReconcileOutcome::Dropped);
        }

        // Server wins over a local rename/move of the same folder
        let updates = self.eligible(
            PendingQuery::default()
                .kind(OperationKind::FolderUpdate)
                .server_id(&server_id),
        )?;
        for update in updates {
            self.actions.push(PendingAction::Delete(update.id));
        }

        match self.tx.folder(self.account_id, &server_id)? {
            Some(mut folder) => {
                folder.parent_id = incoming.parent_id;
                folder.display_name = incoming.display_name;
                folder.folder_type = incoming.folder_type;
                self.tx.update_folder(&folder)?;
            }
            None => {
                self.tx.insert_folder(&incoming)?;
            }
        }
        Ok(ReconcileOutcome::Applied)
    }

    fn folder_delete(&mut self, server_id: &str) -> Result<ReconcileOutcome> {
        let doomed = folder_subtree(self.tx, self.account_id, server_id)?;
        let doomed_set: HashSet<&str> = doomed.iter().map(|s| s.as_str()).collect();

        // Local deletes of anything in the subtree are already done
        let deletes = self.eligible(PendingQuery::default().kind(OperationKind::FolderDelete))?;
        for delete in deletes {
            if delete
                .server_id
                .as_deref()
                .is_some_and(|id| doomed_set.contains(id))
            {
                self.actions.push(PendingAction::Delete(delete.id));
            }
        }

        // Everything else touching the subtree is moot
        for id in &doomed {
            self.rules.extend(RewriteRule::cancel_everywhere(id));
        }

        for id in &doomed {
            for item in self.tx.items_in_folder(self.account_id, id)? {
                self.tx.delete_item(self.account_id, item.server_id())?;
            }
            self.tx.delete_folder(self.account_id, id)?;
        }
        Ok(ReconcileOutcome::Applied)
    }

    fn item_delete(&mut self, server_id: &str) -> Result<ReconcileOutcome> {
        let ops = self.tx.query_pending(
            self.account_id,
            &PendingQuery::default().server_id(server_id),
        )?;
        for op in ops {
            if !op.kind.is_folder_op() && !op.is_resolved() {
                self.actions.push(PendingAction::Delete(op.id));
            }
        }
        self.tx.delete_item(self.account_id, server_id)?;
        Ok(ReconcileOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::SqliteStore;
    use crate::error::SyncError;
    use crate::types::Item;
    use std::sync::Arc;

    const ACCT: &str = "acct";

    fn store() -> Arc<dyn SyncStore> {
        Arc::new(SqliteStore::in_memory().expect("Failed to create database"))
    }

    fn add(server_id: &str, parent_id: &str, name: &str, folder_type: i32) -> ServerCommand {
        ServerCommand::FolderAdd {
            server_id: server_id.into(),
            parent_id: parent_id.into(),
            display_name: name.into(),
            folder_type,
        }
    }

    /// A local create: provisional folder plus pending op
    fn local_create(tx: &mut dyn StoreTx, id: &str, parent: &str, name: &str, ty: i32) -> Result<PendingOperation> {
        let mut folder = Folder::new(ACCT, id, parent, name, ty);
        folder.awaiting_create = true;
        tx.insert_folder(&folder)?;
        tx.insert_pending(&PendingOperation::folder_create(ACCT, id, parent, name, ty))
    }

    fn pending(store: &Arc<dyn SyncStore>) -> Vec<PendingOperation> {
        store
            .run_in_transaction(|tx| tx.query_pending(ACCT, &PendingQuery::default()))
            .expect("query")
    }

    #[test]
    fn test_add_matching_pending_create_rewrites_provisional_id() {
        let store = store();
        let (create, mv, child) = store
            .run_in_transaction(|tx| {
                let create = local_create(tx, "tmp-1", "0", "Inbox2", 12)?;
                let mv = tx.insert_pending(&PendingOperation::item_move(ACCT, "m1", "3", "tmp-1"))?;
                let child = local_create(tx, "tmp-2", "tmp-1", "Child", 12)?;
                Ok((create, mv, child))
            })
            .expect("setup");

        let reports =
            Reconciler::apply_all(store.as_ref(), ACCT, &[add("5", "0", "Inbox2", 12)]).expect("reconcile");
        assert_eq!(
            reports[0].outcome,
            ReconcileOutcome::AdoptedPendingCreate {
                pending_id: create.id,
                provisional_id: "tmp-1".into()
            }
        );
        assert_eq!(reports[0].deleted_ops, vec![create.id]);

        let ops = pending(&store);
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| op.id != create.id));
        let mv = ops.iter().find(|op| op.id == mv.id).expect("move survives");
        assert_eq!(mv.dest_parent_id.as_deref(), Some("5"));
        let child = ops.iter().find(|op| op.id == child.id).expect("child survives");
        assert_eq!(child.parent_id.as_deref(), Some("5"));

        store
            .run_in_transaction(|tx| {
                let folder = tx.folder(ACCT, "5")?.expect("adopted folder");
                assert!(!folder.awaiting_create);
                assert!(tx.folder(ACCT, "tmp-1")?.is_none());
                assert_eq!(tx.folders(ACCT)?.len(), 2);
                assert_eq!(
                    tx.folder(ACCT, "tmp-2")?.map(|f| f.parent_id),
                    Some("5".to_string())
                );
                Ok(())
            })
            .expect("verify");
    }

    #[test]
    fn test_reconcile_is_atomic() {
        let store = store();
        store
            .run_in_transaction(|tx| local_create(tx, "tmp-1", "0", "Inbox2", 12))
            .expect("setup");

        let result: Result<()> = store.run_in_transaction(|tx| {
            Reconciler::new(tx, ACCT).apply(&add("5", "0", "Inbox2", 12))?;
            Err(SyncError::HardProtocol("later command failed".into()))
        });
        assert!(result.is_err());

        let ops = pending(&store);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].server_id.as_deref(), Some("tmp-1"));
        store
            .run_in_transaction(|tx| {
                assert!(tx.folder(ACCT, "tmp-1")?.is_some());
                assert!(tx.folder(ACCT, "5")?.is_none());
                Ok(())
            })
            .expect("verify");
    }

    #[test]
    fn test_oldest_matching_create_wins() {
        let store = store();
        let (first, second) = store
            .run_in_transaction(|tx| {
                let first = local_create(tx, "tmp-1", "0", "Dup", 12)?;
                let second = tx.insert_pending(&PendingOperation::folder_create(ACCT, "tmp-2", "0", "Dup", 12))?;
                Ok((first, second))
            })
            .expect("setup");

        Reconciler::apply_all(store.as_ref(), ACCT, &[add("9", "0", "Dup", 12)]).expect("reconcile");
        let ops = pending(&store);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].id, second.id);
        assert_ne!(ops[0].id, first.id);
    }

    #[test]
    fn test_type_mismatch_renames_pending_create() {
        let store = store();
        store
            .run_in_transaction(|tx| local_create(tx, "tmp-1", "0", "Notes", 12))
            .expect("setup");

        let reports =
            Reconciler::apply_all(store.as_ref(), ACCT, &[add("5", "0", "Notes", 10)]).expect("reconcile");
        assert_eq!(reports[0].outcome, ReconcileOutcome::Applied);

        let ops = pending(&store);
        assert_eq!(ops[0].display_name.as_deref(), Some("Notes Client-Created"));
        store
            .run_in_transaction(|tx| {
                assert_eq!(
                    tx.folder(ACCT, "tmp-1")?.map(|f| f.display_name),
                    Some("Notes Client-Created".to_string())
                );
                assert_eq!(tx.folder(ACCT, "5")?.map(|f| f.folder_type), Some(10));
                Ok(())
            })
            .expect("verify");
    }

    #[test]
    fn test_add_colliding_with_pending_move_renames_it() {
        let store = store();
        store
            .run_in_transaction(|tx| {
                tx.insert_folder(&Folder::new(ACCT, "7", "0", "Archive", 12))?;
                tx.insert_pending(&PendingOperation::folder_update(ACCT, "7", "0", "Archive"))
            })
            .expect("setup");

        Reconciler::apply_all(store.as_ref(), ACCT, &[add("8", "0", "Archive", 12)]).expect("reconcile");

        let ops = pending(&store);
        assert_eq!(ops[0].display_name.as_deref(), Some("Archive Client-Moved"));
    }

    #[test]
    fn test_add_under_pending_delete_is_dropped() {
        let store = store();
        store
            .run_in_transaction(|tx| {
                tx.insert_folder(&Folder::new(ACCT, "2", "0", "Old", 12))?;
                tx.insert_folder(&Folder::new(ACCT, "3", "2", "Nested", 12))?;
                tx.insert_pending(&PendingOperation::folder_delete(ACCT, "2"))
            })
            .expect("setup");

        let reports = Reconciler::apply_all(
            store.as_ref(),
            ACCT,
            &[
                add("4", "3", "Deep", 12),
                ServerCommand::FolderUpdate {
                    server_id: "3".into(),
                    parent_id: "2".into(),
                    display_name: "Renamed".into(),
                    folder_type: 12,
                },
            ],
        )
        .expect("reconcile");
        assert_eq!(reports[0].outcome, ReconcileOutcome::Dropped);
        assert_eq!(reports[1].outcome, ReconcileOutcome::Dropped);

        store
            .run_in_transaction(|tx| {
                assert!(tx.folder(ACCT, "4")?.is_none());
                assert_eq!(
                    tx.folder(ACCT, "3")?.map(|f| f.display_name),
                    Some("Nested".to_string())
                );
                Ok(())
            })
            .expect("verify");
    }

    #[test]
    fn test_update_beats_pending_update() {
        let store = store();
        let op = store
            .run_in_transaction(|tx| {
                tx.insert_folder(&Folder::new(ACCT, "7", "0", "Mine", 12))?;
                tx.insert_pending(&PendingOperation::folder_update(ACCT, "7", "0", "Mine"))
            })
            .expect("setup");

        let reports = Reconciler::apply_all(
            store.as_ref(),
            ACCT,
            &[ServerCommand::FolderUpdate {
                server_id: "7".into(),
                parent_id: "0".into(),
                display_name: "Theirs".into(),
                folder_type: 12,
            }],
        )
        .expect("reconcile");
        assert_eq!(reports[0].deleted_ops, vec![op.id]);
        assert!(pending(&store).is_empty());

        store
            .run_in_transaction(|tx| {
                assert_eq!(
                    tx.folder(ACCT, "7")?.map(|f| f.display_name),
                    Some("Theirs".to_string())
                );
                Ok(())
            })
            .expect("verify");
    }

    #[test]
    fn test_delete_cancels_ops_in_subtree() {
        let store = store();
        let keep = store
            .run_in_transaction(|tx| {
                tx.insert_folder(&Folder::new(ACCT, "2", "0", "Top", 12))?;
                tx.insert_folder(&Folder::new(ACCT, "3", "2", "Mid", 12))?;
                tx.insert_folder(&Folder::new(ACCT, "9", "0", "Elsewhere", 12))?;
                tx.insert_item(&Item::new(ACCT, "i1", "3", None))?;
                tx.insert_pending(&PendingOperation::folder_delete(ACCT, "3"))?;
                tx.insert_pending(&PendingOperation::item_move(ACCT, "i2", "9", "3"))?;
                tx.insert_pending(&PendingOperation::folder_update(ACCT, "2", "0", "Top2"))?;
                tx.insert_pending(&PendingOperation::folder_delete(ACCT, "9"))
            })
            .expect("setup");

        let reports = Reconciler::apply_all(
            store.as_ref(),
            ACCT,
            &[ServerCommand::FolderDelete {
                server_id: "2".into(),
            }],
        )
        .expect("reconcile");
        assert_eq!(reports[0].deleted_ops.len(), 1);
        assert_eq!(reports[0].rewrites.cancelled.len(), 2);

        let ops = pending(&store);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].id, keep.id);

        store
            .run_in_transaction(|tx| {
                assert!(tx.folder(ACCT, "2")?.is_none());
                assert!(tx.folder(ACCT, "3")?.is_none());
                assert!(tx.item(ACCT, "i1")?.is_none());
                assert!(tx.folder(ACCT, "9")?.is_some());
                Ok(())
            })
            .expect("verify");
    }

    #[test]
    fn test_item_delete_cancels_item_ops() {
        let store = store();
        store
            .run_in_transaction(|tx| {
                tx.insert_item(&Item::new(ACCT, "i1", "3", Some("hi")))?;
                tx.insert_pending(&PendingOperation::item_move(ACCT, "i1", "3", "4"))?;
                tx.insert_pending(&PendingOperation::folder_delete(ACCT, "i1"))
            })
            .expect("setup");

        Reconciler::apply_all(
            store.as_ref(),
            ACCT,
            &[ServerCommand::ItemDelete {
                server_id: "i1".into(),
            }],
        )
        .expect("reconcile");

        let ops = pending(&store);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::FolderDelete);
        store
            .run_in_transaction(|tx| {
                assert!(tx.item(ACCT, "i1")?.is_none());
                Ok(())
            })
            .expect("verify");
    }

    #[test]
    fn test_id_collision_migrates_existing_folder() {
        let store = store();
        let op = store
            .run_in_transaction(|tx| {
                tx.insert_folder(&Folder::new(ACCT, "5", "0", "Stale", 12))?;
                tx.insert_pending(&PendingOperation::folder_update(ACCT, "5", "0", "Stale2"))
            })
            .expect("setup");

        let reports =
            Reconciler::apply_all(store.as_ref(), ACCT, &[add("5", "0", "Fresh", 12)]).expect("reconcile");
        assert_eq!(reports[0].outcome, ReconcileOutcome::Applied);

        let ops = pending(&store);
        let migrated_id = ops
            .iter()
            .find(|o| o.id == op.id)
            .and_then(|o| o.server_id.clone())
            .expect("op survives");
        assert!(migrated_id.starts_with("migrated-"));

        store
            .run_in_transaction(|tx| {
                assert_eq!(
                    tx.folder(ACCT, "5")?.map(|f| f.display_name),
                    Some("Fresh".to_string())
                );
                assert_eq!(
                    tx.folder(ACCT, &migrated_id)?.map(|f| f.display_name),
                    Some("Stale".to_string())
                );
                Ok(())
            })
            .expect("verify");
    }

    #[test]
    fn test_identical_add_is_idempotent() {
        let store = store();
        let commands = [add("5", "0", "Inbox", 2)];
        Reconciler::apply_all(store.as_ref(), ACCT, &commands).expect("first");
        let reports = Reconciler::apply_all(store.as_ref(), ACCT, &commands).expect("second");
        assert_eq!(reports[0].outcome, ReconcileOutcome::AlreadyPresent);
    }
}
