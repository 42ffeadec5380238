//! SQLite implementation of the sync store
//!
//! One pooled connection per transaction. Row mappers follow the usual
//! `row_to_*` shape; timestamps are stored as RFC 3339 text and item payloads
//! as JSON.

use chrono::{DateTime, Utc};
use rusqlite::types::{ToSql, Type};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tracing::{debug, info, warn};

use super::pool::{create_memory_pool, create_pool, DbConnection, DbPool};
use super::schema::initialize_schema;
use crate::error::{Result, SyncError};
use crate::pending::{OperationKind, PendingOperation, PendingState};
use crate::store::{PendingQuery, StoreTx, SyncStore};
use crate::types::{Credential, Folder, Item, ProtocolState, ServerRecord, SyncedEntity};

const PENDING_COLUMNS: &str = "id, account_id, kind, state, server_id, parent_id, dest_parent_id, \
     display_name, folder_type, payload, staged, last_error, retry_count, created_at";

const FOLDER_COLUMNS: &str =
    "id, account_id, server_id, parent_id, display_name, folder_type, awaiting_create";

const ITEM_COLUMNS: &str = "id, account_id, server_id, parent_id, subject";

pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let pool = create_pool(path.as_ref())?;
        let store = Self { pool };
        initialize_schema(&store.connection()?)?;
        info!("Opened sync store at {:?}", path.as_ref());
        Ok(store)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            pool: create_memory_pool()?,
        };
        initialize_schema(&store.connection()?)?;
        Ok(store)
    }

    fn connection(&self) -> Result<DbConnection> {
        self.pool
            .get()
            .map_err(|e| SyncError::Database(format!("Failed to get database connection: {}", e)))
    }
}

impl SyncStore for SqliteStore {
    fn transaction(&self, work: &mut dyn FnMut(&mut dyn StoreTx) -> Result<()>) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;

        let result = {
            let mut store_tx = SqliteTx { conn: &tx };
            work(&mut store_tx)
        };

        match result {
            Ok(()) => {
                tx.commit()?;
                Ok(())
            }
            Err(e) => {
                debug!("Rolling back transaction: {}", e);
                if let Err(rollback) = tx.rollback() {
                    warn!("Rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }
}

struct SqliteTx<'a> {
    conn: &'a Connection,
}

fn conversion_error(column: usize, err: SyncError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn row_to_pending(row: &Row) -> std::result::Result<PendingOperation, rusqlite::Error> {
    let kind: String = row.get(2)?;
    let state: String = row.get(3)?;
    let payload: Option<String> = row.get(9)?;

    Ok(PendingOperation {
        id: row.get(0)?,
        account_id: row.get(1)?,
        kind: OperationKind::parse(&kind).map_err(|e| conversion_error(2, e))?,
        state: PendingState::parse(&state).map_err(|e| conversion_error(3, e))?,
        server_id: row.get(4)?,
        parent_id: row.get(5)?,
        dest_parent_id: row.get(6)?,
        display_name: row.get(7)?,
        folder_type: row.get(8)?,
        payload: payload
            .map(|p| serde_json::from_str(&p))
            .transpose()
            .map_err(|e| conversion_error(9, e.into()))?,
        staged: row.get::<_, i32>(10)? != 0,
        last_error: row.get(11)?,
        retry_count: row.get(12)?,
        created_at: parse_timestamp(row.get(13)?).unwrap_or_else(Utc::now),
    })
}

fn row_to_folder(row: &Row) -> std::result::Result<Folder, rusqlite::Error> {
    Ok(Folder {
        entity: SyncedEntity {
            local_id: row.get(0)?,
            account_id: row.get(1)?,
            server_id: row.get(2)?,
        },
        parent_id: row.get(3)?,
        display_name: row.get(4)?,
        folder_type: row.get(5)?,
        awaiting_create: row.get::<_, i32>(6)? != 0,
    })
}

fn row_to_item(row: &Row) -> std::result::Result<Item, rusqlite::Error> {
    Ok(Item {
        entity: SyncedEntity {
            local_id: row.get(0)?,
            account_id: row.get(1)?,
            server_id: row.get(2)?,
        },
        parent_id: row.get(3)?,
        subject: row.get(4)?,
    })
}

fn row_to_protocol_state(row: &Row) -> std::result::Result<ProtocolState, rusqlite::Error> {
    Ok(ProtocolState {
        account_id: row.get(0)?,
        fsm_state: row.get(1)?,
        protocol_version: row.get(2)?,
        sync_key: row.get(3)?,
        policy_key: row.get(4)?,
        folder_sync_epoch: row.get(5)?,
        last_folder_sync: parse_timestamp(row.get(6)?),
    })
}

impl SqliteTx<'_> {
    fn payload_json(op: &PendingOperation) -> Result<Option<String>> {
        Ok(op.payload.as_ref().map(serde_json::to_string).transpose()?)
    }
}

impl StoreTx for SqliteTx<'_> {
    // ========== Protocol State ==========

    fn protocol_state(&mut self, account_id: &str) -> Result<Option<ProtocolState>> {
        let state = self
            .conn
            .query_row(
                "SELECT account_id, fsm_state, protocol_version, sync_key, policy_key,
                        folder_sync_epoch, last_folder_sync
                 FROM protocol_state WHERE account_id = ?1",
                params![account_id],
                row_to_protocol_state,
            )
            .optional()?;
        Ok(state)
    }

    fn save_protocol_state(&mut self, state: &ProtocolState) -> Result<()> {
        self.conn.execute(
            "INSERT INTO protocol_state (account_id, fsm_state, protocol_version, sync_key,
                                         policy_key, folder_sync_epoch, last_folder_sync)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(account_id) DO UPDATE SET
                fsm_state = excluded.fsm_state,
                protocol_version = excluded.protocol_version,
                sync_key = excluded.sync_key,
                policy_key = excluded.policy_key,
                folder_sync_epoch = excluded.folder_sync_epoch,
                last_folder_sync = excluded.last_folder_sync",
            params![
                state.account_id,
                state.fsm_state,
                state.protocol_version,
                state.sync_key,
                state.policy_key,
                state.folder_sync_epoch,
                state.last_folder_sync.map(|d| d.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    // ========== Pending Operations ==========

    fn insert_pending(&mut self, op: &PendingOperation) -> Result<PendingOperation> {
        self.conn.execute(
            "INSERT INTO pending_operations (account_id, kind, state, server_id, parent_id,
                 dest_parent_id, display_name, folder_type, payload, staged, last_error,
                 retry_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                op.account_id,
                op.kind.as_str(),
                op.state.as_str(),
                op.server_id,
                op.parent_id,
                op.dest_parent_id,
                op.display_name,
                op.folder_type,
                Self::payload_json(op)?,
                op.staged as i32,
                op.last_error,
                op.retry_count,
                op.created_at.to_rfc3339(),
            ],
        )?;

        let mut inserted = op.clone();
        inserted.id = self.conn.last_insert_rowid();
        Ok(inserted)
    }

    fn update_pending(&mut self, op: &PendingOperation) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE pending_operations SET state = ?2, server_id = ?3, parent_id = ?4,
                 dest_parent_id = ?5, display_name = ?6, folder_type = ?7, payload = ?8,
                 staged = ?9, last_error = ?10, retry_count = ?11
             WHERE id = ?1",
            params![
                op.id,
                op.state.as_str(),
                op.server_id,
                op.parent_id,
                op.dest_parent_id,
                op.display_name,
                op.folder_type,
                Self::payload_json(op)?,
                op.staged as i32,
                op.last_error,
                op.retry_count,
            ],
        )?;
        if changed == 0 {
            return Err(SyncError::NotFound(format!("pending operation {}", op.id)));
        }
        Ok(())
    }

    fn delete_pending(&mut self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM pending_operations WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn pending(&mut self, id: i64) -> Result<Option<PendingOperation>> {
        let op = self
            .conn
            .query_row(
                &format!("SELECT {} FROM pending_operations WHERE id = ?1", PENDING_COLUMNS),
                params![id],
                row_to_pending,
            )
            .optional()?;
        Ok(op)
    }

    fn query_pending(
        &mut self,
        account_id: &str,
        query: &PendingQuery,
    ) -> Result<Vec<PendingOperation>> {
        let mut sql = format!(
            "SELECT {} FROM pending_operations WHERE account_id = ?1",
            PENDING_COLUMNS
        );
        let mut values: Vec<Box<dyn ToSql>> = vec![Box::new(account_id.to_string())];

        let mut push = |clause: &str, value: Box<dyn ToSql>, values: &mut Vec<Box<dyn ToSql>>| {
            values.push(value);
            sql.push_str(&clause.replace('?', &format!("?{}", values.len())));
        };

        if let Some(kind) = query.kind {
            push(" AND kind = ?", Box::new(kind.as_str()), &mut values);
        }
        if let Some(state) = query.state {
            push(" AND state = ?", Box::new(state.as_str()), &mut values);
        }
        if let Some(server_id) = &query.server_id {
            push(" AND server_id = ?", Box::new(server_id.clone()), &mut values);
        }
        if let Some(parent_id) = &query.parent_id {
            push(" AND parent_id = ?", Box::new(parent_id.clone()), &mut values);
        }
        if let Some(name) = &query.display_name {
            push(" AND display_name = ?", Box::new(name.clone()), &mut values);
        }
        if let Some(id) = &query.references {
            push(
                " AND (server_id = ? OR parent_id = ? OR dest_parent_id = ?)",
                Box::new(id.clone()),
                &mut values,
            );
        }
        sql.push_str(" ORDER BY id ASC");

        let param_refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let mut stmt = self.conn.prepare(&sql)?;
        let ops = stmt
            .query_map(param_refs.as_slice(), row_to_pending)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ops)
    }

    // ========== Folders ==========

    fn insert_folder(&mut self, folder: &Folder) -> Result<Folder> {
        self.conn.execute(
            "INSERT INTO folders (account_id, server_id, parent_id, display_name, folder_type,
                                  awaiting_create)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                folder.entity.account_id,
                folder.entity.server_id,
                folder.parent_id,
                folder.display_name,
                folder.folder_type,
                folder.awaiting_create as i32,
            ],
        )?;
        let mut inserted = folder.clone();
        inserted.entity.local_id = self.conn.last_insert_rowid();
        Ok(inserted)
    }

    fn update_folder(&mut self, folder: &Folder) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE folders SET parent_id = ?3, display_name = ?4, folder_type = ?5,
                                awaiting_create = ?6
             WHERE account_id = ?1 AND server_id = ?2",
            params![
                folder.entity.account_id,
                folder.entity.server_id,
                folder.parent_id,
                folder.display_name,
                folder.folder_type,
                folder.awaiting_create as i32,
            ],
        )?;
        if changed == 0 {
            return Err(SyncError::NotFound(format!(
                "folder {}",
                folder.entity.server_id
            )));
        }
        Ok(())
    }

    fn delete_folder(&mut self, account_id: &str, server_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM folders WHERE account_id = ?1 AND server_id = ?2",
            params![account_id, server_id],
        )?;
        Ok(())
    }

    fn folder(&mut self, account_id: &str, server_id: &str) -> Result<Option<Folder>> {
        let folder = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM folders WHERE account_id = ?1 AND server_id = ?2",
                    FOLDER_COLUMNS
                ),
                params![account_id, server_id],
                row_to_folder,
            )
            .optional()?;
        Ok(folder)
    }

    fn folders(&mut self, account_id: &str) -> Result<Vec<Folder>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM folders WHERE account_id = ?1 ORDER BY id ASC",
            FOLDER_COLUMNS
        ))?;
        let folders = stmt
            .query_map(params![account_id], row_to_folder)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(folders)
    }

    fn child_folders(&mut self, account_id: &str, parent_id: &str) -> Result<Vec<Folder>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM folders WHERE account_id = ?1 AND parent_id = ?2 ORDER BY id ASC",
            FOLDER_COLUMNS
        ))?;
        let folders = stmt
            .query_map(params![account_id, parent_id], row_to_folder)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(folders)
    }

    fn rewrite_folder_id(&mut self, account_id: &str, old_id: &str, new_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE folders SET server_id = ?3 WHERE account_id = ?1 AND server_id = ?2",
            params![account_id, old_id, new_id],
        )?;
        self.conn.execute(
            "UPDATE folders SET parent_id = ?3 WHERE account_id = ?1 AND parent_id = ?2",
            params![account_id, old_id, new_id],
        )?;
        self.conn.execute(
            "UPDATE items SET parent_id = ?3 WHERE account_id = ?1 AND parent_id = ?2",
            params![account_id, old_id, new_id],
        )?;
        Ok(())
    }

    // ========== Items ==========

    fn insert_item(&mut self, item: &Item) -> Result<Item> {
        self.conn.execute(
            "INSERT INTO items (account_id, server_id, parent_id, subject)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                item.entity.account_id,
                item.entity.server_id,
                item.parent_id,
                item.subject,
            ],
        )?;
        let mut inserted = item.clone();
        inserted.entity.local_id = self.conn.last_insert_rowid();
        Ok(inserted)
    }

    fn delete_item(&mut self, account_id: &str, server_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM items WHERE account_id = ?1 AND server_id = ?2",
            params![account_id, server_id],
        )?;
        Ok(())
    }

    fn item(&mut self, account_id: &str, server_id: &str) -> Result<Option<Item>> {
        let item = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM items WHERE account_id = ?1 AND server_id = ?2",
                    ITEM_COLUMNS
                ),
                params![account_id, server_id],
                row_to_item,
            )
            .optional()?;
        Ok(item)
    }

    fn items_in_folder(&mut self, account_id: &str, parent_id: &str) -> Result<Vec<Item>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM items WHERE account_id = ?1 AND parent_id = ?2 ORDER BY id ASC",
            ITEM_COLUMNS
        ))?;
        let items = stmt
            .query_map(params![account_id, parent_id], row_to_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    fn move_item(&mut self, account_id: &str, server_id: &str, new_parent: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE items SET parent_id = ?3 WHERE account_id = ?1 AND server_id = ?2",
            params![account_id, server_id, new_parent],
        )?;
        Ok(())
    }

    fn rewrite_item_id(&mut self, account_id: &str, old_id: &str, new_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE items SET server_id = ?3 WHERE account_id = ?1 AND server_id = ?2",
            params![account_id, old_id, new_id],
        )?;
        Ok(())
    }

    // ========== Server and Credentials ==========

    fn server_record(&mut self, account_id: &str) -> Result<Option<ServerRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT account_id, host, port, path, scheme FROM server_records
                 WHERE account_id = ?1",
                params![account_id],
                |row| {
                    Ok(ServerRecord {
                        account_id: row.get(0)?,
                        host: row.get(1)?,
                        port: row.get(2)?,
                        path: row.get(3)?,
                        scheme: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn save_server_record(&mut self, record: &ServerRecord) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO server_records (account_id, host, port, path, scheme)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.account_id,
                record.host,
                record.port,
                record.path,
                record.scheme,
            ],
        )?;
        Ok(())
    }

    fn credential(&mut self, account_id: &str) -> Result<Option<Credential>> {
        let credential = self
            .conn
            .query_row(
                "SELECT account_id, username, secret FROM credentials WHERE account_id = ?1",
                params![account_id],
                |row| {
                    Ok(Credential {
                        account_id: row.get(0)?,
                        username: row.get(1)?,
                        secret: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(credential)
    }

    fn save_credential(&mut self, credential: &Credential) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO credentials (account_id, username, secret)
             VALUES (?1, ?2, ?3)",
            params![credential.account_id, credential.username, credential.secret],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store() -> Arc<dyn SyncStore> {
        Arc::new(SqliteStore::in_memory().expect("Failed to create database"))
    }

    #[test]
    fn test_protocol_state_roundtrip() {
        let store = store();
        let mut state = ProtocolState::new("acct");
        state.sync_key = "7".into();
        state.last_folder_sync = Some(Utc::now());

        store
            .run_in_transaction(|tx| tx.save_protocol_state(&state))
            .expect("save");
        let loaded = store
            .run_in_transaction(|tx| tx.protocol_state("acct"))
            .expect("load")
            .expect("state exists");
        assert_eq!(loaded.sync_key, "7");
        assert!(loaded.last_folder_sync.is_some());
        assert_eq!(loaded.folder_sync_epoch, 1);
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let store = store();
        let result: Result<()> = store.run_in_transaction(|tx| {
            tx.insert_folder(&Folder::new("acct", "1", "0", "Inbox", 2))?;
            Err(SyncError::HardProtocol("boom".into()))
        });
        assert!(result.is_err());

        let folders = store
            .run_in_transaction(|tx| tx.folders("acct"))
            .expect("list");
        assert!(folders.is_empty());
    }

    #[test]
    fn test_pending_query_in_creation_order() {
        let store = store();
        store
            .run_in_transaction(|tx| {
                tx.insert_pending(&PendingOperation::folder_create("acct", "t1", "0", "A", 12))?;
                tx.insert_pending(&PendingOperation::folder_delete("acct", "9"))?;
                tx.insert_pending(&PendingOperation::item_move("acct", "m1", "t1", "4"))?;
                tx.insert_pending(&PendingOperation::folder_create("other", "t2", "0", "A", 12))?;
                Ok(())
            })
            .expect("insert");

        let all = store
            .run_in_transaction(|tx| tx.query_pending("acct", &PendingQuery::default()))
            .expect("query");
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));

        let creates = store
            .run_in_transaction(|tx| {
                tx.query_pending(
                    "acct",
                    &PendingQuery::default()
                        .kind(OperationKind::FolderCreate)
                        .display_name("A")
                        .parent_id("0"),
                )
            })
            .expect("query");
        assert_eq!(creates.len(), 1);
        assert_eq!(creates[0].server_id.as_deref(), Some("t1"));

        let referencing = store
            .run_in_transaction(|tx| {
                tx.query_pending("acct", &PendingQuery::default().references("t1"))
            })
            .expect("query");
        assert_eq!(referencing.len(), 2);
    }

    #[test]
    fn test_pending_update_and_payload() {
        let store = store();
        let mut op = store
            .run_in_transaction(|tx| {
                tx.insert_pending(&PendingOperation::item_send("acct", "c1", "Subject: hi"))
            })
            .expect("insert");
        assert!(op.id > 0);

        op.state = PendingState::Dispatched;
        op.retry_count = 2;
        store
            .run_in_transaction(|tx| tx.update_pending(&op))
            .expect("update");

        let loaded = store
            .run_in_transaction(|tx| tx.pending(op.id))
            .expect("load")
            .expect("exists");
        assert_eq!(loaded.state, PendingState::Dispatched);
        assert_eq!(loaded.retry_count, 2);
        assert_eq!(
            loaded.payload.as_ref().and_then(|p| p["mime"].as_str()),
            Some("Subject: hi")
        );

        let missing = PendingOperation {
            id: 999,
            ..loaded
        };
        assert!(matches!(
            store.run_in_transaction(|tx| tx.update_pending(&missing)),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn test_rewrite_folder_id() {
        let store = store();
        store
            .run_in_transaction(|tx| {
                tx.insert_folder(&Folder::new("acct", "tmp", "0", "Parent", 12))?;
                tx.insert_folder(&Folder::new("acct", "c1", "tmp", "Child", 12))?;
                tx.insert_item(&Item::new("acct", "i1", "tmp", Some("hello")))?;
                tx.rewrite_folder_id("acct", "tmp", "42")
            })
            .expect("rewrite");

        store
            .run_in_transaction(|tx| {
                assert!(tx.folder("acct", "tmp")?.is_none());
                assert_eq!(tx.folder("acct", "42")?.map(|f| f.display_name), Some("Parent".into()));
                assert_eq!(tx.child_folders("acct", "42")?.len(), 1);
                assert_eq!(tx.items_in_folder("acct", "42")?.len(), 1);
                Ok(())
            })
            .expect("verify");
    }

    #[test]
    fn test_server_and_credentials() {
        let store = store();
        let record = ServerRecord {
            account_id: "acct".into(),
            host: "mail.example.com".into(),
            port: 443,
            path: "/sync".into(),
            scheme: "https".into(),
        };
        let cred = Credential {
            account_id: "acct".into(),
            username: "me".into(),
            secret: "pw".into(),
        };
        store
            .run_in_transaction(|tx| {
                tx.save_server_record(&record)?;
                tx.save_credential(&cred)
            })
            .expect("save");

        let (loaded_record, loaded_cred) = store
            .run_in_transaction(|tx| Ok((tx.server_record("acct")?, tx.credential("acct")?)))
            .expect("load");
        assert_eq!(loaded_record, Some(record));
        assert_eq!(loaded_cred, Some(cred));
    }
}
