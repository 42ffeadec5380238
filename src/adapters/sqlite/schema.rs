use super::pool::DbConnection;
use crate::error::Result;

pub fn initialize_schema(conn: &DbConnection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Per-account protocol checkpoint
        CREATE TABLE IF NOT EXISTS protocol_state (
            account_id TEXT PRIMARY KEY,
            fsm_state INTEGER NOT NULL DEFAULT 0,
            protocol_version TEXT NOT NULL DEFAULT '12.0',
            sync_key TEXT NOT NULL DEFAULT '0',
            policy_key TEXT NOT NULL DEFAULT '0',
            folder_sync_epoch INTEGER NOT NULL DEFAULT 1,
            last_folder_sync TEXT
        );

        -- Local edits not yet confirmed by the server. AUTOINCREMENT keeps
        -- ids strictly increasing so they double as the FIFO sequence.
        CREATE TABLE IF NOT EXISTS pending_operations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'eligible',
            server_id TEXT,
            parent_id TEXT,
            dest_parent_id TEXT,
            display_name TEXT,
            folder_type INTEGER,
            payload TEXT,  -- JSON
            staged INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_pending_account_state
            ON pending_operations(account_id, state);

        CREATE TABLE IF NOT EXISTS folders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            server_id TEXT NOT NULL,
            parent_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            folder_type INTEGER NOT NULL,
            awaiting_create INTEGER NOT NULL DEFAULT 0,
            UNIQUE(account_id, server_id)
        );

        CREATE INDEX IF NOT EXISTS idx_folders_parent ON folders(account_id, parent_id);

        CREATE TABLE IF NOT EXISTS items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            server_id TEXT NOT NULL,
            parent_id TEXT NOT NULL,
            subject TEXT,
            UNIQUE(account_id, server_id)
        );

        CREATE INDEX IF NOT EXISTS idx_items_parent ON items(account_id, parent_id);

        CREATE TABLE IF NOT EXISTS server_records (
            account_id TEXT PRIMARY KEY,
            host TEXT NOT NULL,
            port INTEGER NOT NULL,
            path TEXT NOT NULL,
            scheme TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS credentials (
            account_id TEXT PRIMARY KEY,
            username TEXT NOT NULL,
            secret TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}
