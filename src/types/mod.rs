//! Persisted model records shared by the store, reconciler and engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, SyncError};

/// Initial value of the opaque sync and policy keys
pub const INITIAL_SYNC_KEY: &str = "0";

/// Parent id of top-level folders
pub const ROOT_FOLDER_ID: &str = "0";

/// Identity shared by every record that mirrors something on the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedEntity {
    /// Row id in the local store, 0 until inserted
    pub local_id: i64,
    /// Server-assigned id, or a provisional one while the create is pending
    pub server_id: String,
    pub account_id: String,
}

impl SyncedEntity {
    pub fn new(account_id: &str, server_id: &str) -> Self {
        Self {
            local_id: 0,
            server_id: server_id.to_string(),
            account_id: account_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub entity: SyncedEntity,
    pub parent_id: String,
    pub display_name: String,
    pub folder_type: i32,
    /// Created locally, server has not confirmed it yet
    pub awaiting_create: bool,
}

impl Folder {
    pub fn new(
        account_id: &str,
        server_id: &str,
        parent_id: &str,
        display_name: &str,
        folder_type: i32,
    ) -> Self {
        Self {
            entity: SyncedEntity::new(account_id, server_id),
            parent_id: parent_id.to_string(),
            display_name: display_name.to_string(),
            folder_type,
            awaiting_create: false,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.entity.server_id
    }

    /// Same name, parent and type
    pub fn same_content(&self, other: &Folder) -> bool {
        self.parent_id == other.parent_id
            && self.display_name == other.display_name
            && self.folder_type == other.folder_type
    }
}

/// A message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub entity: SyncedEntity,
    /// Server id of the folder holding the item
    pub parent_id: String,
    pub subject: Option<String>,
}

impl Item {
    pub fn new(account_id: &str, server_id: &str, parent_id: &str, subject: Option<&str>) -> Self {
        Self {
            entity: SyncedEntity::new(account_id, server_id),
            parent_id: parent_id.to_string(),
            subject: subject.map(|s| s.to_string()),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.entity.server_id
    }
}

/// Where an account's server lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub account_id: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub scheme: String,
}

impl ServerRecord {
    /// Full endpoint URL for protocol commands
    pub fn url(&self) -> Result<Url> {
        let raw = format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.path);
        Url::parse(&raw)
            .map_err(|e| SyncError::Configuration(format!("Invalid server URL {}: {}", raw, e)))
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub account_id: String,
    pub username: String,
    pub secret: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("account_id", &self.account_id)
            .field("username", &self.username)
            .field("secret", &"***")
            .finish()
    }
}

/// Per-account protocol checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolState {
    pub account_id: String,
    /// Engine FSM state at the last change
    pub fsm_state: u32,
    pub protocol_version: String,
    pub sync_key: String,
    pub policy_key: String,
    pub folder_sync_epoch: i64,
    pub last_folder_sync: Option<DateTime<Utc>>,
}

impl ProtocolState {
    pub fn new(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            fsm_state: crate::fsm::ST_START,
            protocol_version: "12.0".to_string(),
            sync_key: INITIAL_SYNC_KEY.to_string(),
            policy_key: INITIAL_SYNC_KEY.to_string(),
            folder_sync_epoch: 1,
            last_folder_sync: None,
        }
    }

    pub fn has_initial_sync_key(&self) -> bool {
        self.sync_key == INITIAL_SYNC_KEY
    }

    /// The server no longer recognises our key: start the hierarchy over
    pub fn reset_sync_key(&mut self) {
        self.sync_key = INITIAL_SYNC_KEY.to_string();
        self.folder_sync_epoch += 1;
    }

    /// Forget the policy; the next command has to be a policy fetch
    pub fn reset_policy_key(&mut self) {
        self.policy_key = INITIAL_SYNC_KEY.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_state_defaults() {
        let mut state = ProtocolState::new("acct");
        assert_eq!(state.sync_key, "0");
        assert_eq!(state.policy_key, "0");
        assert_eq!(state.protocol_version, "12.0");
        assert_eq!(state.folder_sync_epoch, 1);
        assert!(state.has_initial_sync_key());

        state.sync_key = "17".into();
        state.reset_sync_key();
        assert!(state.has_initial_sync_key());
        assert_eq!(state.folder_sync_epoch, 2);

        state.policy_key = "3942919513".into();
        state.reset_policy_key();
        assert_eq!(state.policy_key, "0");
        assert_eq!(state.sync_key, "0");
    }

    #[test]
    fn test_server_url() {
        let server = ServerRecord {
            account_id: "acct".into(),
            host: "mail.example.com".into(),
            port: 443,
            path: "/Microsoft-Server-ActiveSync".into(),
            scheme: "https".into(),
        };
        let url = server.url().expect("valid url");
        assert_eq!(url.host_str(), Some("mail.example.com"));
        assert_eq!(url.path(), "/Microsoft-Server-ActiveSync");

        let bad = ServerRecord {
            host: "".into(),
            ..server
        };
        assert!(matches!(bad.url(), Err(SyncError::Configuration(_))));
    }

    #[test]
    fn test_credential_debug_hides_secret() {
        let cred = Credential {
            account_id: "acct".into(),
            username: "me".into(),
            secret: "hunter2".into(),
        };
        assert!(!format!("{:?}", cred).contains("hunter2"));
    }
}
