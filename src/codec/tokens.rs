//! Code page token tables
//!
//! A table maps (code page, tag name) to a one-byte token and back. Tables
//! are configuration: they deserialize from TOML, and [`TokenTable::builtin`]
//! carries the pages the protocol engine speaks.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

pub const AIR_SYNC: u8 = 0;
pub const MOVE: u8 = 5;
pub const FOLDER_HIERARCHY: u8 = 7;
pub const PROVISION: u8 = 14;
pub const COMPOSE_MAIL: u8 = 21;

/// Lowest and highest token a tag may use; the rest are global tokens
pub const MIN_TAG_TOKEN: u8 = 0x05;
pub const MAX_TAG_TOKEN: u8 = 0x3F;

/// One code page as it appears in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodePage {
    pub id: u8,
    pub namespace: String,
    pub tags: BTreeMap<String, u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenTableFile {
    pages: Vec<CodePage>,
}

#[derive(Debug, Clone)]
pub struct TokenTable {
    namespaces: HashMap<u8, String>,
    by_name: HashMap<(u8, String), u8>,
    by_token: HashMap<(u8, u8), String>,
}

impl TokenTable {
    pub fn new(pages: Vec<CodePage>) -> Result<Self> {
        let mut table = Self {
            namespaces: HashMap::new(),
            by_name: HashMap::new(),
            by_token: HashMap::new(),
        };

        for page in pages {
            if table.namespaces.contains_key(&page.id) {
                return Err(SyncError::Configuration(format!(
                    "code page {} declared twice",
                    page.id
                )));
            }
            for (name, token) in &page.tags {
                if !(MIN_TAG_TOKEN..=MAX_TAG_TOKEN).contains(token) {
                    return Err(SyncError::Configuration(format!(
                        "{}:{} uses reserved token {:#04x}",
                        page.namespace, name, token
                    )));
                }
                if table
                    .by_token
                    .insert((page.id, *token), name.clone())
                    .is_some()
                {
                    return Err(SyncError::Configuration(format!(
                        "{} assigns token {:#04x} twice",
                        page.namespace, token
                    )));
                }
                table.by_name.insert((page.id, name.clone()), *token);
            }
            table.namespaces.insert(page.id, page.namespace);
        }

        Ok(table)
    }

    /// Parse a table from TOML: `[[pages]]` with `id`, `namespace` and a
    /// `[pages.tags]` name-to-token map
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: TokenTableFile = toml::from_str(content)?;
        Self::new(file.pages)
    }

    pub fn has_page(&self, page: u8) -> bool {
        self.namespaces.contains_key(&page)
    }

    pub fn namespace(&self, page: u8) -> Option<&str> {
        self.namespaces.get(&page).map(|s| s.as_str())
    }

    pub fn token(&self, page: u8, name: &str) -> Option<u8> {
        self.by_name.get(&(page, name.to_string())).copied()
    }

    pub fn name(&self, page: u8, token: u8) -> Option<&str> {
        self.by_token.get(&(page, token)).map(|s| s.as_str())
    }

    /// The pages used by the protocol engine
    pub fn builtin() -> Result<Self> {
        let pages = vec![
            page(
                AIR_SYNC,
                "AirSync",
                &[
                    ("Sync", 0x05),
                    ("Responses", 0x06),
                    ("Add", 0x07),
                    ("Change", 0x08),
                    ("Delete", 0x09),
                    ("Fetch", 0x0A),
                    ("SyncKey", 0x0B),
                    ("ClientId", 0x0C),
                    ("ServerId", 0x0D),
                    ("Status", 0x0E),
                    ("Collection", 0x0F),
                    ("Class", 0x10),
                    ("CollectionId", 0x12),
                    ("GetChanges", 0x13),
                    ("MoreAvailable", 0x14),
                    ("WindowSize", 0x15),
                    ("Commands", 0x16),
                    ("Options", 0x17),
                    ("FilterType", 0x18),
                    ("Conflict", 0x1B),
                    ("Collections", 0x1C),
                    ("ApplicationData", 0x1D),
                    ("DeletesAsMoves", 0x1E),
                    ("Supported", 0x20),
                    ("SoftDelete", 0x21),
                    ("MIMESupport", 0x22),
                    ("MIMETruncation", 0x23),
                    ("Wait", 0x24),
                    ("Limit", 0x25),
                    ("Partial", 0x26),
                ],
            ),
            page(
                MOVE,
                "Move",
                &[
                    ("MoveItems", 0x05),
                    ("Move", 0x06),
                    ("SrcMsgId", 0x07),
                    ("SrcFldId", 0x08),
                    ("DstFldId", 0x09),
                    ("Response", 0x0A),
                    ("Status", 0x0B),
                    ("DstMsgId", 0x0C),
                ],
            ),
            page(
                FOLDER_HIERARCHY,
                "FolderHierarchy",
                &[
                    ("Folders", 0x05),
                    ("Folder", 0x06),
                    ("DisplayName", 0x07),
                    ("ServerId", 0x08),
                    ("ParentId", 0x09),
                    ("Type", 0x0A),
                    ("Status", 0x0C),
                    ("Changes", 0x0E),
                    ("Add", 0x0F),
                    ("Delete", 0x10),
                    ("Update", 0x11),
                    ("SyncKey", 0x12),
                    ("FolderCreate", 0x13),
                    ("FolderDelete", 0x14),
                    ("FolderUpdate", 0x15),
                    ("FolderSync", 0x16),
                    ("Count", 0x17),
                ],
            ),
            page(
                PROVISION,
                "Provision",
                &[
                    ("Provision", 0x05),
                    ("Policies", 0x06),
                    ("Policy", 0x07),
                    ("PolicyType", 0x08),
                    ("PolicyKey", 0x09),
                    ("Data", 0x0A),
                    ("Status", 0x0B),
                    ("RemoteWipe", 0x0C),
                    ("EASProvisionDoc", 0x0D),
                ],
            ),
            page(
                COMPOSE_MAIL,
                "ComposeMail",
                &[
                    ("SendMail", 0x05),
                    ("SmartForward", 0x06),
                    ("SmartReply", 0x07),
                    ("SaveInSentItems", 0x08),
                    ("ReplaceMime", 0x09),
                    ("Source", 0x0B),
                    ("FolderId", 0x0C),
                    ("ItemId", 0x0D),
                    ("LongId", 0x0E),
                    ("InstanceId", 0x0F),
                    ("Mime", 0x10),
                    ("ClientId", 0x11),
                    ("Status", 0x12),
                    ("AccountId", 0x13),
                ],
            ),
        ];

        Self::new(pages)
    }
}

fn page(id: u8, namespace: &str, tags: &[(&str, u8)]) -> CodePage {
    CodePage {
        id,
        namespace: namespace.to_string(),
        tags: tags.iter().map(|(n, t)| (n.to_string(), *t)).collect(),
    }
}
