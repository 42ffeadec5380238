//! Protocol commands: request trees and response parsing

use tracing::warn;

use crate::codec::tokens::{COMPOSE_MAIL, FOLDER_HIERARCHY, MOVE, PROVISION};
use crate::codec::WireNode;
use crate::error::{Result, SyncError};
use crate::pending::{OperationKind, PendingOperation, ServerCommand};

/// Folder hierarchy status codes
const FH_SUCCESS: u32 = 1;
const FH_FOLDER_EXISTS: u32 = 2;
const FH_NOT_FOUND: u32 = 4;
const FH_SERVER_ERROR: u32 = 6;
const FH_INVALID_SYNC_KEY: u32 = 9;
const FH_UNKNOWN_ERROR: u32 = 11;

/// MoveItems status codes
const MOVE_SUCCESS: u32 = 3;
const MOVE_FAILURE: u32 = 5;
const MOVE_LOCKED: u32 = 7;

/// SendMail status codes
const SEND_SERVER_ERROR: u32 = 111;

/// Statuses any command may return when the device must provision first
const DEVICE_NOT_PROVISIONED: u32 = 142;
const POLICY_REFRESH: u32 = 143;
const INVALID_POLICY_KEY: u32 = 144;

/// Provision status codes, for the whole response and for one policy
const PROV_SUCCESS: u32 = 1;
const PROV_SERVER_ERROR: u32 = 3;

pub const POLICY_TYPE: &str = "MS-EAS-Provisioning-WBXML";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    FolderSync {
        sync_key: String,
    },
    FolderCreate {
        sync_key: String,
        parent_id: String,
        display_name: String,
        folder_type: i32,
    },
    FolderUpdate {
        sync_key: String,
        server_id: String,
        parent_id: String,
        display_name: String,
    },
    FolderDelete {
        sync_key: String,
        server_id: String,
    },
    SendMail {
        client_id: String,
        mime: String,
    },
    MoveItems {
        item_id: String,
        src_folder: String,
        dest_folder: String,
    },
    /// Fetch the policy (`ack_key` None), then acknowledge it with the
    /// temporary key the server handed out
    Provision {
        ack_key: Option<String>,
    },
}

/// What a successful command told us
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    FolderSync {
        sync_key: String,
        commands: Vec<ServerCommand>,
    },
    FolderCreated {
        sync_key: String,
        server_id: String,
    },
    /// FolderUpdate or FolderDelete accepted
    FolderChanged {
        sync_key: String,
    },
    Sent,
    Moved {
        new_item_id: Option<String>,
    },
    Provisioned {
        policy_key: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Done(Response),
    /// Hierarchy sync key no longer recognised
    InvalidSyncKey,
    /// Server refused this operation for good
    Rejected(String),
    /// Server-side failure worth retrying
    ServerBusy(String),
    /// Device must provision before the server accepts commands
    ProvisionRequired(String),
}

fn required(op: &PendingOperation, value: &Option<String>, field: &str) -> Result<String> {
    value.clone().ok_or_else(|| {
        SyncError::InvalidState(format!("pending operation {} has no {}", op.id, field))
    })
}

fn status_of(node: &WireNode) -> Result<Option<u32>> {
    match node.child_text("Status") {
        None => Ok(None),
        Some(text) => text
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| SyncError::MalformedStream(format!("bad status {:?}", text))),
    }
}

fn expect_root<'a>(root: Option<&'a WireNode>, tag: &str) -> Result<&'a WireNode> {
    match root {
        Some(node) if node.tag == tag => Ok(node),
        Some(node) => Err(SyncError::MalformedStream(format!(
            "expected {} response, got {}",
            tag, node.tag
        ))),
        None => Err(SyncError::MalformedStream(format!("empty {} response", tag))),
    }
}

fn text_field(node: &WireNode, tag: &str) -> Result<String> {
    node.child_text(tag)
        .map(|s| s.to_string())
        .ok_or_else(|| SyncError::MalformedStream(format!("{} without {}", node.tag, tag)))
}

fn hierarchy_status(status: u32, command: &str) -> Reply {
    match status {
        FH_INVALID_SYNC_KEY => Reply::InvalidSyncKey,
        DEVICE_NOT_PROVISIONED | POLICY_REFRESH | INVALID_POLICY_KEY => {
            Reply::ProvisionRequired(format!("{} status {}", command, status))
        }
        FH_SERVER_ERROR | FH_UNKNOWN_ERROR => {
            Reply::ServerBusy(format!("{} status {}", command, status))
        }
        _ => Reply::Rejected(format!("{} status {}", command, status)),
    }
}

impl Command {
    /// The command that carries out a pending operation
    pub fn for_operation(op: &PendingOperation, sync_key: &str) -> Result<Self> {
        let sync_key = sync_key.to_string();
        let command = match op.kind {
            OperationKind::FolderCreate => Command::FolderCreate {
                sync_key,
                parent_id: required(op, &op.parent_id, "parent id")?,
                display_name: required(op, &op.display_name, "display name")?,
                folder_type: op.folder_type.unwrap_or_default(),
            },
            OperationKind::FolderUpdate => Command::FolderUpdate {
                sync_key,
                server_id: required(op, &op.server_id, "server id")?,
                parent_id: required(op, &op.parent_id, "parent id")?,
                display_name: required(op, &op.display_name, "display name")?,
            },
            OperationKind::FolderDelete => Command::FolderDelete {
                sync_key,
                server_id: required(op, &op.server_id, "server id")?,
            },
            OperationKind::ItemSend => Command::SendMail {
                client_id: required(op, &op.server_id, "client id")?,
                mime: op
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("mime"))
                    .and_then(|m| m.as_str())
                    .map(|m| m.to_string())
                    .ok_or_else(|| {
                        SyncError::InvalidState(format!("pending send {} has no mime", op.id))
                    })?,
            },
            OperationKind::ItemMove => Command::MoveItems {
                item_id: required(op, &op.server_id, "item id")?,
                src_folder: required(op, &op.parent_id, "source folder")?,
                dest_folder: required(op, &op.dest_parent_id, "destination folder")?,
            },
        };
        Ok(command)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::FolderSync { .. } => "FolderSync",
            Command::FolderCreate { .. } => "FolderCreate",
            Command::FolderUpdate { .. } => "FolderUpdate",
            Command::FolderDelete { .. } => "FolderDelete",
            Command::SendMail { .. } => "SendMail",
            Command::MoveItems { .. } => "MoveItems",
            Command::Provision { .. } => "Provision",
        }
    }

    pub fn to_wire(&self) -> WireNode {
        let fh = FOLDER_HIERARCHY;
        match self {
            Command::FolderSync { sync_key } => {
                WireNode::new(fh, "FolderSync").with_child(WireNode::text(fh, "SyncKey", sync_key))
            }
            Command::FolderCreate {
                sync_key,
                parent_id,
                display_name,
                folder_type,
            } => WireNode::new(fh, "FolderCreate")
                .with_child(WireNode::text(fh, "SyncKey", sync_key))
                .with_child(WireNode::text(fh, "ParentId", parent_id))
                .with_child(WireNode::text(fh, "DisplayName", display_name))
                .with_child(WireNode::text(fh, "Type", folder_type.to_string())),
            Command::FolderUpdate {
                sync_key,
                server_id,
                parent_id,
                display_name,
            } => WireNode::new(fh, "FolderUpdate")
                .with_child(WireNode::text(fh, "SyncKey", sync_key))
                .with_child(WireNode::text(fh, "ServerId", server_id))
                .with_child(WireNode::text(fh, "ParentId", parent_id))
                .with_child(WireNode::text(fh, "DisplayName", display_name)),
            Command::FolderDelete {
                sync_key,
                server_id,
            } => WireNode::new(fh, "FolderDelete")
                .with_child(WireNode::text(fh, "SyncKey", sync_key))
                .with_child(WireNode::text(fh, "ServerId", server_id)),
            Command::SendMail { client_id, mime } => WireNode::new(COMPOSE_MAIL, "SendMail")
                .with_child(WireNode::text(COMPOSE_MAIL, "ClientId", client_id))
                .with_child(WireNode::new(COMPOSE_MAIL, "SaveInSentItems"))
                .with_child(WireNode::opaque(
                    COMPOSE_MAIL,
                    "Mime",
                    mime.as_bytes().to_vec(),
                )),
            Command::MoveItems {
                item_id,
                src_folder,
                dest_folder,
            } => WireNode::new(MOVE, "MoveItems").with_child(
                WireNode::new(MOVE, "Move")
                    .with_child(WireNode::text(MOVE, "SrcMsgId", item_id))
                    .with_child(WireNode::text(MOVE, "SrcFldId", src_folder))
                    .with_child(WireNode::text(MOVE, "DstFldId", dest_folder)),
            ),
            Command::Provision { ack_key } => {
                let mut policy = WireNode::new(PROVISION, "Policy")
                    .with_child(WireNode::text(PROVISION, "PolicyType", POLICY_TYPE));
                if let Some(key) = ack_key {
                    policy = policy
                        .with_child(WireNode::text(PROVISION, "PolicyKey", key))
                        .with_child(WireNode::text(PROVISION, "Status", PROV_SUCCESS.to_string()));
                }
                WireNode::new(PROVISION, "Provision")
                    .with_child(WireNode::new(PROVISION, "Policies").with_child(policy))
            }
        }
    }

    /// Interpret a decoded 200 response. `root` is None for an empty body.
    pub fn parse_response(&self, root: Option<&WireNode>) -> Result<Reply> {
        match self {
            Command::FolderSync { .. } => parse_folder_sync(expect_root(root, "FolderSync")?),
            Command::FolderCreate { .. } => {
                let root = expect_root(root, "FolderCreate")?;
                match status_of(root)?.unwrap_or(FH_SUCCESS) {
                    FH_SUCCESS => Ok(Reply::Done(Response::FolderCreated {
                        sync_key: text_field(root, "SyncKey")?,
                        server_id: text_field(root, "ServerId")?,
                    })),
                    FH_FOLDER_EXISTS => Ok(Reply::Rejected("folder already exists".into())),
                    status => Ok(hierarchy_status(status, "FolderCreate")),
                }
            }
            Command::FolderUpdate { .. } => {
                let root = expect_root(root, "FolderUpdate")?;
                match status_of(root)?.unwrap_or(FH_SUCCESS) {
                    FH_SUCCESS => Ok(Reply::Done(Response::FolderChanged {
                        sync_key: text_field(root, "SyncKey")?,
                    })),
                    status => Ok(hierarchy_status(status, "FolderUpdate")),
                }
            }
            Command::FolderDelete { .. } => {
                let root = expect_root(root, "FolderDelete")?;
                match status_of(root)?.unwrap_or(FH_SUCCESS) {
                    // Already gone is as good as deleted
                    FH_SUCCESS | FH_NOT_FOUND => Ok(Reply::Done(Response::FolderChanged {
                        sync_key: root.child_text("SyncKey").unwrap_or_default().to_string(),
                    })),
                    status => Ok(hierarchy_status(status, "FolderDelete")),
                }
            }
            Command::SendMail { .. } => {
                let Some(root) = root else {
                    return Ok(Reply::Done(Response::Sent));
                };
                let root = expect_root(Some(root), "SendMail")?;
                match status_of(root)? {
                    None | Some(FH_SUCCESS) => Ok(Reply::Done(Response::Sent)),
                    Some(SEND_SERVER_ERROR) => {
                        Ok(Reply::ServerBusy(format!("SendMail status {}", SEND_SERVER_ERROR)))
                    }
                    Some(status @ (DEVICE_NOT_PROVISIONED | POLICY_REFRESH | INVALID_POLICY_KEY)) => {
                        Ok(Reply::ProvisionRequired(format!("SendMail status {}", status)))
                    }
                    Some(status) => Ok(Reply::Rejected(format!("SendMail status {}", status))),
                }
            }
            Command::MoveItems { .. } => {
                let root = expect_root(root, "MoveItems")?;
                let response = root.child("Response").ok_or_else(|| {
                    SyncError::MalformedStream("MoveItems without Response".into())
                })?;
                match status_of(response)? {
                    Some(status @ (DEVICE_NOT_PROVISIONED | POLICY_REFRESH | INVALID_POLICY_KEY)) => {
                        Ok(Reply::ProvisionRequired(format!("MoveItems status {}", status)))
                    }
                    Some(MOVE_SUCCESS) => Ok(Reply::Done(Response::Moved {
                        new_item_id: response.child_text("DstMsgId").map(|s| s.to_string()),
                    })),
                    Some(status @ (MOVE_FAILURE | MOVE_LOCKED)) => {
                        Ok(Reply::ServerBusy(format!("MoveItems status {}", status)))
                    }
                    Some(status) => Ok(Reply::Rejected(format!("MoveItems status {}", status))),
                    None => Err(SyncError::MalformedStream("MoveItems without Status".into())),
                }
            }
            Command::Provision { .. } => parse_provision(expect_root(root, "Provision")?),
        }
    }
}

fn parse_provision(root: &WireNode) -> Result<Reply> {
    match status_of(root)? {
        Some(PROV_SUCCESS) => {}
        Some(PROV_SERVER_ERROR) => {
            return Ok(Reply::ServerBusy(format!("Provision status {}", PROV_SERVER_ERROR)))
        }
        Some(status) => return Ok(Reply::Rejected(format!("Provision status {}", status))),
        None => return Err(SyncError::MalformedStream("Provision without Status".into())),
    }

    let Some(policy) = root.path(&["Policies", "Policy"]) else {
        return Ok(Reply::Done(Response::Provisioned { policy_key: None }));
    };
    match status_of(policy)? {
        None | Some(PROV_SUCCESS) => {}
        Some(status) => return Ok(Reply::Rejected(format!("Policy status {}", status))),
    }
    if let Some(policy_type) = policy.child_text("PolicyType") {
        if policy_type != POLICY_TYPE {
            warn!("Unexpected policy type {}", policy_type);
        }
    }
    Ok(Reply::Done(Response::Provisioned {
        policy_key: policy.child_text("PolicyKey").map(|s| s.to_string()),
    }))
}

fn parse_folder_sync(root: &WireNode) -> Result<Reply> {
    match status_of(root)?.unwrap_or(FH_SUCCESS) {
        FH_SUCCESS => {}
        status => return Ok(hierarchy_status(status, "FolderSync")),
    }

    let sync_key = text_field(root, "SyncKey")?;
    let mut commands = Vec::new();

    if let Some(changes) = root.child("Changes") {
        for change in &changes.children {
            match change.tag.as_str() {
                "Add" | "Update" => {
                    let server_id = text_field(change, "ServerId")?;
                    let parent_id = text_field(change, "ParentId")?;
                    let display_name = text_field(change, "DisplayName")?;
                    let folder_type = text_field(change, "Type")?
                        .trim()
                        .parse::<i32>()
                        .map_err(|_| SyncError::MalformedStream("bad folder type".into()))?;
                    commands.push(if change.tag == "Add" {
                        ServerCommand::FolderAdd {
                            server_id,
                            parent_id,
                            display_name,
                            folder_type,
                        }
                    } else {
                        ServerCommand::FolderUpdate {
                            server_id,
                            parent_id,
                            display_name,
                            folder_type,
                        }
                    });
                }
                "Delete" => commands.push(ServerCommand::FolderDelete {
                    server_id: text_field(change, "ServerId")?,
                }),
                _ => {}
            }
        }
    }

    Ok(Reply::Done(Response::FolderSync { sync_key, commands }))
}
