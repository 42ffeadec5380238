//! Callbacks from a protocol engine to whoever runs it

use tracing::warn;

use crate::error::SyncError;

/// Receives per-account requests and failure reports from an engine.
///
/// Called from engine actions, so implementations must not block.
pub trait ProtocolOwner: Send + Sync {
    /// Credentials are missing or were rejected; `error` is always
    /// `SyncError::AuthenticationRequired`
    fn cred_request(&self, account_id: &str, error: &SyncError);

    /// No usable server configuration
    fn serv_conf_request(&self, account_id: &str);

    /// The engine stopped; it needs an explicit start to run again
    fn hard_failure_indication(&self, account_id: &str, error: &SyncError);

    /// A single operation failed; the engine keeps going
    fn soft_failure_indication(&self, account_id: &str, error: &SyncError);
}

#[derive(Debug, Clone)]
pub enum OwnerEvent {
    CredRequest { account_id: String, error: SyncError },
    ServConfRequest { account_id: String },
    HardFailure { account_id: String, error: SyncError },
    SoftFailure { account_id: String, error: SyncError },
}

impl OwnerEvent {
    pub fn account_id(&self) -> &str {
        match self {
            OwnerEvent::CredRequest { account_id, .. }
            | OwnerEvent::ServConfRequest { account_id }
            | OwnerEvent::HardFailure { account_id, .. }
            | OwnerEvent::SoftFailure { account_id, .. } => account_id,
        }
    }
}

/// Forwards every callback, in order, to a flume channel
#[derive(Clone)]
pub struct ChannelOwner {
    tx: flume::Sender<OwnerEvent>,
}

impl ChannelOwner {
    pub fn new() -> (Self, flume::Receiver<OwnerEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }

    fn send(&self, event: OwnerEvent) {
        if self.tx.send(event).is_err() {
            warn!("Owner event dropped, receiver is gone");
        }
    }
}

impl ProtocolOwner for ChannelOwner {
    fn cred_request(&self, account_id: &str, error: &SyncError) {
        self.send(OwnerEvent::CredRequest {
            account_id: account_id.to_string(),
            error: error.clone(),
        });
    }

    fn serv_conf_request(&self, account_id: &str) {
        self.send(OwnerEvent::ServConfRequest {
            account_id: account_id.to_string(),
        });
    }

    fn hard_failure_indication(&self, account_id: &str, error: &SyncError) {
        self.send(OwnerEvent::HardFailure {
            account_id: account_id.to_string(),
            error: error.clone(),
        });
    }

    fn soft_failure_indication(&self, account_id: &str, error: &SyncError) {
        self.send(OwnerEvent::SoftFailure {
            account_id: account_id.to_string(),
            error: error.clone(),
        });
    }
}
