//! Per-account protocol control engine
//!
//! One [`ProtocolControl`] runs per account. Its state machine decides what
//! to do next (discover configuration, wait for the owner, pick a command,
//! idle, back off) and every network round trip runs on a tokio task that
//! reports back by posting an event. Actions never wait on the network.
//!
//! ```text
//! Start -Launch-> Disc -Success-> Exec -Park-> Idle -PendQ/Timer-> Exec
//!                  |               |  \-TempFail/Defer-> Wait -Timer-> Exec
//!                  |               |  \-ReProv-> Exec (Provision first)
//!                  |               \-AuthFail-> CredW -CredUpdated-> Disc
//!                  \-ServConfFail-> ServConfW -ConfigUpdated-> Disc
//! ```
//!
//! Disc resolves the server's host name before anything is sent. A server
//! that answers 449, or a provisioning status, gets a policy fetch and
//! acknowledgement before the interrupted work is picked again.
//!
//! Any HardFail lands in Stop; only an explicit `start` leaves it.

pub mod commands;
pub mod owner;

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::{Blob, Decoder, Encoder, TokenTable};
use crate::config::{CodecConfig, EngineConfig};
use crate::error::{Result, SyncError};
use crate::fsm::{
    Action, Event, EventCode, Node, StateCode, StateMachine, StateObserver, EV_HARD_FAIL,
    EV_LAST, EV_LAUNCH, EV_SUCCESS, EV_TEMP_FAIL, ST_LAST, ST_START, ST_STOP,
};
use crate::health::{CommHealthTracker, CommQuality};
use crate::pending::{
    apply_rules, folder_subtree, DeferOutcome, OperationKind, PendingOperation, PendingQueue,
    Reconciler, Resolution, RewriteRule,
};
use crate::services::logger::fmt_ms;
use crate::store::{StoreTx, SyncStore};
use crate::transport::{Transport, TransportRequest, TransportResponse, CONTENT_TYPE_WBXML};
use crate::types::{Credential, Folder, ProtocolState, ServerRecord};

pub use commands::{Command, Reply, Response};
pub use owner::{ChannelOwner, OwnerEvent, ProtocolOwner};

pub const ST_DISC: StateCode = ST_LAST + 1;
pub const ST_CRED_W: StateCode = ST_LAST + 2;
pub const ST_SERV_CONF_W: StateCode = ST_LAST + 3;
pub const ST_EXEC: StateCode = ST_LAST + 4;
pub const ST_IDLE: StateCode = ST_LAST + 5;
pub const ST_WAIT: StateCode = ST_LAST + 6;

pub const EV_REJECTION: EventCode = EV_LAST + 1;
pub const EV_CRED_UPDATED: EventCode = EV_LAST + 2;
pub const EV_CONFIG_UPDATED: EventCode = EV_LAST + 3;
pub const EV_AUTH_FAIL: EventCode = EV_LAST + 4;
pub const EV_SERV_CONF_FAIL: EventCode = EV_LAST + 5;
pub const EV_PEND_Q: EventCode = EV_LAST + 6;
pub const EV_PARK: EventCode = EV_LAST + 7;
pub const EV_DEFER: EventCode = EV_LAST + 8;
pub const EV_TIMER: EventCode = EV_LAST + 9;
pub const EV_CANCELLED: EventCode = EV_LAST + 10;
pub const EV_REPROV: EventCode = EV_LAST + 11;

const STATES: [(StateCode, &str); 6] = [
    (ST_DISC, "Disc"),
    (ST_CRED_W, "CredW"),
    (ST_SERV_CONF_W, "ServConfW"),
    (ST_EXEC, "Exec"),
    (ST_IDLE, "Idle"),
    (ST_WAIT, "Wait"),
];

const EVENTS: [(EventCode, &str); 11] = [
    (EV_REJECTION, "Rejection"),
    (EV_CRED_UPDATED, "CredUpdated"),
    (EV_CONFIG_UPDATED, "ConfigUpdated"),
    (EV_AUTH_FAIL, "AuthFail"),
    (EV_SERV_CONF_FAIL, "ServConfFail"),
    (EV_PEND_Q, "PendQ"),
    (EV_PARK, "Park"),
    (EV_DEFER, "Defer"),
    (EV_TIMER, "Timer"),
    (EV_CANCELLED, "Cancelled"),
    (EV_REPROV, "ReProv"),
];

const ALL_EVENTS: [EventCode; 15] = [
    EV_LAUNCH,
    EV_SUCCESS,
    EV_HARD_FAIL,
    EV_TEMP_FAIL,
    EV_REJECTION,
    EV_CRED_UPDATED,
    EV_CONFIG_UPDATED,
    EV_AUTH_FAIL,
    EV_SERV_CONF_FAIL,
    EV_PEND_Q,
    EV_PARK,
    EV_DEFER,
    EV_TIMER,
    EV_CANCELLED,
    EV_REPROV,
];

/// Everything an engine shares with its siblings
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn SyncStore>,
    pub tracker: Arc<CommHealthTracker>,
    pub transport: Arc<dyn Transport>,
    pub owner: Arc<dyn ProtocolOwner>,
    pub tokens: Arc<TokenTable>,
    pub engine: EngineConfig,
    pub codec: CodecConfig,
}

type EngineSlot = Arc<OnceLock<Weak<ProtocolControl>>>;

/// A unit of work picked for execution
#[derive(Debug, Clone)]
enum Work {
    FolderSync,
    Provision { ack_key: Option<String> },
    Operation(PendingOperation),
}

impl Work {
    fn operation(&self) -> Option<&PendingOperation> {
        match self {
            Work::Operation(op) => Some(op),
            Work::FolderSync | Work::Provision { .. } => None,
        }
    }
}

/// Where a provisioning exchange stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProvisionStep {
    Fetch,
    Acknowledge,
}

enum Outcome {
    Success,
    /// Sync key was reset; go again without counting a retry
    Retry,
    Rejected(SyncError),
    TempFail(SyncError),
    AuthFail(SyncError),
    /// Server wants the device provisioned before anything else
    Reprovision(String),
    /// Server told us to rediscover its configuration
    ServConfFail(String),
    HardFail(SyncError),
    Cancelled,
}

struct InFlight {
    generation: u64,
    cancel: CancellationToken,
}

pub struct ProtocolControl {
    account_id: String,
    device_id: String,
    me: Weak<ProtocolControl>,
    sm: StateMachine,
    ctx: EngineContext,
    queue: PendingQueue,
    runtime: Handle,
    generation: AtomicU64,
    in_flight: Mutex<Option<InFlight>>,
    timer: Mutex<Option<CancellationToken>>,
    provision: Mutex<Option<ProvisionStep>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn bind(slot: &EngineSlot, action: fn(&ProtocolControl, &Event)) -> Action {
    let slot = slot.clone();
    Arc::new(move |event: &Event| {
        if let Some(engine) = slot.get().and_then(|weak| weak.upgrade()) {
            action(&engine, event);
        }
    })
}

/// A node handling `on`, dropping `drop` and declaring every other event
/// invalid
fn node(state: StateCode, on: Vec<(EventCode, Action, StateCode)>, drop: &[EventCode]) -> Node {
    let mut node = Node::new(state);
    let mut covered = drop.to_vec();
    for (event, action, next) in on {
        covered.push(event);
        node = node.on(event, action, next);
    }
    let invalid: Vec<EventCode> = ALL_EVENTS
        .iter()
        .copied()
        .filter(|e| !covered.contains(e))
        .collect();
    node.drop(drop).invalid(&invalid)
}

fn transition_table(slot: &EngineSlot) -> Vec<Node> {
    let disc = bind(slot, ProtocolControl::do_disc);
    let pick = bind(slot, ProtocolControl::do_pick);
    let idle = bind(slot, ProtocolControl::do_idle);
    let wait = bind(slot, ProtocolControl::do_wait);
    let cred = bind(slot, ProtocolControl::do_cred_request);
    let serv = bind(slot, ProtocolControl::do_serv_conf_request);
    let hard = bind(slot, ProtocolControl::do_hard_fail);

    vec![
        node(
            ST_START,
            vec![(EV_LAUNCH, disc.clone(), ST_DISC)],
            &[
                EV_PEND_Q,
                EV_CRED_UPDATED,
                EV_CONFIG_UPDATED,
                EV_TIMER,
                EV_CANCELLED,
            ],
        ),
        node(
            ST_DISC,
            vec![
                (EV_SUCCESS, pick.clone(), ST_EXEC),
                (EV_TEMP_FAIL, wait.clone(), ST_WAIT),
                (EV_CANCELLED, idle.clone(), ST_IDLE),
                (EV_AUTH_FAIL, cred.clone(), ST_CRED_W),
                (EV_SERV_CONF_FAIL, serv.clone(), ST_SERV_CONF_W),
                (EV_HARD_FAIL, hard.clone(), ST_STOP),
            ],
            &[
                EV_LAUNCH,
                EV_PEND_Q,
                EV_CRED_UPDATED,
                EV_CONFIG_UPDATED,
                EV_TIMER,
            ],
        ),
        node(
            ST_EXEC,
            vec![
                (EV_SUCCESS, pick.clone(), ST_EXEC),
                (EV_REJECTION, pick.clone(), ST_EXEC),
                (EV_REPROV, pick.clone(), ST_EXEC),
                (EV_PARK, idle.clone(), ST_IDLE),
                (EV_CANCELLED, idle, ST_IDLE),
                (EV_TEMP_FAIL, wait.clone(), ST_WAIT),
                (EV_DEFER, wait, ST_WAIT),
                (EV_AUTH_FAIL, cred, ST_CRED_W),
                (EV_SERV_CONF_FAIL, serv, ST_SERV_CONF_W),
                (EV_HARD_FAIL, hard, ST_STOP),
            ],
            &[
                EV_LAUNCH,
                EV_PEND_Q,
                EV_CRED_UPDATED,
                EV_CONFIG_UPDATED,
                EV_TIMER,
            ],
        ),
        node(
            ST_IDLE,
            vec![
                (EV_PEND_Q, pick.clone(), ST_EXEC),
                (EV_TIMER, pick.clone(), ST_EXEC),
                (EV_CRED_UPDATED, disc.clone(), ST_DISC),
                (EV_CONFIG_UPDATED, disc.clone(), ST_DISC),
            ],
            &[EV_LAUNCH],
        ),
        node(
            ST_WAIT,
            vec![
                (EV_TIMER, pick, ST_EXEC),
                (EV_CRED_UPDATED, disc.clone(), ST_DISC),
                (EV_CONFIG_UPDATED, disc.clone(), ST_DISC),
            ],
            &[EV_LAUNCH, EV_PEND_Q],
        ),
        node(
            ST_CRED_W,
            vec![
                (EV_CRED_UPDATED, disc.clone(), ST_DISC),
                (EV_CONFIG_UPDATED, disc.clone(), ST_DISC),
            ],
            &[EV_LAUNCH, EV_PEND_Q, EV_TIMER],
        ),
        node(
            ST_SERV_CONF_W,
            vec![
                (EV_CRED_UPDATED, disc.clone(), ST_DISC),
                (EV_CONFIG_UPDATED, disc, ST_DISC),
            ],
            &[EV_LAUNCH, EV_PEND_Q, EV_TIMER],
        ),
    ]
}

fn state_observer(slot: &EngineSlot) -> StateObserver {
    let slot = slot.clone();
    Box::new(move |_old, new| {
        if let Some(engine) = slot.get().and_then(|weak| weak.upgrade()) {
            engine.persist_state(new);
        }
    })
}

fn load_state(tx: &mut dyn StoreTx, account_id: &str) -> Result<ProtocolState> {
    Ok(tx
        .protocol_state(account_id)?
        .unwrap_or_else(|| ProtocolState::new(account_id)))
}

fn missing_credentials(mnemonic: &'static str) -> Event {
    Event::new(EV_AUTH_FAIL, mnemonic)
        .with_message("no credentials")
        .with_arg(SyncError::AuthenticationRequired("no credentials stored".into()))
}

/// Spread retries from many accounts over up to a quarter of `base`
fn jittered(base: Duration) -> Duration {
    let spread = base.as_millis() as u64 / 4;
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// Resolve an operation unless a local edit or server delta already
/// removed it. Returns whether it was still queued.
fn resolve_if_present(
    tx: &mut dyn StoreTx,
    id: i64,
    resolution: Resolution,
    error: Option<&str>,
) -> Result<bool> {
    if tx.pending(id)?.is_none() {
        debug!(op_id = id, "Operation already reconciled away");
        return Ok(false);
    }
    PendingQueue::resolve_in(tx, id, resolution, error)?;
    Ok(true)
}

impl ProtocolControl {
    /// Build the engine for one account. Must be called inside a tokio
    /// runtime. Operations left Dispatched by a previous run go back to
    /// Eligible.
    pub fn new(account_id: &str, ctx: EngineContext) -> Result<Arc<Self>> {
        let runtime = Handle::try_current().map_err(|e| {
            SyncError::Configuration(format!("protocol engine needs a tokio runtime: {}", e))
        })?;

        let slot: EngineSlot = Arc::new(OnceLock::new());
        let sm = StateMachine::new(
            &format!("PC/{}", account_id),
            &EVENTS,
            &STATES,
            transition_table(&slot),
        )?
        .with_state_change_observer(state_observer(&slot));

        let queue = PendingQueue::new(ctx.store.clone(), account_id, ctx.engine.max_retries);
        queue.reset_dispatched()?;

        let device_id: String = account_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();

        let engine = Arc::new_cyclic(|me: &Weak<Self>| {
            let _ = slot.set(me.clone());
            Self {
                account_id: account_id.to_string(),
                device_id: format!("eddie{}", device_id),
                me: me.clone(),
                sm,
                ctx,
                queue,
                runtime,
                generation: AtomicU64::new(0),
                in_flight: Mutex::new(None),
                timer: Mutex::new(None),
                provision: Mutex::new(None),
            }
        });

        debug!(account = account_id, "Protocol engine created");
        Ok(engine)
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn state(&self) -> StateCode {
        self.sm.state()
    }

    pub fn state_name(&self) -> String {
        self.sm.state_name(self.sm.state()).to_string()
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.state(), ST_START | ST_STOP)
    }

    /// Start the engine. No-op while it is already running.
    pub fn start(&self) -> Result<()> {
        if self.is_running() {
            debug!(account = %self.account_id, "Engine already running");
            return Ok(());
        }
        info!(account = %self.account_id, "Starting protocol engine");
        self.sm.start(ST_START)
    }

    /// Start if stopped, otherwise look for work now
    pub fn execute(&self) -> Result<()> {
        if !self.is_running() {
            return self.start();
        }
        self.post(Event::new(EV_PEND_Q, "execute"));
        Ok(())
    }

    /// Abort the in-flight command, if any. Its operation goes back to
    /// Eligible and the engine idles.
    pub fn cancel(&self) -> bool {
        match lock(&self.in_flight).as_ref() {
            Some(in_flight) => {
                info!(account = %self.account_id, "Cancelling in-flight command");
                in_flight.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// The owner stored new credentials for this account
    pub fn cred_updated(&self) {
        self.post(Event::new(EV_CRED_UPDATED, "cred_updated"));
    }

    /// The owner stored new server configuration for this account
    pub fn config_updated(&self) {
        self.post(Event::new(EV_CONFIG_UPDATED, "config_updated"));
    }

    /// Stop without reporting a failure
    pub fn shutdown(&self) {
        info!(account = %self.account_id, "Shutting down protocol engine");
        self.halt();
    }

    // ========== Local edits ==========

    /// Create a folder locally under a provisional id and queue the create
    pub fn create_folder(
        &self,
        parent_id: &str,
        display_name: &str,
        folder_type: i32,
    ) -> Result<Folder> {
        let provisional = format!("local-{}", Uuid::new_v4());
        let mut folder = Folder::new(
            &self.account_id,
            &provisional,
            parent_id,
            display_name,
            folder_type,
        );
        folder.awaiting_create = true;
        let op = PendingOperation::folder_create(
            &self.account_id,
            &provisional,
            parent_id,
            display_name,
            folder_type,
        );

        let folder = self.ctx.store.run_in_transaction(|tx| {
            let folder = tx.insert_folder(&folder)?;
            PendingQueue::enqueue_in(tx, &op)?;
            Ok(folder)
        })?;

        info!(account = %self.account_id, folder = %provisional, "Folder created locally");
        self.post(Event::new(EV_PEND_Q, "create_folder"));
        Ok(folder)
    }

    /// Rename and/or move a folder
    pub fn update_folder(&self, server_id: &str, parent_id: &str, display_name: &str) -> Result<()> {
        let account_id = self.account_id.clone();
        self.ctx.store.run_in_transaction(|tx| {
            let mut folder = tx
                .folder(&account_id, server_id)?
                .ok_or_else(|| SyncError::NotFound(format!("folder {}", server_id)))?;
            folder.parent_id = parent_id.to_string();
            folder.display_name = display_name.to_string();
            tx.update_folder(&folder)?;
            PendingQueue::enqueue_in(
                tx,
                &PendingOperation::folder_update(&account_id, server_id, parent_id, display_name),
            )?;
            Ok(())
        })?;

        self.post(Event::new(EV_PEND_Q, "update_folder"));
        Ok(())
    }

    /// Delete a folder and everything below it. Queued operations on the
    /// subtree become moot; a folder the server never saw needs no delete.
    pub fn delete_folder(&self, server_id: &str) -> Result<()> {
        let account_id = self.account_id.clone();
        self.ctx.store.run_in_transaction(|tx| {
            let folder = tx
                .folder(&account_id, server_id)?
                .ok_or_else(|| SyncError::NotFound(format!("folder {}", server_id)))?;

            let doomed = folder_subtree(tx, &account_id, server_id)?;
            let rules: Vec<RewriteRule> = doomed
                .iter()
                .flat_map(|id| RewriteRule::cancel_everywhere(id))
                .collect();
            apply_rules(tx, &account_id, &rules)?;

            for id in &doomed {
                for item in tx.items_in_folder(&account_id, id)? {
                    tx.delete_item(&account_id, item.server_id())?;
                }
                tx.delete_folder(&account_id, id)?;
            }

            if !folder.awaiting_create {
                PendingQueue::enqueue_in(tx, &PendingOperation::folder_delete(&account_id, server_id))?;
            }
            Ok(())
        })?;

        self.post(Event::new(EV_PEND_Q, "delete_folder"));
        Ok(())
    }

    /// Queue an outgoing message
    pub fn send_item(&self, mime: &str) -> Result<PendingOperation> {
        let client_id = Uuid::new_v4().simple().to_string();
        let op = self.queue.enqueue(&PendingOperation::item_send(
            &self.account_id,
            &client_id,
            mime,
        ))?;
        self.post(Event::new(EV_PEND_Q, "send_item"));
        Ok(op)
    }

    /// Move a message to another folder
    pub fn move_item(&self, item_id: &str, dest_folder: &str) -> Result<()> {
        let account_id = self.account_id.clone();
        let queued = self.ctx.store.run_in_transaction(|tx| {
            let item = tx
                .item(&account_id, item_id)?
                .ok_or_else(|| SyncError::NotFound(format!("item {}", item_id)))?;
            if item.parent_id == dest_folder {
                return Ok(false);
            }
            tx.move_item(&account_id, item_id, dest_folder)?;
            PendingQueue::enqueue_in(
                tx,
                &PendingOperation::item_move(&account_id, item_id, &item.parent_id, dest_folder),
            )?;
            Ok(true)
        })?;

        if queued {
            self.post(Event::new(EV_PEND_Q, "move_item"));
        }
        Ok(())
    }

    // ========== Actions ==========

    /// Check the stored configuration, then resolve the server off the
    /// state machine's thread
    fn do_disc(&self, _event: &Event) {
        self.cancel_timer();
        let account_id = self.account_id.clone();
        let loaded = self.ctx.store.run_in_transaction(|tx| {
            Ok((tx.server_record(&account_id)?, tx.credential(&account_id)?))
        });

        let event = match loaded {
            Err(e) => Event::new(EV_HARD_FAIL, "disc").with_arg(e),
            Ok((None, _)) => Event::new(EV_SERV_CONF_FAIL, "disc").with_message("no server"),
            Ok((Some(server), _)) if server.url().is_err() => {
                Event::new(EV_SERV_CONF_FAIL, "disc").with_message("unusable server url")
            }
            Ok((_, None)) => missing_credentials("disc"),
            Ok((Some(server), Some(_))) => match self.discover(server.host) {
                Ok(()) => return,
                Err(e) => Event::new(EV_HARD_FAIL, "disc").with_arg(e),
            },
        };
        self.post(event);
    }

    fn do_pick(&self, _event: &Event) {
        self.cancel_timer();
        match self.pick() {
            Ok(Some(event)) => self.post(event),
            Ok(None) => {}
            Err(e) => self.post(Event::new(EV_HARD_FAIL, "pick").with_arg(e)),
        }
    }

    fn do_idle(&self, _event: &Event) {
        let delay = self.next_sync_delay();
        debug!(account = %self.account_id, "Idle, next folder sync in {}", fmt_ms(delay));
        self.schedule_timer(delay);
    }

    fn do_wait(&self, event: &Event) {
        let host = self.server_host();
        let delay = host
            .as_deref()
            .and_then(|h| self.ctx.tracker.delay_remaining(h))
            .unwrap_or_else(|| jittered(self.ctx.engine.default_backoff()));
        info!(
            account = %self.account_id,
            reason = event.message.as_deref().unwrap_or(""),
            "Backing off for {}",
            fmt_ms(delay)
        );
        self.schedule_timer(delay);
    }

    fn do_cred_request(&self, event: &Event) {
        let err = event.arg::<SyncError>().cloned().unwrap_or_else(|| {
            SyncError::AuthenticationRequired(
                event
                    .message
                    .clone()
                    .unwrap_or_else(|| "credentials required".to_string()),
            )
        });
        warn!(account = %self.account_id, "{}", err);
        self.ctx.owner.cred_request(&self.account_id, &err);
    }

    fn do_serv_conf_request(&self, _event: &Event) {
        self.ctx.owner.serv_conf_request(&self.account_id);
    }

    fn do_hard_fail(&self, event: &Event) {
        self.cancel_timer();
        let err = event.arg::<SyncError>().cloned().unwrap_or_else(|| {
            SyncError::HardProtocol(
                event
                    .message
                    .clone()
                    .unwrap_or_else(|| "hard failure".to_string()),
            )
        });
        error!(account = %self.account_id, "Protocol engine stopped: {}", err);
        self.ctx.owner.hard_failure_indication(&self.account_id, &err);
    }

    // ========== Discovery ==========

    fn discover(&self, host: String) -> Result<()> {
        let engine = self
            .me
            .upgrade()
            .ok_or_else(|| SyncError::InvalidState("engine dropped".into()))?;
        let cancel = CancellationToken::new();
        let generation = self.begin_in_flight(cancel.clone());
        debug!(account = %self.account_id, host = %host, "Resolving server");

        self.runtime.spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(SyncError::Cancelled),
                result = engine.ctx.transport.resolve(&host) => result,
            };
            let event = engine.discovered(&host, result);
            if engine.end_in_flight(generation) {
                engine.post(event);
            } else {
                debug!(account = %engine.account_id, "Dropping result of a superseded lookup");
            }
        });
        Ok(())
    }

    fn discovered(&self, host: &str, result: Result<Vec<IpAddr>>) -> Event {
        match result {
            Ok(addresses) if addresses.is_empty() => Event::new(EV_SERV_CONF_FAIL, "disc")
                .with_message(format!("{} has no addresses", host)),
            Ok(addresses) => {
                debug!(account = %self.account_id, host, count = addresses.len(), "Server resolved");
                Event::new(EV_SUCCESS, "disc")
            }
            Err(SyncError::Cancelled) => Event::new(EV_CANCELLED, "disc"),
            Err(SyncError::NotFound(reason)) => {
                Event::new(EV_SERV_CONF_FAIL, "disc").with_message(reason)
            }
            Err(e) if e.is_transient() => {
                self.ctx.tracker.report(host, false);
                Event::new(EV_TEMP_FAIL, "disc").with_message(e.to_string())
            }
            Err(e) => Event::new(EV_HARD_FAIL, "disc")
                .with_message(e.to_string())
                .with_arg(e),
        }
    }

    // ========== Picking and dispatching ==========

    /// Choose the next command and dispatch it. Returns the event to raise
    /// when nothing was dispatched.
    fn pick(&self) -> Result<Option<Event>> {
        let account_id = self.account_id.clone();
        let (server, credential, state) = self.ctx.store.run_in_transaction(|tx| {
            Ok((
                tx.server_record(&account_id)?,
                tx.credential(&account_id)?,
                load_state(tx, &account_id)?,
            ))
        })?;

        let Some(server) = server else {
            return Ok(Some(Event::new(EV_SERV_CONF_FAIL, "pick")));
        };
        let Some(credential) = credential else {
            return Ok(Some(missing_credentials("pick")));
        };

        let step = *lock(&self.provision);
        let work = if let Some(step) = step {
            Work::Provision {
                ack_key: match step {
                    ProvisionStep::Fetch => None,
                    ProvisionStep::Acknowledge => Some(state.policy_key.clone()),
                },
            }
        } else if state.has_initial_sync_key() {
            Work::FolderSync
        } else if let Some(op) = self.queue.next_eligible(None)? {
            Work::Operation(op)
        } else if self.sync_due(&state) {
            Work::FolderSync
        } else {
            return Ok(Some(Event::new(EV_PARK, "pick")));
        };

        let host = server.host.clone();
        if let Some(delay) = self.ctx.tracker.delay_remaining(&host) {
            return Ok(Some(
                Event::new(EV_DEFER, "pick").with_message(format!("server delay {}", fmt_ms(delay))),
            ));
        }
        if self.ctx.tracker.quality(&host) == CommQuality::Unusable {
            return Ok(Some(Event::new(EV_DEFER, "pick").with_message("server unusable")));
        }
        if self.ctx.tracker.is_rate_limited(&host) {
            return Ok(Some(Event::new(EV_DEFER, "pick").with_message("throttled")));
        }

        self.dispatch(work, server, credential, state)
    }

    fn dispatch(
        &self,
        work: Work,
        server: ServerRecord,
        credential: Credential,
        state: ProtocolState,
    ) -> Result<Option<Event>> {
        let command = match &work {
            Work::FolderSync => Command::FolderSync {
                sync_key: state.sync_key.clone(),
            },
            Work::Provision { ack_key } => Command::Provision {
                ack_key: ack_key.clone(),
            },
            Work::Operation(op) => match Command::for_operation(op, &state.sync_key) {
                Ok(command) => command,
                Err(e) => {
                    // Unsendable; fail it so it does not block the queue
                    warn!(op_id = op.id, "Dropping unsendable operation: {}", e);
                    self.queue.mark_dispatched(op.id)?;
                    self.queue.resolve_hard_fail(op.id, &e.to_string())?;
                    self.ctx.owner.soft_failure_indication(&self.account_id, &e);
                    return Ok(Some(Event::new(EV_REJECTION, "dispatch")));
                }
            },
        };

        let url = server.url()?;
        let body = Encoder::new(&self.ctx.tokens)
            .encode_spooled(&command.to_wire(), self.ctx.codec.spool_threshold)?;

        if let Some(op) = work.operation() {
            self.queue.mark_dispatched(op.id)?;
        }

        let request = TransportRequest {
            url,
            command: command.name().to_string(),
            device_id: self.device_id.clone(),
            protocol_version: state.protocol_version.clone(),
            policy_key: state.policy_key.clone(),
            credential: Some(credential),
            content_type: CONTENT_TYPE_WBXML,
            body,
            spool_threshold: self.ctx.codec.spool_threshold,
        };

        let engine = self
            .me
            .upgrade()
            .ok_or_else(|| SyncError::InvalidState("engine dropped".into()))?;
        let cancel = CancellationToken::new();
        let generation = self.begin_in_flight(cancel.clone());
        let host = server.host;

        info!(account = %self.account_id, command = command.name(), "Dispatching command");

        self.runtime.spawn(async move {
            let result = engine.ctx.transport.send(request, cancel.clone()).await;
            let event = engine.complete(&work, &command, &host, result, &cancel);
            if engine.end_in_flight(generation) {
                engine.post(event);
            } else {
                debug!(account = %engine.account_id, "Dropping result of a superseded command");
            }
        });

        Ok(None)
    }

    // ========== Completion ==========

    fn complete(
        &self,
        work: &Work,
        command: &Command,
        host: &str,
        result: Result<TransportResponse>,
        cancel: &CancellationToken,
    ) -> Event {
        let outcome = match result {
            Err(SyncError::Cancelled) => Outcome::Cancelled,
            Err(e) if e.is_transient() => {
                self.ctx.tracker.report(host, false);
                Outcome::TempFail(e)
            }
            Err(e) => {
                self.ctx.tracker.report(host, false);
                Outcome::HardFail(e)
            }
            Ok(response) => self.classify(work, command, host, response, cancel),
        };
        self.settle(work, command, outcome)
    }

    fn classify(
        &self,
        work: &Work,
        command: &Command,
        host: &str,
        response: TransportResponse,
        cancel: &CancellationToken,
    ) -> Outcome {
        match response.status {
            200 => {
                self.ctx.tracker.report(host, true);
                match self.interpret(work, command, &response.body, cancel) {
                    Ok(outcome) => outcome,
                    Err(SyncError::Cancelled) => Outcome::Cancelled,
                    Err(e) => Outcome::HardFail(e),
                }
            }
            401 | 403 => {
                self.ctx.tracker.report(host, true);
                Outcome::AuthFail(SyncError::AuthenticationRequired(format!(
                    "{} returned HTTP {}",
                    command.name(),
                    response.status
                )))
            }
            449 => {
                self.ctx.tracker.report(host, true);
                Outcome::Reprovision(format!("{} returned HTTP 449", command.name()))
            }
            451 => {
                self.ctx.tracker.report(host, true);
                Outcome::ServConfFail(format!("{} returned HTTP 451", command.name()))
            }
            503 => {
                self.ctx.tracker.report(host, false);
                if let Some(delay) = response.retry_after {
                    self.ctx.tracker.report_delay(host, delay);
                }
                Outcome::TempFail(SyncError::TransientNetwork(format!(
                    "{} returned HTTP 503",
                    command.name()
                )))
            }
            status @ 500..=599 => {
                self.ctx.tracker.report(host, false);
                Outcome::TempFail(SyncError::TransientNetwork(format!(
                    "{} returned HTTP {}",
                    command.name(),
                    status
                )))
            }
            status => {
                self.ctx.tracker.report(host, true);
                Outcome::Rejected(SyncError::HardProtocol(format!(
                    "{} returned HTTP {}",
                    command.name(),
                    status
                )))
            }
        }
    }

    fn interpret(
        &self,
        work: &Work,
        command: &Command,
        body: &Blob,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let root = if body.is_empty() {
            None
        } else {
            Some(
                Decoder::new(&self.ctx.tokens)
                    .with_cancel(cancel)
                    .with_spool_threshold(self.ctx.codec.spool_threshold)
                    .decode(body.reader()?)?,
            )
        };

        match command.parse_response(root.as_ref())? {
            Reply::Done(response) => {
                self.apply_response(work, response)?;
                if let Work::Provision { ack_key } = work {
                    *lock(&self.provision) = match ack_key {
                        None => Some(ProvisionStep::Acknowledge),
                        Some(_) => None,
                    };
                }
                Ok(Outcome::Success)
            }
            Reply::InvalidSyncKey => {
                self.reset_sync_key()?;
                Ok(Outcome::Retry)
            }
            Reply::Rejected(reason) => Ok(Outcome::Rejected(SyncError::HardProtocol(reason))),
            Reply::ServerBusy(reason) => Ok(Outcome::TempFail(SyncError::TransientNetwork(reason))),
            Reply::ProvisionRequired(reason) => Ok(Outcome::Reprovision(reason)),
        }
    }

    /// Fold a successful response into queue and model, in one transaction
    fn apply_response(&self, work: &Work, response: Response) -> Result<()> {
        let account_id = self.account_id.clone();
        let op = work.operation();

        self.ctx.store.run_in_transaction(|tx| {
            let mut state = load_state(tx, &account_id)?;

            match response {
                Response::FolderSync { sync_key, commands } => {
                    for command in &commands {
                        Reconciler::new(tx, &account_id).apply(command)?;
                    }
                    info!(
                        account = %account_id,
                        changes = commands.len(),
                        sync_key = %sync_key,
                        "Folder hierarchy synced"
                    );
                    state.sync_key = sync_key;
                    state.last_folder_sync = Some(Utc::now());
                }
                Response::FolderCreated {
                    sync_key,
                    server_id,
                } => {
                    // A folder deleted locally mid-create shows up again on
                    // the next folder sync
                    let live = match op {
                        Some(op) => resolve_if_present(tx, op.id, Resolution::Success, None)?,
                        None => false,
                    };
                    if let Some(op) = op.filter(|_| live) {
                        if let Some(provisional) = op.server_id.as_deref() {
                            tx.rewrite_folder_id(&account_id, provisional, &server_id)?;
                            apply_rules(
                                tx,
                                &account_id,
                                &RewriteRule::replace_everywhere(provisional, &server_id),
                            )?;
                        }
                        if let Some(mut folder) = tx.folder(&account_id, &server_id)? {
                            folder.awaiting_create = false;
                            tx.update_folder(&folder)?;
                        }
                        info!(account = %account_id, server_id = %server_id, "Folder created on server");
                    }
                    state.sync_key = sync_key;
                }
                Response::FolderChanged { sync_key } => {
                    if let Some(op) = op {
                        resolve_if_present(tx, op.id, Resolution::Success, None)?;
                    }
                    if !sync_key.is_empty() {
                        state.sync_key = sync_key;
                    }
                }
                Response::Sent => {
                    if let Some(op) = op {
                        resolve_if_present(tx, op.id, Resolution::Success, None)?;
                    }
                }
                Response::Provisioned { policy_key } => match policy_key {
                    Some(key) => {
                        info!(account = %account_id, "Policy key updated");
                        state.policy_key = key;
                    }
                    None if matches!(work, Work::Provision { ack_key: None }) => {
                        return Err(SyncError::HardProtocol(
                            "policy fetch returned no policy key".into(),
                        ));
                    }
                    None => {}
                },
                Response::Moved { new_item_id } => {
                    if let Some(op) = op {
                        resolve_if_present(tx, op.id, Resolution::Success, None)?;
                        if let (Some(old), Some(new)) = (op.server_id.as_deref(), new_item_id) {
                            if old != new {
                                tx.rewrite_item_id(&account_id, old, &new)?;
                                apply_rules(
                                    tx,
                                    &account_id,
                                    &RewriteRule::replace_everywhere(old, &new),
                                )?;
                            }
                        }
                    }
                }
            }

            tx.save_protocol_state(&state)
        })
    }

    fn reset_sync_key(&self) -> Result<()> {
        let account_id = self.account_id.clone();
        self.ctx.store.run_in_transaction(|tx| {
            let mut state = load_state(tx, &account_id)?;
            if state.has_initial_sync_key() {
                return Err(SyncError::HardProtocol(
                    "server rejected the initial sync key".into(),
                ));
            }
            state.reset_sync_key();
            warn!(
                account = %account_id,
                epoch = state.folder_sync_epoch,
                "Sync key rejected, restarting folder hierarchy"
            );
            tx.save_protocol_state(&state)
        })
    }

    /// Update the queue for the outcome and produce the event to post
    fn settle(&self, work: &Work, command: &Command, outcome: Outcome) -> Event {
        let mnemonic = command.name();
        match outcome {
            Outcome::Success => Event::new(EV_SUCCESS, mnemonic),
            Outcome::Retry => {
                self.release(work);
                Event::new(EV_SUCCESS, mnemonic).with_message("sync key reset")
            }
            Outcome::Cancelled => {
                self.release(work);
                Event::new(EV_CANCELLED, mnemonic)
            }
            Outcome::AuthFail(err) => {
                self.release(work);
                Event::new(EV_AUTH_FAIL, mnemonic)
                    .with_message(err.to_string())
                    .with_arg(err)
            }
            Outcome::Reprovision(reason) => {
                self.release(work);
                if matches!(work, Work::Provision { .. }) {
                    let err = SyncError::HardProtocol(format!(
                        "provisioning demanded while provisioning: {}",
                        reason
                    ));
                    return Event::new(EV_HARD_FAIL, mnemonic)
                        .with_message(err.to_string())
                        .with_arg(err);
                }
                if let Err(e) = self.require_provisioning() {
                    return Event::new(EV_HARD_FAIL, mnemonic)
                        .with_message(e.to_string())
                        .with_arg(e);
                }
                Event::new(EV_REPROV, mnemonic).with_message(reason)
            }
            Outcome::ServConfFail(reason) => {
                self.release(work);
                Event::new(EV_SERV_CONF_FAIL, mnemonic).with_message(reason)
            }
            Outcome::HardFail(err) => {
                self.release(work);
                Event::new(EV_HARD_FAIL, mnemonic)
                    .with_message(err.to_string())
                    .with_arg(err)
            }
            Outcome::TempFail(err) => {
                if let Some(op) = work.operation() {
                    match self.queue.defer(op.id, &err.to_string()) {
                        Ok(DeferOutcome::Deferred(_)) => {}
                        Ok(DeferOutcome::Exhausted(op)) => {
                            self.ctx.owner.soft_failure_indication(
                                &self.account_id,
                                &SyncError::HardProtocol(format!(
                                    "{} gave up after {} attempts: {}",
                                    op.kind.as_str(),
                                    op.retry_count,
                                    err
                                )),
                            );
                        }
                        Err(e) => debug!(op_id = op.id, "Could not defer operation: {}", e),
                    }
                }
                Event::new(EV_TEMP_FAIL, mnemonic).with_message(err.to_string())
            }
            Outcome::Rejected(err) => match work {
                Work::FolderSync | Work::Provision { .. } => Event::new(EV_HARD_FAIL, mnemonic)
                    .with_message(err.to_string())
                    .with_arg(err),
                Work::Operation(op) => {
                    warn!(account = %self.account_id, op_id = op.id, "Operation rejected: {}", err);
                    if let Err(e) = self.reject(op, &err) {
                        return Event::new(EV_HARD_FAIL, mnemonic)
                            .with_message(e.to_string())
                            .with_arg(e);
                    }
                    self.ctx.owner.soft_failure_indication(&self.account_id, &err);
                    Event::new(EV_REJECTION, mnemonic).with_message(err.to_string())
                }
            },
        }
    }

    /// Drop the policy key and fetch a fresh policy before anything else
    fn require_provisioning(&self) -> Result<()> {
        let account_id = self.account_id.clone();
        self.ctx.store.run_in_transaction(|tx| {
            let mut state = load_state(tx, &account_id)?;
            state.reset_policy_key();
            tx.save_protocol_state(&state)
        })?;
        info!(account = %self.account_id, "Server requires provisioning");
        *lock(&self.provision) = Some(ProvisionStep::Fetch);
        Ok(())
    }

    fn release(&self, work: &Work) {
        if let Some(op) = work.operation() {
            if let Err(e) = self.queue.release(op.id) {
                debug!(op_id = op.id, "Could not release operation: {}", e);
            }
        }
    }

    /// Fail an operation for good and undo its local effect
    fn reject(&self, op: &PendingOperation, err: &SyncError) -> Result<()> {
        let account_id = self.account_id.clone();
        let message = err.to_string();
        self.ctx.store.run_in_transaction(|tx| {
            resolve_if_present(tx, op.id, Resolution::HardFail, Some(&message))?;

            match op.kind {
                OperationKind::FolderCreate => {
                    if let Some(provisional) = op.server_id.as_deref() {
                        let doomed = folder_subtree(tx, &account_id, provisional)?;
                        let rules: Vec<RewriteRule> = doomed
                            .iter()
                            .flat_map(|id| RewriteRule::cancel_everywhere(id))
                            .collect();
                        apply_rules(tx, &account_id, &rules)?;
                        for id in &doomed {
                            for item in tx.items_in_folder(&account_id, id)? {
                                tx.delete_item(&account_id, item.server_id())?;
                            }
                            tx.delete_folder(&account_id, id)?;
                        }
                    }
                }
                OperationKind::ItemMove => {
                    if let (Some(item_id), Some(src)) =
                        (op.server_id.as_deref(), op.parent_id.as_deref())
                    {
                        if tx.item(&account_id, item_id)?.is_some() {
                            tx.move_item(&account_id, item_id, src)?;
                        }
                    }
                }
                OperationKind::FolderUpdate
                | OperationKind::FolderDelete
                | OperationKind::ItemSend => {}
            }
            Ok(())
        })
    }

    // ========== Plumbing ==========

    /// Post an event. A table defect halts the engine and is reported to
    /// the owner as a hard failure.
    fn post(&self, event: Event) {
        if let Err(err) = self.sm.post_event(event) {
            error!(account = %self.account_id, "Protocol engine halted: {}", err);
            self.halt();
            self.ctx.owner.hard_failure_indication(&self.account_id, &err);
        }
    }

    fn halt(&self) {
        self.cancel_timer();
        if let Some(in_flight) = lock(&self.in_flight).take() {
            in_flight.cancel.cancel();
        }
        self.sm.set_state(ST_STOP);
        self.persist_state(ST_STOP);
    }

    fn persist_state(&self, state: StateCode) {
        let account_id = self.account_id.clone();
        let result = self.ctx.store.run_in_transaction(|tx| {
            let mut protocol = load_state(tx, &account_id)?;
            protocol.fsm_state = state;
            tx.save_protocol_state(&protocol)
        });
        if let Err(e) = result {
            warn!(account = %self.account_id, "Failed to persist engine state: {}", e);
        }
    }

    fn begin_in_flight(&self, cancel: CancellationToken) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        *lock(&self.in_flight) = Some(InFlight { generation, cancel });
        generation
    }

    /// Clear the in-flight slot if it still belongs to `generation`
    fn end_in_flight(&self, generation: u64) -> bool {
        let mut in_flight = lock(&self.in_flight);
        match in_flight.as_ref() {
            Some(current) if current.generation == generation => {
                *in_flight = None;
                true
            }
            _ => false,
        }
    }

    fn schedule_timer(&self, delay: Duration) {
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.timer).replace(token.clone()) {
            previous.cancel();
        }
        let weak = self.me.clone();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(engine) = weak.upgrade() {
                        engine.post(Event::new(EV_TIMER, "timer"));
                    }
                }
            }
        });
    }

    fn cancel_timer(&self) {
        if let Some(token) = lock(&self.timer).take() {
            token.cancel();
        }
    }

    fn server_host(&self) -> Option<String> {
        let account_id = self.account_id.clone();
        self.ctx
            .store
            .run_in_transaction(|tx| tx.server_record(&account_id))
            .ok()
            .flatten()
            .map(|server| server.host)
    }

    fn sync_due(&self, state: &ProtocolState) -> bool {
        match state.last_folder_sync {
            None => true,
            Some(last) => (Utc::now() - last)
                .to_std()
                .map_or(false, |elapsed| elapsed >= self.ctx.engine.sync_interval()),
        }
    }

    fn next_sync_delay(&self) -> Duration {
        let interval = self.ctx.engine.sync_interval();
        let account_id = self.account_id.clone();
        let last = self
            .ctx
            .store
            .run_in_transaction(|tx| tx.protocol_state(&account_id))
            .ok()
            .flatten()
            .and_then(|state| state.last_folder_sync);

        match last {
            None => interval,
            Some(last) => {
                let elapsed = (Utc::now() - last).to_std().unwrap_or(Duration::ZERO);
                interval.saturating_sub(elapsed)
            }
        }
    }
}

impl Drop for ProtocolControl {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}
