//! Table-driven finite state machine
//!
//! A machine is built from a list of [`Node`]s, one per state. Each node says,
//! for every event the machine knows, exactly one of:
//! - `on`: run an action and move to a target state
//! - `drop`: consume the event and log it, no transition
//! - `invalid`: the event cannot happen in this state; raising it is a defect
//!
//! Construction validates that coverage, so a missing entry is caught before
//! the machine ever runs. Events are queued and drained one at a time by
//! whichever caller found the machine idle; an event posted from inside an
//! action (or from another thread) is appended and processed after the
//! current transition completes.

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, info};

use crate::error::{Result, SyncError};

pub type EventCode = u32;
pub type StateCode = u32;

/// Events every machine understands. Machine-specific codes start at
/// [`EV_LAST`] + 1.
pub const EV_LAUNCH: EventCode = 0;
pub const EV_SUCCESS: EventCode = 1;
pub const EV_HARD_FAIL: EventCode = 2;
pub const EV_TEMP_FAIL: EventCode = 3;
pub const EV_LAST: EventCode = EV_TEMP_FAIL;

/// States every machine has. Machine-specific codes start at [`ST_LAST`] + 1.
pub const ST_START: StateCode = 0;
pub const ST_STOP: StateCode = 1;
pub const ST_LAST: StateCode = ST_STOP;

const RESERVED_EVENTS: [(EventCode, &str); 4] = [
    (EV_LAUNCH, "Launch"),
    (EV_SUCCESS, "Success"),
    (EV_HARD_FAIL, "HardFail"),
    (EV_TEMP_FAIL, "TempFail"),
];

const RESERVED_STATES: [(StateCode, &str); 2] = [(ST_START, "Start"), (ST_STOP, "Stop")];

static NEXT_MACHINE_ID: AtomicU64 = AtomicU64::new(1);

/// Something that happened, fed to a machine
#[derive(Clone)]
pub struct Event {
    pub code: EventCode,
    /// Where the event was raised, for logs only
    pub mnemonic: String,
    pub arg: Option<Arc<dyn Any + Send + Sync>>,
    pub message: Option<String>,
}

impl Event {
    pub fn new(code: EventCode, mnemonic: impl Into<String>) -> Self {
        Self {
            code,
            mnemonic: mnemonic.into(),
            arg: None,
            message: None,
        }
    }

    pub fn with_arg<T: Any + Send + Sync>(mut self, arg: T) -> Self {
        self.arg = Some(Arc::new(arg));
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Borrow the argument if it has type `T`
    pub fn arg<T: Any>(&self) -> Option<&T> {
        self.arg.as_ref().and_then(|a| a.downcast_ref::<T>())
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("code", &self.code)
            .field("mnemonic", &self.mnemonic)
            .field("has_arg", &self.arg.is_some())
            .field("message", &self.message)
            .finish()
    }
}

pub type Action = Arc<dyn Fn(&Event) + Send + Sync>;
pub type StateObserver = Box<dyn Fn(StateCode, StateCode) + Send + Sync>;

/// An action that does nothing
pub fn no_op() -> Action {
    Arc::new(|_: &Event| {})
}

struct Trans {
    event: EventCode,
    action: Action,
    state: StateCode,
}

/// The transitions, drops and invalid events of one state
pub struct Node {
    state: StateCode,
    on: Vec<Trans>,
    drop: Vec<EventCode>,
    invalid: Vec<EventCode>,
}

impl Node {
    pub fn new(state: StateCode) -> Self {
        Self {
            state,
            on: Vec::new(),
            drop: Vec::new(),
            invalid: Vec::new(),
        }
    }

    pub fn on(mut self, event: EventCode, action: Action, next: StateCode) -> Self {
        self.on.push(Trans {
            event,
            action,
            state: next,
        });
        self
    }

    pub fn drop(mut self, events: &[EventCode]) -> Self {
        self.drop.extend_from_slice(events);
        self
    }

    pub fn invalid(mut self, events: &[EventCode]) -> Self {
        self.invalid.extend_from_slice(events);
        self
    }
}

struct Inner {
    state: StateCode,
    queue: VecDeque<Event>,
    in_process: bool,
}

pub struct StateMachine {
    name: String,
    id: u64,
    nodes: HashMap<StateCode, Node>,
    event_names: HashMap<EventCode, String>,
    state_names: HashMap<StateCode, String>,
    inner: Mutex<Inner>,
    state_change: Option<StateObserver>,
    transition: Option<StateObserver>,
}

impl StateMachine {
    /// Build and validate a machine.
    ///
    /// `events` and `states` name the machine-specific codes; the reserved
    /// ones are always present.
    pub fn new(
        name: &str,
        events: &[(EventCode, &str)],
        states: &[(StateCode, &str)],
        table: Vec<Node>,
    ) -> Result<Self> {
        let mut event_names: HashMap<EventCode, String> = RESERVED_EVENTS
            .iter()
            .map(|(c, n)| (*c, n.to_string()))
            .collect();
        for (code, mnemonic) in events {
            if event_names.insert(*code, mnemonic.to_string()).is_some() {
                return Err(SyncError::Configuration(format!(
                    "SM({}): event code {} declared twice",
                    name, code
                )));
            }
        }

        let mut state_names: HashMap<StateCode, String> = RESERVED_STATES
            .iter()
            .map(|(c, n)| (*c, n.to_string()))
            .collect();
        for (code, mnemonic) in states {
            if state_names.insert(*code, mnemonic.to_string()).is_some() {
                return Err(SyncError::Configuration(format!(
                    "SM({}): state code {} declared twice",
                    name, code
                )));
            }
        }

        let mut nodes = HashMap::new();
        for node in table {
            if !state_names.contains_key(&node.state) {
                return Err(SyncError::Configuration(format!(
                    "SM({}): node for undeclared state {}",
                    name, node.state
                )));
            }
            if nodes.contains_key(&node.state) {
                return Err(SyncError::Configuration(format!(
                    "SM({}): state {} has more than one node",
                    name, state_names[&node.state]
                )));
            }
            nodes.insert(node.state, node);
        }

        let machine = Self {
            name: name.to_string(),
            id: NEXT_MACHINE_ID.fetch_add(1, Ordering::Relaxed),
            nodes,
            event_names,
            state_names,
            inner: Mutex::new(Inner {
                state: ST_START,
                queue: VecDeque::new(),
                in_process: false,
            }),
            state_change: None,
            transition: None,
        };
        machine.validate()?;
        Ok(machine)
    }

    /// Called with (old, new) after a transition that changed the state
    pub fn with_state_change_observer(mut self, observer: StateObserver) -> Self {
        self.state_change = Some(observer);
        self
    }

    /// Called with (old, new) after every transition
    pub fn with_transition_observer(mut self, observer: StateObserver) -> Self {
        self.transition = Some(observer);
        self
    }

    fn validate(&self) -> Result<()> {
        for node in self.nodes.values() {
            let state_name = self.state_name(node.state);
            let mut seen: HashSet<EventCode> = HashSet::new();
            let listed = node
                .on
                .iter()
                .map(|t| t.event)
                .chain(node.drop.iter().copied())
                .chain(node.invalid.iter().copied());

            for event in listed {
                if !self.event_names.contains_key(&event) {
                    return Err(SyncError::Configuration(format!(
                        "SM({}): state {} lists unknown event {}",
                        self.name, state_name, event
                    )));
                }
                if !seen.insert(event) {
                    return Err(SyncError::Configuration(format!(
                        "SM({}): state {} lists event {} more than once",
                        self.name,
                        state_name,
                        self.event_name(event)
                    )));
                }
            }

            for event in self.event_names.keys() {
                if !seen.contains(event) {
                    return Err(SyncError::Configuration(format!(
                        "SM({}): state {} does not handle event {}",
                        self.name,
                        state_name,
                        self.event_name(*event)
                    )));
                }
            }

            for trans in &node.on {
                if trans.state != ST_STOP && !self.nodes.contains_key(&trans.state) {
                    return Err(SyncError::Configuration(format!(
                        "SM({}): state {} on {} targets undeclared state {}",
                        self.name,
                        state_name,
                        self.event_name(trans.event),
                        trans.state
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> StateCode {
        self.lock().state
    }

    /// Force the current state without a transition, e.g. when restoring
    /// a persisted machine
    pub fn set_state(&self, state: StateCode) {
        self.lock().state = state;
    }

    pub fn state_name(&self, state: StateCode) -> &str {
        self.state_names
            .get(&state)
            .map(|s| s.as_str())
            .unwrap_or("?")
    }

    pub fn event_name(&self, event: EventCode) -> &str {
        self.event_names
            .get(&event)
            .map(|s| s.as_str())
            .unwrap_or("?")
    }

    /// Set the state and post Launch
    pub fn start(&self, initial: StateCode) -> Result<()> {
        self.set_state(initial);
        self.post_event(Event::new(EV_LAUNCH, "SMSTART"))
    }

    pub fn post_event(&self, event: Event) -> Result<()> {
        self.post_events(vec![event])
    }

    /// Enqueue several events back to back; nothing else can slip between them
    pub fn post_events(&self, events: Vec<Event>) -> Result<()> {
        {
            let mut inner = self.lock();
            inner.queue.extend(events);
            if inner.in_process {
                // Whoever is draining will get to these
                return Ok(());
            }
            inner.in_process = true;
        }
        self.drain()
    }

    /// Discard queued events. Meant to be called from within an action.
    pub fn clear_event_queue(&self) {
        self.lock().queue.clear();
    }

    pub fn queue_depth(&self) -> usize {
        self.lock().queue.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn drain(&self) -> Result<()> {
        let _guard = DrainGuard { machine: self };
        loop {
            let (event, state) = {
                let mut inner = self.lock();
                match inner.queue.pop_front() {
                    Some(event) => (event, inner.state),
                    None => {
                        inner.in_process = false;
                        return Ok(());
                    }
                }
            };

            let prefix = format!(
                "SM({}:{}): S={} & E={}/{}",
                self.name,
                self.id,
                self.state_name(state),
                self.event_name(event.code),
                event.mnemonic
            );

            if state == ST_STOP {
                info!("{} => DROPPED IN Stop", prefix);
                continue;
            }

            let Some(node) = self.nodes.get(&state) else {
                return self.fail(format!("{} => NO NODE FOR STATE", prefix));
            };

            if node.drop.contains(&event.code) {
                debug!("{} => DROPPED EVENT", prefix);
                continue;
            }

            if node.invalid.contains(&event.code) {
                return self.fail(format!("{} => INVALID EVENT", prefix));
            }

            let Some(trans) = node.on.iter().find(|t| t.event == event.code) else {
                return self.fail(format!("{} => NO TRANSITION", prefix));
            };

            match &event.message {
                Some(message) => info!(
                    "{} => S={} ({})",
                    prefix,
                    self.state_name(trans.state),
                    message
                ),
                None => info!("{} => S={}", prefix, self.state_name(trans.state)),
            }

            (trans.action)(&event);

            let old = {
                let mut inner = self.lock();
                std::mem::replace(&mut inner.state, trans.state)
            };

            if let Some(observer) = &self.transition {
                observer(old, trans.state);
            }
            if old != trans.state {
                if let Some(observer) = &self.state_change {
                    observer(old, trans.state);
                }
            }
        }
    }

    fn fail(&self, message: String) -> Result<()> {
        error!("{}", message);
        let mut inner = self.lock();
        inner.queue.clear();
        inner.in_process = false;
        Err(SyncError::UnhandledEvent(message))
    }
}

/// Releases the drain flag when an action unwinds, so the next post can
/// drain instead of queueing forever
struct DrainGuard<'a> {
    machine: &'a StateMachine,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("SM({}:{}): action panicked", self.machine.name, self.machine.id);
            let mut inner = self.machine.lock();
            inner.queue.clear();
            inner.in_process = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::OnceLock;

    const EV_A: EventCode = EV_LAST + 1;
    const EV_B: EventCode = EV_LAST + 2;

    const ST_ONE: StateCode = ST_LAST + 1;
    const ST_TWO: StateCode = ST_LAST + 2;

    const EVENTS: [(EventCode, &str); 2] = [(EV_A, "A"), (EV_B, "B")];
    const STATES: [(StateCode, &str); 2] = [(ST_ONE, "One"), (ST_TWO, "Two")];

    fn all_but(node: Node, covered: &[EventCode]) -> Node {
        let rest: Vec<EventCode> = [EV_LAUNCH, EV_SUCCESS, EV_HARD_FAIL, EV_TEMP_FAIL, EV_A, EV_B]
            .into_iter()
            .filter(|e| !covered.contains(e))
            .collect();
        node.invalid(&rest)
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> Action) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let make = move |tag: &'static str| -> Action {
            let l = l.clone();
            Arc::new(move |_ev: &Event| l.lock().expect("log lock").push(tag.to_string()))
        };
        (log, make)
    }

    #[test]
    fn test_incomplete_table_fails_construction() {
        let table = vec![Node::new(ST_START).on(EV_LAUNCH, no_op(), ST_ONE)];
        let result = StateMachine::new("test", &EVENTS, &STATES, table);
        assert!(matches!(result, Err(SyncError::Configuration(_))));
    }

    #[test]
    fn test_event_listed_twice_fails_construction() {
        let table = vec![all_but(
            Node::new(ST_START)
                .on(EV_LAUNCH, no_op(), ST_START)
                .drop(&[EV_LAUNCH]),
            &[EV_LAUNCH],
        )];
        let result = StateMachine::new("test", &EVENTS, &STATES, table);
        assert!(matches!(result, Err(SyncError::Configuration(_))));
    }

    #[test]
    fn test_undeclared_target_fails_construction() {
        // ST_TWO is a known state but has no node
        let table = vec![all_but(
            Node::new(ST_START).on(EV_LAUNCH, no_op(), ST_TWO),
            &[EV_LAUNCH],
        )];
        let result = StateMachine::new("test", &EVENTS, &STATES, table);
        assert!(matches!(result, Err(SyncError::Configuration(_))));
    }

    #[test]
    fn test_event_raised_in_action_runs_after_it() {
        let (log, make) = recorder();
        let machine: Arc<OnceLock<StateMachine>> = Arc::new(OnceLock::new());

        let m = machine.clone();
        let a_log = make("A");
        let on_a: Action = Arc::new(move |ev| {
            if let Some(sm) = m.get() {
                sm.post_event(Event::new(EV_B, "from-A"))
                    .expect("nested post");
                // Not processed yet: we are still inside A's action
                assert_eq!(sm.queue_depth(), 1);
            }
            a_log(ev);
        });

        let table = vec![
            all_but(
                Node::new(ST_START)
                    .on(EV_LAUNCH, no_op(), ST_ONE)
                    .drop(&[EV_A, EV_B]),
                &[EV_LAUNCH, EV_A, EV_B],
            ),
            all_but(
                Node::new(ST_ONE).on(EV_A, on_a, ST_TWO).drop(&[EV_B]),
                &[EV_A, EV_B],
            ),
            all_but(
                Node::new(ST_TWO)
                    .on(EV_B, make("B"), ST_STOP)
                    .drop(&[EV_A]),
                &[EV_A, EV_B],
            ),
        ];

        let sm = StateMachine::new("nested", &EVENTS, &STATES, table).expect("valid table");
        if machine.set(sm).is_err() {
            panic!("machine already set");
        }
        let sm = machine.get().expect("machine");

        sm.start(ST_START).expect("start");
        assert_eq!(sm.state(), ST_ONE);

        sm.post_event(Event::new(EV_A, "test")).expect("post A");
        assert_eq!(*log.lock().expect("log lock"), vec!["A", "B"]);
        assert_eq!(sm.state(), ST_STOP);
    }

    #[test]
    fn test_invalid_event_fails_fast() {
        let table = vec![
            all_but(
                Node::new(ST_START).on(EV_LAUNCH, no_op(), ST_ONE),
                &[EV_LAUNCH],
            ),
            all_but(Node::new(ST_ONE).on(EV_A, no_op(), ST_ONE), &[EV_A]),
        ];
        let sm = StateMachine::new("invalid", &EVENTS, &STATES, table).expect("valid table");
        sm.start(ST_START).expect("start");

        let result = sm.post_event(Event::new(EV_B, "test"));
        assert!(matches!(result, Err(SyncError::UnhandledEvent(_))));
        assert_eq!(sm.queue_depth(), 0);

        // The machine is usable again afterwards
        sm.post_event(Event::new(EV_A, "test")).expect("post A");
        assert_eq!(sm.state(), ST_ONE);
    }

    #[test]
    fn test_dropped_event_keeps_state() {
        let (log, make) = recorder();
        let table = vec![
            all_but(
                Node::new(ST_START).on(EV_LAUNCH, no_op(), ST_ONE),
                &[EV_LAUNCH],
            ),
            all_but(
                Node::new(ST_ONE).on(EV_A, make("A"), ST_ONE).drop(&[EV_B]),
                &[EV_A, EV_B],
            ),
        ];
        let sm = StateMachine::new("drop", &EVENTS, &STATES, table).expect("valid table");
        sm.start(ST_START).expect("start");

        sm.post_event(Event::new(EV_B, "test")).expect("post B");
        assert_eq!(sm.state(), ST_ONE);
        assert!(log.lock().expect("log lock").is_empty());
    }

    #[test]
    fn test_events_in_stop_are_dropped() {
        let table = vec![all_but(
            Node::new(ST_START).on(EV_LAUNCH, no_op(), ST_STOP),
            &[EV_LAUNCH],
        )];
        let sm = StateMachine::new("stop", &EVENTS, &STATES, table).expect("valid table");
        sm.start(ST_START).expect("start");
        assert_eq!(sm.state(), ST_STOP);

        // B is invalid in Start, but Stop accepts and drops everything
        sm.post_event(Event::new(EV_B, "test")).expect("post in stop");
        assert_eq!(sm.state(), ST_STOP);
    }

    #[test]
    fn test_post_events_and_observers() {
        let (log, make) = recorder();
        let changes = Arc::new(AtomicUsize::new(0));
        let transitions = Arc::new(AtomicUsize::new(0));

        let table = vec![
            all_but(
                Node::new(ST_START).on(EV_LAUNCH, no_op(), ST_ONE),
                &[EV_LAUNCH],
            ),
            all_but(
                Node::new(ST_ONE)
                    .on(EV_A, make("A"), ST_ONE)
                    .on(EV_B, make("B"), ST_TWO),
                &[EV_A, EV_B],
            ),
            all_but(
                Node::new(ST_TWO).on(EV_A, make("A2"), ST_ONE).drop(&[EV_B]),
                &[EV_A, EV_B],
            ),
        ];

        let c = changes.clone();
        let t = transitions.clone();
        let sm = StateMachine::new("seq", &EVENTS, &STATES, table)
            .expect("valid table")
            .with_state_change_observer(Box::new(move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .with_transition_observer(Box::new(move |_, _| {
                t.fetch_add(1, Ordering::SeqCst);
            }));

        sm.start(ST_START).expect("start");
        sm.post_events(vec![
            Event::new(EV_A, "1"),
            Event::new(EV_B, "2"),
            Event::new(EV_A, "3"),
        ])
        .expect("post sequence");

        assert_eq!(*log.lock().expect("log lock"), vec!["A", "B", "A2"]);
        assert_eq!(sm.state(), ST_ONE);
        // Launch, A (self loop), B, A2
        assert_eq!(transitions.load(Ordering::SeqCst), 4);
        // Start->One, One->Two, Two->One
        assert_eq!(changes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_concurrent_posts_are_serialized() {
        let active = Arc::new(AtomicUsize::new(0));
        let count = Arc::new(AtomicUsize::new(0));

        let a = active.clone();
        let c = count.clone();
        let on_a: Action = Arc::new(move |_: &Event| {
            assert_eq!(a.fetch_add(1, Ordering::SeqCst), 0, "overlapping actions");
            std::thread::yield_now();
            c.fetch_add(1, Ordering::SeqCst);
            a.fetch_sub(1, Ordering::SeqCst);
        });

        let table = vec![
            all_but(
                Node::new(ST_START).on(EV_LAUNCH, no_op(), ST_ONE),
                &[EV_LAUNCH],
            ),
            all_but(Node::new(ST_ONE).on(EV_A, on_a, ST_ONE), &[EV_A]),
        ];
        let sm = Arc::new(StateMachine::new("mt", &EVENTS, &STATES, table).expect("valid table"));
        sm.start(ST_START).expect("start");

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sm = sm.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        sm.post_event(Event::new(EV_A, "thread")).expect("post");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread panicked");
        }

        // Posting returns once queued; the last drainer empties the queue
        assert_eq!(count.load(Ordering::SeqCst), 200);
        assert_eq!(sm.queue_depth(), 0);
    }

    #[test]
    fn test_event_arg() {
        let ev = Event::new(EV_A, "test").with_arg(42u32).with_message("hi");
        assert_eq!(ev.arg::<u32>(), Some(&42));
        assert_eq!(ev.arg::<String>(), None);
        assert_eq!(ev.message.as_deref(), Some("hi"));
    }

    #[test]
    fn test_panicking_action_does_not_wedge() {
        let (log, make) = recorder();
        let on_b: Action = Arc::new(|_: &Event| panic!("action failed"));
        let table = vec![
            all_but(
                Node::new(ST_START).on(EV_LAUNCH, no_op(), ST_ONE),
                &[EV_LAUNCH],
            ),
            all_but(
                Node::new(ST_ONE)
                    .on(EV_A, make("A"), ST_ONE)
                    .on(EV_B, on_b, ST_TWO),
                &[EV_A, EV_B],
            ),
            all_but(Node::new(ST_TWO).on(EV_A, make("A2"), ST_ONE), &[EV_A]),
        ];
        let sm = StateMachine::new("panic", &EVENTS, &STATES, table).expect("valid table");
        sm.start(ST_START).expect("start");

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            sm.post_events(vec![Event::new(EV_B, "boom"), Event::new(EV_A, "queued")])
        }));
        assert!(result.is_err());
        // The transition never completed and the queued event was discarded
        assert_eq!(sm.state(), ST_ONE);
        assert_eq!(sm.queue_depth(), 0);

        sm.post_event(Event::new(EV_A, "after")).expect("post after panic");
        assert_eq!(*log.lock().expect("log lock"), vec!["A"]);
        assert_eq!(sm.state(), ST_ONE);
    }
}
