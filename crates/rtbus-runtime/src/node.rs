//! [`Executor`] – one OS thread per [`Node`].
//!
//! Every node thread runs the same life cycle:
//!
//! 1. **Setup** – [`Node::setup`] creates the node's topics, subscribers and
//!    requests on the node thread and returns the events it waits for.
//! 2. **Start barrier** – once every node finished setup the core broadcasts
//!    [`CORE_PROCEED`], so no node steps before its peers are wired up.
//! 3. **Loop** – the thread sleeps on its signal until one of the wait mask
//!    bits is raised (or [`Node::period`] elapses) and calls [`Node::step`].
//! 4. **Shutdown** – on [`CORE_TERMINATE`] or [`CORE_EMERGENCY`] the loop
//!    ends and [`Node::shutdown`] receives the core status.
//!
//! Bit [`CORE_EVENT_BIT`] of every node signal is reserved for core events.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use rtbus_kernel::SystemClock;
//! use rtbus_middleware::Core;
//! use rtbus_runtime::{Executor, Node, NodeContext};
//! use rtbus_types::{BusConfig, BusResult, EventMask};
//!
//! struct Heartbeat;
//!
//! impl Node for Heartbeat {
//!     fn name(&self) -> &str { "heartbeat" }
//!     fn setup(&mut self, _: &NodeContext) -> BusResult<EventMask> { Ok(0) }
//!     fn step(&mut self, _: &NodeContext, _: EventMask) -> BusResult<EventMask> {
//!         tracing::info!("beat");
//!         Ok(0)
//!     }
//!     fn period(&self) -> Option<Duration> { Some(Duration::from_secs(1)) }
//! }
//!
//! let core = Core::new(BusConfig::default(), Arc::new(SystemClock::new()));
//! let mut executor = Executor::new(core);
//! executor.add(Heartbeat);
//! executor.start().unwrap();
//! std::thread::sleep(Duration::from_secs(3));
//! executor.stop(None).unwrap();
//! executor.join().unwrap();
//! ```

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rtbus_kernel::{EventListener, Signal, TimerThread, WaitMode, current_signal};
use rtbus_middleware::{CORE_EMERGENCY, CORE_PROCEED, CORE_TERMINATE, Core, NodeId};
use rtbus_types::{BusError, BusResult, EventMask, Timestamp};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Signal bit raised on node threads for core events.
pub const CORE_EVENT_BIT: EventMask = 1 << 31;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors reported by the [`Executor`].
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("failed to spawn thread for node `{node}`: {source}")]
    Spawn {
        node: String,
        #[source]
        source: std::io::Error,
    },
    #[error("node `{0}` panicked")]
    NodePanicked(String),
    #[error("bus stopped with: {0}")]
    Bus(#[from] BusError),
}

impl RuntimeError {
    /// `true` when the bus stopped because a deadline, jitter or rate
    /// contract was broken.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, RuntimeError::Bus(reason) if reason.is_timing_violation())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Node
// ─────────────────────────────────────────────────────────────────────────────

/// A unit of work driven by its own thread.
pub trait Node: Send + 'static {
    fn name(&self) -> &str;

    /// Runs on the node thread before the start barrier.  Returns the event
    /// mask the first [`step`](Self::step) waits for.
    fn setup(&mut self, ctx: &NodeContext) -> BusResult<EventMask>;

    /// Handle `events` (empty when woken by [`period`](Self::period)) and
    /// return the next wait mask.
    ///
    /// An error stops every node with that reason.
    fn step(&mut self, ctx: &NodeContext, events: EventMask) -> BusResult<EventMask>;

    /// Runs once after the loop ended, with the core status.
    fn shutdown(&mut self, _ctx: &NodeContext, _status: BusResult<()>) {}

    /// Wake [`step`](Self::step) at least this often.
    fn period(&self) -> Option<Duration> {
        None
    }
}

/// What a node sees of the bus from its thread.
pub struct NodeContext {
    core: Arc<Core>,
    id: NodeId,
    name: String,
    signal: Arc<Signal>,
}

impl NodeContext {
    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The node thread's signal; subscribers created during setup notify it.
    pub fn signal(&self) -> &Arc<Signal> {
        &self.signal
    }

    pub fn now(&self) -> Timestamp {
        self.core.now()
    }
}

fn run_node(mut node: Box<dyn Node>, core: Arc<Core>, id: NodeId) {
    let ctx = NodeContext {
        core,
        id,
        name: node.name().to_string(),
        signal: current_signal(),
    };
    let listener = ctx
        .core
        .event_source()
        .register(Arc::clone(&ctx.signal), CORE_EVENT_BIT);
    info!(node = %ctx.name, id, "node starting");

    let mut mask = match node.setup(&ctx) {
        Ok(mask) => mask & !CORE_EVENT_BIT,
        Err(e) => {
            error!(node = %ctx.name, error = %e, "node setup failed");
            ctx.core.panic(e);
            0
        }
    };

    if ctx.core.status().is_ok() {
        match ctx.core.synchronize_nodes(id) {
            Ok(_) => wait_for_start(&ctx, &listener),
            Err(e) => warn!(node = %ctx.name, error = %e, "start barrier failed"),
        }
    }

    while !stopping(&ctx, &listener) {
        let raised = ctx
            .signal
            .wait(mask | CORE_EVENT_BIT, WaitMode::Any, node.period());
        if stopping(&ctx, &listener) {
            break;
        }
        let events = raised & !CORE_EVENT_BIT;
        if raised != 0 && events == 0 {
            continue;
        }
        match node.step(&ctx, events) {
            Ok(next) => mask = next & !CORE_EVENT_BIT,
            Err(e) => {
                error!(node = %ctx.name, error = %e, "node step failed");
                if let Err(earlier) = ctx.core.stop_nodes(Some(e)) {
                    debug!(node = %ctx.name, %earlier, "bus already failed");
                }
                break;
            }
        }
    }

    let status = ctx.core.status();
    node.shutdown(&ctx, status.clone());
    info!(node = %ctx.name, ?status, "node stopped");
}

fn stopping(ctx: &NodeContext, listener: &EventListener) -> bool {
    ctx.core.is_stopping() || listener.flags() & (CORE_TERMINATE | CORE_EMERGENCY) != 0
}

fn wait_for_start(ctx: &NodeContext, listener: &EventListener) {
    while listener.flags() & CORE_PROCEED == 0 && !stopping(ctx, listener) {
        ctx.signal.wait(CORE_EVENT_BIT, WaitMode::Any, None);
    }
    listener.clear_flags(CORE_PROCEED);
    debug!(node = %ctx.name, "start barrier passed");
}

// ─────────────────────────────────────────────────────────────────────────────
// Executor
// ─────────────────────────────────────────────────────────────────────────────

/// Starts and joins node threads and the QoS timer thread.
pub struct Executor {
    core: Arc<Core>,
    pending: Vec<(NodeId, Box<dyn Node>)>,
    running: Vec<(String, JoinHandle<()>)>,
    timers: Option<TimerThread>,
}

impl Executor {
    pub fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            pending: Vec::new(),
            running: Vec::new(),
            timers: None,
        }
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Register `node` with the core.  It starts with the next
    /// [`start`](Self::start).
    pub fn add(&mut self, node: impl Node) -> NodeId {
        let id = self.core.register_node(node.name());
        self.pending.push((id, Box::new(node)));
        id
    }

    /// Spawn the timer thread (once) and a thread for every added node.
    pub fn start(&mut self) -> Result<(), RuntimeError> {
        if self.timers.is_none() {
            let timers = self.core.start_timers().map_err(|source| RuntimeError::Spawn {
                node: "rtbus-timers".to_string(),
                source,
            })?;
            self.timers = Some(timers);
        }
        for (id, node) in self.pending.drain(..) {
            let name = node.name().to_string();
            let core = Arc::clone(&self.core);
            let handle = thread::Builder::new()
                .name(format!("rtbus-{name}"))
                .spawn(move || run_node(node, core, id))
                .map_err(|source| RuntimeError::Spawn {
                    node: name.clone(),
                    source,
                })?;
            self.running.push((name, handle));
        }
        info!(nodes = self.running.len(), "executor started");
        Ok(())
    }

    /// Ask every node to stop.  See [`Core::stop_nodes`].
    pub fn stop(&self, reason: Option<BusError>) -> BusResult<()> {
        self.core.stop_nodes(reason)
    }

    /// Wait for every node thread, then stop the timer thread.
    ///
    /// Returns the core status as [`RuntimeError::Bus`] when the bus failed.
    pub fn join(&mut self) -> Result<(), RuntimeError> {
        let mut panicked = None;
        for (name, handle) in self.running.drain(..) {
            if handle.join().is_err() {
                error!(node = %name, "node thread panicked");
                panicked.get_or_insert(name);
            }
        }
        if let Some(mut timers) = self.timers.take() {
            timers.stop();
        }
        if let Some(name) = panicked {
            return Err(RuntimeError::NodePanicked(name));
        }
        self.core.status().map_err(RuntimeError::from)
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rtbus_kernel::SystemClock;
    use rtbus_middleware::{NrtSubscriber, Publisher, Subscriber, Topic};
    use rtbus_types::{BusConfig, PublishPolicy};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn core() -> Arc<Core> {
        Core::new(BusConfig::default(), Arc::new(SystemClock::new()))
    }

    struct Ticker {
        name: &'static str,
        steps: Arc<AtomicUsize>,
        shutdown: Arc<Mutex<Option<BusResult<()>>>>,
    }

    impl Node for Ticker {
        fn name(&self) -> &str {
            self.name
        }

        fn setup(&mut self, _: &NodeContext) -> BusResult<EventMask> {
            Ok(0)
        }

        fn step(&mut self, _: &NodeContext, _: EventMask) -> BusResult<EventMask> {
            self.steps.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }

        fn shutdown(&mut self, _: &NodeContext, status: BusResult<()>) {
            *self.shutdown.lock() = Some(status);
        }

        fn period(&self) -> Option<Duration> {
            Some(Duration::from_millis(1))
        }
    }

    fn ticker(name: &'static str) -> (Ticker, Arc<AtomicUsize>, Arc<Mutex<Option<BusResult<()>>>>) {
        let steps = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(Mutex::new(None));
        let node = Ticker {
            name,
            steps: steps.clone(),
            shutdown: shutdown.clone(),
        };
        (node, steps, shutdown)
    }

    #[test]
    fn periodic_nodes_run_until_stopped() {
        let mut executor = Executor::new(core());
        let (a, a_steps, a_down) = ticker("a");
        let (b, b_steps, b_down) = ticker("b");
        executor.add(a);
        executor.add(b);
        executor.start().unwrap();
        assert_eq!(executor.running(), 2);

        thread::sleep(Duration::from_millis(50));
        executor.stop(None).unwrap();
        executor.join().unwrap();

        assert!(a_steps.load(Ordering::SeqCst) > 0);
        assert!(b_steps.load(Ordering::SeqCst) > 0);
        assert_eq!(*a_down.lock(), Some(Ok(())));
        assert_eq!(*b_down.lock(), Some(Ok(())));
    }

    struct SlowSetup {
        ready: Arc<Mutex<Option<Instant>>>,
    }

    impl Node for SlowSetup {
        fn name(&self) -> &str {
            "slow"
        }

        fn setup(&mut self, _: &NodeContext) -> BusResult<EventMask> {
            thread::sleep(Duration::from_millis(30));
            *self.ready.lock() = Some(Instant::now());
            Ok(0)
        }

        fn step(&mut self, _: &NodeContext, _: EventMask) -> BusResult<EventMask> {
            Ok(0)
        }
    }

    struct FirstStep {
        at: Arc<Mutex<Option<Instant>>>,
    }

    impl Node for FirstStep {
        fn name(&self) -> &str {
            "eager"
        }

        fn setup(&mut self, _: &NodeContext) -> BusResult<EventMask> {
            Ok(0)
        }

        fn step(&mut self, _: &NodeContext, _: EventMask) -> BusResult<EventMask> {
            self.at.lock().get_or_insert_with(Instant::now);
            Ok(0)
        }

        fn period(&self) -> Option<Duration> {
            Some(Duration::from_millis(1))
        }
    }

    #[test]
    fn no_node_steps_before_every_setup_finished() {
        let ready = Arc::new(Mutex::new(None));
        let first = Arc::new(Mutex::new(None));
        let mut executor = Executor::new(core());
        executor.add(FirstStep { at: first.clone() });
        executor.add(SlowSetup {
            ready: ready.clone(),
        });
        executor.start().unwrap();

        thread::sleep(Duration::from_millis(80));
        executor.stop(None).unwrap();
        executor.join().unwrap();

        let ready = ready.lock().unwrap();
        let first = first.lock().unwrap();
        assert!(first >= ready);
    }

    struct Broken;

    impl Node for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn setup(&mut self, _: &NodeContext) -> BusResult<EventMask> {
            Err(BusError::InvalidConfig("no topic".into()))
        }

        fn step(&mut self, _: &NodeContext, _: EventMask) -> BusResult<EventMask> {
            Ok(0)
        }
    }

    #[test]
    fn failed_setup_stops_every_node() {
        let mut executor = Executor::new(core());
        let (a, _, a_down) = ticker("a");
        executor.add(a);
        executor.add(Broken);
        executor.start().unwrap();

        let err = executor.join().unwrap_err();
        assert!(matches!(err, RuntimeError::Bus(BusError::InvalidConfig(_))));
        assert!(!err.is_contract_violation());
        assert_eq!(
            *a_down.lock(),
            Some(Err(BusError::InvalidConfig("no topic".into())))
        );
    }

    struct Late;

    impl Node for Late {
        fn name(&self) -> &str {
            "late"
        }

        fn setup(&mut self, _: &NodeContext) -> BusResult<EventMask> {
            Ok(0)
        }

        fn step(&mut self, _: &NodeContext, _: EventMask) -> BusResult<EventMask> {
            Err(BusError::DeadlineViolation)
        }

        fn period(&self) -> Option<Duration> {
            Some(Duration::from_millis(1))
        }
    }

    #[test]
    fn step_error_stops_bus_with_its_reason() {
        let mut executor = Executor::new(core());
        let (a, _, a_down) = ticker("a");
        executor.add(a);
        executor.add(Late);
        executor.start().unwrap();

        let err = executor.join().unwrap_err();
        assert!(matches!(err, RuntimeError::Bus(BusError::DeadlineViolation)));
        assert!(err.is_contract_violation());
        assert_eq!(*a_down.lock(), Some(Err(BusError::DeadlineViolation)));
    }

    struct Producer {
        topic: Topic,
        publisher: Option<Publisher>,
    }

    impl Node for Producer {
        fn name(&self) -> &str {
            "producer"
        }

        fn setup(&mut self, _: &NodeContext) -> BusResult<EventMask> {
            self.publisher = Some(Publisher::new(&self.topic));
            Ok(0)
        }

        fn step(&mut self, ctx: &NodeContext, _: EventMask) -> BusResult<EventMask> {
            if let Some(publisher) = &self.publisher {
                publisher.publish(&[1], ctx.now(), PublishPolicy::Enforcing, None)?;
            }
            Ok(0)
        }

        fn period(&self) -> Option<Duration> {
            Some(Duration::from_millis(2))
        }
    }

    struct Consumer {
        topic: Topic,
        subscriber: Option<NrtSubscriber>,
        received: Arc<AtomicUsize>,
    }

    impl Node for Consumer {
        fn name(&self) -> &str {
            "consumer"
        }

        fn setup(&mut self, _: &NodeContext) -> BusResult<EventMask> {
            self.subscriber = Some(NrtSubscriber::subscribe(&self.topic, 0b1));
            Ok(0b1)
        }

        fn step(&mut self, _: &NodeContext, _: EventMask) -> BusResult<EventMask> {
            let mut buf = [0u8; 4];
            if let Some(subscriber) = self.subscriber.as_mut() {
                while subscriber.fetch_next(&mut buf).is_ok() {
                    self.received.fetch_add(1, Ordering::SeqCst);
                }
            }
            Ok(0b1)
        }
    }

    #[test]
    fn nodes_exchange_messages_over_a_topic() {
        let core = core();
        let topic = Topic::new(&core, 1, 4, 4).unwrap();
        let received = Arc::new(AtomicUsize::new(0));
        let mut executor = Executor::new(core);
        executor.add(Consumer {
            topic: topic.clone(),
            subscriber: None,
            received: received.clone(),
        });
        executor.add(Producer {
            topic,
            publisher: None,
        });
        executor.start().unwrap();

        thread::sleep(Duration::from_millis(60));
        executor.stop(None).unwrap();
        executor.join().unwrap();
        assert!(received.load(Ordering::SeqCst) > 0);
    }
}
