//! [`Core`] – process-wide state of the bus.
//!
//! The core owns the things every engine shares:
//!
//! - the [`BusConfig`] the bus was started with,
//! - the [`Clock`] and the [`TimerService`] QoS timers are armed on,
//! - the overall status (`Ok` until the first fatal fault),
//! - the core [`EventSource`] nodes listen to for [`CORE_EMERGENCY`],
//!   [`CORE_TERMINATE`] and [`CORE_PROCEED`],
//! - the node stage counters behind [`Core::synchronize_nodes`].
//!
//! A hard real-time violation without a recovery handler ends up in
//! [`Core::panic`], which records the reason and tells every node to shut
//! down.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rtbus_kernel::{Clock, EventSource, TimerService, TimerThread};
use rtbus_types::{BusConfig, BusError, BusResult, EventFlags, SyncState, SyncStatus, Timestamp};
use tracing::{debug, error, info};

use crate::sync::ExternalSync;

/// Broadcast when the bus hit a fatal fault.
pub const CORE_EMERGENCY: EventFlags = 1 << 0;
/// Broadcast when nodes were asked to stop.
pub const CORE_TERMINATE: EventFlags = 1 << 1;
/// Broadcast when all nodes reached the same stage.
pub const CORE_PROCEED: EventFlags = 1 << 2;

/// Index of a node registered with [`Core::register_node`].
pub type NodeId = usize;

struct NodeStage {
    name: String,
    stage: u64,
}

/// Shared state of one bus instance.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use rtbus_kernel::ManualClock;
/// use rtbus_middleware::core::Core;
/// use rtbus_types::{BusConfig, BusError};
///
/// let core = Core::new(BusConfig::default(), Arc::new(ManualClock::default()));
/// assert!(core.status().is_ok());
///
/// core.panic(BusError::DeadlineViolation);
/// core.panic(BusError::RateViolation);
/// assert_eq!(core.status(), Err(BusError::DeadlineViolation));
/// ```
pub struct Core {
    config: BusConfig,
    clock: Arc<dyn Clock>,
    timers: TimerService,
    events: Arc<EventSource>,
    status: Mutex<Option<BusError>>,
    stopping: AtomicBool,
    nodes: Mutex<Vec<NodeStage>>,
    sync: Option<Arc<ExternalSync>>,
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("config", &self.config)
            .field("status", &*self.status.lock())
            .field("nodes", &self.nodes.lock().len())
            .finish()
    }
}

impl Core {
    pub fn new(config: BusConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::build(config, clock, None)
    }

    /// Core whose node barrier is additionally gated by `sync`.
    pub fn with_sync(config: BusConfig, clock: Arc<dyn Clock>, sync: Arc<ExternalSync>) -> Arc<Self> {
        Self::build(config, clock, Some(sync))
    }

    fn build(config: BusConfig, clock: Arc<dyn Clock>, sync: Option<Arc<ExternalSync>>) -> Arc<Self> {
        Arc::new(Self {
            config,
            clock,
            timers: TimerService::new(),
            events: Arc::new(EventSource::new()),
            status: Mutex::new(None),
            stopping: AtomicBool::new(false),
            nodes: Mutex::new(Vec::new()),
            sync,
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn timers(&self) -> &TimerService {
        &self.timers
    }

    /// Run the QoS timers on a background thread against the core clock.
    pub fn start_timers(&self) -> std::io::Result<TimerThread> {
        self.timers.spawn(Arc::clone(&self.clock))
    }

    pub fn event_source(&self) -> &Arc<EventSource> {
        &self.events
    }

    /// `Ok` until the first fatal fault or stop reason.
    pub fn status(&self) -> BusResult<()> {
        match &*self.status.lock() {
            None => Ok(()),
            Some(reason) => Err(reason.clone()),
        }
    }

    // ── Faults and shutdown ────────────────────────────────────────────────

    /// `true` once [`panic`](Self::panic) or [`stop_nodes`](Self::stop_nodes)
    /// was called.  Covers nodes that register after the broadcast.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Record `reason` (first one wins) and broadcast [`CORE_EMERGENCY`].
    pub fn panic(&self, reason: BusError) {
        {
            let mut status = self.status.lock();
            if status.is_none() {
                *status = Some(reason.clone());
            }
        }
        self.stopping.store(true, Ordering::SeqCst);
        if reason.is_timing_violation() {
            error!(%reason, "timing contract broken, emergency shutdown");
        } else {
            error!(%reason, "core panic, emergency shutdown");
        }
        self.events.broadcast(CORE_EMERGENCY);
    }

    /// Ask every node to terminate.
    ///
    /// Returns the earlier fault instead if the core already failed; the call
    /// is then ignored.
    pub fn stop_nodes(&self, reason: Option<BusError>) -> BusResult<()> {
        {
            let mut status = self.status.lock();
            if let Some(earlier) = &*status {
                return Err(earlier.clone());
            }
            *status = reason;
        }
        self.stopping.store(true, Ordering::SeqCst);
        info!("stopping nodes");
        self.events.broadcast(CORE_TERMINATE);
        Ok(())
    }

    // ── Node stage barrier ─────────────────────────────────────────────────

    pub fn register_node(&self, name: &str) -> NodeId {
        let mut nodes = self.nodes.lock();
        nodes.push(NodeStage {
            name: name.to_string(),
            stage: 0,
        });
        debug!(node = name, id = nodes.len() - 1, "node registered");
        nodes.len() - 1
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }

    /// Advance `node` to its next stage.
    ///
    /// When every node reached the same stage the barrier completes:
    /// [`CORE_PROCEED`] is broadcast, or the external sync is finalised if
    /// one is attached.  A node more than one stage ahead of another is a
    /// [`BusError::SyncError`] and panics the core.
    pub fn synchronize_nodes(&self, node: NodeId) -> BusResult<SyncStatus> {
        let mut nodes = self.nodes.lock();
        let stage = match nodes.get_mut(node) {
            Some(entry) => {
                entry.stage += 1;
                entry.stage
            }
            None => return Err(BusError::SyncError),
        };

        let laggard = nodes.iter().find(|n| n.stage != stage);
        let local = match laggard {
            None => SyncStatus::Synced,
            Some(other) if other.stage + 1 == stage => SyncStatus::Pending,
            Some(other) => {
                error!(
                    node = %nodes[node].name,
                    stage,
                    other = %other.name,
                    other_stage = other.stage,
                    "node stages diverged"
                );
                drop(nodes);
                self.panic(BusError::SyncError);
                return Err(BusError::SyncError);
            }
        };

        let outcome = match &self.sync {
            Some(sync) => match local {
                SyncStatus::Pending if sync.state() == SyncState::Idle => {
                    sync.start(&self.events, CORE_EMERGENCY)
                }
                SyncStatus::Pending => Ok(SyncStatus::Pending),
                SyncStatus::Synced => sync.finalize(&self.events, CORE_PROCEED, CORE_EMERGENCY),
            },
            None => {
                if local == SyncStatus::Synced {
                    self.events.broadcast(CORE_PROCEED);
                }
                Ok(local)
            }
        };
        if local == SyncStatus::Synced {
            info!(stage, "all nodes synchronized");
        }
        drop(nodes);

        if let Err(reason) = &outcome {
            let mut status = self.status.lock();
            if status.is_none() {
                *status = Some(reason.clone());
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncGate;
    use rtbus_kernel::{ManualClock, Signal};
    use rtbus_types::SyncStage;

    fn core() -> Arc<Core> {
        Core::new(BusConfig::default(), Arc::new(ManualClock::default()))
    }

    #[test]
    fn panic_broadcasts_emergency_and_keeps_first_reason() {
        let core = core();
        let listener = core.event_source().register(Signal::new(), 1);
        core.panic(BusError::JitterViolation);
        core.panic(BusError::SyncError);
        assert_eq!(core.status(), Err(BusError::JitterViolation));
        assert_eq!(listener.flags(), CORE_EMERGENCY);
    }

    #[test]
    fn stop_nodes_after_failure_reports_failure() {
        let core = core();
        assert_eq!(core.stop_nodes(None), Ok(()));
        assert_eq!(core.status(), Ok(()));

        core.panic(BusError::RateViolation);
        assert_eq!(core.stop_nodes(None), Err(BusError::RateViolation));
    }

    #[test]
    fn stop_nodes_records_reason() {
        let core = core();
        let listener = core.event_source().register(Signal::new(), 1);
        assert!(!core.is_stopping());
        core.stop_nodes(Some(BusError::PublishTimeout)).unwrap();
        assert!(core.is_stopping());
        assert_eq!(core.status(), Err(BusError::PublishTimeout));
        assert_eq!(listener.flags(), CORE_TERMINATE);
    }

    #[test]
    fn nodes_proceed_when_all_reach_the_stage() {
        let core = core();
        let listener = core.event_source().register(Signal::new(), 1);
        let a = core.register_node("a");
        let b = core.register_node("b");

        assert_eq!(core.synchronize_nodes(a), Ok(SyncStatus::Pending));
        assert_eq!(listener.flags(), 0);
        assert_eq!(core.synchronize_nodes(b), Ok(SyncStatus::Synced));
        assert_eq!(listener.flags(), CORE_PROCEED);
    }

    #[test]
    fn node_two_stages_ahead_panics() {
        let core = core();
        let a = core.register_node("a");
        let _b = core.register_node("b");
        core.synchronize_nodes(a).unwrap();
        assert_eq!(core.synchronize_nodes(a), Err(BusError::SyncError));
        assert_eq!(core.status(), Err(BusError::SyncError));
    }

    #[test]
    fn unknown_node_is_rejected() {
        assert_eq!(core().synchronize_nodes(7), Err(BusError::SyncError));
    }

    #[test]
    fn external_sync_gates_node_barrier() {
        let sync = ExternalSync::new(|stage: SyncStage, _: &SyncGate| -> BusResult<SyncStatus> {
            Ok(match stage {
                SyncStage::Initial => SyncStatus::Pending,
                SyncStage::Final => SyncStatus::Synced,
            })
        });
        let core = Core::with_sync(
            BusConfig::default(),
            Arc::new(ManualClock::default()),
            sync.clone(),
        );
        let listener = core.event_source().register(Signal::new(), 1);
        let a = core.register_node("a");
        let b = core.register_node("b");

        assert_eq!(core.synchronize_nodes(a), Ok(SyncStatus::Pending));
        assert_eq!(sync.state(), SyncState::Pending);
        assert_eq!(core.synchronize_nodes(b), Ok(SyncStatus::Synced));
        assert_eq!(sync.state(), SyncState::Idle);
        assert_eq!(listener.flags(), CORE_PROCEED);
    }

    #[test]
    fn failing_external_sync_sets_status() {
        let sync = ExternalSync::new(|_: SyncStage, _: &SyncGate| -> BusResult<SyncStatus> {
            Err(BusError::SyncError)
        });
        let core = Core::with_sync(BusConfig::default(), Arc::new(ManualClock::default()), sync);
        let listener = core.event_source().register(Signal::new(), 1);
        let a = core.register_node("a");
        let _b = core.register_node("b");

        assert_eq!(core.synchronize_nodes(a), Err(BusError::SyncError));
        assert_eq!(core.status(), Err(BusError::SyncError));
        assert_eq!(listener.flags(), CORE_EMERGENCY);
    }
}
