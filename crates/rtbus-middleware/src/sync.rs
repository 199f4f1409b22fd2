//! [`ExternalSync`] – two-phase gate for synchronisation that cannot finish
//! inside this process.
//!
//! A barrier that spans several machines (a bus-wide vote, a wired sync
//! line) is started once the first local participant arrives
//! ([`SyncStage::Initial`]) and finalised once the last one does
//! ([`SyncStage::Final`]).  The final stage may complete on the spot or stay
//! pending; in the latter case the [`SyncHandler`] keeps the [`SyncGate`] it
//! was handed and completes the barrier later from whatever context observes
//! the remote side.
//!
//! ```text
//!   Idle ──start──▶ Pending ──finalize──▶ Idle    (Synced, success broadcast)
//!     │               │  ▲
//!     │               │  └─ Pending (gate completes later)
//!     └──error──▶ Failed ◀──error──┘             (error broadcast)
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rtbus_kernel::EventSource;
use rtbus_types::{BusError, BusResult, EventFlags, SyncStage, SyncState, SyncStatus};
use tracing::{debug, warn};

/// The external side of the synchronisation.
pub trait SyncHandler: Send {
    /// Run `stage`.
    ///
    /// * [`SyncStage::Initial`] must return `Ok(SyncStatus::Pending)` or an
    ///   error.
    /// * [`SyncStage::Final`] returns `Synced` when the barrier completed now,
    ///   `Pending` when `gate` will be completed later, or an error.
    fn synchronize(&mut self, stage: SyncStage, gate: &SyncGate) -> BusResult<SyncStatus>;
}

impl<F> SyncHandler for F
where
    F: FnMut(SyncStage, &SyncGate) -> BusResult<SyncStatus> + Send,
{
    fn synchronize(&mut self, stage: SyncStage, gate: &SyncGate) -> BusResult<SyncStatus> {
        self(stage, gate)
    }
}

/// Handle used to complete a pending synchronisation asynchronously.
#[derive(Clone)]
pub struct SyncGate {
    source: Arc<EventSource>,
    success: EventFlags,
    error: EventFlags,
    state: Arc<Mutex<SyncState>>,
}

impl fmt::Debug for SyncGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncGate")
            .field("success", &self.success)
            .field("error", &self.error)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl SyncGate {
    /// Mark the synchronisation done and release the waiting nodes.
    pub fn complete(&self) {
        *self.state.lock() = SyncState::Idle;
        self.source.broadcast(self.success);
        debug!(flags = self.success, "external sync completed");
    }

    /// Mark the synchronisation failed and notify the waiting nodes.
    pub fn fail(&self) {
        *self.state.lock() = SyncState::Failed;
        self.source.broadcast(self.error);
        warn!(flags = self.error, "external sync failed");
    }
}

/// Two-phase synchronisation gate.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use rtbus_kernel::EventSource;
/// use rtbus_middleware::sync::{ExternalSync, SyncGate};
/// use rtbus_types::{BusResult, SyncStage, SyncState, SyncStatus};
///
/// let sync = ExternalSync::new(|stage: SyncStage, _: &SyncGate| -> BusResult<SyncStatus> {
///     Ok(match stage {
///         SyncStage::Initial => SyncStatus::Pending,
///         SyncStage::Final => SyncStatus::Synced,
///     })
/// });
/// let source = Arc::new(EventSource::new());
///
/// assert_eq!(sync.start(&source, 0b10), Ok(SyncStatus::Pending));
/// assert_eq!(sync.state(), SyncState::Pending);
/// assert_eq!(sync.finalize(&source, 0b01, 0b10), Ok(SyncStatus::Synced));
/// assert_eq!(sync.state(), SyncState::Idle);
/// ```
pub struct ExternalSync {
    handler: Mutex<Box<dyn SyncHandler>>,
    state: Arc<Mutex<SyncState>>,
}

impl fmt::Debug for ExternalSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalSync")
            .field("state", &self.state())
            .finish()
    }
}

impl ExternalSync {
    pub fn new(handler: impl SyncHandler + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Mutex::new(Box::new(handler)),
            state: Arc::new(Mutex::new(SyncState::Idle)),
        })
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock()
    }

    /// Return a failed gate to `Idle` so that it can be started again.
    pub fn reset(&self) {
        *self.state.lock() = SyncState::Idle;
    }

    fn gate(&self, source: &Arc<EventSource>, success: EventFlags, error: EventFlags) -> SyncGate {
        SyncGate {
            source: Arc::clone(source),
            success,
            error,
            state: Arc::clone(&self.state),
        }
    }

    /// Kick off the synchronisation.  On error the gate fails and
    /// `error_flags` are broadcast on `source`.
    pub fn start(&self, source: &Arc<EventSource>, error_flags: EventFlags) -> BusResult<SyncStatus> {
        if self.state() != SyncState::Idle {
            return Err(BusError::SyncError);
        }
        let gate = self.gate(source, 0, error_flags);
        let outcome = self.handler.lock().synchronize(SyncStage::Initial, &gate);
        match outcome {
            Ok(SyncStatus::Pending) => {
                *self.state.lock() = SyncState::Pending;
                debug!("external sync started");
                Ok(SyncStatus::Pending)
            }
            Ok(SyncStatus::Synced) | Err(_) => {
                gate.fail();
                Err(BusError::SyncError)
            }
        }
    }

    /// Complete the synchronisation.  `Synced` broadcasts `success` on
    /// `source`; `Pending` leaves completion to the handler's gate; an error
    /// broadcasts `error`.
    pub fn finalize(
        &self,
        source: &Arc<EventSource>,
        success: EventFlags,
        error: EventFlags,
    ) -> BusResult<SyncStatus> {
        if self.state() == SyncState::Failed {
            return Err(BusError::SyncError);
        }
        let gate = self.gate(source, success, error);
        let outcome = self.handler.lock().synchronize(SyncStage::Final, &gate);
        match outcome {
            Ok(SyncStatus::Synced) => {
                gate.complete();
                Ok(SyncStatus::Synced)
            }
            Ok(SyncStatus::Pending) => {
                *self.state.lock() = SyncState::Pending;
                Ok(SyncStatus::Pending)
            }
            Err(_) => {
                gate.fail();
                Err(BusError::SyncError)
            }
        }
    }
}
