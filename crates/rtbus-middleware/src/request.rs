//! [`Request`] – caller side of an RPC.
//!
//! A request is a reusable buffer that goes through the same cycle for every
//! call:
//!
//! ```text
//!   acquire ──▶ RequestGuard ──submit──▶ queued at a Service
//!                                           │ dispatch / acquire / respond
//!   retrieve ◀── response + notification ◀──┘
//! ```
//!
//! The submission timestamp doubles as the ownership token: it strictly
//! increases with every submission, so a service that dispatched an earlier
//! submission can tell that the caller gave up on it and resubmitted.
//!
//! | Class | Constructor | Checked on retrieve |
//! |---|---|---|
//! | NRT | [`Request::nrt`] | nothing |
//! | SRT | [`Request::srt`] | nothing |
//! | FRT | [`Request::frt`] | deadline, jitter (reported) |
//! | HRT | [`Request::hrt`] | jitter (escalated); deadline by QoS timer |

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rtbus_kernel::{Notifier, QosTimer, TimerCallback};
use rtbus_types::{
    BusError, BusResult, EventMask, LatencyStats, RequestStats, RetrievePolicy, RtClass, Timestamp,
};
use tracing::{debug, warn};

use crate::core::Core;
use crate::qos::{Escalation, LatencyWindow, Recovery, critical_delay};
use crate::service::{Service, ServiceInner};

/// Request state shared with the service it is queued at.
pub(crate) type RequestCell = Arc<Mutex<RequestState>>;

pub(crate) struct RequestState {
    pub(crate) class: RtClass,
    /// Service the request is submitted to, until it is answered or
    /// detached.
    pub(crate) owner: Option<Weak<ServiceInner>>,
    pub(crate) payload: Box<[u8]>,
    pub(crate) size: usize,
    pub(crate) submission: Timestamp,
    /// Caller to notify on response.  `None` for fire-and-forget calls and
    /// once the response was retrieved.
    pub(crate) notifier: Option<Notifier>,
}

struct HrtWatch {
    timer: QosTimer,
    armed: Option<(Timestamp, BusError)>,
    recovery: Recovery,
    violation: Option<BusError>,
}

struct RequestTiming {
    deadline: Option<Duration>,
    jitter: Option<Duration>,
    window: LatencyWindow,
    calls: u64,
    fails: u64,
    latency: LatencyStats,
    watch: Option<HrtWatch>,
}

/// Reusable RPC request.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use rtbus_kernel::{ManualClock, Notifier, Signal};
/// use rtbus_middleware::{Core, Request, Service};
/// use rtbus_types::{BusConfig, RetrievePolicy};
///
/// let core = Core::new(BusConfig::default(), Arc::new(ManualClock::default()));
/// let service = Service::new(3, Notifier::new(Signal::new(), 1));
/// let request = Request::nrt(&core, 8);
///
/// let mut guard = request.acquire().unwrap();
/// guard.payload_mut()[..2].copy_from_slice(&[20, 22]);
/// guard.submit(&service, 2, 0b10, None).unwrap();
///
/// let mut buf = [0u8; 8];
/// let dispatched = service.dispatch(&mut buf).unwrap().unwrap();
/// let sum = buf[0] + buf[1];
/// let mut responder = service.acquire(dispatched).unwrap();
/// responder.payload_mut()[0] = sum;
/// responder.respond(1).unwrap();
///
/// let answer = request.retrieve(RetrievePolicy::Blocking).unwrap();
/// assert_eq!(answer.payload(), &[42]);
/// ```
pub struct Request {
    class: RtClass,
    core: Arc<Core>,
    cell: RequestCell,
    capacity: usize,
    /// Last submission time in µs, `0` before the first one.
    submitted: AtomicU64,
    timing: Arc<Mutex<RequestTiming>>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("class", &self.class)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Request {
    pub fn nrt(core: &Arc<Core>, capacity: usize) -> Self {
        Self::build(core, RtClass::Nrt, capacity, None, None)
    }

    pub fn srt(core: &Arc<Core>, capacity: usize) -> Self {
        Self::build(core, RtClass::Srt, capacity, None, None)
    }

    pub fn frt(core: &Arc<Core>, capacity: usize, jitter: Option<Duration>) -> Self {
        Self::build(core, RtClass::Frt, capacity, jitter, None)
    }

    pub fn hrt(core: &Arc<Core>, capacity: usize, jitter: Option<Duration>, recovery: Recovery) -> Self {
        Self::build(core, RtClass::Hrt, capacity, jitter, Some(recovery))
    }

    fn build(
        core: &Arc<Core>,
        class: RtClass,
        capacity: usize,
        jitter: Option<Duration>,
        recovery: Option<Recovery>,
    ) -> Self {
        let watch = recovery.map(|recovery| HrtWatch {
            timer: core.timers().timer(),
            armed: None,
            recovery,
            violation: None,
        });
        Self {
            class,
            core: Arc::clone(core),
            cell: Arc::new(Mutex::new(RequestState {
                class,
                owner: None,
                payload: vec![0; capacity].into_boxed_slice(),
                size: 0,
                submission: Timestamp::ZERO,
                notifier: None,
            })),
            capacity,
            submitted: AtomicU64::new(0),
            timing: Arc::new(Mutex::new(RequestTiming {
                deadline: None,
                jitter,
                window: LatencyWindow::default(),
                calls: 0,
                fails: 0,
                latency: LatencyStats::default(),
                watch,
            })),
        }
    }

    pub fn class(&self) -> RtClass {
        self.class
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // ── Acquire / retrieve ─────────────────────────────────────────────────

    /// Lock the request for a new call.
    ///
    /// Fails with [`BusError::RequestBadOwner`] while a service owns it and
    /// with [`BusError::RequestPending`] while a response awaits retrieval.
    pub fn acquire(&self) -> BusResult<RequestGuard<'_>> {
        self.free(self.cell.lock())
    }

    /// Like [`acquire`](Self::acquire) but fails with
    /// [`BusError::RequestLocked`] instead of waiting for the lock.
    pub fn try_acquire(&self) -> BusResult<RequestGuard<'_>> {
        let state = self.cell.try_lock().ok_or(BusError::RequestLocked)?;
        self.free(state)
    }

    fn free<'a>(&'a self, state: MutexGuard<'a, RequestState>) -> BusResult<RequestGuard<'a>> {
        if state.owner.is_some() {
            return Err(BusError::RequestBadOwner);
        }
        if state.notifier.is_some() {
            return Err(BusError::RequestPending);
        }
        Ok(RequestGuard {
            request: self,
            state,
        })
    }

    /// Collect the response.
    ///
    /// While a service still owns the request this fails with
    /// [`BusError::RequestBadOwner`]; the `Enforcing` policy additionally
    /// takes the request back from the service so that it can be reused.
    ///
    /// A contract violation found here is escalated when the returned
    /// [`Retrieved`] is dropped, after the request lock is released.
    pub fn retrieve(&self, policy: RetrievePolicy) -> BusResult<Retrieved<'_>> {
        let mut state = match policy {
            RetrievePolicy::Lazy => self.cell.try_lock().ok_or(BusError::RequestLocked)?,
            RetrievePolicy::Blocking | RetrievePolicy::Enforcing => self.cell.lock(),
        };
        if state.owner.is_some() {
            if policy == RetrievePolicy::Enforcing {
                self.detach(&mut state);
            }
            return Err(BusError::RequestBadOwner);
        }

        let latency = self.core.now().saturating_duration_since(state.submission);
        state.notifier = None;
        let size = state.size;
        let (violation, escalation) = self.account(latency);

        Ok(Retrieved {
            guard: Some(RequestGuard {
                request: self,
                state,
            }),
            escalation,
            size,
            latency,
            violation,
        })
    }

    fn detach(&self, state: &mut RequestState) {
        if let Some(service) = state.owner.take().and_then(|owner| owner.upgrade()) {
            service.detach(state.class, &self.cell);
        }
        state.notifier = None;
        let mut timing = self.timing.lock();
        timing.fails += 1;
        if let Some(watch) = timing.watch.as_mut() {
            watch.timer.reset();
            watch.armed = None;
        }
        warn!(class = %self.class, "request taken back from its service");
    }

    /// Track `latency` and check the contract.
    fn account(&self, latency: Duration) -> (Option<BusError>, Escalation) {
        let checks = &self.core.config().rpc_qos;
        let mut timing = self.timing.lock();
        let timing = &mut *timing;
        timing.latency.record(latency);
        let deadline = timing.deadline.filter(|_| checks.deadline);
        let jitter = timing.jitter.filter(|_| checks.jitter);

        match self.class {
            RtClass::Frt => {
                let violation = if deadline.is_some_and(|deadline| latency > deadline) {
                    Some(BusError::DeadlineViolation)
                } else if jitter.is_some_and(|jitter| !timing.window.record(latency, jitter)) {
                    Some(BusError::JitterViolation)
                } else {
                    None
                };
                (violation, Escalation::None)
            }
            RtClass::Hrt => {
                let jittered = jitter.is_some_and(|jitter| !timing.window.record(latency, jitter));
                let Some(watch) = timing.watch.as_mut() else {
                    return (None, Escalation::None);
                };
                watch.timer.reset();
                watch.armed = None;
                if !jittered {
                    return (None, Escalation::None);
                }
                let violation = BusError::JitterViolation;
                let escalation = watch.recovery.escalate(&mut watch.violation, violation.clone());
                (Some(violation), escalation)
            }
            RtClass::Srt | RtClass::Nrt => (None, Escalation::None),
        }
    }

    // ── QoS ────────────────────────────────────────────────────────────────

    /// Record the deadline of a new submission and arm the HRT timer.
    fn prepare_qos(&self, submission: Timestamp, deadline: Option<Duration>) {
        let checks = &self.core.config().rpc_qos;
        let mut timing = self.timing.lock();
        timing.calls += 1;
        if matches!(self.class, RtClass::Frt | RtClass::Hrt) {
            timing.deadline = deadline;
        }
        let delay = critical_delay(
            timing.deadline.filter(|_| checks.deadline),
            timing.jitter.filter(|_| checks.jitter),
            &timing.window,
        );
        let callback = self.watch_callback();
        let Some(watch) = timing.watch.as_mut() else {
            return;
        };
        match delay {
            Some((delay, violation)) => {
                let at = submission + delay;
                watch.armed = Some((at, violation));
                watch.timer.arm(at, callback);
            }
            None => {
                watch.armed = None;
                watch.timer.reset();
            }
        }
    }

    fn watch_callback(&self) -> TimerCallback {
        let timing = Arc::downgrade(&self.timing);
        let core = Arc::downgrade(&self.core);
        Arc::new(move || {
            if let (Some(timing), Some(core)) = (timing.upgrade(), core.upgrade()) {
                on_watch_expired(&timing, &core);
            }
        })
    }

    /// Time since the last submission.
    pub fn age(&self) -> Duration {
        match self.submitted.load(Ordering::Relaxed) {
            0 => Duration::ZERO,
            us => self
                .core
                .now()
                .saturating_duration_since(Timestamp::from_micros(us)),
        }
    }

    /// `true` if a response with `latency` would satisfy the deadline and
    /// jitter bounds, without recording it.
    pub fn calculate_validity(&self, latency: Duration) -> bool {
        let checks = &self.core.config().rpc_qos;
        let timing = self.timing.lock();
        if timing
            .deadline
            .filter(|_| checks.deadline)
            .is_some_and(|deadline| latency > deadline)
        {
            return false;
        }
        !timing
            .jitter
            .filter(|_| checks.jitter)
            .is_some_and(|jitter| timing.window.exceeds(latency, jitter))
    }

    /// First violation handed to the recovery handler (HRT only).
    pub fn violation(&self) -> Option<BusError> {
        self.timing
            .lock()
            .watch
            .as_ref()
            .and_then(|watch| watch.violation.clone())
    }

    pub fn clear_violation(&self) {
        if let Some(watch) = self.timing.lock().watch.as_mut() {
            watch.violation = None;
        }
    }

    /// When the HRT timer fires if the request is not retrieved.
    pub fn qos_deadline(&self) -> Option<Timestamp> {
        self.timing
            .lock()
            .watch
            .as_ref()
            .and_then(|watch| watch.timer.deadline())
    }

    pub fn stats(&self) -> RequestStats {
        let timing = self.timing.lock();
        RequestStats {
            class: self.class,
            calls: timing.calls,
            fails: timing.fails,
            latency: timing.latency.clone(),
        }
    }
}

fn on_watch_expired(timing: &Mutex<RequestTiming>, core: &Core) {
    let now = core.now();
    let escalation = {
        let mut timing = timing.lock();
        let Some(watch) = timing.watch.as_mut() else {
            return;
        };
        match watch.armed.take() {
            Some((at, violation)) if at <= now => {
                warn!(%violation, "request not answered in time");
                watch.recovery.escalate(&mut watch.violation, violation)
            }
            other => {
                watch.armed = other;
                return;
            }
        }
    };
    escalation.run(core);
}

// ────────────────────────────────────────────────────────────────────────────
// Guards
// ────────────────────────────────────────────────────────────────────────────

/// Exclusive access to an idle request.
pub struct RequestGuard<'a> {
    request: &'a Request,
    state: MutexGuard<'a, RequestState>,
}

impl RequestGuard<'_> {
    /// The whole payload buffer.
    pub fn payload(&self) -> &[u8] {
        &self.state.payload
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.state.payload
    }

    /// Submit the first `size` payload bytes to `service`.
    ///
    /// A non-zero `mask` is raised on the calling thread's signal when the
    /// response is ready; `0` makes the call fire-and-forget.  `deadline` is
    /// recorded by FRT and HRT requests.
    pub fn submit(
        mut self,
        service: &Service,
        size: usize,
        mask: EventMask,
        deadline: Option<Duration>,
    ) -> BusResult<()> {
        let request = self.request;
        if size > self.state.payload.len() {
            return Err(BusError::PayloadTooLarge {
                size,
                capacity: self.state.payload.len(),
            });
        }

        let now = request.core.now();
        let submission = if now > self.state.submission {
            now
        } else {
            self.state.submission + Duration::from_micros(1)
        };
        self.state.owner = Some(Arc::downgrade(&service.inner));
        self.state.submission = submission;
        self.state.size = size;
        self.state.notifier = (mask != 0).then(|| Notifier::current(mask));
        request
            .submitted
            .store(submission.as_micros(), Ordering::Relaxed);
        request.prepare_qos(submission, deadline);

        service.inner.enqueue(request.class, Arc::clone(&request.cell));
        debug!(
            service = service.id(),
            class = %request.class,
            %submission,
            size,
            "request submitted"
        );
        Ok(())
    }
}

/// A retrieved response.  The request stays locked until this is dropped.
pub struct Retrieved<'a> {
    /// `None` only while dropping.
    guard: Option<RequestGuard<'a>>,
    escalation: Escalation,
    pub size: usize,
    /// Time between submission and retrieval.
    pub latency: Duration,
    pub violation: Option<BusError>,
}

impl Retrieved<'_> {
    /// The response bytes.
    pub fn payload(&self) -> &[u8] {
        match &self.guard {
            Some(guard) => &guard.state.payload[..self.size],
            None => &[],
        }
    }
}

impl Drop for Retrieved<'_> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let request = guard.request;
        drop(guard);
        std::mem::replace(&mut self.escalation, Escalation::None).run(&request.core);
    }
}
