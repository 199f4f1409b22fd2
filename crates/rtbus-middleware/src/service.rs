//! [`Service`] – RPC endpoint with a class-partitioned request queue.
//!
//! Submitted requests wait in one of three FIFO partitions, served in
//! priority order:
//!
//! | Partition | Classes |
//! |---|---|
//! | `hrt` | HRT |
//! | `fsrt` | FRT, SRT |
//! | `nrt` | NRT |
//!
//! Answering a request is split in three steps so that the service does not
//! hold the request while it computes the response:
//!
//! 1. [`Service::dispatch`] copies the payload out and remembers the
//!    submission time.
//! 2. [`Service::acquire`] locks the request again and checks that it still
//!    belongs to this service and to the same submission.  A caller that took
//!    the request back makes this fail with [`BusError::RequestBadOwner`] (it
//!    now belongs elsewhere or nowhere) or [`BusError::RequestObsolete`] (it
//!    was resubmitted here).
//! 3. [`Responder::respond`] writes the response and notifies the caller.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RawMutex;
use parking_lot::lock_api::ArcMutexGuard;
use rtbus_kernel::Notifier;
use rtbus_types::{BusError, BusResult, QueueLength, RtClass, ServiceId, ServiceStats, Timestamp};
use tracing::{debug, trace, warn};

use crate::request::{RequestCell, RequestState};

#[derive(Default)]
struct RequestQueue {
    hrt: VecDeque<RequestCell>,
    fsrt: VecDeque<RequestCell>,
    nrt: VecDeque<RequestCell>,
}

impl RequestQueue {
    fn partition(&mut self, class: RtClass) -> &mut VecDeque<RequestCell> {
        match class {
            RtClass::Hrt => &mut self.hrt,
            RtClass::Frt | RtClass::Srt => &mut self.fsrt,
            RtClass::Nrt => &mut self.nrt,
        }
    }

    fn front(&self) -> Option<&RequestCell> {
        self.hrt
            .front()
            .or_else(|| self.fsrt.front())
            .or_else(|| self.nrt.front())
    }

    fn pop_front(&mut self) -> Option<RequestCell> {
        self.hrt
            .pop_front()
            .or_else(|| self.fsrt.pop_front())
            .or_else(|| self.nrt.pop_front())
    }

    fn length(&self) -> QueueLength {
        QueueLength {
            total: self.hrt.len() + self.fsrt.len() + self.nrt.len(),
            hrt: self.hrt.len(),
            fsrt: self.fsrt.len(),
            nrt: self.nrt.len(),
        }
    }
}

pub(crate) struct ServiceInner {
    id: ServiceId,
    notifier: Notifier,
    queue: parking_lot::Mutex<RequestQueue>,
    calls: AtomicU64,
    ownership_lost: AtomicU64,
}

impl ServiceInner {
    /// Queue `cell` and wake the service thread.  Called with the request
    /// locked.
    pub(crate) fn enqueue(&self, class: RtClass, cell: RequestCell) {
        let mut queue = self.queue.lock();
        queue.partition(class).push_back(cell);
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.notifier.notify();
    }

    /// Forget `cell`, which its caller took back.  Called with the request
    /// locked.
    pub(crate) fn detach(&self, class: RtClass, cell: &RequestCell) {
        let removed = {
            let mut queue = self.queue.lock();
            let partition = queue.partition(class);
            match partition.iter().position(|queued| Arc::ptr_eq(queued, cell)) {
                Some(pos) => partition.remove(pos).is_some(),
                None => false,
            }
        };
        self.ownership_lost.fetch_add(1, Ordering::Relaxed);
        warn!(service = self.id, %class, queued = removed, "request ownership lost");
    }
}

/// RPC endpoint.  Cloning yields another handle to the same queue.
///
/// The service thread is woken through the [`Notifier`] given to
/// [`Service::new`] whenever a request is submitted.
#[derive(Clone)]
pub struct Service {
    pub(crate) inner: Arc<ServiceInner>,
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.inner.id)
            .field("queue", &self.queue_length())
            .finish()
    }
}

impl Service {
    pub fn new(id: ServiceId, notifier: Notifier) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                id,
                notifier,
                queue: parking_lot::Mutex::new(RequestQueue::default()),
                calls: AtomicU64::new(0),
                ownership_lost: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> ServiceId {
        self.inner.id
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    /// Take the most urgent request off the queue and copy its payload into
    /// `buf`.
    ///
    /// Returns `Ok(None)` when the queue is empty.  A request that does not
    /// fit `buf` stays queued and [`BusError::PayloadTooLarge`] is returned.
    pub fn dispatch(&self, buf: &mut [u8]) -> BusResult<Option<Dispatched>> {
        loop {
            let mut queue = self.inner.queue.lock();
            let Some(cell) = queue.front().cloned() else {
                return Ok(None);
            };
            if let Some(state) = cell.try_lock() {
                return self.take_front(&mut queue, &cell, &state, buf);
            }

            // The caller may hold its request while waiting for this queue.
            // Lock order is request then queue, so park on the request first
            // and take the front only if nobody detached it meanwhile.
            drop(queue);
            let state = cell.lock();
            let mut queue = self.inner.queue.lock();
            if queue.front().is_some_and(|front| Arc::ptr_eq(front, &cell)) {
                return self.take_front(&mut queue, &cell, &state, buf);
            }
            trace!(service = self.inner.id, "queue front changed while waiting");
        }
    }

    /// Pop `cell`, the locked front of `queue`, and copy its payload.
    fn take_front(
        &self,
        queue: &mut RequestQueue,
        cell: &RequestCell,
        state: &RequestState,
        buf: &mut [u8],
    ) -> BusResult<Option<Dispatched>> {
        if state.size > buf.len() {
            return Err(BusError::PayloadTooLarge {
                size: state.size,
                capacity: buf.len(),
            });
        }
        buf[..state.size].copy_from_slice(&state.payload[..state.size]);
        let dispatched = Dispatched {
            submission: state.submission,
            size: state.size,
            no_return: state.notifier.is_none(),
            class: state.class,
            request: Arc::clone(cell),
        };
        queue.pop_front();
        trace!(
            service = self.inner.id,
            class = %dispatched.class,
            submission = %dispatched.submission,
            "request dispatched"
        );
        Ok(Some(dispatched))
    }

    /// Lock a dispatched request to answer it.
    pub fn acquire(&self, dispatched: Dispatched) -> BusResult<Responder> {
        let guard = dispatched.request.lock_arc();
        self.check(guard, &dispatched)
    }

    /// Like [`acquire`](Self::acquire) but fails with
    /// [`BusError::RequestLocked`] instead of waiting for the lock.
    pub fn try_acquire(&self, dispatched: Dispatched) -> BusResult<Responder> {
        let guard = dispatched
            .request
            .try_lock_arc()
            .ok_or(BusError::RequestLocked)?;
        self.check(guard, &dispatched)
    }

    fn check(
        &self,
        guard: ArcMutexGuard<RawMutex, RequestState>,
        dispatched: &Dispatched,
    ) -> BusResult<Responder> {
        if !self.owns(guard.owner.as_ref()) {
            debug!(service = self.inner.id, "dispatched request changed owner");
            return Err(BusError::RequestBadOwner);
        }
        if guard.submission != dispatched.submission {
            debug!(service = self.inner.id, "dispatched request was resubmitted");
            return Err(BusError::RequestObsolete);
        }
        Ok(Responder {
            guard,
            service: self.inner.id,
        })
    }

    fn owns(&self, owner: Option<&Weak<ServiceInner>>) -> bool {
        owner.is_some_and(|owner| std::ptr::eq(owner.as_ptr(), Arc::as_ptr(&self.inner)))
    }

    pub fn queue_length(&self) -> QueueLength {
        self.inner.queue.lock().length()
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            id: self.inner.id,
            calls: self.inner.calls.load(Ordering::Relaxed),
            ownership_lost: self.inner.ownership_lost.load(Ordering::Relaxed),
            queue: self.queue_length(),
        }
    }
}

/// A request taken off the queue by [`Service::dispatch`].
pub struct Dispatched {
    request: RequestCell,
    submission: Timestamp,
    size: usize,
    no_return: bool,
    class: RtClass,
}

impl fmt::Debug for Dispatched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatched")
            .field("class", &self.class)
            .field("submission", &self.submission)
            .field("size", &self.size)
            .field("no_return", &self.no_return)
            .finish()
    }
}

impl Dispatched {
    pub fn submission(&self) -> Timestamp {
        self.submission
    }

    /// Bytes copied by `dispatch`.
    pub fn size(&self) -> usize {
        self.size
    }

    /// `true` for fire-and-forget calls.
    pub fn no_return(&self) -> bool {
        self.no_return
    }

    pub fn class(&self) -> RtClass {
        self.class
    }
}

/// Locked request ready to be answered.
pub struct Responder {
    guard: ArcMutexGuard<RawMutex, RequestState>,
    service: ServiceId,
}

impl Responder {
    /// The whole request buffer; the response is written in place.
    pub fn payload(&self) -> &[u8] {
        &self.guard.payload
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.guard.payload
    }

    /// Hand the first `size` bytes back to the caller and release the
    /// request.
    pub fn respond(mut self, size: usize) -> BusResult<()> {
        let capacity = self.guard.payload.len();
        if size > capacity {
            return Err(BusError::PayloadTooLarge { size, capacity });
        }
        self.guard.owner = None;
        self.guard.size = size;
        if let Some(notifier) = &self.guard.notifier {
            notifier.notify();
        }
        debug!(service = self.service, size, "request answered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Core;
    use crate::request::Request;
    use rtbus_kernel::{ManualClock, Signal};
    use rtbus_types::{BusConfig, RetrievePolicy};
    use std::thread;
    use std::time::Duration;

    fn core() -> Arc<Core> {
        Core::new(BusConfig::default(), Arc::new(ManualClock::default()))
    }

    fn service(id: ServiceId) -> Service {
        Service::new(id, Notifier::new(Signal::new(), 1))
    }

    fn submit(request: &Request, service: &Service, payload: &[u8]) {
        let mut guard = request.acquire().unwrap();
        guard.payload_mut()[..payload.len()].copy_from_slice(payload);
        guard.submit(service, payload.len(), 1, None).unwrap();
    }

    #[test]
    fn dispatch_on_empty_queue() {
        let mut buf = [0u8; 4];
        assert!(service(1).dispatch(&mut buf).unwrap().is_none());
    }

    #[test]
    fn dispatch_serves_partitions_in_priority_order() {
        let core = core();
        let service = service(1);
        let nrt = Request::nrt(&core, 4);
        let srt = Request::srt(&core, 4);
        let frt = Request::frt(&core, 4, None);
        let hrt = Request::hrt(&core, 4, None, crate::qos::Recovery::Panic);

        submit(&nrt, &service, &[1]);
        submit(&srt, &service, &[2]);
        submit(&frt, &service, &[3]);
        submit(&hrt, &service, &[4]);
        assert_eq!(
            service.queue_length(),
            QueueLength {
                total: 4,
                hrt: 1,
                fsrt: 2,
                nrt: 1
            }
        );

        let mut order = Vec::new();
        let mut buf = [0u8; 4];
        while let Some(dispatched) = service.dispatch(&mut buf).unwrap() {
            order.push((dispatched.class(), buf[0]));
        }
        assert_eq!(
            order,
            vec![
                (RtClass::Hrt, 4),
                (RtClass::Srt, 2),
                (RtClass::Frt, 3),
                (RtClass::Nrt, 1)
            ]
        );
    }

    #[test]
    fn payload_too_large_keeps_request_queued() {
        let core = core();
        let service = service(1);
        let request = Request::nrt(&core, 8);
        submit(&request, &service, &[0; 6]);

        let mut small = [0u8; 4];
        assert_eq!(
            service.dispatch(&mut small).err(),
            Some(BusError::PayloadTooLarge {
                size: 6,
                capacity: 4
            })
        );
        assert_eq!(service.queue_length().total, 1);
        let mut buf = [0u8; 8];
        assert_eq!(service.dispatch(&mut buf).unwrap().map(|d| d.size()), Some(6));
    }

    #[test]
    fn two_callers_are_answered_in_order() {
        let core = core();
        let service = service(1);
        let first = Request::nrt(&core, 4);
        let second = Request::nrt(&core, 4);
        submit(&first, &service, &[10]);
        submit(&second, &service, &[20]);

        let mut buf = [0u8; 4];
        for _ in 0..2 {
            let dispatched = service.dispatch(&mut buf).unwrap().unwrap();
            let doubled = buf[0] * 2;
            let mut responder = service.acquire(dispatched).unwrap();
            responder.payload_mut()[0] = doubled;
            responder.respond(1).unwrap();
        }

        assert_eq!(first.retrieve(RetrievePolicy::Blocking).unwrap().payload(), &[20]);
        assert_eq!(second.retrieve(RetrievePolicy::Blocking).unwrap().payload(), &[40]);
        assert_eq!(service.stats().calls, 2);
    }

    #[test]
    fn resubmitted_request_is_obsolete_for_earlier_dispatch() {
        let core = core();
        let service = service(1);
        let request = Request::nrt(&core, 4);
        submit(&request, &service, &[1]);

        let mut buf = [0u8; 4];
        let stale = service.dispatch(&mut buf).unwrap().unwrap();
        assert!(request.retrieve(RetrievePolicy::Enforcing).is_err());
        submit(&request, &service, &[2]);

        assert_eq!(service.acquire(stale).err(), Some(BusError::RequestObsolete));
        let fresh = service.dispatch(&mut buf).unwrap().unwrap();
        assert_eq!(buf[0], 2);
        assert!(service.acquire(fresh).is_ok());
    }

    #[test]
    fn request_moved_to_other_service_is_bad_owner() {
        let core = core();
        let a = service(1);
        let b = service(2);
        let request = Request::nrt(&core, 4);
        submit(&request, &a, &[1]);

        let mut buf = [0u8; 4];
        let dispatched = a.dispatch(&mut buf).unwrap().unwrap();
        assert!(request.retrieve(RetrievePolicy::Enforcing).is_err());
        assert_eq!(a.stats().ownership_lost, 1);

        let taken_back = a.dispatch(&mut buf).unwrap();
        assert!(taken_back.is_none());
        submit(&request, &b, &[1]);
        assert_eq!(a.acquire(dispatched).err(), Some(BusError::RequestBadOwner));
    }

    #[test]
    fn try_acquire_reports_locked_request() {
        let core = core();
        let service = service(1);
        let request = Request::nrt(&core, 4);
        submit(&request, &service, &[1]);

        let mut buf = [0u8; 4];
        let dispatched = service.dispatch(&mut buf).unwrap().unwrap();
        let cell = Arc::clone(&dispatched.request);
        let held = cell.lock();
        assert_eq!(
            service.try_acquire(dispatched).err(),
            Some(BusError::RequestLocked)
        );
        drop(held);
    }

    #[test]
    fn dispatch_waits_out_a_locked_request() {
        let core = core();
        let service = service(1);
        let request = Request::nrt(&core, 4);
        submit(&request, &service, &[9]);

        let cell = Arc::clone(service.inner.queue.lock().front().unwrap());
        let holder = thread::spawn(move || {
            let _held = cell.lock();
            thread::sleep(Duration::from_millis(30));
        });
        thread::sleep(Duration::from_millis(5));

        let mut buf = [0u8; 4];
        let dispatched = service.dispatch(&mut buf).unwrap().unwrap();
        assert_eq!(buf[0], 9);
        assert!(!dispatched.no_return());
        holder.join().unwrap();
    }

    #[test]
    fn dispatch_skips_request_detached_while_waiting() {
        let core = core();
        let service = service(1);
        let request = Request::nrt(&core, 4);
        submit(&request, &service, &[9]);

        let cell = Arc::clone(service.inner.queue.lock().front().unwrap());
        let inner = Arc::clone(&service.inner);
        let holder = thread::spawn(move || {
            let held = cell.lock();
            thread::sleep(Duration::from_millis(30));
            inner.detach(RtClass::Nrt, &cell);
            drop(held);
        });
        thread::sleep(Duration::from_millis(5));

        let mut buf = [0u8; 4];
        assert!(service.dispatch(&mut buf).unwrap().is_none());
        holder.join().unwrap();
        assert_eq!(service.queue_length().total, 0);
        assert_eq!(service.stats().ownership_lost, 1);
    }

    #[test]
    fn fire_and_forget_is_flagged() {
        let core = core();
        let service = service(1);
        let request = Request::nrt(&core, 4);
        request.acquire().unwrap().submit(&service, 0, 0, None).unwrap();

        let mut buf = [0u8; 4];
        let dispatched = service.dispatch(&mut buf).unwrap().unwrap();
        assert!(dispatched.no_return());
    }

    #[test]
    fn respond_rejects_oversized_response() {
        let core = core();
        let service = service(1);
        let request = Request::nrt(&core, 2);
        submit(&request, &service, &[1]);

        let mut buf = [0u8; 4];
        let dispatched = service.dispatch(&mut buf).unwrap().unwrap();
        let responder = service.acquire(dispatched).unwrap();
        assert_eq!(
            responder.respond(3).err(),
            Some(BusError::PayloadTooLarge {
                size: 3,
                capacity: 2
            })
        );
    }
}
