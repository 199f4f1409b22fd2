//! Event primitives: thread [`Signal`]s, [`EventSource`]s and
//! [`EventListener`]s.
//!
//! The model is the classic RTOS one:
//!
//! | Primitive | Role |
//! |---|---|
//! | [`Signal`] | Per-thread set of pending event bits.  A thread blocks in [`Signal::wait`] until bits of interest are raised. |
//! | [`EventSource`] | Something that happens (a topic got a message, a barrier completed).  [`EventSource::broadcast`] marks every registered listener. |
//! | [`EventListener`] | Registration of one thread on one source: the source raises the listener's mask on the thread's signal and accumulates broadcast flags in the listener. |
//! | [`Notifier`] | Direct point-to-point signal (thread + mask) used by the RPC engine. |
//!
//! Broadcasting never blocks on the receiving side.  Dropping a listener
//! unregisters it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rtbus_types::{EventFlags, EventMask};

// ────────────────────────────────────────────────────────────────────────────
// Signal
// ────────────────────────────────────────────────────────────────────────────

/// Whether a wait completes on any or on all requested bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    Any,
    All,
}

/// Pending event bits of one thread.
#[derive(Debug, Default)]
pub struct Signal {
    pending: Mutex<EventMask>,
    raised: Condvar,
}

thread_local! {
    static CURRENT: Arc<Signal> = Arc::new(Signal::default());
}

/// The signal owned by the calling thread.
pub fn current_signal() -> Arc<Signal> {
    CURRENT.with(Arc::clone)
}

impl Signal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Set `mask` bits and wake the waiting thread.
    pub fn raise(&self, mask: EventMask) {
        let mut pending = self.pending.lock();
        *pending |= mask;
        self.raised.notify_all();
    }

    pub fn pending(&self) -> EventMask {
        *self.pending.lock()
    }

    /// Clear `mask` bits and return the ones that were set.
    pub fn clear(&self, mask: EventMask) -> EventMask {
        let mut pending = self.pending.lock();
        let hit = *pending & mask;
        *pending &= !mask;
        hit
    }

    /// Block until bits of `mask` are pending (any or all, per `mode`), clear
    /// and return them.  Returns `0` if `timeout` elapses first.
    pub fn wait(&self, mask: EventMask, mode: WaitMode, timeout: Option<Duration>) -> EventMask {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut pending = self.pending.lock();
        loop {
            let hit = *pending & mask;
            let ready = match mode {
                WaitMode::Any => hit != 0,
                WaitMode::All => hit == mask,
            };
            if ready {
                *pending &= !hit;
                return hit;
            }
            match deadline {
                None => self.raised.wait(&mut pending),
                Some(deadline) => {
                    if self.raised.wait_until(&mut pending, deadline).timed_out() {
                        let hit = *pending & mask;
                        let ready = match mode {
                            WaitMode::Any => hit != 0,
                            WaitMode::All => hit == mask,
                        };
                        if !ready {
                            return 0;
                        }
                        *pending &= !hit;
                        return hit;
                    }
                }
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Notifier
// ────────────────────────────────────────────────────────────────────────────

/// A thread signal paired with the bits to raise on it.
#[derive(Debug, Clone)]
pub struct Notifier {
    signal: Arc<Signal>,
    mask: EventMask,
}

impl Notifier {
    pub fn new(signal: Arc<Signal>, mask: EventMask) -> Self {
        Self { signal, mask }
    }

    /// Notifier targeting the calling thread.
    pub fn current(mask: EventMask) -> Self {
        Self::new(current_signal(), mask)
    }

    pub fn mask(&self) -> EventMask {
        self.mask
    }

    pub fn signal(&self) -> &Arc<Signal> {
        &self.signal
    }

    pub fn notify(&self) {
        self.signal.raise(self.mask);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Event source / listener
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ListenerSlot {
    signal: Arc<Signal>,
    mask: EventMask,
    flags: AtomicU32,
}

/// Registration of a thread signal on an [`EventSource`].
///
/// Unregisters itself when dropped.
#[derive(Debug)]
pub struct EventListener {
    slot: Arc<ListenerSlot>,
}

impl EventListener {
    pub fn mask(&self) -> EventMask {
        self.slot.mask
    }

    pub fn signal(&self) -> &Arc<Signal> {
        &self.slot.signal
    }

    /// Flags accumulated since they were last cleared.
    pub fn flags(&self) -> EventFlags {
        self.slot.flags.load(Ordering::SeqCst)
    }

    /// Clear `flags` and return the ones that were set.
    pub fn clear_flags(&self, flags: EventFlags) -> EventFlags {
        self.slot.flags.fetch_and(!flags, Ordering::SeqCst) & flags
    }
}

/// Broadcast point that any number of threads can listen to.
///
/// # Example
///
/// ```
/// use rtbus_kernel::events::{EventSource, Signal, WaitMode};
///
/// let source = EventSource::new();
/// let signal = Signal::new();
/// let listener = source.register(signal.clone(), 0b100);
///
/// source.broadcast(0x1);
/// assert_eq!(signal.wait(0b100, WaitMode::Any, None), 0b100);
/// assert_eq!(listener.clear_flags(u32::MAX), 0x1);
/// ```
#[derive(Debug, Default)]
pub struct EventSource {
    listeners: Mutex<Vec<Weak<ListenerSlot>>>,
}

impl EventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `signal`; broadcasts raise `mask` on it.
    pub fn register(&self, signal: Arc<Signal>, mask: EventMask) -> EventListener {
        let slot = Arc::new(ListenerSlot {
            signal,
            mask,
            flags: AtomicU32::new(0),
        });
        self.listeners.lock().push(Arc::downgrade(&slot));
        EventListener { slot }
    }

    /// Mark every live listener with `flags` and signal its thread.
    ///
    /// Returns the number of listeners reached.
    pub fn broadcast(&self, flags: EventFlags) -> usize {
        let live: Vec<Arc<ListenerSlot>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in &live {
            listener.flags.fetch_or(flags, Ordering::SeqCst);
            listener.signal.raise(listener.mask);
        }
        live.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .iter()
            .filter(|l| l.strong_count() > 0)
            .count()
    }
}
