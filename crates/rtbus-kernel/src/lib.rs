//! `rtbus-kernel` – Kernel services the bus is built on.
//!
//! The middleware only needs a handful of things from the operating system:
//! a clock, a way to put a thread to sleep until something happens, and
//! one-shot timers.  They live here so that the middleware itself never
//! touches `std::thread` or `Instant` directly.
//!
//! # Modules
//!
//! - [`clock`] – [`Clock`][clock::Clock] trait with the monotonic
//!   [`SystemClock`][clock::SystemClock] and the test-driven
//!   [`ManualClock`][clock::ManualClock].
//! - [`events`] – per-thread [`Signal`][events::Signal]s,
//!   [`EventSource`][events::EventSource] broadcast points with their
//!   [`EventListener`][events::EventListener]s, and the point-to-point
//!   [`Notifier`][events::Notifier].
//! - [`timer`] – [`TimerService`][timer::TimerService] of one-shot
//!   [`QosTimer`][timer::QosTimer]s used for deadline, jitter and rate
//!   monitoring.

pub mod clock;
pub mod events;
pub mod timer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use events::{EventListener, EventSource, Notifier, Signal, WaitMode, current_signal};
pub use timer::{QosTimer, TimerCallback, TimerService, TimerThread};
