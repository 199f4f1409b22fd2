//! `rtbus-middleware` – Topics, services and barriers
//!
//! Moves data between node threads of one process under explicit timing
//! contracts.  Every engine reports contract breaches through
//! [`rtbus_types::BusError`]; hard real-time breaches without a recovery
//! handler panic the [`Core`].
//!
//! # Modules
//!
//! - [`core`] – Shared bus state: clock, QoS timers, status and the node
//!   stage barrier.
//! - [`topic`] / [`publisher`] / [`subscriber`] – Ring-buffered
//!   publish/subscribe with NRT, SRT, FRT and HRT subscribers.
//! - [`service`] / [`request`] – Prioritised RPC with ownership tracking.
//! - [`syncgroup`] – Reusable barrier between node threads.
//! - [`sync`] – Two-phase external synchronisation gate.
//! - [`qos`] – Latency windows and recovery policies shared by the engines.

pub mod core;
pub mod publisher;
pub mod qos;
pub mod request;
pub mod service;
pub mod subscriber;
pub mod sync;
pub mod syncgroup;
pub mod topic;

pub use crate::core::{CORE_EMERGENCY, CORE_PROCEED, CORE_TERMINATE, Core, NodeId};
pub use publisher::Publisher;
pub use qos::{LatencyWindow, Recovery, RecoveryHandler};
pub use request::{Request, RequestGuard, Retrieved};
pub use service::{Dispatched, Responder, Service};
pub use subscriber::{
    Fetched, FrtSubscriber, HrtSubscriber, NrtSubscriber, SrtSubscriber, Subscriber, Usefulness,
};
pub use sync::{ExternalSync, SyncGate, SyncHandler};
pub use syncgroup::{SYNC_FAILED, SYNC_PROCEED, SyncGroup, SyncNode};
pub use topic::Topic;
