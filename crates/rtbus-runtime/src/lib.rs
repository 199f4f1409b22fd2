//! `rtbus-runtime` – Node threads and process telemetry
//!
//! Hosts the nodes that talk over the bus and wires up logging.
//!
//! # Modules
//!
//! - [`node`] – [`Node`][node::Node] trait and the [`Executor`][node::Executor]
//!   that runs every node on its own thread behind a start barrier.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   installs the global `tracing` subscriber with optional JSON output and
//!   OTLP span export.

pub mod node;
pub mod telemetry;

pub use node::{CORE_EVENT_BIT, Executor, Node, NodeContext, RuntimeError};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
