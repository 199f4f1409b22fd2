//! `rtbus-types` – shared vocabulary of the real-time bus.
//!
//! Every other crate in the workspace speaks in these types: timestamps and
//! message ids, real-time classes, publish/retrieve policies, QoS contracts,
//! the [`BusError`] status taxonomy, the serde-backed [`BusConfig`] and the
//! profiling snapshots reported by topics, subscribers and services.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;
use std::time::Duration;
use thiserror::Error;

// ────────────────────────────────────────────────────────────────────────────
// Time
// ────────────────────────────────────────────────────────────────────────────

/// Absolute point in time with microsecond resolution.
///
/// The epoch is defined by the clock that produced the value; timestamps from
/// different clocks must not be compared.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The clock epoch.
    pub const ZERO: Self = Self(0);

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000))
    }

    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }

    /// Add `delay`, clamping at the end of the representable range.
    pub fn saturating_add(self, delay: Duration) -> Self {
        let micros = u64::try_from(delay.as_micros()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(micros))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        self.saturating_add(rhs)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Identifiers
// ────────────────────────────────────────────────────────────────────────────

/// Sequence number of a published message.
///
/// `0` is reserved as [`MessageId::INVALID`] and marks slots that never held a
/// message.  [`MessageId::next`] skips it on wraparound.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MessageId(u64);

impl MessageId {
    pub const INVALID: Self = Self(0);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// The id following `self`, never [`MessageId::INVALID`].
    pub const fn next(self) -> Self {
        match self.0.wrapping_add(1) {
            0 => Self(1),
            n => Self(n),
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Numeric topic identifier.
pub type TopicId = u32;

/// Numeric service identifier.
pub type ServiceId = u32;

/// Bit set selecting which events a thread waits for.
pub type EventMask = u32;

/// Payload flags attached to a broadcast event.
pub type EventFlags = u32;

// ────────────────────────────────────────────────────────────────────────────
// Real-time classes and policies
// ────────────────────────────────────────────────────────────────────────────

/// Timing contract class of a subscriber or request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RtClass {
    /// Hard real-time: a violated contract is fatal unless a recovery handler
    /// is registered.
    Hrt,
    /// Firm real-time: late results are worthless and reported as violations.
    Frt,
    /// Soft real-time: late results lose usefulness gradually.
    Srt,
    /// Non real-time: best effort.
    Nrt,
}

impl fmt::Display for RtClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtClass::Hrt => write!(f, "hrt"),
            RtClass::Frt => write!(f, "frt"),
            RtClass::Srt => write!(f, "srt"),
            RtClass::Nrt => write!(f, "nrt"),
        }
    }
}

/// How a publisher treats contention and pending mandatory consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PublishPolicy {
    /// Only try the topic lock; never wait.
    Lazy,
    /// Take the lock and, if a timeout is given, wait for the next slot to be
    /// released by its hard real-time consumers.
    #[default]
    Blocking,
    /// Take the lock and overwrite the next slot unconditionally.
    Enforcing,
}

/// How a caller retrieves the answer of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RetrievePolicy {
    /// Only try the request lock.
    Lazy,
    /// Take the request lock; fail if a service still owns the request.
    #[default]
    Blocking,
    /// Take the request lock and detach the request from its service if it
    /// has not been answered yet.
    Enforcing,
}

/// Ordering of the messages in a topic's ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MessageOrder {
    /// Messages are ordered by the time they were published.
    #[default]
    PubTime,
    /// Messages are ordered by the timestamp of the information they carry.
    MsgTime,
}

/// Outcome of a synchronisation call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    /// The barrier completed.
    Synced,
    /// The barrier is still waiting for other participants.
    Pending,
}

/// State of an external synchronisation gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    #[default]
    Idle,
    Pending,
    Failed,
}

/// Phase passed to an external synchronisation handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStage {
    /// Kick off the external synchronisation. Must not complete it.
    Initial,
    /// Complete the synchronisation now or report it as pending.
    Final,
}

// ────────────────────────────────────────────────────────────────────────────
// QoS contract
// ────────────────────────────────────────────────────────────────────────────

/// Timing contract declared by a hard real-time subscriber.
///
/// Every field is optional; `None` disables the corresponding check.
///
/// ```
/// use std::time::Duration;
/// use rtbus_types::QosContract;
///
/// let qos = QosContract::default()
///     .with_deadline(Duration::from_millis(100))
///     .with_rate(Duration::from_millis(20));
/// assert_eq!(qos.jitter, None);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QosContract {
    /// Maximum latency between the message timestamp and its consumption.
    pub deadline: Option<Duration>,
    /// Maximum spread between the smallest and largest observed latency.
    pub jitter: Option<Duration>,
    /// Maximum interval between two consecutive pieces of information.
    pub rate: Option<Duration>,
}

impl QosContract {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub fn with_rate(mut self, rate: Duration) -> Self {
        self.rate = Some(rate);
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Every non-OK status the bus can report.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusError {
    #[error("deadline violation")]
    DeadlineViolation,

    #[error("jitter violation")]
    JitterViolation,

    #[error("rate violation")]
    RateViolation,

    #[error("external synchronisation failed")]
    SyncError,

    #[error("node is not a member of a sync group")]
    NotJoined,

    #[error("publish failed: topic is locked by another publisher")]
    PublishLocked,

    #[error("publish failed: next message is still pending for hard real-time consumers")]
    PublishBlocked,

    #[error("publish failed: timed out waiting for the next message to be released")]
    PublishTimeout,

    #[error("publish failed: information is older than the oldest buffered message")]
    PublishObsolete,

    #[error("no new message to fetch")]
    FetchNoMessage,

    #[error("request is owned by another service")]
    RequestBadOwner,

    #[error("request is locked")]
    RequestLocked,

    #[error("request is awaiting retrieval")]
    RequestPending,

    #[error("request was resubmitted after dispatch")]
    RequestObsolete,

    #[error("payload of {size} bytes exceeds capacity of {capacity} bytes")]
    PayloadTooLarge { size: usize, capacity: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BusError {
    /// `true` for deadline, jitter and rate violations.
    pub fn is_timing_violation(&self) -> bool {
        matches!(
            self,
            BusError::DeadlineViolation | BusError::JitterViolation | BusError::RateViolation
        )
    }
}

/// Result alias used throughout the bus.
pub type BusResult<T> = Result<T, BusError>;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

fn enabled() -> bool {
    true
}

/// Publish/subscribe QoS checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PubSubQos {
    #[serde(default = "enabled")]
    pub deadline: bool,
    #[serde(default = "enabled")]
    pub jitter: bool,
    #[serde(default = "enabled")]
    pub rate: bool,
}

impl Default for PubSubQos {
    fn default() -> Self {
        Self {
            deadline: true,
            jitter: true,
            rate: true,
        }
    }
}

/// RPC QoS checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RpcQos {
    #[serde(default = "enabled")]
    pub deadline: bool,
    #[serde(default = "enabled")]
    pub jitter: bool,
}

impl Default for RpcQos {
    fn default() -> Self {
        Self {
            deadline: true,
            jitter: true,
        }
    }
}

/// Build-time options of the bus, loaded at runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BusConfig {
    /// Ordering of every topic's message ring.
    #[serde(default)]
    pub message_order: MessageOrder,

    /// Which publish/subscribe timing checks are armed.
    #[serde(default)]
    pub pubsub_qos: PubSubQos,

    /// Which RPC timing checks are armed.
    #[serde(default)]
    pub rpc_qos: RpcQos,

    /// Default time a blocking publish waits for a slot to be released,
    /// in wall-clock time.  Absent means blocking publishes fail immediately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_timeout_ms: Option<u64>,
}

impl BusConfig {
    pub fn publish_timeout(&self) -> Option<Duration> {
        self.publish_timeout_ms.map(Duration::from_millis)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Profiling snapshots
// ────────────────────────────────────────────────────────────────────────────

/// Aggregated latency samples.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub samples: u64,
    pub sum_us: u64,
    pub min_us: Option<u64>,
    pub max_us: Option<u64>,
}

impl LatencyStats {
    pub fn record(&mut self, latency: Duration) {
        let us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.samples += 1;
        self.sum_us = self.sum_us.saturating_add(us);
        self.min_us = Some(self.min_us.map_or(us, |m| m.min(us)));
        self.max_us = Some(self.max_us.map_or(us, |m| m.max(us)));
    }

    pub fn mean_us(&self) -> Option<u64> {
        (self.samples > 0).then(|| self.sum_us / self.samples)
    }
}

/// Snapshot of a topic's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicStats {
    pub id: TopicId,
    pub capacity: usize,
    pub subscribers: usize,
    pub hrt_subscribers: usize,
    pub published: u64,
    pub discarded: u64,
    /// How often each slot has been written, in arena order.
    pub utilizations: Vec<u64>,
}

/// Snapshot of a publisher's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherStats {
    pub attempts: u64,
    pub fails: u64,
}

/// Snapshot of a subscriber's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberStats {
    pub class: RtClass,
    pub received: u64,
    pub latency: LatencyStats,
}

/// Number of queued requests per class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueLength {
    pub total: usize,
    pub hrt: usize,
    pub fsrt: usize,
    pub nrt: usize,
}

/// Snapshot of a service's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub id: ServiceId,
    pub calls: u64,
    pub ownership_lost: u64,
    pub queue: QueueLength,
}

/// Snapshot of a request's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestStats {
    pub class: RtClass,
    pub calls: u64,
    pub fails: u64,
    pub latency: LatencyStats,
}
