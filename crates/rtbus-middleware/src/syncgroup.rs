//! [`SyncGroup`] – reusable barrier between node threads.
//!
//! Every member is either `Synced` (working) or `Pending` (arrived at the
//! barrier).  The last member to arrive completes the barrier: all members go
//! back to `Synced` and [`SYNC_PROCEED`] is broadcast to their listeners.  A
//! group built with [`SyncGroup::with_sync`] additionally runs an
//! [`ExternalSync`]: it is started when the first member arrives and
//! finalised by the last one, and the broadcast then comes from the sync
//! gate.
//!
//! | Event | Effect |
//! |---|---|
//! | `join` | member added, `Pending` if a barrier is in progress |
//! | `synchronize` | member `Pending`; last one completes |
//! | `leave` | member removed; completes if the rest is waiting |

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rtbus_kernel::{EventListener, EventSource, current_signal};
use rtbus_types::{BusError, BusResult, EventFlags, EventMask, SyncState, SyncStatus};
use tracing::{debug, info, warn};

use crate::sync::ExternalSync;

/// Broadcast when the barrier completed.
pub const SYNC_PROCEED: EventFlags = 1 << 0;
/// Broadcast when the external sync failed.
pub const SYNC_FAILED: EventFlags = 1 << 1;

struct GroupState {
    /// Most recently joined first.
    nodes: Vec<(u64, SyncStatus)>,
    next_key: u64,
}

impl GroupState {
    fn all_pending(&self) -> bool {
        !self.nodes.is_empty()
            && self
                .nodes
                .iter()
                .all(|(_, status)| *status == SyncStatus::Pending)
    }

    fn position(&self, key: u64) -> Option<usize> {
        self.nodes.iter().position(|(k, _)| *k == key)
    }
}

/// Shared barrier.  Members are [`SyncNode`]s.
pub struct SyncGroup {
    state: Mutex<GroupState>,
    events: Arc<EventSource>,
    sync: Option<Arc<ExternalSync>>,
}

impl fmt::Debug for SyncGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncGroup")
            .field("members", &self.len())
            .field("sync", &self.sync)
            .finish()
    }
}

impl SyncGroup {
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    pub fn with_sync(sync: Arc<ExternalSync>) -> Arc<Self> {
        Self::build(Some(sync))
    }

    fn build(sync: Option<Arc<ExternalSync>>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GroupState {
                nodes: Vec::new(),
                next_key: 0,
            }),
            events: Arc::new(EventSource::new()),
            sync,
        })
    }

    pub fn event_source(&self) -> &Arc<EventSource> {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` when no barrier is in progress.
    pub fn is_synchronized(&self) -> bool {
        let state = self.state.lock();
        let sync_idle = self
            .sync
            .as_ref()
            .is_none_or(|sync| sync.state() == SyncState::Idle);
        sync_idle
            && state
                .nodes
                .iter()
                .all(|(_, status)| *status == SyncStatus::Synced)
    }

    /// Release every member.  Called with the group locked after the members
    /// were reset to `Synced`.
    fn complete(&self) -> BusResult<SyncStatus> {
        match &self.sync {
            Some(sync) => sync.finalize(&self.events, SYNC_PROCEED, SYNC_FAILED),
            None => {
                self.events.broadcast(SYNC_PROCEED);
                Ok(SyncStatus::Synced)
            }
        }
    }
}

struct Membership {
    group: Arc<SyncGroup>,
    key: u64,
    listener: EventListener,
}

/// One participant of a [`SyncGroup`].
///
/// The node listens on the signal of the thread that joined.  Dropping a
/// joined node leaves the group.
///
/// # Example
///
/// ```
/// use rtbus_middleware::{SyncGroup, SyncNode, SYNC_PROCEED};
/// use rtbus_types::SyncStatus;
///
/// let group = SyncGroup::new();
/// let mut a = SyncNode::new();
/// let mut b = SyncNode::new();
/// a.join(&group, 0b1).unwrap();
/// b.join(&group, 0b1).unwrap();
///
/// assert_eq!(a.synchronize(), Ok(SyncStatus::Pending));
/// assert_eq!(b.synchronize(), Ok(SyncStatus::Synced));
/// assert_eq!(a.listener().unwrap().flags(), SYNC_PROCEED);
/// ```
#[derive(Default)]
pub struct SyncNode {
    membership: Option<Membership>,
}

impl fmt::Debug for SyncNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncNode")
            .field("joined", &self.is_joined())
            .field("status", &self.status())
            .finish()
    }
}

impl SyncNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_joined(&self) -> bool {
        self.membership.is_some()
    }

    /// Listener registered on the group's event source while joined.
    pub fn listener(&self) -> Option<&EventListener> {
        self.membership.as_ref().map(|m| &m.listener)
    }

    /// Current state of this member, `None` when not joined.
    pub fn status(&self) -> Option<SyncStatus> {
        let membership = self.membership.as_ref()?;
        let state = membership.group.state.lock();
        state.position(membership.key).map(|pos| state.nodes[pos].1)
    }

    /// Join `group`, leaving the current group first.
    ///
    /// `mask` is raised on the calling thread's signal when the group
    /// broadcasts.  Returns `Pending` when a barrier is already in progress:
    /// the new member then counts as arrived.
    pub fn join(&mut self, group: &Arc<SyncGroup>, mask: EventMask) -> BusResult<SyncStatus> {
        if self.membership.is_some() {
            self.leave()?;
        }
        let mut state = group.state.lock();
        let status = if state
            .nodes
            .iter()
            .any(|(_, status)| *status == SyncStatus::Pending)
        {
            SyncStatus::Pending
        } else {
            SyncStatus::Synced
        };
        let key = state.next_key;
        state.next_key += 1;
        state.nodes.insert(0, (key, status));
        let listener = group.events.register(current_signal(), mask);
        debug!(members = state.nodes.len(), ?status, "node joined sync group");
        drop(state);

        self.membership = Some(Membership {
            group: Arc::clone(group),
            key,
            listener,
        });
        Ok(status)
    }

    /// Leave the group.  When every remaining member is waiting the barrier
    /// completes.
    pub fn leave(&mut self) -> BusResult<()> {
        let membership = self.membership.take().ok_or(BusError::NotJoined)?;
        let group = &membership.group;
        let mut state = group.state.lock();
        if let Some(pos) = state.position(membership.key) {
            state.nodes.remove(pos);
        }
        drop(membership.listener);
        debug!(members = state.nodes.len(), "node left sync group");

        if !state.all_pending() {
            return Ok(());
        }
        for (_, status) in state.nodes.iter_mut() {
            *status = SyncStatus::Synced;
        }
        info!(members = state.nodes.len(), "sync group released by leaving node");
        group.complete().map(|_| ())
    }

    /// Arrive at the barrier.
    ///
    /// Returns `Synced` when this call completed the barrier, `Pending` when
    /// other members are still working (including repeated calls while
    /// waiting).
    pub fn synchronize(&self) -> BusResult<SyncStatus> {
        let membership = self.membership.as_ref().ok_or(BusError::NotJoined)?;
        let group = &membership.group;
        let mut state = group.state.lock();
        let pos = state.position(membership.key).ok_or(BusError::NotJoined)?;
        if state.nodes[pos].1 == SyncStatus::Pending {
            return Ok(SyncStatus::Pending);
        }
        state.nodes[pos].1 = SyncStatus::Pending;

        if state.all_pending() {
            for (_, status) in state.nodes.iter_mut() {
                *status = SyncStatus::Synced;
            }
            info!(members = state.nodes.len(), "sync group complete");
            return group.complete();
        }

        match &group.sync {
            Some(sync) if sync.state() == SyncState::Idle => {
                sync.start(&group.events, SYNC_FAILED)
            }
            _ => Ok(SyncStatus::Pending),
        }
    }
}

impl Drop for SyncNode {
    fn drop(&mut self) {
        if self.membership.is_none() {
            return;
        }
        if let Err(e) = self.leave() {
            warn!(error = %e, "leaving sync group on drop failed");
        }
    }
}
