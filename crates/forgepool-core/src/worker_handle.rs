//! `WorkerHandle`: the pool-side proxy for one worker — liveness, busy
//! slots, pending in-flight tasks, and the drain/terminate state
//! machine.

use crate::channel::WorkerChannel;
use crate::envelope::TaskId;
use crate::error::PoolError;
use crate::task::Task;
use std::collections::HashMap;
use std::sync::Arc;

pub type WorkerId = u64;

/// `BOOTING -> READY -> (DRAINING | TERMINATING) -> TERMINATED`.
///
/// Why: the pool never looks at a raw process-exit code to decide
/// whether a worker is usable; it asks this state instead, so the
/// decision is the same whether the worker died, was asked to drain, or
/// was force-killed.
///
/// What: `Booting` covers the window between `spawn_worker` and the
/// worker's own `READY` envelope; `Draining` means no new task will be
/// assigned but in-flight ones finish; `Terminating` means the pool has
/// already committed to tearing the worker down.
///
/// How: legal edges are asserted by [`WorkerHandle::transition`] rather
/// than left to ad-hoc field writes, so an illegal transition panics in
/// debug builds instead of silently corrupting the fleet's bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Booting,
    Ready,
    Draining,
    Terminating,
    Terminated,
}

impl WorkerState {
    fn can_transition_to(self, to: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, to),
            (Booting, Ready)
                | (Booting, Terminating)
                | (Ready, Draining)
                | (Ready, Terminating)
                | (Draining, Terminating)
                | (Terminating, Terminated)
                // Idempotent re-entry into the terminal state is allowed:
                // both a channel exit and terminate() resolving can each
                // try to finalize the same worker.
                | (Terminated, Terminated)
        )
    }
}

/// Pool-side bookkeeping for one worker isolate.
///
/// Why: the control loop needs a single place to answer "can this
/// worker take another task" and "what is still pending on it" without
/// reaching into the transport; `WorkerHandle` is that place, kept
/// entirely on the pool side of the [`WorkerChannel`] seam.
///
/// What: owns the worker's [`WorkerState`], its map of in-flight
/// [`Task`]s keyed by id, and the `Arc<dyn WorkerChannel>` used to talk
/// to it. Exactly one `WorkerHandle` exists per live worker id.
pub struct WorkerHandle {
    pub id: WorkerId,
    pub channel: Arc<dyn WorkerChannel>,
    pub state: WorkerState,
    pub pending_tasks: HashMap<TaskId, Task>,
    pub max_tasks: usize,
    pub last_error: Option<PoolError>,
    /// Set by `try_dispatch` when a task is assigned to a worker that is
    /// still `Booting`: the task stays logically "dispatched" but its
    /// `REQUEST` is only sent once this worker reaches `Ready`.
    pub boot_reservation: Option<Task>,
    /// Bumped every time a task is assigned; used to invalidate stale
    /// idle-reap timers for the optional idle timeout.
    pub activity_generation: u64,
}

impl WorkerHandle {
    pub fn new(id: WorkerId, channel: Arc<dyn WorkerChannel>, max_tasks: usize) -> Self {
        WorkerHandle {
            id,
            channel,
            state: WorkerState::Booting,
            pending_tasks: HashMap::new(),
            max_tasks,
            last_error: None,
            boot_reservation: None,
            activity_generation: 0,
        }
    }

    /// Asserts the transition is one of the FSM's legal edges before
    /// applying it.
    pub fn transition(&mut self, to: WorkerState) {
        debug_assert!(
            self.state.can_transition_to(to),
            "illegal worker transition {:?} -> {:?}",
            self.state,
            to
        );
        self.state = to;
    }

    /// `state == READY && |pendingTasks| < k`. The single predicate
    /// [`crate::pool::PoolState::pick_available_worker`] relies on to
    /// pick a dispatch target, so every other "is this worker usable"
    /// question in the pool should be expressed in terms of it rather
    /// than reimplemented.
    pub fn available(&self) -> bool {
        self.state == WorkerState::Ready && self.pending_tasks.len() < self.max_tasks
    }

    pub fn processing(&self) -> bool {
        !self.pending_tasks.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        self.state == WorkerState::Ready && self.pending_tasks.is_empty()
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("pending_tasks", &self.pending_tasks.len())
            .finish()
    }
}
