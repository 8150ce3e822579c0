// bus.rs — Per-tree inbound event queue.
//
// The world (or anything holding a clone of the bus) fires events into the
// queue; the goal engine drains it at the start of each evaluation pass.
// While a pass is running the bus is marked busy, so anything fired from
// inside the pass (a predicate with a side effect, a sink reacting to a state
// change) is left in the queue for the *next* pass instead of being handled
// mid-traversal.
//
// `Rc<RefCell<..>>` is the single-threaded shared-ownership pattern: many
// handles, one queue, borrow rules checked at runtime. The engine never runs
// on more than one thread, so `Arc<Mutex<..>>` would buy nothing.

use std::cell::RefCell;
use std::collections::{BTreeSet, VecDeque};
use std::rc::Rc;

use crate::error::EventError;
use crate::event::WorldEvent;

#[derive(Debug, Default)]
struct BusState {
    queue: VecDeque<WorldEvent>,
    in_pass: bool,
    /// Events fired while a pass was running (diagnostics).
    deferred: u64,
    /// Events dropped by coalescing (diagnostics).
    coalesced: u64,
}

/// Cloneable handle to a tree's inbound event queue.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    state: Rc<RefCell<BusState>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event for the next pass.
    pub fn fire(&self, event: WorldEvent) {
        let mut state = self.state.borrow_mut();
        if state.in_pass {
            state.deferred += 1;
            tracing::debug!(kind = %event.kind, "event fired during pass, deferred to next pass");
        }
        state.queue.push_back(event);
    }

    /// Number of events waiting.
    pub fn pending(&self) -> usize {
        self.state.borrow().queue.len()
    }

    pub fn is_in_pass(&self) -> bool {
        self.state.borrow().in_pass
    }

    /// Events that arrived while a pass was running, since creation.
    pub fn deferred_count(&self) -> u64 {
        self.state.borrow().deferred
    }

    /// Duplicates dropped by [`drain`](Self::drain), since creation.
    pub fn coalesced_count(&self) -> u64 {
        self.state.borrow().coalesced
    }

    /// Take every queued event, dropping exact duplicates.
    ///
    /// Order of first appearance is kept. Evaluation always reads the live
    /// world, so a second identical notification carries no information.
    pub fn drain(&self) -> Vec<WorldEvent> {
        let mut state = self.state.borrow_mut();
        let mut seen = BTreeSet::new();
        let mut out = Vec::with_capacity(state.queue.len());
        while let Some(event) = state.queue.pop_front() {
            if seen.insert((event.kind.clone(), event.entity.clone())) {
                out.push(event);
            } else {
                state.coalesced += 1;
            }
        }
        out
    }

    /// Mark the start of an evaluation pass.
    ///
    /// The returned guard clears the busy flag when dropped. Starting a pass
    /// while another is running is an error: the caller is re-entering the
    /// engine from inside its own evaluation.
    pub fn begin_pass(&self) -> Result<PassGuard, EventError> {
        let mut state = self.state.borrow_mut();
        if state.in_pass {
            return Err(EventError::PassInProgress);
        }
        state.in_pass = true;
        Ok(PassGuard { bus: self.clone() })
    }
}

/// Clears the bus's busy flag on drop.
#[derive(Debug)]
pub struct PassGuard {
    bus: EventBus,
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        self.bus.state.borrow_mut().in_pass = false;
    }
}
