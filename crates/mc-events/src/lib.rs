//! # mc-events
//!
//! World event plumbing for the Mission Control goal engine.
//!
//! The goal engine never talks to a process-wide event bus. Each goal tree
//! gets its own [`EventBus`] handle (for the world to fire into) and its own
//! [`EventRouter`] (mapping event kinds to subscribed nodes), plus one
//! [`PollScheduler`] for conditions that have no discrete event.
//!
//! ## Key components
//!
//! - [`WorldEvent`] / [`EventKind`] — what changed, and for which entity
//! - [`EventBus`] — cloneable inbound queue; events fired while a pass is
//!   running are deferred to the next pass
//! - [`EventRouter`] — subscribe / unsubscribe / route
//! - [`PollScheduler`] — fallback re-checks on wall-clock or simulated time,
//!   whichever elapses first, plus one-shot simulated-time deadlines

pub mod bus;
pub mod error;
pub mod event;
pub mod router;
pub mod scheduler;

pub use bus::{EventBus, PassGuard};
pub use error::EventError;
pub use event::{EntityId, EventKind, SimTime, WorldEvent};
pub use router::EventRouter;
pub use scheduler::{PollInterval, PollScheduler};
