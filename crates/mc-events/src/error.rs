// error.rs — Error types for event routing and scheduling.

use thiserror::Error;

/// Errors that can occur while routing world events.
#[derive(Debug, Error)]
pub enum EventError {
    /// A pass was started on a bus that is already inside a pass.
    #[error("an evaluation pass is already running on this event bus")]
    PassInProgress,

    /// An event kind string could not be parsed.
    #[error("unknown event kind '{0}'")]
    UnknownKind(String),

    /// A poll interval has neither a wall-clock nor a simulated-time period.
    #[error("poll interval for '{subscriber}' has no period")]
    EmptyInterval { subscriber: String },

    /// A poll period is zero, negative, not a number, or too large to
    /// schedule.
    #[error("invalid poll period: {0}")]
    InvalidPeriod(String),
}
