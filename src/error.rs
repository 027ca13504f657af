//! Task error taxonomy
//!
//! Every failure that can happen to a single task surfaces to the caller as a
//! [`TaskError`]. None of these are fatal to the process; they are encoded as
//! the protocol's error marker by the listener and connector, or turned into
//! an exit code by `--test`.

use std::time::Duration;

/// Per-task failure returned by the scheduler
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    /// The item key is syntactically broken
    #[error("Invalid item key format: {0}")]
    InvalidKey(String),

    /// No registered plugin provides the key
    #[error("Unsupported item key: {0}")]
    UnsupportedItem(String),

    /// The owning plugin's queue is at capacity
    #[error("Plugin {plugin} queue is full ({capacity} pending tasks)")]
    QueueFull { plugin: String, capacity: usize },

    /// The deadline elapsed before a result was produced
    #[error("Timeout occurred while gathering data ({0:?})")]
    Timeout(Duration),

    /// The plugin returned an error
    #[error("{0}")]
    Plugin(String),

    /// The plugin call panicked
    #[error("Plugin {plugin} failed unexpectedly: {message}")]
    Panicked { plugin: String, message: String },

    /// The scheduler has been stopped and admits no new work
    #[error("Scheduler stopped")]
    Stopped,

    /// The scheduler has not been started yet
    #[error("Scheduler not started")]
    NotStarted,
}

impl TaskError {
    /// Whether the caller may reasonably retry the same request later
    pub fn is_transient(&self) -> bool {
        matches!(self, TaskError::QueueFull { .. } | TaskError::Timeout(_))
    }
}

pub type TaskResult<T> = std::result::Result<T, TaskError>;
