//! Tasks and result handles

use crate::error::TaskError;
use crate::itemkey::ItemKey;
use crate::plugin::ItemValue;
use std::time::Duration;
use tokio::sync::{oneshot, OwnedSemaphorePermit};
use tokio::time::Instant;

pub(crate) type ResultSender = oneshot::Sender<Result<ItemValue, TaskError>>;

/// A single request to evaluate one item key before a deadline
#[derive(Debug)]
pub(crate) struct Task {
    pub key: ItemKey,
    pub created: Instant,
    pub deadline: Instant,
    pub timeout: Duration,
    pub result: ResultSender,
}

/// Unit of work pulled from a plugin queue. The admission permit travels with
/// the job and frees its queue slot when dropped.
#[derive(Debug)]
pub(crate) enum Job {
    Export(Task, OwnedSemaphorePermit),
    Collect(OwnedSemaphorePermit),
}

/// Pending result of a submitted task
///
/// Resolves exactly once: to the plugin's value, to the plugin's error, or to
/// [`TaskError::Timeout`] when the deadline passes first. If the scheduler
/// drops the task without answering (for example when a stuck worker is
/// abandoned during shutdown) the handle resolves to [`TaskError::Stopped`].
#[derive(Debug)]
pub struct TaskHandle {
    key: String,
    plugin: String,
    deadline: Instant,
    timeout: Duration,
    receiver: oneshot::Receiver<Result<ItemValue, TaskError>>,
}

impl TaskHandle {
    pub(crate) fn new(
        key: String,
        plugin: String,
        deadline: Instant,
        timeout: Duration,
        receiver: oneshot::Receiver<Result<ItemValue, TaskError>>,
    ) -> Self {
        Self {
            key,
            plugin,
            deadline,
            timeout,
            receiver,
        }
    }

    /// The raw item key this task evaluates
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Name of the plugin the key resolved to
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Wait for the result, never past the task deadline
    pub async fn wait(self) -> Result<ItemValue, TaskError> {
        match tokio::time::timeout_at(self.deadline, self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TaskError::Stopped),
            Err(_) => Err(TaskError::Timeout(self.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(timeout: Duration) -> (ResultSender, TaskHandle) {
        let (tx, rx) = oneshot::channel();
        let handle = TaskHandle::new(
            "test.key".to_string(),
            "Test".to_string(),
            Instant::now() + timeout,
            timeout,
            rx,
        );
        (tx, handle)
    }

    #[tokio::test]
    async fn test_handle_delivers_value() {
        let (tx, handle) = handle(Duration::from_secs(1));
        assert_eq!(handle.key(), "test.key");
        assert_eq!(handle.plugin(), "Test");
        tx.send(Ok(ItemValue::Unsigned(1))).unwrap();
        assert_eq!(handle.wait().await, Ok(ItemValue::Unsigned(1)));
    }

    #[tokio::test]
    async fn test_handle_times_out() {
        let (_tx, handle) = handle(Duration::from_millis(20));
        assert_eq!(
            handle.wait().await,
            Err(TaskError::Timeout(Duration::from_millis(20)))
        );
    }

    #[tokio::test]
    async fn test_dropped_task_reports_stopped() {
        let (tx, handle) = handle(Duration::from_secs(5));
        drop(tx);
        assert_eq!(handle.wait().await, Err(TaskError::Stopped));
    }
}
