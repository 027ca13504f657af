//! Plugin worker slots
//!
//! Each plugin gets `capacity` workers sharing one queue receiver. A worker
//! takes the next job in FIFO order, runs the plugin call on the blocking
//! pool and delivers the outcome through the task's result channel.

use super::task::{Job, Task};
use crate::error::TaskError;
use crate::plugin::{ExportContext, Plugin};
use std::any::Any;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub(crate) type SharedReceiver = Arc<Mutex<mpsc::UnboundedReceiver<Job>>>;

/// Serve one plugin queue until every sender is gone and the queue is drained
pub(crate) async fn run(plugin: Arc<Plugin>, receiver: SharedReceiver, slot: usize) {
    trace!("worker {}#{} started", plugin.name(), slot);

    loop {
        let job = receiver.lock().await.recv().await;
        let Some(job) = job else { break };

        match job {
            Job::Export(task, permit) => execute(&plugin, task, permit).await,
            Job::Collect(permit) => {
                collect(&plugin).await;
                drop(permit);
            }
        }
    }

    trace!("worker {}#{} finished", plugin.name(), slot);
}

/// Run one export call; the permit is released before the result is delivered
async fn execute(plugin: &Plugin, task: Task, permit: OwnedSemaphorePermit) {
    let Task {
        key,
        created,
        deadline,
        timeout,
        result,
    } = task;

    if result.is_closed() {
        debug!("dropping task {}: caller is gone", key);
        return;
    }
    if Instant::now() >= deadline {
        debug!(
            "task {} expired after {:?} in the {} queue",
            key,
            created.elapsed(),
            plugin.name()
        );
        let _ = result.send(Err(TaskError::Timeout(timeout)));
        return;
    }
    let Some(exporter) = plugin.exporter().cloned() else {
        let _ = result.send(Err(TaskError::UnsupportedItem(key.raw().to_string())));
        return;
    };

    let token = CancellationToken::new();
    let ctx = ExportContext::new(deadline.into_std(), token.clone());
    let call_key = key.clone();
    let mut call = tokio::task::spawn_blocking(move || exporter.export(&call_key, &ctx));

    let outcome = tokio::select! {
        joined = &mut call => joined,
        _ = tokio::time::sleep_until(deadline) => {
            token.cancel();
            let _ = result.send(Err(TaskError::Timeout(timeout)));
            warn!("plugin {} did not answer {} within {:?}", plugin.name(), key, timeout);

            // the slot stays busy until the plugin call actually returns
            if let Err(e) = call.await {
                if e.is_panic() {
                    warn!("plugin {} panicked after its deadline", plugin.name());
                }
            }
            return;
        }
    };

    let value = match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            debug!("plugin {} failed to export {}: {:#}", plugin.name(), key, e);
            Err(TaskError::Plugin(format!("{:#}", e)))
        }
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            warn!("plugin {} panicked while exporting {}: {}", plugin.name(), key, message);
            Err(TaskError::Panicked {
                plugin: plugin.name().to_string(),
                message,
            })
        }
        Err(_) => Err(TaskError::Stopped),
    };

    trace!("task {} done in {:?}", key, created.elapsed());
    drop(permit);
    if result.send(value).is_err() {
        debug!("result for {} discarded: caller is gone", key);
    }
}

async fn collect(plugin: &Plugin) {
    let Some(collector) = plugin.collector().cloned() else {
        return;
    };

    match tokio::task::spawn_blocking(move || collector.collect()).await {
        Ok(Ok(())) => trace!("plugin {} collected", plugin.name()),
        Ok(Err(e)) => warn!("plugin {} collection failed: {:#}", plugin.name(), e),
        Err(e) if e.is_panic() => warn!(
            "plugin {} panicked while collecting: {}",
            plugin.name(),
            panic_message(e.into_panic())
        ),
        Err(_) => {}
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
