//! Task scheduler and plugin execution engine
//!
//! The [`Manager`] owns every plugin instance. Callers (the passive listener,
//! the active check connectors, the bootstrap hostname lookup) hand it item
//! keys; it resolves the owning plugin, admits the task into that plugin's
//! bounded queue and returns a [`TaskHandle`] that resolves to the value or a
//! [`TaskError`].
//!
//! ```text
//! submit ──> resolve ──> admission (semaphore) ──> plugin queue ──> workers
//!                                                                   │
//! TaskHandle::wait <──────────── oneshot result ────────────────────┘
//! ```
//!
//! Each plugin has `capacity` workers (default 1) and a queue admitting at
//! most `QueueCapacity` queued plus executing tasks. A full queue fails the
//! submission immediately instead of waiting.

mod task;
mod worker;

pub use task::TaskHandle;

use crate::config::{AgentOptions, PluginOptions};
use crate::error::{TaskError, TaskResult};
use crate::itemkey::ItemKey;
use crate::plugin::{Metric, Plugin, Registry};
use anyhow::{anyhow, bail, Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use task::{Job, Task};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Default number of pending tasks admitted per plugin
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Longest accepted task timeout; larger values are clamped to it
pub const MAX_TASK_TIMEOUT: Duration = Duration::from_secs(86400 * 365);

/// Scheduler tuning derived from the agent configuration
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub queue_capacity: usize,
    pub plugins: BTreeMap<String, PluginOptions>,
    /// Extra time granted to workers on stop, on top of the largest task timeout
    pub stop_margin: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            plugins: BTreeMap::new(),
            stop_margin: Duration::from_secs(1),
        }
    }
}

impl From<&AgentOptions> for SchedulerOptions {
    fn from(options: &AgentOptions) -> Self {
        Self {
            queue_capacity: options.queue_capacity,
            plugins: options.plugins.clone(),
            ..Self::default()
        }
    }
}

impl SchedulerOptions {
    fn plugin_options(&self, name: &str) -> PluginOptions {
        self.plugins.get(name).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Constructed,
    Starting,
    Started,
    Stopped,
}

struct PluginQueue {
    plugin: Arc<Plugin>,
    sender: mpsc::UnboundedSender<Job>,
    admission: Arc<Semaphore>,
    capacity: usize,
}

struct State {
    lifecycle: Lifecycle,
    queues: HashMap<String, PluginQueue>,
    workers: JoinSet<()>,
    tickers: JoinSet<()>,
    runners: Vec<Arc<Plugin>>,
    shutdown: CancellationToken,
}

struct Inner {
    registry: Arc<Registry>,
    options: SchedulerOptions,
    state: Mutex<State>,
    // largest timeout ever admitted, in milliseconds
    max_timeout: AtomicU64,
}

/// Handle to the scheduler; clones share the same instance
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    pub fn new(registry: Registry, options: SchedulerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Arc::new(registry),
                options,
                state: Mutex::new(State {
                    lifecycle: Lifecycle::Constructed,
                    queues: HashMap::new(),
                    workers: JoinSet::new(),
                    tickers: JoinSet::new(),
                    runners: Vec::new(),
                    shutdown: CancellationToken::new(),
                }),
                max_timeout: AtomicU64::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Configure plugins, spawn their workers, start runners and collectors
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.lock();
            match state.lifecycle {
                Lifecycle::Constructed => state.lifecycle = Lifecycle::Starting,
                Lifecycle::Stopped => bail!("scheduler already stopped"),
                _ => bail!("scheduler already started"),
            }
        }

        let result = self.configure_plugins().await;
        let layout = match result.and_then(|_| self.queue_layout()) {
            Ok(layout) => layout,
            Err(e) => {
                self.lock().lifecycle = Lifecycle::Stopped;
                return Err(e);
            }
        };

        {
            let mut state = self.lock();
            if state.lifecycle != Lifecycle::Starting {
                bail!("scheduler stopped while starting");
            }
            for (plugin, workers, capacity) in layout {
                let (sender, receiver) = mpsc::unbounded_channel();
                let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
                let admission = Arc::new(Semaphore::new(capacity));

                for slot in 0..workers {
                    state
                        .workers
                        .spawn(worker::run(plugin.clone(), receiver.clone(), slot));
                }

                debug!(
                    "plugin {} ready: {} workers, queue capacity {}",
                    plugin.name(),
                    workers,
                    capacity
                );
                state.queues.insert(
                    plugin.name().to_string(),
                    PluginQueue {
                        plugin,
                        sender,
                        admission,
                        capacity,
                    },
                );
            }
            state.lifecycle = Lifecycle::Started;
        }

        self.start_runners().await;
        self.start_collectors();
        info!(
            "scheduler started with {} plugins",
            self.inner.registry.plugins().len()
        );
        Ok(())
    }

    async fn configure_plugins(&self) -> Result<()> {
        for plugin in self.inner.registry.plugins() {
            let Some(configurator) = plugin.configurator().cloned() else {
                continue;
            };
            let options = self.inner.options.plugin_options(plugin.name());
            tokio::task::spawn_blocking(move || configurator.configure(&options))
                .await
                .map_err(|e| anyhow!("plugin {} configuration aborted: {}", plugin.name(), e))?
                .with_context(|| format!("cannot configure plugin {}", plugin.name()))?;
        }
        Ok(())
    }

    /// (plugin, worker count, queue capacity) for every plugin that needs a queue
    fn queue_layout(&self) -> Result<Vec<(Arc<Plugin>, usize, usize)>> {
        let mut layout = Vec::new();

        for plugin in self.inner.registry.plugins() {
            let caps = plugin.capabilities();
            if !caps.exporter && !caps.collector {
                continue;
            }

            let options = self.inner.options.plugin_options(plugin.name());
            let workers = options
                .get_u64("Capacity")
                .with_context(|| format!("invalid options for plugin {}", plugin.name()))?
                .map(|c| c as usize)
                .unwrap_or_else(|| plugin.capacity())
                .max(1);
            let capacity = options
                .get_u64("QueueCapacity")
                .with_context(|| format!("invalid options for plugin {}", plugin.name()))?
                .map(|c| c as usize)
                .unwrap_or(self.inner.options.queue_capacity)
                .max(1);

            layout.push((plugin.clone(), workers, capacity));
        }

        Ok(layout)
    }

    async fn start_runners(&self) {
        for plugin in self.inner.registry.plugins() {
            let Some(runner) = plugin.runner().cloned() else {
                continue;
            };
            let starting = runner.clone();
            match tokio::task::spawn_blocking(move || starting.start()).await {
                Ok(Ok(())) => {
                    let kept = {
                        let mut state = self.lock();
                        let started = state.lifecycle == Lifecycle::Started;
                        if started {
                            state.runners.push(plugin.clone());
                        }
                        started
                    };
                    if kept {
                        debug!("plugin {} runner started", plugin.name());
                        continue;
                    }

                    debug!("scheduler stopped while plugin {} runner was starting", plugin.name());
                    if let Err(e) = tokio::task::spawn_blocking(move || runner.stop()).await {
                        warn!("plugin {} runner failed to stop: {}", plugin.name(), e);
                    }
                }
                Ok(Err(e)) => warn!("cannot start plugin {} runner: {:#}", plugin.name(), e),
                Err(e) => warn!("plugin {} runner failed to start: {}", plugin.name(), e),
            }
        }
    }

    /// Spawn one ticker per collector plugin, after runners are up
    fn start_collectors(&self) {
        let mut state = self.lock();
        if state.lifecycle != Lifecycle::Started {
            return;
        }

        let mut tickers = Vec::new();
        for queue in state.queues.values() {
            if let Some(collector) = queue.plugin.collector() {
                tickers.push(tick(
                    queue.plugin.clone(),
                    collector.period(),
                    queue.sender.clone(),
                    queue.admission.clone(),
                    state.shutdown.clone(),
                ));
            }
        }
        for ticker in tickers {
            state.tickers.spawn(ticker);
        }
    }

    /// Admit a task and return a handle to its pending result
    ///
    /// Admission failures (stopped scheduler, malformed or unsupported key,
    /// full queue) are returned immediately.
    pub fn submit(&self, key: &str, timeout: Duration) -> TaskResult<TaskHandle> {
        let state = self.lock();
        match state.lifecycle {
            Lifecycle::Started => {}
            Lifecycle::Stopped => return Err(TaskError::Stopped),
            Lifecycle::Constructed | Lifecycle::Starting => return Err(TaskError::NotStarted),
        }

        let key = ItemKey::parse(key)?;
        let queue = self
            .inner
            .registry
            .resolve(key.name())
            .and_then(|plugin| state.queues.get(plugin.name()))
            .filter(|queue| queue.plugin.capabilities().exporter)
            .ok_or_else(|| TaskError::UnsupportedItem(key.raw().to_string()))?;

        let permit = queue
            .admission
            .clone()
            .try_acquire_owned()
            .map_err(|_| TaskError::QueueFull {
                plugin: queue.plugin.name().to_string(),
                capacity: queue.capacity,
            })?;

        let timeout = timeout.min(MAX_TASK_TIMEOUT);
        let created = Instant::now();
        let deadline = created + timeout;
        let (sender, receiver) = oneshot::channel();
        let handle = TaskHandle::new(
            key.raw().to_string(),
            queue.plugin.name().to_string(),
            deadline,
            timeout,
            receiver,
        );

        self.inner
            .max_timeout
            .fetch_max(timeout.as_millis() as u64, Ordering::Relaxed);

        trace!("task {} queued for plugin {}", key, queue.plugin.name());
        let task = Task {
            key,
            created,
            deadline,
            timeout,
            result: sender,
        };
        queue
            .sender
            .send(Job::Export(task, permit))
            .map_err(|_| TaskError::Stopped)?;

        Ok(handle)
    }

    /// Evaluate one item key and wait for its value
    pub async fn perform_task(&self, key: &str, timeout: Duration) -> TaskResult<String> {
        let handle = self.submit(key, timeout)?;
        handle.wait().await.map(|value| value.to_string())
    }

    /// Supported item keys with their descriptions, sorted by key
    pub fn metrics(&self) -> Vec<Metric> {
        self.inner
            .registry
            .metrics()
            .into_iter()
            .map(|(metric, _)| metric.clone())
            .collect()
    }

    pub fn is_started(&self) -> bool {
        self.lock().lifecycle == Lifecycle::Started
    }

    /// Stop admitting work, drain the queues and stop plugin runners
    ///
    /// Tasks already admitted run to completion or to their deadline. Workers
    /// still busy after the largest admitted timeout plus the stop margin are
    /// abandoned.
    pub async fn stop(&self) {
        let (mut workers, mut tickers, runners, shutdown) = {
            let mut state = self.lock();
            let previous = state.lifecycle;
            state.lifecycle = Lifecycle::Stopped;
            if previous != Lifecycle::Started {
                return;
            }

            state.queues.clear();
            (
                std::mem::take(&mut state.workers),
                std::mem::take(&mut state.tickers),
                std::mem::take(&mut state.runners),
                state.shutdown.clone(),
            )
        };

        shutdown.cancel();
        while tickers.join_next().await.is_some() {}

        let grace = Duration::from_millis(self.inner.max_timeout.load(Ordering::Relaxed))
            + self.inner.options.stop_margin;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    warn!("scheduler worker failed: {}", e);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "{} workers still busy after {:?}, abandoning them",
                workers.len(),
                grace
            );
            workers.abort_all();
        }

        for plugin in runners {
            let Some(runner) = plugin.runner().cloned() else {
                continue;
            };
            if let Err(e) = tokio::task::spawn_blocking(move || runner.stop()).await {
                warn!("plugin {} runner failed to stop: {}", plugin.name(), e);
            }
        }

        info!("scheduler stopped");
    }
}

/// Periodically enqueue a collection job for a collector plugin
async fn tick(
    plugin: Arc<Plugin>,
    period: Duration,
    sender: mpsc::UnboundedSender<Job>,
    admission: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    let period = if period.is_zero() {
        Duration::from_secs(1)
    } else {
        period
    };
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => match admission.clone().try_acquire_owned() {
                Ok(permit) => {
                    if sender.send(Job::Collect(permit)).is_err() {
                        break;
                    }
                }
                Err(_) => debug!("plugin {} queue is full, skipping collection", plugin.name()),
            },
        }
    }
}
