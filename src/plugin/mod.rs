//! Plugin capability model
//!
//! A plugin is a named unit that provides one or more item keys. What the
//! scheduler can do with it is decided by the capabilities it registers:
//!
//! - [`Exporter`]: answers a single item key request (one-shot call)
//! - [`Collector`]: keeps state that is refreshed on a fixed period
//! - [`Runner`]: owns a background resource that is started and stopped with
//!   the scheduler
//! - [`Configurator`]: receives its `Plugins.<Name>.*` options before start
//!
//! Capabilities are recorded once, when the plugin is registered, and the
//! scheduler dispatches on that record rather than on plugin identity.

pub mod registry;

pub use registry::{Metric, Registry};

use crate::config::PluginOptions;
use crate::itemkey::ItemKey;
use anyhow::Result;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Value produced by an exporter
#[derive(Debug, Clone, PartialEq)]
pub enum ItemValue {
    Text(String),
    Unsigned(u64),
    Signed(i64),
    Float(f64),
}

impl ItemValue {
    /// Short type tag used by `--test` / `--print` output
    pub fn type_tag(&self) -> char {
        match self {
            ItemValue::Text(_) => 's',
            ItemValue::Unsigned(_) => 'u',
            ItemValue::Signed(_) => 'i',
            ItemValue::Float(_) => 'd',
        }
    }
}

impl fmt::Display for ItemValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemValue::Text(s) => f.write_str(s),
            ItemValue::Unsigned(v) => write!(f, "{}", v),
            ItemValue::Signed(v) => write!(f, "{}", v),
            ItemValue::Float(v) => write!(f, "{:.6}", v),
        }
    }
}

impl From<String> for ItemValue {
    fn from(value: String) -> Self {
        ItemValue::Text(value)
    }
}

impl From<&str> for ItemValue {
    fn from(value: &str) -> Self {
        ItemValue::Text(value.to_string())
    }
}

impl From<u64> for ItemValue {
    fn from(value: u64) -> Self {
        ItemValue::Unsigned(value)
    }
}

impl From<i64> for ItemValue {
    fn from(value: i64) -> Self {
        ItemValue::Signed(value)
    }
}

impl From<f64> for ItemValue {
    fn from(value: f64) -> Self {
        ItemValue::Float(value)
    }
}

/// Per-call context handed to [`Exporter::export`]
///
/// Plugin calls run on the blocking pool and cannot be preempted. When the
/// deadline passes the caller is released with a timeout and the token is
/// cancelled; a long-running exporter should poll [`ExportContext::is_cancelled`]
/// and bail out. Until it returns, its worker slot stays occupied.
#[derive(Debug, Clone)]
pub struct ExportContext {
    deadline: Instant,
    token: CancellationToken,
}

impl ExportContext {
    pub fn new(deadline: Instant, token: CancellationToken) -> Self {
        Self { deadline, token }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the caller gives up on this call
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || Instant::now() >= self.deadline
    }
}

/// One-shot item evaluation
pub trait Exporter: Send + Sync {
    fn export(&self, key: &ItemKey, ctx: &ExportContext) -> Result<ItemValue>;
}

/// Stateful collection refreshed every [`Collector::period`]
pub trait Collector: Send + Sync {
    fn collect(&self) -> Result<()>;
    fn period(&self) -> Duration;
}

/// Background resource bound to the scheduler lifecycle
pub trait Runner: Send + Sync {
    fn start(&self) -> Result<()>;
    fn stop(&self);
}

/// Receives plugin specific configuration before the scheduler starts
pub trait Configurator: Send + Sync {
    fn configure(&self, options: &PluginOptions) -> Result<()>;
}

/// Which capabilities a plugin registered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub exporter: bool,
    pub collector: bool,
    pub runner: bool,
    pub configurator: bool,
}

/// A plugin registration: metadata plus its capability set
pub struct Plugin {
    name: String,
    capacity: usize,
    metrics: Vec<Metric>,
    exporter: Option<Arc<dyn Exporter>>,
    collector: Option<Arc<dyn Collector>>,
    runner: Option<Arc<dyn Runner>>,
    configurator: Option<Arc<dyn Configurator>>,
}

impl Plugin {
    /// Start a registration for a plugin called `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: 1,
            metrics: Vec::new(),
            exporter: None,
            collector: None,
            runner: None,
            configurator: None,
        }
    }

    /// Maximum number of simultaneous calls into this plugin
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Declare an item key (or `prefix.*` pattern) served by this plugin
    pub fn with_metric(mut self, key: &str, description: &str) -> Self {
        self.metrics.push(Metric {
            key: key.to_string(),
            description: description.to_string(),
        });
        self
    }

    pub fn with_exporter<E: Exporter + 'static>(mut self, exporter: Arc<E>) -> Self {
        self.exporter = Some(exporter as Arc<dyn Exporter>);
        self
    }

    pub fn with_collector<C: Collector + 'static>(mut self, collector: Arc<C>) -> Self {
        self.collector = Some(collector as Arc<dyn Collector>);
        self
    }

    pub fn with_runner<R: Runner + 'static>(mut self, runner: Arc<R>) -> Self {
        self.runner = Some(runner as Arc<dyn Runner>);
        self
    }

    pub fn with_configurator<C: Configurator + 'static>(mut self, configurator: Arc<C>) -> Self {
        self.configurator = Some(configurator as Arc<dyn Configurator>);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            exporter: self.exporter.is_some(),
            collector: self.collector.is_some(),
            runner: self.runner.is_some(),
            configurator: self.configurator.is_some(),
        }
    }

    pub(crate) fn exporter(&self) -> Option<&Arc<dyn Exporter>> {
        self.exporter.as_ref()
    }

    pub(crate) fn collector(&self) -> Option<&Arc<dyn Collector>> {
        self.collector.as_ref()
    }

    pub(crate) fn runner(&self) -> Option<&Arc<dyn Runner>> {
        self.runner.as_ref()
    }

    pub(crate) fn configurator(&self) -> Option<&Arc<dyn Configurator>> {
        self.configurator.as_ref()
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("metrics", &self.metrics)
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant;

    impl Exporter for Constant {
        fn export(&self, _key: &ItemKey, _ctx: &ExportContext) -> Result<ItemValue> {
            Ok(ItemValue::Unsigned(1))
        }
    }

    #[test]
    fn test_item_value_display() {
        assert_eq!(ItemValue::from("abc").to_string(), "abc");
        assert_eq!(ItemValue::from(42u64).to_string(), "42");
        assert_eq!(ItemValue::from(-7i64).to_string(), "-7");
        assert_eq!(ItemValue::from(0.5f64).to_string(), "0.500000");
        assert_eq!(ItemValue::from(1.0f64).type_tag(), 'd');
    }

    #[test]
    fn test_plugin_capabilities() {
        let plugin = Plugin::new("Test")
            .with_metric("test.key", "A test key")
            .with_exporter(Arc::new(Constant));

        let caps = plugin.capabilities();
        assert!(caps.exporter);
        assert!(!caps.collector);
        assert!(!caps.runner);
        assert_eq!(plugin.capacity(), 1);
    }

    #[test]
    fn test_capacity_is_at_least_one() {
        let plugin = Plugin::new("Zero").with_capacity(0);
        assert_eq!(plugin.capacity(), 1);
    }

    #[test]
    fn test_export_context_cancellation() {
        let token = CancellationToken::new();
        let ctx = ExportContext::new(Instant::now() + Duration::from_secs(10), token.clone());
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());

        let expired = ExportContext::new(Instant::now(), CancellationToken::new());
        assert!(expired.is_cancelled());
        assert_eq!(expired.remaining(), Duration::ZERO);
    }
}
