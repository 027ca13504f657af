//! Plugin registry
//!
//! Holds the static set of plugins known to the agent and resolves item key
//! names to the plugin that owns them. Exact key names win; otherwise the
//! longest matching `prefix.*` pattern is used.

use super::Plugin;
use crate::itemkey::ItemKey;
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// An item key declared by a plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metric {
    pub key: String,
    pub description: String,
}

/// Static set of registered plugins
#[derive(Debug, Default)]
pub struct Registry {
    plugins: Vec<Arc<Plugin>>,
    exact: HashMap<String, usize>,
    // (prefix including the trailing dot, plugin index)
    patterns: Vec<(String, usize)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry populated with the built-in item providers
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::new();
        crate::items::register_builtin(&mut registry)?;
        Ok(registry)
    }

    /// Register a plugin, validating its name, keys and capabilities
    pub fn register(&mut self, plugin: Plugin) -> Result<()> {
        if plugin.name().is_empty() {
            bail!("plugin name cannot be empty");
        }
        if self.plugin(plugin.name()).is_some() {
            bail!("plugin {} is already registered", plugin.name());
        }

        let caps = plugin.capabilities();
        if !caps.exporter && !caps.collector && !caps.runner {
            bail!(
                "plugin {} must provide an exporter, collector or runner",
                plugin.name()
            );
        }
        if !plugin.metrics().is_empty() && !caps.exporter {
            bail!(
                "plugin {} declares item keys but has no exporter",
                plugin.name()
            );
        }

        let index = self.plugins.len();
        let mut exact = Vec::new();
        let mut patterns = Vec::new();

        for metric in plugin.metrics() {
            if let Some(prefix) = metric.key.strip_suffix('*') {
                if !prefix.ends_with('.') || ItemKey::parse(prefix.trim_end_matches('.')).is_err()
                {
                    bail!("invalid item key pattern {}", metric.key);
                }
                if self
                    .patterns
                    .iter()
                    .chain(patterns.iter())
                    .any(|(p, _)| p == prefix)
                {
                    bail!("item key pattern {} is already registered", metric.key);
                }
                patterns.push((prefix.to_string(), index));
            } else {
                let key = ItemKey::parse(&metric.key)?;
                if !key.params().is_empty() {
                    bail!("item key {} must be registered without parameters", metric.key);
                }
                if self.exact.contains_key(&metric.key) || exact.iter().any(|k| k == &metric.key) {
                    bail!("item key {} is already registered", metric.key);
                }
                exact.push(metric.key.clone());
            }
        }

        for key in exact {
            self.exact.insert(key, index);
        }
        self.patterns.extend(patterns);
        self.plugins.push(Arc::new(plugin));
        Ok(())
    }

    /// Find the plugin owning an item key name
    pub fn resolve(&self, name: &str) -> Option<&Arc<Plugin>> {
        if let Some(index) = self.exact.get(name) {
            return self.plugins.get(*index);
        }

        self.patterns
            .iter()
            .filter(|(prefix, _)| name.len() > prefix.len() && name.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .and_then(|(_, index)| self.plugins.get(*index))
    }

    pub fn plugin(&self, name: &str) -> Option<&Arc<Plugin>> {
        self.plugins.iter().find(|p| p.name() == name)
    }

    pub fn plugins(&self) -> &[Arc<Plugin>] {
        &self.plugins
    }

    /// All declared item keys with their owning plugin, sorted by key
    pub fn metrics(&self) -> Vec<(&Metric, &str)> {
        let mut metrics: Vec<(&Metric, &str)> = self
            .plugins
            .iter()
            .flat_map(|p| p.metrics().iter().map(move |m| (m, p.name())))
            .collect();
        metrics.sort_by(|a, b| a.0.key.cmp(&b.0.key));
        metrics
    }
}
