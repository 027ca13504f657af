//! Configuration management for watchpost
//!
//! The agent reads a single configuration file. Files ending in `.yml`,
//! `.yaml`, `.json` or `.toml` are deserialized with serde; anything else is
//! treated as the classic `Key=Value` agent format:
//!
//! ```text
//! # agent.conf
//! ServerActive=monitor.example.com:10051
//! HostnameItem=system.hostname
//! Timeout=5
//! LogType=console
//! DebugLevel=3
//! Plugins.Command.Enable=1
//! Plugins.Command.Capacity=4
//! ```
//!
//! **YAML Format:**
//! ```yaml
//! ServerActive: monitor.example.com:10051
//! Timeout: 5
//! Plugins:
//!   Command:
//!     Enable: true
//!     Capacity: 4
//! ```

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default item used to derive the host identity
pub const DEFAULT_HOSTNAME_ITEM: &str = "system.hostname";

/// Where log records are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    #[default]
    Console,
    File,
}

impl FromStr for LogType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "console" => Ok(LogType::Console),
            "file" => Ok(LogType::File),
            other => Err(anyhow!(
                "invalid LogType \"{}\": expected \"console\" or \"file\"",
                other
            )),
        }
    }
}

/// Free-form options for a single plugin (`Plugins.<Name>.<Option>`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginOptions(BTreeMap<String, serde_json::Value>);

impl PluginOptions {
    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// String view of an option; numbers and booleans are rendered as text
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Unsigned option given either as a number or a numeric string
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.0.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| anyhow!("option {} must be a non-negative integer", key)),
            Some(serde_json::Value::String(s)) => s
                .trim()
                .parse::<u64>()
                .map(Some)
                .with_context(|| format!("option {} must be a non-negative integer", key)),
            Some(_) => bail!("option {} must be a non-negative integer", key),
        }
    }

    /// Boolean option; accepts `true`/`false`, `1`/`0`
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.0.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::Bool(b)) => Ok(Some(*b)),
            Some(serde_json::Value::Number(n)) => match n.as_u64() {
                Some(0) => Ok(Some(false)),
                Some(1) => Ok(Some(true)),
                _ => bail!("option {} must be 0 or 1", key),
            },
            Some(serde_json::Value::String(s)) => match s.trim() {
                "1" | "true" => Ok(Some(true)),
                "0" | "false" => Ok(Some(false)),
                _ => bail!("option {} must be 0 or 1", key),
            },
            Some(_) => bail!("option {} must be 0 or 1", key),
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default, deny_unknown_fields)]
pub struct AgentOptions {
    /// Explicit host identity; wins over `HostnameItem`
    pub hostname: Option<String>,
    /// Item key used to derive the host identity
    pub hostname_item: Option<String>,
    /// Task deadline in seconds (1-30)
    pub timeout: u64,
    pub log_type: LogType,
    pub log_file: Option<PathBuf>,
    /// 0 info, 1 critical, 2 error, 3 warning, 4 debug, 5 trace
    pub debug_level: u8,
    /// Comma separated peers allowed to run passive checks; empty allows all
    pub server: Option<String>,
    /// Comma separated `host[:port]` list of active check servers
    pub server_active: Option<String>,
    #[serde(rename = "ListenIP")]
    pub listen_ip: String,
    pub listen_port: u16,
    /// Active check cycle in seconds (60-3600)
    pub refresh_active_checks: u64,
    /// Default number of pending tasks admitted per plugin
    pub queue_capacity: usize,
    pub plugins: BTreeMap<String, PluginOptions>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            hostname: None,
            hostname_item: None,
            timeout: 3,
            log_type: LogType::Console,
            log_file: None,
            debug_level: 3,
            server: None,
            server_active: None,
            listen_ip: "0.0.0.0".to_string(),
            listen_port: 10050,
            refresh_active_checks: 120,
            queue_capacity: 100,
            plugins: BTreeMap::new(),
        }
    }
}

impl AgentOptions {
    /// Parse the `Key=Value` format
    pub fn from_key_value(contents: &str) -> Result<Self> {
        let mut options = Self::default();

        for (index, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| anyhow!("line {}: expected Key=Value", index + 1))?;

            options
                .set(key.trim(), value.trim())
                .with_context(|| format!("line {}", index + 1))?;
        }

        Ok(options)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let optional = |v: &str| (!v.is_empty()).then(|| v.to_string());

        match key {
            "Hostname" => self.hostname = optional(value),
            "HostnameItem" => self.hostname_item = optional(value),
            "Timeout" => self.timeout = parse_number(key, value)?,
            "LogType" => self.log_type = value.parse()?,
            "LogFile" => self.log_file = optional(value).map(PathBuf::from),
            "DebugLevel" => self.debug_level = parse_number(key, value)?,
            "Server" => self.server = optional(value),
            "ServerActive" => self.server_active = optional(value),
            "ListenIP" => self.listen_ip = value.to_string(),
            "ListenPort" => self.listen_port = parse_number(key, value)?,
            "RefreshActiveChecks" => self.refresh_active_checks = parse_number(key, value)?,
            "QueueCapacity" => self.queue_capacity = parse_number(key, value)?,
            _ => {
                let Some(rest) = key.strip_prefix("Plugins.") else {
                    bail!("unknown parameter \"{}\"", key);
                };
                let (plugin, option) = rest
                    .split_once('.')
                    .filter(|(p, o)| !p.is_empty() && !o.is_empty())
                    .ok_or_else(|| anyhow!("invalid plugin parameter \"{}\"", key))?;
                self.plugins
                    .entry(plugin.to_string())
                    .or_default()
                    .insert(option, serde_json::Value::String(value.to_string()));
            }
        }

        Ok(())
    }

    /// Check value ranges and cross-field requirements
    pub fn validate(&self) -> Result<()> {
        if !(1..=30).contains(&self.timeout) {
            bail!("invalid \"Timeout\" value {}: must be between 1 and 30", self.timeout);
        }
        if self.debug_level > 5 {
            bail!(
                "invalid \"DebugLevel\" value {}: must be between 0 and 5",
                self.debug_level
            );
        }
        if !(60..=3600).contains(&self.refresh_active_checks) {
            bail!(
                "invalid \"RefreshActiveChecks\" value {}: must be between 60 and 3600",
                self.refresh_active_checks
            );
        }
        if self.queue_capacity == 0 {
            bail!("invalid \"QueueCapacity\" value: must be greater than 0");
        }
        if self.log_type == LogType::File && self.log_file.is_none() {
            bail!("\"LogFile\" must be set when \"LogType\" is \"file\"");
        }
        Ok(())
    }

    /// Options for one plugin, empty when none were configured
    pub fn plugin_options(&self, plugin: &str) -> PluginOptions {
        self.plugins.get(plugin).cloned().unwrap_or_default()
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| anyhow!("invalid \"{}\" value \"{}\"", key, value))
}

/// Load agent configuration, choosing the format from the file extension
pub fn load_agent_options(path: &Path) -> Result<AgentOptions> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read configuration file \"{}\"", path.display()))?;

    let options: AgentOptions = match path.extension().and_then(|e| e.to_str()) {
        Some("yml") | Some("yaml") => serde_yaml::from_str(&contents)?,
        Some("json") => serde_json::from_str(&contents)?,
        Some("toml") => toml::from_str(&contents)?,
        _ => AgentOptions::from_key_value(&contents)?,
    };

    options
        .validate()
        .with_context(|| format!("invalid configuration file \"{}\"", path.display()))?;

    Ok(options)
}
