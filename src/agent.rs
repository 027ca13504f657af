//! Agent mode implementation
//!
//! Wires the scheduler, the active check connectors and the passive check
//! listener together and runs them until a termination signal arrives:
//!
//! 1. start the scheduler
//! 2. resolve the host name through a bootstrap task
//! 3. start one connector per `ServerActive` entry, then the listener
//! 4. wait for a termination signal
//! 5. stop the listener, the connectors and finally the scheduler

use crate::config::{AgentOptions, LogType, DEFAULT_HOSTNAME_ITEM};
use crate::connector::{parse_server_active, Connector, ConnectorOptions, ServerAddress};
use crate::listener::{Listener, ListenerOptions};
use crate::plugin::{ItemValue, Registry};
use crate::protocol::NOT_SUPPORTED;
use crate::scheduler::{Manager, SchedulerOptions};
use anyhow::{anyhow, bail, Context, Result};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{debug, info, warn};

/// Longest accepted host name, in characters
pub const HOSTNAME_MAX_LEN: usize = 128;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Validate host name characters
pub fn check_hostname(hostname: &str) -> Result<()> {
    let valid = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | ' ' | '_' | '-');
    match hostname.chars().find(|c| !valid(*c)) {
        Some(c) => bail!("character \"{}\" is not allowed in host name", c),
        None => Ok(()),
    }
}

/// Determine the host identity reported to servers
///
/// `Hostname` wins when set and `HostnameItem` is then never evaluated.
/// Otherwise the `HostnameItem` (default `system.hostname`) is evaluated
/// through the scheduler and truncated to [`HOSTNAME_MAX_LEN`] characters.
pub async fn resolve_hostname(manager: &Manager, options: &AgentOptions) -> Result<String> {
    if let Some(hostname) = &options.hostname {
        if options.hostname_item.is_some() {
            warn!(
                "both \"Hostname\" and \"HostnameItem\" configuration parameter defined, using \"Hostname\""
            );
        }
        if hostname.chars().count() > HOSTNAME_MAX_LEN {
            bail!(
                "invalid \"Hostname\" configuration parameter: configuration parameter cannot be longer than {} characters",
                HOSTNAME_MAX_LEN
            );
        }
        check_hostname(hostname)
            .map_err(|e| anyhow!("invalid \"Hostname\" configuration parameter: {}", e))?;
        return Ok(hostname.clone());
    }

    let item = options
        .hostname_item
        .as_deref()
        .unwrap_or(DEFAULT_HOSTNAME_ITEM);
    let failed = |reason: String| {
        anyhow!(
            "cannot get system hostname using \"{}\" item specified by \"HostnameItem\" configuration parameter: {}",
            item,
            reason
        )
    };

    let mut hostname = manager
        .perform_task(item, Duration::from_secs(options.timeout))
        .await
        .map_err(|e| failed(e.to_string()))?;

    if hostname.is_empty() {
        return Err(failed("value is empty".to_string()));
    }
    if hostname.chars().count() > HOSTNAME_MAX_LEN {
        hostname = hostname.chars().take(HOSTNAME_MAX_LEN).collect();
        warn!(
            "the returned value of \"{}\" item specified by \"HostnameItem\" configuration parameter is too long, using first {} characters",
            item, HOSTNAME_MAX_LEN
        );
    }
    check_hostname(&hostname).map_err(|e| failed(e.to_string()))?;

    Ok(hostname)
}

/// Why the agent is shutting down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    Interrupt,
    Terminate,
    UserSignal,
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownCause::Interrupt => f.write_str("SIGINT"),
            ShutdownCause::Terminate => f.write_str("SIGTERM"),
            ShutdownCause::UserSignal => f.write_str("SIGUSR1"),
        }
    }
}

/// Termination signal handlers
///
/// Installed before any component starts so that an early signal triggers a
/// graceful shutdown instead of the default disposition.
pub struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
    user: Signal,
}

impl ShutdownSignals {
    pub fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).context("cannot install SIGINT handler")?,
            terminate: signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?,
            user: signal(SignalKind::user_defined1()).context("cannot install SIGUSR1 handler")?,
        })
    }

    /// Block until one of the termination signals arrives
    pub async fn wait(&mut self) -> ShutdownCause {
        tokio::select! {
            _ = self.interrupt.recv() => ShutdownCause::Interrupt,
            _ = self.terminate.recv() => ShutdownCause::Terminate,
            _ = self.user.recv() => {
                debug!("user signal received");
                ShutdownCause::UserSignal
            }
        }
    }
}

/// Stop components in dependency order: listener, connectors, scheduler
pub async fn shutdown(listener: &Listener, connectors: &[Connector], manager: &Manager) {
    listener.stop().await;
    for connector in connectors {
        connector.stop().await;
    }
    manager.stop().await;
}

/// Evaluate one item and print `key [type|value]`; errors are printed too
pub async fn check_metric(manager: &Manager, key: &str, timeout: Duration) -> Result<ItemValue> {
    let result = match manager.submit(key, timeout) {
        Ok(handle) => handle.wait().await,
        Err(e) => Err(e),
    };

    match result {
        Ok(value) => {
            println!("{:<50}[{}|{}]", key, value.type_tag(), value);
            Ok(value)
        }
        Err(e) => {
            println!("{:<50}[m|{}] [{}]", key, NOT_SUPPORTED, e);
            Err(anyhow!(e))
        }
    }
}

/// Evaluate and print every supported item key
pub async fn check_metrics(manager: &Manager, timeout: Duration) {
    for metric in manager.metrics() {
        if metric.key.ends_with('*') {
            continue;
        }
        let _ = check_metric(manager, &metric.key, timeout).await;
    }
}

/// Run `--test` or `--print` against a private scheduler
pub async fn run_checks(options: &AgentOptions, key: Option<&str>) -> Result<()> {
    let manager = Manager::new(Registry::builtin()?, SchedulerOptions::from(options));
    manager.start().await?;

    let timeout = Duration::from_secs(options.timeout);
    let result = match key {
        Some(key) => check_metric(&manager, key, timeout).await.map(|_| ()),
        None => {
            check_metrics(&manager, timeout).await;
            Ok(())
        }
    };

    manager.stop().await;
    result
}

/// Run the agent until a termination signal arrives
pub async fn run(options: AgentOptions, config_path: &Path, foreground: bool) -> Result<()> {
    let addresses: Vec<ServerAddress> = match options.server_active.as_deref() {
        Some(value) => {
            parse_server_active(value).context("invalid \"ServerActive\" configuration parameter")?
        }
        None => Vec::new(),
    };

    let mut signals = ShutdownSignals::install()?;

    let greeting = format!("Starting watchpost agent {}", VERSION);
    info!("{}", greeting);
    if foreground {
        if options.log_type != LogType::Console {
            println!("{}", greeting);
        }
        println!("Press Ctrl+C to exit.");
    }
    info!("using configuration file: {}", config_path.display());

    let manager = Manager::new(Registry::builtin()?, SchedulerOptions::from(&options));
    manager.start().await.context("cannot start scheduler")?;

    let hostname = match resolve_hostname(&manager, &options).await {
        Ok(hostname) => hostname,
        Err(e) => {
            manager.stop().await;
            return Err(e);
        }
    };
    info!("agent host name: {}", hostname);

    let connectors: Vec<Connector> = addresses
        .into_iter()
        .map(|address| {
            Connector::new(
                manager.clone(),
                address,
                ConnectorOptions::new(&hostname, &options),
            )
        })
        .collect();
    for connector in &connectors {
        connector.start();
    }

    let listener = Listener::new(manager.clone(), ListenerOptions::from(&options));
    let result = match listener.start().await {
        Ok(_) => {
            let cause = signals.wait().await;
            info!("received {}, shutting down", cause);
            Ok(())
        }
        Err(e) => Err(e.context("cannot start agent")),
    };

    shutdown(&listener, &connectors, &manager).await;

    let farewell = "watchpost agent stopped";
    info!("{}", farewell);
    if foreground && options.log_type != LogType::Console {
        println!("{}", farewell);
    }

    result
}
