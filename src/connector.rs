//! Active checks
//!
//! One [`Connector`] runs per `ServerActive` entry. Every
//! `RefreshActiveChecks` seconds it asks the server which items this host
//! must report, evaluates all of them through the shared scheduler and sends
//! the results back in a single `agent data` batch:
//!
//! ```text
//! agent  -> {"request":"active checks","host":"web-01"}
//! server -> {"response":"success","data":[{"key":"agent.ping","delay":30}]}
//! agent  -> {"request":"agent data","session":"...","data":[{"host":"web-01",
//!            "key":"agent.ping","value":"1","id":1,"clock":...,"ns":...}]}
//! server -> {"response":"success","info":"processed: 1; failed: 0"}
//! ```
//!
//! Transport failures are logged and retried on the next cycle.

use crate::config::AgentOptions;
use crate::protocol::{
    self, ActiveCheck, ActiveChecksRequest, ActiveChecksResponse, AgentDataRequest,
    AgentDataResponse, AgentValue,
};
use crate::scheduler::Manager;
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use futures_util::future::join_all;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_SERVER_PORT: u16 = 10051;

/// One `host[:port]` entry of `ServerActive`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(entry: &str, port: &str) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => bail!("invalid port in \"{}\"", entry),
    }
}

fn parse_address(entry: &str) -> Result<ServerAddress> {
    let (host, port) = if let Some(rest) = entry.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("missing closing bracket in \"{}\"", entry))?;
        let port = match tail {
            "" => DEFAULT_SERVER_PORT,
            _ => {
                let port = tail
                    .strip_prefix(':')
                    .ok_or_else(|| anyhow!("unexpected characters after \"]\" in \"{}\"", entry))?;
                parse_port(entry, port)?
            }
        };
        (host, port)
    } else if entry.matches(':').count() > 1 {
        // bare IPv6 address without a port
        (entry, DEFAULT_SERVER_PORT)
    } else if let Some((host, port)) = entry.split_once(':') {
        (host, parse_port(entry, port)?)
    } else {
        (entry, DEFAULT_SERVER_PORT)
    };

    let valid = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':');
    if host.is_empty() || !host.chars().all(valid) {
        bail!("invalid host in \"{}\"", entry);
    }

    Ok(ServerAddress {
        host: host.to_string(),
        port,
    })
}

/// Parse the comma separated `ServerActive` value
pub fn parse_server_active(value: &str) -> Result<Vec<ServerAddress>> {
    let mut addresses = Vec::new();
    let mut seen = HashSet::new();

    for entry in value.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            bail!("empty entry in \"{}\"", value);
        }
        let address = parse_address(entry)?;
        if !seen.insert((address.host.to_lowercase(), address.port)) {
            bail!("address \"{}\" specified more than once", address);
        }
        addresses.push(address);
    }

    Ok(addresses)
}

/// Per-connector settings
#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    /// Host name reported to the server
    pub hostname: String,
    /// Deadline for every item and for each network exchange
    pub timeout: Duration,
    pub refresh: Duration,
}

impl ConnectorOptions {
    pub fn new(hostname: &str, options: &AgentOptions) -> Self {
        Self {
            hostname: hostname.to_string(),
            timeout: Duration::from_secs(options.timeout),
            refresh: Duration::from_secs(options.refresh_active_checks),
        }
    }
}

struct Session {
    manager: Manager,
    address: ServerAddress,
    options: ConnectorOptions,
    token: String,
    last_id: AtomicU64,
}

impl Session {
    async fn exchange<Req, Resp>(&self, request: &Req) -> Result<Resp>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let exchange = async {
            let mut stream = TcpStream::connect((self.address.host.as_str(), self.address.port))
                .await
                .with_context(|| format!("cannot connect to [{}]", self.address))?;
            let response = protocol::exchange(&mut stream, request)
                .await
                .with_context(|| format!("cannot exchange data with [{}]", self.address))?;
            Ok::<Resp, anyhow::Error>(response)
        };

        tokio::time::timeout(self.options.timeout, exchange)
            .await
            .map_err(|_| anyhow!("connection to [{}] timed out", self.address))?
    }

    async fn fetch_checks(&self) -> Result<Vec<ActiveCheck>> {
        let request = ActiveChecksRequest::new(&self.options.hostname);
        let response: ActiveChecksResponse = self.exchange(&request).await?;
        if response.response != "success" {
            bail!(
                "no active checks on server [{}]: {}",
                self.address,
                response.info.unwrap_or_else(|| response.response.clone())
            );
        }
        Ok(response.data)
    }

    async fn evaluate(&self, checks: Vec<ActiveCheck>) -> Vec<AgentValue> {
        let pending = checks.into_iter().map(|check| {
            let submitted = self.manager.submit(&check.key, self.options.timeout);
            async move {
                let (plugin, result) = match submitted {
                    Ok(handle) => (Some(handle.plugin().to_string()), handle.wait().await),
                    Err(e) => (None, Err(e)),
                };
                (check, plugin, result, Utc::now())
            }
        });

        join_all(pending)
            .await
            .into_iter()
            .map(|(check, plugin, result, at)| {
                let (value, state) = match result {
                    Ok(value) => (value.to_string(), None),
                    Err(e) => {
                        let plugin = plugin.as_deref().unwrap_or("-");
                        if e.is_transient() {
                            warn!("plugin {} could not evaluate {} in time: {}", plugin, check.key, e);
                        } else {
                            debug!("item {} is not supported ({}): {}", check.key, plugin, e);
                        }
                        (e.to_string(), Some(1))
                    }
                };
                AgentValue {
                    id: self.last_id.fetch_add(1, Ordering::Relaxed) + 1,
                    host: self.options.hostname.clone(),
                    key: check.key,
                    value,
                    state,
                    clock: at.timestamp(),
                    ns: at.timestamp_subsec_nanos(),
                }
            })
            .collect()
    }

    async fn send(&self, data: Vec<AgentValue>) -> Result<()> {
        let now = Utc::now();
        let request = AgentDataRequest {
            request: "agent data".to_string(),
            session: self.token.clone(),
            data,
            clock: now.timestamp(),
            ns: now.timestamp_subsec_nanos(),
        };
        let response: AgentDataResponse = self.exchange(&request).await?;
        if response.response != "success" {
            bail!(
                "server [{}] rejected agent data: {}",
                self.address,
                response.info.unwrap_or(response.response)
            );
        }
        debug!(
            "server [{}] accepted agent data: {}",
            self.address,
            response.info.unwrap_or_default()
        );
        Ok(())
    }

    /// One active check cycle; returns the number of values reported
    async fn refresh(&self) -> Result<usize> {
        let checks = self.fetch_checks().await?;
        if checks.is_empty() {
            debug!("no active checks configured on [{}]", self.address);
            return Ok(0);
        }

        let values = self.evaluate(checks).await;
        let count = values.len();
        self.send(values).await?;
        Ok(count)
    }
}

/// Periodic active check exchange with one server
pub struct Connector {
    session: Arc<Session>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Connector {
    pub fn new(manager: Manager, address: ServerAddress, options: ConnectorOptions) -> Self {
        Self {
            session: Arc::new(Session {
                manager,
                address,
                options,
                token: Uuid::new_v4().simple().to_string(),
                last_id: AtomicU64::new(0),
            }),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.session.address
    }

    /// Run a single cycle immediately
    pub async fn refresh(&self) -> Result<usize> {
        self.session.refresh().await
    }

    /// Spawn the refresh loop; the first cycle runs right away
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }

        let session = self.session.clone();
        let shutdown = self.shutdown.clone();
        info!("starting active checks for [{}]", session.address);

        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(session.options.refresh);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                // a cycle in progress is bounded by the item and network
                // timeouts and always runs to its report
                match session.refresh().await {
                    Ok(count) => debug!("sent {} values to [{}]", count, session.address),
                    Err(e) => warn!("active check processing failed: {:#}", e),
                }
            }
        }));
    }

    /// Stop the refresh loop
    ///
    /// A cycle already in progress finishes first, so every submitted item is
    /// reported. The wait is bounded by one fetch, one evaluation and one send,
    /// each limited by the configured timeout.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("active checks for [{}] ended abnormally: {}", self.address(), e);
            }
        }
        debug!("active checks for [{}] stopped", self.address());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::itemkey::ItemKey;
    use crate::plugin::{ExportContext, Exporter, ItemValue, Plugin, Registry};
    use crate::protocol::{read_frame, write_frame};
    use crate::scheduler::SchedulerOptions;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_server_active() {
        let addresses =
            parse_server_active("127.0.0.1, monitor.example.com:20051,[::1]:30051,fe80::1").unwrap();
        assert_eq!(
            addresses,
            vec![
                ServerAddress { host: "127.0.0.1".into(), port: 10051 },
                ServerAddress { host: "monitor.example.com".into(), port: 20051 },
                ServerAddress { host: "::1".into(), port: 30051 },
                ServerAddress { host: "fe80::1".into(), port: 10051 },
            ]
        );
        assert_eq!(addresses[2].to_string(), "[::1]:30051");
    }

    #[test]
    fn test_parse_server_active_errors() {
        assert!(parse_server_active("").is_err());
        assert!(parse_server_active("a,,b").is_err());
        assert!(parse_server_active("host:0").is_err());
        assert!(parse_server_active("host:99999").is_err());
        assert!(parse_server_active("[::1").is_err());
        assert!(parse_server_active("[::1]x").is_err());
        assert!(parse_server_active("bad host").is_err());
        assert!(parse_server_active("a:10051,A").is_err());
    }

    async fn reply(listener: &TcpListener, body: &str) -> serde_json::Value {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = read_frame(&mut stream).await.unwrap();
        write_frame(&mut stream, body.as_bytes()).await.unwrap();
        serde_json::from_slice(&request).unwrap()
    }

    #[tokio::test]
    async fn test_refresh_cycle_reports_values() {
        let manager = Manager::new(Registry::builtin().unwrap(), SchedulerOptions::default());
        manager.start().await.unwrap();

        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let connector = Connector::new(
            manager.clone(),
            ServerAddress { host: "127.0.0.1".into(), port },
            ConnectorOptions {
                hostname: "web-01".to_string(),
                timeout: Duration::from_secs(3),
                refresh: Duration::from_secs(60),
            },
        );

        let fake_server = tokio::spawn(async move {
            let checks = reply(
                &server,
                r#"{"response":"success","data":[{"key":"agent.ping","delay":30},{"key":"no.such.key","delay":30}]}"#,
            )
            .await;
            let data = reply(&server, r#"{"response":"success","info":"processed: 2"}"#).await;
            (checks, data)
        });

        assert_eq!(connector.refresh().await.unwrap(), 2);
        let (checks, data) = fake_server.await.unwrap();

        assert_eq!(checks["request"], "active checks");
        assert_eq!(checks["host"], "web-01");

        assert_eq!(data["request"], "agent data");
        let values = data["data"].as_array().unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0]["key"], "agent.ping");
        assert_eq!(values[0]["value"], "1");
        assert_eq!(values[0]["id"], 1);
        assert!(values[0].get("state").is_none());
        assert_eq!(values[1]["key"], "no.such.key");
        assert_eq!(values[1]["state"], 1);

        manager.stop().await;
    }

    struct Slow;

    impl Exporter for Slow {
        fn export(&self, _key: &ItemKey, _ctx: &ExportContext) -> Result<ItemValue> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(ItemValue::from("done"))
        }
    }

    #[tokio::test]
    async fn test_stop_reports_cycle_in_progress() {
        let mut registry = Registry::new();
        registry
            .register(
                Plugin::new("Slow")
                    .with_metric("slow", "Answers after 300ms")
                    .with_exporter(Arc::new(Slow)),
            )
            .unwrap();
        let manager = Manager::new(registry, SchedulerOptions::default());
        manager.start().await.unwrap();

        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let connector = Connector::new(
            manager.clone(),
            ServerAddress { host: "127.0.0.1".into(), port },
            ConnectorOptions {
                hostname: "web-01".to_string(),
                timeout: Duration::from_secs(3),
                refresh: Duration::from_secs(60),
            },
        );

        let fake_server = tokio::spawn(async move {
            reply(
                &server,
                r#"{"response":"success","data":[{"key":"slow"},{"key":"slow"}]}"#,
            )
            .await;
            reply(&server, r#"{"response":"success"}"#).await
        });

        connector.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        connector.stop().await;

        let data = tokio::time::timeout(Duration::from_secs(3), fake_server)
            .await
            .expect("agent data was not sent after stop")
            .unwrap();
        let values = data["data"].as_array().unwrap();
        assert_eq!(values.len(), 2);
        for value in values {
            assert_eq!(value["key"], "slow");
            assert_eq!(value["value"], "done");
            assert!(value.get("state").is_none());
        }

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_refresh_fails_without_server() {
        let manager = Manager::new(Registry::builtin().unwrap(), SchedulerOptions::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = Connector::new(
            manager,
            ServerAddress { host: "127.0.0.1".into(), port },
            ConnectorOptions {
                hostname: "web-01".to_string(),
                timeout: Duration::from_secs(1),
                refresh: Duration::from_secs(60),
            },
        );
        assert!(connector.refresh().await.is_err());

        connector.start();
        connector.stop().await;
    }
}
