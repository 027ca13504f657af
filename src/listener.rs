//! Passive checks
//!
//! The listener accepts TCP connections on `ListenIP:ListenPort`. Each
//! connection carries one item key (framed or as a text line); the value, or
//! `ZBX_NOTSUPPORTED\0<error>`, is written back as a framed response and the
//! connection is closed. When `Server` is set, only the listed peers
//! (addresses, CIDR ranges or host names) are served.

use crate::config::AgentOptions;
use crate::protocol;
use crate::scheduler::Manager;
use anyhow::{anyhow, bail, Context, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Peers allowed to request passive checks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    // (network address, prefix length)
    networks: Vec<(IpAddr, u8)>,
}

impl AllowList {
    /// Build the allow list from the `Server` value, resolving host names
    pub async fn resolve(value: &str) -> Result<Self> {
        let mut networks = Vec::new();

        for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if let Some((addr, prefix)) = entry.split_once('/') {
                let addr: IpAddr = addr
                    .parse()
                    .with_context(|| format!("invalid address in \"{}\"", entry))?;
                let max = if addr.is_ipv4() { 32 } else { 128 };
                let prefix: u8 = prefix
                    .parse()
                    .ok()
                    .filter(|p| *p <= max)
                    .ok_or_else(|| anyhow!("invalid prefix length in \"{}\"", entry))?;
                networks.push((addr, prefix));
            } else if let Ok(addr) = entry.parse::<IpAddr>() {
                networks.push((addr, if addr.is_ipv4() { 32 } else { 128 }));
            } else {
                let resolved = tokio::net::lookup_host((entry, 0))
                    .await
                    .with_context(|| format!("cannot resolve \"{}\"", entry))?;
                for socket in resolved {
                    let addr = socket.ip().to_canonical();
                    networks.push((addr, if addr.is_ipv4() { 32 } else { 128 }));
                }
            }
        }

        if networks.is_empty() && !value.trim().is_empty() {
            bail!("no usable addresses in \"{}\"", value);
        }
        Ok(Self { networks })
    }

    /// An empty list permits every peer
    pub fn permits(&self, peer: IpAddr) -> bool {
        let peer = peer.to_canonical();
        self.networks.is_empty()
            || self
                .networks
                .iter()
                .any(|(network, prefix)| contains(*network, *prefix, peer))
    }
}

fn contains(network: IpAddr, prefix: u8, addr: IpAddr) -> bool {
    match (network, addr) {
        (IpAddr::V4(network), IpAddr::V4(addr)) => {
            let mask = u32::MAX.checked_shl(32 - prefix as u32).unwrap_or(0);
            u32::from(network) & mask == u32::from(addr) & mask
        }
        (IpAddr::V6(network), IpAddr::V6(addr)) => {
            let mask = u128::MAX.checked_shl(128 - prefix as u32).unwrap_or(0);
            u128::from(network) & mask == u128::from(addr) & mask
        }
        _ => false,
    }
}

/// Listener settings
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub listen_ip: String,
    pub listen_port: u16,
    pub timeout: Duration,
    /// Value of `Server`; empty allows every peer
    pub server: Option<String>,
    /// Extra time granted to open connections on stop
    pub stop_margin: Duration,
}

impl From<&AgentOptions> for ListenerOptions {
    fn from(options: &AgentOptions) -> Self {
        Self {
            listen_ip: options.listen_ip.clone(),
            listen_port: options.listen_port,
            timeout: Duration::from_secs(options.timeout),
            server: options.server.clone(),
            stop_margin: Duration::from_secs(1),
        }
    }
}

/// Passive check server
pub struct Listener {
    manager: Manager,
    options: ListenerOptions,
    shutdown: CancellationToken,
    connections: TaskTracker,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    pub fn new(manager: Manager, options: ListenerOptions) -> Self {
        Self {
            manager,
            options,
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
            accept: Mutex::new(None),
        }
    }

    /// Bind the socket and spawn the accept loop; returns the bound address
    pub async fn start(&self) -> Result<SocketAddr> {
        let allow = AllowList::resolve(self.options.server.as_deref().unwrap_or_default())
            .await
            .context("invalid \"Server\" value")?;

        let bind = (self.options.listen_ip.as_str(), self.options.listen_port);
        let listener = TcpListener::bind(bind).await.with_context(|| {
            format!(
                "cannot listen on {}:{}",
                self.options.listen_ip, self.options.listen_port
            )
        })?;
        let local = listener.local_addr()?;
        info!("listening for passive checks on {}", local);

        let manager = self.manager.clone();
        let timeout = self.options.timeout;
        let shutdown = self.shutdown.clone();
        let connections = self.connections.clone();

        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, peer)) => {
                        if !allow.permits(peer.ip()) {
                            warn!("connection from \"{}\" rejected, allowed hosts: {:?}", peer.ip(), allow);
                            continue;
                        }
                        connections.spawn(serve(manager.clone(), stream, peer, timeout));
                    }
                    Err(e) => {
                        warn!("cannot accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        *self.accept.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        Ok(local)
    }

    /// Close the socket and wait for open connections to finish
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self
            .accept
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }

        self.connections.close();
        let grace = self.options.timeout + self.options.stop_margin;
        if tokio::time::timeout(grace, self.connections.wait())
            .await
            .is_err()
        {
            warn!(
                "{} passive check connections still open after {:?}",
                self.connections.len(),
                grace
            );
        }
        debug!("listener stopped");
    }
}

async fn serve(manager: Manager, mut stream: TcpStream, peer: SocketAddr, timeout: Duration) {
    let request = match tokio::time::timeout(timeout, protocol::read_request(&mut stream)).await {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            debug!("cannot read request from {}: {}", peer, e);
            return;
        }
        Err(_) => {
            debug!("timed out reading request from {}", peer);
            return;
        }
    };

    debug!("processing passive check {} from {}", request, peer);
    let result = manager.perform_task(&request, timeout).await;
    if let Err(e) = &result {
        debug!("passive check {} failed: {}", request, e);
    }

    let payload = protocol::encode_passive_result(&result);
    match tokio::time::timeout(timeout, protocol::write_frame(&mut stream, &payload)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("cannot send response to {}: {}", peer, e),
        Err(_) => debug!("timed out sending response to {}", peer),
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Registry;
    use crate::protocol::{decode_passive_result, encode, read_frame};
    use crate::scheduler::SchedulerOptions;

    #[test]
    fn test_cidr_matching() {
        let v4: IpAddr = "192.168.1.0".parse().unwrap();
        assert!(contains(v4, 24, "192.168.1.77".parse().unwrap()));
        assert!(!contains(v4, 24, "192.168.2.1".parse().unwrap()));
        assert!(contains(v4, 0, "10.0.0.1".parse().unwrap()));

        let v6: IpAddr = "fd00::".parse().unwrap();
        assert!(contains(v6, 8, "fd12::1".parse().unwrap()));
        assert!(!contains(v6, 8, "fe80::1".parse().unwrap()));
        assert!(!contains(v4, 24, "::1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_allow_list() {
        let allow = AllowList::resolve("127.0.0.1, 10.0.0.0/8, ::1").await.unwrap();
        assert!(allow.permits("127.0.0.1".parse().unwrap()));
        assert!(allow.permits("10.20.30.40".parse().unwrap()));
        assert!(allow.permits("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!allow.permits("192.168.0.1".parse().unwrap()));

        assert!(AllowList::resolve("").await.unwrap().permits("8.8.8.8".parse().unwrap()));
        assert!(AllowList::resolve("10.0.0.0/33").await.is_err());
        assert!(AllowList::resolve("300.1.1.1/8").await.is_err());
    }

    async fn running_listener(server: Option<&str>) -> (Manager, Listener, SocketAddr) {
        let manager = Manager::new(Registry::builtin().unwrap(), SchedulerOptions::default());
        manager.start().await.unwrap();
        let listener = Listener::new(
            manager.clone(),
            ListenerOptions {
                listen_ip: "127.0.0.1".to_string(),
                listen_port: 0,
                timeout: Duration::from_secs(3),
                server: server.map(str::to_string),
                stop_margin: Duration::from_millis(100),
            },
        );
        let addr = listener.start().await.unwrap();
        (manager, listener, addr)
    }

    async fn query(addr: SocketAddr, request: &[u8]) -> std::io::Result<Result<String, String>> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(request).await?;
        let payload = read_frame(&mut stream)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        Ok(decode_passive_result(&payload))
    }

    #[tokio::test]
    async fn test_passive_checks() {
        let (manager, listener, addr) = running_listener(None).await;

        assert_eq!(query(addr, &encode(b"agent.ping")).await.unwrap(), Ok("1".to_string()));
        assert_eq!(query(addr, b"agent.ping\n").await.unwrap(), Ok("1".to_string()));

        let unsupported = query(addr, b"no.such.key\n").await.unwrap().unwrap_err();
        assert!(unsupported.contains("Unsupported item key"));

        listener.stop().await;
        manager.stop().await;
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_rejected_peer_gets_no_answer() {
        let (manager, listener, addr) = running_listener(Some("192.0.2.1")).await;
        assert!(query(addr, b"agent.ping\n").await.is_err());
        listener.stop().await;
        manager.stop().await;
    }
}
