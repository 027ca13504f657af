//! Network interface counters

use super::check_params;
use crate::itemkey::ItemKey;
use crate::plugin::{ExportContext, Exporter, ItemValue, Plugin};
use anyhow::{anyhow, bail, Result};
use std::sync::Arc;
use sysinfo::Networks;

struct NetworkExporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    In,
    Out,
}

impl Exporter for NetworkExporter {
    /// `net.if.in[if,<mode>]` / `net.if.out[if,<mode>]`, mode: bytes | packets | errors
    fn export(&self, key: &ItemKey, _ctx: &ExportContext) -> Result<ItemValue> {
        let direction = match key.name() {
            "net.if.in" => Direction::In,
            "net.if.out" => Direction::Out,
            other => bail!("Unsupported item key: {}", other),
        };
        check_params(key, 2)?;

        let interface = key
            .param(0)
            .ok_or_else(|| anyhow!("Network interface name cannot be empty."))?;

        let networks = Networks::new_with_refreshed_list();
        let data = networks
            .list()
            .get(interface)
            .ok_or_else(|| anyhow!("Cannot find information for interface \"{}\".", interface))?;

        let value = match (key.param(1).unwrap_or("bytes"), direction) {
            ("bytes", Direction::In) => data.total_received(),
            ("bytes", Direction::Out) => data.total_transmitted(),
            ("packets", Direction::In) => data.total_packets_received(),
            ("packets", Direction::Out) => data.total_packets_transmitted(),
            ("errors", Direction::In) => data.total_errors_on_received(),
            ("errors", Direction::Out) => data.total_errors_on_transmitted(),
            (other, _) => bail!("Invalid second parameter \"{}\".", other),
        };
        Ok(ItemValue::Unsigned(value))
    }
}

pub fn plugin() -> Plugin {
    Plugin::new("Network")
        .with_metric("net.if.in", "Incoming traffic statistics on network interface.")
        .with_metric("net.if.out", "Outgoing traffic statistics on network interface.")
        .with_exporter(Arc::new(NetworkExporter))
}
