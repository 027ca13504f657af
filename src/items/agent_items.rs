//! Agent self-checks

use super::check_params;
use crate::itemkey::ItemKey;
use crate::plugin::{ExportContext, Exporter, ItemValue, Plugin};
use anyhow::{bail, Result};
use std::sync::Arc;

struct AgentExporter;

impl Exporter for AgentExporter {
    fn export(&self, key: &ItemKey, _ctx: &ExportContext) -> Result<ItemValue> {
        check_params(key, 0)?;
        match key.name() {
            "agent.ping" => Ok(ItemValue::Unsigned(1)),
            "agent.version" => Ok(ItemValue::from(env!("CARGO_PKG_VERSION"))),
            other => bail!("Unsupported item key: {}", other),
        }
    }
}

pub fn plugin() -> Plugin {
    Plugin::new("Agent")
        .with_metric("agent.ping", "Returns agent availability check result.")
        .with_metric("agent.version", "Version of the agent.")
        .with_exporter(Arc::new(AgentExporter))
}
