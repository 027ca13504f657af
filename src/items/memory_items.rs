//! Memory and swap usage
//!
//! ```text
//! vm.memory.size[<mode>]             total (default) | free | used | available
//!                                    | pused | pavailable
//! system.swap.size[<device>,<mode>]  device: all (default)
//!                                    mode: free (default) | total | used | pfree | pused
//! ```

use super::{check_params, percent};
use crate::itemkey::ItemKey;
use crate::plugin::{ExportContext, Exporter, ItemValue, Plugin};
use anyhow::{bail, Result};
use std::sync::Arc;
use sysinfo::System;

struct MemoryExporter;

fn memory_size(key: &ItemKey) -> Result<ItemValue> {
    check_params(key, 1)?;

    let mut system = System::new();
    system.refresh_memory();
    let total = system.total_memory();

    let value = match key.param(0).unwrap_or("total") {
        "total" => ItemValue::Unsigned(total),
        "free" => ItemValue::Unsigned(system.free_memory()),
        "used" => ItemValue::Unsigned(system.used_memory()),
        "available" => ItemValue::Unsigned(system.available_memory()),
        "pused" => ItemValue::Float(percent(system.used_memory(), total)),
        "pavailable" => ItemValue::Float(percent(system.available_memory(), total)),
        other => bail!("Invalid first parameter \"{}\".", other),
    };
    Ok(value)
}

fn swap_size(key: &ItemKey) -> Result<ItemValue> {
    check_params(key, 2)?;

    if !matches!(key.param(0), None | Some("all")) {
        bail!("Invalid first parameter.");
    }

    let mut system = System::new();
    system.refresh_memory();
    let total = system.total_swap();

    let value = match key.param(1).unwrap_or("free") {
        "free" => ItemValue::Unsigned(system.free_swap()),
        "total" => ItemValue::Unsigned(total),
        "used" => ItemValue::Unsigned(system.used_swap()),
        "pfree" => ItemValue::Float(percent(system.free_swap(), total)),
        "pused" => ItemValue::Float(percent(system.used_swap(), total)),
        other => bail!("Invalid second parameter \"{}\".", other),
    };
    Ok(value)
}

impl Exporter for MemoryExporter {
    fn export(&self, key: &ItemKey, _ctx: &ExportContext) -> Result<ItemValue> {
        match key.name() {
            "vm.memory.size" => memory_size(key),
            "system.swap.size" => swap_size(key),
            other => bail!("Unsupported item key: {}", other),
        }
    }
}

pub fn plugin() -> Plugin {
    Plugin::new("Memory")
        .with_metric("vm.memory.size", "Memory size in bytes or in percentage from total.")
        .with_metric("system.swap.size", "Swap space size in bytes or in percentage from total.")
        .with_exporter(Arc::new(MemoryExporter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::testing::export;

    #[test]
    fn test_memory_size() {
        let total = match export(&MemoryExporter, "vm.memory.size").unwrap() {
            ItemValue::Unsigned(total) => total,
            other => panic!("unexpected value {:?}", other),
        };
        assert!(total > 0);

        match export(&MemoryExporter, "vm.memory.size[pused]").unwrap() {
            ItemValue::Float(p) => assert!((0.0..=100.0).contains(&p)),
            other => panic!("unexpected value {:?}", other),
        }
        assert!(export(&MemoryExporter, "vm.memory.size[shared]").is_err());
    }

    #[test]
    fn test_swap_size() {
        assert!(export(&MemoryExporter, "system.swap.size").is_ok());
        assert!(export(&MemoryExporter, "system.swap.size[all,total]").is_ok());
        assert!(export(&MemoryExporter, "system.swap.size[/dev/sda2]").is_err());
        assert!(export(&MemoryExporter, "system.swap.size[,bogus]").is_err());
    }
}
