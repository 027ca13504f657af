//! Filesystem usage
//!
//! ```text
//! vfs.fs.size[fs,<mode>]   mode: total (default) | free | used | pfree | pused
//! ```

use super::{check_params, percent};
use crate::itemkey::ItemKey;
use crate::plugin::{ExportContext, Exporter, ItemValue, Plugin};
use anyhow::{anyhow, bail, Result};
use std::path::Path;
use std::sync::Arc;
use sysinfo::Disks;

struct DiskExporter;

impl Exporter for DiskExporter {
    fn export(&self, key: &ItemKey, _ctx: &ExportContext) -> Result<ItemValue> {
        if key.name() != "vfs.fs.size" {
            bail!("Unsupported item key: {}", key.name());
        }
        check_params(key, 2)?;

        let fs = key
            .param(0)
            .ok_or_else(|| anyhow!("Invalid first parameter."))?;

        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .find(|disk| disk.mount_point() == Path::new(fs))
            .ok_or_else(|| anyhow!("Cannot obtain filesystem information for \"{}\".", fs))?;

        let total = disk.total_space();
        let free = disk.available_space();
        let used = total.saturating_sub(free);

        let value = match key.param(1).unwrap_or("total") {
            "total" => ItemValue::Unsigned(total),
            "free" => ItemValue::Unsigned(free),
            "used" => ItemValue::Unsigned(used),
            "pfree" => ItemValue::Float(percent(free, total)),
            "pused" => ItemValue::Float(percent(used, total)),
            other => bail!("Invalid second parameter \"{}\".", other),
        };
        Ok(value)
    }
}

pub fn plugin() -> Plugin {
    Plugin::new("Disk")
        .with_metric("vfs.fs.size", "Disk space in bytes or in percentage from total.")
        .with_exporter(Arc::new(DiskExporter))
}
