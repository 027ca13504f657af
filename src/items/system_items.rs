//! Host identity and kernel information
//!
//! ```text
//! system.hostname[<type>,<transform>]   type: host (default) | shorthost
//!                                       transform: none (default) | lower
//! system.uname
//! system.uptime                         seconds since boot
//! system.boottime                       boot time as a unix timestamp
//! system.sw.arch
//! ```

use super::check_params;
use crate::itemkey::ItemKey;
use crate::plugin::{ExportContext, Exporter, ItemValue, Plugin};
use anyhow::{anyhow, bail, Result};
use std::sync::Arc;
use sysinfo::System;

struct SystemExporter;

fn hostname(key: &ItemKey) -> Result<ItemValue> {
    check_params(key, 2)?;

    let name = hostname::get()
        .map_err(|e| anyhow!("Cannot obtain host name: {}", e))?
        .to_string_lossy()
        .to_string();

    let name = match key.param(0).unwrap_or("host") {
        "host" => name,
        "shorthost" => name.split('.').next().unwrap_or_default().to_string(),
        other => bail!("Invalid first parameter \"{}\".", other),
    };

    let name = match key.param(1).unwrap_or("none") {
        "none" => name,
        "lower" => name.to_lowercase(),
        other => bail!("Invalid second parameter \"{}\".", other),
    };

    Ok(ItemValue::Text(name))
}

fn uname() -> ItemValue {
    let parts = [
        System::name(),
        System::host_name(),
        System::kernel_version(),
        System::os_version(),
        System::cpu_arch(),
    ];
    let uname = parts
        .into_iter()
        .flatten()
        .collect::<Vec<String>>()
        .join(" ");
    ItemValue::Text(uname)
}

impl Exporter for SystemExporter {
    fn export(&self, key: &ItemKey, _ctx: &ExportContext) -> Result<ItemValue> {
        match key.name() {
            "system.hostname" => hostname(key),
            "system.uname" => {
                check_params(key, 0)?;
                Ok(uname())
            }
            "system.uptime" => {
                check_params(key, 0)?;
                Ok(ItemValue::Unsigned(System::uptime()))
            }
            "system.boottime" => {
                check_params(key, 0)?;
                Ok(ItemValue::Unsigned(System::boot_time()))
            }
            "system.sw.arch" => {
                check_params(key, 0)?;
                System::cpu_arch()
                    .map(ItemValue::Text)
                    .ok_or_else(|| anyhow!("Cannot obtain system architecture."))
            }
            other => bail!("Unsupported item key: {}", other),
        }
    }
}

pub fn plugin() -> Plugin {
    Plugin::new("System")
        .with_metric("system.hostname", "System host name.")
        .with_metric("system.uname", "Detailed host information.")
        .with_metric("system.uptime", "System uptime in seconds.")
        .with_metric("system.boottime", "System boot time.")
        .with_metric("system.sw.arch", "Software architecture information.")
        .with_exporter(Arc::new(SystemExporter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::testing::export;

    #[test]
    fn test_hostname_variants() {
        let host = export(&SystemExporter, "system.hostname").unwrap().to_string();
        assert!(!host.is_empty());

        let short = export(&SystemExporter, "system.hostname[shorthost]")
            .unwrap()
            .to_string();
        assert!(!short.contains('.'));
        assert!(host.starts_with(&short));

        let lower = export(&SystemExporter, "system.hostname[host,lower]")
            .unwrap()
            .to_string();
        assert_eq!(lower, host.to_lowercase());

        assert!(export(&SystemExporter, "system.hostname[netbios]").is_err());
        assert!(export(&SystemExporter, "system.hostname[host,upper]").is_err());
    }

    #[test]
    fn test_uptime_and_boottime() {
        match export(&SystemExporter, "system.boottime").unwrap() {
            ItemValue::Unsigned(boot) => assert!(boot > 0),
            other => panic!("unexpected value {:?}", other),
        }
        assert!(matches!(
            export(&SystemExporter, "system.uptime").unwrap(),
            ItemValue::Unsigned(_)
        ));
        assert!(export(&SystemExporter, "system.uptime[1]").is_err());
    }
}
