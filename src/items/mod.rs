//! Built-in item providers
//!
//! Each module registers one plugin with the item keys it serves:
//!
//! | Plugin  | Item keys |
//! |---------|-----------|
//! | Agent   | `agent.ping`, `agent.version` |
//! | System  | `system.hostname`, `system.uname`, `system.uptime`, `system.boottime`, `system.sw.arch` |
//! | Cpu     | `system.cpu.num`, `system.cpu.util`, `system.cpu.load` |
//! | Memory  | `vm.memory.size`, `system.swap.size` |
//! | Disk    | `vfs.fs.size` |
//! | Network | `net.if.in`, `net.if.out` |
//! | Process | `proc.num` |
//! | Command | `system.run` (disabled unless `Plugins.Command.Enable=1`) |

pub mod agent_items;
pub mod command_items;
pub mod cpu_items;
pub mod disk_items;
pub mod memory_items;
pub mod network_items;
pub mod process_items;
pub mod system_items;

use crate::itemkey::ItemKey;
use crate::plugin::Registry;
use anyhow::{bail, Result};

/// Register every built-in plugin
pub fn register_builtin(registry: &mut Registry) -> Result<()> {
    registry.register(agent_items::plugin())?;
    registry.register(system_items::plugin())?;
    registry.register(cpu_items::plugin())?;
    registry.register(memory_items::plugin())?;
    registry.register(disk_items::plugin())?;
    registry.register(network_items::plugin())?;
    registry.register(process_items::plugin())?;
    registry.register(command_items::plugin())?;
    Ok(())
}

pub(crate) fn check_params(key: &ItemKey, max: usize) -> Result<()> {
    if key.params().len() > max {
        bail!("Too many parameters.");
    }
    Ok(())
}

/// Share of `part` in `total` as a percentage; 0 when `total` is 0
pub(crate) fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(percent(1, 4), 25.0);
        assert_eq!(percent(5, 0), 0.0);
    }

    #[test]
    fn test_check_params() {
        let key = ItemKey::parse("a.b[1,2]").unwrap();
        assert!(check_params(&key, 2).is_ok());
        assert!(check_params(&key, 1).is_err());
    }

    #[test]
    fn test_builtin_plugins_register() {
        let mut registry = Registry::new();
        register_builtin(&mut registry).unwrap();
        let names: Vec<&str> = registry.plugins().iter().map(|p| p.name()).collect();
        assert_eq!(
            names,
            vec!["Agent", "System", "Cpu", "Memory", "Disk", "Network", "Process", "Command"]
        );
    }
}
