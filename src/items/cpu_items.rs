//! CPU statistics
//!
//! The Cpu plugin combines all three capabilities: the runner owns a
//! `sysinfo::System` between scheduler start and stop, the collector samples
//! utilization every second, and the exporter answers from the last sample.
//!
//! ```text
//! system.cpu.num[<type>]          type: online (default)
//! system.cpu.util                 percent, from the last sample
//! system.cpu.load[<cpu>,<mode>]   cpu: all (default) | percpu
//!                                 mode: avg1 (default) | avg5 | avg15
//! ```

use super::check_params;
use crate::itemkey::ItemKey;
use crate::plugin::{Collector, ExportContext, Exporter, ItemValue, Plugin, Runner};
use anyhow::{anyhow, bail, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use sysinfo::System;

/// Utilization sampling period
pub const SAMPLE_PERIOD: Duration = Duration::from_secs(1);

#[derive(Default)]
pub struct CpuStats {
    // present while the runner is started
    system: Mutex<Option<System>>,
    utilization: Mutex<Option<f64>>,
}

impl CpuStats {
    fn system(&self) -> MutexGuard<'_, Option<System>> {
        self.system.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn utilization(&self) -> MutexGuard<'_, Option<f64>> {
        self.utilization.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cpu_count(&self) -> usize {
        if let Some(system) = self.system().as_ref() {
            if !system.cpus().is_empty() {
                return system.cpus().len();
            }
        }
        let mut system = System::new();
        system.refresh_cpu();
        system.cpus().len()
    }

    fn load(&self, key: &ItemKey) -> Result<ItemValue> {
        check_params(key, 2)?;

        let average = System::load_average();
        let load = match key.param(1).unwrap_or("avg1") {
            "avg1" => average.one,
            "avg5" => average.five,
            "avg15" => average.fifteen,
            other => bail!("Invalid second parameter \"{}\".", other),
        };

        match key.param(0).unwrap_or("all") {
            "all" => Ok(ItemValue::Float(load)),
            "percpu" => {
                let cpus = self.cpu_count();
                if cpus == 0 {
                    bail!("Cannot obtain number of CPUs.");
                }
                Ok(ItemValue::Float(load / cpus as f64))
            }
            other => bail!("Invalid first parameter \"{}\".", other),
        }
    }
}

impl Exporter for CpuStats {
    fn export(&self, key: &ItemKey, _ctx: &ExportContext) -> Result<ItemValue> {
        match key.name() {
            "system.cpu.num" => {
                check_params(key, 1)?;
                if !matches!(key.param(0), None | Some("online")) {
                    bail!("Invalid first parameter.");
                }
                Ok(ItemValue::Unsigned(self.cpu_count() as u64))
            }
            "system.cpu.util" => {
                check_params(key, 0)?;
                self.utilization()
                    .map(ItemValue::Float)
                    .ok_or_else(|| anyhow!("No data gathered yet."))
            }
            "system.cpu.load" => self.load(key),
            other => bail!("Unsupported item key: {}", other),
        }
    }
}

impl Collector for CpuStats {
    fn collect(&self) -> Result<()> {
        let mut guard = self.system();
        let Some(system) = guard.as_mut() else {
            return Ok(());
        };
        system.refresh_cpu();
        let usage = system.global_cpu_info().cpu_usage() as f64;
        drop(guard);

        *self.utilization() = Some(usage);
        Ok(())
    }

    fn period(&self) -> Duration {
        SAMPLE_PERIOD
    }
}

impl Runner for CpuStats {
    fn start(&self) -> Result<()> {
        let mut system = System::new();
        // first refresh is the baseline for the next utilization sample
        system.refresh_cpu();
        *self.system() = Some(system);
        Ok(())
    }

    fn stop(&self) {
        *self.system() = None;
        *self.utilization() = None;
    }
}

pub fn plugin() -> Plugin {
    let stats = Arc::new(CpuStats::default());
    Plugin::new("Cpu")
        .with_metric("system.cpu.num", "Number of CPUs.")
        .with_metric("system.cpu.util", "CPU utilization percentage.")
        .with_metric("system.cpu.load", "CPU load.")
        .with_exporter(stats.clone())
        .with_collector(stats.clone())
        .with_runner(stats)
}
