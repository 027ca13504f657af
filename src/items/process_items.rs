//! Process counts
//!
//! ```text
//! proc.num[<name>,<user>,<state>,<cmdline>]
//!   name     exact process name, empty for all
//!   user     owner user name, empty for all
//!   state    all (default) | run | sleep | zomb
//!   cmdline  regular expression matched against the full command line
//! ```

use super::check_params;
use crate::itemkey::ItemKey;
use crate::plugin::{ExportContext, Exporter, ItemValue, Plugin};
use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use std::sync::Arc;
use sysinfo::{Process, ProcessStatus, System, Users};

struct ProcessExporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateFilter {
    All,
    Run,
    Sleep,
    Zombie,
}

impl StateFilter {
    fn parse(value: Option<&str>) -> Result<Self> {
        match value.unwrap_or("all") {
            "all" => Ok(StateFilter::All),
            "run" => Ok(StateFilter::Run),
            "sleep" => Ok(StateFilter::Sleep),
            "zomb" => Ok(StateFilter::Zombie),
            other => bail!("Invalid third parameter \"{}\".", other),
        }
    }

    fn matches(self, status: ProcessStatus) -> bool {
        match self {
            StateFilter::All => true,
            StateFilter::Run => status == ProcessStatus::Run,
            StateFilter::Sleep => matches!(status, ProcessStatus::Sleep | ProcessStatus::Idle),
            StateFilter::Zombie => status == ProcessStatus::Zombie,
        }
    }
}

fn command_line(process: &Process) -> String {
    process.cmd().join(" ")
}

impl Exporter for ProcessExporter {
    fn export(&self, key: &ItemKey, _ctx: &ExportContext) -> Result<ItemValue> {
        if key.name() != "proc.num" {
            bail!("Unsupported item key: {}", key.name());
        }
        check_params(key, 4)?;

        let name = key.param(0);
        let state = StateFilter::parse(key.param(2))?;
        let cmdline = key
            .param(3)
            .map(Regex::new)
            .transpose()
            .context("Invalid fourth parameter")?;

        let uid = match key.param(1) {
            Some(user) => {
                let users = Users::new_with_refreshed_list();
                let uid = users
                    .list()
                    .iter()
                    .find(|u| u.name() == user)
                    .map(|u| u.id().clone())
                    .ok_or_else(|| anyhow!("Cannot obtain user information for \"{}\".", user))?;
                Some(uid)
            }
            None => None,
        };

        let mut system = System::new();
        system.refresh_processes();

        let count = system
            .processes()
            .values()
            .filter(|p| name.map_or(true, |n| p.name() == n))
            .filter(|p| uid.as_ref().map_or(true, |uid| p.user_id() == Some(uid)))
            .filter(|p| state.matches(p.status()))
            .filter(|p| {
                cmdline
                    .as_ref()
                    .map_or(true, |re| re.is_match(&command_line(p)))
            })
            .count();

        Ok(ItemValue::Unsigned(count as u64))
    }
}

pub fn plugin() -> Plugin {
    Plugin::new("Process")
        .with_metric("proc.num", "The number of processes.")
        .with_exporter(Arc::new(ProcessExporter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::testing::export;

    fn count(key: &str) -> u64 {
        match export(&ProcessExporter, key).unwrap() {
            ItemValue::Unsigned(n) => n,
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn test_count_all_processes() {
        assert!(count("proc.num") > 0);
        assert!(count("proc.num[,,all]") >= count("proc.num[,,zomb]"));
    }

    #[test]
    fn test_unknown_process_name() {
        assert_eq!(count("proc.num[no-such-process-name-xyz]"), 0);
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(export(&ProcessExporter, "proc.num[,,dead]").is_err());
        assert!(export(&ProcessExporter, "proc.num[,,,\"(unclosed\"]").is_err());
        assert!(export(&ProcessExporter, "proc.num[,no-such-user-xyz]").is_err());
        assert!(export(&ProcessExporter, "proc.num[a,b,c,d,e]").is_err());
    }

    #[test]
    fn test_state_filter() {
        assert!(StateFilter::All.matches(ProcessStatus::Zombie));
        assert!(StateFilter::Sleep.matches(ProcessStatus::Idle));
        assert!(!StateFilter::Run.matches(ProcessStatus::Sleep));
    }
}
