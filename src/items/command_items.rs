//! Remote command execution
//!
//! `system.run[command,<mode>]` runs `command` through `sh -c`. With mode
//! `wait` (default) the trimmed standard output is returned; `nowait` starts
//! the command and returns 1 immediately.
//!
//! Disabled unless the configuration enables it:
//!
//! ```text
//! Plugins.Command.Enable=1
//! Plugins.Command.Capacity=4
//! ```
//!
//! A running command is killed once the task deadline passes.

use super::check_params;
use crate::config::PluginOptions;
use crate::itemkey::ItemKey;
use crate::plugin::{Configurator, ExportContext, Exporter, ItemValue, Plugin};
use anyhow::{anyhow, bail, Context, Result};
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
pub struct CommandRunner {
    enabled: AtomicBool,
}

impl CommandRunner {
    fn run(&self, command: &str, ctx: &ExportContext) -> Result<String> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("Cannot execute command")?;

        let stdout = child.stdout.take();
        let (sender, output) = mpsc::channel();
        std::thread::spawn(move || {
            let mut buffer = Vec::new();
            if let Some(mut stdout) = stdout {
                let _ = stdout.read_to_end(&mut buffer);
            }
            let _ = sender.send(buffer);
        });

        loop {
            if child.try_wait()?.is_some() {
                break;
            }
            if ctx.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                bail!("Timeout while executing a shell script.");
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        // background processes started by the command may keep stdout open
        loop {
            match output.recv_timeout(POLL_INTERVAL) {
                Ok(buffer) => return Ok(String::from_utf8_lossy(&buffer).trim_end().to_string()),
                Err(RecvTimeoutError::Timeout) if !ctx.is_cancelled() => {}
                Err(RecvTimeoutError::Timeout) => {
                    bail!("Timeout while executing a shell script.")
                }
                Err(RecvTimeoutError::Disconnected) => bail!("Cannot read command output."),
            }
        }
    }
}

impl Exporter for CommandRunner {
    fn export(&self, key: &ItemKey, ctx: &ExportContext) -> Result<ItemValue> {
        if key.name() != "system.run" {
            bail!("Unsupported item key: {}", key.name());
        }
        if !self.enabled.load(Ordering::Relaxed) {
            bail!("Remote commands are not enabled.");
        }
        check_params(key, 2)?;

        let command = key
            .param(0)
            .ok_or_else(|| anyhow!("Invalid first parameter."))?;

        match key.param(1).unwrap_or("wait") {
            "wait" => self.run(command, ctx).map(ItemValue::Text),
            "nowait" => {
                let mut child = Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()
                    .context("Cannot execute command")?;
                debug!("started background command with pid {}", child.id());
                std::thread::spawn(move || {
                    let _ = child.wait();
                });
                Ok(ItemValue::Unsigned(1))
            }
            other => bail!("Invalid second parameter \"{}\".", other),
        }
    }
}

impl Configurator for CommandRunner {
    fn configure(&self, options: &PluginOptions) -> Result<()> {
        let enabled = options
            .get_bool("Enable")
            .context("invalid Plugins.Command.Enable")?
            .unwrap_or(false);
        self.enabled.store(enabled, Ordering::Relaxed);
        Ok(())
    }
}

pub fn plugin() -> Plugin {
    let runner = Arc::new(CommandRunner::default());
    Plugin::new("Command")
        .with_metric("system.run", "Run specified command on the host.")
        .with_exporter(runner.clone())
        .with_configurator(runner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::testing::export;
    use std::time::Instant;
    use tokio_util::sync::CancellationToken;

    fn enabled() -> CommandRunner {
        let runner = CommandRunner::default();
        let mut options = PluginOptions::default();
        options.insert("Enable", serde_json::json!("1"));
        runner.configure(&options).unwrap();
        runner
    }

    #[test]
    fn test_disabled_by_default() {
        let runner = CommandRunner::default();
        runner.configure(&PluginOptions::default()).unwrap();
        let err = export(&runner, "system.run[echo hi]").unwrap_err();
        assert!(err.to_string().contains("not enabled"));
    }

    #[test]
    fn test_run_returns_output() {
        let runner = enabled();
        assert_eq!(
            export(&runner, "system.run[\"echo hello; echo world\"]")
                .unwrap()
                .to_string(),
            "hello\nworld"
        );
        assert!(export(&runner, "system.run").is_err());
        assert!(export(&runner, "system.run[true,later]").is_err());
    }

    #[test]
    fn test_nowait_returns_immediately() {
        let runner = enabled();
        assert_eq!(
            export(&runner, "system.run[\"sleep 1\",nowait]").unwrap(),
            ItemValue::Unsigned(1)
        );
    }

    #[test]
    fn test_command_killed_at_deadline() {
        let runner = enabled();
        let ctx = ExportContext::new(
            Instant::now() + Duration::from_millis(100),
            CancellationToken::new(),
        );
        let started = Instant::now();
        assert!(runner.run("sleep 5", &ctx).is_err());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_lingering_output_released_at_deadline() {
        let runner = enabled();
        let ctx = ExportContext::new(
            Instant::now() + Duration::from_millis(200),
            CancellationToken::new(),
        );
        let started = Instant::now();
        let err = runner.run("sleep 5 & echo hi", &ctx).unwrap_err();
        assert!(err.to_string().contains("Timeout"));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_invalid_enable_option() {
        let runner = CommandRunner::default();
        let mut options = PluginOptions::default();
        options.insert("Enable", serde_json::json!("maybe"));
        assert!(runner.configure(&options).is_err());
    }
}
