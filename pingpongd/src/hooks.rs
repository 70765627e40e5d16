//! Platform lifecycle hooks around the engine's network resources.
//!
//! `setup` runs before anything is bound; `teardown` runs last during shutdown,
//! after sockets and the discovery session are released.

use std::process::Command;
use crate::config::HooksConfig;

pub trait PlatformHooks: Send + Sync {
    fn setup(&self) -> bool;
    fn teardown(&self) -> bool;
}

/// For platforms where multicast needs no special permission.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl PlatformHooks for NoopHooks {
    fn setup(&self) -> bool {
        true
    }

    fn teardown(&self) -> bool {
        true
    }
}

/// Runs an operator-supplied shell command for each stage, e.g. to open a
/// firewall port for mDNS. A stage without a command always succeeds.
#[derive(Debug, Default, Clone)]
pub struct CommandHooks {
    setup_command: Option<String>,
    teardown_command: Option<String>,
}

impl CommandHooks {
    pub fn from_config(config: &HooksConfig) -> Self {
        Self {
            setup_command: config.setup_command.clone(),
            teardown_command: config.teardown_command.clone(),
        }
    }
}

impl PlatformHooks for CommandHooks {
    fn setup(&self) -> bool {
        run_hook("setup", self.setup_command.as_deref())
    }

    fn teardown(&self) -> bool {
        run_hook("teardown", self.teardown_command.as_deref())
    }
}

fn run_hook(stage: &str, command: Option<&str>) -> bool {
    let Some(command) = command else {
        return true;
    };

    match Command::new("sh").arg("-c").arg(command).status() {
        Ok(status) if status.success() => {
            tracing::info!("Platform {} hook succeeded", stage);
            true
        }
        Ok(status) => {
            tracing::error!("Platform {} hook `{}` exited with {}", stage, command, status);
            false
        }
        Err(e) => {
            tracing::error!("Failed to run platform {} hook `{}`: {}", stage, command, e);
            false
        }
    }
}
