use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use super::relocate::{check_update_plugin, plugin_base};
use super::CommandSpec;
use crate::config::store::{ControllerInfo, EnvironmentInfo};
use crate::config::Settings;
use crate::error::UpgradeError;
use crate::executor::quote::shell_join;
use crate::executor::{ExecOptions, ExecOutput, SshRunner};

/// Everything the workstation half of a command knows before it reaches
/// out to the API server.
#[derive(Debug)]
pub struct ClientContext {
    pub settings: Settings,
    pub runner: SshRunner,
    pub plugin: PathBuf,
    pub env_name: String,
    pub env: EnvironmentInfo,
    /// API server address with the port stripped.
    pub address: String,
    controller_arg: Option<String>,
    debug: bool,
}

impl ClientContext {
    /// Resolve the plugin's own path, the environment and, for commands
    /// that need one, the target controller.
    pub fn init(
        settings: &Settings,
        spec: &CommandSpec,
        env_name: Option<&str>,
        controller: Option<&str>,
        debug: bool,
    ) -> Result<Self> {
        let plugin = std::env::current_exe().context("finding plugin location")?;

        let Some(env_name) = env_name else {
            bail!("no environment name specified");
        };

        let controller_arg = if spec.needs_controller {
            let Some(controller) = controller else {
                bail!("no controller name specified");
            };
            let info = ControllerInfo::load(&settings.juju_data, controller)?;
            tracing::debug!(controller = controller, addrs = ?info.addrs, "Controller info loaded");
            Some(info.encode()?)
        } else {
            None
        };

        let env = EnvironmentInfo::load(&settings.juju_home, env_name)?;
        let address = env.target_address()?;

        Ok(Self {
            settings: settings.clone(),
            runner: SshRunner::new(&settings.ssh),
            plugin,
            env_name: env_name.to_string(),
            env,
            address,
            controller_arg,
            debug,
        })
    }

    /// Use a different local binary as the plugin.
    pub fn with_plugin(mut self, plugin: impl Into<PathBuf>) -> Self {
        self.plugin = plugin.into();
        self
    }

    pub fn plugin(&self) -> &Path {
        &self.plugin
    }

    /// `./<plugin> <impl> [<controller info>] <extra...> [--debug]`
    pub fn remote_command_line(&self, impl_name: &str, extra: &[String]) -> Result<String> {
        let mut words = vec![format!("./{}", plugin_base(&self.plugin)?), impl_name.to_string()];
        if let Some(arg) = &self.controller_arg {
            words.push(arg.clone());
        }
        words.extend(extra.iter().cloned());
        if self.debug {
            words.push("--debug".to_string());
        }
        Ok(shell_join(&words))
    }

    /// Make sure the API server runs this build of the plugin.
    pub async fn prepare(&self) -> Result<()> {
        check_update_plugin(&self.runner, &self.plugin, &self.address)
            .await
            .context("checking remote plugin")?;
        Ok(())
    }

    /// Run the impl half with the given I/O options and hand back its
    /// output. A non-zero exit is not an error here.
    pub async fn run_remote(&self, impl_name: &str, extra: &[String], opts: ExecOptions<'_>) -> Result<ExecOutput> {
        let command = self.remote_command_line(impl_name, extra)?;
        self.runner
            .run(&self.address, &command, opts)
            .await
            .with_context(|| format!("running {} via SSH", impl_name))
    }

    /// Relocate, run the impl half with its output streamed to ours, and
    /// pass its exit code through.
    pub async fn dispatch(&self, impl_name: &str, extra: &[String]) -> Result<()> {
        self.prepare().await?;
        let out = self
            .run_remote(
                impl_name,
                extra,
                ExecOptions::new()
                    .stdout(tokio::io::stdout())
                    .stderr(tokio::io::stderr()),
            )
            .await?;
        if !out.success() {
            return Err(UpgradeError::Passthrough { code: out.exit_code }.into());
        }
        Ok(())
    }
}
