use anyhow::{Context, Result};

use super::service::{agent_service_command, parse_status, AgentStatus};
use crate::config::Settings;
use crate::executor::{FlatMachine, SshRunner};

/// Status of every agent on every machine.
pub async fn agent_status(settings: &Settings, machines: &[FlatMachine]) -> Result<Vec<AgentStatus>> {
    let runner = SshRunner::new(&settings.ssh);
    let results = agent_service_command(
        &runner,
        &settings.system_identity,
        &settings.data_dir,
        machines,
        "status",
    )
    .await?;
    Ok(parse_status(machines, &results))
}

/// Start or stop every agent, then report where they ended up.
pub async fn control_agents(settings: &Settings, machines: &[FlatMachine], action: &str) -> Result<Vec<AgentStatus>> {
    let runner = SshRunner::new(&settings.ssh);
    agent_service_command(
        &runner,
        &settings.system_identity,
        &settings.data_dir,
        machines,
        action,
    )
    .await
    .with_context(|| format!("{} agents", gerund(action)))?;
    agent_status(settings, machines).await
}

fn gerund(action: &str) -> &str {
    match action {
        "start" => "starting",
        "stop" => "stopping",
        other => other,
    }
}
