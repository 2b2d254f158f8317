use anyhow::{Context, Result};
use serde_json::Value;
use std::time::Instant;

use crate::config::settings::TimingSettings;
use crate::provider::MaasApi;
use crate::state::{Document, SourceState};

/// The statement the operator runs on the MAAS region controller. The
/// upgrader has no access to the MAAS database itself.
pub fn psql_command(old_agent_name: &str, new_agent_name: &str) -> String {
    let sql = format!(
        "\nUPDATE maasserver_node\nSET agent_name='{}' WHERE agent_name='{}'\n",
        new_agent_name, old_agent_name
    );
    format!("sudo -u postgres psql maasdb -c \"{}\"", sql)
}

/// Move the environment's MAAS nodes from the legacy agent name to the
/// environment UUID, which is what v2 expects.
pub async fn update_maas_agentname(st: &SourceState, api: &dyn MaasApi, timing: &TimingSettings) -> Result<()> {
    let machines = st
        .flat_machines()
        .await
        .context("getting machines from state")?;
    // Containers aren't MAAS nodes.
    let instance_ids: Vec<String> = machines
        .iter()
        .filter(|m| m.host_address.is_none() && !m.instance_id.is_empty())
        .map(|m| m.instance_id.clone())
        .collect();

    let config = st.environ_config().await.context("getting environ config")?;
    let env_uuid = st.environ_uuid();
    let Some(old_agent_name) = config.get("maas-agent-name").and_then(Value::as_str) else {
        anyhow::bail!("maas-agent-name is missing from the environ config");
    };
    if old_agent_name == env_uuid {
        tracing::info!("MAAS agent name already updated, nothing to do.");
        return Ok(());
    }

    wait_for_agent_name(api, old_agent_name, env_uuid, &instance_ids, timing).await?;
    tracing::info!("Done.");

    let mut attrs = Document::new();
    attrs.insert("maas-agent-name".to_string(), Value::String(env_uuid.to_string()));
    st.update_environ_config(&attrs)
        .await
        .context("updating environ config in the database")
}

/// Poll MAAS until every instance shows up under the new agent name. The
/// instructions are printed once, and a reminder at each reminder interval.
pub async fn wait_for_agent_name(
    api: &dyn MaasApi,
    old_agent_name: &str,
    new_agent_name: &str,
    instance_ids: &[String],
    timing: &TimingSettings,
) -> Result<()> {
    let mut printed_command = false;
    let mut last_waiting: Option<Instant> = None;
    loop {
        let found = api
            .instances_for_agent(new_agent_name, instance_ids)
            .await
            .context("listing instances")?;
        if found.len() >= instance_ids.len() {
            return Ok(());
        }
        tracing::debug!(found = found.len(), wanted = instance_ids.len(), "Instances not all visible yet");

        if !printed_command {
            printed_command = true;
            tracing::info!("Updating MAAS agent name from {:?} to {:?}", old_agent_name, new_agent_name);
            tracing::info!(
                "In another shell, execute the following command on the MAAS region controller:\n\n{}\n",
                psql_command(old_agent_name, new_agent_name)
            );
        }
        if last_waiting.map_or(true, |t| t.elapsed() > timing.maas_reminder_interval) {
            tracing::info!("Waiting for database command to be executed...");
            last_waiting = Some(Instant::now());
        }
        tokio::time::sleep(timing.maas_poll_interval).await;
    }
}
