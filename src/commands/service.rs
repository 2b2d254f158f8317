use anyhow::{bail, Result};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use tokio::io::AsyncWriteExt;

use crate::executor::parallel::parallel_exec;
use crate::executor::{DistResult, FlatMachine, SshRunner};
use crate::output::prefix::PrefixWriter;

const END_OF_AGENT: &str = "-- end-of-agent --\n";

/// One agent's row in the status table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentStatus {
    pub machine: String,
    pub agent: String,
    pub status: String,
    pub version: String,
}

fn upstart_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"jujud-[\w-]+ ([\w/]+)").expect("valid regex"))
}

fn systemd_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Active: (\w+ \(\w+\))").expect("valid regex"))
}

/// Runs `service jujud-<agent> <action>` for every agent on the machine,
/// each block ending with a marker line.
pub fn service_script(data_dir: &Path, action: &str) -> String {
    let data_dir = data_dir.display();
    format!(
        r#"
set -xu
cd {data_dir}/agents
for agent in *
do
	echo $agent
	ls -al {data_dir}/tools/$agent
	sudo service jujud-$agent {action}
	echo "-- end-of-agent --"
done
"#
    )
}

/// Run a service action for every agent on every machine. Output of the
/// machines that failed goes to stderr, prefixed with the machine id.
pub async fn agent_service_command(
    runner: &SshRunner,
    identity: &Path,
    data_dir: &Path,
    machines: &[FlatMachine],
    action: &str,
) -> Result<Vec<DistResult>> {
    let script = service_script(data_dir, action);
    let results = parallel_exec(runner, identity, machines, &script).await;

    let mut failed = Vec::new();
    let mut stderr = tokio::io::stderr();
    for result in &results {
        if !result.failed() {
            continue;
        }
        failed.push(result.machine_id.clone());
        if let Some(err) = &result.error {
            stderr
                .write_all(format!("({}:error) {}\n", result.machine_id, err).as_bytes())
                .await?;
        }
        for (stream, text) in [("stdout", &result.stdout), ("stderr", &result.stderr)] {
            if text.trim().is_empty() {
                continue;
            }
            let mut w = PrefixWriter::new(&mut stderr, format!("({}:{}) ", result.machine_id, stream));
            w.write_all(text.as_bytes()).await?;
            w.flush().await?;
        }
    }

    if !failed.is_empty() {
        let plural = if failed.len() > 1 { "s" } else { "" };
        bail!("service {} command failed for machine{} {:?}", action, plural, failed);
    }
    Ok(results)
}

/// Turn per-machine script output into status rows. Trusty runs upstart;
/// later series run systemd.
pub fn parse_status(machines: &[FlatMachine], results: &[DistResult]) -> Vec<AgentStatus> {
    let series: HashMap<&str, &str> = machines
        .iter()
        .map(|m| (m.id.as_str(), m.series.as_str()))
        .collect();

    let mut statuses = Vec::new();
    for result in results {
        let machine_series = series.get(result.machine_id.as_str()).copied().unwrap_or("");
        let chunks: Vec<&str> = result.stdout.split(END_OF_AGENT).collect();
        // The last chunk is whatever followed the final marker.
        for chunk in &chunks[..chunks.len().saturating_sub(1)] {
            let mut parts = chunk.splitn(3, '\n');
            let agent = parts.next().unwrap_or_default();
            let ls_line = parts.next().unwrap_or_default();
            let service_output = parts.next().unwrap_or_default();

            let tools_path = ls_line.split(' ').last().unwrap_or_default();
            let version = tools_path.rsplit('/').next().unwrap_or(tools_path);
            let status = match machine_series {
                "trusty" => service_status(upstart_re(), service_output),
                _ => service_status(systemd_re(), service_output),
            };
            let row = AgentStatus {
                machine: result.machine_id.clone(),
                agent: agent.to_string(),
                status,
                version: version.to_string(),
            };
            tracing::debug!("{:?}", row);
            statuses.push(row);
        }
    }
    statuses.sort_by(|a, b| a.agent.cmp(&b.agent));
    statuses
}

fn service_status(re: &Regex, output: &str) -> String {
    match re.captures(output) {
        Some(caps) => caps[1].to_string(),
        None => {
            tracing::warn!("unable to determine status from:\n{}", output);
            "unknown".to_string()
        }
    }
}
