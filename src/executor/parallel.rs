use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing;

use crate::error::UpgradeError;
use crate::executor::ssh::{ExecOptions, ExecOutput, SshRunner};
use crate::output::formatter;

/// A machine flattened to what remote commands need. This is also the
/// on-disk form of `saved-machines.json`, which rollback reads without
/// database access.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlatMachine {
    #[serde(rename = "Model")]
    pub model: String,
    #[serde(rename = "Series")]
    pub series: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "InstanceID")]
    pub instance_id: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Tools")]
    pub tools: String,
    /// Set for containers: the address of the host machine that sessions
    /// are proxied through.
    #[serde(rename = "HostAddress", default, skip_serializing_if = "Option::is_none")]
    pub host_address: Option<String>,
}

impl FlatMachine {
    pub fn is_container(&self) -> bool {
        self.host_address.is_some()
    }
}

/// Outcome of one host's part of a fan-out. `error` is set when the session
/// itself could not run; otherwise `exit_code` says how the script went.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DistResult {
    pub model: String,
    pub machine_id: String,
    pub error: Option<String>,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl DistResult {
    pub fn failed(&self) -> bool {
        self.error.is_some() || self.exit_code != 0
    }

    fn from_output(machine: &FlatMachine, result: Result<ExecOutput>) -> Self {
        match result {
            Ok(out) => Self {
                model: machine.model.clone(),
                machine_id: machine.id.clone(),
                error: None,
                exit_code: out.exit_code,
                stdout: out.stdout,
                stderr: out.stderr,
            },
            Err(e) => Self {
                model: machine.model.clone(),
                machine_id: machine.id.clone(),
                error: Some(format!("{:#}", e)),
                exit_code: -1,
                stdout: String::new(),
                stderr: String::new(),
            },
        }
    }
}

/// Run `op` for every machine concurrently and wait for all of them. One
/// machine's failure never cancels the others.
pub async fn fan_out<F, Fut>(machines: &[FlatMachine], op: F) -> Vec<DistResult>
where
    F: Fn(FlatMachine) -> Fut,
    Fut: Future<Output = Result<ExecOutput>> + Send + 'static,
{
    let mut handles = Vec::with_capacity(machines.len());
    for machine in machines {
        let fut = op(machine.clone());
        handles.push((machine, tokio::spawn(fut)));
    }

    let mut results = Vec::with_capacity(handles.len());
    for (machine, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("task for machine {} panicked: {}", machine.id, e)),
        };
        if let Err(e) = &result {
            tracing::error!(machine = %machine.id, error = %e, "Remote execution failed");
        }
        results.push(DistResult::from_output(machine, result));
    }
    results
}

/// Run the same script as root on every machine, using the system identity
/// and proxying container sessions through their hosts.
pub async fn parallel_exec(
    runner: &SshRunner,
    identity: &std::path::Path,
    machines: &[FlatMachine],
    script: &str,
) -> Vec<DistResult> {
    let script: Arc<str> = Arc::from(script);
    let identity: PathBuf = identity.to_path_buf();
    fan_out(machines, |machine| {
        let runner = runner.clone();
        let script = script.clone();
        let identity = identity.clone();
        async move {
            runner
                .run(
                    &machine.address,
                    &script,
                    ExecOptions::new()
                        .identity(identity)
                        .proxy_host(machine.host_address.as_deref()),
                )
                .await
        }
    })
    .await
}

/// Print one line per machine and fail with the list of machines that did
/// not succeed.
pub fn report_results(operation: &str, results: &[DistResult]) -> Result<()> {
    if let Ok(full) = serde_json::to_string_pretty(results) {
        tracing::debug!(operation = operation, "full results: {}", full);
    }

    let mut bad = Vec::new();
    for res in results {
        if !res.failed() {
            formatter::print_success(&format!(
                "{} successful on machine {}",
                operation, res.machine_id
            ));
            continue;
        }
        match &res.error {
            Some(err) => formatter::print_error(&format!(
                "{} failed on machine {}: {}",
                operation, res.machine_id, err
            )),
            None => {
                formatter::print_error(&format!(
                    "{} failed on machine {}: exited with {}",
                    operation, res.machine_id, res.exit_code
                ));
                eprintln!("Output was:\n{}\nError was:\n{}\n", res.stdout, res.stderr);
            }
        }
        bad.push(res.machine_id.clone());
    }

    if !bad.is_empty() {
        return Err(UpgradeError::HostFailures {
            op: operation.to_string(),
            ids: bad,
        }
        .into());
    }
    Ok(())
}
