use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use super::script::{render_upgrade_script, UpgradeScriptParams};
use super::wrangler::{ToolsInfo, ToolsWrangler};
use crate::config::Settings;
use crate::container::wait_all;
use crate::error::UpgradeError;
use crate::executor::parallel::{parallel_exec, report_results};
use crate::executor::{DistResult, ExecOptions, FlatMachine, SshRunner};

/// Remote directory, relative to the login user's home, that receives the
/// script and tools archive.
pub const UPGRADE_DIR: &str = "1.25-agent-upgrade";

const RUN_UPGRADE: &str =
    "apt-get install --yes python3 python3-yaml; python3 ~/1.25-agent-upgrade/agent-upgrade.py";
const RUN_ROLLBACK: &str = "python3 ~/1.25-agent-upgrade/agent-upgrade.py rollback";
/// What the upgrade script prints when a previous run was never rolled back.
const ROLLBACK_EXISTS_MARKER: &str = "saved rollback information found";

/// What the target controller told us about itself.
#[derive(Debug, Clone)]
pub struct ControllerDetails {
    pub version: String,
    pub addresses: Vec<String>,
    pub uuid: String,
    pub ca_cert: String,
}

impl ControllerDetails {
    pub fn tag(&self) -> String {
        format!("controller-{}", self.uuid)
    }
}

/// `1.25.6-trusty-amd64` → `trusty-amd64`.
pub fn machine_series_arch(machine: &FlatMachine) -> Result<String> {
    machine
        .tools
        .split_once('-')
        .map(|(_, rest)| rest.to_string())
        .filter(|rest| rest.contains('-'))
        .with_context(|| format!("machine {} has no usable tools version {:?}", machine.id, machine.tools))
}

pub fn save_machines(path: &Path, machines: &[FlatMachine]) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let data = serde_json::to_vec(machines)?;
    std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))
}

/// Forget the machines of a finished upgrade. Already gone is fine.
pub fn clear_saved_machines(settings: &Settings) -> Result<()> {
    let path = settings.saved_machines_path();
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

pub fn load_machines(path: &Path) -> Result<Vec<FlatMachine>> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Put the controller's agent binaries and the upgrade script on every
/// machine and run it. The machine list is saved first so a rollback works
/// without the database.
pub async fn upgrade_agents(
    settings: &Settings,
    controller: &ControllerDetails,
    wrangler: &ToolsWrangler,
    machines: &[FlatMachine],
) -> Result<()> {
    save_machines(&settings.saved_machines_path(), machines).context("saving machine addresses")?;

    println!("Controller version: {}", controller.version);
    println!("Controller addresses: {:?}", controller.addresses);
    println!("Controller UUID: {}", controller.uuid);

    tokio::fs::create_dir_all(&settings.tools_dir)
        .await
        .with_context(|| format!("creating {}", settings.tools_dir.display()))?;
    let script = render_upgrade_script(&UpgradeScriptParams {
        ca_cert: &controller.ca_cert,
        controller_tag: &controller.tag(),
        version: &controller.version,
        api_addresses: &controller.addresses,
        data_dir: &settings.data_dir,
    });
    let script_path = settings.upgrade_script_path();
    tokio::fs::write(&script_path, script)
        .await
        .with_context(|| format!("writing {}", script_path.display()))?;

    let needed: BTreeSet<String> = machines
        .iter()
        .map(machine_series_arch)
        .collect::<Result<_>>()?;
    let mut tools: BTreeMap<String, ToolsInfo> = BTreeMap::new();
    for series_arch in needed {
        let info = wrangler.get_tools(&series_arch).await?;
        tools.insert(series_arch, info);
    }

    let runner = SshRunner::new(&settings.ssh);
    push_tools(&runner, &settings.system_identity, &script_path, &tools, machines).await?;

    let results = parallel_exec(&runner, &settings.system_identity, machines, RUN_UPGRADE).await;
    report_upgrade(&results)
}

async fn push_tools(
    runner: &SshRunner,
    identity: &Path,
    script_path: &Path,
    tools: &BTreeMap<String, ToolsInfo>,
    machines: &[FlatMachine],
) -> Result<()> {
    let jobs = machines.iter().map(|machine| async move {
        push_tools_to_machine(runner, identity, script_path, tools, machine)
            .await
            .with_context(|| format!("machine {}", machine.id))
    });
    tracing::debug!("waiting for copies to finish");
    wait_all(jobs).await?;
    Ok(())
}

async fn push_tools_to_machine(
    runner: &SshRunner,
    identity: &Path,
    script_path: &Path,
    tools: &BTreeMap<String, ToolsInfo>,
    machine: &FlatMachine,
) -> Result<()> {
    tracing::debug!("making target dir for machine {}", machine.id);
    let proxy = machine.host_address.as_deref();
    let out = runner
        .run(
            &machine.address,
            &format!("rm -rf {0}; mkdir {0}; chown ubuntu:ubuntu {0}", UPGRADE_DIR),
            ExecOptions::new().identity(identity).proxy_host(proxy),
        )
        .await?;
    if !out.success() {
        return Err(UpgradeError::Passthrough { code: out.exit_code }.into());
    }

    let series_arch = machine_series_arch(machine)?;
    let info = tools
        .get(&series_arch)
        .with_context(|| format!("no tools downloaded for {}", series_arch))?;
    tracing::debug!("copying upgrade script and {} to machine {}", info.path.display(), machine.id);
    runner
        .copy_to(
            &[info.path.as_path(), script_path],
            &machine.address,
            &format!("~/{}/", UPGRADE_DIR),
            Some(identity),
            proxy,
        )
        .await
}

fn report_upgrade(results: &[DistResult]) -> Result<()> {
    let mut failed = Vec::new();
    for result in results.iter().filter(|r| r.failed()) {
        let stderr = match &result.error {
            Some(err) => format!("{}{}", result.stderr, err),
            None => result.stderr.clone(),
        };
        if stderr.contains(ROLLBACK_EXISTS_MARKER) {
            tracing::error!("{}", UpgradeError::RollbackExists(result.machine_id.clone()));
        }
        println!(
            "Upgrading agents on machine {} returned {}:\nOutput was:\n{}\n\nError was:\n{}\n",
            result.machine_id, result.exit_code, result.stdout, stderr
        );
        failed.push(result.machine_id.clone());
    }
    if let Ok(full) = serde_json::to_string(results) {
        tracing::debug!("results: {}", full);
    }
    if !failed.is_empty() {
        return Err(UpgradeError::HostFailures {
            op: "upgrading agents".to_string(),
            ids: failed,
        }
        .into());
    }
    Ok(())
}

/// Run the upgrade script's rollback on every machine recorded by the last
/// upgrade. Needs no database access.
pub async fn rollback_agents(settings: &Settings) -> Result<()> {
    let machines = load_machines(&settings.saved_machines_path())
        .context("unable to get addresses for machines")?;
    let runner = SshRunner::new(&settings.ssh);
    let results = parallel_exec(&runner, &settings.system_identity, &machines, RUN_ROLLBACK).await;
    report_results("rollback", &results)?;
    // Kept on partial failure so the rollback can be retried.
    clear_saved_machines(settings)
}
