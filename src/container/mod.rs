pub mod backup;
pub mod lxd;
pub mod migrate;
pub mod revert;

use anyhow::{Context, Result};
use futures::future::join_all;
use regex::Regex;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use crate::config::Settings;
use crate::error::UpgradeError;
use crate::executor::{ExecOptions, FlatMachine, SshRunner};
use crate::export::names::{container_names, LXC};
use crate::state::models::parent_id;
use crate::state::SourceState;

pub use lxd::{ContainerHost, LxdContainer};

/// LXD containers found on each host, keyed by host machine id and then by
/// container name.
pub type LxdInventory = BTreeMap<String, BTreeMap<String, LxdContainer>>;

/// A v1 container machine and the two names it can have on its host.
#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    pub machine: FlatMachine,
    /// Name under LXC, which is the recorded instance id.
    pub old_name: String,
    /// Name v2 expects under LXD.
    pub new_name: String,
}

impl Container {
    pub fn id(&self) -> &str {
        &self.machine.id
    }
}

/// The LXC containers recorded in state for one host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostContainers {
    pub host: FlatMachine,
    pub containers: Vec<Container>,
}

/// What the container commands share: how to reach hosts and where things
/// live on them.
#[derive(Clone)]
pub struct ContainerContext {
    pub runner: SshRunner,
    pub settings: Settings,
}

impl ContainerContext {
    pub fn new(settings: &Settings) -> Self {
        Self {
            runner: SshRunner::new(&settings.ssh),
            settings: settings.clone(),
        }
    }

    pub fn host(&self, machine: &FlatMachine) -> ContainerHost {
        ContainerHost::new(
            self.runner.clone(),
            &self.settings.system_identity,
            machine.clone(),
        )
    }
}

/// Parse `--match`; no pattern matches everything.
pub fn match_filter(pattern: Option<&str>) -> Result<Option<Regex>> {
    match pattern {
        Some(p) if !p.is_empty() => Ok(Some(Regex::new(p).context("parsing --match")?)),
        _ => Ok(None),
    }
}

/// LXC container machines in state grouped by host, sorted by host id.
/// Containers the filter rejects are left out; hosts left with nothing are
/// dropped.
pub async fn lxc_containers_by_host(
    st: &SourceState,
    filter: Option<&Regex>,
) -> Result<Vec<HostContainers>> {
    let machines = st.all_machines().await.context("getting machines")?;
    let flat: BTreeMap<String, FlatMachine> = st
        .flat_machines()
        .await?
        .into_iter()
        .map(|m| (m.id.clone(), m))
        .collect();

    let mut by_host: BTreeMap<String, HostContainers> = BTreeMap::new();
    for m in machines.iter().filter(|m| m.container_type == LXC) {
        if let Some(re) = filter {
            if !re.is_match(&m.id) {
                tracing::info!("Skipping non-matching container {:?}", m.id);
                continue;
            }
        }
        let Some(host_id) = parent_id(&m.id) else {
            return Err(UpgradeError::MissingParent(m.id.clone()).into());
        };
        let host = flat
            .get(host_id)
            .cloned()
            .ok_or_else(|| UpgradeError::MissingParent(m.id.clone()))
            .context("getting host machine")?;
        let machine = flat
            .get(&m.id)
            .cloned()
            .with_context(|| format!("machine {:?} not found", m.id))?;
        let (old_name, new_name) =
            container_names(st.environ_uuid(), &machine.id, &machine.instance_id)?;

        by_host
            .entry(host_id.to_string())
            .or_insert_with(|| HostContainers {
                host,
                containers: Vec::new(),
            })
            .containers
            .push(Container {
                machine,
                old_name,
                new_name,
            });
    }
    Ok(by_host.into_values().collect())
}

/// List the LXD containers on every host in parallel.
pub async fn lxd_inventory(ctx: &ContainerContext, hosts: &[HostContainers]) -> Result<LxdInventory> {
    let listings = wait_all(hosts.iter().map(|hc| {
        let host = ctx.host(&hc.host);
        async move {
            let containers = host
                .list_lxd()
                .await
                .with_context(|| format!("listing LXD containers for host {:?}", host.id()))?;
            Ok::<_, anyhow::Error>((host.id().to_string(), containers))
        }
    }))
    .await
    .context("listing LXD containers")?;
    Ok(listings.into_iter().collect())
}

/// Containers that still need migrating: neither name exists under LXD yet.
pub fn containers_to_migrate(hosts: &[HostContainers], lxd: &LxdInventory) -> Vec<HostContainers> {
    let empty = BTreeMap::new();
    let mut result = Vec::new();
    for hc in hosts {
        let existing = lxd.get(&hc.host.id).unwrap_or(&empty);
        let mut pending = Vec::new();
        for c in &hc.containers {
            if existing.contains_key(&c.old_name) {
                // Migrated, not yet renamed.
                tracing::info!("LXC container {:?} already migrated to LXD ({:?})", c.id(), c.old_name);
                continue;
            }
            if existing.contains_key(&c.new_name) {
                tracing::info!("LXC container {:?} already migrated to LXD ({:?})", c.id(), c.new_name);
                continue;
            }
            tracing::info!("Migrating LXC container {:?} to LXD ({:?})", c.id(), c.new_name);
            pending.push(c.clone());
        }
        if !pending.is_empty() {
            result.push(HostContainers {
                host: hc.host.clone(),
                containers: pending,
            });
        }
    }
    result
}

/// Containers that exist under LXD, under whichever name they currently
/// have, paired with that name.
pub fn containers_to_revert(
    hosts: &[HostContainers],
    lxd: &LxdInventory,
) -> Vec<(FlatMachine, Vec<(String, Container)>)> {
    let empty = BTreeMap::new();
    let mut result = Vec::new();
    for hc in hosts {
        let existing = lxd.get(&hc.host.id).unwrap_or(&empty);
        let mut pending = Vec::new();
        for c in &hc.containers {
            let lxd_name = if existing.contains_key(&c.old_name) {
                &c.old_name
            } else if existing.contains_key(&c.new_name) {
                &c.new_name
            } else {
                tracing::info!(
                    "LXC container {:?} hasn't been migrated to LXD ({:?}) - no revert needed",
                    c.id(),
                    c.new_name
                );
                continue;
            };
            tracing::info!("LXC container {:?} was migrated to LXD ({:?})", c.id(), lxd_name);
            pending.push((lxd_name.clone(), c.clone()));
        }
        if !pending.is_empty() {
            result.push((hc.host.clone(), pending));
        }
    }
    result
}

/// Run every future to completion, then return the first error if any.
/// Unlike `try_join_all`, a failure does not drop the others mid-flight.
pub async fn wait_all<I, F, T>(futures: I) -> Result<Vec<T>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T>>,
{
    join_all(futures).await.into_iter().collect()
}

/// Wait until every container accepts SSH through its host. `use_new_name`
/// picks which name appears in messages.
pub async fn wait_containers_ready(
    ctx: &ContainerContext,
    hosts: &[HostContainers],
    use_new_name: bool,
) -> Result<()> {
    let timing = &ctx.settings.timing;
    let containers = hosts.iter().flat_map(|hc| {
        hc.containers.iter().map(move |c| (hc.host.address.clone(), c))
    });
    wait_all(containers.map(|(host_addr, c)| {
        let name = if use_new_name { &c.new_name } else { &c.old_name };
        async move {
            wait_container_ready(
                &ctx.runner,
                &ctx.settings.system_identity,
                name,
                &c.machine.address,
                &host_addr,
                timing.container_ready_interval,
                timing.container_ready_timeout,
            )
            .await
            .with_context(|| format!("waiting for {:?} to be ready for SSH connections", name))
        }
    }))
    .await?;
    Ok(())
}

async fn wait_container_ready(
    runner: &SshRunner,
    identity: &Path,
    name: &str,
    address: &str,
    host_address: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<()> {
    let poll = async {
        loop {
            tracing::debug!("waiting for {:?} to be ready for SSH connections via {:?}", name, address);
            let res = runner
                .run(
                    address,
                    "/bin/true",
                    ExecOptions::new()
                        .identity(identity)
                        .proxy_host(Some(host_address))
                        .stdout(tokio::io::sink())
                        .stderr(tokio::io::sink()),
                )
                .await;
            if matches!(res, Ok(ref out) if out.success()) {
                return;
            }
            tokio::time::sleep(interval).await;
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| anyhow::anyhow!("timed out after {:?}", timeout))
}

/// Every container machine across the hosts, for agent control.
pub fn container_machines(hosts: &[HostContainers]) -> Vec<FlatMachine> {
    hosts
        .iter()
        .flat_map(|hc| hc.containers.iter().map(|c| c.machine.clone()))
        .collect()
}
