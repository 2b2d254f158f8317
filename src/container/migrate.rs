use anyhow::{Context, Result};
use std::collections::BTreeSet;

use super::{
    container_machines, containers_to_migrate, lxc_containers_by_host, lxd_inventory,
    match_filter, wait_all, wait_containers_ready, ContainerContext, HostContainers, LxdInventory,
};
use crate::commands::service::agent_service_command;
use crate::state::SourceState;

#[derive(Debug, Clone, Default)]
pub struct MigrateOptions {
    pub dry_run: bool,
    pub pattern: Option<String>,
}

/// Convert the environment's LXC containers to LXD. Containers already
/// present under LXD (by either name) are skipped, so the command can be
/// run again after a partial failure.
pub async fn migrate_lxc(ctx: &ContainerContext, st: &SourceState, opts: &MigrateOptions) -> Result<()> {
    let filter = match_filter(opts.pattern.as_deref())?;
    let hosts = lxc_containers_by_host(st, filter.as_ref()).await?;
    let lxd = lxd_inventory(ctx, &hosts).await?;
    let pending = containers_to_migrate(&hosts, &lxd);

    if opts.dry_run {
        return Ok(());
    }

    stop_lxc_containers(ctx, &pending)
        .await
        .context("stopping LXC containers")?;
    convert_containers(ctx, &pending)
        .await
        .context("migrating LXC containers")?;
    rename_lxd_containers(ctx, &hosts, &lxd, st.environ_uuid())
        .await
        .context("renaming LXD containers")?;
    // The agents must stay stopped, but later steps reach the containers
    // over SSH.
    start_lxd_containers(ctx, &hosts, &lxd)
        .await
        .context("starting LXD containers")?;
    wait_containers_ready(ctx, &hosts, true)
        .await
        .context("waiting for LXD containers to have addresses")?;
    agent_service_command(
        &ctx.runner,
        &ctx.settings.system_identity,
        &ctx.settings.data_dir,
        &container_machines(&hosts),
        "stop",
    )
    .await
    .context("stopping Juju agents in LXD containers")?;
    Ok(())
}

async fn stop_lxc_containers(ctx: &ContainerContext, pending: &[HostContainers]) -> Result<()> {
    let jobs = pending.iter().flat_map(|hc| {
        let host = ctx.host(&hc.host);
        hc.containers.iter().map(move |c| {
            let host = host.clone();
            async move {
                tracing::debug!("stopping LXC container {:?}", c.id());
                host.stop_lxc(&c.old_name)
                    .await
                    .with_context(|| format!("stopping LXC container {:?}", c.id()))
            }
        })
    });
    wait_all(jobs).await?;
    Ok(())
}

async fn convert_containers(ctx: &ContainerContext, pending: &[HostContainers]) -> Result<()> {
    let scripts_dir = ctx.settings.lxc_scripts_dir();
    let jobs = pending.iter().map(|hc| {
        let host = ctx.host(&hc.host);
        let scripts_dir = scripts_dir.clone();
        let ids: Vec<String> = hc.containers.iter().map(|c| c.id().to_string()).collect();
        let instance_ids: Vec<String> = hc.containers.iter().map(|c| c.old_name.clone()).collect();
        async move {
            tracing::debug!("migrating LXC containers: {}", ids.join(", "));
            host.migrate(&scripts_dir, &instance_ids, false, true)
                .await
                .with_context(|| format!("migrating LXC containers: {}", ids.join(", ")))
        }
    });
    wait_all(jobs).await?;
    Ok(())
}

/// Every container recorded in state gets renamed unless its new name is
/// already taken, including those converted in an earlier run.
async fn rename_lxd_containers(
    ctx: &ContainerContext,
    hosts: &[HostContainers],
    lxd: &LxdInventory,
    environ_uuid: &str,
) -> Result<()> {
    let mut jobs = Vec::new();
    for hc in hosts {
        let existing = lxd.get(&hc.host.id);
        for c in &hc.containers {
            if existing.is_some_and(|e| e.contains_key(&c.new_name)) {
                continue;
            }
            let host = ctx.host(&hc.host);
            jobs.push(async move {
                let renamed = async {
                    host.set_lxd_config(&c.old_name, "user.juju-model", environ_uuid)
                        .await?;
                    host.rename_lxd(&c.old_name, &c.new_name).await
                };
                renamed.await.with_context(|| {
                    format!("renaming LXD container {:?} to {:?}", c.old_name, c.new_name)
                })
            });
        }
    }
    wait_all(jobs).await?;
    Ok(())
}

/// Start what isn't running. Containers converted just now are absent from
/// the inventory taken beforehand, and are known to be stopped.
async fn start_lxd_containers(
    ctx: &ContainerContext,
    hosts: &[HostContainers],
    lxd: &LxdInventory,
) -> Result<()> {
    let running: BTreeSet<&str> = lxd
        .values()
        .flat_map(|containers| containers.values())
        .filter(|c| c.is_active())
        .map(|c| c.name.as_str())
        .collect();

    let mut jobs = Vec::new();
    for hc in hosts {
        let to_start: Vec<String> = hc
            .containers
            .iter()
            .filter(|c| !running.contains(c.new_name.as_str()))
            .map(|c| c.new_name.clone())
            .collect();
        if to_start.is_empty() {
            tracing::debug!("no LXD containers to start on {:?}", hc.host.id);
            continue;
        }
        tracing::debug!("starting LXD containers on {:?}: {:?}", hc.host.id, to_start);
        let host = ctx.host(&hc.host);
        jobs.push(async move {
            host.start_lxd(&to_start)
                .await
                .with_context(|| format!("starting LXD containers on {:?}: {:?}", host.id(), to_start))
        });
    }
    wait_all(jobs).await?;
    Ok(())
}
