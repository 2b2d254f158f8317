use anyhow::{Context, Result};

use super::{
    container_machines, containers_to_revert, lxc_containers_by_host, lxd_inventory,
    match_filter, wait_all, wait_containers_ready, Container, ContainerContext, HostContainers,
};
use crate::commands::service::agent_service_command;
use crate::executor::FlatMachine;
use crate::state::SourceState;

/// Undo `migrate_lxc`: every container found under LXD is moved back to
/// LXC, then all matching LXC containers are started with their agents
/// stopped.
pub async fn revert_lxd(ctx: &ContainerContext, st: &SourceState, pattern: Option<&str>) -> Result<()> {
    let filter = match_filter(pattern)?;
    let hosts = lxc_containers_by_host(st, filter.as_ref()).await?;
    let lxd = lxd_inventory(ctx, &hosts).await?;
    let pending = containers_to_revert(&hosts, &lxd);

    stop_lxd_containers(ctx, &pending)
        .await
        .context("stopping LXD containers")?;
    revert_containers(ctx, &pending)
        .await
        .context("reverting LXD containers")?;
    // lxc-start succeeds for containers that are already running.
    start_lxc_containers(ctx, &hosts)
        .await
        .context("starting LXC containers")?;
    wait_containers_ready(ctx, &hosts, false)
        .await
        .context("waiting for reverted LXC containers to have addresses")?;
    agent_service_command(
        &ctx.runner,
        &ctx.settings.system_identity,
        &ctx.settings.data_dir,
        &container_machines(&hosts),
        "stop",
    )
    .await
    .context("stopping Juju agents in reverted LXC containers")?;
    Ok(())
}

type RevertPlan = [(FlatMachine, Vec<(String, Container)>)];

async fn stop_lxd_containers(ctx: &ContainerContext, pending: &RevertPlan) -> Result<()> {
    let mut jobs = Vec::new();
    for (host, containers) in pending {
        for (lxd_name, _) in containers {
            let host = ctx.host(host);
            jobs.push(async move {
                tracing::debug!("stopping LXD container {:?}", lxd_name);
                host.stop_lxd(lxd_name)
                    .await
                    .with_context(|| format!("stopping LXD container {:?}", lxd_name))
            });
        }
    }
    wait_all(jobs).await?;
    Ok(())
}

async fn revert_containers(ctx: &ContainerContext, pending: &RevertPlan) -> Result<()> {
    let jobs = pending.iter().map(|(host, containers)| {
        let host = ctx.host(host);
        let pairs: Vec<(String, String)> = containers
            .iter()
            .map(|(lxd_name, c)| (lxd_name.clone(), c.old_name.clone()))
            .collect();
        async move {
            let names: Vec<&str> = pairs.iter().map(|(n, _)| n.as_str()).collect();
            tracing::debug!(host = %host.id(), "reverting {}", names.join(", "));
            host.revert(&pairs)
                .await
                .with_context(|| format!("reverting LXD containers: {}", names.join(", ")))
        }
    });
    wait_all(jobs).await?;
    Ok(())
}

async fn start_lxc_containers(ctx: &ContainerContext, hosts: &[HostContainers]) -> Result<()> {
    let mut jobs = Vec::new();
    for hc in hosts {
        for c in &hc.containers {
            let host = ctx.host(&hc.host);
            jobs.push(async move {
                tracing::debug!("starting reverted LXC container {:?}", c.id());
                host.start_lxc(&c.old_name)
                    .await
                    .with_context(|| format!("starting LXC container {:?}", c.id()))
            });
        }
    }
    wait_all(jobs).await?;
    Ok(())
}
