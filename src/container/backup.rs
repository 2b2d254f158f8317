use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use super::ContainerContext;
use crate::error::UpgradeError;
use crate::executor::FlatMachine;
use crate::export::names::LXC;
use crate::state::models::parent_id;
use crate::state::SourceState;

/// Wire form of the container listing the client half reads back over SSH.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LxcContainerList {
    #[serde(rename = "containers", default)]
    pub containers: Vec<LxcContainerEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LxcContainerEntry {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "InstanceId")]
    pub instance_id: String,
}

impl LxcContainerEntry {
    /// Archives are named after the instance id.
    pub fn archive_name(&self) -> String {
        format!("{}.tar.xz", self.instance_id)
    }
}

pub async fn list_lxc_containers(st: &SourceState) -> Result<LxcContainerList> {
    let machines = st.all_machines().await.context("getting machines")?;
    let instances = st.instance_data().await?;
    let mut list = LxcContainerList::default();
    for m in machines.iter().filter(|m| m.container_type == LXC) {
        let instance = instances
            .get(&m.id)
            .with_context(|| format!("getting container instance ID for {:?}", m.id))?;
        list.containers.push(LxcContainerEntry {
            id: m.id.clone(),
            instance_id: instance.instance_id.clone(),
        });
    }
    Ok(list)
}

async fn container_and_host(st: &SourceState, id: &str) -> Result<(FlatMachine, FlatMachine)> {
    let machines = st.flat_machines().await?;
    let container = machines
        .iter()
        .find(|m| m.id == id)
        .cloned()
        .with_context(|| format!("getting container machine {:?}", id))?;
    let host_id = parent_id(id).ok_or_else(|| UpgradeError::MissingParent(id.to_string()))?;
    let host = machines
        .iter()
        .find(|m| m.id == host_id)
        .cloned()
        .context("getting host machine")?;
    Ok((container, host))
}

/// Stop the container, stream its archive into `out`, and start it again.
pub async fn backup_container<W>(ctx: &ContainerContext, st: &SourceState, id: &str, out: W) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let (container, host) = container_and_host(st, id).await?;
    let host = ctx.host(&host);

    tracing::debug!("stopping LXC container {:?}", id);
    host.stop_lxc(&container.instance_id)
        .await
        .context("stopping LXC container")?;
    tracing::debug!("creating backup of LXC container {:?}", id);
    host.backup_lxc(&container.instance_id, out)
        .await
        .context("backing up LXC container")?;
    tracing::debug!("restarting LXC container {:?}", id);
    host.start_lxc(&container.instance_id)
        .await
        .context("starting LXC container")?;
    Ok(())
}

/// Replace the container's files with the archive read from `input`, then
/// start it.
pub async fn restore_container<R>(ctx: &ContainerContext, st: &SourceState, id: &str, input: R) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let (container, host) = container_and_host(st, id).await?;
    let host = ctx.host(&host);

    tracing::debug!("restoring LXC container {:?}", id);
    host.restore_lxc(&container.instance_id, input)
        .await
        .context("restoring LXC container")?;
    tracing::debug!("restarting LXC container {:?}", id);
    host.start_lxc(&container.instance_id)
        .await
        .context("starting LXC container")?;
    Ok(())
}
