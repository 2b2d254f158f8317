use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::container::backup::{backup_container, list_lxc_containers, restore_container, LxcContainerList};
use crate::container::{match_filter, wait_all, ContainerContext};
use crate::dispatch::{ClientContext, BACKUP_LXC, RESTORE_LXC};
use crate::executor::ExecOptions;
use crate::state::SourceState;

/// Which containers to archive, and where.
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub dir: PathBuf,
    pub pattern: Option<String>,
    pub dry_run: bool,
}

// ─── Client halves ──────────────────────────────────────────────────────────

/// Stream an archive of every matching LXC container into the backup
/// directory, one `<instance id>.tar.xz` per container.
pub async fn backup_lxc(client: &ClientContext, opts: &ArchiveOptions) -> Result<()> {
    tokio::fs::metadata(&opts.dir)
        .await
        .context("checking backup dir")?;
    let filter = match_filter(opts.pattern.as_deref())?;

    client.prepare().await?;
    let list = remote_container_list(client, BACKUP_LXC.impl_name)
        .await
        .context("getting LXC container list")?;

    let mut jobs = Vec::new();
    for container in list.containers {
        if filter.as_ref().is_some_and(|re| !re.is_match(&container.id)) {
            tracing::info!("Skipping non-matching container {:?}", container.id);
            continue;
        }
        let outpath = opts.dir.join(container.archive_name());
        tracing::info!("Backing up container {:?} to {}", container.id, outpath.display());
        if opts.dry_run {
            continue;
        }
        jobs.push(async move {
            backup_one(client, &container.id, &outpath)
                .await
                .with_context(|| format!("backing up {:?} to {}", container.id, outpath.display()))
        });
    }
    wait_all(jobs).await?;
    Ok(())
}

async fn backup_one(client: &ClientContext, id: &str, outpath: &Path) -> Result<()> {
    let mut temp = outpath.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    let file = tokio::fs::File::create(&temp)
        .await
        .context("creating output file")?;
    let out = client
        .run_remote(
            BACKUP_LXC.impl_name,
            &[id.to_string()],
            ExecOptions::new().stdout(file),
        )
        .await?;
    if !out.success() {
        bail!("creating LXC backup exited {}", out.exit_code);
    }
    tokio::fs::rename(&temp, outpath)
        .await
        .with_context(|| format!("moving backup into {}", outpath.display()))
}

/// Feed each matching container's archive from the backup directory back
/// to its host. Containers without an archive are skipped.
pub async fn restore_lxc(client: &ClientContext, opts: &ArchiveOptions) -> Result<()> {
    tokio::fs::metadata(&opts.dir)
        .await
        .context("checking restore dir")?;
    let filter = match_filter(opts.pattern.as_deref())?;

    client.prepare().await?;
    let list = remote_container_list(client, RESTORE_LXC.impl_name)
        .await
        .context("getting LXC container list")?;

    let mut jobs = Vec::new();
    for container in list.containers {
        if filter.as_ref().is_some_and(|re| !re.is_match(&container.id)) {
            tracing::info!("Skipping non-matching container {:?}", container.id);
            continue;
        }
        let path = opts.dir.join(container.archive_name());
        if !path.exists() {
            tracing::info!(
                "Skipping container {:?}, missing backup file {:?}",
                container.id,
                path.display().to_string()
            );
            continue;
        }
        tracing::info!("Restoring container {:?} from {}", container.id, path.display());
        if opts.dry_run {
            continue;
        }
        jobs.push(async move {
            restore_one(client, &container.id, &path)
                .await
                .with_context(|| format!("restoring {:?} from {}", container.id, path.display()))
        });
    }
    wait_all(jobs).await?;
    Ok(())
}

async fn restore_one(client: &ClientContext, id: &str, path: &Path) -> Result<()> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let out = client
        .run_remote(
            RESTORE_LXC.impl_name,
            &[id.to_string()],
            ExecOptions::new().stdin(file),
        )
        .await?;
    if !out.success() {
        bail!("restoring LXC container exited {}", out.exit_code);
    }
    Ok(())
}

/// The impl half prints the container list when given no container.
async fn remote_container_list(client: &ClientContext, impl_name: &str) -> Result<LxcContainerList> {
    let out = client.run_remote(impl_name, &[], ExecOptions::new()).await?;
    if !out.success() {
        bail!(
            "listing LXC containers exited {}: {}",
            out.exit_code,
            out.stderr.trim()
        );
    }
    serde_json::from_str(&out.stdout).context("unmarshalling LXC container list")
}

// ─── Impl halves ────────────────────────────────────────────────────────────

async fn print_container_list(st: &SourceState) -> Result<()> {
    let list = list_lxc_containers(st).await?;
    let mut data = serde_json::to_vec(&list).context("marshalling container list")?;
    data.push(b'\n');
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&data).await?;
    stdout.flush().await?;
    Ok(())
}

/// With no container: list the LXC containers as JSON. With one: stream
/// its archive to stdout.
pub async fn backup_lxc_impl(ctx: &ContainerContext, st: &SourceState, container: Option<&str>) -> Result<()> {
    match container {
        None => print_container_list(st).await,
        Some(id) => {
            let mut stdout = tokio::io::stdout();
            backup_container(ctx, st, id, &mut stdout).await?;
            stdout.flush().await?;
            Ok(())
        }
    }
}

/// With no container: list the LXC containers as JSON. With one: restore
/// it from the archive on stdin.
pub async fn restore_lxc_impl(ctx: &ContainerContext, st: &SourceState, container: Option<&str>) -> Result<()> {
    match container {
        None => print_container_list(st).await,
        Some(id) => restore_container(ctx, st, id, tokio::io::stdin()).await,
    }
}
