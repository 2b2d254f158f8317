use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::executor::quote::shell_join;
use crate::executor::{ExecOptions, ExecOutput, FlatMachine, SshRunner};
use crate::output::prefix::PrefixWriter;

/// Conversion script run on each host. It needs python3-lxc and talks to
/// LXD over its unix socket.
pub const LXC_TO_LXD_SCRIPT: &str = include_str!("../../scripts/lxc-to-lxd");

/// Packages needed on a host before containers can be converted.
const LXD_PACKAGES: &[&str] = &["lxd", "lxd-client", "python3-lxc"];

/// One entry of `lxc list --format=json`. Only the fields used here.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LxdContainer {
    pub name: String,
    #[serde(default)]
    pub status: String,
}

impl LxdContainer {
    /// Anything that isn't stopped or broken counts as running.
    pub fn is_active(&self) -> bool {
        !matches!(self.status.as_str(), "Stopped" | "Error")
    }
}

/// Parse `lxc list --format=json` into a map keyed by container name.
pub fn parse_lxd_list(json: &str) -> Result<BTreeMap<String, LxdContainer>> {
    let list: Vec<LxdContainer> =
        serde_json::from_str(json).context("parsing LXD container list")?;
    Ok(list.into_iter().map(|c| (c.name.clone(), c)).collect())
}

/// Commands that manage the containers of one host machine.
#[derive(Clone)]
pub struct ContainerHost {
    runner: SshRunner,
    identity: PathBuf,
    pub machine: FlatMachine,
}

impl ContainerHost {
    pub fn new(runner: SshRunner, identity: &Path, machine: FlatMachine) -> Self {
        Self {
            runner,
            identity: identity.to_path_buf(),
            machine,
        }
    }

    pub fn id(&self) -> &str {
        &self.machine.id
    }

    async fn run(&self, script: &str) -> Result<ExecOutput> {
        self.runner
            .run(
                &self.machine.address,
                script,
                ExecOptions::new().identity(&self.identity),
            )
            .await
    }

    async fn run_checked(&self, script: &str, what: &str) -> Result<ExecOutput> {
        let out = self.run(script).await?;
        if !out.success() {
            tracing::debug!(host = %self.machine.id, stderr = %out.stderr.trim(), "{} failed", what);
            bail!("{} exited {}", what, out.exit_code);
        }
        Ok(out)
    }

    pub async fn list_lxd(&self) -> Result<BTreeMap<String, LxdContainer>> {
        // Older lxc clients lack --format=yaml.
        let out = self.run("lxc list --format=json").await?;
        if !out.success() {
            bail!("listing LXD containers exited {}", out.exit_code);
        }
        parse_lxd_list(&out.stdout)
    }

    /// Stop a v1 container. Exit status 2 means it was already stopped.
    pub async fn stop_lxc(&self, instance_id: &str) -> Result<()> {
        let out = self.run(&shell_join(&["lxc-stop", "-n", instance_id])).await?;
        if out.exit_code != 0 && out.exit_code != 2 {
            bail!("lxc-stop exited {}", out.exit_code);
        }
        Ok(())
    }

    pub async fn start_lxc(&self, instance_id: &str) -> Result<()> {
        self.run_checked(&shell_join(&["lxc-start", "-d", "-n", instance_id]), "lxc-start")
            .await?;
        Ok(())
    }

    /// Install LXD, write the conversion script and run it over the given
    /// v1 containers. Its output streams to stderr tagged with the host.
    pub async fn migrate(
        &self,
        scripts_dir: &Path,
        instance_ids: &[String],
        dry_run: bool,
        move_rootfs: bool,
    ) -> Result<()> {
        let script = migrate_script(
            scripts_dir,
            &self.machine.series,
            instance_ids,
            dry_run,
            move_rootfs,
        );
        let prefix = format!("(machine {}) ", self.machine.id);
        let out = self
            .runner
            .run(
                &self.machine.address,
                &script,
                ExecOptions::new()
                    .identity(&self.identity)
                    .stdout(PrefixWriter::new(tokio::io::stderr(), prefix.clone()))
                    .stderr(PrefixWriter::new(tokio::io::stderr(), prefix)),
            )
            .await?;
        if !out.success() {
            bail!("lxc-to-lxd exited {}", out.exit_code);
        }
        Ok(())
    }

    pub async fn set_lxd_config(&self, name: &str, key: &str, value: &str) -> Result<()> {
        self.run_checked(
            &shell_join(&["lxc", "config", "set", name, key, value]),
            "setting LXD container config",
        )
        .await?;
        Ok(())
    }

    pub async fn rename_lxd(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.run_checked(
            &shell_join(&["lxc", "move", old_name, new_name]),
            "renaming LXD container",
        )
        .await?;
        Ok(())
    }

    pub async fn start_lxd(&self, names: &[String]) -> Result<()> {
        let mut words = vec!["lxc".to_string(), "start".to_string()];
        words.extend(names.iter().cloned());
        self.run_checked(&shell_join(&words), "lxc start").await?;
        Ok(())
    }

    /// Stop a v2 container if it is running.
    pub async fn stop_lxd(&self, name: &str) -> Result<()> {
        let quoted = shell_join(&[name]);
        let script = format!(
            "if lxc info {0} | grep -q '^Status: Running'; then lxc stop --force {0}; fi",
            quoted
        );
        self.run_checked(&script, "lxc stop").await?;
        Ok(())
    }

    /// Move each v2 container's rootfs back under its v1 name and delete the
    /// v2 container. Pairs are `(lxd name, lxc instance id)`.
    pub async fn revert(&self, pairs: &[(String, String)]) -> Result<()> {
        self.run_checked(&revert_script(pairs), "revert script").await?;
        Ok(())
    }

    /// Stream a `.tar.xz` of the v1 container's directory into `out`.
    pub async fn backup_lxc<W>(&self, instance_id: &str, out: W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let script = shell_join(&["tar", "-C", "/var/lib/lxc", "-cJ", instance_id]);
        let res = self
            .runner
            .run(
                &self.machine.address,
                &script,
                ExecOptions::new().identity(&self.identity).stdout(out),
            )
            .await?;
        if !res.success() {
            bail!("backup of LXC container exited {}", res.exit_code);
        }
        Ok(())
    }

    /// Replace the v1 container's directory with an archive made by
    /// `backup_lxc`. The container is stopped first.
    pub async fn restore_lxc<R>(&self, instance_id: &str, archive: R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let id = shell_join(&[instance_id]);
        let script = format!(
            "set -e\nlxc-stop -n {id} || [ $? -eq 2 ]\nrm -rf /var/lib/lxc/{id}\ntar -C /var/lib/lxc -xJ\n"
        );
        let res = self
            .runner
            .run(
                &self.machine.address,
                &script,
                ExecOptions::new().identity(&self.identity).stdin(archive),
            )
            .await?;
        if !res.success() {
            bail!("restore of LXC container exited {}", res.exit_code);
        }
        Ok(())
    }
}

// ─── Scripts ────────────────────────────────────────────────────────────────

pub fn migrate_script(
    scripts_dir: &Path,
    series: &str,
    instance_ids: &[String],
    dry_run: bool,
    move_rootfs: bool,
) -> String {
    let mut apt = vec!["apt-get"];
    if series == "trusty" {
        // LXD for trusty only comes from backports.
        apt.extend(["-t", "trusty-backports"]);
    }
    apt.extend(["install", "-q", "-y"]);
    apt.extend(LXD_PACKAGES);

    let mut args = Vec::new();
    if dry_run {
        args.push("--dry-run".to_string());
    }
    if move_rootfs {
        args.push("--move-rootfs".to_string());
    }
    args.extend(instance_ids.iter().cloned());

    let dir = scripts_dir.display().to_string();
    let script_path = scripts_dir.join("lxc-to-lxd").display().to_string();
    format!(
        "\nset -e\nmkdir -p {dir}\n{apt}\ncat << 'EOF' > {path}\n{script}\nEOF\npython3 {path} {args}\n",
        dir = shell_join(&[dir.as_str()]),
        apt = apt.join(" "),
        path = shell_join(&[script_path.as_str()]),
        script = LXC_TO_LXD_SCRIPT.trim_end(),
        args = shell_join(&args),
    )
}

pub fn revert_script(pairs: &[(String, String)]) -> String {
    let mut script = String::from(
        r#"
set -ex
LXC_BASE=/var/lib/lxc
LXD_BASE=/var/lib/lxd/containers

function revert-lxd() {
   source_lxd=$1
   target_lxc=$2
   echo reverting from $source_lxd to $target_lxc
   sed '/^lxd.migrated=true$/d' -i $LXC_BASE/$target_lxc/config
   mv $LXD_BASE/$source_lxd/rootfs $LXC_BASE/$target_lxc/
   lxc delete $source_lxd
}

"#,
    );
    for (lxd_name, lxc_name) in pairs {
        script.push_str(&format!(
            "revert-lxd {}\n",
            shell_join(&[lxd_name.as_str(), lxc_name.as_str()])
        ));
    }
    script
}
