use anyhow::{bail, Context, Result};
use md5::{Digest, Md5};
use std::path::Path;

use crate::executor::{ExecOptions, SshRunner};

/// Hex MD5 of the plugin binary. Only used to tell whether the remote copy
/// is the same build.
pub fn local_md5sum(plugin: &Path) -> Result<String> {
    let content = std::fs::read(plugin).context("opening plugin")?;
    Ok(hex::encode(Md5::digest(&content)))
}

/// MD5 of the plugin in the login user's home on `address`. A missing file
/// yields an empty sum.
pub async fn remote_md5sum(runner: &SshRunner, plugin: &Path, address: &str) -> Result<String> {
    let script = format!("md5sum {} | cut -f 1 -d ' '", plugin_base(plugin)?);
    let out = runner
        .run(address, &script, ExecOptions::new())
        .await
        .context("getting md5sum")?;
    if !out.success() {
        bail!("getting md5: {:?}", out.stdout);
    }
    Ok(out.stdout.trim().to_string())
}

pub fn plugin_base(plugin: &Path) -> Result<String> {
    plugin
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("plugin path {} has no file name", plugin.display()))
}

/// Copy the plugin into the remote home directory if it differs from the
/// copy already there. Returns whether a copy was made.
pub async fn check_update_plugin(runner: &SshRunner, plugin: &Path, address: &str) -> Result<bool> {
    tracing::info!("checking remote plugin");
    let local = local_md5sum(plugin).context("generating local md5sum")?;
    tracing::debug!("local: {:?}", local);

    let remote = remote_md5sum(runner, plugin, address)
        .await
        .context("generating remote md5sum")?;
    tracing::debug!("remote: {:?}", remote);

    if local == remote {
        return Ok(false);
    }
    tracing::info!("updating remote plugin");
    runner
        .copy_to(&[plugin], address, "~", None, None)
        .await
        .context("copying command to environment")?;
    Ok(true)
}
