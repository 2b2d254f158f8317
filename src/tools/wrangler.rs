use anyhow::{bail, Context, Result};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::executor::retry::{with_retry, RetryPolicy};
use crate::export::description::AgentTools;

/// A tools archive of the controller's version, cached on local disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolsInfo {
    /// `<number>-<series>-<arch>`.
    pub version: String,
    pub url: String,
    pub size: u64,
    pub sha256: String,
    pub path: PathBuf,
}

impl ToolsInfo {
    pub fn agent_tools(&self) -> AgentTools {
        AgentTools {
            version: self.version.clone(),
            url: self.url.clone(),
            sha256: self.sha256.clone(),
            size: self.size as i64,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.tgz", self.version)
    }
}

/// Fetches agent binaries from the target controller. Archives already on
/// disk are reused, and each series-arch is looked at once per process.
pub struct ToolsWrangler {
    http: reqwest::Client,
    controller_addr: String,
    version: String,
    tools_dir: PathBuf,
    retry: RetryPolicy,
    cache: Mutex<BTreeMap<String, ToolsInfo>>,
}

impl ToolsWrangler {
    /// `controller_addr` is `host:port` of a controller API server and
    /// `version` the controller's agent version.
    pub fn new(controller_addr: &str, version: &str, tools_dir: &Path) -> Result<Self> {
        // Controllers present a certificate signed by their own CA.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            controller_addr: controller_addr.to_string(),
            version: version.to_string(),
            tools_dir: tools_dir.to_path_buf(),
            retry: RetryPolicy::default(),
            cache: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn tools_url(&self, series_arch: &str) -> String {
        format!(
            "https://{}/tools/{}-{}",
            self.controller_addr, self.version, series_arch
        )
    }

    pub fn archive_path(&self, series_arch: &str) -> PathBuf {
        self.tools_dir
            .join(format!("{}-{}.tgz", self.version, series_arch))
    }

    /// Tools for `series_arch` (e.g. `xenial-amd64`), downloading them only
    /// when no archive is on disk yet.
    pub async fn get_tools(&self, series_arch: &str) -> Result<ToolsInfo> {
        let mut cache = self.cache.lock().await;
        if let Some(info) = cache.get(series_arch) {
            return Ok(info.clone());
        }

        let url = self.tools_url(series_arch);
        let path = self.archive_path(series_arch);
        if path.exists() {
            tracing::info!("{} exists", path.display());
        } else {
            tracing::info!("Downloading tools: {}", url);
            tokio::fs::create_dir_all(&self.tools_dir)
                .await
                .with_context(|| format!("creating {}", self.tools_dir.display()))?;
            with_retry(self.retry, &url, || self.download(&url, &path))
                .await
                .with_context(|| format!("downloading tools {}-{}", self.version, series_arch))?;
        }

        let (size, sha256) = file_digest(&path).await?;
        let info = ToolsInfo {
            version: format!("{}-{}", self.version, series_arch),
            url,
            size,
            sha256,
            path,
        };
        cache.insert(series_arch.to_string(), info.clone());
        Ok(info)
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .context("Failed to fetch tools")?;
        if !resp.status().is_success() {
            bail!("bad HTTP response: {}", resp.status());
        }

        // Written beside the destination and renamed, so an interrupted
        // download never looks cached.
        let partial = dest.with_extension("tgz.partial");
        let mut file = tokio::fs::File::create(&partial)
            .await
            .with_context(|| format!("creating {}", partial.display()))?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("reading tools download")?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        let check = partial.clone();
        tokio::task::spawn_blocking(move || check_tools_archive(&check))
            .await
            .context("checking tools archive")??;
        tokio::fs::rename(&partial, dest)
            .await
            .with_context(|| format!("moving tools into {}", dest.display()))?;
        Ok(())
    }
}

/// Size and hex SHA-256 of a file.
pub async fn file_digest(path: &Path) -> Result<(u64, String)> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let digest = Sha256::digest(&data);
    Ok((data.len() as u64, hex::encode(digest)))
}

/// A tools archive is a gzipped tarball with `jujud` at its root.
pub fn check_tools_archive(path: &Path) -> Result<()> {
    let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
    for entry in archive.entries().context("reading tools archive")? {
        let entry = entry.context("reading tools archive")?;
        let name = entry.path()?.to_string_lossy().trim_start_matches("./").to_string();
        if name == "jujud" {
            return Ok(());
        }
    }
    bail!("tools archive {} has no jujud", path.display())
}
