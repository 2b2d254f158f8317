use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::UpgradeError;

// ─── Machine tag discovery ──────────────────────────────────────────────────

/// A `machine-<id>` tag. Container ids keep their slashes: the on-disk form
/// `machine-0-lxc-1` parses to id `0/lxc/1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineTag {
    id: String,
}

impl MachineTag {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }

    pub fn parse(tag: &str) -> Result<Self> {
        let Some(rest) = tag.strip_prefix("machine-") else {
            bail!("{:?} is not a valid machine tag", tag);
        };
        if rest.is_empty() {
            bail!("{:?} is not a valid machine tag", tag);
        }
        Ok(Self {
            id: rest.replace('-', "/"),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Display for MachineTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "machine-{}", self.id.replace('/', "-"))
    }
}

/// The one machine agent configured under `<data_dir>/agents`.
pub fn current_machine_tag(data_dir: &Path) -> Result<MachineTag> {
    let pattern = data_dir.join("agents").join("machine-*");
    let pattern = pattern.to_string_lossy();
    let mut matches = Vec::new();
    for entry in glob::glob(&pattern).context("bad agents glob")? {
        let path = entry.context("reading agents directory")?;
        if let Some(name) = path.file_name() {
            matches.push(name.to_string_lossy().to_string());
        }
    }
    matches.sort();

    match matches.len() {
        0 => Err(UpgradeError::NoMachines.into()),
        1 => MachineTag::parse(&matches[0]),
        _ => Err(UpgradeError::TooManyMachines(matches).into()),
    }
}

pub fn agent_config_path(data_dir: &Path, tag: &MachineTag) -> PathBuf {
    data_dir
        .join("agents")
        .join(tag.to_string())
        .join("agent.conf")
}

// ─── Agent config ───────────────────────────────────────────────────────────

const FORMAT_2_0: &str = "# format 2.0";

/// v1 agent config, before `upgrade-agents`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct V1AgentConfig {
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub datadir: String,
    #[serde(default)]
    pub stateaddresses: Vec<String>,
    #[serde(default)]
    pub statepassword: String,
    #[serde(default)]
    pub oldpassword: String,
    #[serde(default)]
    pub apiaddresses: Vec<String>,
    #[serde(default)]
    pub cacert: String,
    #[serde(default, rename = "upgradedToVersion")]
    pub upgraded_to_version: String,
}

/// v2 agent config, rewritten by the upgrade script.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct V2AgentConfig {
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub controller: String,
    #[serde(default)]
    pub apiaddresses: Vec<String>,
    #[serde(default)]
    pub cacert: String,
    #[serde(default, rename = "upgradedToVersion")]
    pub upgraded_to_version: String,
}

/// Agent config in either on-disk format. Commands like `abort` run both
/// before and after the agents have been upgraded.
#[derive(Debug, Clone)]
pub enum AgentConfig {
    V1(V1AgentConfig),
    V2(V2AgentConfig),
}

/// Connection details for the local v1 state server.
#[derive(Debug, Clone, PartialEq)]
pub struct MongoInfo {
    pub addrs: Vec<String>,
    pub tag: String,
    pub password: String,
    pub ca_cert: String,
}

impl AgentConfig {
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading agent config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing agent config {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let first_line = content.lines().next().unwrap_or("").trim();
        if first_line == FORMAT_2_0 {
            let config: V2AgentConfig = serde_yaml::from_str(content)?;
            return Ok(AgentConfig::V2(config));
        }
        let config: V1AgentConfig = serde_yaml::from_str(content)?;
        Ok(AgentConfig::V1(config))
    }

    /// Read the config for the single machine agent on this host.
    pub fn for_current_machine(data_dir: &Path) -> Result<(MachineTag, Self)> {
        let tag = current_machine_tag(data_dir)?;
        let config = Self::read(&agent_config_path(data_dir, &tag))?;
        Ok((tag, config))
    }

    pub fn model_uuid(&self) -> Result<String> {
        let (tag, prefix) = match self {
            AgentConfig::V1(c) => (&c.environment, "environment-"),
            AgentConfig::V2(c) => (&c.model, "model-"),
        };
        match tag.strip_prefix(prefix) {
            Some(uuid) if !uuid.is_empty() => Ok(uuid.to_string()),
            _ => bail!("agent config has no valid model tag (got {:?})", tag),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            AgentConfig::V1(c) => &c.tag,
            AgentConfig::V2(c) => &c.tag,
        }
    }

    /// Only v1 configs can reach the v1 database.
    pub fn mongo_info(&self) -> Result<MongoInfo> {
        let AgentConfig::V1(c) = self else {
            bail!("mongo info not available from agent config");
        };
        let password = if c.statepassword.is_empty() {
            &c.oldpassword
        } else {
            &c.statepassword
        };
        if c.stateaddresses.is_empty() || password.is_empty() {
            bail!("mongo info not available from agent config");
        }
        Ok(MongoInfo {
            addrs: c.stateaddresses.clone(),
            tag: c.tag.clone(),
            password: password.clone(),
            ca_cert: c.cacert.clone(),
        })
    }
}
