use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ─── Settings ───────────────────────────────────────────────────────────────

/// Everything that used to be a package-level constant. Built once in
/// `main` and handed down explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_tools_dir")]
    pub tools_dir: PathBuf,
    #[serde(default = "default_system_identity")]
    pub system_identity: PathBuf,

    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub mongo: MongoSettings,
    #[serde(default)]
    pub timing: TimingSettings,

    /// v1 environment store (`.jenv` files).
    #[serde(default = "default_juju_home")]
    pub juju_home: PathBuf,
    /// v2 client store (`controllers.yaml`, `accounts.yaml`).
    #[serde(default = "default_juju_data")]
    pub juju_data: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            tools_dir: default_tools_dir(),
            system_identity: default_system_identity(),
            ssh: SshSettings::default(),
            mongo: MongoSettings::default(),
            timing: TimingSettings::default(),
            juju_home: default_juju_home(),
            juju_data: default_juju_data(),
        }
    }
}

impl Settings {
    /// Load settings from an optional YAML file layered over the defaults.
    /// A path that doesn't exist yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "settings file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        let settings: Settings = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing settings in {}", path.display()))?;
        Ok(settings)
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.data_dir.join("agents")
    }

    pub fn saved_machines_path(&self) -> PathBuf {
        self.tools_dir.join("saved-machines.json")
    }

    pub fn upgrade_script_path(&self) -> PathBuf {
        self.tools_dir.join("agent-upgrade.py")
    }

    /// Where the container conversion script is written on each host.
    pub fn lxc_scripts_dir(&self) -> PathBuf {
        self.data_dir.join("1.25-upgrade").join("scripts")
    }

    pub fn rollback_dir(&self) -> PathBuf {
        self.data_dir.join("1.25-upgrade-rollback")
    }
}

/// How remote commands are reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,
    #[serde(default = "default_scp_binary")]
    pub scp_binary: String,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    /// Concurrent sessions proxied through a single host.
    #[serde(default = "default_max_per_host")]
    pub max_per_host: usize,
    #[serde(default = "default_acquire_timeout", with = "duration_secs")]
    pub acquire_timeout: Duration,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            ssh_binary: default_ssh_binary(),
            scp_binary: default_scp_binary(),
            user: default_ssh_user(),
            max_per_host: default_max_per_host(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

/// Local tooling used to read the v1 state database on the API server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoSettings {
    #[serde(default = "default_mongo_export")]
    pub export_binary: String,
    #[serde(default = "default_mongo_shell")]
    pub shell_binary: String,
    #[serde(default = "default_mongo_files")]
    pub files_binary: String,
    #[serde(default = "default_mongo_port")]
    pub port: u16,
}

impl Default for MongoSettings {
    fn default() -> Self {
        Self {
            export_binary: default_mongo_export(),
            shell_binary: default_mongo_shell(),
            files_binary: default_mongo_files(),
            port: default_mongo_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    #[serde(default = "default_ready_timeout", with = "duration_secs")]
    pub container_ready_timeout: Duration,
    #[serde(default = "default_ready_interval", with = "duration_secs")]
    pub container_ready_interval: Duration,
    #[serde(default = "default_maas_poll", with = "duration_secs")]
    pub maas_poll_interval: Duration,
    #[serde(default = "default_maas_reminder", with = "duration_secs")]
    pub maas_reminder_interval: Duration,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            container_ready_timeout: default_ready_timeout(),
            container_ready_interval: default_ready_interval(),
            maas_poll_interval: default_maas_poll(),
            maas_reminder_interval: default_maas_reminder(),
        }
    }
}

// ─── Defaults ───────────────────────────────────────────────────────────────

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/juju")
}

fn default_tools_dir() -> PathBuf {
    PathBuf::from("/home/ubuntu/juju-1.25-upgrade-tools")
}

fn default_system_identity() -> PathBuf {
    PathBuf::from("/var/lib/juju/system-identity")
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_scp_binary() -> String {
    "scp".to_string()
}

fn default_ssh_user() -> String {
    "ubuntu".to_string()
}

fn default_max_per_host() -> usize {
    5
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_mongo_export() -> String {
    "/usr/lib/juju/bin/mongoexport".to_string()
}

fn default_mongo_shell() -> String {
    "/usr/lib/juju/bin/mongo".to_string()
}

fn default_mongo_files() -> String {
    "/usr/lib/juju/bin/mongofiles".to_string()
}

fn default_mongo_port() -> u16 {
    37017
}

fn default_ready_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_ready_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_maas_poll() -> Duration {
    Duration::from_secs(5)
}

fn default_maas_reminder() -> Duration {
    Duration::from_secs(30)
}

/// `$JUJU_HOME`, falling back to `~/.juju`.
fn default_juju_home() -> PathBuf {
    if let Some(home) = std::env::var_os("JUJU_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".juju")
}

/// `$JUJU_DATA`, then `$XDG_DATA_HOME/juju`, then `~/.local/share/juju`.
fn default_juju_data() -> PathBuf {
    if let Some(data) = std::env::var_os("JUJU_DATA") {
        return PathBuf::from(data);
    }
    if let Some(xdg) = std::env::var_os("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("juju");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".local")
        .join("share")
        .join("juju")
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
