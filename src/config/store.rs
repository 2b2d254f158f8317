use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::UpgradeError;

// ─── v1 environment store ───────────────────────────────────────────────────

/// The parts of a `.jenv` file the client half needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, rename = "environ-uuid")]
    pub environ_uuid: String,
    #[serde(default, rename = "state-servers")]
    pub state_servers: Vec<String>,
    #[serde(default, rename = "ca-cert")]
    pub ca_cert: String,
    #[serde(default, rename = "bootstrap-config")]
    pub bootstrap_config: HashMap<String, serde_yaml::Value>,
}

impl EnvironmentInfo {
    /// Read `<juju_home>/environments/<name>.jenv`.
    pub fn load(juju_home: &Path, name: &str) -> Result<Self> {
        let path = juju_home.join("environments").join(format!("{}.jenv", name));
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("loading environment info from {}", path.display()))?;
        let info: EnvironmentInfo = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        if !info.initialized() {
            return Err(UpgradeError::NotInitialized(name.to_string()).into());
        }
        Ok(info)
    }

    pub fn initialized(&self) -> bool {
        !self.state_servers.is_empty()
    }

    /// First API endpoint with its port stripped.
    pub fn target_address(&self) -> Result<String> {
        let Some(first) = self.state_servers.first() else {
            bail!("no API addresses recorded for environment");
        };
        Ok(strip_port(first).to_string())
    }
}

/// Drop everything from the last `:` onwards. `[::1]:17070` keeps its
/// brackets.
pub fn strip_port(address: &str) -> &str {
    match address.rfind(':') {
        Some(idx) => &address[..idx],
        None => address,
    }
}

// ─── v2 controller store ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ControllersFile {
    #[serde(default)]
    controllers: HashMap<String, ControllerDetails>,
}

#[derive(Debug, Deserialize)]
struct ControllerDetails {
    #[serde(default, rename = "api-endpoints")]
    api_endpoints: Vec<String>,
    #[serde(default, rename = "ca-cert")]
    ca_cert: String,
    #[serde(default)]
    uuid: String,
}

#[derive(Debug, Deserialize)]
struct AccountsFile {
    #[serde(default)]
    controllers: HashMap<String, AccountDetails>,
}

#[derive(Debug, Deserialize)]
struct AccountDetails {
    user: String,
    #[serde(default)]
    password: String,
}

/// Connection details for the target controller, as forwarded to the impl
/// half. Field names match the JSON the remote side decodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerInfo {
    #[serde(rename = "Addrs")]
    pub addrs: Vec<String>,
    #[serde(rename = "SNIHostName", default)]
    pub sni_host_name: String,
    #[serde(rename = "CACert")]
    pub ca_cert: String,
    #[serde(rename = "Tag")]
    pub tag: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Macaroons", default)]
    pub macaroons: Option<serde_json::Value>,
    /// Not forwarded by older clients.
    #[serde(rename = "ControllerUUID", default)]
    pub controller_uuid: String,
}

impl ControllerInfo {
    /// Look up a controller by name in `controllers.yaml` and
    /// `accounts.yaml`.
    pub fn load(juju_data: &Path, name: &str) -> Result<Self> {
        let controllers_path = juju_data.join("controllers.yaml");
        let content = std::fs::read_to_string(&controllers_path)
            .with_context(|| format!("reading {}", controllers_path.display()))?;
        let controllers: ControllersFile = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing {}", controllers_path.display()))?;
        let Some(details) = controllers.controllers.get(name) else {
            bail!("controller {:?} not found", name);
        };

        let accounts_path = juju_data.join("accounts.yaml");
        let content = std::fs::read_to_string(&accounts_path)
            .with_context(|| format!("reading {}", accounts_path.display()))?;
        let accounts: AccountsFile = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing {}", accounts_path.display()))?;
        let Some(account) = accounts.controllers.get(name) else {
            bail!("no account details for controller {:?}", name);
        };

        Ok(Self {
            addrs: details.api_endpoints.clone(),
            sni_host_name: String::new(),
            ca_cert: details.ca_cert.clone(),
            tag: user_tag(&account.user),
            password: account.password.clone(),
            macaroons: None,
            controller_uuid: details.uuid.clone(),
        })
    }

    /// JSON, then standard base64, so it survives being passed through a
    /// remote shell as a single word.
    pub fn encode(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self).context("marshalling controller info")?;
        Ok(STANDARD.encode(bytes))
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        if encoded.is_empty() {
            bail!("missing controller info");
        }
        let bytes = STANDARD
            .decode(encoded.trim())
            .context("decoding controller info")?;
        serde_json::from_slice(&bytes).context("unmarshalling controller info")
    }

    /// `user-admin` → `admin`.
    pub fn user_name(&self) -> &str {
        self.tag.strip_prefix("user-").unwrap_or(&self.tag)
    }
}

fn user_tag(user: &str) -> String {
    let name = user.strip_suffix("@local").unwrap_or(user);
    format!("user-{}", name)
}
