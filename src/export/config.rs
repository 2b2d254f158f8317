use anyhow::{bail, Result};
use serde_json::Value;
use std::collections::BTreeMap;

use super::description::{CloudCredential, StoragePool};
use super::names::user_name;
use crate::error::UpgradeError;
use crate::state::Document;

/// Only meaningful at bootstrap.
const REMOVE_MODEL_CONFIG_ATTRS: &[&str] = &["admin-secret", "ca-private-key", "proxy-ssh"];

/// Controller settings in v2; they no longer belong to a model.
const CONTROLLER_ONLY_CONFIG_ATTRS: &[&str] =
    &["api-port", "ca-cert", "state-port", "set-numa-control-policy"];

/// v2 requires these; v1 never stored them.
const NEW_REQUIRED_DEFAULTS: &[(&str, &str)] = &[
    ("max-action-results-age", "336h"),
    ("max-action-results-size", "5G"),
    ("max-status-history-age", "336h"),
    ("max-status-history-size", "5G"),
];

const COMMON_STORAGE_PROVIDERS: &[&str] = &["loop", "rootfs", "tmpfs"];

const POOL_SETTINGS_PREFIX: &str = "pool#";

/// The v1 environ config split into the three things v2 keeps apart.
#[derive(Debug, Clone)]
pub struct SplitConfig {
    pub model_config: BTreeMap<String, Value>,
    pub credential: CloudCredential,
    pub region: String,
}

fn string_attr(config: &BTreeMap<String, Value>, key: &str) -> Result<String> {
    match config.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => bail!("expected string for config {:?}, got {}", key, other),
        None => bail!("missing config attribute {:?}", key),
    }
}

fn remove_all(config: &mut BTreeMap<String, Value>, keys: &[&str]) {
    for key in keys {
        config.remove(*key);
    }
}

/// Split the environ config into model config, cloud credential and cloud
/// region, by cloud type.
pub fn split_environ_config(environ_config: &Document, owner: &str, env_uuid: &str) -> Result<SplitConfig> {
    let mut config: BTreeMap<String, Value> = environ_config
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    remove_all(&mut config, CONTROLLER_ONLY_CONFIG_ATTRS);

    let cloud = string_attr(&config, "name")?;
    let owner = user_name(owner);
    let short_owner = owner.split('@').next().unwrap_or(&owner).to_string();
    let mut credential = CloudCredential {
        name: format!("{}-{}", short_owner, cloud),
        owner,
        cloud,
        ..Default::default()
    };
    let mut region = String::new();

    let cloud_type = string_attr(&config, "type")?;
    match cloud_type.as_str() {
        "ec2" => {
            credential.auth_type = "access-key".to_string();
            credential.attributes = BTreeMap::from([
                ("access-key".to_string(), string_attr(&config, "access-key")?),
                ("secret-key".to_string(), string_attr(&config, "secret-key")?),
            ]);
            region = string_attr(&config, "region")?;
            remove_all(&mut config, &["region", "access-key", "secret-key"]);
        }
        "maas" => {
            credential.auth_type = "oauth1".to_string();
            credential.attributes = BTreeMap::from([(
                "maas-oauth".to_string(),
                string_attr(&config, "maas-oauth")?,
            )]);
            remove_all(&mut config, &["maas-oauth", "maas-server", "maas-agent-name"]);
        }
        "openstack" => {
            credential.auth_type = string_attr(&config, "auth-mode")?;
            credential.attributes = match credential.auth_type.as_str() {
                "legacy" | "userpass" => BTreeMap::from([
                    ("username".to_string(), string_attr(&config, "username")?),
                    ("password".to_string(), string_attr(&config, "password")?),
                ]),
                "keypair" => BTreeMap::from([
                    ("access-key".to_string(), string_attr(&config, "access-key")?),
                    ("secret-key".to_string(), string_attr(&config, "secret-key")?),
                ]),
                other => bail!("unknown auth-mode {:?} not valid", other),
            };
            credential
                .attributes
                .insert("tenant-name".to_string(), string_attr(&config, "tenant-name")?);
            region = string_attr(&config, "region")?;
            remove_all(
                &mut config,
                &[
                    "username",
                    "password",
                    "tenant-name",
                    "auth-url",
                    "auth-mode",
                    "access-key",
                    "secret-key",
                    "region",
                    "control-bucket",
                ],
            );
        }
        other => return Err(UpgradeError::UnsupportedCloud(other.to_string()).into()),
    }

    remove_all(&mut config, REMOVE_MODEL_CONFIG_ATTRS);
    for (key, value) in NEW_REQUIRED_DEFAULTS {
        config
            .entry(key.to_string())
            .or_insert_with(|| Value::String(value.to_string()));
    }
    // Some older environments never recorded their uuid in config.
    if config.get("uuid").map_or(true, Value::is_null) {
        config.insert("uuid".to_string(), Value::String(env_uuid.to_string()));
    }

    Ok(SplitConfig {
        model_config: config,
        credential,
        region,
    })
}

/// The storage provider type a cloud type gets by default.
pub fn provider_storage_type(cloud_type: &str) -> Option<&'static str> {
    match cloud_type {
        "local" => Some("hostloop"),
        "gce" => Some("gce"),
        "ec2" => Some("ebs"),
        "maas" => Some("maas"),
        "openstack" => Some("cinder"),
        "azure" => Some("azure"),
        "dummy" => Some("dummy"),
        _ => None,
    }
}

/// Storage pools defined in settings. Pools for other clouds' providers are
/// just defaults and are left out.
pub fn storage_pools(settings: &BTreeMap<String, Document>, cloud_type: &str) -> Vec<StoragePool> {
    let mut pools = Vec::new();
    for (key, doc) in settings {
        let Some(default_name) = key.strip_prefix(POOL_SETTINGS_PREFIX) else {
            continue;
        };
        let provider = doc.get("type").and_then(Value::as_str).unwrap_or_default();
        let wanted = COMMON_STORAGE_PROVIDERS.contains(&provider)
            || provider_storage_type(cloud_type) == Some(provider);
        if !wanted {
            continue;
        }
        let name = doc
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(default_name)
            .to_string();
        let attributes = doc
            .iter()
            .filter(|(k, _)| k.as_str() != "name" && k.as_str() != "type")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        pools.push(StoragePool {
            name,
            provider: provider.to_string(),
            attributes,
        });
    }
    pools
}
