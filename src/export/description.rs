use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::state::Document;

/// Serialized model format version written by the exporter.
pub const DESCRIPTION_VERSION: u32 = 1;

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

// ─── Model ──────────────────────────────────────────────────────────────────

/// The v2 model description handed to the target controller's import.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Model {
    pub version: u32,
    pub owner: String,
    pub cloud: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cloud_region: String,
    pub cloud_credential: Option<CloudCredential>,
    pub config: BTreeMap<String, Value>,
    pub blocks: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub constraints: Constraints,
    pub sequences: BTreeMap<String, i64>,
    pub status: Option<Status>,
    pub status_history: Vec<Status>,
    pub users: Vec<User>,
    pub machines: Vec<Machine>,
    pub applications: Vec<Application>,
    pub relations: Vec<Relation>,
    pub spaces: Vec<Space>,
    pub subnets: Vec<Subnet>,
    pub link_layer_devices: Vec<LinkLayerDevice>,
    pub ip_addresses: Vec<IpAddress>,
    pub volumes: Vec<Volume>,
    pub filesystems: Vec<Filesystem>,
    pub storages: Vec<Storage>,
    pub storage_pools: Vec<StoragePool>,
}

impl Model {
    pub fn new() -> Self {
        Self {
            version: DESCRIPTION_VERSION,
            ..Default::default()
        }
    }

    pub fn serialize(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn deserialize(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn uuid(&self) -> Option<&str> {
        self.config.get("uuid").and_then(Value::as_str)
    }

    pub fn cloud_type(&self) -> Option<&str> {
        self.config.get("type").and_then(Value::as_str)
    }

    /// Every machine, containers included, parents first.
    pub fn all_machines(&self) -> Vec<&Machine> {
        fn walk<'a>(machines: &'a [Machine], out: &mut Vec<&'a Machine>) {
            for m in machines {
                out.push(m);
                walk(&m.containers, out);
            }
        }
        let mut out = Vec::new();
        walk(&self.machines, &mut out);
        out
    }

    pub fn for_each_machine_mut<F: FnMut(&mut Machine) -> Result<()>>(&mut self, mut f: F) -> Result<()> {
        fn walk<F: FnMut(&mut Machine) -> Result<()>>(machines: &mut [Machine], f: &mut F) -> Result<()> {
            for m in machines.iter_mut() {
                f(m)?;
                walk(&mut m.containers, f)?;
            }
            Ok(())
        }
        walk(&mut self.machines, &mut f)
    }

    /// Every unit must sit on an exported machine, and so must every storage
    /// attachment.
    pub fn validate(&self) -> Result<()> {
        let machines: BTreeSet<&str> = self.all_machines().iter().map(|m| m.id.as_str()).collect();
        for app in &self.applications {
            for unit in &app.units {
                if !machines.contains(unit.machine.as_str()) {
                    bail!("unit {} refers to unknown machine {}", unit.name, unit.machine);
                }
            }
        }
        for volume in &self.volumes {
            for att in &volume.attachments {
                if !machines.contains(att.machine_id.as_str()) {
                    bail!("volume {} attached to unknown machine {}", volume.id, att.machine_id);
                }
            }
        }
        for fs in &self.filesystems {
            for att in &fs.attachments {
                if !machines.contains(att.machine_id.as_str()) {
                    bail!("filesystem {} attached to unknown machine {}", fs.id, att.machine_id);
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CloudCredential {
    pub owner: String,
    pub cloud: String,
    pub name: String,
    pub auth_type: String,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Status {
    pub value: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, Value>,
    pub updated: DateTime<Utc>,
}

impl Status {
    pub fn new(value: &str, updated: DateTime<Utc>) -> Self {
        Self {
            value: value.to_string(),
            message: String::new(),
            data: BTreeMap::new(),
            updated,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Constraints {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub architecture: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub container: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub cpu_cores: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub cpu_power: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub instance_type: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub memory: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub root_disk: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub spaces: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct User {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    pub created_by: String,
    pub date_created: Option<DateTime<Utc>>,
    pub last_connection: Option<DateTime<Utc>>,
    pub access: String,
}

// ─── Machines ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AgentTools {
    /// `<number>-<series>-<arch>`.
    pub version: String,
    pub url: String,
    pub sha256: String,
    pub size: i64,
}

impl AgentTools {
    /// `2.2.9-xenial-amd64` → `xenial-amd64`.
    pub fn series_arch(&self) -> Option<String> {
        let (_, rest) = self.version.split_once('-')?;
        Some(rest.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Address {
    pub value: String,
    #[serde(rename = "type")]
    pub address_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub scope: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub origin: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CloudInstance {
    pub instance_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub architecture: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub memory: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub root_disk: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub cpu_cores: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub cpu_power: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub availability_zone: String,
    pub status: Option<Status>,
    pub status_history: Vec<Status>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BlockDevice {
    pub name: String,
    pub links: Vec<String>,
    pub label: String,
    pub uuid: String,
    pub hardware_id: String,
    pub bus_address: String,
    pub size: u64,
    pub filesystem_type: String,
    pub in_use: bool,
    pub mount_point: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Machine {
    pub id: String,
    pub nonce: String,
    pub password_hash: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub placement: String,
    pub series: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub container_type: String,
    pub jobs: Vec<String>,
    /// `None` means not yet known; an empty list means none supported.
    pub supported_containers: Option<Vec<String>>,
    pub provider_addresses: Vec<Address>,
    pub machine_addresses: Vec<Address>,
    pub preferred_public_address: Option<Address>,
    pub preferred_private_address: Option<Address>,
    pub instance: Option<CloudInstance>,
    pub block_devices: Vec<BlockDevice>,
    pub status: Option<Status>,
    pub status_history: Vec<Status>,
    pub tools: Option<AgentTools>,
    pub annotations: BTreeMap<String, String>,
    pub constraints: Constraints,
    pub containers: Vec<Machine>,
}

// ─── Applications ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StorageConstraint {
    pub pool: String,
    pub size: u64,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Application {
    pub name: String,
    pub series: String,
    #[serde(skip_serializing_if = "is_false")]
    pub subordinate: bool,
    pub charm_url: String,
    #[serde(skip_serializing_if = "is_false")]
    pub force_charm: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub exposed: bool,
    pub min_units: i64,
    pub settings: Document,
    pub leader: String,
    pub leadership_settings: Document,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_creds: Option<String>,
    pub endpoint_bindings: BTreeMap<String, String>,
    pub storage_constraints: BTreeMap<String, StorageConstraint>,
    pub status: Option<Status>,
    pub status_history: Vec<Status>,
    pub annotations: BTreeMap<String, String>,
    pub constraints: Constraints,
    pub units: Vec<Unit>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Unit {
    pub name: String,
    pub machine: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub principal: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subordinates: Vec<String>,
    pub password_hash: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub meter_status_code: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub meter_status_info: String,
    pub workload_status: Option<Status>,
    pub workload_status_history: Vec<Status>,
    pub agent_status: Option<Status>,
    pub agent_status_history: Vec<Status>,
    pub tools: Option<AgentTools>,
    pub annotations: BTreeMap<String, String>,
    pub constraints: Constraints,
}

// ─── Relations ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Relation {
    pub id: i64,
    pub key: String,
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Endpoint {
    pub application_name: String,
    pub name: String,
    pub role: String,
    pub interface: String,
    pub optional: bool,
    pub limit: i64,
    pub scope: String,
    pub unit_settings: BTreeMap<String, Document>,
}

// ─── Networking ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Space {
    pub name: String,
    pub public: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Subnet {
    pub cidr: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub provider_id: String,
    pub vlan_tag: i64,
    pub availability_zones: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub space_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LinkLayerDevice {
    pub name: String,
    pub mtu: u64,
    pub provider_id: String,
    pub machine_id: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub mac_address: String,
    pub is_auto_start: bool,
    pub is_up: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub parent_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct IpAddress {
    pub provider_id: String,
    pub device_name: String,
    pub machine_id: String,
    pub subnet_cidr: String,
    pub config_method: String,
    pub value: String,
    pub dns_servers: Vec<String>,
    pub dns_search_domains: Vec<String>,
    pub gateway_address: String,
}

// ─── Storage ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Volume {
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub storage_id: String,
    pub provisioned: bool,
    pub size: u64,
    pub pool: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hardware_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub volume_id: String,
    pub persistent: bool,
    pub status: Option<Status>,
    pub status_history: Vec<Status>,
    pub attachments: Vec<VolumeAttachment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct VolumeAttachment {
    pub machine_id: String,
    pub provisioned: bool,
    pub read_only: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub device_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub device_link: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub bus_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Filesystem {
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub storage_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub volume_id: String,
    pub provisioned: bool,
    pub size: u64,
    pub pool: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub filesystem_id: String,
    pub status: Option<Status>,
    pub attachments: Vec<FilesystemAttachment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FilesystemAttachment {
    pub machine_id: String,
    pub provisioned: bool,
    pub read_only: bool,
    pub mount_point: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Storage {
    pub id: String,
    pub kind: String,
    pub owner: String,
    pub name: String,
    pub attachments: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StoragePool {
    pub name: String,
    pub provider: String,
    pub attributes: BTreeMap<String, Value>,
}
