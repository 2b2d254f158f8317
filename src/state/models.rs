use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::backend::Document;

// ─── Environment ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentDoc {
    #[serde(rename = "_id")]
    pub uuid: String,
    pub name: String,
    pub owner: String,
    #[serde(rename = "server-uuid")]
    pub server_uuid: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvUserDoc {
    #[serde(rename = "user")]
    pub user_name: String,
    #[serde(rename = "displayname")]
    pub display_name: String,
    #[serde(rename = "createdby")]
    pub created_by: String,
    #[serde(rename = "datecreated")]
    pub date_created: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LastConnectionDoc {
    #[serde(rename = "user")]
    pub user_name: String,
    #[serde(rename = "lastconnection")]
    pub last_connection: Option<String>,
}

// ─── Machines ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressDoc {
    pub value: String,
    #[serde(rename = "addresstype")]
    pub address_type: String,
    #[serde(rename = "networkscope")]
    pub scope: String,
    pub origin: String,
}

impl AddressDoc {
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// Agent binary metadata as recorded on machines and units.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsDoc {
    pub version: String,
    pub url: String,
    pub sha256: String,
    pub size: i64,
}

impl ToolsDoc {
    /// `1.25.6-trusty-amd64` → `trusty-amd64`.
    pub fn series_arch(&self) -> Option<String> {
        let mut parts = self.version.splitn(2, '-');
        parts.next()?;
        parts.next().map(str::to_string)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineDoc {
    #[serde(rename = "machineid")]
    pub id: String,
    pub nonce: String,
    pub series: String,
    #[serde(rename = "containertype")]
    pub container_type: String,
    pub jobs: Vec<Value>,
    #[serde(rename = "passwordhash")]
    pub password_hash: String,
    pub placement: String,
    pub addresses: Vec<AddressDoc>,
    #[serde(rename = "machineaddresses")]
    pub machine_addresses: Vec<AddressDoc>,
    #[serde(rename = "preferredpublicaddress")]
    pub preferred_public_address: AddressDoc,
    #[serde(rename = "preferredprivateaddress")]
    pub preferred_private_address: AddressDoc,
    #[serde(rename = "supportedcontainers")]
    pub supported_containers: Vec<String>,
    #[serde(rename = "supportedcontainersknown")]
    pub supported_containers_known: bool,
    pub tools: Option<ToolsDoc>,
    pub principals: Vec<String>,
}

impl MachineDoc {
    pub fn is_container(&self) -> bool {
        parent_id(&self.id).is_some()
    }

    /// The address used for SSH: private (cloud-local) first, then public.
    pub fn ssh_address(&self) -> Option<&str> {
        self.private_address().or_else(|| self.public_address())
    }

    pub fn private_address(&self) -> Option<&str> {
        if !self.preferred_private_address.is_empty() {
            return Some(&self.preferred_private_address.value);
        }
        self.all_addresses()
            .find(|a| a.scope == "local-cloud")
            .map(|a| a.value.as_str())
    }

    pub fn public_address(&self) -> Option<&str> {
        if !self.preferred_public_address.is_empty() {
            return Some(&self.preferred_public_address.value);
        }
        self.all_addresses()
            .find(|a| a.scope == "public")
            .or_else(|| {
                self.all_addresses()
                    .find(|a| a.scope.is_empty() || a.scope == "unknown")
            })
            .map(|a| a.value.as_str())
    }

    fn all_addresses(&self) -> impl Iterator<Item = &AddressDoc> {
        self.addresses
            .iter()
            .chain(self.machine_addresses.iter())
            .filter(|a| !a.is_empty())
    }
}

/// `0/lxc/1` → `0`; top-level machines have no parent.
pub fn parent_id(machine_id: &str) -> Option<&str> {
    let idx = machine_id.rfind('/')?;
    let rest = &machine_id[..idx];
    let idx = rest.rfind('/')?;
    Some(&rest[..idx])
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceDataDoc {
    #[serde(rename = "machineid")]
    pub machine_id: String,
    #[serde(rename = "instanceid")]
    pub instance_id: String,
    pub status: String,
    pub arch: Option<String>,
    pub mem: Option<u64>,
    #[serde(rename = "rootdisk")]
    pub root_disk: Option<u64>,
    #[serde(rename = "cpucores")]
    pub cpu_cores: Option<u64>,
    #[serde(rename = "cpupower")]
    pub cpu_power: Option<u64>,
    pub tags: Option<Vec<String>>,
    #[serde(rename = "availzone")]
    pub avail_zone: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockDeviceDoc {
    #[serde(rename = "devicename")]
    pub device_name: String,
    #[serde(rename = "devicelinks")]
    pub device_links: Vec<String>,
    pub label: String,
    pub uuid: String,
    #[serde(rename = "hardwareid")]
    pub hardware_id: String,
    #[serde(rename = "busaddress")]
    pub bus_address: String,
    pub size: u64,
    #[serde(rename = "fstype")]
    pub filesystem_type: String,
    #[serde(rename = "inuse")]
    pub in_use: bool,
    #[serde(rename = "mountpoint")]
    pub mount_point: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockDevicesDoc {
    #[serde(rename = "machineid")]
    pub machine_id: String,
    #[serde(rename = "blockdevices")]
    pub block_devices: Vec<BlockDeviceDoc>,
}

// ─── Services, units, charms ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceDoc {
    pub name: String,
    pub series: String,
    pub subordinate: bool,
    #[serde(rename = "charmurl")]
    pub charm_url: String,
    #[serde(rename = "forcecharm")]
    pub force_charm: bool,
    pub exposed: bool,
    #[serde(rename = "minunits")]
    pub min_units: i64,
    #[serde(rename = "metric-credentials")]
    pub metric_credentials: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitDoc {
    pub name: String,
    pub service: String,
    pub series: String,
    #[serde(rename = "charmurl")]
    pub charm_url: Option<String>,
    pub principal: String,
    pub subordinates: Vec<String>,
    #[serde(rename = "machineid")]
    pub machine_id: String,
    pub tools: Option<ToolsDoc>,
    #[serde(rename = "passwordhash")]
    pub password_hash: String,
}

impl UnitDoc {
    /// `wordpress/0` → `wordpress`.
    pub fn application(&self) -> &str {
        self.name.split('/').next().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CharmRelation {
    pub name: String,
    pub role: String,
    pub interface: String,
    pub optional: bool,
    pub limit: i64,
    pub scope: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CharmMeta {
    pub name: String,
    pub subordinate: bool,
    pub provides: BTreeMap<String, CharmRelation>,
    pub requires: BTreeMap<String, CharmRelation>,
    pub peers: BTreeMap<String, CharmRelation>,
}

impl CharmMeta {
    /// Every endpoint the charm declares, including the implicit
    /// `juju-info` provider.
    pub fn endpoint_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .provides
            .keys()
            .chain(self.requires.keys())
            .chain(self.peers.keys())
            .cloned()
            .collect();
        if !names.iter().any(|n| n == "juju-info") {
            names.push("juju-info".to_string());
        }
        names.sort();
        names.dedup();
        names
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CharmDoc {
    #[serde(rename = "_id")]
    pub url: String,
    pub meta: CharmMeta,
    #[serde(rename = "storagepath")]
    pub storage_path: String,
    #[serde(rename = "bundlesha256")]
    pub bundle_sha256: String,
}

impl CharmDoc {
    /// `cs:trusty/mysql-38` → `mysql`.
    pub fn url_name(&self) -> &str {
        let base = self.url.rsplit('/').next().unwrap_or(&self.url);
        let base = base.rsplit(':').next().unwrap_or(base);
        match base.rfind('-') {
            Some(idx) if base[idx + 1..].chars().all(|c| c.is_ascii_digit()) => &base[..idx],
            _ => base,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterStatusDoc {
    pub code: String,
    pub info: String,
}

// ─── Relations ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointDoc {
    #[serde(rename = "servicename")]
    pub service_name: String,
    pub relation: CharmRelation,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationDoc {
    pub key: String,
    pub id: i64,
    pub endpoints: Vec<EndpointDoc>,
}

// ─── Model-level records ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceDoc {
    pub name: String,
    pub counter: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockDoc {
    #[serde(rename = "type")]
    pub block_type: i64,
    pub message: String,
}

impl BlockDoc {
    /// Name of the block type in the v2 model.
    pub fn migration_value(&self) -> &'static str {
        match self.block_type {
            0 => "destroy-model",
            1 => "remove-object",
            2 => "all-changes",
            _ => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoricalStatusDoc {
    #[serde(rename = "globalkey")]
    pub global_key: String,
    pub status: String,
    #[serde(rename = "statusinfo")]
    pub status_info: String,
    #[serde(rename = "statusdata")]
    pub status_data: BTreeMap<String, Value>,
    pub updated: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotatorDoc {
    #[serde(rename = "globalkey")]
    pub global_key: String,
    pub tag: String,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConstraint {
    pub pool: String,
    pub size: u64,
    pub count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConstraintsDoc {
    pub constraints: BTreeMap<String, StorageConstraint>,
}

// ─── Networking ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceDoc {
    pub name: String,
    #[serde(rename = "is-public")]
    pub is_public: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubnetDoc {
    pub cidr: String,
    #[serde(rename = "providerid")]
    pub provider_id: String,
    #[serde(rename = "vlantag")]
    pub vlan_tag: i64,
    #[serde(rename = "availabilityzone")]
    pub availability_zone: String,
    #[serde(rename = "space-name")]
    pub space_name: String,
}

// ─── Storage ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeInfo {
    #[serde(rename = "hardwareid")]
    pub hardware_id: String,
    pub size: u64,
    pub pool: String,
    #[serde(rename = "volumeid")]
    pub volume_id: String,
    pub persistent: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeParams {
    pub size: u64,
    pub pool: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeDoc {
    pub name: String,
    #[serde(rename = "storageid")]
    pub storage_id: String,
    #[serde(rename = "attachmentcount")]
    pub attachment_count: usize,
    pub info: Option<VolumeInfo>,
    pub params: Option<VolumeParams>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeAttachmentInfo {
    #[serde(rename = "devicename")]
    pub device_name: String,
    #[serde(rename = "devicelink")]
    pub device_link: String,
    #[serde(rename = "busaddress")]
    pub bus_address: String,
    #[serde(rename = "read-only")]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentParams {
    #[serde(rename = "read-only")]
    pub read_only: bool,
    pub location: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeAttachmentDoc {
    #[serde(rename = "volumeid")]
    pub volume: String,
    #[serde(rename = "machineid")]
    pub machine: String,
    pub info: Option<VolumeAttachmentInfo>,
    pub params: Option<AttachmentParams>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemInfo {
    pub size: u64,
    pub pool: String,
    #[serde(rename = "filesystemid")]
    pub filesystem_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemDoc {
    #[serde(rename = "filesystemid")]
    pub filesystem_id: String,
    #[serde(rename = "storageid")]
    pub storage_id: String,
    #[serde(rename = "volumeid")]
    pub volume_id: String,
    #[serde(rename = "attachmentcount")]
    pub attachment_count: usize,
    pub info: Option<FilesystemInfo>,
    pub params: Option<VolumeParams>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemAttachmentInfo {
    #[serde(rename = "mountpoint")]
    pub mount_point: String,
    #[serde(rename = "read-only")]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemAttachmentDoc {
    #[serde(rename = "filesystemid")]
    pub filesystem: String,
    #[serde(rename = "machineid")]
    pub machine: String,
    pub info: Option<FilesystemAttachmentInfo>,
    pub params: Option<AttachmentParams>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageInstanceDoc {
    pub id: String,
    pub kind: i64,
    pub owner: String,
    #[serde(rename = "storagename")]
    pub storage_name: String,
    #[serde(rename = "attachmentcount")]
    pub attachment_count: usize,
}

impl StorageInstanceDoc {
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            1 => "block",
            2 => "filesystem",
            _ => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageAttachmentDoc {
    #[serde(rename = "storageid")]
    pub storage_instance: String,
    #[serde(rename = "unitid")]
    pub unit: String,
}

/// Decode a raw document into one of the typed forms above.
pub fn decode<T: serde::de::DeserializeOwned>(doc: &Document) -> anyhow::Result<T> {
    Ok(serde_json::from_value(Value::Object(doc.clone()))?)
}
