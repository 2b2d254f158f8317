use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing;

use super::backend::{compare_ids, doc_id, Document, SourceDb};
use super::models::*;
use super::mongo::unescape_key;
use crate::executor::FlatMachine;

/// v1 collection names.
pub mod collections {
    pub const ENVIRONMENTS: &str = "environments";
    pub const ENV_USERS: &str = "envusers";
    pub const LAST_CONNECTIONS: &str = "envUserLastConnection";
    pub const MACHINES: &str = "machines";
    pub const INSTANCE_DATA: &str = "instanceData";
    pub const SERVICES: &str = "services";
    pub const UNITS: &str = "units";
    pub const CHARMS: &str = "charms";
    pub const RELATIONS: &str = "relations";
    pub const RELATION_SCOPES: &str = "relationscopes";
    pub const SETTINGS: &str = "settings";
    pub const STATUSES: &str = "statuses";
    pub const STATUS_HISTORY: &str = "statuseshistory";
    pub const ANNOTATIONS: &str = "annotations";
    pub const CONSTRAINTS: &str = "constraints";
    pub const SEQUENCE: &str = "sequence";
    pub const BLOCKS: &str = "blocks";
    pub const STORAGE_CONSTRAINTS: &str = "storageconstraints";
    pub const LEASES: &str = "leases";
    pub const OPENED_PORTS: &str = "openedPorts";
    pub const BLOCK_DEVICES: &str = "blockdevices";
    pub const METER_STATUS: &str = "meterStatus";
    pub const SPACES: &str = "spaces";
    pub const SUBNETS: &str = "subnets";
    pub const VOLUMES: &str = "volumes";
    pub const VOLUME_ATTACHMENTS: &str = "volumeattachments";
    pub const FILESYSTEMS: &str = "filesystems";
    pub const FILESYSTEM_ATTACHMENTS: &str = "filesystemAttachments";
    pub const STORAGE_INSTANCES: &str = "storageinstances";
    pub const STORAGE_ATTACHMENTS: &str = "storageattachments";
}

use collections as c;

/// Settings document key for the environ config.
pub const ENVIRON_GLOBAL_KEY: &str = "e";

/// Fields that are database bookkeeping rather than settings.
const SETTINGS_BOOKKEEPING: &[&str] = &["_id", "env-uuid", "txn-revno", "txn-queue"];

// ─── SourceState ────────────────────────────────────────────────────────────

/// Typed, environment-scoped views over a v1 state database.
#[derive(Clone)]
pub struct SourceState {
    db: Arc<dyn SourceDb>,
    env: EnvironmentDoc,
}

impl SourceState {
    /// Pick the environment to work on. With no uuid given there must be
    /// exactly one.
    pub async fn open(db: Arc<dyn SourceDb>, env_uuid: Option<&str>) -> Result<Self> {
        let envs: Vec<EnvironmentDoc> = db
            .collection(c::ENVIRONMENTS)
            .await?
            .iter()
            .map(decode)
            .collect::<Result<_>>()
            .context("reading environments")?;

        let env = match env_uuid {
            Some(uuid) => envs.into_iter().find(|e| e.uuid == uuid),
            None if envs.len() == 1 => envs.into_iter().next(),
            None if envs.is_empty() => None,
            None => bail!("{} environments in state, cannot pick one", envs.len()),
        };
        let Some(env) = env else {
            bail!("environment {:?} not found in state", env_uuid.unwrap_or(""));
        };
        tracing::debug!(env = %env.name, uuid = %env.uuid, "Opened source state");
        Ok(Self { db, env })
    }

    pub fn db(&self) -> &dyn SourceDb {
        self.db.as_ref()
    }

    pub fn environment(&self) -> &EnvironmentDoc {
        &self.env
    }

    pub fn environ_uuid(&self) -> &str {
        &self.env.uuid
    }

    /// `<uuid>:key` → `key`. Ids of other shapes are returned unchanged.
    pub fn local_id<'a>(&self, id: &'a str) -> &'a str {
        id.strip_prefix(self.env.uuid.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(id)
    }

    /// Documents of a collection that belong to this environment.
    pub async fn raw(&self, collection: &str) -> Result<Vec<Document>> {
        let docs = self
            .db
            .collection(collection)
            .await
            .with_context(|| format!("reading {}", collection))?;
        Ok(docs
            .into_iter()
            .filter(|d| match d.get("env-uuid").and_then(Value::as_str) {
                Some(uuid) => uuid == self.env.uuid,
                None => true,
            })
            .collect())
    }

    pub async fn docs<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
        self.raw(collection)
            .await?
            .iter()
            .map(decode)
            .collect::<Result<_>>()
            .with_context(|| format!("decoding {}", collection))
    }

    /// Raw documents keyed by local id.
    async fn keyed(&self, collection: &str) -> Result<BTreeMap<String, Document>> {
        let mut result = BTreeMap::new();
        for doc in self.raw(collection).await? {
            let Some(id) = doc_id(&doc) else {
                bail!("expected string, got {:?} in {}", doc.get("_id"), collection);
            };
            let id = self.local_id(id).to_string();
            result.insert(id, doc);
        }
        Ok(result)
    }

    // ─── Machines ───────────────────────────────────────────────────────

    /// All machines, parents before their containers.
    pub async fn all_machines(&self) -> Result<Vec<MachineDoc>> {
        let mut machines: Vec<MachineDoc> = self.docs(c::MACHINES).await?;
        machines.sort_by(|a, b| machine_sort_key(&a.id).cmp(&machine_sort_key(&b.id)));
        Ok(machines)
    }

    pub async fn machine(&self, id: &str) -> Result<MachineDoc> {
        self.all_machines()
            .await?
            .into_iter()
            .find(|m| m.id == id)
            .with_context(|| format!("machine {} not found", id))
    }

    pub async fn instance_data(&self) -> Result<BTreeMap<String, InstanceDataDoc>> {
        let docs: Vec<InstanceDataDoc> = self.docs(c::INSTANCE_DATA).await?;
        Ok(docs.into_iter().map(|d| (d.machine_id.clone(), d)).collect())
    }

    pub async fn block_devices(&self) -> Result<BTreeMap<String, Vec<BlockDeviceDoc>>> {
        let docs: Vec<BlockDevicesDoc> = self.docs(c::BLOCK_DEVICES).await?;
        Ok(docs
            .into_iter()
            .map(|d| (d.machine_id, d.block_devices))
            .collect())
    }

    pub async fn opened_ports(&self) -> Result<Vec<Document>> {
        self.raw(c::OPENED_PORTS).await
    }

    /// Every machine flattened for remote execution. Containers carry their
    /// host's address so sessions can be proxied.
    pub async fn flat_machines(&self) -> Result<Vec<FlatMachine>> {
        let machines = self.all_machines().await?;
        let instances = self.instance_data().await?;
        let mut addresses: BTreeMap<&str, String> = BTreeMap::new();
        let mut result = Vec::with_capacity(machines.len());

        for (i, m) in machines.iter().enumerate() {
            let Some(address) = m.ssh_address() else {
                bail!("address for machine {:?}: no private nor public address", m.id);
            };
            addresses.insert(&m.id, address.to_string());

            let host_address = match parent_id(&m.id) {
                Some(parent) => Some(
                    addresses
                        .get(parent)
                        .cloned()
                        .with_context(|| format!("machine {} missing parent", m.id))?,
                ),
                None => None,
            };
            let fm = FlatMachine {
                model: self.env.uuid.clone(),
                series: m.series.clone(),
                id: m.id.clone(),
                instance_id: instances
                    .get(&m.id)
                    .map(|d| d.instance_id.clone())
                    .unwrap_or_default(),
                address: address.to_string(),
                tools: m.tools.as_ref().map(|t| t.version.clone()).unwrap_or_default(),
                host_address,
            };
            tracing::debug!("{}: {:?}", i, fm);
            result.push(fm);
        }
        Ok(result)
    }

    // ─── Applications ───────────────────────────────────────────────────

    pub async fn all_services(&self) -> Result<Vec<ServiceDoc>> {
        let mut services: Vec<ServiceDoc> = self.docs(c::SERVICES).await?;
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }

    /// Units grouped by application, sorted by name within each.
    pub async fn units_by_service(&self) -> Result<BTreeMap<String, Vec<UnitDoc>>> {
        let mut units: Vec<UnitDoc> = self.docs(c::UNITS).await?;
        units.sort_by(|a, b| a.name.cmp(&b.name));
        let mut result: BTreeMap<String, Vec<UnitDoc>> = BTreeMap::new();
        for unit in units {
            result.entry(unit.service.clone()).or_default().push(unit);
        }
        Ok(result)
    }

    pub async fn charms(&self) -> Result<BTreeMap<String, CharmDoc>> {
        let docs: Vec<CharmDoc> = self.docs(c::CHARMS).await?;
        Ok(docs
            .into_iter()
            .map(|d| (self.local_id(&d.url).to_string(), d))
            .map(|(url, mut d)| {
                d.url = url.clone();
                (url, d)
            })
            .collect())
    }

    /// The archive behind a charm, from the blob store.
    pub async fn charm_archive(&self, charm: &CharmDoc) -> Result<Vec<u8>> {
        self.db
            .blob(&self.env.uuid, &charm.storage_path)
            .await
            .with_context(|| format!("reading charm {}", charm.url))
    }

    pub async fn meter_status(&self) -> Result<BTreeMap<String, MeterStatusDoc>> {
        self.keyed(c::METER_STATUS)
            .await?
            .iter()
            .map(|(k, d)| Ok((k.clone(), decode(d)?)))
            .collect()
    }

    /// Application name → leader unit, from the lease documents.
    pub async fn service_leaders(&self) -> Result<BTreeMap<String, String>> {
        let mut leaders = BTreeMap::new();
        for doc in self.raw(c::LEASES).await? {
            let namespace = doc.get("namespace").and_then(Value::as_str);
            let kind = doc.get("type").and_then(Value::as_str);
            if namespace != Some("service-leadership") || kind != Some("lease") {
                continue;
            }
            match (
                doc.get("name").and_then(Value::as_str),
                doc.get("holder").and_then(Value::as_str),
            ) {
                (Some(name), Some(holder)) => {
                    leaders.insert(name.to_string(), holder.to_string());
                }
                _ => tracing::warn!("bad leadership doc {:?}", doc),
            }
        }
        Ok(leaders)
    }

    pub async fn storage_constraints(&self) -> Result<BTreeMap<String, StorageConstraintsDoc>> {
        self.keyed(c::STORAGE_CONSTRAINTS)
            .await?
            .iter()
            .map(|(k, d)| Ok((k.clone(), decode(d)?)))
            .collect()
    }

    // ─── Relations ──────────────────────────────────────────────────────

    pub async fn all_relations(&self) -> Result<Vec<RelationDoc>> {
        let mut relations: Vec<RelationDoc> = self.docs(c::RELATIONS).await?;
        relations.sort_by_key(|r| r.id);
        Ok(relations)
    }

    pub async fn relation_scopes(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .raw(c::RELATION_SCOPES)
            .await?
            .iter()
            .filter_map(|d| d.get("key").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    // ─── Model records ──────────────────────────────────────────────────

    /// Settings documents keyed by local id, with bookkeeping fields removed
    /// and escaped keys restored.
    pub async fn settings(&self) -> Result<BTreeMap<String, Document>> {
        let mut result = BTreeMap::new();
        for (id, doc) in self.keyed(c::SETTINGS).await? {
            result.insert(id, clean_settings(doc));
        }
        Ok(result)
    }

    pub async fn environ_config(&self) -> Result<Document> {
        let mut settings = self.settings().await?;
        settings
            .remove(ENVIRON_GLOBAL_KEY)
            .context("missing model config")
    }

    pub async fn update_environ_config(&self, attrs: &Document) -> Result<()> {
        self.db.update_environ_config(&self.env.uuid, attrs).await
    }

    pub async fn statuses(&self) -> Result<BTreeMap<String, Document>> {
        self.keyed(c::STATUSES).await
    }

    /// History per global key, newest first.
    pub async fn status_history(&self) -> Result<BTreeMap<String, Vec<HistoricalStatusDoc>>> {
        let mut raw = self.raw(c::STATUS_HISTORY).await?;
        raw.sort_by(|a, b| {
            let ua = a.get("updated").and_then(Value::as_i64).unwrap_or(0);
            let ub = b.get("updated").and_then(Value::as_i64).unwrap_or(0);
            ub.cmp(&ua).then_with(|| compare_ids(b, a))
        });
        let mut result: BTreeMap<String, Vec<HistoricalStatusDoc>> = BTreeMap::new();
        for doc in &raw {
            let doc: HistoricalStatusDoc = decode(doc)?;
            result.entry(doc.global_key.clone()).or_default().push(doc);
        }
        Ok(result)
    }

    pub async fn annotations(&self) -> Result<BTreeMap<String, AnnotatorDoc>> {
        let docs: Vec<AnnotatorDoc> = self.docs(c::ANNOTATIONS).await?;
        Ok(docs
            .into_iter()
            .map(|d| (d.global_key.clone(), d))
            .collect())
    }

    pub async fn constraints(&self) -> Result<BTreeMap<String, Document>> {
        self.keyed(c::CONSTRAINTS).await
    }

    pub async fn sequences(&self) -> Result<Vec<SequenceDoc>> {
        let mut docs: Vec<SequenceDoc> = self.docs(c::SEQUENCE).await?;
        docs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(docs)
    }

    pub async fn blocks(&self) -> Result<Vec<BlockDoc>> {
        self.docs(c::BLOCKS).await
    }

    pub async fn env_users(&self) -> Result<Vec<EnvUserDoc>> {
        let mut users: Vec<EnvUserDoc> = self.docs(c::ENV_USERS).await?;
        users.sort_by(|a, b| a.user_name.cmp(&b.user_name));
        Ok(users)
    }

    /// Lower-cased user name → last connection time.
    pub async fn last_connections(&self) -> Result<BTreeMap<String, String>> {
        let docs: Vec<LastConnectionDoc> = self.docs(c::LAST_CONNECTIONS).await?;
        Ok(docs
            .into_iter()
            .filter_map(|d| Some((d.user_name.to_lowercase(), d.last_connection?)))
            .collect())
    }

    pub async fn all_spaces(&self) -> Result<Vec<SpaceDoc>> {
        self.docs(c::SPACES).await
    }

    pub async fn all_subnets(&self) -> Result<Vec<SubnetDoc>> {
        self.docs(c::SUBNETS).await
    }

    // ─── Storage ────────────────────────────────────────────────────────

    pub async fn volumes(&self) -> Result<Vec<VolumeDoc>> {
        self.sorted_docs(c::VOLUMES).await
    }

    pub async fn volume_attachments(&self) -> Result<BTreeMap<String, Vec<VolumeAttachmentDoc>>> {
        let docs: Vec<VolumeAttachmentDoc> = self.docs(c::VOLUME_ATTACHMENTS).await?;
        let mut result: BTreeMap<String, Vec<VolumeAttachmentDoc>> = BTreeMap::new();
        for doc in docs {
            result.entry(doc.volume.clone()).or_default().push(doc);
        }
        Ok(result)
    }

    pub async fn filesystems(&self) -> Result<Vec<FilesystemDoc>> {
        self.sorted_docs(c::FILESYSTEMS).await
    }

    pub async fn filesystem_attachments(
        &self,
    ) -> Result<BTreeMap<String, Vec<FilesystemAttachmentDoc>>> {
        let docs: Vec<FilesystemAttachmentDoc> = self.docs(c::FILESYSTEM_ATTACHMENTS).await?;
        let mut result: BTreeMap<String, Vec<FilesystemAttachmentDoc>> = BTreeMap::new();
        for doc in docs {
            result.entry(doc.filesystem.clone()).or_default().push(doc);
        }
        Ok(result)
    }

    pub async fn storage_instances(&self) -> Result<Vec<StorageInstanceDoc>> {
        self.sorted_docs(c::STORAGE_INSTANCES).await
    }

    /// Storage instance id → attached unit names.
    pub async fn storage_attachments(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let docs: Vec<StorageAttachmentDoc> = self.docs(c::STORAGE_ATTACHMENTS).await?;
        let mut result: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for doc in docs {
            result.entry(doc.storage_instance).or_default().push(doc.unit);
        }
        Ok(result)
    }

    async fn sorted_docs<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
        let mut raw = self.raw(collection).await?;
        raw.sort_by(compare_ids);
        raw.iter()
            .map(decode)
            .collect::<Result<_>>()
            .with_context(|| format!("decoding {}", collection))
    }
}

/// Drop bookkeeping fields and restore `.` and `$` in keys.
pub fn clean_settings(doc: Document) -> Document {
    doc.into_iter()
        .filter(|(k, _)| !SETTINGS_BOOKKEEPING.contains(&k.as_str()))
        .map(|(k, v)| (unescape_key(&k), v))
        .collect()
}

/// Machine ids sort numerically per segment, so `2` < `10` and every parent
/// sorts before its containers.
pub fn machine_sort_key(id: &str) -> Vec<(u64, String)> {
    id.split('/')
        .map(|part| match part.parse::<u64>() {
            Ok(n) => (n, String::new()),
            Err(_) => (u64::MAX, part.to_string()),
        })
        .collect()
}
