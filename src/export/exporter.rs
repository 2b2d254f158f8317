use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Read;
use tracing;

use super::config::{split_environ_config, storage_pools};
use super::description::{
    Address, AgentTools, Application, BlockDevice, CloudInstance, Constraints, Endpoint, Filesystem,
    FilesystemAttachment, Machine, Model, Relation, Space, Status, Storage, StorageConstraint, Subnet,
    Unit, User, Volume, VolumeAttachment,
};
use super::names::{lxc_id_to_lxd_machine_id, lxc_to_lxd, lxc_to_lxd_instance, rename_sequence, upgrade_tag, user_name};
use crate::error::UpgradeError;
use crate::state::models::{
    parent_id, AddressDoc, AnnotatorDoc, BlockDeviceDoc, CharmDoc, EndpointDoc, FilesystemAttachmentDoc,
    FilesystemDoc, HistoricalStatusDoc, InstanceDataDoc, MachineDoc, MeterStatusDoc, RelationDoc,
    ServiceDoc, StorageConstraintsDoc, ToolsDoc, UnitDoc, VolumeAttachmentDoc, VolumeDoc,
};
use crate::state::source::ENVIRON_GLOBAL_KEY;
use crate::state::{Document, SourceState};

const MAX_STATUS_HISTORY_ENTRIES: usize = 20;

/// v1 had no spaces, so every endpoint lands in the default one.
const DEFAULT_SPACE: &str = "";

// ─── Global keys ────────────────────────────────────────────────────────────

fn machine_key(id: &str) -> String {
    format!("m#{}", id)
}

fn service_key(name: &str) -> String {
    format!("s#{}", name)
}

fn service_settings_key(name: &str, charm_url: &str) -> String {
    format!("s#{}#{}", name, charm_url)
}

fn leadership_settings_key(name: &str) -> String {
    format!("s#{}#leader", name)
}

fn unit_key(name: &str) -> String {
    format!("u#{}#charm", name)
}

fn unit_agent_key(name: &str) -> String {
    format!("u#{}", name)
}

fn volume_key(name: &str) -> String {
    format!("v#{}", name)
}

// ─── Exporter ───────────────────────────────────────────────────────────────

/// Read the v1 environment and describe it as a v2 model.
pub async fn export(st: &SourceState, override_cloud: Option<&str>) -> Result<Model> {
    let mut exporter = Exporter::load(st).await?;
    exporter.run(override_cloud).await?;
    Ok(exporter.model)
}

struct Exporter<'a> {
    st: &'a SourceState,
    now: DateTime<Utc>,
    model: Model,

    annotations: BTreeMap<String, AnnotatorDoc>,
    constraints: BTreeMap<String, Document>,
    settings: BTreeMap<String, Document>,
    storage_constraints: BTreeMap<String, StorageConstraintsDoc>,
    status: BTreeMap<String, Document>,
    status_history: BTreeMap<String, Vec<HistoricalStatusDoc>>,
    units: BTreeMap<String, Vec<UnitDoc>>,
}

impl<'a> Exporter<'a> {
    async fn load(st: &'a SourceState) -> Result<Exporter<'a>> {
        let status = st.statuses().await.context("reading statuses")?;
        tracing::debug!("read {} status documents", status.len());
        let status_history = st.status_history().await?;
        let settings = st.settings().await?;
        let storage_constraints = st.storage_constraints().await?;
        tracing::debug!("read {} storage constraint documents", storage_constraints.len());
        let annotations = st.annotations().await?;
        tracing::debug!("read {} annotations docs", annotations.len());
        let constraints = st
            .constraints()
            .await
            .context("failed to read constraints collection")?;
        tracing::debug!("read {} constraints docs", constraints.len());

        Ok(Exporter {
            st,
            now: Utc::now(),
            model: Model::new(),
            annotations,
            constraints,
            settings,
            storage_constraints,
            status,
            status_history,
            units: BTreeMap::new(),
        })
    }

    async fn run(&mut self, override_cloud: Option<&str>) -> Result<()> {
        self.model.blocks = self.read_blocks().await?;

        let environ_config = self
            .settings
            .get(ENVIRON_GLOBAL_KEY)
            .context("missing model config")
            .context("splitting environ config")?;
        let env = self.st.environment();
        let mut split = split_environ_config(environ_config, &env.owner, &env.uuid)
            .context("splitting environ config")?;
        if let Some(cloud) = override_cloud {
            split.credential.cloud = cloud.to_string();
        }
        self.model.cloud = split.credential.cloud.clone();
        self.model.cloud_region = split.region;
        self.model.owner = split.credential.owner.clone();
        self.model.config = split.model_config;
        self.model.cloud_credential = Some(split.credential);

        self.model.annotations = self.take_annotations(ENVIRON_GLOBAL_KEY);
        self.sequences().await?;
        self.model.constraints = self.constraints_args(ENVIRON_GLOBAL_KEY)?;
        self.model_status();
        self.model_users().await?;
        self.machines().await?;
        self.applications().await?;
        self.relations().await?;
        self.spaces().await?;
        self.subnets().await?;
        // IP addresses in v1 aren't tied to link-layer devices, so none are
        // carried over; v2 rediscovers them.
        self.storage().await?;

        self.model.validate()?;
        self.log_extras();
        Ok(())
    }

    async fn read_blocks(&self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .st
            .blocks()
            .await?
            .into_iter()
            .map(|b| (b.migration_value().to_string(), b.message))
            .collect())
    }

    async fn sequences(&mut self) -> Result<()> {
        for doc in self.st.sequences().await? {
            self.model
                .sequences
                .insert(rename_sequence(&doc.name), doc.counter);
        }
        Ok(())
    }

    fn model_status(&mut self) {
        let status = Status::new("available", self.now);
        self.model.status = Some(status.clone());
        self.model.status_history = vec![status];
    }

    async fn model_users(&mut self) -> Result<()> {
        let users = self.st.env_users().await?;
        let last_connections = self.st.last_connections().await?;
        for user in users {
            let last_connection = last_connections
                .get(&user.user_name.to_lowercase())
                .and_then(|s| parse_time(s));
            self.model.users.push(User {
                name: user_name(&user.user_name),
                display_name: user.display_name.clone(),
                created_by: user_name(&user.created_by),
                date_created: user.date_created.as_deref().and_then(parse_time),
                last_connection,
                // Everyone was an admin in v1.
                access: "admin".to_string(),
            });
        }
        Ok(())
    }

    // ─── Machines ───────────────────────────────────────────────────────

    async fn machines(&mut self) -> Result<()> {
        let machines = self.st.all_machines().await?;
        tracing::debug!("found {} machines", machines.len());
        let instances = self.st.instance_data().await.context("instance data")?;
        tracing::debug!("found {} instanceData", instances.len());
        let block_devices = self.st.block_devices().await.context("block devices")?;
        let opened_ports = self.st.opened_ports().await.context("opened ports")?;
        tracing::debug!("found {} openedPorts docs", opened_ports.len());

        let mut flat: Vec<(String, Option<String>, Machine)> = Vec::with_capacity(machines.len());
        let mut seen: BTreeSet<String> = BTreeSet::new();
        for machine in &machines {
            tracing::debug!("export machine {}", machine.id);
            let parent = parent_id(&machine.id).map(str::to_string);
            if let Some(parent) = &parent {
                if !seen.contains(parent) {
                    return Err(UpgradeError::MissingParent(machine.id.clone()).into());
                }
            }
            let exported = self.new_machine(machine, &instances, &block_devices)?;
            seen.insert(machine.id.clone());
            flat.push((machine.id.clone(), parent, exported));
        }

        self.model.machines = nest_machines(flat);
        Ok(())
    }

    fn new_machine(
        &mut self,
        machine: &MachineDoc,
        instances: &BTreeMap<String, InstanceDataDoc>,
        block_devices: &BTreeMap<String, Vec<BlockDeviceDoc>>,
    ) -> Result<Machine> {
        let mut ex = Machine {
            id: lxc_id_to_lxd_machine_id(&machine.id),
            nonce: machine.nonce.clone(),
            password_hash: machine.password_hash.clone(),
            placement: machine.placement.clone(),
            series: machine.series.clone(),
            container_type: lxc_to_lxd(&machine.container_type).to_string(),
            jobs: vec!["host-units".to_string()],
            ..Default::default()
        };
        if machine.supported_containers_known {
            ex.supported_containers = Some(
                machine
                    .supported_containers
                    .iter()
                    .map(|c| lxc_to_lxd(c).to_string())
                    .collect(),
            );
        }

        ex.machine_addresses = machine.machine_addresses.iter().map(address).collect();
        ex.provider_addresses = machine.addresses.iter().map(address).collect();
        ex.preferred_public_address = Some(address(&machine.preferred_public_address));
        ex.preferred_private_address = Some(address(&machine.preferred_private_address));

        let Some(inst_data) = instances.get(&machine.id) else {
            bail!("missing instance data for machine {}", machine.id);
        };
        let mut instance = self
            .cloud_instance(inst_data)
            .with_context(|| format!("cloud instance args for machine {}", machine.id))?;
        // v1 kept no instance status records.
        let inst_status = Status::new(&inst_data.status, self.now);
        instance.status_history = vec![inst_status.clone()];
        instance.status = Some(inst_status);
        ex.instance = Some(instance);

        for device in block_devices.get(&machine.id).into_iter().flatten() {
            ex.block_devices.push(BlockDevice {
                name: device.device_name.clone(),
                links: device.device_links.clone(),
                label: device.label.clone(),
                uuid: device.uuid.clone(),
                hardware_id: device.hardware_id.clone(),
                bus_address: device.bus_address.clone(),
                size: device.size,
                filesystem_type: device.filesystem_type.clone(),
                in_use: device.in_use,
                mount_point: device.mount_point.clone(),
            });
        }

        let key = machine_key(&machine.id);
        ex.status = Some(
            self.status_args(&key)
                .with_context(|| format!("status for machine {}", machine.id))?,
        );
        ex.status_history = self.status_history_args(&key);

        let Some(tools) = &machine.tools else {
            bail!("agent tools for machine {} not found", machine.id);
        };
        ex.tools = Some(agent_tools(tools));

        // Opened ports are not exported.
        ex.annotations = self.take_annotations(&key);
        ex.constraints = self.constraints_args(&key)?;
        Ok(ex)
    }

    fn cloud_instance(&self, data: &InstanceDataDoc) -> Result<CloudInstance> {
        Ok(CloudInstance {
            instance_id: lxc_to_lxd_instance(self.st.environ_uuid(), &data.instance_id)?,
            architecture: data.arch.clone().unwrap_or_default(),
            memory: data.mem.unwrap_or_default(),
            root_disk: data.root_disk.unwrap_or_default(),
            cpu_cores: data.cpu_cores.unwrap_or_default(),
            cpu_power: data.cpu_power.unwrap_or_default(),
            tags: data.tags.clone().unwrap_or_default(),
            availability_zone: data.avail_zone.clone().unwrap_or_default(),
            status: None,
            status_history: Vec::new(),
        })
    }

    // ─── Applications ───────────────────────────────────────────────────

    async fn applications(&mut self) -> Result<()> {
        let services = self.st.all_services().await?;
        tracing::debug!("found {} services", services.len());
        self.units = self.st.units_by_service().await.context("cannot get all units")?;
        let meter_status = self
            .st
            .meter_status()
            .await
            .context("cannot get all meter status docs")?;
        let leaders = self
            .st
            .service_leaders()
            .await
            .context("failed to read service leaders")?;
        let charms = self.st.charms().await?;

        for service in &services {
            let Some(charm) = charms.get(&service.charm_url) else {
                bail!("charm {:?} for application {:?} not found", service.charm_url, service.name);
            };
            let extras = extra_bindings(self.st, charm).await?;
            let leader = leaders.get(&service.name).cloned().unwrap_or_default();
            self.add_application(service, charm, &extras, &leader, &meter_status)?;
        }
        Ok(())
    }

    fn add_application(
        &mut self,
        service: &ServiceDoc,
        charm: &CharmDoc,
        extra_bindings: &[String],
        leader: &str,
        meter_status: &BTreeMap<String, MeterStatusDoc>,
    ) -> Result<()> {
        let name = &service.name;
        let key = service_key(name);

        let Some(settings) = self.settings.get(&service_settings_key(name, &service.charm_url)) else {
            return Err(UpgradeError::MissingSettings {
                kind: "settings",
                application: name.clone(),
            }
            .into());
        };
        let Some(leadership) = self.settings.get(&leadership_settings_key(name)) else {
            return Err(UpgradeError::MissingSettings {
                kind: "leadership settings",
                application: name.clone(),
            }
            .into());
        };

        let mut bindings = BTreeMap::new();
        for endpoint in charm.meta.endpoint_names() {
            if endpoint != "juju-info" {
                bindings.insert(endpoint, DEFAULT_SPACE.to_string());
            }
        }
        for extra in extra_bindings {
            bindings.insert(extra.clone(), DEFAULT_SPACE.to_string());
        }

        let mut app = Application {
            name: name.clone(),
            series: service.series.clone(),
            subordinate: service.subordinate,
            charm_url: service.charm_url.clone(),
            force_charm: service.force_charm,
            exposed: service.exposed,
            min_units: service.min_units,
            settings: settings.clone(),
            leader: leader.to_string(),
            leadership_settings: leadership.clone(),
            metrics_creds: service.metric_credentials.clone().filter(|c| !c.is_empty()),
            endpoint_bindings: bindings,
            ..Default::default()
        };
        if let Some(constraints) = self.storage_constraints.get(&key) {
            app.storage_constraints = constraints
                .constraints
                .iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        StorageConstraint {
                            pool: v.pool.clone(),
                            size: v.size,
                            count: v.count,
                        },
                    )
                })
                .collect();
        }

        tracing::debug!("Adding application {:?}", name);
        app.status = Some(
            self.status_args(&key)
                .with_context(|| format!("status for application {}", name))?,
        );
        app.status_history = self.status_history_args(&key);
        app.annotations = self.take_annotations(&key);
        app.constraints = self.constraints_args(&key)?;

        let units = self.units.get(name).cloned().unwrap_or_default();
        for unit in &units {
            app.units.push(self.new_unit(unit, meter_status)?);
        }

        self.model.applications.push(app);
        Ok(())
    }

    fn new_unit(&mut self, unit: &UnitDoc, meter_status: &BTreeMap<String, MeterStatusDoc>) -> Result<Unit> {
        let agent_key = unit_agent_key(&unit.name);
        let Some(meter) = meter_status.get(&agent_key) else {
            bail!("missing meter status for unit {}", unit.name);
        };

        let mut ex = Unit {
            name: unit.name.clone(),
            machine: lxc_id_to_lxd_machine_id(&unit.machine_id),
            principal: unit.principal.clone(),
            subordinates: unit.subordinates.clone(),
            password_hash: unit.password_hash.clone(),
            meter_status_code: meter.code.clone(),
            meter_status_info: meter.info.clone(),
            ..Default::default()
        };
        tracing::debug!("Adding unit {:?}", unit.name);

        // Payloads are not exported.
        let key = unit_key(&unit.name);
        ex.workload_status = Some(
            self.status_args(&key)
                .with_context(|| format!("workload status for unit {}", unit.name))?,
        );
        ex.workload_status_history = self.status_history_args(&key);
        ex.agent_status = Some(
            self.status_args(&agent_key)
                .with_context(|| format!("agent status for unit {}", unit.name))?,
        );
        ex.agent_status_history = self.status_history_args(&agent_key);

        let Some(tools) = &unit.tools else {
            bail!("agent tools for unit {} not found", unit.name);
        };
        ex.tools = Some(agent_tools(tools));
        ex.annotations = self.take_annotations(&key);
        ex.constraints = self.constraints_args(&agent_key)?;
        Ok(ex)
    }

    // ─── Relations ──────────────────────────────────────────────────────

    async fn relations(&mut self) -> Result<()> {
        let relations = self.st.all_relations().await?;
        tracing::debug!("read {} relations", relations.len());
        let scopes = self
            .st
            .relation_scopes()
            .await
            .context("cannot get all relation scopes")?;
        tracing::debug!("found {} relationScope docs", scopes.len());

        for relation in &relations {
            let mut ex = Relation {
                id: relation.id,
                key: relation.key.clone(),
                endpoints: Vec::new(),
            };
            for ep in &relation.endpoints {
                let mut ex_ep = Endpoint {
                    application_name: ep.service_name.clone(),
                    name: ep.relation.name.clone(),
                    role: ep.relation.role.clone(),
                    interface: ep.relation.interface.clone(),
                    optional: ep.relation.optional,
                    limit: ep.relation.limit,
                    scope: ep.relation.scope.clone(),
                    unit_settings: BTreeMap::new(),
                };
                for unit in self.units.get(&ep.service_name).into_iter().flatten() {
                    if !relation_unit_valid(relation, ep, unit) {
                        // e.g. a subordinate related to two different
                        // principals.
                        continue;
                    }
                    let key = relation_unit_key(relation, ep, unit);
                    if !scopes.contains(&key) {
                        bail!("missing relation scope for {} and {}", relation.key, unit.name);
                    }
                    let Some(settings) = self.settings.get(&key) else {
                        bail!("missing relation settings for {} and {}", relation.key, unit.name);
                    };
                    ex_ep.unit_settings.insert(unit.name.clone(), settings.clone());
                }
                ex.endpoints.push(ex_ep);
            }
            self.model.relations.push(ex);
        }
        Ok(())
    }

    // ─── Networking ─────────────────────────────────────────────────────

    async fn spaces(&mut self) -> Result<()> {
        let spaces = self.st.all_spaces().await?;
        tracing::debug!("read {} spaces", spaces.len());
        for space in spaces {
            self.model.spaces.push(Space {
                name: space.name,
                public: space.is_public,
            });
        }
        Ok(())
    }

    async fn subnets(&mut self) -> Result<()> {
        let subnets = self.st.all_subnets().await?;
        tracing::debug!("read {} subnets", subnets.len());
        for subnet in subnets {
            let zones = if subnet.availability_zone.is_empty() {
                Vec::new()
            } else {
                vec![subnet.availability_zone]
            };
            self.model.subnets.push(Subnet {
                cidr: subnet.cidr,
                provider_id: subnet.provider_id,
                vlan_tag: subnet.vlan_tag,
                availability_zones: zones,
                space_name: subnet.space_name,
            });
        }
        Ok(())
    }

    // ─── Storage ────────────────────────────────────────────────────────

    async fn storage(&mut self) -> Result<()> {
        self.volumes().await?;
        self.filesystems().await?;
        self.storage_instances().await?;
        let cloud_type = self.model.cloud_type().unwrap_or_default().to_string();
        self.model.storage_pools = storage_pools(&self.settings, &cloud_type);
        Ok(())
    }

    async fn volumes(&mut self) -> Result<()> {
        let mut attachments = self
            .st
            .volume_attachments()
            .await
            .context("failed to read volumes attachments")?;
        for doc in self.st.volumes().await.context("failed to read volumes")? {
            let atts = attachments.remove(&doc.name).unwrap_or_default();
            self.add_volume(&doc, &atts)?;
        }
        Ok(())
    }

    fn add_volume(&mut self, doc: &VolumeDoc, attachments: &[VolumeAttachmentDoc]) -> Result<()> {
        tracing::debug!("addVolume: {:?}", doc);
        let mut ex = Volume {
            id: doc.name.clone(),
            storage_id: doc.storage_id.clone(),
            ..Default::default()
        };
        match (&doc.info, &doc.params) {
            (Some(info), _) => {
                ex.provisioned = true;
                ex.size = info.size;
                ex.pool = info.pool.clone();
                ex.hardware_id = info.hardware_id.clone();
                ex.volume_id = info.volume_id.clone();
                ex.persistent = info.persistent;
            }
            (None, Some(params)) => {
                ex.size = params.size;
                ex.pool = params.pool.clone();
            }
            (None, None) => {}
        }

        let key = volume_key(&doc.name);
        ex.status = Some(
            self.status_args(&key)
                .with_context(|| format!("status for volume {}", doc.name))?,
        );
        ex.status_history = self.status_history_args(&key);

        if attachments.len() != doc.attachment_count {
            bail!(
                "volume attachment count mismatch, have {}, expected {}",
                attachments.len(),
                doc.attachment_count
            );
        }
        for att in attachments {
            let mut ex_att = VolumeAttachment {
                machine_id: lxc_id_to_lxd_machine_id(&att.machine),
                ..Default::default()
            };
            match (&att.info, &att.params) {
                (Some(info), _) => {
                    ex_att.provisioned = true;
                    ex_att.read_only = info.read_only;
                    ex_att.device_name = info.device_name.clone();
                    ex_att.device_link = info.device_link.clone();
                    ex_att.bus_address = info.bus_address.clone();
                }
                (None, Some(params)) => ex_att.read_only = params.read_only,
                (None, None) => {}
            }
            ex.attachments.push(ex_att);
        }
        self.model.volumes.push(ex);
        Ok(())
    }

    async fn filesystems(&mut self) -> Result<()> {
        let mut attachments = self
            .st
            .filesystem_attachments()
            .await
            .context("failed to read filesystem attachments")?;
        for doc in self.st.filesystems().await.context("failed to read filesystems")? {
            let atts = attachments.remove(&doc.filesystem_id).unwrap_or_default();
            self.add_filesystem(&doc, &atts)?;
        }
        Ok(())
    }

    fn add_filesystem(&mut self, doc: &FilesystemDoc, attachments: &[FilesystemAttachmentDoc]) -> Result<()> {
        tracing::debug!("addFilesystem: {:?}", doc);
        let mut ex = Filesystem {
            id: doc.filesystem_id.clone(),
            storage_id: doc.storage_id.clone(),
            volume_id: doc.volume_id.clone(),
            // No filesystem status in v1.
            status: Some(Status::new("unknown", self.now)),
            ..Default::default()
        };
        match (&doc.info, &doc.params) {
            (Some(info), _) => {
                ex.provisioned = true;
                ex.size = info.size;
                ex.pool = info.pool.clone();
                ex.filesystem_id = info.filesystem_id.clone();
            }
            (None, Some(params)) => {
                ex.size = params.size;
                ex.pool = params.pool.clone();
            }
            (None, None) => {}
        }

        if attachments.len() != doc.attachment_count {
            bail!(
                "filesystem attachment count mismatch, have {}, expected {}",
                attachments.len(),
                doc.attachment_count
            );
        }
        for att in attachments {
            let mut ex_att = FilesystemAttachment {
                machine_id: lxc_id_to_lxd_machine_id(&att.machine),
                ..Default::default()
            };
            match (&att.info, &att.params) {
                (Some(info), _) => {
                    ex_att.provisioned = true;
                    ex_att.read_only = info.read_only;
                    ex_att.mount_point = info.mount_point.clone();
                }
                (None, Some(params)) => {
                    ex_att.read_only = params.read_only;
                    ex_att.mount_point = params.location.clone();
                }
                (None, None) => {}
            }
            ex.attachments.push(ex_att);
        }
        self.model.filesystems.push(ex);
        Ok(())
    }

    async fn storage_instances(&mut self) -> Result<()> {
        let mut attachments = self
            .st
            .storage_attachments()
            .await
            .context("failed to read storage attachments")?;
        for doc in self
            .st
            .storage_instances()
            .await
            .context("failed to read storage instances")?
        {
            self.model.storages.push(Storage {
                id: doc.id.clone(),
                kind: doc.kind_name().to_string(),
                owner: upgrade_tag(&doc.owner),
                name: doc.storage_name.clone(),
                attachments: attachments.remove(&doc.id).unwrap_or_default(),
            });
        }
        Ok(())
    }

    // ─── Shared records ─────────────────────────────────────────────────

    /// Annotations are removed as they are exported, so anything left over
    /// at the end was missed.
    fn take_annotations(&mut self, key: &str) -> BTreeMap<String, String> {
        self.annotations
            .remove(key)
            .map(|doc| doc.annotations)
            .unwrap_or_default()
    }

    fn log_extras(&self) {
        for (key, doc) in &self.annotations {
            tracing::warn!("unexported annotation for {}, {}", doc.tag, key);
        }
    }

    fn status_args(&self, key: &str) -> Result<Status> {
        let Some(doc) = self.status.get(key) else {
            bail!("status data for {} not found", key);
        };
        status_from_doc(doc, self.now)
    }

    fn status_history_args(&self, key: &str) -> Vec<Status> {
        let history = self.status_history.get(key).map(Vec::as_slice).unwrap_or_default();
        tracing::debug!("found {} status history docs for {}", history.len(), key);
        history
            .iter()
            .take(MAX_STATUS_HISTORY_ENTRIES)
            .map(|doc| Status {
                value: doc.status.clone(),
                message: doc.status_info.clone(),
                data: doc.status_data.clone(),
                updated: Utc.timestamp_nanos(doc.updated),
            })
            .collect()
    }

    fn constraints_args(&self, key: &str) -> Result<Constraints> {
        match self.constraints.get(key) {
            Some(doc) => constraints_from_doc(doc),
            None => {
                tracing::debug!("no constraints found for key {:?}", key);
                Ok(Constraints::default())
            }
        }
    }
}

// ─── Conversions ────────────────────────────────────────────────────────────

/// Put containers under their hosts. Parents always precede their
/// containers in `flat`.
fn nest_machines(flat: Vec<(String, Option<String>, Machine)>) -> Vec<Machine> {
    let mut children: HashMap<String, Vec<Machine>> = HashMap::new();
    let mut roots = Vec::new();
    for (id, parent, mut machine) in flat.into_iter().rev() {
        if let Some(mut kids) = children.remove(&id) {
            kids.reverse();
            machine.containers = kids;
        }
        match parent {
            Some(parent) => children.entry(parent).or_default().push(machine),
            None => roots.push(machine),
        }
    }
    roots.reverse();
    roots
}

fn address(a: &AddressDoc) -> Address {
    Address {
        value: a.value.clone(),
        address_type: a.address_type.clone(),
        scope: a.scope.clone(),
        origin: a.origin.clone(),
    }
}

fn agent_tools(t: &ToolsDoc) -> AgentTools {
    AgentTools {
        version: t.version.clone(),
        url: t.url.clone(),
        sha256: t.sha256.clone(),
        size: t.size,
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Status document fields, with a missing update time meaning now.
pub fn status_from_doc(doc: &Document, now: DateTime<Utc>) -> Result<Status> {
    let value = match doc.get("status") {
        Some(Value::String(s)) => s.clone(),
        other => bail!("expected string for status, got {}", type_name(other)),
    };
    let message = match doc.get("statusinfo") {
        Some(Value::String(s)) => s.clone(),
        other => bail!("expected string for statusinfo, got {}", type_name(other)),
    };
    let data = match doc.get("statusdata") {
        Some(Value::Object(m)) => m.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        None | Some(Value::Null) => BTreeMap::new(),
        other => bail!("expected map for data, got {}", type_name(other)),
    };
    let updated = match doc.get("updated") {
        None | Some(Value::Null) => now,
        Some(Value::Number(n)) if n.is_i64() => Utc.timestamp_nanos(n.as_i64().unwrap_or_default()),
        other => bail!("expected int64 for updated, got {}", type_name(other)),
    };
    Ok(Status {
        value,
        message,
        data,
        updated,
    })
}

pub fn constraints_from_doc(doc: &Document) -> Result<Constraints> {
    let optional_string = |name: &str| -> Result<String> {
        match doc.get(name) {
            None | Some(Value::Null) => Ok(String::new()),
            Some(Value::String(s)) => Ok(s.clone()),
            other => bail!("expected string for {}, got {}", name, type_name(other)),
        }
    };
    let optional_int = |name: &str| -> Result<u64> {
        match doc.get(name) {
            None | Some(Value::Null) => Ok(0),
            Some(Value::Number(n)) => match (n.as_u64(), n.as_i64()) {
                (Some(u), _) => Ok(u),
                (None, Some(i)) => Ok(i as u64),
                _ => bail!("expected uint64 for {}, got float", name),
            },
            other => bail!("expected uint64 for {}, got {}", name, type_name(other)),
        }
    };
    let optional_strings = |name: &str| -> Result<Vec<String>> {
        match doc.get(name) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(i, item)| match item {
                    Value::String(s) => Ok(s.clone()),
                    other => bail!(
                        "expected []string for {}, but got {} at pos {}",
                        name,
                        type_name(Some(other)),
                        i
                    ),
                })
                .collect(),
            other => bail!("expected []string for {}, got {}", name, type_name(other)),
        }
    };

    Ok(Constraints {
        architecture: optional_string("arch")?,
        container: optional_string("container")?,
        cpu_cores: optional_int("cpucores")?,
        cpu_power: optional_int("cpupower")?,
        instance_type: optional_string("instancetype")?,
        memory: optional_int("mem")?,
        root_disk: optional_int("rootdisk")?,
        spaces: optional_strings("spaces")?,
        tags: optional_strings("tags")?,
    })
}

fn type_name(v: Option<&Value>) -> &'static str {
    match v {
        None | Some(Value::Null) => "nil",
        Some(Value::Bool(_)) => "bool",
        Some(Value::Number(_)) => "number",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(Value::Object(_)) => "map",
    }
}

// ─── Relation units ─────────────────────────────────────────────────────────

fn principal_application(unit: &UnitDoc) -> Option<&str> {
    if unit.principal.is_empty() {
        None
    } else {
        unit.principal.split('/').next()
    }
}

/// A container-scoped relation only makes sense for a subordinate unit when
/// the relation involves that unit's principal.
pub fn relation_unit_valid(relation: &RelationDoc, ep: &EndpointDoc, unit: &UnitDoc) -> bool {
    if ep.relation.scope != "container" {
        return true;
    }
    let Some(principal_app) = principal_application(unit) else {
        return true;
    };
    relation
        .endpoints
        .iter()
        .any(|other| other.service_name == principal_app)
}

/// Key of a unit's scope document and settings in a relation.
pub fn relation_unit_key(relation: &RelationDoc, ep: &EndpointDoc, unit: &UnitDoc) -> String {
    let mut scope = format!("r#{}", relation.id);
    if ep.relation.scope == "container" {
        let container = if unit.principal.is_empty() {
            &unit.name
        } else {
            &unit.principal
        };
        scope.push('#');
        scope.push_str(container);
    }
    format!("{}#{}#{}", scope, ep.relation.role, unit.name)
}

// ─── Charm metadata ─────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
struct ExtraBindingsMeta {
    #[serde(rename = "extra-bindings", default)]
    extra_bindings: BTreeMap<String, serde_yaml::Value>,
}

/// Extra bindings aren't in the database; they are only in the charm
/// archive's `metadata.yaml`.
async fn extra_bindings(st: &SourceState, charm: &CharmDoc) -> Result<Vec<String>> {
    let archive = st.charm_archive(charm).await?;
    let mut zip = zip::ZipArchive::new(std::io::Cursor::new(archive))
        .with_context(|| format!("opening charm archive {}", charm.url))?;

    let content = match zip.by_name("metadata.yaml") {
        Ok(mut file) => {
            let mut content = String::new();
            file.read_to_string(&mut content)
                .with_context(|| format!("reading metadata.yaml from {}", charm.url))?;
            content
        }
        Err(zip::result::ZipError::FileNotFound) => {
            tracing::warn!("no metadata file in {:?} charm!", charm.meta.name);
            return Ok(Vec::new());
        }
        Err(e) => return Err(e).with_context(|| format!("reading charm archive {}", charm.url)),
    };

    match serde_yaml::from_str::<ExtraBindingsMeta>(&content) {
        Ok(meta) => Ok(meta.extra_bindings.into_keys().collect()),
        Err(e) => {
            tracing::warn!("couldn't parse metadata.yaml for {:?}: {}", charm.meta.name, e);
            Ok(Vec::new())
        }
    }
}
