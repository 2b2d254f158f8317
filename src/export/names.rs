use anyhow::{bail, Context, Result};
use regex::Regex;
use std::sync::OnceLock;

use crate::config::agent::MachineTag;

/// v1 container type token and its v2 replacement.
pub const LXC: &str = "lxc";
pub const LXD: &str = "lxd";

fn machine_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(0|[1-9]\d*)(/[a-z]+/(0|[1-9]\d*))*$").expect("valid regex"))
}

fn service_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^service-([a-z][a-z0-9]*(-[a-z0-9]*[a-z][a-z0-9]*)*)$").expect("valid regex")
    })
}

fn lxc_sequence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^machine(\d+)lxcContainer$").expect("valid regex"))
}

pub fn lxc_to_lxd(container_type: &str) -> &str {
    if container_type == LXC {
        LXD
    } else {
        container_type
    }
}

/// Hostname the v2 provisioner gives a machine: `juju-` + the last six
/// hex digits of the model UUID + the machine id with `/` turned into `-`.
pub fn namespace_hostname(model_uuid: &str, machine_id: &str) -> Result<String> {
    let parsed = uuid::Uuid::parse_str(model_uuid)
        .with_context(|| format!("model UUID {:?} is not valid", model_uuid))?;
    if !machine_id_re().is_match(machine_id) {
        bail!("machine ID {:?} is not valid", machine_id);
    }
    // Braced, simple and urn forms all parse; the suffix comes from the
    // canonical one.
    let canonical = parsed.hyphenated().to_string();
    let prefix = &canonical[canonical.len() - 6..];
    Ok(format!("juju-{}-{}", prefix, machine_id.replace('/', "-")))
}

/// `0/lxc/1` → `0/lxd/1`. Only first-level containers are rewritten.
pub fn lxc_id_to_lxd_machine_id(id: &str) -> String {
    let mut parts: Vec<&str> = id.split('/').collect();
    if parts.len() == 3 {
        parts[1] = lxc_to_lxd(parts[1]);
    }
    parts.join("/")
}

pub fn lxc_id_to_lxd_machine_tag(id: &str) -> MachineTag {
    MachineTag::new(&lxc_id_to_lxd_machine_id(id))
}

/// `juju-machine-5-lxc-2` → `juju-<hash>-5-lxd-2`. Instance ids of any
/// other shape are not containers and come back unchanged.
pub fn lxc_to_lxd_instance(model_uuid: &str, instance_id: &str) -> Result<String> {
    let parts: Vec<&str> = instance_id.split('-').collect();
    if parts.len() != 5 || parts[0] != "juju" || parts[1] != "machine" {
        return Ok(instance_id.to_string());
    }
    let machine_id = format!("{}/{}/{}", parts[2], lxc_to_lxd(parts[3]), parts[4]);
    namespace_hostname(model_uuid, &machine_id)
}

/// Old and new runtime names of a v1 container: the recorded instance id,
/// and the hostname v2 expects for the same machine as an `lxd` container.
pub fn container_names(model_uuid: &str, machine_id: &str, instance_id: &str) -> Result<(String, String)> {
    let new_id = machine_id.replacen(LXC, LXD, 1);
    let new_name = namespace_hostname(model_uuid, &new_id)?;
    Ok((instance_id.to_string(), new_name))
}

/// Sequence names that changed meaning between versions: `service-<name>`
/// becomes `application-<name>` and `machine<N>lxcContainer` becomes
/// `machine<N>lxdContainer`.
pub fn rename_sequence(name: &str) -> String {
    let name = match service_name_re().captures(name) {
        Some(caps) => format!("application-{}", &caps[1]),
        None => name.to_string(),
    };
    lxc_sequence_re()
        .replace(&name, "machine${1}lxdContainer")
        .into_owned()
}

/// `admin@local` → `admin`; users from other domains keep theirs.
pub fn user_name(v1_user: &str) -> String {
    v1_user
        .strip_suffix("@local")
        .unwrap_or(v1_user)
        .to_string()
}

/// v1 entity tags to v2: services became applications, and container
/// machine tags switch runtime.
pub fn upgrade_tag(tag: &str) -> String {
    if let Some(service) = tag.strip_prefix("service-") {
        return format!("application-{}", service);
    }
    if let Some(machine) = tag.strip_prefix("machine-") {
        if let Ok(parsed) = MachineTag::parse(&format!("machine-{}", machine)) {
            return lxc_id_to_lxd_machine_tag(parsed.id()).to_string();
        }
    }
    tag.to_string()
}
