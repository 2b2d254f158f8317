//! Stand-ins for `ssh` and `scp` so remote commands run on the local host.

#![allow(dead_code)]

use juju_upgrader::config::Settings;
use juju_upgrader::executor::FlatMachine;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Runs the remote command locally with `$SSH_TARGET` set to the address.
pub const RUNNING_SSH: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
  case "$1" in
    -o|-i) shift 2 ;;
    -*) shift ;;
    *@*) SSH_TARGET="${1#*@}"; shift; break ;;
    *) shift ;;
  esac
done
export SSH_TARGET
[ "$1" = sudo ] && shift 2
eval "$*"
"#;

pub fn write_script(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// An ssh that only appends `<address> <command>` to `log` and succeeds.
pub fn logging_ssh(dir: &Path, log: &Path) -> PathBuf {
    let script = format!(
        r#"#!/bin/sh
while [ $# -gt 0 ]; do
  case "$1" in
    -o|-i) shift 2 ;;
    -*) shift ;;
    *@*) SSH_TARGET="${{1#*@}}"; shift; break ;;
    *) shift ;;
  esac
done
echo "$SSH_TARGET $*" >> {}
"#,
        log.display()
    );
    write_script(dir, "fake-ssh", &script)
}

/// An scp that appends its arguments to `log` and succeeds.
pub fn logging_scp(dir: &Path, log: &Path) -> PathBuf {
    let script = format!("#!/bin/sh\necho \"$@\" >> {}\n", log.display());
    write_script(dir, "fake-scp", &script)
}

pub fn settings_with(ssh: &Path, scp: Option<&Path>, data_dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.ssh.ssh_binary = ssh.display().to_string();
    if let Some(scp) = scp {
        settings.ssh.scp_binary = scp.display().to_string();
    }
    settings.data_dir = data_dir.join("data");
    settings.tools_dir = data_dir.join("tools");
    settings.system_identity = data_dir.join("system-identity");
    settings
}

pub fn machine(id: &str, address: &str) -> FlatMachine {
    FlatMachine {
        model: "d7f3b9ab-1234-5678-9abc-def012345678".to_string(),
        series: "trusty".to_string(),
        id: id.to_string(),
        instance_id: format!("i-{}", id.replace('/', "-")),
        address: address.to_string(),
        tools: "1.25.13-trusty-amd64".to_string(),
        host_address: None,
    }
}

/// Like `RUNNING_SSH`, but commands start in `home`, the remote login
/// directory.
pub fn running_ssh_in(dir: &Path, home: &Path) -> PathBuf {
    let script = RUNNING_SSH.replace(
        "eval \"$*\"",
        &format!("cd {} || exit 255\neval \"$*\"", home.display()),
    );
    write_script(dir, "fake-ssh", &script)
}

// ─── Source database fixture ─────────────────────────────────────────────────

pub const ENV_UUID: &str = "d7f3b9ab-1234-5678-9abc-def012345678";
pub const CHARM_URL: &str = "cs:trusty/mysql-38";
pub const CHARM_PATH: &str = "charms/mysql-38.zip";

fn doc(value: serde_json::Value) -> juju_upgrader::state::Document {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("fixture document is not an object: {}", other),
    }
}

fn scoped(id: &str, mut value: serde_json::Value) -> juju_upgrader::state::Document {
    value["_id"] = serde_json::json!(format!("{}:{}", ENV_UUID, id));
    value["env-uuid"] = serde_json::json!(ENV_UUID);
    doc(value)
}

fn status(key: &str) -> juju_upgrader::state::Document {
    scoped(key, serde_json::json!({"status": "started", "statusinfo": ""}))
}

fn machine_doc(id: &str, address: &str, container_type: &str) -> juju_upgrader::state::Document {
    scoped(
        id,
        serde_json::json!({
            "machineid": id,
            "series": "trusty",
            "containertype": container_type,
            "nonce": format!("nonce-{}", id),
            "preferredprivateaddress": {"value": address, "addresstype": "ipv4", "networkscope": "local-cloud"},
            "supportedcontainers": ["lxc"],
            "supportedcontainersknown": true,
            "tools": {"version": "1.25.13-trusty-amd64", "url": "", "sha256": "", "size": 0},
        }),
    )
}

fn instance_doc(id: &str, instance_id: &str) -> juju_upgrader::state::Document {
    scoped(
        &format!("{}#instance", id),
        serde_json::json!({"machineid": id, "instanceid": instance_id, "status": "running", "arch": "amd64"}),
    )
}

/// A small ec2 environment: machines 0 and 1, an LXC container on 0, and
/// one mysql unit in the container. Machines are deliberately listed out
/// of order.
pub fn source_collections() -> std::collections::BTreeMap<String, Vec<juju_upgrader::state::Document>> {
    use serde_json::json;
    let mut c = std::collections::BTreeMap::new();
    c.insert(
        "environments".to_string(),
        vec![doc(json!({"_id": ENV_UUID, "name": "prod", "owner": "admin@local", "server-uuid": ENV_UUID}))],
    );
    c.insert(
        "settings".to_string(),
        vec![
            scoped(
                "e",
                json!({
                    "name": "prod", "type": "ec2", "uuid": ENV_UUID,
                    "access-key": "AK", "secret-key": "SK", "region": "us-east-1",
                    "admin-secret": "hidden", "ca-cert": "CERT", "default-series": "trusty",
                }),
            ),
            scoped(&format!("s#mysql#{}", CHARM_URL), json!({"dataset-size": "80%"})),
            scoped("s#mysql#leader", json!({})),
        ],
    );
    c.insert(
        "machines".to_string(),
        vec![
            machine_doc("1", "10.0.0.2", ""),
            machine_doc("0/lxc/0", "10.0.3.10", "lxc"),
            machine_doc("0", "10.0.0.1", ""),
        ],
    );
    c.insert(
        "instanceData".to_string(),
        vec![
            instance_doc("0", "i-0000"),
            instance_doc("1", "i-0001"),
            instance_doc("0/lxc/0", "juju-machine-0-lxc-0"),
        ],
    );
    c.insert(
        "statuses".to_string(),
        vec![
            status("m#0"),
            status("m#1"),
            status("m#0/lxc/0"),
            status("s#mysql"),
            status("u#mysql/0#charm"),
            status("u#mysql/0"),
        ],
    );
    c.insert(
        "services".to_string(),
        vec![scoped(
            "mysql",
            json!({"name": "mysql", "series": "trusty", "charmurl": CHARM_URL, "minunits": 0}),
        )],
    );
    c.insert(
        "units".to_string(),
        vec![scoped(
            "mysql/0",
            json!({
                "name": "mysql/0", "service": "mysql", "series": "trusty", "charmurl": CHARM_URL,
                "machineid": "0/lxc/0",
                "tools": {"version": "1.25.13-trusty-amd64", "url": "", "sha256": "", "size": 0},
            }),
        )],
    );
    c.insert(
        "meterStatus".to_string(),
        vec![scoped("u#mysql/0", json!({"code": "NOT SET", "info": ""}))],
    );
    c.insert(
        "charms".to_string(),
        vec![scoped(
            CHARM_URL,
            json!({
                "meta": {"name": "mysql", "provides": {"db": {"name": "db", "role": "provider", "interface": "mysql"}}},
                "storagepath": CHARM_PATH,
            }),
        )],
    );
    c.insert(
        "sequence".to_string(),
        vec![
            scoped("machine", json!({"name": "machine", "counter": 2})),
            scoped("machine0lxcContainer", json!({"name": "machine0lxcContainer", "counter": 1})),
            scoped("service-mysql", json!({"name": "service-mysql", "counter": 1})),
        ],
    );
    c.insert(
        "envusers".to_string(),
        vec![scoped(
            "admin@local",
            json!({"user": "admin@local", "displayname": "admin", "createdby": "admin@local"}),
        )],
    );
    c.insert(
        "leases".to_string(),
        vec![scoped(
            "service-leadership#mysql",
            json!({"namespace": "service-leadership", "type": "lease", "name": "mysql", "holder": "mysql/0"}),
        )],
    );
    c
}

/// A charm archive with an extra binding in its metadata.
pub fn charm_archive() -> Vec<u8> {
    use std::io::Write;
    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buf);
        zip.start_file("metadata.yaml", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"name: mysql\nextra-bindings:\n  cluster:\n").unwrap();
        zip.finish().unwrap();
    }
    buf.into_inner()
}

/// Write the charm blob under `blob_dir`.
pub fn write_blobs(blob_dir: &Path) {
    let path = blob_dir.join(CHARM_PATH);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, charm_archive()).unwrap();
}

pub async fn source_state(dir: &Path) -> juju_upgrader::state::SourceState {
    source_state_from(dir, source_collections()).await
}

pub async fn source_state_from(
    dir: &Path,
    collections: std::collections::BTreeMap<String, Vec<juju_upgrader::state::Document>>,
) -> juju_upgrader::state::SourceState {
    let blobs = dir.join("blobs");
    write_blobs(&blobs);
    let db = juju_upgrader::state::DumpFileDb::new(collections).with_blob_dir(blobs);
    juju_upgrader::state::SourceState::open(std::sync::Arc::new(db), None)
        .await
        .unwrap()
}

/// The fixture as a `dump-source-db` file with its blob directory.
pub fn write_dump_file(dir: &Path) -> PathBuf {
    let path = dir.join("dump.yaml");
    std::fs::write(&path, serde_yaml::to_string(&source_collections()).unwrap()).unwrap();
    write_blobs(&dir.join("dump-blobs"));
    path
}
