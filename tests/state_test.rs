mod common;

use juju_upgrader::error::UpgradeError;
use juju_upgrader::export::{export_model, Model};
use juju_upgrader::state::{dump_all, Document, DumpFileDb, SourceState};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

// ─── Source state ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_flat_machines_parents_first() {
    let dir = TempDir::new().unwrap();
    let st = common::source_state(dir.path()).await;
    assert_eq!(st.environ_uuid(), common::ENV_UUID);

    let machines = st.flat_machines().await.unwrap();
    let ids: Vec<&str> = machines.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["0", "0/lxc/0", "1"]);

    let container = &machines[1];
    assert_eq!(container.address, "10.0.3.10");
    assert_eq!(container.host_address.as_deref(), Some("10.0.0.1"));
    assert_eq!(container.instance_id, "juju-machine-0-lxc-0");
    assert_eq!(container.tools, "1.25.13-trusty-amd64");
    assert!(machines[0].host_address.is_none());
}

#[tokio::test]
async fn test_flat_machines_needs_an_address() {
    let dir = TempDir::new().unwrap();
    let mut collections = common::source_collections();
    for machine in collections.get_mut("machines").unwrap() {
        machine.remove("preferredprivateaddress");
    }
    let st = common::source_state_from(dir.path(), collections).await;

    let err = st.flat_machines().await.unwrap_err();
    assert!(err.to_string().contains("no private nor public address"));
}

#[tokio::test]
async fn test_charms_and_archives() {
    let dir = TempDir::new().unwrap();
    let st = common::source_state(dir.path()).await;

    let charms = st.charms().await.unwrap();
    let charm = charms.get(common::CHARM_URL).unwrap();
    assert_eq!(charm.url_name(), "mysql");
    assert_eq!(st.charm_archive(charm).await.unwrap(), common::charm_archive());
}

#[tokio::test]
async fn test_environ_config_round_trip() {
    let dir = TempDir::new().unwrap();
    let st = common::source_state(dir.path()).await;

    let config = st.environ_config().await.unwrap();
    assert_eq!(config.get("type"), Some(&json!("ec2")));
    assert!(config.get("_id").is_none());
    assert!(config.get("env-uuid").is_none());

    let mut attrs = Document::new();
    attrs.insert("maas-agent-name".to_string(), json!(common::ENV_UUID));
    st.update_environ_config(&attrs).await.unwrap();
    let config = st.environ_config().await.unwrap();
    assert_eq!(config.get("maas-agent-name"), Some(&json!(common::ENV_UUID)));
}

#[tokio::test]
async fn test_open_requires_a_single_environment() {
    let mut collections = common::source_collections();
    collections.get_mut("environments").unwrap().push(
        json!({"_id": "0f0e0d0c-1111-2222-3333-444455556666", "name": "other"})
            .as_object()
            .unwrap()
            .clone(),
    );
    let db = Arc::new(DumpFileDb::new(collections));

    let err = SourceState::open(db.clone(), None).await.err().unwrap();
    assert!(err.to_string().contains("cannot pick one"));

    let st = SourceState::open(db.clone(), Some(common::ENV_UUID)).await.unwrap();
    assert_eq!(st.environment().name, "prod");

    assert!(SourceState::open(db, Some("missing")).await.is_err());
}

#[tokio::test]
async fn test_dump_all_sorted_and_reloadable() {
    let dir = TempDir::new().unwrap();
    let st = common::source_state(dir.path()).await;

    let dumped = dump_all(st.db()).await.unwrap();
    let ids: Vec<&str> = dumped["machines"]
        .iter()
        .filter_map(|d| d.get("_id").and_then(Value::as_str))
        .collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);

    let yaml = serde_yaml::to_string(&dumped).unwrap();
    let reloaded = DumpFileDb::from_yaml(&yaml).unwrap();
    let st2 = SourceState::open(Arc::new(reloaded), None).await.unwrap();
    assert_eq!(st2.flat_machines().await.unwrap().len(), 3);
}

// ─── Export ──────────────────────────────────────────────────────────────────

async fn exported(dir: &TempDir) -> Model {
    let st = common::source_state(dir.path()).await;
    export_model(&st).await.unwrap()
}

#[tokio::test]
async fn test_export_nests_containers_under_hosts() {
    let dir = TempDir::new().unwrap();
    let model = exported(&dir).await;

    let top: Vec<&str> = model.machines.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(top, vec!["0", "1"]);
    let order: Vec<&str> = model.all_machines().iter().map(|m| m.id.as_str()).collect();
    assert_eq!(order, vec!["0", "0/lxd/0", "1"]);

    let container = &model.machines[0].containers[0];
    assert_eq!(container.container_type, "lxd");
    assert_eq!(
        container.instance.as_ref().unwrap().instance_id,
        "juju-345678-0-lxd-0"
    );
    assert_eq!(
        model.machines[0].supported_containers,
        Some(vec!["lxd".to_string()])
    );
}

#[tokio::test]
async fn test_export_missing_parent() {
    let dir = TempDir::new().unwrap();
    let mut collections = common::source_collections();
    collections
        .get_mut("machines")
        .unwrap()
        .retain(|m| m.get("machineid") != Some(&json!("0")));
    let st = common::source_state_from(dir.path(), collections).await;

    let err = export_model(&st).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<UpgradeError>(),
        Some(UpgradeError::MissingParent(id)) if id == "0/lxc/0"
    ));
}

#[tokio::test]
async fn test_export_model_level_records() {
    let dir = TempDir::new().unwrap();
    let model = exported(&dir).await;

    assert_eq!(model.version, 1);
    assert_eq!(model.owner, "admin");
    assert_eq!(model.cloud_region, "us-east-1");
    let credential = model.cloud_credential.as_ref().unwrap();
    assert_eq!(credential.auth_type, "access-key");
    assert_eq!(credential.attributes["access-key"], "AK");

    assert!(!model.config.contains_key("admin-secret"));
    assert!(!model.config.contains_key("ca-cert"));
    assert!(!model.config.contains_key("access-key"));
    assert_eq!(model.config["max-status-history-age"], json!("336h"));

    assert_eq!(model.sequences["machine0lxdContainer"], 1);
    assert_eq!(model.sequences["application-mysql"], 1);
    assert_eq!(model.sequences["machine"], 2);
    assert!(!model.sequences.contains_key("machine0lxcContainer"));

    assert_eq!(model.users.len(), 1);
    assert_eq!(model.users[0].name, "admin");
    assert_eq!(model.users[0].access, "admin");
}

#[tokio::test]
async fn test_export_applications() {
    let dir = TempDir::new().unwrap();
    let model = exported(&dir).await;

    assert_eq!(model.applications.len(), 1);
    let app = &model.applications[0];
    assert_eq!(app.charm_url, common::CHARM_URL);
    assert_eq!(app.leader, "mysql/0");
    assert_eq!(app.settings.get("dataset-size"), Some(&json!("80%")));
    let bindings: Vec<&str> = app.endpoint_bindings.keys().map(String::as_str).collect();
    assert_eq!(bindings, vec!["cluster", "db"]);

    let unit = &app.units[0];
    assert_eq!(unit.machine, "0/lxd/0");
    assert_eq!(unit.meter_status_code, "NOT SET");
    assert_eq!(unit.agent_status.as_ref().unwrap().value, "started");
}

#[tokio::test]
async fn test_export_missing_settings() {
    let dir = TempDir::new().unwrap();
    let mut collections = common::source_collections();
    collections
        .get_mut("settings")
        .unwrap()
        .retain(|d| !d["_id"].as_str().unwrap_or_default().ends_with("#leader"));
    let st = common::source_state_from(dir.path(), collections).await;

    let err = export_model(&st).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "missing leadership settings for application \"mysql\""
    );
}

#[tokio::test]
async fn test_export_unsupported_cloud() {
    let dir = TempDir::new().unwrap();
    let mut collections = common::source_collections();
    for settings in collections.get_mut("settings").unwrap() {
        if settings["_id"].as_str() == Some(&format!("{}:e", common::ENV_UUID)) {
            settings.insert("type".to_string(), json!("joyent"));
        }
    }
    let st = common::source_state_from(dir.path(), collections).await;

    let err = export_model(&st).await.unwrap_err();
    assert!(err
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<UpgradeError>(), Some(UpgradeError::UnsupportedCloud(t)) if t == "joyent")));
}

#[tokio::test]
async fn test_serialized_model_reads_back() {
    let dir = TempDir::new().unwrap();
    let model = exported(&dir).await;

    let yaml = model.serialize().unwrap();
    assert!(yaml.contains("juju-345678-0-lxd-0"));
    let parsed = Model::deserialize(&yaml).unwrap();
    assert_eq!(parsed.all_machines().len(), 3);
    assert_eq!(parsed.applications[0].units[0].machine, "0/lxd/0");
}
