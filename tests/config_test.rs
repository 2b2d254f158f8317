use juju_upgrader::config::agent::{current_machine_tag, AgentConfig, MachineTag};
use juju_upgrader::config::logging::{filter_directives, translate_loggo_config};
use juju_upgrader::config::store::{strip_port, ControllerInfo, EnvironmentInfo};
use juju_upgrader::config::Settings;
use juju_upgrader::error::UpgradeError;
use std::time::Duration;
use tempfile::TempDir;

fn agents_dir_with(names: &[&str]) -> TempDir {
    let dir = TempDir::new().unwrap();
    let agents = dir.path().join("agents");
    std::fs::create_dir_all(&agents).unwrap();
    for name in names {
        std::fs::create_dir_all(agents.join(name)).unwrap();
    }
    dir
}

// ─── Machine tag discovery ───────────────────────────────────────────────────

#[test]
fn test_current_machine_tag_single() {
    let dir = agents_dir_with(&["machine-42"]);
    let tag = current_machine_tag(dir.path()).unwrap();
    assert_eq!(tag.id(), "42");
    assert_eq!(tag.to_string(), "machine-42");
}

#[test]
fn test_current_machine_tag_none() {
    let dir = agents_dir_with(&[]);
    let err = current_machine_tag(dir.path()).unwrap_err();
    assert_eq!(err.to_string(), "no machines found");
    assert!(matches!(
        err.downcast_ref::<UpgradeError>(),
        Some(UpgradeError::NoMachines)
    ));
}

#[test]
fn test_current_machine_tag_ambiguous() {
    let dir = agents_dir_with(&["machine-0", "machine-1"]);
    let err = current_machine_tag(dir.path()).unwrap_err();
    assert!(err.to_string().contains("too many options"));
    assert!(err.to_string().contains("machine-0"));
    assert!(err.to_string().contains("machine-1"));
}

#[test]
fn test_current_machine_tag_ignores_unit_agents() {
    let dir = agents_dir_with(&["machine-3", "unit-mysql-0"]);
    assert_eq!(current_machine_tag(dir.path()).unwrap().id(), "3");
}

#[test]
fn test_machine_tag_parse_container() {
    let tag = MachineTag::parse("machine-0-lxc-1").unwrap();
    assert_eq!(tag.id(), "0/lxc/1");
    assert_eq!(tag.to_string(), "machine-0-lxc-1");
    assert!(MachineTag::parse("unit-mysql-0").is_err());
    assert!(MachineTag::parse("machine-").is_err());
}

// ─── Agent config ────────────────────────────────────────────────────────────

const V1_AGENT_CONF: &str = r#"tag: machine-0
datadir: /var/lib/juju
environment: environment-d7f3b9ab-1234-5678-9abc-def012345678
stateaddresses:
- localhost:37017
statepassword: sekrit
apiaddresses:
- 10.0.0.1:17070
cacert: |
  -----BEGIN CERTIFICATE-----
  -----END CERTIFICATE-----
upgradedToVersion: 1.25.13
"#;

const V2_AGENT_CONF: &str = r#"# format 2.0
tag: machine-0
model: model-d7f3b9ab-1234-5678-9abc-def012345678
controller: controller-0f0e0d0c-1111-2222-3333-444455556666
apiaddresses:
- 10.0.0.1:17070
upgradedToVersion: 2.2.9
"#;

#[test]
fn test_agent_config_v1() {
    let config = AgentConfig::parse(V1_AGENT_CONF).unwrap();
    assert!(matches!(config, AgentConfig::V1(_)));
    assert_eq!(config.tag(), "machine-0");
    assert_eq!(
        config.model_uuid().unwrap(),
        "d7f3b9ab-1234-5678-9abc-def012345678"
    );

    let mongo = config.mongo_info().unwrap();
    assert_eq!(mongo.addrs, vec!["localhost:37017"]);
    assert_eq!(mongo.password, "sekrit");
    assert_eq!(mongo.tag, "machine-0");
}

#[test]
fn test_agent_config_v2() {
    let config = AgentConfig::parse(V2_AGENT_CONF).unwrap();
    assert!(matches!(config, AgentConfig::V2(_)));
    assert_eq!(
        config.model_uuid().unwrap(),
        "d7f3b9ab-1234-5678-9abc-def012345678"
    );
    // The v1 database is gone once the agents are upgraded.
    assert!(config.mongo_info().is_err());
}

#[test]
fn test_agent_config_old_password_fallback() {
    let content = V1_AGENT_CONF.replace("statepassword: sekrit", "oldpassword: fallback");
    let config = AgentConfig::parse(&content).unwrap();
    assert_eq!(config.mongo_info().unwrap().password, "fallback");
}

#[test]
fn test_agent_config_for_current_machine() {
    let dir = agents_dir_with(&["machine-0"]);
    std::fs::write(
        dir.path().join("agents/machine-0/agent.conf"),
        V1_AGENT_CONF,
    )
    .unwrap();

    let (tag, config) = AgentConfig::for_current_machine(dir.path()).unwrap();
    assert_eq!(tag.id(), "0");
    assert_eq!(config.tag(), "machine-0");
}

// ─── Client stores ───────────────────────────────────────────────────────────

#[test]
fn test_environment_info_load() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("environments")).unwrap();
    std::fs::write(
        dir.path().join("environments/prod.jenv"),
        "user: admin\npassword: pw\nenviron-uuid: d7f3b9ab-1234-5678-9abc-def012345678\nstate-servers:\n- 10.0.0.1:17070\n- 10.0.0.2:17070\n",
    )
    .unwrap();

    let info = EnvironmentInfo::load(dir.path(), "prod").unwrap();
    assert_eq!(info.user, "admin");
    assert_eq!(info.target_address().unwrap(), "10.0.0.1");
}

#[test]
fn test_environment_info_not_initialized() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("environments")).unwrap();
    std::fs::write(dir.path().join("environments/empty.jenv"), "user: admin\n").unwrap();

    let err = EnvironmentInfo::load(dir.path(), "empty").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<UpgradeError>(),
        Some(UpgradeError::NotInitialized(_))
    ));
}

#[test]
fn test_strip_port() {
    assert_eq!(strip_port("10.0.0.1:17070"), "10.0.0.1");
    assert_eq!(strip_port("[::1]:17070"), "[::1]");
    assert_eq!(strip_port("host"), "host");
}

fn write_controller_store(dir: &TempDir) {
    std::fs::write(
        dir.path().join("controllers.yaml"),
        "controllers:\n  target:\n    uuid: 0f0e0d0c-1111-2222-3333-444455556666\n    api-endpoints: ['10.1.0.1:17070']\n    ca-cert: CERT\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("accounts.yaml"),
        "controllers:\n  target:\n    user: admin@local\n    password: hunter2\n",
    )
    .unwrap();
}

#[test]
fn test_controller_info_load_and_encode() {
    let dir = TempDir::new().unwrap();
    write_controller_store(&dir);

    let info = ControllerInfo::load(dir.path(), "target").unwrap();
    assert_eq!(info.addrs, vec!["10.1.0.1:17070"]);
    assert_eq!(info.tag, "user-admin");
    assert_eq!(info.user_name(), "admin");
    assert_eq!(info.controller_uuid, "0f0e0d0c-1111-2222-3333-444455556666");

    let encoded = info.encode().unwrap();
    assert!(!encoded.contains(' '));
    assert_eq!(ControllerInfo::decode(&encoded).unwrap(), info);
}

#[test]
fn test_controller_info_unknown_controller() {
    let dir = TempDir::new().unwrap();
    write_controller_store(&dir);
    let err = ControllerInfo::load(dir.path(), "other").unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[test]
fn test_controller_info_decode_empty() {
    let err = ControllerInfo::decode("").unwrap_err();
    assert_eq!(err.to_string(), "missing controller info");
}

// ─── Settings and logging ────────────────────────────────────────────────────

#[test]
fn test_settings_defaults_when_missing() {
    let dir = TempDir::new().unwrap();
    let settings = Settings::load(Some(&dir.path().join("nope.yaml"))).unwrap();
    assert_eq!(settings.data_dir, std::path::PathBuf::from("/var/lib/juju"));
    assert_eq!(settings.ssh.user, "ubuntu");
    assert_eq!(settings.mongo.port, 37017);
}

#[test]
fn test_settings_overrides() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.yaml");
    std::fs::write(
        &path,
        "data_dir: /tmp/juju\nssh:\n  ssh_binary: /opt/fake-ssh\n  max_per_host: 2\ntiming:\n  maas_poll_interval: 1\n",
    )
    .unwrap();

    let settings = Settings::load(Some(&path)).unwrap();
    assert_eq!(settings.data_dir, std::path::PathBuf::from("/tmp/juju"));
    assert_eq!(settings.ssh.ssh_binary, "/opt/fake-ssh");
    assert_eq!(settings.ssh.max_per_host, 2);
    assert_eq!(settings.ssh.user, "ubuntu");
    assert_eq!(settings.timing.maas_poll_interval, Duration::from_secs(1));
    assert_eq!(
        settings.saved_machines_path().parent(),
        Some(settings.tools_dir.as_path())
    );
}

#[test]
fn test_logging_directives() {
    assert_eq!(filter_directives(true, Some("<root>=ERROR")), "debug");
    assert_eq!(filter_directives(false, None), "info");
    assert_eq!(filter_directives(false, Some("bogus=NOPE")), "info");
    assert_eq!(
        translate_loggo_config("<root>=WARNING;upgrader=DEBUG"),
        "warn,juju_upgrader=debug"
    );
    assert_eq!(translate_loggo_config("ERROR"), "error");
}
