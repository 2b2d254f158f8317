mod common;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// The binary with every juju store pointed into `home`.
fn upgrader(home: &TempDir) -> Command {
    let mut cmd = assert_cmd::cargo_bin_cmd!("juju-upgrader");
    cmd.env("JUJU_HOME", home.path().join("juju-home"))
        .env("JUJU_DATA", home.path().join("juju-data"))
        .env_remove("JUJU_LOGGING_CONFIG");
    cmd
}

#[test]
fn test_help_lists_client_commands() {
    let home = TempDir::new().unwrap();
    upgrader(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("verify-source"))
        .stdout(predicate::str::contains("migrate-lxc"))
        .stdout(predicate::str::contains("update-maas-agentname"))
        .stdout(predicate::str::contains("verify-source-impl").not());
}

#[test]
fn test_missing_environment_is_usage_error() {
    let home = TempDir::new().unwrap();
    upgrader(&home)
        .arg("verify-source")
        .assert()
        .code(2);
}

#[test]
fn test_unknown_environment() {
    let home = TempDir::new().unwrap();
    upgrader(&home)
        .args(["agent-status", "nosuchenv"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("nosuchenv.jenv"));
}

#[test]
fn test_import_needs_controller_store() {
    let home = TempDir::new().unwrap();
    upgrader(&home)
        .args(["import", "prod", "ctrl"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("controllers.yaml"));
}

#[test]
fn test_verify_source_from_dump() {
    let home = TempDir::new().unwrap();
    let dump = common::write_dump_file(home.path());
    upgrader(&home)
        .arg("verify-source-impl")
        .arg("--from-dump")
        .arg(&dump)
        .assert()
        .success()
        .stdout(predicate::str::contains("0/lxd/0"))
        .stdout(predicate::str::contains("mysql"));
}

#[test]
fn test_verify_source_from_broken_dump() {
    let home = TempDir::new().unwrap();
    let dump = home.path().join("dump.yaml");
    std::fs::write(&dump, "machines: [").unwrap();
    upgrader(&home)
        .arg("verify-source-impl")
        .arg("--from-dump")
        .arg(&dump)
        .assert()
        .failure()
        .stderr(predicate::str::contains("error:"));
}
