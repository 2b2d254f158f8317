mod common;

use juju_upgrader::container::backup::list_lxc_containers;
use juju_upgrader::container::lxd::{migrate_script, parse_lxd_list, revert_script};
use juju_upgrader::container::migrate::{migrate_lxc, MigrateOptions};
use juju_upgrader::container::revert::revert_lxd;
use juju_upgrader::container::{
    containers_to_migrate, containers_to_revert, lxc_containers_by_host, lxd_inventory, match_filter,
    wait_containers_ready, Container, ContainerContext, HostContainers, LxdContainer, LxdInventory,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

const OLD_NAME: &str = "juju-machine-0-lxc-0";
const NEW_NAME: &str = "juju-345678-0-lxd-0";

fn fixture_hosts() -> Vec<HostContainers> {
    let mut machine = common::machine("0/lxc/0", "10.0.3.10");
    machine.host_address = Some("10.0.0.1".to_string());
    vec![HostContainers {
        host: common::machine("0", "10.0.0.1"),
        containers: vec![Container {
            machine,
            old_name: OLD_NAME.to_string(),
            new_name: NEW_NAME.to_string(),
        }],
    }]
}

fn inventory(host: &str, names: &[&str]) -> LxdInventory {
    let containers = names
        .iter()
        .map(|n| {
            (
                n.to_string(),
                LxdContainer {
                    name: n.to_string(),
                    status: "Running".to_string(),
                },
            )
        })
        .collect();
    BTreeMap::from([(host.to_string(), containers)])
}

// ─── Selection ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_containers_grouped_by_host() {
    let dir = TempDir::new().unwrap();
    let st = common::source_state(dir.path()).await;

    let hosts = lxc_containers_by_host(&st, None).await.unwrap();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].host.id, "0");
    let c = &hosts[0].containers[0];
    assert_eq!(c.id(), "0/lxc/0");
    assert_eq!(c.old_name, OLD_NAME);
    assert_eq!(c.new_name, NEW_NAME);
    assert_eq!(c.machine.host_address.as_deref(), Some("10.0.0.1"));
}

#[tokio::test]
async fn test_filter_drops_empty_hosts() {
    let dir = TempDir::new().unwrap();
    let st = common::source_state(dir.path()).await;
    let filter = match_filter(Some("^1/")).unwrap();
    let hosts = lxc_containers_by_host(&st, filter.as_ref()).await.unwrap();
    assert!(hosts.is_empty());
}

#[test]
fn test_match_filter() {
    assert!(match_filter(None).unwrap().is_none());
    assert!(match_filter(Some("")).unwrap().is_none());
    assert!(match_filter(Some("0/lxc/.*")).unwrap().unwrap().is_match("0/lxc/3"));
    assert!(match_filter(Some("(")).is_err());
}

#[test]
fn test_migrate_skips_containers_already_in_lxd() {
    let hosts = fixture_hosts();

    let pending = containers_to_migrate(&hosts, &LxdInventory::new());
    assert_eq!(pending, hosts);

    // Migrated but not renamed, and migrated and renamed.
    assert!(containers_to_migrate(&hosts, &inventory("0", &[OLD_NAME])).is_empty());
    assert!(containers_to_migrate(&hosts, &inventory("0", &[NEW_NAME])).is_empty());

    // LXD containers on another host don't count.
    assert_eq!(containers_to_migrate(&hosts, &inventory("1", &[NEW_NAME])).len(), 1);
}

#[test]
fn test_revert_uses_current_lxd_name() {
    let hosts = fixture_hosts();

    assert!(containers_to_revert(&hosts, &LxdInventory::new()).is_empty());

    let renamed = containers_to_revert(&hosts, &inventory("0", &[NEW_NAME]));
    assert_eq!(renamed.len(), 1);
    assert_eq!(renamed[0].0.id, "0");
    assert_eq!(renamed[0].1[0].0, NEW_NAME);

    let unrenamed = containers_to_revert(&hosts, &inventory("0", &[OLD_NAME]));
    assert_eq!(unrenamed[0].1[0].0, OLD_NAME);
}

#[tokio::test]
async fn test_list_lxc_containers() {
    let dir = TempDir::new().unwrap();
    let st = common::source_state(dir.path()).await;
    let list = list_lxc_containers(&st).await.unwrap();
    assert_eq!(list.containers.len(), 1);
    assert_eq!(list.containers[0].id, "0/lxc/0");
    assert_eq!(list.containers[0].archive_name(), format!("{}.tar.xz", OLD_NAME));

    let json = serde_json::to_string(&list).unwrap();
    assert!(json.contains("\"Id\":\"0/lxc/0\""));
    assert!(json.contains(&format!("\"InstanceId\":\"{}\"", OLD_NAME)));
}

// ─── LXD on hosts ────────────────────────────────────────────────────────────

#[test]
fn test_parse_lxd_list() {
    let list = parse_lxd_list(
        r#"[{"name": "a", "status": "Running", "architecture": "x86_64"},
            {"name": "b", "status": "Stopped"},
            {"name": "c", "status": "Error"},
            {"name": "d", "status": "Frozen"}]"#,
    )
    .unwrap();
    assert_eq!(list.len(), 4);
    assert!(list["a"].is_active());
    assert!(!list["b"].is_active());
    assert!(!list["c"].is_active());
    assert!(list["d"].is_active());
    assert!(parse_lxd_list("not json").is_err());
}

#[tokio::test]
async fn test_lxd_inventory_lists_each_host() {
    let dir = TempDir::new().unwrap();
    let ssh = common::write_script(
        dir.path(),
        "ssh",
        &format!("#!/bin/sh\necho '[{{\"name\": \"{}\", \"status\": \"Running\"}}]'\n", NEW_NAME),
    );
    let ctx = ContainerContext::new(&common::settings_with(&ssh, None, dir.path()));

    let inv = lxd_inventory(&ctx, &fixture_hosts()).await.unwrap();
    assert_eq!(inv.len(), 1);
    assert!(inv["0"].contains_key(NEW_NAME));
    assert!(containers_to_migrate(&fixture_hosts(), &inv).is_empty());
}

#[tokio::test]
async fn test_lxd_inventory_failure_names_host() {
    let dir = TempDir::new().unwrap();
    let ssh = common::write_script(dir.path(), "ssh", "#!/bin/sh\nexit 1\n");
    let ctx = ContainerContext::new(&common::settings_with(&ssh, None, dir.path()));

    let err = lxd_inventory(&ctx, &fixture_hosts()).await.unwrap_err();
    assert!(format!("{:#}", err).contains("listing LXD containers for host \"0\""));
}

#[tokio::test]
async fn test_wait_ready_times_out() {
    let dir = TempDir::new().unwrap();
    let ssh = common::write_script(dir.path(), "ssh", "#!/bin/sh\nexit 255\n");
    let mut settings = common::settings_with(&ssh, None, dir.path());
    settings.timing.container_ready_interval = Duration::from_millis(10);
    settings.timing.container_ready_timeout = Duration::from_millis(100);
    let ctx = ContainerContext::new(&settings);

    let err = wait_containers_ready(&ctx, &fixture_hosts(), true)
        .await
        .unwrap_err();
    let msg = format!("{:#}", err);
    assert!(msg.contains(NEW_NAME));
    assert!(msg.contains("timed out"));
}

#[tokio::test]
async fn test_wait_ready_succeeds() {
    let dir = TempDir::new().unwrap();
    let ssh = common::write_script(dir.path(), "ssh", "#!/bin/sh\nexit 0\n");
    let ctx = ContainerContext::new(&common::settings_with(&ssh, None, dir.path()));
    wait_containers_ready(&ctx, &fixture_hosts(), false).await.unwrap();
}

// ─── Scripts ─────────────────────────────────────────────────────────────────

#[test]
fn test_migrate_script() {
    let ids = vec![OLD_NAME.to_string()];
    let script = migrate_script(Path::new("/home/ubuntu/scripts"), "trusty", &ids, true, false);
    assert!(script.contains("apt-get -t trusty-backports install -q -y lxd lxd-client python3-lxc"));
    assert!(script.contains("cat << 'EOF' > /home/ubuntu/scripts/lxc-to-lxd"));
    assert!(script.contains(&format!("python3 /home/ubuntu/scripts/lxc-to-lxd --dry-run {}", OLD_NAME)));

    let xenial = migrate_script(Path::new("/tmp/s"), "xenial", &ids, false, true);
    assert!(xenial.contains("apt-get install -q -y lxd"));
    assert!(xenial.contains(&format!("--move-rootfs {}", OLD_NAME)));
    assert!(!xenial.contains("--dry-run"));
}

#[test]
fn test_revert_script() {
    let script = revert_script(&[(NEW_NAME.to_string(), OLD_NAME.to_string())]);
    assert!(script.contains("set -ex"));
    assert!(script.contains(&format!("revert-lxd {} {}\n", NEW_NAME, OLD_NAME)));
}

// ─── Pipelines ───────────────────────────────────────────────────────────────

/// An ssh that logs every command and keeps the host's LXD containers in
/// `state` as `lxc list --format=json` output, so later listings see what
/// earlier commands did. Everything else succeeds without effect.
fn lxd_host_ssh(dir: &Path, log: &Path, state: &Path) -> PathBuf {
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
echo "$SSH_TARGET $*" >> {log}
STATE={state}
case "$*" in
  *"python3 "*lxc-to-lxd*) echo '[{{"name": "{old}", "status": "Stopped"}}]' > $STATE ;;
  *"lxc list --format=json"*) if [ -f $STATE ]; then cat $STATE; else echo '[]'; fi ;;
  *"lxc move"*) echo '[{{"name": "{new}", "status": "Stopped"}}]' > $STATE ;;
  *"lxc start"*) sed -i 's/Stopped/Running/' $STATE ;;
  *revert-lxd*) echo '[]' > $STATE ;;
esac
exit 0
"#,
        log = log.display(),
        state = state.display(),
        old = OLD_NAME,
        new = NEW_NAME,
    );
    common::write_script(dir, "fake-ssh", &script)
}

/// Return the log so far and start a fresh one.
fn take_log(log: &Path) -> String {
    let text = std::fs::read_to_string(log).unwrap_or_default();
    std::fs::write(log, "").unwrap();
    text
}

#[tokio::test]
async fn test_migrate_runs_once() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("ssh.log");
    let state = dir.path().join("lxd.json");
    let ssh = lxd_host_ssh(dir.path(), &log, &state);
    let ctx = ContainerContext::new(&common::settings_with(&ssh, None, dir.path()));
    let st = common::source_state(dir.path()).await;

    migrate_lxc(&ctx, &st, &MigrateOptions::default()).await.unwrap();
    let first = take_log(&log);
    assert!(first.contains(&format!("lxc-stop -n {}", OLD_NAME)));
    assert!(first.contains(&format!("--move-rootfs {}", OLD_NAME)));
    assert!(first.contains(&format!("lxc config set {} user.juju-model {}", OLD_NAME, common::ENV_UUID)));
    assert!(first.contains(&format!("lxc move {} {}", OLD_NAME, NEW_NAME)));
    assert!(first.contains(&format!("lxc start {}", NEW_NAME)));
    assert!(first.contains("sudo service jujud-$agent stop"));
    assert!(std::fs::read_to_string(&state).unwrap().contains("Running"));

    migrate_lxc(&ctx, &st, &MigrateOptions::default()).await.unwrap();
    let second = take_log(&log);
    assert!(second.contains("lxc list --format=json"));
    assert!(!second.contains("lxc-stop"));
    assert!(!second.contains("python3 "));
    assert!(!second.contains("lxc move"));
    assert!(!second.contains("lxc start"));
}

#[tokio::test]
async fn test_migrate_dry_run_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("ssh.log");
    let state = dir.path().join("lxd.json");
    let ssh = lxd_host_ssh(dir.path(), &log, &state);
    let ctx = ContainerContext::new(&common::settings_with(&ssh, None, dir.path()));
    let st = common::source_state(dir.path()).await;

    let opts = MigrateOptions {
        dry_run: true,
        pattern: None,
    };
    migrate_lxc(&ctx, &st, &opts).await.unwrap();
    let log = take_log(&log);
    assert!(log.contains("lxc list --format=json"));
    assert!(!log.contains("lxc-stop"));
    assert!(!state.exists());
}

#[tokio::test]
async fn test_revert_runs_once() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("ssh.log");
    let state = dir.path().join("lxd.json");
    std::fs::write(&state, format!(r#"[{{"name": "{}", "status": "Running"}}]"#, NEW_NAME)).unwrap();
    let ssh = lxd_host_ssh(dir.path(), &log, &state);
    let ctx = ContainerContext::new(&common::settings_with(&ssh, None, dir.path()));
    let st = common::source_state(dir.path()).await;

    revert_lxd(&ctx, &st, None).await.unwrap();
    let first = take_log(&log);
    assert!(first.contains(&format!("lxc stop --force {}", NEW_NAME)));
    assert!(first.contains(&format!("revert-lxd {} {}", NEW_NAME, OLD_NAME)));
    assert!(first.contains(&format!("lxc-start -d -n {}", OLD_NAME)));
    assert_eq!(std::fs::read_to_string(&state).unwrap().trim(), "[]");

    revert_lxd(&ctx, &st, None).await.unwrap();
    let second = take_log(&log);
    assert!(!second.contains("revert-lxd"));
    assert!(!second.contains("lxc stop"));
    // Starting an LXC container that already runs is harmless.
    assert!(second.contains(&format!("lxc-start -d -n {}", OLD_NAME)));
}
