mod common;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use juju_upgrader::commands::{abort_model, abort_upgrade, activate_model, activate_upgrade, import_model};
use juju_upgrader::executor::retry::RetryPolicy;
use juju_upgrader::target::MigrationTarget;
use juju_upgrader::tools::upgrade::save_machines;
use juju_upgrader::tools::{ToolsInfo, ToolsWrangler};
use std::path::Path;
use std::sync::Mutex;
use tempfile::TempDir;

/// Records every call; fails where told to.
#[derive(Default)]
struct FakeTarget {
    calls: Mutex<Vec<String>>,
    imported: Mutex<Option<String>>,
    charms: Mutex<Vec<Vec<u8>>>,
    machine_problems: Vec<String>,
    abort_error: Option<String>,
}

impl FakeTarget {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl MigrationTarget for FakeTarget {
    async fn import(&self, serialized: &[u8]) -> Result<()> {
        self.record("import".to_string());
        *self.imported.lock().unwrap() = Some(String::from_utf8_lossy(serialized).into_owned());
        Ok(())
    }

    async fn check_machines(&self, model_uuid: &str) -> Result<Vec<String>> {
        self.record(format!("check-machines {}", model_uuid));
        Ok(self.machine_problems.clone())
    }

    async fn upload_tools(&self, _model_uuid: &str, tools: &ToolsInfo, archive: Vec<u8>) -> Result<()> {
        assert_eq!(archive.len() as u64, tools.size);
        self.record(format!("upload-tools {}", tools.version));
        Ok(())
    }

    async fn upload_charm(&self, _model_uuid: &str, curl: &str, archive: Vec<u8>) -> Result<()> {
        self.record(format!("upload-charm {}", curl));
        self.charms.lock().unwrap().push(archive);
        Ok(())
    }

    async fn activate(&self, model_uuid: &str) -> Result<()> {
        self.record(format!("activate {}", model_uuid));
        Ok(())
    }

    async fn abort(&self, model_uuid: &str) -> Result<()> {
        self.record(format!("abort {}", model_uuid));
        match &self.abort_error {
            Some(msg) => Err(anyhow!("{}", msg)),
            None => Ok(()),
        }
    }
}

fn cached_wrangler(dir: &Path) -> ToolsWrangler {
    let tools_dir = dir.join("tools");
    std::fs::create_dir_all(&tools_dir).unwrap();
    std::fs::write(tools_dir.join("2.2.9-trusty-amd64.tgz"), b"not really a tarball").unwrap();
    ToolsWrangler::new("127.0.0.1:1", "2.2.9", &tools_dir)
        .unwrap()
        .with_retry_policy(RetryPolicy::none())
}

// ─── Import ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_import_transfers_model_and_blobs() {
    let dir = TempDir::new().unwrap();
    let st = common::source_state(dir.path()).await;
    let target = FakeTarget::default();

    import_model(&st, &target, &cached_wrangler(dir.path()), false)
        .await
        .unwrap();

    assert_eq!(
        target.calls(),
        vec![
            "import".to_string(),
            format!("check-machines {}", common::ENV_UUID),
            "upload-tools 2.2.9-trusty-amd64".to_string(),
            format!("upload-charm {}", common::CHARM_URL),
        ]
    );
    assert_eq!(target.charms.lock().unwrap()[0], common::charm_archive());

    let imported = target.imported.lock().unwrap().clone().unwrap();
    assert!(imported.contains("2.2.9-trusty-amd64"));
    assert!(!imported.contains("1.25.13-trusty-amd64"));
}

#[tokio::test]
async fn test_import_aborts_after_failed_machine_check() {
    let dir = TempDir::new().unwrap();
    let st = common::source_state(dir.path()).await;
    let target = FakeTarget {
        machine_problems: vec!["machine 1 instance i-0001 not found".to_string()],
        ..FakeTarget::default()
    };

    let err = import_model(&st, &target, &cached_wrangler(dir.path()), false)
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("machine check failed"));
    assert!(err.to_string().contains("i-0001"));

    let calls = target.calls();
    assert_eq!(calls.last().unwrap(), &format!("abort {}", common::ENV_UUID));
    assert!(!calls.iter().any(|c| c.starts_with("upload")));
}

#[tokio::test]
async fn test_import_keep_broken_skips_abort() {
    let dir = TempDir::new().unwrap();
    let st = common::source_state(dir.path()).await;
    let target = FakeTarget {
        machine_problems: vec!["mismatch".to_string()],
        ..FakeTarget::default()
    };

    assert!(import_model(&st, &target, &cached_wrangler(dir.path()), true)
        .await
        .is_err());
    assert!(!target.calls().iter().any(|c| c.starts_with("abort")));
}

#[tokio::test]
async fn test_import_cleanup_failure_keeps_original_error() {
    let dir = TempDir::new().unwrap();
    let st = common::source_state(dir.path()).await;
    let target = FakeTarget {
        machine_problems: vec!["mismatch".to_string()],
        abort_error: Some("controller went away".to_string()),
        ..FakeTarget::default()
    };

    let err = import_model(&st, &target, &cached_wrangler(dir.path()), false)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "machine check failed: mismatch");
}

#[tokio::test]
async fn test_import_export_failure_touches_nothing() {
    let dir = TempDir::new().unwrap();
    let mut collections = common::source_collections();
    collections.remove("meterStatus");
    let st = common::source_state_from(dir.path(), collections).await;
    let target = FakeTarget::default();

    let err = import_model(&st, &target, &cached_wrangler(dir.path()), false)
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("missing meter status"));
    assert!(target.calls().is_empty());
}

// ─── Activate and abort ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_activate_and_abort_model() {
    let target = FakeTarget::default();
    activate_model(&target, common::ENV_UUID).await.unwrap();
    abort_model(&target, common::ENV_UUID).await.unwrap();
    assert_eq!(
        target.calls(),
        vec![
            format!("activate {}", common::ENV_UUID),
            format!("abort {}", common::ENV_UUID),
        ]
    );
}

#[tokio::test]
async fn test_abort_rolls_back_even_when_model_abort_fails() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("ssh.log");
    let ssh = common::logging_ssh(dir.path(), &log);
    let settings = common::settings_with(&ssh, None, dir.path());
    save_machines(
        &settings.saved_machines_path(),
        &[common::machine("0", "10.0.0.1"), common::machine("1", "10.0.0.2")],
    )
    .unwrap();

    let target = FakeTarget {
        abort_error: Some("model not found".to_string()),
        ..FakeTarget::default()
    };
    let err = abort_upgrade(&settings, abort_model(&target, common::ENV_UUID))
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("model not found"));

    let log = std::fs::read_to_string(&log).unwrap();
    let mut hosts: Vec<&str> = log
        .lines()
        .filter(|l| l.contains("agent-upgrade.py rollback"))
        .filter_map(|l| l.split(' ').next())
        .collect();
    hosts.sort();
    assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.2"]);
}

#[tokio::test]
async fn test_abort_reports_rollback_failure() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("ssh.log");
    let ssh = common::logging_ssh(dir.path(), &log);
    let settings = common::settings_with(&ssh, None, dir.path());
    let target = FakeTarget::default();

    // No saved machines: nothing was upgraded, so nothing can be rolled back.
    let err = abort_upgrade(&settings, abort_model(&target, common::ENV_UUID))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unable to get addresses for machines"));
    assert_eq!(target.calls(), vec![format!("abort {}", common::ENV_UUID)]);
}

#[tokio::test]
async fn test_successful_rollback_forgets_saved_machines() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("ssh.log");
    let ssh = common::logging_ssh(dir.path(), &log);
    let settings = common::settings_with(&ssh, None, dir.path());
    save_machines(&settings.saved_machines_path(), &[common::machine("0", "10.0.0.1")]).unwrap();

    let target = FakeTarget::default();
    abort_upgrade(&settings, abort_model(&target, common::ENV_UUID))
        .await
        .unwrap();
    assert!(!settings.saved_machines_path().exists());

    // A second abort finds nothing to roll back.
    let err = abort_upgrade(&settings, abort_model(&target, common::ENV_UUID))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unable to get addresses for machines"));
}

#[tokio::test]
async fn test_failed_rollback_keeps_saved_machines() {
    let dir = TempDir::new().unwrap();
    let ssh = common::write_script(dir.path(), "ssh", "#!/bin/sh\nexit 1\n");
    let settings = common::settings_with(&ssh, None, dir.path());
    save_machines(
        &settings.saved_machines_path(),
        &[common::machine("0", "10.0.0.1"), common::machine("1", "10.0.0.2")],
    )
    .unwrap();

    let target = FakeTarget::default();
    let err = abort_upgrade(&settings, abort_model(&target, common::ENV_UUID))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "rollback failed on machines 0, 1");
    assert!(settings.saved_machines_path().exists());
}

#[tokio::test]
async fn test_activate_completes_upgrade() {
    let dir = TempDir::new().unwrap();
    let settings = common::settings_with(Path::new("ssh"), None, dir.path());
    save_machines(&settings.saved_machines_path(), &[common::machine("0", "10.0.0.1")]).unwrap();

    let target = FakeTarget::default();
    activate_upgrade(&settings, &target, common::ENV_UUID)
        .await
        .unwrap();
    assert_eq!(target.calls(), vec![format!("activate {}", common::ENV_UUID)]);
    assert!(!settings.saved_machines_path().exists());
}
