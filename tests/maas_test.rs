mod common;

use anyhow::Result;
use async_trait::async_trait;
use juju_upgrader::commands::maas::{psql_command, update_maas_agentname, wait_for_agent_name};
use juju_upgrader::config::settings::TimingSettings;
use juju_upgrader::provider::maas::InterfaceInfo;
use juju_upgrader::provider::MaasApi;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

/// Lists every instance under the new name once `ready_after` polls have
/// gone by.
struct FakeMaas {
    ready_after: usize,
    polls: AtomicUsize,
    asked: Mutex<Vec<String>>,
}

impl FakeMaas {
    fn new(ready_after: usize) -> Self {
        Self {
            ready_after,
            polls: AtomicUsize::new(0),
            asked: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl MaasApi for FakeMaas {
    async fn network_interfaces(&self, _instance_id: &str) -> Result<Vec<InterfaceInfo>> {
        Ok(Vec::new())
    }

    async fn instances_for_agent(&self, _agent_name: &str, ids: &[String]) -> Result<Vec<String>> {
        *self.asked.lock().unwrap() = ids.to_vec();
        let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        if polls > self.ready_after {
            Ok(ids.to_vec())
        } else {
            Ok(ids.iter().take(1).cloned().collect())
        }
    }
}

fn fast_timing() -> TimingSettings {
    TimingSettings {
        maas_poll_interval: Duration::from_millis(5),
        maas_reminder_interval: Duration::from_millis(1),
        ..TimingSettings::default()
    }
}

#[test]
fn test_psql_command() {
    let cmd = psql_command("legacy", common::ENV_UUID);
    assert!(cmd.starts_with("sudo -u postgres psql maasdb -c \""));
    assert!(cmd.contains(&format!(
        "SET agent_name='{}' WHERE agent_name='legacy'",
        common::ENV_UUID
    )));
}

#[tokio::test]
async fn test_wait_polls_until_all_instances_visible() {
    let api = FakeMaas::new(3);
    let ids = vec!["i-0000".to_string(), "i-0001".to_string()];
    wait_for_agent_name(&api, "legacy", common::ENV_UUID, &ids, &fast_timing())
        .await
        .unwrap();
    assert_eq!(api.polls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_wait_with_no_instances_returns_at_once() {
    let api = FakeMaas::new(100);
    wait_for_agent_name(&api, "legacy", common::ENV_UUID, &[], &fast_timing())
        .await
        .unwrap();
    assert_eq!(api.polls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_update_agent_name_records_new_name() {
    let dir = TempDir::new().unwrap();
    let mut collections = common::source_collections();
    collections.get_mut("settings").unwrap()[0].insert("maas-agent-name".to_string(), json!("legacy"));
    let st = common::source_state_from(dir.path(), collections).await;
    let api = FakeMaas::new(1);

    update_maas_agentname(&st, &api, &fast_timing()).await.unwrap();

    // Only top-level machines are MAAS nodes.
    let mut asked = api.asked.lock().unwrap().clone();
    asked.sort();
    assert_eq!(asked, vec!["i-0000", "i-0001"]);

    let config = st.environ_config().await.unwrap();
    assert_eq!(config["maas-agent-name"], json!(common::ENV_UUID));
}

#[tokio::test]
async fn test_update_agent_name_already_done() {
    let dir = TempDir::new().unwrap();
    let mut collections = common::source_collections();
    collections.get_mut("settings").unwrap()[0]
        .insert("maas-agent-name".to_string(), json!(common::ENV_UUID));
    let st = common::source_state_from(dir.path(), collections).await;
    let api = FakeMaas::new(0);

    update_maas_agentname(&st, &api, &fast_timing()).await.unwrap();
    assert_eq!(api.polls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_update_agent_name_requires_setting() {
    let dir = TempDir::new().unwrap();
    let st = common::source_state(dir.path()).await;
    let err = update_maas_agentname(&st, &FakeMaas::new(0), &fast_timing())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "maas-agent-name is missing from the environ config");
}
