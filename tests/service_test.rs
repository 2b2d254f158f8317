mod common;

use juju_upgrader::commands::service::{agent_service_command, parse_status, service_script, AgentStatus};
use juju_upgrader::executor::{DistResult, SshRunner};
use std::path::Path;
use tempfile::TempDir;

fn result(machine_id: &str, stdout: &str) -> DistResult {
    DistResult {
        machine_id: machine_id.to_string(),
        stdout: stdout.to_string(),
        ..DistResult::default()
    }
}

fn row(machine: &str, agent: &str, status: &str, version: &str) -> AgentStatus {
    AgentStatus {
        machine: machine.to_string(),
        agent: agent.to_string(),
        status: status.to_string(),
        version: version.to_string(),
    }
}

#[test]
fn test_service_script_loops_over_agents() {
    let script = service_script(Path::new("/var/lib/juju"), "stop");
    assert!(script.contains("cd /var/lib/juju/agents"));
    assert!(script.contains("ls -al /var/lib/juju/tools/$agent"));
    assert!(script.contains("sudo service jujud-$agent stop"));
    assert!(script.contains("echo \"-- end-of-agent --\""));
}

#[test]
fn test_parse_status_upstart_and_systemd() {
    let mut xenial = common::machine("1", "10.0.0.2");
    xenial.series = "xenial".to_string();
    let machines = vec![common::machine("0", "10.0.0.1"), xenial];

    let trusty_out = "machine-0\n\
        lrwxrwxrwx 1 root root 20 Jan  1 00:00 /var/lib/juju/tools/machine-0 -> 1.25.13-trusty-amd64\n\
        jujud-machine-0 start/running, process 1234\n\
        -- end-of-agent --\n\
        unit-mysql-0\n\
        lrwxrwxrwx 1 root root 20 Jan  1 00:00 /var/lib/juju/tools/unit-mysql-0 -> 1.25.13-trusty-amd64\n\
        jujud-unit-mysql-0 stop/waiting\n\
        -- end-of-agent --\n";
    let xenial_out = "machine-1\n\
        lrwxrwxrwx 1 root root 20 Jan  1 00:00 /var/lib/juju/tools/machine-1 -> 2.2.9-xenial-amd64\n\
        ● jujud-machine-1.service - juju agent for machine-1\n   \
        Active: active (running) since Mon 2018-01-01 00:00:00 UTC\n\
        -- end-of-agent --\n";

    let statuses = parse_status(&machines, &[result("0", trusty_out), result("1", xenial_out)]);
    assert_eq!(
        statuses,
        vec![
            row("0", "machine-0", "start/running", "1.25.13-trusty-amd64"),
            row("1", "machine-1", "active (running)", "2.2.9-xenial-amd64"),
            row("0", "unit-mysql-0", "stop/waiting", "1.25.13-trusty-amd64"),
        ]
    );
}

#[test]
fn test_parse_status_unrecognised_output() {
    let machines = vec![common::machine("0", "10.0.0.1")];
    let out = "machine-0\nls: cannot access /var/lib/juju/tools/machine-0\nunknown job\n-- end-of-agent --\n";
    let statuses = parse_status(&machines, &[result("0", out)]);
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].status, "unknown");
}

#[test]
fn test_parse_status_ignores_trailing_output() {
    let machines = vec![common::machine("0", "10.0.0.1")];
    let statuses = parse_status(&machines, &[result("0", "machine-0\npartial")]);
    assert!(statuses.is_empty());
}

#[tokio::test]
async fn test_service_command_reports_failed_machines() {
    let dir = TempDir::new().unwrap();
    let ssh = common::write_script(dir.path(), "ssh", "#!/bin/sh\necho boom >&2\nexit 1\n");
    let settings = common::settings_with(&ssh, None, dir.path());
    let runner = SshRunner::new(&settings.ssh);
    let machines = vec![common::machine("0", "10.0.0.1"), common::machine("1", "10.0.0.2")];

    let err = agent_service_command(&runner, &settings.system_identity, &settings.data_dir, &machines, "stop")
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "service stop command failed for machines [\"0\", \"1\"]"
    );
}

#[tokio::test]
async fn test_service_command_success() {
    let dir = TempDir::new().unwrap();
    let ssh = common::write_script(dir.path(), "ssh", "#!/bin/sh\nprintf 'machine-0\\nls\\nok\\n-- end-of-agent --\\n'\n");
    let settings = common::settings_with(&ssh, None, dir.path());
    let runner = SshRunner::new(&settings.ssh);
    let machines = vec![common::machine("0", "10.0.0.1")];

    let results = agent_service_command(&runner, &settings.system_identity, &settings.data_dir, &machines, "start")
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].stdout.starts_with("machine-0"));
}
