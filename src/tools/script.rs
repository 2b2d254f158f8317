use std::path::Path;

const AGENT_UPGRADE_TEMPLATE: &str = include_str!("../../scripts/agent-upgrade.py");

/// Values baked into the agent upgrade script.
#[derive(Debug, Clone)]
pub struct UpgradeScriptParams<'a> {
    pub ca_cert: &'a str,
    pub controller_tag: &'a str,
    pub version: &'a str,
    pub api_addresses: &'a [String],
    pub data_dir: &'a Path,
}

/// The upgrade script with controller details filled in. The script runs
/// on hosts the plugin can't stay connected to, so it carries everything
/// it needs.
pub fn render_upgrade_script(params: &UpgradeScriptParams<'_>) -> String {
    AGENT_UPGRADE_TEMPLATE
        .replace("@CA_CERT@", params.ca_cert.trim_end())
        .replace("@CONTROLLER_TAG@", params.controller_tag)
        .replace("@VERSION@", params.version)
        .replace("@API_ADDRESSES@", &params.api_addresses.join("\n"))
        .replace("@DATA_DIR@", &params.data_dir.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_fills_every_placeholder() {
        let addrs = vec!["10.0.0.1:17070".to_string(), "10.0.0.2:17070".to_string()];
        let script = render_upgrade_script(&UpgradeScriptParams {
            ca_cert: "-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----\n",
            controller_tag: "controller-1234",
            version: "2.2.9",
            api_addresses: &addrs,
            data_dir: Path::new("/var/lib/juju"),
        });
        for placeholder in ["@CA_CERT@", "@CONTROLLER_TAG@", "@VERSION@", "@API_ADDRESSES@", "@DATA_DIR@"] {
            assert!(!script.contains(placeholder), "{} left in script", placeholder);
        }
        assert!(script.contains("CONTROLLER_TAG = \"controller-1234\""));
        assert!(script.contains("10.0.0.1:17070\n10.0.0.2:17070"));
        assert!(script.contains("DATA_DIR = \"/var/lib/juju\""));
    }
}
