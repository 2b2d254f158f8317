use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::error::UpgradeError;

/// One network link of a node, as the v2 networking code describes it: the
/// interface it sits on plus the address configured on it, if any.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterfaceInfo {
    pub interface_name: String,
    pub parent_interface_name: String,
    pub interface_type: String,
    pub provider_id: String,
    pub provider_address_id: String,
    pub mac_address: String,
    pub mtu: u64,
    pub disabled: bool,
    pub no_auto_start: bool,
    pub cidr: String,
    pub config_type: String,
    pub address: String,
    pub dns_servers: Vec<String>,
    pub dns_search_domains: Vec<String>,
    pub gateway_address: String,
}

/// What the migration needs from a MAAS region controller.
#[async_trait]
pub trait MaasApi: Send + Sync {
    /// Network links of the node behind an instance id.
    async fn network_interfaces(&self, instance_id: &str) -> Result<Vec<InterfaceInfo>>;

    /// Instance ids out of `ids` that MAAS lists under `agent_name`.
    async fn instances_for_agent(&self, agent_name: &str, ids: &[String]) -> Result<Vec<String>>;
}

// ─── Wire types ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Node {
    system_id: String,
    resource_uri: String,
    #[serde(default)]
    interface_set: Vec<Interface>,
}

#[derive(Debug, Deserialize)]
struct Interface {
    id: i64,
    name: String,
    #[serde(rename = "type")]
    interface_type: String,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    mac_address: String,
    #[serde(default)]
    effective_mtu: u64,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    id: i64,
    mode: String,
    #[serde(default)]
    ip_address: Option<String>,
    #[serde(default)]
    subnet: Option<LinkSubnet>,
}

#[derive(Debug, Deserialize)]
struct LinkSubnet {
    cidr: String,
    #[serde(default)]
    gateway_ip: Option<String>,
    #[serde(default)]
    dns_servers: Vec<String>,
}

// ─── Client ─────────────────────────────────────────────────────────────────

/// MAAS 1.x API client authenticating with the environment's OAuth token.
pub struct MaasClient {
    http: reqwest::Client,
    api_url: String,
    credentials: OAuthCredentials,
}

#[derive(Debug, Clone)]
struct OAuthCredentials {
    consumer_key: String,
    token_key: String,
    token_secret: String,
}

impl OAuthCredentials {
    /// `maas-oauth` is `<consumer key>:<token key>:<token secret>`.
    fn parse(oauth: &str) -> Result<Self> {
        let parts: Vec<&str> = oauth.split(':').collect();
        if parts.len() != 3 {
            bail!("malformed maas-oauth (expected 3 colon-separated parts)");
        }
        Ok(Self {
            consumer_key: parts[0].to_string(),
            token_key: parts[1].to_string(),
            token_secret: parts[2].to_string(),
        })
    }

    /// PLAINTEXT signature: empty consumer secret, `&`, token secret.
    fn header(&self) -> String {
        let timestamp = chrono::Utc::now().timestamp();
        let nonce = uuid::Uuid::new_v4();
        format!(
            "OAuth realm=\"\", oauth_consumer_key=\"{}\", oauth_token=\"{}\", \
             oauth_signature_method=\"PLAINTEXT\", oauth_signature=\"%26{}\", \
             oauth_timestamp=\"{}\", oauth_nonce=\"{}\", oauth_version=\"1.0\"",
            self.consumer_key, self.token_key, self.token_secret, timestamp, nonce
        )
    }
}

impl MaasClient {
    /// `server` is the `maas-server` environ setting, e.g.
    /// `http://10.0.0.2/MAAS`.
    pub fn new(server: &str, oauth: &str) -> Result<Self> {
        let credentials = OAuthCredentials::parse(oauth)?;
        Ok(Self {
            http: reqwest::Client::new(),
            api_url: format!("{}/api/1.0", server.trim_end_matches('/')),
            credentials,
        })
    }

    async fn list_nodes(&self, query: &[(&str, &str)]) -> Result<Vec<Node>> {
        let url = format!("{}/nodes/", self.api_url);
        let mut params = vec![("op", "list")];
        params.extend_from_slice(query);

        let resp = self
            .http
            .get(&url)
            .query(&params)
            .header(reqwest::header::AUTHORIZATION, self.credentials.header())
            .send()
            .await
            .context("Failed to query MAAS nodes")?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(UpgradeError::Protocol {
                context: format!("listing MAAS nodes: {}", status),
                body,
            }
            .into());
        }
        serde_json::from_str(&body).context("Failed to parse MAAS node list")
    }
}

#[async_trait]
impl MaasApi for MaasClient {
    async fn network_interfaces(&self, instance_id: &str) -> Result<Vec<InterfaceInfo>> {
        let system_id = system_id(instance_id);
        let nodes = self.list_nodes(&[("id", system_id)]).await?;
        let Some(node) = nodes.into_iter().find(|n| n.system_id == system_id) else {
            bail!("instance {:?} not found in MAAS", instance_id);
        };
        tracing::debug!(node = %node.resource_uri, "Read {} interfaces", node.interface_set.len());
        Ok(interface_infos(&node.interface_set))
    }

    async fn instances_for_agent(&self, agent_name: &str, ids: &[String]) -> Result<Vec<String>> {
        let mut query: Vec<(&str, &str)> = vec![("agent_name", agent_name)];
        for id in ids {
            query.push(("id", system_id(id)));
        }
        let nodes = self.list_nodes(&query).await?;
        Ok(nodes.into_iter().map(|n| n.resource_uri).collect())
    }
}

/// Instance ids are node resource URIs, `/MAAS/api/1.0/nodes/<system id>/`.
pub fn system_id(instance_id: &str) -> &str {
    instance_id
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(instance_id)
}

fn interface_type(maas_type: &str) -> &str {
    match maas_type {
        "physical" => "ethernet",
        "vlan" => "802.1q",
        other => other,
    }
}

fn config_type(link_mode: &str) -> &str {
    match link_mode {
        "static" | "auto" => "static",
        "dhcp" => "dynamic",
        "link_up" => "manual",
        _ => "",
    }
}

/// Flatten MAAS interfaces into one entry per link; unlinked interfaces
/// still get one entry so the device itself is known.
fn interface_infos(interfaces: &[Interface]) -> Vec<InterfaceInfo> {
    let mut result = Vec::new();
    for iface in interfaces {
        let base = InterfaceInfo {
            interface_name: iface.name.clone(),
            parent_interface_name: iface.parents.first().cloned().unwrap_or_default(),
            interface_type: interface_type(&iface.interface_type).to_string(),
            provider_id: iface.id.to_string(),
            mac_address: iface.mac_address.clone(),
            mtu: iface.effective_mtu,
            disabled: !iface.enabled,
            no_auto_start: false,
            ..Default::default()
        };
        if iface.links.is_empty() {
            result.push(base);
            continue;
        }
        for link in &iface.links {
            let mut info = base.clone();
            info.provider_address_id = link.id.to_string();
            info.config_type = config_type(&link.mode).to_string();
            if let Some(subnet) = &link.subnet {
                info.cidr = subnet.cidr.clone();
                info.dns_servers = subnet.dns_servers.clone();
                info.gateway_address = subnet.gateway_ip.clone().unwrap_or_default();
            }
            info.address = link.ip_address.clone().unwrap_or_default();
            result.push(info);
        }
    }
    result
}
