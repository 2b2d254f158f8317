use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::BTreeSet;

use super::description::{IpAddress, LinkLayerDevice, Model};
use crate::provider::maas::{InterfaceInfo, MaasApi, MaasClient};
use crate::state::Document;

/// v1 never stored link-layer devices or addresses. On MAAS they can be
/// read back from the provider for every top-level machine with an
/// instance; containers aren't MAAS nodes.
pub async fn add_network_entities(model: &mut Model, api: &dyn MaasApi) -> Result<()> {
    let machines: Vec<(String, String)> = model
        .machines
        .iter()
        .filter_map(|m| {
            let instance = m.instance.as_ref()?;
            (!instance.instance_id.is_empty()).then(|| (m.id.clone(), instance.instance_id.clone()))
        })
        .collect();

    for (machine_id, instance_id) in machines {
        let interfaces = api
            .network_interfaces(&instance_id)
            .await
            .with_context(|| format!("getting network interfaces for {:?}", instance_id))?;
        tracing::debug!(machine = %machine_id, "Got {} network links", interfaces.len());
        add_machine_interfaces(model, &machine_id, &interfaces);
    }
    Ok(())
}

fn add_machine_interfaces(model: &mut Model, machine_id: &str, interfaces: &[InterfaceInfo]) {
    let mut seen = BTreeSet::new();
    for iface in interfaces {
        if seen.insert(iface.interface_name.clone()) {
            model.link_layer_devices.push(LinkLayerDevice {
                name: iface.interface_name.clone(),
                mtu: iface.mtu,
                provider_id: iface.provider_id.clone(),
                machine_id: machine_id.to_string(),
                device_type: iface.interface_type.clone(),
                mac_address: iface.mac_address.clone(),
                is_auto_start: !iface.no_auto_start,
                is_up: !iface.disabled,
                parent_name: iface.parent_interface_name.clone(),
            });
        }
        if iface.address.is_empty() {
            continue;
        }
        model.ip_addresses.push(IpAddress {
            provider_id: iface.provider_address_id.clone(),
            device_name: iface.interface_name.clone(),
            machine_id: machine_id.to_string(),
            subnet_cidr: iface.cidr.clone(),
            config_method: iface.config_type.clone(),
            value: iface.address.clone(),
            dns_servers: iface.dns_servers.clone(),
            dns_search_domains: iface.dns_search_domains.clone(),
            gateway_address: iface.gateway_address.clone(),
        });
    }
}

/// Client for the environment's MAAS, from its environ config.
pub fn client_from_config(environ_config: &Document) -> Result<MaasClient> {
    let server = environ_config
        .get("maas-server")
        .and_then(Value::as_str)
        .context("maas-server is missing from the environ config")?;
    let oauth = environ_config
        .get("maas-oauth")
        .and_then(Value::as_str)
        .context("maas-oauth is missing from the environ config")?;
    MaasClient::new(server, oauth)
}
