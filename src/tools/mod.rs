pub mod script;
pub mod upgrade;
pub mod wrangler;

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};

pub use upgrade::{clear_saved_machines, rollback_agents, upgrade_agents, ControllerDetails};
pub use wrangler::{ToolsInfo, ToolsWrangler};

use crate::export::description::{AgentTools, Model};

/// Replace every machine's and unit's tools with the controller's tools
/// for the same series and architecture. Containers are included.
pub async fn update_tools_in_model(model: &mut Model, wrangler: &ToolsWrangler) -> Result<BTreeMap<String, ToolsInfo>> {
    let mut needed = BTreeSet::new();
    for machine in model.all_machines() {
        needed.insert(tools_series_arch(machine.tools.as_ref(), &machine.id)?);
    }
    for app in &model.applications {
        for unit in &app.units {
            needed.insert(tools_series_arch(unit.tools.as_ref(), &unit.name)?);
        }
    }

    let mut fetched = BTreeMap::new();
    for series_arch in needed {
        let info = wrangler.get_tools(&series_arch).await?;
        fetched.insert(series_arch, info);
    }

    let replacement = |current: &Option<AgentTools>, owner: &str| -> Result<AgentTools> {
        let series_arch = tools_series_arch(current.as_ref(), owner)?;
        fetched
            .get(&series_arch)
            .map(ToolsInfo::agent_tools)
            .ok_or_else(|| anyhow::anyhow!("no tools fetched for {}", series_arch))
    };
    model.for_each_machine_mut(|machine| {
        machine.tools = Some(replacement(&machine.tools, &machine.id)?);
        Ok(())
    })?;
    for app in &mut model.applications {
        for unit in &mut app.units {
            unit.tools = Some(replacement(&unit.tools, &unit.name)?);
        }
    }
    Ok(fetched)
}

fn tools_series_arch(tools: Option<&AgentTools>, owner: &str) -> Result<String> {
    tools
        .and_then(AgentTools::series_arch)
        .ok_or_else(|| anyhow::anyhow!("agent tools for {} not found", owner))
}
