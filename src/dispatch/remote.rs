use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::config::agent::{AgentConfig, MachineTag};
use crate::config::store::ControllerInfo;
use crate::config::Settings;
use crate::state::{DumpFileDb, MongoExportDb, SourceDb, SourceState};
use crate::target::ControllerConnection;

/// The impl half's view of the API server machine it runs on.
pub struct RemoteContext {
    pub settings: Settings,
    pub tag: MachineTag,
    pub agent_config: AgentConfig,
}

impl RemoteContext {
    /// Find this machine's agent and read its config. Works before and
    /// after `upgrade-agents` has rewritten it.
    pub fn discover(settings: &Settings) -> Result<Self> {
        let (tag, agent_config) =
            AgentConfig::for_current_machine(&settings.data_dir).context("finding machine tag")?;
        tracing::info!("current machine tag: {}", tag);
        Ok(Self {
            settings: settings.clone(),
            tag,
            agent_config,
        })
    }

    pub fn model_uuid(&self) -> Result<String> {
        self.agent_config.model_uuid()
    }

    /// Open the live v1 state for this machine's environment.
    pub async fn open_state(&self) -> Result<SourceState> {
        let info = self.agent_config.mongo_info()?;
        let db = MongoExportDb::new(&self.settings.mongo, info);
        let uuid = self.model_uuid()?;
        SourceState::open(Arc::new(db), Some(&uuid))
            .await
            .context("opening state connection")
    }
}

/// Source state from a `dump-source-db` file instead of the live database.
pub async fn open_dump_state(path: &Path) -> Result<SourceState> {
    let db: Arc<dyn SourceDb> = Arc::new(DumpFileDb::open(path)?);
    SourceState::open(db, None).await.context("opening dump state")
}

/// Decode the controller info handed over by the client half and log in.
pub async fn connect_controller(encoded: &str) -> Result<ControllerConnection> {
    let info = ControllerInfo::decode(encoded)?;
    ControllerConnection::connect(&info)
        .await
        .context("getting controller connection")
}
