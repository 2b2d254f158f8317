pub mod client;
pub mod rpc;

use anyhow::{Context, Result};
use async_trait::async_trait;

pub use client::UploadClient;
pub use rpc::{LoginResult, RpcClient};

use crate::config::store::ControllerInfo;
use crate::tools::{ControllerDetails, ToolsInfo};

/// The v2 controller's side of a model migration.
#[async_trait]
pub trait MigrationTarget: Send + Sync {
    /// Submit a serialized model. The controller keeps it pending until it
    /// is activated or aborted.
    async fn import(&self, serialized: &[u8]) -> Result<()>;

    /// Problems the controller sees between the imported machines and the
    /// cloud. Empty when everything matches.
    async fn check_machines(&self, model_uuid: &str) -> Result<Vec<String>>;

    async fn upload_tools(&self, model_uuid: &str, tools: &ToolsInfo, archive: Vec<u8>) -> Result<()>;

    async fn upload_charm(&self, model_uuid: &str, curl: &str, archive: Vec<u8>) -> Result<()>;

    async fn activate(&self, model_uuid: &str) -> Result<()>;

    async fn abort(&self, model_uuid: &str) -> Result<()>;
}

/// A logged-in connection to a v2 controller: the websocket API for the
/// migration facade and plain HTTPS for blob uploads.
pub struct ControllerConnection {
    rpc: RpcClient,
    uploads: UploadClient,
    login: LoginResult,
    addr: String,
    ca_cert: String,
}

impl ControllerConnection {
    /// Try each API address in turn and keep the first one that accepts the
    /// login.
    pub async fn connect(info: &ControllerInfo) -> Result<Self> {
        let mut last_err = None;
        for addr in &info.addrs {
            match RpcClient::connect(addr, &info.ca_cert).await {
                Ok(rpc) => {
                    let login = rpc
                        .login(&info.tag, &info.password)
                        .await
                        .with_context(|| format!("logging in to {}", addr))?;
                    tracing::debug!(addr = %addr, version = %login.server_version, "Connected to controller");
                    let uploads = UploadClient::new(addr, &info.tag, &info.password)?;
                    return Ok(Self {
                        rpc,
                        uploads,
                        login,
                        addr: addr.clone(),
                        ca_cert: info.ca_cert.clone(),
                    });
                }
                Err(e) => {
                    tracing::debug!(addr = %addr, "Dial failed: {:#}", e);
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e.context("connecting to target controller")),
            None => anyhow::bail!("no controller addresses"),
        }
    }

    /// `host:port` of the API server this connection is using.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn details(&self) -> ControllerDetails {
        ControllerDetails {
            version: self.login.server_version.clone(),
            addresses: self.login.api_addresses(),
            uuid: self.login.controller_uuid().to_string(),
            ca_cert: self.ca_cert.clone(),
        }
    }

    pub async fn close(self) {
        self.rpc.close().await;
    }
}

fn model_tag(model_uuid: &str) -> String {
    format!("model-{}", model_uuid)
}

const FACADE: &str = "MigrationTarget";
const FACADE_VERSION: u32 = 1;

#[async_trait]
impl MigrationTarget for ControllerConnection {
    async fn import(&self, serialized: &[u8]) -> Result<()> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;

        let params = serde_json::json!({ "bytes": STANDARD.encode(serialized) });
        self.rpc.call(FACADE, FACADE_VERSION, "Import", params).await?;
        Ok(())
    }

    async fn check_machines(&self, model_uuid: &str) -> Result<Vec<String>> {
        let params = serde_json::json!({ "model-tag": model_tag(model_uuid) });
        let response = self
            .rpc
            .call(FACADE, FACADE_VERSION, "CheckMachines", params)
            .await?;
        Ok(rpc::error_results(&response))
    }

    async fn upload_tools(&self, model_uuid: &str, tools: &ToolsInfo, archive: Vec<u8>) -> Result<()> {
        self.uploads.upload_tools(model_uuid, &tools.version, archive).await
    }

    async fn upload_charm(&self, model_uuid: &str, curl: &str, archive: Vec<u8>) -> Result<()> {
        self.uploads.upload_charm(model_uuid, curl, archive).await
    }

    async fn activate(&self, model_uuid: &str) -> Result<()> {
        let params = serde_json::json!({ "model-tag": model_tag(model_uuid) });
        self.rpc.call(FACADE, FACADE_VERSION, "Activate", params).await?;
        Ok(())
    }

    async fn abort(&self, model_uuid: &str) -> Result<()> {
        let params = serde_json::json!({ "model-tag": model_tag(model_uuid) });
        self.rpc.call(FACADE, FACADE_VERSION, "Abort", params).await?;
        Ok(())
    }
}
