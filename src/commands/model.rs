use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

use crate::config::Settings;
use crate::export::export_model;
use crate::state::SourceState;
use crate::target::MigrationTarget;
use crate::tools::{clear_saved_machines, rollback_agents, update_tools_in_model, ToolsInfo, ToolsWrangler};

/// Export the environment, point its tools at the controller's, and import
/// it as a pending model. Blobs follow the model. A failure after the model
/// reached the controller aborts it there, unless `keep_broken` is set.
pub async fn import_model(
    st: &SourceState,
    target: &dyn MigrationTarget,
    wrangler: &ToolsWrangler,
    keep_broken: bool,
) -> Result<()> {
    let model_uuid = st.environ_uuid().to_string();
    tracing::debug!("exporting model from source environment {}", model_uuid);
    let mut model = export_model(st).await.context("exporting")?;

    // The exported tools must be the ones the agents will run.
    let tools = update_tools_in_model(&mut model, wrangler).await?;
    let charm_urls: BTreeSet<String> = model
        .applications
        .iter()
        .map(|app| app.charm_url.clone())
        .collect();
    let serialized = model
        .serialize()
        .context("serializing model representation")?;

    tracing::debug!("importing model {} to target controller", model_uuid);
    let result = import_and_transfer(st, target, &model_uuid, serialized.as_bytes(), &tools, &charm_urls).await;
    if result.is_err() && !keep_broken {
        tracing::debug!("cleaning up failed import");
        if let Err(cleanup) = target.abort(&model_uuid).await {
            tracing::error!("cleanup failed: {:#}", cleanup);
        }
    }
    result
}

async fn import_and_transfer(
    st: &SourceState,
    target: &dyn MigrationTarget,
    model_uuid: &str,
    serialized: &[u8],
    tools: &BTreeMap<String, ToolsInfo>,
    charm_urls: &BTreeSet<String>,
) -> Result<()> {
    target
        .import(serialized)
        .await
        .context("importing model on target controller")?;

    let problems = target
        .check_machines(model_uuid)
        .await
        .context("checking machines")?;
    if !problems.is_empty() {
        for problem in &problems {
            tracing::error!("{}", problem);
        }
        bail!("machine check failed: {}", problems.join("; "));
    }

    for info in tools.values() {
        tracing::info!("Uploading tools {}", info.version);
        let archive = tokio::fs::read(&info.path)
            .await
            .with_context(|| format!("reading {}", info.path.display()))?;
        target
            .upload_tools(model_uuid, info, archive)
            .await
            .with_context(|| format!("uploading tools {}", info.version))?;
    }

    let charms = st.charms().await.context("getting charms")?;
    for curl in charm_urls {
        let Some(charm) = charms.get(curl) else {
            bail!("charm {} not found in source environment", curl);
        };
        tracing::info!("Uploading charm {}", curl);
        let archive = st.charm_archive(charm).await?;
        target
            .upload_charm(model_uuid, curl, archive)
            .await
            .with_context(|| format!("uploading charm {}", curl))?;
    }
    Ok(())
}

/// Make the imported model live. Only after every agent was upgraded.
pub async fn activate_model(target: &dyn MigrationTarget, model_uuid: &str) -> Result<()> {
    target
        .activate(model_uuid)
        .await
        .context("activating new model")?;
    println!("model {:?} activated", model_uuid);
    Ok(())
}

/// Activate the model and close out the upgrade: once the model is live
/// there is nothing left to roll back.
pub async fn activate_upgrade(
    settings: &Settings,
    target: &dyn MigrationTarget,
    model_uuid: &str,
) -> Result<()> {
    activate_model(target, model_uuid).await?;
    clear_saved_machines(settings)
}

pub async fn abort_model(target: &dyn MigrationTarget, model_uuid: &str) -> Result<()> {
    target
        .abort(model_uuid)
        .await
        .context("aborting new model")?;
    println!("model {:?} aborted", model_uuid);
    Ok(())
}

/// Abort the pending model and roll back the agents. The rollback runs
/// even when aborting the model fails; the model error is the one
/// returned.
pub async fn abort_upgrade<F>(settings: &Settings, abort_import: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let model_err = abort_import.await.err();
    if let Some(e) = &model_err {
        tracing::error!("aborting model failed: {:#}", e);
    }

    let rollback = rollback_agents(settings).await;
    if let Err(e) = &rollback {
        tracing::error!("rolling back agent upgrades failed: {:#}", e);
    }

    match model_err {
        Some(e) => Err(e),
        None => rollback,
    }
}
