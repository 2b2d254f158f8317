use anyhow::{Context, Result};

use crate::container::migrate::{migrate_lxc, MigrateOptions};
use crate::container::ContainerContext;
use crate::export::export_model;
use crate::state::{dump_all, SourceState};

/// Check that the environment can be migrated: work out the container
/// conversions without doing them, then export the model. Returns the
/// serialized model.
///
/// Without a container context (an offline dump) the container check is
/// skipped.
pub async fn verify_source(st: &SourceState, containers: Option<&ContainerContext>) -> Result<String> {
    if let Some(ctx) = containers {
        let opts = MigrateOptions {
            dry_run: true,
            pattern: None,
        };
        migrate_lxc(ctx, st, &opts)
            .await
            .context("checking LXC migration")?;
    }

    tracing::debug!("exporting model from source environment {}", st.environ_uuid());
    let model = export_model(st).await.context("exporting")?;
    model.serialize().context("serializing model representation")
}

/// Every collection of the source database as YAML.
pub async fn dump_source_db(st: &SourceState) -> Result<String> {
    let data = dump_all(st.db())
        .await
        .context("dumping state collections")?;
    serde_yaml::to_string(&data).context("marshalling data")
}
