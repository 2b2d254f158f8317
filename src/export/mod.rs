pub mod config;
pub mod description;
pub mod exporter;
pub mod maas;
pub mod names;

use anyhow::{Context, Result};

pub use description::Model;

use crate::state::SourceState;

/// Export the environment as a v2 model description, with MAAS networking
/// filled in when the environment runs on MAAS.
pub async fn export_model(st: &SourceState) -> Result<Model> {
    let mut model = exporter::export(st, None).await?;
    if model.cloud_type() == Some("maas") {
        let environ_config = st.environ_config().await?;
        let client = maas::client_from_config(&environ_config)?;
        maas::add_network_entities(&mut model, &client)
            .await
            .context("adding MAAS network entities")?;
    }
    Ok(model)
}
