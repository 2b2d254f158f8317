use anyhow::{bail, Context, Result};

use crate::error::UpgradeError;

const MODEL_UUID_HEADER: &str = "X-Juju-Migration-Model-UUID";

/// HTTPS uploads into a model that is being imported.
pub struct UploadClient {
    http: reqwest::Client,
    base_url: String,
    tag: String,
    password: String,
}

impl UploadClient {
    pub fn new(addr: &str, tag: &str, password: &str) -> Result<Self> {
        // Controllers present a certificate signed by their own CA.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: format!("https://{}", addr),
            tag: tag.to_string(),
            password: password.to_string(),
        })
    }

    /// `version` is the full binary version, `2.2.9-xenial-amd64`.
    pub async fn upload_tools(&self, model_uuid: &str, version: &str, archive: Vec<u8>) -> Result<()> {
        let query = [("binaryVersion", version.to_string())];
        self.post(model_uuid, "/migrate/tools", &query, "application/x-tar-gz", archive)
            .await
            .with_context(|| format!("uploading tools {}", version))
    }

    pub async fn upload_charm(&self, model_uuid: &str, curl: &str, archive: Vec<u8>) -> Result<()> {
        let query = charm_query(curl)?;
        self.post(model_uuid, "/migrate/charms", &query, "application/zip", archive)
            .await
            .with_context(|| format!("uploading charm {}", curl))
    }

    async fn post(
        &self,
        model_uuid: &str,
        path: &str,
        query: &[(&str, String)],
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(url = %url, bytes = body.len(), "Uploading");
        let resp = self
            .http
            .post(&url)
            .query(query)
            .basic_auth(&self.tag, Some(&self.password))
            .header(MODEL_UUID_HEADER, model_uuid)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to POST {}", url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(UpgradeError::Protocol {
                context: format!("POST {} returned {}", path, status),
                body,
            }
            .into());
        }
        Ok(())
    }
}

/// Query parameters describing a charm URL such as `cs:~user/trusty/mysql-42`.
pub fn charm_query(curl: &str) -> Result<Vec<(&'static str, String)>> {
    let Some((schema, rest)) = curl.split_once(':') else {
        bail!("charm URL {:?} has no schema", curl);
    };
    let mut parts: Vec<&str> = rest.split('/').collect();
    let user = match parts.first() {
        Some(first) if first.starts_with('~') => {
            let user = first.trim_start_matches('~').to_string();
            parts.remove(0);
            user
        }
        _ => String::new(),
    };
    let (series, name_rev) = match parts.as_slice() {
        [series, name_rev] => (series.to_string(), *name_rev),
        [name_rev] => (String::new(), *name_rev),
        _ => bail!("charm URL {:?} is not valid", curl),
    };
    let (name, revision) = match name_rev.rsplit_once('-') {
        Some((name, rev)) if rev.parse::<i64>().is_ok() => (name.to_string(), rev.to_string()),
        _ => (name_rev.to_string(), "-1".to_string()),
    };

    Ok(vec![
        ("schema", schema.to_string()),
        ("user", user),
        ("series", series),
        ("name", name),
        ("revision", revision),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_map(query: Vec<(&'static str, String)>) -> std::collections::BTreeMap<&'static str, String> {
        query.into_iter().collect()
    }

    #[test]
    fn test_charm_query_store_charm() {
        let q = as_map(charm_query("cs:trusty/mysql-42").unwrap());
        assert_eq!(q["schema"], "cs");
        assert_eq!(q["user"], "");
        assert_eq!(q["series"], "trusty");
        assert_eq!(q["name"], "mysql");
        assert_eq!(q["revision"], "42");
    }

    #[test]
    fn test_charm_query_user_and_hyphenated_name() {
        let q = as_map(charm_query("cs:~bob/xenial/nova-compute-7").unwrap());
        assert_eq!(q["user"], "bob");
        assert_eq!(q["name"], "nova-compute");
        assert_eq!(q["revision"], "7");
    }

    #[test]
    fn test_charm_query_rejects_missing_schema() {
        assert!(charm_query("trusty/mysql-1").is_err());
    }
}
