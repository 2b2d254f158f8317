use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::process::Stdio;
use tokio::process::Command;
use tracing;

use super::backend::{Document, SourceDb};
use crate::config::agent::MongoInfo;
use crate::config::settings::MongoSettings;

const STATE_DB: &str = "juju";
const BLOB_DB: &str = "blobstore";

/// The live v1 database, read through the mongo tools bundled with the v1
/// agent. Only usable on an API server machine.
pub struct MongoExportDb {
    settings: MongoSettings,
    info: MongoInfo,
}

impl MongoExportDb {
    pub fn new(settings: &MongoSettings, info: MongoInfo) -> Self {
        Self {
            settings: settings.clone(),
            info,
        }
    }

    fn host(&self) -> String {
        format!("localhost:{}", self.settings.port)
    }

    fn auth_args(&self) -> Vec<String> {
        vec![
            "--ssl".to_string(),
            "--sslAllowInvalidCertificates".to_string(),
            "--authenticationDatabase".to_string(),
            "admin".to_string(),
            "--username".to_string(),
            self.info.tag.clone(),
            "--password".to_string(),
            self.info.password.clone(),
        ]
    }

    /// Run a snippet in the mongo shell against `db` and return its stdout.
    async fn eval(&self, db: &str, script: &str) -> Result<String> {
        let mut args = vec!["--quiet".to_string()];
        args.extend(self.auth_args());
        args.push(format!("{}/{}", self.host(), db));
        args.push("--eval".to_string());
        args.push(script.to_string());

        let output = run_tool(&self.settings.shell_binary, &args).await?;
        Ok(output)
    }
}

#[async_trait]
impl SourceDb for MongoExportDb {
    async fn collection_names(&self) -> Result<Vec<String>> {
        let out = self
            .eval(STATE_DB, "print(db.getCollectionNames().join(\"\\n\"))")
            .await
            .context("listing collections")?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with("system."))
            .map(str::to_string)
            .collect())
    }

    async fn collection(&self, name: &str) -> Result<Vec<Document>> {
        let mut args = vec!["--quiet".to_string(), "--host".to_string(), self.host()];
        args.extend(self.auth_args());
        args.extend(
            ["--db", STATE_DB, "--collection", name, "--jsonArray"]
                .iter()
                .map(|s| s.to_string()),
        );

        tracing::debug!(collection = name, "Exporting collection");
        let out = run_tool(&self.settings.export_binary, &args)
            .await
            .with_context(|| format!("reading collection {:?}", name))?;
        parse_export(&out).with_context(|| format!("parsing collection {:?}", name))
    }

    async fn blob(&self, env_uuid: &str, path: &str) -> Result<Vec<u8>> {
        let managed_path = format!("buckets/{}/{}", env_uuid, path);
        let script = format!(
            "var m = db.managedStoredResources.findOne({{path: {}}}); \
             if (m) {{ var r = db.storedResources.findOne({{_id: m.resourceid}}); \
             if (r) {{ print(r.path); }} }}",
            serde_json::to_string(&managed_path)?
        );
        let grid_path = self.eval(BLOB_DB, &script).await?;
        let grid_path = grid_path.trim();
        if grid_path.is_empty() {
            bail!("blob {:?} not found", path);
        }

        let local = tempfile::NamedTempFile::new().context("creating blob temp file")?;
        let mut args = vec!["--quiet".to_string(), "--host".to_string(), self.host()];
        args.extend(self.auth_args());
        args.extend(
            ["--db", BLOB_DB, "--prefix", BLOB_DB, "--local"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push(local.path().display().to_string());
        args.push("get".to_string());
        args.push(grid_path.to_string());

        run_tool(&self.settings.files_binary, &args)
            .await
            .with_context(|| format!("fetching blob {:?}", path))?;
        tokio::fs::read(local.path())
            .await
            .with_context(|| format!("reading fetched blob {:?}", path))
    }

    async fn update_environ_config(&self, env_uuid: &str, attrs: &Document) -> Result<()> {
        let escaped: Map<String, Value> = attrs
            .iter()
            .map(|(k, v)| (escape_key(k), v.clone()))
            .collect();
        let script = format!(
            "var r = db.settings.update({{_id: {}}}, {{$set: {}}}); \
             if (r.nMatched !== 1) {{ print(\"matched \" + r.nMatched); quit(2); }}",
            serde_json::to_string(&format!("{}:e", env_uuid))?,
            serde_json::to_string(&escaped)?
        );
        self.eval(STATE_DB, &script)
            .await
            .context("updating environ config")?;
        Ok(())
    }
}

async fn run_tool(binary: &str, args: &[String]) -> Result<String> {
    let output = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("Failed to run {}", binary))?;

    if !output.status.success() {
        bail!(
            "{} exited {}: {}",
            binary,
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `mongoexport --jsonArray` output. Older exporters write one
/// document per line instead, so that is accepted too.
pub fn parse_export(out: &str) -> Result<Vec<Document>> {
    let trimmed = out.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let values: Vec<Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        trimmed
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?
    };

    let mut docs = Vec::with_capacity(values.len());
    for value in values {
        match normalize_extended(value) {
            Value::Object(map) => docs.push(map),
            other => bail!("expected document, got {}", other),
        }
    }
    Ok(docs)
}

/// Reduce MongoDB extended JSON wrappers to plain JSON: object ids become
/// strings, 64-bit integers become numbers, dates become RFC 3339 strings
/// and binary data stays base64.
pub fn normalize_extended(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_extended).collect()),
        Value::Object(map) => {
            if map.len() <= 2 {
                if let Some(v) = unwrap_special(&map) {
                    return v;
                }
            }
            Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, normalize_extended(v)))
                    .collect(),
            )
        }
        other => other,
    }
}

fn unwrap_special(map: &Map<String, Value>) -> Option<Value> {
    if let Some(Value::String(oid)) = map.get("$oid") {
        return Some(Value::String(oid.clone()));
    }
    if let Some(Value::String(n)) = map.get("$numberLong").or_else(|| map.get("$numberInt")) {
        return n.parse::<i64>().ok().map(Value::from);
    }
    if let Some(Value::String(n)) = map.get("$numberDouble") {
        return n.parse::<f64>().ok().map(Value::from);
    }
    if let Some(date) = map.get("$date") {
        let millis = match date {
            Value::String(s) => return Some(Value::String(s.clone())),
            Value::Number(n) => n.as_i64()?,
            Value::Object(inner) => inner.get("$numberLong")?.as_str()?.parse::<i64>().ok()?,
            _ => return None,
        };
        let dt = chrono::DateTime::from_timestamp_millis(millis)?;
        return Some(Value::String(dt.to_rfc3339()));
    }
    if let Some(binary) = map.get("$binary") {
        return match binary {
            Value::String(b64) => Some(Value::String(b64.clone())),
            Value::Object(inner) => inner.get("base64").cloned(),
            _ => None,
        };
    }
    if let Some(Value::Object(ts)) = map.get("$timestamp") {
        return ts.get("t").cloned();
    }
    None
}

/// Settings keys can't contain `.` or `$` in the v1 database.
pub fn escape_key(key: &str) -> String {
    key.replace('.', "\u{ff0e}").replace('$', "\u{ff04}")
}

pub fn unescape_key(key: &str) -> String {
    key.replace('\u{ff0e}', ".").replace('\u{ff04}', "$")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_nested_wrappers() {
        let raw = json!({
            "_id": {"$oid": "5a1b"},
            "updated": {"$numberLong": "1500000000000000000"},
            "when": {"$date": 0},
            "data": [{"n": {"$numberLong": "7"}}],
        });
        let v = normalize_extended(raw);
        assert_eq!(v["_id"], "5a1b");
        assert_eq!(v["updated"], 1_500_000_000_000_000_000i64);
        assert_eq!(v["when"], "1970-01-01T00:00:00+00:00");
        assert_eq!(v["data"][0]["n"], 7);
    }

    #[test]
    fn test_parse_line_per_document() {
        let out = "{\"_id\": \"a\"}\n{\"_id\": \"b\"}\n";
        let docs = parse_export(out).unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[test]
    fn test_escape_roundtrip() {
        assert_eq!(unescape_key(&escape_key("a.b$c")), "a.b$c");
    }
}
