use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use super::backend::{compare_ids, doc_id, Document, SourceDb};

/// mgo's transaction bookkeeping. Never dumped.
const TXN_COLLECTIONS: &[&str] = &["txns", "txns.log"];
const TXN_FIELDS: &[&str] = &["txn-revno", "txn-queue"];

/// Snapshot every collection: documents sorted by `_id`, transaction fields
/// stripped, empty collections left out.
pub async fn dump_all(db: &dyn SourceDb) -> Result<BTreeMap<String, Vec<Document>>> {
    let mut result = BTreeMap::new();
    for name in db.collection_names().await? {
        if TXN_COLLECTIONS.contains(&name.as_str()) {
            continue;
        }
        let mut docs = db
            .collection(&name)
            .await
            .with_context(|| format!("reading collection {:?}", name))?;
        if docs.is_empty() {
            continue;
        }
        docs.sort_by(compare_ids);
        for doc in docs.iter_mut() {
            for field in TXN_FIELDS {
                doc.remove(*field);
            }
        }
        result.insert(name, docs);
    }
    Ok(result)
}

// ─── Dump file backend ──────────────────────────────────────────────────────

/// A database snapshot in the YAML form written by `dump-source-db`. Charm
/// blobs are looked up as files under `blob_dir`, keyed by storage path.
pub struct DumpFileDb {
    collections: RwLock<BTreeMap<String, Vec<Document>>>,
    blob_dir: Option<PathBuf>,
}

impl DumpFileDb {
    pub fn new(collections: BTreeMap<String, Vec<Document>>) -> Self {
        Self {
            collections: RwLock::new(collections),
            blob_dir: None,
        }
    }

    /// Load a dump file. Blobs are expected in a `<file stem>-blobs`
    /// directory next to it.
    pub fn open(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading dump {}", path.display()))?;
        let mut db = Self::from_yaml(&content)
            .with_context(|| format!("parsing dump {}", path.display()))?;

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let blobs = path.with_file_name(format!("{}-blobs", stem));
        if blobs.is_dir() {
            db.blob_dir = Some(blobs);
        }
        Ok(db)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let parsed: BTreeMap<String, Vec<Value>> = serde_yaml::from_str(content)?;
        let mut collections = BTreeMap::new();
        for (name, values) in parsed {
            let docs = values
                .into_iter()
                .filter_map(|v| match v {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect();
            collections.insert(name, docs);
        }
        Ok(Self::new(collections))
    }

    pub fn with_blob_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.blob_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl SourceDb for DumpFileDb {
    async fn collection_names(&self) -> Result<Vec<String>> {
        Ok(self.collections.read().await.keys().cloned().collect())
    }

    async fn collection(&self, name: &str) -> Result<Vec<Document>> {
        Ok(self
            .collections
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn blob(&self, _env_uuid: &str, path: &str) -> Result<Vec<u8>> {
        let Some(dir) = &self.blob_dir else {
            anyhow::bail!("blob {:?} not found: dump has no blob directory", path);
        };
        let file = dir.join(path);
        tokio::fs::read(&file)
            .await
            .with_context(|| format!("reading blob {}", file.display()))
    }

    async fn update_environ_config(&self, env_uuid: &str, attrs: &Document) -> Result<()> {
        let key = format!("{}:e", env_uuid);
        let mut collections = self.collections.write().await;
        let settings = collections.entry("settings".to_string()).or_default();
        let Some(doc) = settings.iter_mut().find(|d| doc_id(d) == Some(key.as_str())) else {
            anyhow::bail!("environ config {:?} not found", key);
        };
        for (k, v) in attrs {
            doc.insert(k.clone(), v.clone());
        }
        Ok(())
    }
}
