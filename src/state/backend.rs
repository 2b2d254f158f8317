use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// One raw document as stored in the v1 database, with extended JSON
/// already reduced to plain values.
pub type Document = Map<String, Value>;

/// Read access to the v1 state database.
/// Implemented by the live database on the API server and by dump files.
#[async_trait]
pub trait SourceDb: Send + Sync {
    /// Names of every collection in the state database.
    async fn collection_names(&self) -> Result<Vec<String>>;

    /// Every document in a collection, in no particular order. A collection
    /// that doesn't exist is empty.
    async fn collection(&self, name: &str) -> Result<Vec<Document>>;

    /// Contents of a stored blob (charm archives) by its storage path.
    async fn blob(&self, env_uuid: &str, path: &str) -> Result<Vec<u8>>;

    /// Set attributes on the environ config settings document. This is the
    /// only write the upgrader makes to the v1 database.
    async fn update_environ_config(&self, env_uuid: &str, attrs: &Document) -> Result<()>;
}

// ─── Document helpers ───────────────────────────────────────────────────────

/// The `_id` of a document as a string, if it is one.
pub fn doc_id(doc: &Document) -> Option<&str> {
    doc.get("_id").and_then(Value::as_str)
}

/// Ordering used whenever documents are listed "by id".
pub fn compare_ids(a: &Document, b: &Document) -> std::cmp::Ordering {
    id_key(a).cmp(&id_key(b))
}

fn id_key(doc: &Document) -> String {
    match doc.get("_id") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}
