//! JSON document store.
//!
//! Documents live in one SQLite table keyed by `(collection, id)`; filters
//! are evaluated with `json_extract`. The connection sits behind a mutex and
//! every query runs on the blocking pool.

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

pub const ID_FIELD: &str = "_id";

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no document in {collection} matching {filter}")]
    NotFound { collection: String, filter: String },

    #[error("invalid field: {0}")]
    InvalidField(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("document json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Id(String),
    /// Top-level string field equals `value`.
    FieldEq { field: String, value: String },
    /// Top-level field absent or null.
    FieldMissing(String),
    All,
}

impl Filter {
    pub fn id(id: impl Into<String>) -> Self {
        Self::Id(id.into())
    }

    pub fn field_eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::FieldEq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Self::FieldMissing(field.into())
    }

    fn describe(&self) -> String {
        match self {
            Self::Id(id) => format!("{ID_FIELD}={id}"),
            Self::FieldEq { field, value } => format!("{field}={value}"),
            Self::FieldMissing(field) => format!("{field} missing"),
            Self::All => "all".to_string(),
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Inserts `doc` (a JSON object) and returns its new id, also stored as `_id`.
    async fn insert(&self, collection: &str, doc: Value) -> StoreResult<String>;

    async fn find_one(&self, collection: &str, filter: Filter) -> StoreResult<Value>;

    /// Matching documents in insertion order.
    async fn find_many(&self, collection: &str, filter: Filter) -> StoreResult<Vec<Value>>;

    /// Sets top-level `fields` on one document; other fields are untouched.
    async fn update_fields(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> StoreResult<()>;
}

#[derive(Clone)]
pub struct SqliteDocumentStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDocumentStore {
    #[tracing::instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(&path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            Ok::<_, StoreError>(conn)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))??;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS documents (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    body TEXT NOT NULL,
    UNIQUE (collection, id)
);
"#,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    #[tracing::instrument(level = "debug", skip_all, fields(collection = %collection))]
    async fn insert(&self, collection: &str, doc: Value) -> StoreResult<String> {
        let Value::Object(mut body) = doc else {
            return Err(StoreError::InvalidField(
                "documents must be json objects".to_string(),
            ));
        };
        let id = ulid::Ulid::new().to_string();
        body.insert(ID_FIELD.to_string(), Value::String(id.clone()));
        let text = serde_json::to_string(&Value::Object(body))?;
        let collection = collection.to_string();
        let row_id = id.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO documents (collection, id, body) VALUES (?1, ?2, ?3)",
                params![collection, row_id, text],
            )?;
            Ok(())
        })
        .await?;
        Ok(id)
    }

    async fn find_one(&self, collection: &str, filter: Filter) -> StoreResult<Value> {
        let (clause, args) = where_clause(&filter)?;
        let sql = format!(
            "SELECT body FROM documents WHERE collection = ?1 AND {clause} ORDER BY seq ASC LIMIT 1"
        );
        let owned_collection = collection.to_string();
        let body: Option<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare_cached(&sql)?;
                let params = bind(&owned_collection, &args);
                Ok(stmt
                    .query_row(rusqlite::params_from_iter(params), |row| row.get(0))
                    .optional()?)
            })
            .await?;
        match body {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Err(StoreError::NotFound {
                collection: collection.to_string(),
                filter: filter.describe(),
            }),
        }
    }

    async fn find_many(&self, collection: &str, filter: Filter) -> StoreResult<Vec<Value>> {
        let (clause, args) = where_clause(&filter)?;
        let sql = format!(
            "SELECT body FROM documents WHERE collection = ?1 AND {clause} ORDER BY seq ASC"
        );
        let collection = collection.to_string();
        let bodies: Vec<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare_cached(&sql)?;
                let params = bind(&collection, &args);
                let rows = stmt.query_map(rusqlite::params_from_iter(params), |row| row.get(0))?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;
        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(StoreError::from))
            .collect()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(collection = %collection, id = %id))]
    async fn update_fields(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> StoreResult<()> {
        if let Some(key) = fields.keys().find(|k| *k == ID_FIELD || !valid_field(k)) {
            return Err(StoreError::InvalidField(format!(
                "cannot update field {key:?}"
            )));
        }
        let owned_collection = collection.to_string();
        let owned_id = id.to_string();
        let updated = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let body: Option<String> = tx
                    .query_row(
                        "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
                        params![owned_collection, owned_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(body) = body else {
                    return Ok(false);
                };
                let mut doc: Map<String, Value> = serde_json::from_str(&body)?;
                doc.extend(fields);
                tx.execute(
                    "UPDATE documents SET body = ?3 WHERE collection = ?1 AND id = ?2",
                    params![owned_collection, owned_id, serde_json::to_string(&doc)?],
                )?;
                tx.commit()?;
                Ok(true)
            })
            .await?;
        if updated {
            Ok(())
        } else {
            Err(StoreError::NotFound {
                collection: collection.to_string(),
                filter: Filter::id(id).describe(),
            })
        }
    }
}

fn valid_field(field: &str) -> bool {
    !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn json_path(field: &str) -> StoreResult<String> {
    if !valid_field(field) {
        return Err(StoreError::InvalidField(format!(
            "filter field {field:?} must be [A-Za-z0-9_]+"
        )));
    }
    Ok(format!("$.{field}"))
}

/// SQL predicate plus its positional arguments, numbered from `?2`.
fn where_clause(filter: &Filter) -> StoreResult<(String, Vec<String>)> {
    Ok(match filter {
        Filter::Id(id) => ("id = ?2".to_string(), vec![id.clone()]),
        Filter::FieldEq { field, value } => (
            "json_extract(body, ?2) = ?3 AND json_type(body, ?2) = 'text'".to_string(),
            vec![json_path(field)?, value.clone()],
        ),
        Filter::FieldMissing(field) => (
            "(json_type(body, ?2) IS NULL OR json_type(body, ?2) = 'null')".to_string(),
            vec![json_path(field)?],
        ),
        Filter::All => ("1 = 1".to_string(), Vec::new()),
    })
}

fn bind(collection: &str, args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len() + 1);
    out.push(collection.to_string());
    out.extend(args.iter().cloned());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[tokio::test]
    async fn insert_assigns_id_and_find_one_reads_it_back() {
        let store = SqliteDocumentStore::open_in_memory().expect("store");
        let id = store
            .insert("forward_views", json!({ "count": 2, "messages": [] }))
            .await
            .expect("insert");

        let doc = store
            .find_one("forward_views", Filter::id(&id))
            .await
            .expect("find");
        assert_eq!(doc["_id"], id.as_str());
        assert_eq!(doc["count"], 2);
    }

    #[tokio::test]
    async fn collections_are_isolated() {
        let store = SqliteDocumentStore::open_in_memory().expect("store");
        let id = store
            .insert("forward_messages", json!({ "count": 0 }))
            .await
            .expect("insert");
        let err = store
            .find_one("forward_views", Filter::id(&id))
            .await
            .expect_err("other collection");
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn update_fields_merges_without_touching_others() {
        let store = SqliteDocumentStore::open_in_memory().expect("store");
        let id = store
            .insert("forward_views", json!({ "count": 1, "messages": ["m"] }))
            .await
            .expect("insert");
        store
            .update_fields("forward_views", &id, fields(json!({ "title": "Grape Star" })))
            .await
            .expect("update");

        let doc = store
            .find_one("forward_views", Filter::id(&id))
            .await
            .expect("find");
        assert_eq!(doc["title"], "Grape Star");
        assert_eq!(doc["messages"], json!(["m"]));
        assert_eq!(doc["_id"], id.as_str());
    }

    #[tokio::test]
    async fn update_rejects_id_and_unknown_documents() {
        let store = SqliteDocumentStore::open_in_memory().expect("store");
        let id = store
            .insert("forward_views", json!({}))
            .await
            .expect("insert");
        assert!(matches!(
            store
                .update_fields("forward_views", &id, fields(json!({ "_id": "x" })))
                .await,
            Err(StoreError::InvalidField(_))
        ));
        assert!(matches!(
            store
                .update_fields("forward_views", "nope", fields(json!({ "title": "t" })))
                .await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn field_filters_select_matching_documents_in_order() {
        let store = SqliteDocumentStore::open_in_memory().expect("store");
        let a = store
            .insert("forward_views", json!({ "title": "first" }))
            .await
            .expect("a");
        let b = store
            .insert("forward_views", json!({ "count": 3 }))
            .await
            .expect("b");
        let c = store
            .insert("forward_views", json!({ "title": null }))
            .await
            .expect("c");

        let untitled = store
            .find_many("forward_views", Filter::missing("title"))
            .await
            .expect("missing");
        let ids: Vec<_> = untitled.iter().map(|d| d["_id"].clone()).collect();
        assert_eq!(ids, vec![json!(b), json!(c)]);

        let titled = store
            .find_one("forward_views", Filter::field_eq("title", "first"))
            .await
            .expect("eq");
        assert_eq!(titled["_id"], a.as_str());

        let all = store
            .find_many("forward_views", Filter::All)
            .await
            .expect("all");
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn filter_fields_are_validated() {
        let store = SqliteDocumentStore::open_in_memory().expect("store");
        let err = store
            .find_many("forward_views", Filter::field_eq("title') OR 1=1 --", "x"))
            .await
            .expect_err("injection rejected");
        assert!(matches!(err, StoreError::InvalidField(_)));
    }

    #[tokio::test]
    async fn insert_rejects_non_objects() {
        let store = SqliteDocumentStore::open_in_memory().expect("store");
        assert!(matches!(
            store.insert("forward_views", json!([1, 2])).await,
            Err(StoreError::InvalidField(_))
        ));
    }

    #[tokio::test]
    async fn file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("memento.sqlite3");
        let id = {
            let store = SqliteDocumentStore::open(&path).await.expect("open");
            store
                .insert("message_relations", json!({ "view_record": "v1" }))
                .await
                .expect("insert")
        };
        let store = SqliteDocumentStore::open(&path).await.expect("reopen");
        let doc = store
            .find_one("message_relations", Filter::field_eq("view_record", "v1"))
            .await
            .expect("find");
        assert_eq!(doc["_id"], id.as_str());
    }
}
