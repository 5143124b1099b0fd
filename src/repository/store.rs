//! JSON-file document store.
//!
//! One file per collection under the data directory. All mutation goes
//! through an internal async mutex, which serializes writes and keeps
//! the id sequence consistent under concurrent callers. Reads return
//! snapshots, not live views. Each persist writes to a temp file and
//! renames over the collection, so individual save/update/delete
//! operations are atomic on disk.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{CyclerError, Result};

/// A record the store can manage: serializable, with a monotonic
/// integer identity assigned on first save.
pub trait Document: Serialize + DeserializeOwned + Clone + Send + Sync {
    const COLLECTION: &'static str;

    fn id_int(&self) -> u64;
    fn set_id_int(&mut self, id: u64);
}

struct CollectionState<T> {
    docs: Vec<T>,
    next_id: u64,
}

pub struct JsonCollection<T: Document> {
    path: PathBuf,
    state: Mutex<CollectionState<T>>,
}

impl<T: Document> JsonCollection<T> {
    /// Open (or create) the collection file under `data_dir`.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let path = data_dir.join(format!("{}.json", T::COLLECTION));

        let docs: Vec<T> = match tokio::fs::read_to_string(&path).await {
            Ok(text) if !text.trim().is_empty() => serde_json::from_str(&text).map_err(|e| {
                CyclerError::Storage(format!(
                    "collection {} at {} is corrupt: {e}",
                    T::COLLECTION,
                    path.display()
                ))
            })?,
            Ok(_) => Vec::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let next_id = docs.iter().map(Document::id_int).max().unwrap_or(0) + 1;
        debug!(
            collection = T::COLLECTION,
            records = docs.len(),
            next_id,
            "collection opened"
        );

        Ok(Self {
            path,
            state: Mutex::new(CollectionState { docs, next_id }),
        })
    }

    /// Snapshot of every record.
    pub async fn find_all(&self) -> Vec<T> {
        self.state.lock().await.docs.clone()
    }

    /// Snapshot sorted by id descending (newest first).
    pub async fn find_all_desc(&self) -> Vec<T> {
        let mut docs = self.find_all().await;
        docs.sort_by(|a, b| b.id_int().cmp(&a.id_int()));
        docs
    }

    pub async fn find_by_id_int(&self, id: u64) -> Option<T> {
        self.state
            .lock()
            .await
            .docs
            .iter()
            .find(|d| d.id_int() == id)
            .cloned()
    }

    /// Paginated listing over the id-descending order.
    pub async fn page(&self, offset: usize, limit: usize) -> Vec<T> {
        self.find_all_desc()
            .await
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect()
    }

    /// Insert or replace. A zero id gets the next sequence value.
    /// Returns the record's id.
    pub async fn save(&self, mut doc: T) -> Result<u64> {
        let mut state = self.state.lock().await;
        if doc.id_int() == 0 {
            doc.set_id_int(state.next_id);
            state.next_id += 1;
        } else if doc.id_int() >= state.next_id {
            state.next_id = doc.id_int() + 1;
        }
        let id = doc.id_int();

        if let Some(existing) = state.docs.iter_mut().find(|d| d.id_int() == id) {
            *existing = doc;
        } else {
            state.docs.push(doc);
        }
        Self::persist(&self.path, &state.docs).await?;
        Ok(id)
    }

    /// Merge a partial-field JSON object into the stored record.
    pub async fn update_by_id_int(&self, id: u64, fields: Value) -> Result<()> {
        let Some(fields) = fields.as_object().cloned() else {
            return Err(CyclerError::Storage(
                "partial update requires a JSON object".to_string(),
            ));
        };

        let mut state = self.state.lock().await;
        let Some(pos) = state.docs.iter().position(|d| d.id_int() == id) else {
            return Err(CyclerError::RecordNotFound {
                collection: T::COLLECTION.to_string(),
                id,
            });
        };

        let mut value = serde_json::to_value(&state.docs[pos])?;
        if let Some(object) = value.as_object_mut() {
            for (key, new_value) in fields {
                object.insert(key, new_value);
            }
        }
        let updated: T = serde_json::from_value(value).map_err(|e| {
            CyclerError::Storage(format!(
                "partial update produced an invalid {} record: {e}",
                T::COLLECTION
            ))
        })?;
        state.docs[pos] = updated;
        Self::persist(&self.path, &state.docs).await
    }

    /// Returns true when a record was removed.
    pub async fn delete_by_id_int(&self, id: u64) -> Result<bool> {
        let mut state = self.state.lock().await;
        let before = state.docs.len();
        state.docs.retain(|d| d.id_int() != id);
        if state.docs.len() == before {
            return Ok(false);
        }
        Self::persist(&self.path, &state.docs).await?;
        Ok(true)
    }

    /// Count records whose serialized `field` equals `value`.
    pub async fn count_by_field(&self, field: &str, value: &Value) -> usize {
        self.state
            .lock()
            .await
            .docs
            .iter()
            .filter_map(|d| serde_json::to_value(d).ok())
            .filter(|v| v.get(field) == Some(value))
            .count()
    }

    async fn persist(path: &Path, docs: &[T]) -> Result<()> {
        let text = serde_json::to_string_pretty(docs)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
