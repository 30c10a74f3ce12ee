//! JSON file backed [`InstanceStore`].

use crate::error::StoreError;
use crate::instance::{Instance, InstanceId, OwnerId};
use crate::registry::{sorted, InstanceStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

type StoreResult<T> = std::result::Result<T, StoreError>;

/// On-disk document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    instances: Vec<Instance>,
    #[serde(default)]
    retired: Vec<Tombstone>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tombstone {
    id: InstanceId,
    owner_id: OwnerId,
}

#[derive(Default)]
struct State {
    records: HashMap<InstanceId, Instance>,
    retired: HashMap<InstanceId, OwnerId>,
}

impl State {
    fn load(doc: Document) -> Self {
        Self {
            records: doc.instances.into_iter().map(|i| (i.id, i)).collect(),
            retired: doc
                .retired
                .into_iter()
                .map(|t| (t.id, t.owner_id))
                .collect(),
        }
    }

    fn document(&self) -> Document {
        let mut retired: Vec<Tombstone> = self
            .retired
            .iter()
            .map(|(id, owner_id)| Tombstone {
                id: *id,
                owner_id: owner_id.clone(),
            })
            .collect();
        retired.sort_by_key(|t| t.id.as_uuid());
        Document {
            instances: sorted(self.records.values().cloned().collect()),
            retired,
        }
    }
}

/// Stores all records and tombstones in a single JSON document.
///
/// Every mutation rewrites the file through a temp file and rename, so a
/// crash leaves either the old or the new contents on disk.
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<State>,
}

impl JsonFileStore {
    /// Open the store at `path`, loading existing records if the file exists.
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => State::default(),
            Ok(bytes) => State::load(serde_json::from_slice::<Document>(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => State::default(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(
            path = %path.display(),
            records = state.records.len(),
            retired = state.retired.len(),
            "Opened instance store"
        );
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, state: &State) -> StoreResult<()> {
        let json = serde_json::to_vec_pretty(&state.document())?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for JsonFileStore {
    async fn insert(&self, instance: Instance) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.records.contains_key(&instance.id) {
            return Err(StoreError::Duplicate(instance.id));
        }
        let id = instance.id;
        state.records.insert(id, instance);
        if let Err(e) = self.persist(&state).await {
            state.records.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    async fn find_by_id(&self, id: InstanceId) -> StoreResult<Option<Instance>> {
        Ok(self.state.lock().await.records.get(&id).cloned())
    }

    async fn find_by_owner(&self, owner: &OwnerId) -> StoreResult<Vec<Instance>> {
        let state = self.state.lock().await;
        Ok(sorted(
            state
                .records
                .values()
                .filter(|i| &i.owner_id == owner)
                .cloned()
                .collect(),
        ))
    }

    async fn update(&self, instance: Instance) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let Some(previous) = state.records.insert(instance.id, instance.clone()) else {
            state.records.remove(&instance.id);
            return Err(StoreError::Missing(instance.id));
        };
        if let Err(e) = self.persist(&state).await {
            state.records.insert(previous.id, previous);
            return Err(e);
        }
        Ok(())
    }

    async fn delete_by_id(&self, id: InstanceId) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let Some(previous) = state.records.remove(&id) else {
            return Ok(false);
        };
        if let Err(e) = self.persist(&state).await {
            state.records.insert(id, previous);
            return Err(e);
        }
        Ok(true)
    }

    async fn list_all(&self) -> StoreResult<Vec<Instance>> {
        Ok(sorted(
            self.state.lock().await.records.values().cloned().collect(),
        ))
    }

    async fn retire(&self, instance: &Instance) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let previous = state.records.remove(&instance.id);
        let buried = state
            .retired
            .insert(instance.id, instance.owner_id.clone());
        if let Err(e) = self.persist(&state).await {
            if let Some(previous) = previous {
                state.records.insert(previous.id, previous);
            }
            match buried {
                Some(owner) => state.retired.insert(instance.id, owner),
                None => state.retired.remove(&instance.id),
            };
            return Err(e);
        }
        Ok(previous.is_some())
    }

    async fn find_retired(&self, id: InstanceId) -> StoreResult<Option<OwnerId>> {
        Ok(self.state.lock().await.retired.get(&id).cloned())
    }
}
