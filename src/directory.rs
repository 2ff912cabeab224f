use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::Identity;
use crate::store::StoreError;

/// Read-only lookup of a party's display identity.
#[async_trait]
pub trait Directory: Send + Sync {
    /// `Ok(None)` when the id is unknown; `Err` only for lookup failures.
    async fn lookup(&self, id: Ulid) -> Result<Option<Identity>, StoreError>;
}

/// Identities held in memory, optionally loaded from a JSON array of
/// `{"id", "name", "email"}` objects.
#[derive(Default)]
pub struct MemoryDirectory {
    people: DashMap<Ulid, Identity>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_file(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let people: Vec<Identity> = serde_json::from_slice(&bytes)?;
        Ok(Self::from_iter(people))
    }

    pub fn insert(&self, identity: Identity) {
        self.people.insert(identity.id, identity);
    }

    pub fn remove(&self, id: &Ulid) -> Option<Identity> {
        self.people.remove(id).map(|(_, identity)| identity)
    }

    pub fn len(&self) -> usize {
        self.people.len()
    }

    pub fn is_empty(&self) -> bool {
        self.people.is_empty()
    }
}

impl FromIterator<Identity> for MemoryDirectory {
    fn from_iter<I: IntoIterator<Item = Identity>>(iter: I) -> Self {
        let dir = Self::new();
        for identity in iter {
            dir.insert(identity);
        }
        dir
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn lookup(&self, id: Ulid) -> Result<Option<Identity>, StoreError> {
        Ok(self.people.get(&id).map(|e| e.value().clone()))
    }
}
