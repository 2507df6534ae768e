use crate::error::StoreError;
use crate::model::{Collection, Entity};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

/// A serialized entity together with its addressing keys
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub name: String,
    pub data: Vec<u8>,
}

/// Key-addressed object store for model entities.
///
/// Implementations only deal with opaque records; typed access lives in
/// [`ModelStoreExt`]. Stores are shared by concurrently running operations
/// and must synchronise internally.
pub trait ModelStore: Send + Sync {
    /// Insert or replace a record
    fn put_record(&self, collection: Collection, record: Record) -> Result<(), StoreError>;

    /// Get a record by id
    fn get_record(&self, collection: Collection, id: &str) -> Result<Option<Record>, StoreError>;

    /// Get a record by name
    fn get_record_by_name(
        &self,
        collection: Collection,
        name: &str,
    ) -> Result<Option<Record>, StoreError>;

    /// All records of a collection, ordered by id
    fn records(&self, collection: Collection) -> Result<Vec<Record>, StoreError>;
}

/// Typed access on top of any [`ModelStore`]
pub trait ModelStoreExt: ModelStore {
    fn put<E: Entity>(&self, entity: &E) -> Result<(), StoreError> {
        let record = Record {
            id: entity.id().to_string(),
            name: entity.name().to_string(),
            data: serde_json::to_vec(entity)?,
        };
        self.put_record(E::COLLECTION, record)
    }

    /// Get an entity by id, failing with `NotFound` when absent
    fn get<E: Entity>(&self, id: &str) -> Result<E, StoreError> {
        self.find(id)?.ok_or_else(|| StoreError::NotFound {
            collection: E::COLLECTION.as_str(),
            id: id.to_string(),
        })
    }

    /// Get an entity by id if present
    fn find<E: Entity>(&self, id: &str) -> Result<Option<E>, StoreError> {
        match self.get_record(E::COLLECTION, id)? {
            Some(record) => Ok(Some(serde_json::from_slice(&record.data)?)),
            None => Ok(None),
        }
    }

    fn get_by_name<E: Entity>(&self, name: &str) -> Result<E, StoreError> {
        match self.get_record_by_name(E::COLLECTION, name)? {
            Some(record) => Ok(serde_json::from_slice(&record.data)?),
            None => Err(StoreError::NotFound {
                collection: E::COLLECTION.as_str(),
                id: name.to_string(),
            }),
        }
    }

    fn iter<E: Entity>(&self) -> Result<Vec<E>, StoreError> {
        self.records(E::COLLECTION)?
            .into_iter()
            .map(|record| serde_json::from_slice(&record.data).map_err(StoreError::from))
            .collect()
    }
}

impl<T: ModelStore + ?Sized> ModelStoreExt for T {}

#[derive(Default)]
struct Tables {
    records: HashMap<Collection, BTreeMap<String, Record>>,
    names: HashMap<Collection, HashMap<String, String>>,
}

/// In-memory model store for tests and single-shot runs
#[derive(Default)]
pub struct MemoryModelStore {
    tables: RwLock<Tables>,
}

impl MemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModelStore for MemoryModelStore {
    fn put_record(&self, collection: Collection, record: Record) -> Result<(), StoreError> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let names = tables.names.entry(collection).or_default();
        names.insert(record.name.clone(), record.id.clone());
        tables
            .records
            .entry(collection)
            .or_default()
            .insert(record.id.clone(), record);
        Ok(())
    }

    fn get_record(&self, collection: Collection, id: &str) -> Result<Option<Record>, StoreError> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables
            .records
            .get(&collection)
            .and_then(|table| table.get(id))
            .cloned())
    }

    fn get_record_by_name(
        &self,
        collection: Collection,
        name: &str,
    ) -> Result<Option<Record>, StoreError> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let id = match tables.names.get(&collection).and_then(|n| n.get(name)) {
            Some(id) => id,
            None => return Ok(None),
        };
        Ok(tables
            .records
            .get(&collection)
            .and_then(|table| table.get(id))
            .cloned())
    }

    fn records(&self, collection: Collection) -> Result<Vec<Record>, StoreError> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables
            .records
            .get(&collection)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeInstance;

    fn instance(id: &str, name: &str) -> NodeInstance {
        NodeInstance {
            id: id.to_string(),
            name: name.to_string(),
            node_id: "node".to_string(),
            deployment_id: "dep".to_string(),
            state: String::new(),
            runtime_properties: Default::default(),
        }
    }

    #[test]
    fn put_get_and_iterate() {
        let store = MemoryModelStore::new();
        store.put(&instance("b", "second")).unwrap();
        store.put(&instance("a", "first")).unwrap();

        let found: NodeInstance = store.get("a").unwrap();
        assert_eq!(found.name, "first");

        let by_name: NodeInstance = store.get_by_name("second").unwrap();
        assert_eq!(by_name.id, "b");

        let all: Vec<NodeInstance> = store.iter().unwrap();
        let ids: Vec<&str> = all.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn put_replaces_existing_record() {
        let store = MemoryModelStore::new();
        let mut ni = instance("a", "first");
        store.put(&ni).unwrap();
        ni.state = "started".to_string();
        store.put(&ni).unwrap();

        let found: NodeInstance = store.get("a").unwrap();
        assert_eq!(found.state, "started");
        assert_eq!(store.iter::<NodeInstance>().unwrap().len(), 1);
    }

    #[test]
    fn missing_entity_is_not_found() {
        let store = MemoryModelStore::new();
        assert!(store.find::<NodeInstance>("x").unwrap().is_none());
        assert!(matches!(
            store.get::<NodeInstance>("x"),
            Err(StoreError::NotFound { collection: "node_instance", .. })
        ));
    }
}
