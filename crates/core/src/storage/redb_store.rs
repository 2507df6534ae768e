use super::model_store::{ModelStore, Record};
use crate::error::{backend, StoreError};
use crate::model::Collection;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

const NAMES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("names");

fn table(collection: Collection) -> TableDefinition<'static, &'static str, &'static [u8]> {
    TableDefinition::new(collection.as_str())
}

fn name_key(collection: Collection, name: &str) -> String {
    format!("{}/{}", collection.as_str(), name)
}

/// On-disk envelope keeping the name next to the entity bytes
#[derive(Serialize, Deserialize)]
struct Envelope {
    name: String,
    data: Vec<u8>,
}

/// Model store persisted in a redb file
#[derive(Clone)]
pub struct RedbModelStore {
    db: Arc<Database>,
}

impl RedbModelStore {
    pub fn new(path: PathBuf) -> Result<Self, StoreError> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(&path).map_err(backend)?;

        // Initialize tables
        let write_txn = db.begin_write().map_err(backend)?;
        {
            for collection in Collection::ALL {
                write_txn.open_table(table(collection)).map_err(backend)?;
            }
            write_txn.open_table(NAMES_TABLE).map_err(backend)?;
        }
        write_txn.commit().map_err(backend)?;

        tracing::debug!("Opened model store at {}", path.display());

        Ok(Self { db: Arc::new(db) })
    }

    fn decode(id: &str, bytes: &[u8]) -> Result<Record, StoreError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        Ok(Record {
            id: id.to_string(),
            name: envelope.name,
            data: envelope.data,
        })
    }
}

impl ModelStore for RedbModelStore {
    fn put_record(&self, collection: Collection, record: Record) -> Result<(), StoreError> {
        let value = serde_json::to_vec(&Envelope {
            name: record.name.clone(),
            data: record.data,
        })?;

        let write_txn = self.db.begin_write().map_err(backend)?;
        {
            let mut records = write_txn.open_table(table(collection)).map_err(backend)?;
            records
                .insert(record.id.as_str(), value.as_slice())
                .map_err(backend)?;

            let mut names = write_txn.open_table(NAMES_TABLE).map_err(backend)?;
            let key = name_key(collection, &record.name);
            names
                .insert(key.as_str(), record.id.as_str())
                .map_err(backend)?;
        }
        write_txn.commit().map_err(backend)?;
        Ok(())
    }

    fn get_record(&self, collection: Collection, id: &str) -> Result<Option<Record>, StoreError> {
        let read_txn = self.db.begin_read().map_err(backend)?;
        let records = read_txn.open_table(table(collection)).map_err(backend)?;

        match records.get(id).map_err(backend)? {
            Some(guard) => Ok(Some(Self::decode(id, guard.value())?)),
            None => Ok(None),
        }
    }

    fn get_record_by_name(
        &self,
        collection: Collection,
        name: &str,
    ) -> Result<Option<Record>, StoreError> {
        let id = {
            let read_txn = self.db.begin_read().map_err(backend)?;
            let names = read_txn.open_table(NAMES_TABLE).map_err(backend)?;
            let key = name_key(collection, name);
            let id = names.get(key.as_str()).map_err(backend)?;
            match id {
                Some(guard) => guard.value().to_string(),
                None => return Ok(None),
            }
        };
        self.get_record(collection, &id)
    }

    fn records(&self, collection: Collection) -> Result<Vec<Record>, StoreError> {
        let read_txn = self.db.begin_read().map_err(backend)?;
        let records = read_txn.open_table(table(collection)).map_err(backend)?;

        let mut out = Vec::new();
        for item in records.iter().map_err(backend)? {
            let (key, value) = item.map_err(backend)?;
            out.push(Self::decode(key.value(), value.value())?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Node, OperationSpec};
    use crate::storage::ModelStoreExt;
    use tempfile::TempDir;

    fn node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            name: format!("{id}-name"),
            deployment_id: "dep".to_string(),
            type_name: "test.Compute".to_string(),
            operations: [(
                "lifecycle.create".to_string(),
                OperationSpec::new("builtin.noop"),
            )]
            .into_iter()
            .collect(),
            properties: Default::default(),
            number_of_instances: 1,
        }
    }

    #[test]
    fn records_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("model.redb");

        {
            let store = RedbModelStore::new(path.clone()).unwrap();
            store.put(&node("n2")).unwrap();
            store.put(&node("n1")).unwrap();
        }

        let store = RedbModelStore::new(path).unwrap();
        let loaded: Node = store.get("n1").unwrap();
        assert_eq!(loaded, node("n1"));

        let by_name: Node = store.get_by_name("n2-name").unwrap();
        assert_eq!(by_name.id, "n2");

        let ids: Vec<String> = store.iter::<Node>().unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["n1", "n2"]);
    }

    #[test]
    fn unknown_name_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = RedbModelStore::new(temp_dir.path().join("model.redb")).unwrap();
        assert!(matches!(
            store.get_by_name::<Node>("ghost"),
            Err(StoreError::NotFound { .. })
        ));
    }
}
