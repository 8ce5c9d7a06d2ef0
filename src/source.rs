//! Where the encrypted records come from.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::{params, Connection, OpenFlags};
use serde_json::Value;

use crate::error::SourceError;
use crate::record::{EncodedRecord, OpaqueData};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectStore {
    Message,
    Chat,
    Contact,
    GroupMetadata,
}

impl ObjectStore {
    pub const ALL: [ObjectStore; 4] = [
        ObjectStore::Message,
        ObjectStore::Chat,
        ObjectStore::Contact,
        ObjectStore::GroupMetadata,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ObjectStore::Message => "message",
            ObjectStore::Chat => "chat",
            ObjectStore::Contact => "contact",
            ObjectStore::GroupMetadata => "group-metadata",
        }
    }
}

/// A key-value record store holding the client's object stores.
pub trait RecordSource {
    /// All records of one store, in store order.
    fn records(&self, store: ObjectStore) -> Result<Vec<Value>, SourceError>;

    fn messages(&self) -> Result<Vec<EncodedRecord>, SourceError> {
        self.records(ObjectStore::Message)?
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                serde_json::from_value(value).map_err(|source| SourceError::Json {
                    store: ObjectStore::Message.name(),
                    index,
                    source,
                })
            })
            .collect()
    }

    /// The first chat row that carries opaque data, used as known test data
    /// while discovering the row key.
    fn probe_record(&self) -> Result<Option<OpaqueData>, SourceError> {
        Ok(self
            .messages()?
            .into_iter()
            .find(|m| m.is_chat() && m.opaque.is_some())
            .and_then(|m| m.opaque))
    }
}

/// Object stores exported into SQLite: one table per store, named after it,
/// with the record as JSON text in a `value` column.
pub struct SqliteRecordSource {
    conn: Connection,
}

impl SqliteRecordSource {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Self { conn })
    }

    /// Opens (creating if needed) a writable store with all tables present.
    pub fn create(path: &Path) -> Result<Self, SourceError> {
        let conn = Connection::open(path)?;
        for store in ObjectStore::ALL {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" (value TEXT NOT NULL);",
                store.name()
            ))?;
        }
        Ok(Self { conn })
    }

    pub fn insert(&self, store: ObjectStore, record: &Value) -> Result<(), SourceError> {
        self.conn.execute(
            &format!("INSERT INTO \"{}\" (value) VALUES (?1)", store.name()),
            params![record.to_string()],
        )?;
        Ok(())
    }
}

impl RecordSource for SqliteRecordSource {
    fn records(&self, store: ObjectStore) -> Result<Vec<Value>, SourceError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT value FROM \"{}\" ORDER BY rowid", store.name()))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .enumerate()
            .map(|(index, text)| {
                serde_json::from_str(&text).map_err(|source| SourceError::Json {
                    store: store.name(),
                    index,
                    source,
                })
            })
            .collect()
    }
}

/// In-memory store, mostly for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryRecordSource {
    stores: HashMap<ObjectStore, Vec<Value>>,
}

impl MemoryRecordSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, store: ObjectStore, record: Value) {
        self.stores.entry(store).or_default().push(record);
    }
}

impl RecordSource for MemoryRecordSource {
    fn records(&self, store: ObjectStore) -> Result<Vec<Value>, SourceError> {
        Ok(self.stores.get(&store).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sqlite_store_keeps_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.sqlite");
        let writer = SqliteRecordSource::create(&path).unwrap();
        writer
            .insert(ObjectStore::GroupMetadata, &json!({ "id": "g1", "subject": "Climbing" }))
            .unwrap();
        writer
            .insert(ObjectStore::GroupMetadata, &json!({ "id": "g2", "subject": "Family" }))
            .unwrap();
        drop(writer);

        let source = SqliteRecordSource::open(&path).unwrap();
        let groups = source.records(ObjectStore::GroupMetadata).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0]["subject"], "Climbing");
        assert_eq!(groups[1]["subject"], "Family");
        assert!(source.records(ObjectStore::Chat).unwrap().is_empty());
    }

    #[test]
    fn probe_record_skips_non_chat_rows() {
        let mut source = MemoryRecordSource::new();
        source.push(
            ObjectStore::Message,
            json!({ "id": "a", "type": "image", "msgRowOpaqueData": { "iv": "AA==", "_data": "AQ==" } }),
        );
        source.push(ObjectStore::Message, json!({ "id": "b", "type": "chat" }));
        source.push(
            ObjectStore::Message,
            json!({ "id": "c", "type": "chat", "msgRowOpaqueData": { "iv": "Ag==", "_data": "Aw==" } }),
        );

        let probe = source.probe_record().unwrap().unwrap();
        assert_eq!(probe.iv, vec![2]);
        assert_eq!(probe.data, vec![3]);
    }

    #[test]
    fn malformed_message_names_its_position() {
        let mut source = MemoryRecordSource::new();
        source.push(ObjectStore::Message, json!({ "id": "a" }));
        source.push(ObjectStore::Message, json!({ "id": "b", "type": 7 }));
        assert!(matches!(
            source.messages(),
            Err(SourceError::Json { store: "message", index: 1, .. })
        ));
    }
}
