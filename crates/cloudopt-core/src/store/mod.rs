//! Repository interface the engines persist through.
//!
//! Every entity is a [`Record`]: a serde value living in its own table,
//! keyed by its `Uuid`. Backends only implement raw byte access
//! ([`Tables`]) plus read/write transactions ([`Store`]); the typed CRUD
//! verbs are layered on top once, here.
//!
//! A `write` closure runs inside a single transaction. If it returns `Err`
//! nothing it wrote is kept, which is what the engines rely on for their
//! claim/finish steps.

pub mod memory;
pub mod redb;

pub use self::memory::MemoryStore;
pub use self::redb::RedbStore;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{CloudoptError, Result};

/// A persisted entity.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Table name; also used as the entity name in `NotFound` errors.
    const TABLE: &'static str;

    fn id(&self) -> Uuid;
}

/// Raw table access inside one transaction.
pub trait Tables {
    fn get_raw(&mut self, table: &'static str, id: Uuid) -> Result<Option<Vec<u8>>>;
    fn put_raw(&mut self, table: &'static str, id: Uuid, value: Vec<u8>) -> Result<()>;
    fn scan_raw(&mut self, table: &'static str) -> Result<Vec<Vec<u8>>>;
}

impl dyn Tables + '_ {
    pub fn get<T: Record>(&mut self, id: Uuid) -> Result<Option<T>> {
        match self.get_raw(T::TABLE, id)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Like [`get`](Self::get) but a missing record is a `NotFound` error.
    pub fn require<T: Record>(&mut self, id: Uuid) -> Result<T> {
        self.get(id)?
            .ok_or_else(|| CloudoptError::not_found(entity_name(T::TABLE), id))
    }

    /// Create. Fails if a record with the same id already exists.
    pub fn insert<T: Record>(&mut self, record: &T) -> Result<()> {
        let id = record.id();
        if self.get_raw(T::TABLE, id)?.is_some() {
            return Err(CloudoptError::Store(format!(
                "{} {id} already exists",
                entity_name(T::TABLE)
            )));
        }
        self.put_raw(T::TABLE, id, serde_json::to_vec(record)?)
    }

    /// Replace an existing record. Fails with `NotFound` if it is missing.
    pub fn update<T: Record>(&mut self, record: &T) -> Result<()> {
        let id = record.id();
        if self.get_raw(T::TABLE, id)?.is_none() {
            return Err(CloudoptError::not_found(entity_name(T::TABLE), id));
        }
        self.put_raw(T::TABLE, id, serde_json::to_vec(record)?)
    }

    pub fn scan<T: Record>(&mut self) -> Result<Vec<T>> {
        self.scan_raw(T::TABLE)?
            .iter()
            .map(|bytes| serde_json::from_slice(bytes).map_err(CloudoptError::from))
            .collect()
    }

    pub fn filter<T: Record>(&mut self, pred: impl Fn(&T) -> bool) -> Result<Vec<T>> {
        Ok(self.scan::<T>()?.into_iter().filter(|r| pred(r)).collect())
    }
}

/// A transactional record store.
pub trait Store: Send + Sync + 'static {
    fn read<R>(&self, f: impl FnOnce(&mut dyn Tables) -> Result<R>) -> Result<R>;

    /// Run `f` in one write transaction; commit only if it returns `Ok`.
    fn write<R>(&self, f: impl FnOnce(&mut dyn Tables) -> Result<R>) -> Result<R>;

    fn get<T: Record>(&self, id: Uuid) -> Result<Option<T>> {
        self.read(|t| t.get(id))
    }

    fn require<T: Record>(&self, id: Uuid) -> Result<T> {
        self.read(|t| t.require(id))
    }

    fn insert<T: Record>(&self, record: &T) -> Result<()> {
        self.write(|t| t.insert(record))
    }

    fn update<T: Record>(&self, record: &T) -> Result<()> {
        self.write(|t| t.update(record))
    }

    fn list<T: Record>(&self) -> Result<Vec<T>> {
        self.read(|t| t.scan())
    }

    fn filter<T: Record>(&self, pred: impl Fn(&T) -> bool) -> Result<Vec<T>> {
        self.read(|t| t.filter(pred))
    }
}

/// Every table the crate defines. Backends create them eagerly.
pub const TABLES: &[&str] = &[
    "recommendations",
    "actions",
    "action_approvals",
    "action_executions",
    "workflows",
    "workflow_executions",
];

fn entity_name(table: &'static str) -> &'static str {
    match table {
        "recommendations" => "recommendation",
        "actions" => "action",
        "action_approvals" => "action approval",
        "action_executions" => "action execution",
        "workflows" => "workflow",
        "workflow_executions" => "workflow execution",
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: Uuid,
        text: String,
    }

    impl Record for Note {
        const TABLE: &'static str = "recommendations";

        fn id(&self) -> Uuid {
            self.id
        }
    }

    fn note(text: &str) -> Note {
        Note {
            id: Uuid::new_v4(),
            text: text.to_string(),
        }
    }

    fn exercise(store: &impl Store) {
        let a = note("a");
        store.insert(&a).unwrap();
        assert!(store.insert(&a).is_err(), "duplicate insert must fail");
        assert_eq!(store.require::<Note>(a.id).unwrap(), a);

        let mut changed = a.clone();
        changed.text = "changed".into();
        store.update(&changed).unwrap();
        assert_eq!(store.get::<Note>(a.id).unwrap().unwrap().text, "changed");

        let missing = note("missing");
        assert!(matches!(
            store.update(&missing),
            Err(CloudoptError::NotFound { kind: "recommendation", .. })
        ));

        // A failing write transaction leaves no trace.
        let b = note("b");
        let res: Result<()> = store.write(|t| {
            t.insert(&b)?;
            Err(CloudoptError::Validation("boom".into()))
        });
        assert!(res.is_err());
        assert!(store.get::<Note>(b.id).unwrap().is_none());

        let all = store.filter::<Note>(|n| n.text == "changed").unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn memory_store_contract() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn redb_store_contract() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = RedbStore::open(&dir.path().join("test.db")).unwrap();
        exercise(&store);
    }

    #[test]
    fn reads_cannot_write() {
        let store = MemoryStore::new();
        let n = note("x");
        assert!(store.read(|t| t.insert(&n)).is_err());
    }
}
