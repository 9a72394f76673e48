use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

use super::{Store, Tables};
use crate::error::{CloudoptError, Result};

type TableMap = HashMap<&'static str, BTreeMap<Uuid, Vec<u8>>>;

/// In-process store. Writes run against a copy of the tables that replaces
/// the live set only when the closure succeeds.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<TableMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableMap> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct MemTables<'a> {
    tables: &'a mut TableMap,
    writable: bool,
}

impl Tables for MemTables<'_> {
    fn get_raw(&mut self, table: &'static str, id: Uuid) -> Result<Option<Vec<u8>>> {
        Ok(self.tables.get(table).and_then(|t| t.get(&id)).cloned())
    }

    fn put_raw(&mut self, table: &'static str, id: Uuid, value: Vec<u8>) -> Result<()> {
        if !self.writable {
            return Err(CloudoptError::Store("write inside a read transaction".into()));
        }
        self.tables.entry(table).or_default().insert(id, value);
        Ok(())
    }

    fn scan_raw(&mut self, table: &'static str) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .tables
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }
}

impl Store for MemoryStore {
    fn read<R>(&self, f: impl FnOnce(&mut dyn Tables) -> Result<R>) -> Result<R> {
        let mut guard = self.lock();
        let mut tables = MemTables {
            tables: &mut *guard,
            writable: false,
        };
        f(&mut tables)
    }

    fn write<R>(&self, f: impl FnOnce(&mut dyn Tables) -> Result<R>) -> Result<R> {
        let mut guard = self.lock();
        let mut working = guard.clone();
        let out = f(&mut MemTables {
            tables: &mut working,
            writable: true,
        })?;
        *guard = working;
        Ok(out)
    }
}
