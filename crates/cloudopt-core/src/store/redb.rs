//! Persistent store backed by redb.
//!
//! # Table design
//!
//! One table per entity, all with the same shape:
//! ```text
//! key:   uuid (16 bytes)
//! value: JSON-encoded record
//! ```
//!
//! redb serializes write transactions, so a `write` closure observes and
//! mutates a consistent snapshot across every table it touches.

use std::path::Path;

use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use uuid::Uuid;

use super::{Store, Tables, TABLES};
use crate::error::{CloudoptError, Result};

fn table(name: &'static str) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
    TableDefinition::new(name)
}

fn db_err(e: impl std::fmt::Display) -> CloudoptError {
    CloudoptError::Store(e.to_string())
}

/// redb-backed [`Store`].
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create the database at `path`, creating every table so that
    /// reads never hit a missing table.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        for name in TABLES {
            wt.open_table(table(name)).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }
}

struct ReadTables {
    rt: ReadTransaction,
}

impl Tables for ReadTables {
    fn get_raw(&mut self, name: &'static str, id: Uuid) -> Result<Option<Vec<u8>>> {
        let t = self.rt.open_table(table(name)).map_err(db_err)?;
        let value = t.get(id.as_bytes().as_slice()).map_err(db_err)?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    fn put_raw(&mut self, _name: &'static str, _id: Uuid, _value: Vec<u8>) -> Result<()> {
        Err(CloudoptError::Store("write inside a read transaction".into()))
    }

    fn scan_raw(&mut self, name: &'static str) -> Result<Vec<Vec<u8>>> {
        let t = self.rt.open_table(table(name)).map_err(db_err)?;
        let mut out = Vec::new();
        for entry in t.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            out.push(v.value().to_vec());
        }
        Ok(out)
    }
}

struct WriteTables<'a> {
    wt: &'a WriteTransaction,
}

impl Tables for WriteTables<'_> {
    fn get_raw(&mut self, name: &'static str, id: Uuid) -> Result<Option<Vec<u8>>> {
        let t = self.wt.open_table(table(name)).map_err(db_err)?;
        let value = t.get(id.as_bytes().as_slice()).map_err(db_err)?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    fn put_raw(&mut self, name: &'static str, id: Uuid, value: Vec<u8>) -> Result<()> {
        let mut t = self.wt.open_table(table(name)).map_err(db_err)?;
        t.insert(id.as_bytes().as_slice(), value.as_slice())
            .map_err(db_err)?;
        Ok(())
    }

    fn scan_raw(&mut self, name: &'static str) -> Result<Vec<Vec<u8>>> {
        let t = self.wt.open_table(table(name)).map_err(db_err)?;
        let mut out = Vec::new();
        for entry in t.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            out.push(v.value().to_vec());
        }
        Ok(out)
    }
}

impl Store for RedbStore {
    fn read<R>(&self, f: impl FnOnce(&mut dyn Tables) -> Result<R>) -> Result<R> {
        let rt = self.db.begin_read().map_err(db_err)?;
        f(&mut ReadTables { rt })
    }

    fn write<R>(&self, f: impl FnOnce(&mut dyn Tables) -> Result<R>) -> Result<R> {
        let wt = self.db.begin_write().map_err(db_err)?;
        match f(&mut WriteTables { wt: &wt }) {
            Ok(out) => {
                wt.commit().map_err(db_err)?;
                Ok(out)
            }
            Err(e) => {
                wt.abort().map_err(db_err)?;
                Err(e)
            }
        }
    }
}
