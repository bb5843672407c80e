// src/core/kv.rs

//! The coordinator's own persisted state: the working recovery database used
//! to stage merged records during a recovery run, and small durable
//! bookkeeping (last generation, last recovery master) that must survive a
//! process restart.
//!
//! This is deliberately separate from the clustered data store the
//! coordinator recovers on behalf of peers — that store is owned and
//! implemented by the data daemon the coordinator talks to over Control RPC,
//! not by this crate.

use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};

use crate::core::errors::{RecoverdError, Result};
use crate::core::model::{DbId, Record};

/// A durable key-value handle for one coordinator's local working state.
pub struct KvStore {
    db: sled::Db,
}

const GENERATION_KEY: &[u8] = b"__generation";
const RECMASTER_KEY: &[u8] = b"__recmaster";

impl KvStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path).map_err(|e| RecoverdError::Storage(e.to_string()))?;
        Ok(Self { db })
    }

    fn tree(&self, db_id: DbId) -> Result<sled::Tree> {
        self.db
            .open_tree(format!("db-{db_id}"))
            .map_err(|e| RecoverdError::Storage(e.to_string()))
    }

    /// Replaces every record in `db_id`'s working tree with `records`. Used
    /// when the local node adopts the merged, authoritative record set that
    /// the recovery master pushes at the end of a recovery run.
    pub fn store_records(&self, db_id: DbId, records: &[Record]) -> Result<()> {
        let tree = self.tree(db_id)?;
        tree.clear().map_err(|e| RecoverdError::Storage(e.to_string()))?;
        for rec in records {
            let value = bincode::serde::encode_to_vec(rec, bincode::config::standard())
                .map_err(|e| RecoverdError::Storage(e.to_string()))?;
            tree.insert(&rec.key, value).map_err(|e| RecoverdError::Storage(e.to_string()))?;
        }
        tree.flush().map_err(|e| RecoverdError::Storage(e.to_string()))?;
        Ok(())
    }

    pub fn fetch_record(&self, db_id: DbId, key: &[u8]) -> Result<Option<Record>> {
        let tree = self.tree(db_id)?;
        match tree.get(key).map_err(|e| RecoverdError::Storage(e.to_string()))? {
            Some(bytes) => {
                let (rec, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                    .map_err(|e| RecoverdError::Storage(e.to_string()))?;
                Ok(Some(rec))
            }
            None => Ok(None),
        }
    }

    /// Traverses every record currently held for `db_id`, in key order.
    pub fn traverse(&self, db_id: DbId) -> Result<Vec<Record>> {
        let tree = self.tree(db_id)?;
        let mut out = Vec::new();
        for item in tree.iter() {
            let (_, bytes) = item.map_err(|e| RecoverdError::Storage(e.to_string()))?;
            let (rec, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| RecoverdError::Storage(e.to_string()))?;
            out.push(rec);
        }
        Ok(out)
    }

    pub fn record_count(&self, db_id: DbId) -> Result<usize> {
        Ok(self.tree(db_id)?.len())
    }

    /// Removes every record for `db_id` and drops its tree entirely, for a
    /// `DetachDatabase` request.
    pub fn detach(&self, db_id: DbId) -> Result<()> {
        self.db
            .drop_tree(format!("db-{db_id}"))
            .map_err(|e| RecoverdError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Folds `records` into `db_id`'s working tree using the same newest-wins
    /// ordering as a recovery merge, for a `VacuumFetch` request.
    pub fn merge_records(&self, db_id: DbId, records: Vec<Record>, local_pnn: crate::core::model::Pnn) -> Result<()> {
        let mut working: std::collections::BTreeMap<Vec<u8>, Record> =
            self.traverse(db_id)?.into_iter().map(|r| (r.key.clone(), r)).collect();
        crate::core::model::merge_records(&mut working, records, local_pnn);
        let merged: Vec<Record> = working.into_values().collect();
        self.store_records(db_id, &merged)
    }

    fn get_typed<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.db.get(key).map_err(|e| RecoverdError::Storage(e.to_string()))? {
            Some(bytes) => {
                let (value, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                    .map_err(|e| RecoverdError::Storage(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn set_typed<T: Serialize>(&self, key: &[u8], value: &T) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|e| RecoverdError::Storage(e.to_string()))?;
        self.db.insert(key, bytes).map_err(|e| RecoverdError::Storage(e.to_string()))?;
        self.db.flush().map_err(|e| RecoverdError::Storage(e.to_string()))?;
        Ok(())
    }

    pub fn last_generation(&self) -> Result<Option<u32>> {
        self.get_typed(GENERATION_KEY)
    }

    pub fn set_last_generation(&self, generation: u32) -> Result<()> {
        self.set_typed(GENERATION_KEY, &generation)
    }

    pub fn last_recmaster(&self) -> Result<Option<u32>> {
        self.get_typed(RECMASTER_KEY)
    }

    pub fn set_last_recmaster(&self, pnn: u32) -> Result<()> {
        self.set_typed(RECMASTER_KEY, &pnn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{RecordFlags, RecordHeader};

    fn rec(key: &str, rsn: u64) -> Record {
        Record {
            key: key.as_bytes().to_vec(),
            header: RecordHeader { rsn, dmaster: 0, flags: RecordFlags::empty() },
            value: b"v".to_vec(),
        }
    }

    #[test]
    fn store_and_traverse_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path().join("db")).unwrap();
        kv.store_records(1, &[rec("a", 1), rec("b", 2)]).unwrap();
        let mut records = kv.traverse(1).unwrap();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key, b"a");
        assert_eq!(kv.record_count(1).unwrap(), 2);
    }

    #[test]
    fn store_records_replaces_prior_contents() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path().join("db")).unwrap();
        kv.store_records(1, &[rec("a", 1)]).unwrap();
        kv.store_records(1, &[rec("b", 1)]).unwrap();
        assert_eq!(kv.record_count(1).unwrap(), 1);
        assert!(kv.fetch_record(1, b"a").unwrap().is_none());
    }

    #[test]
    fn generation_bookkeeping_persists() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path().join("db")).unwrap();
        assert_eq!(kv.last_generation().unwrap(), None);
        kv.set_last_generation(42).unwrap();
        assert_eq!(kv.last_generation().unwrap(), Some(42));
    }
}
