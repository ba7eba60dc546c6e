//! Key-value store interface.
//!
//! Keys live in named column families. Values are opaque bytes; callers
//! pick the encoding (the directory uses JSON).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::StoreError;

type StoreResult<T> = std::result::Result<T, StoreError>;

/// Column-family key-value store.
pub trait Store: Send + Sync {
    fn get(&self, cf: &str, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    fn set(&self, cf: &str, key: &[u8], value: &[u8]) -> StoreResult<()>;

    fn delete(&self, cf: &str, key: &[u8]) -> StoreResult<()>;

    /// Every entry of `cf`, in key order.
    fn scan(&self, cf: &str) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Flush and release the store. Later calls fail with `StoreError::Closed`.
    fn close(&self) -> StoreResult<()>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    closed: bool,
    families: HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>,
}

/// In-process store. Column families are created on first write.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn open() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemoryInner>> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.closed {
            return Err(StoreError::Closed);
        }
        Ok(guard)
    }
}

impl Store for MemoryStore {
    fn get(&self, cf: &str, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.lock()?.families.get(cf).and_then(|f| f.get(key).cloned()))
    }

    fn set(&self, cf: &str, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.lock()?
            .families
            .entry(cf.to_string())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, cf: &str, key: &[u8]) -> StoreResult<()> {
        if let Some(family) = self.lock()?.families.get_mut(cf) {
            family.remove(key);
        }
        Ok(())
    }

    fn scan(&self, cf: &str) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .lock()?
            .families
            .get(cf)
            .map(|f| f.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn close(&self) -> StoreResult<()> {
        self.lock()?.closed = true;
        Ok(())
    }
}

#[cfg(feature = "rocksdb")]
mod rocks {
    use std::path::Path;
    use std::sync::{PoisonError, RwLock};

    use rocksdb::{IteratorMode, Options, DB};

    use super::{Store, StoreResult};
    use crate::StoreError;

    /// RocksDB-backed store with a fixed set of column families.
    pub struct RocksStore {
        db: RwLock<Option<DB>>,
    }

    impl RocksStore {
        /// Open or create storage at the given path.
        pub fn open<P: AsRef<Path>>(path: P, families: &[&str]) -> StoreResult<Self> {
            let mut opts = Options::default();
            opts.create_if_missing(true);
            opts.create_missing_column_families(true);
            let db = DB::open_cf(&opts, path, families)?;
            Ok(Self {
                db: RwLock::new(Some(db)),
            })
        }

        fn with_db<T>(&self, f: impl FnOnce(&DB) -> StoreResult<T>) -> StoreResult<T> {
            let guard = self.db.read().unwrap_or_else(PoisonError::into_inner);
            let db = guard.as_ref().ok_or(StoreError::Closed)?;
            f(db)
        }
    }

    fn family<'a>(db: &'a DB, cf: &str) -> StoreResult<&'a rocksdb::ColumnFamily> {
        db.cf_handle(cf)
            .ok_or_else(|| StoreError::UnknownColumnFamily(cf.to_string()))
    }

    impl Store for RocksStore {
        fn get(&self, cf: &str, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
            self.with_db(|db| Ok(db.get_cf(family(db, cf)?, key)?))
        }

        fn set(&self, cf: &str, key: &[u8], value: &[u8]) -> StoreResult<()> {
            self.with_db(|db| Ok(db.put_cf(family(db, cf)?, key, value)?))
        }

        fn delete(&self, cf: &str, key: &[u8]) -> StoreResult<()> {
            self.with_db(|db| Ok(db.delete_cf(family(db, cf)?, key)?))
        }

        fn scan(&self, cf: &str) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
            self.with_db(|db| {
                let mut entries = Vec::new();
                for item in db.iterator_cf(family(db, cf)?, IteratorMode::Start) {
                    let (key, value) = item?;
                    entries.push((key.to_vec(), value.to_vec()));
                }
                Ok(entries)
            })
        }

        fn close(&self) -> StoreResult<()> {
            let db = self
                .db
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .ok_or(StoreError::Closed)?;
            db.flush()?;
            Ok(())
        }
    }

}

#[cfg(feature = "rocksdb")]
pub use rocks::RocksStore;
