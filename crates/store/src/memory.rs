use std::{
    collections::BTreeMap,
    sync::{
        Arc, LazyLock,
        atomic::{AtomicU64, Ordering},
    },
};

use ahash::{HashMap, HashMapExt};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::{Error, TableEntity, TableService};

type Table = BTreeMap<(String, String), TableEntity>;

/// Process-wide registry of named stores, so every `mem://<namespace>` open
/// inside one process lands on the same tables.
static REGISTRY: LazyLock<Mutex<HashMap<String, Arc<MemoryTableService>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// In-memory table service.
///
/// Rows are ordered by `(partition, row)`, scans are snapshots taken under
/// the read lock. Insertion stamps are preserved across replacement so the
/// earliest-insertion tie-break stays stable.
#[derive(Default)]
pub struct MemoryTableService {
    tables: RwLock<HashMap<String, Table>>,
    sequence: AtomicU64,
}

impl MemoryTableService {
    /// The shared store registered under `namespace`, created on first use.
    pub fn shared(namespace: &str) -> Arc<Self> {
        REGISTRY
            .lock()
            .entry(namespace.to_string())
            .or_default()
            .clone()
    }

    fn with_table<T>(&self, table: &str, f: impl FnOnce(&Table) -> T) -> Result<T, Error> {
        let tables = self.tables.read();
        tables
            .get(table)
            .map(f)
            .ok_or_else(|| Error::Backend(format!("no such table: {}", table)))
    }

    fn with_table_mut<T>(&self, table: &str, f: impl FnOnce(&mut Table) -> T) -> Result<T, Error> {
        let mut tables = self.tables.write();
        tables
            .get_mut(table)
            .map(f)
            .ok_or_else(|| Error::Backend(format!("no such table: {}", table)))
    }
}

#[async_trait]
impl TableService for MemoryTableService {
    async fn create_table(&self, table: &str) -> Result<(), Error> {
        self.tables.write().entry(table.to_string()).or_default();
        Ok(())
    }

    async fn delete_table(&self, table: &str) -> Result<(), Error> {
        self.tables.write().remove(table);
        Ok(())
    }

    async fn upsert(&self, table: &str, mut entity: TableEntity) -> Result<(), Error> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.with_table_mut(table, |rows| {
            let key = (entity.partition.clone(), entity.row.clone());
            entity.sequence = rows.get(&key).map(|old| old.sequence).unwrap_or(sequence);
            rows.insert(key, entity);
        })
    }

    async fn get(
        &self,
        table: &str,
        partition: &str,
        row: &str,
    ) -> Result<Option<TableEntity>, Error> {
        self.with_table(table, |rows| {
            rows.get(&(partition.to_string(), row.to_string())).cloned()
        })
    }

    async fn delete(&self, table: &str, partition: &str, row: &str) -> Result<(), Error> {
        self.with_table_mut(table, |rows| {
            rows.remove(&(partition.to_string(), row.to_string()));
        })
    }

    async fn delete_batch(
        &self,
        table: &str,
        partition: &str,
        batch: &[String],
    ) -> Result<(), Error> {
        self.with_table_mut(table, |rows| {
            for row in batch {
                rows.remove(&(partition.to_string(), row.clone()));
            }
        })
    }

    async fn scan(&self, table: &str) -> Result<Vec<TableEntity>, Error> {
        self.with_table(table, |rows| rows.values().cloned().collect())
    }

    async fn scan_partition(
        &self,
        table: &str,
        partition: &str,
    ) -> Result<Vec<TableEntity>, Error> {
        self.with_table(table, |rows| {
            rows.range(
                (partition.to_string(), String::new())
                    ..(format!("{}\u{0}", partition), String::new()),
            )
            .map(|(_, entity)| entity.clone())
            .collect()
        })
    }
}
