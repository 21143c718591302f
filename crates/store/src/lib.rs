//! ## Metadata store
//!
//! All cluster topology lives in five logical tables behind the abstract
//! [`TableService`]: vertices (which also holds instance and definition
//! rows), endpoints, connections, sharded-vertex descriptors, and the
//! artifact container. Single-row operations are strongly consistent;
//! scans may lag behind writes, and callers are expected to tolerate
//! reading old rows immediately after a write elsewhere.
//!
//! The typed managers in this crate wrap one table each and enforce the
//! model invariants (unique keys, immutable endpoint attributes, the `$N`
//! shard naming convention). The shipped backend is in-memory; production
//! deployments supply their own [`TableService`] behind a connection
//! string.

pub mod artifacts;
pub mod connections;
pub mod endpoints;
pub mod memory;
pub mod naming;
pub mod sharding;
pub mod vertices;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

use self::{
    artifacts::{ArtifactStore, TableArtifactStore},
    connections::ConnectionManager,
    endpoints::EndpointManager,
    sharding::ShardedVertexManager,
    vertices::VertexManager,
};

/// Vertex table; also holds instance rows (`row = ""`) and definition
/// template rows (`partition = ""`).
pub const VERTEX_TABLE: &str = "cravertextable";
pub const ENDPOINT_TABLE: &str = "craendpointtable";
pub const CONNECTION_TABLE: &str = "craconnectiontable";
pub const SHARDED_VERTEX_TABLE: &str = "crashardedvertextable";
/// Artifact blob container, entries `<definition>/binaries`.
pub const ARTIFACT_CONTAINER: &str = "cra";

pub const ALL_TABLES: [&str; 5] = [
    VERTEX_TABLE,
    ENDPOINT_TABLE,
    CONNECTION_TABLE,
    SHARDED_VERTEX_TABLE,
    ARTIFACT_CONTAINER,
];

/// Rows deleted per batch in partition-scoped bulk deletes.
pub const DELETE_BATCH_SIZE: usize = 100;

#[derive(Debug)]
pub enum Error {
    NotFound,
    Conflict,
    InvalidName(String),
    MissingColumn(&'static str),
    InvalidColumn(&'static str),
    UnknownScheme(String),
    Backend(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One persisted row.
///
/// `sequence` is assigned by the store on first insertion and survives
/// replacement, giving the earliest-insertion tie-break used when several
/// instances host a vertex of the same name.
#[derive(Debug, Clone, Default)]
pub struct TableEntity {
    pub partition: String,
    pub row: String,
    pub columns: HashMap<String, String>,
    pub sequence: u64,
}

impl TableEntity {
    pub fn new(partition: impl Into<String>, row: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            row: row.into(),
            ..Default::default()
        }
    }

    pub fn with_column(mut self, name: &str, value: impl Into<String>) -> Self {
        self.columns.insert(name.to_string(), value.into());
        self
    }

    pub fn column(&self, name: &'static str) -> Result<&str, Error> {
        self.columns
            .get(name)
            .map(|value| value.as_str())
            .ok_or(Error::MissingColumn(name))
    }
}

/// The abstract partitioned key-value store backing all metadata.
///
/// Single-row operations must be strongly consistent; `scan` and
/// `scan_partition` may be eventually consistent. `delete` of a missing row
/// is a no-op. `delete_batch` is partition-scoped and committed as one unit
/// by backends that support it; callers keep batches at or under
/// [`DELETE_BATCH_SIZE`] rows.
#[async_trait]
pub trait TableService: Send + Sync {
    async fn create_table(&self, table: &str) -> Result<(), Error>;
    async fn delete_table(&self, table: &str) -> Result<(), Error>;
    async fn upsert(&self, table: &str, entity: TableEntity) -> Result<(), Error>;
    async fn get(&self, table: &str, partition: &str, row: &str)
    -> Result<Option<TableEntity>, Error>;
    async fn delete(&self, table: &str, partition: &str, row: &str) -> Result<(), Error>;
    async fn delete_batch(&self, table: &str, partition: &str, rows: &[String])
    -> Result<(), Error>;
    async fn scan(&self, table: &str) -> Result<Vec<TableEntity>, Error>;
    async fn scan_partition(&self, table: &str, partition: &str)
    -> Result<Vec<TableEntity>, Error>;
}

/// Resolve a storage connection string to a table service.
///
/// `mem://<namespace>` connects to the in-process shared store registered
/// under that namespace; every open against the same namespace inside one
/// process sees the same tables.
pub fn resolve(conn_str: &str) -> Result<Arc<dyn TableService>, Error> {
    match conn_str.split_once("://") {
        Some(("mem", namespace)) => Ok(memory::MemoryTableService::shared(namespace)),
        _ => Err(Error::UnknownScheme(conn_str.to_string())),
    }
}

/// The typed managers over one table service.
#[derive(Clone)]
pub struct Metadata {
    service: Arc<dyn TableService>,
    pub vertices: VertexManager,
    pub endpoints: EndpointManager,
    pub connections: ConnectionManager,
    pub sharded: ShardedVertexManager,
    pub artifacts: Arc<dyn ArtifactStore>,
}

impl Metadata {
    /// Open the store behind a connection string and make sure all reserved
    /// tables exist.
    pub async fn open(conn_str: &str) -> Result<Self, Error> {
        let service = resolve(conn_str)?;
        for table in ALL_TABLES {
            service.create_table(table).await?;
        }

        Ok(Self::new(service))
    }

    pub fn new(service: Arc<dyn TableService>) -> Self {
        Self {
            vertices: VertexManager::new(service.clone()),
            endpoints: EndpointManager::new(service.clone()),
            connections: ConnectionManager::new(service.clone()),
            sharded: ShardedVertexManager::new(service.clone()),
            artifacts: Arc::new(TableArtifactStore::new(service.clone())),
            service,
        }
    }

    pub fn service(&self) -> Arc<dyn TableService> {
        self.service.clone()
    }

    /// Drop and recreate every reserved table. Intended for tests and fresh
    /// bring-up; afterwards all queries return empty.
    pub async fn reset(&self) -> Result<(), Error> {
        for table in ALL_TABLES {
            self.service.delete_table(table).await?;
            self.service.create_table(table).await?;
        }

        Ok(())
    }
}

/// Delete every row of one partition in batches of [`DELETE_BATCH_SIZE`].
///
/// The first failed batch aborts the partition and surfaces the error;
/// previously committed batches are not rolled back.
pub(crate) async fn delete_partition(
    service: &Arc<dyn TableService>,
    table: &str,
    partition: &str,
) -> Result<(), Error> {
    let rows: Vec<String> = service
        .scan_partition(table, partition)
        .await?
        .into_iter()
        .map(|entity| entity.row)
        .collect();

    for batch in rows.chunks(DELETE_BATCH_SIZE) {
        service.delete_batch(table, partition, batch).await?;
    }

    Ok(())
}
