use std::sync::Arc;

use base64::{Engine, prelude::BASE64_STANDARD};

use super::{Error, TableEntity, TableService, VERTEX_TABLE, naming};

const COL_ADDRESS: &str = "address";
const COL_PORT: &str = "port";
const COL_DEFINITION: &str = "definition";
const COL_PARAMETERS: &str = "parameters";
const COL_CREATOR: &str = "creator";
const COL_SHARDED: &str = "issharded";

/// A registered worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRow {
    pub name: String,
    pub address: String,
    pub port: u16,
}

/// A vertex definition template (the row with empty instance).
///
/// `creator` is the opaque factory blob; with registry-backed factories it
/// holds the registry key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexDefinition {
    pub name: String,
    pub creator: Vec<u8>,
    pub is_sharded: bool,
}

/// A materialized vertex on a particular instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexRow {
    pub instance: String,
    pub name: String,
    pub definition: String,
    pub parameters: Vec<u8>,
    pub sequence: u64,
}

/// Typed operations over the vertex table, which also carries instance rows
/// (`row = ""`) and definition rows (`partition = ""`).
#[derive(Clone)]
pub struct VertexManager {
    service: Arc<dyn TableService>,
}

impl VertexManager {
    pub fn new(service: Arc<dyn TableService>) -> Self {
        Self { service }
    }

    /// Register (or re-register) an instance; address and port are replaced
    /// on re-registration.
    pub async fn register_instance(
        &self,
        name: &str,
        address: &str,
        port: u16,
    ) -> Result<(), Error> {
        naming::validate_identifier(name)?;

        let entity = TableEntity::new(name, "")
            .with_column(COL_ADDRESS, address)
            .with_column(COL_PORT, port.to_string());
        self.service.upsert(VERTEX_TABLE, entity).await
    }

    pub async fn instance_for_name(&self, name: &str) -> Result<InstanceRow, Error> {
        let entity = self
            .service
            .get(VERTEX_TABLE, name, "")
            .await?
            .ok_or(Error::NotFound)?;

        decode_instance(&entity)
    }

    pub async fn all_instances(&self) -> Result<Vec<InstanceRow>, Error> {
        let mut instances = Vec::new();
        for entity in self.service.scan(VERTEX_TABLE).await? {
            if entity.row.is_empty() && !entity.partition.is_empty() {
                instances.push(decode_instance(&entity)?);
            }
        }

        Ok(instances)
    }

    pub async fn delete_instance(&self, name: &str) -> Result<(), Error> {
        self.service.delete(VERTEX_TABLE, name, "").await
    }

    /// Write a definition template row.
    pub async fn define_vertex(&self, definition: &VertexDefinition) -> Result<(), Error> {
        naming::validate_definition_name(&definition.name)?;

        let entity = TableEntity::new("", definition.name.as_str())
            .with_column(COL_CREATOR, BASE64_STANDARD.encode(&definition.creator))
            .with_column(COL_SHARDED, if definition.is_sharded { "1" } else { "0" });
        self.service.upsert(VERTEX_TABLE, entity).await
    }

    pub async fn row_for_definition(&self, name: &str) -> Result<VertexDefinition, Error> {
        let entity = self
            .service
            .get(VERTEX_TABLE, "", name)
            .await?
            .ok_or(Error::NotFound)?;

        Ok(VertexDefinition {
            name: entity.row.clone(),
            creator: decode_blob(&entity, COL_CREATOR)?,
            is_sharded: entity.column(COL_SHARDED)? == "1",
        })
    }

    pub async fn delete_definition(&self, name: &str) -> Result<(), Error> {
        self.service.delete(VERTEX_TABLE, "", name).await
    }

    /// Write a vertex row; replacing an existing `(instance, vertex)` row
    /// keeps its insertion stamp.
    pub async fn register_vertex(
        &self,
        instance: &str,
        vertex: &str,
        definition: &str,
        parameters: &[u8],
    ) -> Result<(), Error> {
        naming::validate_identifier(instance)?;
        naming::validate_identifier(vertex)?;

        let entity = TableEntity::new(instance, vertex)
            .with_column(COL_DEFINITION, definition)
            .with_column(COL_PARAMETERS, BASE64_STANDARD.encode(parameters));
        self.service.upsert(VERTEX_TABLE, entity).await
    }

    pub async fn vertex_row(&self, instance: &str, vertex: &str) -> Result<VertexRow, Error> {
        let entity = self
            .service
            .get(VERTEX_TABLE, instance, vertex)
            .await?
            .ok_or(Error::NotFound)?;

        decode_vertex(&entity)
    }

    /// Any instance hosting `vertex`; ties broken by earliest insertion.
    pub async fn row_for_vertex(&self, vertex: &str) -> Result<VertexRow, Error> {
        self.candidate_rows(vertex)
            .await?
            .into_iter()
            .next()
            .ok_or(Error::NotFound)
    }

    /// Like [`Self::row_for_vertex`], but skipping rows whose instance
    /// address is unknown: no instance row, or an empty address (detached
    /// vertices register address-less instances that cannot be dialed).
    pub async fn row_for_active_vertex(&self, vertex: &str) -> Result<VertexRow, Error> {
        for row in self.candidate_rows(vertex).await? {
            match self.instance_for_name(&row.instance).await {
                Ok(instance) if !instance.address.is_empty() => return Ok(row),
                _ => continue,
            }
        }

        Err(Error::NotFound)
    }

    /// Delete every vertex row on `instance` whose name starts with
    /// `prefix`, in partition-scoped batches.
    pub async fn delete_vertices_with_prefix(
        &self,
        instance: &str,
        prefix: &str,
    ) -> Result<(), Error> {
        let rows: Vec<String> = self
            .service
            .scan_partition(VERTEX_TABLE, instance)
            .await?
            .into_iter()
            .map(|entity| entity.row)
            .filter(|row| row.starts_with(prefix))
            .collect();

        for batch in rows.chunks(super::DELETE_BATCH_SIZE) {
            self.service.delete_batch(VERTEX_TABLE, instance, batch).await?;
        }

        Ok(())
    }

    pub async fn all_vertices_for_instance(&self, instance: &str) -> Result<Vec<VertexRow>, Error> {
        let mut vertices = Vec::new();
        for entity in self.service.scan_partition(VERTEX_TABLE, instance).await? {
            if !entity.row.is_empty() {
                vertices.push(decode_vertex(&entity)?);
            }
        }

        Ok(vertices)
    }

    pub async fn delete_vertex(&self, instance: &str, vertex: &str) -> Result<(), Error> {
        self.service.delete(VERTEX_TABLE, instance, vertex).await
    }

    /// Every vertex row for this name, across instances, earliest insertion
    /// first. Definition template rows (empty partition) are excluded.
    async fn candidate_rows(&self, vertex: &str) -> Result<Vec<VertexRow>, Error> {
        let mut rows = Vec::new();
        for entity in self.service.scan(VERTEX_TABLE).await? {
            if entity.row == vertex && !entity.partition.is_empty() {
                rows.push(decode_vertex(&entity)?);
            }
        }

        rows.sort_by_key(|row| row.sequence);
        Ok(rows)
    }
}

fn decode_instance(entity: &TableEntity) -> Result<InstanceRow, Error> {
    Ok(InstanceRow {
        name: entity.partition.clone(),
        address: entity.column(COL_ADDRESS)?.to_string(),
        port: entity
            .column(COL_PORT)?
            .parse()
            .map_err(|_| Error::InvalidColumn(COL_PORT))?,
    })
}

pub(crate) fn decode_vertex(entity: &TableEntity) -> Result<VertexRow, Error> {
    Ok(VertexRow {
        instance: entity.partition.clone(),
        name: entity.row.clone(),
        definition: entity.column(COL_DEFINITION)?.to_string(),
        parameters: decode_blob(entity, COL_PARAMETERS)?,
        sequence: entity.sequence,
    })
}

fn decode_blob(entity: &TableEntity, column: &'static str) -> Result<Vec<u8>, Error> {
    BASE64_STANDARD
        .decode(entity.column(column)?)
        .map_err(|_| Error::InvalidColumn(column))
}
