use std::sync::Arc;

use super::{CONNECTION_TABLE, Error, TableEntity, TableService, naming};

const COL_TO_VERTEX: &str = "tovertex";
const COL_TO_ENDPOINT: &str = "toendpoint";
const COL_FROM_ENDPOINT: &str = "fromendpoint";

/// A directed link from an output endpoint to an input endpoint, identified
/// by its 4-tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionRow {
    pub from_vertex: String,
    pub from_endpoint: String,
    pub to_vertex: String,
    pub to_endpoint: String,
}

impl ConnectionRow {
    pub fn new(
        from_vertex: impl Into<String>,
        from_endpoint: impl Into<String>,
        to_vertex: impl Into<String>,
        to_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            from_vertex: from_vertex.into(),
            from_endpoint: from_endpoint.into(),
            to_vertex: to_vertex.into(),
            to_endpoint: to_endpoint.into(),
        }
    }

    /// Row key under the `from_vertex` partition.
    fn row_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.from_endpoint, self.to_vertex, self.to_endpoint
        )
    }
}

/// Connection rows are partitioned by source vertex, so the from-side query
/// is a partition scan and the to-side query filters a table scan.
#[derive(Clone)]
pub struct ConnectionManager {
    service: Arc<dyn TableService>,
}

impl ConnectionManager {
    pub fn new(service: Arc<dyn TableService>) -> Self {
        Self { service }
    }

    /// Idempotent insert-or-replace of the 4-tuple row.
    pub async fn add_connection(&self, connection: &ConnectionRow) -> Result<(), Error> {
        naming::validate_identifier(&connection.from_vertex)?;
        naming::validate_identifier(&connection.from_endpoint)?;
        naming::validate_identifier(&connection.to_vertex)?;
        naming::validate_identifier(&connection.to_endpoint)?;

        let entity = TableEntity::new(connection.from_vertex.as_str(), connection.row_key())
            .with_column(COL_FROM_ENDPOINT, connection.from_endpoint.as_str())
            .with_column(COL_TO_VERTEX, connection.to_vertex.as_str())
            .with_column(COL_TO_ENDPOINT, connection.to_endpoint.as_str());
        self.service.upsert(CONNECTION_TABLE, entity).await
    }

    pub async fn connection_exists(&self, connection: &ConnectionRow) -> Result<bool, Error> {
        Ok(self
            .service
            .get(
                CONNECTION_TABLE,
                &connection.from_vertex,
                &connection.row_key(),
            )
            .await?
            .is_some())
    }

    pub async fn connections_from(&self, vertex: &str) -> Result<Vec<ConnectionRow>, Error> {
        self.service
            .scan_partition(CONNECTION_TABLE, vertex)
            .await?
            .iter()
            .map(decode)
            .collect()
    }

    pub async fn connections_to(&self, vertex: &str) -> Result<Vec<ConnectionRow>, Error> {
        let mut connections = Vec::new();
        for entity in self.service.scan(CONNECTION_TABLE).await? {
            if entity.column(COL_TO_VERTEX)? == vertex {
                connections.push(decode(&entity)?);
            }
        }

        Ok(connections)
    }

    pub async fn delete_connection(&self, connection: &ConnectionRow) -> Result<(), Error> {
        self.service
            .delete(
                CONNECTION_TABLE,
                &connection.from_vertex,
                &connection.row_key(),
            )
            .await
    }

    /// Delete every connection touching `vertex`, both directions.
    pub async fn delete_all_for_vertex(&self, vertex: &str) -> Result<(), Error> {
        super::delete_partition(&self.service, CONNECTION_TABLE, vertex).await?;

        for connection in self.connections_to(vertex).await? {
            self.delete_connection(&connection).await?;
        }

        Ok(())
    }
}

fn decode(entity: &TableEntity) -> Result<ConnectionRow, Error> {
    Ok(ConnectionRow {
        from_vertex: entity.partition.clone(),
        from_endpoint: entity.column(COL_FROM_ENDPOINT)?.to_string(),
        to_vertex: entity.column(COL_TO_VERTEX)?.to_string(),
        to_endpoint: entity.column(COL_TO_ENDPOINT)?.to_string(),
    })
}
