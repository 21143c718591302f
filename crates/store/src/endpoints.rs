use std::sync::Arc;

use super::{ENDPOINT_TABLE, Error, TableEntity, TableService, naming};

const COL_DIRECTION: &str = "direction";
const COL_ASYNC: &str = "isasync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

/// A named input or output port on a vertex. Direction and async are
/// immutable once the row exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRow {
    pub vertex: String,
    pub endpoint: String,
    pub direction: Direction,
    pub is_async: bool,
}

#[derive(Clone)]
pub struct EndpointManager {
    service: Arc<dyn TableService>,
}

impl EndpointManager {
    pub fn new(service: Arc<dyn TableService>) -> Self {
        Self { service }
    }

    /// Persist an endpoint row. Re-adding an identical endpoint is a no-op;
    /// changing direction or async of an existing one is a conflict.
    pub async fn add_endpoint(
        &self,
        vertex: &str,
        endpoint: &str,
        direction: Direction,
        is_async: bool,
    ) -> Result<(), Error> {
        naming::validate_identifier(vertex)?;
        naming::validate_identifier(endpoint)?;

        if let Some(existing) = self.endpoint_row(vertex, endpoint).await? {
            if existing.direction != direction || existing.is_async != is_async {
                return Err(Error::Conflict);
            }

            return Ok(());
        }

        let entity = TableEntity::new(vertex, endpoint)
            .with_column(COL_DIRECTION, direction.as_str())
            .with_column(COL_ASYNC, if is_async { "1" } else { "0" });
        self.service.upsert(ENDPOINT_TABLE, entity).await
    }

    pub async fn endpoint_row(
        &self,
        vertex: &str,
        endpoint: &str,
    ) -> Result<Option<EndpointRow>, Error> {
        match self.service.get(ENDPOINT_TABLE, vertex, endpoint).await? {
            Some(entity) => Ok(Some(decode(&entity)?)),
            None => Ok(None),
        }
    }

    pub async fn endpoints_of(
        &self,
        vertex: &str,
        direction: Direction,
    ) -> Result<Vec<EndpointRow>, Error> {
        let mut endpoints = Vec::new();
        for entity in self.service.scan_partition(ENDPOINT_TABLE, vertex).await? {
            let row = decode(&entity)?;
            if row.direction == direction {
                endpoints.push(row);
            }
        }

        Ok(endpoints)
    }

    pub async fn all_endpoints_of(&self, vertex: &str) -> Result<Vec<EndpointRow>, Error> {
        self.service
            .scan_partition(ENDPOINT_TABLE, vertex)
            .await?
            .iter()
            .map(decode)
            .collect()
    }

    pub async fn delete_endpoint(&self, vertex: &str, endpoint: &str) -> Result<(), Error> {
        self.service.delete(ENDPOINT_TABLE, vertex, endpoint).await
    }

    pub async fn delete_all_for_vertex(&self, vertex: &str) -> Result<(), Error> {
        super::delete_partition(&self.service, ENDPOINT_TABLE, vertex).await
    }
}

fn decode(entity: &TableEntity) -> Result<EndpointRow, Error> {
    let direction = match entity.column(COL_DIRECTION)? {
        "input" => Direction::Input,
        "output" => Direction::Output,
        _ => return Err(Error::InvalidColumn(COL_DIRECTION)),
    };

    Ok(EndpointRow {
        vertex: entity.partition.clone(),
        endpoint: entity.row.clone(),
        direction,
        is_async: entity.column(COL_ASYNC)? == "1",
    })
}
