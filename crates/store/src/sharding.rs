use std::sync::Arc;

use super::{
    Error, SHARDED_VERTEX_TABLE, TableEntity, TableService, VERTEX_TABLE, naming,
    vertices::VertexRow,
};

const COL_INSTANCES: &str = "instances";
const COL_ALL_SHARDS: &str = "allshards";
const COL_ADDED_SHARDS: &str = "addedshards";
const COL_REMOVED_SHARDS: &str = "removedshards";
const COL_LOCATOR: &str = "shardlocator";

/// One epoch of a sharded vertex's descriptor; the latest epoch is
/// authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardingInfo {
    pub base: String,
    pub all_instances: Vec<String>,
    pub all_shards: Vec<u32>,
    pub added_shards: Vec<u32>,
    pub removed_shards: Vec<u32>,
    pub shard_locator: Option<String>,
    pub epoch: u64,
}

#[derive(Clone)]
pub struct ShardedVertexManager {
    service: Arc<dyn TableService>,
}

impl ShardedVertexManager {
    pub fn new(service: Arc<dyn TableService>) -> Self {
        Self { service }
    }

    /// Write a new descriptor epoch (previous max + 1).
    pub async fn register(
        &self,
        base: &str,
        instances: &[String],
        all_shards: &[u32],
        added_shards: &[u32],
        removed_shards: &[u32],
        shard_locator: Option<&str>,
    ) -> Result<ShardingInfo, Error> {
        naming::validate_identifier(base)?;

        let epoch = match self.latest_sharding_info(base).await {
            Ok(info) => info.epoch + 1,
            Err(Error::NotFound) => 0,
            Err(err) => return Err(err),
        };

        let mut entity = TableEntity::new(base, epoch_key(epoch))
            .with_column(COL_INSTANCES, instances.join(","))
            .with_column(COL_ALL_SHARDS, join_shards(all_shards))
            .with_column(COL_ADDED_SHARDS, join_shards(added_shards))
            .with_column(COL_REMOVED_SHARDS, join_shards(removed_shards));
        if let Some(locator) = shard_locator {
            entity = entity.with_column(COL_LOCATOR, locator);
        }

        self.service.upsert(SHARDED_VERTEX_TABLE, entity).await?;

        Ok(ShardingInfo {
            base: base.to_string(),
            all_instances: instances.to_vec(),
            all_shards: all_shards.to_vec(),
            added_shards: added_shards.to_vec(),
            removed_shards: removed_shards.to_vec(),
            shard_locator: shard_locator.map(str::to_string),
            epoch,
        })
    }

    pub async fn latest_sharding_info(&self, base: &str) -> Result<ShardingInfo, Error> {
        // Epoch keys are zero-padded, the partition scan comes back ordered.
        self.service
            .scan_partition(SHARDED_VERTEX_TABLE, base)
            .await?
            .last()
            .map(decode)
            .ok_or(Error::NotFound)?
    }

    /// The child vertex rows of `base`, found by prefix scan on `base$`
    /// over the vertex table.
    pub async fn rows_for_sharded_vertex(&self, base: &str) -> Result<Vec<VertexRow>, Error> {
        let prefix = format!("{}{}", base, naming::SHARD_SEPARATOR);

        let mut rows = Vec::new();
        for entity in self.service.scan(VERTEX_TABLE).await? {
            if !entity.partition.is_empty() && entity.row.starts_with(&prefix) {
                rows.push(super::vertices::decode_vertex(&entity)?);
            }
        }

        Ok(rows)
    }

    pub async fn delete(&self, base: &str) -> Result<(), Error> {
        super::delete_partition(&self.service, SHARDED_VERTEX_TABLE, base).await
    }
}

fn epoch_key(epoch: u64) -> String {
    format!("{:020}", epoch)
}

fn join_shards(shards: &[u32]) -> String {
    shards
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn split_shards(value: &str, column: &'static str) -> Result<Vec<u32>, Error> {
    if value.is_empty() {
        return Ok(Vec::new());
    }

    value
        .split(',')
        .map(|shard| shard.parse().map_err(|_| Error::InvalidColumn(column)))
        .collect()
}

fn decode(entity: &TableEntity) -> Result<ShardingInfo, Error> {
    let instances = entity.column(COL_INSTANCES)?;

    Ok(ShardingInfo {
        base: entity.partition.clone(),
        all_instances: if instances.is_empty() {
            Vec::new()
        } else {
            instances.split(',').map(str::to_string).collect()
        },
        all_shards: split_shards(entity.column(COL_ALL_SHARDS)?, COL_ALL_SHARDS)?,
        added_shards: split_shards(entity.column(COL_ADDED_SHARDS)?, COL_ADDED_SHARDS)?,
        removed_shards: split_shards(entity.column(COL_REMOVED_SHARDS)?, COL_REMOVED_SHARDS)?,
        shard_locator: entity.columns.get(COL_LOCATOR).cloned(),
        epoch: entity
            .row
            .parse()
            .map_err(|_| Error::InvalidColumn("epoch"))?,
    })
}
