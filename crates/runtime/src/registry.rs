use std::sync::{Arc, LazyLock};

use ahash::{HashMap, HashMapExt};
use parking_lot::RwLock;

use super::{Error, Vertex};

/// Factory producing a fresh vertex object; sharded definitions receive
/// their shard index, plain ones get `None`.
pub type VertexFactory = Arc<dyn Fn(Option<u32>) -> Arc<dyn Vertex> + Send + Sync>;

/// Maps a key payload and shard count to the shard that owns the key.
pub type ShardLocator = Arc<dyn Fn(&[u8], usize) -> usize + Send + Sync>;

static VERTEX_REGISTRY: LazyLock<VertexRegistry> = LazyLock::new(VertexRegistry::default);
static LOCATOR_REGISTRY: LazyLock<ShardLocatorRegistry> =
    LazyLock::new(ShardLocatorRegistry::default);

/// Process-wide table of vertex factories keyed by definition name.
///
/// Serialized factory expressions are replaced by this registry: every
/// process that may host a definition registers its factory at start, and
/// the definition row carries only the registry key.
#[derive(Default)]
pub struct VertexRegistry {
    factories: RwLock<HashMap<String, VertexFactory>>,
}

impl VertexRegistry {
    pub fn global() -> &'static Self {
        &VERTEX_REGISTRY
    }

    pub fn register(&self, definition: &str, factory: VertexFactory) {
        self.factories
            .write()
            .insert(definition.to_string(), factory);
    }

    pub fn contains(&self, definition: &str) -> bool {
        self.factories.read().contains_key(definition)
    }

    pub fn create(&self, definition: &str, shard: Option<u32>) -> Result<Arc<dyn Vertex>, Error> {
        let factory = self
            .factories
            .read()
            .get(definition)
            .cloned()
            .ok_or_else(|| Error::FactoryNotFound(definition.to_string()))?;

        Ok(factory(shard))
    }
}

/// Process-wide table of shard locators keyed by the symbolic name stored
/// in the sharded-vertex descriptor.
#[derive(Default)]
pub struct ShardLocatorRegistry {
    locators: RwLock<HashMap<String, ShardLocator>>,
}

impl ShardLocatorRegistry {
    pub fn global() -> &'static Self {
        &LOCATOR_REGISTRY
    }

    pub fn register(&self, name: &str, locator: ShardLocator) {
        self.locators.write().insert(name.to_string(), locator);
    }

    pub fn resolve(&self, name: &str) -> Option<ShardLocator> {
        self.locators.read().get(name).cloned()
    }
}

/// Prefix the user parameter blob with the 4-byte little-endian shard
/// index, forming the `(shardIndex, userParam)` tuple a sharded vertex
/// receives.
pub fn shard_params(shard: u32, params: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(params.len() + 4);
    bytes.extend_from_slice(&shard.to_le_bytes());
    bytes.extend_from_slice(params);
    bytes
}

/// Split a sharded parameter blob back into shard index and user payload.
pub fn split_shard_params(bytes: &[u8]) -> Result<(u32, &[u8]), Error> {
    if bytes.len() < 4 {
        return Err(Error::InitializationFailed(
            "sharded parameter blob too short".to_string(),
        ));
    }

    let index = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    Ok((index, &bytes[4..]))
}
