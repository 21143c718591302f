//! ## Client control plane
//!
//! The external face of the fabric: define vertex types, materialize them
//! on named instances (singly or sharded), wire endpoints together, and
//! participate directly in the dataflow as a detached vertex living in the
//! client process.
//!
//! Every control call follows the same discipline: the metadata write comes
//! first and is authoritative, the control RPC to a worker is best-effort.
//! A failed RPC returns its error code to the caller without rolling back
//! the metadata; the responsible worker re-applies the intent the next time
//! it reconciles.

pub mod detached;

use std::sync::Arc;

use codec::{ControlTag, ErrorCode, message::{ConnectRequest, LoadVertexRequest}};
use runtime::{dial, pool::StreamPool, registry::shard_params};
use store::{
    Error, Metadata,
    connections::ConnectionRow,
    naming::{ephemeral_instance_name, shard_name},
    sharding::ShardingInfo,
    vertices::{InstanceRow, VertexDefinition},
};

pub use detached::{DetachedVertex, SharedStream};

/// Which side opens the TCP connection. Data always flows from the output
/// endpoint to the input endpoint; `ToSide` only swaps the dialer, for
/// destinations that cannot be dialed (NAT, firewalls).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionInitiator {
    #[default]
    FromSide,
    ToSide,
}

#[derive(Clone)]
pub struct CraClient {
    meta: Metadata,
    pool: Arc<StreamPool>,
}

impl CraClient {
    /// Open the control plane over a storage connection string.
    pub async fn open(conn_str: &str) -> Result<Self, Error> {
        Ok(Self {
            meta: Metadata::open(conn_str).await?,
            pool: Arc::new(StreamPool::default()),
        })
    }

    /// Direct access to the typed metadata managers.
    pub fn metadata(&self) -> &Metadata {
        &self.meta
    }

    /// Define a vertex type: upload the artifact blob and write the
    /// template row. `creator` is the factory registry key that every
    /// hosting process registers at start.
    pub async fn define_vertex(
        &self,
        definition: &str,
        creator: &[u8],
        is_sharded: bool,
    ) -> ErrorCode {
        if let Err(e) = self.meta.artifacts.upload(definition, creator).await {
            log::error!("artifact upload failed: definition={}, err={}", definition, e);
            return store_code(&e);
        }

        let row = VertexDefinition {
            name: definition.to_string(),
            creator: creator.to_vec(),
            is_sharded,
        };
        match self.meta.vertices.define_vertex(&row).await {
            Ok(()) => ErrorCode::Success,
            Err(e) => {
                log::error!("vertex define failed: definition={}, err={}", definition, e);
                store_code(&e)
            }
        }
    }

    /// Materialize one vertex on one instance. The vertex row is written
    /// first; the LOAD_VERTEX RPC is best-effort and a restarting worker
    /// re-applies the row on its own.
    pub async fn instantiate_vertex(
        &self,
        instance: &str,
        vertex: &str,
        definition: &str,
        params: &[u8],
    ) -> ErrorCode {
        if self.meta.vertices.row_for_definition(definition).await.is_err() {
            return ErrorCode::VertexNotDefined;
        }

        if let Err(e) = self
            .meta
            .vertices
            .register_vertex(instance, vertex, definition, params)
            .await
        {
            log::error!("vertex row write failed: vertex={}, err={}", vertex, e);
            return store_code(&e);
        }

        let target = match self.meta.vertices.instance_for_name(instance).await {
            Ok(target) => target,
            Err(_) => {
                log::warn!(
                    "instance unknown, vertex stays dormant: instance={}, vertex={}",
                    instance,
                    vertex
                );
                return ErrorCode::VertexNotFound;
            }
        };

        let request = LoadVertexRequest {
            vertex: vertex.to_string(),
            definition: definition.to_string(),
            params: params.to_vec(),
        };

        match dial::call_load_vertex(&self.pool, &target.address, target.port, &request).await {
            Ok(code) => code,
            Err(e) => {
                log::warn!(
                    "load rpc failed, row kept for reconcile: instance={}, vertex={}, err={}",
                    instance,
                    vertex,
                    e
                );
                ErrorCode::ConnectionEstablishFailed
            }
        }
    }

    /// Materialize a sharded vertex: `instances.len() * shards_per_instance`
    /// shards named `base$N`, shard `N` hosted round-robin.
    ///
    /// All per-shard instantiations are launched before the sharded
    /// descriptor is written, and a descriptor write failure does not
    /// cancel them: the shards exist in the vertex table independently.
    /// The aggregate code is the first non-success.
    pub async fn instantiate_sharded(
        &self,
        instances: &[String],
        base: &str,
        definition: &str,
        params: &[u8],
        shards_per_instance: usize,
        shard_locator: Option<&str>,
    ) -> ErrorCode {
        if instances.is_empty() || shards_per_instance == 0 {
            return ErrorCode::ServerFailed;
        }

        let total = instances.len() * shards_per_instance;
        let all_shards: Vec<u32> = (0..total as u32).collect();

        let mut launched = Vec::with_capacity(total);
        for shard in 0..total as u32 {
            let client = self.clone();
            let instance = instances[shard as usize % instances.len()].clone();
            let vertex = shard_name(base, shard);
            let definition = definition.to_string();
            let params = shard_params(shard, params);

            launched.push(tokio::spawn(async move {
                client
                    .instantiate_vertex(&instance, &vertex, &definition, &params)
                    .await
            }));
        }

        if let Err(e) = self
            .meta
            .sharded
            .register(base, instances, &all_shards, &all_shards, &[], shard_locator)
            .await
        {
            log::error!("sharding descriptor write failed: base={}, err={}", base, e);
        }

        let mut aggregate = ErrorCode::Success;
        for handle in launched {
            let code = match handle.await {
                Ok(code) => code,
                Err(_) => ErrorCode::ServerFailed,
            };
            if aggregate.is_success() && !code.is_success() {
                aggregate = code;
            }
        }

        aggregate
    }

    /// The authoritative sharding descriptor for `base`.
    pub async fn get_sharding_info(&self, base: &str) -> Result<ShardingInfo, Error> {
        self.meta.sharded.latest_sharding_info(base).await
    }

    /// Connect two endpoints, from-side dialing.
    pub async fn connect(
        &self,
        from_vertex: &str,
        from_endpoint: &str,
        to_vertex: &str,
        to_endpoint: &str,
    ) -> ErrorCode {
        self.connect_with_initiator(
            from_vertex,
            from_endpoint,
            to_vertex,
            to_endpoint,
            ConnectionInitiator::FromSide,
        )
        .await
    }

    /// Connect two endpoints with an explicit dialing side.
    ///
    /// The connection row is inserted before any RPC so the intent survives
    /// every downstream failure; on RPC failure the row stays and the
    /// initiator's worker retries on reconcile.
    pub async fn connect_with_initiator(
        &self,
        from_vertex: &str,
        from_endpoint: &str,
        to_vertex: &str,
        to_endpoint: &str,
        initiator: ConnectionInitiator,
    ) -> ErrorCode {
        if self.meta.vertices.row_for_vertex(from_vertex).await.is_err()
            || self.meta.vertices.row_for_vertex(to_vertex).await.is_err()
        {
            return ErrorCode::VertexNotFound;
        }

        let row = ConnectionRow::new(from_vertex, from_endpoint, to_vertex, to_endpoint);
        if let Err(e) = self.meta.connections.add_connection(&row).await {
            log::error!(
                "connection row write failed: from={}/{}, to={}/{}, err={}",
                from_vertex,
                from_endpoint,
                to_vertex,
                to_endpoint,
                e
            );
            return store_code(&e);
        }

        let (initiator_vertex, tag) = match initiator {
            ConnectionInitiator::FromSide => (from_vertex, ControlTag::ConnectVertexInitiator),
            ConnectionInitiator::ToSide => (to_vertex, ControlTag::ConnectVertexInitiatorReverse),
        };

        let target = match self.active_instance_of(initiator_vertex).await {
            Ok(target) => target,
            Err(code) => return code,
        };

        let request = ConnectRequest::new(from_vertex, from_endpoint, to_vertex, to_endpoint);
        match dial::call_initiator(&self.pool, &target.address, target.port, tag, &request).await {
            Ok(code) => code,
            Err(e) => {
                log::warn!(
                    "connect rpc failed, row kept for reconcile: initiator={}, err={}",
                    initiator_vertex,
                    e
                );
                ErrorCode::ConnectionEstablishFailed
            }
        }
    }

    /// Wire two sharded groups with a full mesh.
    ///
    /// With `F` source shards and `T` destination shards, `from_endpoints`
    /// must have `T` entries and `to_endpoints` must have `F`; then shard
    /// `j`'s endpoint `i` feeds shard `i`'s endpoint `j`, for `F * T`
    /// connections total. Any arity mismatch creates zero rows.
    pub async fn connect_sharded_with_full_mesh(
        &self,
        from_base: &str,
        from_endpoints: &[&str],
        to_base: &str,
        to_endpoints: &[&str],
    ) -> ErrorCode {
        let from_info = match self.get_sharding_info(from_base).await {
            Ok(info) => info,
            Err(_) => return ErrorCode::VertexNotFound,
        };
        let to_info = match self.get_sharding_info(to_base).await {
            Ok(info) => info,
            Err(_) => return ErrorCode::VertexNotFound,
        };

        let from_shards = from_info.all_shards.len();
        let to_shards = to_info.all_shards.len();
        if from_endpoints.len() != to_shards || to_endpoints.len() != from_shards {
            return ErrorCode::VerticesEndpointsNotMatched;
        }

        let mut launched = Vec::with_capacity(from_shards * to_shards);
        for (i, from_endpoint) in from_endpoints.iter().enumerate() {
            for (j, from_shard) in from_info.all_shards.iter().enumerate() {
                let client = self.clone();
                let from_vertex = shard_name(from_base, *from_shard);
                let to_vertex = shard_name(to_base, to_info.all_shards[i]);
                let from_endpoint = from_endpoint.to_string();
                let to_endpoint = to_endpoints[j].to_string();

                launched.push(tokio::spawn(async move {
                    client
                        .connect(&from_vertex, &from_endpoint, &to_vertex, &to_endpoint)
                        .await
                }));
            }
        }

        let mut aggregate = ErrorCode::Success;
        for handle in launched {
            let code = match handle.await {
                Ok(code) => code,
                Err(_) => ErrorCode::ServerFailed,
            };
            if aggregate.is_success() && !code.is_success() {
                aggregate = code;
            }
        }

        aggregate
    }

    /// Drop the connection row. Fire-and-forget: live streams are left to
    /// die on their own and nothing re-establishes the link afterwards.
    pub async fn disconnect(
        &self,
        from_vertex: &str,
        from_endpoint: &str,
        to_vertex: &str,
        to_endpoint: &str,
    ) -> ErrorCode {
        let row = ConnectionRow::new(from_vertex, from_endpoint, to_vertex, to_endpoint);
        match self.meta.connections.delete_connection(&row).await {
            Ok(()) => ErrorCode::Success,
            Err(e) => {
                log::error!("connection row delete failed: err={}", e);
                store_code(&e)
            }
        }
    }

    pub async fn delete_vertex(&self, instance: &str, vertex: &str) -> ErrorCode {
        match self.meta.vertices.delete_vertex(instance, vertex).await {
            Ok(()) => ErrorCode::Success,
            Err(e) => {
                log::error!("vertex row delete failed: vertex={}, err={}", vertex, e);
                store_code(&e)
            }
        }
    }

    pub async fn delete_instance(&self, instance: &str) -> ErrorCode {
        match self.meta.vertices.delete_instance(instance).await {
            Ok(()) => ErrorCode::Success,
            Err(e) => {
                log::error!("instance row delete failed: instance={}, err={}", instance, e);
                store_code(&e)
            }
        }
    }

    /// Remove a sharded vertex's child rows from the named instances, one
    /// partition-scoped prefix delete per instance, in parallel, plus the
    /// sharding descriptor itself.
    pub async fn delete_sharded_from_instances(
        &self,
        base: &str,
        instances: &[String],
    ) -> ErrorCode {
        let mut launched = Vec::with_capacity(instances.len());
        for instance in instances {
            let meta = self.meta.clone();
            let instance = instance.clone();
            let prefix = format!("{}$", base);

            launched.push(tokio::spawn(async move {
                meta.vertices
                    .delete_vertices_with_prefix(&instance, &prefix)
                    .await
            }));
        }

        let mut aggregate = ErrorCode::Success;
        for handle in launched {
            let failed = match handle.await {
                Ok(Err(e)) => {
                    log::error!("sharded prefix delete failed: base={}, err={}", base, e);
                    true
                }
                Err(_) => true,
                Ok(Ok(())) => false,
            };
            if failed && aggregate.is_success() {
                aggregate = ErrorCode::ServerFailed;
            }
        }

        if let Err(e) = self.meta.sharded.delete(base).await {
            log::error!("sharding descriptor delete failed: base={}, err={}", base, e);
            if aggregate.is_success() {
                aggregate = ErrorCode::ServerFailed;
            }
        }

        aggregate
    }

    /// Drop every reserved table. Tests and fresh bring-up only.
    pub async fn reset(&self) -> ErrorCode {
        match self.meta.reset().await {
            Ok(()) => ErrorCode::Success,
            Err(e) => {
                log::error!("reset failed: err={}", e);
                ErrorCode::ServerFailed
            }
        }
    }

    /// Join the fabric as a detached vertex under a fresh ephemeral
    /// instance (deleted again on dispose).
    pub async fn register_as_vertex(&self, vertex: &str) -> Result<DetachedVertex, Error> {
        let instance = ephemeral_instance_name();
        DetachedVertex::register(self.clone(), vertex, &instance, true).await
    }

    /// Join the fabric as a detached vertex under an existing instance
    /// name.
    pub async fn register_as_vertex_on(
        &self,
        vertex: &str,
        instance: &str,
    ) -> Result<DetachedVertex, Error> {
        DetachedVertex::register(self.clone(), vertex, instance, false).await
    }

    pub(crate) fn pool(&self) -> &StreamPool {
        &self.pool
    }

    /// The reachable instance currently hosting `vertex`.
    pub(crate) async fn active_instance_of(&self, vertex: &str) -> Result<InstanceRow, ErrorCode> {
        let row = self
            .meta
            .vertices
            .row_for_active_vertex(vertex)
            .await
            .map_err(|_| ErrorCode::VertexNotFound)?;

        self.meta
            .vertices
            .instance_for_name(&row.instance)
            .await
            .map_err(|_| ErrorCode::VertexNotFound)
    }
}

fn store_code(error: &Error) -> ErrorCode {
    match error {
        Error::NotFound => ErrorCode::VertexNotFound,
        _ => ErrorCode::ServerFailed,
    }
}
