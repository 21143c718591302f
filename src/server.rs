use crate::{config::Config, handler, reconcile::PendingConnections};

use std::{collections::HashSet, net::Ipv4Addr, sync::Arc};

use ahash::{HashMap, HashMapExt};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::{net::TcpListener, task::JoinHandle};

use runtime::{
    RuntimeObserver, Vertex,
    endpoints::{EndpointKind, EndpointRegistrar, EndpointTable},
    pool::StreamPool,
    registry::{VertexRegistry, split_shard_params},
};
use store::{
    Metadata,
    endpoints::Direction,
    naming::split_shard_name,
};

/// Start a worker and serve until the process ends.
///
/// Exposed as a function so integration tests can start workers in-process
/// instead of spawning the binary.
pub async fn worker_main(config: Config) -> Result<()> {
    let worker = Worker::startup(config).await?;
    worker.serve().await
}

/// A vertex materialized in this process.
pub struct LiveVertex {
    pub name: String,
    pub definition: String,
    pub vertex: Arc<dyn Vertex>,
    pub endpoints: Arc<EndpointTable>,
    /// Endpoint-IO tasks spawned for established streams; aborted (stream
    /// closed, peer sees EOF) when the vertex goes away.
    pub streams: Mutex<Vec<JoinHandle<()>>>,
}

impl LiveVertex {
    pub fn track_stream(&self, handle: JoinHandle<()>) {
        let mut streams = self.streams.lock();
        streams.retain(|task| !task.is_finished());
        streams.push(handle);
    }
}

/// The per-machine server: owns the live-vertex table, the outbound stream
/// pool, and the connection-retry queue.
pub struct Worker {
    pub(crate) config: Config,
    pub(crate) meta: Metadata,
    pub(crate) pool: Arc<StreamPool>,
    pub(crate) vertices: RwLock<HashMap<String, Arc<LiveVertex>>>,
    pub(crate) artifact_cache: Mutex<HashSet<String>>,
    pub(crate) pending: PendingConnections,
}

impl Worker {
    /// Register the instance row, materialize hosted vertices, enqueue
    /// reconnection attempts.
    pub async fn startup(config: Config) -> Result<Arc<Self>> {
        let meta = Metadata::open(&config.storage).await?;
        meta.vertices
            .register_instance(&config.instance, &config.address, config.port)
            .await?;

        log::info!(
            "instance registered: name={}, addr={}, port={}",
            config.instance,
            config.address,
            config.port,
        );

        let worker = Arc::new(Self {
            meta,
            config,
            pool: Arc::new(StreamPool::default()),
            vertices: RwLock::new(HashMap::new()),
            artifact_cache: Mutex::new(HashSet::new()),
            pending: PendingConnections::default(),
        });

        worker.load_hosted_vertices().await;
        worker.reconcile_connections().await;

        Ok(worker)
    }

    /// Bind the control listener and accept forever; a port already in use
    /// is a fatal init error.
    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.config.port)).await?;

        log::info!(
            "worker listening: instance={}, addr={}, port={}",
            self.config.instance,
            self.config.address,
            self.config.port,
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("control socket accept: addr={:?}", addr);

            if let Err(e) = stream.set_nodelay(true) {
                log::error!("control socket set nodelay failed: addr={}, err={}", addr, e);
            }

            let worker = self.clone();
            tokio::spawn(async move {
                handler::serve_socket(worker, stream, addr).await;
            });
        }
    }

    pub fn observer(self: &Arc<Self>) -> Arc<dyn RuntimeObserver> {
        Arc::new(WorkerObserver {
            worker: self.clone(),
        })
    }

    pub fn live_vertex(&self, name: &str) -> Option<Arc<LiveVertex>> {
        self.vertices.read().get(name).cloned()
    }

    /// Materialize every vertex row persisted for this instance. A vertex
    /// that fails to build is logged and skipped; the row remains for the
    /// next restart.
    async fn load_hosted_vertices(self: &Arc<Self>) {
        let rows = match self
            .meta
            .vertices
            .all_vertices_for_instance(&self.config.instance)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                log::error!(
                    "vertex rows scan failed: instance={}, err={}",
                    self.config.instance,
                    e
                );
                return;
            }
        };

        for row in rows {
            if let Err(e) = self
                .materialize_vertex(&row.name, &row.definition, &row.parameters)
                .await
            {
                log::error!(
                    "vertex restore failed: vertex={}, definition={}, err={}",
                    row.name,
                    row.definition,
                    e
                );
            }
        }
    }

    /// Build, initialize, and publish one vertex in-process. Re-loading an
    /// existing name disposes the prior instance first.
    pub async fn materialize_vertex(
        self: &Arc<Self>,
        name: &str,
        definition: &str,
        parameters: &[u8],
    ) -> Result<(), runtime::Error> {
        let row = self
            .meta
            .vertices
            .row_for_definition(definition)
            .await
            .map_err(|_| runtime::Error::FactoryNotFound(definition.to_string()))?;

        self.fetch_artifact(definition).await?;

        let key = String::from_utf8(row.creator)
            .map_err(|_| runtime::Error::FactoryNotFound(definition.to_string()))?;

        // Idempotent reload: the previous instance goes away first, exactly
        // once, before the new endpoints appear.
        if self.live_vertex(name).is_some() {
            self.dispose_vertex(name).await;
        }

        let (shard, user_params) = if row.is_sharded {
            let (shard, rest) = split_shard_params(parameters)?;
            debug_assert_eq!(split_shard_name(name).map(|(_, index)| index), Some(shard));
            (Some(shard), rest)
        } else {
            (None, parameters)
        };

        let vertex = VertexRegistry::global().create(&key, shard)?;
        let endpoints = Arc::new(EndpointTable::default());
        let registrar = EndpointRegistrar::new(name, endpoints.clone(), self.observer());

        vertex.initialize(&registrar, user_params).await?;

        let live = Arc::new(LiveVertex {
            name: name.to_string(),
            definition: definition.to_string(),
            vertex,
            endpoints,
            streams: Mutex::new(Vec::new()),
        });
        self.vertices.write().insert(name.to_string(), live);

        // Disposing a prior instance above removed the persisted row; put
        // it back so a restart rebuilds the vertex.
        if let Err(e) = self
            .meta
            .vertices
            .register_vertex(&self.config.instance, name, definition, parameters)
            .await
        {
            log::error!("vertex row rewrite failed: vertex={}, err={}", name, e);
        }

        log::info!("vertex loaded: vertex={}, definition={}", name, definition);
        Ok(())
    }

    /// Dispose a live vertex: user teardown, stream teardown, metadata
    /// cleanup, removal from the live table. Infallible to callers.
    pub async fn dispose_vertex(self: &Arc<Self>, name: &str) {
        let Some(live) = self.vertices.write().remove(name) else {
            return;
        };

        live.vertex.dispose().await;

        for task in live.streams.lock().drain(..) {
            task.abort();
        }

        self.observer().on_vertex_disposed(name).await;
        log::info!("vertex disposed: vertex={}", name);
    }

    /// Step 3 of startup: every persisted connection whose source side is
    /// hosted here gets a best-effort establishment attempt.
    async fn reconcile_connections(self: &Arc<Self>) {
        let hosted: Vec<String> = self.vertices.read().keys().cloned().collect();

        for vertex in hosted {
            self.enqueue_connections_from(&vertex).await;
        }
    }

    pub(crate) async fn enqueue_connections_from(self: &Arc<Self>, vertex: &str) {
        match self.meta.connections.connections_from(vertex).await {
            Ok(connections) => {
                for connection in connections {
                    let request = codec::message::ConnectRequest::new(
                        connection.from_vertex,
                        connection.from_endpoint,
                        connection.to_vertex,
                        connection.to_endpoint,
                    );
                    self.pending.enqueue(self, request, false);
                }
            }
            Err(e) => {
                log::warn!("connection scan failed: vertex={}, err={}", vertex, e);
            }
        }
    }

    async fn fetch_artifact(&self, definition: &str) -> Result<(), runtime::Error> {
        if self.artifact_cache.lock().contains(definition) {
            return Ok(());
        }

        self.meta
            .artifacts
            .download(definition)
            .await
            .map_err(|_| runtime::Error::FactoryNotFound(definition.to_string()))?;

        self.artifact_cache.lock().insert(definition.to_string());
        Ok(())
    }
}

/// Persists what vertices do to their own shape: endpoint rows appear when
/// user code registers endpoints, and all vertex state leaves the store on
/// dispose.
struct WorkerObserver {
    worker: Arc<Worker>,
}

#[async_trait]
impl RuntimeObserver for WorkerObserver {
    async fn on_endpoint_added(
        &self,
        vertex: &str,
        endpoint: &str,
        kind: EndpointKind,
    ) -> Result<(), runtime::Error> {
        let direction = if kind.is_input() {
            Direction::Input
        } else {
            Direction::Output
        };

        self.worker
            .meta
            .endpoints
            .add_endpoint(vertex, endpoint, direction, kind.is_async())
            .await
            .map_err(|e| runtime::Error::Observer(e.to_string()))
    }

    async fn on_vertex_disposed(&self, vertex: &str) {
        if let Err(e) = self.worker.meta.endpoints.delete_all_for_vertex(vertex).await {
            log::error!("endpoint rows delete failed: vertex={}, err={}", vertex, e);
        }

        if let Err(e) = self
            .worker
            .meta
            .vertices
            .delete_vertex(&self.worker.config.instance, vertex)
            .await
        {
            log::error!("vertex row delete failed: vertex={}, err={}", vertex, e);
        }
    }
}
