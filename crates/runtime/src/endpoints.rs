use std::sync::Arc;

use ahash::{HashMap, HashMapExt};
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::{net::TcpStream, task::JoinHandle};

use super::{Error, RuntimeObserver};

/// An input endpoint consumes bytes from an established stream until
/// closure; EOF is normal termination. Sync endpoints may block and run on
/// a dedicated blocking thread.
pub trait InputEndpoint: Send + Sync {
    fn run(&self, stream: std::net::TcpStream);
}

/// An output endpoint produces bytes onto an established stream.
pub trait OutputEndpoint: Send + Sync {
    fn run(&self, stream: std::net::TcpStream);
}

/// Async endpoints yield cooperatively between reads and writes.
#[async_trait]
pub trait AsyncInputEndpoint: Send + Sync {
    async fn run(&self, stream: TcpStream);
}

#[async_trait]
pub trait AsyncOutputEndpoint: Send + Sync {
    async fn run(&self, stream: TcpStream);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Input,
    Output,
    AsyncInput,
    AsyncOutput,
}

impl EndpointKind {
    pub fn is_input(self) -> bool {
        matches!(self, Self::Input | Self::AsyncInput)
    }

    pub fn is_async(self) -> bool {
        matches!(self, Self::AsyncInput | Self::AsyncOutput)
    }
}

/// A resolved input endpoint, either flavor, ready for stream handoff.
#[derive(Clone)]
pub enum AnyInput {
    Sync(Arc<dyn InputEndpoint>),
    Async(Arc<dyn AsyncInputEndpoint>),
}

#[derive(Clone)]
pub enum AnyOutput {
    Sync(Arc<dyn OutputEndpoint>),
    Async(Arc<dyn AsyncOutputEndpoint>),
}

impl AnyInput {
    /// Hand the stream to the endpoint on its own task; sync endpoints get
    /// a blocking thread and a blocking socket.
    pub fn spawn(self, stream: TcpStream) -> JoinHandle<()> {
        match self {
            Self::Async(endpoint) => tokio::spawn(async move { endpoint.run(stream).await }),
            Self::Sync(endpoint) => spawn_sync(stream, move |stream| endpoint.run(stream)),
        }
    }
}

impl AnyOutput {
    pub fn spawn(self, stream: TcpStream) -> JoinHandle<()> {
        match self {
            Self::Async(endpoint) => tokio::spawn(async move { endpoint.run(stream).await }),
            Self::Sync(endpoint) => spawn_sync(stream, move |stream| endpoint.run(stream)),
        }
    }
}

fn spawn_sync(
    stream: TcpStream,
    run: impl FnOnce(std::net::TcpStream) + Send + 'static,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(err) => {
                log::error!("endpoint stream detach failed: err={}", err);
                return;
            }
        };

        if let Err(err) = stream.set_nonblocking(false) {
            log::error!("endpoint stream mode change failed: err={}", err);
            return;
        }

        run(stream)
    })
}

/// The four per-vertex endpoint maps, keyed by endpoint name.
///
/// A name is unique across all four maps because the persisted key is
/// `(vertex, endpoint)` regardless of flavor.
#[derive(Default)]
pub struct EndpointTable {
    input: RwLock<HashMap<String, Arc<dyn InputEndpoint>>>,
    output: RwLock<HashMap<String, Arc<dyn OutputEndpoint>>>,
    async_input: RwLock<HashMap<String, Arc<dyn AsyncInputEndpoint>>>,
    async_output: RwLock<HashMap<String, Arc<dyn AsyncOutputEndpoint>>>,
}

impl EndpointTable {
    pub fn contains(&self, name: &str) -> bool {
        self.input.read().contains_key(name)
            || self.output.read().contains_key(name)
            || self.async_input.read().contains_key(name)
            || self.async_output.read().contains_key(name)
    }

    /// Resolve an input endpoint by name, async flavor first.
    pub fn find_input(&self, name: &str) -> Option<AnyInput> {
        if let Some(endpoint) = self.async_input.read().get(name) {
            return Some(AnyInput::Async(endpoint.clone()));
        }

        self.input
            .read()
            .get(name)
            .map(|endpoint| AnyInput::Sync(endpoint.clone()))
    }

    pub fn find_output(&self, name: &str) -> Option<AnyOutput> {
        if let Some(endpoint) = self.async_output.read().get(name) {
            return Some(AnyOutput::Async(endpoint.clone()));
        }

        self.output
            .read()
            .get(name)
            .map(|endpoint| AnyOutput::Sync(endpoint.clone()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        names.extend(self.input.read().keys().cloned());
        names.extend(self.output.read().keys().cloned());
        names.extend(self.async_input.read().keys().cloned());
        names.extend(self.async_output.read().keys().cloned());
        names
    }
}

/// Capability handed to [`crate::Vertex::initialize`]; stores the endpoint
/// locally and fires the host callback that persists the endpoint row.
pub struct EndpointRegistrar {
    vertex: String,
    table: Arc<EndpointTable>,
    observer: Arc<dyn RuntimeObserver>,
}

impl EndpointRegistrar {
    pub fn new(
        vertex: impl Into<String>,
        table: Arc<EndpointTable>,
        observer: Arc<dyn RuntimeObserver>,
    ) -> Self {
        Self {
            vertex: vertex.into(),
            table,
            observer,
        }
    }

    pub fn vertex(&self) -> &str {
        &self.vertex
    }

    pub async fn add_input(
        &self,
        name: &str,
        endpoint: Arc<dyn InputEndpoint>,
    ) -> Result<(), Error> {
        self.claim(name, EndpointKind::Input).await?;
        self.table.input.write().insert(name.to_string(), endpoint);
        Ok(())
    }

    pub async fn add_output(
        &self,
        name: &str,
        endpoint: Arc<dyn OutputEndpoint>,
    ) -> Result<(), Error> {
        self.claim(name, EndpointKind::Output).await?;
        self.table.output.write().insert(name.to_string(), endpoint);
        Ok(())
    }

    pub async fn add_async_input(
        &self,
        name: &str,
        endpoint: Arc<dyn AsyncInputEndpoint>,
    ) -> Result<(), Error> {
        self.claim(name, EndpointKind::AsyncInput).await?;
        self.table
            .async_input
            .write()
            .insert(name.to_string(), endpoint);
        Ok(())
    }

    pub async fn add_async_output(
        &self,
        name: &str,
        endpoint: Arc<dyn AsyncOutputEndpoint>,
    ) -> Result<(), Error> {
        self.claim(name, EndpointKind::AsyncOutput).await?;
        self.table
            .async_output
            .write()
            .insert(name.to_string(), endpoint);
        Ok(())
    }

    /// Reject duplicate names, then let the host persist the row before the
    /// endpoint becomes visible locally.
    async fn claim(&self, name: &str, kind: EndpointKind) -> Result<(), Error> {
        if self.table.contains(name) {
            return Err(Error::EndpointExists(name.to_string()));
        }

        self.observer
            .on_endpoint_added(&self.vertex, name, kind)
            .await
    }
}
