//! ## Vertex runtime
//!
//! The in-process half of the dataflow fabric: the vertex lifecycle
//! contract, the endpoint capability traits and their per-vertex table, the
//! process-wide factory registries, the outbound stream pool, and the
//! dial-side of the connection-establishment handshake.
//!
//! A vertex is created by a registered factory, initialized exactly once
//! (during which it registers its endpoints through the
//! [`endpoints::EndpointRegistrar`] capability), fed live streams as
//! connections are established, and disposed when unloaded. Everything a
//! vertex does to the persistent model goes through the [`RuntimeObserver`]
//! seam, so the same runtime serves workers and detached client vertices.

pub mod dial;
pub mod endpoints;
pub mod pool;
pub mod registry;

use async_trait::async_trait;
use codec::ErrorCode;

use self::endpoints::{EndpointKind, EndpointRegistrar};

#[derive(Debug)]
pub enum Error {
    EndpointExists(String),
    FactoryNotFound(String),
    InitializationFailed(String),
    /// The remote side replied with a non-success code.
    Remote(ErrorCode),
    Observer(String),
    Codec(codec::Error),
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        Self::Codec(value)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl Error {
    /// The wire code reported to a caller when this error ends a control
    /// exchange.
    pub fn as_error_code(&self) -> ErrorCode {
        match self {
            Self::Remote(code) => *code,
            Self::FactoryNotFound(_) => ErrorCode::VertexNotDefined,
            Self::InitializationFailed(_) | Self::EndpointExists(_) => {
                ErrorCode::InitializationFailed
            }
            Self::Codec(_) | Self::Io(_) => ErrorCode::ConnectionEstablishFailed,
            Self::Observer(_) => ErrorCode::ServerFailed,
        }
    }
}

/// The lifecycle contract of a user computation object.
///
/// `initialize` runs once, synchronously with loading, and is where the
/// vertex registers its endpoints. `dispose` releases resources; stream
/// teardown and metadata cleanup are the host's job, so the default is a
/// no-op.
#[async_trait]
pub trait Vertex: Send + Sync {
    async fn initialize(&self, registrar: &EndpointRegistrar, params: &[u8])
    -> Result<(), Error>;

    async fn dispose(&self) {}
}

/// Host callbacks fired by the runtime when a vertex mutates its own shape.
///
/// The worker's implementation persists endpoint rows on registration and
/// clears vertex state on dispose; detached vertices bring their own.
#[async_trait]
pub trait RuntimeObserver: Send + Sync {
    async fn on_endpoint_added(
        &self,
        vertex: &str,
        endpoint: &str,
        kind: EndpointKind,
    ) -> Result<(), Error>;

    async fn on_vertex_disposed(&self, vertex: &str);
}
