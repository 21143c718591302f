use std::sync::Arc;

use codec::{ControlTag, ErrorCode, message::ConnectRequest};
use parking_lot::Mutex;
use runtime::dial;
use store::{
    Error,
    connections::ConnectionRow,
    endpoints::Direction,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use super::CraClient;

/// A data stream owned by a detached vertex.
///
/// Cloneable so the vertex can keep closing rights while the caller reads
/// and writes; all IO goes through one async lock.
#[derive(Clone)]
pub struct SharedStream(Arc<tokio::sync::Mutex<TcpStream>>);

impl SharedStream {
    fn new(stream: TcpStream) -> Self {
        Self(Arc::new(tokio::sync::Mutex::new(stream)))
    }

    pub async fn write_all(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut stream = self.0.lock().await;
        stream.write_all(bytes).await?;
        stream.flush().await
    }

    pub async fn read_exact(&self, buf: &mut [u8]) -> std::io::Result<()> {
        self.0.lock().await.read_exact(buf).await.map(|_| ())
    }

    /// Half-close the stream; the peer observes EOF, which endpoints treat
    /// as normal termination.
    pub async fn shutdown(&self) -> std::io::Result<()> {
        self.0.lock().await.shutdown().await
    }
}

/// A vertex living in the client process instead of a worker.
///
/// It participates in the same naming and connection fabric, but it only
/// ever dials: every stream is opened towards a worker with `kill_remote`
/// set, so the worker closes the stream if its endpoint goes away and this
/// side never has to accept an inbound dial.
pub struct DetachedVertex {
    client: CraClient,
    vertex: String,
    instance: String,
    ephemeral: bool,
    inputs: Mutex<Vec<SharedStream>>,
    outputs: Mutex<Vec<SharedStream>>,
}

impl DetachedVertex {
    pub(crate) async fn register(
        client: CraClient,
        vertex: &str,
        instance: &str,
        ephemeral: bool,
    ) -> Result<Self, Error> {
        if ephemeral {
            // Address-less: nothing must ever try to dial this instance.
            client
                .metadata()
                .vertices
                .register_instance(instance, "", 0)
                .await?;
        }

        client
            .metadata()
            .vertices
            .register_vertex(instance, vertex, "", &[])
            .await?;

        log::info!(
            "detached vertex registered: vertex={}, instance={}, ephemeral={}",
            vertex,
            instance,
            ephemeral
        );

        Ok(Self {
            client,
            vertex: vertex.to_string(),
            instance: instance.to_string(),
            ephemeral,
            inputs: Mutex::new(Vec::new()),
            outputs: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.vertex
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub async fn add_input(&self, endpoint: &str, is_async: bool) -> Result<(), Error> {
        self.client
            .metadata()
            .endpoints
            .add_endpoint(&self.vertex, endpoint, Direction::Input, is_async)
            .await
    }

    pub async fn add_output(&self, endpoint: &str, is_async: bool) -> Result<(), Error> {
        self.client
            .metadata()
            .endpoints
            .add_endpoint(&self.vertex, endpoint, Direction::Output, is_async)
            .await
    }

    /// Connect our output endpoint to a remote input and return the data
    /// stream to write into. The connection row lands first.
    pub async fn open_output_stream(
        &self,
        from_endpoint: &str,
        to_vertex: &str,
        to_endpoint: &str,
    ) -> Result<SharedStream, ErrorCode> {
        let row = ConnectionRow::new(&self.vertex, from_endpoint, to_vertex, to_endpoint);
        self.client
            .metadata()
            .connections
            .add_connection(&row)
            .await
            .map_err(|_| ErrorCode::ServerFailed)?;

        self.establish_output(&row).await
    }

    /// Connect a remote output endpoint to our input and return the data
    /// stream to read from. Dials the remote side with the reverse
    /// receiver, since this vertex cannot be dialed.
    pub async fn open_input_stream(
        &self,
        from_vertex: &str,
        from_endpoint: &str,
        to_endpoint: &str,
    ) -> Result<SharedStream, ErrorCode> {
        let row = ConnectionRow::new(from_vertex, from_endpoint, &self.vertex, to_endpoint);
        self.client
            .metadata()
            .connections
            .add_connection(&row)
            .await
            .map_err(|_| ErrorCode::ServerFailed)?;

        self.establish_input(&row).await
    }

    /// Re-read this vertex's endpoints and connections from metadata and
    /// redial all of them: outbound rows into the output set, inbound rows
    /// into the input set. Returns the first failure, having attempted
    /// everything.
    pub async fn restore(&self) -> ErrorCode {
        let endpoints = match self
            .client
            .metadata()
            .endpoints
            .all_endpoints_of(&self.vertex)
            .await
        {
            Ok(endpoints) => endpoints,
            Err(_) => return ErrorCode::ServerFailed,
        };

        log::info!(
            "detached vertex restoring: vertex={}, endpoints={}",
            self.vertex,
            endpoints.len()
        );

        let mut aggregate = ErrorCode::Success;

        match self
            .client
            .metadata()
            .connections
            .connections_from(&self.vertex)
            .await
        {
            Ok(rows) => {
                for row in rows {
                    if let Err(code) = self.establish_output(&row).await {
                        log::warn!(
                            "outbound restore failed: from={}/{}, code={:?}",
                            row.from_vertex,
                            row.from_endpoint,
                            code
                        );
                        if aggregate.is_success() {
                            aggregate = code;
                        }
                    }
                }
            }
            Err(_) => return ErrorCode::ServerFailed,
        }

        match self
            .client
            .metadata()
            .connections
            .connections_to(&self.vertex)
            .await
        {
            Ok(rows) => {
                for row in rows {
                    if let Err(code) = self.establish_input(&row).await {
                        log::warn!(
                            "inbound restore failed: from={}/{}, code={:?}",
                            row.from_vertex,
                            row.from_endpoint,
                            code
                        );
                        if aggregate.is_success() {
                            aggregate = code;
                        }
                    }
                }
            }
            Err(_) => return ErrorCode::ServerFailed,
        }

        aggregate
    }

    /// Tear the vertex out of the fabric: close every stream, then delete
    /// connection rows, endpoint rows, the vertex row, and the ephemeral
    /// instance. Infallible; failures are logged and suppressed.
    pub async fn dispose(self) {
        let outputs: Vec<SharedStream> = self.outputs.lock().drain(..).collect();
        let inputs: Vec<SharedStream> = self.inputs.lock().drain(..).collect();
        for stream in outputs.into_iter().chain(inputs) {
            if let Err(e) = stream.shutdown().await {
                log::debug!("detached stream close failed: err={}", e);
            }
        }

        let meta = self.client.metadata();
        if let Err(e) = meta.connections.delete_all_for_vertex(&self.vertex).await {
            log::error!("connection rows delete failed: vertex={}, err={}", self.vertex, e);
        }

        if let Err(e) = meta.endpoints.delete_all_for_vertex(&self.vertex).await {
            log::error!("endpoint rows delete failed: vertex={}, err={}", self.vertex, e);
        }

        if let Err(e) = meta.vertices.delete_vertex(&self.instance, &self.vertex).await {
            log::error!("vertex row delete failed: vertex={}, err={}", self.vertex, e);
        }

        if self.ephemeral {
            if let Err(e) = meta.vertices.delete_instance(&self.instance).await {
                log::error!(
                    "ephemeral instance delete failed: instance={}, err={}",
                    self.instance,
                    e
                );
            }
        }

        log::info!("detached vertex disposed: vertex={}", self.vertex);
    }

    async fn establish_output(&self, row: &ConnectionRow) -> Result<SharedStream, ErrorCode> {
        let target = self.client.active_instance_of(&row.to_vertex).await?;

        let request = ConnectRequest::new(
            row.from_vertex.as_str(),
            row.from_endpoint.as_str(),
            row.to_vertex.as_str(),
            row.to_endpoint.as_str(),
        )
        .kill_remote();

        let stream = dial::dial_receiver(
            self.client.pool(),
            &target.address,
            target.port,
            ControlTag::ConnectVertexReceiver,
            &request,
        )
        .await
        .map_err(|e| e.as_error_code())?;

        let shared = SharedStream::new(stream);
        self.outputs.lock().push(shared.clone());
        Ok(shared)
    }

    async fn establish_input(&self, row: &ConnectionRow) -> Result<SharedStream, ErrorCode> {
        let target = self.client.active_instance_of(&row.from_vertex).await?;

        let request = ConnectRequest::new(
            row.from_vertex.as_str(),
            row.from_endpoint.as_str(),
            row.to_vertex.as_str(),
            row.to_endpoint.as_str(),
        )
        .kill_remote();

        let stream = dial::dial_receiver(
            self.client.pool(),
            &target.address,
            target.port,
            ControlTag::ConnectVertexReceiverReverse,
            &request,
        )
        .await
        .map_err(|e| e.as_error_code())?;

        let shared = SharedStream::new(stream);
        self.inputs.lock().push(shared.clone());
        Ok(shared)
    }
}
