use bytes::BytesMut;
use codec::{
    ControlTag, ErrorCode, frame,
    message::{ConnectRequest, LoadVertexRequest},
};
use tokio::{io::AsyncWriteExt, net::TcpStream};

use super::{Error, pool::StreamPool};

/// Dial a worker and perform a receiver handshake; on success the returned
/// stream IS the data stream and must not be framed further.
///
/// Receiver streams are never released back to the pool: success hands the
/// socket over, failure means the socket state is unknown.
pub async fn dial_receiver(
    pool: &StreamPool,
    address: &str,
    port: u16,
    tag: ControlTag,
    request: &ConnectRequest,
) -> Result<TcpStream, Error> {
    debug_assert!(tag.is_receiver());

    let mut stream = pool.connect(address, port).await?;

    let mut buf = BytesMut::new();
    request.encode(tag, &mut buf);
    stream.write_all(&buf).await.map_err(codec::Error::from)?;
    stream.flush().await.map_err(codec::Error::from)?;

    let code = ErrorCode::from_wire(frame::read_i32(&mut stream).await?)?;
    if code.is_success() {
        Ok(stream)
    } else {
        Err(Error::Remote(code))
    }
}

/// Ask a worker to initiate a connection on our behalf. The control stream
/// is reusable afterwards and goes back to the pool.
pub async fn call_initiator(
    pool: &StreamPool,
    address: &str,
    port: u16,
    tag: ControlTag,
    request: &ConnectRequest,
) -> Result<ErrorCode, Error> {
    debug_assert!(!tag.is_receiver());

    let mut buf = BytesMut::new();
    request.encode(tag, &mut buf);
    call(pool, address, port, buf).await
}

/// Ask a worker to load a vertex. The control stream goes back to the pool.
pub async fn call_load_vertex(
    pool: &StreamPool,
    address: &str,
    port: u16,
    request: &LoadVertexRequest,
) -> Result<ErrorCode, Error> {
    let mut buf = BytesMut::new();
    request.encode(&mut buf);
    call(pool, address, port, buf).await
}

async fn call(
    pool: &StreamPool,
    address: &str,
    port: u16,
    buf: BytesMut,
) -> Result<ErrorCode, Error> {
    let mut stream = pool.connect(address, port).await?;

    stream.write_all(&buf).await.map_err(codec::Error::from)?;
    stream.flush().await.map_err(codec::Error::from)?;
    let code = ErrorCode::from_wire(frame::read_i32(&mut stream).await?)?;

    pool.release(address, port, stream);
    Ok(code)
}
