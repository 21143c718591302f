use crate::server::Worker;

use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpStream;

use codec::{
    ControlTag, ErrorCode, frame,
    message::{ConnectRequest, LoadVertexRequest},
};
use runtime::{
    dial,
    endpoints::{AnyInput, AnyOutput},
};

/// Drive one accepted control socket: read a tag, dispatch, reply, repeat.
///
/// Control streams carry any number of requests (clients pool them); the
/// loop ends on peer close, on a protocol error, or when a successful
/// receiver handshake turns the socket into a data stream.
pub async fn serve_socket(worker: Arc<Worker>, mut stream: TcpStream, addr: SocketAddr) {
    loop {
        let tag = match frame::read_i32(&mut stream).await {
            Ok(value) => value,
            // Peer close between requests is the normal end of a control
            // stream.
            Err(_) => break,
        };

        let tag = match ControlTag::from_wire(tag) {
            Ok(tag) => tag,
            Err(e) => {
                log::warn!("unknown control tag: addr={}, err={}", addr, e);
                let _ = frame::write_i32(&mut stream, ErrorCode::ServerFailed.into()).await;
                break;
            }
        };

        let result = match tag {
            ControlTag::LoadVertex => {
                let request = match LoadVertexRequest::read(&mut stream).await {
                    Ok(request) => request,
                    Err(e) => {
                        log::warn!("malformed load request: addr={}, err={}", addr, e);
                        break;
                    }
                };

                let code = handle_load_vertex(&worker, request).await;
                frame::write_i32(&mut stream, code.into()).await
            }
            ControlTag::ConnectVertexInitiator | ControlTag::ConnectVertexInitiatorReverse => {
                let request = match ConnectRequest::read(&mut stream, tag).await {
                    Ok(request) => request,
                    Err(e) => {
                        log::warn!("malformed connect request: addr={}, err={}", addr, e);
                        break;
                    }
                };

                let code = handle_initiator(&worker, request, tag.is_reverse()).await;
                frame::write_i32(&mut stream, code.into()).await
            }
            ControlTag::ConnectVertexReceiver | ControlTag::ConnectVertexReceiverReverse => {
                let request = match ConnectRequest::read(&mut stream, tag).await {
                    Ok(request) => request,
                    Err(e) => {
                        log::warn!("malformed receiver request: addr={}, err={}", addr, e);
                        break;
                    }
                };

                handle_receiver(&worker, request, tag.is_reverse(), stream).await;
                // The socket was either handed to an endpoint or closed on
                // refusal; it is no longer ours to read.
                return;
            }
        };

        if let Err(e) = result {
            log::debug!("control reply failed: addr={}, err={}", addr, e);
            break;
        }
    }
}

/// LOAD_VERTEX: materialize the named vertex from its definition.
async fn handle_load_vertex(worker: &Arc<Worker>, request: LoadVertexRequest) -> ErrorCode {
    match worker
        .materialize_vertex(&request.vertex, &request.definition, &request.params)
        .await
    {
        Ok(()) => {
            // A freshly loaded source vertex may have dormant connections
            // waiting for it.
            worker.enqueue_connections_from(&request.vertex).await;
            ErrorCode::Success
        }
        Err(e) => {
            log::error!(
                "vertex load failed: vertex={}, definition={}, err={}",
                request.vertex,
                request.definition,
                e
            );
            e.as_error_code()
        }
    }
}

/// CONNECT_VERTEX_INITIATOR(_REVERSE): this worker hosts the endpoint that
/// keeps the stream; it dials the peer worker's receiver side.
async fn handle_initiator(worker: &Arc<Worker>, request: ConnectRequest, reverse: bool) -> ErrorCode {
    match try_establish(worker, &request, reverse).await {
        Ok(()) => ErrorCode::Success,
        Err(code) => {
            log::warn!(
                "connection establish failed: from={}/{}, to={}/{}, reverse={}, code={:?}",
                request.from_vertex,
                request.from_endpoint,
                request.to_vertex,
                request.to_endpoint,
                reverse,
                code,
            );

            // The metadata row is authoritative; keep trying in the
            // background.
            worker.pending.enqueue(worker, request, reverse);
            code
        }
    }
}

/// One establishment attempt, local endpoint first so a refused dial never
/// strands a remote stream.
pub async fn try_establish(
    worker: &Arc<Worker>,
    request: &ConnectRequest,
    reverse: bool,
) -> Result<(), ErrorCode> {
    let (local_vertex, remote_vertex) = if reverse {
        (&request.to_vertex, &request.from_vertex)
    } else {
        (&request.from_vertex, &request.to_vertex)
    };

    let live = worker
        .live_vertex(local_vertex)
        .ok_or(ErrorCode::VertexNotFound)?;

    // Resolve the peer's live address from metadata; lookup failure is
    // transient (the row outlives its endpoints by design).
    let row = worker
        .meta
        .vertices
        .row_for_active_vertex(remote_vertex)
        .await
        .map_err(|_| ErrorCode::VertexNotFound)?;
    let instance = worker
        .meta
        .vertices
        .instance_for_name(&row.instance)
        .await
        .map_err(|_| ErrorCode::VertexNotFound)?;

    if reverse {
        let endpoint = live
            .endpoints
            .find_input(&request.to_endpoint)
            .ok_or(ErrorCode::EndpointNotFound)?;

        let stream = dial::dial_receiver(
            &worker.pool,
            &instance.address,
            instance.port,
            ControlTag::ConnectVertexReceiverReverse,
            request,
        )
        .await
        .map_err(|e| e.as_error_code())?;

        live.track_stream(endpoint.spawn(stream));
    } else {
        let endpoint = live
            .endpoints
            .find_output(&request.from_endpoint)
            .ok_or(ErrorCode::EndpointNotFound)?;

        let stream = dial::dial_receiver(
            &worker.pool,
            &instance.address,
            instance.port,
            ControlTag::ConnectVertexReceiver,
            request,
        )
        .await
        .map_err(|e| e.as_error_code())?;

        live.track_stream(endpoint.spawn(stream));
    }

    log::info!(
        "connection established: from={}/{}, to={}/{}, reverse={}",
        request.from_vertex,
        request.from_endpoint,
        request.to_vertex,
        request.to_endpoint,
        reverse,
    );

    Ok(())
}

/// CONNECT_VERTEX_RECEIVER(_REVERSE): resolve the local endpoint, reply,
/// and on success detach the socket from the dispatch loop and hand it
/// over.
async fn handle_receiver(
    worker: &Arc<Worker>,
    request: ConnectRequest,
    reverse: bool,
    mut stream: TcpStream,
) {
    enum Target {
        Input(AnyInput),
        Output(AnyOutput),
    }

    // The plain receiver consumes into the destination's input; the
    // reverse receiver is the dialed-to source producing onto the stream.
    let resolved = if reverse {
        worker.live_vertex(&request.from_vertex).map_or(
            Err(ErrorCode::VertexNotFound),
            |live| {
                live.endpoints
                    .find_output(&request.from_endpoint)
                    .map(|endpoint| (live, Target::Output(endpoint)))
                    .ok_or(ErrorCode::EndpointNotFound)
            },
        )
    } else {
        worker.live_vertex(&request.to_vertex).map_or(
            Err(ErrorCode::VertexNotFound),
            |live| {
                live.endpoints
                    .find_input(&request.to_endpoint)
                    .map(|endpoint| (live, Target::Input(endpoint)))
                    .ok_or(ErrorCode::EndpointNotFound)
            },
        )
    };

    match resolved {
        Ok((live, target)) => {
            if let Err(e) = frame::write_i32(&mut stream, ErrorCode::Success.into()).await {
                log::debug!("receiver reply failed: err={}", e);
                return;
            }

            // With kill_remote the dialer cannot accept a redial, so the
            // stream's lifetime is tied to the local vertex either way:
            // tracked tasks are aborted on dispose and the peer sees EOF.
            let handle = match target {
                Target::Input(endpoint) => endpoint.spawn(stream),
                Target::Output(endpoint) => endpoint.spawn(stream),
            };
            live.track_stream(handle);

            log::info!(
                "stream accepted: from={}/{}, to={}/{}, reverse={}, kill_remote={}",
                request.from_vertex,
                request.from_endpoint,
                request.to_vertex,
                request.to_endpoint,
                reverse,
                request.kill_remote,
            );
        }
        Err(code) => {
            let _ = frame::write_i32(&mut stream, code.into()).await;
        }
    }
}
