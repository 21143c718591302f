use crate::{handler, server::Worker};

use std::{collections::HashSet, sync::Arc, time::Duration};

use codec::message::ConnectRequest;
use parking_lot::Mutex;
use tokio::time::sleep;

const RETRY_BASE: Duration = Duration::from_secs(2);
const RETRY_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    from_vertex: String,
    from_endpoint: String,
    to_vertex: String,
    to_endpoint: String,
    reverse: bool,
}

/// Connection intents waiting to be re-applied.
///
/// Each enqueued 4-tuple gets its own backoff task (2s, 4s, 8s, capped at
/// 60s); duplicate enqueues collapse onto the running task. An attempt
/// whose local vertex has disappeared stops retrying, the persisted row
/// stays for whoever hosts the vertex next.
#[derive(Default)]
pub struct PendingConnections {
    active: Mutex<HashSet<PendingKey>>,
}

impl PendingConnections {
    pub fn enqueue(&self, worker: &Arc<Worker>, request: ConnectRequest, reverse: bool) {
        let key = PendingKey {
            from_vertex: request.from_vertex.clone(),
            from_endpoint: request.from_endpoint.clone(),
            to_vertex: request.to_vertex.clone(),
            to_endpoint: request.to_endpoint.clone(),
            reverse,
        };

        if !self.active.lock().insert(key.clone()) {
            return;
        }

        let worker = worker.clone();
        tokio::spawn(async move {
            let mut delay = RETRY_BASE;

            loop {
                sleep(delay).await;

                match handler::try_establish(&worker, &request, reverse).await {
                    Ok(()) => break,
                    Err(code) => {
                        let local = if reverse {
                            &request.to_vertex
                        } else {
                            &request.from_vertex
                        };

                        if worker.live_vertex(local).is_none() {
                            log::debug!(
                                "connection retry abandoned, vertex gone: vertex={}",
                                local
                            );
                            break;
                        }

                        log::debug!(
                            "connection retry pending: from={}/{}, to={}/{}, code={:?}",
                            request.from_vertex,
                            request.from_endpoint,
                            request.to_vertex,
                            request.to_endpoint,
                            code,
                        );
                    }
                }

                delay = (delay * 2).min(RETRY_CAP);
            }

            worker.pending.active.lock().remove(&key);
        });
    }
}
