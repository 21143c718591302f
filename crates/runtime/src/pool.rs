use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;

use super::Error;

/// Idle outbound streams kept per `(address, port)` target.
pub const DEFAULT_POOL_CAPACITY: usize = 8;

/// Process-wide cache of idle outbound TCP streams.
///
/// Streams are reused LIFO so the warmest socket goes out first. A caller
/// that observes an IO error on a pooled stream must drop it instead of
/// releasing it; only streams with no observed error come back.
pub struct StreamPool {
    capacity: usize,
    buckets: Mutex<HashMap<(String, u16), Vec<TcpStream>>>,
}

impl Default for StreamPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl StreamPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Pop an idle stream for the target, if any.
    pub fn try_get(&self, address: &str, port: u16) -> Option<TcpStream> {
        self.buckets
            .lock()
            .get_mut(&(address.to_string(), port))?
            .pop()
    }

    /// Return a healthy stream to the pool; dropped (closed) when the
    /// bucket is full.
    pub fn release(&self, address: &str, port: u16, stream: TcpStream) {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry((address.to_string(), port)).or_default();
        if bucket.len() < self.capacity {
            bucket.push(stream);
        }
    }

    /// A stream to the target: pooled if available, freshly dialed
    /// otherwise. Fresh streams disable Nagle, connection setup must not
    /// sit behind batching.
    pub async fn connect(&self, address: &str, port: u16) -> Result<TcpStream, Error> {
        if let Some(stream) = self.try_get(address, port) {
            return Ok(stream);
        }

        let stream = TcpStream::connect((address, port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
