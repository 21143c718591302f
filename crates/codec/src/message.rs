use bytes::BytesMut;
use tokio::io::AsyncRead;

use super::{ControlTag, Error, frame};

/// LOAD_VERTEX request: materialize a vertex on the receiving worker.
///
/// `params` is the opaque constructor parameter blob; the runtime does not
/// interpret it beyond handing it to the vertex factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadVertexRequest {
    pub vertex: String,
    pub definition: String,
    pub params: Vec<u8>,
}

impl LoadVertexRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        frame::put_i32(buf, ControlTag::LoadVertex.into());
        frame::put_str(buf, &self.vertex);
        frame::put_str(buf, &self.definition);
        frame::put_bytes(buf, &self.params);
    }

    /// Parse the arguments after the dispatcher has consumed the tag.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, Error> {
        Ok(Self {
            vertex: frame::read_string(reader).await?,
            definition: frame::read_string(reader).await?,
            params: frame::read_bytes(reader).await?,
        })
    }
}

/// Connection 4-tuple carried by all four connect messages.
///
/// `kill_remote` is only on the wire for receiver variants: it marks a
/// stream whose dialing side cannot accept a redial, so the receiving
/// worker closes the stream as soon as the local endpoint goes away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub from_vertex: String,
    pub from_endpoint: String,
    pub to_vertex: String,
    pub to_endpoint: String,
    pub kill_remote: bool,
}

impl ConnectRequest {
    pub fn new(
        from_vertex: impl Into<String>,
        from_endpoint: impl Into<String>,
        to_vertex: impl Into<String>,
        to_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            from_vertex: from_vertex.into(),
            from_endpoint: from_endpoint.into(),
            to_vertex: to_vertex.into(),
            to_endpoint: to_endpoint.into(),
            kill_remote: false,
        }
    }

    pub fn kill_remote(mut self) -> Self {
        self.kill_remote = true;
        self
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use cra_codec::{ControlTag, message::ConnectRequest};
    ///
    /// let mut buf = BytesMut::new();
    /// ConnectRequest::new("a", "out", "b", "in").encode(ControlTag::ConnectVertexInitiator, &mut buf);
    ///
    /// assert_eq!(&buf[..4], &[0x01, 0x00, 0x00, 0x00]);
    /// assert_eq!(&buf[4..6], &[0x01, b'a']);
    /// ```
    pub fn encode(&self, tag: ControlTag, buf: &mut BytesMut) {
        frame::put_i32(buf, tag.into());
        frame::put_str(buf, &self.from_vertex);
        frame::put_str(buf, &self.from_endpoint);
        frame::put_str(buf, &self.to_vertex);
        frame::put_str(buf, &self.to_endpoint);
        if tag.is_receiver() {
            frame::put_i32(buf, self.kill_remote as i32);
        }
    }

    /// Parse the arguments after the dispatcher has consumed `tag`.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R, tag: ControlTag) -> Result<Self, Error> {
        let from_vertex = frame::read_string(reader).await?;
        let from_endpoint = frame::read_string(reader).await?;
        let to_vertex = frame::read_string(reader).await?;
        let to_endpoint = frame::read_string(reader).await?;
        let kill_remote = if tag.is_receiver() {
            frame::read_i32(reader).await? != 0
        } else {
            false
        };

        Ok(Self {
            from_vertex,
            from_endpoint,
            to_vertex,
            to_endpoint,
            kill_remote,
        })
    }
}
