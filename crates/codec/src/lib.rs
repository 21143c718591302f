//! ## Control-plane wire codec
//!
//! Every control exchange between clients and workers is a sequence of
//! length-delimited frames on a plain TCP stream: 32-bit little-endian
//! integers and byte arrays carrying a 7-bit-encoded varint length prefix.
//! String arguments ride the byte-array codec as UTF-8.
//!
//! A request starts with an i32 message tag followed by its arguments, and
//! every reply starts with an i32 [`ErrorCode`]. After a successful receiver
//! reply the same socket becomes the data stream and no further frames are
//! read on it. There are no checksums and no version negotiation; streams
//! are point-to-point and trusted once established.

pub mod frame;
pub mod message;

use std::str::Utf8Error;

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    UnexpectedEof,
    UnknownTag(i32),
    UnknownErrorCode(i32),
    Utf8Error(Utf8Error),
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::UnexpectedEof
        } else {
            Self::Io(value)
        }
    }
}

/// Result code carried by every control reply.
///
/// The numeric values are part of the wire contract and must not be
/// renumbered; `Success` is always zero.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum ErrorCode {
    Success = 0,
    VertexNotFound = 1,
    EndpointNotFound = 2,
    VerticesEndpointsNotMatched = 3,
    ConnectionEstablishFailed = 4,
    VertexNotDefined = 5,
    InitializationFailed = 6,
    ServerFailed = 7,
}

impl ErrorCode {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Decode a reply code, rejecting values outside the known set.
    pub fn from_wire(value: i32) -> Result<Self, Error> {
        Self::try_from(value).map_err(|_| Error::UnknownErrorCode(value))
    }
}

/// Message tag opening every control request.
///
/// Fixed values; the receiver variants carry a trailing `kill_remote` i32
/// after the connection 4-tuple.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum ControlTag {
    LoadVertex = 0,
    ConnectVertexInitiator = 1,
    ConnectVertexInitiatorReverse = 2,
    ConnectVertexReceiver = 3,
    ConnectVertexReceiverReverse = 4,
}

impl ControlTag {
    pub fn from_wire(value: i32) -> Result<Self, Error> {
        Self::try_from(value).map_err(|_| Error::UnknownTag(value))
    }

    /// Receiver-side messages hand the socket to an endpoint after the
    /// reply instead of closing the exchange.
    pub fn is_receiver(self) -> bool {
        matches!(
            self,
            Self::ConnectVertexReceiver | Self::ConnectVertexReceiverReverse
        )
    }

    /// Reverse variants dial against the data direction: bytes still flow
    /// from the output endpoint to the input endpoint, only the TCP dial is
    /// initiated by the destination side.
    pub fn is_reverse(self) -> bool {
        matches!(
            self,
            Self::ConnectVertexInitiatorReverse | Self::ConnectVertexReceiverReverse
        )
    }
}
