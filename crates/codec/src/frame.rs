use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Error;

/// Longest accepted byte-array payload: four varint bytes of seven payload
/// bits each. Longer length prefixes are rejected as invalid input.
pub const MAX_BYTES_LEN: usize = (1 << 28) - 1;

/// Append a 32-bit little-endian integer.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
///
/// let mut buf = BytesMut::new();
/// cra_codec::frame::put_i32(&mut buf, -2);
///
/// assert_eq!(&buf[..], &[0xfe, 0xff, 0xff, 0xff]);
/// ```
pub fn put_i32(buf: &mut BytesMut, value: i32) {
    buf.put_i32_le(value);
}

/// Append a 7-bit-encoded varint: seven payload bits per byte, low group
/// first, continuation bit high on every byte but the last.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
///
/// let mut buf = BytesMut::new();
/// cra_codec::frame::put_uvarint(&mut buf, 300);
///
/// assert_eq!(&buf[..], &[0xac, 0x02]);
/// ```
pub fn put_uvarint(buf: &mut BytesMut, mut value: u32) {
    loop {
        let group = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(group);
            return;
        }
        buf.put_u8(group | 0x80);
    }
}

/// Append a length-prefixed byte array. An empty array is the single byte
/// zero.
pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    debug_assert!(bytes.len() <= MAX_BYTES_LEN);

    put_uvarint(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

/// Append a length-prefixed UTF-8 string.
pub fn put_str(buf: &mut BytesMut, value: &str) {
    put_bytes(buf, value.as_bytes());
}

/// Read a 32-bit little-endian integer.
pub async fn read_i32<R: AsyncRead + Unpin>(reader: &mut R) -> Result<i32, Error> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes).await?;
    Ok(i32::from_le_bytes(bytes))
}

/// Read a 7-bit-encoded varint of at most four bytes.
pub async fn read_uvarint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32, Error> {
    let mut value = 0u32;
    let mut shift = 0;

    loop {
        let byte = reader.read_u8().await?;
        value |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }

        shift += 7;
        if shift >= 28 {
            return Err(Error::InvalidInput);
        }
    }
}

/// Read a length-prefixed byte array.
pub async fn read_bytes<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, Error> {
    let size = read_uvarint(reader).await? as usize;
    if size > MAX_BYTES_LEN {
        return Err(Error::InvalidInput);
    }

    let mut bytes = vec![0u8; size];
    reader.read_exact(&mut bytes).await?;
    Ok(bytes)
}

/// Read a length-prefixed UTF-8 string.
pub async fn read_string<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, Error> {
    let bytes = read_bytes(reader).await?;
    std::str::from_utf8(&bytes)?;

    // Checked above, the copy is already owned.
    Ok(unsafe { String::from_utf8_unchecked(bytes) })
}

/// Write a 32-bit little-endian integer and flush.
pub async fn write_i32<W: AsyncWrite + Unpin>(writer: &mut W, value: i32) -> Result<(), Error> {
    writer.write_all(&value.to_le_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a length-prefixed byte array and flush.
pub async fn write_bytes<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<(), Error> {
    let mut buf = BytesMut::with_capacity(bytes.len() + 5);
    put_bytes(&mut buf, bytes);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
