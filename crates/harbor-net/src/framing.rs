//! Wire framing for session streams.
//!
//! Normal sessions carry length-prefixed frames:
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   frame            |
//! | u32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length does **not** include the 4 prefix bytes. A zero-length frame is
//! valid. Inside a frame, packet-oriented services put a [`PacketHeader`]
//! followed by the payload:
//!
//! ```text
//! +------------------+------------------+-----------+
//! | opcode (u32 LE)  | status (i32 LE)  | payload   |
//! +------------------+------------------+-----------+
//! ```
//!
//! Raw sessions ([`FrameMode::Raw`]) skip both layers: whatever bytes arrive
//! are delivered as one chunk, and outgoing bytes are written unchanged.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of an encoded [`PacketHeader`] in bytes.
pub const PACKET_HEADER_SIZE: usize = 8;

/// How bytes on a session stream are delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    /// `u32` little-endian length prefix before every frame.
    LengthPrefixed,
    /// No delimiting; each read is one chunk.
    Raw,
}

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Delimiting mode.
    pub mode: FrameMode,
    /// Maximum allowed frame size in bytes. Default: 1 MB.
    pub max_payload_size: u32,
    /// Read buffer size used in [`FrameMode::Raw`]. Default: 4 KB.
    pub read_buffer_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            mode: FrameMode::LengthPrefixed,
            max_payload_size: 1_048_576,
            read_buffer_size: 4096,
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual size.
        size: usize,
        /// The configured maximum.
        max: u32,
    },

    /// A frame was too short to hold a packet header.
    #[error("frame of {len} bytes is shorter than the {PACKET_HEADER_SIZE}-byte packet header")]
    TruncatedHeader {
        /// Length of the offending frame.
        len: usize,
    },

    /// The connection was closed before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read the next frame from the stream according to `config.mode`.
///
/// In length-prefixed mode this blocks until the whole frame is available. In
/// raw mode it returns whatever a single read produced.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Bytes, FrameError> {
    match config.mode {
        FrameMode::LengthPrefixed => read_length_prefixed(reader, config).await,
        FrameMode::Raw => read_chunk(reader, config).await,
    }
}

async fn read_length_prefixed<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Bytes, FrameError> {
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut len_buf).await.map_err(eof_as_closed)?;

    let frame_len = u32::from_le_bytes(len_buf);
    if frame_len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: frame_len as usize,
            max: config.max_payload_size,
        });
    }

    let mut frame = BytesMut::zeroed(frame_len as usize);
    if frame_len > 0 {
        reader.read_exact(&mut frame).await.map_err(eof_as_closed)?;
    }
    Ok(frame.freeze())
}

async fn read_chunk<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::zeroed(config.read_buffer_size.max(1));
    let n = reader.read(&mut buf).await?;
    if n == 0 {
        return Err(FrameError::ConnectionClosed);
    }
    buf.truncate(n);
    Ok(buf.freeze())
}

fn eof_as_closed(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Validate an outgoing frame length against `max`.
///
/// Lengths that do not fit the `u32` prefix are rejected along with anything
/// above the configured maximum.
pub fn checked_frame_len(len: usize, max: u32) -> Result<u32, FrameError> {
    u32::try_from(len)
        .ok()
        .filter(|&len| len <= max)
        .ok_or(FrameError::PayloadTooLarge { size: len, max })
}

/// Write one frame to the stream according to `config.mode` and flush.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let len = checked_frame_len(frame.len(), config.max_payload_size)?;
    if config.mode == FrameMode::LengthPrefixed {
        writer.write_all(&len.to_le_bytes()).await?;
    }
    if !frame.is_empty() {
        writer.write_all(frame).await?;
    }
    writer.flush().await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Packet header
// ---------------------------------------------------------------------------

/// Opcode and status carried in front of every packet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Operation code used to route the packet.
    pub opcode: u32,
    /// Application-defined status.
    pub status: i32,
}

impl PacketHeader {
    /// Build a frame holding this header followed by `payload`.
    pub fn encode_with(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + payload.len());
        buf.put_u32_le(self.opcode);
        buf.put_i32_le(self.status);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Split a frame into its header and payload without copying the payload.
    pub fn decode(mut frame: Bytes) -> Result<(Self, Bytes), FrameError> {
        if frame.len() < PACKET_HEADER_SIZE {
            return Err(FrameError::TruncatedHeader { len: frame.len() });
        }
        let opcode = frame.get_u32_le();
        let status = frame.get_i32_le();
        Ok((Self { opcode, status }, frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn raw_config() -> FrameConfig {
        FrameConfig {
            mode: FrameMode::Raw,
            ..FrameConfig::default()
        }
    }

    #[tokio::test]
    async fn test_multiple_frames_in_sequence() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig::default();

        let frames: Vec<&[u8]> = vec![b"first", b"second", b"third"];
        for frame in &frames {
            write_frame(&mut client, frame, &config).await.unwrap();
        }

        for expected in &frames {
            let received = read_frame(&mut server, &config).await.unwrap();
            assert_eq!(&received[..], *expected);
        }
    }

    #[tokio::test]
    async fn test_partial_read_resumes_correctly() {
        let (mut client, mut server) = duplex(8);
        let config = FrameConfig::default();
        let payload = b"this frame is larger than the pipe buffer";

        let write_config = config.clone();
        let write_task = tokio::spawn(async move {
            write_frame(&mut client, payload, &write_config)
                .await
                .unwrap();
        });

        let received = read_frame(&mut server, &config).await.unwrap();
        write_task.await.unwrap();
        assert_eq!(&received[..], payload);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_read() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig {
            max_payload_size: 16,
            ..FrameConfig::default()
        };

        client.write_all(&1024u32.to_le_bytes()).await.unwrap();
        client.flush().await.unwrap();

        let result = read_frame(&mut server, &config).await;
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_write() {
        let (mut client, _server) = duplex(8192);
        let config = FrameConfig {
            max_payload_size: 16,
            ..FrameConfig::default()
        };

        let result = write_frame(&mut client, &[0u8; 1024], &config).await;
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_frame_len_beyond_prefix_range_rejected() {
        assert_eq!(checked_frame_len(16, 16).unwrap(), 16);
        assert!(matches!(
            checked_frame_len(17, 16),
            Err(FrameError::PayloadTooLarge { size: 17, max: 16 })
        ));

        // Would wrap to 0 if truncated to u32.
        #[cfg(target_pointer_width = "64")]
        {
            let wrapped = u32::MAX as usize + 1;
            assert!(matches!(
                checked_frame_len(wrapped, u32::MAX),
                Err(FrameError::PayloadTooLarge { size, .. }) if size == wrapped
            ));
        }
        assert!(checked_frame_len(usize::MAX, u32::MAX).is_err());
    }

    #[tokio::test]
    async fn test_zero_length_frame_handled() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig::default();

        write_frame(&mut client, &[], &config).await.unwrap();
        let received = read_frame(&mut server, &config).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_connection_closed_during_length_read() {
        let (client, mut server) = duplex(8192);
        drop(client);

        let result = read_frame(&mut server, &FrameConfig::default()).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_length_prefix_is_little_endian() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig::default();

        client.write_all(&5u32.to_le_bytes()).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        client.flush().await.unwrap();

        let received = read_frame(&mut server, &config).await.unwrap();
        assert_eq!(&received[..], b"hello");
    }

    #[tokio::test]
    async fn test_raw_mode_writes_without_prefix() {
        let (mut client, mut server) = duplex(8192);
        let config = raw_config();

        write_frame(&mut client, b"plain", &config).await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"plain");
    }

    #[tokio::test]
    async fn test_raw_mode_read_returns_chunk() {
        let (mut client, mut server) = duplex(8192);
        client.write_all(b"abc").await.unwrap();
        client.flush().await.unwrap();

        let chunk = read_frame(&mut server, &raw_config()).await.unwrap();
        assert_eq!(&chunk[..], b"abc");

        drop(client);
        let closed = read_frame(&mut server, &raw_config()).await;
        assert!(matches!(closed, Err(FrameError::ConnectionClosed)));
    }

    #[test]
    fn test_packet_header_layout() {
        let header = PacketHeader {
            opcode: 0x0102_0304,
            status: -1,
        };
        let frame = header.encode_with(b"xy");
        assert_eq!(frame.len(), PACKET_HEADER_SIZE + 2);
        assert_eq!(&frame[..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&frame[4..8], &[0xff, 0xff, 0xff, 0xff]);

        let (decoded, payload) = PacketHeader::decode(frame).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(&payload[..], b"xy");
    }

    #[test]
    fn test_truncated_header_rejected() {
        let result = PacketHeader::decode(Bytes::from_static(b"\x01\x00\x00"));
        assert!(matches!(
            result,
            Err(FrameError::TruncatedHeader { len: 3 })
        ));
    }
}
