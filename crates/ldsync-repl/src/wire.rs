//! Stream framing of [`SessionMsg`]s.
//!
//! ```text
//! magic:u32 | version:u8 | len:u32 | crc32:u32 | bincode payload (len bytes)
//! ```
//!
//! All integers are big-endian; the CRC covers the payload only.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ReplError, Result};
use crate::protocol::{SessionMsg, PROTOCOL_VERSION};

/// Frame magic ("LDS1").
pub const MAGIC: u32 = 0x4C44_5331;

/// Header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 13;

/// Largest accepted payload.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length.
    pub len: u32,
    /// CRC32 of the payload.
    pub crc32: u32,
}

impl FrameHeader {
    /// Encodes the header.
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4] = PROTOCOL_VERSION;
        buf[5..9].copy_from_slice(&self.len.to_be_bytes());
        buf[9..13].copy_from_slice(&self.crc32.to_be_bytes());
        buf
    }

    /// Decodes and validates a header.
    pub fn decode(buf: &[u8; FRAME_HEADER_SIZE]) -> Result<Self> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != MAGIC {
            return Err(ReplError::protocol(format!("bad frame magic {magic:#010x}")));
        }
        if buf[4] != PROTOCOL_VERSION {
            return Err(ReplError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: buf[4],
            });
        }
        let len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);
        if len > MAX_FRAME_SIZE {
            return Err(ReplError::protocol(format!(
                "frame of {len} bytes exceeds {MAX_FRAME_SIZE}"
            )));
        }
        let crc32 = u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]);
        Ok(Self { len, crc32 })
    }
}

/// Encodes `msg` as one frame.
pub fn encode_frame(msg: &SessionMsg) -> Result<Vec<u8>> {
    let payload = bincode::serialize(msg)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or_else(|| ReplError::protocol(format!("{} payload too large", msg.name())))?;
    let header = FrameHeader {
        len,
        crc32: crc32fast::hash(&payload),
    };
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes a frame payload after checking its CRC.
pub fn decode_payload(header: &FrameHeader, payload: &[u8]) -> Result<SessionMsg> {
    let crc = crc32fast::hash(payload);
    if crc != header.crc32 {
        return Err(ReplError::protocol(format!(
            "frame checksum mismatch: expected {:#010x}, got {crc:#010x}",
            header.crc32
        )));
    }
    Ok(bincode::deserialize(payload)?)
}

/// Writes one framed message and flushes.
pub async fn write_msg<W>(writer: &mut W, msg: &SessionMsg) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one framed message; `None` on a clean end of stream.
pub async fn read_msg<R>(reader: &mut R) -> Result<Option<SessionMsg>>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let header = FrameHeader::decode(&header_buf)?;
    let mut payload = vec![0u8; header.len as usize];
    reader.read_exact(&mut payload).await?;
    decode_payload(&header, &payload).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csn::ServerId;
    use crate::server_state::ServerState;

    fn ack() -> SessionMsg {
        SessionMsg::WindowAck {
            credits: 50,
            server_state: ServerState::new(),
        }
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_msg(&mut a, &SessionMsg::Heartbeat).await.unwrap();
        write_msg(&mut a, &ack()).await.unwrap();
        drop(a);

        assert_eq!(read_msg(&mut b).await.unwrap(), Some(SessionMsg::Heartbeat));
        assert_eq!(read_msg(&mut b).await.unwrap(), Some(ack()));
        assert_eq!(read_msg(&mut b).await.unwrap(), None);
    }

    #[test]
    fn test_header_layout() {
        let frame = encode_frame(&SessionMsg::Heartbeat).unwrap();
        assert_eq!(&frame[0..4], &MAGIC.to_be_bytes());
        assert_eq!(frame[4], PROTOCOL_VERSION);
        let len = u32::from_be_bytes([frame[5], frame[6], frame[7], frame[8]]) as usize;
        assert_eq!(frame.len(), FRAME_HEADER_SIZE + len);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut frame = encode_frame(&SessionMsg::Heartbeat).unwrap();
        frame[0] ^= 0xFF;
        let header: [u8; FRAME_HEADER_SIZE] = frame[..FRAME_HEADER_SIZE].try_into().unwrap();
        assert!(matches!(
            FrameHeader::decode(&header),
            Err(ReplError::Protocol { .. })
        ));
    }

    #[test]
    fn test_version_mismatch() {
        let mut frame = encode_frame(&SessionMsg::Heartbeat).unwrap();
        frame[4] = PROTOCOL_VERSION + 1;
        let header: [u8; FRAME_HEADER_SIZE] = frame[..FRAME_HEADER_SIZE].try_into().unwrap();
        assert!(matches!(
            FrameHeader::decode(&header),
            Err(ReplError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_corrupt_payload_rejected() {
        let msg = SessionMsg::InitializeRequest {
            requester: ServerId::new(3),
        };
        let mut frame = encode_frame(&msg).unwrap();
        let header: [u8; FRAME_HEADER_SIZE] = frame[..FRAME_HEADER_SIZE].try_into().unwrap();
        let header = FrameHeader::decode(&header).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(decode_payload(&header, &frame[FRAME_HEADER_SIZE..]).is_err());
    }

    #[test]
    fn test_oversized_header_rejected() {
        let header = FrameHeader {
            len: MAX_FRAME_SIZE + 1,
            crc32: 0,
        };
        assert!(FrameHeader::decode(&header.encode()).is_err());
    }
}
