//! Wire messages and framing
//!
//! Datagrams (queries, announcements, time probes) carry one bincode-encoded
//! `WireMessage` each. The TCP data connection carries a sequence of frames,
//! each a little-endian `u32` length followed by that many bincode bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Result, Sample, StreamDescriptor, StreamError, StreamUid};

/// Largest frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Largest datagram we send or expect
pub const MAX_DATAGRAM_LEN: usize = 65_507;

const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    // ===== Discovery (UDP) =====
    /// Who serves streams matching `predicate`?
    Query { query_id: u64, predicate: String },

    /// Reply to a query, descriptor without `desc`
    Announce {
        query_id: u64,
        descriptor: StreamDescriptor,
    },

    // ===== Clock offset (UDP) =====
    /// `t0` is the sender's local send time
    TimeProbe { probe_id: u64, t0: f64 },

    /// `t1` receive time and `t2` reply time on the outlet's clock
    TimeReply {
        probe_id: u64,
        t0: f64,
        t1: f64,
        t2: f64,
    },

    // ===== Data connection (TCP) =====
    /// Inlet asks for the stream instance `uid`
    Subscribe { uid: StreamUid, max_buffered: f64 },

    /// Full descriptor, including `desc`
    Accepted { descriptor: StreamDescriptor },

    Rejected { reason: String },

    /// Samples in push order
    Samples(Vec<Sample>),
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Query { .. } => "query",
            WireMessage::Announce { .. } => "announce",
            WireMessage::TimeProbe { .. } => "time_probe",
            WireMessage::TimeReply { .. } => "time_reply",
            WireMessage::Subscribe { .. } => "subscribe",
            WireMessage::Accepted { .. } => "accepted",
            WireMessage::Rejected { .. } => "rejected",
            WireMessage::Samples(_) => "samples",
        }
    }

    /// Encode as a single datagram payload
    pub fn to_datagram(&self) -> Result<Vec<u8>> {
        let bytes = bincode::serialize(self)?;
        if bytes.len() > MAX_DATAGRAM_LEN {
            return Err(StreamError::internal(format!(
                "{} datagram of {} bytes exceeds {MAX_DATAGRAM_LEN}",
                self.kind(),
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    pub fn from_datagram(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Encode as a length-prefixed frame
    pub fn to_frame(&self) -> Result<Bytes> {
        let body_len = bincode::serialized_size(self)? as usize;
        if body_len > MAX_FRAME_LEN {
            return Err(StreamError::internal(format!(
                "frame of {body_len} bytes exceeds {MAX_FRAME_LEN}"
            )));
        }
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body_len);
        buf.put_u32_le(body_len as u32);
        let mut writer = buf.writer();
        bincode::serialize_into(&mut writer, self)?;
        Ok(writer.into_inner().freeze())
    }

    /// Decode one complete frame (header included)
    pub fn from_frame(mut frame: &[u8]) -> Result<Self> {
        if frame.len() < FRAME_HEADER_LEN {
            return Err(StreamError::internal("truncated frame header"));
        }
        let len = frame.get_u32_le() as usize;
        if frame.len() != len {
            return Err(StreamError::internal(format!(
                "frame declares {len} bytes but carries {}",
                frame.len()
            )));
        }
        Ok(bincode::deserialize(frame)?)
    }
}

/// Write one frame
pub async fn write_frame<W>(writer: &mut W, message: &WireMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = message.to_frame()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `Ok(None)` on a clean end of stream between frames.
///
/// # Errors
/// `Internal` for oversized or undecodable frames, `Io` for broken connections.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<WireMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(StreamError::internal(format!(
            "peer announced a frame of {len} bytes"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    bincode::deserialize(&body)
        .map(Some)
        .map_err(|e| StreamError::internal(format!("corrupt frame: {e}")))
}
