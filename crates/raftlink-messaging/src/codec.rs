//! Versioned binary framing for protocol messages.
//!
//! # Wire Format (V1)
//!
//! All integers are big-endian.
//!
//! ```text
//! [len:u32]                       bytes that follow this field
//! [type:u8]                       1 = request, 2 = reply
//! [id:u64]                        correlation id
//! request: [ip_len:u8][ip][port:u32][subject_len:u16][subject]
//! reply:   [status:u8]
//! [payload_len:u32][payload]
//! ```
//!
//! The request carries the sender's own address. Decoders use it instead of
//! the transport peer address, which may be rewritten by NAT.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use raftlink_core::Address;

use crate::error::{CodecError, CodecResult};
use crate::protocol::{ProtocolMessage, ProtocolReply, ProtocolRequest, ReplyStatus};

const TAG_REQUEST: u8 = 1;
const TAG_REPLY: u8 = 2;

const LENGTH_PREFIX: usize = 4;

/// Wire protocol versions understood by this build, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V1 = 1,
}

impl ProtocolVersion {
    const SUPPORTED: &'static [ProtocolVersion] = &[ProtocolVersion::V1];

    pub fn latest() -> Self {
        ProtocolVersion::V1
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(version: u16) -> Option<Self> {
        Self::SUPPORTED
            .iter()
            .copied()
            .find(|v| v.as_u16() == version)
    }

    /// Highest supported version not newer than `offered`.
    pub fn negotiate(offered: u16) -> Option<Self> {
        Self::SUPPORTED
            .iter()
            .copied()
            .filter(|v| v.as_u16() <= offered)
            .max()
    }

    /// Codec for this version.
    pub fn codec(self, max_frame_bytes: usize) -> Arc<dyn MessageCodec> {
        match self {
            ProtocolVersion::V1 => Arc::new(CodecV1::new(max_frame_bytes)),
        }
    }
}

/// Encodes and decodes framed protocol messages for one protocol version.
pub trait MessageCodec: Send + Sync + 'static {
    fn version(&self) -> ProtocolVersion;

    /// Append one complete frame for `message` to `dst`.
    fn encode(&self, message: &ProtocolMessage, dst: &mut BytesMut) -> CodecResult<()>;

    /// Decode one frame from the front of `src`.
    ///
    /// Returns the message and the number of bytes consumed, or
    /// [`CodecError::InsufficientData`] when `src` holds only part of a frame.
    fn decode(&self, src: &[u8]) -> CodecResult<(ProtocolMessage, usize)>;
}

/// The version 1 codec.
#[derive(Debug, Clone)]
pub struct CodecV1 {
    max_frame_bytes: usize,
}

impl CodecV1 {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl MessageCodec for CodecV1 {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V1
    }

    fn encode(&self, message: &ProtocolMessage, dst: &mut BytesMut) -> CodecResult<()> {
        let start = dst.len();
        dst.reserve(LENGTH_PREFIX + 64 + message.payload().len());

        // Length is patched in once the frame is complete.
        dst.put_u32(0);

        match message {
            ProtocolMessage::Request(request) => {
                dst.put_u8(TAG_REQUEST);
                dst.put_u64(request.id);
                if let Err(e) = encode_sender(dst, &request.sender) {
                    dst.truncate(start);
                    return Err(e);
                }
                let subject = request.subject.as_bytes();
                if subject.len() > u16::MAX as usize {
                    dst.truncate(start);
                    return Err(CodecError::FieldTooLong {
                        field: "subject",
                        len: subject.len(),
                        max: u16::MAX as usize,
                    });
                }
                dst.put_u16(subject.len() as u16);
                dst.put_slice(subject);
            }
            ProtocolMessage::Reply(reply) => {
                dst.put_u8(TAG_REPLY);
                dst.put_u64(reply.id);
                dst.put_u8(reply.status.as_u8());
            }
        }

        let payload = message.payload();
        let frame_len = dst.len() - start - LENGTH_PREFIX + 4 + payload.len();
        if frame_len > self.max_frame_bytes {
            dst.truncate(start);
            return Err(CodecError::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_bytes,
            });
        }
        dst.put_u32(payload.len() as u32);
        dst.put_slice(payload);

        dst[start..start + LENGTH_PREFIX].copy_from_slice(&(frame_len as u32).to_be_bytes());
        Ok(())
    }

    fn decode(&self, src: &[u8]) -> CodecResult<(ProtocolMessage, usize)> {
        if src.len() < LENGTH_PREFIX {
            return Err(CodecError::InsufficientData {
                need: LENGTH_PREFIX,
                have: src.len(),
            });
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_bytes {
            return Err(CodecError::FrameTooLarge {
                size: len,
                max: self.max_frame_bytes,
            });
        }

        let total = LENGTH_PREFIX + len;
        if src.len() < total {
            return Err(CodecError::InsufficientData {
                need: total,
                have: src.len(),
            });
        }

        let mut buf = &src[LENGTH_PREFIX..total];
        ensure_remaining(buf, 9)?;
        let tag = buf.get_u8();
        let id = buf.get_u64();

        let message = match tag {
            TAG_REQUEST => {
                let sender = decode_sender(&mut buf)?;
                ensure_remaining(buf, 2)?;
                let subject_len = buf.get_u16() as usize;
                ensure_remaining(buf, subject_len)?;
                let subject = std::str::from_utf8(&buf[..subject_len])
                    .map_err(|e| CodecError::Malformed(format!("subject is not UTF-8: {e}")))?
                    .to_string();
                buf.advance(subject_len);
                let payload = decode_payload(&mut buf)?;
                ProtocolMessage::Request(ProtocolRequest {
                    id,
                    sender,
                    subject,
                    payload,
                })
            }
            TAG_REPLY => {
                ensure_remaining(buf, 1)?;
                let status = ReplyStatus::from_u8(buf.get_u8())?;
                let payload = decode_payload(&mut buf)?;
                ProtocolMessage::Reply(ProtocolReply {
                    id,
                    payload,
                    status,
                })
            }
            _ => return Err(CodecError::UnknownMessageType { tag }),
        };

        if buf.has_remaining() {
            return Err(CodecError::Malformed(format!(
                "{} trailing bytes in frame",
                buf.remaining()
            )));
        }

        Ok((message, total))
    }
}

fn encode_sender(dst: &mut BytesMut, sender: &Address) -> CodecResult<()> {
    let ip = sender
        .ip()
        .ok_or_else(|| CodecError::UnresolvedAddress(sender.to_string()))?;
    match ip {
        IpAddr::V4(v4) => {
            dst.put_u8(4);
            dst.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            dst.put_u8(16);
            dst.put_slice(&v6.octets());
        }
    }
    dst.put_u32(u32::from(sender.port()));
    Ok(())
}

fn decode_sender(buf: &mut &[u8]) -> CodecResult<Address> {
    ensure_remaining(buf, 1)?;
    let ip_len = buf.get_u8() as usize;
    ensure_remaining(buf, ip_len + 4)?;
    let ip = match ip_len {
        4 => {
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        16 => {
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        n => return Err(CodecError::Malformed(format!("invalid ip length {n}"))),
    };
    let port = buf.get_u32();
    let port = u16::try_from(port)
        .map_err(|_| CodecError::Malformed(format!("port {port} out of range")))?;
    Ok(Address::from_ip(ip, port))
}

fn decode_payload(buf: &mut &[u8]) -> CodecResult<Bytes> {
    ensure_remaining(buf, 4)?;
    let len = buf.get_u32() as usize;
    ensure_remaining(buf, len)?;
    let payload = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(payload)
}

/// Inside a complete frame a short field is corruption, not a partial read.
fn ensure_remaining(buf: &[u8], need: usize) -> CodecResult<()> {
    if buf.len() < need {
        return Err(CodecError::Malformed(format!(
            "truncated field: need {need} bytes, have {}",
            buf.len()
        )));
    }
    Ok(())
}
