//! Connection handshake.
//!
//! The connecting side writes the cluster preamble (`i32`) and the newest
//! protocol version it speaks (`u16`). The accepting side checks the
//! preamble, picks the highest version both understand, and writes it back.
//! Any mismatch is fatal and the connection is dropped.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::codec::ProtocolVersion;
use crate::error::{MessagingError, MessagingResult};

/// FNV-1a 64-bit.
pub(crate) fn deterministic_hash(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Preamble identifying members of the same cluster.
pub fn cluster_preamble(cluster_id: &str) -> i32 {
    deterministic_hash(cluster_id) as i32
}

pub async fn client_handshake<S>(stream: &mut S, preamble: i32) -> MessagingResult<ProtocolVersion>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handshake_err = |e: std::io::Error| MessagingError::Handshake(e.to_string());

    stream.write_i32(preamble).await.map_err(handshake_err)?;
    stream
        .write_u16(ProtocolVersion::latest().as_u16())
        .await
        .map_err(handshake_err)?;
    stream.flush().await.map_err(handshake_err)?;

    let selected = stream.read_u16().await.map_err(handshake_err)?;
    let version = ProtocolVersion::from_u16(selected).ok_or_else(|| {
        MessagingError::Handshake(format!("peer selected unsupported version {selected}"))
    })?;
    debug!(version = selected, "client handshake complete");
    Ok(version)
}

pub async fn server_handshake<S>(stream: &mut S, preamble: i32) -> MessagingResult<ProtocolVersion>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handshake_err = |e: std::io::Error| MessagingError::Handshake(e.to_string());

    let remote = stream.read_i32().await.map_err(handshake_err)?;
    if remote != preamble {
        return Err(MessagingError::Handshake(format!(
            "cluster preamble mismatch: expected {preamble}, got {remote}"
        )));
    }

    let offered = stream.read_u16().await.map_err(handshake_err)?;
    let version = ProtocolVersion::negotiate(offered).ok_or_else(|| {
        MessagingError::Handshake(format!("no common protocol version (peer offered {offered})"))
    })?;

    stream
        .write_u16(version.as_u16())
        .await
        .map_err(handshake_err)?;
    stream.flush().await.map_err(handshake_err)?;
    debug!(version = version.as_u16(), "server handshake complete");
    Ok(version)
}
