//! Simple RTMP handshake
//!
//! ```text
//! Client                         Server
//!   |---- C0 + C1 -------------->|
//!   |<--- S0 + S1 + S2 ----------|
//!   |---- C2 ------------------->|
//! ```
//!
//! C1/S1 carry a 4-byte timestamp, 4 zero bytes and random filler. C2/S2
//! echo the peer's packet with our own time at bytes 4..8. Digest-based
//! handshakes are not verified; a peer sending one still gets a valid echo.

use std::time::Instant;

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::constants::{HANDSHAKE_SIZE, RTMP_VERSION};
use crate::error::{HandshakeError, Result};

type Packet = [u8; HANDSHAKE_SIZE];

/// Build a C1/S1 packet
fn hello_packet(epoch: Instant) -> Box<Packet> {
    let mut packet = Box::new([0u8; HANDSHAKE_SIZE]);
    rand::thread_rng().fill_bytes(&mut packet[8..]);
    packet[..4].copy_from_slice(&elapsed_ms(epoch).to_be_bytes());
    packet
}

/// Build a C2/S2 echo of the peer's C1/S1
fn echo_packet(peer: &Packet, epoch: Instant) -> Box<Packet> {
    let mut packet = Box::new(*peer);
    packet[4..8].copy_from_slice(&elapsed_ms(epoch).to_be_bytes());
    packet
}

fn elapsed_ms(epoch: Instant) -> u32 {
    epoch.elapsed().as_millis() as u32
}

fn check_version(version: u8) -> std::result::Result<(), HandshakeError> {
    // Some encoders send versions above 3; anything at least 3 is accepted.
    if version < RTMP_VERSION {
        return Err(HandshakeError::InvalidVersion(version));
    }
    if version != RTMP_VERSION {
        tracing::debug!(version = version, "Peer sent non-standard handshake version");
    }
    Ok(())
}

/// Run the server side of the handshake
pub async fn accept<S>(io: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let epoch = Instant::now();

    let version = io.read_u8().await?;
    check_version(version)?;

    let mut c1 = Box::new([0u8; HANDSHAKE_SIZE]);
    io.read_exact(&mut c1[..]).await?;

    let mut reply = Vec::with_capacity(1 + 2 * HANDSHAKE_SIZE);
    reply.push(RTMP_VERSION);
    reply.extend_from_slice(&hello_packet(epoch)[..]);
    reply.extend_from_slice(&echo_packet(&c1, epoch)[..]);
    io.write_all(&reply).await?;
    io.flush().await?;

    let mut c2 = Box::new([0u8; HANDSHAKE_SIZE]);
    io.read_exact(&mut c2[..]).await?;

    tracing::trace!("Server handshake complete");
    Ok(())
}

/// Run the client side of the handshake
pub async fn initiate<S>(io: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let epoch = Instant::now();

    let mut hello = Vec::with_capacity(1 + HANDSHAKE_SIZE);
    hello.push(RTMP_VERSION);
    hello.extend_from_slice(&hello_packet(epoch)[..]);
    io.write_all(&hello).await?;
    io.flush().await?;

    let version = io.read_u8().await?;
    check_version(version)?;

    let mut s1 = Box::new([0u8; HANDSHAKE_SIZE]);
    io.read_exact(&mut s1[..]).await?;
    let mut s2 = Box::new([0u8; HANDSHAKE_SIZE]);
    io.read_exact(&mut s2[..]).await?;

    io.write_all(&echo_packet(&s1, epoch)[..]).await?;
    io.flush().await?;

    tracing::trace!("Client handshake complete");
    Ok(())
}
