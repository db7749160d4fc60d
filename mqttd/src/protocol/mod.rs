//! MQTT 3.1.1 wire protocol.
//!
//! [`codec`] holds the primitive readers/writers, [`v4`] the packet types.
//! The async helpers here frame packets over any tokio byte stream.

pub mod codec;
pub mod v4;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub use v4::Packet;

/// Maximum packet size (1MB default).
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Read a single packet from an async reader.
///
/// Bytes past the end of the packet stay in `buf` for the next call.
pub async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_size: usize,
) -> Result<Packet> {
    loop {
        if !buf.is_empty() {
            match Packet::read(buf, max_size) {
                Ok((packet, len)) => {
                    let _ = buf.split_to(len);
                    return Ok(packet);
                }
                Err(Error::Incomplete { needed }) => buf.reserve(needed),
                Err(e) => return Err(e),
            }
        }

        let n = reader.read_buf(buf).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
    }
}

/// Write a single packet to an async writer.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    let mut buf = BytesMut::with_capacity(packet.size());
    packet.write(&mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QoS;
    use v4::Publish;

    #[tokio::test]
    async fn test_read_packets_split_across_reads() {
        let first = Packet::Publish(Publish::new("a/b", QoS::AtMostOnce, "one"));
        let second = Packet::PingReq;

        let mut wire = BytesMut::new();
        first.write(&mut wire).unwrap();
        second.write(&mut wire).unwrap();

        let (mut client, mut server) = tokio::io::duplex(64);
        let bytes = wire.to_vec();
        tokio::spawn(async move {
            for chunk in bytes.chunks(3) {
                client.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut buf = BytesMut::new();
        assert_eq!(read_packet(&mut server, &mut buf, MAX_PACKET_SIZE).await.unwrap(), first);
        assert_eq!(read_packet(&mut server, &mut buf, MAX_PACKET_SIZE).await.unwrap(), second);
        assert!(matches!(
            read_packet(&mut server, &mut buf, MAX_PACKET_SIZE).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_write_packet() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_packet(&mut client, &Packet::PubAck(9)).await.unwrap();

        let mut buf = BytesMut::new();
        assert_eq!(read_packet(&mut server, &mut buf, 16).await.unwrap(), Packet::PubAck(9));
    }
}
