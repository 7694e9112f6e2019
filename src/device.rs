//! Local packet device.
//!
//! The virtual network interface is owned outside this crate. The client
//! reads IPv4 datagrams from a [`PacketSource`] and writes them back to a
//! [`PacketSink`]. [`UdpDevice`] bridges both over a local UDP socket, one
//! datagram per packet.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

const IPV4_MIN_HEADER_LEN: usize = 20;
const MAX_PACKET_SIZE: usize = 65536;

#[async_trait]
pub trait PacketSource: Send {
    /// Wait for the next IPv4 datagram.
    async fn read_packet(&mut self) -> io::Result<Vec<u8>>;
}

#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn write_packet(&self, packet: &[u8]) -> io::Result<()>;
}

/// The IPv4 datagram at the front of `buf`, trimmed to its total length.
///
/// Returns `None` for IPv6, other versions and truncated datagrams.
pub fn extract_ipv4(buf: &[u8]) -> Option<&[u8]> {
    let first = *buf.first()?;
    if first >> 4 != 4 {
        return None;
    }
    let header_len = (first & 0x0F) as usize * 4;
    let total_len = u16::from_be_bytes([*buf.get(2)?, *buf.get(3)?]) as usize;
    if header_len < IPV4_MIN_HEADER_LEN || total_len < header_len {
        return None;
    }
    buf.get(..total_len)
}

/// Device bridge over a connected local UDP socket.
pub struct UdpDevice {
    socket: Arc<UdpSocket>,
}

impl UdpDevice {
    /// Bind `local` and exchange packets only with `peer`.
    pub async fn bind(local: SocketAddr, peer: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Split into a reading half and a cloneable writing half.
    pub fn split(self) -> (UdpDeviceReader, UdpDeviceWriter) {
        (
            UdpDeviceReader {
                socket: Arc::clone(&self.socket),
                buf: vec![0u8; MAX_PACKET_SIZE],
            },
            UdpDeviceWriter {
                socket: self.socket,
            },
        )
    }
}

pub struct UdpDeviceReader {
    socket: Arc<UdpSocket>,
    buf: Vec<u8>,
}

#[async_trait]
impl PacketSource for UdpDeviceReader {
    async fn read_packet(&mut self) -> io::Result<Vec<u8>> {
        loop {
            let len = self.socket.recv(&mut self.buf).await?;
            match extract_ipv4(&self.buf[..len]) {
                Some(packet) => return Ok(packet.to_vec()),
                None => debug!(len, "skipping non-IPv4 datagram"),
            }
        }
    }
}

#[derive(Clone)]
pub struct UdpDeviceWriter {
    socket: Arc<UdpSocket>,
}

#[async_trait]
impl PacketSink for UdpDeviceWriter {
    async fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        self.socket.send(packet).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn ipv4(total_len: u16) -> Vec<u8> {
        let mut packet = vec![0u8; total_len as usize];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&total_len.to_be_bytes());
        packet
    }

    #[test]
    fn trims_to_total_length() {
        let mut buf = ipv4(28);
        buf.extend_from_slice(&[0xAA; 12]);

        assert_eq!(extract_ipv4(&buf).map(<[u8]>::len), Some(28));
    }

    #[test]
    fn skips_ipv6() {
        let mut buf = vec![0u8; 40];
        buf[0] = 0x60;

        assert_eq!(extract_ipv4(&buf), None);
    }

    #[test]
    fn rejects_truncated_and_bogus_headers() {
        assert_eq!(extract_ipv4(&[]), None);
        assert_eq!(extract_ipv4(&ipv4(60)[..30]), None);

        let mut short_header = ipv4(28);
        short_header[0] = 0x44;
        assert_eq!(extract_ipv4(&short_header), None);

        assert_eq!(extract_ipv4(&ipv4(10)), None);
    }

    #[tokio::test]
    async fn bridge_exchanges_packets_with_peer() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device = UdpDevice::bind("127.0.0.1:0".parse().unwrap(), peer.local_addr().unwrap())
            .await
            .unwrap();
        peer.connect(device.local_addr().unwrap()).await.unwrap();
        let (mut reader, writer) = device.split();

        let mut v6 = vec![0u8; 40];
        v6[0] = 0x60;
        peer.send(&v6).await.unwrap();
        let mut padded = ipv4(24);
        padded.extend_from_slice(&[0; 8]);
        peer.send(&padded).await.unwrap();

        let packet = tokio::time::timeout(Duration::from_secs(2), reader.read_packet())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet, ipv4(24));

        writer.write_packet(&ipv4(20)).await.unwrap();
        let mut buf = [0u8; 64];
        let len = peer.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &ipv4(20)[..]);
    }
}
