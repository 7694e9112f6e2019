//! Out-of-band remaining-quota query.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::debug;

use super::{MAX_DATAGRAM_SIZE, TunnelError, Wire};
use crate::protocol::{self, Identification};

/// Ask the remote endpoint how much quota `identification` has left.
///
/// Uses a fresh socket, independent of any running session. The first
/// decryptable reply within `timeout` is parsed.
pub async fn query_quota(
    server: SocketAddr,
    identification: &Identification,
    wire: &Wire,
    timeout: Duration,
) -> Result<u32, TunnelError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let request = wire.seal(&protocol::quota_request(identification))?;
    socket.send_to(&request, server).await?;
    debug!(%server, "quota query sent");

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let (len, _) = tokio::time::timeout(timeout, socket.recv_from(&mut buf))
        .await
        .map_err(|_| TunnelError::QuotaTimeout(timeout))??;

    let plain = wire
        .open(&buf[..len])
        .into_iter()
        .next()
        .unwrap_or(Ok(Vec::new()))?;
    Ok(protocol::parse_quota_response(&plain)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Cipher, CipherKind};
    use crate::protocol::TAG_QUOTA_QUERY;

    fn wire() -> Wire {
        Wire::new(Cipher::new(CipherKind::Stream, b"secret"), false)
    }

    #[tokio::test]
    async fn reads_remaining_quota() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let responder = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            let (len, client) = server.recv_from(&mut buf).await.unwrap();
            let request = wire().open(&buf[..len]).remove(0).unwrap();
            assert_eq!(request[0], TAG_QUOTA_QUERY);
            assert_eq!(&request[1..], Identification::from_name("alice").as_bytes());

            let reply = wire().seal(&[0x05, 0, 1, 0, 0]).unwrap();
            server.send_to(&reply, client).await.unwrap();
        });

        let remaining = query_quota(
            addr,
            &Identification::from_name("alice"),
            &wire(),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        assert_eq!(remaining, 65536);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let err = query_quota(
            server.local_addr().unwrap(),
            &Identification::from_name("alice"),
            &wire(),
            Duration::from_millis(50),
        )
        .await;

        assert!(matches!(err, Err(TunnelError::QuotaTimeout(_))));
    }

    #[tokio::test]
    async fn short_reply_is_a_protocol_error() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            let (_, client) = server.recv_from(&mut buf).await.unwrap();
            let reply = wire().seal(&[0x05, 0]).unwrap();
            server.send_to(&reply, client).await.unwrap();
        });

        let err = query_quota(
            addr,
            &Identification::from_name("alice"),
            &wire(),
            Duration::from_secs(2),
        )
        .await;

        assert!(matches!(err, Err(TunnelError::Protocol(_))));
    }
}
