//! Upstream A-record resolution.
//!
//! The rewriter asks a [`Lookup`] for the addresses of each queried name.
//! [`UpstreamResolver`] races every configured server over UDP and takes the
//! first answer; when no server answers the name resolves to nothing.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{FutureExt, select_ok};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::config::FilterConfig;
use crate::dns::{DNS_PORT, DnsMessage};

const MAX_RESPONSE_SIZE: usize = 4096;

/// Resolves a name to IPv4 addresses.
#[async_trait]
pub trait Lookup: Send + Sync {
    /// Addresses for `name`, CNAME chains followed. Empty on failure.
    async fn lookup_a(&self, name: &str) -> Vec<Ipv4Addr>;
}

/// Queries a list of DNS servers directly.
pub struct UpstreamResolver {
    servers: Vec<SocketAddr>,
    timeout: Duration,
}

impl UpstreamResolver {
    pub fn new(servers: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self { servers, timeout }
    }

    /// Resolver for the filter's direct DNS server, the one the filter
    /// routes around the tunnel.
    pub fn for_filter(config: &FilterConfig) -> Self {
        Self::new(
            vec![SocketAddr::from((config.direct_dns_server, DNS_PORT))],
            config.resolve_timeout(),
        )
    }

    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }
}

#[async_trait]
impl Lookup for UpstreamResolver {
    async fn lookup_a(&self, name: &str) -> Vec<Ipv4Addr> {
        if self.servers.is_empty() {
            return Vec::new();
        }

        let queries = self
            .servers
            .iter()
            .map(|&server| query_server(server, name, self.timeout).boxed());
        match select_ok(queries).await {
            Ok((addrs, _)) => addrs,
            Err(e) => {
                debug!(name, error = %e, "no upstream answered");
                Vec::new()
            }
        }
    }
}

/// One A query against one server.
async fn query_server(
    server: SocketAddr,
    name: &str,
    timeout: Duration,
) -> io::Result<Vec<Ipv4Addr>> {
    let bind: SocketAddr = if server.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(server).await?;

    let id: u16 = rand::random();
    let query = DnsMessage::query(id, name)
        .to_bytes()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    socket.send(&query).await?;

    let mut buf = vec![0u8; MAX_RESPONSE_SIZE];
    tokio::time::timeout(timeout, async {
        loop {
            let len = socket.recv(&mut buf).await?;
            match DnsMessage::parse(&buf[..len]) {
                Ok(reply) if reply.id == id && reply.is_response() => {
                    let addrs = reply.resolve_chain(name);
                    debug!(name, %server, count = addrs.len(), "upstream answered");
                    return Ok(addrs);
                }
                Ok(_) => continue,
                Err(e) => debug!(%server, error = %e, "unparsable upstream reply"),
            }
        }
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream timed out"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::DnsRecord;

    /// Answers every query with a CNAME to `edge.example.net` and one A record.
    async fn fake_server(addr: Ipv4Addr) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_RESPONSE_SIZE];
            loop {
                let Ok((len, client)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let mut msg = DnsMessage::parse(&buf[..len]).unwrap();
                let name = msg.questions[0].name.clone();
                msg.flags |= 0x8080;
                msg.answers = vec![
                    DnsRecord {
                        name: name.clone(),
                        rtype: crate::dns::TYPE_CNAME,
                        class: crate::dns::CLASS_IN,
                        ttl: 60,
                        rdata: crate::dns::RData::Cname("edge.example.net".into()),
                    },
                    DnsRecord::a("edge.example.net", 60, addr),
                ];
                socket
                    .send_to(&msg.to_bytes().unwrap(), client)
                    .await
                    .unwrap();
            }
        });
        local
    }

    /// Bound but never answers.
    async fn silent_server() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    #[tokio::test]
    async fn follows_cname_to_address() {
        let server = fake_server(Ipv4Addr::new(93, 184, 216, 34)).await;
        let resolver = UpstreamResolver::new(vec![server], Duration::from_secs(2));

        let addrs = resolver.lookup_a("www.example.com").await;

        assert_eq!(addrs, vec![Ipv4Addr::new(93, 184, 216, 34)]);
    }

    #[tokio::test]
    async fn first_answering_server_wins() {
        let (_silent, silent_addr) = silent_server().await;
        let server = fake_server(Ipv4Addr::new(1, 2, 3, 4)).await;
        let resolver = UpstreamResolver::new(vec![silent_addr, server], Duration::from_secs(2));

        let addrs = resolver.lookup_a("example.com").await;

        assert_eq!(addrs, vec![Ipv4Addr::new(1, 2, 3, 4)]);
    }

    #[tokio::test]
    async fn all_servers_failing_yields_empty() {
        let (_silent, silent_addr) = silent_server().await;
        let resolver = UpstreamResolver::new(vec![silent_addr], Duration::from_millis(50));

        assert!(resolver.lookup_a("example.com").await.is_empty());
    }

    #[tokio::test]
    async fn no_servers_yields_empty() {
        let resolver = UpstreamResolver::new(Vec::new(), Duration::from_millis(50));

        assert!(resolver.lookup_a("example.com").await.is_empty());
    }
}
