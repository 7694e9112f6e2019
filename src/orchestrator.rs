//! Wires the device, the tunnel session, the filter and the DNS rewriter.
//!
//! Packets read from the device go through the tunnel unless they are DNS
//! requests for a matched domain, which are answered locally after direct
//! re-resolution. Packets arriving from the tunnel go to the device unless
//! they are DNS responses for a matched domain, which are re-resolved first.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use ipnetwork::Ipv4Network;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigError};
use crate::device::{PacketSink, PacketSource};
use crate::dns::DnsPacket;
use crate::filter::{FilterEngine, FilterError, FilterHandle, FilterService, RouteControl};
use crate::resolver::Lookup;
use crate::rewriter::DnsRewriter;
use crate::stats::{TrafficMeter, TrafficSnapshot, TrafficStore};
use crate::transport::{SessionConfig, SessionEvent, TunnelError, TunnelSession, Wire};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error("device error: {0}")]
    Device(#[source] io::Error),
}

/// Runs one client connection from handshake to teardown.
pub struct Orchestrator {
    config: Config,
    routes: Arc<dyn RouteControl + Sync>,
    lookup: Arc<dyn Lookup>,
    store: Arc<dyn TrafficStore>,
    meter: Arc<TrafficMeter>,
}

/// Components that exist while connected.
struct Connection {
    session: TunnelSession,
    filter: FilterHandle,
    service: FilterService,
    rewriter: DnsRewriter,
    server_route: Ipv4Network,
}

impl Orchestrator {
    /// Seeds the traffic totals from `store`.
    pub fn new(
        config: Config,
        routes: Arc<dyn RouteControl + Sync>,
        lookup: Arc<dyn Lookup>,
        store: Arc<dyn TrafficStore>,
    ) -> Self {
        let meter = Arc::new(TrafficMeter::seeded(store.load()));
        Self {
            config,
            routes,
            lookup,
            store,
            meter,
        }
    }

    /// Live counters. Totals are the seeded values until a session ticks.
    pub fn meter(&self) -> &Arc<TrafficMeter> {
        &self.meter
    }

    /// Zero the counters and the persisted totals.
    pub fn reset_traffic(&self) {
        self.meter.reset();
        self.store.save(TrafficSnapshot::default());
    }

    /// Connect and relay until `shutdown` fires or the device fails.
    ///
    /// Returns the final traffic totals.
    pub async fn run(
        &self,
        mut source: Box<dyn PacketSource>,
        sink: Arc<dyn PacketSink>,
        shutdown: CancellationToken,
    ) -> Result<TrafficSnapshot, OrchestratorError> {
        self.config.validate()?;

        let (events_tx, mut events) = mpsc::channel(4);
        let (inbound_tx, mut inbound) = mpsc::channel(CHANNEL_CAPACITY);
        let (rewritten_tx, mut rewritten) = mpsc::channel(CHANNEL_CAPACITY);

        let server = self.config.server.addr();
        let session = TunnelSession::start(
            SessionConfig {
                server: SocketAddr::V4(server),
                identification: self.config.auth.identification(),
                wire: Wire::new(self.config.cipher(), self.config.cipher.length_prefixed),
                timing: self.config.timing,
            },
            Arc::clone(&self.meter),
            Arc::clone(&self.store),
            events_tx,
            inbound_tx,
        )
        .await?;
        info!(%server, "connecting");

        let event = tokio::select! {
            _ = shutdown.cancelled() => None,
            event = events.recv() => event,
        };
        let (tunnel_ip, gateway) = match event {
            Some(SessionEvent::Connected { tunnel_ip, gateway }) => (tunnel_ip, gateway),
            Some(SessionEvent::HandshakeFailed) => {
                session.stop().await;
                return Err(TunnelError::HandshakeExhausted.into());
            }
            None => {
                session.stop().await;
                return Ok(self.meter.totals());
            }
        };
        info!(%tunnel_ip, %gateway, "tunnel up");

        let conn = match self.bring_up(session, rewritten_tx).await {
            Ok(conn) => conn,
            Err((session, e)) => {
                session.stop().await;
                return Err(e);
            }
        };

        let mut stats = tokio::time::interval(
            self.config.timing.unit() * self.config.timing.persist_every_ticks,
        );
        stats.tick().await;

        let outcome = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                packet = source.read_packet() => match packet {
                    Ok(packet) => self.outbound(&conn, packet).await,
                    Err(e) => {
                        error!(error = %e, "device read failed");
                        break Err(OrchestratorError::Device(e));
                    }
                },
                Some(payload) = inbound.recv() => self.inbound(&conn, sink.as_ref(), payload).await,
                Some(packet) = rewritten.recv() => write(sink.as_ref(), &packet).await,
                _ = stats.tick() => {
                    let totals = self.meter.totals();
                    info!(
                        rx_rate = self.meter.rx_rate(),
                        tx_rate = self.meter.tx_rate(),
                        rx_total = totals.rx_total,
                        tx_total = totals.tx_total,
                        "traffic"
                    );
                }
            }
        };

        self.tear_down(conn).await;
        outcome.map(|()| self.meter.totals())
    }

    async fn bring_up(
        &self,
        session: TunnelSession,
        rewritten: mpsc::Sender<Vec<u8>>,
    ) -> Result<Connection, (TunnelSession, OrchestratorError)> {
        let server_route = Ipv4Network::from(self.config.server.host);
        if let Err(e) = self.routes.add_direct(server_route) {
            warn!(error = %e, "failed to route tunnel server directly");
        }

        let service = FilterService::spawn(FilterEngine::new(
            Box::new(Arc::clone(&self.routes)),
            self.config.filter.direct_dns_server,
        ));
        let filter = service.handle();
        let init = match self.config.filter.static_cidrs() {
            Ok(cidrs) => filter
                .init(
                    self.config.filter.mode,
                    self.config.filter.domains.clone(),
                    cidrs,
                )
                .await
                .map_err(OrchestratorError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = init {
            service.shutdown().await;
            if let Err(e) = self.routes.remove_direct(server_route) {
                warn!(error = %e, "failed to remove tunnel server route");
            }
            return Err((session, e));
        }

        let rewriter = DnsRewriter::spawn(Arc::clone(&self.lookup), filter.clone(), rewritten);
        Ok(Connection {
            session,
            filter,
            service,
            rewriter,
            server_route,
        })
    }

    async fn tear_down(&self, conn: Connection) {
        conn.rewriter.stop().await;
        drop(conn.filter);
        conn.service.shutdown().await;
        if let Err(e) = self.routes.remove_direct(conn.server_route) {
            warn!(error = %e, "failed to remove tunnel server route");
        }
        conn.session.stop().await;
    }

    /// A packet read from the device.
    async fn outbound(&self, conn: &Connection, packet: Vec<u8>) {
        if let Some(names) = dns_names(&packet, false) {
            if conn.filter.match_any(&names).await {
                debug!(?names, "answering matched DNS request locally");
                conn.rewriter.resolve(packet, true);
                return;
            }
        }

        if let Err(e) = conn.session.send(&packet).await {
            warn!(error = %e, "tunnel send failed");
        }
    }

    /// A payload delivered by the tunnel.
    async fn inbound(&self, conn: &Connection, sink: &dyn PacketSink, payload: Vec<u8>) {
        if let Some(names) = dns_names(&payload, true) {
            if conn.filter.match_any(&names).await {
                debug!(?names, "re-resolving matched DNS response");
                conn.rewriter.resolve(payload, false);
                return;
            }
        }

        write(sink, &payload).await;
    }
}

async fn write(sink: &dyn PacketSink, packet: &[u8]) {
    if let Err(e) = sink.write_packet(packet).await {
        warn!(error = %e, "device write failed");
    }
}

/// Query names of a DNS request or response carried in `packet`.
fn dns_names(packet: &[u8], response: bool) -> Option<Vec<String>> {
    let dns = DnsPacket::parse(packet).ok().flatten()?;
    (dns.message.is_response() == response).then(|| dns.message.query_names())
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::net::UdpSocket;

    use super::*;
    use crate::config::TimingConfig;
    use crate::dns::tests::query_packet;
    use crate::filter::{RouteLog, RouteOp, route_all};
    use crate::protocol::Frame;
    use crate::resolver::UpstreamResolver;
    use crate::rewriter::QUEUE_CAPACITY;
    use crate::stats::NullStore;
    use crate::transport::MAX_DATAGRAM_SIZE;

    struct ChannelSource(mpsc::Receiver<Vec<u8>>);

    #[async_trait]
    impl PacketSource for ChannelSource {
        async fn read_packet(&mut self) -> io::Result<Vec<u8>> {
            self.0
                .recv()
                .await
                .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))
        }
    }

    struct ChannelSink(mpsc::Sender<Vec<u8>>);

    #[async_trait]
    impl PacketSink for ChannelSink {
        async fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
            self.0
                .send(packet.to_vec())
                .await
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
        }
    }

    struct FixedLookup;

    #[async_trait]
    impl Lookup for FixedLookup {
        async fn lookup_a(&self, _name: &str) -> Vec<Ipv4Addr> {
            vec![Ipv4Addr::new(5, 6, 7, 8)]
        }
    }

    /// Tunnel endpoint that accepts any client and echoes data back.
    async fn echo_server(config: &Config) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let wire = Wire::new(config.cipher(), config.cipher.length_prefixed);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                let Ok((len, client)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let reply = match wire.open_frames(&buf[..len]).pop() {
                    Some(Frame::ClientHandshake { .. }) => Frame::ServerHandshake {
                        tunnel_ip: Ipv4Addr::new(10, 0, 0, 2),
                        gateway: Ipv4Addr::new(10, 0, 0, 1),
                        data_port: None,
                    },
                    Some(Frame::ClientData { payload, .. }) => Frame::ServerData { payload },
                    _ => continue,
                };
                let _ = socket
                    .send_to(&wire.seal_frame(&reply).unwrap(), client)
                    .await;
            }
        });
        addr
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.auth.user = "alice".into();
        config.auth.secret = "secret".into();
        config.timing = TimingConfig::with_unit(Duration::from_millis(50));
        config.filter.domains = vec![r"(.*\.)?example\.com".into()];
        config
    }

    struct Harness {
        device_in: mpsc::Sender<Vec<u8>>,
        device_out: mpsc::Receiver<Vec<u8>>,
        log: Arc<RouteLog>,
        shutdown: CancellationToken,
        task: tokio::task::JoinHandle<Result<TrafficSnapshot, OrchestratorError>>,
    }

    async fn connect(config: Config) -> Harness {
        connect_with(config, Arc::new(FixedLookup)).await
    }

    async fn connect_with(mut config: Config, lookup: Arc<dyn Lookup>) -> Harness {
        let server = echo_server(&config).await;
        config.server.port = server.port();
        let log = Arc::new(RouteLog::new());
        let orchestrator = Orchestrator::new(config, log.clone(), lookup, Arc::new(NullStore));

        let (device_in, source) = mpsc::channel(16);
        let (sink, device_out) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            orchestrator
                .run(
                    Box::new(ChannelSource(source)),
                    Arc::new(ChannelSink(sink)),
                    token,
                )
                .await
        });

        Harness {
            device_in,
            device_out,
            log,
            shutdown,
            task,
        }
    }

    async fn next(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn unmatched_traffic_goes_through_tunnel() {
        let mut h = connect(config()).await;

        let packet = query_packet("rust-lang.org");
        h.device_in.send(packet.clone()).await.unwrap();

        assert_eq!(next(&mut h.device_out).await, packet);
        h.shutdown.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn matched_request_is_answered_locally_and_routed_direct() {
        let mut h = connect(config()).await;

        h.device_in.send(query_packet("www.example.com")).await.unwrap();
        let reply = DnsPacket::parse(&next(&mut h.device_out).await)
            .unwrap()
            .unwrap();

        assert!(reply.message.is_response());
        assert_eq!(reply.src.port(), 53);
        assert_eq!(
            reply.message.resolve_chain("www.example.com"),
            vec![Ipv4Addr::new(5, 6, 7, 8)]
        );
        assert!(
            h.log
                .ops()
                .contains(&RouteOp::AddDirect("5.6.7.8/32".parse().unwrap()))
        );
        h.shutdown.cancel();
        h.task.await.unwrap().unwrap();
    }

    struct StalledLookup;

    #[async_trait]
    impl Lookup for StalledLookup {
        async fn lookup_a(&self, _name: &str) -> Vec<Ipv4Addr> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn relay_keeps_flowing_while_lookups_back_up() {
        let mut h = connect_with(config(), Arc::new(StalledLookup)).await;

        for _ in 0..QUEUE_CAPACITY + 16 {
            h.device_in.send(query_packet("www.example.com")).await.unwrap();
        }
        let packet = query_packet("rust-lang.org");
        h.device_in.send(packet.clone()).await.unwrap();

        assert_eq!(next(&mut h.device_out).await, packet);
        h.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), h.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn lookups_go_to_the_directly_routed_dns_server() {
        let public_dns = Ipv4Addr::new(8, 8, 8, 8);
        let mut config = config();
        config.filter.direct_dns_server = public_dns;
        let resolver = UpstreamResolver::for_filter(&config.filter);
        assert_eq!(resolver.servers(), [SocketAddr::from((public_dns, 53))]);

        let mut h = connect(config).await;
        let packet = query_packet("rust-lang.org");
        h.device_in.send(packet.clone()).await.unwrap();
        next(&mut h.device_out).await;
        h.shutdown.cancel();
        h.task.await.unwrap().unwrap();

        let ops = h.log.ops();
        let dns_route = Ipv4Network::from(public_dns);
        assert!(ops.contains(&RouteOp::AddDirect(dns_route)));
        assert!(ops.contains(&RouteOp::RemoveDirect(dns_route)));
        assert!(!ops.iter().any(|op| matches!(
            op,
            RouteOp::AddDirect(net) if net.ip() == crate::filter::DEFAULT_DIRECT_DNS_SERVER
        )));
    }

    #[tokio::test]
    async fn shutdown_reverses_every_route() {
        let mut h = connect(config()).await;
        h.device_in.send(query_packet("example.com")).await.unwrap();
        next(&mut h.device_out).await;

        h.shutdown.cancel();
        h.task.await.unwrap().unwrap();

        let ops = h.log.ops();
        let server = "127.0.0.1/32".parse().unwrap();
        assert_eq!(ops[0], RouteOp::AddDirect(server));
        assert_eq!(ops[1], RouteOp::AddTunneled(route_all()));
        assert!(ops.contains(&RouteOp::RemoveTunneled(route_all())));
        assert!(ops.contains(&RouteOp::RemoveDirect("5.6.7.8/32".parse().unwrap())));
        assert_eq!(ops.last(), Some(&RouteOp::RemoveDirect(server)));
        let adds = ops
            .iter()
            .filter(|op| matches!(op, RouteOp::AddDirect(_) | RouteOp::AddTunneled(_)))
            .count();
        assert_eq!(adds * 2, ops.len());
    }

    #[tokio::test]
    async fn unreachable_server_fails_handshake() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut config = config();
        config.timing = TimingConfig::with_unit(Duration::from_millis(10));
        config.server.port = silent.local_addr().unwrap().port();
        let orchestrator = Orchestrator::new(
            config,
            Arc::new(RouteLog::new()),
            Arc::new(FixedLookup),
            Arc::new(NullStore),
        );
        let (_device_in, source) = mpsc::channel(1);
        let (sink, _device_out) = mpsc::channel(1);

        let err = orchestrator
            .run(
                Box::new(ChannelSource(source)),
                Arc::new(ChannelSink(sink)),
                CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            err,
            Err(OrchestratorError::Tunnel(TunnelError::HandshakeExhausted))
        ));
    }

    #[derive(Default)]
    struct MemoryStore(std::sync::Mutex<Vec<TrafficSnapshot>>);

    impl TrafficStore for MemoryStore {
        fn load(&self) -> TrafficSnapshot {
            TrafficSnapshot {
                rx_total: 700,
                tx_total: 300,
            }
        }

        fn save(&self, snapshot: TrafficSnapshot) {
            self.0.lock().unwrap().push(snapshot);
        }
    }

    #[test]
    fn totals_are_seeded_and_reset() {
        let store = Arc::new(MemoryStore::default());
        let orchestrator = Orchestrator::new(
            config(),
            Arc::new(RouteLog::new()),
            Arc::new(FixedLookup),
            store.clone(),
        );
        assert_eq!(orchestrator.meter().totals().rx_total, 700);

        orchestrator.reset_traffic();

        assert_eq!(orchestrator.meter().totals(), TrafficSnapshot::default());
        assert_eq!(*store.0.lock().unwrap(), vec![TrafficSnapshot::default()]);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_connecting() {
        let mut config = config();
        config.auth.secret.clear();
        let orchestrator = Orchestrator::new(
            config,
            Arc::new(RouteLog::new()),
            Arc::new(FixedLookup),
            Arc::new(NullStore),
        );
        let (_device_in, source) = mpsc::channel(1);
        let (sink, _device_out) = mpsc::channel(1);

        let err = orchestrator
            .run(
                Box::new(ChannelSource(source)),
                Arc::new(ChannelSink(sink)),
                CancellationToken::new(),
            )
            .await;

        assert!(matches!(err, Err(OrchestratorError::Config(_))));
    }
}
