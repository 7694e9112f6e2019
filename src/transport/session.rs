//! Client tunnel session.
//!
//! A session binds one UDP socket, handshakes with the remote endpoint and,
//! once connected, runs a receive worker and a traffic-tick worker until
//! stopped. Events and inbound payloads are delivered over channels.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{MAX_DATAGRAM_SIZE, TunnelError, Wire};
use crate::config::TimingConfig;
use crate::protocol::{Frame, Identification};
use crate::stats::{TrafficMeter, TrafficSnapshot, TrafficStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Handshaking,
    Connected,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected {
        tunnel_ip: Ipv4Addr,
        gateway: Ipv4Addr,
    },
    HandshakeFailed,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server: SocketAddr,
    pub identification: Identification,
    pub wire: Wire,
    pub timing: TimingConfig,
}

struct Shared {
    socket: UdpSocket,
    remote: RwLock<SocketAddr>,
    identification: Identification,
    wire: Wire,
    timing: TimingConfig,
    meter: Arc<TrafficMeter>,
    store: Arc<dyn TrafficStore>,
    state: watch::Sender<SessionState>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    flushed: AtomicBool,
}

impl Shared {
    fn remote(&self) -> SocketAddr {
        self.remote.read().map(|r| *r).unwrap_or_else(|e| *e.into_inner())
    }

    fn set_remote_port(&self, port: u16) {
        let mut remote = self.remote.write().unwrap_or_else(|e| e.into_inner());
        remote.set_port(port);
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
        debug!(?state, "session state");
    }
}

/// A running tunnel session.
pub struct TunnelSession {
    shared: Arc<Shared>,
}

impl TunnelSession {
    /// Bind the socket and start handshaking.
    ///
    /// Only the socket bind can fail here; everything after that is
    /// reported through `events`. Payloads of ServerData frames are sent to
    /// `inbound` once connected.
    pub async fn start(
        config: SessionConfig,
        meter: Arc<TrafficMeter>,
        store: Arc<dyn TrafficStore>,
        events: mpsc::Sender<SessionEvent>,
        inbound: mpsc::Sender<Vec<u8>>,
    ) -> Result<Self, TunnelError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let (state, _) = watch::channel(SessionState::Idle);

        let shared = Arc::new(Shared {
            socket,
            remote: RwLock::new(config.server),
            identification: config.identification,
            wire: config.wire,
            timing: config.timing,
            meter,
            store,
            state,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            flushed: AtomicBool::new(false),
        });

        shared.set_state(SessionState::Handshaking);
        shared
            .tracker
            .spawn(handshake(Arc::clone(&shared), events, inbound));

        Ok(Self { shared })
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Where data frames are sent. The port may change after the handshake.
    pub fn remote(&self) -> SocketAddr {
        self.shared.remote()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TunnelError> {
        Ok(self.shared.socket.local_addr()?)
    }

    pub fn meter(&self) -> &Arc<TrafficMeter> {
        &self.shared.meter
    }

    /// Cumulative totals as of the last tick.
    pub fn totals(&self) -> TrafficSnapshot {
        self.shared.meter.totals()
    }

    /// Wrap `payload` in a ClientData frame and send it to the remote.
    pub async fn send(&self, payload: &[u8]) -> Result<(), TunnelError> {
        if self.state() != SessionState::Connected {
            return Err(TunnelError::NotConnected);
        }

        let frame = Frame::ClientData {
            identification: self.shared.identification,
            payload: payload.to_vec(),
        };
        let datagram = self.shared.wire.seal_frame(&frame)?;
        self.shared
            .socket
            .send_to(&datagram, self.shared.remote())
            .await?;
        self.shared.meter.record_tx(payload.len());
        Ok(())
    }

    /// Stop every worker, wait for them to exit and flush the traffic totals.
    ///
    /// Safe to call more than once; only the first call flushes.
    pub async fn stop(&self) {
        self.shared.shutdown.cancel();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;

        if !self.shared.flushed.swap(true, Ordering::AcqRel) {
            self.shared.meter.tick();
            let totals = self.shared.meter.totals();
            persist(&self.shared.store, totals).await;
            self.shared.set_state(SessionState::Stopped);
            info!(
                rx_total = totals.rx_total,
                tx_total = totals.tx_total,
                "session stopped"
            );
        }
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn handshake(
    shared: Arc<Shared>,
    events: mpsc::Sender<SessionEvent>,
    inbound: mpsc::Sender<Vec<u8>>,
) {
    let hello = Frame::ClientHandshake {
        identification: shared.identification,
    };
    let request = match shared.wire.seal_frame(&hello) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "cannot encode handshake");
            fail(&shared, &events).await;
            return;
        }
    };

    let server = shared.remote();
    let timeout = shared.timing.handshake_timeout();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    for attempt in 1..=shared.timing.retry_budget {
        debug!(attempt, %server, "sending handshake");
        if let Err(e) = shared.socket.send_to(&request, server).await {
            warn!(error = %e, "handshake send failed");
            break;
        }

        let deadline = Instant::now() + timeout;
        loop {
            let received = tokio::select! {
                _ = shared.shutdown.cancelled() => return,
                r = tokio::time::timeout_at(deadline, shared.socket.recv_from(&mut buf)) => r,
            };
            let (len, from) = match received {
                Err(_) => break,
                Ok(Err(e)) => {
                    debug!(error = %e, "handshake recv failed");
                    continue;
                }
                Ok(Ok(r)) => r,
            };

            let reply = shared
                .wire
                .open_frames(&buf[..len])
                .into_iter()
                .find_map(|f| match f {
                    Frame::ServerHandshake {
                        tunnel_ip,
                        gateway,
                        data_port,
                    } => Some((tunnel_ip, gateway, data_port)),
                    other => {
                        debug!(tag = other.tag(), "ignoring frame while handshaking");
                        None
                    }
                });
            let Some((tunnel_ip, gateway, data_port)) = reply else {
                continue;
            };

            shared.set_remote_port(data_port.unwrap_or(from.port()));
            shared.set_state(SessionState::Connected);
            info!(%tunnel_ip, %gateway, remote = %shared.remote(), "handshake complete");

            shared.tracker.spawn(receive(Arc::clone(&shared), inbound));
            shared.tracker.spawn(account(Arc::clone(&shared)));
            let _ = events
                .send(SessionEvent::Connected { tunnel_ip, gateway })
                .await;
            return;
        }
    }

    warn!(attempts = shared.timing.retry_budget, "handshake failed");
    fail(&shared, &events).await;
}

async fn fail(shared: &Shared, events: &mpsc::Sender<SessionEvent>) {
    shared.set_state(SessionState::Failed);
    let _ = events.send(SessionEvent::HandshakeFailed).await;
}

async fn receive(shared: Arc<Shared>, inbound: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let len = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            r = shared.socket.recv_from(&mut buf) => match r {
                Ok((len, _)) => len,
                Err(e) => {
                    debug!(error = %e, "tunnel recv failed");
                    continue;
                }
            },
        };

        for frame in shared.wire.open_frames(&buf[..len]) {
            let Frame::ServerData { payload } = frame else {
                debug!(tag = frame.tag(), "dropping unexpected frame");
                continue;
            };
            shared.meter.record_rx(payload.len());
            tokio::select! {
                _ = shared.shutdown.cancelled() => return,
                sent = inbound.send(payload) => {
                    if sent.is_err() {
                        debug!("inbound receiver gone");
                    }
                }
            }
        }
    }
    debug!("receive worker stopped");
}

async fn account(shared: Arc<Shared>) {
    let unit = shared.timing.unit();
    let mut interval = tokio::time::interval_at(Instant::now() + unit, unit);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks: u32 = 0;

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = interval.tick() => {
                shared.meter.tick();
                ticks += 1;
                if ticks >= shared.timing.persist_every_ticks {
                    ticks = 0;
                    let totals = shared.meter.totals();
                    persist(&shared.store, totals).await;
                    debug!(
                        rx_total = totals.rx_total,
                        tx_total = totals.tx_total,
                        "traffic persisted"
                    );
                }
            }
        }
    }
    debug!("accounting worker stopped");
}

/// Save `totals` on the blocking pool; stores may touch the filesystem.
async fn persist(store: &Arc<dyn TrafficStore>, totals: TrafficSnapshot) {
    let store = Arc::clone(store);
    if let Err(e) = tokio::task::spawn_blocking(move || store.save(totals)).await {
        warn!(error = %e, "traffic persist task failed");
    }
}
