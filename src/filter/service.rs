//! Single-owner task around [`FilterEngine`].
//!
//! The rewriter worker, the orchestrator and the shutdown path all reach
//! the engine concurrently, so it lives in one task and is driven through
//! a command channel.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{FilterEngine, FilterError, FilterMode};

const COMMAND_CAPACITY: usize = 256;

enum Command {
    Init {
        mode: FilterMode,
        patterns: Vec<String>,
        cidrs: Vec<Ipv4Network>,
        reply: oneshot::Sender<Result<(), FilterError>>,
    },
    Uninit {
        reply: oneshot::Sender<()>,
    },
    MatchDomain {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    NoteResolvedIp {
        ip: Ipv4Addr,
        reply: oneshot::Sender<bool>,
    },
    ActiveRoutes {
        reply: oneshot::Sender<Vec<Ipv4Network>>,
    },
    Shutdown,
}

/// Owns the engine task.
pub struct FilterService {
    handle: FilterHandle,
    task: JoinHandle<()>,
}

impl FilterService {
    /// Move `engine` into its own task.
    pub fn spawn(engine: FilterEngine) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let task = tokio::spawn(run(engine, rx));
        Self {
            handle: FilterHandle { tx },
            task,
        }
    }

    pub fn handle(&self) -> FilterHandle {
        self.handle.clone()
    }

    /// Uninitialize the engine and wait for its task to exit.
    ///
    /// Handles still held elsewhere see a closed service afterwards.
    pub async fn shutdown(self) {
        let _ = self.handle.tx.send(Command::Shutdown).await;
        let _ = self.task.await;
    }
}

async fn run(mut engine: FilterEngine, mut rx: mpsc::Receiver<Command>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Init {
                mode,
                patterns,
                cidrs,
                reply,
            } => {
                let _ = reply.send(engine.init(mode, &patterns, &cidrs));
            }
            Command::Uninit { reply } => {
                engine.uninit();
                let _ = reply.send(());
            }
            Command::MatchDomain { name, reply } => {
                let _ = reply.send(engine.match_domain(&name));
            }
            Command::NoteResolvedIp { ip, reply } => {
                let _ = reply.send(engine.note_resolved_ip(ip));
            }
            Command::ActiveRoutes { reply } => {
                let _ = reply.send(engine.active_routes());
            }
            Command::Shutdown => break,
        }
    }

    engine.uninit();
    debug!("filter service stopped");
}

/// Cheap cloneable access to the filter task.
///
/// Once the task is gone every query answers as an inactive engine would.
#[derive(Clone)]
pub struct FilterHandle {
    tx: mpsc::Sender<Command>,
}

impl FilterHandle {
    pub async fn init(
        &self,
        mode: FilterMode,
        patterns: Vec<String>,
        cidrs: Vec<Ipv4Network>,
    ) -> Result<(), FilterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Init {
                mode,
                patterns,
                cidrs,
                reply,
            })
            .await
            .map_err(|_| FilterError::Closed)?;
        rx.await.map_err(|_| FilterError::Closed)?
    }

    pub async fn uninit(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Uninit { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn match_domain(&self, name: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::MatchDomain {
            name: name.to_string(),
            reply,
        };
        self.request(cmd, rx).await.unwrap_or(false)
    }

    /// Check if any of `names` matches.
    pub async fn match_any(&self, names: &[String]) -> bool {
        for name in names {
            if self.match_domain(name).await {
                return true;
            }
        }
        false
    }

    /// Returns true if the address was newly routed.
    pub async fn note_resolved_ip(&self, ip: Ipv4Addr) -> bool {
        let (reply, rx) = oneshot::channel();
        self.request(Command::NoteResolvedIp { ip, reply }, rx)
            .await
            .unwrap_or(false)
    }

    pub async fn active_routes(&self) -> Vec<Ipv4Network> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::ActiveRoutes { reply }, rx)
            .await
            .unwrap_or_default()
    }

    async fn request<T>(&self, cmd: Command, rx: oneshot::Receiver<T>) -> Option<T> {
        self.tx.send(cmd).await.ok()?;
        rx.await.ok()
    }
}
