//! DNS re-resolution worker.
//!
//! Packets are processed one at a time in arrival order so that the route
//! changes triggered by their answers reach the filter in a fixed order.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::dns::{self, AnswerMap, DnsError};
use crate::filter::FilterHandle;
use crate::resolver::Lookup;

pub const QUEUE_CAPACITY: usize = 1024;

struct Job {
    packet: Vec<u8>,
    spoof_as_reply: bool,
}

/// Handle to the rewriter worker.
pub struct DnsRewriter {
    queue: mpsc::Sender<Job>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl DnsRewriter {
    /// Start the worker. Rewritten packets are sent to `output`.
    pub fn spawn(
        lookup: Arc<dyn Lookup>,
        filter: FilterHandle,
        output: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        let (queue, rx) = mpsc::channel(QUEUE_CAPACITY);
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(run(rx, lookup, filter, output, shutdown.clone()));

        Self {
            queue,
            shutdown,
            tracker,
        }
    }

    /// Queue `packet` for re-resolution without waiting.
    ///
    /// `spoof_as_reply` is set for intercepted requests, which are answered
    /// in place, and cleared for responses relayed from upstream. Returns
    /// false if the packet was dropped because the queue is full or the
    /// worker has stopped.
    pub fn resolve(&self, packet: Vec<u8>, spoof_as_reply: bool) -> bool {
        let job = Job {
            packet,
            spoof_as_reply,
        };
        match self.queue.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("rewriter queue full, dropping DNS packet");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Stop the worker and wait for it to exit. Queued packets are discarded.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn run(
    mut rx: mpsc::Receiver<Job>,
    lookup: Arc<dyn Lookup>,
    filter: FilterHandle,
    output: mpsc::Sender<Vec<u8>>,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let rewritten = tokio::select! {
            _ = shutdown.cancelled() => break,
            r = rewrite(&job, lookup.as_ref(), &filter) => r,
        };
        match rewritten {
            Ok(packet) => {
                if output.send(packet).await.is_err() {
                    debug!("rewriter output closed");
                    break;
                }
            }
            Err(e) => warn!(error = %e, "dropping unresolvable DNS packet"),
        }
    }
    debug!("rewriter stopped");
}

async fn rewrite(
    job: &Job,
    lookup: &dyn Lookup,
    filter: &FilterHandle,
) -> Result<Vec<u8>, DnsError> {
    let names = dns::extract_query_names(&job.packet)?;

    let mut answers = AnswerMap::default();
    let mut resolved = Vec::new();
    for name in names {
        if answers.contains_key(&name) {
            continue;
        }
        let addrs = lookup.lookup_a(&name).await;
        debug!(name = %name, count = addrs.len(), "resolved");
        resolved.extend(addrs.iter().copied());
        answers.insert(name, addrs);
    }

    let packet = dns::rewrite_with_fresh_answers(&job.packet, &answers, job.spoof_as_reply)?;
    for ip in resolved {
        filter.note_resolved_ip(ip).await;
    }
    Ok(packet)
}
