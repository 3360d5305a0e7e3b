//! Outbound side of the Raft transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use prost::Message as _;
use raft::eraftpb::{Message, MessageType};
use raft::SnapshotStatus;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::CLUSTER_HEADER;
use crate::error::{RaftError, RaftResult};

/// Feedback from the transport to the Raft driver.
#[derive(Debug)]
pub enum TransportEvent {
    /// A peer could not be reached.
    Unreachable(u64),
    /// The outcome of shipping a snapshot message.
    SnapshotStatus(u64, SnapshotStatus),
}

struct Inner {
    http: reqwest::Client,
    cluster_id: u64,
    urls: RwLock<HashMap<u64, String>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

/// Sends Raft messages to peers over HTTP.
///
/// Holds the peer URL table. Messages are shipped concurrently across
/// destinations but in order per destination; failures are reported back to
/// the driver as [`TransportEvent`]s rather than handled here, since peer
/// liveness is Raft's call.
#[derive(Clone)]
pub struct RaftTransport {
    inner: Arc<Inner>,
}

impl RaftTransport {
    /// Create a transport reporting into `events`.
    pub fn new(
        cluster_id: u64,
        timeout: Duration,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> RaftResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RaftError::Config(format!("http client: {e}")))?;
        Ok(RaftTransport {
            inner: Arc::new(Inner {
                http,
                cluster_id,
                urls: RwLock::new(HashMap::new()),
                events,
            }),
        })
    }

    /// Register the transport URL for a peer.
    pub fn add_peer(&self, raft_id: u64, url: String) {
        self.inner.urls.write().insert(raft_id, url);
    }

    /// Drop a peer's transport URL.
    pub fn remove_peer(&self, raft_id: u64) {
        self.inner.urls.write().remove(&raft_id);
    }

    /// Ship a Ready batch's messages.
    pub fn send(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }

        let mut by_peer: HashMap<u64, Vec<Message>> = HashMap::new();
        for message in messages {
            by_peer.entry(message.to).or_default().push(message);
        }

        for (to, batch) in by_peer {
            let url = match self.inner.urls.read().get(&to) {
                Some(url) => format!("{url}{}", super::RAFT_PATH),
                None => {
                    debug!(to, "no transport url for peer, dropping messages");
                    continue;
                }
            };
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                for message in batch {
                    let is_snapshot = message.msg_type() == MessageType::MsgSnapshot;
                    let body = message.encode_to_vec();
                    let result = inner
                        .http
                        .post(&url)
                        .header(CLUSTER_HEADER, inner.cluster_id)
                        .body(body)
                        .send()
                        .await;

                    let delivered = match result {
                        Ok(resp) if resp.status().is_success() => true,
                        Ok(resp) => {
                            debug!(to, status = %resp.status(), "peer rejected raft message");
                            false
                        }
                        Err(e) => {
                            debug!(to, error = %e, "failed to reach peer");
                            false
                        }
                    };

                    if is_snapshot {
                        let status = if delivered {
                            SnapshotStatus::Finish
                        } else {
                            SnapshotStatus::Failure
                        };
                        let _ = inner.events.send(TransportEvent::SnapshotStatus(to, status));
                    }

                    if !delivered {
                        warn!(to, "peer is currently unreachable");
                        let _ = inner.events.send(TransportEvent::Unreachable(to));
                        // The rest of this batch would land out of order at
                        // best; let Raft retransmit.
                        break;
                    }
                }
            });
        }
    }
}
