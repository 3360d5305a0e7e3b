//! Inbound side of the Raft transport.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prost::Message as _;
use raft::eraftpb::Message;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{RaftHandler, CLUSTER_HEADER, RAFT_PATH};
use crate::error::{RaftError, RaftResult};

/// HTTP server receiving Raft messages from peers.
///
/// `start` binds the listener and spawns the accept loop; `stop` closes the
/// stop channel, which unblocks the accept loop, and then waits for the
/// loop to finish.
pub struct RaftServer {
    addr: SocketAddr,
    cluster_id: u64,
    handler: Arc<dyn RaftHandler>,
    stop_tx: Option<oneshot::Sender<()>>,
    serve_handle: Option<JoinHandle<()>>,
}

impl RaftServer {
    /// Create a server for `addr`.
    pub fn new(addr: SocketAddr, cluster_id: u64, handler: Arc<dyn RaftHandler>) -> Self {
        RaftServer {
            addr,
            cluster_id,
            handler,
            stop_tx: None,
            serve_handle: None,
        }
    }

    /// Bind and start serving.
    pub async fn start(&mut self) -> RaftResult<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| RaftError::Config(format!("cannot bind raft transport {}: {e}", self.addr)))?;

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let handler = Arc::clone(&self.handler);
        let cluster_id = self.cluster_id;
        let addr = self.addr;

        let handle = tokio::spawn(async move {
            info!(%addr, "raft transport listening");
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, remote) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(error = %e, "raft transport accept failed");
                                continue;
                            }
                        };
                        let io = TokioIo::new(stream);
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let handler = Arc::clone(&handler);
                                async move { route(req, handler, cluster_id).await }
                            });
                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                if !e.is_incomplete_message() {
                                    debug!(%remote, error = %e, "raft transport connection error");
                                }
                            }
                        });
                    }
                    _ = &mut stop_rx => {
                        info!(%addr, "raft transport stopped");
                        break;
                    }
                }
            }
        });

        self.stop_tx = Some(stop_tx);
        self.serve_handle = Some(handle);
        Ok(())
    }

    /// Unblock the accept loop and wait for it to exit.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.serve_handle.take() {
            let _ = handle.await;
        }
    }
}

async fn route(
    req: Request<Incoming>,
    handler: Arc<dyn RaftHandler>,
    cluster_id: u64,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    if req.method() != Method::POST || req.uri().path() != RAFT_PATH {
        return Ok(status(StatusCode::NOT_FOUND, "not found"));
    }

    let claimed_cluster = req
        .headers()
        .get(CLUSTER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if claimed_cluster != Some(cluster_id) {
        return Ok(status(StatusCode::FORBIDDEN, "wrong cluster"));
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "failed reading raft message body");
            return Ok(status(StatusCode::BAD_REQUEST, "bad body"));
        }
    };

    let message = match Message::decode(body.as_ref()) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "undecodable raft message");
            return Ok(status(StatusCode::BAD_REQUEST, "bad message"));
        }
    };

    if handler.is_id_removed(message.from) {
        debug!(from = message.from, "rejecting traffic from removed peer");
        return Ok(status(StatusCode::FORBIDDEN, "removed peer"));
    }

    match handler.deliver(message) {
        Ok(()) => Ok(status(StatusCode::OK, "ok")),
        Err(_) => Ok(status(StatusCode::SERVICE_UNAVAILABLE, "node stopped")),
    }
}

fn status(code: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *resp.status_mut() = code;
    resp
}
