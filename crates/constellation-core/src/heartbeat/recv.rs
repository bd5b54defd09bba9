//! Heartbeat receiver: follows CHIRP discovery of HEARTBEAT services and
//! funnels every decoded beat into a sink callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use constellation_protocol::chirp::ServiceIdentifier;
use constellation_protocol::{ChpMessage, Md5Hash};

use crate::chirp::{ChirpManager, DiscoverCallback, DiscoveredService};
use crate::transport;
use crate::util::lock;

/// Sink receiving every beat from every subscribed peer.
pub type MessageSink = Arc<dyn Fn(ChpMessage) + Send + Sync>;

type ServiceKey = (Md5Hash, ServiceIdentifier, u16);

fn key(service: &DiscoveredService) -> ServiceKey {
    (service.host_id, service.identifier, service.port)
}

struct RecvShared {
    sink: MessageSink,
    connections: Mutex<HashMap<ServiceKey, CancellationToken>>,
    cancel: CancellationToken,
}

pub struct HeartbeatRecv {
    chirp: Arc<ChirpManager>,
    shared: Arc<RecvShared>,
    callback: Mutex<Option<DiscoverCallback>>,
}

impl HeartbeatRecv {
    pub fn new(chirp: Arc<ChirpManager>, sink: MessageSink) -> Self {
        HeartbeatRecv {
            chirp,
            shared: Arc::new(RecvShared {
                sink,
                connections: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
            }),
            callback: Mutex::new(None),
        }
    }

    /// Register the discovery callback and ask for OFFER replays from
    /// already-running peers.
    pub async fn start(&self) {
        let shared = Arc::clone(&self.shared);
        let callback: DiscoverCallback = Arc::new(move |service, depart| {
            if depart {
                shared.disconnect(&service);
            } else {
                RecvShared::connect(Arc::clone(&shared), service);
            }
        });
        self.chirp
            .register_discover_callback(Arc::clone(&callback), ServiceIdentifier::Heartbeat);
        *lock(&self.callback) = Some(callback);

        if let Err(err) = self.chirp.send_request(ServiceIdentifier::Heartbeat).await {
            warn!(error = %err, "failed to request heartbeat services");
        }
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.shared.connections).len()
    }

    /// Unregister from discovery and drop all peer subscriptions.
    pub fn shutdown(&self) {
        if let Some(callback) = lock(&self.callback).take() {
            self.chirp
                .unregister_discover_callback(&callback, ServiceIdentifier::Heartbeat);
        }
        self.shared.cancel.cancel();
        lock(&self.shared.connections).clear();
    }
}

impl RecvShared {
    /// Subscribe to a discovered peer. Registration is all-or-nothing: the
    /// connection map gains an entry only once the stream is connected and
    /// subscribed, so a failure leaves no trace.
    fn connect(shared: Arc<RecvShared>, service: DiscoveredService) {
        tokio::spawn(async move {
            let addr = service.socket_addr();
            let mut stream = match TcpStream::connect(addr).await {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(%addr, error = %err, "heartbeat connect failed");
                    return;
                }
            };
            // subscribe to all topics
            if let Err(err) = transport::write_message(&mut stream, &[Vec::new()]).await {
                debug!(%addr, error = %err, "heartbeat subscribe failed");
                return;
            }

            let token = shared.cancel.child_token();
            {
                let mut connections = lock(&shared.connections);
                if connections.contains_key(&key(&service)) {
                    return;
                }
                connections.insert(key(&service), token.clone());
            }
            debug!(%addr, "subscribed to heartbeat service");

            loop {
                let received = tokio::select! {
                    _ = token.cancelled() => break,
                    received = transport::read_message(&mut stream) => received,
                };
                let frames = match received {
                    Ok(frames) => frames,
                    Err(err) => {
                        debug!(%addr, error = %err, "heartbeat stream closed");
                        break;
                    }
                };
                if frames.len() != 2 {
                    warn!(%addr, frames = frames.len(), "unexpected heartbeat framing");
                    continue;
                }
                match ChpMessage::disassemble(&frames[1]) {
                    Ok(msg) => (shared.sink)(msg),
                    Err(err) => warn!(%addr, error = %err, "dropping malformed heartbeat"),
                }
            }

            lock(&shared.connections).remove(&key(&service));
        });
    }

    fn disconnect(&self, service: &DiscoveredService) {
        if let Some(token) = lock(&self.connections).remove(&key(service)) {
            debug!(address = %service.address, port = service.port, "unsubscribing from heartbeat service");
            token.cancel();
        }
    }
}
