//! Heartbeat publisher: periodic beats plus extrasystoles on state change.
//!
//! Subscribers connect over TCP and send one subscription message whose
//! frames are topic prefixes (an empty prefix matches everything). Each
//! beat goes out as `[topic, payload]` to every matching subscriber.

use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use constellation_protocol::chp::{ChpMessage, HEARTBEAT_TOPIC};
use constellation_protocol::State;

use crate::transport;
use crate::util::lock;

/// How long a new subscriber gets to send its subscription message.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Queued beats per subscriber before it is considered stuck.
const SUBSCRIBER_QUEUE: usize = 16;

/// Reads the node's current lifecycle state for inclusion in each beat.
pub type StateReader = Arc<dyn Fn() -> State + Send + Sync>;

struct Subscriber {
    id: u64,
    prefixes: Vec<String>,
    tx: mpsc::Sender<Vec<Vec<u8>>>,
}

pub struct HeartbeatSend {
    sender_name: String,
    port: u16,
    base_interval: Duration,
    max_interval: Duration,
    state_reader: StateReader,
    listener: Mutex<Option<TcpListener>>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    beat_now: Arc<Notify>,
    cancel: CancellationToken,
}

impl HeartbeatSend {
    /// Bind the publishing socket on an ephemeral port. Must be called from
    /// within a tokio runtime; emission starts with [`HeartbeatSend::start`].
    pub fn new(
        sender_name: impl Into<String>,
        bind_address: Ipv4Addr,
        base_interval: Duration,
        max_interval: Duration,
        state_reader: StateReader,
    ) -> io::Result<Self> {
        let listener = std::net::TcpListener::bind((bind_address, 0))?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let port = listener.local_addr()?.port();

        Ok(HeartbeatSend {
            sender_name: sender_name.into(),
            port,
            base_interval,
            max_interval,
            state_reader,
            listener: Mutex::new(Some(listener)),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            beat_now: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Ephemeral port the publisher is bound to, advertised via CHIRP.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Emit an unscheduled beat immediately and restart the periodic timer.
    pub fn extrasystole(&self) {
        self.beat_now.notify_one();
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Spawn the accept loop and the beat loop.
    pub fn start(&self) {
        let Some(listener) = lock(&self.listener).take() else {
            return;
        };

        let subscribers = Arc::clone(&self.subscribers);
        let accept_cancel = self.cancel.clone();
        tokio::spawn(accept_loop(
            listener,
            subscribers,
            Arc::clone(&self.beat_now),
            accept_cancel,
        ));

        let subscribers = Arc::clone(&self.subscribers);
        let beat_now = Arc::clone(&self.beat_now);
        let cancel = self.cancel.clone();
        let sender_name = self.sender_name.clone();
        let state_reader = Arc::clone(&self.state_reader);
        let base = self.base_interval;
        let max = self.max_interval;

        tokio::spawn(async move {
            loop {
                let interval = effective_interval(base, max, lock(&subscribers).len());
                let beat = ChpMessage::new(sender_name.clone(), state_reader(), interval);
                publish(&subscribers, &beat);

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = beat_now.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// The advertised interval grows with fan-out so that aggregate beat
/// traffic stays bounded, up to the configured maximum.
fn effective_interval(base: Duration, max: Duration, subscribers: usize) -> Duration {
    let scaled = base.saturating_mul(1 + subscribers as u32 / 10);
    scaled.min(max)
}

fn publish(subscribers: &Arc<Mutex<Vec<Subscriber>>>, beat: &ChpMessage) {
    let frames = vec![HEARTBEAT_TOPIC.as_bytes().to_vec(), beat.assemble()];
    let targets: Vec<mpsc::Sender<Vec<Vec<u8>>>> = lock(subscribers)
        .iter()
        .filter(|subscriber| {
            subscriber
                .prefixes
                .iter()
                .any(|prefix| HEARTBEAT_TOPIC.starts_with(prefix.as_str()))
        })
        .map(|subscriber| subscriber.tx.clone())
        .collect();

    trace!(state = %beat.state, subscribers = targets.len(), "publishing beat");
    for tx in targets {
        // a full queue means the writer task is stuck; skipping keeps the
        // beat loop non-blocking
        let _ = tx.try_send(frames.clone());
    }
}

async fn accept_loop(
    listener: TcpListener,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    beat_now: Arc<Notify>,
    cancel: CancellationToken,
) {
    let next_id = Arc::new(AtomicU64::new(0));
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "heartbeat accept failed");
                continue;
            }
        };
        debug!(%peer, "heartbeat subscriber connecting");
        tokio::spawn(handle_subscriber(
            stream,
            Arc::clone(&subscribers),
            Arc::clone(&next_id),
            Arc::clone(&beat_now),
            cancel.clone(),
        ));
    }
}

async fn handle_subscriber(
    mut stream: TcpStream,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    next_id: Arc<AtomicU64>,
    beat_now: Arc<Notify>,
    cancel: CancellationToken,
) {
    // first message carries the topic prefixes
    let frames = match tokio::time::timeout(SUBSCRIBE_TIMEOUT, transport::read_message(&mut stream))
        .await
    {
        Ok(Ok(frames)) => frames,
        Ok(Err(err)) => {
            debug!(error = %err, "subscriber handshake failed");
            return;
        }
        Err(_elapsed) => {
            debug!("subscriber handshake timed out");
            return;
        }
    };
    let prefixes: Vec<String> = frames
        .into_iter()
        .map(|frame| String::from_utf8_lossy(&frame).into_owned())
        .collect();

    let id = next_id.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::channel::<Vec<Vec<u8>>>(SUBSCRIBER_QUEUE);
    lock(&subscribers).push(Subscriber { id, prefixes, tx });
    // nudge the beat loop so the new subscriber learns our state right away
    beat_now.notify_one();

    // writer task: forward queued beats until the peer goes away
    loop {
        let frames = tokio::select! {
            _ = cancel.cancelled() => break,
            frames = rx.recv() => frames,
        };
        let Some(frames) = frames else { break };
        if let Err(err) = transport::write_message(&mut stream, &frames).await {
            debug!(error = %err, "heartbeat subscriber dropped");
            break;
        }
    }
    lock(&subscribers).retain(|subscriber| subscriber.id != id);
}
