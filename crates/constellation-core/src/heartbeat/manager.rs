//! Heartbeat manager: one sender, one receiver and the liveness watchdog
//! that turns silent or failing peers into an interrupt.

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use constellation_protocol::chirp::ServiceIdentifier;
use constellation_protocol::{ChpMessage, State};

use crate::chirp::ChirpManager;
use crate::util::lock;

use super::recv::HeartbeatRecv;
use super::send::{HeartbeatSend, StateReader};

/// Watchdog sweep cadence.
const WATCHDOG_TICK: Duration = Duration::from_millis(50);

/// Invoked when the constellation degrades: a peer ran out of lives,
/// reported ERROR, or the healthy fraction fell below the threshold.
pub type InterruptCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Base beat interval; the effective interval adapts to fan-out.
    pub interval: Duration,
    pub max_interval: Duration,
    /// Missed intervals a peer survives before it is declared dead.
    pub lives: u32,
    /// Minimum fraction of tracked peers that must be alive and non-ERROR.
    pub alive_fraction: f64,
    pub bind_address: Ipv4Addr,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            lives: 3,
            alive_fraction: 0.5,
            bind_address: Ipv4Addr::UNSPECIFIED,
        }
    }
}

struct Remote {
    interval: Duration,
    last_heartbeat: Instant,
    last_state: State,
    lives: u32,
}

struct Liveness {
    remotes: Mutex<HashMap<String, Remote>>,
    interrupt: Mutex<Option<InterruptCallback>>,
    lives: u32,
    alive_fraction: f64,
    fraction_low: AtomicBool,
}

impl Liveness {
    fn fire_interrupt(&self, reason: &str) {
        warn!(reason, "constellation degraded, requesting interrupt");
        let callback = lock(&self.interrupt).clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Registered as the receiver sink: refresh the remote entry and react
    /// to a peer entering ERROR.
    fn process_heartbeat(&self, msg: ChpMessage) {
        debug!(
            sender = %msg.sender,
            state = %msg.state,
            interval_ms = msg.interval.as_millis() as u64,
            "heartbeat received"
        );

        let entered_error = {
            let mut remotes = lock(&self.remotes);
            let prior = remotes.get(&msg.sender).map(|remote| remote.last_state);
            remotes.insert(
                msg.sender.clone(),
                Remote {
                    interval: msg.interval,
                    last_heartbeat: Instant::now(),
                    last_state: msg.state,
                    lives: self.lives,
                },
            );
            msg.state == State::Error && prior != Some(State::Error)
        };

        if entered_error {
            self.fire_interrupt("remote reports ERROR state");
        }
    }

    /// One watchdog sweep: debit lives for overdue peers and check the
    /// healthy fraction.
    fn sweep(&self) {
        let mut newly_dead = Vec::new();
        let (tracked, healthy) = {
            let mut remotes = lock(&self.remotes);
            for (name, remote) in remotes.iter_mut() {
                if remote.lives > 0 && remote.last_heartbeat.elapsed() > remote.interval {
                    remote.lives -= 1;
                    remote.last_heartbeat = Instant::now();
                    debug!(peer = %name, lives = remote.lives, "missed heartbeat");
                    if remote.lives == 0 {
                        newly_dead.push(name.clone());
                    }
                }
            }
            let healthy = remotes
                .values()
                .filter(|remote| remote.lives > 0 && remote.last_state != State::Error)
                .count();
            (remotes.len(), healthy)
        };

        for name in newly_dead {
            warn!(peer = %name, "no lives left");
            self.fire_interrupt("remote stopped sending heartbeats");
        }

        if tracked > 0 {
            let fraction = healthy as f64 / tracked as f64;
            if fraction < self.alive_fraction {
                if !self.fraction_low.swap(true, Ordering::SeqCst) {
                    self.fire_interrupt("healthy peer fraction below threshold");
                }
            } else {
                self.fraction_low.store(false, Ordering::SeqCst);
            }
        }
    }
}

pub struct HeartbeatManager {
    chirp: Arc<ChirpManager>,
    send: HeartbeatSend,
    recv: HeartbeatRecv,
    liveness: Arc<Liveness>,
    cancel: CancellationToken,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatManager {
    /// Build sender, receiver and watchdog. `state_reader` supplies the
    /// state carried in outgoing beats; nothing runs until
    /// [`HeartbeatManager::start`].
    pub fn new(
        sender_name: impl Into<String>,
        chirp: Arc<ChirpManager>,
        state_reader: StateReader,
        config: HeartbeatConfig,
    ) -> io::Result<Self> {
        let liveness = Arc::new(Liveness {
            remotes: Mutex::new(HashMap::new()),
            interrupt: Mutex::new(None),
            lives: config.lives,
            alive_fraction: config.alive_fraction,
            fraction_low: AtomicBool::new(false),
        });

        let send = HeartbeatSend::new(
            sender_name,
            config.bind_address,
            config.interval,
            config.max_interval,
            state_reader,
        )?;

        let sink = {
            let liveness = Arc::clone(&liveness);
            Arc::new(move |msg: ChpMessage| liveness.process_heartbeat(msg))
        };
        let recv = HeartbeatRecv::new(Arc::clone(&chirp), sink);

        Ok(HeartbeatManager {
            chirp,
            send,
            recv,
            liveness,
            cancel: CancellationToken::new(),
            watchdog: Mutex::new(None),
        })
    }

    /// Advertise the sender, subscribe to peers and start the watchdog.
    pub async fn start(&self) -> io::Result<()> {
        self.chirp
            .register_service(ServiceIdentifier::Heartbeat, self.send.port())
            .await?;
        self.send.start();
        self.recv.start().await;

        let liveness = Arc::clone(&self.liveness);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(WATCHDOG_TICK) => {}
                }
                liveness.sweep();
            }
        });
        *lock(&self.watchdog) = Some(handle);
        Ok(())
    }

    /// Port of the publishing socket.
    pub fn port(&self) -> u16 {
        self.send.port()
    }

    /// Called on every FSM state change: emits an extrasystole carrying the
    /// new state before the next scheduled beat.
    pub fn extrasystole(&self) {
        self.send.extrasystole();
    }

    pub fn set_interrupt_callback(&self, callback: InterruptCallback) {
        *lock(&self.liveness.interrupt) = Some(callback);
    }

    /// Last state reported by a remote, if it is tracked.
    pub fn remote_state(&self, remote: &str) -> Option<State> {
        lock(&self.liveness.remotes)
            .get(remote)
            .map(|entry| entry.last_state)
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = lock(&self.watchdog).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.recv.shutdown();
        self.send.shutdown();
        if let Err(err) = self
            .chirp
            .unregister_service(ServiceIdentifier::Heartbeat, self.send.port())
            .await
        {
            warn!(error = %err, "failed to withdraw heartbeat service");
        }
    }
}
