//! The satellite: user hooks, shared node context and the CSCP command
//! loop that drives the lifecycle machine.

mod commands;
mod fsm;

pub use commands::{CommandError, CommandRegistry, UserCommandHandler};
pub use fsm::{Fsm, StateCallback};

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use constellation_protocol::chirp::ServiceIdentifier;
use constellation_protocol::config::{Group, Usage};
use constellation_protocol::cscp::{CscpMessage, CscpType};
use constellation_protocol::{Configuration, Dictionary, List, State, TransitionCommand};

use crate::chirp::ChirpManager;
use crate::heartbeat::{HeartbeatConfig, HeartbeatManager};
use crate::transport;
use crate::util::lock;

/// User hooks called by the lifecycle machine. Transition routines run on
/// workers and report failure by returning an error, which moves the
/// machine to ERROR.
pub trait Satellite: Send + 'static {
    /// Whether the `reconfigure` verb is implemented.
    fn supports_reconfigure(&self) -> bool {
        false
    }

    fn initializing(&mut self, _config: &mut Configuration) -> anyhow::Result<()> {
        Ok(())
    }

    fn launching(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn landing(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn reconfiguring(&mut self, _partial: &Configuration) -> anyhow::Result<()> {
        Ok(())
    }

    fn starting(&mut self, _run_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn stopping(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// The RUN routine. Runs on its own worker; must honor the token.
    /// Returning early is allowed, the satellite stays in RUN until `stop`.
    fn running(&mut self, _token: &CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called on the way to SAFE. Best-effort, must not fail.
    fn interrupting(&mut self, _previous: State) {}

    /// Called after the machine moved to ERROR. Best-effort.
    fn on_failure(&mut self, _previous: State) {}
}

/// State shared between the FSM, its workers and the command loop.
pub struct SatelliteContext {
    config: Mutex<Configuration>,
    run_id: Mutex<String>,
    status: Mutex<String>,
}

impl SatelliteContext {
    fn new() -> Arc<Self> {
        Arc::new(SatelliteContext {
            config: Mutex::new(Configuration::default()),
            run_id: Mutex::new(String::new()),
            status: Mutex::new("satellite created".to_owned()),
        })
    }

    pub fn status(&self) -> String {
        lock(&self.status).clone()
    }

    pub(crate) fn set_status(&self, status: String) {
        *lock(&self.status) = status;
    }

    /// Run identifier of the current acquisition, empty before the first
    /// `start`.
    pub fn run_id(&self) -> String {
        lock(&self.run_id).clone()
    }

    pub(crate) fn set_run_id(&self, run_id: String) {
        *lock(&self.run_id) = run_id;
    }

    pub(crate) fn store_config(&self, config: Configuration) {
        *lock(&self.config) = config;
    }

    pub(crate) fn update_config(&self, partial: &Configuration) {
        lock(&self.config).update(partial);
    }

    pub fn config_dictionary(&self, group: Group, usage: Usage) -> Dictionary {
        lock(&self.config).dictionary(group, usage)
    }
}

#[derive(Debug, Clone)]
pub struct SatelliteConfig {
    /// Address the command listener binds to; the heartbeat sender binds
    /// its own address from `heartbeat`.
    pub bind_address: Ipv4Addr,
    pub heartbeat: HeartbeatConfig,
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        SatelliteConfig {
            bind_address: Ipv4Addr::UNSPECIFIED,
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

/// A queued request with the channel its reply goes back on.
type PendingRequest = (CscpMessage, oneshot::Sender<CscpMessage>);

/// The satellite server: binds the command socket, advertises it via
/// CHIRP, runs heartbeats and dispatches verbs.
pub struct SatelliteServer {
    name: String,
    fsm: Fsm,
    context: Arc<SatelliteContext>,
    commands: CommandRegistry,
    chirp: Arc<ChirpManager>,
    heartbeat: Arc<HeartbeatManager>,
    listener: Mutex<Option<TcpListener>>,
    port: u16,
    cancel: CancellationToken,
}

impl SatelliteServer {
    /// Wire up the full fabric for one satellite. The command loop itself
    /// runs in [`SatelliteServer::run`].
    pub async fn new(
        type_name: &str,
        satellite_name: &str,
        satellite: Box<dyn Satellite>,
        chirp: Arc<ChirpManager>,
        commands: CommandRegistry,
        config: SatelliteConfig,
    ) -> anyhow::Result<Self> {
        if !is_valid_name(type_name) || !is_valid_name(satellite_name) {
            anyhow::bail!("satellite name is invalid");
        }
        let name = format!("{type_name}.{satellite_name}");

        let context = SatelliteContext::new();
        let fsm = Fsm::new(satellite, Arc::clone(&context));

        let state_fsm = fsm.clone();
        let heartbeat = Arc::new(HeartbeatManager::new(
            name.clone(),
            Arc::clone(&chirp),
            Arc::new(move || state_fsm.state()),
            config.heartbeat,
        )?);

        // state changes fire an extrasystole; constellation degradation
        // fires an interrupt
        let beat = Arc::clone(&heartbeat);
        fsm.register_state_callback(Box::new(move |_state| beat.extrasystole()));
        let interrupt_fsm = fsm.clone();
        heartbeat.set_interrupt_callback(Arc::new(move || interrupt_fsm.request_interrupt()));

        let listener = std::net::TcpListener::bind((config.bind_address, 0))?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let port = listener.local_addr()?.port();

        chirp
            .register_service(ServiceIdentifier::Control, port)
            .await?;
        heartbeat.start().await?;
        info!(%name, port, "listening for commands");

        Ok(SatelliteServer {
            name,
            fsm,
            context,
            commands,
            chirp,
            heartbeat,
            listener: Mutex::new(Some(listener)),
            port,
            cancel: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ephemeral port of the command socket, advertised as CONTROL.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> State {
        self.fsm.state()
    }

    pub fn fsm(&self) -> &Fsm {
        &self.fsm
    }

    pub fn context(&self) -> &Arc<SatelliteContext> {
        &self.context
    }

    /// Token cancelled when the satellite shuts down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request shutdown without joining the command loop; the loop owner
    /// observes the token and tears the node down.
    pub fn terminate(&self) {
        self.fsm.request_interrupt();
        self.cancel.cancel();
    }

    /// The command loop. Accepts controller connections, processes one
    /// request at a time and replies; returns after shutdown with all
    /// services withdrawn.
    pub async fn run(self) -> anyhow::Result<()> {
        let Some(listener) = lock(&self.listener).take() else {
            anyhow::bail!("command loop already running");
        };

        let (tx, mut rx) = mpsc::channel::<PendingRequest>(16);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            tx,
            self.cancel.clone(),
            self.name.clone(),
        ));

        loop {
            let request = tokio::select! {
                _ = self.cancel.cancelled() => break,
                request = rx.recv() => request,
            };
            let Some((msg, reply_tx)) = request else { break };
            // a panicking handler must not kill the loop; the peer gets an
            // ERROR reply instead
            let reply = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                self.handle_request(msg)
            })) {
                Ok(reply) => reply,
                Err(_) => {
                    error!("command handler panicked");
                    self.reply(CscpType::Error, "internal error while handling command")
                }
            };
            let _ = reply_tx.send(reply);
        }

        // teardown in reverse construction order
        accept_task.abort();
        self.heartbeat.shutdown().await;
        if let Err(err) = self
            .chirp
            .unregister_service(ServiceIdentifier::Control, self.port)
            .await
        {
            warn!(error = %err, "failed to withdraw control service");
        }
        info!(name = %self.name, "command loop stopped");
        Ok(())
    }

    fn reply(&self, verb_type: CscpType, detail: impl Into<String>) -> CscpMessage {
        CscpMessage::new(self.name.clone(), verb_type, detail)
    }

    fn handle_request(&self, msg: CscpMessage) -> CscpMessage {
        if msg.verb.0 != CscpType::Request {
            warn!(verb_type = %msg.verb.0, "ignoring non-request CSCP message");
            return self.reply(CscpType::Error, "can only handle REQUEST messages");
        }

        let verb = msg.verb.1.to_lowercase();
        debug!(
            %verb,
            from = %msg.header.sender,
            has_payload = msg.has_payload(),
            "received command"
        );

        // dispatch order: transition, standard, user, unknown
        if let Some(command) = TransitionCommand::from_verb(&verb) {
            let (verb_type, detail) = self.fsm.react_command(command, msg.payload.as_deref());
            return self.reply(verb_type, detail);
        }

        if let Some(reply) = self.handle_standard(&verb) {
            return reply;
        }

        if let Some(reply) = self.handle_user(&verb, msg.payload.as_deref()) {
            return reply;
        }

        warn!(%verb, "unknown command");
        self.reply(CscpType::Unknown, format!("command '{verb}' is not known"))
    }

    fn handle_standard(&self, verb: &str) -> Option<CscpMessage> {
        let reply = match verb {
            "get_name" => self.reply(CscpType::Success, self.name.clone()),
            "get_version" => self.reply(CscpType::Success, env!("CARGO_PKG_VERSION")),
            "get_commands" => {
                let mut dict = Dictionary::new();
                dict.insert(
                    "initialize",
                    "Initialize satellite (payload: config as packed dictionary)",
                );
                dict.insert("launch", "Launch satellite");
                dict.insert("land", "Land satellite");
                if self.fsm.supports_reconfigure() {
                    dict.insert(
                        "reconfigure",
                        "Reconfigure satellite (payload: partial config as packed dictionary)",
                    );
                }
                dict.insert("start", "Start new run (payload: run number as packed integer)");
                dict.insert("stop", "Stop run");
                dict.insert("shutdown", "Shut down satellite");
                dict.insert("get_name", "Get canonical name of satellite");
                dict.insert("get_version", "Get version of satellite");
                dict.insert(
                    "get_commands",
                    "Get commands supported by satellite (returned in payload)",
                );
                dict.insert("get_state", "Get lifecycle state of satellite");
                dict.insert("get_status", "Get status message of satellite");
                dict.insert(
                    "get_config",
                    "Get configuration of satellite (returned in payload)",
                );
                dict.insert("get_run_id", "Get current run identifier");
                for (name, description) in self.commands.describe() {
                    dict.insert(name, description);
                }
                self.reply(CscpType::Success, "commands attached in payload")
                    .with_payload(dict.assemble())
            }
            "get_state" => self.reply(CscpType::Success, self.fsm.state().name()),
            "get_status" => self.reply(CscpType::Success, self.context.status()),
            "get_config" => {
                let dict = self.context.config_dictionary(Group::All, Usage::Used);
                self.reply(CscpType::Success, "configuration attached in payload")
                    .with_payload(dict.assemble())
            }
            "get_run_id" => self.reply(CscpType::Success, self.context.run_id()),
            "shutdown" => {
                let state = self.fsm.state();
                if state.is_shutdown_allowed() {
                    info!("shutting down on remote request");
                    self.terminate();
                    self.reply(CscpType::Success, "shutting down satellite")
                } else {
                    self.reply(
                        CscpType::Invalid,
                        format!("satellite cannot be shut down from state {state}"),
                    )
                }
            }
            _ => return None,
        };
        Some(reply)
    }

    fn handle_user(&self, verb: &str, payload: Option<&[u8]>) -> Option<CscpMessage> {
        let args = match payload {
            None => List::new(),
            Some(bytes) => match List::disassemble(bytes) {
                Ok(args) => args,
                Err(err) => {
                    return Some(self.reply(
                        CscpType::Incomplete,
                        format!("could not decode argument list: {err}"),
                    ))
                }
            },
        };

        match self.commands.call(self.fsm.state(), verb, &args) {
            Ok(Some(value)) => {
                Some(self.reply(CscpType::Success, "").with_payload(value.assemble()))
            }
            Ok(None) => Some(self.reply(CscpType::Success, "")),
            Err(CommandError::Unknown) => None,
            Err(err @ CommandError::NotAllowed { .. }) => {
                Some(self.reply(CscpType::Invalid, err.to_string()))
            }
            Err(err @ CommandError::WrongArity { .. }) => {
                Some(self.reply(CscpType::Incomplete, err.to_string()))
            }
            Err(CommandError::Failed(msg)) => Some(self.reply(CscpType::Incomplete, msg)),
        }
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<PendingRequest>,
    cancel: CancellationToken,
    name: String,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "controller connected");
                tokio::spawn(handle_connection(
                    stream,
                    tx.clone(),
                    cancel.clone(),
                    name.clone(),
                ));
            }
            Err(err) => {
                error!(error = %err, "accept failed on command socket");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// One controller connection: strictly request/reply. A malformed request
/// gets an ERROR reply and the connection survives; a transport error ends
/// the connection.
async fn handle_connection(
    mut stream: TcpStream,
    tx: mpsc::Sender<PendingRequest>,
    cancel: CancellationToken,
    name: String,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = transport::read_message(&mut stream) => received,
        };
        let frames = match received {
            Ok(frames) => frames,
            Err(err) => {
                debug!(error = %err, "controller disconnected");
                break;
            }
        };

        let msg = match CscpMessage::from_frames(&frames) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(error = %err, "dropping malformed command");
                let reply = CscpMessage::new(name.clone(), CscpType::Error, err.to_string());
                if transport::write_message(&mut stream, &reply.to_frames())
                    .await
                    .is_err()
                {
                    break;
                }
                continue;
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if tx.send((msg, reply_tx)).await.is_err() {
            break;
        }
        let Ok(reply) = reply_rx.await else { break };
        if let Err(err) = transport::write_message(&mut stream, &reply.to_frames()).await {
            debug!(error = %err, "failed to send reply");
            break;
        }
    }
}
