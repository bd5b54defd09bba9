//! Lifecycle FSM runtime: serialized transitions, worker-executed
//! transition routines and the cancellable RUN routine.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use constellation_protocol::config::{Group, Usage};
use constellation_protocol::cscp::CscpType;
use constellation_protocol::{
    transition_target, Configuration, Dictionary, State, Transition, TransitionCommand, Value,
};

use crate::util::lock;

use super::{Satellite, SatelliteContext};

/// Notified synchronously on every state change.
pub type StateCallback = Box<dyn Fn(State) + Send + Sync>;

struct FsmInner {
    state: AtomicU8,
    /// Serializes every state change. Held while state callbacks run, so
    /// callbacks must not block or re-enter the machine.
    transition_gate: Mutex<()>,
    satellite: Arc<Mutex<Box<dyn Satellite>>>,
    supports_reconfigure: bool,
    context: Arc<SatelliteContext>,
    run_token: Mutex<Option<CancellationToken>>,
    run_task: Mutex<Option<JoinHandle<()>>>,
    state_callbacks: Mutex<Vec<StateCallback>>,
    interrupt_pending: AtomicBool,
}

/// Handle to the satellite lifecycle machine. Clones share one machine.
#[derive(Clone)]
pub struct Fsm {
    inner: Arc<FsmInner>,
}

impl Fsm {
    pub fn new(satellite: Box<dyn Satellite>, context: Arc<SatelliteContext>) -> Self {
        let supports_reconfigure = satellite.supports_reconfigure();
        Fsm {
            inner: Arc::new(FsmInner {
                state: AtomicU8::new(State::New as u8),
                transition_gate: Mutex::new(()),
                satellite: Arc::new(Mutex::new(satellite)),
                supports_reconfigure,
                context,
                run_token: Mutex::new(None),
                run_task: Mutex::new(None),
                state_callbacks: Mutex::new(Vec::new()),
                interrupt_pending: AtomicBool::new(false),
            }),
        }
    }

    /// Current state. Readers may observe a transient state while a
    /// transition routine is executing.
    pub fn state(&self) -> State {
        self.inner.state_now()
    }

    pub fn register_state_callback(&self, callback: StateCallback) {
        lock(&self.inner.state_callbacks).push(callback);
    }

    pub fn supports_reconfigure(&self) -> bool {
        self.inner.supports_reconfigure
    }

    /// Handle a transition verb from the command loop. Returns the reply
    /// verb; an accepted transition runs its routine on a worker.
    pub fn react_command(
        &self,
        command: TransitionCommand,
        payload: Option<&[u8]>,
    ) -> (CscpType, String) {
        let transition = command.as_transition();
        info!(%transition, "reacting to transition command");

        let current = self.state();
        if transition_target(current, transition).is_none() {
            let msg = format!("transition {transition} not allowed from {current} state");
            warn!("{msg}");
            return (CscpType::Invalid, msg);
        }

        if command == TransitionCommand::Reconfigure && !self.inner.supports_reconfigure {
            let msg = "transition reconfigure is not implemented by this satellite".to_owned();
            warn!("{msg}");
            return (CscpType::NotImplemented, msg);
        }

        // only initialize, reconfigure and start carry a payload
        let payload_note = match command {
            TransitionCommand::Initialize | TransitionCommand::Reconfigure | TransitionCommand::Start => "",
            _ if payload.is_some() => " (payload frame is ignored)",
            _ => "",
        };

        match command {
            TransitionCommand::Initialize | TransitionCommand::Reconfigure => {
                let Some(bytes) = payload else {
                    let msg =
                        format!("transition {transition} requires a configuration payload");
                    warn!("{msg}");
                    return (CscpType::Incomplete, msg);
                };
                let dict = match Dictionary::disassemble(bytes) {
                    Ok(dict) => dict,
                    Err(err) => {
                        let msg = format!("transition {transition} received invalid payload: {err}");
                        warn!("{msg}");
                        return (CscpType::Incomplete, msg);
                    }
                };
                if let Err(msg) = self.inner.apply(transition) {
                    return (CscpType::Invalid, msg);
                }
                if command == TransitionCommand::Initialize {
                    self.spawn_initialize(dict);
                } else {
                    self.spawn_reconfigure(dict);
                }
            }
            TransitionCommand::Start => {
                let Some(bytes) = payload else {
                    let msg = "transition start requires a run number payload".to_owned();
                    warn!("{msg}");
                    return (CscpType::Incomplete, msg);
                };
                let run_number = match Value::disassemble(bytes).map_err(|err| err.to_string()) {
                    Ok(value) => match value.as_u64() {
                        Ok(number) => number,
                        Err(err) => {
                            let msg = format!("transition start received invalid payload: {err}");
                            warn!("{msg}");
                            return (CscpType::Incomplete, msg);
                        }
                    },
                    Err(err) => {
                        let msg = format!("transition start received invalid payload: {err}");
                        warn!("{msg}");
                        return (CscpType::Incomplete, msg);
                    }
                };
                if let Err(msg) = self.inner.apply(transition) {
                    return (CscpType::Invalid, msg);
                }
                self.spawn_start(run_number.to_string());
            }
            TransitionCommand::Launch => {
                if let Err(msg) = self.inner.apply(transition) {
                    return (CscpType::Invalid, msg);
                }
                self.spawn_simple(Transition::Launched, |satellite| satellite.launching());
            }
            TransitionCommand::Land => {
                if let Err(msg) = self.inner.apply(transition) {
                    return (CscpType::Invalid, msg);
                }
                self.spawn_simple(Transition::Landed, |satellite| satellite.landing());
            }
            TransitionCommand::Stop => {
                if let Err(msg) = self.inner.apply(transition) {
                    return (CscpType::Invalid, msg);
                }
                self.spawn_stop();
            }
        }

        (
            CscpType::Success,
            format!("transition {transition} is being initiated{payload_note}"),
        )
    }

    /// Move towards SAFE as soon as a steady state is reached. Idempotent;
    /// a no-op outside ORBIT and RUN.
    pub fn request_interrupt(&self) {
        if self.inner.interrupt_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("interrupt requested");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while !inner.state_now().is_steady() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }

            let previous = inner.state_now();
            if inner.apply(Transition::Interrupt).is_ok() {
                // leave RUN before the interrupting routine takes over
                inner.cancel_run().await;

                let satellite = Arc::clone(&inner.satellite);
                let result = tokio::task::spawn_blocking(move || {
                    lock(&satellite).interrupting(previous);
                })
                .await;
                match result {
                    Ok(()) => inner.complete(Transition::Interrupted),
                    Err(err) => inner.fail(format!("interrupt routine panicked: {err}")),
                }
            } else {
                debug!(state = %previous, "interrupt is a no-op");
            }
            inner.interrupt_pending.store(false, Ordering::SeqCst);
        });
    }

    fn spawn_initialize(&self, dict: Dictionary) {
        let context = Arc::clone(&self.inner.context);
        self.spawn_simple(Transition::Initialized, move |satellite| {
            let mut config = Configuration::new(dict);
            satellite.initializing(&mut config)?;

            let unused = config.unused_keys();
            if !unused.is_empty() {
                warn!(keys = ?unused, "configuration keys were not used");
                config = Configuration::new_used(config.dictionary(Group::All, Usage::Used));
            }
            context.store_config(config);
            Ok(())
        });
    }

    fn spawn_reconfigure(&self, dict: Dictionary) {
        let context = Arc::clone(&self.inner.context);
        self.spawn_simple(Transition::Reconfigured, move |satellite| {
            let partial = Configuration::new(dict);
            satellite.reconfiguring(&partial)?;

            let unused = partial.unused_keys();
            if !unused.is_empty() {
                warn!(keys = ?unused, "reconfigure keys were not used");
            }
            context.update_config(&partial);
            Ok(())
        });
    }

    fn spawn_start(&self, run_id: String) {
        let context = Arc::clone(&self.inner.context);
        self.spawn_simple(Transition::Started, move |satellite| {
            satellite.starting(&run_id)?;
            context.set_run_id(run_id.clone());
            Ok(())
        });
    }

    /// Run a transition routine on a worker; fire the completion transition
    /// on success and move to ERROR on failure or panic.
    fn spawn_simple(
        &self,
        done: Transition,
        hook: impl FnOnce(&mut dyn Satellite) -> anyhow::Result<()> + Send + 'static,
    ) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let satellite = Arc::clone(&inner.satellite);
            let result = tokio::task::spawn_blocking(move || {
                let mut guard = lock(&satellite);
                hook(guard.as_mut())
            })
            .await;
            match result {
                Ok(Ok(())) => inner.complete(done),
                Ok(Err(err)) => inner.fail(err.to_string()),
                Err(err) => inner.fail(format!("transition routine panicked: {err}")),
            }
        });
    }

    fn spawn_stop(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            // the RUN worker must exit before the stopping routine can
            // borrow the satellite
            inner.cancel_run().await;

            let satellite = Arc::clone(&inner.satellite);
            let result =
                tokio::task::spawn_blocking(move || lock(&satellite).stopping()).await;
            match result {
                Ok(Ok(())) => inner.complete(Transition::Stopped),
                Ok(Err(err)) => inner.fail(err.to_string()),
                Err(err) => inner.fail(format!("stopping routine panicked: {err}")),
            }
        });
    }
}

impl FsmInner {
    fn state_now(&self) -> State {
        // the atomic only ever holds values written from a State
        State::try_from(self.state.load(Ordering::SeqCst)).unwrap_or(State::Error)
    }

    /// The single place states change: take the gate, validate the edge,
    /// store and notify.
    fn apply(&self, transition: Transition) -> Result<State, String> {
        let _gate = lock(&self.transition_gate);
        let current = self.state_now();
        let Some(target) = transition_target(current, transition) else {
            return Err(format!(
                "transition {transition} not allowed from {current} state"
            ));
        };
        self.state.store(target as u8, Ordering::SeqCst);
        info!(state = %target, "state changed");
        self.context.set_status(format!("in state {target}"));
        for callback in lock(&self.state_callbacks).iter() {
            callback(target);
        }
        Ok(target)
    }

    /// Completion transition fired by a worker. A lost race (e.g. failure
    /// already moved the machine to ERROR) is logged and swallowed.
    fn complete(self: &Arc<Self>, done: Transition) {
        match self.apply(done) {
            Ok(State::Run) => self.spawn_run(),
            Ok(_) => {}
            Err(msg) => debug!("skipping completion: {msg}"),
        }
    }

    /// Move to ERROR, record the diagnostic and run the failure hook.
    fn fail(self: &Arc<Self>, msg: String) {
        error!("{msg}");
        let previous = self.state_now();
        if self.apply(Transition::Failure).is_ok() {
            self.context.set_status(msg);
            let satellite = Arc::clone(&self.satellite);
            tokio::task::spawn_blocking(move || lock(&satellite).on_failure(previous));
        }
    }

    /// Hand the RUN routine its worker and cancellation token.
    fn spawn_run(self: &Arc<Self>) {
        let token = CancellationToken::new();
        *lock(&self.run_token) = Some(token.clone());

        let satellite = Arc::clone(&self.satellite);
        let body =
            tokio::task::spawn_blocking(move || lock(&satellite).running(&token));

        let inner = Arc::clone(self);
        let supervisor = tokio::spawn(async move {
            match body.await {
                // the routine may finish early; the satellite stays in RUN
                // until stop or interrupt
                Ok(Ok(())) => {}
                Ok(Err(err)) => inner.fail(format!("run routine failed: {err}")),
                Err(err) => inner.fail(format!("run routine panicked: {err}")),
            }
        });
        *lock(&self.run_task) = Some(supervisor);
    }

    /// Request cancellation of the RUN routine and wait for its worker.
    async fn cancel_run(&self) {
        if let Some(token) = lock(&self.run_token).take() {
            token.cancel();
        }
        let task = lock(&self.run_task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
