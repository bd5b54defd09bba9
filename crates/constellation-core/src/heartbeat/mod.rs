//! CHP: heartbeat emission, reception and liveness tracking.

mod manager;
mod recv;
mod send;

pub use manager::{HeartbeatConfig, HeartbeatManager, InterruptCallback};
pub use recv::{HeartbeatRecv, MessageSink};
pub use send::{HeartbeatSend, StateReader};
