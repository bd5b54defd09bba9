//! Shared data model and wire codecs for the Constellation peer fabric.
//!
//! This crate is runtime-agnostic: it knows how to build and parse the
//! CHIRP, CHP and CSCP messages and the self-describing payload values they
//! carry, but opens no sockets. The `constellation-core` crate provides the
//! managers and loops that move these messages.

pub mod chirp;
pub mod chp;
pub mod config;
pub mod cscp;
pub mod dict;
pub mod error;
pub mod hash;
pub mod state;
pub mod value;

pub use chirp::{ChirpMessage, ChirpMessageType, ServiceIdentifier, CHIRP_PORT};
pub use chp::{ChpMessage, HEARTBEAT_TOPIC};
pub use config::{ConfigError, Configuration};
pub use cscp::{CscpHeader, CscpMessage, CscpType};
pub use dict::{Dictionary, List};
pub use error::DecodeError;
pub use hash::Md5Hash;
pub use state::{transition_target, State, Transition, TransitionCommand};
pub use value::{FromValue, Timestamp, Value, ValueError};
