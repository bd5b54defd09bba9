//! Peer fabric for Constellation satellites.
//!
//! Everything a node needs before any domain logic runs: CHIRP service
//! discovery over UDP broadcast, CHP heartbeats with liveness tracking,
//! and the CSCP command loop driving the lifecycle state machine.
//!
//! The usual wiring is one [`chirp::ChirpManager`] per process, handed to a
//! [`satellite::SatelliteServer`] which owns the heartbeat manager and the
//! command loop:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use constellation_core::chirp::{ChirpConfig, ChirpManager};
//! use constellation_core::satellite::{
//!     CommandRegistry, Satellite, SatelliteConfig, SatelliteServer,
//! };
//!
//! struct Demo;
//! impl Satellite for Demo {}
//!
//! # async fn example() -> anyhow::Result<()> {
//! let chirp = ChirpManager::new(ChirpConfig::new("edda", "sat1"))?;
//! chirp.start();
//!
//! let server = SatelliteServer::new(
//!     "Demo",
//!     "sat1",
//!     Box::new(Demo),
//!     Arc::clone(&chirp),
//!     CommandRegistry::new(),
//!     SatelliteConfig::default(),
//! )
//! .await?;
//! server.run().await?;
//! chirp.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod chirp;
pub mod heartbeat;
pub mod satellite;
pub mod transport;

mod util;

pub use constellation_protocol as protocol;
