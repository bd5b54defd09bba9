//! Service discovery: UDP broadcast sockets and the CHIRP manager.

mod broadcast;
mod manager;

pub use broadcast::{broadcast_targets, BroadcastRecv, BroadcastSend};
pub use manager::{
    ChirpConfig, ChirpManager, DiscoverCallback, DiscoveredService, RegisteredService,
};
