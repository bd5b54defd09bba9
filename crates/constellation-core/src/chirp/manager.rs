//! CHIRP manager: the registry of offered services, the set of discovered
//! peers and the discovery loop tying them together.

use std::collections::BTreeSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use constellation_protocol::chirp::{
    ChirpMessage, ChirpMessageType, ServiceIdentifier, CHIRP_PORT,
};
use constellation_protocol::Md5Hash;

use super::broadcast::{broadcast_targets, BroadcastRecv, BroadcastSend};
use crate::util::lock;

/// How long one receive slice blocks before the stop token is rechecked.
const RECV_SLICE: Duration = Duration::from_millis(50);

/// A service offered by this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RegisteredService {
    pub identifier: ServiceIdentifier,
    pub port: u16,
}

/// A service seen on the network. Identity deliberately excludes the
/// address: the same host advertising on two interfaces is one peer.
#[derive(Debug, Clone, Copy)]
pub struct DiscoveredService {
    pub address: Ipv4Addr,
    pub host_id: Md5Hash,
    pub identifier: ServiceIdentifier,
    pub port: u16,
}

impl DiscoveredService {
    fn key(&self) -> (Md5Hash, ServiceIdentifier, u16) {
        (self.host_id, self.identifier, self.port)
    }

    /// Endpoint for connecting to the advertised service.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.address), self.port)
    }
}

impl PartialEq for DiscoveredService {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for DiscoveredService {}

impl PartialOrd for DiscoveredService {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DiscoveredService {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

/// Callback invoked for every discovery or departure of a matching service.
/// Dispatch happens on a detached task; no manager lock is held while user
/// code runs, and invocations are unordered.
pub type DiscoverCallback = Arc<dyn Fn(DiscoveredService, bool) + Send + Sync>;

struct CallbackEntry {
    callback: DiscoverCallback,
    service: ServiceIdentifier,
}

/// Node-wide CHIRP configuration.
#[derive(Debug, Clone)]
pub struct ChirpConfig {
    pub group: String,
    pub host: String,
    /// Explicit broadcast target; when absent, all non-loopback interfaces
    /// are enumerated.
    pub broadcast_address: Option<Ipv4Addr>,
    pub listen_address: Ipv4Addr,
    pub port: u16,
}

impl ChirpConfig {
    pub fn new(group: impl Into<String>, host: impl Into<String>) -> Self {
        ChirpConfig {
            group: group.into(),
            host: host.into(),
            broadcast_address: None,
            listen_address: Ipv4Addr::UNSPECIFIED,
            port: CHIRP_PORT,
        }
    }

    pub fn with_broadcast_address(mut self, address: Ipv4Addr) -> Self {
        self.broadcast_address = Some(address);
        self
    }

    pub fn with_listen_address(mut self, address: Ipv4Addr) -> Self {
        self.listen_address = address;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

static DEFAULT_INSTANCE: OnceLock<Arc<ChirpManager>> = OnceLock::new();

pub struct ChirpManager {
    group_id: Md5Hash,
    host_id: Md5Hash,
    sender: BroadcastSend,
    receiver: BroadcastRecv,
    registered: Mutex<BTreeSet<RegisteredService>>,
    discovered: Mutex<BTreeSet<DiscoveredService>>,
    callbacks: Mutex<Vec<CallbackEntry>>,
    cancel: CancellationToken,
    main_loop: Mutex<Option<JoinHandle<()>>>,
}

impl ChirpManager {
    /// Create the manager and its sockets. Must be called from within a
    /// tokio runtime; the discovery loop starts with [`ChirpManager::start`].
    pub fn new(config: ChirpConfig) -> io::Result<Arc<Self>> {
        let group_id = Md5Hash::new(&config.group);
        let host_id = Md5Hash::new(&config.host);
        debug!(group = %config.group, id = %group_id, "group id computed");
        debug!(host = %config.host, id = %host_id, "host id computed");

        let receiver = BroadcastRecv::new(config.listen_address, config.port)?;
        // a concrete listen address also pins the sender's source address,
        // so peers record this node under the address it listens on
        let source = (config.listen_address != Ipv4Addr::UNSPECIFIED)
            .then_some(config.listen_address);
        let sender = BroadcastSend::new(
            broadcast_targets(config.broadcast_address),
            config.port,
            source,
        )?;

        Ok(Arc::new(ChirpManager {
            group_id,
            host_id,
            sender,
            receiver,
            registered: Mutex::new(BTreeSet::new()),
            discovered: Mutex::new(BTreeSet::new()),
            callbacks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            main_loop: Mutex::new(None),
        }))
    }

    /// Install a process-wide handle for subsystems without explicit
    /// wiring. First caller wins.
    pub fn set_default(manager: Arc<ChirpManager>) -> bool {
        DEFAULT_INSTANCE.set(manager).is_ok()
    }

    pub fn default_instance() -> Option<Arc<ChirpManager>> {
        DEFAULT_INSTANCE.get().cloned()
    }

    pub fn group_id(&self) -> Md5Hash {
        self.group_id
    }

    pub fn host_id(&self) -> Md5Hash {
        self.host_id
    }

    /// Spawn the discovery loop.
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move { manager.main_loop().await });
        *lock(&self.main_loop) = Some(handle);
    }

    /// Stop the discovery loop and withdraw all offered services.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = lock(&self.main_loop).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if let Err(err) = self.unregister_services().await {
            warn!(error = %err, "failed to send DEPART broadcasts");
        }
    }

    /// Offer a service. Returns whether it was actually inserted; only an
    /// effective insert broadcasts an OFFER.
    pub async fn register_service(
        &self,
        identifier: ServiceIdentifier,
        port: u16,
    ) -> io::Result<bool> {
        let service = RegisteredService { identifier, port };
        let inserted = lock(&self.registered).insert(service);
        if inserted {
            self.send_message(ChirpMessageType::Offer, service).await?;
        }
        Ok(inserted)
    }

    /// Withdraw a service. Only an effective removal broadcasts a DEPART.
    pub async fn unregister_service(
        &self,
        identifier: ServiceIdentifier,
        port: u16,
    ) -> io::Result<bool> {
        let service = RegisteredService { identifier, port };
        let removed = lock(&self.registered).remove(&service);
        if removed {
            self.send_message(ChirpMessageType::Depart, service).await?;
        }
        Ok(removed)
    }

    /// Withdraw everything, sending one DEPART per registered service.
    pub async fn unregister_services(&self) -> io::Result<()> {
        let services: Vec<RegisteredService> = {
            let mut registered = lock(&self.registered);
            let services = registered.iter().copied().collect();
            registered.clear();
            services
        };
        for service in services {
            self.send_message(ChirpMessageType::Depart, service).await?;
        }
        Ok(())
    }

    pub fn registered_services(&self) -> Vec<RegisteredService> {
        lock(&self.registered).iter().copied().collect()
    }

    /// Ask peers to replay OFFERs for a service class.
    pub async fn send_request(&self, identifier: ServiceIdentifier) -> io::Result<()> {
        self.send_message(
            ChirpMessageType::Request,
            RegisteredService {
                identifier,
                port: 0,
            },
        )
        .await
    }

    /// Register a discovery callback for one service class. Identity is the
    /// callback handle plus the class; duplicate registrations are refused.
    pub fn register_discover_callback(
        &self,
        callback: DiscoverCallback,
        service: ServiceIdentifier,
    ) -> bool {
        let mut callbacks = lock(&self.callbacks);
        let duplicate = callbacks
            .iter()
            .any(|entry| Arc::ptr_eq(&entry.callback, &callback) && entry.service == service);
        if duplicate {
            return false;
        }
        callbacks.push(CallbackEntry { callback, service });
        true
    }

    pub fn unregister_discover_callback(
        &self,
        callback: &DiscoverCallback,
        service: ServiceIdentifier,
    ) -> bool {
        let mut callbacks = lock(&self.callbacks);
        let before = callbacks.len();
        callbacks
            .retain(|entry| !(Arc::ptr_eq(&entry.callback, callback) && entry.service == service));
        callbacks.len() != before
    }

    pub fn unregister_discover_callbacks(&self) {
        lock(&self.callbacks).clear();
    }

    pub fn discovered_services(&self) -> Vec<DiscoveredService> {
        lock(&self.discovered).iter().copied().collect()
    }

    pub fn discovered_services_of(&self, identifier: ServiceIdentifier) -> Vec<DiscoveredService> {
        lock(&self.discovered)
            .iter()
            .filter(|service| service.identifier == identifier)
            .copied()
            .collect()
    }

    /// Drop the whole discovered set without firing callbacks.
    pub fn forget_discovered_services(&self) {
        lock(&self.discovered).clear();
    }

    /// Drop one discovered service, notifying its callbacks as departed.
    pub fn forget_discovered_service(&self, identifier: ServiceIdentifier, host_id: Md5Hash) {
        let dropped: Vec<DiscoveredService> = {
            let mut discovered = lock(&self.discovered);
            let victims: Vec<DiscoveredService> = discovered
                .iter()
                .filter(|service| service.host_id == host_id && service.identifier == identifier)
                .copied()
                .collect();
            for victim in &victims {
                discovered.remove(victim);
            }
            victims
        };
        for service in dropped {
            debug!(service = %service.identifier, host = %host_id, "dropping discovered service");
            self.dispatch_callbacks(service, true);
        }
    }

    /// Drop every discovered service of a host, notifying callbacks.
    pub fn forget_discovered_services_of(&self, host_id: Md5Hash) {
        let dropped: Vec<DiscoveredService> = {
            let mut discovered = lock(&self.discovered);
            let victims: Vec<DiscoveredService> = discovered
                .iter()
                .filter(|service| service.host_id == host_id)
                .copied()
                .collect();
            for victim in &victims {
                discovered.remove(victim);
            }
            victims
        };
        debug!(count = dropped.len(), host = %host_id, "dropped discovered services");
        for service in dropped {
            self.dispatch_callbacks(service, true);
        }
    }

    async fn send_message(
        &self,
        msg_type: ChirpMessageType,
        service: RegisteredService,
    ) -> io::Result<()> {
        debug!(
            %msg_type,
            service = %service.identifier,
            port = service.port,
            "sending CHIRP broadcast"
        );
        let msg = ChirpMessage::new(
            msg_type,
            self.group_id,
            self.host_id,
            service.identifier,
            service.port,
        );
        self.sender.send_broadcast(&msg.assemble()).await
    }

    /// Fire matching callbacks on detached tasks. The callback lock is
    /// released before any user code runs.
    fn dispatch_callbacks(&self, service: DiscoveredService, depart: bool) {
        let matching: Vec<DiscoverCallback> = lock(&self.callbacks)
            .iter()
            .filter(|entry| entry.service == service.identifier)
            .map(|entry| Arc::clone(&entry.callback))
            .collect();
        for callback in matching {
            tokio::spawn(async move { callback(service, depart) });
        }
    }

    async fn main_loop(self: Arc<Self>) {
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.receiver.recv_timeout(RECV_SLICE) => received,
            };

            let (bytes, source) = match received {
                Ok(Some(datagram)) => datagram,
                Ok(None) => continue,
                Err(err) => {
                    warn!(error = %err, "CHIRP receive failed");
                    continue;
                }
            };

            let msg = match ChirpMessage::disassemble(&bytes) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!(error = %err, from = %source, "dropping malformed CHIRP datagram");
                    continue;
                }
            };

            trace!(
                from = %source,
                group = %msg.group_id,
                host = %msg.host_id,
                msg_type = %msg.msg_type,
                service = %msg.service,
                port = msg.port,
                "received CHIRP datagram"
            );

            // other groups and our own broadcasts are not ours to handle
            if msg.group_id != self.group_id || msg.host_id == self.host_id {
                continue;
            }

            let address = match source {
                SocketAddr::V4(v4) => *v4.ip(),
                SocketAddr::V6(_) => continue,
            };
            let service = DiscoveredService {
                address,
                host_id: msg.host_id,
                identifier: msg.service,
                port: msg.port,
            };

            match msg.msg_type {
                ChirpMessageType::Request => {
                    let replay: Vec<RegisteredService> = lock(&self.registered)
                        .iter()
                        .filter(|registered| registered.identifier == msg.service)
                        .copied()
                        .collect();
                    for registered in replay {
                        if let Err(err) = self
                            .send_message(ChirpMessageType::Offer, registered)
                            .await
                        {
                            warn!(error = %err, "failed to replay OFFER");
                        }
                    }
                }
                ChirpMessageType::Offer => {
                    let inserted = lock(&self.discovered).insert(service);
                    if inserted {
                        debug!(
                            service = %service.identifier,
                            address = %service.address,
                            port = service.port,
                            "service discovered"
                        );
                        self.dispatch_callbacks(service, false);
                    }
                }
                ChirpMessageType::Depart => {
                    let removed = lock(&self.discovered).remove(&service);
                    if removed {
                        debug!(
                            service = %service.identifier,
                            address = %service.address,
                            port = service.port,
                            "service departed"
                        );
                        self.dispatch_callbacks(service, true);
                    }
                }
            }
        }
    }
}
