//! UDP sockets for CHIRP: a fan-out broadcast sender and a reusable-port
//! receiver.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::debug;

use constellation_protocol::chirp::CHIRP_MESSAGE_LENGTH;

/// Resolve the broadcast targets for a node. An explicitly configured
/// address is used alone; otherwise every non-loopback IPv4 interface
/// contributes its directed broadcast, with the limited broadcast as the
/// fallback when none are found.
pub fn broadcast_targets(explicit: Option<Ipv4Addr>) -> Vec<Ipv4Addr> {
    if let Some(address) = explicit {
        return vec![address];
    }

    let mut targets = Vec::new();
    if let Ok(interfaces) = if_addrs::get_if_addrs() {
        for interface in interfaces {
            if interface.is_loopback() {
                continue;
            }
            if let if_addrs::IfAddr::V4(v4) = interface.addr {
                if let Some(broadcast) = v4.broadcast {
                    targets.push(broadcast);
                }
            }
        }
    }
    if targets.is_empty() {
        targets.push(Ipv4Addr::BROADCAST);
    }
    targets
}

/// One connected UDP socket per broadcast target; a send fans the same
/// datagram out on every socket.
pub struct BroadcastSend {
    sockets: Vec<UdpSocket>,
}

impl BroadcastSend {
    /// Must be called from within a tokio runtime. A `source` address pins
    /// the datagrams' sender address, which peers record as the node's
    /// endpoint; `None` lets the kernel choose.
    pub fn new(
        targets: impl IntoIterator<Item = Ipv4Addr>,
        port: u16,
        source: Option<Ipv4Addr>,
    ) -> io::Result<Self> {
        let mut sockets = Vec::new();
        for target in targets {
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            socket.set_reuse_address(true)?;
            socket.set_broadcast(true)?;
            socket.set_nonblocking(true)?;
            if let Some(source) = source {
                socket.bind(&SocketAddrV4::new(source, 0).into())?;
            }
            // connect so sends need no address
            socket.connect(&SocketAddrV4::new(target, port).into())?;
            sockets.push(UdpSocket::from_std(socket.into())?);
            debug!(target = %target, port, "broadcast socket ready");
        }
        if sockets.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no broadcast targets",
            ));
        }
        Ok(BroadcastSend { sockets })
    }

    /// Emit the same datagram on every socket.
    pub async fn send_broadcast(&self, bytes: &[u8]) -> io::Result<()> {
        for socket in &self.sockets {
            socket.send(bytes).await?;
        }
        Ok(())
    }
}

/// Receiver bound on the CHIRP port with address reuse so several nodes can
/// coexist on one machine.
pub struct BroadcastRecv {
    socket: UdpSocket,
}

impl BroadcastRecv {
    /// Must be called from within a tokio runtime.
    pub fn new(bind_address: Ipv4Addr, port: u16) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddrV4::new(bind_address, port).into())?;
        Ok(BroadcastRecv {
            socket: UdpSocket::from_std(socket.into())?,
        })
    }

    /// Next datagram with its source, or `None` on timeout. Datagrams
    /// longer than the CHIRP frame are truncated; the excess is ignored.
    pub async fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        let mut buf = [0u8; CHIRP_MESSAGE_LENGTH];
        match tokio::time::timeout(timeout, self.socket.recv_from(&mut buf)).await {
            Err(_elapsed) => Ok(None),
            Ok(Ok((len, source))) => Ok(Some((buf[..len].to_vec(), source))),
            Ok(Err(err)) => Err(err),
        }
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }
}
