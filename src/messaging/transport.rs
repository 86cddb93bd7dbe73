use std::fmt::{Debug, Formatter};
use std::net::{Ipv4Addr, SocketAddr};
use anyhow::bail;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::config::GroupsConfig;

/// This is an abstraction for sending and receiving raw datagrams to / from the multicast group,
///  introduced to facilitate replacing the network with an in-memory implementation or with
///  mocks for testing.
///
/// Receiving is done by a single receive loop per transport.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// sends a datagram to all members of the multicast group
    async fn send(&self, buf: &[u8]) -> anyhow::Result<()>;

    /// waits for the next datagram, returning `None` once the transport is closed
    async fn recv(&self) -> anyhow::Result<Option<(Bytes, SocketAddr)>>;

    /// Closing is idempotent, closing a closed transport does nothing. Pending and future
    ///  calls to [Transport::recv] return `None`, calls to [Transport::send] fail.
    fn close(&self) -> anyhow::Result<()>;

    fn is_closed(&self) -> bool;
}


pub struct MulticastTransport {
    socket: UdpSocket,
    group_addr: SocketAddr,
    interface_addr: Ipv4Addr,
    max_datagram_size: usize,
    closed: watch::Sender<bool>,
}

impl Debug for MulticastTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MulticastTransport{{group:{:?}}}", self.group_addr)
    }
}

impl MulticastTransport {
    /// binds a socket to the multicast port and joins the multicast group.
    ///
    /// The socket allows address reuse so that several processes on the same host can join the
    ///  same group.
    pub async fn open(config: &GroupsConfig) -> anyhow::Result<MulticastTransport> {
        config.validate()?;

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;

        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.multicast_port));
        socket.bind(&bind_addr.into())?;

        socket.join_multicast_v4(&config.multicast_addr, &config.interface_addr)?;
        socket.set_multicast_loop_v4(config.multicast_loop)?;
        socket.set_multicast_ttl_v4(config.multicast_ttl)?;
        if !config.interface_addr.is_unspecified() {
            socket.set_multicast_if_v4(&config.interface_addr)?;
        }

        let socket = UdpSocket::from_std(socket.into())?;
        info!("bound multicast socket to {:?}, joined group {:?}", socket.local_addr()?, config.multicast_socket_addr());

        let (closed, _) = watch::channel(false);
        Ok(MulticastTransport {
            socket,
            group_addr: config.multicast_socket_addr(),
            interface_addr: config.interface_addr,
            max_datagram_size: config.max_datagram_size,
            closed,
        })
    }
}

#[async_trait]
impl Transport for MulticastTransport {
    async fn send(&self, buf: &[u8]) -> anyhow::Result<()> {
        if self.is_closed() {
            bail!("transport for {:?} is closed", self.group_addr);
        }
        trace!("sending {} bytes to {:?}", buf.len(), self.group_addr);
        self.socket.send_to(buf, self.group_addr).await?;
        Ok(())
    }

    async fn recv(&self) -> anyhow::Result<Option<(Bytes, SocketAddr)>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Ok(None);
        }

        let mut buf = BytesMut::with_capacity(self.max_datagram_size);
        select! {
            _ = closed.wait_for(|is_closed| *is_closed) => Ok(None),
            received = self.socket.recv_buf_from(&mut buf) => {
                let (num_read, from) = received?;
                trace!("received {} bytes from {:?}", num_read, from);
                Ok(Some((buf.freeze(), from)))
            }
        }
    }

    fn close(&self) -> anyhow::Result<()> {
        if self.closed.send_replace(true) {
            debug!("transport for {:?} was already closed", self.group_addr);
            return Ok(());
        }

        info!("closing multicast transport for {:?}", self.group_addr);
        if let std::net::IpAddr::V4(group) = self.group_addr.ip() {
            if let Err(e) = self.socket.leave_multicast_v4(group, self.interface_addr) {
                warn!("error leaving multicast group {:?}: {}", self.group_addr, e);
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}
