use std::fmt::{Debug, Formatter};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::messaging::packet::MessagePacket;
use crate::messaging::transport::Transport;

/// returns `true` for packets that should be dropped, gets the receiving transport's address
type DropFilter = Box<dyn FnMut(SocketAddr, &MessagePacket) -> bool + Send>;

struct NetworkState {
    transports: Vec<(SocketAddr, mpsc::UnboundedSender<(Bytes, SocketAddr)>)>,
    next_port: u16,
    drop_filter: Option<DropFilter>,
    loss_probability: f64,
    num_dropped: usize,
}

/// An in-memory stand-in for a multicast group: every datagram sent by one of its transports
///  is delivered to all of its transports, including the sender (like multicast loopback).
///
/// Packet loss can be simulated deterministically through a filter, or randomly.
#[derive(Clone)]
pub struct InMemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl Default for InMemoryNetwork {
    fn default() -> Self {
        InMemoryNetwork::new()
    }
}

impl InMemoryNetwork {
    pub fn new() -> InMemoryNetwork {
        InMemoryNetwork {
            state: Arc::new(Mutex::new(NetworkState {
                transports: Vec::new(),
                next_port: 10000,
                drop_filter: None,
                loss_probability: 0.0,
                num_dropped: 0,
            })),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// creates a new transport connected to this network, with a unique address
    pub fn transport(&self) -> Arc<InMemoryTransport> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let mut state = self.state();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, state.next_port));
        state.next_port += 1;
        state.transports.push((addr, sender));

        Arc::new(InMemoryTransport {
            addr,
            network: self.clone(),
            receiver: tokio::sync::Mutex::new(receiver),
            closed,
        })
    }

    pub fn set_drop_filter(&self, filter: impl FnMut(SocketAddr, &MessagePacket) -> bool + Send + 'static) {
        self.state().drop_filter = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        self.state().drop_filter = None;
    }

    pub fn set_loss_probability(&self, loss_probability: f64) {
        self.state().loss_probability = loss_probability.clamp(0.0, 1.0);
    }

    pub fn num_dropped(&self) -> usize {
        self.state().num_dropped
    }

    fn deliver(&self, from: SocketAddr, buf: &[u8]) {
        let mut state = self.state();
        let state = &mut *state;

        // the filter sees decoded packets, undecodable datagrams pass it
        let packet = MessagePacket::decode(buf).ok();
        let buf = Bytes::copy_from_slice(buf);

        state.transports.retain(|(_, sender)| !sender.is_closed());
        for (to, sender) in &state.transports {
            if let (Some(filter), Some(packet)) = (state.drop_filter.as_mut(), packet.as_ref()) {
                if filter(*to, packet) {
                    trace!("dropping {:?} packet from {:?} to {:?}", packet.kind, from, to);
                    state.num_dropped += 1;
                    continue;
                }
            }
            if state.loss_probability > 0.0 && rand::thread_rng().gen_bool(state.loss_probability) {
                trace!("randomly dropping datagram from {:?} to {:?}", from, to);
                state.num_dropped += 1;
                continue;
            }
            let _ = sender.send((buf.clone(), from));
        }
    }

    fn disconnect(&self, addr: SocketAddr) {
        self.state().transports.retain(|(a, _)| *a != addr);
    }
}

pub struct InMemoryTransport {
    addr: SocketAddr,
    network: InMemoryNetwork,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Bytes, SocketAddr)>>,
    closed: watch::Sender<bool>,
}

impl Debug for InMemoryTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "InMemoryTransport{{{:?}}}", self.addr)
    }
}

impl InMemoryTransport {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, buf: &[u8]) -> anyhow::Result<()> {
        if self.is_closed() {
            bail!("transport {:?} is closed", self.addr);
        }
        self.network.deliver(self.addr, buf);
        Ok(())
    }

    async fn recv(&self) -> anyhow::Result<Option<(Bytes, SocketAddr)>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Ok(None);
        }

        let mut receiver = self.receiver.lock().await;
        select! {
            _ = closed.wait_for(|is_closed| *is_closed) => Ok(None),
            received = receiver.recv() => Ok(received),
        }
    }

    fn close(&self) -> anyhow::Result<()> {
        if !self.closed.send_replace(true) {
            debug!("closing in-memory transport {:?}", self.addr);
            self.network.disconnect(self.addr);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tokio::time::timeout;
    use crate::test_util::member::test_member_id_from_number;
    use super::*;

    fn leaving(n: u128) -> Bytes {
        MessagePacket::leaving("g", test_member_id_from_number(n)).encode()
    }

    async fn recv_now(transport: &InMemoryTransport) -> Option<Bytes> {
        timeout(Duration::from_millis(10), transport.recv()).await
            .ok()
            .map(|r| r.unwrap().unwrap().0)
    }

    #[tokio::test]
    async fn test_delivers_to_all_including_sender() {
        let network = InMemoryNetwork::new();
        let t1 = network.transport();
        let t2 = network.transport();
        assert_ne!(t1.addr(), t2.addr());

        t1.send(&leaving(1)).await.unwrap();

        assert_eq!(recv_now(&t1).await, Some(leaving(1)));
        let (received, from) = t2.recv().await.unwrap().unwrap();
        assert_eq!(received, leaving(1));
        assert_eq!(from, t1.addr());
    }

    #[tokio::test]
    async fn test_drop_filter() {
        let network = InMemoryNetwork::new();
        let t1 = network.transport();
        let t2 = network.transport();

        let t2_addr = t2.addr();
        network.set_drop_filter(move |to, packet| to == t2_addr && packet.sender == test_member_id_from_number(1));

        t1.send(&leaving(1)).await.unwrap();
        t1.send(&leaving(2)).await.unwrap();

        assert_eq!(recv_now(&t2).await, Some(leaving(2)));
        assert_eq!(recv_now(&t2).await, None);
        assert_eq!(network.num_dropped(), 1);

        network.clear_drop_filter();
        t1.send(&leaving(1)).await.unwrap();
        assert_eq!(recv_now(&t2).await, Some(leaving(1)));
    }

    #[tokio::test]
    async fn test_total_loss() {
        let network = InMemoryNetwork::new();
        let t1 = network.transport();
        network.set_loss_probability(1.0);

        t1.send(&leaving(1)).await.unwrap();
        assert_eq!(recv_now(&t1).await, None);
        assert_eq!(network.num_dropped(), 1);
    }

    #[tokio::test]
    async fn test_close() {
        let network = InMemoryNetwork::new();
        let t1 = network.transport();
        let t2 = network.transport();

        t2.close().unwrap();
        t2.close().unwrap();
        assert!(t2.is_closed());
        assert!(t2.recv().await.unwrap().is_none());
        assert!(t2.send(&leaving(2)).await.is_err());

        t1.send(&leaving(1)).await.unwrap();
        assert_eq!(recv_now(&t1).await, Some(leaving(1)));
    }

    #[tokio::test]
    async fn test_close_ends_pending_recv() {
        let network = InMemoryNetwork::new();
        let t1 = network.transport();

        let pending = {
            let t1 = t1.clone();
            tokio::spawn(async move { t1.recv().await })
        };
        tokio::task::yield_now().await;

        t1.close().unwrap();
        assert!(pending.await.unwrap().unwrap().is_none());
    }
}
