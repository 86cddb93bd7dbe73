use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::messaging::packet::{MessagePacket, PacketKind};
use crate::messaging::transport::Transport;

/// returned on registration of a listener, used for deregistering it
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ListenerId(pub u64);

/// Listeners are pluggable: they register with a [PacketDispatcher] for a specific
///  [PacketKind], and they are notified of every well-formed packet of that kind that is
///  received.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketListener: Send + Sync + 'static {
    /// This is called on the receive loop, holding it up. Listeners are expected to do their
    ///  work quickly.
    async fn on_packet(&self, packet: &MessagePacket, from: SocketAddr);
}

/// The dispatcher is the central fan-out point between a [Transport]'s receive loop and the
///  listeners registered by group members. There is exactly one dispatcher per transport, and
///  all members sharing a transport share its dispatcher.
#[derive(Default)]
pub struct PacketDispatcher {
    listeners: RwLock<FxHashMap<PacketKind, Vec<(ListenerId, Arc<dyn PacketListener>)>>>,
    next_listener_id: AtomicU64,
}

impl PacketDispatcher {
    pub fn new() -> PacketDispatcher {
        Default::default()
    }

    pub fn register(&self, kind: PacketKind, listener: Arc<dyn PacketListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::AcqRel));
        debug!("registering listener {:?} for {:?}", id, kind);

        self.listeners.write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push((id, listener));
        id
    }

    /// returns `true` iff the listener was registered
    pub fn deregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write()
            .unwrap_or_else(|e| e.into_inner());

        let mut found = false;
        for per_kind in listeners.values_mut() {
            let len_before = per_kind.len();
            per_kind.retain(|(listener_id, _)| *listener_id != id);
            found |= per_kind.len() != len_before;
        }
        listeners.retain(|_, per_kind| !per_kind.is_empty());

        if !found {
            warn!("deregistering listener {:?} that was not registered", id);
        }
        found
    }

    pub fn num_listeners(&self) -> usize {
        self.listeners.read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|l| l.len())
            .sum()
    }

    fn listeners_for(&self, kind: PacketKind) -> Vec<Arc<dyn PacketListener>> {
        self.listeners.read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map(|l| l.iter().map(|(_, listener)| listener.clone()).collect())
            .unwrap_or_default()
    }

    /// decodes a raw datagram and passes it to all listeners for its kind. Malformed packets
    ///  are logged and dropped.
    pub async fn dispatch(&self, raw: &[u8], from: SocketAddr) {
        let packet = match MessagePacket::decode(raw) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("received malformed packet from {:?} - dropping: {}", from, e);
                return;
            }
        };
        trace!("received {:?} packet from {:?}, sender {:?}", packet.kind, from, packet.sender);

        // snapshot: listeners may (de)register while packets are being dispatched
        let listeners = self.listeners_for(packet.kind);
        if listeners.is_empty() {
            trace!("no listener for {:?} packets - ignoring", packet.kind);
        }
        for listener in listeners {
            listener.on_packet(&packet, from).await;
        }
    }

    /// runs until the transport is closed
    pub async fn recv_loop(&self, transport: &dyn Transport) {
        info!("starting receive loop");
        loop {
            match transport.recv().await {
                Ok(Some((buf, from))) => {
                    let correlation_id = Uuid::new_v4();
                    self.dispatch(&buf, from)
                        .instrument(span!(Level::TRACE, "packet_received", ?correlation_id))
                        .await;
                }
                Ok(None) => {
                    info!("transport closed - shutting down receive loop");
                    return;
                }
                Err(e) => {
                    if transport.is_closed() {
                        info!("transport closed - shutting down receive loop");
                        return;
                    }
                    error!("error receiving datagram: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use crate::messaging::member_id::MessageId;
    use crate::messaging::transport::MockTransport;
    use crate::test_util::member::test_member_id_from_number;
    use super::*;

    fn from() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9876))
    }

    fn data_packet() -> MessagePacket {
        MessagePacket::data("g", test_member_id_from_number(1), MessageId::from_u128(1), 0, 1, Bytes::from_static(b"abc"))
    }

    #[tokio::test]
    async fn test_dispatch_by_kind() {
        let dispatcher = PacketDispatcher::new();

        let mut data_listener = MockPacketListener::new();
        data_listener.expect_on_packet()
            .withf(|p, _| p == &data_packet())
            .times(1)
            .return_const(());
        let mut ack_listener = MockPacketListener::new();
        ack_listener.expect_on_packet()
            .never();

        dispatcher.register(PacketKind::Data, Arc::new(data_listener));
        dispatcher.register(PacketKind::Ack, Arc::new(ack_listener));

        dispatcher.dispatch(&data_packet().encode(), from()).await;
    }

    #[tokio::test]
    async fn test_dispatch_to_all_listeners_of_a_kind() {
        let dispatcher = PacketDispatcher::new();
        for _ in 0..3 {
            let mut listener = MockPacketListener::new();
            listener.expect_on_packet()
                .times(1)
                .return_const(());
            dispatcher.register(PacketKind::Data, Arc::new(listener));
        }

        dispatcher.dispatch(&data_packet().encode(), from()).await;
    }

    #[tokio::test]
    async fn test_dispatch_drops_malformed() {
        let dispatcher = PacketDispatcher::new();
        let mut listener = MockPacketListener::new();
        listener.expect_on_packet()
            .never();
        dispatcher.register(PacketKind::Data, Arc::new(listener));

        let mut corrupted = data_packet().encode().to_vec();
        corrupted[8] ^= 1;
        dispatcher.dispatch(&corrupted, from()).await;
        dispatcher.dispatch(b"not a packet at all", from()).await;
    }

    #[tokio::test]
    async fn test_deregister() {
        let dispatcher = PacketDispatcher::new();
        let mut listener = MockPacketListener::new();
        listener.expect_on_packet()
            .never();

        let id = dispatcher.register(PacketKind::Data, Arc::new(listener));
        assert_eq!(dispatcher.num_listeners(), 1);

        assert!(dispatcher.deregister(id));
        assert!(!dispatcher.deregister(id));
        assert_eq!(dispatcher.num_listeners(), 0);

        dispatcher.dispatch(&data_packet().encode(), from()).await;
    }

    #[tokio::test]
    async fn test_recv_loop_until_closed() {
        let mut datagrams = vec![
            Ok(Some((data_packet().encode(), from()))),
            Err(anyhow::anyhow!("transient socket error")),
            Ok(Some((Bytes::from_static(b"garbage"), from()))),
            Ok(Some((data_packet().encode(), from()))),
            Ok(None),
        ].into_iter();

        let mut transport = MockTransport::new();
        transport.expect_recv()
            .times(5)
            .returning(move || datagrams.next().expect("recv called after close"));
        transport.expect_is_closed()
            .return_const(false);

        let dispatcher = PacketDispatcher::new();
        let mut listener = MockPacketListener::new();
        listener.expect_on_packet()
            .times(2)
            .return_const(());
        dispatcher.register(PacketKind::Data, Arc::new(listener));

        dispatcher.recv_loop(&transport).await;
    }
}
