use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use crate::config::GroupsConfig;
use crate::groups::group_events::{GroupEvent, GroupEventNotifier};
use crate::groups::member_registry::{MemberInfo, MemberRegistry};
use crate::groups::message_sender::PendingAcks;
use crate::groups::net_time::{current_time_millis, NetTime};
use crate::messaging::dispatcher::PacketListener;
use crate::messaging::member_id::MemberId;
use crate::messaging::packet::{AnnounceData, MessagePacket, PacketKind};
use crate::messaging::transport::Transport;

/// Membership ties together everything that depends on the set of members of a group: the
///  registry, net time, and the acknowledgements that pending sends wait for.
pub struct Membership {
    group_name: String,
    myself: MemberId,
    registry: RwLock<MemberRegistry>,
    net_time: Arc<NetTime>,
    pending_acks: Arc<PendingAcks>,
    events: Arc<GroupEventNotifier>,
    transport: Arc<dyn Transport>,
    announce_counter: AtomicU64,
}

impl Membership {
    pub fn new(
        group_name: &str,
        myself: MemberId,
        config: &GroupsConfig,
        transport: Arc<dyn Transport>,
        pending_acks: Arc<PendingAcks>,
        events: Arc<GroupEventNotifier>,
    ) -> Membership {
        Membership {
            group_name: group_name.to_string(),
            myself,
            registry: RwLock::new(MemberRegistry::new(myself, config)),
            net_time: Arc::new(NetTime::new()),
            pending_acks,
            events,
            transport,
            announce_counter: AtomicU64::new(0),
        }
    }

    pub fn net_time(&self) -> &Arc<NetTime> {
        &self.net_time
    }

    pub async fn live_members(&self) -> Vec<MemberId> {
        self.registry.read().await
            .live_members()
    }

    pub async fn members(&self) -> Vec<MemberInfo> {
        self.registry.read().await
            .members()
    }

    pub async fn announce_myself(&self) {
        let data = AnnounceData {
            timestamp_millis: current_time_millis(),
            counter: self.announce_counter.fetch_add(1, Ordering::AcqRel),
        };
        trace!("announcing {:?} in group {}: {:?}", self.myself, self.group_name, data);

        let packet = MessagePacket::announce(&self.group_name, self.myself, &data);
        if let Err(e) = self.transport.send(&packet.encode()).await {
            warn!("error sending announce for group {}: {}", self.group_name, e);
        }
    }

    /// best effort, there is no acknowledgement for LEAVING
    pub async fn announce_leaving(&self) {
        debug!("sending LEAVING for {:?} in group {}", self.myself, self.group_name);
        let packet = MessagePacket::leaving(&self.group_name, self.myself);
        if let Err(e) = self.transport.send(&packet.encode()).await {
            warn!("error sending LEAVING for group {}: {}", self.group_name, e);
        }
    }

    pub async fn on_announce(&self, member: MemberId, data: AnnounceData) {
        if member == self.myself {
            return;
        }
        let local_receive_millis = current_time_millis();

        let is_new = self.registry.write().await
            .announce(member);
        self.net_time.on_announce(member, data.timestamp_millis, local_receive_millis);

        if is_new {
            self.events.send_event(GroupEvent::MemberJoined(member));
            // the new member should learn about us without waiting for our next regular announce
            self.announce_myself().await;
        }
    }

    pub async fn on_leaving(&self, member: MemberId) {
        if member == self.myself {
            return;
        }

        let was_known = self.registry.write().await
            .remove(&member);
        self.forget(&member);

        if was_known {
            self.events.send_event(GroupEvent::MemberLeft(member));
        }
    }

    /// removes members that stopped announcing, returning them
    pub async fn evict_stale(&self) -> Vec<MemberId> {
        let evicted = self.registry.write().await
            .evict_stale();

        for member in &evicted {
            info!("evicting member {:?} from group {}: no announce received", member, self.group_name);
            self.forget(member);
            self.events.send_event(GroupEvent::MemberEvicted(*member));
        }
        evicted
    }

    fn forget(&self, member: &MemberId) {
        self.net_time.forget(member);
        self.pending_acks.forget_member(member);
    }
}

/// handles MEMBER_ANNOUNCE and MEMBER_LEAVING packets of a group
pub struct MembershipListener {
    group_name: String,
    membership: Arc<Membership>,
}

impl MembershipListener {
    pub fn new(group_name: &str, membership: Arc<Membership>) -> MembershipListener {
        MembershipListener {
            group_name: group_name.to_string(),
            membership,
        }
    }
}

#[async_trait]
impl PacketListener for MembershipListener {
    async fn on_packet(&self, packet: &MessagePacket, from: SocketAddr) {
        if packet.group_name != self.group_name {
            return;
        }

        match packet.kind {
            PacketKind::MemberAnnounce => {
                match packet.announce_data() {
                    Ok(data) => self.membership.on_announce(packet.sender, data).await,
                    Err(e) => warn!("received invalid announce from {:?} - dropping: {}", from, e),
                }
            }
            PacketKind::MemberLeaving => self.membership.on_leaving(packet.sender).await,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;
    use bytes::Bytes;
    use tokio::time;
    use crate::messaging::member_id::MessageId;
    use crate::messaging::transport::MockTransport;
    use crate::test_util::member::{test_config, test_member_id_from_number};
    use super::*;

    struct Fixture {
        membership: Arc<Membership>,
        pending_acks: Arc<PendingAcks>,
        events: tokio::sync::broadcast::Receiver<GroupEvent>,
        sent: Arc<Mutex<Vec<MessagePacket>>>,
    }

    fn fixture() -> Fixture {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut transport = MockTransport::new();
        {
            let sent = sent.clone();
            transport.expect_send()
                .returning(move |buf| {
                    sent.lock().unwrap().push(MessagePacket::decode(buf).unwrap());
                    Ok(())
                });
        }

        let pending_acks = Arc::new(PendingAcks::new());
        let events = Arc::new(GroupEventNotifier::new());
        let subscription = events.subscribe();
        let membership = Arc::new(Membership::new("g", test_member_id_from_number(1), &test_config(), Arc::new(transport), pending_acks.clone(), events));

        Fixture {
            membership,
            pending_acks,
            events: subscription,
            sent,
        }
    }

    fn announce(timestamp_millis: i64) -> AnnounceData {
        AnnounceData { timestamp_millis, counter: 0 }
    }

    fn from() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_announce_myself() {
        let fixture = fixture();
        fixture.membership.announce_myself().await;
        fixture.membership.announce_myself().await;

        let sent = fixture.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        for (expected_counter, packet) in sent.iter().enumerate() {
            assert_eq!(packet.kind, PacketKind::MemberAnnounce);
            assert_eq!(packet.group_name, "g");
            assert_eq!(packet.sender, test_member_id_from_number(1));
            assert_eq!(packet.announce_data().unwrap().counter, expected_counter as u64);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_announce_new_member() {
        let mut fixture = fixture();

        fixture.membership.on_announce(test_member_id_from_number(2), announce(current_time_millis())).await;
        assert_eq!(fixture.events.try_recv().unwrap(), GroupEvent::MemberJoined(test_member_id_from_number(2)));
        assert_eq!(fixture.sent.lock().unwrap().len(), 1);

        // known member: no event, no immediate announce
        fixture.membership.on_announce(test_member_id_from_number(2), announce(current_time_millis())).await;
        assert!(fixture.events.try_recv().is_err());
        assert_eq!(fixture.sent.lock().unwrap().len(), 1);

        // own announce via multicast loopback
        fixture.membership.on_announce(test_member_id_from_number(1), announce(current_time_millis())).await;
        assert_eq!(fixture.membership.live_members().await, vec![test_member_id_from_number(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_announce_updates_net_time() {
        let fixture = fixture();
        fixture.membership.on_announce(test_member_id_from_number(2), announce(current_time_millis() + 60_000)).await;

        let offset = fixture.membership.net_time().offset_millis();
        assert!((29_000..=30_000).contains(&offset), "offset {}", offset);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_leaving() {
        let mut fixture = fixture();
        fixture.membership.on_announce(test_member_id_from_number(2), announce(current_time_millis() + 60_000)).await;
        fixture.membership.on_announce(test_member_id_from_number(3), announce(current_time_millis())).await;
        let _ = fixture.events.try_recv();
        let _ = fixture.events.try_recv();

        let message_id = MessageId::from_u128(1);
        fixture.pending_acks.register(message_id, 1, &[test_member_id_from_number(2)]);

        fixture.membership.on_leaving(test_member_id_from_number(2)).await;

        assert_eq!(fixture.events.try_recv().unwrap(), GroupEvent::MemberLeft(test_member_id_from_number(2)));
        assert_eq!(fixture.membership.live_members().await, vec![test_member_id_from_number(3)]);
        assert!(fixture.pending_acks.is_complete(&message_id));
        assert!(fixture.membership.net_time().offset_millis().abs() < 1_000);

        // unknown member
        fixture.membership.on_leaving(test_member_id_from_number(2)).await;
        assert!(fixture.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_stale() {
        let mut fixture = fixture();
        fixture.membership.on_announce(test_member_id_from_number(2), announce(current_time_millis())).await;
        fixture.membership.on_announce(test_member_id_from_number(3), announce(current_time_millis())).await;
        let _ = fixture.events.try_recv();
        let _ = fixture.events.try_recv();

        let message_id = MessageId::from_u128(1);
        fixture.pending_acks.register(message_id, 1, &[test_member_id_from_number(2), test_member_id_from_number(3)]);

        time::advance(Duration::from_millis(300)).await;
        fixture.membership.on_announce(test_member_id_from_number(3), announce(current_time_millis())).await;
        assert!(fixture.membership.evict_stale().await.is_empty());

        time::advance(Duration::from_millis(200)).await;
        assert_eq!(fixture.membership.evict_stale().await, vec![test_member_id_from_number(2)]);
        assert_eq!(fixture.events.try_recv().unwrap(), GroupEvent::MemberEvicted(test_member_id_from_number(2)));
        assert_eq!(fixture.pending_acks.outstanding_sequences(&message_id), vec![0]);
        assert_eq!(fixture.membership.live_members().await, vec![test_member_id_from_number(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener() {
        let fixture = fixture();
        let listener = MembershipListener::new("g", fixture.membership.clone());

        let announce_packet = MessagePacket::announce("g", test_member_id_from_number(2), &announce(current_time_millis()));
        listener.on_packet(&announce_packet, from()).await;
        assert_eq!(fixture.membership.live_members().await, vec![test_member_id_from_number(2)]);

        let foreign = MessagePacket::announce("other", test_member_id_from_number(3), &announce(current_time_millis()));
        listener.on_packet(&foreign, from()).await;

        let mut invalid = MessagePacket::announce("g", test_member_id_from_number(4), &announce(current_time_millis()));
        invalid.payload = Bytes::from_static(b"short");
        listener.on_packet(&invalid, from()).await;
        assert_eq!(fixture.membership.live_members().await, vec![test_member_id_from_number(2)]);

        listener.on_packet(&MessagePacket::leaving("g", test_member_id_from_number(2)), from()).await;
        assert!(fixture.membership.live_members().await.is_empty());
    }
}
