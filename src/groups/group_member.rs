use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use anyhow::bail;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info};

use crate::config::GroupsConfig;
use crate::groups::group_events::{GroupEvent, GroupEventNotifier};
use crate::groups::member_registry::MemberInfo;
use crate::groups::membership::{Membership, MembershipListener};
use crate::groups::message_receiver::{DataListenerId, DataListeners, MessageReceiver};
use crate::groups::message_sender::{AckListener, MessageSender, PendingAcks};
use crate::groups::net_time::NetTime;
use crate::messaging::dispatcher::{ListenerId, PacketListener};
use crate::messaging::endpoint::Endpoint;
use crate::messaging::member_id::MemberId;
use crate::messaging::packet::PacketKind;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum GroupState {
    Joining = 0,
    Open = 1,
    Leaving = 2,
    Closed = 3,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum GroupStateError {
    #[error("group member is {0:?}, the operation requires it to be open")]
    NotOpen(GroupState),
}

/// A member's handle on a group: this is the API for sending messages to the group and for
///  receiving messages from it.
///
/// Joining starts a background task that periodically announces the member to the group, evicts
///  members that stopped announcing, and discards stale partially received messages. Leaving
///  stops it and detaches the member from its [Endpoint]. Dropping a member without leaving
///  detaches it as well, but without telling the other members: they evict it once its
///  announces stop.
pub struct GroupMember {
    id: MemberId,
    group_name: String,
    endpoint: Arc<Endpoint>,
    state: AtomicU8,
    membership: Arc<Membership>,
    sender: MessageSender,
    data_listeners: Arc<DataListeners>,
    events: Arc<GroupEventNotifier>,
    packet_listener_ids: Mutex<Vec<ListenerId>>,
    announce_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Debug for GroupMember {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "GroupMember{{{:?}@{}:{:?}}}", self.id, self.group_name, self.state())
    }
}

impl Drop for GroupMember {
    fn drop(&mut self) {
        if self.transition(GroupState::Open, GroupState::Closed) {
            debug!("member {:?} of group {} dropped without leaving", self.id, self.group_name);
            self.stop_announcing();
            self.detach();
        }
    }
}

/// joins a group through a dedicated endpoint, i.e. a new multicast socket
pub async fn join_group(config: GroupsConfig, group_name: &str) -> anyhow::Result<GroupMember> {
    let endpoint = Endpoint::open(&config).await?;
    GroupMember::join(endpoint, Arc::new(config), group_name).await
}

impl GroupMember {
    pub async fn join(endpoint: Arc<Endpoint>, config: Arc<GroupsConfig>, group_name: &str) -> anyhow::Result<GroupMember> {
        config.validate()?;
        if group_name.is_empty() {
            bail!("group name must not be empty");
        }
        if group_name.len() > u8::MAX as usize {
            bail!("group name must not be longer than {} bytes", u8::MAX);
        }

        endpoint.attach()?;

        let id = MemberId::random();
        info!("member {:?} joining group {}", id, group_name);

        let transport = endpoint.transport().clone();
        let pending_acks = Arc::new(PendingAcks::new());
        let events = Arc::new(GroupEventNotifier::new());
        let data_listeners = Arc::new(DataListeners::default());

        let membership = Arc::new(Membership::new(group_name, id, &config, transport.clone(), pending_acks.clone(), events.clone()));
        let receiver = Arc::new(MessageReceiver::new(group_name, id, &config, transport.clone(), data_listeners.clone()));
        let ack_listener: Arc<dyn PacketListener> = Arc::new(AckListener::new(group_name, id, pending_acks.clone()));
        let membership_listener: Arc<dyn PacketListener> = Arc::new(MembershipListener::new(group_name, membership.clone()));

        let dispatcher = endpoint.dispatcher();
        let packet_listener_ids = vec![
            dispatcher.register(PacketKind::Data, receiver.clone()),
            dispatcher.register(PacketKind::Ack, ack_listener),
            dispatcher.register(PacketKind::MemberAnnounce, membership_listener.clone()),
            dispatcher.register(PacketKind::MemberLeaving, membership_listener),
        ];

        let announce_loop = tokio::spawn(run_announce_loop(config.clone(), membership.clone(), receiver));

        let member = GroupMember {
            id,
            group_name: group_name.to_string(),
            sender: MessageSender::new(group_name, id, config, transport, pending_acks),
            endpoint,
            state: AtomicU8::new(GroupState::Joining.into()),
            membership,
            data_listeners,
            events,
            packet_listener_ids: Mutex::new(packet_listener_ids),
            announce_loop: Mutex::new(Some(announce_loop)),
        };
        member.state.store(GroupState::Open.into(), Ordering::Release);
        Ok(member)
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn state(&self) -> GroupState {
        GroupState::try_from(self.state.load(Ordering::Acquire))
            .unwrap_or(GroupState::Closed)
    }

    fn transition(&self, from: GroupState, to: GroupState) -> bool {
        self.state.compare_exchange(from.into(), to.into(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn check_open(&self) -> anyhow::Result<()> {
        match self.state() {
            GroupState::Open => Ok(()),
            state => Err(GroupStateError::NotOpen(state).into()),
        }
    }

    /// Sends a message to all members of the group, returning when all members that are live
    ///  at the time of the call acknowledged it (see [crate::groups::message_sender::PartialDeliveryError])
    pub async fn send(&self, message: &[u8]) -> anyhow::Result<()> {
        self.check_open()?;
        let live_members = self.membership.live_members().await;
        self.sender.send(message, &live_members).await
    }

    /// Registers a callback for messages received from other members. Callbacks are called on
    ///  the endpoint's receive loop and should return quickly.
    pub fn add_listener(&self, listener: impl Fn(&[u8]) + Send + Sync + 'static) -> anyhow::Result<DataListenerId> {
        self.check_open()?;
        Ok(self.data_listeners.add(Arc::new(listener)))
    }

    pub fn remove_listener(&self, id: DataListenerId) -> anyhow::Result<()> {
        self.check_open()?;
        if !self.data_listeners.remove(id) {
            bail!("listener {:?} is not registered", id);
        }
        Ok(())
    }

    /// all members of the group, including this one
    pub async fn members(&self) -> Vec<MemberInfo> {
        self.membership.members().await
    }

    pub fn net_time(&self) -> Arc<NetTime> {
        self.membership.net_time().clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<GroupEvent> {
        self.events.subscribe()
    }

    /// Leaves the group, telling the other members. Leaving a group more than once has no
    ///  effect.
    pub async fn leave(&self) -> anyhow::Result<()> {
        if !self.transition(GroupState::Open, GroupState::Leaving) {
            debug!("member {:?} is {:?} - ignoring leave", self.id, self.state());
            return Ok(());
        }
        info!("member {:?} leaving group {}", self.id, self.group_name);

        self.stop_announcing();
        self.membership.announce_leaving().await;
        self.detach();

        self.state.store(GroupState::Closed.into(), Ordering::Release);
        Ok(())
    }

    fn stop_announcing(&self) {
        if let Some(handle) = self.announce_loop.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    fn detach(&self) {
        let listener_ids = std::mem::take(&mut *self.packet_listener_ids.lock().unwrap_or_else(|e| e.into_inner()));
        for id in listener_ids {
            self.endpoint.dispatcher().deregister(id);
        }
        self.data_listeners.clear();
        self.endpoint.detach();
    }
}

async fn run_announce_loop(config: Arc<GroupsConfig>, membership: Arc<Membership>, receiver: Arc<MessageReceiver>) {
    let mut ticks = time::interval(config.member_announce_interval);
    ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        ticks.tick().await;

        membership.evict_stale().await;
        membership.announce_myself().await;
        receiver.expire();
    }
}
