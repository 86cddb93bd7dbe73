use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::select;
use tokio::sync::Notify;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::config::GroupsConfig;
use crate::messaging::dispatcher::PacketListener;
use crate::messaging::member_id::{MemberId, MessageId};
use crate::messaging::packet::{MessagePacket, PacketKind};
use crate::messaging::transport::Transport;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// returned by `send()` if some live members did not acknowledge all packets of a message
///  within the send timeout
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("message {message_id:?} was not acknowledged by all members - missing sequence numbers: {missing:?}")]
pub struct PartialDeliveryError {
    pub message_id: MessageId,
    pub missing: BTreeMap<MemberId, Vec<u32>>,
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("message of {size} bytes exceeds the maximum message size of {max_size} bytes")]
pub struct MessageTooLargeError {
    pub size: usize,
    pub max_size: usize,
}

struct PendingSend {
    /// members that did not acknowledge yet, per sequence number
    outstanding: BTreeMap<u32, FxHashSet<MemberId>>,
    notify: Arc<Notify>,
}

/// The table of acknowledgements that in-flight sends of a member are waiting for. It is filled
///  by the receive loop and read by the sending tasks.
#[derive(Default)]
pub struct PendingAcks {
    pending: Mutex<FxHashMap<MessageId, PendingSend>>,
}

impl PendingAcks {
    pub fn new() -> PendingAcks {
        Default::default()
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<MessageId, PendingSend>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a message as waiting for acknowledgement of all its packets by all `members`.
    ///  The returned [Notify] is signalled when the last outstanding acknowledgement arrives.
    pub fn register(&self, message_id: MessageId, total_count: u32, members: &[MemberId]) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        let members = members.iter().copied().collect::<FxHashSet<_>>();

        let outstanding = if members.is_empty() {
            BTreeMap::default()
        }
        else {
            (0..total_count)
                .map(|sequence| (sequence, members.clone()))
                .collect()
        };

        self.lock().insert(message_id, PendingSend {
            outstanding,
            notify: notify.clone(),
        });
        notify
    }

    /// ACKs for unknown messages, sequence numbers or members are ignored
    pub fn on_ack(&self, message_id: MessageId, sequence: u32, member: MemberId) {
        let mut pending = self.lock();
        let Some(pending_send) = pending.get_mut(&message_id) else {
            trace!("ACK for message {:?} that is not pending - ignoring", message_id);
            return;
        };
        let Some(members) = pending_send.outstanding.get_mut(&sequence) else {
            trace!("ACK for sequence {} of message {:?} that is not outstanding - ignoring", sequence, message_id);
            return;
        };
        if !members.remove(&member) {
            return;
        }

        if members.is_empty() {
            pending_send.outstanding.remove(&sequence);
            if pending_send.outstanding.is_empty() {
                trace!("message {:?} is fully acknowledged", message_id);
                pending_send.notify.notify_one();
            }
        }
    }

    /// stops waiting for acknowledgements from a member that left or was evicted
    pub fn forget_member(&self, member: &MemberId) {
        for (message_id, pending_send) in self.lock().iter_mut() {
            if pending_send.outstanding.is_empty() {
                continue;
            }

            pending_send.outstanding.retain(|_, members| {
                members.remove(member);
                !members.is_empty()
            });
            if pending_send.outstanding.is_empty() {
                debug!("message {:?} is complete after member {:?} departed", message_id, member);
                pending_send.notify.notify_one();
            }
        }
    }

    /// sequence numbers of a message that are not acknowledged by all members yet
    pub fn outstanding_sequences(&self, message_id: &MessageId) -> Vec<u32> {
        self.lock()
            .get(message_id)
            .map(|p| p.outstanding.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_complete(&self, message_id: &MessageId) -> bool {
        self.lock()
            .get(message_id)
            .map(|p| p.outstanding.is_empty())
            .unwrap_or(true)
    }

    pub fn num_pending(&self) -> usize {
        self.lock().len()
    }

    /// removes a message's entry, returning the missing sequence numbers per member
    pub fn remove(&self, message_id: &MessageId) -> BTreeMap<MemberId, Vec<u32>> {
        let mut missing: BTreeMap<MemberId, Vec<u32>> = BTreeMap::new();
        if let Some(pending_send) = self.lock().remove(message_id) {
            for (sequence, members) in pending_send.outstanding {
                for member in members {
                    missing.entry(member).or_default().push(sequence);
                }
            }
        }
        missing
    }
}

/// removes a pending send's entry when the sending future completes or is dropped
struct PendingGuard<'a> {
    pending_acks: &'a PendingAcks,
    message_id: MessageId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending_acks.remove(&self.message_id);
    }
}

/// Feeds received ACK packets of a group into its [PendingAcks]
pub struct AckListener {
    group_name: String,
    myself: MemberId,
    pending_acks: Arc<PendingAcks>,
}

impl AckListener {
    pub fn new(group_name: &str, myself: MemberId, pending_acks: Arc<PendingAcks>) -> AckListener {
        AckListener {
            group_name: group_name.to_string(),
            myself,
            pending_acks,
        }
    }
}

#[async_trait]
impl PacketListener for AckListener {
    async fn on_packet(&self, packet: &MessagePacket, _from: SocketAddr) {
        if packet.kind != PacketKind::Ack || packet.group_name != self.group_name || packet.sender == self.myself {
            return;
        }
        trace!("ACK from {:?} for {:?}#{}", packet.sender, packet.message_id, packet.sequence);
        self.pending_acks.on_ack(packet.message_id, packet.sequence, packet.sender);
    }
}

pub struct MessageSender {
    group_name: String,
    myself: MemberId,
    config: Arc<GroupsConfig>,
    transport: Arc<dyn Transport>,
    pending_acks: Arc<PendingAcks>,
}

impl MessageSender {
    pub fn new(group_name: &str, myself: MemberId, config: Arc<GroupsConfig>, transport: Arc<dyn Transport>, pending_acks: Arc<PendingAcks>) -> MessageSender {
        MessageSender {
            group_name: group_name.to_string(),
            myself,
            config,
            transport,
            pending_acks,
        }
    }

    /// Sends a message to the group, returning when all `live_members` acknowledged all of its
    ///  packets, or failing with a [PartialDeliveryError] when the send timeout expires first.
    pub async fn send(&self, message: &[u8], live_members: &[MemberId]) -> anyhow::Result<()> {
        if message.len() > self.config.max_message_size {
            return Err(MessageTooLargeError {
                size: message.len(),
                max_size: self.config.max_message_size,
            }.into());
        }
        if live_members.is_empty() {
            debug!("no live members in group {} - not sending", self.group_name);
            return Ok(());
        }

        let message_id = MessageId::random();
        let packets = self.chunk(message_id, message);
        debug!("sending message {:?} of {} bytes in {} packets to {:?}", message_id, message.len(), packets.len(), live_members);

        // register before sending so that no ACK is missed
        let notify = self.pending_acks.register(message_id, packets.len().prechecked_cast(), live_members);
        let _guard = PendingGuard {
            pending_acks: self.pending_acks.as_ref(),
            message_id,
        };

        for packet in &packets {
            self.send_packet(packet).await;
        }
        self.await_acks(message_id, &packets, notify).await
    }

    fn chunk(&self, message_id: MessageId, message: &[u8]) -> Vec<Bytes> {
        let message = Bytes::copy_from_slice(message);
        let chunk_size = self.config.max_chunk_size;
        let total_count: u32 = message.len().div_ceil(chunk_size).max(1).prechecked_cast();

        (0..total_count)
            .map(|sequence| {
                let start = SafeCast::<usize>::safe_cast(sequence) * chunk_size;
                let end = (start + chunk_size).min(message.len());
                MessagePacket::data(&self.group_name, self.myself, message_id, sequence, total_count, message.slice(start..end))
                    .encode()
            })
            .collect()
    }

    async fn await_acks(&self, message_id: MessageId, packets: &[Bytes], notify: Arc<Notify>) -> anyhow::Result<()> {
        let timeout = time::sleep_until(Instant::now() + self.config.send_timeout);
        tokio::pin!(timeout);

        let mut resend_ticks = time::interval_at(Instant::now() + self.config.resend_interval, self.config.resend_interval);
        resend_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.pending_acks.is_complete(&message_id) {
                debug!("message {:?} was acknowledged by all members", message_id);
                return Ok(());
            }

            select! {
                _ = notify.notified() => {}
                _ = resend_ticks.tick() => {
                    let outstanding = self.pending_acks.outstanding_sequences(&message_id);
                    debug!("resending {} packets of message {:?}", outstanding.len(), message_id);
                    for sequence in outstanding {
                        if let Some(packet) = packets.get(SafeCast::<usize>::safe_cast(sequence)) {
                            self.send_packet(packet).await;
                        }
                    }
                }
                _ = &mut timeout => {
                    let missing = self.pending_acks.remove(&message_id);
                    if missing.is_empty() {
                        return Ok(());
                    }
                    warn!("message {:?} was not acknowledged by all members: {:?}", message_id, missing);
                    return Err(PartialDeliveryError {
                        message_id,
                        missing,
                    }.into());
                }
            }
        }
    }

    /// failures are logged, resending takes care of lost packets
    async fn send_packet(&self, packet: &[u8]) {
        if let Err(e) = self.transport.send(packet).await {
            warn!("error sending packet for group {}: {}", self.group_name, e);
        }
    }
}
