use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::GroupsConfig;
use crate::messaging::dispatcher::PacketListener;
use crate::messaging::member_id::{MemberId, MessageId};
use crate::messaging::packet::{MessagePacket, PacketKind};
use crate::messaging::transport::Transport;
use crate::util::safe_converter::SafeCast;

/// An application callback for complete messages. It is called on the receive loop.
pub type DataListener = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// identifies a registered [DataListener]. Packet listeners of the dispatcher have their own
///  [crate::messaging::dispatcher::ListenerId]s.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DataListenerId(pub u64);

#[derive(Default)]
pub struct DataListeners {
    listeners: RwLock<Vec<(DataListenerId, DataListener)>>,
    next_listener_id: AtomicU64,
}

impl DataListeners {
    pub fn add(&self, listener: DataListener) -> DataListenerId {
        let id = DataListenerId(self.next_listener_id.fetch_add(1, Ordering::AcqRel));
        self.listeners.write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        id
    }

    /// returns `true` iff the listener was registered
    pub fn remove(&self, id: DataListenerId) -> bool {
        let mut listeners = self.listeners.write()
            .unwrap_or_else(|e| e.into_inner());
        let len_before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != len_before
    }

    pub fn clear(&self) {
        self.listeners.write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, message: &[u8]) {
        // snapshot: a listener may (de)register listeners
        let listeners = self.listeners.read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| l.clone())
            .collect::<Vec<_>>();

        for listener in listeners {
            listener(message);
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ChunkOutcome {
    Buffered,
    /// the chunk was received before
    Duplicate,
    Complete(Bytes),
    /// the chunk is inconsistent with previously received chunks, or the message is too big
    Rejected,
}

struct IncompleteMessage {
    total_count: u32,
    chunks: BTreeMap<u32, Bytes>,
    first_received: Instant,
}

impl IncompleteMessage {
    fn assemble(self) -> Bytes {
        let len = self.chunks.values().map(|c| c.len()).sum();
        let mut result = BytesMut::with_capacity(len);
        for chunk in self.chunks.into_values() {
            result.extend_from_slice(&chunk);
        }
        result.freeze()
    }
}

/// Reassembly of messages from their chunks, deduplicating chunks that are received more than
///  once (typically due to resends).
///
/// Incomplete messages are discarded after a configured time to live. Ids of completed
///  messages are kept for the same time so that late resends are not delivered a second time.
pub struct Reassembly {
    max_packets_per_message: usize,
    ttl: Duration,
    incomplete: FxHashMap<MessageId, IncompleteMessage>,
    completed: FxHashMap<MessageId, Instant>,
}

impl Reassembly {
    pub fn new(config: &GroupsConfig) -> Reassembly {
        Reassembly {
            max_packets_per_message: config.max_packets_per_message(),
            ttl: config.incomplete_message_ttl,
            incomplete: Default::default(),
            completed: Default::default(),
        }
    }

    pub fn on_chunk(&mut self, packet: &MessagePacket) -> ChunkOutcome {
        let message_id = packet.message_id;
        if self.completed.contains_key(&message_id) {
            trace!("chunk {} of message {:?} that was received completely - ignoring", packet.sequence, message_id);
            return ChunkOutcome::Duplicate;
        }
        if SafeCast::<usize>::safe_cast(packet.total_count) > self.max_packets_per_message {
            warn!("message {:?} from {:?} has {} packets, exceeding the maximum of {} - dropping", message_id, packet.sender, packet.total_count, self.max_packets_per_message);
            return ChunkOutcome::Rejected;
        }

        let now = Instant::now();
        let incomplete = self.incomplete.entry(message_id)
            .or_insert_with(|| IncompleteMessage {
                total_count: packet.total_count,
                chunks: BTreeMap::new(),
                first_received: now,
            });

        if incomplete.total_count != packet.total_count {
            warn!("chunk {} of message {:?} says there are {} packets, previous chunks said {} - dropping", packet.sequence, message_id, packet.total_count, incomplete.total_count);
            return ChunkOutcome::Rejected;
        }
        if incomplete.chunks.contains_key(&packet.sequence) {
            trace!("duplicate chunk {} of message {:?}", packet.sequence, message_id);
            return ChunkOutcome::Duplicate;
        }

        incomplete.chunks.insert(packet.sequence, packet.payload.clone());
        if SafeCast::<usize>::safe_cast(incomplete.total_count) > incomplete.chunks.len() {
            return ChunkOutcome::Buffered;
        }

        match self.incomplete.remove(&message_id) {
            Some(complete) => {
                self.completed.insert(message_id, now);
                ChunkOutcome::Complete(complete.assemble())
            }
            None => ChunkOutcome::Buffered,
        }
    }

    /// discards incomplete messages and completed message ids that are older than the ttl
    pub fn expire(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.incomplete.retain(|message_id, incomplete| {
            let keep = now.saturating_duration_since(incomplete.first_received) <= ttl;
            if !keep {
                debug!("discarding incomplete message {:?}: received {} of {} chunks", message_id, incomplete.chunks.len(), incomplete.total_count);
            }
            keep
        });
        self.completed.retain(|_, completed_at| now.saturating_duration_since(*completed_at) <= ttl);
    }

    pub fn num_incomplete(&self) -> usize {
        self.incomplete.len()
    }
}

/// Receives DATA packets of a group, acknowledges them and passes complete messages to the
///  application's listeners.
pub struct MessageReceiver {
    group_name: String,
    myself: MemberId,
    transport: Arc<dyn Transport>,
    reassembly: Mutex<Reassembly>,
    listeners: Arc<DataListeners>,
}

impl MessageReceiver {
    pub fn new(group_name: &str, myself: MemberId, config: &GroupsConfig, transport: Arc<dyn Transport>, listeners: Arc<DataListeners>) -> MessageReceiver {
        MessageReceiver {
            group_name: group_name.to_string(),
            myself,
            transport,
            reassembly: Mutex::new(Reassembly::new(config)),
            listeners,
        }
    }

    pub fn expire(&self) {
        self.reassembly.lock()
            .unwrap_or_else(|e| e.into_inner())
            .expire(Instant::now());
    }

    async fn send_ack(&self, data: &MessagePacket) {
        let ack = MessagePacket::ack_for(data, self.myself);
        if let Err(e) = self.transport.send(&ack.encode()).await {
            warn!("error sending ACK for {:?}#{}: {}", data.message_id, data.sequence, e);
        }
    }
}

#[async_trait]
impl PacketListener for MessageReceiver {
    async fn on_packet(&self, packet: &MessagePacket, _from: SocketAddr) {
        if packet.kind != PacketKind::Data || packet.group_name != self.group_name || packet.sender == self.myself {
            return;
        }
        trace!("DATA from {:?} for {:?}#{}", packet.sender, packet.message_id, packet.sequence);

        let outcome = self.reassembly.lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_chunk(packet);

        match outcome {
            ChunkOutcome::Rejected => {}
            ChunkOutcome::Buffered | ChunkOutcome::Duplicate => self.send_ack(packet).await,
            ChunkOutcome::Complete(message) => {
                self.send_ack(packet).await;
                debug!("received message {:?} of {} bytes from {:?}", packet.message_id, message.len(), packet.sender);
                self.listeners.notify(&message);
            }
        }
    }
}
