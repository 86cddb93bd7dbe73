use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use anyhow::bail;

/// Protocol overhead of a DATA packet in addition to the group name and the chunk itself: header
///  fields, the varint encoded payload length and the trailing checksum (with some slack)
const DATA_PACKET_OVERHEAD: usize = 64;

#[derive(Debug, Clone)]
pub struct GroupsConfig {
    /// The multicast group that all members of all groups on this transport share. Group names
    ///  are part of every packet, so several groups can use the same multicast address.
    pub multicast_addr: Ipv4Addr,
    pub multicast_port: u16,
    /// The local interface used for joining the multicast group and for sending. `0.0.0.0`
    ///  leaves the choice to the operating system.
    pub interface_addr: Ipv4Addr,
    pub multicast_ttl: u32,
    /// This must be `true` for several members on the same host (or in the same process) to
    ///  see each other
    pub multicast_loop: bool,

    /// maximum time a `send()` waits for acknowledgements before reporting partial delivery
    pub send_timeout: Duration,
    /// interval for re-sending packets that were not acknowledged by all live members
    pub resend_interval: Duration,
    pub member_announce_interval: Duration,
    /// number of announce intervals without an announce after which a member is evicted
    pub missed_announce_budget: u32,

    /// This is the number of message bytes per DATA packet. Together with the group name and
    ///  protocol overhead it must fit into a single UDP datagram, and it should be chosen so
    ///  that packets are not fragmented on the network (i.e. below the path MTU).
    pub max_chunk_size: usize,
    pub max_message_size: usize,
    /// time after which partially received messages are discarded, and after which resends of
    ///  completely received messages are not recognized as duplicates any more
    pub incomplete_message_ttl: Duration,
    /// size of the receive buffer, i.e. the largest datagram that can be received
    pub max_datagram_size: usize,
}

impl Default for GroupsConfig {
    fn default() -> Self {
        GroupsConfig::new(Ipv4Addr::new(239, 255, 42, 99), 9876)
    }
}

impl GroupsConfig {
    pub fn new(multicast_addr: Ipv4Addr, multicast_port: u16) -> GroupsConfig {
        GroupsConfig {
            multicast_addr,
            multicast_port,
            interface_addr: Ipv4Addr::UNSPECIFIED,
            multicast_ttl: 1,
            multicast_loop: true,
            send_timeout: Duration::from_secs(10),
            resend_interval: Duration::from_secs(1),
            member_announce_interval: Duration::from_secs(2),
            missed_announce_budget: 2,
            max_chunk_size: 1024,
            max_message_size: 16*1024*1024,
            incomplete_message_ttl: Duration::from_secs(60),
            max_datagram_size: 65507,
        }
    }

    /// convenience for callers that hold the timing configuration as plain numbers of seconds
    pub fn from_seconds(
        multicast_addr: Ipv4Addr,
        multicast_port: u16,
        send_timeout_seconds: u64,
        resend_interval_seconds: u64,
        member_announce_interval_seconds: u64,
    ) -> GroupsConfig {
        let send_timeout = Duration::from_secs(send_timeout_seconds);
        GroupsConfig {
            send_timeout,
            incomplete_message_ttl: Duration::from_secs(60).max(send_timeout.saturating_mul(2)),
            resend_interval: Duration::from_secs(resend_interval_seconds),
            member_announce_interval: Duration::from_secs(member_announce_interval_seconds),
            ..GroupsConfig::new(multicast_addr, multicast_port)
        }
    }

    pub fn multicast_socket_addr(&self) -> SocketAddr {
        SocketAddr::from((self.multicast_addr, self.multicast_port))
    }

    /// members that were not heard of for this long are evicted
    pub fn eviction_timeout(&self) -> Duration {
        self.member_announce_interval * self.missed_announce_budget
    }

    /// upper bound for the number of packets of a single message
    pub fn max_packets_per_message(&self) -> usize {
        self.max_message_size.div_ceil(self.max_chunk_size).max(1)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.multicast_addr.is_multicast() {
            bail!("{} is not a multicast address", self.multicast_addr);
        }
        if self.multicast_port == 0 {
            bail!("multicast port must not be 0");
        }
        if self.send_timeout.is_zero() || self.resend_interval.is_zero() || self.member_announce_interval.is_zero() {
            bail!("send timeout, resend interval and member announce interval must be positive");
        }
        if self.missed_announce_budget == 0 {
            bail!("missed announce budget must be at least 1");
        }
        if self.incomplete_message_ttl <= self.send_timeout {
            bail!("incomplete message ttl {:?} must be longer than the send timeout {:?}: resends would be delivered again", self.incomplete_message_ttl, self.send_timeout);
        }
        if self.max_chunk_size == 0 {
            bail!("chunk size must be positive");
        }
        if self.max_chunk_size + DATA_PACKET_OVERHEAD + u8::MAX as usize > self.max_datagram_size {
            bail!("chunk size {} does not fit into a datagram of {} bytes", self.max_chunk_size, self.max_datagram_size);
        }
        if self.max_packets_per_message() > u32::MAX as usize {
            bail!("maximum message size {} requires too many packets for chunk size {}", self.max_message_size, self.max_chunk_size);
        }
        Ok(())
    }
}
