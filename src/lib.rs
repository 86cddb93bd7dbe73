//! Reliable group messaging over UDP multicast.
//!
//! Members join a named group, and every message a member sends is delivered to all other
//!  members of the group. Messages are split into packets that fit into a single datagram, and
//!  receivers acknowledge every packet; the sender resends packets until all members that were
//!  alive when the message was sent acknowledged them, or until a timeout expires.
//!
//! Members announce themselves periodically, and a member that misses too many announces is
//!  considered gone. The announces also carry the sender's wall clock time, which is the basis
//!  for a clock shared by the group ([groups::net_time::NetTime]).
//!
//! Entry points are [groups::group_member::join_group] for a member with its own socket, and
//!  [groups::group_member::GroupMember::join] for sharing a [messaging::endpoint::Endpoint]
//!  between several members.

pub mod config;
pub mod groups;
pub mod messaging;
pub mod util;
pub mod test_util;
