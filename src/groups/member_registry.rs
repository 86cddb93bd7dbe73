use std::collections::hash_map::Entry;
use std::fmt::{Display, Formatter};
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::GroupsConfig;
use crate::messaging::member_id::MemberId;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum MemberStatus {
    Myself,
    /// announced within the last announce interval
    Alive,
    /// missed at least one announce, but still within the budget of missed announces
    Suspect,
}

impl Display for MemberStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberStatus::Myself => write!(f, "myself"),
            MemberStatus::Alive => write!(f, "alive"),
            MemberStatus::Suspect => write!(f, "suspect"),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MemberInfo {
    pub id: MemberId,
    pub status: MemberStatus,
}

#[derive(Debug)]
struct MemberEntry {
    last_seen: Instant,
}

/// The registry tracks the remote members of a group based on their announces. It is plain
///  data; the owner is responsible for synchronization.
#[derive(Debug)]
pub struct MemberRegistry {
    myself: MemberId,
    announce_interval: Duration,
    missed_announce_budget: u32,
    members: FxHashMap<MemberId, MemberEntry>,
}

impl MemberRegistry {
    pub fn new(myself: MemberId, config: &GroupsConfig) -> MemberRegistry {
        MemberRegistry {
            myself,
            announce_interval: config.member_announce_interval,
            missed_announce_budget: config.missed_announce_budget,
            members: Default::default(),
        }
    }

    pub fn myself(&self) -> MemberId {
        self.myself
    }

    fn eviction_timeout(&self) -> Duration {
        self.announce_interval * self.missed_announce_budget
    }

    /// Records an announce received now, returning `true` if the member was not known before.
    ///  The sender's timestamp is not stored here: it goes to [crate::groups::net_time::NetTime].
    pub fn announce(&mut self, member: MemberId) -> bool {
        if member == self.myself {
            return false;
        }

        let now = Instant::now();
        match self.members.entry(member) {
            Entry::Occupied(mut e) => {
                e.get_mut().last_seen = now;
                false
            }
            Entry::Vacant(e) => {
                info!("new member {:?}", member);
                e.insert(MemberEntry { last_seen: now });
                true
            }
        }
    }

    /// returns `true` if the member was known
    pub fn remove(&mut self, member: &MemberId) -> bool {
        let was_known = self.members.remove(member).is_some();
        if was_known {
            info!("member {:?} left", member);
        }
        was_known
    }

    /// remote members that announced within the eviction timeout, sorted by id
    pub fn live_members(&self) -> Vec<MemberId> {
        let now = Instant::now();
        let eviction_timeout = self.eviction_timeout();

        let mut result = self.members.iter()
            .filter(|(_, e)| now.duration_since(e.last_seen) <= eviction_timeout)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    /// removes and returns members that did not announce within the eviction timeout
    pub fn evict_stale(&mut self) -> Vec<MemberId> {
        let now = Instant::now();
        let eviction_timeout = self.eviction_timeout();

        let mut evicted = Vec::new();
        self.members.retain(|id, e| {
            let is_live = now.duration_since(e.last_seen) <= eviction_timeout;
            if !is_live {
                evicted.push(*id);
            }
            is_live
        });
        evicted.sort();

        if !evicted.is_empty() {
            debug!("evicting members {:?}", evicted);
        }
        evicted
    }

    fn status(&self, entry: &MemberEntry, now: Instant) -> MemberStatus {
        if now.duration_since(entry.last_seen) <= self.announce_interval {
            MemberStatus::Alive
        }
        else {
            MemberStatus::Suspect
        }
    }

    /// all members including myself (listed first), remote members sorted by id
    pub fn members(&self) -> Vec<MemberInfo> {
        let now = Instant::now();

        let mut remote = self.members.iter()
            .map(|(id, e)| MemberInfo { id: *id, status: self.status(e, now) })
            .collect::<Vec<_>>();
        remote.sort_by_key(|m| m.id);

        let mut result = Vec::with_capacity(remote.len() + 1);
        result.push(MemberInfo { id: self.myself, status: MemberStatus::Myself });
        result.extend(remote);
        result
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tokio::time;
    use crate::test_util::member::{test_config, test_member_id_from_number};
    use super::*;

    fn registry() -> MemberRegistry {
        // announce interval 200ms, budget 2
        MemberRegistry::new(test_member_id_from_number(1), &test_config())
    }

    #[test]
    fn test_status_display() {
        assert_eq!(MemberStatus::Myself.to_string(), "myself");
        assert_eq!(MemberStatus::Alive.to_string(), "alive");
        assert_eq!(MemberStatus::Suspect.to_string(), "suspect");
    }

    #[tokio::test(start_paused = true)]
    async fn test_announce() {
        let mut registry = registry();

        assert!(registry.announce(test_member_id_from_number(3)));
        assert!(registry.announce(test_member_id_from_number(2)));
        assert!(!registry.announce(test_member_id_from_number(2)));
        assert!(!registry.announce(test_member_id_from_number(1)));

        assert_eq!(registry.live_members(), vec![test_member_id_from_number(2), test_member_id_from_number(3)]);
        // announcing myself does not add a remote entry
        assert_eq!(registry.members().iter().map(|m| m.id).collect::<Vec<_>>(), vec![
            test_member_id_from_number(1),
            test_member_id_from_number(2),
            test_member_id_from_number(3),
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove() {
        let mut registry = registry();
        registry.announce(test_member_id_from_number(2));

        assert!(registry.remove(&test_member_id_from_number(2)));
        assert!(!registry.remove(&test_member_id_from_number(2)));
        assert!(registry.live_members().is_empty());
    }

    #[rstest]
    #[case::fresh(0, MemberStatus::Alive, true)]
    #[case::one_interval(200, MemberStatus::Alive, true)]
    #[case::missed_one(300, MemberStatus::Suspect, true)]
    #[case::end_of_budget(400, MemberStatus::Suspect, true)]
    #[case::beyond_budget(401, MemberStatus::Suspect, false)]
    #[tokio::test(start_paused = true)]
    async fn test_liveness(#[case] elapsed_millis: u64, #[case] expected_status: MemberStatus, #[case] expected_live: bool) {
        let mut registry = registry();
        registry.announce(test_member_id_from_number(2));

        time::advance(Duration::from_millis(elapsed_millis)).await;

        assert_eq!(registry.members(), vec![
            MemberInfo { id: test_member_id_from_number(1), status: MemberStatus::Myself },
            MemberInfo { id: test_member_id_from_number(2), status: expected_status },
        ]);
        assert_eq!(registry.live_members().contains(&test_member_id_from_number(2)), expected_live);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_and_restore() {
        let mut registry = registry();
        registry.announce(test_member_id_from_number(2));
        registry.announce(test_member_id_from_number(3));

        time::advance(Duration::from_millis(300)).await;
        registry.announce(test_member_id_from_number(3));
        assert!(registry.evict_stale().is_empty());

        time::advance(Duration::from_millis(200)).await;
        assert_eq!(registry.evict_stale(), vec![test_member_id_from_number(2)]);
        assert_eq!(registry.live_members(), vec![test_member_id_from_number(3)]);
        assert!(registry.evict_stale().is_empty());

        assert!(registry.announce(test_member_id_from_number(2)));
        assert_eq!(registry.live_members(), vec![test_member_id_from_number(2), test_member_id_from_number(3)]);
    }

    #[tokio::test]
    async fn test_members_without_remotes() {
        let registry = registry();
        assert_eq!(registry.members(), vec![MemberInfo { id: test_member_id_from_number(1), status: MemberStatus::Myself }]);
    }
}
