use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::messaging::member_id::MemberId;

/// wall clock time in millis since the UNIX epoch
pub fn current_time_millis() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

/// A point in time, both in local wall clock time and in the group's shared net time (both in
///  millis since the UNIX epoch).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct NetTimeValue {
    pub local_millis: i64,
    pub net_millis: i64,
}

/// NetTime is a clock shared by the members of a group. Every member knows the offsets between
///  its own wall clock and the clocks of all other members (based on their announces), and
///  net time is local time shifted by the median of these offsets. The median includes the
///  local member's offset of zero so that all members converge on the same time.
///
/// This is a best effort approximation: network latency is not compensated.
#[derive(Debug, Default)]
pub struct NetTime {
    offsets: Mutex<FxHashMap<MemberId, i64>>,
    reference_offset_millis: AtomicI64,
}

impl NetTime {
    pub fn new() -> NetTime {
        Default::default()
    }

    /// the offset that is added to local time to get net time
    pub fn offset_millis(&self) -> i64 {
        self.reference_offset_millis.load(Ordering::Acquire)
    }

    pub fn now(&self) -> NetTimeValue {
        self.create_from_local_time(current_time_millis())
    }

    pub fn create_from_local_time(&self, local_millis: i64) -> NetTimeValue {
        NetTimeValue {
            local_millis,
            net_millis: local_millis.saturating_add(self.offset_millis()),
        }
    }

    pub fn create_from_net_time(&self, net_millis: i64) -> NetTimeValue {
        NetTimeValue {
            local_millis: net_millis.saturating_sub(self.offset_millis()),
            net_millis,
        }
    }

    /// registers a member's clock reading, taken from an announce that was received at local
    ///  time `local_receive_millis`
    pub fn on_announce(&self, member: MemberId, remote_timestamp_millis: i64, local_receive_millis: i64) {
        let offset = remote_timestamp_millis.saturating_sub(local_receive_millis);
        trace!("clock offset of member {:?}: {}ms", member, offset);

        let mut offsets = self.offsets.lock().unwrap_or_else(|e| e.into_inner());
        offsets.insert(member, offset);
        self.update_reference_offset(&offsets);
    }

    /// drops the offset of a member that left or was evicted
    pub fn forget(&self, member: &MemberId) {
        let mut offsets = self.offsets.lock().unwrap_or_else(|e| e.into_inner());
        if offsets.remove(member).is_some() {
            self.update_reference_offset(&offsets);
        }
    }

    fn update_reference_offset(&self, offsets: &FxHashMap<MemberId, i64>) {
        let new_offset = median_including_zero(offsets.values().copied());
        let old_offset = self.reference_offset_millis.swap(new_offset, Ordering::AcqRel);
        if old_offset != new_offset {
            debug!("net time offset changed from {}ms to {}ms", old_offset, new_offset);
        }
    }
}

/// median of the peer offsets together with the local member's own offset of 0, i.e. of all
///  clocks in the group
fn median_including_zero(offsets: impl Iterator<Item=i64>) -> i64 {
    let mut all = offsets.collect::<Vec<_>>();
    all.push(0);
    all.sort_unstable();

    let mid = all.len() / 2;
    if all.len() % 2 == 1 {
        all[mid]
    }
    else {
        ((all[mid - 1] as i128 + all[mid] as i128) / 2) as i64
    }
}
