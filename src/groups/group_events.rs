use tokio::sync::broadcast;
use tracing::trace;

use crate::messaging::member_id::MemberId;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GroupEvent {
    MemberJoined(MemberId),
    /// the member sent a LEAVING packet
    MemberLeft(MemberId),
    /// the member stopped announcing itself
    MemberEvicted(MemberId),
}

#[derive(Debug)]
pub struct GroupEventNotifier {
    sender: broadcast::Sender<GroupEvent>,
}

impl Default for GroupEventNotifier {
    fn default() -> Self {
        GroupEventNotifier::new()
    }
}

impl GroupEventNotifier {
    pub fn new() -> GroupEventNotifier {
        let (sender, _) = broadcast::channel(128);

        GroupEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GroupEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: GroupEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
