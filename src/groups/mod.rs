pub mod group_events;
pub mod group_member;
pub mod member_registry;
pub mod membership;
pub mod message_receiver;
pub mod message_sender;
pub mod net_time;
