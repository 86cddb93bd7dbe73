use std::net::Ipv4Addr;
use std::time::Duration;
use crate::config::GroupsConfig;
use crate::messaging::member_id::MemberId;

/// member ids with a readable abbreviated `Debug` representation, e.g. `M:00000003` for 3
pub fn test_member_id_from_number(number: u128) -> MemberId {
    MemberId::from_u128((number << 96) | number)
}

/// a configuration with short timeouts, suitable for tests with real or paused time
pub fn test_config() -> GroupsConfig {
    GroupsConfig {
        send_timeout: Duration::from_secs(2),
        resend_interval: Duration::from_millis(100),
        member_announce_interval: Duration::from_millis(200),
        incomplete_message_ttl: Duration::from_secs(5),
        ..GroupsConfig::new(Ipv4Addr::new(239, 255, 42, 99), 9876)
    }
}
