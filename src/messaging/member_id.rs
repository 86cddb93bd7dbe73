use std::fmt::{Debug, Display, Formatter};
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn random() -> $name {
                $name(Uuid::new_v4())
            }

            pub const fn from_u128(value: u128) -> $name {
                $name(Uuid::from_u128(value))
            }

            pub const fn as_u128(&self) -> u128 {
                self.0.as_u128()
            }
        }

        impl Debug for $name {
            /// abbreviated to keep log output readable - this is unique enough for debugging
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}:{:08x}", $prefix, (self.as_u128() >> 96) as u32)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    }
}

uuid_id!(MemberId, "M");

uuid_id!(MessageId, "Msg");

impl MessageId {
    /// placeholder for packets that do not refer to a message
    pub const NIL: MessageId = MessageId(Uuid::nil());
}
