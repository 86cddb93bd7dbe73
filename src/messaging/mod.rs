pub mod dispatcher;
pub mod endpoint;
pub mod member_id;
pub mod packet;
pub mod transport;
