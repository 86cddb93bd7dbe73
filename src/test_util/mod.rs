//! This module contains utilities for testing code based on group messaging. They are used for
//!  testing the crate itself, but they are also exported for application testing: the
//!  in-memory network allows running several group members in a single test without touching
//!  real sockets.

pub mod member;
pub mod network;


#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            // .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
