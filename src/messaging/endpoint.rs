use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use anyhow::bail;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::GroupsConfig;
use crate::messaging::dispatcher::PacketDispatcher;
use crate::messaging::transport::{MulticastTransport, Transport};

/// An Endpoint is a [Transport] together with the one receive loop reading from it. Group
///  members attach to an endpoint, and several members (of the same or of different groups)
///  can share an endpoint, avoiding duplicate socket reads.
///
/// The endpoint closes its transport when the last attached member detaches.
pub struct Endpoint {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<PacketDispatcher>,
    recv_loop: Mutex<Option<JoinHandle<()>>>,
    attached_members: AtomicUsize,
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Some(handle) = self.recv_loop.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

impl Endpoint {
    /// opens a multicast socket for the configured group address and starts its receive loop
    pub async fn open(config: &GroupsConfig) -> anyhow::Result<Arc<Endpoint>> {
        let transport = MulticastTransport::open(config).await?;
        Ok(Endpoint::new(Arc::new(transport)))
    }

    /// starts a receive loop for an existing transport. This must be called from inside a tokio
    ///  runtime.
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Endpoint> {
        let dispatcher = Arc::new(PacketDispatcher::new());

        let recv_loop = {
            let transport = transport.clone();
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher.recv_loop(transport.as_ref()).await
            })
        };

        Arc::new(Endpoint {
            transport,
            dispatcher,
            recv_loop: Mutex::new(Some(recv_loop)),
            attached_members: AtomicUsize::new(0),
        })
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn dispatcher(&self) -> &Arc<PacketDispatcher> {
        &self.dispatcher
    }

    pub fn num_attached_members(&self) -> usize {
        self.attached_members.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    pub fn attach(&self) -> anyhow::Result<()> {
        if self.is_closed() {
            bail!("endpoint is closed");
        }
        let num_attached = self.attached_members.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("member attached to endpoint, now {} attached", num_attached);
        Ok(())
    }

    /// Detaching the last member closes the endpoint
    pub fn detach(&self) {
        let previous = self.attached_members.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Ok(1) => {
                info!("last member detached from endpoint - closing");
                if let Err(e) = self.close() {
                    warn!("error closing endpoint: {}", e);
                }
            }
            Ok(n) => debug!("member detached from endpoint, {} still attached", n - 1),
            Err(_) => warn!("detaching from an endpoint with no attached members"),
        }
    }

    pub fn close(&self) -> anyhow::Result<()> {
        let result = self.transport.close();
        if let Some(handle) = self.recv_loop.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::network::InMemoryNetwork;

    #[tokio::test]
    async fn test_close_on_last_detach() {
        let network = InMemoryNetwork::new();
        let endpoint = Endpoint::new(network.transport());

        endpoint.attach().unwrap();
        endpoint.attach().unwrap();
        assert_eq!(endpoint.num_attached_members(), 2);

        endpoint.detach();
        assert!(!endpoint.is_closed());

        endpoint.detach();
        assert!(endpoint.is_closed());
        assert_eq!(endpoint.num_attached_members(), 0);

        assert!(endpoint.attach().is_err());
    }

    #[tokio::test]
    async fn test_detach_without_attach() {
        let network = InMemoryNetwork::new();
        let endpoint = Endpoint::new(network.transport());

        endpoint.detach();
        assert!(!endpoint.is_closed());
        assert_eq!(endpoint.num_attached_members(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let network = InMemoryNetwork::new();
        let endpoint = Endpoint::new(network.transport());

        endpoint.close().unwrap();
        endpoint.close().unwrap();
        assert!(endpoint.is_closed());
    }
}
