//! UDP forwarding flows
//!
//! A [`Flow`] maps one client source address to one destination. The
//! [`FlowTable`] holds at most one flow per client.

use crate::socks::TargetAddr;
use crate::transport::OutboundDatagram;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// A client-to-destination UDP mapping
#[derive(Debug)]
pub struct Flow {
    /// Identity of this flow, unique within its table
    pub id: u64,
    /// Destination the client's datagrams are sent to
    pub destination: TargetAddr,
    /// Socket for the destination
    pub outbound: Arc<dyn OutboundDatagram>,
    /// SOCKS5 UDP header replayed on every return datagram
    pub header: Bytes,
    /// Last time a datagram passed in either direction
    pub last_activity: Instant,
    /// Task forwarding replies back to the client
    task: Option<JoinHandle<()>>,
}

impl Flow {
    /// Create a flow with no reply task attached yet
    pub fn new(
        id: u64,
        destination: TargetAddr,
        outbound: Arc<dyn OutboundDatagram>,
        header: Bytes,
    ) -> Self {
        Flow {
            id,
            destination,
            outbound,
            header,
            last_activity: Instant::now(),
            task: None,
        }
    }

    /// Attach the reply task, aborted when the flow is released
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }
}

impl Drop for Flow {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Flows keyed by client address
#[derive(Debug, Default)]
pub struct FlowTable {
    flows: Mutex<HashMap<SocketAddr, Flow>>,
    next_id: AtomicU64,
}

impl FlowTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh flow id
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert a flow, releasing whatever flow the client had before
    pub async fn insert(&self, client: SocketAddr, flow: Flow) {
        let replaced = self.flows.lock().await.insert(client, flow);
        if let Some(old) = replaced {
            tracing::debug!("Replaced UDP flow {} -> {}", client, old.destination);
        }
    }

    /// Outbound socket and identity of the client's flow
    pub async fn lookup(
        &self,
        client: &SocketAddr,
    ) -> Option<(u64, TargetAddr, Arc<dyn OutboundDatagram>)> {
        self.flows
            .lock()
            .await
            .get(client)
            .map(|flow| (flow.id, flow.destination.clone(), flow.outbound.clone()))
    }

    /// Refresh the activity timestamp of a flow if it is still current
    pub async fn touch(&self, client: &SocketAddr, id: u64) {
        if let Some(flow) = self.flows.lock().await.get_mut(client) {
            if flow.id == id {
                flow.last_activity = Instant::now();
            }
        }
    }

    /// Release the client's flow, returning whether one existed
    pub async fn release(&self, client: &SocketAddr) -> bool {
        let removed = self.flows.lock().await.remove(client);
        match removed {
            Some(flow) => {
                tracing::debug!("Released UDP flow {} -> {}", client, flow.destination);
                true
            }
            None => false,
        }
    }

    /// Release the client's flow only if it is still flow `id`
    pub async fn release_if(&self, client: &SocketAddr, id: u64) -> bool {
        let mut flows = self.flows.lock().await;
        if flows.get(client).map(|flow| flow.id) != Some(id) {
            return false;
        }
        flows.remove(client);
        tracing::debug!("Released UDP flow {} (id {})", client, id);
        true
    }

    /// Release every flow whose client has the given IP
    pub async fn release_host(&self, ip: IpAddr) -> usize {
        let mut flows = self.flows.lock().await;
        let before = flows.len();
        flows.retain(|client, _| client.ip() != ip);
        let released = before - flows.len();
        if released > 0 {
            tracing::debug!("Released {} UDP flows from {}", released, ip);
        }
        released
    }

    /// Release flows idle for longer than `timeout`
    pub async fn sweep_expired(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let mut flows = self.flows.lock().await;
        let before = flows.len();
        flows.retain(|client, flow| {
            let keep = !flow.is_idle(now, timeout);
            if !keep {
                tracing::debug!("UDP flow {} -> {} timed out", client, flow.destination);
            }
            keep
        });
        before - flows.len()
    }

    /// Release every flow
    pub async fn clear(&self) -> usize {
        let mut flows = self.flows.lock().await;
        let count = flows.len();
        flows.clear();
        count
    }

    /// Number of live flows
    pub async fn len(&self) -> usize {
        self.flows.lock().await.len()
    }

    /// Whether the table is empty
    pub async fn is_empty(&self) -> bool {
        self.flows.lock().await.is_empty()
    }

    /// Destination of the client's flow
    pub async fn destination(&self, client: &SocketAddr) -> Option<TargetAddr> {
        self.flows
            .lock()
            .await
            .get(client)
            .map(|flow| flow.destination.clone())
    }
}
