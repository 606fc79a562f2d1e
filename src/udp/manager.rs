//! UDP session manager
//!
//! Owns the shared inbound UDP socket. Each client source address gets a
//! [`Flow`] with its own outbound socket; replies from the destination are
//! wrapped in the client's original SOCKS5 header and sent back through
//! the shared socket. Idle flows are swept on a fixed interval.
//!
//! Opening a flow may resolve a domain or handshake with an upstream, so it
//! runs in its own task. Datagrams that arrive for a flow still being
//! opened are queued in arrival order and sent once it is ready.

use super::flow::{Flow, FlowTable};
use crate::helper::{MAX_UDP_PACKET, UDP_SWEEP_INTERVAL};
use crate::socks::{decode_datagram, TargetAddr};
use crate::transport::{Connector, OutboundDatagram};
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// A flow whose outbound socket is still being opened
#[derive(Debug)]
struct PendingFlow {
    id: u64,
    destination: TargetAddr,
    queue: Vec<Bytes>,
}

/// Demultiplexes the shared UDP socket into per-client flows
#[derive(Debug)]
pub struct UdpSessionManager {
    socket: Arc<UdpSocket>,
    connector: Arc<dyn Connector>,
    flows: Arc<FlowTable>,
    // Lock order: `pending` before the flow table
    pending: Mutex<HashMap<SocketAddr, PendingFlow>>,
    associations: Mutex<HashMap<IpAddr, usize>>,
    keep_alive: Duration,
    sweep_interval: Duration,
}

impl UdpSessionManager {
    /// Bind the shared socket
    pub async fn bind(
        addr: &str,
        connector: Arc<dyn Connector>,
        keep_alive: Duration,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("Failed to bind UDP socket on {}", addr))?;
        Ok(Self::from_socket(socket, connector, keep_alive))
    }

    /// Wrap an already bound socket
    pub fn from_socket(socket: UdpSocket, connector: Arc<dyn Connector>, keep_alive: Duration) -> Self {
        UdpSessionManager {
            socket: Arc::new(socket),
            connector,
            flows: Arc::new(FlowTable::new()),
            pending: Mutex::new(HashMap::new()),
            associations: Mutex::new(HashMap::new()),
            keep_alive,
            sweep_interval: UDP_SWEEP_INTERVAL,
        }
    }

    /// Set how often idle flows are swept
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Address of the shared socket
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive datagrams until shutdown
    ///
    /// Per-datagram failures are logged and never stop the loop. On
    /// shutdown every flow is released.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<bool>) {
        let sweeper = {
            let flows = self.flows.clone();
            let interval = self.sweep_interval;
            let keep_alive = self.keep_alive;
            tokio::spawn(async move { sweep_loop(flows, interval, keep_alive).await })
        };

        let mut buf = vec![0u8; MAX_UDP_PACKET];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, client)) => {
                            if let Err(e) = self.handle_datagram(&buf[..len], client).await {
                                warn!("UDP datagram from {} dropped: {:#}", client, e);
                            }
                        }
                        // ICMP errors from earlier sends surface here on some platforms
                        Err(e) => debug!("UDP receive error: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutting down UDP session manager");
                    break;
                }
            }
        }

        sweeper.abort();
        self.shutdown().await;
    }

    /// Forward one datagram received from `client`
    ///
    /// A malformed datagram is rejected without touching the table. A
    /// datagram for the client's current destination is sent right away;
    /// any other destination starts a new flow in the background, which
    /// replaces the client's current one once it is open.
    pub async fn handle_datagram(
        self: &Arc<Self>,
        data: &[u8],
        client: SocketAddr,
    ) -> Result<()> {
        let datagram = decode_datagram(data)?;
        debug!(
            "UDP {} -> {}: {} bytes",
            client,
            datagram.destination,
            datagram.payload.len()
        );

        let mut pending = self.pending.lock().await;
        let queued_for = pending
            .get(&client)
            .map(|entry| entry.destination == datagram.destination);
        match queued_for {
            Some(true) => {
                if let Some(entry) = pending.get_mut(&client) {
                    entry.queue.push(datagram.payload);
                }
                return Ok(());
            }
            Some(false) => {}
            None => {
                if let Some((id, destination, outbound)) = self.flows.lookup(&client).await {
                    if destination == datagram.destination {
                        drop(pending);
                        return self
                            .send_payload(&client, id, &outbound, &datagram.payload)
                            .await;
                    }
                }
            }
        }

        let id = self.flows.next_id();
        pending.insert(
            client,
            PendingFlow {
                id,
                destination: datagram.destination.clone(),
                queue: vec![datagram.payload],
            },
        );
        drop(pending);

        tokio::spawn(
            self.clone()
                .open_flow(id, client, datagram.destination, datagram.header),
        );
        Ok(())
    }

    async fn open_flow(
        self: Arc<Self>,
        id: u64,
        client: SocketAddr,
        destination: TargetAddr,
        header: Bytes,
    ) {
        let opened = self.connector.bind_datagram(&destination).await;
        let outbound: Arc<dyn OutboundDatagram> = match opened {
            Ok(outbound) => Arc::from(outbound),
            Err(e) => {
                warn!("Failed to open UDP flow {} -> {}: {:#}", client, destination, e);
                let mut pending = self.pending.lock().await;
                if pending.get(&client).map(|entry| entry.id) == Some(id) {
                    pending.remove(&client);
                }
                return;
            }
        };

        let task = tokio::spawn(forward_replies(
            id,
            client,
            outbound.clone(),
            header.clone(),
            self.socket.clone(),
            self.flows.clone(),
        ));
        let flow = Flow::new(id, destination.clone(), outbound.clone(), header).with_task(task);
        {
            let pending = self.pending.lock().await;
            if pending.get(&client).map(|entry| entry.id) != Some(id) {
                debug!("UDP flow {} -> {} superseded before it opened", client, destination);
                return;
            }
            info!("UDP flow {} -> {}", client, destination);
            self.flows.insert(client, flow).await;
        }

        // Drain the queue without holding the lock across sends. The entry
        // stays in place until it is empty so later datagrams queue behind it.
        loop {
            let queued = {
                let mut pending = self.pending.lock().await;
                let entry = match pending.get_mut(&client) {
                    Some(entry) if entry.id == id => entry,
                    _ => return,
                };
                if entry.queue.is_empty() {
                    pending.remove(&client);
                    return;
                }
                std::mem::take(&mut entry.queue)
            };

            for payload in queued {
                if let Err(e) = self.send_payload(&client, id, &outbound, &payload).await {
                    warn!("UDP datagram from {} dropped: {:#}", client, e);
                }
            }
        }
    }

    async fn send_payload(
        &self,
        client: &SocketAddr,
        id: u64,
        outbound: &Arc<dyn OutboundDatagram>,
        payload: &[u8],
    ) -> Result<()> {
        if let Err(e) = outbound.send(payload).await {
            self.flows.release_if(client, id).await;
            return Err(e).context("Failed to send UDP payload");
        }
        self.flows.touch(client, id).await;
        Ok(())
    }

    /// Record a UDP association whose client sends from `ip`
    pub async fn associate(&self, ip: IpAddr) {
        *self.associations.lock().await.entry(ip).or_insert(0) += 1;
    }

    /// Forget one association from `ip`, returning how many remain
    pub async fn dissociate(&self, ip: IpAddr) -> usize {
        let mut associations = self.associations.lock().await;
        let remaining = match associations.get_mut(&ip) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            associations.remove(&ip);
        }
        remaining
    }

    /// Release the flow of one client
    pub async fn release(&self, client: &SocketAddr) -> bool {
        self.pending.lock().await.remove(client);
        self.flows.release(client).await
    }

    /// Release every flow from one host
    pub async fn release_host(&self, ip: IpAddr) -> usize {
        self.pending.lock().await.retain(|client, _| client.ip() != ip);
        self.flows.release_host(ip).await
    }

    /// Number of live flows
    pub async fn flow_count(&self) -> usize {
        self.flows.len().await
    }

    /// Destination of a client's flow
    pub async fn flow_destination(&self, client: &SocketAddr) -> Option<TargetAddr> {
        self.flows.destination(client).await
    }

    /// Whether a flow for `client` is still being opened
    pub async fn is_opening(&self, client: &SocketAddr) -> bool {
        self.pending.lock().await.contains_key(client)
    }

    /// Release every flow
    pub async fn shutdown(&self) {
        self.pending.lock().await.clear();
        let released = self.flows.clear().await;
        if released > 0 {
            debug!("Released {} UDP flows on shutdown", released);
        }
    }
}

async fn sweep_loop(flows: Arc<FlowTable>, interval: Duration, keep_alive: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let expired = flows.sweep_expired(keep_alive).await;
        if expired > 0 {
            debug!("Swept {} idle UDP flows", expired);
        }
    }
}

async fn forward_replies(
    id: u64,
    client: SocketAddr,
    outbound: Arc<dyn OutboundDatagram>,
    header: Bytes,
    socket: Arc<UdpSocket>,
    flows: Arc<FlowTable>,
) {
    let mut buf = vec![0u8; MAX_UDP_PACKET];
    loop {
        let len = match outbound.recv(&mut buf).await {
            Ok(len) => len,
            Err(e) => {
                warn!("UDP flow {} outbound error: {}", client, e);
                flows.release_if(&client, id).await;
                return;
            }
        };

        let mut packet = BytesMut::with_capacity(header.len() + len);
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&buf[..len]);

        if let Err(e) = socket.send_to(&packet, client).await {
            warn!("Failed to return UDP datagram to {}: {}", client, e);
            continue;
        }
        flows.touch(&client, id).await;
    }
}
