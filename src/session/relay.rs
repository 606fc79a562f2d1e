//! Bidirectional byte relay
//!
//! A relaying session runs two [`pump`]s, one per direction, that share a
//! single [`TerminationSignal`]. Whichever direction ends first fires the
//! signal; [`relay`] then aborts the other pump and waits for both so no
//! stream handle outlives the session.

use crate::helper::READ_LIMIT;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// One-shot signal shared by both directions of a relay
#[derive(Debug, Default)]
pub struct TerminationSignal {
    fired: AtomicBool,
    notify: Notify,
}

impl TerminationSignal {
    /// Create an unfired signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Firing twice is a no-op.
    pub fn fire(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    /// Whether the signal has fired
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Wait until the signal fires
    pub async fn wait(&self) {
        loop {
            // Register before checking so a concurrent fire is not missed.
            let notified = self.notify.notified();
            if self.is_fired() {
                return;
            }
            notified.await;
        }
    }
}

/// Result of one read from a stream
#[derive(Debug)]
pub enum ReadOutcome {
    /// `n` bytes were read
    Data(usize),
    /// The peer closed the stream (EOF or reset)
    Closed,
    /// The read failed
    Failed(io::Error),
}

/// Read once into `buf`, classifying the result
pub async fn read_chunk<R>(reader: &mut R, buf: &mut [u8]) -> ReadOutcome
where
    R: AsyncRead + Unpin,
{
    match reader.read(buf).await {
        Ok(0) => ReadOutcome::Closed,
        Ok(n) => ReadOutcome::Data(n),
        Err(e) if is_peer_close(&e) => ReadOutcome::Closed,
        Err(e) => ReadOutcome::Failed(e),
    }
}

fn is_peer_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Copy bytes from `source` to `destination` until either side ends
///
/// Every chunk is written in full and flushed before the next read. On
/// EOF, error, or when `signal` fires, the pump fires `signal` and
/// returns the number of bytes copied.
pub async fn pump<R, W>(mut source: R, mut destination: W, signal: Arc<TerminationSignal>) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; READ_LIMIT];
    let mut copied = 0u64;

    while !signal.is_fired() {
        let outcome = tokio::select! {
            outcome = read_chunk(&mut source, &mut buf) => outcome,
            _ = signal.wait() => break,
        };

        let n = match outcome {
            ReadOutcome::Data(n) => n,
            ReadOutcome::Closed => {
                debug!("Peer closed after {} bytes", copied);
                break;
            }
            ReadOutcome::Failed(e) => {
                debug!("Read failed after {} bytes: {}", copied, e);
                break;
            }
        };

        trace!("[Relay] {} bytes", n);
        if let Err(e) = write_chunk(&mut destination, &buf[..n]).await {
            debug!("Write failed after {} bytes: {}", copied, e);
            break;
        }
        copied += n as u64;
    }

    signal.fire();
    copied
}

async fn write_chunk<W>(destination: &mut W, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    destination.write_all(data).await?;
    destination.flush().await
}

/// Byte counts of a finished relay
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied from the client to the target
    pub sent: u64,
    /// Bytes copied from the target to the client
    pub received: u64,
}

/// Relay bytes between `client` and `target` until one side ends
///
/// Both streams are dropped before this returns, which closes the
/// other side of the session as well.
pub async fn relay<A, B>(client: A, target: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let signal = Arc::new(TerminationSignal::new());
    let (client_read, client_write) = tokio::io::split(client);
    let (target_read, target_write) = tokio::io::split(target);

    let upstream = tokio::spawn(pump(client_read, target_write, signal.clone()));
    let downstream = tokio::spawn(pump(target_read, client_write, signal.clone()));

    signal.wait().await;
    upstream.abort();
    downstream.abort();

    // An aborted pump reports nothing; its count is lost with it.
    let stats = RelayStats {
        sent: upstream.await.unwrap_or_default(),
        received: downstream.await.unwrap_or_default(),
    };
    debug!(
        "Relay finished: {} bytes sent, {} bytes received",
        stats.sent, stats.received
    );
    stats
}
