//! Wake-up channel.
//!
//! Producers write a single byte to the leader's published address after putting a message;
//! the leader's listener turns every received byte into a [`WakeupSignal`] that releases all
//! idle workers. The signal carries no payload and false wake-ups only cost an extra scan.
//! Delivery never depends on it: idle workers also rescan when their poll timeout elapses.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::sync::CancellationToken;

use crate::coordination::CoordinationStore;
use crate::error::RowLogError;
use crate::types::{HostAddress, RowLogId, ShardId};

/// Fan-out of wake-ups to workers, as a generation counter.
///
/// A worker subscribes once and marks the current generation as seen before it scans. A
/// wake-up that arrives during the scan leaves an unseen generation behind, so the worker's
/// next idle wait returns at once instead of missing it.
#[derive(Clone)]
pub struct WakeupSignal {
    tx: Arc<watch::Sender<u64>>,
}

impl WakeupSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn wake(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }

    pub fn generation(&self) -> u64 {
        *self.tx.borrow()
    }
}

impl Default for WakeupSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes the wake-up stream into one item per received byte.
#[derive(Debug, Default, Clone, Copy)]
pub struct WakeupDecoder;

impl Decoder for WakeupDecoder {
    type Item = u8;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<u8>, std::io::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        Ok(Some(src.get_u8()))
    }
}

/// The leader's listening socket for wake-ups.
pub struct WakeupListener {
    socket: TcpListener,
    local_addr: SocketAddr,
}

impl WakeupListener {
    /// Bind `host` on an OS-assigned port.
    pub async fn bind(host: &str) -> Result<Self, RowLogError> {
        let socket = TcpListener::bind((host, 0))
            .await
            .map_err(|e| RowLogError::TransportError {
                address: HostAddress::new(host, 0),
                reason: format!("wake-up listener bind failed: {e}"),
                source: Some(Box::new(e)),
            })?;
        let local_addr = socket.local_addr().map_err(|e| RowLogError::TransportError {
            address: HostAddress::new(host, 0),
            reason: format!("wake-up listener has no local address: {e}"),
            source: Some(Box::new(e)),
        })?;
        Ok(Self { socket, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `cancel` fires. Accept and connection errors are logged and
    /// the loop keeps serving.
    pub async fn serve(self, signal: WakeupSignal, cancel: CancellationToken) {
        tracing::debug!(address = %self.local_addr, "wake-up listener serving");
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.socket.accept() => accepted,
            };
            match accepted {
                Ok((stream, _peer)) => {
                    tokio::spawn(read_wakeups(stream, signal.clone(), cancel.child_token()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "wake-up accept failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    }
                }
            }
        }
        tracing::debug!(address = %self.local_addr, "wake-up listener closed");
    }
}

async fn read_wakeups(stream: TcpStream, signal: WakeupSignal, cancel: CancellationToken) {
    let mut frames = FramedRead::new(stream, WakeupDecoder);
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(_)) => signal.wake(),
            Some(Err(e)) => {
                tracing::debug!(error = %e, "wake-up connection error");
                return;
            }
            None => return,
        }
    }
}

/// Send one wake-up byte to `address`.
pub async fn send_wakeup(address: &HostAddress, timeout: Duration) -> Result<(), RowLogError> {
    let transport_err = |reason: String, source: Option<std::io::Error>| {
        RowLogError::TransportError {
            address: address.clone(),
            reason,
            source: source.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
        }
    };
    let target = format!("{}:{}", address.host, address.port);
    let mut stream = match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(transport_err(format!("connect failed: {e}"), Some(e))),
        Err(_) => return Err(transport_err(format!("connect timed out after {timeout:?}"), None)),
    };
    stream
        .write_all(&[1])
        .await
        .map_err(|e| transport_err(format!("write failed: {e}"), Some(e)))?;
    stream
        .shutdown()
        .await
        .map_err(|e| transport_err(format!("close failed: {e}"), Some(e)))?;
    Ok(())
}

/// Producer side of the wake-up channel.
///
/// [`notify`](Self::notify) only raises a flag; a background task looks up the leader's
/// published address and sends the byte. Bursts of puts collapse into few wake-ups.
pub struct ProcessorNotifier {
    pending: Arc<Notify>,
}

impl ProcessorNotifier {
    /// Start the background sender. It stops when `cancel` fires.
    pub fn spawn(
        coordination: Arc<dyn CoordinationStore>,
        row_log: RowLogId,
        shard: ShardId,
        connect_timeout: Duration,
        cancel: CancellationToken,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let pending = Arc::new(Notify::new());
        let task_pending = Arc::clone(&pending);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = task_pending.notified() => {}
                }
                let address = match coordination.processor_address(&row_log, &shard).await {
                    Ok(Some(address)) => address,
                    Ok(None) => {
                        tracing::debug!(row_log = %row_log, "no processor published, skipping wake-up");
                        continue;
                    }
                    Err(e) => {
                        tracing::debug!(row_log = %row_log, error = %e, "processor lookup failed, skipping wake-up");
                        continue;
                    }
                };
                if let Err(e) = send_wakeup(&address, connect_timeout).await {
                    tracing::debug!(address = %address, error = %e, "wake-up not delivered");
                }
            }
        });
        (Self { pending }, handle)
    }

    /// Request a wake-up. Never blocks and never fails.
    pub fn notify(&self) {
        self.pending.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_coordination::MemoryCoordination;

    #[test]
    fn decoder_yields_one_item_per_byte_and_waits_on_empty_input() {
        let mut decoder = WakeupDecoder;
        let mut buf = BytesMut::new();
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&[7, 9]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(7));
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(9));
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
    }

    #[tokio::test]
    async fn signal_is_not_lost_between_subscribe_and_wait() {
        let signal = WakeupSignal::new();
        let mut rx = signal.subscribe();
        let _seen = *rx.borrow_and_update();
        signal.wake();
        // The wake-up happened before we started waiting, yet `changed` resolves at once.
        tokio::time::timeout(Duration::from_millis(100), rx.changed())
            .await
            .expect("pending wake-up observed")
            .unwrap();
        assert_eq!(signal.generation(), 1);
    }

    #[tokio::test]
    async fn listener_turns_bytes_into_wakeups() {
        let listener = WakeupListener::bind("127.0.0.1").await.unwrap();
        let address = HostAddress::new("127.0.0.1", listener.local_addr().port());
        let signal = WakeupSignal::new();
        let mut rx = signal.subscribe();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listener.serve(signal.clone(), cancel.clone()));

        send_wakeup(&address, Duration::from_secs(1)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("wake-up received")
            .unwrap();

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn notifier_reaches_published_processor() {
        let coordination = Arc::new(MemoryCoordination::new());
        let row_log = RowLogId::new("records");
        let shard = ShardId::new("shard1");

        let listener = WakeupListener::bind("127.0.0.1").await.unwrap();
        coordination
            .publish_processor(
                &row_log,
                &shard,
                &HostAddress::new("127.0.0.1", listener.local_addr().port()),
            )
            .await
            .unwrap();
        let signal = WakeupSignal::new();
        let mut rx = signal.subscribe();
        let cancel = CancellationToken::new();
        tokio::spawn(listener.serve(signal.clone(), cancel.clone()));

        let (notifier, handle) = ProcessorNotifier::spawn(
            coordination,
            row_log,
            shard,
            Duration::from_secs(1),
            cancel.clone(),
        );
        notifier.notify();
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("wake-up received")
            .unwrap();

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn notify_without_published_processor_is_harmless() {
        let coordination = Arc::new(MemoryCoordination::new());
        let cancel = CancellationToken::new();
        let (notifier, handle) = ProcessorNotifier::spawn(
            coordination,
            RowLogId::new("records"),
            ShardId::new("shard1"),
            Duration::from_millis(100),
            cancel.clone(),
        );
        notifier.notify();
        notifier.notify();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
