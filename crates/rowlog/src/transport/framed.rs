//! Length-delimited TCP transport for remote listeners.
//!
//! Each frame is a MessagePack encoded [`DeliverRequest`] or [`DeliverResponse`]. A connection
//! carries one request at a time; the client keeps one connection per listener address.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::coordination::CoordinationStore;
use crate::error::RowLogError;
use crate::listener::MessageListener;
use crate::message::Message;
use crate::transport::ListenerTransport;
use crate::types::{HostAddress, RowLogId, SubscriptionId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverRequest {
    pub subscription: SubscriptionId,
    pub message: Message,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum DeliverResponse {
    /// The listener ran; `true` means the message is done.
    Processed(bool),
    /// The listener failed.
    Failed(String),
}

type Connection = Framed<TcpStream, LengthDelimitedCodec>;

fn encode<T: Serialize>(value: &T) -> Result<Bytes, RowLogError> {
    rmp_serde::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| RowLogError::MalformedMessage {
            reason: format!("failed to encode frame: {e}"),
            source: Some(Box::new(e)),
        })
}

fn decode<T: for<'de> Deserialize<'de>>(frame: &[u8]) -> Result<T, RowLogError> {
    rmp_serde::from_slice(frame).map_err(|e| RowLogError::MalformedMessage {
        reason: format!("failed to decode frame: {e}"),
        source: Some(Box::new(e)),
    })
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Framed TCP implementation of [`ListenerTransport`].
pub struct FramedTransport {
    connections: DashMap<HostAddress, Arc<Mutex<Option<Connection>>>>,
    connect_timeout: Duration,
}

impl FramedTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            connect_timeout,
        }
    }

    async fn connect(&self, address: &HostAddress) -> Result<Connection, RowLogError> {
        let target = format!("{}:{}", address.host, address.port);
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(target))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(RowLogError::TransportError {
                    address: address.clone(),
                    reason: format!("connect failed: {e}"),
                    source: Some(Box::new(e)),
                })
            }
            Err(_) => {
                return Err(RowLogError::TransportError {
                    address: address.clone(),
                    reason: format!("connect timed out after {:?}", self.connect_timeout),
                    source: None,
                })
            }
        };
        stream.set_nodelay(true).ok();
        Ok(Framed::new(stream, LengthDelimitedCodec::new()))
    }

    async fn round_trip(
        connection: &mut Connection,
        address: &HostAddress,
        request: Bytes,
    ) -> Result<DeliverResponse, RowLogError> {
        let io_err = |reason: &str, e: std::io::Error| RowLogError::TransportError {
            address: address.clone(),
            reason: format!("{reason}: {e}"),
            source: Some(Box::new(e)),
        };
        connection
            .send(request)
            .await
            .map_err(|e| io_err("send failed", e))?;
        match connection.next().await {
            Some(Ok(frame)) => decode(&frame),
            Some(Err(e)) => Err(io_err("receive failed", e)),
            None => Err(RowLogError::TransportError {
                address: address.clone(),
                reason: "connection closed before acknowledgement".to_string(),
                source: None,
            }),
        }
    }
}

#[async_trait]
impl ListenerTransport for FramedTransport {
    #[instrument(skip(self, message), fields(message = %message))]
    async fn deliver(
        &self,
        address: &HostAddress,
        subscription: &SubscriptionId,
        message: &Message,
    ) -> Result<bool, RowLogError> {
        let request = encode(&DeliverRequest {
            subscription: subscription.clone(),
            message: message.clone(),
        })?;

        let slot = self
            .connections
            .entry(address.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();
        let mut guard = slot.lock().await;
        let mut connection = match guard.take() {
            Some(connection) => connection,
            None => self.connect(address).await?,
        };

        // A failed exchange drops the connection; the next delivery reconnects.
        let response = Self::round_trip(&mut connection, address, request).await?;
        *guard = Some(connection);

        match response {
            DeliverResponse::Processed(done) => Ok(done),
            DeliverResponse::Failed(reason) => Err(RowLogError::ListenerError {
                subscription_id: subscription.clone(),
                reason,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Serves a [`MessageListener`] to remote row log processors.
pub struct RemoteListenerServer {
    address: HostAddress,
    cancel: CancellationToken,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    registrations: parking_lot::Mutex<Vec<Registration>>,
}

struct Registration {
    coordination: Arc<dyn CoordinationStore>,
    row_log: RowLogId,
    subscription: SubscriptionId,
}

impl RemoteListenerServer {
    /// Bind on `listen_host` (OS-assigned port) and start serving. The address handed to
    /// processors uses `advertise_host`.
    pub async fn bind(
        listen_host: &str,
        advertise_host: &str,
        listener: Arc<dyn MessageListener>,
    ) -> Result<Self, RowLogError> {
        let socket = TcpListener::bind((listen_host, 0)).await.map_err(|e| {
            RowLogError::TransportError {
                address: HostAddress::new(listen_host, 0),
                reason: format!("bind failed: {e}"),
                source: Some(Box::new(e)),
            }
        })?;
        let local = socket.local_addr().map_err(|e| RowLogError::TransportError {
            address: HostAddress::new(listen_host, 0),
            reason: format!("no local address: {e}"),
            source: Some(Box::new(e)),
        })?;
        let address = HostAddress::advertised(advertise_host, local);
        let cancel = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(socket, listener, cancel.clone()));
        tracing::info!(address = %address, "remote listener serving");

        Ok(Self {
            address,
            cancel,
            accept_task: parking_lot::Mutex::new(Some(accept_task)),
            registrations: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn address(&self) -> &HostAddress {
        &self.address
    }

    /// Publish this server as a listener of `subscription`.
    pub async fn register(
        &self,
        coordination: Arc<dyn CoordinationStore>,
        row_log: &RowLogId,
        subscription: &SubscriptionId,
    ) -> Result<(), RowLogError> {
        coordination
            .add_listener(row_log, subscription, &self.address)
            .await?;
        self.registrations.lock().push(Registration {
            coordination,
            row_log: row_log.clone(),
            subscription: subscription.clone(),
        });
        Ok(())
    }

    /// Withdraw every registration and stop serving.
    pub async fn shutdown(&self) {
        let registrations = std::mem::take(&mut *self.registrations.lock());
        for r in registrations {
            if let Err(e) = r
                .coordination
                .remove_listener(&r.row_log, &r.subscription, &self.address)
                .await
            {
                tracing::warn!(
                    subscription = %r.subscription,
                    error = %e,
                    "failed to remove remote listener registration"
                );
            }
        }
        self.cancel.cancel();
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "remote listener accept task failed");
            }
        }
    }
}

impl Drop for RemoteListenerServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    socket: TcpListener,
    listener: Arc<dyn MessageListener>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = socket.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(peer = %peer, "remote listener connection accepted");
                tokio::spawn(serve_connection(
                    stream,
                    Arc::clone(&listener),
                    cancel.child_token(),
                ));
            }
            Err(e) => {
                tracing::warn!(error = %e, "remote listener accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    listener: Arc<dyn MessageListener>,
    cancel: CancellationToken,
) {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = framed.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "remote listener connection error");
                return;
            }
            None => return,
        };
        let response = match decode::<DeliverRequest>(&frame) {
            Ok(request) => match listener.process_message(&request.message).await {
                Ok(done) => DeliverResponse::Processed(done),
                Err(e) => DeliverResponse::Failed(e.to_string()),
            },
            Err(e) => DeliverResponse::Failed(e.to_string()),
        };
        let encoded = match encode(&response) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode remote listener response");
                return;
            }
        };
        if let Err(e) = framed.send(encoded).await {
            tracing::debug!(error = %e, "failed to send remote listener response");
            return;
        }
    }
}
