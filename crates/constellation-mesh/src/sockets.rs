//! Message sockets over multipart TCP framing.
//!
//! The Constellation protocols use four socket roles: a strict request/reply
//! pair (REP for the satellite command receiver, REQ for controllers) and a
//! publish/subscribe pair (PUB for heartbeats and monitoring, SUB for their
//! receivers). Subscriptions are prefix-based and
//! evaluated on the publisher, so a subscriber only receives messages whose
//! topic frame starts with one of its announced prefixes; the empty prefix
//! subscribes to everything.
//!
//! Subscribers announce prefixes with control messages `["SUB", prefix]` and
//! `["UNSUB", prefix]` on the same connection. A publisher never blocks on a
//! slow subscriber: its per-connection queue overflows and the connection is
//! dropped.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use constellation_protocol::Multipart;
use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::NetworkError;

/// Queue depth towards a single subscriber before it is dropped.
const SUBSCRIBER_QUEUE: usize = 256;

/// Queue depth of pending requests on a REP socket.
const REQUEST_QUEUE: usize = 64;

const SUBSCRIBE_VERB: &[u8] = b"SUB";
const UNSUBSCRIBE_VERB: &[u8] = b"UNSUB";

// ─────────────────────────────────────────────────────────────────────────────
// REP
// ─────────────────────────────────────────────────────────────────────────────

/// Reply handle for one received request; consuming it sends the reply.
#[derive(Debug)]
pub struct ReplyHandle {
    tx: oneshot::Sender<Multipart>,
}

impl ReplyHandle {
    /// Send the reply for the request this handle belongs to.
    pub fn send(self, reply: Multipart) {
        // The connection may have died while the request was being handled.
        let _ = self.tx.send(reply);
    }
}

/// Strict reply socket: one reply per request, per-connection alternation.
///
/// All connections funnel their requests into a single queue so one task can
/// serve the socket; replies are routed back to the originating connection.
pub struct RepSocket {
    local_addr: SocketAddr,
    requests: mpsc::Receiver<(Multipart, ReplyHandle)>,
    cancel: CancellationToken,
}

impl RepSocket {
    /// Bind to an address; use port 0 for an ephemeral port.
    ///
    /// # Errors
    /// Returns [`NetworkError::Bind`] if the listener cannot be created.
    pub async fn bind(addr: SocketAddr) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| NetworkError::Bind {
            endpoint: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| NetworkError::Bind {
            endpoint: addr.to_string(),
            source,
        })?;

        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        let cancel = CancellationToken::new();

        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            trace!(%peer, "command connection accepted");
                            let tx = tx.clone();
                            let cancel = accept_cancel.clone();
                            tokio::spawn(rep_connection(stream, tx, cancel));
                        }
                        Err(err) => {
                            debug!(%err, "accept failed on reply socket");
                        }
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            requests: rx,
            cancel,
        })
    }

    /// The bound local address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bound TCP port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Receive the next request from any connection.
    ///
    /// Returns `None` once the socket is closed. Callers impose their own
    /// timeout via `tokio::time::timeout`.
    pub async fn recv(&mut self) -> Option<(Multipart, ReplyHandle)> {
        self.requests.recv().await
    }

    /// Stop accepting and close all connections.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RepSocket {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn rep_connection(
    stream: TcpStream,
    tx: mpsc::Sender<(Multipart, ReplyHandle)>,
    cancel: CancellationToken,
) {
    let (mut reader, mut writer) = stream.into_split();
    loop {
        let request = tokio::select! {
            () = cancel.cancelled() => break,
            request = Multipart::read_from(&mut reader) => request,
        };
        let request = match request {
            Ok(request) => request,
            Err(err) => {
                trace!(%err, "command connection closed");
                break;
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if tx.send((request, ReplyHandle { tx: reply_tx })).await.is_err() {
            break;
        }
        // Strict alternation: wait for the reply before reading again.
        let Ok(reply) = reply_rx.await else {
            break;
        };
        if let Err(err) = reply.write_to(&mut writer).await {
            debug!(%err, "failed to write reply, dropping connection");
            break;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// REQ
// ─────────────────────────────────────────────────────────────────────────────

/// Strict request socket: send one message, then receive exactly one reply.
pub struct ReqSocket {
    stream: TcpStream,
}

impl ReqSocket {
    /// Connect to a reply socket.
    ///
    /// # Errors
    /// Returns [`NetworkError::Connect`] on failure.
    pub async fn connect(addr: SocketAddr) -> Result<Self, NetworkError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| NetworkError::Connect {
                endpoint: addr.to_string(),
                source,
            })?;
        Ok(Self { stream })
    }

    /// Send a request and await its reply.
    ///
    /// # Errors
    /// Returns [`NetworkError::Protocol`] on framing failure, which includes
    /// the peer disappearing mid-exchange.
    pub async fn request(&mut self, request: &Multipart) -> Result<Multipart, NetworkError> {
        request.write_to(&mut self.stream).await?;
        Ok(Multipart::read_from(&mut self.stream).await?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PUB
// ─────────────────────────────────────────────────────────────────────────────

/// A subscription change observed by a publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// A connection subscribed to a prefix.
    Subscribe(Bytes),
    /// A connection dropped a prefix.
    Unsubscribe(Bytes),
}

struct Subscriber {
    tx: mpsc::Sender<Multipart>,
    prefixes: Arc<Mutex<BTreeSet<Bytes>>>,
}

struct PubShared {
    subscribers: Mutex<Vec<Subscriber>>,
    events: mpsc::Sender<SubscriptionEvent>,
}

/// Publishing socket with publisher-side prefix filtering.
pub struct PubSocket {
    local_addr: SocketAddr,
    shared: Arc<PubShared>,
    events: Mutex<Option<mpsc::Receiver<SubscriptionEvent>>>,
    cancel: CancellationToken,
}

impl PubSocket {
    /// Bind to an address; use port 0 for an ephemeral port.
    ///
    /// # Errors
    /// Returns [`NetworkError::Bind`] if the listener cannot be created.
    pub async fn bind(addr: SocketAddr) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| NetworkError::Bind {
            endpoint: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| NetworkError::Bind {
            endpoint: addr.to_string(),
            source,
        })?;

        let (event_tx, event_rx) = mpsc::channel(REQUEST_QUEUE);
        let shared = Arc::new(PubShared {
            subscribers: Mutex::new(Vec::new()),
            events: event_tx,
        });
        let cancel = CancellationToken::new();

        let accept_shared = Arc::clone(&shared);
        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            trace!(%peer, "subscriber connected");
                            pub_connection(&accept_shared, stream, accept_cancel.clone());
                        }
                        Err(err) => {
                            debug!(%err, "accept failed on publish socket");
                        }
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            shared,
            events: Mutex::new(Some(event_rx)),
            cancel,
        })
    }

    /// The bound local address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bound TCP port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Take the stream of subscription events (once).
    #[must_use]
    pub fn take_subscription_events(&self) -> Option<mpsc::Receiver<SubscriptionEvent>> {
        self.events.lock().take()
    }

    /// Publish a message; its first frame is the topic used for filtering.
    ///
    /// Never blocks: subscribers whose queue is full are dropped.
    pub fn publish(&self, message: &Multipart) {
        let topic = message.frame(0).cloned().unwrap_or_default();
        let mut subscribers = self.shared.subscribers.lock();
        subscribers.retain(|subscriber| {
            let matches = subscriber
                .prefixes
                .lock()
                .iter()
                .any(|prefix| topic.starts_with(prefix.as_ref()));
            if !matches {
                return !subscriber.tx.is_closed();
            }
            match subscriber.tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("dropping slow subscriber");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Number of currently connected subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().len()
    }

    /// Stop accepting and drop all subscribers.
    pub fn close(&self) {
        self.cancel.cancel();
        self.shared.subscribers.lock().clear();
    }
}

impl Drop for PubSocket {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn pub_connection(shared: &Arc<PubShared>, stream: TcpStream, cancel: CancellationToken) {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
    let prefixes = Arc::new(Mutex::new(BTreeSet::new()));

    shared.subscribers.lock().push(Subscriber {
        tx,
        prefixes: Arc::clone(&prefixes),
    });

    tokio::spawn(pub_writer(writer, rx, cancel.clone()));
    tokio::spawn(pub_reader(Arc::clone(shared), reader, prefixes, cancel));
}

async fn pub_writer(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Multipart>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = rx.recv() => message,
        };
        let Some(message) = message else { break };
        if let Err(err) = message.write_to(&mut writer).await {
            trace!(%err, "subscriber write failed");
            break;
        }
    }
}

async fn pub_reader(
    shared: Arc<PubShared>,
    mut reader: OwnedReadHalf,
    prefixes: Arc<Mutex<BTreeSet<Bytes>>>,
    cancel: CancellationToken,
) {
    loop {
        let control = tokio::select! {
            () = cancel.cancelled() => break,
            control = Multipart::read_from(&mut reader) => control,
        };
        let Ok(control) = control else { break };
        let (Some(verb), Some(prefix)) = (control.frame(0), control.frame(1)) else {
            continue;
        };
        let event = if verb.as_ref() == SUBSCRIBE_VERB {
            prefixes.lock().insert(prefix.clone());
            SubscriptionEvent::Subscribe(prefix.clone())
        } else if verb.as_ref() == UNSUBSCRIBE_VERB {
            prefixes.lock().remove(prefix);
            SubscriptionEvent::Unsubscribe(prefix.clone())
        } else {
            continue;
        };
        // Subscription events are advisory; drop them when nobody listens.
        let _ = shared.events.try_send(event);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SUB
// ─────────────────────────────────────────────────────────────────────────────

/// Subscribing socket; messages arrive on the receiver returned at connect.
pub struct SubSocket {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    cancel: CancellationToken,
}

impl SubSocket {
    /// Connect to a publisher; returns the socket and its message stream.
    ///
    /// # Errors
    /// Returns [`NetworkError::Connect`] on failure.
    pub async fn connect(addr: SocketAddr) -> Result<(Self, mpsc::Receiver<Multipart>), NetworkError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| NetworkError::Connect {
                endpoint: addr.to_string(),
                source,
            })?;
        let (mut reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let cancel = CancellationToken::new();

        let read_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    () = read_cancel.cancelled() => break,
                    message = Multipart::read_from(&mut reader) => message,
                };
                let Ok(message) = message else { break };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        Ok((
            Self {
                writer: tokio::sync::Mutex::new(writer),
                cancel,
            },
            rx,
        ))
    }

    /// Subscribe to a topic prefix; the empty prefix matches everything.
    ///
    /// # Errors
    /// Returns [`NetworkError::Protocol`] if the control message cannot be
    /// sent.
    pub async fn subscribe(&self, prefix: &[u8]) -> Result<(), NetworkError> {
        self.send_control(SUBSCRIBE_VERB, prefix).await
    }

    /// Drop a previously announced prefix.
    ///
    /// # Errors
    /// Returns [`NetworkError::Protocol`] if the control message cannot be
    /// sent.
    pub async fn unsubscribe(&self, prefix: &[u8]) -> Result<(), NetworkError> {
        self.send_control(UNSUBSCRIBE_VERB, prefix).await
    }

    async fn send_control(&self, verb: &[u8], prefix: &[u8]) -> Result<(), NetworkError> {
        let mut control = Multipart::new();
        control.push(verb.to_vec());
        control.push(prefix.to_vec());
        let mut writer = self.writer.lock().await;
        control.write_to(&mut *writer).await?;
        Ok(())
    }

    /// Close the connection.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SubSocket {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
