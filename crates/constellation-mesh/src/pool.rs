//! Dynamic subscriber pool driven by discovery.
//!
//! A pool tracks every discovered service of one kind and keeps a subscriber
//! socket connected to each. Socket lifecycle events and received messages
//! are delivered as a single event stream so the owner can apply its
//! subscriptions on connect and consume messages from one place.
//!
//! A connect failure is treated as transient: it is logged and dropped, and
//! the peer is picked up again on its next OFFER.

use std::collections::BTreeMap;
use std::sync::Arc;

use constellation_core::Md5Hash;
use constellation_protocol::chirp::ServiceIdentifier;
use constellation_protocol::Multipart;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::chirp::{CallbackId, ChirpManager, DiscoveredService, ServiceStatus};
use crate::error::NetworkError;
use crate::sockets::SubSocket;

/// Queue depth of the pooled event stream.
const EVENT_QUEUE: usize = 256;

/// Events emitted by a [`SubscriberPool`].
#[derive(Debug)]
pub enum PoolEvent {
    /// A subscriber socket to this service is now connected.
    Connected(DiscoveredService),
    /// A message arrived from this service.
    Message(DiscoveredService, Multipart),
    /// The socket to this service is gone (departed, dead or broken).
    Disconnected(DiscoveredService),
}

struct PoolSocket {
    service: DiscoveredService,
    socket: Arc<SubSocket>,
    reader: tokio::task::JoinHandle<()>,
}

struct PoolInner {
    sockets: Mutex<BTreeMap<Md5Hash, PoolSocket>>,
    events: mpsc::Sender<PoolEvent>,
    cancel: CancellationToken,
}

/// A set of subscriber sockets, one per discovered service of one kind.
pub struct SubscriberPool {
    service: ServiceIdentifier,
    chirp: Arc<ChirpManager>,
    callback_id: CallbackId,
    inner: Arc<PoolInner>,
}

impl SubscriberPool {
    /// Create a pool and hook it into the discovery manager.
    ///
    /// Returns the pool and its event stream. The caller should follow up
    /// with [`ChirpManager::send_request`] for the service kind to pick up
    /// peers that offered before the pool existed.
    #[must_use]
    pub fn new(
        chirp: Arc<ChirpManager>,
        service: ServiceIdentifier,
    ) -> (Self, mpsc::Receiver<PoolEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let inner = Arc::new(PoolInner {
            sockets: Mutex::new(BTreeMap::new()),
            events: event_tx,
            cancel: CancellationToken::new(),
        });

        let callback_inner = Arc::clone(&inner);
        let callback_id = chirp.register_discover_callback(
            service,
            Arc::new(move |discovered, status| {
                let inner = Arc::clone(&callback_inner);
                tokio::spawn(async move {
                    match status {
                        ServiceStatus::Discovered => inner.connect(discovered).await,
                        ServiceStatus::Departed | ServiceStatus::Dead => {
                            inner.disconnect(discovered).await;
                        }
                    }
                });
            }),
        );

        (
            Self {
                service,
                chirp,
                callback_id,
                inner,
            },
            event_rx,
        )
    }

    /// The service kind this pool follows.
    #[must_use]
    pub const fn service(&self) -> ServiceIdentifier {
        self.service
    }

    /// Subscribe one host's socket to a topic prefix.
    ///
    /// # Errors
    /// Returns [`NetworkError::Closed`] if no socket for the host exists and
    /// [`NetworkError::Protocol`] if the control message cannot be sent.
    pub async fn subscribe(&self, host_id: Md5Hash, prefix: &[u8]) -> Result<(), NetworkError> {
        let socket = self.socket_for(host_id).await.ok_or(NetworkError::Closed)?;
        socket.subscribe(prefix).await
    }

    /// Unsubscribe one host's socket from a topic prefix.
    ///
    /// # Errors
    /// See [`SubscriberPool::subscribe`].
    pub async fn unsubscribe(&self, host_id: Md5Hash, prefix: &[u8]) -> Result<(), NetworkError> {
        let socket = self.socket_for(host_id).await.ok_or(NetworkError::Closed)?;
        socket.unsubscribe(prefix).await
    }

    /// Subscribe every connected socket to a topic prefix.
    pub async fn subscribe_all(&self, prefix: &[u8]) {
        for socket in self.all_sockets().await {
            if let Err(err) = socket.subscribe(prefix).await {
                debug!(%err, "subscribe failed on pooled socket");
            }
        }
    }

    /// Unsubscribe every connected socket from a topic prefix.
    pub async fn unsubscribe_all(&self, prefix: &[u8]) {
        for socket in self.all_sockets().await {
            if let Err(err) = socket.unsubscribe(prefix).await {
                debug!(%err, "unsubscribe failed on pooled socket");
            }
        }
    }

    /// Hosts with a currently connected socket.
    pub async fn connected_hosts(&self) -> Vec<Md5Hash> {
        self.inner.sockets.lock().await.keys().copied().collect()
    }

    /// Disconnect everything and detach from discovery.
    pub async fn shutdown(&self) {
        self.chirp.unregister_discover_callback(self.callback_id);
        self.inner.cancel.cancel();
        let mut sockets = self.inner.sockets.lock().await;
        for (_, pooled) in std::mem::take(&mut *sockets) {
            pooled.socket.close();
            pooled.reader.abort();
        }
    }

    async fn socket_for(&self, host_id: Md5Hash) -> Option<Arc<SubSocket>> {
        self.inner
            .sockets
            .lock()
            .await
            .get(&host_id)
            .map(|pooled| Arc::clone(&pooled.socket))
    }

    async fn all_sockets(&self) -> Vec<Arc<SubSocket>> {
        self.inner
            .sockets
            .lock()
            .await
            .values()
            .map(|pooled| Arc::clone(&pooled.socket))
            .collect()
    }
}

impl Drop for SubscriberPool {
    fn drop(&mut self) {
        self.chirp.unregister_discover_callback(self.callback_id);
        self.inner.cancel.cancel();
    }
}

impl PoolInner {
    async fn connect(self: Arc<Self>, service: DiscoveredService) {
        if self.cancel.is_cancelled() {
            return;
        }
        let addr = service.socket_addr();
        trace!(%addr, "connecting pooled subscriber");
        let (socket, mut messages) = match SubSocket::connect(addr).await {
            Ok(connected) => connected,
            Err(err) => {
                // Transient: the peer re-OFFERs on the next REQUEST cycle.
                debug!(%addr, %err, "subscriber connect failed");
                return;
            }
        };
        let socket = Arc::new(socket);

        {
            let mut sockets = self.sockets.lock().await;
            if let Some(previous) = sockets.remove(&service.host_id) {
                previous.socket.close();
                previous.reader.abort();
            }

            let reader_inner = Arc::clone(&self);
            let reader = tokio::spawn(async move {
                while let Some(message) = messages.recv().await {
                    if reader_inner
                        .events
                        .send(PoolEvent::Message(service, message))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                let _ = reader_inner.events.send(PoolEvent::Disconnected(service)).await;
            });

            sockets.insert(
                service.host_id,
                PoolSocket {
                    service,
                    socket,
                    reader,
                },
            );
        }
        debug!(%addr, host = %service.host_id, "pooled subscriber connected");
        let _ = self.events.send(PoolEvent::Connected(service)).await;
    }

    async fn disconnect(self: Arc<Self>, service: DiscoveredService) {
        let removed = {
            let mut sockets = self.sockets.lock().await;
            // Identity ignores the address; make sure the stored entry
            // refers to the same service before tearing it down.
            let matches = sockets
                .get(&service.host_id)
                .is_some_and(|pooled| pooled.service == service);
            if matches {
                sockets.remove(&service.host_id)
            } else {
                None
            }
        };
        if let Some(pooled) = removed {
            pooled.socket.close();
            pooled.reader.abort();
            debug!(host = %service.host_id, "pooled subscriber disconnected");
            let _ = self.events.send(PoolEvent::Disconnected(service)).await;
        }
    }
}
