//! CHIRP discovery manager.
//!
//! One manager per process: it owns the UDP broadcast socket, the set of
//! locally registered services and the cache of services discovered on the
//! network. Components interested in a service kind register a callback and
//! are notified from short-lived detached tasks, so a slow callback can never
//! stall the receive loop.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use constellation_protocol::chirp::{
    ChirpMessage, ChirpMessageType, ServiceIdentifier, CHIRP_MESSAGE_LENGTH, CHIRP_PORT,
};
use constellation_core::Md5Hash;
use parking_lot::Mutex;
use socket2::{Domain, Protocol as SocketProtocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::NetworkError;

/// Permits for concurrently running discovery callbacks.
const CALLBACK_PERMITS: usize = 4;

/// A service offered by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegisteredService {
    /// Service kind.
    pub identifier: ServiceIdentifier,
    /// Local TCP port the service listens on.
    pub port: u16,
}

/// A service discovered on the network.
///
/// Identity is `(host_id, identifier, port)`; the remote address is metadata
/// and deliberately excluded from equality and ordering.
#[derive(Debug, Clone, Copy)]
pub struct DiscoveredService {
    /// Address the offer was received from.
    pub address: Ipv4Addr,
    /// Identity of the offering host.
    pub host_id: Md5Hash,
    /// Service kind.
    pub identifier: ServiceIdentifier,
    /// Remote TCP port.
    pub port: u16,
}

impl DiscoveredService {
    fn key(&self) -> (Md5Hash, u8, u16) {
        (self.host_id, self.identifier as u8, self.port)
    }

    /// The connectable endpoint of this service.
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.address), self.port)
    }
}

impl PartialEq for DiscoveredService {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for DiscoveredService {}

impl PartialOrd for DiscoveredService {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DiscoveredService {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl std::hash::Hash for DiscoveredService {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

/// Status delivered to discovery callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// The service was newly offered.
    Discovered,
    /// The service departed cleanly.
    Departed,
    /// The service was dropped from the cache without a DEPART.
    Dead,
}

/// Discovery callback: invoked on a detached task per status change.
pub type DiscoverCallback = Arc<dyn Fn(DiscoveredService, ServiceStatus) + Send + Sync>;

/// Handle for removing a registered discovery callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallbackId(u64);

/// Configuration of a [`ChirpManager`].
#[derive(Debug, Clone)]
pub struct ChirpConfig {
    /// Group this process belongs to.
    pub group: String,
    /// Canonical name of this host.
    pub host: String,
    /// Local address to bind, typically unspecified.
    pub bind_addr: Ipv4Addr,
    /// Broadcast address for outgoing datagrams.
    pub broadcast_addr: Ipv4Addr,
    /// UDP port; the well-known CHIRP port unless isolated for tests.
    pub port: u16,
}

impl ChirpConfig {
    /// Configuration for a group with default addressing.
    #[must_use]
    pub fn new(group: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            host: host.into(),
            bind_addr: Ipv4Addr::UNSPECIFIED,
            broadcast_addr: Ipv4Addr::BROADCAST,
            port: CHIRP_PORT,
        }
    }
}

struct CallbackEntry {
    service: ServiceIdentifier,
    callback: DiscoverCallback,
}

struct Inner {
    group_id: Md5Hash,
    host_id: Md5Hash,
    socket: Arc<UdpSocket>,
    broadcast_target: SocketAddrV4,
    registered: Mutex<BTreeSet<RegisteredService>>,
    discovered: Mutex<BTreeSet<DiscoveredService>>,
    callbacks: Mutex<BTreeMap<CallbackId, CallbackEntry>>,
    next_callback_id: AtomicU64,
    callback_permits: Arc<Semaphore>,
}

/// The per-process CHIRP discovery manager.
pub struct ChirpManager {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    fatal: watch::Receiver<Option<Arc<NetworkError>>>,
}

impl ChirpManager {
    /// Bind the CHIRP socket and start the receive loop.
    ///
    /// The socket is bound with `SO_REUSEADDR` and `SO_BROADCAST` so that
    /// several satellites can share one host.
    ///
    /// # Errors
    /// Returns [`NetworkError::Bind`] if the socket cannot be created.
    pub fn start(config: ChirpConfig) -> Result<Arc<Self>, NetworkError> {
        let endpoint = SocketAddrV4::new(config.bind_addr, config.port);
        let socket = bind_broadcast_socket(endpoint).map_err(|source| NetworkError::Bind {
            endpoint: endpoint.to_string(),
            source,
        })?;

        let group_id = Md5Hash::new(&config.group);
        let host_id = Md5Hash::new(&config.host);
        debug!(group = %config.group, %group_id, host = %config.host, %host_id, "starting CHIRP manager");

        let inner = Arc::new(Inner {
            group_id,
            host_id,
            socket: Arc::new(socket),
            broadcast_target: SocketAddrV4::new(config.broadcast_addr, config.port),
            registered: Mutex::new(BTreeSet::new()),
            discovered: Mutex::new(BTreeSet::new()),
            callbacks: Mutex::new(BTreeMap::new()),
            next_callback_id: AtomicU64::new(1),
            callback_permits: Arc::new(Semaphore::new(CALLBACK_PERMITS)),
        });
        let cancel = CancellationToken::new();

        // Socket errors are fatal for discovery; report the loop's death so
        // owners can propagate it instead of silently losing the group.
        let (fatal_tx, fatal_rx) = watch::channel(None);
        let loop_inner = Arc::clone(&inner);
        let loop_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = receive_loop(loop_inner, loop_cancel).await {
                error!(%err, "CHIRP socket error, stopping receive loop");
                let _ = fatal_tx.send(Some(Arc::new(err)));
            }
        });

        Ok(Arc::new(Self {
            inner,
            cancel,
            fatal: fatal_rx,
        }))
    }

    /// The receive-loop failure, once the loop has died on a socket error.
    #[must_use]
    pub fn fatal_error(&self) -> Option<Arc<NetworkError>> {
        self.fatal.borrow().clone()
    }

    /// Watch for the receive loop dying on a socket error; the value switches
    /// from `None` to the failure exactly once.
    #[must_use]
    pub fn subscribe_fatal(&self) -> watch::Receiver<Option<Arc<NetworkError>>> {
        self.fatal.clone()
    }

    /// The group identity used for filtering.
    #[must_use]
    pub fn group_id(&self) -> Md5Hash {
        self.inner.group_id
    }

    /// The identity of this host.
    #[must_use]
    pub fn host_id(&self) -> Md5Hash {
        self.inner.host_id
    }

    /// Register a local service and broadcast an OFFER if newly inserted.
    ///
    /// Returns whether the service was actually inserted.
    pub async fn register_service(&self, identifier: ServiceIdentifier, port: u16) -> bool {
        let service = RegisteredService { identifier, port };
        let inserted = self.inner.registered.lock().insert(service);
        if inserted {
            self.inner.send_message(ChirpMessageType::Offer, service).await;
        }
        inserted
    }

    /// Unregister a local service and broadcast a DEPART if it was present.
    ///
    /// Returns whether the service was actually removed.
    pub async fn unregister_service(&self, identifier: ServiceIdentifier, port: u16) -> bool {
        let service = RegisteredService { identifier, port };
        let removed = self.inner.registered.lock().remove(&service);
        if removed {
            self.inner.send_message(ChirpMessageType::Depart, service).await;
        }
        removed
    }

    /// Unregister every local service, broadcasting a DEPART for each.
    pub async fn unregister_all_services(&self) {
        let services: Vec<_> = {
            let mut registered = self.inner.registered.lock();
            let services = registered.iter().copied().collect();
            registered.clear();
            services
        };
        for service in services {
            self.inner.send_message(ChirpMessageType::Depart, service).await;
        }
    }

    /// Snapshot of the locally registered services.
    #[must_use]
    pub fn registered_services(&self) -> Vec<RegisteredService> {
        self.inner.registered.lock().iter().copied().collect()
    }

    /// Broadcast a REQUEST for a service kind; peers re-OFFER in response.
    pub async fn send_request(&self, identifier: ServiceIdentifier) {
        self.inner
            .send_message(ChirpMessageType::Request, RegisteredService { identifier, port: 0 })
            .await;
    }

    /// Register a discovery callback for one service kind.
    pub fn register_discover_callback(
        &self,
        service: ServiceIdentifier,
        callback: DiscoverCallback,
    ) -> CallbackId {
        let id = CallbackId(self.inner.next_callback_id.fetch_add(1, AtomicOrdering::Relaxed));
        self.inner
            .callbacks
            .lock()
            .insert(id, CallbackEntry { service, callback });
        id
    }

    /// Remove a discovery callback; returns whether it was present.
    pub fn unregister_discover_callback(&self, id: CallbackId) -> bool {
        self.inner.callbacks.lock().remove(&id).is_some()
    }

    /// Remove all discovery callbacks.
    pub fn unregister_discover_callbacks(&self) {
        self.inner.callbacks.lock().clear();
    }

    /// Snapshot of all discovered services.
    #[must_use]
    pub fn discovered_services(&self) -> Vec<DiscoveredService> {
        self.inner.discovered.lock().iter().copied().collect()
    }

    /// Snapshot of discovered services of one kind.
    #[must_use]
    pub fn discovered_services_of(&self, identifier: ServiceIdentifier) -> Vec<DiscoveredService> {
        self.inner
            .discovered
            .lock()
            .iter()
            .filter(|service| service.identifier == identifier)
            .copied()
            .collect()
    }

    /// Drop one discovered service, notifying callbacks with
    /// [`ServiceStatus::Dead`].
    pub fn forget_discovered_service(&self, identifier: ServiceIdentifier, host_id: Md5Hash) {
        let mut dropped = Vec::new();
        {
            let mut discovered = self.inner.discovered.lock();
            discovered.retain(|service| {
                if service.host_id == host_id && service.identifier == identifier {
                    dropped.push(*service);
                    false
                } else {
                    true
                }
            });
        }
        for service in dropped {
            debug!(%host_id, service = %identifier, "dropping discovered service");
            self.inner.fire_callbacks(service, ServiceStatus::Dead);
        }
    }

    /// Drop every discovered service of one host, notifying callbacks.
    pub fn forget_discovered_host(&self, host_id: Md5Hash) {
        let mut dropped = Vec::new();
        {
            let mut discovered = self.inner.discovered.lock();
            discovered.retain(|service| {
                if service.host_id == host_id {
                    dropped.push(*service);
                    false
                } else {
                    true
                }
            });
        }
        debug!(%host_id, count = dropped.len(), "dropping discovered services for host");
        for service in dropped {
            self.inner.fire_callbacks(service, ServiceStatus::Dead);
        }
    }

    /// Clear the discovered-service cache without notifying callbacks.
    pub fn forget_discovered_services(&self) {
        self.inner.discovered.lock().clear();
    }

    /// The local UDP port of the CHIRP socket.
    ///
    /// # Errors
    /// Returns [`NetworkError::Closed`] if the socket address is unavailable.
    pub fn local_port(&self) -> Result<u16, NetworkError> {
        self.inner
            .socket
            .local_addr()
            .map(|addr| addr.port())
            .map_err(|_| NetworkError::Closed)
    }

    /// Stop the receive loop and depart all registered services.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.unregister_all_services().await;
    }
}

impl Drop for ChirpManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Inner {
    async fn send_message(&self, message_type: ChirpMessageType, service: RegisteredService) {
        trace!(%message_type, service = %service.identifier, port = service.port, "sending CHIRP message");
        let message = ChirpMessage {
            message_type,
            group_id: self.group_id,
            host_id: self.host_id,
            service: service.identifier,
            port: service.port,
        };
        if let Err(err) = self
            .socket
            .send_to(&message.assemble(), SocketAddr::V4(self.broadcast_target))
            .await
        {
            warn!(%err, "failed to send CHIRP broadcast");
        }
    }

    fn fire_callbacks(self: &Arc<Self>, service: DiscoveredService, status: ServiceStatus) {
        let matching: Vec<DiscoverCallback> = self
            .callbacks
            .lock()
            .values()
            .filter(|entry| entry.service == service.identifier)
            .map(|entry| Arc::clone(&entry.callback))
            .collect();

        for callback in matching {
            let permits = Arc::clone(&self.callback_permits);
            tokio::spawn(async move {
                // Bounded concurrency; never closed, so acquire cannot fail.
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                callback(service, status);
            });
        }
    }
}

fn bind_broadcast_socket(endpoint: SocketAddrV4) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SocketProtocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(endpoint).into())?;
    UdpSocket::from_std(socket.into())
}

async fn receive_loop(inner: Arc<Inner>, cancel: CancellationToken) -> Result<(), NetworkError> {
    let mut buf = [0_u8; CHIRP_MESSAGE_LENGTH + 1];
    loop {
        let received = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            received = inner.socket.recv_from(&mut buf) => received,
        };
        let (len, remote) = received.map_err(NetworkError::Recv)?;

        let message = match ChirpMessage::disassemble(&buf[..len]) {
            Ok(message) => message,
            Err(err) => {
                warn!(%remote, %err, "discarding malformed CHIRP datagram");
                continue;
            }
        };

        if message.group_id != inner.group_id || message.host_id == inner.host_id {
            continue;
        }

        let IpAddr::V4(remote_addr) = remote.ip() else {
            continue;
        };
        let service = DiscoveredService {
            address: remote_addr,
            host_id: message.host_id,
            identifier: message.service,
            port: message.port,
        };

        match message.message_type {
            ChirpMessageType::Request => {
                trace!(service = %message.service, "received REQUEST");
                let matching: Vec<RegisteredService> = inner
                    .registered
                    .lock()
                    .iter()
                    .filter(|registered| registered.identifier == message.service)
                    .copied()
                    .collect();
                for registered in matching {
                    inner.send_message(ChirpMessageType::Offer, registered).await;
                }
            }
            ChirpMessageType::Offer => {
                let inserted = inner.discovered.lock().insert(service);
                if inserted {
                    debug!(
                        service = %service.identifier,
                        address = %service.address,
                        port = service.port,
                        "service discovered"
                    );
                    inner.fire_callbacks(service, ServiceStatus::Discovered);
                }
            }
            ChirpMessageType::Depart => {
                let removed = inner.discovered.lock().remove(&service);
                if removed {
                    debug!(
                        service = %service.identifier,
                        address = %service.address,
                        port = service.port,
                        "service departed"
                    );
                    inner.fire_callbacks(service, ServiceStatus::Departed);
                }
            }
        }
    }
}
