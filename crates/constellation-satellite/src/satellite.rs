//! Satellite trait and runtime assembly.
//!
//! [`SatelliteHandle::spawn`] wires one satellite implementation into the
//! group: CHIRP manager, CSCP reply socket, heartbeat publisher/receiver and
//! the monitoring publisher are created here and torn down in deterministic
//! order on shutdown (command loop first, then an interrupt to reach a safe
//! steady state, then heartbeats, then discovery).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use constellation_core::identity::InvalidName;
use constellation_core::{
    Configuration, Dictionary, Group, List, SatelliteName, State, TransitionCommand, Usage, Value,
};
use constellation_mesh::chirp::{ChirpConfig, ChirpManager};
use constellation_mesh::heartbeat::{HeartbeatManager, DEFAULT_INTERVAL};
use constellation_mesh::sockets::RepSocket;
use constellation_mesh::{CmdpPublisher, NetworkError};
use constellation_protocol::chirp::{ServiceIdentifier, CHIRP_PORT};
use constellation_protocol::codec;
use constellation_protocol::cscp::{CscpMessage, CscpMessageType};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::commands::{CommandError, CommandRegistry};
use crate::fsm::Fsm;

/// Error reported by a satellite action; routes the FSM to ERROR.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct SatelliteError(pub String);

impl SatelliteError {
    /// Build an error from any displayable message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<constellation_core::config::ConfigError> for SatelliteError {
    fn from(err: constellation_core::config::ConfigError) -> Self {
        Self(err.to_string())
    }
}

/// A satellite shared between the FSM and its transition tasks.
pub type SharedSatellite = Arc<tokio::sync::Mutex<dyn Satellite>>;

/// User-implemented satellite behavior.
///
/// Every method runs on a dedicated transition task while the FSM sits in
/// the corresponding transitional state; returning `Err` drops the satellite
/// to ERROR via [`Satellite::failure`]. Only [`Satellite::initializing`] is
/// mandatory.
#[async_trait]
pub trait Satellite: Send + 'static {
    /// Whether this satellite implements `reconfigure`.
    fn supports_reconfigure(&self) -> bool {
        false
    }

    /// Apply a configuration; read keys are tracked, unread ones warned
    /// about and dropped after the transition.
    async fn initializing(&mut self, config: &mut Configuration) -> Result<(), SatelliteError>;

    /// Prepare for data taking.
    async fn launching(&mut self) -> Result<(), SatelliteError> {
        Ok(())
    }

    /// Return from ORBIT to INIT.
    async fn landing(&mut self) -> Result<(), SatelliteError> {
        Ok(())
    }

    /// Apply a partial configuration in ORBIT. Only called when
    /// [`Satellite::supports_reconfigure`] returns true.
    async fn reconfiguring(&mut self, _partial: &mut Configuration) -> Result<(), SatelliteError> {
        Err(SatelliteError::new("reconfigure is not implemented"))
    }

    /// Prepare a new run.
    async fn starting(&mut self, _run_identifier: &str) -> Result<(), SatelliteError> {
        Ok(())
    }

    /// The data-acquisition loop. MUST poll `stop` at sub-second cadence;
    /// there is no forced preemption.
    async fn running(&mut self, stop: CancellationToken) -> Result<(), SatelliteError> {
        stop.cancelled().await;
        Ok(())
    }

    /// Finish the current run.
    async fn stopping(&mut self) -> Result<(), SatelliteError> {
        Ok(())
    }

    /// Reach a safe configuration after a degraded peer or lost heartbeats.
    async fn interrupting(&mut self, previous_state: State) -> Result<(), SatelliteError> {
        if previous_state == State::Run {
            self.stopping().await?;
        }
        self.landing().await
    }

    /// Last-resort cleanup on the way to ERROR; must not fail.
    async fn failure(&mut self, _previous_state: State) {}
}

/// Shared mutable state of one satellite: status line, stored configuration
/// and the current run identifier.
#[derive(Default)]
pub struct SatelliteContext {
    status: Mutex<String>,
    config: Mutex<Configuration>,
    run_identifier: Mutex<String>,
}

impl SatelliteContext {
    /// Fresh context with empty status and configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current status line.
    #[must_use]
    pub fn status(&self) -> String {
        self.status.lock().clone()
    }

    /// Replace the status line.
    pub fn set_status(&self, status: impl Into<String>) {
        *self.status.lock() = status.into();
    }

    /// The current run identifier; empty before the first run.
    #[must_use]
    pub fn run_identifier(&self) -> String {
        self.run_identifier.lock().clone()
    }

    /// Store the run identifier.
    pub fn set_run_identifier(&self, run_identifier: impl Into<String>) {
        *self.run_identifier.lock() = run_identifier.into();
    }

    /// The stored configuration as a dictionary of used keys.
    #[must_use]
    pub fn config_dictionary(&self) -> Dictionary {
        self.config.lock().dictionary(Group::All, Usage::Used)
    }

    /// Store the configuration applied by `initialize`, dropping and warning
    /// about keys the action never read.
    pub fn store_config(&self, mut config: Configuration) {
        let dropped = config.retain_used();
        if !dropped.is_empty() {
            warn!(
                count = dropped.len(),
                keys = ?dropped,
                "configuration keys were not used"
            );
        }
        info!(settings = config.size(Group::User), "configuration stored");
        *self.config.lock() = config;
    }

    /// Merge a partial configuration applied by `reconfigure`; only keys the
    /// action read are taken over.
    pub fn update_config(&self, partial: &Configuration) {
        let unused = partial.keys(Group::All, Usage::Unused);
        if !unused.is_empty() {
            warn!(
                count = unused.len(),
                keys = ?unused,
                "partial configuration keys were not used"
            );
        }
        self.config.lock().update(partial);
    }
}

/// Parameters of a satellite process.
#[derive(Debug, Clone)]
pub struct SatelliteOptions {
    /// Type and instance name.
    pub name: SatelliteName,
    /// Group this satellite belongs to.
    pub group: String,
    /// Local interface address for the CHIRP socket.
    pub bind_addr: Ipv4Addr,
    /// Broadcast address for CHIRP datagrams.
    pub broadcast_addr: Ipv4Addr,
    /// UDP discovery port.
    pub chirp_port: u16,
    /// Heartbeat cadence.
    pub heartbeat_interval: Duration,
}

impl SatelliteOptions {
    /// Options with default addressing for a named satellite in a group.
    ///
    /// # Errors
    /// Returns [`InvalidName`] for names outside `[A-Za-z0-9_]+`.
    pub fn new(
        type_name: impl Into<String>,
        instance: impl Into<String>,
        group: impl Into<String>,
    ) -> Result<Self, InvalidName> {
        let group = group.into();
        if !constellation_core::is_valid_name(&group) {
            return Err(InvalidName { part: group });
        }
        Ok(Self {
            name: SatelliteName::new(type_name, instance)?,
            group,
            bind_addr: Ipv4Addr::UNSPECIFIED,
            broadcast_addr: Ipv4Addr::BROADCAST,
            chirp_port: CHIRP_PORT,
            heartbeat_interval: DEFAULT_INTERVAL,
        })
    }
}

struct DispatchContext {
    canonical: String,
    fsm: Fsm,
    registry: CommandRegistry,
    context: Arc<SatelliteContext>,
    supports_reconfigure: bool,
    shutdown: CancellationToken,
}

/// A running satellite.
pub struct SatelliteHandle {
    canonical: String,
    fsm: Fsm,
    context: Arc<SatelliteContext>,
    chirp: Arc<ChirpManager>,
    heartbeat: Arc<HeartbeatManager>,
    monitoring: Arc<CmdpPublisher>,
    shutdown: CancellationToken,
    cscp_task: Mutex<Option<tokio::task::JoinHandle<Result<(), NetworkError>>>>,
    port: u16,
}

impl SatelliteHandle {
    /// Assemble and start a satellite.
    ///
    /// # Errors
    /// Returns [`NetworkError`] if any of the sockets cannot be created.
    pub async fn spawn(
        options: SatelliteOptions,
        satellite: impl Satellite,
        registry: CommandRegistry,
    ) -> Result<Arc<Self>, NetworkError> {
        let canonical = options.name.canonical();
        info!(satellite = %canonical, group = %options.group, "starting satellite");

        let chirp = ChirpManager::start(ChirpConfig {
            group: options.group.clone(),
            host: canonical.clone(),
            bind_addr: options.bind_addr,
            broadcast_addr: options.broadcast_addr,
            port: options.chirp_port,
        })?;

        let mut rep = RepSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?;
        let port = rep.port();
        chirp.register_service(ServiceIdentifier::Control, port).await;
        info!(port, "listening for commands");

        let supports_reconfigure = satellite.supports_reconfigure();
        let shared: SharedSatellite = Arc::new(tokio::sync::Mutex::new(satellite));
        let context = Arc::new(SatelliteContext::new());
        let fsm = Fsm::new(shared, supports_reconfigure, Arc::clone(&context));

        let monitoring = CmdpPublisher::start(&chirp, canonical.clone()).await?;

        let state_fsm = fsm.clone();
        let status_context = Arc::clone(&context);
        let interrupt_fsm = fsm.clone();
        let heartbeat = Arc::new(
            HeartbeatManager::start(
                Arc::clone(&chirp),
                canonical.clone(),
                options.heartbeat_interval,
                Arc::new(move || state_fsm.state()),
                Arc::new(move || {
                    let status = status_context.status();
                    (!status.is_empty()).then_some(status)
                }),
                Arc::new(move |reason| {
                    let fsm = interrupt_fsm.clone();
                    tokio::spawn(async move {
                        fsm.request_interrupt(reason).await;
                    });
                }),
            )
            .await?,
        );

        // Extrasystole on every state change so peers converge quickly.
        let mut state_updates = fsm.subscribe();
        let beat = Arc::clone(&heartbeat);
        tokio::spawn(async move {
            loop {
                match state_updates.recv().await {
                    // A lagged observer still wants to advertise the latest
                    // state immediately.
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => beat.extrasystole(),
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let shutdown = CancellationToken::new();
        let dispatch = DispatchContext {
            canonical: canonical.clone(),
            fsm: fsm.clone(),
            registry,
            context: Arc::clone(&context),
            supports_reconfigure,
            shutdown: shutdown.clone(),
        };
        let loop_shutdown = shutdown.clone();
        let chirp_fatal = chirp.subscribe_fatal();
        let cscp_task = tokio::spawn(async move {
            let outcome = cscp_loop(&mut rep, &dispatch, &loop_shutdown, chirp_fatal).await;
            rep.close();
            outcome
        });

        Ok(Arc::new(Self {
            canonical,
            fsm,
            context,
            chirp,
            heartbeat,
            monitoring,
            shutdown,
            cscp_task: Mutex::new(Some(cscp_task)),
            port,
        }))
    }

    /// Canonical `type.name` of this satellite.
    #[must_use]
    pub fn canonical_name(&self) -> &str {
        &self.canonical
    }

    /// The CSCP command port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// The current FSM state.
    #[must_use]
    pub fn state(&self) -> State {
        self.fsm.state()
    }

    /// The current status line.
    #[must_use]
    pub fn status(&self) -> String {
        self.context.status()
    }

    /// The current run identifier.
    #[must_use]
    pub fn run_identifier(&self) -> String {
        self.context.run_identifier()
    }

    /// The state machine, e.g. for registering observers.
    #[must_use]
    pub fn fsm(&self) -> &Fsm {
        &self.fsm
    }

    /// The monitoring publisher, e.g. for installing the tracing layer.
    #[must_use]
    pub fn monitoring(&self) -> &Arc<CmdpPublisher> {
        &self.monitoring
    }

    /// Request shutdown; [`SatelliteHandle::join`] performs the teardown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for shutdown and tear the satellite down in order: command loop,
    /// FSM interrupt, heartbeats, discovery.
    ///
    /// # Errors
    /// Returns [`NetworkError`] when the command loop or the discovery loop
    /// died on a socket failure instead of a requested shutdown. Teardown
    /// runs either way.
    pub async fn join(&self) -> Result<(), NetworkError> {
        let task = self.cscp_task.lock().take();
        let mut outcome = Ok(());
        if let Some(task) = task {
            outcome = match task.await {
                Ok(result) => result,
                Err(err) => {
                    warn!(%err, "command loop aborted");
                    Err(NetworkError::Closed)
                }
            };
        }

        self.fsm.request_interrupt("satellite shutdown").await;
        self.heartbeat.shutdown().await;
        self.monitoring.stop();
        self.chirp.shutdown().await;
        info!(satellite = %self.canonical, "satellite stopped");
        outcome
    }
}

/// Resolves once the discovery receive loop has died on a socket error.
async fn discovery_failure(
    fatal: &mut watch::Receiver<Option<Arc<NetworkError>>>,
) -> Arc<NetworkError> {
    loop {
        if let Some(err) = fatal.borrow_and_update().clone() {
            return err;
        }
        if fatal.changed().await.is_err() {
            // The manager shut down without a failure; clean exits are
            // signalled through the shutdown token instead.
            std::future::pending::<()>().await;
        }
    }
}

async fn cscp_loop(
    rep: &mut RepSocket,
    dispatch: &DispatchContext,
    shutdown: &CancellationToken,
    mut chirp_fatal: watch::Receiver<Option<Arc<NetworkError>>>,
) -> Result<(), NetworkError> {
    loop {
        let received = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            err = discovery_failure(&mut chirp_fatal) => {
                error!(%err, "discovery loop died, stopping command receiver");
                return Err(NetworkError::Discovery(err));
            }
            received = rep.recv() => received,
        };
        let Some((frames, reply)) = received else {
            // The request queue only closes when the listener is gone.
            error!("command socket closed, no further commands can be received");
            return Err(NetworkError::Closed);
        };

        let response = match CscpMessage::disassemble(&frames) {
            Err(err) => {
                warn!(%err, "failed to decode CSCP message");
                CscpMessage::new(&dispatch.canonical, CscpMessageType::Error, err.to_string())
            }
            Ok(request) if request.verb_type() != CscpMessageType::Request => {
                warn!(verb_type = %request.verb_type(), "received non-REQUEST CSCP message");
                CscpMessage::new(
                    &dispatch.canonical,
                    CscpMessageType::Error,
                    "Can only handle CSCP messages with REQUEST type",
                )
            }
            Ok(request) => {
                debug!(
                    verb = request.verb(),
                    sender = request.header().sender(),
                    "received command"
                );
                handle_request(dispatch, &request)
            }
        };

        match response.assemble() {
            Ok(frames) => reply.send(frames),
            Err(err) => warn!(%err, "failed to assemble reply"),
        }
    }
}

fn handle_request(dispatch: &DispatchContext, request: &CscpMessage) -> CscpMessage {
    let verb = request.verb().to_lowercase();

    // Transition commands first, then built-ins, then the user registry.
    if let Some(command) = TransitionCommand::from_verb(&verb) {
        let (verb_type, message) = dispatch.fsm.react_command(command, request.payload());
        return CscpMessage::new(&dispatch.canonical, verb_type, message);
    }

    if let Some(reply) = handle_standard_command(dispatch, &verb) {
        return reply;
    }

    handle_user_command(dispatch, &verb, request)
}

fn handle_standard_command(dispatch: &DispatchContext, verb: &str) -> Option<CscpMessage> {
    let reply = match verb {
        "get_name" => CscpMessage::new(
            &dispatch.canonical,
            CscpMessageType::Success,
            dispatch.canonical.clone(),
        ),
        "get_version" => CscpMessage::new(
            &dispatch.canonical,
            CscpMessageType::Success,
            env!("CARGO_PKG_VERSION"),
        ),
        "get_commands" => {
            let dict = command_dictionary(dispatch);
            match codec::encode_dictionary(&dict) {
                Ok(payload) => CscpMessage::new(
                    &dispatch.canonical,
                    CscpMessageType::Success,
                    "Commands attached in payload",
                )
                .with_payload(payload),
                Err(err) => {
                    CscpMessage::new(&dispatch.canonical, CscpMessageType::Error, err.to_string())
                }
            }
        }
        "get_state" => CscpMessage::new(
            &dispatch.canonical,
            CscpMessageType::Success,
            dispatch.fsm.state().name(),
        ),
        "get_status" => CscpMessage::new(
            &dispatch.canonical,
            CscpMessageType::Success,
            dispatch.context.status(),
        ),
        "get_config" => {
            let dict = dispatch.context.config_dictionary();
            match codec::encode_dictionary(&dict) {
                Ok(payload) => CscpMessage::new(
                    &dispatch.canonical,
                    CscpMessageType::Success,
                    "Configuration attached in payload",
                )
                .with_payload(payload),
                Err(err) => {
                    CscpMessage::new(&dispatch.canonical, CscpMessageType::Error, err.to_string())
                }
            }
        }
        "get_run_id" => CscpMessage::new(
            &dispatch.canonical,
            CscpMessageType::Success,
            dispatch.context.run_identifier(),
        ),
        "shutdown" => {
            let state = dispatch.fsm.state();
            if state.shutdown_allowed() {
                dispatch.shutdown.cancel();
                CscpMessage::new(
                    &dispatch.canonical,
                    CscpMessageType::Success,
                    "Shutting down satellite",
                )
            } else {
                CscpMessage::new(
                    &dispatch.canonical,
                    CscpMessageType::Invalid,
                    format!("Satellite cannot be shut down from current state {state}"),
                )
            }
        }
        _ => return None,
    };
    Some(reply)
}

fn command_dictionary(dispatch: &DispatchContext) -> Dictionary {
    let mut dict = Dictionary::new();
    dict.insert(
        "initialize",
        "Initialize satellite (payload: config as flat MessagePack dict with strings as keys)",
    );
    dict.insert("launch", "Launch satellite");
    dict.insert("land", "Land satellite");
    if dispatch.supports_reconfigure {
        dict.insert(
            "reconfigure",
            "Reconfigure satellite (payload: partial config as flat MessagePack dict with strings as keys)",
        );
    }
    dict.insert("start", "Start new run (payload: run identifier as MessagePack string)");
    dict.insert("stop", "Stop run");
    dict.insert("shutdown", "Shutdown satellite");
    dict.insert("get_name", "Get canonical name of satellite");
    dict.insert("get_version", "Get Constellation version of satellite");
    dict.insert(
        "get_commands",
        "Get commands supported by satellite (returned in payload as flat MessagePack dict with strings as keys)",
    );
    dict.insert("get_state", "Get state of satellite");
    dict.insert("get_status", "Get status of satellite");
    dict.insert(
        "get_config",
        "Get config of satellite (returned in payload as flat MessagePack dict with strings as keys)",
    );
    dict.insert("get_run_id", "Get current or last run identifier");

    for (name, description) in dispatch.registry.describe_commands() {
        dict.insert(name, description);
    }
    dict
}

fn handle_user_command(
    dispatch: &DispatchContext,
    verb: &str,
    request: &CscpMessage,
) -> CscpMessage {
    let args = match request.payload() {
        None => List::new(),
        Some(payload) => match codec::decode_list(payload) {
            Ok(args) => args,
            Err(err) => {
                debug!(%err, "user command payload is not a value list");
                return CscpMessage::new(
                    &dispatch.canonical,
                    CscpMessageType::Incomplete,
                    "Could not convert command payload to argument list",
                );
            }
        },
    };

    match dispatch.registry.call(dispatch.fsm.state(), verb, &args) {
        Ok(Value::Nil) => CscpMessage::new(&dispatch.canonical, CscpMessageType::Success, ""),
        Ok(value) => match codec::value_to_bytes(&value) {
            Ok(payload) => {
                CscpMessage::new(&dispatch.canonical, CscpMessageType::Success, "")
                    .with_payload(payload)
            }
            Err(err) => CscpMessage::new(&dispatch.canonical, CscpMessageType::Error, err.to_string()),
        },
        Err(CommandError::Unknown(_)) => CscpMessage::new(
            &dispatch.canonical,
            CscpMessageType::Unknown,
            format!("Command {verb:?} is not known"),
        ),
        Err(err @ CommandError::Invalid { .. }) => {
            CscpMessage::new(&dispatch.canonical, CscpMessageType::Invalid, err.to_string())
        }
        Err(CommandError::User(err)) => {
            CscpMessage::new(&dispatch.canonical, CscpMessageType::Incomplete, err.to_string())
        }
    }
}
