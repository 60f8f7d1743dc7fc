//! Networking runtime for Constellation satellites and listeners.
//!
//! - [`chirp`] - the CHIRP discovery manager: UDP broadcast send/receive,
//!   registered and discovered service sets, discovery callbacks
//! - [`sockets`] - REP/REQ/PUB/SUB message sockets over multipart TCP framing
//! - [`pool`] - a dynamic pool of subscriber sockets driven by discovery
//! - [`heartbeat`] - the CHP liveness publisher and deadline-tracking receiver
//! - [`cmdp`] - the CMDP monitoring publisher, listener and tracing bridge

#![forbid(unsafe_code)]

pub mod chirp;
pub mod cmdp;
pub mod error;
pub mod heartbeat;
pub mod pool;
pub mod sockets;

pub use chirp::{ChirpConfig, ChirpManager, DiscoveredService, RegisteredService, ServiceStatus};
pub use cmdp::{CmdpListener, CmdpPublisher};
pub use error::NetworkError;
pub use heartbeat::HeartbeatManager;
pub use pool::SubscriberPool;
pub use sockets::{PubSocket, RepSocket, ReplyHandle, ReqSocket, SubSocket};
