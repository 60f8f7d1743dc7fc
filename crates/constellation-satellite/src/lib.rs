//! The Constellation satellite runtime.
//!
//! A satellite is an independent process participating in a named group: it
//! announces itself via CHIRP, accepts CSCP commands on a reply socket,
//! walks the shared lifecycle state machine, publishes heartbeats and mirrors
//! its logs onto the monitoring channel.
//!
//! Implement [`Satellite`] for your instrument and hand it to
//! [`SatelliteHandle::spawn`]:
//!
//! ```rust,ignore
//! let options = SatelliteOptions::new("Sputnik", "one", "edda")?;
//! let handle = SatelliteHandle::spawn(options, MySatellite::default(), CommandRegistry::new()).await?;
//! handle.join().await;
//! ```

#![forbid(unsafe_code)]

pub mod commands;
pub mod fsm;
pub mod satellite;

pub use commands::{CommandError, CommandRegistry, RegistrationError, UserCommandError};
pub use fsm::Fsm;
pub use satellite::{Satellite, SatelliteError, SatelliteHandle, SatelliteOptions};
