//! Core types shared by every Constellation subsystem.
//!
//! This crate holds the pieces that both the protocol codecs and the satellite
//! runtime build on:
//!
//! - [`identity`] - MD5-derived group and host identities, canonical naming
//! - [`state`] - the satellite lifecycle state machine vocabulary
//! - [`value`] - the self-describing value model carried over the wire
//! - [`dictionary`] - insertion-ordered string-keyed maps and value lists
//! - [`config`] - satellite configuration with used-key tracking

#![forbid(unsafe_code)]

pub mod config;
pub mod dictionary;
pub mod identity;
pub mod state;
pub mod value;

pub use config::{Configuration, Group, Usage};
pub use dictionary::{Dictionary, List};
pub use identity::{is_valid_name, Md5Hash, SatelliteName};
pub use state::{State, Transition, TransitionCommand};
pub use value::{FromValue, IntoValue, Value, ValueError};
