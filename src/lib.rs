//! # EtherNet/IP (ENIP) / CIP Adapter
//!
//! An EtherNet/IP encapsulation layer and Common Industrial Protocol
//! object model implementing the adapter (target) role: explicit
//! messaging over TCP, cyclic I/O and broadcast discovery over UDP, and
//! the Identity/TCP-IP Interface/Ethernet Link/Connection Manager object
//! set a conforming adapter exposes.

pub mod bytebuf;
pub mod cip;
pub mod config;
pub mod context;
pub mod cpf;
pub mod encapsulation;
pub mod epath;
pub mod error;
pub mod hooks;
pub mod logging;
pub mod network;
pub mod sockaddr;

pub use config::{AdapterConfig, Args};
pub use context::AdapterContext;
pub use error::{CipError, Result};
pub use hooks::{AdapterHooks, ConnectionEvent, NullHooks};

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
