#![deny(unsafe_code)]
#![warn(missing_docs)]

//! A multi-threaded IPMI v2.0 Serial-over-LAN console engine.
//!
//! The crate implements:
//! - A sharded worker pool that multiplexes many console sessions over
//!   `poll(2)`, one shard per worker thread
//! - RMCP+ Open Session and RAKP 1-4 key exchange
//! - Integrity (HMAC-SHA1-96) and confidentiality (AES-CBC-128)
//! - SOL payload activation, character transfer and serial breaks
//!
//! Applications build an [`Engine`], set it up, start workers and submit
//! sessions. Each session hands back a [`SessionHandle`] whose stream carries
//! the console bytes in both directions.
//!
//! ```no_run
//! use std::time::Duration;
//! use ipmi_console::{Engine, EngineConfig, SessionConfig};
//!
//! # fn main() -> ipmi_console::Result<()> {
//! let engine = Engine::new(EngineConfig::default());
//! engine.setup(1)?;
//! engine.thread_create()?;
//!
//! let config = SessionConfig::builder("192.0.2.10:623".parse().unwrap())
//!     .username("admin")
//!     .password("password")
//!     .build()?;
//! let handle = engine.open(config)?;
//! handle.wait_established(Duration::from_secs(30))?;
//! # Ok(())
//! # }
//! ```

mod advance;
mod buffer;
pub mod commands;
mod config;
mod context;
mod crypto;
mod debug;
mod engine;
mod error;
mod observe;
mod poll;
mod processing;
mod protocol;
mod sequence;
mod shard;
mod sol;
mod types;
mod worker;

pub use crate::advance::{Advance, ProtocolAdvancer};
pub use crate::buffer::{ByteBuffer, DatagramQueue};
pub use crate::config::{
    DEFAULT_MAX_THREADS, EngineConfig, EngineConfigBuilder, SessionConfig, SessionConfigBuilder,
};
pub use crate::context::{PACKET_BUFLEN, SessionContext, SessionHandle};
pub use crate::engine::Engine;
pub use crate::error::{Error, ErrorCode, Result};
pub use crate::processing::SolAdvancer;
pub use crate::protocol::RMCP_PRIMARY_PORT;
pub use crate::types::{
    ActivatedPayload, CipherSuite, PayloadActivationStatus, PrivilegeLevel, RawResponse,
    SessionStatus,
};
