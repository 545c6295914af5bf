//! Shared wire protocol and channel primitives for rcxrpm.
//!
//! Inspector and agent communicate over one shared-memory region per session
//! plus two named signals, all derivable from (PID, token):
//! - [`protocol`] - header layout, commands, record formats
//! - [`names`] - deterministic resource naming
//! - [`channel`] - region + signal lifecycle on both platforms
//! - [`boot`] - bootstrap region carrying the token at injection time
//!
//! # Architecture
//!
//! The agent creates the channel and serves commands against its own address
//! space; the inspector opens the channel by name and drives synchronous
//! round trips, one in flight per session.

pub mod boot;
pub mod channel;
pub mod error;
pub mod module_info;
pub mod names;
pub mod protocol;

pub use channel::Channel;
pub use error::{Error, InjectStep, Result};
pub use module_info::ModuleInfo;
pub use protocol::{
    Command, HeaderView, ModuleEntry, ReadEntry, Status, BOOT_SIZE, DATA_SIZE, HEADER_SIZE,
    MAX_BATCH, PROTOCOL_VERSION, SHM_SIZE,
};
