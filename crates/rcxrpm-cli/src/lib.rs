//! Inspector-side library for remote process memory.
//!
//! The host tool drives three layers:
//! - [`inject`] places the agent into a target and hands it the session token
//! - [`client`] owns the RPC round trips over the shared channel
//! - [`provider`] wraps a session in the editor's uniform memory-provider
//!   surface, with sessions shared per PID through [`cache`]

pub mod cache;
pub mod client;
pub mod inject;
pub mod provider;
pub mod target;

pub use cache::SessionCache;
pub use client::{BatchRead, RpcSession};
pub use inject::{generate_token, inject_payload, Injector, PlatformInjector};
pub use provider::{MemoryProvider, RemoteProcessProvider};
pub use target::{enumerate_processes, process_name, ProcessInfo, TargetSpec};
