//! Payload injection.
//!
//! One entry point per platform behind the [`Injector`] trait; all of the
//! register manipulation and shellcode emission stays inside the platform
//! submodule. The injector only places the agent — readiness polling is the
//! client's job.

use std::path::{Path, PathBuf};

use rcxrpm_shared::boot::BootstrapGuard;
use rcxrpm_shared::{boot, Error, Result};
use tracing::info;

#[cfg(unix)]
mod linux;
#[cfg(windows)]
mod windows;

/// Places the agent module into a target process.
pub trait Injector {
    /// Cause `pid` to load the module at `payload`. The session token has
    /// already been published through the bootstrap region.
    fn inject(&self, pid: u32, payload: &Path) -> Result<()>;
}

#[cfg(unix)]
pub use linux::PtraceInjector as PlatformInjector;
#[cfg(windows)]
pub use windows::RemoteThreadInjector as PlatformInjector;

/// File name of the payload artifact on this platform.
#[cfg(unix)]
const PAYLOAD_FILE: &str = "librcxrpm_payload.so";
#[cfg(windows)]
const PAYLOAD_FILE: &str = "rcxrpm_payload.dll";

/// Generate a fresh 16-hex-char session token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        // No OS entropy source; tokens only scope channel names, so a
        // time-and-pid mix is an acceptable last resort.
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        bytes = (u64::from(std::process::id()) << 32 | u64::from(nanos)).to_le_bytes();
    }
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Locate the payload artifact next to the current executable.
pub fn payload_artifact() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| Error::ProtocolError("executable has no parent directory".into()))?;
    let path = dir.join(PAYLOAD_FILE);
    if !path.exists() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("payload not found at {}", path.display()),
        )));
    }
    Ok(path)
}

/// Publish the token and inject the payload into `pid`.
///
/// The returned guard keeps the bootstrap region alive; hold it until the
/// session is connected so the agent cannot miss the token.
pub fn inject_payload(pid: u32, token: &str) -> Result<BootstrapGuard> {
    let payload = payload_artifact()?;
    let guard = boot::publish_token(pid, token)?;
    info!(pid, payload = %payload.display(), "injecting payload");
    PlatformInjector.inject(pid, &payload)?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_sixteen_hex_chars() {
        let token = generate_token();
        assert_eq!(token.len(), 16);
        assert!(token.bytes().all(|b| b.is_ascii_hexdigit()));
        assert!(rcxrpm_shared::names::valid_token(&token));
        assert_ne!(token, generate_token());
    }
}
