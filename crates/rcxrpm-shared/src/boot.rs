//! Bootstrap region: carries the session token from inspector to agent.
//!
//! Published by the injector before the loader call, consumed (and unlinked)
//! by the agent during init. 64 bytes: `token_length: u32` followed by the
//! token bytes.

use crate::channel::ShmRegion;
use crate::error::{Error, Result};
use crate::names;
use crate::protocol::BOOT_SIZE;

/// Keeps the published bootstrap region alive until the agent has had a
/// chance to consume it. Dropping the guard releases the inspector's mapping
/// but leaves the name for the agent to unlink.
pub struct BootstrapGuard {
    _region: ShmRegion,
}

/// Publish `token` under the bootstrap name for `pid`.
pub fn publish_token(pid: u32, token: &str) -> Result<BootstrapGuard> {
    if !names::valid_token(token) {
        return Err(Error::ProtocolError(format!("invalid token {token:?}")));
    }
    let mut region = ShmRegion::create(&names::boot_name(pid), BOOT_SIZE)?;
    let bytes = token.as_bytes();
    unsafe {
        std::ptr::write_bytes(region.as_ptr(), 0, BOOT_SIZE);
        std::ptr::copy_nonoverlapping(
            (bytes.len() as u32).to_le_bytes().as_ptr(),
            region.as_ptr(),
            4,
        );
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), region.as_ptr().add(4), bytes.len());
    }
    region.persist_name();
    Ok(BootstrapGuard { _region: region })
}

/// Agent side: read the token for the current process, then remove the name
/// so a stale bootstrap can never leak into a later session. `None` when no
/// bootstrap exists (token-less fallback naming applies).
pub fn consume_token(pid: u32) -> Option<String> {
    let mut region = ShmRegion::open(&names::boot_name(pid), BOOT_SIZE).ok()?;
    let mut len_bytes = [0u8; 4];
    unsafe {
        std::ptr::copy_nonoverlapping(region.as_ptr(), len_bytes.as_mut_ptr(), 4);
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    let token = if len == 0 || len > BOOT_SIZE - 4 {
        None
    } else {
        let mut buf = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(region.as_ptr().add(4), buf.as_mut_ptr(), len);
        }
        String::from_utf8(buf).ok().filter(|t| names::valid_token(t))
    };
    region.unlink_now();
    token
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn publish_then_consume() {
        let pid = std::process::id();
        let guard = publish_token(pid, "0123456789abcdef").expect("publish");
        assert_eq!(consume_token(pid).as_deref(), Some("0123456789abcdef"));
        // Consumed and unlinked: a second consume finds nothing.
        assert!(consume_token(pid).is_none());
        drop(guard);
    }

    #[test]
    fn rejects_malformed_tokens() {
        let pid = std::process::id();
        assert!(publish_token(pid, "").is_err());
        assert!(publish_token(pid, "../escape").is_err());
    }
}
