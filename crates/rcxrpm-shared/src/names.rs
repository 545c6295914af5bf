//! Deterministic names for the per-session kernel objects.
//!
//! Every resource of a session is derivable from (PID, token) alone; no
//! discovery step exists. The bootstrap region is keyed by PID only because
//! it exists precisely to carry the token.

#[cfg(windows)]
const PREFIX: &str = "Local\\RCX_";
#[cfg(unix)]
const PREFIX: &str = "/rcx_";

#[cfg(windows)]
fn format_name(kind: &str, pid: u32, token: Option<&str>) -> String {
    match token {
        Some(t) => format!("{PREFIX}{kind}_{pid}_{t}"),
        None => format!("{PREFIX}{kind}_{pid}"),
    }
}

#[cfg(unix)]
fn format_name(kind: &str, pid: u32, token: Option<&str>) -> String {
    let kind = kind.to_ascii_lowercase();
    match token {
        Some(t) => format!("{PREFIX}{kind}_{pid}_{t}"),
        None => format!("{PREFIX}{kind}_{pid}"),
    }
}

/// Name of the main shared region.
pub fn shm_name(pid: u32, token: Option<&str>) -> String {
    format_name("SHM", pid, token)
}

/// Name of the request signal.
pub fn req_name(pid: u32, token: Option<&str>) -> String {
    format_name("REQ", pid, token)
}

/// Name of the response signal.
pub fn rsp_name(pid: u32, token: Option<&str>) -> String {
    format_name("RSP", pid, token)
}

/// Name of the bootstrap region (token-less by construction).
pub fn boot_name(pid: u32) -> String {
    format_name("BOOT", pid, None)
}

/// Tokens are 16 random hex chars; anything alphanumeric up to the bootstrap
/// capacity is accepted on the wire. Rejects separators so a token can never
/// escape the name scheme.
pub fn valid_token(token: &str) -> bool {
    !token.is_empty()
        && token.len() < crate::protocol::BOOT_SIZE - 4
        && token.bytes().all(|b| b.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_deterministic() {
        let a = shm_name(4242, Some("0123456789abcdef"));
        let b = shm_name(4242, Some("0123456789abcdef"));
        assert_eq!(a, b);
        assert_ne!(a, shm_name(4243, Some("0123456789abcdef")));
        assert_ne!(a, shm_name(4242, Some("fedcba9876543210")));
    }

    #[cfg(unix)]
    #[test]
    fn posix_name_shapes() {
        assert_eq!(
            shm_name(1000, Some("00ff00ff00ff00ff")),
            "/rcx_shm_1000_00ff00ff00ff00ff"
        );
        assert_eq!(req_name(1000, None), "/rcx_req_1000");
        assert_eq!(rsp_name(1000, None), "/rcx_rsp_1000");
        assert_eq!(boot_name(1000), "/rcx_boot_1000");
    }

    #[cfg(windows)]
    #[test]
    fn windows_name_shapes() {
        assert_eq!(
            shm_name(1000, Some("00ff00ff00ff00ff")),
            "Local\\RCX_SHM_1000_00ff00ff00ff00ff"
        );
        assert_eq!(boot_name(1000), "Local\\RCX_BOOT_1000");
    }

    #[test]
    fn token_validation() {
        assert!(valid_token("0123456789abcdef"));
        assert!(valid_token("A1"));
        assert!(!valid_token(""));
        assert!(!valid_token("has-separator"));
        assert!(!valid_token("has/slash"));
        assert!(!valid_token(&"f".repeat(64)));
    }
}
