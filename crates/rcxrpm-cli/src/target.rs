//! Target strings and process listing.

use rcxrpm_shared::{names, Error, Result};

/// A parsed `rpm:<pid>:<token>:<name>` target. The name takes the remainder
/// of the string and may itself contain colons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub pid: u32,
    pub token: String,
    pub name: String,
}

impl TargetSpec {
    pub fn parse(target: &str) -> Result<Self> {
        let mut parts = target.splitn(4, ':');
        let scheme = parts.next().unwrap_or_default();
        if scheme != "rpm" {
            return Err(Error::ProtocolError(format!(
                "target {target:?} does not start with rpm:"
            )));
        }
        let pid = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .filter(|&p| p != 0)
            .ok_or_else(|| Error::ProtocolError(format!("invalid PID in target {target:?}")))?;
        let token = parts
            .next()
            .filter(|t| names::valid_token(t))
            .ok_or_else(|| Error::ProtocolError(format!("invalid token in target {target:?}")))?
            .to_string();
        let name = parts.next().unwrap_or_default().to_string();
        Ok(Self { pid, token, name })
    }
}

impl std::fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpm:{}:{}:{}", self.pid, self.token, self.name)
    }
}

/// One row of the process picker.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub path: Option<String>,
}

#[cfg(unix)]
mod imp {
    use super::ProcessInfo;
    use std::ffi::CString;

    /// Walk `/proc`, keeping processes whose memory we could actually
    /// attach to (readable `/proc/<pid>/mem`).
    pub fn enumerate_processes() -> Vec<ProcessInfo> {
        let mut procs = Vec::new();
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return procs;
        };
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<u32>().ok())
                .filter(|&p| p != 0)
            else {
                continue;
            };
            let Ok(comm) = std::fs::read_to_string(format!("/proc/{pid}/comm")) else {
                continue;
            };
            let name = comm.trim().to_string();
            if name.is_empty() {
                continue;
            }
            let mem_path = CString::new(format!("/proc/{pid}/mem")).unwrap();
            if unsafe { libc::access(mem_path.as_ptr(), libc::R_OK) } != 0 {
                continue;
            }
            let path = std::fs::read_link(format!("/proc/{pid}/exe"))
                .ok()
                .map(|p| p.to_string_lossy().into_owned());
            procs.push(ProcessInfo { pid, name, path });
        }
        procs.sort_by_key(|p| p.pid);
        procs
    }

    /// Display name for one PID.
    pub fn process_name(pid: u32) -> String {
        std::fs::read_to_string(format!("/proc/{pid}/comm"))
            .map(|c| c.trim().to_string())
            .unwrap_or_else(|_| format!("pid{pid}"))
    }
}

#[cfg(windows)]
mod imp {
    use super::ProcessInfo;

    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::ProcessStatus::{EnumProcesses, GetModuleBaseNameW};
    use windows::Win32::System::Threading::{
        OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
    };

    pub fn enumerate_processes() -> Vec<ProcessInfo> {
        let mut procs = Vec::new();
        let mut pids = [0u32; 4096];
        let mut bytes_returned = 0u32;
        if unsafe {
            EnumProcesses(
                pids.as_mut_ptr(),
                std::mem::size_of_val(&pids) as u32,
                &mut bytes_returned,
            )
        }
        .is_err()
        {
            return procs;
        }

        let count = bytes_returned as usize / std::mem::size_of::<u32>();
        for &pid in &pids[..count] {
            if pid == 0 {
                continue;
            }
            let Ok(process) =
                (unsafe { OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, false, pid) })
            else {
                continue;
            };
            let mut name_buf = [0u16; 260];
            let len = unsafe { GetModuleBaseNameW(process, None, &mut name_buf) } as usize;
            let _ = unsafe { CloseHandle(process) };
            if len == 0 {
                continue;
            }
            procs.push(ProcessInfo {
                pid,
                name: String::from_utf16_lossy(&name_buf[..len]),
                path: None,
            });
        }
        procs.sort_by_key(|p| p.pid);
        procs
    }

    pub fn process_name(pid: u32) -> String {
        enumerate_processes()
            .into_iter()
            .find(|p| p.pid == pid)
            .map(|p| p.name)
            .unwrap_or_else(|| format!("pid{pid}"))
    }
}

pub use imp::{enumerate_processes, process_name};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_target() {
        let spec = TargetSpec::parse("rpm:1234:0123456789abcdef:myapp").unwrap();
        assert_eq!(spec.pid, 1234);
        assert_eq!(spec.token, "0123456789abcdef");
        assert_eq!(spec.name, "myapp");
        assert_eq!(spec.to_string(), "rpm:1234:0123456789abcdef:myapp");
    }

    #[test]
    fn name_keeps_colons() {
        let spec = TargetSpec::parse("rpm:1:aa:C:\\Games\\app.exe").unwrap();
        assert_eq!(spec.name, "C:\\Games\\app.exe");
    }

    #[test]
    fn rejects_malformed_targets() {
        assert!(TargetSpec::parse("file:whatever").is_err());
        assert!(TargetSpec::parse("rpm:notapid:aa:x").is_err());
        assert!(TargetSpec::parse("rpm:0:aa:x").is_err());
        assert!(TargetSpec::parse("rpm:12:bad token:x").is_err());
        assert!(TargetSpec::parse("rpm:12").is_err());
    }

    #[test]
    fn empty_name_is_allowed() {
        let spec = TargetSpec::parse("rpm:12:abcd:").unwrap();
        assert_eq!(spec.name, "");
        let spec = TargetSpec::parse("rpm:12:abcd").unwrap();
        assert_eq!(spec.name, "");
    }

    #[cfg(unix)]
    #[test]
    fn listing_contains_ourselves() {
        let procs = enumerate_processes();
        assert!(procs.iter().any(|p| p.pid == std::process::id()));
    }
}
