//! Provider facade: presents a remote process through the same surface the
//! structure editor uses for file- and buffer-backed memory.

use std::sync::Arc;

use rcxrpm_shared::{ModuleInfo, Result, Status};
use tracing::warn;

use crate::cache::SessionCache;
use crate::client::RpcSession;
use crate::target::TargetSpec;

/// Uniform memory-provider surface toward the host tool. Error kinds are
/// flattened to the booleans/defaults the editor's contract expects; the
/// underlying kind is logged before it is dropped.
pub trait MemoryProvider {
    /// Read into `buf`; on any failure the buffer is zero-filled (partial
    /// reads keep their readable ranges) and `false` comes back.
    fn read(&self, addr: u64, buf: &mut [u8]) -> bool;

    /// Write `buf`; `true` iff every byte landed.
    fn write(&self, addr: u64, buf: &[u8]) -> bool;

    fn is_readable(&self) -> bool;
    fn is_writable(&self) -> bool;

    /// Providers over live targets report `true`.
    fn is_live(&self) -> bool;

    /// Display name of the backing target.
    fn name(&self) -> &str;

    /// Stable provider kind tag.
    fn kind(&self) -> &'static str;

    /// Default base address for new views.
    fn base(&self) -> u64;

    /// `<module>+0x<hex>` for addresses inside a known module.
    fn get_symbol(&self, addr: u64) -> Option<String>;

    /// Base of the module with this (case-insensitive) name, or 0.
    fn symbol_to_address(&self, name: &str) -> u64;
}

/// Memory provider backed by an RPC session into a remote process.
pub struct RemoteProcessProvider {
    pid: u32,
    process_name: String,
    modules: Vec<ModuleInfo>,
    base: u64,
    session: Arc<RpcSession>,
    cache: Arc<SessionCache>,
}

impl RemoteProcessProvider {
    /// Connect (or join the cached session) for `target` and snapshot its
    /// module list.
    pub fn open(cache: Arc<SessionCache>, target: &TargetSpec) -> Result<Self> {
        let session = cache.get_or_connect(target.pid, &target.token)?;
        let modules = match session.enumerate_modules() {
            Ok(modules) => modules,
            Err(err) => {
                warn!(pid = target.pid, %err, "module enumeration failed at connect");
                Vec::new()
            }
        };
        let base = modules
            .first()
            .map(|m| m.base)
            .unwrap_or_else(|| session.image_base());
        Ok(Self {
            pid: target.pid,
            process_name: target.name.clone(),
            modules,
            base,
            session,
            cache,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The module list cached at connect time.
    pub fn modules(&self) -> &[ModuleInfo] {
        &self.modules
    }

    /// Re-fetch the module list (targets load and unload modules).
    pub fn refresh_modules(&mut self) -> Result<()> {
        self.modules = self.session.enumerate_modules()?;
        if let Some(first) = self.modules.first() {
            self.base = first.base;
        }
        Ok(())
    }

    /// Main-module base straight from the channel header; zero IPC cost.
    pub fn image_base(&self) -> u64 {
        self.session.image_base()
    }

    pub fn ping(&self) -> bool {
        self.session.ping().is_ok()
    }

    /// Tear down the remote agent and the session.
    pub fn shutdown(&self) {
        let _ = self.session.shutdown();
        self.cache.invalidate(self.pid);
    }
}

impl MemoryProvider for RemoteProcessProvider {
    fn read(&self, addr: u64, buf: &mut [u8]) -> bool {
        if buf.is_empty() {
            return false;
        }
        match self.session.read(addr, buf) {
            Ok(Status::Ok) => true,
            Ok(_) => false, // partial: unreadable holes are already zero
            Err(err) => {
                warn!(pid = self.pid, addr, %err, "remote read failed");
                buf.fill(0);
                false
            }
        }
    }

    fn write(&self, addr: u64, buf: &[u8]) -> bool {
        if buf.is_empty() {
            return false;
        }
        match self.session.write(addr, buf) {
            Ok(()) => true,
            Err(err) => {
                warn!(pid = self.pid, addr, %err, "remote write failed");
                false
            }
        }
    }

    fn is_readable(&self) -> bool {
        self.session.is_connected()
    }

    fn is_writable(&self) -> bool {
        self.session.is_connected()
    }

    fn is_live(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        &self.process_name
    }

    fn kind(&self) -> &'static str {
        "RemoteProcess"
    }

    fn base(&self) -> u64 {
        self.base
    }

    fn get_symbol(&self, addr: u64) -> Option<String> {
        self.modules
            .iter()
            .find(|m| m.contains(addr))
            .map(|m| format!("{}+0x{:x}", m.name, addr - m.base))
    }

    fn symbol_to_address(&self, name: &str) -> u64 {
        self.modules
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(name))
            .map_or(0, |m| m.base)
    }
}

impl Drop for RemoteProcessProvider {
    fn drop(&mut self) {
        self.cache.release(self.pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modules() -> Vec<ModuleInfo> {
        vec![
            ModuleInfo {
                name: "app".into(),
                base: 0x5555_0000_0000,
                size: 0x10000,
            },
            ModuleInfo {
                name: "libc.so.6".into(),
                base: 0x7f00_0000_0000,
                size: 0x20_0000,
            },
        ]
    }

    // Symbol logic is pure; exercise it without a live session.
    fn symbol_for(modules: &[ModuleInfo], addr: u64) -> Option<String> {
        modules
            .iter()
            .find(|m| m.contains(addr))
            .map(|m| format!("{}+0x{:x}", m.name, addr - m.base))
    }

    #[test]
    fn symbol_formatting() {
        let modules = modules();
        assert_eq!(
            symbol_for(&modules, 0x5555_0000_1f0).as_deref(),
            Some("app+0x1f0")
        );
        assert_eq!(
            symbol_for(&modules, 0x7f00_0010_0000).as_deref(),
            Some("libc.so.6+0x100000")
        );
        assert_eq!(symbol_for(&modules, 0x1234), None);
    }

    #[test]
    fn reverse_lookup_is_case_insensitive() {
        let modules = modules();
        let find = |name: &str| {
            modules
                .iter()
                .find(|m| m.name.eq_ignore_ascii_case(name))
                .map_or(0, |m| m.base)
        };
        assert_eq!(find("LIBC.SO.6"), 0x7f00_0000_0000);
        assert_eq!(find("app"), 0x5555_0000_0000);
        assert_eq!(find("unknown"), 0);
    }
}
