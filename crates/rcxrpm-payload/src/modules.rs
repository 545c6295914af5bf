//! Module enumeration for the agent's own process.

#[cfg(unix)]
mod imp {
    use std::io;
    use std::path::Path;

    /// One coalesced file-backed mapping group.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RawModule {
        pub path: String,
        pub base: u64,
        pub end: u64,
    }

    impl RawModule {
        pub fn name(&self) -> &str {
            self.path.rsplit('/').next().unwrap_or(&self.path)
        }

        pub fn size(&self) -> u64 {
            self.end - self.base
        }
    }

    /// Parse `/proc/self/maps` text into coalesced modules: contiguous
    /// file-backed mappings sharing a path merge into one record. Device
    /// nodes, memfds and anonymous mappings are not modules.
    pub fn parse_maps(maps: &str) -> Vec<RawModule> {
        let mut modules: Vec<RawModule> = Vec::new();
        for line in maps.lines() {
            let mut fields = line.split_whitespace();
            let Some(range) = fields.next() else { continue };
            let Some((start_s, end_s)) = range.split_once('-') else {
                continue;
            };
            let (Ok(start), Ok(end)) = (
                u64::from_str_radix(start_s, 16),
                u64::from_str_radix(end_s, 16),
            ) else {
                continue;
            };
            // perms, offset, dev, inode, then the path (which may be empty)
            let Some(path) = fields.nth(4) else { continue };
            if !path.starts_with('/')
                || path.starts_with("/dev/")
                || path.starts_with("/memfd:")
            {
                continue;
            }
            if let Some(module) = modules.iter_mut().find(|m| m.path == path) {
                module.base = module.base.min(start);
                module.end = module.end.max(end);
            } else {
                modules.push(RawModule {
                    path: path.to_string(),
                    base: start,
                    end,
                });
            }
        }
        modules
    }

    pub fn raw_modules() -> io::Result<Vec<RawModule>> {
        Ok(parse_maps(&std::fs::read_to_string("/proc/self/maps")?))
    }

    /// Loaded modules as (name bytes, base, size); names are UTF-8.
    pub fn modules() -> io::Result<Vec<(Vec<u8>, u64, u64)>> {
        Ok(raw_modules()?
            .into_iter()
            .map(|m| (m.name().as_bytes().to_vec(), m.base, m.size()))
            .collect())
    }

    /// Base of the main executable's module, by matching the real path of
    /// `/proc/self/exe` against the module list. Falls back to the lowest
    /// mapped module when the link cannot be resolved.
    pub fn image_base() -> u64 {
        let modules = match raw_modules() {
            Ok(modules) => modules,
            Err(_) => return 0,
        };
        if let Ok(exe) = std::fs::read_link("/proc/self/exe") {
            if let Some(m) = modules.iter().find(|m| Path::new(&m.path) == exe) {
                return m.base;
            }
        }
        modules.first().map_or(0, |m| m.base)
    }
}

#[cfg(windows)]
mod imp {
    use std::io;

    use windows::Win32::Foundation::HMODULE;
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows::Win32::System::ProcessStatus::{
        EnumProcessModules, GetModuleBaseNameW, GetModuleInformation, MODULEINFO,
    };
    use windows::Win32::System::Threading::GetCurrentProcess;

    /// Loaded modules as (name bytes, base, size); names are UTF-16LE.
    pub fn modules() -> io::Result<Vec<(Vec<u8>, u64, u64)>> {
        let process = unsafe { GetCurrentProcess() };
        let mut handles = [HMODULE::default(); 1024];
        let mut needed = 0u32;
        unsafe {
            EnumProcessModules(
                process,
                handles.as_mut_ptr(),
                std::mem::size_of_val(&handles) as u32,
                &mut needed,
            )
        }
        .map_err(io::Error::other)?;

        let count = (needed as usize / std::mem::size_of::<HMODULE>()).min(handles.len());
        let mut out = Vec::with_capacity(count);
        for &module in &handles[..count] {
            let mut info = MODULEINFO::default();
            if unsafe {
                GetModuleInformation(
                    process,
                    module,
                    &mut info,
                    std::mem::size_of::<MODULEINFO>() as u32,
                )
            }
            .is_err()
            {
                continue;
            }
            let mut name = [0u16; 260];
            let len = unsafe { GetModuleBaseNameW(process, Some(module), &mut name) } as usize;
            let bytes: Vec<u8> = name[..len].iter().flat_map(|u| u.to_le_bytes()).collect();
            out.push((bytes, info.lpBaseOfDll as u64, info.SizeOfImage as u64));
        }
        Ok(out)
    }

    /// Base of the main executable's module.
    pub fn image_base() -> u64 {
        unsafe { GetModuleHandleW(None) }.map_or(0, |m| m.0 as u64)
    }
}

pub use imp::{image_base, modules};

#[cfg(all(test, unix))]
mod tests {
    use super::imp::parse_maps;
    use super::*;

    const MAPS: &str = "\
5555deadb000-5555deadc000 r--p 00000000 fd:01 100 /usr/bin/app
5555deadc000-5555deade000 r-xp 00001000 fd:01 100 /usr/bin/app
5555deade000-5555deadf000 rw-p 00003000 fd:01 100 /usr/bin/app
7f1100000000-7f1100020000 r-xp 00000000 fd:01 200 /usr/lib/libc.so.6
7f1100020000-7f1100021000 rw-p 00020000 fd:01 200 /usr/lib/libc.so.6
7f1200000000-7f1200001000 rw-s 00000000 00:01 300 /dev/shm/rcx_shm_1
7f1300000000-7f1300001000 rw-p 00000000 00:00 0
7f1400000000-7f1400001000 rw-p 00000000 00:00 0 /memfd:doit (deleted)
7ffc00000000-7ffc00021000 rw-p 00000000 00:00 0 [stack]
";

    #[test]
    fn coalesces_by_path_and_skips_special() {
        let modules = parse_maps(MAPS);
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].path, "/usr/bin/app");
        assert_eq!(modules[0].base, 0x5555deadb000);
        assert_eq!(modules[0].end, 0x5555deadf000);
        assert_eq!(modules[0].name(), "app");
        assert_eq!(modules[1].name(), "libc.so.6");
        assert_eq!(modules[1].size(), 0x21000);
    }

    #[test]
    fn own_process_enumeration_contains_self() {
        let modules = modules().expect("read /proc/self/maps");
        assert!(!modules.is_empty());
        let base = image_base();
        assert_ne!(base, 0);
        assert!(modules
            .iter()
            .any(|(_, mbase, msize)| base >= *mbase && base < mbase + msize));
    }
}
