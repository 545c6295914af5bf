//! Non-faulting access to the agent's own address space.
//!
//! Requests name arbitrary, possibly-unmapped addresses; a raw dereference
//! would take the whole target process down with us. POSIX goes through
//! `/proc/self/mem` (`pread`/`pwrite` fail cleanly on unmapped ranges);
//! Windows walks the range with `VirtualQuery` before touching it.

#[cfg(unix)]
mod imp {
    use std::io;

    pub struct MemAccess {
        mem_fd: i32,
    }

    unsafe impl Send for MemAccess {}
    unsafe impl Sync for MemAccess {}

    impl MemAccess {
        pub fn open() -> io::Result<Self> {
            let fd = unsafe { libc::open(c"/proc/self/mem".as_ptr(), libc::O_RDWR) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { mem_fd: fd })
        }

        /// Copy `len` bytes from `addr` into `dest`. Whatever cannot be read
        /// is zero-filled; returns `true` only for a complete read.
        ///
        /// # Safety
        ///
        /// `dest` must be valid for `len` bytes.
        pub unsafe fn read(&self, addr: u64, dest: *mut u8, len: usize) -> bool {
            let n = unsafe {
                libc::pread(
                    self.mem_fd,
                    dest as *mut libc::c_void,
                    len,
                    addr as libc::off_t,
                )
            };
            if n >= len as isize {
                return true;
            }
            let got = n.max(0) as usize;
            unsafe { std::ptr::write_bytes(dest.add(got), 0, len - got) };
            false
        }

        /// Copy `len` bytes from `src` to `addr`. The destination range is
        /// probed against `/proc/self/maps` first so a rejected write
        /// modifies nothing; returns `true` only for a complete write.
        ///
        /// # Safety
        ///
        /// `src` must be valid for `len` bytes.
        pub unsafe fn write(&self, addr: u64, src: *const u8, len: usize) -> bool {
            if !range_writable(addr, len) {
                return false;
            }
            let n = unsafe {
                libc::pwrite(
                    self.mem_fd,
                    src as *const libc::c_void,
                    len,
                    addr as libc::off_t,
                )
            };
            n >= len as isize
        }
    }

    impl Drop for MemAccess {
        fn drop(&mut self) {
            unsafe { libc::close(self.mem_fd) };
        }
    }

    /// Every byte of `[addr, addr + len)` lies in a writable mapping.
    fn range_writable(addr: u64, len: usize) -> bool {
        let maps = match std::fs::read_to_string("/proc/self/maps") {
            Ok(maps) => maps,
            Err(_) => return false,
        };
        range_writable_in(&maps, addr, len)
    }

    pub(crate) fn range_writable_in(maps: &str, addr: u64, len: usize) -> bool {
        let end = match addr.checked_add(len as u64) {
            Some(end) => end,
            None => return false,
        };
        let mut cur = addr;
        // maps lines are address-sorted, so one forward pass suffices.
        for line in maps.lines() {
            let Some((range, rest)) = line.split_once(' ') else {
                continue;
            };
            let Some((start_s, end_s)) = range.split_once('-') else {
                continue;
            };
            let (Ok(start), Ok(stop)) = (
                u64::from_str_radix(start_s, 16),
                u64::from_str_radix(end_s, 16),
            ) else {
                continue;
            };
            if stop <= cur {
                continue;
            }
            if start > cur {
                return false; // hole before the next mapping
            }
            if !rest.as_bytes().get(1).is_some_and(|&b| b == b'w') {
                return false;
            }
            cur = stop;
            if cur >= end {
                return true;
            }
        }
        false
    }
}

#[cfg(windows)]
mod imp {
    use std::io;

    use windows::Win32::System::Memory::{
        VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT, PAGE_EXECUTE_READ,
        PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_GUARD, PAGE_NOACCESS, PAGE_READONLY,
        PAGE_READWRITE, PAGE_WRITECOPY,
    };

    pub struct MemAccess;

    impl MemAccess {
        pub fn open() -> io::Result<Self> {
            Ok(Self)
        }

        /// # Safety
        ///
        /// `dest` must be valid for `len` bytes.
        pub unsafe fn read(&self, addr: u64, dest: *mut u8, len: usize) -> bool {
            if range_ok(addr, len, readable_protect) {
                unsafe { std::ptr::copy_nonoverlapping(addr as usize as *const u8, dest, len) };
                true
            } else {
                unsafe { std::ptr::write_bytes(dest, 0, len) };
                false
            }
        }

        /// # Safety
        ///
        /// `src` must be valid for `len` bytes.
        pub unsafe fn write(&self, addr: u64, src: *const u8, len: usize) -> bool {
            if range_ok(addr, len, writable_protect) {
                unsafe { std::ptr::copy_nonoverlapping(src, addr as usize as *mut u8, len) };
                true
            } else {
                false
            }
        }
    }

    fn readable_protect(p: u32) -> bool {
        if p & (PAGE_NOACCESS.0 | PAGE_GUARD.0) != 0 {
            return false;
        }
        let readable = PAGE_READONLY.0
            | PAGE_READWRITE.0
            | PAGE_WRITECOPY.0
            | PAGE_EXECUTE_READ.0
            | PAGE_EXECUTE_READWRITE.0
            | PAGE_EXECUTE_WRITECOPY.0;
        p & readable != 0
    }

    fn writable_protect(p: u32) -> bool {
        if p & (PAGE_NOACCESS.0 | PAGE_GUARD.0) != 0 {
            return false;
        }
        let writable = PAGE_READWRITE.0
            | PAGE_WRITECOPY.0
            | PAGE_EXECUTE_READWRITE.0
            | PAGE_EXECUTE_WRITECOPY.0;
        p & writable != 0
    }

    /// Every page of `[addr, addr + len)` is committed with an acceptable
    /// protection.
    fn range_ok(addr: u64, len: usize, protect_ok: fn(u32) -> bool) -> bool {
        let end = match addr.checked_add(len as u64) {
            Some(end) => end,
            None => return false,
        };
        let mut cur = addr;
        while cur < end {
            let mut mbi = MEMORY_BASIC_INFORMATION::default();
            let got = unsafe {
                VirtualQuery(
                    Some(cur as usize as *const _),
                    &mut mbi,
                    std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            if got == 0 || mbi.State != MEM_COMMIT || !protect_ok(mbi.Protect.0) {
                return false;
            }
            cur = mbi.BaseAddress as u64 + mbi.RegionSize as u64;
        }
        true
    }
}

pub use imp::MemAccess;

#[cfg(all(test, unix))]
mod tests {
    use super::imp::range_writable_in;
    use super::*;

    const MAPS: &str = "\
5555deadb000-5555deadc000 r--p 00000000 fd:01 100 /usr/bin/app
5555deadc000-5555deade000 r-xp 00001000 fd:01 100 /usr/bin/app
7f0000000000-7f0000004000 rw-p 00000000 00:00 0
7f0000004000-7f0000008000 rw-p 00000000 00:00 0
7f0000009000-7f000000a000 rw-p 00000000 00:00 0
";

    #[test]
    fn writable_range_checks() {
        assert!(range_writable_in(MAPS, 0x7f0000000000, 0x1000));
        // Spans two contiguous writable mappings.
        assert!(range_writable_in(MAPS, 0x7f0000003000, 0x2000));
        // Read-only text segment.
        assert!(!range_writable_in(MAPS, 0x5555deadc000, 16));
        // Hole between mappings.
        assert!(!range_writable_in(MAPS, 0x7f0000007000, 0x3000));
        // Entirely unmapped.
        assert!(!range_writable_in(MAPS, 0xdead0000, 64));
        // Overflowing range.
        assert!(!range_writable_in(MAPS, u64::MAX - 8, 64));
    }

    #[test]
    fn read_own_buffer_is_exact() {
        let access = MemAccess::open().expect("open /proc/self/mem");
        let src: Vec<u8> = (0..4096u32).map(|i| (i & 0xFF) as u8).collect();
        let mut dst = vec![0u8; 4096];
        let full =
            unsafe { access.read(src.as_ptr() as u64, dst.as_mut_ptr(), dst.len()) };
        assert!(full);
        assert_eq!(src, dst);
    }

    #[test]
    fn read_unmapped_zero_fills() {
        let access = MemAccess::open().expect("open /proc/self/mem");
        let mut dst = vec![0xAAu8; 64];
        let full = unsafe { access.read(0xDEAD_0000, dst.as_mut_ptr(), dst.len()) };
        assert!(!full);
        assert!(dst.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_then_read_back() {
        let access = MemAccess::open().expect("open /proc/self/mem");
        let mut target = vec![0u8; 64];
        let patch = [0xDEu8, 0xAD, 0xBE, 0xEF];
        let ok = unsafe { access.write(target.as_mut_ptr() as u64, patch.as_ptr(), patch.len()) };
        assert!(ok);
        assert_eq!(&target[..4], &patch);
        assert!(target[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn write_unmapped_is_rejected() {
        let access = MemAccess::open().expect("open /proc/self/mem");
        let patch = [1u8, 2, 3, 4];
        let ok = unsafe { access.write(0xDEAD_0000, patch.as_ptr(), patch.len()) };
        assert!(!ok);
    }
}
