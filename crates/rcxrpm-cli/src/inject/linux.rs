//! POSIX injection: ptrace the target, call `mmap` through a syscall
//! instruction in its libc, drop a dlopen shellcode into the scratch page,
//! run it to the trap, and restore the tracee as if nothing happened.

use std::ffi::c_void;
use std::path::Path;

use rcxrpm_shared::{Error, InjectStep, Result};
use tracing::debug;

use super::Injector;

pub struct PtraceInjector;

impl Injector for PtraceInjector {
    #[cfg(target_arch = "x86_64")]
    fn inject(&self, pid: u32, payload: &Path) -> Result<()> {
        imp::inject(pid as libc::pid_t, payload)
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn inject(&self, _pid: u32, _payload: &Path) -> Result<()> {
        Err(Error::InjectionFailed {
            step: InjectStep::ResolveLoader,
            detail: "ptrace injection is only implemented for x86-64".into(),
        })
    }
}

#[cfg(target_arch = "x86_64")]
mod imp {
    use super::*;

    /// Scratch page requested from the target.
    const SCRATCH_LEN: u64 = 4096;
    const SYS_MMAP: u64 = 9;
    const SYS_MUNMAP: u64 = 11;
    const RTLD_NOW: u64 = 2;

    /// Attached tracee; detaches on drop so no error path leaves the target
    /// stopped.
    struct Tracee {
        pid: libc::pid_t,
    }

    impl Tracee {
        fn attach(pid: libc::pid_t) -> Result<Self> {
            let rc = unsafe {
                libc::ptrace(
                    libc::PTRACE_ATTACH,
                    pid,
                    std::ptr::null_mut::<c_void>(),
                    std::ptr::null_mut::<c_void>(),
                )
            };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                return Err(Error::PermissionDenied(format!(
                    "ptrace attach to {pid} failed: {err}. \
                     Check /proc/sys/kernel/yama/ptrace_scope or run as root."
                )));
            }
            let mut status = 0;
            unsafe { libc::waitpid(pid, &mut status, 0) };
            Ok(Self { pid })
        }

        fn get_regs(&self) -> Result<libc::user_regs_struct> {
            let mut regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
            let rc = unsafe {
                libc::ptrace(
                    libc::PTRACE_GETREGS,
                    self.pid,
                    std::ptr::null_mut::<c_void>(),
                    &mut regs as *mut _ as *mut c_void,
                )
            };
            if rc < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            Ok(regs)
        }

        fn set_regs(&self, regs: &libc::user_regs_struct) -> Result<()> {
            let rc = unsafe {
                libc::ptrace(
                    libc::PTRACE_SETREGS,
                    self.pid,
                    std::ptr::null_mut::<c_void>(),
                    regs as *const _ as *mut c_void,
                )
            };
            if rc < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            Ok(())
        }

        fn single_step(&self) -> i32 {
            unsafe {
                libc::ptrace(
                    libc::PTRACE_SINGLESTEP,
                    self.pid,
                    std::ptr::null_mut::<c_void>(),
                    std::ptr::null_mut::<c_void>(),
                );
                let mut status = 0;
                libc::waitpid(self.pid, &mut status, 0);
                status
            }
        }

        fn cont(&self) -> i32 {
            unsafe {
                libc::ptrace(
                    libc::PTRACE_CONT,
                    self.pid,
                    std::ptr::null_mut::<c_void>(),
                    std::ptr::null_mut::<c_void>(),
                );
                let mut status = 0;
                libc::waitpid(self.pid, &mut status, 0);
                status
            }
        }

        /// Word-wise POKEDATA; the trailing partial word is merged with a
        /// PEEKDATA so bytes past the buffer are preserved.
        fn poke(&self, addr: u64, bytes: &[u8]) -> Result<()> {
            const WORD: usize = std::mem::size_of::<libc::c_long>();
            let mut i = 0;
            while i < bytes.len() {
                let chunk = (bytes.len() - i).min(WORD);
                let mut word: libc::c_long = 0;
                if chunk < WORD {
                    unsafe {
                        *libc::__errno_location() = 0;
                        word = libc::ptrace(
                            libc::PTRACE_PEEKDATA,
                            self.pid,
                            (addr + i as u64) as *mut c_void,
                            std::ptr::null_mut::<c_void>(),
                        );
                        if *libc::__errno_location() != 0 {
                            return Err(Error::Io(std::io::Error::last_os_error()));
                        }
                    }
                }
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        bytes.as_ptr().add(i),
                        &mut word as *mut libc::c_long as *mut u8,
                        chunk,
                    );
                    let rc = libc::ptrace(
                        libc::PTRACE_POKEDATA,
                        self.pid,
                        (addr + i as u64) as *mut c_void,
                        word as *mut c_void,
                    );
                    if rc < 0 {
                        return Err(Error::Io(std::io::Error::last_os_error()));
                    }
                }
                i += WORD;
            }
            Ok(())
        }
    }

    impl Drop for Tracee {
        fn drop(&mut self) {
            unsafe {
                libc::ptrace(
                    libc::PTRACE_DETACH,
                    self.pid,
                    std::ptr::null_mut::<c_void>(),
                    std::ptr::null_mut::<c_void>(),
                );
            }
        }
    }

    /// Base of the first mapping whose path mentions `lib` in `pid`'s maps.
    fn find_lib_base(pid: libc::pid_t, lib: &str) -> Option<u64> {
        let maps = std::fs::read_to_string(format!("/proc/{pid}/maps")).ok()?;
        for line in maps.lines() {
            if line.contains(lib) {
                let (start, _) = line.split_once('-')?;
                return u64::from_str_radix(start, 16).ok();
            }
        }
        None
    }

    /// Address of a `syscall` instruction (0F 05) in the target's libc text.
    fn find_syscall_insn(pid: libc::pid_t) -> Option<u64> {
        let maps = std::fs::read_to_string(format!("/proc/{pid}/maps")).ok()?;
        let line = maps
            .lines()
            .find(|l| l.contains("libc") && l.contains("r-xp"))?;
        let (range, _) = line.split_once(' ')?;
        let (start_s, end_s) = range.split_once('-')?;
        let start = u64::from_str_radix(start_s, 16).ok()?;
        let end = u64::from_str_radix(end_s, 16).ok()?;

        use std::io::Read;
        use std::io::Seek;
        let mut mem = std::fs::File::open(format!("/proc/{pid}/mem")).ok()?;
        let mut buf = [0u8; 4096];
        let mut off = start;
        while off < end {
            mem.seek(std::io::SeekFrom::Start(off)).ok()?;
            let n = mem.read(&mut buf).ok()?;
            if n <= 1 {
                break;
            }
            for i in 0..n - 1 {
                if buf[i] == 0x0F && buf[i + 1] == 0x05 {
                    return Some(off + i as u64);
                }
            }
            off += buf.len() as u64;
        }
        None
    }

    /// The target's dlopen address, computed from our own: libc base offset
    /// in the target plus the local function offset.
    fn find_remote_dlopen(pid: libc::pid_t) -> Option<u64> {
        let local_dlopen =
            unsafe { libc::dlsym(libc::RTLD_DEFAULT, c"dlopen".as_ptr()) } as u64;
        let local_base = find_lib_base(unsafe { libc::getpid() }, "libc")?;
        let remote_base = find_lib_base(pid, "libc")?;
        if local_dlopen == 0 || local_dlopen < local_base {
            return None;
        }
        Some(remote_base + (local_dlopen - local_base))
    }

    fn fail(step: InjectStep, detail: impl Into<String>) -> Error {
        Error::InjectionFailed {
            step,
            detail: detail.into(),
        }
    }

    pub fn inject(pid: libc::pid_t, payload: &Path) -> Result<()> {
        let path_bytes = payload.to_str().ok_or_else(|| {
            fail(InjectStep::WritePath, "payload path is not valid UTF-8")
        })?;

        let tracee = Tracee::attach(pid)?;
        let saved = tracee.get_regs()?;

        let syscall_addr = find_syscall_insn(pid).ok_or_else(|| {
            fail(
                InjectStep::ResolveLoader,
                "no syscall instruction found in target libc",
            )
        })?;
        let remote_dlopen = find_remote_dlopen(pid).ok_or_else(|| {
            fail(
                InjectStep::ResolveLoader,
                "could not compute dlopen address in target",
            )
        })?;
        debug!(pid, syscall_addr, remote_dlopen, "resolved loader entry");

        // mmap(NULL, 4096, PROT_READ|WRITE|EXEC, MAP_PRIVATE|ANONYMOUS, -1, 0)
        let mut regs = saved;
        regs.rax = SYS_MMAP;
        regs.rdi = 0;
        regs.rsi = SCRATCH_LEN;
        regs.rdx = 7;
        regs.r10 = 0x22;
        regs.r8 = u64::MAX;
        regs.r9 = 0;
        regs.rip = syscall_addr;
        tracee.set_regs(&regs)?;
        tracee.single_step();

        let page = tracee.get_regs()?.rax;
        if page == 0 || (page as i64) < 0 {
            tracee.set_regs(&saved)?;
            return Err(fail(InjectStep::Allocate, "mmap in target failed"));
        }

        // Path string at the page start, shellcode 16-byte-aligned after it.
        let mut path_nul = path_bytes.as_bytes().to_vec();
        path_nul.push(0);
        let code_addr = page + ((path_nul.len() as u64 + 15) & !15);

        let write_result = tracee.poke(page, &path_nul).and_then(|()| {
            // mov rdi, path; mov rsi, RTLD_NOW; mov rax, dlopen; call rax; int3
            let mut sc = Vec::with_capacity(32);
            sc.extend_from_slice(&[0x48, 0xBF]);
            sc.extend_from_slice(&page.to_le_bytes());
            sc.extend_from_slice(&[0x48, 0xBE]);
            sc.extend_from_slice(&RTLD_NOW.to_le_bytes());
            sc.extend_from_slice(&[0x48, 0xB8]);
            sc.extend_from_slice(&remote_dlopen.to_le_bytes());
            sc.extend_from_slice(&[0xFF, 0xD0]);
            sc.push(0xCC);
            tracee.poke(code_addr, &sc)
        });
        if let Err(err) = write_result {
            tracee.set_regs(&saved)?;
            return Err(fail(
                InjectStep::WritePath,
                format!("writing into target failed: {err}"),
            ));
        }

        // Run the shellcode until the int3 trap.
        let mut regs = saved;
        regs.rip = code_addr;
        regs.rsp = (page + SCRATCH_LEN) & !0xF;
        tracee.set_regs(&regs)?;
        let status = tracee.cont();

        let loaded = libc::WIFSTOPPED(status)
            && libc::WSTOPSIG(status) == libc::SIGTRAP
            && tracee.get_regs()?.rax != 0;

        // munmap the scratch page whether or not dlopen succeeded.
        let mut clean = saved;
        clean.rax = SYS_MUNMAP;
        clean.rdi = page;
        clean.rsi = SCRATCH_LEN;
        clean.rip = syscall_addr;
        tracee.set_regs(&clean)?;
        tracee.single_step();

        tracee.set_regs(&saved)?;
        drop(tracee); // detach

        if !loaded {
            return Err(fail(
                InjectStep::InvokeLoader,
                format!("dlopen failed in target; is the payload at {}?", payload.display()),
            ));
        }
        Ok(())
    }
}
