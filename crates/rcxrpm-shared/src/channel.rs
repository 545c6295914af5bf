//! Shared-memory channel: one mapped region plus two named signals.
//!
//! The agent creates all three objects; the inspector opens them by the names
//! derived from (PID, token). Either side's exit drops its handles and the
//! kernel object dies with the last reference; on POSIX the creating side
//! additionally unlinks the names on drop.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::names;
use crate::protocol::{HeaderView, DATA_SIZE, HEADER_SIZE, SHM_SIZE};

/// Poll interval while waiting for the agent to create the channel.
const OPEN_POLL: Duration = Duration::from_millis(10);

#[cfg(unix)]
mod imp {
    use super::*;
    use std::ffi::CString;

    fn cname(name: &str) -> Result<CString> {
        CString::new(name)
            .map_err(|_| Error::ProtocolError(format!("bad resource name: {name:?}")))
    }

    fn last_os_error() -> Error {
        Error::Io(std::io::Error::last_os_error())
    }

    /// A named POSIX shared-memory region, mapped read-write.
    #[derive(Debug)]
    pub struct ShmRegion {
        ptr: *mut u8,
        len: usize,
        name: CString,
        unlink_on_drop: bool,
    }

    unsafe impl Send for ShmRegion {}
    unsafe impl Sync for ShmRegion {}

    impl ShmRegion {
        pub fn create(name: &str, len: usize) -> Result<Self> {
            let cname = cname(name)?;
            unsafe {
                let fd = libc::shm_open(cname.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600);
                if fd < 0 {
                    return Err(last_os_error());
                }
                if libc::ftruncate(fd, len as libc::off_t) != 0 {
                    let err = last_os_error();
                    libc::close(fd);
                    libc::shm_unlink(cname.as_ptr());
                    return Err(err);
                }
                let ptr = libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd,
                    0,
                );
                libc::close(fd);
                if ptr == libc::MAP_FAILED {
                    libc::shm_unlink(cname.as_ptr());
                    return Err(last_os_error());
                }
                Ok(Self {
                    ptr: ptr as *mut u8,
                    len,
                    name: cname,
                    unlink_on_drop: true,
                })
            }
        }

        pub fn open(name: &str, len: usize) -> Result<Self> {
            let cname = cname(name)?;
            unsafe {
                let fd = libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0);
                if fd < 0 {
                    return Err(last_os_error());
                }
                let ptr = libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd,
                    0,
                );
                libc::close(fd);
                if ptr == libc::MAP_FAILED {
                    return Err(last_os_error());
                }
                Ok(Self {
                    ptr: ptr as *mut u8,
                    len,
                    name: cname,
                    unlink_on_drop: false,
                })
            }
        }

        /// Remove the name now instead of at drop. Used by the agent after
        /// consuming the bootstrap region.
        pub fn unlink_now(&mut self) {
            unsafe { libc::shm_unlink(self.name.as_ptr()) };
            self.unlink_on_drop = false;
        }

        /// Keep the name alive past this handle's drop (bootstrap publishing:
        /// the consumer unlinks).
        pub fn persist_name(&mut self) {
            self.unlink_on_drop = false;
        }

        pub fn as_ptr(&self) -> *mut u8 {
            self.ptr
        }

        pub fn len(&self) -> usize {
            self.len
        }
    }

    impl Drop for ShmRegion {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.len);
                if self.unlink_on_drop {
                    libc::shm_unlink(self.name.as_ptr());
                }
            }
        }
    }

    /// A named binary signal backed by a POSIX semaphore.
    #[derive(Debug)]
    pub struct Signal {
        sem: *mut libc::sem_t,
        name: CString,
        unlink_on_drop: bool,
    }

    unsafe impl Send for Signal {}
    unsafe impl Sync for Signal {}

    impl Signal {
        pub fn create(name: &str) -> Result<Self> {
            let cname = cname(name)?;
            let sem = unsafe {
                libc::sem_open(
                    cname.as_ptr(),
                    libc::O_CREAT,
                    0o600 as libc::c_uint,
                    0 as libc::c_uint,
                )
            };
            if sem == libc::SEM_FAILED {
                return Err(last_os_error());
            }
            Ok(Self {
                sem,
                name: cname,
                unlink_on_drop: true,
            })
        }

        pub fn open(name: &str) -> Result<Self> {
            let cname = cname(name)?;
            let sem = unsafe { libc::sem_open(cname.as_ptr(), 0) };
            if sem == libc::SEM_FAILED {
                return Err(last_os_error());
            }
            Ok(Self {
                sem,
                name: cname,
                unlink_on_drop: false,
            })
        }

        pub fn post(&self) {
            unsafe { libc::sem_post(self.sem) };
        }

        /// Consume any pending counts. Named semaphores outlive crashed
        /// sessions; a fresh channel must start with both signals clear.
        pub fn drain(&self) {
            while unsafe { libc::sem_trywait(self.sem) } == 0 {}
        }

        /// Wait for the signal; `true` if it fired, `false` on timeout.
        pub fn wait(&self, timeout: Duration) -> bool {
            let mut ts = libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };
            unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
            ts.tv_sec += timeout.as_secs() as libc::time_t;
            ts.tv_nsec += timeout.subsec_nanos() as libc::c_long;
            if ts.tv_nsec >= 1_000_000_000 {
                ts.tv_sec += 1;
                ts.tv_nsec -= 1_000_000_000;
            }
            loop {
                let rc = unsafe { libc::sem_timedwait(self.sem, &ts) };
                if rc == 0 {
                    return true;
                }
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                if errno == libc::EINTR {
                    continue;
                }
                return false;
            }
        }
    }

    impl Drop for Signal {
        fn drop(&mut self) {
            unsafe {
                libc::sem_close(self.sem);
                if self.unlink_on_drop {
                    libc::sem_unlink(self.name.as_ptr());
                }
            }
        }
    }
}

#[cfg(windows)]
mod imp {
    use super::*;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0};
    use windows::Win32::System::Memory::{
        CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile,
        FILE_MAP_ALL_ACCESS, MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
    };
    use windows::Win32::System::Threading::{
        CreateEventW, OpenEventW, SetEvent, WaitForSingleObject, EVENT_ALL_ACCESS,
    };

    fn wide(name: &str) -> Vec<u16> {
        name.encode_utf16().chain(std::iter::once(0)).collect()
    }

    fn last_os_error() -> Error {
        Error::Io(std::io::Error::last_os_error())
    }

    /// A named file-mapping region, mapped read-write.
    #[derive(Debug)]
    pub struct ShmRegion {
        handle: HANDLE,
        view: MEMORY_MAPPED_VIEW_ADDRESS,
        len: usize,
    }

    unsafe impl Send for ShmRegion {}
    unsafe impl Sync for ShmRegion {}

    impl ShmRegion {
        pub fn create(name: &str, len: usize) -> Result<Self> {
            let name_wide = wide(name);
            unsafe {
                let handle = CreateFileMappingW(
                    INVALID_HANDLE_VALUE,
                    None,
                    PAGE_READWRITE,
                    0,
                    len as u32,
                    PCWSTR(name_wide.as_ptr()),
                )
                .map_err(|e| Error::Io(std::io::Error::other(e)))?;

                let view = MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, len);
                if view.Value.is_null() {
                    let err = last_os_error();
                    let _ = CloseHandle(handle);
                    return Err(err);
                }
                Ok(Self { handle, view, len })
            }
        }

        pub fn open(name: &str, len: usize) -> Result<Self> {
            let name_wide = wide(name);
            unsafe {
                let handle =
                    OpenFileMappingW(FILE_MAP_ALL_ACCESS.0, false, PCWSTR(name_wide.as_ptr()))
                        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

                let view = MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, len);
                if view.Value.is_null() {
                    let err = last_os_error();
                    let _ = CloseHandle(handle);
                    return Err(err);
                }
                Ok(Self { handle, view, len })
            }
        }

        // Windows mappings have no name to unlink; the object dies with its
        // last handle. These exist so both platforms share a call surface.
        pub fn unlink_now(&mut self) {}
        pub fn persist_name(&mut self) {}

        pub fn as_ptr(&self) -> *mut u8 {
            self.view.Value as *mut u8
        }

        pub fn len(&self) -> usize {
            self.len
        }
    }

    impl Drop for ShmRegion {
        fn drop(&mut self) {
            unsafe {
                let _ = UnmapViewOfFile(self.view);
                let _ = CloseHandle(self.handle);
            }
        }
    }

    /// A named auto-reset event.
    #[derive(Debug)]
    pub struct Signal {
        handle: HANDLE,
    }

    unsafe impl Send for Signal {}
    unsafe impl Sync for Signal {}

    impl Signal {
        pub fn create(name: &str) -> Result<Self> {
            let name_wide = wide(name);
            let handle =
                unsafe { CreateEventW(None, false, false, PCWSTR(name_wide.as_ptr())) }
                    .map_err(|e| Error::Io(std::io::Error::other(e)))?;
            Ok(Self { handle })
        }

        pub fn open(name: &str) -> Result<Self> {
            let name_wide = wide(name);
            let handle =
                unsafe { OpenEventW(EVENT_ALL_ACCESS, false, PCWSTR(name_wide.as_ptr())) }
                    .map_err(|e| Error::Io(std::io::Error::other(e)))?;
            Ok(Self { handle })
        }

        pub fn post(&self) {
            unsafe {
                let _ = SetEvent(self.handle);
            }
        }

        /// Clear a possibly-signalled state left by a crashed session.
        pub fn drain(&self) {
            while unsafe { WaitForSingleObject(self.handle, 0) } == WAIT_OBJECT_0 {}
        }

        pub fn wait(&self, timeout: Duration) -> bool {
            unsafe { WaitForSingleObject(self.handle, timeout.as_millis() as u32) == WAIT_OBJECT_0 }
        }
    }

    impl Drop for Signal {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.handle);
            }
        }
    }
}

pub use imp::{ShmRegion, Signal};

/// One session's shared region plus its request/response signals.
#[derive(Debug)]
pub struct Channel {
    region: ShmRegion,
    req: Signal,
    rsp: Signal,
}

impl Channel {
    /// Agent side: create the region and both signals. On POSIX the names are
    /// unlinked when the channel drops.
    pub fn create(pid: u32, token: Option<&str>) -> Result<Self> {
        let region = ShmRegion::create(&names::shm_name(pid, token), SHM_SIZE)?;
        let req = Signal::create(&names::req_name(pid, token))?;
        let rsp = Signal::create(&names::rsp_name(pid, token))?;
        req.drain();
        rsp.drain();
        Ok(Self { region, req, rsp })
    }

    /// Inspector side: open the region and both signals, polling every 10 ms
    /// until all three exist or `timeout` elapses. The agent creates them in
    /// sequence, so a partially-created channel is retried as a whole.
    pub fn open(pid: u32, token: Option<&str>, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            match Self::try_open(pid, token) {
                Ok(channel) => return Ok(channel),
                Err(_) if Instant::now() < deadline => std::thread::sleep(OPEN_POLL),
                Err(_) => {
                    return Err(Error::NotReady(format!(
                        "channel {} did not appear within {timeout:?}",
                        names::shm_name(pid, token)
                    )))
                }
            }
        }
    }

    fn try_open(pid: u32, token: Option<&str>) -> Result<Self> {
        let region = ShmRegion::open(&names::shm_name(pid, token), SHM_SIZE)?;
        let req = Signal::open(&names::req_name(pid, token))?;
        let rsp = Signal::open(&names::rsp_name(pid, token))?;
        Ok(Self { region, req, rsp })
    }

    pub fn header(&self) -> HeaderView {
        unsafe { HeaderView::new(self.region.as_ptr()) }
    }

    /// Raw pointer to the data region. The agent reads and writes through it
    /// directly (probe results land in place).
    pub fn data_ptr(&self) -> *mut u8 {
        unsafe { self.region.as_ptr().add(HEADER_SIZE) }
    }

    /// Copy bytes into the data region; `false` if the range is out of bounds.
    pub fn write_data(&self, offset: usize, bytes: &[u8]) -> bool {
        if offset.checked_add(bytes.len()).map_or(true, |end| end > DATA_SIZE) {
            return false;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data_ptr().add(offset), bytes.len());
        }
        true
    }

    /// Copy bytes out of the data region; `false` if the range is out of bounds.
    pub fn read_data(&self, offset: usize, buf: &mut [u8]) -> bool {
        if offset.checked_add(buf.len()).map_or(true, |end| end > DATA_SIZE) {
            return false;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(self.data_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        true
    }

    pub fn signal_request(&self) {
        self.req.post();
    }

    pub fn wait_request(&self, timeout: Duration) -> bool {
        self.req.wait(timeout)
    }

    pub fn signal_response(&self) {
        self.rsp.post();
    }

    pub fn wait_response(&self, timeout: Duration) -> bool {
        self.rsp.wait(timeout)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn test_token(tag: &str) -> String {
        // Unique per test process so parallel CI runs cannot collide.
        format!("{tag}{}", std::process::id())
    }

    #[test]
    fn create_then_open_roundtrip() {
        let pid = std::process::id();
        let token = test_token("chan");
        let server = Channel::create(pid, Some(&token)).expect("create channel");
        let client =
            Channel::open(pid, Some(&token), Duration::from_secs(1)).expect("open channel");

        server.header().set_image_base(0xABCD_0000);
        assert_eq!(client.header().image_base(), 0xABCD_0000);

        assert!(client.write_data(8, b"hello"));
        let mut buf = [0u8; 5];
        assert!(server.read_data(8, &mut buf));
        assert_eq!(&buf, b"hello");

        client.signal_request();
        assert!(server.wait_request(Duration::from_millis(100)));
        server.signal_response();
        assert!(client.wait_response(Duration::from_millis(100)));
        // Drained signals time out.
        assert!(!server.wait_request(Duration::from_millis(10)));
    }

    #[test]
    fn data_bounds_are_enforced() {
        let pid = std::process::id();
        let token = test_token("bnd");
        let server = Channel::create(pid, Some(&token)).expect("create channel");
        assert!(!server.write_data(DATA_SIZE - 3, b"0123"));
        assert!(!server.write_data(usize::MAX, b"x"));
        let mut buf = [0u8; 4];
        assert!(!server.read_data(DATA_SIZE - 3, &mut buf));
        assert!(server.write_data(DATA_SIZE - 4, b"0123"));
    }

    #[test]
    fn open_missing_channel_times_out() {
        let err = Channel::open(u32::MAX - 1, Some("beefbeefbeefbeef"), Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, Error::NotReady(_)));
    }
}
