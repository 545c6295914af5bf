//! Wire protocol for the shared-memory RPC channel.
//!
//! Layout of the shared region:
//! ```text
//! ┌────────────────────────┐ 0
//! │ ChannelHeader (4096 B) │
//! ├────────────────────────┤ 4096
//! │ Data region            │  <- command-specific records + payload bytes
//! └────────────────────────┘ 1 MiB
//! ```
//!
//! The header is a fixed byte layout addressed by explicit field offsets so
//! both processes build identical views regardless of how either compiler
//! would lay out a struct. All numeric fields are little-endian and naturally
//! aligned; field access goes through shared-memory atomics.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Protocol version stamped into the header by the agent.
pub const PROTOCOL_VERSION: u32 = 1;

/// Total size of the shared region (1 MiB).
pub const SHM_SIZE: usize = 1024 * 1024;

/// Size of the channel header; the data region starts here.
pub const HEADER_SIZE: usize = 4096;

/// Size of the data region.
pub const DATA_SIZE: usize = SHM_SIZE - HEADER_SIZE;

/// Size of the bootstrap region carrying the session token.
pub const BOOT_SIZE: usize = 64;

/// Maximum entries in a single READ_BATCH request.
pub const MAX_BATCH: usize = 256;

/// RPC commands (stable integer codes).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// No command / idle
    None = 0,
    /// Batch read: N {address, length} entries
    ReadBatch = 1,
    /// Single write
    Write = 2,
    /// Enumerate loaded modules
    EnumModules = 3,
    /// Liveness check
    Ping = 4,
    /// Graceful teardown
    Shutdown = 5,
}

impl From<u32> for Command {
    fn from(v: u32) -> Self {
        match v {
            1 => Command::ReadBatch,
            2 => Command::Write,
            3 => Command::EnumModules,
            4 => Command::Ping,
            5 => Command::Shutdown,
            _ => Command::None,
        }
    }
}

/// RPC status codes (stable integer codes).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Command completed fully
    Ok = 0,
    /// Command failed; response fields are not meaningful
    Error = 1,
    /// Read touched unreadable memory; affected ranges are zero-filled
    Partial = 2,
}

impl From<u32> for Status {
    fn from(v: u32) -> Self {
        match v {
            2 => Status::Partial,
            0 => Status::Ok,
            _ => Status::Error,
        }
    }
}

// Header field offsets. These are the wire format; do not reorder.
const OFF_VERSION: usize = 0;
const OFF_PAYLOAD_READY: usize = 4;
const OFF_COMMAND: usize = 8;
const OFF_REQUEST_COUNT: usize = 12;
const OFF_WRITE_ADDRESS: usize = 16;
const OFF_WRITE_LENGTH: usize = 24;
const OFF_STATUS: usize = 28;
const OFF_RESPONSE_COUNT: usize = 32;
const OFF_TOTAL_DATA_USED: usize = 36;
const OFF_IMAGE_BASE: usize = 40;

/// View over the 4096-byte channel header at the start of a mapped region.
///
/// Request fields are written by the client, result fields by the agent;
/// there is never more than one writer per field per direction. Ordering
/// between the two processes is provided by the release store / acquire load
/// on `payload_ready` (init handshake) and by the request/response signal
/// pair (per command), so everything else can be relaxed.
#[derive(Clone, Copy)]
pub struct HeaderView {
    base: *mut u8,
}

unsafe impl Send for HeaderView {}
unsafe impl Sync for HeaderView {}

impl HeaderView {
    /// # Safety
    ///
    /// `base` must point to at least [`HEADER_SIZE`] bytes of mapped memory
    /// that stays valid for the lifetime of the view, aligned to a page.
    pub unsafe fn new(base: *mut u8) -> Self {
        Self { base }
    }

    fn u32_at(&self, off: usize) -> &AtomicU32 {
        debug_assert!(off % 4 == 0 && off + 4 <= HEADER_SIZE);
        unsafe { &*(self.base.add(off) as *const AtomicU32) }
    }

    fn u64_at(&self, off: usize) -> &AtomicU64 {
        debug_assert!(off % 8 == 0 && off + 8 <= HEADER_SIZE);
        unsafe { &*(self.base.add(off) as *const AtomicU64) }
    }

    /// Zero the whole header. Agent-side, during init, before publishing.
    pub fn zero(&self) {
        unsafe { std::ptr::write_bytes(self.base, 0, HEADER_SIZE) };
    }

    pub fn version(&self) -> u32 {
        self.u32_at(OFF_VERSION).load(Ordering::Relaxed)
    }

    pub fn set_version(&self, v: u32) {
        self.u32_at(OFF_VERSION).store(v, Ordering::Relaxed);
    }

    /// Acquire-load so a client observing `true` also observes every header
    /// field the agent wrote before its release store.
    pub fn payload_ready(&self) -> bool {
        self.u32_at(OFF_PAYLOAD_READY).load(Ordering::Acquire) != 0
    }

    /// Release-store; the agent calls this only once the header is fully
    /// initialized and both signals exist.
    pub fn set_payload_ready(&self, ready: bool) {
        self.u32_at(OFF_PAYLOAD_READY)
            .store(ready as u32, Ordering::Release);
    }

    pub fn command(&self) -> Command {
        Command::from(self.u32_at(OFF_COMMAND).load(Ordering::Relaxed))
    }

    pub fn set_command(&self, cmd: Command) {
        self.u32_at(OFF_COMMAND).store(cmd as u32, Ordering::Relaxed);
    }

    pub fn request_count(&self) -> u32 {
        self.u32_at(OFF_REQUEST_COUNT).load(Ordering::Relaxed)
    }

    pub fn set_request_count(&self, n: u32) {
        self.u32_at(OFF_REQUEST_COUNT).store(n, Ordering::Relaxed);
    }

    pub fn write_address(&self) -> u64 {
        self.u64_at(OFF_WRITE_ADDRESS).load(Ordering::Relaxed)
    }

    pub fn set_write_address(&self, addr: u64) {
        self.u64_at(OFF_WRITE_ADDRESS).store(addr, Ordering::Relaxed);
    }

    pub fn write_length(&self) -> u32 {
        self.u32_at(OFF_WRITE_LENGTH).load(Ordering::Relaxed)
    }

    pub fn set_write_length(&self, len: u32) {
        self.u32_at(OFF_WRITE_LENGTH).store(len, Ordering::Relaxed);
    }

    pub fn status(&self) -> Status {
        Status::from(self.u32_at(OFF_STATUS).load(Ordering::Relaxed))
    }

    pub fn set_status(&self, status: Status) {
        self.u32_at(OFF_STATUS).store(status as u32, Ordering::Relaxed);
    }

    pub fn response_count(&self) -> u32 {
        self.u32_at(OFF_RESPONSE_COUNT).load(Ordering::Relaxed)
    }

    pub fn set_response_count(&self, n: u32) {
        self.u32_at(OFF_RESPONSE_COUNT).store(n, Ordering::Relaxed);
    }

    pub fn total_data_used(&self) -> u32 {
        self.u32_at(OFF_TOTAL_DATA_USED).load(Ordering::Relaxed)
    }

    pub fn set_total_data_used(&self, n: u32) {
        self.u32_at(OFF_TOTAL_DATA_USED).store(n, Ordering::Relaxed);
    }

    pub fn image_base(&self) -> u64 {
        self.u64_at(OFF_IMAGE_BASE).load(Ordering::Relaxed)
    }

    pub fn set_image_base(&self, base: u64) {
        self.u64_at(OFF_IMAGE_BASE).store(base, Ordering::Relaxed);
    }
}

/// One entry of a READ_BATCH request (16 bytes on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadEntry {
    /// Source address in the target's address space
    pub address: u64,
    /// Bytes to read
    pub length: u32,
    /// Offset into the data region where the response bytes land
    pub data_offset: u32,
}

impl ReadEntry {
    /// Encoded size in bytes.
    pub const SIZE: usize = 16;

    /// Serialize into `buf` (little-endian).
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.address.to_le_bytes());
        buf[8..12].copy_from_slice(&self.length.to_le_bytes());
        buf[12..16].copy_from_slice(&self.data_offset.to_le_bytes());
    }

    /// Deserialize from `buf`; `None` if the slice is too short.
    pub fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            address: u64::from_le_bytes(buf[0..8].try_into().ok()?),
            length: u32::from_le_bytes(buf[8..12].try_into().ok()?),
            data_offset: u32::from_le_bytes(buf[12..16].try_into().ok()?),
        })
    }
}

/// One entry of an ENUM_MODULES response (24 bytes on the wire).
///
/// `name_length` is in bytes; the encoding is UTF-16LE on Windows and UTF-8
/// on POSIX. Names are packed after the entry array in the data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleEntry {
    pub base: u64,
    pub size: u64,
    pub name_offset: u32,
    pub name_length: u32,
}

impl ModuleEntry {
    /// Encoded size in bytes.
    pub const SIZE: usize = 24;

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.base.to_le_bytes());
        buf[8..16].copy_from_slice(&self.size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.name_offset.to_le_bytes());
        buf[20..24].copy_from_slice(&self.name_length.to_le_bytes());
    }

    pub fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            base: u64::from_le_bytes(buf[0..8].try_into().ok()?),
            size: u64::from_le_bytes(buf[8..16].try_into().ok()?),
            name_offset: u32::from_le_bytes(buf[16..20].try_into().ok()?),
            name_length: u32::from_le_bytes(buf[20..24].try_into().ok()?),
        })
    }
}

/// Bytes of data region a READ_BATCH with the given lengths occupies: the
/// entry array followed by the packed payloads.
pub fn read_batch_footprint(lengths: &[u32]) -> usize {
    let entries = lengths.len() * ReadEntry::SIZE;
    let payload: usize = lengths.iter().map(|&l| l as usize).sum();
    entries + payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_field_offsets_are_disjoint() {
        // One aligned backing buffer standing in for the mapped region.
        let mut buf = vec![0u64; HEADER_SIZE / 8];
        let view = unsafe { HeaderView::new(buf.as_mut_ptr() as *mut u8) };

        view.set_version(PROTOCOL_VERSION);
        view.set_command(Command::ReadBatch);
        view.set_request_count(3);
        view.set_write_address(0xDEAD_BEEF_0000_1234);
        view.set_write_length(64);
        view.set_status(Status::Partial);
        view.set_response_count(3);
        view.set_total_data_used(4096);
        view.set_image_base(0x5555_0000_0000);
        view.set_payload_ready(true);

        assert_eq!(view.version(), PROTOCOL_VERSION);
        assert_eq!(view.command(), Command::ReadBatch);
        assert_eq!(view.request_count(), 3);
        assert_eq!(view.write_address(), 0xDEAD_BEEF_0000_1234);
        assert_eq!(view.write_length(), 64);
        assert_eq!(view.status(), Status::Partial);
        assert_eq!(view.response_count(), 3);
        assert_eq!(view.total_data_used(), 4096);
        assert_eq!(view.image_base(), 0x5555_0000_0000);
        assert!(view.payload_ready());
    }

    #[test]
    fn header_wire_positions() {
        let mut buf = vec![0u64; HEADER_SIZE / 8];
        let view = unsafe { HeaderView::new(buf.as_mut_ptr() as *mut u8) };
        view.set_write_address(0x0102_0304_0506_0708);
        view.set_image_base(0x1112_1314_1516_1718);
        view.set_status(Status::Error);

        let bytes =
            unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, HEADER_SIZE) };
        assert_eq!(&bytes[16..24], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(&bytes[28..32], &1u32.to_le_bytes());
        assert_eq!(&bytes[40..48], &0x1112_1314_1516_1718u64.to_le_bytes());
    }

    #[test]
    fn read_entry_roundtrip() {
        let entry = ReadEntry {
            address: 0x7FFF_0000_1000,
            length: 4096,
            data_offset: 16,
        };
        let mut buf = [0u8; ReadEntry::SIZE];
        entry.write_to(&mut buf);
        assert_eq!(ReadEntry::read_from(&buf), Some(entry));
        assert!(ReadEntry::read_from(&buf[..8]).is_none());
    }

    #[test]
    fn module_entry_roundtrip() {
        let entry = ModuleEntry {
            base: 0x5555_5555_0000,
            size: 0x2_0000,
            name_offset: 48,
            name_length: 18,
        };
        let mut buf = [0u8; ModuleEntry::SIZE];
        entry.write_to(&mut buf);
        assert_eq!(ModuleEntry::read_from(&buf), Some(entry));
    }

    #[test]
    fn command_codes_are_stable() {
        assert_eq!(Command::from(0), Command::None);
        assert_eq!(Command::from(1), Command::ReadBatch);
        assert_eq!(Command::from(2), Command::Write);
        assert_eq!(Command::from(3), Command::EnumModules);
        assert_eq!(Command::from(4), Command::Ping);
        assert_eq!(Command::from(5), Command::Shutdown);
        assert_eq!(Command::from(99), Command::None);
        assert_eq!(Status::from(0), Status::Ok);
        assert_eq!(Status::from(1), Status::Error);
        assert_eq!(Status::from(2), Status::Partial);
        assert_eq!(Status::from(7), Status::Error);
    }

    #[test]
    fn batch_footprint() {
        assert_eq!(read_batch_footprint(&[]), 0);
        assert_eq!(read_batch_footprint(&[4096]), ReadEntry::SIZE + 4096);
        assert_eq!(
            read_batch_footprint(&[1024, 1024, 1024, 1024]),
            4 * ReadEntry::SIZE + 4096
        );
    }
}
