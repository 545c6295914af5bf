//! IPC client: one session against an already-injected agent.
//!
//! Round trips are strictly single-flight: a per-session mutex is held from
//! the moment the request is written until the response is consumed, so the
//! agent never sees interleaved commands and needs no locking of its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rcxrpm_shared::protocol::read_batch_footprint;
use rcxrpm_shared::{
    names, Channel, Command, Error, ModuleInfo, ReadEntry, Result, Status, DATA_SIZE, MAX_BATCH,
    PROTOCOL_VERSION,
};
use tracing::debug;

/// Overall connect timeout: channel appearance plus readiness.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-round-trip response timeout.
const RPC_TIMEOUT: Duration = Duration::from_secs(2);
/// SHUTDOWN gets a short grace period; the agent is going away either way.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);
/// Poll interval while waiting for `payload_ready`.
const READY_POLL: Duration = Duration::from_millis(5);

/// A live session with the agent inside one target process.
#[derive(Debug)]
pub struct RpcSession {
    pid: u32,
    channel: Channel,
    /// Held across steps write-request .. read-response of every round trip.
    io: Mutex<()>,
    connected: AtomicBool,
}

impl RpcSession {
    /// Connect to the agent for `pid` using the session token, waiting up to
    /// [`CONNECT_TIMEOUT`] for the channel and the readiness flag.
    pub fn connect(pid: u32, token: &str) -> Result<Self> {
        Self::connect_with_timeout(pid, token, CONNECT_TIMEOUT)
    }

    pub fn connect_with_timeout(pid: u32, token: &str, timeout: Duration) -> Result<Self> {
        if !names::valid_token(token) {
            return Err(Error::ProtocolError(format!("invalid token {token:?}")));
        }
        let deadline = Instant::now() + timeout;
        let channel = Channel::open(pid, Some(token), timeout)?;

        let header = channel.header();
        while !header.payload_ready() {
            if Instant::now() >= deadline {
                return Err(Error::NotReady(format!(
                    "agent in pid {pid} never set payload_ready"
                )));
            }
            std::thread::sleep(READY_POLL);
        }
        let version = header.version();
        if version != PROTOCOL_VERSION {
            return Err(Error::ProtocolError(format!(
                "agent speaks protocol v{version}, expected v{PROTOCOL_VERSION}"
            )));
        }

        debug!(pid, "session connected");
        Ok(Self {
            pid,
            channel,
            io: Mutex::new(()),
            connected: AtomicBool::new(true),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Main-module base recorded by the agent at init. No round trip.
    pub fn image_base(&self) -> u64 {
        self.channel.header().image_base()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::Disconnected)
        }
    }

    /// Fire the request signal and await the response. On timeout the
    /// session is dead: no retry, the caller gets [`Error::Disconnected`]
    /// and every later call fails fast.
    fn transact(&self, timeout: Duration) -> Result<()> {
        self.channel.signal_request();
        if !self.channel.wait_response(timeout) {
            self.connected.store(false, Ordering::Release);
            debug!(pid = self.pid, "response timeout; session disconnected");
            return Err(Error::Disconnected);
        }
        Ok(())
    }

    /// Read `buf.len()` bytes at `addr`. `Ok(Status::Partial)` means
    /// unreadable ranges came back zero-filled; readable ranges are exact.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<Status> {
        let len = u32::try_from(buf.len())
            .map_err(|_| Error::ProtocolError("read length exceeds u32".into()))?;
        let mut out = self.read_batch_inner(&[(addr, len)])?;
        let chunk = out
            .data
            .pop()
            .ok_or_else(|| Error::ProtocolError("empty batch response".into()))?;
        buf.copy_from_slice(&chunk);
        Ok(out.status)
    }

    /// Read several ranges in one round trip. Entries are laid out packed:
    /// the entry array first, each entry's payload after all entries.
    pub fn read_batch(&self, requests: &[(u64, u32)]) -> Result<BatchRead> {
        self.read_batch_inner(requests)
    }

    fn read_batch_inner(&self, requests: &[(u64, u32)]) -> Result<BatchRead> {
        if requests.is_empty() || requests.len() > MAX_BATCH {
            return Err(Error::ProtocolError(format!(
                "batch of {} entries (allowed 1..={MAX_BATCH})",
                requests.len()
            )));
        }
        if requests.iter().any(|&(_, len)| len == 0) {
            return Err(Error::ProtocolError("zero-length read entry".into()));
        }
        let lengths: Vec<u32> = requests.iter().map(|&(_, len)| len).collect();
        if read_batch_footprint(&lengths) > DATA_SIZE {
            return Err(Error::ProtocolError(format!(
                "batch needs {} bytes, data region holds {DATA_SIZE}",
                read_batch_footprint(&lengths)
            )));
        }

        self.ensure_connected()?;
        let _guard = self.io.lock().unwrap();
        self.ensure_connected()?;

        let header = self.channel.header();
        header.set_command(Command::ReadBatch);
        header.set_request_count(requests.len() as u32);
        header.set_status(Status::Ok);

        let mut entry_buf = [0u8; ReadEntry::SIZE];
        let mut data_offset = (requests.len() * ReadEntry::SIZE) as u32;
        let mut offsets = Vec::with_capacity(requests.len());
        for (i, &(address, length)) in requests.iter().enumerate() {
            ReadEntry {
                address,
                length,
                data_offset,
            }
            .write_to(&mut entry_buf);
            self.channel.write_data(i * ReadEntry::SIZE, &entry_buf);
            offsets.push(data_offset as usize);
            data_offset += length;
        }

        self.transact(RPC_TIMEOUT)?;

        let status = header.status();
        if status == Status::Error {
            return Err(Error::ProtocolError("agent rejected read batch".into()));
        }
        let mut data = Vec::with_capacity(requests.len());
        for (&(_, length), &offset) in requests.iter().zip(&offsets) {
            let mut chunk = vec![0u8; length as usize];
            self.channel.read_data(offset, &mut chunk);
            data.push(chunk);
        }
        Ok(BatchRead { data, status })
    }

    /// Write `bytes` at `addr`. `Err(WriteRejected)` guarantees the target
    /// range is untouched.
    pub fn write(&self, addr: u64, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() || bytes.len() > DATA_SIZE {
            return Err(Error::ProtocolError(format!(
                "write of {} bytes (allowed 1..={DATA_SIZE})",
                bytes.len()
            )));
        }
        self.ensure_connected()?;
        let _guard = self.io.lock().unwrap();
        self.ensure_connected()?;

        let header = self.channel.header();
        header.set_command(Command::Write);
        header.set_write_address(addr);
        header.set_write_length(bytes.len() as u32);
        header.set_status(Status::Ok);
        self.channel.write_data(0, bytes);

        self.transact(RPC_TIMEOUT)?;

        match header.status() {
            Status::Ok => Ok(()),
            _ => Err(Error::WriteRejected),
        }
    }

    /// Enumerate the target's loaded modules.
    pub fn enumerate_modules(&self) -> Result<Vec<ModuleInfo>> {
        self.ensure_connected()?;
        let _guard = self.io.lock().unwrap();
        self.ensure_connected()?;

        let header = self.channel.header();
        header.set_command(Command::EnumModules);
        header.set_status(Status::Ok);

        self.transact(RPC_TIMEOUT)?;

        if header.status() != Status::Ok {
            return Err(Error::ProtocolError("module enumeration failed".into()));
        }
        let count = header.response_count();
        let used = (header.total_data_used() as usize).min(DATA_SIZE);
        let mut snapshot = vec![0u8; used];
        self.channel.read_data(0, &mut snapshot);
        rcxrpm_shared::module_info::decode_modules(&snapshot, count)
    }

    /// Liveness check.
    pub fn ping(&self) -> Result<()> {
        self.ensure_connected()?;
        let _guard = self.io.lock().unwrap();
        self.ensure_connected()?;

        let header = self.channel.header();
        header.set_command(Command::Ping);
        header.set_status(Status::Ok);
        self.transact(RPC_TIMEOUT)
    }

    /// Ask the agent to tear down. The session is disconnected afterwards
    /// whether or not the agent answered in time.
    pub fn shutdown(&self) -> Result<()> {
        self.ensure_connected()?;
        let _guard = self.io.lock().unwrap();

        let header = self.channel.header();
        header.set_command(Command::Shutdown);
        header.set_status(Status::Ok);
        let result = self.transact(SHUTDOWN_TIMEOUT);
        self.connected.store(false, Ordering::Release);
        result
    }
}

/// Result of a batch read: one buffer per entry, in request order.
pub struct BatchRead {
    pub data: Vec<Vec<u8>>,
    /// [`Status::Partial`] when at least one range was unreadable.
    pub status: Status,
}
