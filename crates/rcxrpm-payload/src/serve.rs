//! The agent's serve loop: wait for a request, execute it against our own
//! address space, signal the response.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rcxrpm_shared::protocol::{ModuleEntry, ReadEntry};
use rcxrpm_shared::{Channel, Command, Status, DATA_SIZE, MAX_BATCH};

use crate::memory::MemAccess;
use crate::modules;

/// Timed wait so the shutdown flag is observed without an out-of-band wake.
const REQUEST_WAIT: Duration = Duration::from_millis(250);

pub(crate) struct Server {
    channel: Arc<Channel>,
    mem: MemAccess,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn new(channel: Arc<Channel>, mem: MemAccess, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            channel,
            mem,
            shutdown,
        }
    }

    /// Runs until SHUTDOWN arrives or the shutdown flag is raised. Exactly
    /// one command is in flight at a time (the client serializes), so the
    /// loop owns the header's response fields without further locking.
    pub fn run(self) {
        let header = self.channel.header();
        header.set_payload_ready(true);

        while !self.shutdown.load(Ordering::Acquire) {
            if !self.channel.wait_request(REQUEST_WAIT) {
                continue;
            }

            header.set_status(Status::Ok);
            let command = header.command();
            match command {
                Command::ReadBatch => self.handle_read_batch(),
                Command::Write => self.handle_write(),
                Command::EnumModules => self.handle_enum_modules(),
                Command::Ping => {}
                Command::Shutdown => {
                    self.shutdown.store(true, Ordering::Release);
                }
                Command::None => header.set_status(Status::Error),
            }

            self.channel.signal_response();
            if command == Command::Shutdown {
                break;
            }
        }

        header.set_payload_ready(false);
    }

    fn handle_read_batch(&self) {
        let header = self.channel.header();
        let count = header.request_count() as usize;
        if count == 0 || count > MAX_BATCH {
            header.set_status(Status::Error);
            header.set_response_count(0);
            return;
        }

        let entry_bytes = count * ReadEntry::SIZE;
        let mut entries = Vec::with_capacity(count);
        let mut buf = [0u8; ReadEntry::SIZE];
        for i in 0..count {
            let entry = if self.channel.read_data(i * ReadEntry::SIZE, &mut buf) {
                ReadEntry::read_from(&buf)
            } else {
                None
            };
            let Some(entry) = entry else {
                header.set_status(Status::Error);
                header.set_response_count(0);
                return;
            };
            entries.push(entry);
        }

        // Every destination must land past the entry array and inside the
        // data region; a malformed request must not clobber anything.
        let mut data_end = entry_bytes;
        for entry in &entries {
            let off = entry.data_offset as usize;
            let len = entry.length as usize;
            let end = match off.checked_add(len) {
                Some(end) if off >= entry_bytes && end <= DATA_SIZE => end,
                _ => {
                    header.set_status(Status::Error);
                    header.set_response_count(0);
                    return;
                }
            };
            data_end = data_end.max(end);
        }

        for entry in &entries {
            let dest = unsafe { self.channel.data_ptr().add(entry.data_offset as usize) };
            let full = unsafe { self.mem.read(entry.address, dest, entry.length as usize) };
            if !full && header.status() == Status::Ok {
                header.set_status(Status::Partial);
            }
        }

        header.set_response_count(count as u32);
        header.set_total_data_used(data_end as u32);
    }

    fn handle_write(&self) {
        let header = self.channel.header();
        let len = header.write_length() as usize;
        if len == 0 || len > DATA_SIZE {
            header.set_status(Status::Error);
            return;
        }
        let src = self.channel.data_ptr() as *const u8;
        let ok = unsafe { self.mem.write(header.write_address(), src, len) };
        if !ok {
            header.set_status(Status::Error);
        }
    }

    fn handle_enum_modules(&self) {
        let header = self.channel.header();
        let modules = match modules::modules() {
            Ok(modules) => modules,
            Err(_) => {
                header.set_status(Status::Error);
                header.set_response_count(0);
                return;
            }
        };

        // Fit as many whole modules as the data region allows: entry array
        // first, then packed names. Modules past the limit are dropped
        // rather than their names truncated.
        let mut fit = 0usize;
        let mut name_bytes = 0usize;
        for (name, _, _) in &modules {
            let next = (fit + 1) * ModuleEntry::SIZE + name_bytes + name.len();
            if next > DATA_SIZE {
                break;
            }
            fit += 1;
            name_bytes += name.len();
        }

        let mut name_offset = fit * ModuleEntry::SIZE;
        let mut entry_buf = [0u8; ModuleEntry::SIZE];
        for (i, (name, base, size)) in modules.iter().take(fit).enumerate() {
            ModuleEntry {
                base: *base,
                size: *size,
                name_offset: name_offset as u32,
                name_length: name.len() as u32,
            }
            .write_to(&mut entry_buf);
            self.channel.write_data(i * ModuleEntry::SIZE, &entry_buf);
            self.channel.write_data(name_offset, name);
            name_offset += name.len();
        }

        header.set_response_count(fit as u32);
        header.set_total_data_used(name_offset as u32);
    }
}

// Compile-time guard: the largest allowed entry array fits the region.
const _: () = assert!(MAX_BATCH * ReadEntry::SIZE < DATA_SIZE);
