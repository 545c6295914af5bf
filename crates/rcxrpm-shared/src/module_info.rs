//! Decoded module records from an ENUM_MODULES response.

use crate::error::{Error, Result};
use crate::protocol::ModuleEntry;

/// One loaded module of the target process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Base file name of the module
    pub name: String,
    /// Load address
    pub base: u64,
    /// Mapped size in bytes
    pub size: u64,
}

impl ModuleInfo {
    /// Whether `addr` falls inside this module's mapping.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base.saturating_add(self.size)
    }
}

#[cfg(windows)]
fn decode_name(bytes: &[u8]) -> String {
    // UTF-16LE; an odd trailing byte would be a corrupt record, drop it.
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

#[cfg(unix)]
fn decode_name(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Decode `count` module entries (and their packed names) from a copy of the
/// data region. Offsets outside the snapshot are a protocol violation.
pub fn decode_modules(data: &[u8], count: u32) -> Result<Vec<ModuleInfo>> {
    let count = count as usize;
    let entry_bytes = count
        .checked_mul(ModuleEntry::SIZE)
        .filter(|&n| n <= data.len())
        .ok_or_else(|| Error::ProtocolError(format!("module entry array of {count} overflows")))?;

    let mut modules = Vec::with_capacity(count);
    for i in 0..count {
        let entry = ModuleEntry::read_from(&data[i * ModuleEntry::SIZE..])
            .ok_or_else(|| Error::ProtocolError("truncated module entry".into()))?;
        let off = entry.name_offset as usize;
        let len = entry.name_length as usize;
        if off < entry_bytes || off.checked_add(len).map_or(true, |end| end > data.len()) {
            return Err(Error::ProtocolError(format!(
                "module name at {off}+{len} outside data region"
            )));
        }
        modules.push(ModuleInfo {
            name: decode_name(&data[off..off + len]),
            base: entry.base,
            size: entry.size,
        });
    }
    Ok(modules)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(modules: &[(&str, u64, u64)]) -> Vec<u8> {
        let entry_bytes = modules.len() * ModuleEntry::SIZE;
        let mut data = vec![0u8; entry_bytes];
        for (i, (name, base, size)) in modules.iter().enumerate() {
            let name_offset = data.len() as u32;
            data.extend_from_slice(name.as_bytes());
            ModuleEntry {
                base: *base,
                size: *size,
                name_offset,
                name_length: name.len() as u32,
            }
            .write_to(&mut data[i * ModuleEntry::SIZE..][..ModuleEntry::SIZE]);
        }
        data
    }

    #[cfg(unix)]
    #[test]
    fn decodes_packed_entries() {
        let data = encode(&[
            ("libc.so.6", 0x7f00_0000_0000, 0x20_0000),
            ("app", 0x5555_0000_0000, 0x8000),
        ]);
        let modules = decode_modules(&data, 2).expect("decode");
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].name, "libc.so.6");
        assert_eq!(modules[1].base, 0x5555_0000_0000);
        assert!(modules[0].contains(0x7f00_0010_0000));
        assert!(!modules[0].contains(0x7f00_0020_0000));
    }

    #[test]
    fn rejects_out_of_bounds_names() {
        let mut data = vec![0u8; ModuleEntry::SIZE];
        ModuleEntry {
            base: 0x1000,
            size: 0x1000,
            name_offset: 1 << 20,
            name_length: 8,
        }
        .write_to(&mut data);
        assert!(matches!(
            decode_modules(&data, 1),
            Err(Error::ProtocolError(_))
        ));
    }

    #[test]
    fn rejects_name_inside_entry_array() {
        // A name offset pointing back into the entries would alias records.
        let mut data = vec![0u8; 2 * ModuleEntry::SIZE];
        ModuleEntry {
            base: 0,
            size: 0,
            name_offset: 0,
            name_length: 4,
        }
        .write_to(&mut data);
        ModuleEntry {
            base: 0,
            size: 0,
            name_offset: ModuleEntry::SIZE as u32,
            name_length: 4,
        }
        .write_to(&mut data[ModuleEntry::SIZE..]);
        assert!(decode_modules(&data, 2).is_err());
    }

    #[test]
    fn rejects_count_overflow() {
        assert!(decode_modules(&[0u8; 48], u32::MAX).is_err());
    }
}
