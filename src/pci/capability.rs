use tracing::{debug, trace};

use crate::pci::PciError;

// Minimum size of a configuration space read that
// contains the whole standard capability area
pub const PCI_CONFIG_SPACE_MIN_LEN: usize = 256;

// Status register byte and its "capability list" bit
pub const PCI_STATUS_BYTE: usize = 0x06;
pub const PCI_STATUS_CAPABILITY_LIST: u8 = 0x10;

// Offset of the pointer to the first capability record
pub const PCI_CAPABILITY_LIST: usize = 0x34;

// Field offsets inside a capability record
pub const PCI_CAPABILITY_LIST_ID: usize = 0;
pub const PCI_CAPABILITY_LIST_NEXT: usize = 1;
pub const PCI_CAPABILITY_LENGTH: usize = 2;

pub const PCI_CAPABILITY_ID_VENDOR: u8 = 0x09;

// An id of 0xff means the chain is broken (usually a read of
// a register space the device does not back)
const PCI_CAPABILITY_ID_BROKEN: u8 = 0xff;

// Byte readers over a configuration space buffer.
// All values are little-endian and the caller must make
// sure that `offset + width <= buffer.len()`.

pub fn read_u8(buffer: &[u8], offset: usize) -> u8 {
    buffer[offset]
}

pub fn read_u16(buffer: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buffer[offset], buffer[offset + 1]])
}

pub fn read_u32(buffer: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buffer[offset],
        buffer[offset + 1],
        buffer[offset + 2],
        buffer[offset + 3],
    ])
}

/// A capability record of the standard PCI capability list.
///
/// `data` spans the whole record, header included, so `data[0]` is the
/// capability id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityRecord<'a> {
    pub offset: u8,
    pub id: u8,
    pub length: u8,
    pub data: &'a [u8],
}

/// Walk the standard capability list of a configuration space and return
/// the first vendor specific capability.
///
/// Devices without a capability list, chains that loop and chains that
/// are broken all yield `Ok(None)`. A record whose declared length does
/// not fit in the buffer is reported as corrupt.
pub fn find_vendor_capability(
    config: &[u8],
) -> Result<Option<CapabilityRecord<'_>>, PciError> {
    if config.len() < PCI_CONFIG_SPACE_MIN_LEN {
        return Err(PciError::ConfigTooShort { len: config.len() });
    }

    let status = read_u8(config, PCI_STATUS_BYTE);
    if status & PCI_STATUS_CAPABILITY_LIST == 0 {
        debug!("Capability list is not supported by the device");
        return Ok(None);
    }

    // Offsets are a single byte so a flat table covers all of them
    let mut visited = [false; 256];
    let mut pos = read_u8(config, PCI_CAPABILITY_LIST);

    while pos != 0 {
        let offset = pos as usize;

        if visited[offset] {
            debug!("Capability chain looped at {pos:#04x}, exiting");
            return Ok(None);
        }
        visited[offset] = true;

        // The id, next and length fields must be readable
        if offset + PCI_CAPABILITY_LENGTH >= config.len() {
            return Err(PciError::CorruptCapabilityRecord {
                offset: pos,
                length: 0,
            });
        }

        let id = read_u8(config, offset + PCI_CAPABILITY_LIST_ID);
        let next = read_u8(config, offset + PCI_CAPABILITY_LIST_NEXT);
        let length = read_u8(config, offset + PCI_CAPABILITY_LENGTH);

        trace!("Capability at {pos:#04x}: id {id:#04x}, next {next:#04x}, length {length}");

        if id == PCI_CAPABILITY_ID_BROKEN {
            debug!("Capability chain broken at {pos:#04x}, exiting");
            return Ok(None);
        }

        if id == PCI_CAPABILITY_ID_VENDOR {
            let end = offset + length as usize;
            if end > config.len() {
                return Err(PciError::CorruptCapabilityRecord {
                    offset: pos,
                    length,
                });
            }

            return Ok(Some(CapabilityRecord {
                offset: pos,
                id,
                length,
                data: &config[offset..end],
            }));
        }

        pos = next;
    }

    Ok(None)
}
