// SPDX-License-Identifier: GPL-3.0-only

use alloc::vec::Vec;
use core::mem;
use plain::Plain;
use uefi::guid::Guid;

use crate::error::{Error, Result};
use crate::guid::SYSTEM_NV_DATA_FV_GUID;
use crate::variable::{plain_bytes, read_plain, VariableStoreHeader, STORE_HEADER_SIZE};

pub const FVH_SIGNATURE: &[u8; 4] = b"_FVH";
pub const FVH_REVISION: u8 = 0x02;

/// Attributes written into freshly formatted volumes: read/write enabled
/// and status, erase polarity 1, 8 byte alignment.
pub const FVH_DEFAULT_ATTRIBUTES: u32 = 0x0004_FEFF;

const BLOCK_MAP_OFFSET: usize = 0x38;

// EFI_FIRMWARE_VOLUME_HEADER with a single block map entry and its terminator
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct FirmwareVolumeHeader {
    pub zero_vector: [u8; 16],
    pub guid: Guid,
    pub volume_length: u64,
    pub signature: [u8; 4],
    pub attributes: u32,
    pub header_length: u16,
    pub checksum: u16,
    pub ext_header_offset: u16,
    pub reserved: u8,
    pub revision: u8,
    pub block_map: [(u32, u32); 2],
}

unsafe impl Plain for FirmwareVolumeHeader {}

pub const FV_HEADER_SIZE: usize = mem::size_of::<FirmwareVolumeHeader>();

/// One run of equally sized blocks, `(count, length)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockMapEntry {
    pub num_blocks: u32,
    pub length: u32,
}

impl FirmwareVolumeHeader {
    pub fn is_valid(&self) -> bool {
        self.zero_vector.iter().all(|&x| x == 0)
            && self.guid == SYSTEM_NV_DATA_FV_GUID
            && self.signature == *FVH_SIGNATURE
            && self.revision == FVH_REVISION
    }

    pub fn header_length(&self) -> usize {
        self.header_length as usize
    }
}

/// Sum of the little endian words of a header, zero for a valid header.
pub fn checksum16(bytes: &[u8]) -> u16 {
    bytes
        .chunks(2)
        .map(|c| u16::from_le_bytes([c[0], *c.get(1).unwrap_or(&0)]))
        .fold(0u16, |sum, w| sum.wrapping_add(w))
}

/// A parsed volume header along with its full block map.
#[derive(Clone, Debug)]
pub struct FirmwareVolume {
    pub header: FirmwareVolumeHeader,
    pub block_map: Vec<BlockMapEntry>,
}

impl FirmwareVolume {
    /// Parse and validate the volume header at the start of an image.
    pub fn parse(image: &[u8]) -> Result<Self> {
        let header: FirmwareVolumeHeader = read_plain(image).ok_or(Error::VolumeCorrupted)?;
        if !header.is_valid() {
            return Err(Error::VolumeCorrupted);
        }

        let header_length = header.header_length();
        if header_length < BLOCK_MAP_OFFSET || header_length > image.len() {
            return Err(Error::VolumeCorrupted);
        }

        let mut block_map = Vec::new();
        let mut offset = BLOCK_MAP_OFFSET;
        while offset + 8 <= header_length {
            let num_blocks = u32::from_le_bytes([
                image[offset],
                image[offset + 1],
                image[offset + 2],
                image[offset + 3],
            ]);
            let length = u32::from_le_bytes([
                image[offset + 4],
                image[offset + 5],
                image[offset + 6],
                image[offset + 7],
            ]);
            if num_blocks == 0 && length == 0 {
                break;
            }
            block_map.push(BlockMapEntry { num_blocks, length });
            offset += 8;
        }

        Ok(Self { header, block_map })
    }

    pub fn checksum_ok(&self, image: &[u8]) -> bool {
        image
            .get(..self.header.header_length())
            .map_or(false, |h| checksum16(h) == 0)
    }

    pub fn length(&self) -> usize {
        self.header.volume_length as usize
    }
}

/// Lay out an erased image of `size` bytes holding a formatted, empty
/// variable store behind a volume header with `block_size` blocks.
pub fn format_volume(size: usize, block_size: usize) -> Result<Vec<u8>> {
    if block_size == 0 || size % block_size != 0 || size <= FV_HEADER_SIZE + STORE_HEADER_SIZE {
        return Err(Error::InvalidParameter);
    }

    let mut header = FirmwareVolumeHeader {
        zero_vector: [0; 16],
        guid: SYSTEM_NV_DATA_FV_GUID,
        volume_length: size as u64,
        signature: *FVH_SIGNATURE,
        attributes: FVH_DEFAULT_ATTRIBUTES,
        header_length: FV_HEADER_SIZE as u16,
        checksum: 0,
        ext_header_offset: 0,
        reserved: 0,
        revision: FVH_REVISION,
        block_map: [((size / block_size) as u32, block_size as u32), (0, 0)],
    };
    header.checksum = 0u16.wrapping_sub(checksum16(plain_bytes(&header)));

    let store = VariableStoreHeader::new((size - FV_HEADER_SIZE) as u32);

    let mut image = vec![0xFF; size];
    image[..FV_HEADER_SIZE].copy_from_slice(plain_bytes(&header));
    image[FV_HEADER_SIZE..FV_HEADER_SIZE + STORE_HEADER_SIZE].copy_from_slice(plain_bytes(&store));
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::{store_header, StoreStatus};

    #[test]
    fn test_header_size() {
        assert_eq!(FV_HEADER_SIZE, 0x48);
    }

    #[test]
    fn test_format_volume() {
        let image = format_volume(0x10000, 0x1000).unwrap();
        let fv = FirmwareVolume::parse(&image).unwrap();
        assert!(fv.checksum_ok(&image));
        assert_eq!(fv.length(), 0x10000);
        assert_eq!(fv.block_map, vec![BlockMapEntry { num_blocks: 16, length: 0x1000 }]);

        let store = store_header(&image[fv.header.header_length()..]).unwrap();
        assert_eq!(store.status(), StoreStatus::Valid);
        assert_eq!(store.size as usize, 0x10000 - 0x48);
        assert!(image[0x48 + 28..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_corrupted_volume() {
        let mut image = format_volume(0x4000, 0x1000).unwrap();
        image[0x28] = b'X';
        assert_eq!(FirmwareVolume::parse(&image).unwrap_err(), Error::VolumeCorrupted);

        let mut image = format_volume(0x4000, 0x1000).unwrap();
        image[0x37] = 0x01;
        assert_eq!(FirmwareVolume::parse(&image).unwrap_err(), Error::VolumeCorrupted);

        let mut image = format_volume(0x4000, 0x1000).unwrap();
        image[0] = 0x01;
        assert_eq!(FirmwareVolume::parse(&image).unwrap_err(), Error::VolumeCorrupted);

        assert!(format_volume(0x4000, 0x3000).is_err());
        assert_eq!(FirmwareVolume::parse(&[0; 8]).unwrap_err(), Error::VolumeCorrupted);
    }
}
