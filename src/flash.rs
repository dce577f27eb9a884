// SPDX-License-Identifier: GPL-3.0-only

//! Block level access to the volume holding the non-volatile store.
//!
//! The engine only ever mutates flash through [`FirmwareVolumeBlock::write`]
//! and [`FaultTolerantWrite::replace`], one call per step of a commit, so
//! the ordering of those calls is what a power failure observes.

use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

use crate::error::{Error, Result};
use crate::volume::BlockMapEntry;

bitflags! {
    /// `EFI_FVB_ATTRIBUTES_2` bits the engine looks at.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct FvbAttributes: u32 {
        const READ_DISABLED_CAP = 0x0000_0001;
        const READ_ENABLED_CAP = 0x0000_0002;
        const READ_STATUS = 0x0000_0004;
        const WRITE_DISABLED_CAP = 0x0000_0008;
        const WRITE_ENABLED_CAP = 0x0000_0010;
        const WRITE_STATUS = 0x0000_0020;
        const LOCK_CAP = 0x0000_0040;
        const LOCK_STATUS = 0x0000_0080;
        const STICKY_WRITE = 0x0000_0200;
        const MEMORY_MAPPED = 0x0000_0400;
        const ERASE_POLARITY = 0x0000_0800;
    }
}

/// Firmware volume block protocol.
pub trait FirmwareVolumeBlock {
    fn block_map(&self) -> Vec<BlockMapEntry>;

    fn attributes(&self) -> FvbAttributes;

    /// Read within a single block.
    fn read(&self, lba: u64, offset: usize, buf: &mut [u8]) -> Result<()>;

    /// Program bytes within a single block. Flash can only clear bits.
    fn write(&mut self, lba: u64, offset: usize, data: &[u8]) -> Result<()>;
}

/// Fault tolerant write protocol.
pub trait FaultTolerantWrite {
    /// Replace `data.len()` bytes at volume offset `offset` as a single
    /// transaction: after power loss either all old or all new bytes remain.
    fn replace(&mut self, offset: usize, data: &[u8]) -> Result<()>;
}

/// Everything the write engine needs from the platform's flash.
pub trait VariableFlash: FirmwareVolumeBlock + FaultTolerantWrite + Send {}

impl<T: FirmwareVolumeBlock + FaultTolerantWrite + Send> VariableFlash for T {}

/// Split the linear range `offset..offset + len` of a volume into
/// `(lba, offset_in_block, start_in_range, len)` pieces along the block map.
pub fn block_spans(
    block_map: &[BlockMapEntry],
    offset: usize,
    len: usize,
) -> Result<Vec<(u64, usize, usize, usize)>> {
    let mut spans = Vec::new();
    let mut linear = 0;
    let mut lba = 0u64;
    let mut curr = offset;
    let end = offset.checked_add(len).ok_or(Error::InvalidParameter)?;

    for entry in block_map {
        for _ in 0..entry.num_blocks {
            let block_len = entry.length as usize;
            if curr < end && curr >= linear && curr < linear + block_len {
                let size = end.min(linear + block_len) - curr;
                spans.push((lba, curr - linear, curr - offset, size));
                curr += size;
            }
            linear += block_len;
            lba += 1;
        }
    }

    if curr < end {
        return Err(Error::InvalidParameter);
    }
    Ok(spans)
}

/// Read a linear range of the volume through `fvb`.
pub fn read_linear<F: FirmwareVolumeBlock + ?Sized>(
    fvb: &F,
    offset: usize,
    buf: &mut [u8],
) -> Result<()> {
    for (lba, block_offset, start, size) in block_spans(&fvb.block_map(), offset, buf.len())? {
        fvb.read(lba, block_offset, &mut buf[start..start + size])?;
    }
    Ok(())
}

/// Program a linear range of the volume through `fvb`, one block at a time.
pub fn write_linear<F: FirmwareVolumeBlock + ?Sized>(
    fvb: &mut F,
    offset: usize,
    data: &[u8],
) -> Result<()> {
    for (lba, block_offset, start, size) in block_spans(&fvb.block_map(), offset, data.len())? {
        fvb.write(lba, block_offset, &data[start..start + size])?;
    }
    Ok(())
}

/// Spare block contents left behind by an interrupted fault tolerant write.
#[derive(Clone, Debug)]
pub struct FtwLastWrite {
    /// Volume offset the interrupted write was targeting.
    pub target_offset: usize,
    pub spare: Vec<u8>,
}

impl FtwLastWrite {
    /// Overlay the spare copy on an image read from flash.
    pub fn apply(&self, image: &mut [u8]) {
        if self.target_offset == 0 {
            log::info!("Variable: NV storage is backed up in spare block");
            let len = image.len().min(self.spare.len());
            image[..len].copy_from_slice(&self.spare[..len]);
        } else if self.target_offset < image.len() {
            log::info!(
                "Variable: high partial NV storage from offset {:#x} is backed up in spare block",
                self.target_offset
            );
            let len = (image.len() - self.target_offset).min(self.spare.len());
            image[self.target_offset..self.target_offset + len].copy_from_slice(&self.spare[..len]);
        }
    }
}

struct MemoryFlashInner {
    data: Vec<u8>,
    block_size: usize,
    write_enabled: bool,
    writes: usize,
    fail_after: Option<usize>,
}

impl MemoryFlashInner {
    fn check_power(&mut self) -> Result<()> {
        if let Some(limit) = self.fail_after {
            if self.writes >= limit {
                return Err(Error::DeviceError);
            }
        }
        self.writes += 1;
        Ok(())
    }

    fn range(&self, lba: u64, offset: usize, len: usize) -> Result<(usize, usize)> {
        if offset + len > self.block_size {
            return Err(Error::InvalidParameter);
        }
        let start = (lba as usize) * self.block_size + offset;
        let end = start + len;
        if end > self.data.len() {
            return Err(Error::InvalidParameter);
        }
        Ok((start, end))
    }
}

/// Volume in RAM with NOR flash semantics.
///
/// Clones share the same contents, so a test can keep a handle after giving
/// one to the engine and inspect what actually reached "flash".
#[derive(Clone)]
pub struct MemoryFlash {
    inner: Arc<Mutex<MemoryFlashInner>>,
}

impl MemoryFlash {
    pub fn new(image: Vec<u8>, block_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryFlashInner {
                data: image,
                block_size,
                write_enabled: true,
                writes: 0,
                fail_after: None,
            })),
        }
    }

    /// Current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().data.clone()
    }

    /// Number of write and replace calls that reached the medium.
    pub fn write_count(&self) -> usize {
        self.inner.lock().writes
    }

    /// Let `writes` more program operations through, then fail every
    /// following one without touching the medium, like a power cut would.
    pub fn arm_power_loss(&self, writes: usize) {
        let mut inner = self.inner.lock();
        inner.fail_after = Some(inner.writes + writes);
    }

    pub fn set_write_enabled(&self, enabled: bool) {
        self.inner.lock().write_enabled = enabled;
    }
}

impl FirmwareVolumeBlock for MemoryFlash {
    fn block_map(&self) -> Vec<BlockMapEntry> {
        let inner = self.inner.lock();
        vec![BlockMapEntry {
            num_blocks: (inner.data.len() / inner.block_size) as u32,
            length: inner.block_size as u32,
        }]
    }

    fn attributes(&self) -> FvbAttributes {
        let mut attributes = FvbAttributes::READ_ENABLED_CAP
            | FvbAttributes::READ_STATUS
            | FvbAttributes::WRITE_ENABLED_CAP
            | FvbAttributes::MEMORY_MAPPED
            | FvbAttributes::ERASE_POLARITY;
        if self.inner.lock().write_enabled {
            attributes |= FvbAttributes::WRITE_STATUS;
        }
        attributes
    }

    fn read(&self, lba: u64, offset: usize, buf: &mut [u8]) -> Result<()> {
        let inner = self.inner.lock();
        let (start, end) = inner.range(lba, offset, buf.len())?;
        buf.copy_from_slice(&inner.data[start..end]);
        Ok(())
    }

    fn write(&mut self, lba: u64, offset: usize, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.write_enabled {
            return Err(Error::WriteProtected);
        }
        let (start, end) = inner.range(lba, offset, data.len())?;
        inner.check_power()?;
        for (dst, src) in inner.data[start..end].iter_mut().zip(data) {
            *dst &= *src;
        }
        Ok(())
    }
}

impl FaultTolerantWrite for MemoryFlash {
    fn replace(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.write_enabled {
            return Err(Error::WriteProtected);
        }
        let end = offset.checked_add(data.len()).ok_or(Error::InvalidParameter)?;
        if end > inner.data.len() {
            return Err(Error::InvalidParameter);
        }
        inner.check_power()?;
        inner.data[offset..end].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_spans() {
        let map = [
            BlockMapEntry { num_blocks: 2, length: 0x100 },
            BlockMapEntry { num_blocks: 1, length: 0x200 },
        ];
        assert_eq!(block_spans(&map, 0x10, 0x20).unwrap(), vec![(0, 0x10, 0, 0x20)]);
        assert_eq!(
            block_spans(&map, 0xF0, 0x120).unwrap(),
            vec![(0, 0xF0, 0, 0x10), (1, 0, 0x10, 0x100), (2, 0, 0x110, 0x10)]
        );
        assert_eq!(block_spans(&map, 0x3F0, 0x20).unwrap_err(), Error::InvalidParameter);
    }

    #[test]
    fn test_nor_semantics() {
        let mut flash = MemoryFlash::new(vec![0xFF; 0x400], 0x100);
        write_linear(&mut flash, 0xFE, &[0x0F, 0xF0, 0x33]).unwrap();
        write_linear(&mut flash, 0xFE, &[0xFF, 0x0F, 0xFF]).unwrap();

        let mut buf = [0; 3];
        read_linear(&flash, 0xFE, &mut buf).unwrap();
        assert_eq!(buf, [0x0F, 0x00, 0x33]);

        flash.replace(0xFE, &[0xAA, 0xBB]).unwrap();
        read_linear(&flash, 0xFE, &mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0xBB, 0x33]);
    }

    #[test]
    fn test_power_loss() {
        let mut flash = MemoryFlash::new(vec![0xFF; 0x200], 0x100);
        let handle = flash.clone();
        handle.arm_power_loss(1);

        flash.write(0, 0, &[0]).unwrap();
        assert_eq!(flash.write(0, 1, &[0]).unwrap_err(), Error::DeviceError);
        assert_eq!(flash.replace(0, &[1, 2]).unwrap_err(), Error::DeviceError);
        assert_eq!(&handle.snapshot()[..3], &[0, 0xFF, 0xFF]);
        assert_eq!(handle.write_count(), 1);
    }

    #[test]
    fn test_ftw_last_write() {
        let mut image = vec![0u8; 8];
        FtwLastWrite { target_offset: 4, spare: vec![9; 8] }.apply(&mut image);
        assert_eq!(image, [0, 0, 0, 0, 9, 9, 9, 9]);

        FtwLastWrite { target_offset: 0, spare: vec![7; 2] }.apply(&mut image);
        assert_eq!(image, [7, 7, 0, 0, 9, 9, 9, 9]);
    }
}
