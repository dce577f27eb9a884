// SPDX-License-Identifier: GPL-3.0-only

//! On-flash layout of authenticated variable stores and the records inside
//! them. Everything in here is a pure function over byte slices.

use alloc::vec::Vec;
use bitflags::bitflags;
use core::{mem, ptr};
use plain::Plain;
use uefi::guid::Guid;

use crate::guid::{self, AUTHENTICATED_VARIABLE_GUID};

pub const VARIABLE_STORE_FORMATTED: u8 = 0x5A;
pub const VARIABLE_STORE_HEALTHY: u8 = 0xFE;

// VARIABLE_STORE_HEADER
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct VariableStoreHeader {
    pub signature: Guid,
    pub size: u32,
    pub format: u8,
    pub state: u8,
    pub reserved: u16,
    pub reserved1: u32,
}

unsafe impl Plain for VariableStoreHeader {}

/// Health of a store header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreStatus {
    Valid,
    /// Erased flash, nothing was ever formatted here.
    Raw,
    Invalid,
}

impl VariableStoreHeader {
    pub fn new(size: u32) -> Self {
        Self {
            signature: AUTHENTICATED_VARIABLE_GUID,
            size,
            format: VARIABLE_STORE_FORMATTED,
            state: VARIABLE_STORE_HEALTHY,
            reserved: 0,
            reserved1: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status() == StoreStatus::Valid
    }

    pub fn status(&self) -> StoreStatus {
        if self.signature == AUTHENTICATED_VARIABLE_GUID
            && self.format == VARIABLE_STORE_FORMATTED
            && self.state == VARIABLE_STORE_HEALTHY
        {
            StoreStatus::Valid
        } else if guid::guid_to_bytes(&self.signature).iter().all(|&b| b == 0xFF)
            && self.size == 0xFFFF_FFFF
            && self.format == 0xFF
            && self.state == 0xFF
        {
            StoreStatus::Raw
        } else {
            StoreStatus::Invalid
        }
    }
}

pub const VARIABLE_START_ID: u16 = 0x55AA;

// Record states. Each transition only clears bits so it can be programmed in
// place without an erase.
pub const VAR_IN_DELETED_TRANSITION: u8 = 0xFE;
pub const VAR_DELETED: u8 = 0xFD;
pub const VAR_HEADER_VALID_ONLY: u8 = 0x7F;
pub const VAR_ADDED: u8 = 0x3F;
pub const VAR_ADDED_TRANSITION: u8 = VAR_ADDED & VAR_IN_DELETED_TRANSITION;

// AUTHENTICATED_VARIABLE_HEADER
#[derive(Copy, Clone, Debug)]
#[repr(C, packed)]
pub struct AuthenticatedVariableHeader {
    pub start_id: u16,
    pub state: u8,
    pub reserved: u8,
    pub attributes: u32,
    pub monotonic_count: u64,
    pub timestamp: [u8; 16],
    pub pubkey_index: u32,
    pub name_size: u32,
    pub data_size: u32,
    pub vendor_guid: Guid,
}

unsafe impl Plain for AuthenticatedVariableHeader {}

pub const STORE_HEADER_SIZE: usize = mem::size_of::<VariableStoreHeader>();
pub const VARIABLE_HEADER_SIZE: usize = mem::size_of::<AuthenticatedVariableHeader>();
pub const STATE_OFFSET: usize = 2;
pub const HEADER_ALIGNMENT: usize = 4;

bitflags! {
    /// `EFI_VARIABLE_*` attribute bits.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Attributes: u32 {
        const NON_VOLATILE = 0x01;
        const BOOTSERVICE_ACCESS = 0x02;
        const RUNTIME_ACCESS = 0x04;
        const HARDWARE_ERROR_RECORD = 0x08;
        const AUTHENTICATED_WRITE_ACCESS = 0x10;
        const TIME_BASED_AUTHENTICATED_WRITE_ACCESS = 0x20;
        /// Only meaningful on a write, never stored.
        const APPEND_WRITE = 0x40;
    }
}

impl Attributes {
    pub const BS_RT: Self = Self::BOOTSERVICE_ACCESS.union(Self::RUNTIME_ACCESS);
    pub const NV_BS_RT: Self = Self::NON_VOLATILE.union(Self::BS_RT);
    pub const NV_BS_RT_AT: Self =
        Self::NV_BS_RT.union(Self::TIME_BASED_AUTHENTICATED_WRITE_ACCESS);

    pub fn is_hw_err(self) -> bool {
        self.contains(Self::HARDWARE_ERROR_RECORD)
    }

    /// Neither boot service nor runtime access, which turns a write into a delete.
    pub fn has_no_access(self) -> bool {
        !self.intersects(Self::BS_RT)
    }
}

/// Round up to the record alignment.
pub const fn header_align(n: usize) -> usize {
    (n + HEADER_ALIGNMENT - 1) & !(HEADER_ALIGNMENT - 1)
}

/// Bytes of padding after a field of `n` bytes.
pub const fn pad_size(n: usize) -> usize {
    header_align(n) - n
}

/// Offset of the first record in a store.
pub const fn start_offset() -> usize {
    header_align(STORE_HEADER_SIZE)
}

/// Copy a plain structure out of a possibly unaligned byte slice.
pub fn read_plain<T: Plain + Copy>(bytes: &[u8]) -> Option<T> {
    if bytes.len() < mem::size_of::<T>() {
        return None;
    }
    // SAFETY: T is Plain so any bit pattern is valid, and the length is checked
    Some(unsafe { ptr::read_unaligned(bytes.as_ptr() as *const T) })
}

/// Raw bytes of a plain structure without padding.
pub fn plain_bytes<T: Plain>(value: &T) -> &[u8] {
    // SAFETY: the on-flash structures are packed or have no implicit padding
    unsafe { plain::as_bytes(value) }
}

/// Read the store header at the start of an arena.
pub fn store_header(store: &[u8]) -> Option<VariableStoreHeader> {
    read_plain(store)
}

/// Read the record header at `offset`.
pub fn header_at(store: &[u8], offset: usize) -> Option<AuthenticatedVariableHeader> {
    read_plain(store.get(offset..)?)
}

impl AuthenticatedVariableHeader {
    pub fn is_valid(&self) -> bool {
        self.start_id == VARIABLE_START_ID
    }

    fn is_erased(&self) -> bool {
        self.state == 0xFF
            || self.data_size == 0xFFFF_FFFF
            || self.name_size == 0xFFFF_FFFF
            || self.attributes == 0xFFFF_FFFF
    }

    /// Name size in bytes, 0 when the header is torn or erased.
    pub fn name_len(&self) -> usize {
        if self.is_erased() {
            0
        } else {
            self.name_size as usize
        }
    }

    /// Data size in bytes, 0 when the header is torn or erased.
    pub fn data_len(&self) -> usize {
        if self.is_erased() {
            0
        } else {
            self.data_size as usize
        }
    }

    pub fn attributes(&self) -> Attributes {
        Attributes::from_bits_retain(self.attributes)
    }

    pub fn guid(&self) -> Guid {
        self.vendor_guid
    }

    /// Live value or a value superseded by a write that did not finish retiring it.
    pub fn is_live(&self) -> bool {
        self.state == VAR_ADDED || self.state == VAR_ADDED_TRANSITION
    }
}

/// True when a record header starts at `offset`.
pub fn is_valid_header(store: &[u8], offset: usize) -> bool {
    header_at(store, offset).map_or(false, |h| h.is_valid())
}

pub fn name_offset(offset: usize) -> usize {
    offset + VARIABLE_HEADER_SIZE
}

pub fn data_offset(header: &AuthenticatedVariableHeader, offset: usize) -> usize {
    let name_len = header.name_len();
    name_offset(offset) + name_len + pad_size(name_len)
}

/// Offset of the record following the one at `offset`, or `None` when
/// `offset` does not hold a valid header.
pub fn next_offset(store: &[u8], offset: usize) -> Option<usize> {
    let header = header_at(store, offset)?;
    if !header.is_valid() {
        return None;
    }
    let data_len = header.data_len();
    Some(header_align(data_offset(&header, offset) + data_len + pad_size(data_len)))
}

pub fn name_bytes(store: &[u8], offset: usize) -> &[u8] {
    match header_at(store, offset) {
        Some(header) => {
            let start = name_offset(offset);
            store.get(start..start + header.name_len()).unwrap_or(&[])
        }
        None => &[],
    }
}

pub fn data_bytes(store: &[u8], offset: usize) -> &[u8] {
    match header_at(store, offset) {
        Some(header) => {
            let start = data_offset(&header, offset);
            store.get(start..start + header.data_len()).unwrap_or(&[])
        }
        None => &[],
    }
}

/// Iterator over the offsets of consecutive valid record headers.
pub struct VariableIter<'a> {
    store: &'a [u8],
    offset: Option<usize>,
    end: usize,
}

impl<'a> VariableIter<'a> {
    pub fn new(store: &'a [u8], start: usize, end: usize) -> Self {
        Self {
            store,
            offset: Some(start),
            end: end.min(store.len()),
        }
    }
}

impl Iterator for VariableIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.offset?;
        // No more entries
        if offset >= self.end || !is_valid_header(self.store, offset) {
            self.offset = None;
            return None;
        }
        self.offset = next_offset(self.store, offset);
        Some(offset)
    }
}

/// Cut a UCS-2 name at its first NUL.
pub fn trim_name(name: &[u16]) -> &[u16] {
    match name.iter().position(|&c| c == 0) {
        Some(end) => &name[..end],
        None => name,
    }
}

/// Size of a name in bytes including the terminating NUL.
pub fn name_size(name: &[u16]) -> usize {
    (trim_name(name).len() + 1) * 2
}

/// Encode a name the way it is stored, little endian with a NUL.
pub fn encode_name(name: &[u16]) -> Vec<u8> {
    let name = trim_name(name);
    let mut bytes = Vec::with_capacity((name.len() + 1) * 2);
    for c in name {
        bytes.extend_from_slice(&c.to_le_bytes());
    }
    bytes.extend_from_slice(&[0, 0]);
    bytes
}

/// Decode a stored name up to, not including, its NUL.
pub fn decode_name(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&c| c != 0)
        .collect()
}

pub fn ucs2(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

/// Compare a UCS-2 name with an ASCII literal.
pub fn name_eq(name: &[u16], s: &str) -> bool {
    trim_name(name).iter().copied().eq(s.encode_utf16())
}

/// True when the record at `offset` has the identity (`name`, `guid`).
pub fn matches(store: &[u8], offset: usize, name: &[u16], guid: &Guid) -> bool {
    match header_at(store, offset) {
        Some(header) => {
            header.guid() == *guid && name_bytes(store, offset) == encode_name(name).as_slice()
        }
        None => false,
    }
}

/// True when two records in possibly different arenas share an identity.
pub fn same_identity(a: &[u8], a_offset: usize, b: &[u8], b_offset: usize) -> bool {
    match (header_at(a, a_offset), header_at(b, b_offset)) {
        (Some(ha), Some(hb)) => {
            ha.guid() == hb.guid()
                && ha.name_len() == hb.name_len()
                && name_bytes(a, a_offset) == name_bytes(b, b_offset)
        }
        _ => false,
    }
}

/// Serialize a complete record whose state is still erased.
///
/// The state byte is left at 0xFF so a non-volatile commit can program it
/// separately.
pub fn build_record(
    name: &[u16],
    guid: &Guid,
    data: &[u8],
    attributes: Attributes,
    pubkey_index: u32,
    monotonic_count: u64,
    timestamp: [u8; 16],
) -> Vec<u8> {
    let name = encode_name(name);
    let header = AuthenticatedVariableHeader {
        start_id: VARIABLE_START_ID,
        state: 0xFF,
        reserved: 0,
        attributes: (attributes - Attributes::APPEND_WRITE).bits(),
        monotonic_count,
        timestamp,
        pubkey_index,
        name_size: name.len() as u32,
        data_size: data.len() as u32,
        vendor_guid: *guid,
    };

    let mut raw = Vec::with_capacity(record_size(name.len(), data.len()));
    raw.extend_from_slice(plain_bytes(&header));
    raw.extend_from_slice(&name);
    raw.resize(raw.len() + pad_size(name.len()), 0xFF);
    raw.extend_from_slice(data);
    raw.resize(raw.len() + pad_size(data.len()), 0xFF);
    raw
}

/// Space a record with the given name and data sizes occupies.
pub fn record_size(name_len: usize, data_len: usize) -> usize {
    VARIABLE_HEADER_SIZE + name_len + pad_size(name_len) + data_len + pad_size(data_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::GLOBAL_VARIABLE_GUID;

    fn store_with(records: &[Vec<u8>]) -> Vec<u8> {
        let mut store = vec![0xFF; 512];
        let header = VariableStoreHeader::new(512);
        store[..STORE_HEADER_SIZE].copy_from_slice(plain_bytes(&header));
        let mut offset = start_offset();
        for record in records {
            store[offset..offset + record.len()].copy_from_slice(record);
            offset += header_align(record.len());
        }
        store
    }

    #[test]
    fn test_header_sizes() {
        assert_eq!(STORE_HEADER_SIZE, 28);
        assert_eq!(VARIABLE_HEADER_SIZE, 60);
        assert_eq!(start_offset(), 28);
        assert_eq!(pad_size(14), 2);
        assert_eq!(pad_size(16), 0);
    }

    #[test]
    fn test_store_status() {
        let header = VariableStoreHeader::new(0x1000);
        assert_eq!(header.status(), StoreStatus::Valid);

        let raw: VariableStoreHeader = read_plain(&[0xFF; 28]).unwrap();
        assert_eq!(raw.status(), StoreStatus::Raw);

        let mut bad = header;
        bad.state = 0xFC;
        assert_eq!(bad.status(), StoreStatus::Invalid);
    }

    #[test]
    fn test_record_layout() {
        let mut record = build_record(
            &ucs2("Boot"),
            &GLOBAL_VARIABLE_GUID,
            &[1, 2, 3],
            Attributes::NV_BS_RT | Attributes::APPEND_WRITE,
            0,
            0,
            [0; 16],
        );
        // header + "Boot\0" (10 bytes + 2 pad) + 3 data bytes + 1 pad
        assert_eq!(record.len(), 60 + 12 + 4);
        record[STATE_OFFSET] = VAR_ADDED;

        let store = store_with(&[record]);
        let offset = start_offset();
        let header = header_at(&store, offset).unwrap();
        assert!(header.is_valid());
        assert_eq!(header.attributes(), Attributes::NV_BS_RT);
        assert_eq!(name_bytes(&store, offset), encode_name(&ucs2("Boot")).as_slice());
        assert_eq!(data_bytes(&store, offset), &[1, 2, 3]);
        assert_eq!(next_offset(&store, offset), Some(offset + 76));
        assert!(matches(&store, offset, &ucs2("Boot"), &GLOBAL_VARIABLE_GUID));
        assert!(!matches(&store, offset, &ucs2("Boot0"), &GLOBAL_VARIABLE_GUID));
    }

    #[test]
    fn test_iterator_stops_at_erased() {
        let guid = GLOBAL_VARIABLE_GUID;
        let mut a = build_record(&ucs2("A"), &guid, &[0; 8], Attributes::BS_RT, 0, 0, [0; 16]);
        let mut b = build_record(&ucs2("B"), &guid, &[0; 5], Attributes::BS_RT, 0, 0, [0; 16]);
        a[STATE_OFFSET] = VAR_ADDED;
        b[STATE_OFFSET] = VAR_DELETED;
        let store = store_with(&[a, b]);

        let offsets: Vec<usize> = VariableIter::new(&store, start_offset(), store.len()).collect();
        assert_eq!(offsets.len(), 2);
        assert!(header_at(&store, offsets[0]).unwrap().is_live());
        assert!(!header_at(&store, offsets[1]).unwrap().is_live());
    }

    #[test]
    fn test_torn_header_sizes() {
        // Header programmed but state never written
        let guid = GLOBAL_VARIABLE_GUID;
        let record =
            build_record(&ucs2("Torn"), &guid, &[7; 32], Attributes::NV_BS_RT, 0, 0, [0; 16]);
        let mut store = store_with(&[]);
        let offset = start_offset();
        let programmed = &record[..VARIABLE_HEADER_SIZE];
        store[offset..offset + VARIABLE_HEADER_SIZE].copy_from_slice(programmed);

        let header = header_at(&store, offset).unwrap();
        assert_eq!(header.name_len(), 0);
        assert_eq!(header.data_len(), 0);
        assert_eq!(next_offset(&store, offset), Some(offset + VARIABLE_HEADER_SIZE));
        let offsets: Vec<usize> = VariableIter::new(&store, offset, store.len()).collect();
        assert_eq!(offsets, vec![offset]);
    }

    #[test]
    fn test_names() {
        let name = [0x41, 0x42, 0, 0x43];
        assert_eq!(trim_name(&name), &[0x41, 0x42]);
        assert_eq!(name_size(&name), 6);
        assert_eq!(encode_name(&name), vec![0x41, 0, 0x42, 0, 0, 0]);
        assert_eq!(decode_name(&[0x41, 0, 0x42, 0, 0, 0]), vec![0x41, 0x42]);
        assert!(name_eq(&ucs2("PK"), "PK"));
        assert!(!name_eq(&ucs2("PK"), "PKDefault"));
    }
}
