// SPDX-License-Identifier: GPL-3.0-only

use alloc::vec::Vec;
use uefi::guid::Guid;

use crate::variable::{
    self, header_align, header_at, name_bytes, plain_bytes, start_offset, store_header,
    Attributes, AuthenticatedVariableHeader, StoreStatus, VariableIter, VariableStoreHeader,
    STATE_OFFSET, STORE_HEADER_SIZE, VAR_ADDED, VAR_ADDED_TRANSITION,
};

/// The three places a variable can live, in lookup priority order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreKind {
    Volatile,
    Hob,
    Nv,
}

impl StoreKind {
    pub const SEARCH_ORDER: [StoreKind; 3] = [StoreKind::Volatile, StoreKind::Hob, StoreKind::Nv];

    pub fn is_volatile(self) -> bool {
        self == StoreKind::Volatile
    }

    /// Next store to visit after this one during enumeration.
    pub fn next(self) -> Option<StoreKind> {
        match self {
            StoreKind::Volatile => Some(StoreKind::Hob),
            StoreKind::Hob => Some(StoreKind::Nv),
            StoreKind::Nv => None,
        }
    }
}

/// What to look for in a store.
#[derive(Clone, Copy, Debug)]
pub enum Lookup<'a> {
    /// The first visible record, used to start an enumeration.
    First,
    /// Encoded name, as stored, and vendor GUID.
    Named(&'a [u8], &'a Guid),
}

/// Result of a lookup inside one store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Hit {
    pub curr: usize,
    /// Superseded copy of the same variable still waiting to be retired.
    pub in_deleted: Option<usize>,
}

/// A located variable: which store and where in it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PtrTrack {
    pub store: StoreKind,
    pub curr: usize,
    pub in_deleted: Option<usize>,
}

impl PtrTrack {
    pub fn new(store: StoreKind, hit: Hit) -> Self {
        Self {
            store,
            curr: hit.curr,
            in_deleted: hit.in_deleted,
        }
    }
}

/// A variable store held as a byte arena. Record positions are offsets
/// from the start of the store header.
#[derive(Clone, Debug)]
pub struct VariableStore {
    data: Vec<u8>,
}

impl VariableStore {
    /// Empty formatted store of `size` bytes.
    pub fn formatted(size: usize) -> Self {
        let mut data = vec![0xFF; size];
        let header = VariableStoreHeader::new(size as u32);
        data[..STORE_HEADER_SIZE].copy_from_slice(plain_bytes(&header));
        Self { data }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn header(&self) -> Option<VariableStoreHeader> {
        store_header(&self.data)
    }

    pub fn status(&self) -> StoreStatus {
        self.header().map_or(StoreStatus::Invalid, |h| h.status())
    }

    /// Size recorded in the header, bounded by the arena.
    pub fn size(&self) -> usize {
        self.header()
            .map_or(0, |h| h.size as usize)
            .min(self.data.len())
    }

    pub fn start(&self) -> usize {
        start_offset()
    }

    pub fn end(&self) -> usize {
        header_align(self.size()).min(self.data.len())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn iter(&self) -> VariableIter<'_> {
        VariableIter::new(&self.data, self.start(), self.end())
    }

    pub fn header_at(&self, offset: usize) -> Option<AuthenticatedVariableHeader> {
        header_at(&self.data, offset)
    }

    pub fn state(&self, offset: usize) -> Option<u8> {
        self.data.get(offset + STATE_OFFSET).copied()
    }

    pub fn set_state(&mut self, offset: usize, state: u8) {
        if let Some(byte) = self.data.get_mut(offset + STATE_OFFSET) {
            *byte = state;
        }
    }

    pub fn data(&self, offset: usize) -> &[u8] {
        variable::data_bytes(&self.data, offset)
    }

    pub fn name(&self, offset: usize) -> &[u8] {
        name_bytes(&self.data, offset)
    }

    /// Offset where the scan of valid headers stops.
    pub fn scan_end(&self) -> usize {
        self.iter()
            .last()
            .and_then(|offset| variable::next_offset(&self.data, offset))
            .unwrap_or_else(|| self.start())
    }

    /// Find a live record inside this store.
    ///
    /// Both `VAR_ADDED` and in-deleted-transition records are candidates. A
    /// fully added record wins; the transitional one is only returned when
    /// it is the sole copy. Records without runtime access are invisible at
    /// runtime unless `ignore_rt` is set.
    pub fn find_ex(&self, lookup: Lookup<'_>, ignore_rt: bool, at_runtime: bool) -> Option<Hit> {
        let mut in_deleted = None;

        for offset in self.iter() {
            let header = match self.header_at(offset) {
                Some(some) => some,
                None => break,
            };
            if header.state != VAR_ADDED && header.state != VAR_ADDED_TRANSITION {
                continue;
            }
            let visible = ignore_rt
                || !at_runtime
                || header.attributes().contains(Attributes::RUNTIME_ACCESS);
            if !visible {
                continue;
            }

            let matched = match lookup {
                Lookup::First => true,
                Lookup::Named(name, guid) => header.guid() == *guid && self.name(offset) == name,
            };
            if !matched {
                continue;
            }

            if header.state == VAR_ADDED_TRANSITION {
                in_deleted = Some(offset);
            } else {
                return Some(Hit {
                    curr: offset,
                    in_deleted,
                });
            }
        }

        in_deleted.map(|curr| Hit {
            curr,
            in_deleted: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::GLOBAL_VARIABLE_GUID;
    use crate::variable::{build_record, encode_name, ucs2, VAR_DELETED, VAR_HEADER_VALID_ONLY};

    fn push(
        store: &mut VariableStore,
        offset: &mut usize,
        name: &str,
        state: u8,
        attributes: Attributes,
    ) -> usize {
        let data = [1, 2, 3, 4, 5];
        let mut record =
            build_record(&ucs2(name), &GLOBAL_VARIABLE_GUID, &data, attributes, 0, 0, [0; 16]);
        record[STATE_OFFSET] = state;
        let at = *offset;
        store.bytes_mut()[at..at + record.len()].copy_from_slice(&record);
        *offset += header_align(record.len());
        at
    }

    #[test]
    fn test_prefers_added_over_transition() {
        let mut store = VariableStore::formatted(0x400);
        let mut offset = store.start();
        let old = push(&mut store, &mut offset, "Var", VAR_ADDED_TRANSITION, Attributes::NV_BS_RT);
        let new = push(&mut store, &mut offset, "Var", VAR_ADDED, Attributes::NV_BS_RT);

        let name = encode_name(&ucs2("Var"));
        let hit = store.find_ex(Lookup::Named(&name, &GLOBAL_VARIABLE_GUID), false, false).unwrap();
        assert_eq!(hit, Hit { curr: new, in_deleted: Some(old) });

        store.set_state(new, VAR_ADDED & VAR_DELETED);
        let hit = store.find_ex(Lookup::Named(&name, &GLOBAL_VARIABLE_GUID), false, false).unwrap();
        assert_eq!(hit, Hit { curr: old, in_deleted: None });
    }

    #[test]
    fn test_skips_dead_and_hidden_records() {
        let mut store = VariableStore::formatted(0x400);
        let mut offset = store.start();
        push(&mut store, &mut offset, "Dead", VAR_ADDED & VAR_DELETED, Attributes::NV_BS_RT);
        push(&mut store, &mut offset, "Torn", VAR_HEADER_VALID_ONLY, Attributes::NV_BS_RT);
        let boot_only =
            push(&mut store, &mut offset, "BootOnly", VAR_ADDED, Attributes::BOOTSERVICE_ACCESS);
        let visible = push(&mut store, &mut offset, "Visible", VAR_ADDED, Attributes::BS_RT);

        assert_eq!(store.find_ex(Lookup::First, false, false).unwrap().curr, boot_only);
        assert_eq!(store.find_ex(Lookup::First, false, true).unwrap().curr, visible);
        assert_eq!(store.find_ex(Lookup::First, true, true).unwrap().curr, boot_only);

        let name = encode_name(&ucs2("Dead"));
        assert!(store.find_ex(Lookup::Named(&name, &GLOBAL_VARIABLE_GUID), false, false).is_none());
        assert_eq!(store.scan_end(), offset);
        assert_eq!(store.iter().count(), 4);
        assert_eq!(VAR_DELETED & VAR_ADDED, 0x3D);
    }

    #[test]
    fn test_search_order() {
        assert_eq!(StoreKind::SEARCH_ORDER[0], StoreKind::Volatile);
        assert_eq!(StoreKind::Volatile.next(), Some(StoreKind::Hob));
        assert_eq!(StoreKind::Nv.next(), None);
        assert_eq!(VariableStore::formatted(0x100).scan_end(), 28);
    }
}
