// SPDX-License-Identifier: GPL-3.0-only

use alloc::vec::Vec;

use crate::auth::PubKeyStore;
use crate::engine::{nv_usage, VariableStoreEngine};
use crate::error::{Error, Result};
use crate::flash::read_linear;
use crate::guid::AUTHENTICATED_VARIABLE_GUID;
use crate::policy::PUB_KEY_DB_NAME;
use crate::store::{PtrTrack, StoreKind, VariableStore};
use crate::variable::{
    build_record, decode_name, matches, next_offset, same_identity, ucs2, Attributes,
    STATE_OFFSET, STORE_HEADER_SIZE, VAR_ADDED, VAR_ADDED_TRANSITION,
};

// Offset of PubKeyIndex inside a record header
const PUBKEY_INDEX_OFFSET: usize = 32;

/// A store rebuilt with only its live records.
struct Compacted {
    buffer: Vec<u8>,
    common: usize,
    hw_err: usize,
    updating: Option<PtrTrack>,
}

impl Compacted {
    fn new(store: &VariableStore, capacity: usize) -> Self {
        let mut buffer = Vec::with_capacity(capacity);
        buffer.extend_from_slice(&store.bytes()[..STORE_HEADER_SIZE]);
        buffer.resize(store.start(), 0xFF);
        Self {
            buffer,
            common: 0,
            hw_err: 0,
            updating: None,
        }
    }

    /// Append a record, returning where it landed.
    fn push(&mut self, record: &[u8], attributes: Attributes) -> usize {
        let at = self.buffer.len();
        self.buffer.extend_from_slice(record);
        if attributes.is_hw_err() {
            self.hw_err += record.len();
        } else {
            self.common += record.len();
        }
        at
    }

    /// Offsets of the records copied so far.
    fn records(&self) -> Vec<usize> {
        let mut offsets = Vec::new();
        let mut offset = STORE_HEADER_SIZE;
        while offset < self.buffer.len() {
            offsets.push(offset);
            match next_offset(&self.buffer, offset) {
                Some(next) if next > offset => offset = next,
                _ => break,
            }
        }
        offsets
    }
}

/// Bytes of the record at `offset`, padding included.
fn record_bytes(store: &VariableStore, offset: usize) -> &[u8] {
    next_offset(store.bytes(), offset)
        .and_then(|next| store.bytes().get(offset..next))
        .unwrap_or(&[])
}

impl VariableStoreEngine {
    /// Compact a store down to its live records.
    ///
    /// `updating` is a record the caller is about to replace; it is moved
    /// behind every other live record and its new position returned. With
    /// `pub_key` set the public key database is trimmed to the keys still
    /// referenced and key indices are renumbered. Nothing happens unless a
    /// dead record exists or `anyway` is set.
    pub(crate) fn reclaim(
        &mut self,
        kind: StoreKind,
        updating: Option<PtrTrack>,
        pub_key: bool,
        anyway: bool,
    ) -> Result<Option<PtrTrack>> {
        if pub_key && updating.is_some() {
            return Err(Error::InvalidParameter);
        }
        if kind == StoreKind::Hob {
            return Err(Error::InvalidParameter);
        }

        let (compacted, new_keys) = {
            let store = self.store(kind).ok_or(Error::NotFound)?;

            let mut live_size = STORE_HEADER_SIZE;
            let mut dead = false;
            for offset in store.iter() {
                match store.header_at(offset) {
                    Some(header) if header.is_live() => {
                        live_size += record_bytes(store, offset).len()
                    }
                    _ => dead = true,
                }
            }
            if !anyway && !dead {
                log::info!("Variable: no dead variable found, nothing to reclaim");
                return Ok(updating);
            }

            if pub_key {
                let (compacted, keys) = self.compact_pub_keys(store, live_size + 1)?;
                (compacted, Some(keys))
            } else {
                (Self::compact(store, updating, live_size + 1), None)
            }
        };

        let Compacted {
            mut buffer,
            common,
            hw_err,
            updating,
        } = compacted;
        let used = buffer.len();

        match kind {
            StoreKind::Volatile => {
                let arena = self.volatile.bytes_mut();
                arena.fill(0xFF);
                let len = used.min(arena.len());
                arena[..len].copy_from_slice(&buffer[..len]);
                self.volatile_last_offset = used;
            }
            _ => {
                let size = self.nv.size();
                buffer.resize(size, 0xFF);
                let flash = self.flash.as_mut().ok_or(Error::NotAvailableYet)?;
                let result = flash.replace(self.nv_base, &buffer[..size]);
                read_linear(&**flash, self.nv_base, self.nv.bytes_mut())?;

                if let Err(err) = result {
                    log::error!(
                        "Variable: fault tolerant write of reclaimed store failed: {}",
                        err
                    );
                    let (common, hw_err) = nv_usage(&self.nv);
                    self.common_total = common;
                    self.hw_err_total = hw_err;
                    self.nv_last_offset = self.nv.scan_end();
                    return Err(err);
                }
                self.nv_last_offset = used;
                self.common_total = common;
                self.hw_err_total = hw_err;
            }
        }

        if let Some(keys) = new_keys {
            self.pub_keys = keys;
        }
        log::info!(
            "Variable: reclaimed {:?} store, {:#x} bytes in use",
            kind,
            used
        );
        Ok(updating)
    }

    /// Copy live records in the order lookups expect them.
    fn compact(store: &VariableStore, updating: Option<PtrTrack>, capacity: usize) -> Compacted {
        let mut out = Compacted::new(store, capacity);
        let updating_at = updating.map(|t| t.curr);

        for offset in store.iter() {
            let header = match store.header_at(offset) {
                Some(some) => some,
                None => break,
            };
            if header.state != VAR_ADDED {
                continue;
            }
            if let Some(at) = updating_at {
                if at == offset || same_identity(store.bytes(), offset, store.bytes(), at) {
                    continue;
                }
            }
            out.push(record_bytes(store, offset), header.attributes());
        }

        if let Some(at) = updating_at {
            if let Some(header) = store.header_at(at) {
                let new_at = out.push(record_bytes(store, at), header.attributes());
                out.updating = Some(PtrTrack {
                    store: updating.map_or(StoreKind::Nv, |t| t.store),
                    curr: new_at,
                    in_deleted: None,
                });
            }
        }

        for offset in store.iter() {
            let header = match store.header_at(offset) {
                Some(some) => some,
                None => break,
            };
            if Some(offset) == updating_at || header.state != VAR_ADDED_TRANSITION {
                continue;
            }
            let superseded = out
                .records()
                .into_iter()
                .any(|added| same_identity(&out.buffer, added, store.bytes(), offset));
            if superseded {
                continue;
            }

            log::debug!(
                "Variable: promote interrupted update at {:#x}",
                offset
            );
            let at = out.push(record_bytes(store, offset), header.attributes());
            out.buffer[at + STATE_OFFSET] = VAR_ADDED;
        }

        out
    }

    /// Copy live records with key indices renumbered, then a rebuilt key
    /// database at the end.
    fn compact_pub_keys(
        &self,
        store: &VariableStore,
        capacity: usize,
    ) -> Result<(Compacted, PubKeyStore)> {
        let keydb_name = ucs2(PUB_KEY_DB_NAME);
        let is_keydb = |offset: usize| {
            matches(store.bytes(), offset, &keydb_name, &AUTHENTICATED_VARIABLE_GUID)
        };

        let mut referenced = Vec::new();
        for offset in store.iter() {
            if let Some(header) = store.header_at(offset) {
                if header.is_live() && !is_keydb(offset) && header.pubkey_index != 0 {
                    referenced.push(header.pubkey_index);
                }
            }
        }
        let (keys, remap) = self.pub_keys.filter(&referenced);
        if keys.count() == self.pub_keys.count() {
            return Err(Error::OutOfResources);
        }

        let mut out = Compacted::new(store, capacity);
        let mut keydb = None;
        for offset in store.iter() {
            let header = match store.header_at(offset) {
                Some(some) => some,
                None => break,
            };
            if !header.is_live() {
                continue;
            }
            if is_keydb(offset) {
                keydb = Some(header);
                continue;
            }

            let at = out.push(record_bytes(store, offset), header.attributes());
            let index = remap.get(header.pubkey_index as usize).copied().unwrap_or(0);
            let field = at + PUBKEY_INDEX_OFFSET;
            out.buffer[field..field + 4].copy_from_slice(&index.to_le_bytes());
        }

        let header = keydb.ok_or(Error::DeviceError)?;
        let offset = store
            .iter()
            .find(|&offset| is_keydb(offset))
            .ok_or(Error::DeviceError)?;
        let mut record = build_record(
            &decode_name(store.name(offset)),
            &header.guid(),
            &keys.database_bytes(),
            header.attributes(),
            header.pubkey_index,
            header.monotonic_count,
            header.timestamp,
        );
        record[STATE_OFFSET] = VAR_ADDED;
        out.push(&record, header.attributes());

        log::debug!(
            "Variable: public key database trimmed from {} to {} keys",
            self.pub_keys.count(),
            keys.count()
        );
        Ok((out, keys))
    }

    /// Reclaim the non-volatile store before the OS takes over if either
    /// quota is running low.
    pub fn reclaim_for_os(&mut self) {
        let hw_quota = self.config.hw_err_storage_size;
        let common_space = self.nv.size().saturating_sub(STORE_HEADER_SIZE + hw_quota);
        let remaining_common = common_space.saturating_sub(self.common_total);
        let remaining_hw_err = hw_quota.saturating_sub(self.hw_err_total);

        if remaining_common < self.config.max_variable_size
            || (hw_quota != 0 && remaining_hw_err < self.config.max_hw_err_variable_size)
        {
            if let Err(err) = self.reclaim(StoreKind::Nv, None, false, false) {
                log::warn!("Variable: reclaim before OS boot failed: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{Fixture, GUID_A};

    #[test]
    fn test_reclaim_arguments() {
        let mut fixture = Fixture::new();
        let name = ucs2("Kept");
        fixture
            .engine
            .set_variable(&name, &GUID_A, Attributes::NV_BS_RT, b"value")
            .unwrap();
        let track = fixture.engine.find_variable(&name, &GUID_A, true);
        assert!(track.is_some());
        let before = fixture.flash.snapshot();

        // Key database compaction never moves a record being updated
        assert_eq!(
            fixture.engine.reclaim(StoreKind::Nv, track, true, true).unwrap_err(),
            Error::InvalidParameter
        );
        assert_eq!(
            fixture.engine.reclaim(StoreKind::Hob, None, false, true).unwrap_err(),
            Error::InvalidParameter
        );
        assert_eq!(fixture.flash.snapshot(), before);

        // Nothing dead and not forced
        assert_eq!(fixture.engine.reclaim(StoreKind::Nv, track, false, false).unwrap(), track);
        assert_eq!(fixture.flash.snapshot(), before);
        assert_eq!(fixture.engine.read_variable(&name, &GUID_A).unwrap().1, b"value");
    }
}
