// SPDX-License-Identifier: GPL-3.0-only

//! Committing variables to a store.
//!
//! A non-volatile record is written in four separate flash writes: header
//! with an erased state, state `VAR_HEADER_VALID_ONLY`, name and data, then
//! state `VAR_ADDED`. The record it replaces is flipped to
//! `VAR_IN_DELETED_TRANSITION` before and to `VAR_DELETED` after, so a power
//! cut at any point leaves exactly one value that lookups will return.

use alloc::vec::Vec;
use uefi::guid::Guid;

use crate::auth::{append_signature_list, EfiTime, EFI_TIME_SIZE};
use crate::engine::VariableStoreEngine;
use crate::error::{Error, Result};
use crate::flash::write_linear;
use crate::guid::{GuidFmt, GLOBAL_VARIABLE_GUID, IMAGE_SECURITY_DATABASE_GUID};
use crate::info::Access;
use crate::policy::{
    NameFmt, IMAGE_SECURITY_DATABASE, IMAGE_SECURITY_DATABASE1, KEY_EXCHANGE_KEY_NAME,
};
use crate::store::{Lookup, PtrTrack, StoreKind};
use crate::variable::{
    build_record, decode_name, encode_name, header_align, matches, name_eq, name_size, pad_size,
    Attributes, STATE_OFFSET, STORE_HEADER_SIZE, VARIABLE_HEADER_SIZE, VAR_ADDED, VAR_DELETED,
    VAR_HEADER_VALID_ONLY, VAR_IN_DELETED_TRANSITION,
};

/// Variables whose value is a list of `EFI_SIGNATURE_LIST`.
fn is_signature_list_variable(name: &[u16], guid: &Guid) -> bool {
    (*guid == IMAGE_SECURITY_DATABASE_GUID
        && (name_eq(name, IMAGE_SECURITY_DATABASE) || name_eq(name, IMAGE_SECURITY_DATABASE1)))
        || (*guid == GLOBAL_VARIABLE_GUID && name_eq(name, KEY_EXCHANGE_KEY_NAME))
}

impl VariableStoreEngine {
    /// Write `data` at `offset` of a store.
    ///
    /// Non-volatile writes go to flash only; the caller keeps the mirror in
    /// step once the write succeeded.
    pub(crate) fn update_variable_store(
        &mut self,
        kind: StoreKind,
        offset: usize,
        data: &[u8],
    ) -> Result<()> {
        let end = offset.checked_add(data.len()).ok_or(Error::InvalidParameter)?;
        match kind {
            StoreKind::Volatile => {
                let dst = self
                    .volatile
                    .bytes_mut()
                    .get_mut(offset..end)
                    .ok_or(Error::InvalidParameter)?;
                dst.copy_from_slice(data);
                Ok(())
            }
            StoreKind::Hob => {
                let hob = self.hob.as_mut().ok_or(Error::NotFound)?;
                let dst = hob.bytes_mut().get_mut(offset..end).ok_or(Error::InvalidParameter)?;
                dst.copy_from_slice(data);
                Ok(())
            }
            StoreKind::Nv => {
                if self.nv_base + end > self.fv_length {
                    return Err(Error::InvalidParameter);
                }
                let flash = self.flash.as_mut().ok_or(Error::NotAvailableYet)?;
                write_linear(&mut **flash, self.nv_base + offset, data)
            }
        }
    }

    /// Clear state bits of the record at `offset` with a single byte write.
    pub(crate) fn mark_state(&mut self, kind: StoreKind, offset: usize, mask: u8) -> Result<()> {
        let state = self
            .store(kind)
            .and_then(|store| store.state(offset))
            .ok_or(Error::InvalidParameter)?
            & mask;
        self.update_variable_store(kind, offset + STATE_OFFSET, &[state])?;
        if kind == StoreKind::Nv {
            self.nv.set_state(offset, state);
        }
        Ok(())
    }

    /// Retire the record a track points at, twin first.
    fn retire(&mut self, track: &PtrTrack) -> Result<()> {
        if let Some(in_deleted) = track.in_deleted {
            self.mark_state(track.store, in_deleted, VAR_DELETED)?;
        }
        self.mark_state(track.store, track.curr, VAR_DELETED)
    }

    /// Space check for a record of `size` bytes in the non-volatile store.
    fn nv_fits(&self, size: usize, attributes: Attributes) -> bool {
        let hw_quota = self.config.hw_err_storage_size;
        if attributes.is_hw_err() {
            size + self.hw_err_total <= hw_quota
        } else {
            size + self.common_total
                <= self.nv.size().saturating_sub(STORE_HEADER_SIZE + hw_quota)
        }
    }

    /// Create, update, append to or delete a variable.
    ///
    /// `track` is where the variable currently lives, if anywhere. The data
    /// given here is the plain payload; authentication descriptors have
    /// already been checked and stripped.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn update_variable(
        &mut self,
        name: &[u16],
        guid: &Guid,
        data: &[u8],
        attributes: Attributes,
        key_index: u32,
        monotonic_count: u64,
        track: Option<PtrTrack>,
        timestamp: Option<&EfiTime>,
    ) -> Result<()> {
        if self.flash.is_none()
            && attributes
                .intersects(Attributes::NON_VOLATILE | Attributes::AUTHENTICATED_WRITE_ACCESS)
        {
            return Err(Error::NotAvailableYet);
        }
        let at_runtime = self.at_runtime();

        // Records still in the HOB store are handled through their flash copy
        let mut track = match track {
            Some(t) if t.store == StoreKind::Hob => {
                let nv = self.find_variable_in(StoreKind::Nv, name, guid);
                let delete = (data.is_empty() && !attributes.contains(Attributes::APPEND_WRITE))
                    || attributes.has_no_access();
                if nv.is_none() && delete {
                    self.mark_state(StoreKind::Hob, t.curr, VAR_DELETED)?;
                    return Ok(());
                }
                nv
            }
            other => other,
        };

        let mut merged: Option<Vec<u8>> = None;
        let mut existing_stamp = None;

        if let Some(t) = track {
            let header = self.header(&t).ok_or(Error::NotFound)?;
            let existing = header.attributes();
            let volatile = t.store.is_volatile();

            if at_runtime {
                if volatile {
                    return Err(Error::WriteProtected);
                }
                if !existing.contains(Attributes::NON_VOLATILE)
                    || !existing.contains(Attributes::RUNTIME_ACCESS)
                {
                    return Err(Error::InvalidParameter);
                }
            }

            let append = attributes.contains(Attributes::APPEND_WRITE);
            if (!append && data.is_empty()) || attributes.has_no_access() {
                self.retire(&t)?;
                self.info.record(name, guid, volatile, Access::Delete, at_runtime);
                if t.store == StoreKind::Nv {
                    self.flush_hob_variables(Some((name, guid)));
                }
                return Ok(());
            }

            let current = self.track_data(&t);
            if !append && timestamp.is_none() && current == data {
                self.info.record(name, guid, volatile, Access::Write, at_runtime);
                return Ok(());
            }

            existing_stamp = Some(EfiTime::from_bytes(&header.timestamp));

            if append {
                let name_len = name_size(name);
                let mut max_data = self
                    .config
                    .max_variable_size
                    .saturating_sub(VARIABLE_HEADER_SIZE + name_len + pad_size(name_len));

                let combined = if is_signature_list_variable(name, guid) {
                    let free = max_data.saturating_sub(current.len());
                    let combined = match append_signature_list(current, data, free) {
                        Ok(ok) => ok,
                        Err(Error::BufferTooSmall) => return Err(Error::InvalidParameter),
                        Err(err) => return Err(err),
                    };
                    if combined.len() == current.len() {
                        let stale = match (timestamp, &existing_stamp) {
                            (Some(new), Some(old)) => !new.is_later_than(old),
                            _ => true,
                        };
                        if stale {
                            self.info.record(name, guid, volatile, Access::Write, at_runtime);
                            return Ok(());
                        }
                    }
                    combined
                } else {
                    if attributes.is_hw_err() {
                        max_data = self
                            .config
                            .max_hw_err_variable_size
                            .saturating_sub(VARIABLE_HEADER_SIZE + name_len + pad_size(name_len));
                    }
                    if current.len() + data.len() > max_data {
                        return Err(Error::InvalidParameter);
                    }
                    let mut combined = Vec::with_capacity(current.len() + data.len());
                    combined.extend_from_slice(current);
                    combined.extend_from_slice(data);
                    combined
                };
                merged = Some(combined);
            }

            self.mark_state(t.store, t.curr, VAR_IN_DELETED_TRANSITION)?;
        } else {
            if data.is_empty() && attributes.contains(Attributes::APPEND_WRITE) {
                return Ok(());
            }
            if data.is_empty() || attributes.has_no_access() {
                return Err(Error::NotFound);
            }
            if at_runtime
                && (!attributes.contains(Attributes::RUNTIME_ACCESS)
                    || !attributes.contains(Attributes::NON_VOLATILE))
            {
                return Err(Error::InvalidParameter);
            }
        }

        let data = merged.as_deref().unwrap_or(data);

        let mut stamp = [0; EFI_TIME_SIZE];
        if attributes.contains(Attributes::TIME_BASED_AUTHENTICATED_WRITE_ACCESS) {
            if let Some(new) = timestamp {
                let keep_existing = attributes.contains(Attributes::APPEND_WRITE)
                    && existing_stamp.map_or(false, |old| old.is_later_than(new));
                stamp = match (keep_existing, existing_stamp) {
                    (true, Some(old)) => old.to_bytes(),
                    _ => new.to_bytes(),
                };
            }
        }

        let mut record =
            build_record(name, guid, data, attributes, key_index, monotonic_count, stamp);
        let size = record.len();
        let volatile = !attributes.contains(Attributes::NON_VOLATILE);

        if !volatile {
            if !self.nv_fits(size, attributes) {
                if at_runtime {
                    return Err(Error::OutOfResources);
                }
                let updating = track.filter(|t| t.store == StoreKind::Nv);
                track = self.reclaim(StoreKind::Nv, updating, false, false)?.or(track);
                if !self.nv_fits(size, attributes) {
                    return Err(Error::OutOfResources);
                }
            }

            let offset = self.nv_last_offset;
            self.update_variable_store(StoreKind::Nv, offset, &record[..VARIABLE_HEADER_SIZE])?;
            record[STATE_OFFSET] = VAR_HEADER_VALID_ONLY;
            let state_at = offset + STATE_OFFSET;
            self.update_variable_store(StoreKind::Nv, state_at, &[VAR_HEADER_VALID_ONLY])?;
            let body = &record[VARIABLE_HEADER_SIZE..];
            self.update_variable_store(StoreKind::Nv, offset + VARIABLE_HEADER_SIZE, body)?;
            record[STATE_OFFSET] = VAR_ADDED;
            self.update_variable_store(StoreKind::Nv, offset + STATE_OFFSET, &[VAR_ADDED])?;

            self.nv_last_offset += header_align(size);
            if attributes.is_hw_err() {
                self.hw_err_total += header_align(size);
            } else {
                self.common_total += header_align(size);
            }
            let mirror = self
                .nv
                .bytes_mut()
                .get_mut(offset..offset + size)
                .ok_or(Error::InvalidParameter)?;
            mirror.copy_from_slice(&record);
        } else {
            if size + self.volatile_last_offset > self.volatile.size() {
                let updating = track.filter(|t| t.store == StoreKind::Volatile);
                track = self.reclaim(StoreKind::Volatile, updating, false, false)?.or(track);
                if size + self.volatile_last_offset > self.volatile.size() {
                    return Err(Error::OutOfResources);
                }
            }

            record[STATE_OFFSET] = VAR_ADDED;
            let offset = self.volatile_last_offset;
            self.update_variable_store(StoreKind::Volatile, offset, &record)?;
            self.volatile_last_offset += header_align(size);
        }

        if let Some(t) = track {
            self.retire(&t)?;
        }

        self.info.record(name, guid, volatile, Access::Write, at_runtime);
        if !volatile {
            self.flush_hob_variables(Some((name, guid)));
        }
        Ok(())
    }

    fn find_variable_in(&self, kind: StoreKind, name: &[u16], guid: &Guid) -> Option<PtrTrack> {
        let encoded = encode_name(name);
        self.store(kind)?
            .find_ex(Lookup::Named(&encoded, guid), true, self.at_runtime())
            .map(|hit| PtrTrack::new(kind, hit))
    }

    /// Move variables left in the HOB store into the non-volatile store.
    ///
    /// `current` is a variable that was just written to flash; its HOB copy
    /// is only retired. HOB records that fail to move stay for a later try.
    pub(crate) fn flush_hob_variables(&mut self, current: Option<(&[u16], &Guid)>) {
        let mut hob = match self.hob.take() {
            Some(some) => some,
            None => return,
        };

        let mut error = false;
        let offsets: Vec<usize> = hob.iter().collect();
        for offset in offsets {
            let header = match hob.header_at(offset) {
                Some(some) => some,
                None => break,
            };
            if header.state != VAR_ADDED {
                continue;
            }

            let var_guid = header.guid();
            let var_name = decode_name(hob.name(offset));
            let result = match current {
                Some((name, guid)) if matches(hob.bytes(), offset, name, guid) => Ok(()),
                _ => {
                    let data = hob.data(offset).to_vec();
                    let attributes = header.attributes();
                    let result = self.set_variable(&var_name, &var_guid, attributes, &data);
                    log::debug!(
                        "Variable: flush HOB variable {}:{} {}",
                        GuidFmt(&var_guid),
                        NameFmt(&var_name),
                        match result {
                            Ok(()) => "ok",
                            Err(_) => "failed",
                        }
                    );
                    result
                }
            };

            match result {
                Ok(()) => {
                    let state = header.state & VAR_DELETED;
                    hob.set_state(offset, state);
                }
                Err(_) => error = true,
            }
        }

        if error {
            self.hob = Some(hob);
        } else {
            log::info!("Variable: all HOB variables have been flushed to flash");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::ucs2;

    #[test]
    fn test_signature_list_variables() {
        assert!(is_signature_list_variable(&ucs2("db"), &IMAGE_SECURITY_DATABASE_GUID));
        assert!(is_signature_list_variable(&ucs2("dbx"), &IMAGE_SECURITY_DATABASE_GUID));
        assert!(is_signature_list_variable(&ucs2("KEK"), &GLOBAL_VARIABLE_GUID));
        assert!(!is_signature_list_variable(&ucs2("KEK"), &IMAGE_SECURITY_DATABASE_GUID));
        assert!(!is_signature_list_variable(&ucs2("PK"), &GLOBAL_VARIABLE_GUID));
    }
}
