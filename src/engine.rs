// SPDX-License-Identifier: GPL-3.0-only

//! The variable store engine.
//!
//! One [`VariableStoreEngine`] owns the volatile store, the optional HOB
//! store handed over from an earlier boot phase, and the in-memory mirror of
//! the non-volatile store. Reads are served from memory. Writes to the
//! non-volatile store go through the flash collaborator installed by
//! [`VariableStoreEngine::install_write_services`], see `update.rs`.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use uefi::guid::Guid;

use crate::auth::{payload_size, AuthVerifier, PubKeyStore, RejectAll};
use crate::config::VariableConfig;
use crate::error::{Error, Result};
use crate::flash::{FtwLastWrite, FvbAttributes, VariableFlash};
use crate::guid::{GuidFmt, GLOBAL_VARIABLE_GUID, IMAGE_SECURITY_DATABASE_GUID};
use crate::info::{Access, VariableInfo, VariableInfoEntry};
use crate::lang::{best_language, index_of_lang, lang_at_index, ISO_639_2_ENTRY_SIZE};
use crate::policy::{
    check_efi_global_variable, is_hw_err_rec_variable, is_read_only_variable, LockList, NameFmt,
    IMAGE_SECURITY_DATABASE, IMAGE_SECURITY_DATABASE1, KEY_EXCHANGE_KEY_NAME, LANG_CODES_NAME,
    LANG_NAME, PLATFORM_KEY_NAME, PLATFORM_LANG_CODES_NAME, PLATFORM_LANG_NAME,
};
use crate::store::{Lookup, PtrTrack, StoreKind, VariableStore};
use crate::variable::{
    encode_name, header_align, name_eq, name_size, next_offset, store_header, trim_name, ucs2,
    Attributes, AuthenticatedVariableHeader, StoreStatus, STORE_HEADER_SIZE, VARIABLE_HEADER_SIZE,
    VAR_ADDED, VAR_ADDED_TRANSITION,
};
use crate::volume::FirmwareVolume;

/// Boot phase queries and transitions provided by the platform.
pub trait Platform: Send + Sync {
    /// True once the OS owns the machine.
    fn at_runtime(&self) -> bool;

    fn exit_boot_services(&self);
}

/// A [`Platform`] that only tracks the boot phase.
#[derive(Debug, Default)]
pub struct BootPhase {
    runtime: AtomicBool,
}

impl BootPhase {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Platform for BootPhase {
    fn at_runtime(&self) -> bool {
        self.runtime.load(Ordering::SeqCst)
    }

    fn exit_boot_services(&self) {
        self.runtime.store(true, Ordering::SeqCst);
    }
}

/// Answer of [`VariableStoreEngine::query_variable_info`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VariableStorageInfo {
    pub max_storage_size: u64,
    pub remaining_storage_size: u64,
    pub max_variable_size: u64,
}

/// Bytes taken by the records of a non-volatile store, split into common
/// and hardware error record usage.
///
/// Every record counts, dead or alive, with the sizes recorded in its
/// header. This is what the store will hold until the next reclaim.
pub(crate) fn nv_usage(store: &VariableStore) -> (usize, usize) {
    let mut common = 0usize;
    let mut hw_err = 0usize;
    for offset in store.iter() {
        let header = match store.header_at(offset) {
            Some(some) => some,
            None => break,
        };
        let size = (header.name_size as usize)
            .saturating_add(header.data_size as usize)
            .saturating_add(VARIABLE_HEADER_SIZE);
        let size = header_align(size.min(usize::MAX - 3));
        let attributes = header.attributes();
        if attributes.contains(Attributes::NON_VOLATILE | Attributes::HARDWARE_ERROR_RECORD) {
            hw_err = hw_err.saturating_add(size);
        } else {
            common = common.saturating_add(size);
        }
    }
    (common, hw_err)
}

pub struct VariableStoreEngine {
    pub(crate) config: VariableConfig,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) verifier: Box<dyn AuthVerifier>,
    pub(crate) volatile: VariableStore,
    pub(crate) hob: Option<VariableStore>,
    /// Mirror of the non-volatile store, kept byte for byte equal to flash.
    pub(crate) nv: VariableStore,
    /// Volume offset of the non-volatile store header.
    pub(crate) nv_base: usize,
    pub(crate) fv_length: usize,
    pub(crate) flash: Option<Box<dyn VariableFlash>>,
    pub(crate) volatile_last_offset: usize,
    pub(crate) nv_last_offset: usize,
    pub(crate) common_total: usize,
    pub(crate) hw_err_total: usize,
    pub(crate) locks: LockList,
    pub(crate) end_of_dxe: bool,
    pub(crate) reentrant: AtomicU32,
    pub(crate) lang_codes: Option<Vec<u8>>,
    pub(crate) platform_lang_codes: Option<Vec<u8>>,
    pub(crate) pub_keys: PubKeyStore,
    pub(crate) info: VariableInfo,
}

impl VariableStoreEngine {
    /// Bring up the read side of the variable services.
    ///
    /// `nv_image` is the whole firmware volume holding the non-volatile
    /// store as read from flash. A pending fault tolerant write is applied
    /// to it first. `hob_store` is a variable store built by an earlier
    /// phase; it is ignored unless its header is valid.
    pub fn new(
        config: VariableConfig,
        mut nv_image: Vec<u8>,
        hob_store: Option<Vec<u8>>,
        ftw_last_write: Option<&FtwLastWrite>,
        platform: Arc<dyn Platform>,
    ) -> Result<Self> {
        if let Some(ftw) = ftw_last_write {
            ftw.apply(&mut nv_image);
        }

        let fv = FirmwareVolume::parse(&nv_image).map_err(|err| {
            log::error!("Variable: firmware volume header is corrupted");
            err
        })?;
        if !fv.checksum_ok(&nv_image) {
            log::warn!("Variable: firmware volume header checksum mismatch");
        }
        let nv_base = fv.header.header_length();
        let fv_length = fv.length().min(nv_image.len());

        let header = nv_image
            .get(nv_base..)
            .and_then(store_header)
            .ok_or(Error::VolumeCorrupted)?;
        if header.status() != StoreStatus::Valid {
            log::error!("Variable: non-volatile store header is not valid");
            return Err(Error::VolumeCorrupted);
        }
        let store_size = header.size as usize;
        if store_size <= STORE_HEADER_SIZE || nv_base + store_size > fv_length {
            log::error!(
                "Variable: non-volatile store size {:#x} does not fit volume of {:#x} bytes",
                store_size,
                fv_length
            );
            return Err(Error::VolumeCorrupted);
        }
        config.validate(store_size)?;

        let nv = VariableStore::from_bytes(nv_image[nv_base..nv_base + store_size].to_vec());
        let (common_total, hw_err_total) = nv_usage(&nv);
        let nv_last_offset = nv.scan_end();

        let hob = match hob_store {
            Some(data) => {
                let store = VariableStore::from_bytes(data);
                if store.status() == StoreStatus::Valid {
                    Some(store)
                } else {
                    log::error!("Variable: HOB variable store header is invalid");
                    None
                }
            }
            None => None,
        };

        let volatile = VariableStore::formatted(config.volatile_store_size);
        let volatile_last_offset = volatile.start();

        log::info!(
            "Variable: non-volatile store at {:#x}, {:#x} bytes, {:#x} in use",
            nv_base,
            store_size,
            nv_last_offset
        );

        Ok(Self {
            info: VariableInfo::new(config.collect_statistics),
            config,
            platform,
            verifier: Box::new(RejectAll),
            volatile,
            hob,
            nv,
            nv_base,
            fv_length,
            flash: None,
            volatile_last_offset,
            nv_last_offset,
            common_total,
            hw_err_total,
            locks: LockList::default(),
            end_of_dxe: false,
            reentrant: AtomicU32::new(0),
            lang_codes: None,
            platform_lang_codes: None,
            pub_keys: PubKeyStore::default(),
        })
    }

    /// Replace the signature verifier used for authenticated writes.
    pub fn set_verifier(&mut self, verifier: Box<dyn AuthVerifier>) {
        self.verifier = verifier;
    }

    /// Make the store writable.
    ///
    /// Cleans up a store whose free area is not erased, moves variables
    /// left in the HOB store to flash and loads the public key database.
    pub fn install_write_services(&mut self, flash: Box<dyn VariableFlash>) -> Result<()> {
        if !flash.attributes().contains(FvbAttributes::WRITE_STATUS) {
            return Err(Error::WriteProtected);
        }
        self.flash = Some(flash);

        if self.free_area_dirty() {
            log::warn!(
                "Variable: free area after {:#x} is not erased, reclaiming",
                self.nv_last_offset
            );
            self.reclaim(StoreKind::Nv, None, false, true)?;
        }

        self.flush_hob_variables(None);
        self.init_authenticated()
    }

    pub fn signal_end_of_dxe(&mut self) {
        log::info!("Variable: EndOfDxe, {} variables locked", self.locks.len());
        self.end_of_dxe = true;
    }

    /// Ready-to-boot hook: make room for the OS while reclaim is still allowed.
    pub fn ready_to_boot(&mut self) {
        self.reclaim_for_os();
        for entry in self.info.entries() {
            log::debug!(
                "Variable: {}:{} read {} write {} delete {} cache {}",
                GuidFmt(&entry.guid),
                NameFmt(&entry.name),
                entry.read_count,
                entry.write_count,
                entry.delete_count,
                entry.cache_count
            );
        }
    }

    pub fn exit_boot_services(&mut self) {
        log::info!("Variable: entering runtime");
        self.platform.exit_boot_services();
    }

    /// Bytes of the non-volatile store in use, and its size.
    pub fn nv_used(&self) -> (usize, usize) {
        (self.nv_last_offset, self.nv.size())
    }

    /// True when something other than erased flash follows the last record.
    pub fn free_area_dirty(&self) -> bool {
        self.nv
            .bytes()
            .get(self.nv_last_offset..self.nv.size())
            .map_or(false, |free| free.iter().any(|&b| b != 0xFF))
    }

    pub fn at_runtime(&self) -> bool {
        self.platform.at_runtime()
    }

    pub fn platform(&self) -> Arc<dyn Platform> {
        self.platform.clone()
    }

    /// Access counters collected so far.
    pub fn variable_info(&self) -> &[VariableInfoEntry] {
        self.info.entries()
    }

    pub(crate) fn store(&self, kind: StoreKind) -> Option<&VariableStore> {
        match kind {
            StoreKind::Volatile => Some(&self.volatile),
            StoreKind::Hob => self.hob.as_ref(),
            StoreKind::Nv => Some(&self.nv),
        }
    }

    pub(crate) fn header(&self, track: &PtrTrack) -> Option<AuthenticatedVariableHeader> {
        self.store(track.store)?.header_at(track.curr)
    }

    pub(crate) fn track_data(&self, track: &PtrTrack) -> &[u8] {
        self.store(track.store).map_or(&[], |store| store.data(track.curr))
    }

    /// Look a variable up in every store, volatile first.
    ///
    /// An empty name finds the first visible variable.
    pub(crate) fn find_variable(
        &self,
        name: &[u16],
        guid: &Guid,
        ignore_rt: bool,
    ) -> Option<PtrTrack> {
        let at_runtime = self.at_runtime();
        let encoded = encode_name(name);
        let lookup = if trim_name(name).is_empty() {
            Lookup::First
        } else {
            Lookup::Named(&encoded, guid)
        };

        StoreKind::SEARCH_ORDER.iter().find_map(|&kind| {
            self.store(kind)?
                .find_ex(lookup, ignore_rt, at_runtime)
                .map(|hit| PtrTrack::new(kind, hit))
        })
    }

    /// `GetVariable`.
    ///
    /// When `data_size` is smaller than the value, the required size is
    /// written back and `BufferTooSmall` returned without copying anything.
    pub fn get_variable(
        &mut self,
        name: &[u16],
        guid: &Guid,
        attributes: Option<&mut Attributes>,
        data_size: &mut usize,
        data: Option<&mut [u8]>,
    ) -> Result<()> {
        if trim_name(name).is_empty() {
            return Err(Error::InvalidParameter);
        }

        let track = self.find_variable(name, guid, false).ok_or(Error::NotFound)?;
        let header = self.header(&track).ok_or(Error::NotFound)?;
        let value = self.track_data(&track);
        let len = value.len();

        if *data_size < len {
            *data_size = len;
            return Err(Error::BufferTooSmall);
        }

        let data = data.ok_or(Error::InvalidParameter)?;
        let dst = data.get_mut(..len).ok_or(Error::InvalidParameter)?;
        dst.copy_from_slice(value);
        if let Some(attributes) = attributes {
            *attributes = header.attributes();
        }
        *data_size = len;

        let at_runtime = self.at_runtime();
        self.info
            .record(name, guid, track.store.is_volatile(), Access::Read, at_runtime);
        Ok(())
    }

    /// Read a whole variable into a new buffer.
    pub fn read_variable(&mut self, name: &[u16], guid: &Guid) -> Result<(Attributes, Vec<u8>)> {
        let mut attributes = Attributes::empty();
        let mut size = 0;
        let mut data = Vec::new();
        loop {
            data.resize(size, 0);
            match self.get_variable(name, guid, Some(&mut attributes), &mut size, Some(&mut data)) {
                Ok(()) => {
                    data.truncate(size);
                    return Ok((attributes, data));
                }
                Err(Error::BufferTooSmall) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn next_store(&self, kind: StoreKind) -> Option<StoreKind> {
        let mut next = kind.next();
        while let Some(kind) = next {
            if self.store(kind).is_some() {
                return Some(kind);
            }
            next = kind.next();
        }
        None
    }

    /// `GetNextVariableName`.
    ///
    /// `name` holds the previous name, empty to start, and receives the next
    /// one with its NUL. `name_size` is the size of `name` in bytes on input
    /// and the size of the returned name on output.
    pub fn get_next_variable_name(
        &mut self,
        name_size: &mut usize,
        name: &mut [u16],
        guid: &mut Guid,
    ) -> Result<()> {
        let at_runtime = self.at_runtime();
        let current = trim_name(name).to_vec();

        let track = self.find_variable(&current, guid, false).ok_or(Error::NotFound)?;
        let mut kind = track.store;
        let mut cursor = if current.is_empty() {
            Some(track.curr)
        } else {
            self.store(kind).and_then(|store| next_offset(store.bytes(), track.curr))
        };

        loop {
            let store = self.store(kind).ok_or(Error::NotFound)?;
            let found = cursor
                .filter(|&offset| offset < store.end())
                .and_then(|offset| Some((offset, store.header_at(offset)?)))
                .filter(|(_, header)| header.is_valid());
            let (offset, header) = match found {
                Some(some) => some,
                None => {
                    kind = self.next_store(kind).ok_or(Error::NotFound)?;
                    cursor = self.store(kind).map(|store| store.start());
                    continue;
                }
            };
            cursor = next_offset(store.bytes(), offset);

            if header.state != VAR_ADDED && header.state != VAR_ADDED_TRANSITION {
                continue;
            }
            if at_runtime && !header.attributes().contains(Attributes::RUNTIME_ACCESS) {
                continue;
            }

            let var_name = store.name(offset);
            let var_guid = header.guid();
            if header.state == VAR_ADDED_TRANSITION {
                // Skip it when the update that superseded it completed
                let twin = store.find_ex(Lookup::Named(var_name, &var_guid), false, at_runtime);
                let added = twin
                    .and_then(|hit| store.state(hit.curr))
                    .map_or(false, |state| state == VAR_ADDED);
                if added {
                    continue;
                }
            }
            if kind == StoreKind::Nv {
                if let Some(hob) = &self.hob {
                    if hob
                        .find_ex(Lookup::Named(var_name, &var_guid), false, at_runtime)
                        .is_some()
                    {
                        continue;
                    }
                }
            }

            let var_name_size = var_name.len();
            let result = if var_name_size <= *name_size {
                let dst = name
                    .get_mut(..(var_name_size + 1) / 2)
                    .ok_or(Error::InvalidParameter)?;
                for (c, chunk) in dst.iter_mut().zip(var_name.chunks(2)) {
                    *c = u16::from_le_bytes([chunk[0], *chunk.get(1).unwrap_or(&0)]);
                }
                *guid = var_guid;
                Ok(())
            } else {
                Err(Error::BufferTooSmall)
            };
            *name_size = var_name_size;
            return result;
        }
    }

    /// Every visible variable identity, in enumeration order.
    pub fn list_variables(&mut self) -> Result<Vec<(Vec<u16>, Guid)>> {
        let mut list = Vec::new();
        let mut name: Vec<u16> = vec![0];
        let mut guid = Guid(0, 0, 0, [0; 8]);
        loop {
            let mut size = name.len() * 2;
            match self.get_next_variable_name(&mut size, &mut name, &mut guid) {
                Ok(()) => list.push((trim_name(&name).to_vec(), guid)),
                Err(Error::BufferTooSmall) => {
                    let mut grown = vec![0; (size + 1) / 2];
                    let len = trim_name(&name).len();
                    grown[..len].copy_from_slice(&name[..len]);
                    name = grown;
                }
                Err(Error::NotFound) => return Ok(list),
                Err(err) => return Err(err),
            }
        }
    }

    /// `SetVariable`.
    ///
    /// Empty `data` deletes the variable, unless `APPEND_WRITE` is set.
    pub fn set_variable(
        &mut self,
        name: &[u16],
        guid: &Guid,
        attributes: Attributes,
        data: &[u8],
    ) -> Result<()> {
        if trim_name(name).is_empty() {
            return Err(Error::InvalidParameter);
        }
        if is_read_only_variable(name, guid) {
            return Err(Error::WriteProtected);
        }
        if Attributes::from_bits(attributes.bits()).is_none() {
            return Err(Error::InvalidParameter);
        }
        if attributes.contains(Attributes::RUNTIME_ACCESS)
            && !attributes.contains(Attributes::BOOTSERVICE_ACCESS)
        {
            return Err(Error::InvalidParameter);
        }
        if attributes.contains(
            Attributes::AUTHENTICATED_WRITE_ACCESS
                | Attributes::TIME_BASED_AUTHENTICATED_WRITE_ACCESS,
        ) {
            return Err(Error::InvalidParameter);
        }

        let payload = payload_size(data, attributes)?;
        let total = name_size(name).saturating_add(payload);
        if attributes.is_hw_err() {
            if total > self.config.max_hw_err_variable_size.saturating_sub(VARIABLE_HEADER_SIZE) {
                return Err(Error::InvalidParameter);
            }
            if !is_hw_err_rec_variable(name, guid) {
                return Err(Error::InvalidParameter);
            }
        } else if total > self.config.max_variable_size.saturating_sub(VARIABLE_HEADER_SIZE) {
            return Err(Error::InvalidParameter);
        }

        check_efi_global_variable(name, guid, attributes)?;

        if self.reentrant.fetch_add(1, Ordering::SeqCst) > 0 {
            // Nested call, the tail cursor may be stale
            self.nv_last_offset = self.nv.scan_end();
        }
        let result = self.set_variable_inner(name, guid, attributes, data);
        self.reentrant.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn set_variable_inner(
        &mut self,
        name: &[u16],
        guid: &Guid,
        attributes: Attributes,
        data: &[u8],
    ) -> Result<()> {
        if self.end_of_dxe && self.config.enable_locking && self.locks.contains(name, guid) {
            log::warn!(
                "Variable: {}:{} is locked, write refused",
                GuidFmt(guid),
                NameFmt(name)
            );
            return Err(Error::WriteProtected);
        }

        if let Some(track) = self.find_variable(name, guid, true) {
            let existing = self.header(&track).ok_or(Error::NotFound)?.attributes();
            if self.at_runtime() && !existing.contains(Attributes::RUNTIME_ACCESS) {
                return Err(Error::WriteProtected);
            }
            if !attributes.is_empty() && attributes - Attributes::APPEND_WRITE != existing {
                return Err(Error::InvalidParameter);
            }
        }

        if *guid == GLOBAL_VARIABLE_GUID {
            self.auto_update_lang(name, data);
        }
        // Language sync may have moved records around
        let track = self.find_variable(name, guid, true);

        if *guid == GLOBAL_VARIABLE_GUID && name_eq(name, PLATFORM_KEY_NAME) {
            self.process_var_with_pk(name, guid, data, track, attributes, true)
        } else if *guid == GLOBAL_VARIABLE_GUID && name_eq(name, KEY_EXCHANGE_KEY_NAME) {
            self.process_var_with_pk(name, guid, data, track, attributes, false)
        } else if *guid == IMAGE_SECURITY_DATABASE_GUID
            && (name_eq(name, IMAGE_SECURITY_DATABASE) || name_eq(name, IMAGE_SECURITY_DATABASE1))
        {
            match self.process_var_with_pk(name, guid, data, track, attributes, false) {
                // Only a rejected signature gets a second chance. Any other
                // failure may have reached flash and moved records.
                Err(Error::SecurityViolation) => {
                    let track = self.find_variable(name, guid, true);
                    self.process_var_with_kek(name, guid, data, track, attributes)
                }
                result => result,
            }
        } else {
            self.process_variable(name, guid, data, track, attributes)
        }
    }

    /// Keep `Lang` and `PlatformLang` in step with each other.
    fn auto_update_lang(&mut self, name: &[u16], data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let mut name = trim_name(name).to_vec();
        let mut data = data.to_vec();

        let codes_changed = if name_eq(&name, PLATFORM_LANG_CODES_NAME) {
            if self.at_runtime() {
                return;
            }
            self.platform_lang_codes = Some(data.clone());
            true
        } else if name_eq(&name, LANG_CODES_NAME) {
            if self.at_runtime() {
                return;
            }
            self.lang_codes = Some(data.clone());
            true
        } else {
            false
        };

        if codes_changed && self.platform_lang_codes.is_some() && self.lang_codes.is_some() {
            // Re-derive from whichever language is already set
            let platform_lang = ucs2(PLATFORM_LANG_NAME);
            let lang = ucs2(LANG_NAME);
            if let Some(track) = self.find_variable(&platform_lang, &GLOBAL_VARIABLE_GUID, false) {
                data = self.track_data(&track).to_vec();
                name = platform_lang;
            } else if let Some(track) = self.find_variable(&lang, &GLOBAL_VARIABLE_GUID, false) {
                data = self.track_data(&track).to_vec();
                name = lang;
            } else {
                return;
            }
        }

        let (platform_codes, lang_codes) = match (&self.platform_lang_codes, &self.lang_codes) {
            (Some(p), Some(l)) => (p.clone(), l.clone()),
            _ => return,
        };

        let (target, value) = if name_eq(&name, PLATFORM_LANG_NAME) {
            let best = match best_language(&platform_codes, false, &[data.as_slice()]) {
                Some(some) => some,
                None => return,
            };
            let lang = index_of_lang(&platform_codes, best, false)
                .and_then(|index| lang_at_index(&lang_codes, index, true));
            let lang = match lang {
                Some(some) => some,
                None => return,
            };
            log::info!(
                "Variable: auto update PlatformLang {} Lang {}",
                AsciiFmt(best),
                AsciiFmt(lang)
            );
            let mut value = Vec::with_capacity(ISO_639_2_ENTRY_SIZE + 1);
            value.extend_from_slice(lang);
            value.push(0);
            (LANG_NAME, value)
        } else if name_eq(&name, LANG_NAME) {
            let best = match best_language(&lang_codes, true, &[data.as_slice()]) {
                Some(some) => some,
                None => return,
            };
            let platform_lang = index_of_lang(&lang_codes, best, true)
                .and_then(|index| lang_at_index(&platform_codes, index, false));
            let platform_lang = match platform_lang {
                Some(some) => some,
                None => return,
            };
            log::info!(
                "Variable: auto update Lang {} PlatformLang {}",
                AsciiFmt(best),
                AsciiFmt(platform_lang)
            );
            let mut value = Vec::with_capacity(platform_lang.len() + 1);
            value.extend_from_slice(platform_lang);
            value.push(0);
            (PLATFORM_LANG_NAME, value)
        } else {
            return;
        };

        let target = ucs2(target);
        let track = self.find_variable(&target, &GLOBAL_VARIABLE_GUID, false);
        if let Err(err) = self.update_variable(
            &target,
            &GLOBAL_VARIABLE_GUID,
            &value,
            Attributes::NV_BS_RT,
            0,
            0,
            track,
            None,
        ) {
            log::warn!("Variable: failed to update {}: {}", NameFmt(&target), err);
        }
    }

    /// `QueryVariableInfo`.
    pub fn query_variable_info(&self, attributes: Attributes) -> Result<VariableStorageInfo> {
        if attributes.is_empty() {
            return Err(Error::InvalidParameter);
        }
        if !attributes.intersects(
            Attributes::NON_VOLATILE
                | Attributes::BOOTSERVICE_ACCESS
                | Attributes::RUNTIME_ACCESS
                | Attributes::HARDWARE_ERROR_RECORD,
        ) {
            return Err(Error::Unsupported);
        }
        if attributes.contains(Attributes::RUNTIME_ACCESS)
            && !attributes.contains(Attributes::BOOTSERVICE_ACCESS)
        {
            return Err(Error::InvalidParameter);
        }
        let at_runtime = self.at_runtime();
        if at_runtime && !attributes.contains(Attributes::RUNTIME_ACCESS) {
            return Err(Error::InvalidParameter);
        }
        if attributes.is_hw_err() && !attributes.contains(Attributes::NON_VOLATILE) {
            return Err(Error::InvalidParameter);
        }

        let nv = attributes.contains(Attributes::NON_VOLATILE);
        let store = if nv { &self.nv } else { &self.volatile };
        let mut max_storage_size = store.size().saturating_sub(STORE_HEADER_SIZE);
        let max_variable_size;
        if nv && attributes.is_hw_err() {
            max_storage_size = self.config.hw_err_storage_size;
            max_variable_size =
                self.config.max_hw_err_variable_size.saturating_sub(VARIABLE_HEADER_SIZE);
        } else {
            if nv {
                max_storage_size = max_storage_size.saturating_sub(self.config.hw_err_storage_size);
            }
            max_variable_size = self.config.max_variable_size.saturating_sub(VARIABLE_HEADER_SIZE);
        }

        let mut common = 0usize;
        let mut hw_err = 0usize;
        for offset in store.iter() {
            let header = match store.header_at(offset) {
                Some(some) => some,
                None => break,
            };
            // Nothing can be reclaimed at runtime so every record is in use
            if !at_runtime && header.state != VAR_ADDED {
                continue;
            }
            let size = next_offset(store.bytes(), offset).map_or(0, |next| next - offset);
            if header.attributes().is_hw_err() {
                hw_err += size;
            } else {
                common += size;
            }
        }

        let used = if attributes.is_hw_err() { hw_err } else { common };
        let remaining = max_storage_size.saturating_sub(used);
        let max_variable_size = if remaining < VARIABLE_HEADER_SIZE {
            0
        } else {
            max_variable_size.min(remaining - VARIABLE_HEADER_SIZE)
        };

        Ok(VariableStorageInfo {
            max_storage_size: max_storage_size as u64,
            remaining_storage_size: remaining as u64,
            max_variable_size: max_variable_size as u64,
        })
    }

    /// `RequestToLock`: make a variable read-only once EndOfDxe is signaled.
    pub fn request_to_lock(&mut self, name: &[u16], guid: &Guid) -> Result<()> {
        if trim_name(name).is_empty() {
            return Err(Error::InvalidParameter);
        }
        if self.end_of_dxe {
            return Err(Error::AccessDenied);
        }
        self.locks.push(name, guid);
        Ok(())
    }
}

/// Display an ASCII language code for logs.
struct AsciiFmt<'a>(&'a [u8]);

impl core::fmt::Display for AsciiFmt<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for &b in self.0 {
            write!(f, "{}", b as char)?;
        }
        Ok(())
    }
}
