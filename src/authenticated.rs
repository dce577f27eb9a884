// SPDX-License-Identifier: GPL-3.0-only

//! Authenticated writes.
//!
//! Descriptors are parsed and checked for replay here; signatures are handed
//! to the installed [`AuthVerifier`](crate::auth::AuthVerifier). The
//! platform is in setup mode while no platform key is enrolled.

use alloc::vec::Vec;
use uefi::guid::Guid;

use crate::auth::{
    max_keys, Authority, CounterAuth, CounterBasedRequest, EfiTime, PubKeyStore, TimeAuth,
    TimeBasedRequest, AUTHINFO_SIZE,
};
use crate::engine::VariableStoreEngine;
use crate::error::{Error, Result};
use crate::guid::{AUTHENTICATED_VARIABLE_GUID, GLOBAL_VARIABLE_GUID};
use crate::policy::{NameFmt, KEY_EXCHANGE_KEY_NAME, PLATFORM_KEY_NAME, PUB_KEY_DB_NAME};
use crate::store::{PtrTrack, StoreKind};
use crate::variable::{name_size, ucs2, Attributes};

/// Who must have signed a time based write.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Signer {
    /// The enrolled platform key.
    PlatformKey,
    /// The platform key carried by the write itself, while in setup mode.
    NewPlatformKey,
    KeyExchangeKey,
    /// Any signer, the verifier binds it to the variable.
    Private,
}

impl VariableStoreEngine {
    /// True while no platform key is enrolled.
    pub fn in_setup_mode(&self) -> bool {
        self.find_variable(&ucs2(PLATFORM_KEY_NAME), &GLOBAL_VARIABLE_GUID, true)
            .is_none()
    }

    fn variable_data(&self, name: &str, guid: &Guid) -> Vec<u8> {
        self.find_variable(&ucs2(name), guid, true)
            .map(|track| self.track_data(&track).to_vec())
            .unwrap_or_default()
    }

    /// `PK` and `KEK`, and the first attempt for `db` and `dbx`.
    pub(crate) fn process_var_with_pk(
        &mut self,
        name: &[u16],
        guid: &Guid,
        data: &[u8],
        track: Option<PtrTrack>,
        attributes: Attributes,
        is_pk: bool,
    ) -> Result<()> {
        if !attributes.contains(Attributes::NON_VOLATILE)
            || !attributes.contains(Attributes::TIME_BASED_AUTHENTICATED_WRITE_ACCESS)
        {
            return Err(Error::InvalidParameter);
        }

        let setup_mode = self.in_setup_mode();
        if setup_mode && !is_pk {
            let auth = TimeAuth::parse(data)?;
            let stamp = Some(&auth.timestamp);
            return self.update_variable(name, guid, auth.payload, attributes, 0, 0, track, stamp);
        }

        let signer = if setup_mode {
            Signer::NewPlatformKey
        } else {
            Signer::PlatformKey
        };
        self.verify_time_based(name, guid, data, track, attributes, signer)?;

        if is_pk {
            log::info!(
                "Variable: platform is in {} mode",
                if self.in_setup_mode() { "setup" } else { "user" }
            );
        }
        Ok(())
    }

    /// `db` and `dbx` signed by a key exchange key.
    pub(crate) fn process_var_with_kek(
        &mut self,
        name: &[u16],
        guid: &Guid,
        data: &[u8],
        track: Option<PtrTrack>,
        attributes: Attributes,
    ) -> Result<()> {
        if !attributes.contains(Attributes::NON_VOLATILE)
            || !attributes.contains(Attributes::TIME_BASED_AUTHENTICATED_WRITE_ACCESS)
        {
            return Err(Error::InvalidParameter);
        }

        if self.in_setup_mode() {
            let auth = TimeAuth::parse(data)?;
            let stamp = Some(&auth.timestamp);
            self.update_variable(name, guid, auth.payload, attributes, 0, 0, track, stamp)
        } else {
            self.verify_time_based(name, guid, data, track, attributes, Signer::KeyExchangeKey)
        }
    }

    /// Every other variable, authenticated or not.
    pub(crate) fn process_variable(
        &mut self,
        name: &[u16],
        guid: &Guid,
        data: &[u8],
        track: Option<PtrTrack>,
        attributes: Attributes,
    ) -> Result<()> {
        let existing = track.and_then(|t| self.header(&t));
        let existing_attributes = existing.map(|h| h.attributes());

        if let Some(old) = existing_attributes {
            let counter_to_time = old.contains(Attributes::AUTHENTICATED_WRITE_ACCESS)
                && attributes.contains(Attributes::TIME_BASED_AUTHENTICATED_WRITE_ACCESS);
            let time_to_counter = old.contains(Attributes::TIME_BASED_AUTHENTICATED_WRITE_ACCESS)
                && attributes.contains(Attributes::AUTHENTICATED_WRITE_ACCESS);
            if counter_to_time || time_to_counter {
                return Err(Error::SecurityViolation);
            }
        }

        if attributes.contains(Attributes::TIME_BASED_AUTHENTICATED_WRITE_ACCESS) {
            return self.verify_time_based(name, guid, data, track, attributes, Signer::Private);
        }

        if !attributes.contains(Attributes::AUTHENTICATED_WRITE_ACCESS) {
            let protected = existing_attributes.map_or(false, |old| {
                old.intersects(
                    Attributes::AUTHENTICATED_WRITE_ACCESS
                        | Attributes::TIME_BASED_AUTHENTICATED_WRITE_ACCESS,
                )
            });
            if protected {
                return Err(Error::WriteProtected);
            }
            return self.update_variable(name, guid, data, attributes, 0, 0, track, None);
        }

        let auth = CounterAuth::parse(data)?;
        let deletion = data.len() == AUTHINFO_SIZE;
        let previous = existing
            .filter(|h| h.attributes().contains(Attributes::AUTHENTICATED_WRITE_ACCESS));

        if let Some(header) = previous {
            let key_index = header.pubkey_index;
            let count = header.monotonic_count;
            if self.pub_keys.key(key_index) != Some(auth.public_key) {
                return Err(Error::SecurityViolation);
            }
            if auth.monotonic_count <= count {
                log::warn!(
                    "Variable: monotonic count of {} did not increase",
                    NameFmt(name)
                );
                return Err(Error::SecurityViolation);
            }
        }

        let request = CounterBasedRequest { auth: &auth };
        if !request.is_rsa2048_sha256() || !self.verifier.verify_counter_based(&request) {
            return Err(Error::SecurityViolation);
        }

        let (key_index, track) = match previous {
            Some(header) => (header.pubkey_index, track),
            None if deletion => (0, track),
            None => {
                let index = self.add_pub_key(auth.public_key);
                if index == 0 {
                    return Err(Error::OutOfResources);
                }
                // Adding a key may have compacted the store
                (index, self.find_variable(name, guid, true))
            }
        };

        self.update_variable(
            name,
            guid,
            auth.payload,
            attributes,
            key_index,
            auth.monotonic_count,
            track,
            None,
        )
    }

    /// Check a time based descriptor and store its payload.
    pub(crate) fn verify_time_based(
        &mut self,
        name: &[u16],
        guid: &Guid,
        data: &[u8],
        track: Option<PtrTrack>,
        attributes: Attributes,
        signer: Signer,
    ) -> Result<()> {
        let auth = TimeAuth::parse(data)?;
        if !auth.timestamp.is_valid_stamp() {
            return Err(Error::SecurityViolation);
        }

        if !attributes.contains(Attributes::APPEND_WRITE) {
            if let Some(header) = track.and_then(|t| self.header(&t)) {
                let stamp = header.timestamp;
                let previous = EfiTime::from_bytes(&stamp);
                if !auth.timestamp.is_later_than(&previous) {
                    log::warn!(
                        "Variable: timestamp of {} is not later than the stored one",
                        NameFmt(name)
                    );
                    return Err(Error::SecurityViolation);
                }
            }
        }

        if !auth.is_pkcs7() {
            return Err(Error::SecurityViolation);
        }

        let key_data = match signer {
            Signer::PlatformKey => self.variable_data(PLATFORM_KEY_NAME, &GLOBAL_VARIABLE_GUID),
            Signer::NewPlatformKey => auth.payload.to_vec(),
            Signer::KeyExchangeKey => {
                self.variable_data(KEY_EXCHANGE_KEY_NAME, &GLOBAL_VARIABLE_GUID)
            }
            Signer::Private => Vec::new(),
        };
        let authority = match signer {
            Signer::PlatformKey | Signer::NewPlatformKey => Authority::PlatformKey(&key_data),
            Signer::KeyExchangeKey => Authority::KeyExchangeKeys(&key_data),
            Signer::Private => Authority::Private,
        };
        let request = TimeBasedRequest {
            name,
            guid,
            attributes,
            auth: &auth,
            authority,
        };
        if !self.verifier.verify_time_based(&request) {
            return Err(Error::SecurityViolation);
        }

        let stamp = Some(&auth.timestamp);
        self.update_variable(name, guid, auth.payload, attributes, 0, 0, track, stamp)
    }

    fn load_pub_keys(&mut self) {
        let data = self.variable_data(PUB_KEY_DB_NAME, &AUTHENTICATED_VARIABLE_GUID);
        self.pub_keys = PubKeyStore::from_database(&data);
    }

    /// Index of `key` in the public key database, adding it if needed.
    /// Returns 0 when the database is full.
    pub(crate) fn add_pub_key(&mut self, key: &[u8]) -> u32 {
        if let Some(index) = self.pub_keys.find(key) {
            return index;
        }

        let keydb_name = ucs2(PUB_KEY_DB_NAME);
        let limit = max_keys(self.config.max_variable_size, name_size(&keydb_name));
        if self.pub_keys.count() >= limit {
            if self.at_runtime() {
                return 0;
            }
            if let Err(err) = self.reclaim(StoreKind::Nv, None, true, true) {
                log::warn!("Variable: public key database is full: {}", err);
                return 0;
            }
            self.load_pub_keys();
            if self.pub_keys.count() >= limit {
                return 0;
            }
        }

        let index = self.pub_keys.push(key);
        let database = self.pub_keys.database_bytes();
        let track = self.find_variable(&keydb_name, &AUTHENTICATED_VARIABLE_GUID, true);
        match self.update_variable(
            &keydb_name,
            &AUTHENTICATED_VARIABLE_GUID,
            &database,
            Attributes::NV_BS_RT,
            0,
            0,
            track,
            None,
        ) {
            Ok(()) => index,
            Err(err) => {
                log::warn!("Variable: failed to store public key database: {}", err);
                self.load_pub_keys();
                0
            }
        }
    }

    /// Create the public key database, or load it when present.
    pub(crate) fn init_authenticated(&mut self) -> Result<()> {
        let keydb_name = ucs2(PUB_KEY_DB_NAME);
        if self
            .find_variable(&keydb_name, &AUTHENTICATED_VARIABLE_GUID, true)
            .is_none()
        {
            self.pub_keys = PubKeyStore::default();
            self.update_variable(
                &keydb_name,
                &AUTHENTICATED_VARIABLE_GUID,
                &self.pub_keys.database_bytes(),
                Attributes::NV_BS_RT,
                0,
                0,
                None,
                None,
            )?;
        } else {
            self.load_pub_keys();
        }

        log::info!(
            "Variable: {} public keys, platform in {} mode",
            self.pub_keys.count(),
            if self.in_setup_mode() { "setup" } else { "user" }
        );
        Ok(())
    }
}
