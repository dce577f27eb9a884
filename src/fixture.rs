// SPDX-License-Identifier: GPL-3.0-only

//! Engines over in-memory flash for tests.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use uefi::guid::Guid;

use crate::auth::{
    AuthVerifier, CounterBasedRequest, EfiTime, TimeBasedRequest, AUTHINFO_SIZE,
    WIN_CERT_TYPE_EFI_GUID,
};
use crate::config::VariableConfig;
use crate::engine::{BootPhase, Platform, VariableStoreEngine};
use crate::flash::{FirmwareVolumeBlock, FtwLastWrite, MemoryFlash};
use crate::guid::{guid_to_bytes, CERT_TYPE_PKCS7_GUID, CERT_TYPE_RSA2048_SHA256_GUID};
use crate::volume::format_volume;

pub const GUID_A: Guid = Guid(0x1234_5678, 0x9ABC, 0xDEF0, [1, 2, 3, 4, 5, 6, 7, 8]);
pub const GUID_B: Guid = Guid(0x0BAD_CAFE, 0x1111, 0x2222, [8, 7, 6, 5, 4, 3, 2, 1]);

pub const BLOCK_SIZE: usize = 0x1000;

/// Accepts every signature.
pub struct AcceptAll;

impl AuthVerifier for AcceptAll {
    fn verify_counter_based(&self, _request: &CounterBasedRequest<'_>) -> bool {
        true
    }

    fn verify_time_based(&self, _request: &TimeBasedRequest<'_>) -> bool {
        true
    }
}

pub struct Fixture {
    pub engine: VariableStoreEngine,
    pub flash: MemoryFlash,
    pub config: VariableConfig,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_volume(format_volume(0x10000, BLOCK_SIZE).unwrap(), VariableConfig::default())
    }

    pub fn with_volume(image: Vec<u8>, config: VariableConfig) -> Self {
        Self::boot(MemoryFlash::new(image, BLOCK_SIZE), config, None)
    }

    /// Bring up an engine over `flash`, the way firmware does on every boot.
    pub fn boot(flash: MemoryFlash, config: VariableConfig, hob: Option<Vec<u8>>) -> Self {
        let platform: Arc<dyn Platform> = Arc::new(BootPhase::new());
        let mut engine =
            VariableStoreEngine::new(config, flash.snapshot(), hob, None, platform).unwrap();
        engine.set_verifier(Box::new(AcceptAll));
        engine.install_write_services(Box::new(flash.clone())).unwrap();
        Self { engine, flash, config }
    }

    /// Power cycle: a new engine over whatever reached flash.
    pub fn reboot(&self) -> Self {
        let block_size = self.flash.block_map()[0].length as usize;
        let flash = MemoryFlash::new(self.flash.snapshot(), block_size);
        Self::boot(flash, self.config, None)
    }

    /// Read side only, as the engine is before write services exist.
    pub fn read_only(image: Vec<u8>, ftw: Option<&FtwLastWrite>) -> VariableStoreEngine {
        let platform = Arc::new(BootPhase::new());
        VariableStoreEngine::new(VariableConfig::default(), image, None, ftw, platform).unwrap()
    }
}

pub fn stamp(second: u8) -> EfiTime {
    EfiTime {
        year: 2024,
        month: 6,
        day: 1,
        second,
        ..EfiTime::default()
    }
}

/// `EFI_VARIABLE_AUTHENTICATION_2` in front of `payload`.
pub fn time_auth(timestamp: EfiTime, payload: &[u8]) -> Vec<u8> {
    let cert_data = [0x30, 0x82, 0x00, 0x00];
    let mut data = timestamp.to_bytes().to_vec();
    data.extend_from_slice(&(24 + cert_data.len() as u32).to_le_bytes());
    data.extend_from_slice(&0x0200u16.to_le_bytes());
    data.extend_from_slice(&WIN_CERT_TYPE_EFI_GUID.to_le_bytes());
    data.extend_from_slice(&guid_to_bytes(&CERT_TYPE_PKCS7_GUID));
    data.extend_from_slice(&cert_data);
    data.extend_from_slice(payload);
    data
}

/// `EFI_VARIABLE_AUTHENTICATION` signed with a key filled with `key`.
pub fn counter_auth(count: u64, key: u8, payload: &[u8]) -> Vec<u8> {
    let mut data = vec![0u8; AUTHINFO_SIZE];
    data[..8].copy_from_slice(&count.to_le_bytes());
    data[8..12].copy_from_slice(&(24u32 + 16 + 512).to_le_bytes());
    data[12..14].copy_from_slice(&0x0200u16.to_le_bytes());
    data[14..16].copy_from_slice(&WIN_CERT_TYPE_EFI_GUID.to_le_bytes());
    data[16..32].copy_from_slice(&guid_to_bytes(&CERT_TYPE_RSA2048_SHA256_GUID));
    for b in &mut data[48..48 + 256] {
        *b = key;
    }
    data.extend_from_slice(payload);
    data
}

/// One `EFI_SIGNATURE_LIST` of 16 byte entries.
pub fn signature_list(entries: &[[u8; 16]]) -> Vec<u8> {
    let mut list = guid_to_bytes(&crate::guid::CERT_SHA256_GUID).to_vec();
    list.extend_from_slice(&((28 + entries.len() * 16) as u32).to_le_bytes());
    list.extend_from_slice(&0u32.to_le_bytes());
    list.extend_from_slice(&16u32.to_le_bytes());
    for entry in entries {
        list.extend_from_slice(entry);
    }
    list
}
