// SPDX-License-Identifier: GPL-3.0-only

//! Authentication descriptors carried in front of authenticated variable
//! payloads, the public key database, and signature list merging.
//!
//! Signature verification itself is supplied by the platform through
//! [`AuthVerifier`]; everything structural is checked here.

use alloc::vec::Vec;
use core::mem;
use plain::Plain;
use uefi::guid::Guid;

use crate::error::{Error, Result};
use crate::guid::{
    guid_from_bytes, guid_to_bytes, CERT_TYPE_PKCS7_GUID, CERT_TYPE_RSA2048_SHA256_GUID,
};
use crate::variable::{read_plain, trim_name, Attributes, VARIABLE_HEADER_SIZE};

pub const WIN_CERT_TYPE_EFI_GUID: u16 = 0x0EF1;

pub const RSA2048_KEY_SIZE: usize = 256;
pub const RSA2048_SIGNATURE_SIZE: usize = 256;

// EFI_VARIABLE_AUTHENTICATION: count, WIN_CERTIFICATE_UEFI_GUID, hash type, key, signature
pub const AUTHINFO_SIZE: usize =
    8 + WIN_CERT_UEFI_GUID_SIZE + 16 + RSA2048_KEY_SIZE + RSA2048_SIGNATURE_SIZE;
const PUBLIC_KEY_OFFSET: usize = 8 + WIN_CERT_UEFI_GUID_SIZE + 16;
const SIGNATURE_OFFSET: usize = PUBLIC_KEY_OFFSET + RSA2048_KEY_SIZE;

// EFI_VARIABLE_AUTHENTICATION_2 up to CertData
pub const OFFSET_OF_AUTHINFO2_CERT_DATA: usize = EFI_TIME_SIZE + WIN_CERT_UEFI_GUID_SIZE;

// EFI_TIME
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct EfiTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub pad1: u8,
    pub nanosecond: u32,
    pub time_zone: i16,
    pub daylight: u8,
    pub pad2: u8,
}

unsafe impl Plain for EfiTime {}

pub const EFI_TIME_SIZE: usize = mem::size_of::<EfiTime>();

impl EfiTime {
    pub fn from_bytes(bytes: &[u8; EFI_TIME_SIZE]) -> Self {
        read_plain(bytes).unwrap_or_default()
    }

    pub fn to_bytes(&self) -> [u8; EFI_TIME_SIZE] {
        let mut bytes = [0; EFI_TIME_SIZE];
        bytes[..2].copy_from_slice(&self.year.to_le_bytes());
        bytes[2] = self.month;
        bytes[3] = self.day;
        bytes[4] = self.hour;
        bytes[5] = self.minute;
        bytes[6] = self.second;
        bytes[7] = self.pad1;
        bytes[8..12].copy_from_slice(&self.nanosecond.to_le_bytes());
        bytes[12..14].copy_from_slice(&self.time_zone.to_le_bytes());
        bytes[14] = self.daylight;
        bytes[15] = self.pad2;
        bytes
    }

    /// Only the calendar fields may be set in an authentication timestamp.
    pub fn is_valid_stamp(&self) -> bool {
        self.pad1 == 0
            && self.nanosecond == 0
            && self.time_zone == 0
            && self.daylight == 0
            && self.pad2 == 0
    }

    /// Strictly later than `other`, to the second.
    pub fn is_later_than(&self, other: &EfiTime) -> bool {
        let a = (self.year, self.month, self.day, self.hour, self.minute, self.second);
        let b = (other.year, other.month, other.day, other.hour, other.minute, other.second);
        a > b
    }
}

// WIN_CERTIFICATE_UEFI_GUID without its trailing CertData
#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
pub struct WinCertificateUefiGuid {
    pub length: u32,
    pub revision: u16,
    pub certificate_type: u16,
    pub cert_type: Guid,
}

unsafe impl Plain for WinCertificateUefiGuid {}

pub const WIN_CERT_UEFI_GUID_SIZE: usize = mem::size_of::<WinCertificateUefiGuid>();

impl WinCertificateUefiGuid {
    pub fn cert_type(&self) -> Guid {
        self.cert_type
    }
}

/// Parsed `EFI_VARIABLE_AUTHENTICATION` descriptor.
#[derive(Clone, Copy, Debug)]
pub struct CounterAuth<'a> {
    pub monotonic_count: u64,
    pub cert: WinCertificateUefiGuid,
    pub hash_type: Guid,
    pub public_key: &'a [u8],
    pub signature: &'a [u8],
    pub payload: &'a [u8],
}

impl<'a> CounterAuth<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < AUTHINFO_SIZE {
            return Err(Error::SecurityViolation);
        }
        let mut count = [0; 8];
        count.copy_from_slice(&data[..8]);
        let cert = read_plain(&data[8..]).ok_or(Error::SecurityViolation)?;
        let mut hash_type = [0; 16];
        hash_type.copy_from_slice(&data[8 + WIN_CERT_UEFI_GUID_SIZE..PUBLIC_KEY_OFFSET]);

        Ok(Self {
            monotonic_count: u64::from_le_bytes(count),
            cert,
            hash_type: guid_from_bytes(&hash_type),
            public_key: &data[PUBLIC_KEY_OFFSET..SIGNATURE_OFFSET],
            signature: &data[SIGNATURE_OFFSET..AUTHINFO_SIZE],
            payload: &data[AUTHINFO_SIZE..],
        })
    }

    pub fn is_deletion(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Parsed `EFI_VARIABLE_AUTHENTICATION_2` descriptor.
#[derive(Clone, Copy, Debug)]
pub struct TimeAuth<'a> {
    pub timestamp: EfiTime,
    pub cert: WinCertificateUefiGuid,
    pub cert_data: &'a [u8],
    pub payload: &'a [u8],
}

impl<'a> TimeAuth<'a> {
    /// Structural checks only: the declared certificate must fit the buffer.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < OFFSET_OF_AUTHINFO2_CERT_DATA {
            return Err(Error::SecurityViolation);
        }
        let timestamp: EfiTime = read_plain(data).ok_or(Error::SecurityViolation)?;
        let cert: WinCertificateUefiGuid =
            read_plain(&data[EFI_TIME_SIZE..]).ok_or(Error::SecurityViolation)?;
        let length = cert.length as usize;
        if length > data.len() - EFI_TIME_SIZE || length < WIN_CERT_UEFI_GUID_SIZE {
            return Err(Error::SecurityViolation);
        }

        let auth_size = EFI_TIME_SIZE + length;
        Ok(Self {
            timestamp,
            cert,
            cert_data: &data[OFFSET_OF_AUTHINFO2_CERT_DATA..auth_size],
            payload: &data[auth_size..],
        })
    }

    /// Bytes taken by the descriptor in front of the payload.
    pub fn auth_size(&self) -> usize {
        OFFSET_OF_AUTHINFO2_CERT_DATA + self.cert_data.len()
    }

    pub fn is_pkcs7(&self) -> bool {
        self.cert.certificate_type == WIN_CERT_TYPE_EFI_GUID
            && self.cert.cert_type() == CERT_TYPE_PKCS7_GUID
    }
}

/// Size of the payload behind an authentication descriptor, or the whole
/// buffer for unauthenticated writes.
pub fn payload_size(data: &[u8], attributes: Attributes) -> Result<usize> {
    if attributes.contains(Attributes::AUTHENTICATED_WRITE_ACCESS) {
        Ok(CounterAuth::parse(data)?.payload.len())
    } else if attributes.contains(Attributes::TIME_BASED_AUTHENTICATED_WRITE_ACCESS) {
        Ok(TimeAuth::parse(data)?.payload.len())
    } else {
        Ok(data.len())
    }
}

/// What a counter based write must be verified against.
pub struct CounterBasedRequest<'a> {
    pub auth: &'a CounterAuth<'a>,
}

impl CounterBasedRequest<'_> {
    pub fn is_rsa2048_sha256(&self) -> bool {
        self.auth.cert.cert_type() == CERT_TYPE_RSA2048_SHA256_GUID
    }

    /// Message covered by the signature: payload then little endian count.
    pub fn signed_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.auth.payload.len() + 8);
        data.extend_from_slice(self.auth.payload);
        data.extend_from_slice(&self.auth.monotonic_count.to_le_bytes());
        data
    }
}

/// Key material a time based write must be signed with.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Authority<'a> {
    /// Signature lists of the platform key, or the new key itself while in setup mode.
    PlatformKey(&'a [u8]),
    /// Signature lists of the key exchange key database.
    KeyExchangeKeys(&'a [u8]),
    /// Any signer, bound to the variable by the verifier.
    Private,
}

/// What a time based write must be verified against.
pub struct TimeBasedRequest<'a> {
    pub name: &'a [u16],
    pub guid: &'a Guid,
    pub attributes: Attributes,
    pub auth: &'a TimeAuth<'a>,
    pub authority: Authority<'a>,
}

impl TimeBasedRequest<'_> {
    /// Message covered by the PKCS7 signature:
    /// name without NUL, vendor GUID, attributes, timestamp, payload.
    pub fn signed_data(&self) -> Vec<u8> {
        let name = trim_name(self.name);
        let capacity = name.len() * 2 + 16 + 4 + EFI_TIME_SIZE + self.auth.payload.len();
        let mut data = Vec::with_capacity(capacity);
        for c in name {
            data.extend_from_slice(&c.to_le_bytes());
        }
        data.extend_from_slice(&guid_to_bytes(self.guid));
        data.extend_from_slice(&self.attributes.bits().to_le_bytes());
        data.extend_from_slice(&self.auth.timestamp.to_bytes());
        data.extend_from_slice(self.auth.payload);
        data
    }
}

/// Cryptographic checks of authenticated writes.
pub trait AuthVerifier: Send {
    /// RSA-2048/SHA-256 signature of [`CounterBasedRequest::signed_data`]
    /// under the public key in the descriptor.
    fn verify_counter_based(&self, request: &CounterBasedRequest<'_>) -> bool;

    /// PKCS7 signature of [`TimeBasedRequest::signed_data`] by the authority.
    fn verify_time_based(&self, request: &TimeBasedRequest<'_>) -> bool;
}

/// Verifier used until the platform provides one: every signature is bad.
#[derive(Clone, Copy, Debug, Default)]
pub struct RejectAll;

impl AuthVerifier for RejectAll {
    fn verify_counter_based(&self, _request: &CounterBasedRequest<'_>) -> bool {
        false
    }

    fn verify_time_based(&self, _request: &TimeBasedRequest<'_>) -> bool {
        false
    }
}

// EFI_SIGNATURE_LIST header: type, list size, header size, signature size
pub const SIGNATURE_LIST_HEADER_SIZE: usize = 28;

#[derive(Clone, Copy, Debug)]
struct SignatureList<'a> {
    kind: &'a [u8],
    list_size: usize,
    header_size: usize,
    signature_size: usize,
    raw: &'a [u8],
}

impl<'a> SignatureList<'a> {
    fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < SIGNATURE_LIST_HEADER_SIZE {
            return None;
        }
        let word = |at: usize| {
            u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]) as usize
        };
        let list_size = word(16);
        let header_size = word(20);
        let signature_size = word(24);
        if list_size > data.len()
            || signature_size == 0
            || SIGNATURE_LIST_HEADER_SIZE.checked_add(header_size)? > list_size
        {
            return None;
        }
        Some(Self {
            kind: &data[..16],
            list_size,
            header_size,
            signature_size,
            raw: &data[..list_size],
        })
    }

    fn lead(&self) -> &'a [u8] {
        &self.raw[..SIGNATURE_LIST_HEADER_SIZE + self.header_size]
    }

    fn signatures(&self) -> impl Iterator<Item = &'a [u8]> {
        let raw = self.raw;
        raw[SIGNATURE_LIST_HEADER_SIZE + self.header_size..].chunks_exact(self.signature_size)
    }
}

fn signature_lists(mut data: &[u8]) -> impl Iterator<Item = Option<SignatureList<'_>>> {
    core::iter::from_fn(move || {
        if data.is_empty() {
            return None;
        }
        match SignatureList::parse(data) {
            Some(list) => {
                data = &data[list.list_size..];
                Some(Some(list))
            }
            None => {
                data = &[];
                Some(None)
            }
        }
    })
}

/// Merge the signature lists in `new` into `existing`, dropping signatures
/// already present in a list of the same type and signature size.
///
/// Returns the merged buffer. `free` bounds the number of bytes that may be
/// added; running out of it gives `BufferTooSmall`.
pub fn append_signature_list(existing: &[u8], new: &[u8], mut free: usize) -> Result<Vec<u8>> {
    let known: Vec<SignatureList<'_>> = signature_lists(existing).map_while(|list| list).collect();

    let mut merged = existing.to_vec();
    for list in signature_lists(new) {
        let list = list.ok_or(Error::InvalidParameter)?;
        let mut lead_at = None;
        let mut copied = 0;

        for signature in list.signatures() {
            let duplicate = known
                .iter()
                .filter(|k| k.kind == list.kind && k.signature_size == list.signature_size)
                .any(|k| k.signatures().any(|s| s == signature));
            if duplicate {
                continue;
            }

            if lead_at.is_none() {
                let lead = list.lead();
                if free < lead.len() {
                    return Err(Error::BufferTooSmall);
                }
                lead_at = Some(merged.len());
                merged.extend_from_slice(lead);
                free -= lead.len();
            }
            if free < signature.len() {
                return Err(Error::BufferTooSmall);
            }
            merged.extend_from_slice(signature);
            free -= signature.len();
            copied += 1;
        }

        if let Some(at) = lead_at {
            let size = SIGNATURE_LIST_HEADER_SIZE + list.header_size + copied * list.signature_size;
            let size = size as u32;
            merged[at + 16..at + 20].copy_from_slice(&size.to_le_bytes());
        }
    }
    Ok(merged)
}

/// Public keys referenced by counter based variables, 1-based.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubKeyStore {
    keys: Vec<u8>,
}

impl PubKeyStore {
    /// Load from the key database payload. A single placeholder byte means empty.
    pub fn from_database(data: &[u8]) -> Self {
        let count = data.len() / RSA2048_KEY_SIZE;
        Self {
            keys: data[..count * RSA2048_KEY_SIZE].to_vec(),
        }
    }

    pub fn count(&self) -> usize {
        self.keys.len() / RSA2048_KEY_SIZE
    }

    pub fn key(&self, index: u32) -> Option<&[u8]> {
        let index = (index as usize).checked_sub(1)?;
        self.keys.get(index * RSA2048_KEY_SIZE..(index + 1) * RSA2048_KEY_SIZE)
    }

    /// 1-based index of `key`.
    pub fn find(&self, key: &[u8]) -> Option<u32> {
        self.keys
            .chunks_exact(RSA2048_KEY_SIZE)
            .position(|k| k == key)
            .map(|i| i as u32 + 1)
    }

    pub fn push(&mut self, key: &[u8]) -> u32 {
        let mut entry = [0; RSA2048_KEY_SIZE];
        let len = key.len().min(RSA2048_KEY_SIZE);
        entry[..len].copy_from_slice(&key[..len]);
        self.keys.extend_from_slice(&entry);
        self.count() as u32
    }

    /// Payload stored in the key database variable.
    pub fn database_bytes(&self) -> Vec<u8> {
        if self.keys.is_empty() {
            vec![0]
        } else {
            self.keys.clone()
        }
    }

    /// Keep only keys whose index appears in `referenced`.
    ///
    /// Returns the trimmed store and a table mapping each old index (the
    /// table position, 0 unused) to its new index, 0 for dropped keys.
    pub fn filter(&self, referenced: &[u32]) -> (PubKeyStore, Vec<u32>) {
        let mut kept = PubKeyStore::default();
        let mut remap = vec![0; self.count() + 1];
        for (i, key) in self.keys.chunks_exact(RSA2048_KEY_SIZE).enumerate() {
            let old = i as u32 + 1;
            if referenced.contains(&old) {
                remap[old as usize] = kept.push(key);
            }
        }
        (kept, remap)
    }
}

/// How many keys fit in the key database variable named `name_size` bytes.
pub fn max_keys(max_variable_size: usize, name_size: usize) -> usize {
    max_variable_size.saturating_sub(VARIABLE_HEADER_SIZE + name_size) / RSA2048_KEY_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::{guid_to_bytes, CERT_SHA256_GUID, GLOBAL_VARIABLE_GUID};
    use crate::variable::ucs2;

    fn stamp(year: u16, second: u8) -> EfiTime {
        EfiTime {
            year,
            month: 1,
            day: 1,
            second,
            ..EfiTime::default()
        }
    }

    fn time_auth(timestamp: EfiTime, cert_data: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut data = timestamp.to_bytes().to_vec();
        data.extend_from_slice(&((WIN_CERT_UEFI_GUID_SIZE + cert_data.len()) as u32).to_le_bytes());
        data.extend_from_slice(&0x0200u16.to_le_bytes());
        data.extend_from_slice(&WIN_CERT_TYPE_EFI_GUID.to_le_bytes());
        data.extend_from_slice(&guid_to_bytes(&CERT_TYPE_PKCS7_GUID));
        data.extend_from_slice(cert_data);
        data.extend_from_slice(payload);
        data
    }

    fn signature_list(entries: &[[u8; 4]]) -> Vec<u8> {
        let mut list = guid_to_bytes(&CERT_SHA256_GUID).to_vec();
        let list_size = (SIGNATURE_LIST_HEADER_SIZE + entries.len() * 4) as u32;
        list.extend_from_slice(&list_size.to_le_bytes());
        list.extend_from_slice(&0u32.to_le_bytes());
        list.extend_from_slice(&4u32.to_le_bytes());
        for entry in entries {
            list.extend_from_slice(entry);
        }
        list
    }

    #[test]
    fn test_layout() {
        assert_eq!(EFI_TIME_SIZE, 16);
        assert_eq!(WIN_CERT_UEFI_GUID_SIZE, 24);
        assert_eq!(AUTHINFO_SIZE, 560);
        assert_eq!(OFFSET_OF_AUTHINFO2_CERT_DATA, 40);
    }

    #[test]
    fn test_timestamps() {
        let time = EfiTime {
            year: 2024,
            month: 5,
            day: 17,
            hour: 9,
            minute: 30,
            second: 12,
            ..EfiTime::default()
        };
        assert_eq!(EfiTime::from_bytes(&time.to_bytes()), time);
        assert!(time.is_valid_stamp());
        assert!(!EfiTime { nanosecond: 1, ..time }.is_valid_stamp());

        assert!(stamp(2024, 1).is_later_than(&stamp(2023, 59)));
        assert!(stamp(2024, 2).is_later_than(&stamp(2024, 1)));
        assert!(!stamp(2024, 1).is_later_than(&stamp(2024, 1)));
    }

    #[test]
    fn test_counter_auth() {
        let mut data = vec![0u8; AUTHINFO_SIZE + 3];
        data[..8].copy_from_slice(&7u64.to_le_bytes());
        data[PUBLIC_KEY_OFFSET] = 0xAB;
        data[AUTHINFO_SIZE..].copy_from_slice(&[1, 2, 3]);

        let auth = CounterAuth::parse(&data).unwrap();
        assert_eq!(auth.monotonic_count, 7);
        assert_eq!(auth.public_key[0], 0xAB);
        assert_eq!(auth.public_key.len(), 256);
        assert_eq!(auth.payload, &[1, 2, 3]);
        assert_eq!(
            CounterBasedRequest { auth: &auth }.signed_data(),
            vec![1, 2, 3, 7, 0, 0, 0, 0, 0, 0, 0]
        );

        assert_eq!(CounterAuth::parse(&data[..559]).unwrap_err(), Error::SecurityViolation);
        assert!(CounterAuth::parse(&data[..560]).unwrap().is_deletion());
    }

    #[test]
    fn test_time_auth() {
        let data = time_auth(stamp(2024, 0), &[9; 10], &[5, 6]);
        let auth = TimeAuth::parse(&data).unwrap();
        assert!(auth.is_pkcs7());
        assert_eq!(auth.cert_data, &[9; 10]);
        assert_eq!(auth.payload, &[5, 6]);
        assert_eq!(auth.auth_size(), 50);
        assert_eq!(payload_size(&data, Attributes::NV_BS_RT_AT), Ok(2));

        let request = TimeBasedRequest {
            name: &ucs2("db"),
            guid: &GLOBAL_VARIABLE_GUID,
            attributes: Attributes::NV_BS_RT_AT,
            auth: &auth,
            authority: Authority::Private,
        };
        let signed = request.signed_data();
        assert_eq!(&signed[..4], &[b'd', 0, b'b', 0]);
        assert_eq!(signed.len(), 4 + 16 + 4 + 16 + 2);

        // Declared certificate longer than the buffer
        let mut bad = data.clone();
        bad[16..20].copy_from_slice(&100u32.to_le_bytes());
        assert_eq!(TimeAuth::parse(&bad).unwrap_err(), Error::SecurityViolation);
        bad[16..20].copy_from_slice(&8u32.to_le_bytes());
        assert_eq!(TimeAuth::parse(&bad).unwrap_err(), Error::SecurityViolation);
        assert_eq!(TimeAuth::parse(&data[..39]).unwrap_err(), Error::SecurityViolation);
    }

    #[test]
    fn test_append_signature_list() {
        let existing = signature_list(&[[1; 4], [2; 4]]);

        // All duplicates leave the data untouched
        let duplicates = signature_list(&[[2; 4], [1; 4]]);
        let merged = append_signature_list(&existing, &duplicates, 0x100).unwrap();
        assert_eq!(merged, existing);

        let mixed = signature_list(&[[2; 4], [3; 4]]);
        let merged = append_signature_list(&existing, &mixed, 0x100).unwrap();
        let mut expected = existing.clone();
        expected.extend_from_slice(&signature_list(&[[3; 4]]));
        assert_eq!(merged, expected);

        assert_eq!(
            append_signature_list(&existing, &signature_list(&[[4; 4]]), 30).unwrap_err(),
            Error::BufferTooSmall
        );
        assert_eq!(
            append_signature_list(&existing, &[0; 12], 0x100).unwrap_err(),
            Error::InvalidParameter
        );
    }

    #[test]
    fn test_pub_key_store() {
        let mut store = PubKeyStore::from_database(&[0]);
        assert_eq!(store.count(), 0);
        assert_eq!(store.database_bytes(), vec![0]);

        assert_eq!(store.push(&[1; 256]), 1);
        assert_eq!(store.push(&[2; 256]), 2);
        assert_eq!(store.push(&[3; 256]), 3);
        assert_eq!(store.find(&[2; 256]), Some(2));
        assert_eq!(store.key(3), Some(&[3u8; 256][..]));
        assert_eq!(store.key(0), None);

        let (kept, remap) = store.filter(&[3, 1]);
        assert_eq!(kept.count(), 2);
        assert_eq!(remap, vec![0, 1, 0, 2]);
        assert_eq!(kept.key(2), Some(&[3u8; 256][..]));

        assert_eq!(max_keys(0x400, 38), (0x400 - 60 - 38) / 256);
    }
}
