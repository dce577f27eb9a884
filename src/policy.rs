// SPDX-License-Identifier: GPL-3.0-only

//! Which variables may be written, with which attributes, and by whom.

use alloc::vec::Vec;
use uefi::guid::Guid;

use crate::error::{Error, Result};
use crate::guid::{
    GuidFmt, AUTHENTICATED_VARIABLE_GUID, GLOBAL_VARIABLE_GUID, HARDWARE_ERROR_VARIABLE_GUID,
};
use crate::variable::{name_eq, trim_name, Attributes};

pub const PLATFORM_KEY_NAME: &str = "PK";
pub const KEY_EXCHANGE_KEY_NAME: &str = "KEK";
pub const IMAGE_SECURITY_DATABASE: &str = "db";
pub const IMAGE_SECURITY_DATABASE1: &str = "dbx";
pub const LANG_NAME: &str = "Lang";
pub const LANG_CODES_NAME: &str = "LangCodes";
pub const PLATFORM_LANG_NAME: &str = "PlatformLang";
pub const PLATFORM_LANG_CODES_NAME: &str = "PlatformLangCodes";
pub const PUB_KEY_DB_NAME: &str = "AuthVarKeyDatabase";

const BS_RT: Attributes = Attributes::BS_RT;
const NV_BS_RT: Attributes = Attributes::NV_BS_RT;
const NV_BS_RT_AT: Attributes = Attributes::NV_BS_RT_AT;

// Variables defined under the global GUID and the only attributes they may carry
static GLOBAL_VARIABLES: &[(&str, Attributes)] = &[
    (LANG_CODES_NAME, BS_RT),
    (LANG_NAME, NV_BS_RT),
    ("Timeout", NV_BS_RT),
    (PLATFORM_LANG_CODES_NAME, BS_RT),
    (PLATFORM_LANG_NAME, NV_BS_RT),
    ("ConIn", NV_BS_RT),
    ("ConOut", NV_BS_RT),
    ("ErrOut", NV_BS_RT),
    ("ConInDev", BS_RT),
    ("ConOutDev", BS_RT),
    ("ErrOutDev", BS_RT),
    ("BootOrder", NV_BS_RT),
    ("BootNext", NV_BS_RT),
    ("BootCurrent", BS_RT),
    ("BootOptionSupport", BS_RT),
    ("DriverOrder", NV_BS_RT),
    ("HwErrRecSupport", NV_BS_RT),
    ("SetupMode", BS_RT),
    (KEY_EXCHANGE_KEY_NAME, NV_BS_RT_AT),
    (PLATFORM_KEY_NAME, NV_BS_RT_AT),
    ("SignatureSupport", BS_RT),
    ("SecureBoot", BS_RT),
    ("KEKDefault", BS_RT),
    ("PKDefault", BS_RT),
    ("dbDefault", BS_RT),
    ("dbxDefault", BS_RT),
    ("dbtDefault", BS_RT),
    ("OsIndicationsSupported", BS_RT),
    ("OsIndications", NV_BS_RT),
    ("VendorKeys", BS_RT),
];

// Prefixes followed by four hex digits
static GLOBAL_VARIABLE_PATTERNS: &[(&str, Attributes)] = &[
    ("Boot", NV_BS_RT),
    ("Driver", NV_BS_RT),
    ("Key", NV_BS_RT),
];

static READ_ONLY_GLOBAL_VARIABLES: &[&str] = &[
    "SetupMode",
    "SignatureSupport",
    "SecureBoot",
    "VendorKeys",
    "KEKDefault",
    "PKDefault",
    "dbDefault",
    "dbxDefault",
    "dbtDefault",
];

fn is_hex_digit(c: u16) -> bool {
    matches!(c, 0x30..=0x39 | 0x41..=0x46 | 0x61..=0x66)
}

/// `prefix` followed by exactly four hex digits.
fn matches_pattern(name: &[u16], prefix: &str) -> bool {
    let prefix_len = prefix.encode_utf16().count();
    name.len() == prefix_len + 4
        && name[..prefix_len].iter().copied().eq(prefix.encode_utf16())
        && name[prefix_len..].iter().all(|&c| is_hex_digit(c))
}

fn attributes_match(attributes: Attributes, required: Attributes) -> bool {
    attributes.is_empty() || attributes - Attributes::APPEND_WRITE == required
}

/// Variables under the global GUID must be one of the defined ones, written
/// with exactly the attributes defined for it. Attributes of 0 (a delete)
/// only need the name to be known.
pub fn check_efi_global_variable(name: &[u16], guid: &Guid, attributes: Attributes) -> Result<()> {
    if *guid != GLOBAL_VARIABLE_GUID {
        return Ok(());
    }
    let name = trim_name(name);

    let listed = GLOBAL_VARIABLES
        .iter()
        .any(|&(n, required)| name_eq(name, n) && attributes_match(attributes, required));
    let patterned = GLOBAL_VARIABLE_PATTERNS
        .iter()
        .any(|&(prefix, required)| {
            matches_pattern(name, prefix) && attributes_match(attributes, required)
        });
    if listed || patterned {
        return Ok(());
    }

    log::warn!(
        "Variable: set global variable with invalid name or attributes - {}:{}:{:#x}",
        GuidFmt(guid),
        NameFmt(name),
        attributes.bits()
    );
    Err(Error::InvalidParameter)
}

/// Variables no caller may set through the public interface.
pub fn is_read_only_variable(name: &[u16], guid: &Guid) -> bool {
    if *guid == GLOBAL_VARIABLE_GUID {
        READ_ONLY_GLOBAL_VARIABLES.iter().any(|n| name_eq(name, n))
    } else {
        *guid == AUTHENTICATED_VARIABLE_GUID && name_eq(name, PUB_KEY_DB_NAME)
    }
}

/// `HwErrRec####` under the hardware error GUID.
pub fn is_hw_err_rec_variable(name: &[u16], guid: &Guid) -> bool {
    *guid == HARDWARE_ERROR_VARIABLE_GUID && matches_pattern(trim_name(name), "HwErrRec")
}

/// Identities that become read-only once EndOfDxe is signaled.
#[derive(Clone, Debug, Default)]
pub struct LockList {
    entries: Vec<(Vec<u16>, Guid)>,
}

impl LockList {
    pub fn push(&mut self, name: &[u16], guid: &Guid) {
        log::debug!("Variable: lock {}:{}", GuidFmt(guid), NameFmt(name));
        self.entries.push((trim_name(name).to_vec(), *guid));
    }

    pub fn contains(&self, name: &[u16], guid: &Guid) -> bool {
        let name = trim_name(name);
        self.entries.iter().any(|(n, g)| g == guid && n.as_slice() == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Lossy display of a UCS-2 name for logs.
pub struct NameFmt<'a>(pub &'a [u16]);

impl core::fmt::Display for NameFmt<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for c in char::decode_utf16(trim_name(self.0).iter().copied()) {
            write!(f, "{}", c.unwrap_or(char::REPLACEMENT_CHARACTER))?;
        }
        Ok(())
    }
}
