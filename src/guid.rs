// SPDX-License-Identifier: GPL-3.0-only

use core::fmt;
use uefi::guid::Guid;

// EFI_GLOBAL_VARIABLE
pub const GLOBAL_VARIABLE_GUID: Guid = Guid(
    0x8BE4DF61,
    0x93CA,
    0x11D2,
    [0xAA, 0x0D, 0x00, 0xE0, 0x98, 0x03, 0x2B, 0x8C],
);

// EFI_HARDWARE_ERROR_VARIABLE
pub const HARDWARE_ERROR_VARIABLE_GUID: Guid = Guid(
    0x414E6BDD,
    0xE47B,
    0x47CC,
    [0xB2, 0x44, 0xBB, 0x61, 0x02, 0x0C, 0xF5, 0x16],
);

// EFI_IMAGE_SECURITY_DATABASE_GUID
pub const IMAGE_SECURITY_DATABASE_GUID: Guid = Guid(
    0xD719B2CB,
    0x3D3A,
    0x4596,
    [0xA3, 0xBC, 0xDA, 0xD0, 0x0E, 0x67, 0x65, 0x6F],
);

// Signature of authenticated variable stores, also the namespace of the key database
pub const AUTHENTICATED_VARIABLE_GUID: Guid = Guid(
    0xAAF32C78,
    0x947B,
    0x439A,
    [0xA1, 0x80, 0x2E, 0x14, 0x4E, 0xC3, 0x77, 0x92],
);

// EFI_SYSTEM_NV_DATA_FV_GUID
pub const SYSTEM_NV_DATA_FV_GUID: Guid = Guid(
    0xFFF12B8D,
    0x7696,
    0x4C8B,
    [0xA9, 0x85, 0x27, 0x47, 0x07, 0x5B, 0x4F, 0x50],
);

// EFI_CERT_TYPE_RSA2048_SHA256_GUID
pub const CERT_TYPE_RSA2048_SHA256_GUID: Guid = Guid(
    0xA7717414,
    0xC616,
    0x4977,
    [0x94, 0x20, 0x84, 0x47, 0x12, 0xA7, 0x35, 0xBF],
);

// EFI_CERT_TYPE_PKCS7_GUID
pub const CERT_TYPE_PKCS7_GUID: Guid = Guid(
    0x4AAFD29D,
    0x68DF,
    0x49EE,
    [0x8A, 0xA9, 0x34, 0x7D, 0x37, 0x56, 0x65, 0xA7],
);

// EFI_CERT_SHA256_GUID
pub const CERT_SHA256_GUID: Guid = Guid(
    0xC1C41626,
    0x504C,
    0x4092,
    [0xAC, 0xA9, 0x41, 0xF9, 0x36, 0x93, 0x43, 0x28],
);

/// Decode a GUID from its 16 byte on-disk encoding.
pub fn guid_from_bytes(bytes: &[u8; 16]) -> Guid {
    let mut tail = [0; 8];
    tail.copy_from_slice(&bytes[8..]);
    Guid(
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        u16::from_le_bytes([bytes[4], bytes[5]]),
        u16::from_le_bytes([bytes[6], bytes[7]]),
        tail,
    )
}

/// Encode a GUID into its 16 byte on-disk form.
pub fn guid_to_bytes(guid: &Guid) -> [u8; 16] {
    let mut bytes = [0; 16];
    bytes[..4].copy_from_slice(&guid.0.to_le_bytes());
    bytes[4..6].copy_from_slice(&guid.1.to_le_bytes());
    bytes[6..8].copy_from_slice(&guid.2.to_le_bytes());
    bytes[8..].copy_from_slice(&guid.3);
    bytes
}

/// Registry format for logs, `8BE4DF61-93CA-11D2-AA0D-00E098032B8C`.
pub struct GuidFmt<'a>(pub &'a Guid);

impl fmt::Display for GuidFmt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = self.0;
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-",
            g.0, g.1, g.2, g.3[0], g.3[1]
        )?;
        for b in &g.3[2..] {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_guid_bytes() {
        let bytes = guid_to_bytes(&AUTHENTICATED_VARIABLE_GUID);
        assert_eq!(&bytes[..4], &[0x78, 0x2C, 0xF3, 0xAA]);
        assert_eq!(guid_from_bytes(&bytes), AUTHENTICATED_VARIABLE_GUID);
    }

    #[test]
    fn test_guid_display() {
        assert_eq!(
            GuidFmt(&GLOBAL_VARIABLE_GUID).to_string(),
            "8BE4DF61-93CA-11D2-AA0D-00E098032B8C"
        );
    }
}
