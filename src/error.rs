// SPDX-License-Identifier: GPL-3.0-only

use core::fmt;
use uefi::status::Status;

const ERROR_BIT: usize = 1 << (usize::BITS - 1);

/// Failure reported by the variable services.
///
/// Each variant maps onto the UEFI status code a caller of the runtime
/// services would observe, see [`Error::status`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    InvalidParameter,
    Unsupported,
    BufferTooSmall,
    NotReady,
    DeviceError,
    WriteProtected,
    OutOfResources,
    VolumeCorrupted,
    NotFound,
    AccessDenied,
    SecurityViolation,
    /// Write services have not been installed yet.
    NotAvailableYet,
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Encoded UEFI error code, without the error bit.
    pub fn code(self) -> usize {
        match self {
            Error::InvalidParameter => 2,
            Error::Unsupported => 3,
            Error::BufferTooSmall => 5,
            Error::NotReady => 6,
            Error::DeviceError => 7,
            Error::WriteProtected => 8,
            Error::OutOfResources => 9,
            Error::VolumeCorrupted => 10,
            Error::NotFound => 14,
            Error::AccessDenied => 15,
            Error::SecurityViolation => 26,
            Error::NotAvailableYet => 32,
        }
    }

    pub fn status(self) -> Status {
        Status(ERROR_BIT | self.code())
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        err.status()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::InvalidParameter => "invalid parameter",
            Error::Unsupported => "unsupported",
            Error::BufferTooSmall => "buffer too small",
            Error::NotReady => "not ready",
            Error::DeviceError => "device error",
            Error::WriteProtected => "write protected",
            Error::OutOfResources => "out of resources",
            Error::VolumeCorrupted => "volume corrupted",
            Error::NotFound => "not found",
            Error::AccessDenied => "access denied",
            Error::SecurityViolation => "security violation",
            Error::NotAvailableYet => "not available yet",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_encoding() {
        assert_eq!(Error::NotFound.status().0, ERROR_BIT | 14);
        assert_eq!(Status::from(Error::SecurityViolation).0, ERROR_BIT | 26);
        assert_eq!(Error::NotAvailableYet.code(), 32);
    }
}
