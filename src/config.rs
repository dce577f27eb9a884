// SPDX-License-Identifier: GPL-3.0-only

use crate::error::{Error, Result};
use crate::variable::VARIABLE_HEADER_SIZE;

/// Platform limits and switches for the variable services.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VariableConfig {
    /// Largest common variable, header included.
    pub max_variable_size: usize,
    /// Largest hardware error record variable, header included.
    pub max_hw_err_variable_size: usize,
    /// Part of the non-volatile store reserved for hardware error records.
    pub hw_err_storage_size: usize,
    pub volatile_store_size: usize,
    /// Keep per-variable access counters until runtime.
    pub collect_statistics: bool,
    /// Honor locks registered with `request_to_lock` after EndOfDxe.
    pub enable_locking: bool,
}

impl Default for VariableConfig {
    fn default() -> Self {
        Self {
            max_variable_size: 0x400,
            max_hw_err_variable_size: 0x8000,
            hw_err_storage_size: 0,
            volatile_store_size: 0x10000,
            collect_statistics: false,
            enable_locking: true,
        }
    }
}

impl VariableConfig {
    /// Size of the buffer used to assemble a record before it is written.
    pub fn scratch_size(&self) -> usize {
        self.max_variable_size.max(self.max_hw_err_variable_size)
    }

    /// Check the limits against a non-volatile store of `nv_store_size` bytes.
    pub fn validate(&self, nv_store_size: usize) -> Result<()> {
        if self.hw_err_storage_size > nv_store_size {
            log::error!(
                "Variable: HW error quota {:#x} exceeds store size {:#x}",
                self.hw_err_storage_size,
                nv_store_size
            );
            return Err(Error::InvalidParameter);
        }
        if self.scratch_size() >= nv_store_size {
            log::error!(
                "Variable: maximum variable size {:#x} does not fit store size {:#x}",
                self.scratch_size(),
                nv_store_size
            );
            return Err(Error::InvalidParameter);
        }
        if self.max_variable_size <= VARIABLE_HEADER_SIZE
            || self.volatile_store_size <= VARIABLE_HEADER_SIZE
        {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VariableConfig::default();
        assert_eq!(config.scratch_size(), 0x8000);
        assert!(config.validate(0x10000).is_ok());
        assert_eq!(config.validate(0x8000), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_hw_err_quota() {
        let config = VariableConfig {
            hw_err_storage_size: 0x2000,
            max_hw_err_variable_size: 0x400,
            ..VariableConfig::default()
        };
        assert!(config.validate(0x4000).is_ok());
        assert_eq!(config.validate(0x1000), Err(Error::InvalidParameter));
    }
}
