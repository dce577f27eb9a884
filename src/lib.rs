// SPDX-License-Identifier: GPL-3.0-only

//! UEFI authenticated variable store.
//!
//! The on-flash format is the EDK2 authenticated variable store inside a
//! firmware volume. [`VariableStoreEngine`] implements the variable runtime
//! services on top of it; [`VariableServices`] wraps an engine for callers
//! that may race each other.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::missing_safety_doc)]

#[macro_use]
extern crate alloc;

pub mod auth;
mod authenticated;
pub mod config;
pub mod engine;
pub mod error;
pub mod flash;
#[cfg(test)]
mod fixture;
pub mod guid;
pub mod info;
pub mod lang;
pub mod policy;
mod reclaim;
pub mod services;
pub mod store;
mod update;
pub mod variable;
pub mod volume;

pub use crate::auth::{AuthVerifier, CounterBasedRequest, EfiTime, TimeBasedRequest};
pub use crate::config::VariableConfig;
pub use crate::engine::{BootPhase, Platform, VariableStorageInfo, VariableStoreEngine};
pub use crate::error::{Error, Result};
pub use crate::flash::{
    FaultTolerantWrite, FirmwareVolumeBlock, FtwLastWrite, MemoryFlash, VariableFlash,
};
pub use crate::services::VariableServices;
pub use crate::variable::Attributes;
