// SPDX-License-Identifier: GPL-3.0-only

//! Runtime services entry points.
//!
//! Every service call takes the engine lock. At runtime a call that finds
//! the lock held returns `NotReady` instead of spinning, since the holder may
//! be the code it interrupted.

use alloc::boxed::Box;
use alloc::sync::Arc;
use spin::Mutex;
use uefi::guid::Guid;

use crate::auth::AuthVerifier;
use crate::engine::{Platform, VariableStorageInfo, VariableStoreEngine};
use crate::error::{Error, Result};
use crate::flash::VariableFlash;
use crate::variable::Attributes;

pub struct VariableServices {
    engine: Mutex<VariableStoreEngine>,
    platform: Arc<dyn Platform>,
}

impl VariableServices {
    pub fn new(engine: VariableStoreEngine) -> Self {
        Self {
            platform: engine.platform(),
            engine: Mutex::new(engine),
        }
    }

    /// Run `f` with the engine locked.
    pub fn with<T>(&self, f: impl FnOnce(&mut VariableStoreEngine) -> Result<T>) -> Result<T> {
        if self.platform.at_runtime() {
            let mut engine = self.engine.try_lock().ok_or(Error::NotReady)?;
            f(&mut engine)
        } else {
            f(&mut self.engine.lock())
        }
    }

    pub fn get_variable(
        &self,
        name: &[u16],
        guid: &Guid,
        attributes: Option<&mut Attributes>,
        data_size: &mut usize,
        data: Option<&mut [u8]>,
    ) -> Result<()> {
        self.with(|engine| engine.get_variable(name, guid, attributes, data_size, data))
    }

    pub fn get_next_variable_name(
        &self,
        name_size: &mut usize,
        name: &mut [u16],
        guid: &mut Guid,
    ) -> Result<()> {
        self.with(|engine| engine.get_next_variable_name(name_size, name, guid))
    }

    pub fn set_variable(
        &self,
        name: &[u16],
        guid: &Guid,
        attributes: Attributes,
        data: &[u8],
    ) -> Result<()> {
        self.with(|engine| engine.set_variable(name, guid, attributes, data))
    }

    pub fn query_variable_info(&self, attributes: Attributes) -> Result<VariableStorageInfo> {
        self.with(|engine| engine.query_variable_info(attributes))
    }

    pub fn request_to_lock(&self, name: &[u16], guid: &Guid) -> Result<()> {
        self.with(|engine| engine.request_to_lock(name, guid))
    }

    pub fn install_write_services(&self, flash: Box<dyn VariableFlash>) -> Result<()> {
        self.with(|engine| engine.install_write_services(flash))
    }

    pub fn set_verifier(&self, verifier: Box<dyn AuthVerifier>) {
        self.engine.lock().set_verifier(verifier);
    }

    pub fn signal_end_of_dxe(&self) {
        self.engine.lock().signal_end_of_dxe();
    }

    pub fn ready_to_boot(&self) {
        self.engine.lock().ready_to_boot();
    }

    pub fn exit_boot_services(&self) {
        self.engine.lock().exit_boot_services();
    }
}
