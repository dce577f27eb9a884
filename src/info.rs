// SPDX-License-Identifier: GPL-3.0-only

use alloc::vec::Vec;
use uefi::guid::Guid;

use crate::variable::trim_name;

/// Kind of access being counted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
    Delete,
    Cache,
}

/// Access counters of one variable.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VariableInfoEntry {
    pub guid: Guid,
    pub name: Vec<u16>,
    pub volatile: bool,
    pub read_count: u32,
    pub write_count: u32,
    pub delete_count: u32,
    pub cache_count: u32,
}

/// Per variable statistics, gathered during boot only.
#[derive(Clone, Debug, Default)]
pub struct VariableInfo {
    enabled: bool,
    entries: Vec<VariableInfoEntry>,
}

impl VariableInfo {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: Vec::new(),
        }
    }

    pub fn record(
        &mut self,
        name: &[u16],
        guid: &Guid,
        volatile: bool,
        access: Access,
        at_runtime: bool,
    ) {
        if !self.enabled || at_runtime {
            return;
        }

        let name = trim_name(name);
        let index = match self
            .entries
            .iter()
            .position(|e| e.guid == *guid && e.name.as_slice() == name)
        {
            Some(index) => index,
            None => {
                self.entries.push(VariableInfoEntry {
                    guid: *guid,
                    name: name.to_vec(),
                    volatile,
                    read_count: 0,
                    write_count: 0,
                    delete_count: 0,
                    cache_count: 0,
                });
                self.entries.len() - 1
            }
        };

        let entry = &mut self.entries[index];
        match access {
            Access::Read => entry.read_count += 1,
            Access::Write => entry.write_count += 1,
            Access::Delete => entry.delete_count += 1,
            Access::Cache => entry.cache_count += 1,
        }
    }

    pub fn entries(&self) -> &[VariableInfoEntry] {
        &self.entries
    }
}
