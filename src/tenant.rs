// Copyright © 2026 The vqsched Authors
//
// SPDX-License-Identifier: Apache-2.0
//
//! Tenant directory: registration state and primary/auxiliary grouping.
//!
//! An auxiliary tenant contributes only its mailbox and interrupt vectors to
//! a primary tenant; it holds no resources of its own. Requests that name an
//! owner are validated against this grouping.

use crate::{Error, Result, MAX_TENANTS};

/// Mailbox interface version spoken by this PF.
pub const INTERFACE_VERSION: u32 = 1;

#[derive(Default, Clone)]
pub struct TenantEntry {
    pub registered: bool,
    pub interface_version: u32,
    pub aux_of: Option<usize>,
    pub pasid: Option<u32>,
}

pub struct Directory {
    entries: Vec<TenantEntry>,
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory {
    pub fn new() -> Self {
        Directory {
            entries: vec![TenantEntry::default(); MAX_TENANTS],
        }
    }

    pub fn entry(&self, id: usize) -> Result<&TenantEntry> {
        self.entries.get(id).ok_or(Error::InvalidArgument)
    }

    fn entry_mut(&mut self, id: usize) -> Result<&mut TenantEntry> {
        self.entries.get_mut(id).ok_or(Error::InvalidArgument)
    }

    /// Version negotiation: the tenant may speak an older interface, never a
    /// newer one.
    pub fn register(&mut self, id: usize, version: u32) -> Result<()> {
        if version > INTERFACE_VERSION {
            return Err(Error::NotSupported);
        }
        let e = self.entry_mut(id)?;
        e.registered = true;
        e.interface_version = version;
        info!("tenant {id}: registered (interface version {version})");
        Ok(())
    }

    /// Idempotent.
    pub fn unregister(&mut self, id: usize) -> Result<()> {
        let e = self.entry_mut(id)?;
        if e.registered {
            info!("tenant {id}: unregistered");
        }
        e.registered = false;
        e.pasid = None;
        Ok(())
    }

    pub fn is_registered(&self, id: usize) -> bool {
        self.entries.get(id).map(|e| e.registered).unwrap_or(false)
    }

    pub fn set_pasid(&mut self, id: usize, pasid: Option<u32>) -> Result<()> {
        self.entry_mut(id)?.pasid = pasid;
        Ok(())
    }

    /// Effective resource owner: an auxiliary tenant acts for its primary.
    pub fn primary_of(&self, id: usize) -> usize {
        self.entries
            .get(id)
            .and_then(|e| e.aux_of)
            .unwrap_or(id)
    }

    pub fn is_aux(&self, id: usize) -> bool {
        self.entries.get(id).map(|e| e.aux_of.is_some()).unwrap_or(false)
    }

    pub fn aux_ids(&self, primary: usize) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.aux_of == Some(primary))
            .map(|(i, _)| i)
            .collect()
    }

    /// Link `target` as an auxiliary of `primary`. Already linked to the same
    /// primary is a no-op; linked elsewhere is rejected.
    pub fn link_aux(&mut self, primary: usize, target: usize) -> Result<()> {
        if primary >= MAX_TENANTS || target >= MAX_TENANTS || primary == target {
            return Err(Error::InvalidArgument);
        }
        match self.entries[target].aux_of {
            Some(p) if p == primary => Ok(()),
            Some(_) => Err(Error::Busy),
            None => {
                self.entries[target].aux_of = Some(primary);
                Ok(())
            }
        }
    }

    pub fn unlink_aux(&mut self, target: usize) -> Result<()> {
        self.entry_mut(target)?.aux_of = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_gate() {
        let mut dir = Directory::new();
        assert_eq!(
            dir.register(0, INTERFACE_VERSION + 1),
            Err(Error::NotSupported)
        );
        assert!(!dir.is_registered(0));
        dir.register(0, INTERFACE_VERSION).unwrap();
        assert!(dir.is_registered(0));
    }

    #[test]
    fn unregister_is_idempotent() {
        let mut dir = Directory::new();
        dir.register(3, 1).unwrap();
        dir.unregister(3).unwrap();
        dir.unregister(3).unwrap();
        assert!(!dir.is_registered(3));
    }

    #[test]
    fn aux_linkage_rules() {
        let mut dir = Directory::new();
        assert_eq!(dir.link_aux(1, 1), Err(Error::InvalidArgument));
        assert_eq!(dir.link_aux(1, MAX_TENANTS), Err(Error::InvalidArgument));

        dir.link_aux(1, 2).unwrap();
        // Repeating the same link is a no-op; a different primary is not.
        dir.link_aux(1, 2).unwrap();
        assert_eq!(dir.link_aux(0, 2), Err(Error::Busy));

        assert_eq!(dir.primary_of(2), 1);
        assert_eq!(dir.aux_ids(1), vec![2]);
        dir.unlink_aux(2).unwrap();
        assert_eq!(dir.primary_of(2), 2);
    }
}
