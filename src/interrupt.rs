// Copyright © 2026 The vqsched Authors
//
// SPDX-License-Identifier: Apache-2.0
//
//! Virtual MSI-X block.
//!
//! Vector 0 is the mailbox/control channel; the CQ interrupt for virtual port
//! index N is delivered on vector N+1. Delivery while a vector is masked, or
//! while the function-wide mask is set, latches the pending bit; unmasking
//! flushes pending vectors in index order.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use vmm_sys_util::eventfd::EventFd;

use crate::{Error, Result};

pub const MSIX_VECTORS: usize = 256;
const MSIX_TABLE_ENTRIES_MODULO: u64 = 16;
const MSIX_PBA_ENTRIES_MODULO: u64 = 8;
const BITS_PER_PBA_ENTRY: usize = 64;

/// Per-entry vector control mask bit.
const VECTOR_CTL_MASK_BIT: u32 = 0x1;

/// Delivery capability for one vector.
pub trait InterruptNotifier: Send + Sync {
    fn notify(&self) -> std::io::Result<()>;
}

impl InterruptNotifier for EventFd {
    fn notify(&self) -> std::io::Result<()> {
        self.write(1)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MsixTableEntry {
    pub msg_addr_lo: u32,
    pub msg_addr_hi: u32,
    pub msg_data: u32,
    pub vector_ctl: u32,
}

impl MsixTableEntry {
    fn masked(&self) -> bool {
        self.vector_ctl & VECTOR_CTL_MASK_BIT != 0
    }
}

pub struct MsixBlock {
    table_entries: Vec<MsixTableEntry>,
    pba_entries: Vec<u64>,
    notifiers: Vec<Option<Arc<dyn InterruptNotifier>>>,
    enabled: bool,
    func_masked: bool,
}

impl Default for MsixBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl MsixBlock {
    pub fn new() -> Self {
        let mut table_entries: Vec<MsixTableEntry> = Vec::new();
        table_entries.resize_with(MSIX_VECTORS, Default::default);
        let mut pba_entries: Vec<u64> = Vec::new();
        pba_entries.resize_with(MSIX_VECTORS / BITS_PER_PBA_ENTRY, Default::default);
        let mut notifiers: Vec<Option<Arc<dyn InterruptNotifier>>> = Vec::new();
        notifiers.resize_with(MSIX_VECTORS, Default::default);

        MsixBlock {
            table_entries,
            pba_entries,
            notifiers,
            enabled: false,
            func_masked: false,
        }
    }

    pub fn set_notifier(&mut self, vector: usize, notifier: Option<Arc<dyn InterruptNotifier>>) {
        if vector < MSIX_VECTORS {
            self.notifiers[vector] = notifier;
        }
    }

    pub fn clear_notifiers(&mut self) {
        for n in self.notifiers.iter_mut() {
            *n = None;
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Update from the MSI-X message-control register, then flush anything a
    /// newly cleared mask released.
    pub fn set_msg_ctrl(&mut self, enabled: bool, func_masked: bool) {
        self.enabled = enabled;
        self.func_masked = func_masked;
        if self.enabled && !self.func_masked {
            self.send_unmasked_interrupts();
        }
    }

    fn vector_masked(&self, vector: usize) -> bool {
        !self.enabled || self.func_masked || self.table_entries[vector].masked()
    }

    fn set_pending_bit(&mut self, vector: usize) {
        self.pba_entries[vector / BITS_PER_PBA_ENTRY] |= 1u64 << (vector % BITS_PER_PBA_ENTRY);
    }

    fn test_and_clear_pending(&mut self, vector: usize) -> bool {
        let entry = &mut self.pba_entries[vector / BITS_PER_PBA_ENTRY];
        let bit = 1u64 << (vector % BITS_PER_PBA_ENTRY);
        let was = *entry & bit != 0;
        *entry &= !bit;
        was
    }

    /// Deliver or latch one vector.
    pub fn trigger(&mut self, vector: usize) -> Result<()> {
        if vector >= MSIX_VECTORS {
            return Err(Error::InvalidArgument);
        }
        if self.vector_masked(vector) {
            debug!("MSI-X vector {vector} masked, latching pending bit");
            self.set_pending_bit(vector);
            return Ok(());
        }
        match &self.notifiers[vector] {
            Some(n) => {
                if let Err(e) = n.notify() {
                    error!("failed to signal MSI-X vector {vector}: {e}");
                }
                Ok(())
            }
            None => {
                error!("no notifier assigned for MSI-X vector {vector}");
                Err(Error::InvalidArgument)
            }
        }
    }

    /// Fire every pending vector whose mask has been cleared, lowest first.
    pub fn send_unmasked_interrupts(&mut self) {
        for vector in 0..MSIX_VECTORS {
            if !self.vector_masked(vector) && self.test_and_clear_pending(vector) {
                // A missing notifier was already reported at trigger time.
                let _ = self.trigger(vector);
            }
        }
    }

    pub fn read_table(&self, offset: u64, data: &mut [u8]) {
        if data.len() != 4 && data.len() != 8 {
            error!("invalid MSI-X table read length {}", data.len());
            data.fill(0);
            return;
        }

        let index = (offset / MSIX_TABLE_ENTRIES_MODULO) as usize;
        let modulo_offset = offset % MSIX_TABLE_ENTRIES_MODULO;
        if index >= MSIX_VECTORS {
            data.fill(0);
            return;
        }
        let entry = &self.table_entries[index];

        match data.len() {
            4 => {
                let value = match modulo_offset {
                    0x0 => entry.msg_addr_lo,
                    0x4 => entry.msg_addr_hi,
                    0x8 => entry.msg_data,
                    0xc => entry.vector_ctl,
                    _ => {
                        error!("invalid offset");
                        0
                    }
                };
                LittleEndian::write_u32(data, value);
            }
            _ => {
                let value = match modulo_offset {
                    0x0 => (u64::from(entry.msg_addr_hi) << 32) | u64::from(entry.msg_addr_lo),
                    0x8 => (u64::from(entry.vector_ctl) << 32) | u64::from(entry.msg_data),
                    _ => {
                        error!("invalid offset");
                        0
                    }
                };
                LittleEndian::write_u64(data, value);
            }
        }
    }

    pub fn write_table(&mut self, offset: u64, data: &[u8]) {
        if data.len() != 4 && data.len() != 8 {
            error!("invalid MSI-X table write length {}", data.len());
            return;
        }

        let index = (offset / MSIX_TABLE_ENTRIES_MODULO) as usize;
        let modulo_offset = offset % MSIX_TABLE_ENTRIES_MODULO;
        if index >= MSIX_VECTORS {
            return;
        }
        let was_masked = self.table_entries[index].masked();
        let entry = &mut self.table_entries[index];

        match data.len() {
            4 => {
                let value = LittleEndian::read_u32(data);
                match modulo_offset {
                    0x0 => entry.msg_addr_lo = value,
                    0x4 => entry.msg_addr_hi = value,
                    0x8 => entry.msg_data = value,
                    0xc => entry.vector_ctl = value,
                    _ => error!("invalid offset"),
                }
            }
            _ => {
                let value = LittleEndian::read_u64(data);
                match modulo_offset {
                    0x0 => {
                        entry.msg_addr_lo = (value & 0xffff_ffff) as u32;
                        entry.msg_addr_hi = (value >> 32) as u32;
                    }
                    0x8 => {
                        entry.msg_data = (value & 0xffff_ffff) as u32;
                        entry.vector_ctl = (value >> 32) as u32;
                    }
                    _ => error!("invalid offset"),
                }
            }
        }

        if was_masked && !self.table_entries[index].masked() {
            self.send_unmasked_interrupts();
        }
    }

    pub fn read_pba(&self, offset: u64, data: &mut [u8]) {
        if data.len() != 4 && data.len() != 8 {
            error!("invalid PBA read length {}", data.len());
            data.fill(0);
            return;
        }

        let index = (offset / MSIX_PBA_ENTRIES_MODULO) as usize;
        let modulo_offset = offset % MSIX_PBA_ENTRIES_MODULO;
        if index >= self.pba_entries.len() {
            data.fill(0);
            return;
        }

        match data.len() {
            4 => {
                let value = match modulo_offset {
                    0x0 => (self.pba_entries[index] & 0xffff_ffff) as u32,
                    0x4 => (self.pba_entries[index] >> 32) as u32,
                    _ => {
                        error!("invalid offset");
                        0
                    }
                };
                LittleEndian::write_u32(data, value);
            }
            _ => {
                let value = match modulo_offset {
                    0x0 => self.pba_entries[index],
                    _ => {
                        error!("invalid offset");
                        0
                    }
                };
                LittleEndian::write_u64(data, value);
            }
        }
    }

    pub fn write_pba(&mut self, _offset: u64, _data: &[u8]) {
        error!("Pending Bit Array is read only");
    }
}
