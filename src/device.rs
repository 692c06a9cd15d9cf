// Copyright © 2026 The vqsched Authors
//
// SPDX-License-Identifier: Apache-2.0
//
//! Per-tenant device emulation: a 256-byte PCI-style config space and the
//! 64 MiB register window behind BAR0.
//!
//! Config writes are filtered so a tenant can only touch what a real function
//! would let it touch; everything else is hardwired. The register window
//! demultiplexes the MSI-X table and PBA apertures, the mailbox byte windows
//! and the doorbell register; reads of anything else return zeros.

use byteorder::{ByteOrder, LittleEndian};

use crate::interrupt::{MsixBlock, MSIX_VECTORS};
use crate::mbox::{MailboxChannel, PF2TENANT_MAILBOX_BYTES, TENANT2PF_MAILBOX_BYTES};
use crate::{Error, Result};

pub const VENDOR_ID: u16 = 0x1de0;
pub const DEVICE_ID: u16 = 0x2710;

pub const CONFIG_SPACE_SIZE: usize = 256;
const NUM_CONFIG_REGS: usize = CONFIG_SPACE_SIZE / 4;

/// BAR0 is one 64-bit prefetchable region.
pub const BAR0_SIZE: u64 = 0x0400_0000;
const BAR_MEM_64BIT_PREFETCH: u32 = 0xc;

pub const MSIX_TABLE_OFFSET: u64 = 0x0100_0000;
pub const MSIX_TABLE_SIZE: u64 = (MSIX_VECTORS * 16) as u64;
pub const MSIX_PBA_OFFSET: u64 = MSIX_TABLE_OFFSET + MSIX_TABLE_SIZE;
pub const MSIX_PBA_SIZE: u64 = 0x1000;

pub const PAGE_SIZE: u64 = 0x1000;
pub const LDB_PP_BASE: u64 = 0x0200_0000;
pub const DIR_PP_BASE: u64 = 0x0210_0000;
pub const MBOX_ISR_OFFSET: u64 = 0x0220_0000;
pub const MBOX_T2P_PAGE: u64 = 0x0221_0000;
pub const MBOX_P2T_PAGE: u64 = 0x0221_1000;

const CAP_PTR_MSIX: usize = 0x48;
const CAP_PTR_PCIE: usize = 0x60;
const MSIX_MSG_CTRL_OFFSET: usize = CAP_PTR_MSIX + 2;
const DEVCTL_OFFSET: usize = CAP_PTR_PCIE + 8;

const MSIX_CTRL_ENABLE: u16 = 0x8000;
const MSIX_CTRL_FUNC_MASK: u16 = 0x4000;
const MSIX_CTRL_WRITABLE: u16 = MSIX_CTRL_ENABLE | MSIX_CTRL_FUNC_MASK;

const DEVCTL_FLR: u16 = 0x8000;
const DEVCTL_AUX_PME: u16 = 0x0400;

/// Status register bits that are write-one-to-clear.
const STATUS_WOCLR: u16 = 0xf900;
const COMMAND_WRITABLE: u16 = 0x0507;

/// Side effects a config write asks the PF to perform.
#[derive(Debug, PartialEq, Eq)]
pub enum CfgWriteEffect {
    None,
    FunctionLevelReset,
}

/// Side effects of a register-window write.
#[derive(Debug, PartialEq, Eq)]
pub enum MmioWriteEffect {
    None,
    MailboxDoorbell,
}

fn config_template() -> [u32; NUM_CONFIG_REGS] {
    let mut regs = [0u32; NUM_CONFIG_REGS];
    regs[0x00 / 4] = (u32::from(DEVICE_ID) << 16) | u32::from(VENDOR_ID);
    // Status: capabilities list present.
    regs[0x04 / 4] = 0x0010 << 16;
    // Co-processor class, revision 1.
    regs[0x08 / 4] = 0x0b40_0001;
    regs[0x10 / 4] = BAR_MEM_64BIT_PREFETCH;
    regs[0x2c / 4] = (u32::from(DEVICE_ID) << 16) | u32::from(VENDOR_ID);
    regs[0x34 / 4] = CAP_PTR_MSIX as u32;
    // MSI-X capability: id 0x11, next 0x60; table size filled in at open.
    regs[CAP_PTR_MSIX / 4] = 0x0011 | (CAP_PTR_PCIE as u32) << 8;
    regs[(CAP_PTR_MSIX + 4) / 4] = MSIX_TABLE_OFFSET as u32;
    regs[(CAP_PTR_MSIX + 8) / 4] = MSIX_PBA_OFFSET as u32;
    // PCIe capability: id 0x10, version 2, endpoint.
    regs[CAP_PTR_PCIE / 4] = 0x0010 | 0x0002 << 16;
    // Device capabilities: function-level reset supported.
    regs[(CAP_PTR_PCIE + 4) / 4] = 0x1000_0000;
    regs
}

/// Everything the PF keeps per emulated tenant function.
pub struct VdevState {
    cfg: [u32; NUM_CONFIG_REGS],
    /// Latched BAR0 address; size probes never disturb it.
    bar0_addr: u64,
    pub msix: MsixBlock,
    pub channel: MailboxChannel,
    pub released: bool,
    pub mbox_enabled: bool,
    pub mbox_requests: u32,
    pub mbox_window_start: Option<std::time::Instant>,
    pub num_ldb_ports: u16,
    pub num_dir_ports: u16,
}

impl Default for VdevState {
    fn default() -> Self {
        Self::new()
    }
}

impl VdevState {
    pub fn new() -> Self {
        VdevState {
            cfg: config_template(),
            bar0_addr: 0,
            msix: MsixBlock::new(),
            channel: MailboxChannel::default(),
            released: false,
            mbox_enabled: false,
            mbox_requests: 0,
            mbox_window_start: None,
            num_ldb_ports: 0,
            num_dir_ports: 0,
        }
    }

    /// MSI-X table size field, N-1 encoded: one control vector plus one per
    /// port.
    pub fn set_msix_table_size(&mut self, num_ldb_ports: u16, num_dir_ports: u16) {
        self.num_ldb_ports = num_ldb_ports;
        self.num_dir_ports = num_dir_ports;
        let vectors = 1 + num_ldb_ports + num_dir_ports;
        let reg = &mut self.cfg[CAP_PTR_MSIX / 4];
        *reg = (*reg & !(0x07ff << 16)) | (u32::from(vectors - 1) << 16);
    }

    pub fn msix_table_size(&self) -> u16 {
        ((self.cfg[CAP_PTR_MSIX / 4] >> 16) & 0x07ff) as u16
    }

    pub fn num_vectors(&self) -> u32 {
        1 + u32::from(self.num_ldb_ports) + u32::from(self.num_dir_ports)
    }

    pub fn bar0_addr(&self) -> u64 {
        self.bar0_addr
    }

    // Config space.

    pub fn cfg_read(&self, offset: usize, data: &mut [u8]) -> Result<()> {
        if offset + data.len() > CONFIG_SPACE_SIZE {
            return Err(Error::InvalidArgument);
        }
        for (i, byte) in data.iter_mut().enumerate() {
            let off = offset + i;
            *byte = (self.cfg[off / 4] >> ((off % 4) * 8)) as u8;
        }
        Ok(())
    }

    pub fn cfg_write(&mut self, offset: usize, data: &[u8]) -> Result<CfgWriteEffect> {
        if offset + data.len() > CONFIG_SPACE_SIZE {
            return Err(Error::InvalidArgument);
        }

        // BAR size probes are only meaningful as aligned dword writes.
        if data.len() == 4 && (offset == 0x10 || offset == 0x14) {
            self.write_bar(offset, LittleEndian::read_u32(data));
            return Ok(CfgWriteEffect::None);
        }

        let mut effect = CfgWriteEffect::None;
        for (i, &byte) in data.iter().enumerate() {
            let off = offset + i;
            if let Some(e) = self.write_cfg_byte(off, byte) {
                effect = e;
            }
        }

        if ranges_overlap(offset, data.len(), MSIX_MSG_CTRL_OFFSET, 2) {
            let ctrl = (self.cfg[CAP_PTR_MSIX / 4] >> 16) as u16;
            self.msix.set_msg_ctrl(
                ctrl & MSIX_CTRL_ENABLE != 0,
                ctrl & MSIX_CTRL_FUNC_MASK != 0,
            );
        }
        Ok(effect)
    }

    fn write_bar(&mut self, offset: usize, value: u32) {
        let reg = offset / 4;
        if offset == 0x10 {
            if value == 0xffff_ffff {
                // Size probe: expose the size mask, keep the type bits and
                // the latched address.
                self.cfg[reg] = !((BAR0_SIZE - 1) as u32) | BAR_MEM_64BIT_PREFETCH;
            } else {
                let addr = u64::from(value & !((BAR0_SIZE - 1) as u32) & !0xf);
                self.bar0_addr = (self.bar0_addr & !0xffff_ffff) | addr;
                self.cfg[reg] = (addr as u32) | BAR_MEM_64BIT_PREFETCH;
            }
        } else if value == 0xffff_ffff {
            self.cfg[reg] = !(((BAR0_SIZE - 1) >> 32) as u32);
        } else {
            self.bar0_addr = (self.bar0_addr & 0xffff_ffff) | (u64::from(value) << 32);
            self.cfg[reg] = value;
        }
    }

    fn write_cfg_byte(&mut self, off: usize, byte: u8) -> Option<CfgWriteEffect> {
        let reg = off / 4;
        let shift = (off % 4) * 8;
        match off {
            // Command register: only its defined control bits are writable.
            0x04 | 0x05 => {
                let lane = (off - 0x04) * 8;
                let writable = (COMMAND_WRITABLE >> lane) as u8;
                let cur = (self.cfg[reg] >> shift) as u8;
                let new = (cur & !writable) | (byte & writable);
                self.cfg[reg] = (self.cfg[reg] & !(0xff << shift)) | (u32::from(new) << shift);
                None
            }
            // Status register: write-one-to-clear bits only.
            0x06 | 0x07 => {
                let woclr = (u32::from(STATUS_WOCLR) << 16 >> shift) as u8;
                let clear = byte & woclr;
                self.cfg[reg] &= !(u32::from(clear) << shift);
                None
            }
            // Cache line size and interrupt line.
            0x0c | 0x3c => {
                self.cfg[reg] =
                    (self.cfg[reg] & !(0xff << shift)) | (u32::from(byte) << shift);
                None
            }
            // MSI-X message control: enable and function-mask bits only.
            o if o == MSIX_MSG_CTRL_OFFSET || o == MSIX_MSG_CTRL_OFFSET + 1 => {
                let lane = (off - MSIX_MSG_CTRL_OFFSET) * 8;
                let writable = (MSIX_CTRL_WRITABLE >> lane) as u8;
                let cur = (self.cfg[reg] >> shift) as u8;
                let new = (cur & !writable) | (byte & writable);
                self.cfg[reg] = (self.cfg[reg] & !(0xff << shift)) | (u32::from(new) << shift);
                None
            }
            // PCIe device control: a write with the FLR bit resets the
            // function; FLR and AUX_PME always read back zero.
            o if o == DEVCTL_OFFSET || o == DEVCTL_OFFSET + 1 => {
                let lane = (off - DEVCTL_OFFSET) * 8;
                let flr = (DEVCTL_FLR >> lane) as u8;
                let hardwired = ((DEVCTL_FLR | DEVCTL_AUX_PME) >> lane) as u8;
                let stored = byte & !hardwired;
                self.cfg[reg] =
                    (self.cfg[reg] & !(0xff << shift)) | (u32::from(stored) << shift);
                (byte & flr != 0).then_some(CfgWriteEffect::FunctionLevelReset)
            }
            _ => {
                debug!("dropping config write at 0x{off:x}");
                None
            }
        }
    }

    // Register window.

    fn check_access(offset: u64, len: usize) -> Result<()> {
        if len == 0 || len > 8 || !len.is_power_of_two() || offset % len as u64 != 0 {
            return Err(Error::InvalidArgument);
        }
        if offset + len as u64 > BAR0_SIZE {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    pub fn mmio_read(&self, offset: u64, data: &mut [u8]) -> Result<()> {
        Self::check_access(offset, data.len())?;
        match offset {
            o if (MSIX_TABLE_OFFSET..MSIX_TABLE_OFFSET + MSIX_TABLE_SIZE).contains(&o) => {
                self.msix.read_table(o - MSIX_TABLE_OFFSET, data);
            }
            o if (MSIX_PBA_OFFSET..MSIX_PBA_OFFSET + MSIX_PBA_SIZE).contains(&o) => {
                self.msix.read_pba(o - MSIX_PBA_OFFSET, data);
            }
            MBOX_ISR_OFFSET => {
                let v = u32::from(self.channel.isr_in_progress());
                for (i, b) in data.iter_mut().enumerate() {
                    *b = v.to_le_bytes().get(i).copied().unwrap_or(0);
                }
            }
            o if (MBOX_T2P_PAGE..MBOX_T2P_PAGE + TENANT2PF_MAILBOX_BYTES as u64).contains(&o) => {
                self.channel.read_t2p((o - MBOX_T2P_PAGE) as usize, data)?;
            }
            o if (MBOX_P2T_PAGE..MBOX_P2T_PAGE + PF2TENANT_MAILBOX_BYTES as u64).contains(&o) => {
                self.channel.read_p2t((o - MBOX_P2T_PAGE) as usize, data)?;
            }
            _ => {
                debug!("window read at unknown offset 0x{offset:x}, returning zeros");
                data.fill(0);
            }
        }
        Ok(())
    }

    pub fn mmio_write(&mut self, offset: u64, data: &[u8]) -> Result<MmioWriteEffect> {
        Self::check_access(offset, data.len())?;
        match offset {
            o if (MSIX_TABLE_OFFSET..MSIX_TABLE_OFFSET + MSIX_TABLE_SIZE).contains(&o) => {
                self.msix.write_table(o - MSIX_TABLE_OFFSET, data);
            }
            o if (MSIX_PBA_OFFSET..MSIX_PBA_OFFSET + MSIX_PBA_SIZE).contains(&o) => {
                self.msix.write_pba(o - MSIX_PBA_OFFSET, data);
            }
            MBOX_ISR_OFFSET => {
                return Ok(MmioWriteEffect::MailboxDoorbell);
            }
            o if (MBOX_T2P_PAGE..MBOX_T2P_PAGE + TENANT2PF_MAILBOX_BYTES as u64).contains(&o) => {
                self.channel.write_t2p((o - MBOX_T2P_PAGE) as usize, data)?;
            }
            _ => {
                debug!("dropping window write at 0x{offset:x}");
            }
        }
        Ok(MmioWriteEffect::None)
    }
}

fn ranges_overlap(a_start: usize, a_len: usize, b_start: usize, b_len: usize) -> bool {
    a_start < b_start + b_len && b_start < a_start + a_len
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_dword(v: &VdevState, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        v.cfg_read(offset, &mut buf).unwrap();
        u32::from_le_bytes(buf)
    }

    #[test]
    fn template_ids() {
        let v = VdevState::new();
        assert_eq!(
            read_dword(&v, 0),
            (u32::from(DEVICE_ID) << 16) | u32::from(VENDOR_ID)
        );
        // Capability chain: 0x34 -> MSI-X -> PCIe.
        assert_eq!(read_dword(&v, 0x34) & 0xff, CAP_PTR_MSIX as u32);
        assert_eq!(read_dword(&v, CAP_PTR_MSIX) & 0xff, 0x11);
        assert_eq!((read_dword(&v, CAP_PTR_MSIX) >> 8) & 0xff, CAP_PTR_PCIE as u32);
    }

    #[test]
    fn bar_size_probe_preserves_address() {
        let mut v = VdevState::new();
        v.cfg_write(0x10, &0xf000_0000u32.to_le_bytes()).unwrap();
        v.cfg_write(0x14, &0x1u32.to_le_bytes()).unwrap();
        assert_eq!(v.bar0_addr(), 0x1_f000_0000);

        v.cfg_write(0x10, &0xffff_ffffu32.to_le_bytes()).unwrap();
        let probe = read_dword(&v, 0x10);
        assert_eq!(probe, !((BAR0_SIZE - 1) as u32) | BAR_MEM_64BIT_PREFETCH);
        // The latched address survives the probe.
        assert_eq!(v.bar0_addr(), 0x1_f000_0000);

        v.cfg_write(0x10, &0xf000_0000u32.to_le_bytes()).unwrap();
        assert_eq!(read_dword(&v, 0x10), 0xf000_0000 | BAR_MEM_64BIT_PREFETCH);
    }

    #[test]
    fn status_bits_write_one_to_clear() {
        let mut v = VdevState::new();
        // Seed a WOCLR bit (master abort, bit 13 of status).
        v.cfg[1] |= 1 << (16 + 13);
        v.cfg_write(0x06, &[0x00, 0x20]).unwrap();
        assert_eq!(read_dword(&v, 0x04) >> 16 & (1 << 13), 0);
        // Capabilities-list bit is not clearable.
        v.cfg_write(0x06, &[0xff, 0xff]).unwrap();
        assert_ne!(read_dword(&v, 0x04) >> 16 & 0x0010, 0);
    }

    #[test]
    fn devctl_flr_reads_zero_and_reports_reset() {
        let mut v = VdevState::new();
        let effect = v
            .cfg_write(DEVCTL_OFFSET, &DEVCTL_FLR.to_le_bytes())
            .unwrap();
        assert_eq!(effect, CfgWriteEffect::FunctionLevelReset);
        assert_eq!(read_dword(&v, DEVCTL_OFFSET) & 0xffff, 0);

        let effect = v
            .cfg_write(DEVCTL_OFFSET, &DEVCTL_AUX_PME.to_le_bytes())
            .unwrap();
        assert_eq!(effect, CfgWriteEffect::None);
        assert_eq!(read_dword(&v, DEVCTL_OFFSET) & 0xffff, 0);
    }

    #[test]
    fn msix_table_size_encoding() {
        let mut v = VdevState::new();
        v.set_msix_table_size(4, 2);
        assert_eq!(v.msix_table_size(), 6);
        assert_eq!(v.num_vectors(), 7);
    }

    #[test]
    fn msix_ctrl_write_enables_block() {
        let mut v = VdevState::new();
        assert!(!v.msix.enabled());
        v.cfg_write(MSIX_MSG_CTRL_OFFSET, &MSIX_CTRL_ENABLE.to_le_bytes())
            .unwrap();
        assert!(v.msix.enabled());
        // Only the enable and function-mask bits are writable.
        assert_eq!(
            (read_dword(&v, CAP_PTR_MSIX) >> 16) as u16 & !MSIX_CTRL_WRITABLE,
            v.msix_table_size()
        );
    }

    #[test]
    fn window_access_must_be_aligned_pow2() {
        let v = VdevState::new();
        let mut buf = [0u8; 3];
        assert_eq!(v.mmio_read(0, &mut buf), Err(Error::InvalidArgument));
        let mut buf = [0u8; 4];
        assert_eq!(v.mmio_read(2, &mut buf), Err(Error::InvalidArgument));
        assert_eq!(v.mmio_read(BAR0_SIZE, &mut buf), Err(Error::InvalidArgument));
        assert!(v.mmio_read(4, &mut buf).is_ok());
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn window_routes_msix_and_mailbox() {
        let mut v = VdevState::new();
        v.mmio_write(MSIX_TABLE_OFFSET + 8, &0x1234u32.to_le_bytes())
            .unwrap();
        let mut buf = [0u8; 4];
        v.mmio_read(MSIX_TABLE_OFFSET + 8, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 0x1234);

        v.mmio_write(MBOX_T2P_PAGE, &0x77u32.to_le_bytes()).unwrap();
        assert_eq!(v.channel.request_type(), 0x77);

        let effect = v.mmio_write(MBOX_ISR_OFFSET, &1u32.to_le_bytes()).unwrap();
        assert_eq!(effect, MmioWriteEffect::MailboxDoorbell);
    }
}
