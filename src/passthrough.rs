// Copyright © 2026 The vqsched Authors
//
// SPDX-License-Identifier: Apache-2.0
//
//! Mediated passthrough surface.
//!
//! [`VirtualDevice`] is the per-tenant handle a VMM drives: region and
//! interrupt enumeration, config/register access and mmap translation. Region
//! accesses encode the region index in the upper bits of the offset, PCI
//! style; producer-port pages are the only directly mappable areas, everything
//! else traps into the emulation.

use std::sync::Arc;

use vfio_bindings::bindings::vfio::{
    VFIO_DEVICE_FLAGS_PCI, VFIO_DEVICE_FLAGS_RESET, VFIO_IRQ_INFO_EVENTFD, VFIO_IRQ_INFO_NORESIZE,
    VFIO_IRQ_SET_ACTION_MASK, VFIO_IRQ_SET_ACTION_TRIGGER, VFIO_IRQ_SET_ACTION_UNMASK,
    VFIO_PCI_BAR0_REGION_INDEX, VFIO_PCI_CONFIG_REGION_INDEX, VFIO_PCI_MSIX_IRQ_INDEX,
    VFIO_PCI_NUM_IRQS, VFIO_PCI_NUM_REGIONS, VFIO_REGION_INFO_FLAG_CAPS,
    VFIO_REGION_INFO_FLAG_MMAP, VFIO_REGION_INFO_FLAG_READ, VFIO_REGION_INFO_FLAG_WRITE,
};
use vmm_sys_util::eventfd::EventFd;

use crate::device::{
    BAR0_SIZE, CONFIG_SPACE_SIZE, DIR_PP_BASE, LDB_PP_BASE, MBOX_P2T_PAGE, MBOX_T2P_PAGE,
    PAGE_SIZE,
};
use crate::pf::PfDevice;
use crate::{Error, Result, MAX_TENANTS};

/// Region index lives in the offset's upper bits, as in VFIO PCI.
pub const REGION_OFFSET_SHIFT: u64 = 40;
pub const REGION_OFFSET_MASK: u64 = (1 << REGION_OFFSET_SHIFT) - 1;

pub fn region_offset(index: u32) -> u64 {
    u64::from(index) << REGION_OFFSET_SHIFT
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceInfo {
    pub flags: u32,
    pub num_regions: u32,
    pub num_irqs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseArea {
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RegionInfo {
    pub argsz: u32,
    pub flags: u32,
    pub index: u32,
    pub size: u64,
    pub offset: u64,
    /// Present only when `argsz` covered the capability chain.
    pub sparse: Vec<SparseArea>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IrqInfo {
    pub index: u32,
    pub flags: u32,
    pub count: u32,
}

/// Payload of a set-irqs request.
pub enum IrqSetData<'a> {
    None,
    Bool(&'a [u8]),
    Eventfd(&'a [Option<EventFd>]),
}

/// Fixed header size plus one sparse-area record each, mirroring the wire
/// layout a VFIO client expects to size its buffer for.
const REGION_INFO_BASE_SIZE: u32 = 32;
const SPARSE_AREA_RECORD_SIZE: u32 = 16;

pub struct VirtualDevice {
    pf: Arc<PfDevice>,
    tenant: usize,
}

impl VirtualDevice {
    pub fn new(pf: Arc<PfDevice>, tenant: usize) -> Result<Self> {
        if tenant >= MAX_TENANTS {
            return Err(Error::InvalidArgument);
        }
        Ok(VirtualDevice { pf, tenant })
    }

    pub fn tenant(&self) -> usize {
        self.tenant
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            flags: VFIO_DEVICE_FLAGS_PCI | VFIO_DEVICE_FLAGS_RESET,
            num_regions: VFIO_PCI_NUM_REGIONS,
            num_irqs: VFIO_PCI_NUM_IRQS,
        }
    }

    /// Pages a tenant may map directly: one producer-port page per owned
    /// port at the port's virtual index, plus the two mailbox data pages.
    /// The doorbell page is not listed; it must trap.
    fn sparse_areas(&self) -> Vec<SparseArea> {
        let state = self.pf.lock_state();
        let vdev = &state.vdevs[self.tenant];
        let mut areas = Vec::new();
        for i in 0..u64::from(vdev.num_ldb_ports) {
            areas.push(SparseArea {
                offset: LDB_PP_BASE + i * PAGE_SIZE,
                size: PAGE_SIZE,
            });
        }
        for i in 0..u64::from(vdev.num_dir_ports) {
            areas.push(SparseArea {
                offset: DIR_PP_BASE + i * PAGE_SIZE,
                size: PAGE_SIZE,
            });
        }
        areas.push(SparseArea {
            offset: MBOX_T2P_PAGE,
            size: PAGE_SIZE,
        });
        areas.push(SparseArea {
            offset: MBOX_P2T_PAGE,
            size: PAGE_SIZE,
        });
        areas
    }

    /// Two-step negotiation: a caller whose `argsz` is too small for the
    /// sparse-area capability gets the required size back and retries.
    pub fn region_info(&self, index: u32, argsz: u32) -> Result<RegionInfo> {
        if index >= VFIO_PCI_NUM_REGIONS {
            return Err(Error::InvalidArgument);
        }
        let mut info = RegionInfo {
            argsz: REGION_INFO_BASE_SIZE,
            index,
            offset: region_offset(index),
            ..Default::default()
        };
        match index {
            VFIO_PCI_CONFIG_REGION_INDEX => {
                info.flags = VFIO_REGION_INFO_FLAG_READ | VFIO_REGION_INFO_FLAG_WRITE;
                info.size = CONFIG_SPACE_SIZE as u64;
            }
            VFIO_PCI_BAR0_REGION_INDEX => {
                info.flags = VFIO_REGION_INFO_FLAG_READ
                    | VFIO_REGION_INFO_FLAG_WRITE
                    | VFIO_REGION_INFO_FLAG_MMAP
                    | VFIO_REGION_INFO_FLAG_CAPS;
                info.size = BAR0_SIZE;
                let areas = self.sparse_areas();
                let needed =
                    REGION_INFO_BASE_SIZE + SPARSE_AREA_RECORD_SIZE * areas.len() as u32;
                info.argsz = needed;
                if argsz >= needed {
                    info.sparse = areas;
                }
            }
            // Unimplemented BARs and the ROM region: present but empty.
            _ => {}
        }
        Ok(info)
    }

    pub fn irq_info(&self, index: u32) -> Result<IrqInfo> {
        if index >= VFIO_PCI_NUM_IRQS {
            return Err(Error::InvalidArgument);
        }
        if index != VFIO_PCI_MSIX_IRQ_INDEX {
            return Ok(IrqInfo {
                index,
                ..Default::default()
            });
        }
        let count = self.pf.lock_state().vdevs[self.tenant].num_vectors();
        Ok(IrqInfo {
            index,
            flags: VFIO_IRQ_INFO_EVENTFD | VFIO_IRQ_INFO_NORESIZE,
            count,
        })
    }

    /// Trigger-action handling for the MSI-X index. Mask and unmask are
    /// driven through the emulated table, not through this call.
    pub fn set_irqs(
        &self,
        index: u32,
        flags: u32,
        start: u32,
        count: u32,
        data: IrqSetData<'_>,
    ) -> Result<()> {
        if index != VFIO_PCI_MSIX_IRQ_INDEX {
            return Err(Error::InvalidArgument);
        }
        if flags & (VFIO_IRQ_SET_ACTION_MASK | VFIO_IRQ_SET_ACTION_UNMASK) != 0 {
            return Err(Error::NotSupported);
        }
        if flags & VFIO_IRQ_SET_ACTION_TRIGGER == 0 {
            return Err(Error::InvalidArgument);
        }

        let mut state = self.pf.lock_state();
        let vdev = &mut state.vdevs[self.tenant];
        if start + count > vdev.num_vectors() {
            return Err(Error::InvalidArgument);
        }

        match data {
            IrqSetData::Eventfd(fds) => {
                if fds.len() != count as usize {
                    return Err(Error::InvalidArgument);
                }
                for (i, fd) in fds.iter().enumerate() {
                    let notifier = match fd {
                        Some(fd) => {
                            let fd = fd.try_clone().map_err(|e| {
                                error!("failed to clone interrupt eventfd: {e}");
                                Error::InvalidArgument
                            })?;
                            Some(Arc::new(fd) as Arc<dyn crate::interrupt::InterruptNotifier>)
                        }
                        None => None,
                    };
                    vdev.msix.set_notifier(start as usize + i, notifier);
                }
            }
            IrqSetData::None if count == 0 => {
                vdev.msix.clear_notifiers();
            }
            IrqSetData::None => {
                for v in start..start + count {
                    let _ = vdev.msix.trigger(v as usize);
                }
            }
            IrqSetData::Bool(bools) => {
                if bools.len() != count as usize {
                    return Err(Error::InvalidArgument);
                }
                for (i, &b) in bools.iter().enumerate() {
                    if b != 0 {
                        let _ = vdev.msix.trigger(start as usize + i);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        self.pf.function_level_reset(self.tenant)
    }

    pub fn read(&self, offset: u64, data: &mut [u8]) -> Result<()> {
        let index = (offset >> REGION_OFFSET_SHIFT) as u32;
        let off = offset & REGION_OFFSET_MASK;
        let state = self.pf.lock_state();
        let vdev = &state.vdevs[self.tenant];
        match index {
            VFIO_PCI_CONFIG_REGION_INDEX => vdev.cfg_read(off as usize, data),
            VFIO_PCI_BAR0_REGION_INDEX => vdev.mmio_read(off, data),
            _ => Err(Error::InvalidArgument),
        }
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let index = (offset >> REGION_OFFSET_SHIFT) as u32;
        let off = offset & REGION_OFFSET_MASK;
        match index {
            VFIO_PCI_CONFIG_REGION_INDEX => {
                let effect = {
                    let mut state = self.pf.lock_state();
                    state.vdevs[self.tenant].cfg_write(off as usize, data)?
                };
                self.pf.apply_cfg_effect(self.tenant, effect);
                Ok(())
            }
            VFIO_PCI_BAR0_REGION_INDEX => {
                let effect = {
                    let mut state = self.pf.lock_state();
                    state.vdevs[self.tenant].mmio_write(off, data)?
                };
                self.pf.apply_mmio_effect(self.tenant, effect);
                Ok(())
            }
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Translate a mappable BAR0 page to its physical-BAR counterpart. Only
    /// producer-port pages the tenant owns translate; anything else must trap.
    pub fn mmap_page_offset(&self, bar0_offset: u64) -> Result<u64> {
        if bar0_offset % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgument);
        }
        // The mailbox data pages are emulation-backed; they map in place.
        if bar0_offset == MBOX_T2P_PAGE || bar0_offset == MBOX_P2T_PAGE {
            return Ok(bar0_offset);
        }
        let ldb_end = LDB_PP_BASE + u64::from(crate::NUM_LDB_PORTS) * PAGE_SIZE;
        let dir_end = DIR_PP_BASE + u64::from(crate::NUM_DIR_PORTS) * PAGE_SIZE;
        let state = self.pf.lock_state();
        if bar0_offset >= LDB_PP_BASE && bar0_offset < ldb_end {
            let virt = (bar0_offset - LDB_PP_BASE) / PAGE_SIZE;
            let phys = state.ledger.ldb_port_phys_id(self.tenant, virt as u32)?;
            Ok(LDB_PP_BASE + u64::from(phys) * PAGE_SIZE)
        } else if bar0_offset >= DIR_PP_BASE && bar0_offset < dir_end {
            let virt = (bar0_offset - DIR_PP_BASE) / PAGE_SIZE;
            let phys = state.ledger.dir_port_phys_id(self.tenant, virt as u32)?;
            Ok(DIR_PP_BASE + u64::from(phys) * PAGE_SIZE)
        } else {
            Err(Error::InvalidArgument)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DEVICE_ID, MBOX_ISR_OFFSET, VENDOR_ID};
    use crate::hw::ShadowHw;
    use crate::mbox::{CmdType, MboxStatus, RegisterReq, ReqHdr};
    use crate::pf::ResourceClass;
    use crate::tenant::INTERFACE_VERSION;

    fn vdev() -> VirtualDevice {
        let pf = PfDevice::new(0, Box::<ShadowHw>::default());
        VirtualDevice::new(pf, 0).unwrap()
    }

    #[test]
    fn device_info_shape() {
        let dev = vdev();
        let info = dev.device_info();
        assert_ne!(info.flags & VFIO_DEVICE_FLAGS_PCI, 0);
        assert_ne!(info.flags & VFIO_DEVICE_FLAGS_RESET, 0);
        assert_eq!(info.num_regions, VFIO_PCI_NUM_REGIONS);
    }

    #[test]
    fn config_region_reads_ids() {
        let dev = vdev();
        let info = dev.region_info(VFIO_PCI_CONFIG_REGION_INDEX, 0).unwrap();
        assert_eq!(info.size, CONFIG_SPACE_SIZE as u64);
        assert_eq!(info.flags & VFIO_REGION_INFO_FLAG_MMAP, 0);

        let mut buf = [0u8; 4];
        dev.read(info.offset, &mut buf).unwrap();
        assert_eq!(
            u32::from_le_bytes(buf),
            (u32::from(DEVICE_ID) << 16) | u32::from(VENDOR_ID)
        );
    }

    #[test]
    fn bar0_sparse_negotiation() {
        let pf = PfDevice::new(0, Box::<ShadowHw>::default());
        pf.set_quota(0, ResourceClass::LdbPorts, 2).unwrap();
        pf.set_quota(0, ResourceClass::DirPorts, 1).unwrap();
        pf.open_tenant(0, 42).unwrap();
        let dev = VirtualDevice::new(pf, 0).unwrap();

        // First pass with a small buffer: size reported, no areas. Three port
        // pages plus the two mailbox data pages.
        let info = dev.region_info(VFIO_PCI_BAR0_REGION_INDEX, 8).unwrap();
        let needed = REGION_INFO_BASE_SIZE + 5 * SPARSE_AREA_RECORD_SIZE;
        assert_eq!(info.argsz, needed);
        assert!(info.sparse.is_empty());

        let info = dev.region_info(VFIO_PCI_BAR0_REGION_INDEX, needed).unwrap();
        assert_eq!(info.sparse.len(), 5);
        assert_eq!(
            info.sparse[0],
            SparseArea {
                offset: LDB_PP_BASE,
                size: PAGE_SIZE
            }
        );
        assert_eq!(
            info.sparse[2],
            SparseArea {
                offset: DIR_PP_BASE,
                size: PAGE_SIZE
            }
        );
        assert_eq!(
            info.sparse[4],
            SparseArea {
                offset: MBOX_P2T_PAGE,
                size: PAGE_SIZE
            }
        );
    }

    #[test]
    fn register_through_the_window() {
        let pf = PfDevice::new(0, Box::<ShadowHw>::default());
        pf.open_tenant(0, 7).unwrap();
        let dev = VirtualDevice::new(pf, 0).unwrap();
        let bar0 = region_offset(VFIO_PCI_BAR0_REGION_INDEX);

        let req = RegisterReq {
            hdr: ReqHdr {
                cmd_type: CmdType::Register as u32,
            },
            interface_version: INTERFACE_VERSION,
        };
        dev.write(bar0 + MBOX_T2P_PAGE, &(req.hdr.cmd_type).to_le_bytes())
            .unwrap();
        dev.write(bar0 + MBOX_T2P_PAGE + 4, &req.interface_version.to_le_bytes())
            .unwrap();
        dev.write(bar0 + MBOX_ISR_OFFSET, &1u32.to_le_bytes()).unwrap();

        let mut resp = [0u8; 8];
        dev.read(bar0 + MBOX_P2T_PAGE, &mut resp).unwrap();
        let status = u32::from_le_bytes(resp[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(resp[4..8].try_into().unwrap());
        assert_eq!(status, MboxStatus::Success as u32);
        assert_eq!(version, INTERFACE_VERSION);

        // The doorbell reads clear once the response is in place.
        let mut isr = [0u8; 4];
        dev.read(bar0 + MBOX_ISR_OFFSET, &mut isr).unwrap();
        assert_eq!(u32::from_le_bytes(isr), 0);
    }

    #[test]
    fn eventfd_wiring_delivers_the_ack() {
        let pf = PfDevice::new(0, Box::<ShadowHw>::default());
        pf.open_tenant(0, 7).unwrap();
        let dev = VirtualDevice::new(pf.clone(), 0).unwrap();

        let fd = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        dev.set_irqs(
            VFIO_PCI_MSIX_IRQ_INDEX,
            VFIO_IRQ_SET_ACTION_TRIGGER,
            0,
            1,
            IrqSetData::Eventfd(&[Some(fd.try_clone().unwrap())]),
        )
        .unwrap();
        pf.lock_state().vdevs[0].msix.set_msg_ctrl(true, false);

        pf.post_request(
            0,
            &RegisterReq {
                hdr: ReqHdr {
                    cmd_type: CmdType::Register as u32,
                },
                interface_version: INTERFACE_VERSION,
            },
        )
        .unwrap();
        assert_eq!(fd.read().unwrap(), 1);
    }

    #[test]
    fn mask_actions_are_rejected() {
        let dev = vdev();
        assert_eq!(
            dev.set_irqs(
                VFIO_PCI_MSIX_IRQ_INDEX,
                VFIO_IRQ_SET_ACTION_MASK,
                0,
                1,
                IrqSetData::None
            ),
            Err(Error::NotSupported)
        );
    }

    #[test]
    fn mmap_translates_only_owned_pages() {
        let pf = PfDevice::new(0, Box::<ShadowHw>::default());
        pf.set_quota(0, ResourceClass::LdbPorts, 1).unwrap();
        pf.open_tenant(0, 1).unwrap();
        let phys = pf.lock_state().ledger.ldb_port_phys_id(0, 0).unwrap();
        let dev = VirtualDevice::new(pf, 0).unwrap();

        assert_eq!(
            dev.mmap_page_offset(LDB_PP_BASE).unwrap(),
            LDB_PP_BASE + u64::from(phys) * PAGE_SIZE
        );
        // Virtual port 1 was never assigned.
        assert_eq!(
            dev.mmap_page_offset(LDB_PP_BASE + PAGE_SIZE),
            Err(Error::NotOwned)
        );
        assert_eq!(dev.mmap_page_offset(0), Err(Error::InvalidArgument));
        assert_eq!(dev.mmap_page_offset(LDB_PP_BASE + 1), Err(Error::InvalidArgument));
    }

    #[test]
    fn reset_notifies_a_registered_tenant() {
        let pf = PfDevice::new(0, Box::<ShadowHw>::default());
        pf.open_tenant(0, 7).unwrap();
        let dev = VirtualDevice::new(pf.clone(), 0).unwrap();
        pf.post_request(
            0,
            &RegisterReq {
                hdr: ReqHdr {
                    cmd_type: CmdType::Register as u32,
                },
                interface_version: INTERFACE_VERSION,
            },
        )
        .unwrap();

        dev.reset().unwrap();
        let state = pf.lock_state();
        let note: crate::mbox::NotificationReq = state.vdevs[0].channel.pf_request();
        assert_eq!(
            note.notification,
            crate::mbox::NotificationType::PostReset as u32
        );
    }
}
