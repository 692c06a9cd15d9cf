// Copyright © 2026 The vqsched Authors
//
// SPDX-License-Identifier: Apache-2.0
//
//! Mailbox wire protocol.
//!
//! The tenant→PF mailbox is divided so a request and a response can occupy it
//! simultaneously: bytes 0-239 carry the tenant's request, bytes 240-255 the
//! tenant's response to a PF-initiated command. The PF→tenant mailbox is
//! split the same way: bytes 0-47 carry PF responses, bytes 48-63 PF
//! requests. All fields are little-endian; every request starts with a `u32`
//! command type and every response with a `u32` status.

use byteorder::{ByteOrder, LittleEndian};
use vm_memory::ByteValued;

use crate::{Error, Result};

pub const TENANT2PF_MAILBOX_BYTES: usize = 256;
pub const TENANT2PF_REQ_BASE: usize = 0;
pub const TENANT2PF_REQ_BYTES: usize = 240;
pub const TENANT2PF_RESP_BASE: usize = TENANT2PF_REQ_BYTES;
pub const TENANT2PF_RESP_BYTES: usize = TENANT2PF_MAILBOX_BYTES - TENANT2PF_REQ_BYTES;

pub const PF2TENANT_MAILBOX_BYTES: usize = 64;
pub const PF2TENANT_RESP_BASE: usize = 0;
pub const PF2TENANT_RESP_BYTES: usize = 48;
pub const PF2TENANT_REQ_BASE: usize = PF2TENANT_RESP_BYTES;
pub const PF2TENANT_REQ_BYTES: usize = PF2TENANT_MAILBOX_BYTES - PF2TENANT_RESP_BYTES;

/// Tenant-initiated commands. The dispatch table is indexed by this value;
/// `NUM_CMD_TYPES` bounds it.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmdType {
    Register = 0,
    Unregister,
    GetNumResources,
    CreateSchedDomain,
    ResetSchedDomain,
    CreateLdbQueue,
    CreateDirQueue,
    CreateLdbPort,
    CreateDirPort,
    EnableLdbPort,
    DisableLdbPort,
    EnableDirPort,
    DisableDirPort,
    LdbPortOwnedByDomain,
    DirPortOwnedByDomain,
    MapQid,
    UnmapQid,
    StartDomain,
    EnableLdbPortIntr,
    EnableDirPortIntr,
    ArmCqIntr,
    GetNumUsedResources,
    InitCqSchedCount,
    CollectCqSchedCount,
    GetSnAllocation,
    GetLdbQueueDepth,
    GetDirQueueDepth,
    PendingPortUnmaps,
    GetCosBandwidth,
}

pub const NUM_CMD_TYPES: u32 = CmdType::GetCosBandwidth as u32 + 1;

impl TryFrom<u32> for CmdType {
    type Error = Error;

    fn try_from(v: u32) -> Result<CmdType> {
        use CmdType::*;
        Ok(match v {
            0 => Register,
            1 => Unregister,
            2 => GetNumResources,
            3 => CreateSchedDomain,
            4 => ResetSchedDomain,
            5 => CreateLdbQueue,
            6 => CreateDirQueue,
            7 => CreateLdbPort,
            8 => CreateDirPort,
            9 => EnableLdbPort,
            10 => DisableLdbPort,
            11 => EnableDirPort,
            12 => DisableDirPort,
            13 => LdbPortOwnedByDomain,
            14 => DirPortOwnedByDomain,
            15 => MapQid,
            16 => UnmapQid,
            17 => StartDomain,
            18 => EnableLdbPortIntr,
            19 => EnableDirPortIntr,
            20 => ArmCqIntr,
            21 => GetNumUsedResources,
            22 => InitCqSchedCount,
            23 => CollectCqSchedCount,
            24 => GetSnAllocation,
            25 => GetLdbQueueDepth,
            26 => GetDirQueueDepth,
            27 => PendingPortUnmaps,
            28 => GetCosBandwidth,
            _ => return Err(Error::InvalidArgument),
        })
    }
}

/// PF-initiated commands, delivered through the PF→tenant request slot.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PfCmdType {
    DomainAlert = 0,
    Notification,
    InUse,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationType {
    PreReset = 0,
    PostReset,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MboxStatus {
    Success = 0,
    InvalidCmdType,
    VersionMismatch,
    InvalidOwner,
}

/// First field of every request.
#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct ReqHdr {
    pub cmd_type: u32,
}

/// First field of every response.
#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct RespHdr {
    pub status: u32,
}

// It is safe to implement ByteValued for the wire structs below: all members
// are plain integers and any bit pattern is valid.

unsafe impl ByteValued for ReqHdr {}
unsafe impl ByteValued for RespHdr {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct RegisterReq {
    pub hdr: ReqHdr,
    pub interface_version: u32,
}
unsafe impl ByteValued for RegisterReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct RegisterResp {
    pub hdr: RespHdr,
    pub interface_version: u32,
    pub pf_id: u8,
    pub tenant_id: u8,
    pub is_auxiliary: u8,
    pub primary_id: u8,
    pub padding: u32,
}
unsafe impl ByteValued for RegisterResp {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct UnregisterReq {
    pub hdr: ReqHdr,
    pub padding: u32,
}
unsafe impl ByteValued for UnregisterReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct UnregisterResp {
    pub hdr: RespHdr,
    pub padding: u32,
}
unsafe impl ByteValued for UnregisterResp {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct GetNumResourcesReq {
    pub hdr: ReqHdr,
    pub padding: u32,
}
unsafe impl ByteValued for GetNumResourcesReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct GetNumResourcesResp {
    pub hdr: RespHdr,
    pub error_code: u32,
    pub num_sched_domains: u16,
    pub num_ldb_queues: u16,
    pub num_ldb_ports: u16,
    pub num_cos0_ldb_ports: u16,
    pub num_cos1_ldb_ports: u16,
    pub num_cos2_ldb_ports: u16,
    pub num_cos3_ldb_ports: u16,
    pub num_dir_ports: u16,
    pub num_atomic_inflights: u32,
    pub num_hist_list_entries: u32,
    pub max_contiguous_hist_list_entries: u32,
    pub num_ldb_credits: u16,
    pub num_dir_credits: u16,
}
unsafe impl ByteValued for GetNumResourcesResp {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct CreateSchedDomainReq {
    pub hdr: ReqHdr,
    pub num_ldb_queues: u32,
    pub num_ldb_ports: u32,
    pub num_cos0_ldb_ports: u32,
    pub num_cos1_ldb_ports: u32,
    pub num_cos2_ldb_ports: u32,
    pub num_cos3_ldb_ports: u32,
    pub num_dir_ports: u32,
    pub num_atomic_inflights: u32,
    pub num_hist_list_entries: u32,
    pub num_ldb_credits: u32,
    pub num_dir_credits: u32,
    pub cos_strict: u8,
    pub padding0: [u8; 3],
    pub padding1: u32,
}
unsafe impl ByteValued for CreateSchedDomainReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct CreateSchedDomainResp {
    pub hdr: RespHdr,
    pub error_code: u32,
    pub status: u32,
    pub id: u32,
}
unsafe impl ByteValued for CreateSchedDomainResp {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct ResetSchedDomainReq {
    pub hdr: ReqHdr,
    pub id: u32,
}
unsafe impl ByteValued for ResetSchedDomainReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct ResetSchedDomainResp {
    pub hdr: RespHdr,
    pub error_code: u32,
}
unsafe impl ByteValued for ResetSchedDomainResp {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct CreateLdbQueueReq {
    pub hdr: ReqHdr,
    pub domain_id: u32,
    pub num_sequence_numbers: u32,
    pub num_qid_inflights: u32,
    pub num_atomic_inflights: u32,
    pub lock_id_comp_level: u32,
    pub depth_threshold: u32,
    pub padding: u32,
}
unsafe impl ByteValued for CreateLdbQueueReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct CreateLdbQueueResp {
    pub hdr: RespHdr,
    pub error_code: u32,
    pub status: u32,
    pub id: u32,
}
unsafe impl ByteValued for CreateLdbQueueResp {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct CreateDirQueueReq {
    pub hdr: ReqHdr,
    pub domain_id: u32,
    pub port_id: i32,
    pub depth_threshold: u32,
}
unsafe impl ByteValued for CreateDirQueueReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct CreateDirQueueResp {
    pub hdr: RespHdr,
    pub error_code: u32,
    pub status: u32,
    pub id: u32,
}
unsafe impl ByteValued for CreateDirQueueResp {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct CreateLdbPortReq {
    pub hdr: ReqHdr,
    pub domain_id: u32,
    pub cq_depth: u16,
    pub cq_history_list_size: u16,
    pub cos_id: u8,
    pub cos_strict: u8,
    pub padding: u16,
}
unsafe impl ByteValued for CreateLdbPortReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct CreateLdbPortResp {
    pub hdr: RespHdr,
    pub error_code: u32,
    pub status: u32,
    pub id: u32,
}
unsafe impl ByteValued for CreateLdbPortResp {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct CreateDirPortReq {
    pub hdr: ReqHdr,
    pub domain_id: u32,
    pub cq_depth: u16,
    pub padding: u16,
    pub queue_id: i32,
}
unsafe impl ByteValued for CreateDirPortReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct CreateDirPortResp {
    pub hdr: RespHdr,
    pub error_code: u32,
    pub status: u32,
    pub id: u32,
}
unsafe impl ByteValued for CreateDirPortResp {}

/// Enable/disable requests for either port class share one layout.
#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct PortStateChangeReq {
    pub hdr: ReqHdr,
    pub domain_id: u32,
    pub port_id: u32,
    pub padding: u32,
}
unsafe impl ByteValued for PortStateChangeReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct PortStateChangeResp {
    pub hdr: RespHdr,
    pub error_code: u32,
    pub status: u32,
    pub padding: u32,
}
unsafe impl ByteValued for PortStateChangeResp {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct PortOwnedByDomainReq {
    pub hdr: ReqHdr,
    pub domain_id: u32,
    pub port_id: u32,
    pub padding: u32,
}
unsafe impl ByteValued for PortOwnedByDomainReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct PortOwnedByDomainResp {
    pub hdr: RespHdr,
    pub owned: i32,
}
unsafe impl ByteValued for PortOwnedByDomainResp {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct MapQidReq {
    pub hdr: ReqHdr,
    pub domain_id: u32,
    pub port_id: u32,
    pub qid: u32,
    pub priority: u32,
    pub padding0: u32,
}
unsafe impl ByteValued for MapQidReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct MapQidResp {
    pub hdr: RespHdr,
    pub error_code: u32,
    pub status: u32,
    pub id: u32,
}
unsafe impl ByteValued for MapQidResp {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct UnmapQidReq {
    pub hdr: ReqHdr,
    pub domain_id: u32,
    pub port_id: u32,
    pub qid: u32,
}
unsafe impl ByteValued for UnmapQidReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct UnmapQidResp {
    pub hdr: RespHdr,
    pub error_code: u32,
    pub status: u32,
    pub padding: u32,
}
unsafe impl ByteValued for UnmapQidResp {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct StartDomainReq {
    pub hdr: ReqHdr,
    pub domain_id: u32,
}
unsafe impl ByteValued for StartDomainReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct StartDomainResp {
    pub hdr: RespHdr,
    pub error_code: u32,
    pub status: u32,
    pub padding: u32,
}
unsafe impl ByteValued for StartDomainResp {}

/// Interrupt enablement for either port class. `owner` names the tenant that
/// owns the port; an auxiliary tenant passes its primary.
#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct EnablePortIntrReq {
    pub hdr: ReqHdr,
    pub port_id: u16,
    pub thresh: u16,
    pub vector: u16,
    pub owner: u16,
    pub reserved: [u16; 2],
}
unsafe impl ByteValued for EnablePortIntrReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct EnablePortIntrResp {
    pub hdr: RespHdr,
    pub error_code: u32,
    pub status: u32,
    pub padding: u32,
}
unsafe impl ByteValued for EnablePortIntrResp {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct ArmCqIntrReq {
    pub hdr: ReqHdr,
    pub domain_id: u32,
    pub port_id: u32,
    pub is_ldb: u32,
}
unsafe impl ByteValued for ArmCqIntrReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct ArmCqIntrResp {
    pub hdr: RespHdr,
    pub error_code: u32,
    pub status: u32,
    pub padding0: u32,
}
unsafe impl ByteValued for ArmCqIntrResp {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct InitCqSchedCountReq {
    pub hdr: ReqHdr,
    pub duration_us: u32,
}
unsafe impl ByteValued for InitCqSchedCountReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct InitCqSchedCountResp {
    pub hdr: RespHdr,
    pub error_code: u32,
}
unsafe impl ByteValued for InitCqSchedCountResp {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct CollectCqSchedCountReq {
    pub hdr: ReqHdr,
    pub cq_id: u16,
    pub is_ldb: u16,
}
unsafe impl ByteValued for CollectCqSchedCountReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct CollectCqSchedCountResp {
    pub hdr: RespHdr,
    pub error_code: u32,
    pub elapsed: u32,
    pub padding: u32,
    pub cq_sched_count: u64,
}
unsafe impl ByteValued for CollectCqSchedCountResp {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct GetSnAllocationReq {
    pub hdr: ReqHdr,
    pub group_id: u32,
}
unsafe impl ByteValued for GetSnAllocationReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct GetSnAllocationResp {
    pub hdr: RespHdr,
    pub num: u32,
}
unsafe impl ByteValued for GetSnAllocationResp {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct GetQueueDepthReq {
    pub hdr: ReqHdr,
    pub domain_id: u32,
    pub queue_id: u32,
    pub padding: u32,
}
unsafe impl ByteValued for GetQueueDepthReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct GetQueueDepthResp {
    pub hdr: RespHdr,
    pub error_code: u32,
    pub status: u32,
    pub depth: u32,
}
unsafe impl ByteValued for GetQueueDepthResp {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct PendingPortUnmapsReq {
    pub hdr: ReqHdr,
    pub domain_id: u32,
    pub port_id: u32,
    pub padding: u32,
}
unsafe impl ByteValued for PendingPortUnmapsReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct PendingPortUnmapsResp {
    pub hdr: RespHdr,
    pub error_code: u32,
    pub status: u32,
    pub num: u32,
}
unsafe impl ByteValued for PendingPortUnmapsResp {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct GetCosBandwidthReq {
    pub hdr: ReqHdr,
    pub cos_id: u32,
}
unsafe impl ByteValued for GetCosBandwidthReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct GetCosBandwidthResp {
    pub hdr: RespHdr,
    pub num: u32,
}
unsafe impl ByteValued for GetCosBandwidthResp {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct DomainAlertReq {
    pub hdr: ReqHdr,
    pub domain_id: u32,
    pub alert_id: u32,
    pub aux_alert_data: u32,
}
unsafe impl ByteValued for DomainAlertReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct NotificationReq {
    pub hdr: ReqHdr,
    pub notification: u32,
}
unsafe impl ByteValued for NotificationReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct InUseReq {
    pub hdr: ReqHdr,
    pub padding: u32,
}
unsafe impl ByteValued for InUseReq {}

#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct InUseResp {
    pub hdr: RespHdr,
    pub in_use: u32,
}
unsafe impl ByteValued for InUseResp {}

fn read_obj<T: ByteValued + Default>(buf: &[u8]) -> T {
    let mut v = T::default();
    let len = v.as_mut_slice().len();
    assert!(len <= buf.len());
    v.as_mut_slice().copy_from_slice(&buf[..len]);
    v
}

fn write_obj<T: ByteValued>(buf: &mut [u8], v: &T) {
    let src = v.as_slice();
    assert!(src.len() <= buf.len());
    buf[..src.len()].copy_from_slice(src);
}

fn copy_window(window: &[u8], offset: usize, data: &mut [u8]) -> Result<()> {
    let end = offset.checked_add(data.len()).ok_or(Error::InvalidArgument)?;
    if end > window.len() {
        return Err(Error::InvalidArgument);
    }
    data.copy_from_slice(&window[offset..end]);
    Ok(())
}

fn patch_window(window: &mut [u8], offset: usize, data: &[u8]) -> Result<()> {
    let end = offset.checked_add(data.len()).ok_or(Error::InvalidArgument)?;
    if end > window.len() {
        return Err(Error::InvalidArgument);
    }
    window[offset..end].copy_from_slice(data);
    Ok(())
}

/// One tenant's pair of mailbox buffers plus the doorbell word.
pub struct MailboxChannel {
    t2p: [u8; TENANT2PF_MAILBOX_BYTES],
    p2t: [u8; PF2TENANT_MAILBOX_BYTES],
    isr_in_progress: bool,
}

impl Default for MailboxChannel {
    fn default() -> Self {
        MailboxChannel {
            t2p: [0; TENANT2PF_MAILBOX_BYTES],
            p2t: [0; PF2TENANT_MAILBOX_BYTES],
            isr_in_progress: false,
        }
    }
}

impl MailboxChannel {
    /// Doorbell handling: the tenant sets the in-progress word when it rings;
    /// the PF clears it after the response is in place.
    pub fn isr_in_progress(&self) -> bool {
        self.isr_in_progress
    }

    pub fn set_isr_in_progress(&mut self) {
        self.isr_in_progress = true;
    }

    pub fn clear_isr_in_progress(&mut self) {
        self.isr_in_progress = false;
    }

    pub fn request_type(&self) -> u32 {
        LittleEndian::read_u32(&self.t2p[TENANT2PF_REQ_BASE..TENANT2PF_REQ_BASE + 4])
    }

    pub fn request<T: ByteValued + Default>(&self) -> T {
        read_obj(&self.t2p[TENANT2PF_REQ_BASE..TENANT2PF_REQ_BASE + TENANT2PF_REQ_BYTES])
    }

    /// Tenant side: place a request in the tenant→PF slot.
    pub fn put_request<T: ByteValued>(&mut self, req: &T) {
        write_obj(
            &mut self.t2p[TENANT2PF_REQ_BASE..TENANT2PF_REQ_BASE + TENANT2PF_REQ_BYTES],
            req,
        );
    }

    /// PF side: place a response in the PF→tenant slot.
    pub fn put_response<T: ByteValued>(&mut self, resp: &T) {
        write_obj(
            &mut self.p2t[PF2TENANT_RESP_BASE..PF2TENANT_RESP_BASE + PF2TENANT_RESP_BYTES],
            resp,
        );
    }

    pub fn response<T: ByteValued + Default>(&self) -> T {
        read_obj(&self.p2t[PF2TENANT_RESP_BASE..PF2TENANT_RESP_BASE + PF2TENANT_RESP_BYTES])
    }

    /// PF side: place a PF-initiated request in the PF→tenant request slot.
    pub fn put_pf_request<T: ByteValued>(&mut self, req: &T) {
        write_obj(
            &mut self.p2t[PF2TENANT_REQ_BASE..PF2TENANT_REQ_BASE + PF2TENANT_REQ_BYTES],
            req,
        );
    }

    pub fn pf_request<T: ByteValued + Default>(&self) -> T {
        read_obj(&self.p2t[PF2TENANT_REQ_BASE..PF2TENANT_REQ_BASE + PF2TENANT_REQ_BYTES])
    }

    /// Tenant side: answer a PF-initiated request.
    pub fn put_tenant_response<T: ByteValued>(&mut self, resp: &T) {
        write_obj(
            &mut self.t2p[TENANT2PF_RESP_BASE..TENANT2PF_RESP_BASE + TENANT2PF_RESP_BYTES],
            resp,
        );
    }

    pub fn tenant_response<T: ByteValued + Default>(&self) -> T {
        read_obj(&self.t2p[TENANT2PF_RESP_BASE..TENANT2PF_RESP_BASE + TENANT2PF_RESP_BYTES])
    }

    // Raw byte access for the emulated register window.

    pub fn read_t2p(&self, offset: usize, data: &mut [u8]) -> Result<()> {
        copy_window(&self.t2p, offset, data)
    }

    pub fn write_t2p(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        patch_window(&mut self.t2p, offset, data)
    }

    pub fn read_p2t(&self, offset: usize, data: &mut [u8]) -> Result<()> {
        copy_window(&self.p2t, offset, data)
    }

    pub fn write_p2t(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        patch_window(&mut self.p2t, offset, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_response_slots_are_disjoint() {
        let mut ch = MailboxChannel::default();
        let req = RegisterReq {
            hdr: ReqHdr {
                cmd_type: CmdType::Register as u32,
            },
            interface_version: 1,
        };
        ch.put_request(&req);

        let resp = InUseResp {
            hdr: RespHdr { status: 0 },
            in_use: 1,
        };
        ch.put_tenant_response(&resp);

        // The tenant response occupies the mailbox tail and must not clobber
        // the request at its head.
        assert_eq!(ch.request_type(), CmdType::Register as u32);
        let back: RegisterReq = ch.request();
        assert_eq!(back.interface_version, 1);
        let tail: InUseResp = ch.tenant_response();
        assert_eq!(tail.in_use, 1);
    }

    #[test]
    fn pf_slots_are_disjoint() {
        let mut ch = MailboxChannel::default();
        ch.put_response(&CreateSchedDomainResp {
            hdr: RespHdr {
                status: MboxStatus::Success as u32,
            },
            error_code: 0,
            status: 0,
            id: 7,
        });
        ch.put_pf_request(&NotificationReq {
            hdr: ReqHdr {
                cmd_type: PfCmdType::Notification as u32,
            },
            notification: NotificationType::PreReset as u32,
        });

        let resp: CreateSchedDomainResp = ch.response();
        assert_eq!(resp.id, 7);
        let req: NotificationReq = ch.pf_request();
        assert_eq!(req.notification, NotificationType::PreReset as u32);
    }

    #[test]
    fn out_of_range_window_access_fails() {
        let mut ch = MailboxChannel::default();
        let mut buf = [0u8; 8];
        assert!(ch.read_t2p(TENANT2PF_MAILBOX_BYTES - 4, &mut buf).is_err());
        assert!(ch.write_p2t(PF2TENANT_MAILBOX_BYTES, &buf).is_err());
        assert!(ch.read_t2p(TENANT2PF_MAILBOX_BYTES - 8, &mut buf).is_ok());
    }
}
