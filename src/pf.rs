// Copyright © 2026 The vqsched Authors
//
// SPDX-License-Identifier: Apache-2.0
//
//! PF service: mailbox dispatch, tenant lifecycle, interrupt routing and the
//! resource-control surface.
//!
//! One mutex guards the ledger, the tenant directory and all emulated device
//! state. A second mutex serializes the interrupt-service path; it is always
//! taken before the state mutex, never inside it. The measurement unit has
//! its own lock so a long-running measurement cannot stall the service path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use vm_memory::ByteValued;

use crate::device::{CfgWriteEffect, MmioWriteEffect, VdevState};
use crate::hw::SchedHw;
use crate::mbox::*;
use crate::perf::PerfUnit;
use crate::resource::{DomainRequest, Ledger};
use crate::tenant::{Directory, INTERFACE_VERSION};
use crate::worker::{CleanupWorker, Job};
use crate::{Error, Result, MAX_TENANTS, NUM_COS_CLASSES};

/// A tenant sending more than this many requests within one window has its
/// mailbox disabled until it re-registers.
const MBOX_OVERLOAD_THRESHOLD: u32 = 1000;
const MBOX_OVERLOAD_PERIOD: Duration = Duration::from_secs(1);

/// Quota classes exposed on the resource-control surface.
#[derive(Clone, Copy, Debug)]
pub enum ResourceClass {
    SchedDomains,
    LdbQueues,
    LdbPorts,
    LdbCosPorts(usize),
    DirPorts,
    LdbCredits,
    DirCredits,
    HistListEntries,
    AtomicInflights,
}

pub struct PfState {
    pub ledger: Ledger,
    pub dir: Directory,
    pub hw: Box<dyn SchedHw>,
    pub vdevs: Vec<VdevState>,
    /// Physical CQ -> (tenant, vector) interrupt routing.
    cq_routes: HashMap<(u32, bool), (usize, u16)>,
}

pub struct PfDevice {
    pf_id: u8,
    state: Mutex<PfState>,
    service: Mutex<()>,
    perf: Mutex<PerfUnit>,
    worker: Mutex<Option<CleanupWorker>>,
}

impl PfDevice {
    pub fn new(pf_id: u8, hw: Box<dyn SchedHw>) -> Arc<Self> {
        Arc::new_cyclic(|weak| PfDevice {
            pf_id,
            state: Mutex::new(PfState {
                ledger: Ledger::new(),
                dir: Directory::new(),
                hw,
                vdevs: (0..MAX_TENANTS).map(|_| VdevState::new()).collect(),
                cq_routes: HashMap::new(),
            }),
            service: Mutex::new(()),
            perf: Mutex::new(PerfUnit::new()),
            worker: Mutex::new(Some(CleanupWorker::spawn(weak.clone()))),
        })
    }

    pub fn pf_id(&self) -> u8 {
        self.pf_id
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, PfState> {
        self.state.lock().unwrap()
    }

    // Tenant lifecycle.

    /// Bring a tenant function online: record its address-space id, enable
    /// the software mailbox, size the MSI-X table from the assigned ports and
    /// freeze the assignment.
    pub fn open_tenant(&self, tenant: usize, pasid: u32) -> Result<()> {
        let mut state = self.lock_state();
        if tenant >= state.vdevs.len() {
            return Err(Error::InvalidArgument);
        }
        state.dir.set_pasid(tenant, Some(pasid))?;
        let num_ldb = state.ledger.tenant(tenant)?.num_ldb_ports() as u16;
        let num_dir = state.ledger.tenant(tenant)?.num_dir_ports() as u16;
        if let Err(e) = state.ledger.lock(tenant) {
            state.dir.set_pasid(tenant, None)?;
            return Err(e);
        }
        let vdev = &mut state.vdevs[tenant];
        *vdev = VdevState::new();
        vdev.set_msix_table_size(num_ldb, num_dir);
        vdev.mbox_enabled = true;
        info!("tenant {tenant}: opened with {num_ldb} ldb / {num_dir} dir ports");
        Ok(())
    }

    /// Teardown entry point for an explicit close.
    pub fn release_tenant(&self, tenant: usize) -> Result<()> {
        self.release_internal(tenant)
    }

    /// Teardown entry point for an address-space invalidation.
    pub fn handle_address_space_invalidation(&self, tenant: usize) -> Result<()> {
        self.release_internal(tenant)
    }

    /// Teardown entry point for a group/lifecycle notification.
    pub fn handle_group_notification(&self, tenant: usize) -> Result<()> {
        self.release_internal(tenant)
    }

    /// Idempotent: the first caller wins, later callers see `released` set.
    fn release_internal(&self, tenant: usize) -> Result<()> {
        let mut state = self.lock_state();
        if tenant >= state.vdevs.len() {
            return Err(Error::InvalidArgument);
        }
        if state.vdevs[tenant].released {
            return Ok(());
        }
        state.vdevs[tenant].released = true;

        if state.dir.is_registered(tenant) {
            Self::post_notification(&mut state, tenant, NotificationType::PreReset);
        }
        self.reset_tenant_function(&mut state, tenant)?;
        state.dir.unregister(tenant)?;
        state.dir.set_pasid(tenant, None)?;
        let vdev = &mut state.vdevs[tenant];
        vdev.mbox_enabled = false;
        vdev.msix.clear_notifiers();
        info!("tenant {tenant}: released");
        Ok(())
    }

    /// Function-level reset requested through config space.
    pub(crate) fn function_level_reset(&self, tenant: usize) -> Result<()> {
        let mut state = self.lock_state();
        let registered = state.dir.is_registered(tenant);
        if registered {
            Self::post_notification(&mut state, tenant, NotificationType::PreReset);
        }
        self.reset_tenant_function(&mut state, tenant)?;
        if registered {
            Self::post_notification(&mut state, tenant, NotificationType::PostReset);
        }
        info!("tenant {tenant}: function-level reset");
        Ok(())
    }

    /// Tear down the tenant's domains and drop its interrupt routes. Quota
    /// assignments survive; they belong to the PF administrator.
    fn reset_tenant_function(&self, state: &mut PfState, tenant: usize) -> Result<()> {
        let PfState {
            ledger,
            hw,
            cq_routes,
            ..
        } = state;
        let stale: Vec<(u32, bool)> = cq_routes
            .iter()
            .filter(|(_, &(t, _))| t == tenant)
            .map(|(&k, _)| k)
            .collect();
        for (phys, is_ldb) in stale {
            hw.clear_cq_interrupt(phys, is_ldb);
            cq_routes.remove(&(phys, is_ldb));
        }
        ledger.reset_domains(tenant, hw.as_mut())?;
        ledger.unlock(tenant)
    }

    // PF-initiated mailbox traffic.

    fn post_notification(state: &mut PfState, tenant: usize, kind: NotificationType) {
        let vdev = &mut state.vdevs[tenant];
        vdev.channel.put_pf_request(&NotificationReq {
            hdr: ReqHdr {
                cmd_type: PfCmdType::Notification as u32,
            },
            notification: kind as u32,
        });
        let _ = vdev.msix.trigger(0);
    }

    /// Asynchronous domain alert (watchdog, illegal enqueue and the like)
    /// delivered through the PF request slot.
    pub fn post_domain_alert(
        &self,
        tenant: usize,
        domain_id: u32,
        alert_id: u32,
        aux_alert_data: u32,
    ) -> Result<()> {
        let mut state = self.lock_state();
        if tenant >= state.vdevs.len() {
            return Err(Error::InvalidArgument);
        }
        let vdev = &mut state.vdevs[tenant];
        vdev.channel.put_pf_request(&DomainAlertReq {
            hdr: ReqHdr {
                cmd_type: PfCmdType::DomainAlert as u32,
            },
            domain_id,
            alert_id,
            aux_alert_data,
        });
        let _ = vdev.msix.trigger(0);
        Ok(())
    }

    pub fn notify_tenant(&self, tenant: usize, kind: NotificationType) -> Result<()> {
        let mut state = self.lock_state();
        if tenant >= state.vdevs.len() {
            return Err(Error::InvalidArgument);
        }
        Self::post_notification(&mut state, tenant, kind);
        Ok(())
    }

    /// Ask a tenant whether it is still using the device. The answer is read
    /// from the tenant-response slot once the tenant has replied.
    pub fn query_in_use(&self, tenant: usize) -> Result<()> {
        let mut state = self.lock_state();
        if tenant >= state.vdevs.len() {
            return Err(Error::InvalidArgument);
        }
        let vdev = &mut state.vdevs[tenant];
        vdev.channel.put_pf_request(&InUseReq {
            hdr: ReqHdr {
                cmd_type: PfCmdType::InUse as u32,
            },
            padding: 0,
        });
        vdev.msix.trigger(0)
    }

    pub fn read_in_use_reply(&self, tenant: usize) -> Result<u32> {
        let state = self.lock_state();
        if tenant >= state.vdevs.len() {
            return Err(Error::InvalidArgument);
        }
        let resp: InUseResp = state.vdevs[tenant].channel.tenant_response();
        Ok(resp.in_use)
    }

    // Interrupt delivery.

    /// Demultiplex a physical CQ interrupt to the owning tenant's vector.
    pub fn deliver_cq_interrupt(&self, phys_port: u32, is_ldb: bool) {
        let _service = self.service.lock().unwrap();
        let mut state = self.lock_state();
        let route = state.cq_routes.get(&(phys_port, is_ldb)).copied();
        let (tenant, vector) = match route {
            Some(r) => r,
            None => match state.ledger.find_port_owner(phys_port, is_ldb) {
                // Unrouted but owned: CQ for virtual port N uses vector N+1.
                Some((t, virt)) => (t, (virt + 1) as u16),
                None => {
                    debug!("dropping interrupt for unowned cq {phys_port} (ldb={is_ldb})");
                    return;
                }
            },
        };
        // Errors are logged at the trigger site; the hardware path goes on.
        let _ = state.vdevs[tenant].msix.trigger(vector as usize);
    }

    // Mailbox entry points.

    /// Doorbell write from the emulated register window: latch the
    /// in-progress word and service the request.
    pub fn ring_mailbox(&self, tenant: usize) -> Result<()> {
        {
            let mut state = self.lock_state();
            if tenant >= state.vdevs.len() {
                return Err(Error::InvalidArgument);
            }
            let vdev = &mut state.vdevs[tenant];
            if !vdev.mbox_enabled || vdev.channel.isr_in_progress() {
                return Err(Error::Busy);
            }
            vdev.channel.set_isr_in_progress();
        }
        self.handle_mailbox(tenant);
        Ok(())
    }

    /// Tenant-side helper: place a request and ring the doorbell.
    pub fn post_request<T: ByteValued>(&self, tenant: usize, req: &T) -> Result<()> {
        {
            let mut state = self.lock_state();
            if tenant >= state.vdevs.len() {
                return Err(Error::InvalidArgument);
            }
            state.vdevs[tenant].channel.put_request(req);
        }
        self.ring_mailbox(tenant)
    }

    pub fn read_response<T: ByteValued + Default>(&self, tenant: usize) -> Result<T> {
        let state = self.lock_state();
        if tenant >= state.vdevs.len() {
            return Err(Error::InvalidArgument);
        }
        Ok(state.vdevs[tenant].channel.response())
    }

    fn handle_mailbox(&self, tenant: usize) {
        let _service = self.service.lock().unwrap();
        let mut state = self.lock_state();

        if self.mbox_overloaded(&mut state, tenant) {
            state.vdevs[tenant].channel.clear_isr_in_progress();
            return;
        }

        self.dispatch(&mut state, tenant);

        // Response in place before the doorbell clears; the completion
        // interrupt comes last.
        let vdev = &mut state.vdevs[tenant];
        vdev.channel.clear_isr_in_progress();
        let _ = vdev.msix.trigger(0);
    }

    fn mbox_overloaded(&self, state: &mut PfState, tenant: usize) -> bool {
        let vdev = &mut state.vdevs[tenant];
        let now = Instant::now();
        match vdev.mbox_window_start {
            Some(start) if now.duration_since(start) < MBOX_OVERLOAD_PERIOD => {
                vdev.mbox_requests += 1;
            }
            _ => {
                vdev.mbox_window_start = Some(now);
                vdev.mbox_requests = 1;
            }
        }
        if vdev.mbox_requests > MBOX_OVERLOAD_THRESHOLD {
            warn!("tenant {tenant}: mailbox overload, disabling until re-register");
            vdev.mbox_enabled = false;
            return true;
        }
        false
    }

    fn dispatch(&self, state: &mut PfState, tenant: usize) {
        let ty = state.vdevs[tenant].channel.request_type();
        let cmd = match CmdType::try_from(ty) {
            Ok(c) => c,
            Err(_) => {
                warn!("tenant {tenant}: unknown mailbox command type {ty}");
                state.vdevs[tenant].channel.put_response(&RespHdr {
                    status: MboxStatus::InvalidCmdType as u32,
                });
                return;
            }
        };
        debug!("tenant {tenant}: mailbox command {cmd:?}");

        match cmd {
            CmdType::Register => self.cmd_register(state, tenant),
            CmdType::Unregister => self.cmd_unregister(state, tenant),
            CmdType::GetNumResources => self.cmd_get_num_resources(state, tenant),
            CmdType::CreateSchedDomain => self.cmd_create_sched_domain(state, tenant),
            CmdType::ResetSchedDomain => self.cmd_reset_sched_domain(state, tenant),
            CmdType::CreateLdbQueue => self.cmd_create_ldb_queue(state, tenant),
            CmdType::CreateDirQueue => self.cmd_create_dir_queue(state, tenant),
            CmdType::CreateLdbPort => self.cmd_create_ldb_port(state, tenant),
            CmdType::CreateDirPort => self.cmd_create_dir_port(state, tenant),
            CmdType::EnableLdbPort => self.cmd_port_state(state, tenant, true, true),
            CmdType::DisableLdbPort => self.cmd_port_state(state, tenant, true, false),
            CmdType::EnableDirPort => self.cmd_port_state(state, tenant, false, true),
            CmdType::DisableDirPort => self.cmd_port_state(state, tenant, false, false),
            CmdType::LdbPortOwnedByDomain => self.cmd_port_owned(state, tenant, true),
            CmdType::DirPortOwnedByDomain => self.cmd_port_owned(state, tenant, false),
            CmdType::MapQid => self.cmd_map_qid(state, tenant),
            CmdType::UnmapQid => self.cmd_unmap_qid(state, tenant),
            CmdType::StartDomain => self.cmd_start_domain(state, tenant),
            CmdType::EnableLdbPortIntr => self.cmd_enable_port_intr(state, tenant, true),
            CmdType::EnableDirPortIntr => self.cmd_enable_port_intr(state, tenant, false),
            CmdType::ArmCqIntr => self.cmd_arm_cq_intr(state, tenant),
            CmdType::GetNumUsedResources => self.cmd_get_num_used(state, tenant),
            CmdType::InitCqSchedCount => self.cmd_init_sched_count(state, tenant),
            CmdType::CollectCqSchedCount => self.cmd_collect_sched_count(state, tenant),
            CmdType::GetSnAllocation => self.cmd_get_sn_allocation(state, tenant),
            CmdType::GetLdbQueueDepth => self.cmd_queue_depth(state, tenant, true),
            CmdType::GetDirQueueDepth => self.cmd_queue_depth(state, tenant, false),
            CmdType::PendingPortUnmaps => self.cmd_pending_unmaps(state, tenant),
            CmdType::GetCosBandwidth => self.cmd_get_cos_bandwidth(state, tenant),
        }
    }

    // Command handlers. Every handler writes exactly one response.

    fn cmd_register(&self, state: &mut PfState, tenant: usize) {
        let req: RegisterReq = state.vdevs[tenant].channel.request();

        if state.dir.is_registered(tenant) {
            // Re-registration resets whatever the previous driver instance
            // left in use.
            let PfState { ledger, hw, .. } = state;
            if let Err(e) = ledger.reset_domains(tenant, hw.as_mut()) {
                warn!("tenant {tenant}: re-register reset failed: {e}");
            }
        }

        let resp = match state.dir.register(tenant, req.interface_version) {
            Ok(()) => {
                state.vdevs[tenant].mbox_enabled = true;
                RegisterResp {
                    hdr: RespHdr {
                        status: MboxStatus::Success as u32,
                    },
                    interface_version: req.interface_version,
                    pf_id: self.pf_id,
                    tenant_id: tenant as u8,
                    is_auxiliary: u8::from(state.dir.is_aux(tenant)),
                    primary_id: state.dir.primary_of(tenant) as u8,
                    padding: 0,
                }
            }
            Err(_) => RegisterResp {
                hdr: RespHdr {
                    status: MboxStatus::VersionMismatch as u32,
                },
                interface_version: INTERFACE_VERSION,
                ..Default::default()
            },
        };
        state.vdevs[tenant].channel.put_response(&resp);
    }

    fn cmd_unregister(&self, state: &mut PfState, tenant: usize) {
        if let Err(e) = self.reset_tenant_function(state, tenant) {
            warn!("tenant {tenant}: unregister reset failed: {e}");
        }
        if let Err(e) = state.dir.unregister(tenant) {
            warn!("tenant {tenant}: unregister failed: {e}");
        }
        state.vdevs[tenant].channel.put_response(&UnregisterResp {
            hdr: RespHdr {
                status: MboxStatus::Success as u32,
            },
            padding: 0,
        });
    }

    fn cmd_get_num_resources(&self, state: &mut PfState, tenant: usize) {
        let owner = state.dir.primary_of(tenant);
        let mut resp = GetNumResourcesResp {
            hdr: RespHdr {
                status: MboxStatus::Success as u32,
            },
            ..Default::default()
        };
        match state.ledger.get_num_resources(owner) {
            Ok(snap) => {
                let c = snap.counts;
                resp.num_sched_domains = c.sched_domains as u16;
                resp.num_ldb_queues = c.ldb_queues as u16;
                resp.num_ldb_ports = c.ldb_ports() as u16;
                resp.num_cos0_ldb_ports = c.cos_ldb_ports[0] as u16;
                resp.num_cos1_ldb_ports = c.cos_ldb_ports[1] as u16;
                resp.num_cos2_ldb_ports = c.cos_ldb_ports[2] as u16;
                resp.num_cos3_ldb_ports = c.cos_ldb_ports[3] as u16;
                resp.num_dir_ports = c.dir_ports as u16;
                resp.num_atomic_inflights = c.atomic_inflights;
                resp.num_hist_list_entries = c.hist_list_entries;
                resp.max_contiguous_hist_list_entries = snap.max_contiguous_hist_list_entries;
                resp.num_ldb_credits = c.ldb_credits as u16;
                resp.num_dir_credits = c.dir_credits as u16;
            }
            Err(e) => resp.error_code = e.errno() as u32,
        }
        state.vdevs[tenant].channel.put_response(&resp);
    }

    fn cmd_get_num_used(&self, state: &mut PfState, tenant: usize) {
        let owner = state.dir.primary_of(tenant);
        let mut resp = GetNumResourcesResp {
            hdr: RespHdr {
                status: MboxStatus::Success as u32,
            },
            ..Default::default()
        };
        match state.ledger.get_num_used_resources(owner) {
            Ok(c) => {
                resp.num_sched_domains = c.sched_domains as u16;
                resp.num_ldb_queues = c.ldb_queues as u16;
                resp.num_ldb_ports = c.ldb_ports() as u16;
                resp.num_cos0_ldb_ports = c.cos_ldb_ports[0] as u16;
                resp.num_cos1_ldb_ports = c.cos_ldb_ports[1] as u16;
                resp.num_cos2_ldb_ports = c.cos_ldb_ports[2] as u16;
                resp.num_cos3_ldb_ports = c.cos_ldb_ports[3] as u16;
                resp.num_dir_ports = c.dir_ports as u16;
                resp.num_atomic_inflights = c.atomic_inflights;
                resp.num_hist_list_entries = c.hist_list_entries;
                resp.num_ldb_credits = c.ldb_credits as u16;
                resp.num_dir_credits = c.dir_credits as u16;
            }
            Err(e) => resp.error_code = e.errno() as u32,
        }
        state.vdevs[tenant].channel.put_response(&resp);
    }

    fn cmd_create_sched_domain(&self, state: &mut PfState, tenant: usize) {
        let req: CreateSchedDomainReq = state.vdevs[tenant].channel.request();
        let owner = state.dir.primary_of(tenant);
        let dreq = DomainRequest {
            num_ldb_queues: req.num_ldb_queues,
            num_ldb_ports: req.num_ldb_ports,
            num_cos_ldb_ports: [
                req.num_cos0_ldb_ports,
                req.num_cos1_ldb_ports,
                req.num_cos2_ldb_ports,
                req.num_cos3_ldb_ports,
            ],
            num_dir_ports: req.num_dir_ports,
            num_atomic_inflights: req.num_atomic_inflights,
            num_hist_list_entries: req.num_hist_list_entries,
            num_ldb_credits: req.num_ldb_credits,
            num_dir_credits: req.num_dir_credits,
            cos_strict: req.cos_strict != 0,
        };
        let mut resp = CreateSchedDomainResp {
            hdr: RespHdr {
                status: MboxStatus::Success as u32,
            },
            ..Default::default()
        };
        match state.ledger.create_sched_domain(owner, &dreq) {
            Ok(id) => resp.id = id,
            Err(e) => resp.error_code = e.errno() as u32,
        }
        state.vdevs[tenant].channel.put_response(&resp);
    }

    fn cmd_reset_sched_domain(&self, state: &mut PfState, tenant: usize) {
        let req: ResetSchedDomainReq = state.vdevs[tenant].channel.request();
        let owner = state.dir.primary_of(tenant);
        let PfState { ledger, hw, .. } = state;
        let mut resp = ResetSchedDomainResp {
            hdr: RespHdr {
                status: MboxStatus::Success as u32,
            },
            error_code: 0,
        };
        if let Err(e) = ledger.reset_sched_domain(owner, req.id, hw.as_mut()) {
            resp.error_code = e.errno() as u32;
        }
        state.vdevs[tenant].channel.put_response(&resp);
    }

    fn cmd_create_ldb_queue(&self, state: &mut PfState, tenant: usize) {
        let req: CreateLdbQueueReq = state.vdevs[tenant].channel.request();
        let owner = state.dir.primary_of(tenant);
        let mut resp = CreateLdbQueueResp {
            hdr: RespHdr {
                status: MboxStatus::Success as u32,
            },
            ..Default::default()
        };
        match state.ledger.create_ldb_queue(
            owner,
            req.domain_id,
            req.num_sequence_numbers,
            req.num_atomic_inflights,
            req.depth_threshold,
        ) {
            Ok(id) => resp.id = id,
            Err(e) => resp.error_code = e.errno() as u32,
        }
        state.vdevs[tenant].channel.put_response(&resp);
    }

    fn cmd_create_dir_queue(&self, state: &mut PfState, tenant: usize) {
        let req: CreateDirQueueReq = state.vdevs[tenant].channel.request();
        let owner = state.dir.primary_of(tenant);
        let mut resp = CreateDirQueueResp {
            hdr: RespHdr {
                status: MboxStatus::Success as u32,
            },
            ..Default::default()
        };
        match state
            .ledger
            .create_dir_queue(owner, req.domain_id, req.port_id, req.depth_threshold)
        {
            Ok(id) => resp.id = id,
            Err(e) => resp.error_code = e.errno() as u32,
        }
        state.vdevs[tenant].channel.put_response(&resp);
    }

    fn cmd_create_ldb_port(&self, state: &mut PfState, tenant: usize) {
        let req: CreateLdbPortReq = state.vdevs[tenant].channel.request();
        let owner = state.dir.primary_of(tenant);
        let mut resp = CreateLdbPortResp {
            hdr: RespHdr {
                status: MboxStatus::Success as u32,
            },
            ..Default::default()
        };
        match state.ledger.create_ldb_port(
            owner,
            req.domain_id,
            req.cos_id as usize,
            req.cos_strict != 0,
            req.cq_depth,
            req.cq_history_list_size,
        ) {
            Ok(id) => resp.id = id,
            Err(e) => resp.error_code = e.errno() as u32,
        }
        state.vdevs[tenant].channel.put_response(&resp);
    }

    fn cmd_create_dir_port(&self, state: &mut PfState, tenant: usize) {
        let req: CreateDirPortReq = state.vdevs[tenant].channel.request();
        let owner = state.dir.primary_of(tenant);
        let mut resp = CreateDirPortResp {
            hdr: RespHdr {
                status: MboxStatus::Success as u32,
            },
            ..Default::default()
        };
        match state.ledger.create_dir_port(owner, req.domain_id, req.cq_depth) {
            Ok(id) => resp.id = id,
            Err(e) => resp.error_code = e.errno() as u32,
        }
        state.vdevs[tenant].channel.put_response(&resp);
    }

    fn cmd_port_state(&self, state: &mut PfState, tenant: usize, is_ldb: bool, enable: bool) {
        let req: PortStateChangeReq = state.vdevs[tenant].channel.request();
        let owner = state.dir.primary_of(tenant);
        let mut resp = PortStateChangeResp {
            hdr: RespHdr {
                status: MboxStatus::Success as u32,
            },
            ..Default::default()
        };
        if let Err(e) =
            state
                .ledger
                .set_port_enabled(owner, req.domain_id, req.port_id, is_ldb, enable)
        {
            resp.error_code = e.errno() as u32;
        }
        state.vdevs[tenant].channel.put_response(&resp);
    }

    fn cmd_port_owned(&self, state: &mut PfState, tenant: usize, is_ldb: bool) {
        let req: PortOwnedByDomainReq = state.vdevs[tenant].channel.request();
        let owner = state.dir.primary_of(tenant);
        let owned = state
            .ledger
            .port_owned_by_domain(owner, req.domain_id, req.port_id, is_ldb);
        state.vdevs[tenant].channel.put_response(&PortOwnedByDomainResp {
            hdr: RespHdr {
                status: MboxStatus::Success as u32,
            },
            owned: i32::from(owned),
        });
    }

    fn cmd_map_qid(&self, state: &mut PfState, tenant: usize) {
        let req: MapQidReq = state.vdevs[tenant].channel.request();
        let owner = state.dir.primary_of(tenant);
        let mut resp = MapQidResp {
            hdr: RespHdr {
                status: MboxStatus::Success as u32,
            },
            ..Default::default()
        };
        match state
            .ledger
            .map_qid(owner, req.domain_id, req.port_id, req.qid, req.priority)
        {
            Ok(id) => resp.id = id,
            Err(e) => resp.error_code = e.errno() as u32,
        }
        state.vdevs[tenant].channel.put_response(&resp);
    }

    fn cmd_unmap_qid(&self, state: &mut PfState, tenant: usize) {
        let req: UnmapQidReq = state.vdevs[tenant].channel.request();
        let owner = state.dir.primary_of(tenant);
        let mut resp = UnmapQidResp {
            hdr: RespHdr {
                status: MboxStatus::Success as u32,
            },
            ..Default::default()
        };
        match state.ledger.unmap_qid(owner, req.domain_id, req.port_id, req.qid) {
            Ok(()) => {
                // Completion happens off the critical path.
                self.queue_job(Job::CompleteUnmaps {
                    tenant: owner,
                    domain: req.domain_id,
                });
            }
            Err(e) => resp.error_code = e.errno() as u32,
        }
        state.vdevs[tenant].channel.put_response(&resp);
    }

    fn cmd_start_domain(&self, state: &mut PfState, tenant: usize) {
        let req: StartDomainReq = state.vdevs[tenant].channel.request();
        let owner = state.dir.primary_of(tenant);
        let mut resp = StartDomainResp {
            hdr: RespHdr {
                status: MboxStatus::Success as u32,
            },
            ..Default::default()
        };
        if let Err(e) = state.ledger.start_domain(owner, req.domain_id) {
            resp.error_code = e.errno() as u32;
        }
        state.vdevs[tenant].channel.put_response(&resp);
    }

    fn cmd_enable_port_intr(&self, state: &mut PfState, tenant: usize, is_ldb: bool) {
        let req: EnablePortIntrReq = state.vdevs[tenant].channel.request();
        let owner = req.owner as usize;

        // The named owner must be the caller, or the caller's primary if the
        // caller is auxiliary.
        let invalid_owner = owner >= MAX_TENANTS
            || (state.dir.is_aux(tenant) && state.dir.primary_of(tenant) != owner)
            || (!state.dir.is_aux(tenant) && owner != tenant);
        if invalid_owner {
            state.vdevs[tenant].channel.put_response(&RespHdr {
                status: MboxStatus::InvalidOwner as u32,
            });
            return;
        }

        let mut resp = EnablePortIntrResp {
            hdr: RespHdr {
                status: MboxStatus::Success as u32,
            },
            ..Default::default()
        };
        let phys = if is_ldb {
            state.ledger.ldb_port_phys_id(owner, u32::from(req.port_id))
        } else {
            state.ledger.dir_port_phys_id(owner, u32::from(req.port_id))
        };
        match phys {
            Ok(phys) => {
                state
                    .hw
                    .configure_cq_interrupt(phys, is_ldb, req.vector, req.thresh);
                state
                    .cq_routes
                    .insert((phys, is_ldb), (tenant, req.vector));
            }
            Err(e) => resp.error_code = e.errno() as u32,
        }
        state.vdevs[tenant].channel.put_response(&resp);
    }

    fn cmd_arm_cq_intr(&self, state: &mut PfState, tenant: usize) {
        let req: ArmCqIntrReq = state.vdevs[tenant].channel.request();
        let owner = state.dir.primary_of(tenant);
        let is_ldb = req.is_ldb != 0;
        let mut resp = ArmCqIntrResp {
            hdr: RespHdr {
                status: MboxStatus::Success as u32,
            },
            ..Default::default()
        };
        let phys = if is_ldb {
            state.ledger.ldb_port_phys_id(owner, req.port_id)
        } else {
            state.ledger.dir_port_phys_id(owner, req.port_id)
        };
        match phys {
            Ok(phys) => state.hw.arm_cq_interrupt(phys, is_ldb),
            Err(e) => resp.error_code = e.errno() as u32,
        }
        state.vdevs[tenant].channel.put_response(&resp);
    }

    fn cmd_init_sched_count(&self, state: &mut PfState, tenant: usize) {
        let req: InitCqSchedCountReq = state.vdevs[tenant].channel.request();
        let mut perf = self.perf.lock().unwrap();
        let mut resp = InitCqSchedCountResp {
            hdr: RespHdr {
                status: MboxStatus::Success as u32,
            },
            error_code: 0,
        };
        if let Err(e) = perf.init(req.duration_us, state.hw.as_mut()) {
            resp.error_code = e.errno() as u32;
        }
        state.vdevs[tenant].channel.put_response(&resp);
    }

    fn cmd_collect_sched_count(&self, state: &mut PfState, tenant: usize) {
        let req: CollectCqSchedCountReq = state.vdevs[tenant].channel.request();
        let owner = state.dir.primary_of(tenant);
        let is_ldb = req.is_ldb != 0;
        let mut resp = CollectCqSchedCountResp {
            hdr: RespHdr {
                status: MboxStatus::Success as u32,
            },
            ..Default::default()
        };
        let phys = if is_ldb {
            state.ledger.ldb_port_phys_id(owner, u32::from(req.cq_id))
        } else {
            state.ledger.dir_port_phys_id(owner, u32::from(req.cq_id))
        };
        let result = phys.and_then(|phys| {
            let mut perf = self.perf.lock().unwrap();
            perf.collect(owner, phys, is_ldb, state.hw.as_mut())
        });
        match result {
            Ok((elapsed, count)) => {
                resp.elapsed = elapsed;
                resp.cq_sched_count = count;
            }
            Err(e) => resp.error_code = e.errno() as u32,
        }
        state.vdevs[tenant].channel.put_response(&resp);
    }

    fn cmd_get_sn_allocation(&self, state: &mut PfState, tenant: usize) {
        let req: GetSnAllocationReq = state.vdevs[tenant].channel.request();
        let num = state
            .ledger
            .get_sn_allocation(req.group_id as usize)
            .unwrap_or(0);
        state.vdevs[tenant].channel.put_response(&GetSnAllocationResp {
            hdr: RespHdr {
                status: MboxStatus::Success as u32,
            },
            num,
        });
    }

    fn cmd_get_cos_bandwidth(&self, state: &mut PfState, tenant: usize) {
        let req: GetCosBandwidthReq = state.vdevs[tenant].channel.request();
        let num = state
            .ledger
            .get_cos_bandwidth(req.cos_id as usize)
            .unwrap_or(0);
        state.vdevs[tenant].channel.put_response(&GetCosBandwidthResp {
            hdr: RespHdr {
                status: MboxStatus::Success as u32,
            },
            num,
        });
    }

    fn cmd_queue_depth(&self, state: &mut PfState, tenant: usize, is_ldb: bool) {
        let req: GetQueueDepthReq = state.vdevs[tenant].channel.request();
        let owner = state.dir.primary_of(tenant);
        let PfState { ledger, hw, .. } = state;
        let mut resp = GetQueueDepthResp {
            hdr: RespHdr {
                status: MboxStatus::Success as u32,
            },
            ..Default::default()
        };
        match ledger.queue_depth(owner, req.domain_id, req.queue_id, is_ldb, hw.as_mut()) {
            Ok(depth) => resp.depth = depth,
            Err(e) => resp.error_code = e.errno() as u32,
        }
        state.vdevs[tenant].channel.put_response(&resp);
    }

    fn cmd_pending_unmaps(&self, state: &mut PfState, tenant: usize) {
        let req: PendingPortUnmapsReq = state.vdevs[tenant].channel.request();
        let owner = state.dir.primary_of(tenant);
        let mut resp = PendingPortUnmapsResp {
            hdr: RespHdr {
                status: MboxStatus::Success as u32,
            },
            ..Default::default()
        };
        match state
            .ledger
            .pending_port_unmaps(owner, req.domain_id, req.port_id)
        {
            Ok(num) => resp.num = num,
            Err(e) => resp.error_code = e.errno() as u32,
        }
        state.vdevs[tenant].channel.put_response(&resp);
    }

    // Device-emulation hooks used by the passthrough surface.

    pub(crate) fn apply_cfg_effect(&self, tenant: usize, effect: CfgWriteEffect) {
        if effect == CfgWriteEffect::FunctionLevelReset {
            if let Err(e) = self.function_level_reset(tenant) {
                error!("tenant {tenant}: function-level reset failed: {e}");
            }
        }
    }

    pub(crate) fn apply_mmio_effect(&self, tenant: usize, effect: MmioWriteEffect) {
        if effect == MmioWriteEffect::MailboxDoorbell {
            if let Err(e) = self.ring_mailbox(tenant) {
                debug!("tenant {tenant}: dropped doorbell write: {e}");
            }
        }
    }

    // Background cleanup.

    fn queue_job(&self, job: Job) {
        if let Some(worker) = self.worker.lock().unwrap().as_ref() {
            worker.queue(job);
        }
    }

    pub(crate) fn complete_unmaps(&self, tenant: usize, domain: u32) {
        let mut state = self.lock_state();
        match state.ledger.complete_unmaps(tenant, domain) {
            Ok(n) if n > 0 => debug!("tenant {tenant}: completed {n} queue unmaps"),
            Ok(_) => {}
            Err(e) => debug!("tenant {tenant}: deferred unmap skipped: {e}"),
        }
    }

    // Resource-control surface.

    pub fn set_quota(&self, tenant: usize, class: ResourceClass, num: u32) -> Result<()> {
        let mut state = self.lock_state();
        match class {
            ResourceClass::SchedDomains => state.ledger.update_sched_domains(tenant, num),
            ResourceClass::LdbQueues => state.ledger.update_ldb_queues(tenant, num),
            ResourceClass::LdbPorts => state.ledger.update_ldb_ports(tenant, num),
            ResourceClass::LdbCosPorts(cos) => state.ledger.update_ldb_cos_ports(tenant, cos, num),
            ResourceClass::DirPorts => state.ledger.update_dir_ports(tenant, num),
            ResourceClass::LdbCredits => state.ledger.update_ldb_credits(tenant, num),
            ResourceClass::DirCredits => state.ledger.update_dir_credits(tenant, num),
            ResourceClass::HistListEntries => state.ledger.update_hist_list_entries(tenant, num),
            ResourceClass::AtomicInflights => state.ledger.update_atomic_inflights(tenant, num),
        }
    }

    /// Assigned quota for a class: still-available plus in-use.
    pub fn get_quota(&self, tenant: usize, class: ResourceClass) -> Result<u32> {
        let state = self.lock_state();
        let avail = state.ledger.get_num_resources(tenant)?.counts;
        let used = state.ledger.get_num_used_resources(tenant)?;
        Ok(match class {
            ResourceClass::SchedDomains => avail.sched_domains + used.sched_domains,
            ResourceClass::LdbQueues => avail.ldb_queues + used.ldb_queues,
            ResourceClass::LdbPorts => avail.ldb_ports() + used.ldb_ports(),
            ResourceClass::LdbCosPorts(cos) => {
                if cos >= NUM_COS_CLASSES {
                    return Err(Error::InvalidArgument);
                }
                avail.cos_ldb_ports[cos] + used.cos_ldb_ports[cos]
            }
            ResourceClass::DirPorts => avail.dir_ports + used.dir_ports,
            ResourceClass::LdbCredits => avail.ldb_credits + used.ldb_credits,
            ResourceClass::DirCredits => avail.dir_credits + used.dir_credits,
            ResourceClass::HistListEntries => avail.hist_list_entries + used.hist_list_entries,
            ResourceClass::AtomicInflights => avail.atomic_inflights + used.atomic_inflights,
        })
    }

    pub fn is_locked(&self, tenant: usize) -> bool {
        self.lock_state().ledger.is_locked(tenant)
    }

    pub fn aux_ids(&self, primary: usize) -> Vec<usize> {
        self.lock_state().dir.aux_ids(primary)
    }

    /// Replace the auxiliary list of a primary tenant. A tenant made
    /// auxiliary returns its entire quota to the PF pool.
    pub fn set_aux_ids(&self, primary: usize, ids: &[usize]) -> Result<()> {
        let mut state = self.lock_state();
        if state.ledger.is_locked(primary) {
            return Err(Error::PermissionDenied);
        }
        for &id in ids {
            if id >= MAX_TENANTS {
                return Err(Error::InvalidArgument);
            }
            if state.ledger.is_locked(id) {
                return Err(Error::PermissionDenied);
            }
        }
        // A locked auxiliary is pinned to its primary; reject before any
        // state changes.
        let current = state.dir.aux_ids(primary);
        for &id in &current {
            if !ids.contains(&id) && state.ledger.is_locked(id) {
                return Err(Error::PermissionDenied);
            }
        }
        for id in current {
            if !ids.contains(&id) {
                state.dir.unlink_aux(id)?;
            }
        }
        for &id in ids {
            if state.dir.primary_of(id) == primary && state.dir.is_aux(id) {
                continue;
            }
            state.dir.link_aux(primary, id)?;
            state.ledger.clear_quotas(id)?;
        }
        Ok(())
    }
}

impl Drop for PfDevice {
    fn drop(&mut self) {
        // Stops and joins the cleanup thread.
        self.worker.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::ShadowHw;
    use crate::interrupt::tests::RecordingNotifier;
    use crate::resource::ResourceCounts;

    fn pf() -> Arc<PfDevice> {
        PfDevice::new(0, Box::<ShadowHw>::default())
    }

    fn enable_mbox(pf: &PfDevice, tenant: usize) {
        pf.lock_state().vdevs[tenant].mbox_enabled = true;
    }

    fn register(pf: &PfDevice, tenant: usize) {
        enable_mbox(pf, tenant);
        pf.post_request(
            tenant,
            &RegisterReq {
                hdr: ReqHdr {
                    cmd_type: CmdType::Register as u32,
                },
                interface_version: INTERFACE_VERSION,
            },
        )
        .unwrap();
        let resp: RegisterResp = pf.read_response(tenant).unwrap();
        assert_eq!(resp.hdr.status, MboxStatus::Success as u32);
    }

    #[test]
    fn register_reports_identity() {
        let pf = pf();
        enable_mbox(&pf, 3);
        pf.post_request(
            3,
            &RegisterReq {
                hdr: ReqHdr {
                    cmd_type: CmdType::Register as u32,
                },
                interface_version: 1,
            },
        )
        .unwrap();
        let resp: RegisterResp = pf.read_response(3).unwrap();
        assert_eq!(resp.hdr.status, MboxStatus::Success as u32);
        assert_eq!(resp.tenant_id, 3);
        assert_eq!(resp.is_auxiliary, 0);
    }

    #[test]
    fn version_mismatch_reports_pf_version() {
        let pf = pf();
        enable_mbox(&pf, 0);
        pf.post_request(
            0,
            &RegisterReq {
                hdr: ReqHdr {
                    cmd_type: CmdType::Register as u32,
                },
                interface_version: INTERFACE_VERSION + 5,
            },
        )
        .unwrap();
        let resp: RegisterResp = pf.read_response(0).unwrap();
        assert_eq!(resp.hdr.status, MboxStatus::VersionMismatch as u32);
        assert_eq!(resp.interface_version, INTERFACE_VERSION);
    }

    #[test]
    fn out_of_range_command_gets_status_only_response() {
        let pf = pf();
        enable_mbox(&pf, 0);
        pf.post_request(
            0,
            &ReqHdr {
                cmd_type: NUM_CMD_TYPES + 17,
            },
        )
        .unwrap();
        let resp: RespHdr = pf.read_response(0).unwrap();
        assert_eq!(resp.status, MboxStatus::InvalidCmdType as u32);
        // The doorbell must be clear again.
        assert!(!pf.lock_state().vdevs[0].channel.isr_in_progress());
    }

    #[test]
    fn invalid_owner_is_rejected() {
        let pf = pf();
        register(&pf, 0);
        pf.post_request(
            0,
            &EnablePortIntrReq {
                hdr: ReqHdr {
                    cmd_type: CmdType::EnableLdbPortIntr as u32,
                },
                port_id: 0,
                thresh: 1,
                vector: 1,
                owner: 5,
                reserved: [0; 2],
            },
        )
        .unwrap();
        let resp: RespHdr = pf.read_response(0).unwrap();
        assert_eq!(resp.status, MboxStatus::InvalidOwner as u32);
    }

    #[test]
    fn mailbox_capacity_scenario() {
        let pf = pf();
        pf.set_quota(0, ResourceClass::SchedDomains, 1).unwrap();
        pf.set_quota(0, ResourceClass::LdbPorts, 4).unwrap();
        pf.set_quota(0, ResourceClass::LdbQueues, 1).unwrap();
        pf.open_tenant(0, 100).unwrap();
        register(&pf, 0);

        pf.post_request(
            0,
            &CreateSchedDomainReq {
                hdr: ReqHdr {
                    cmd_type: CmdType::CreateSchedDomain as u32,
                },
                num_ldb_queues: 1,
                num_ldb_ports: 4,
                ..Default::default()
            },
        )
        .unwrap();
        let resp: CreateSchedDomainResp = pf.read_response(0).unwrap();
        assert_eq!(resp.error_code, 0);
        let domain = resp.id;

        // All four ports can be created; a fifth cannot.
        for i in 0..4 {
            pf.post_request(
                0,
                &CreateLdbPortReq {
                    hdr: ReqHdr {
                        cmd_type: CmdType::CreateLdbPort as u32,
                    },
                    domain_id: domain,
                    cq_depth: 16,
                    cq_history_list_size: 0,
                    cos_id: 0,
                    cos_strict: 0,
                    padding: 0,
                },
            )
            .unwrap();
            let resp: CreateLdbPortResp = pf.read_response(0).unwrap();
            assert_eq!(resp.error_code, 0, "port {i}");
        }
        pf.post_request(
            0,
            &CreateLdbPortReq {
                hdr: ReqHdr {
                    cmd_type: CmdType::CreateLdbPort as u32,
                },
                domain_id: domain,
                cq_depth: 16,
                cq_history_list_size: 0,
                cos_id: 0,
                cos_strict: 0,
                padding: 0,
            },
        )
        .unwrap();
        let resp: CreateLdbPortResp = pf.read_response(0).unwrap();
        assert_eq!(resp.error_code, (-libc::ENOSPC) as u32);
    }

    #[test]
    fn cq_interrupt_routing_and_masking() {
        let pf = pf();
        pf.set_quota(0, ResourceClass::SchedDomains, 1).unwrap();
        pf.set_quota(0, ResourceClass::LdbPorts, 1).unwrap();
        pf.open_tenant(0, 1).unwrap();
        register(&pf, 0);

        pf.post_request(
            0,
            &EnablePortIntrReq {
                hdr: ReqHdr {
                    cmd_type: CmdType::EnableLdbPortIntr as u32,
                },
                port_id: 0,
                thresh: 1,
                vector: 1,
                owner: 0,
                reserved: [0; 2],
            },
        )
        .unwrap();
        let resp: EnablePortIntrResp = pf.read_response(0).unwrap();
        assert_eq!(resp.error_code, 0);

        let notifier = Arc::new(RecordingNotifier::default());
        let phys = {
            let mut state = pf.lock_state();
            state.vdevs[0].msix.set_msg_ctrl(true, false);
            state.vdevs[0].msix.set_notifier(1, Some(notifier.clone()));
            state.ledger.ldb_port_phys_id(0, 0).unwrap()
        };

        pf.deliver_cq_interrupt(phys, true);
        assert_eq!(notifier.fired.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Function-masked delivery latches; unmask flushes.
        pf.lock_state().vdevs[0].msix.set_msg_ctrl(true, true);
        pf.deliver_cq_interrupt(phys, true);
        assert_eq!(notifier.fired.load(std::sync::atomic::Ordering::SeqCst), 1);
        pf.lock_state().vdevs[0].msix.set_msg_ctrl(true, false);
        assert_eq!(notifier.fired.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn release_is_idempotent_and_returns_resources() {
        let pf = pf();
        pf.set_quota(0, ResourceClass::SchedDomains, 2).unwrap();
        pf.set_quota(0, ResourceClass::LdbCredits, 128).unwrap();
        pf.open_tenant(0, 7).unwrap();
        register(&pf, 0);

        pf.post_request(
            0,
            &CreateSchedDomainReq {
                hdr: ReqHdr {
                    cmd_type: CmdType::CreateSchedDomain as u32,
                },
                num_ldb_credits: 64,
                ..Default::default()
            },
        )
        .unwrap();
        let resp: CreateSchedDomainResp = pf.read_response(0).unwrap();
        assert_eq!(resp.error_code, 0);

        pf.release_tenant(0).unwrap();
        // Second trigger from a concurrent notifier path is a no-op.
        pf.handle_address_space_invalidation(0).unwrap();

        let state = pf.lock_state();
        assert!(!state.ledger.is_locked(0));
        assert_eq!(
            state.ledger.get_num_used_resources(0).unwrap(),
            ResourceCounts::default()
        );
        assert!(!state.dir.is_registered(0));
    }

    #[test]
    fn concurrent_teardown_resets_hardware_once() {
        let hw = ShadowHw::default();
        let resets = hw.port_resets.clone();
        let pf = PfDevice::new(0, Box::new(hw));
        pf.set_quota(0, ResourceClass::SchedDomains, 1).unwrap();
        pf.set_quota(0, ResourceClass::DirPorts, 1).unwrap();
        pf.open_tenant(0, 4).unwrap();
        register(&pf, 0);

        pf.post_request(
            0,
            &CreateSchedDomainReq {
                hdr: ReqHdr {
                    cmd_type: CmdType::CreateSchedDomain as u32,
                },
                num_dir_ports: 1,
                ..Default::default()
            },
        )
        .unwrap();
        let resp: CreateSchedDomainResp = pf.read_response(0).unwrap();
        assert_eq!(resp.error_code, 0);
        pf.post_request(
            0,
            &CreateDirPortReq {
                hdr: ReqHdr {
                    cmd_type: CmdType::CreateDirPort as u32,
                },
                domain_id: resp.id,
                cq_depth: 16,
                padding: 0,
                queue_id: -1,
            },
        )
        .unwrap();
        let port: CreateDirPortResp = pf.read_response(0).unwrap();
        assert_eq!(port.error_code, 0);

        // Both teardown triggers race; the released flag lets one through.
        let t1 = {
            let pf = pf.clone();
            std::thread::spawn(move || pf.release_tenant(0))
        };
        let t2 = {
            let pf = pf.clone();
            std::thread::spawn(move || pf.handle_address_space_invalidation(0))
        };
        t1.join().unwrap().unwrap();
        t2.join().unwrap().unwrap();

        assert_eq!(resets.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!pf.lock_state().ledger.is_locked(0));
    }

    #[test]
    fn overload_disables_mailbox() {
        let pf = pf();
        register(&pf, 0);
        let req = GetNumResourcesReq {
            hdr: ReqHdr {
                cmd_type: CmdType::GetNumResources as u32,
            },
            padding: 0,
        };
        // The register request already opened the window, so this loop's last
        // request trips the limit.
        for _ in 0..MBOX_OVERLOAD_THRESHOLD {
            pf.post_request(0, &req).unwrap();
        }
        assert_eq!(pf.post_request(0, &req), Err(Error::Busy));

        // Recovery requires PF intervention: re-enable and start a new window.
        {
            let mut state = pf.lock_state();
            state.vdevs[0].mbox_enabled = true;
            state.vdevs[0].mbox_window_start = None;
        }
        register(&pf, 0);
        pf.post_request(0, &req).unwrap();
    }

    #[test]
    fn aux_tenant_acts_for_primary() {
        let pf = pf();
        pf.set_quota(0, ResourceClass::DirPorts, 2).unwrap();
        pf.set_quota(1, ResourceClass::DirPorts, 1).unwrap();
        pf.set_aux_ids(0, &[1]).unwrap();
        // Becoming auxiliary returned tenant 1's quota.
        assert_eq!(pf.get_quota(1, ResourceClass::DirPorts).unwrap(), 0);

        register(&pf, 1);
        pf.post_request(
            1,
            &GetNumResourcesReq {
                hdr: ReqHdr {
                    cmd_type: CmdType::GetNumResources as u32,
                },
                padding: 0,
            },
        )
        .unwrap();
        let resp: GetNumResourcesResp = pf.read_response(1).unwrap();
        // The auxiliary sees its primary's resources.
        assert_eq!(resp.num_dir_ports, 2);
    }

    #[test]
    fn aux_rules_reject_locked_tenants() {
        let pf = pf();
        pf.open_tenant(2, 9).unwrap();
        assert_eq!(pf.set_aux_ids(2, &[3]), Err(Error::PermissionDenied));
        assert_eq!(pf.set_aux_ids(0, &[2]), Err(Error::PermissionDenied));
        assert_eq!(pf.set_aux_ids(0, &[MAX_TENANTS]), Err(Error::InvalidArgument));
    }

    #[test]
    fn locked_aux_cannot_be_removed() {
        let pf = pf();
        pf.set_aux_ids(0, &[1]).unwrap();
        pf.open_tenant(1, 55).unwrap();

        // Dropping a locked auxiliary must fail with the linkage intact.
        assert_eq!(pf.set_aux_ids(0, &[]), Err(Error::PermissionDenied));
        assert_eq!(pf.aux_ids(0), vec![1]);

        // Once the auxiliary is released (and unlocked), removal succeeds.
        pf.release_tenant(1).unwrap();
        pf.set_aux_ids(0, &[]).unwrap();
        assert!(pf.aux_ids(0).is_empty());
    }

    #[test]
    fn domain_alert_reaches_the_request_slot() {
        let pf = pf();
        register(&pf, 0);
        pf.post_domain_alert(0, 3, 11, 0xdead).unwrap();
        let state = pf.lock_state();
        let alert: DomainAlertReq = state.vdevs[0].channel.pf_request();
        assert_eq!(alert.hdr.cmd_type, PfCmdType::DomainAlert as u32);
        assert_eq!(alert.domain_id, 3);
        assert_eq!(alert.alert_id, 11);
        assert_eq!(alert.aux_alert_data, 0xdead);
    }

    #[test]
    fn in_use_query_roundtrip() {
        let pf = pf();
        register(&pf, 0);
        let _ = pf.query_in_use(0);
        {
            let mut state = pf.lock_state();
            let req: InUseReq = state.vdevs[0].channel.pf_request();
            assert_eq!(req.hdr.cmd_type, PfCmdType::InUse as u32);
            state.vdevs[0].channel.put_tenant_response(&InUseResp {
                hdr: RespHdr { status: 0 },
                in_use: 1,
            });
        }
        assert_eq!(pf.read_in_use_reply(0).unwrap(), 1);
    }

    #[test]
    fn measurement_over_mailbox() {
        let pf = pf();
        pf.set_quota(0, ResourceClass::LdbPorts, 1).unwrap();
        pf.open_tenant(0, 1).unwrap();
        register(&pf, 0);

        pf.post_request(
            0,
            &InitCqSchedCountReq {
                hdr: ReqHdr {
                    cmd_type: CmdType::InitCqSchedCount as u32,
                },
                duration_us: 0,
            },
        )
        .unwrap();
        let resp: InitCqSchedCountResp = pf.read_response(0).unwrap();
        assert_eq!(resp.error_code, 0);

        // Second init while claimed reports busy.
        pf.post_request(
            0,
            &InitCqSchedCountReq {
                hdr: ReqHdr {
                    cmd_type: CmdType::InitCqSchedCount as u32,
                },
                duration_us: 0,
            },
        )
        .unwrap();
        let resp: InitCqSchedCountResp = pf.read_response(0).unwrap();
        assert_eq!(resp.error_code, (-libc::EBUSY) as u32);

        pf.post_request(
            0,
            &CollectCqSchedCountReq {
                hdr: ReqHdr {
                    cmd_type: CmdType::CollectCqSchedCount as u32,
                },
                cq_id: 0,
                is_ldb: 1,
            },
        )
        .unwrap();
        let resp: CollectCqSchedCountResp = pf.read_response(0).unwrap();
        assert_eq!(resp.error_code, 0);
        assert_eq!(resp.cq_sched_count, 0);
    }
}
