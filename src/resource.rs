// Copyright © 2026 The vqsched Authors
//
// SPDX-License-Identifier: Apache-2.0
//
//! Resource ledger.
//!
//! The PF owns a fixed pool of scheduler resources. Tenants are assigned
//! quotas out of that pool before they are locked, then consume their
//! assignment by creating scheduling domains at runtime. Every quota update
//! follows the same pattern: detach the tenant's current assignment back to
//! the pool, check the request against what is now available, and either
//! transfer the requested amount or restore the prior state untouched.

use std::time::{Duration, Instant};

use crate::hw::SchedHw;
use crate::{
    Error, Result, MAX_TENANTS, NUM_ATOMIC_INFLIGHTS, NUM_COS_CLASSES, NUM_DIR_CREDITS,
    NUM_DIR_PORTS, NUM_HIST_LIST_ENTRIES, NUM_LDB_CREDITS, NUM_LDB_PORTS, NUM_LDB_PORTS_PER_COS,
    NUM_LDB_QUEUES, NUM_SCHED_DOMAINS, NUM_SN_GROUPS, SN_SLOTS_PER_GROUP,
};

/// CQ drain polling starts at this interval and doubles up to the deadline.
const DRAIN_POLL_START: Duration = Duration::from_micros(1);
const DRAIN_DEADLINE: Duration = Duration::from_millis(1);

pub const MAX_QID_PRIORITY: u32 = 7;
pub const MIN_CQ_DEPTH: u16 = 8;
pub const MAX_CQ_DEPTH: u16 = 1024;

/// Per-class resource counters.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct ResourceCounts {
    pub sched_domains: u32,
    pub ldb_queues: u32,
    pub cos_ldb_ports: [u32; NUM_COS_CLASSES],
    pub dir_ports: u32,
    pub ldb_credits: u32,
    pub dir_credits: u32,
    pub hist_list_entries: u32,
    pub atomic_inflights: u32,
}

impl ResourceCounts {
    pub fn ldb_ports(&self) -> u32 {
        self.cos_ldb_ports.iter().sum()
    }

    fn add(&mut self, other: &ResourceCounts) {
        self.sched_domains += other.sched_domains;
        self.ldb_queues += other.ldb_queues;
        for i in 0..NUM_COS_CLASSES {
            self.cos_ldb_ports[i] += other.cos_ldb_ports[i];
        }
        self.dir_ports += other.dir_ports;
        self.ldb_credits += other.ldb_credits;
        self.dir_credits += other.dir_credits;
        self.hist_list_entries += other.hist_list_entries;
        self.atomic_inflights += other.atomic_inflights;
    }
}

/// Availability snapshot returned to tenants.
#[derive(Clone, Copy, Default, Debug)]
pub struct ResourceSnapshot {
    pub counts: ResourceCounts,
    pub max_contiguous_hist_list_entries: u32,
}

/// Bitmap over history-list entries; a set bit means the entry is free.
struct EntryBitmap {
    words: Vec<u64>,
    len: u32,
}

impl EntryBitmap {
    fn new_filled(len: u32) -> Self {
        let mut map = EntryBitmap {
            words: vec![0; (len as usize).div_ceil(64)],
            len,
        };
        map.set_range(0, len);
        map
    }

    fn set_range(&mut self, base: u32, len: u32) {
        for bit in base..base + len {
            self.words[bit as usize / 64] |= 1u64 << (bit % 64);
        }
    }

    fn clear_range(&mut self, base: u32, len: u32) {
        for bit in base..base + len {
            self.words[bit as usize / 64] &= !(1u64 << (bit % 64));
        }
    }

    fn is_set(&self, bit: u32) -> bool {
        self.words[bit as usize / 64] & (1u64 << (bit % 64)) != 0
    }

    /// Base and length of the longest run of set bits.
    fn longest_run(&self) -> (u32, u32) {
        let (mut best_base, mut best_len) = (0, 0);
        let mut run_base = 0;
        let mut run_len = 0;
        for bit in 0..self.len {
            if self.is_set(bit) {
                if run_len == 0 {
                    run_base = bit;
                }
                run_len += 1;
                if run_len > best_len {
                    best_base = run_base;
                    best_len = run_len;
                }
            } else {
                run_len = 0;
            }
        }
        (best_base, best_len)
    }
}

#[derive(Clone, Debug)]
pub struct QidMap {
    pub qid: u32,
    pub priority: u32,
    pub unmapping: bool,
}

#[derive(Clone, Debug)]
pub struct PortState {
    pub id: u32,
    pub enabled: bool,
    pub cq_depth: u16,
    pub maps: Vec<QidMap>,
}

impl PortState {
    pub fn pending_unmaps(&self) -> u32 {
        self.maps.iter().filter(|m| m.unmapping).count() as u32
    }
}

#[derive(Clone, Debug)]
pub struct QueueState {
    pub id: u32,
    pub depth_threshold: u32,
    pub num_sequence_numbers: u32,
}

/// A created scheduling domain and the resources it consumed.
pub struct DomainState {
    pub id: u32,
    pub started: bool,
    /// Total consumed from the tenant at creation time.
    grant: ResourceCounts,
    /// Portion of the grant not yet consumed by queues/ports in the domain.
    avail: ResourceCounts,
    ldb_queue_ids: Vec<u32>,
    ldb_port_ids: [Vec<u32>; NUM_COS_CLASSES],
    dir_port_ids: Vec<u32>,
    pub ldb_queues: Vec<QueueState>,
    pub dir_queues: Vec<QueueState>,
    pub ldb_ports: Vec<PortState>,
    pub dir_ports: Vec<PortState>,
}

/// Arguments for domain creation, one count per resource class.
#[derive(Clone, Copy, Default, Debug)]
pub struct DomainRequest {
    pub num_ldb_queues: u32,
    pub num_ldb_ports: u32,
    pub num_cos_ldb_ports: [u32; NUM_COS_CLASSES],
    pub num_dir_ports: u32,
    pub num_atomic_inflights: u32,
    pub num_hist_list_entries: u32,
    pub num_ldb_credits: u32,
    pub num_dir_credits: u32,
    pub cos_strict: bool,
}

#[derive(Default)]
pub struct TenantResources {
    avail: ResourceCounts,
    ldb_port_ids: [Vec<u32>; NUM_COS_CLASSES],
    dir_port_ids: Vec<u32>,
    hist_ranges: Vec<(u32, u32)>,
    locked: bool,
    ldb_virt_map: Vec<u32>,
    dir_virt_map: Vec<u32>,
    pub domains: Vec<DomainState>,
}

impl TenantResources {
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn num_ldb_ports(&self) -> u32 {
        self.avail.ldb_ports() + self.domains.iter().map(|d| d.grant.ldb_ports()).sum::<u32>()
    }

    pub fn num_dir_ports(&self) -> u32 {
        self.avail.dir_ports + self.domains.iter().map(|d| d.grant.dir_ports).sum::<u32>()
    }

    fn domain_mut(&mut self, id: u32) -> Result<&mut DomainState> {
        self.domains
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or(Error::NotOwned)
    }

    fn domain(&self, id: u32) -> Result<&DomainState> {
        self.domains.iter().find(|d| d.id == id).ok_or(Error::NotOwned)
    }
}

/// The PF-wide ledger: free pools plus per-tenant assignments.
pub struct Ledger {
    free: ResourceCounts,
    free_domain_ids: Vec<u32>,
    free_ldb_queue_ids: Vec<u32>,
    free_ldb_port_ids: [Vec<u32>; NUM_COS_CLASSES],
    free_dir_port_ids: Vec<u32>,
    hist_map: EntryBitmap,
    tenants: Vec<TenantResources>,
    cos_bandwidth: [u32; NUM_COS_CLASSES],
    sn_allocations: [u32; NUM_SN_GROUPS],
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

/// Move ids between a pool and an owner so the owner ends up with `num`.
/// The caller has already established that `num` ids exist between the two.
fn retarget_ids(pool: &mut Vec<u32>, owned: &mut Vec<u32>, num: usize) {
    while owned.len() > num {
        if let Some(id) = owned.pop() {
            pool.push(id);
        }
    }
    while owned.len() < num {
        match pool.pop() {
            Some(id) => owned.push(id),
            None => break,
        }
    }
}

/// Detach-check-transfer for a plain counter pair.
fn retarget_counter(pool: &mut u32, assigned: &mut u32, num: u32) -> Result<()> {
    let total = *pool + *assigned;
    if num > total {
        return Err(Error::CapacityExceeded);
    }
    *pool = total - num;
    *assigned = num;
    Ok(())
}

impl Ledger {
    pub fn new() -> Self {
        let free = ResourceCounts {
            sched_domains: NUM_SCHED_DOMAINS,
            ldb_queues: NUM_LDB_QUEUES,
            cos_ldb_ports: [NUM_LDB_PORTS_PER_COS; NUM_COS_CLASSES],
            dir_ports: NUM_DIR_PORTS,
            ldb_credits: NUM_LDB_CREDITS,
            dir_credits: NUM_DIR_CREDITS,
            hist_list_entries: NUM_HIST_LIST_ENTRIES,
            atomic_inflights: NUM_ATOMIC_INFLIGHTS,
        };

        let mut free_ldb_port_ids: [Vec<u32>; NUM_COS_CLASSES] = Default::default();
        for (cos, ids) in free_ldb_port_ids.iter_mut().enumerate() {
            let base = cos as u32 * NUM_LDB_PORTS_PER_COS;
            *ids = (base..base + NUM_LDB_PORTS_PER_COS).rev().collect();
        }

        Ledger {
            free,
            free_domain_ids: (0..NUM_SCHED_DOMAINS).rev().collect(),
            free_ldb_queue_ids: (0..NUM_LDB_QUEUES).rev().collect(),
            free_ldb_port_ids,
            free_dir_port_ids: (0..NUM_DIR_PORTS).rev().collect(),
            hist_map: EntryBitmap::new_filled(NUM_HIST_LIST_ENTRIES),
            tenants: (0..MAX_TENANTS).map(|_| TenantResources::default()).collect(),
            cos_bandwidth: [0; NUM_COS_CLASSES],
            sn_allocations: [SN_SLOTS_PER_GROUP; NUM_SN_GROUPS],
        }
    }

    pub fn tenant(&self, id: usize) -> Result<&TenantResources> {
        self.tenants.get(id).ok_or(Error::InvalidArgument)
    }

    fn tenant_mut(&mut self, id: usize) -> Result<&mut TenantResources> {
        self.tenants.get_mut(id).ok_or(Error::InvalidArgument)
    }

    fn writable_tenant(&mut self, id: usize) -> Result<&mut TenantResources> {
        let t = self.tenants.get_mut(id).ok_or(Error::InvalidArgument)?;
        if t.locked {
            return Err(Error::PermissionDenied);
        }
        Ok(t)
    }

    // Quota updates. Each either transfers or leaves the ledger untouched.

    pub fn update_sched_domains(&mut self, tenant: usize, num: u32) -> Result<()> {
        self.writable_tenant(tenant)?;
        retarget_counter(
            &mut self.free.sched_domains,
            &mut self.tenants[tenant].avail.sched_domains,
            num,
        )
    }

    pub fn update_ldb_queues(&mut self, tenant: usize, num: u32) -> Result<()> {
        self.writable_tenant(tenant)?;
        retarget_counter(
            &mut self.free.ldb_queues,
            &mut self.tenants[tenant].avail.ldb_queues,
            num,
        )
    }

    pub fn update_ldb_credits(&mut self, tenant: usize, num: u32) -> Result<()> {
        self.writable_tenant(tenant)?;
        retarget_counter(
            &mut self.free.ldb_credits,
            &mut self.tenants[tenant].avail.ldb_credits,
            num,
        )
    }

    pub fn update_dir_credits(&mut self, tenant: usize, num: u32) -> Result<()> {
        self.writable_tenant(tenant)?;
        retarget_counter(
            &mut self.free.dir_credits,
            &mut self.tenants[tenant].avail.dir_credits,
            num,
        )
    }

    pub fn update_atomic_inflights(&mut self, tenant: usize, num: u32) -> Result<()> {
        self.writable_tenant(tenant)?;
        retarget_counter(
            &mut self.free.atomic_inflights,
            &mut self.tenants[tenant].avail.atomic_inflights,
            num,
        )
    }

    pub fn update_dir_ports(&mut self, tenant: usize, num: u32) -> Result<()> {
        self.writable_tenant(tenant)?;
        retarget_counter(
            &mut self.free.dir_ports,
            &mut self.tenants[tenant].avail.dir_ports,
            num,
        )?;
        retarget_ids(
            &mut self.free_dir_port_ids,
            &mut self.tenants[tenant].dir_port_ids,
            num as usize,
        );
        Ok(())
    }

    pub fn update_ldb_cos_ports(&mut self, tenant: usize, cos: usize, num: u32) -> Result<()> {
        if cos >= NUM_COS_CLASSES {
            return Err(Error::InvalidArgument);
        }
        self.writable_tenant(tenant)?;
        retarget_counter(
            &mut self.free.cos_ldb_ports[cos],
            &mut self.tenants[tenant].avail.cos_ldb_ports[cos],
            num,
        )?;
        retarget_ids(
            &mut self.free_ldb_port_ids[cos],
            &mut self.tenants[tenant].ldb_port_ids[cos],
            num as usize,
        );
        Ok(())
    }

    /// Aggregate load-balanced port update: spreads `num` across the CoS
    /// classes, restoring all classes if any one cannot satisfy its share.
    pub fn update_ldb_ports(&mut self, tenant: usize, num: u32) -> Result<()> {
        self.writable_tenant(tenant)?;
        let orig = self.tenants[tenant].avail.cos_ldb_ports;

        let base = num / NUM_COS_CLASSES as u32;
        let rem = num as usize % NUM_COS_CLASSES;
        for cos in 0..NUM_COS_CLASSES {
            let want = base + u32::from(cos < rem);
            if let Err(e) = self.update_ldb_cos_ports(tenant, cos, want) {
                for prev in 0..cos {
                    // Restoring a smaller prior value cannot fail.
                    let _ = self.update_ldb_cos_ports(tenant, prev, orig[prev]);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// History-list quota update. The assignment must be carved out of
    /// contiguous runs of the PF bitmap; on failure both the pool bitmap and
    /// the tenant's ranges are restored exactly.
    pub fn update_hist_list_entries(&mut self, tenant: usize, num: u32) -> Result<()> {
        self.writable_tenant(tenant)?;

        let old_ranges = std::mem::take(&mut self.tenants[tenant].hist_ranges);
        for &(base, len) in &old_ranges {
            self.hist_map.set_range(base, len);
        }

        let mut new_ranges: Vec<(u32, u32)> = Vec::new();
        let mut remaining = num;
        while remaining > 0 {
            let (base, len) = self.hist_map.longest_run();
            if len == 0 {
                for &(b, l) in &new_ranges {
                    self.hist_map.set_range(b, l);
                }
                for &(b, l) in &old_ranges {
                    self.hist_map.clear_range(b, l);
                }
                self.tenants[tenant].hist_ranges = old_ranges;
                return Err(Error::CapacityExceeded);
            }
            let take = remaining.min(len);
            self.hist_map.clear_range(base, take);
            new_ranges.push((base, take));
            remaining -= take;
        }

        let old_total: u32 = old_ranges.iter().map(|r| r.1).sum();
        self.free.hist_list_entries = self.free.hist_list_entries + old_total - num;
        self.tenants[tenant].avail.hist_list_entries = num;
        self.tenants[tenant].hist_ranges = new_ranges;
        Ok(())
    }

    // Availability and usage queries.

    pub fn get_num_resources(&self, tenant: usize) -> Result<ResourceSnapshot> {
        let t = self.tenant(tenant)?;
        let max_run = t.hist_ranges.iter().map(|r| r.1).max().unwrap_or(0);
        Ok(ResourceSnapshot {
            counts: t.avail,
            max_contiguous_hist_list_entries: max_run.min(t.avail.hist_list_entries),
        })
    }

    pub fn get_num_used_resources(&self, tenant: usize) -> Result<ResourceCounts> {
        let t = self.tenant(tenant)?;
        let mut used = ResourceCounts::default();
        for d in &t.domains {
            used.add(&d.grant);
            used.sched_domains += 1;
        }
        Ok(used)
    }

    /// PF-side free pool, for the resource-control surface.
    pub fn pf_avail(&self) -> ResourceCounts {
        self.free
    }

    // Locking and id translation.

    /// Freeze the tenant's assignment and hand out dense virtual port ids.
    pub fn lock(&mut self, tenant: usize) -> Result<()> {
        let t = self.tenant_mut(tenant)?;
        let mut ldb_map = Vec::new();
        for ids in &mut t.ldb_port_ids {
            ids.sort_unstable();
            ldb_map.extend_from_slice(ids);
        }
        t.dir_port_ids.sort_unstable();
        t.ldb_virt_map = ldb_map;
        t.dir_virt_map = t.dir_port_ids.clone();
        t.locked = true;
        Ok(())
    }

    pub fn unlock(&mut self, tenant: usize) -> Result<()> {
        let t = self.tenant_mut(tenant)?;
        t.ldb_virt_map.clear();
        t.dir_virt_map.clear();
        t.locked = false;
        Ok(())
    }

    pub fn is_locked(&self, tenant: usize) -> bool {
        self.tenants.get(tenant).map(|t| t.locked).unwrap_or(false)
    }

    pub fn ldb_port_phys_id(&self, tenant: usize, virt: u32) -> Result<u32> {
        let t = self.tenant(tenant)?;
        if !t.locked {
            return Err(Error::NotOwned);
        }
        t.ldb_virt_map.get(virt as usize).copied().ok_or(Error::NotOwned)
    }

    pub fn dir_port_phys_id(&self, tenant: usize, virt: u32) -> Result<u32> {
        let t = self.tenant(tenant)?;
        if !t.locked {
            return Err(Error::NotOwned);
        }
        t.dir_virt_map.get(virt as usize).copied().ok_or(Error::NotOwned)
    }

    fn ldb_virt_of_phys(&self, tenant: usize, phys: u32) -> Option<u32> {
        self.tenants[tenant]
            .ldb_virt_map
            .iter()
            .position(|&p| p == phys)
            .map(|i| i as u32)
    }

    fn dir_virt_of_phys(&self, tenant: usize, phys: u32) -> Option<u32> {
        self.tenants[tenant]
            .dir_virt_map
            .iter()
            .position(|&p| p == phys)
            .map(|i| i as u32)
    }

    /// Tenant and virtual index owning a physical port, for interrupt demux.
    pub fn find_port_owner(&self, phys: u32, is_ldb: bool) -> Option<(usize, u32)> {
        for (id, t) in self.tenants.iter().enumerate() {
            if !t.locked {
                continue;
            }
            let hit = if is_ldb {
                self.ldb_virt_of_phys(id, phys)
            } else {
                self.dir_virt_of_phys(id, phys)
            };
            if let Some(virt) = hit {
                return Some((id, virt));
            }
        }
        None
    }

    // Domain lifecycle.

    pub fn create_sched_domain(&mut self, tenant: usize, req: &DomainRequest) -> Result<u32> {
        let avail = self.tenant(tenant)?.avail;
        if avail.sched_domains == 0
            || req.num_ldb_queues > avail.ldb_queues
            || req.num_dir_ports > avail.dir_ports
            || req.num_ldb_credits > avail.ldb_credits
            || req.num_dir_credits > avail.dir_credits
            || req.num_hist_list_entries > avail.hist_list_entries
            || req.num_atomic_inflights > avail.atomic_inflights
        {
            return Err(Error::CapacityExceeded);
        }

        // Explicit per-class requests must fit their class; the class-agnostic
        // portion fills classes in ascending order unless cos_strict.
        let mut take = [0u32; NUM_COS_CLASSES];
        for cos in 0..NUM_COS_CLASSES {
            if req.num_cos_ldb_ports[cos] > avail.cos_ldb_ports[cos] {
                return Err(Error::CapacityExceeded);
            }
            take[cos] = req.num_cos_ldb_ports[cos];
        }
        let mut spread = req.num_ldb_ports;
        if req.cos_strict && spread != 0 {
            return Err(Error::InvalidArgument);
        }
        for cos in 0..NUM_COS_CLASSES {
            let room = avail.cos_ldb_ports[cos] - take[cos];
            let put = spread.min(room);
            take[cos] += put;
            spread -= put;
        }
        if spread != 0 {
            return Err(Error::CapacityExceeded);
        }

        let id = self.free_domain_ids.pop().ok_or(Error::CapacityExceeded)?;

        let grant = ResourceCounts {
            sched_domains: 0,
            ldb_queues: req.num_ldb_queues,
            cos_ldb_ports: take,
            dir_ports: req.num_dir_ports,
            ldb_credits: req.num_ldb_credits,
            dir_credits: req.num_dir_credits,
            hist_list_entries: req.num_hist_list_entries,
            atomic_inflights: req.num_atomic_inflights,
        };

        let mut ldb_queue_ids = Vec::new();
        retarget_ids(&mut self.free_ldb_queue_ids, &mut ldb_queue_ids, req.num_ldb_queues as usize);

        let t = &mut self.tenants[tenant];
        t.avail.sched_domains -= 1;
        t.avail.ldb_queues -= grant.ldb_queues;
        t.avail.dir_ports -= grant.dir_ports;
        t.avail.ldb_credits -= grant.ldb_credits;
        t.avail.dir_credits -= grant.dir_credits;
        t.avail.hist_list_entries -= grant.hist_list_entries;
        t.avail.atomic_inflights -= grant.atomic_inflights;

        let mut ldb_port_ids: [Vec<u32>; NUM_COS_CLASSES] = Default::default();
        for cos in 0..NUM_COS_CLASSES {
            t.avail.cos_ldb_ports[cos] -= take[cos];
            let keep = t.ldb_port_ids[cos].len() - take[cos] as usize;
            ldb_port_ids[cos] = t.ldb_port_ids[cos].split_off(keep);
        }
        let keep = t.dir_port_ids.len() - grant.dir_ports as usize;
        let dir_port_ids = t.dir_port_ids.split_off(keep);

        t.domains.push(DomainState {
            id,
            started: false,
            grant,
            avail: grant,
            ldb_queue_ids,
            ldb_port_ids,
            dir_port_ids,
            ldb_queues: Vec::new(),
            dir_queues: Vec::new(),
            ldb_ports: Vec::new(),
            dir_ports: Vec::new(),
        });

        debug!("tenant {tenant}: created sched domain {id}");
        Ok(id)
    }

    pub fn create_ldb_queue(
        &mut self,
        tenant: usize,
        domain_id: u32,
        num_sequence_numbers: u32,
        num_atomic_inflights: u32,
        depth_threshold: u32,
    ) -> Result<u32> {
        if num_sequence_numbers > SN_SLOTS_PER_GROUP {
            return Err(Error::InvalidArgument);
        }
        let d = self.tenant_mut(tenant)?.domain_mut(domain_id)?;
        if d.avail.ldb_queues == 0 || num_atomic_inflights > d.avail.atomic_inflights {
            return Err(Error::CapacityExceeded);
        }
        let id = d.ldb_queue_ids.pop().ok_or(Error::CapacityExceeded)?;
        d.avail.ldb_queues -= 1;
        d.avail.atomic_inflights -= num_atomic_inflights;
        d.ldb_queues.push(QueueState {
            id,
            depth_threshold,
            num_sequence_numbers,
        });
        Ok(id)
    }

    /// Directed queues are paired with a directed port; the queue takes the
    /// port's id. `port_virt < 0` defers the pairing to port creation.
    pub fn create_dir_queue(
        &mut self,
        tenant: usize,
        domain_id: u32,
        port_virt: i32,
        depth_threshold: u32,
    ) -> Result<u32> {
        let id = if port_virt >= 0 {
            let phys = self.dir_port_phys_id(tenant, port_virt as u32)?;
            let d = self.tenant(tenant)?.domain(domain_id)?;
            if !d.dir_ports.iter().any(|p| p.id == phys) {
                return Err(Error::NotOwned);
            }
            phys
        } else {
            let d = self.tenant(tenant)?.domain(domain_id)?;
            *d.dir_port_ids.last().ok_or(Error::CapacityExceeded)?
        };
        let d = self.tenant_mut(tenant)?.domain_mut(domain_id)?;
        if d.dir_queues.iter().any(|q| q.id == id) {
            return Err(Error::InvalidArgument);
        }
        d.dir_queues.push(QueueState {
            id,
            depth_threshold,
            num_sequence_numbers: 0,
        });
        Ok(id)
    }

    fn check_cq_depth(cq_depth: u16) -> Result<()> {
        if !(MIN_CQ_DEPTH..=MAX_CQ_DEPTH).contains(&cq_depth) || !cq_depth.is_power_of_two() {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// Returns the virtual id of the created port.
    pub fn create_ldb_port(
        &mut self,
        tenant: usize,
        domain_id: u32,
        cos_id: usize,
        cos_strict: bool,
        cq_depth: u16,
        cq_history_list_size: u16,
    ) -> Result<u32> {
        Self::check_cq_depth(cq_depth)?;
        if cos_id >= NUM_COS_CLASSES {
            return Err(Error::InvalidArgument);
        }
        let d = self.tenant_mut(tenant)?.domain_mut(domain_id)?;
        if u32::from(cq_history_list_size) > d.avail.hist_list_entries {
            return Err(Error::CapacityExceeded);
        }
        let search: Vec<usize> = if cos_strict {
            vec![cos_id]
        } else {
            (cos_id..NUM_COS_CLASSES).chain(0..cos_id).collect()
        };
        let cos = search
            .into_iter()
            .find(|&c| !d.ldb_port_ids[c].is_empty())
            .ok_or(Error::CapacityExceeded)?;
        let phys = match d.ldb_port_ids[cos].pop() {
            Some(id) => id,
            None => return Err(Error::CapacityExceeded),
        };
        d.avail.cos_ldb_ports[cos] -= 1;
        d.avail.hist_list_entries -= u32::from(cq_history_list_size);
        d.ldb_ports.push(PortState {
            id: phys,
            enabled: true,
            cq_depth,
            maps: Vec::new(),
        });
        self.ldb_virt_of_phys(tenant, phys).ok_or(Error::NotOwned)
    }

    /// Returns the virtual id of the created port.
    pub fn create_dir_port(
        &mut self,
        tenant: usize,
        domain_id: u32,
        cq_depth: u16,
    ) -> Result<u32> {
        Self::check_cq_depth(cq_depth)?;
        let d = self.tenant_mut(tenant)?.domain_mut(domain_id)?;
        let phys = d.dir_port_ids.pop().ok_or(Error::CapacityExceeded)?;
        d.avail.dir_ports -= 1;
        d.dir_ports.push(PortState {
            id: phys,
            enabled: true,
            cq_depth,
            maps: Vec::new(),
        });
        self.dir_virt_of_phys(tenant, phys).ok_or(Error::NotOwned)
    }

    fn port_in_domain(
        &mut self,
        tenant: usize,
        domain_id: u32,
        port_virt: u32,
        is_ldb: bool,
    ) -> Result<&mut PortState> {
        let phys = if is_ldb {
            self.ldb_port_phys_id(tenant, port_virt)?
        } else {
            self.dir_port_phys_id(tenant, port_virt)?
        };
        let d = self.tenant_mut(tenant)?.domain_mut(domain_id)?;
        let ports = if is_ldb { &mut d.ldb_ports } else { &mut d.dir_ports };
        ports.iter_mut().find(|p| p.id == phys).ok_or(Error::NotOwned)
    }

    pub fn set_port_enabled(
        &mut self,
        tenant: usize,
        domain_id: u32,
        port_virt: u32,
        is_ldb: bool,
        enabled: bool,
    ) -> Result<()> {
        self.port_in_domain(tenant, domain_id, port_virt, is_ldb)?.enabled = enabled;
        Ok(())
    }

    pub fn port_owned_by_domain(
        &self,
        tenant: usize,
        domain_id: u32,
        port_virt: u32,
        is_ldb: bool,
    ) -> bool {
        let phys = if is_ldb {
            self.ldb_port_phys_id(tenant, port_virt)
        } else {
            self.dir_port_phys_id(tenant, port_virt)
        };
        let phys = match phys {
            Ok(p) => p,
            Err(_) => return false,
        };
        match self.tenant(tenant).and_then(|t| t.domain(domain_id)) {
            Ok(d) => {
                let ports = if is_ldb { &d.ldb_ports } else { &d.dir_ports };
                ports.iter().any(|p| p.id == phys)
            }
            Err(_) => false,
        }
    }

    pub fn map_qid(
        &mut self,
        tenant: usize,
        domain_id: u32,
        port_virt: u32,
        qid: u32,
        priority: u32,
    ) -> Result<u32> {
        if priority > MAX_QID_PRIORITY {
            return Err(Error::InvalidArgument);
        }
        if !self
            .tenant(tenant)?
            .domain(domain_id)?
            .ldb_queues
            .iter()
            .any(|q| q.id == qid)
        {
            return Err(Error::NotOwned);
        }
        let port = self.port_in_domain(tenant, domain_id, port_virt, true)?;
        match port.maps.iter_mut().find(|m| m.qid == qid) {
            Some(m) => {
                m.priority = priority;
                m.unmapping = false;
            }
            None => port.maps.push(QidMap {
                qid,
                priority,
                unmapping: false,
            }),
        }
        Ok(qid)
    }

    /// Begin unmapping; completion is finished off the critical path.
    pub fn unmap_qid(
        &mut self,
        tenant: usize,
        domain_id: u32,
        port_virt: u32,
        qid: u32,
    ) -> Result<()> {
        let port = self.port_in_domain(tenant, domain_id, port_virt, true)?;
        let m = port
            .maps
            .iter_mut()
            .find(|m| m.qid == qid)
            .ok_or(Error::NotOwned)?;
        m.unmapping = true;
        Ok(())
    }

    /// Retire every in-progress unmap in the domain; returns how many.
    pub fn complete_unmaps(&mut self, tenant: usize, domain_id: u32) -> Result<u32> {
        let d = self.tenant_mut(tenant)?.domain_mut(domain_id)?;
        let mut n = 0;
        for port in &mut d.ldb_ports {
            let before = port.maps.len();
            port.maps.retain(|m| !m.unmapping);
            n += (before - port.maps.len()) as u32;
        }
        Ok(n)
    }

    pub fn pending_port_unmaps(
        &mut self,
        tenant: usize,
        domain_id: u32,
        port_virt: u32,
    ) -> Result<u32> {
        Ok(self
            .port_in_domain(tenant, domain_id, port_virt, true)?
            .pending_unmaps())
    }

    pub fn start_domain(&mut self, tenant: usize, domain_id: u32) -> Result<()> {
        let d = self.tenant_mut(tenant)?.domain_mut(domain_id)?;
        if d.started {
            return Err(Error::InvalidArgument);
        }
        d.started = true;
        Ok(())
    }

    pub fn queue_depth(
        &mut self,
        tenant: usize,
        domain_id: u32,
        queue_id: u32,
        is_ldb: bool,
        hw: &mut dyn SchedHw,
    ) -> Result<u32> {
        let d = self.tenant(tenant)?.domain(domain_id)?;
        let queues = if is_ldb { &d.ldb_queues } else { &d.dir_queues };
        if !queues.iter().any(|q| q.id == queue_id) {
            return Err(Error::NotOwned);
        }
        Ok(hw.queue_depth(queue_id, is_ldb))
    }

    /// Disable, drain, and reclaim a domain, returning its grant to the
    /// tenant's available pool. Drain timeouts are logged and non-fatal.
    pub fn reset_sched_domain(
        &mut self,
        tenant: usize,
        domain_id: u32,
        hw: &mut dyn SchedHw,
    ) -> Result<()> {
        let pos = self
            .tenant(tenant)?
            .domains
            .iter()
            .position(|d| d.id == domain_id)
            .ok_or(Error::NotOwned)?;
        let mut d = self.tenants[tenant].domains.remove(pos);

        for (ports, is_ldb) in [(&mut d.ldb_ports, true), (&mut d.dir_ports, false)] {
            for port in ports.iter_mut() {
                port.enabled = false;
                if let Err(e) = drain_cq(hw, port.id, is_ldb) {
                    warn!(
                        "tenant {tenant}: domain {domain_id} port {} drain failed: {e}",
                        port.id
                    );
                }
                hw.reset_port(port.id, is_ldb);
            }
        }

        let t = &mut self.tenants[tenant];
        t.avail.add(&d.grant);
        t.avail.sched_domains += 1;
        for cos in 0..NUM_COS_CLASSES {
            t.ldb_port_ids[cos].append(&mut d.ldb_port_ids[cos]);
            for p in d.ldb_ports.iter().filter(|p| p.id / NUM_LDB_PORTS_PER_COS == cos as u32) {
                t.ldb_port_ids[cos].push(p.id);
            }
        }
        t.dir_port_ids.append(&mut d.dir_port_ids);
        for p in &d.dir_ports {
            t.dir_port_ids.push(p.id);
        }
        self.free_ldb_queue_ids.append(&mut d.ldb_queue_ids);
        for q in &d.ldb_queues {
            self.free_ldb_queue_ids.push(q.id);
        }
        self.free_domain_ids.push(domain_id);

        info!("tenant {tenant}: reset sched domain {domain_id}");
        Ok(())
    }

    /// Tear down every domain the tenant has created. Quotas survive; this is
    /// the unregister/function-reset path.
    pub fn reset_domains(&mut self, tenant: usize, hw: &mut dyn SchedHw) -> Result<()> {
        let ids: Vec<u32> = self.tenant(tenant)?.domains.iter().map(|d| d.id).collect();
        for id in ids {
            self.reset_sched_domain(tenant, id, hw)?;
        }
        Ok(())
    }

    /// Full tenant reset: tear down every domain, unlock, zero all quotas.
    pub fn reset_tenant(&mut self, tenant: usize, hw: &mut dyn SchedHw) -> Result<()> {
        self.reset_domains(tenant, hw)?;
        self.unlock(tenant)?;
        self.clear_quotas(tenant)
    }

    /// Return the tenant's entire assignment to the PF pool.
    pub fn clear_quotas(&mut self, tenant: usize) -> Result<()> {
        if self.tenant(tenant)?.locked || !self.tenants[tenant].domains.is_empty() {
            return Err(Error::PermissionDenied);
        }
        self.update_sched_domains(tenant, 0)?;
        self.update_ldb_queues(tenant, 0)?;
        self.update_ldb_ports(tenant, 0)?;
        self.update_dir_ports(tenant, 0)?;
        self.update_ldb_credits(tenant, 0)?;
        self.update_dir_credits(tenant, 0)?;
        self.update_hist_list_entries(tenant, 0)?;
        self.update_atomic_inflights(tenant, 0)
    }

    // Class-of-service bandwidth and sequence-number groups.

    pub fn set_cos_bandwidth(&mut self, cos: usize, bw: u32, hw: &mut dyn SchedHw) -> Result<()> {
        if cos >= NUM_COS_CLASSES || bw > 100 {
            return Err(Error::InvalidArgument);
        }
        let others: u32 = self
            .cos_bandwidth
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != cos)
            .map(|(_, &b)| b)
            .sum();
        if others + bw > 100 {
            return Err(Error::InvalidArgument);
        }
        self.cos_bandwidth[cos] = bw;
        hw.set_cos_weight(cos, bw * 256 / 100);
        Ok(())
    }

    pub fn get_cos_bandwidth(&self, cos: usize) -> Result<u32> {
        self.cos_bandwidth.get(cos).copied().ok_or(Error::InvalidArgument)
    }

    pub fn get_sn_allocation(&self, group: usize) -> Result<u32> {
        self.sn_allocations.get(group).copied().ok_or(Error::InvalidArgument)
    }
}

fn drain_cq(hw: &mut dyn SchedHw, phys_port: u32, is_ldb: bool) -> Result<()> {
    let start = Instant::now();
    let mut interval = DRAIN_POLL_START;
    while hw.cq_depth(phys_port, is_ldb) != 0 {
        if start.elapsed() >= DRAIN_DEADLINE {
            return Err(Error::Timeout);
        }
        std::thread::sleep(interval);
        interval = (interval * 2).min(DRAIN_DEADLINE);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::ShadowHw;

    fn totals() -> ResourceCounts {
        ResourceCounts {
            sched_domains: NUM_SCHED_DOMAINS,
            ldb_queues: NUM_LDB_QUEUES,
            cos_ldb_ports: [NUM_LDB_PORTS_PER_COS; NUM_COS_CLASSES],
            dir_ports: NUM_DIR_PORTS,
            ldb_credits: NUM_LDB_CREDITS,
            dir_credits: NUM_DIR_CREDITS,
            hist_list_entries: NUM_HIST_LIST_ENTRIES,
            atomic_inflights: NUM_ATOMIC_INFLIGHTS,
        }
    }

    fn assert_conserved(ledger: &Ledger) {
        let mut sum = ledger.pf_avail();
        for t in 0..MAX_TENANTS {
            sum.add(&ledger.get_num_resources(t).unwrap().counts);
            sum.add(&ledger.get_num_used_resources(t).unwrap());
        }
        assert_eq!(sum, totals());
    }

    #[test]
    fn quota_transfer_and_conservation() {
        let mut ledger = Ledger::new();
        ledger.update_sched_domains(0, 4).unwrap();
        ledger.update_ldb_queues(0, 8).unwrap();
        ledger.update_ldb_ports(0, 6).unwrap();
        ledger.update_dir_ports(0, 3).unwrap();
        ledger.update_ldb_credits(0, 1024).unwrap();
        ledger.update_hist_list_entries(0, 128).unwrap();
        assert_conserved(&ledger);

        // Shrinking returns the difference to the pool.
        ledger.update_ldb_queues(0, 2).unwrap();
        assert_eq!(ledger.pf_avail().ldb_queues, NUM_LDB_QUEUES - 2);
        assert_conserved(&ledger);
    }

    #[test]
    fn failed_update_restores_prior_state() {
        let mut ledger = Ledger::new();
        ledger.update_ldb_credits(0, 100).unwrap();
        ledger.update_ldb_credits(1, NUM_LDB_CREDITS - 100).unwrap();
        let before = ledger.get_num_resources(0).unwrap().counts;
        assert_eq!(
            ledger.update_ldb_credits(0, 101),
            Err(Error::CapacityExceeded)
        );
        assert_eq!(ledger.get_num_resources(0).unwrap().counts, before);
        assert_conserved(&ledger);
    }

    #[test]
    fn aggregate_ldb_ports_spread_and_rollback() {
        let mut ledger = Ledger::new();
        ledger.update_ldb_ports(0, 6).unwrap();
        let counts = ledger.get_num_resources(0).unwrap().counts;
        assert_eq!(counts.cos_ldb_ports, [2, 2, 1, 1]);

        // Tenant 1 takes everything left in class 0, so an even spread for
        // tenant 2 cannot succeed and must roll back completely.
        ledger
            .update_ldb_cos_ports(1, 0, NUM_LDB_PORTS_PER_COS - 2)
            .unwrap();
        assert_eq!(
            ledger.update_ldb_ports(2, 8),
            Err(Error::CapacityExceeded)
        );
        assert_eq!(ledger.get_num_resources(2).unwrap().counts.ldb_ports(), 0);
        assert_conserved(&ledger);
    }

    #[test]
    fn locked_tenant_quota_is_immutable() {
        let mut ledger = Ledger::new();
        ledger.update_dir_ports(0, 2).unwrap();
        ledger.lock(0).unwrap();
        assert_eq!(ledger.update_dir_ports(0, 4), Err(Error::PermissionDenied));
        ledger.unlock(0).unwrap();
        ledger.update_dir_ports(0, 4).unwrap();
    }

    #[test]
    fn hist_list_contiguity() {
        let mut ledger = Ledger::new();
        ledger.update_hist_list_entries(0, 512).unwrap();
        let snap = ledger.get_num_resources(0).unwrap();
        assert_eq!(snap.max_contiguous_hist_list_entries, 512);

        ledger.update_hist_list_entries(1, NUM_HIST_LIST_ENTRIES - 512).unwrap();
        assert_eq!(
            ledger.update_hist_list_entries(2, 1),
            Err(Error::CapacityExceeded)
        );
        assert_conserved(&ledger);
    }

    #[test]
    fn virtual_port_ids_are_dense_and_translate() {
        let mut ledger = Ledger::new();
        ledger.update_ldb_cos_ports(0, 1, 2).unwrap();
        ledger.update_dir_ports(0, 2).unwrap();
        ledger.lock(0).unwrap();

        // Class 1 physical ids start at one class stride.
        let base = NUM_LDB_PORTS_PER_COS;
        let p0 = ledger.ldb_port_phys_id(0, 0).unwrap();
        let p1 = ledger.ldb_port_phys_id(0, 1).unwrap();
        assert!(p0 >= base && p1 >= base && p0 != p1);
        assert!(ledger.ldb_port_phys_id(0, 2).is_err());
        assert_eq!(ledger.find_port_owner(p1, true), Some((0, 1)));
    }

    #[test]
    fn domain_lifecycle_roundtrip() {
        let mut hw = ShadowHw::default();
        let mut ledger = Ledger::new();
        ledger.update_sched_domains(0, 1).unwrap();
        ledger.update_ldb_queues(0, 2).unwrap();
        ledger.update_ldb_ports(0, 4).unwrap();
        ledger.update_dir_ports(0, 1).unwrap();
        ledger.update_ldb_credits(0, 64).unwrap();
        ledger.update_dir_credits(0, 32).unwrap();
        ledger.update_hist_list_entries(0, 64).unwrap();
        ledger.update_atomic_inflights(0, 16).unwrap();
        ledger.lock(0).unwrap();

        let req = DomainRequest {
            num_ldb_queues: 2,
            num_ldb_ports: 4,
            num_dir_ports: 1,
            num_atomic_inflights: 16,
            num_hist_list_entries: 64,
            num_ldb_credits: 64,
            num_dir_credits: 32,
            ..Default::default()
        };
        let dom = ledger.create_sched_domain(0, &req).unwrap();
        assert_conserved(&ledger);
        assert_eq!(ledger.get_num_used_resources(0).unwrap().sched_domains, 1);

        let qid = ledger.create_ldb_queue(0, dom, 0, 16, 0).unwrap();
        let mut virts = Vec::new();
        for _ in 0..4 {
            virts.push(ledger.create_ldb_port(0, dom, 0, false, 16, 8).unwrap());
        }
        virts.sort_unstable();
        assert_eq!(virts, vec![0, 1, 2, 3]);

        ledger.map_qid(0, dom, virts[0], qid, 3).unwrap();
        ledger.start_domain(0, dom).unwrap();
        assert!(ledger.port_owned_by_domain(0, dom, virts[0], true));

        ledger.unmap_qid(0, dom, virts[0], qid).unwrap();
        assert_eq!(ledger.pending_port_unmaps(0, dom, virts[0]).unwrap(), 1);
        assert_eq!(ledger.complete_unmaps(0, dom).unwrap(), 1);

        ledger.reset_sched_domain(0, dom, &mut hw).unwrap();
        assert_eq!(ledger.get_num_used_resources(0).unwrap(), ResourceCounts::default());
        assert_eq!(ledger.get_num_resources(0).unwrap().counts.ldb_ports(), 4);
        assert_conserved(&ledger);

        ledger.reset_tenant(0, &mut hw).unwrap();
        assert_eq!(ledger.pf_avail(), totals());
    }

    #[test]
    fn cos_bandwidth_bounds() {
        let mut hw = ShadowHw::default();
        let mut ledger = Ledger::new();
        ledger.set_cos_bandwidth(0, 60, &mut hw).unwrap();
        ledger.set_cos_bandwidth(1, 40, &mut hw).unwrap();
        assert_eq!(ledger.set_cos_bandwidth(2, 1, &mut hw), Err(Error::InvalidArgument));
        assert_eq!(ledger.get_cos_bandwidth(0).unwrap(), 60);
        assert_eq!(hw.cos_weights[0], 60 * 256 / 100);
    }
}
