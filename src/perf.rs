// Copyright © 2026 The vqsched Authors
//
// SPDX-License-Identifier: Apache-2.0
//
//! CQ scheduling-count measurement.
//!
//! At most one measurement is in flight device-wide. Init claims the unit and
//! snapshots the counters; the first collect after the window computes the
//! deltas, caches them for the collecting tenant, and releases the claim.
//! Later collects are served from the cache.

use std::time::Instant;

use crate::hw::{SchedCounts, SchedHw};
use crate::{Error, Result, MAX_TENANTS, NUM_DIR_PORTS, NUM_LDB_PORTS};

struct Measurement {
    started: Instant,
    duration_us: u32,
    pre: SchedCounts,
}

#[derive(Clone)]
struct TenantCache {
    valid: bool,
    elapsed_us: u32,
    ldb: [u64; NUM_LDB_PORTS as usize],
    dir: [u64; NUM_DIR_PORTS as usize],
}

impl Default for TenantCache {
    fn default() -> Self {
        TenantCache {
            valid: false,
            elapsed_us: 0,
            ldb: [0; NUM_LDB_PORTS as usize],
            dir: [0; NUM_DIR_PORTS as usize],
        }
    }
}

pub struct PerfUnit {
    current: Option<Measurement>,
    claimed: bool,
    cache: Vec<TenantCache>,
}

impl Default for PerfUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl PerfUnit {
    pub fn new() -> Self {
        PerfUnit {
            current: None,
            claimed: false,
            cache: vec![TenantCache::default(); MAX_TENANTS],
        }
    }

    /// Claim the unit and snapshot the counters. Fails with `Busy` while a
    /// prior measurement has not been collected.
    pub fn init(&mut self, duration_us: u32, hw: &mut dyn SchedHw) -> Result<()> {
        if self.claimed {
            return Err(Error::Busy);
        }
        self.claimed = true;
        for c in self.cache.iter_mut() {
            c.valid = false;
        }
        self.current = Some(Measurement {
            started: Instant::now(),
            duration_us,
            pre: hw.sched_counts(),
        });
        debug!("sched-count measurement started ({duration_us} us)");
        Ok(())
    }

    pub fn duration_us(&self) -> Option<u32> {
        self.current.as_ref().map(|m| m.duration_us)
    }

    /// Scheduling count and elapsed time for one physical CQ. The first
    /// collect per tenant reads the hardware and releases the claim.
    pub fn collect(
        &mut self,
        tenant: usize,
        phys_cq: u32,
        is_ldb: bool,
        hw: &mut dyn SchedHw,
    ) -> Result<(u32, u64)> {
        let limit = if is_ldb { NUM_LDB_PORTS } else { NUM_DIR_PORTS };
        if tenant >= MAX_TENANTS || phys_cq >= limit {
            return Err(Error::InvalidArgument);
        }

        if !self.cache[tenant].valid {
            let m = self.current.as_ref().ok_or(Error::InvalidArgument)?;
            let elapsed = m.started.elapsed().as_micros().min(u128::from(u32::MAX)) as u32;
            let post = hw.sched_counts();
            let c = &mut self.cache[tenant];
            for i in 0..NUM_LDB_PORTS as usize {
                c.ldb[i] = post.ldb[i].wrapping_sub(m.pre.ldb[i]);
            }
            for i in 0..NUM_DIR_PORTS as usize {
                c.dir[i] = post.dir[i].wrapping_sub(m.pre.dir[i]);
            }
            c.elapsed_us = elapsed;
            c.valid = true;
            self.claimed = false;
        }

        let c = &self.cache[tenant];
        let count = if is_ldb {
            c.ldb[phys_cq as usize]
        } else {
            c.dir[phys_cq as usize]
        };
        Ok((c.elapsed_us, count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::ShadowHw;

    #[test]
    fn single_measurement_in_flight() {
        let mut hw = ShadowHw::default();
        let mut perf = PerfUnit::new();
        perf.init(100, &mut hw).unwrap();
        assert_eq!(perf.init(100, &mut hw), Err(Error::Busy));

        // Collecting releases the claim for the next init.
        perf.collect(0, 0, true, &mut hw).unwrap();
        perf.init(100, &mut hw).unwrap();
    }

    #[test]
    fn collect_without_init_fails() {
        let mut hw = ShadowHw::default();
        let mut perf = PerfUnit::new();
        assert_eq!(perf.collect(0, 0, true, &mut hw), Err(Error::InvalidArgument));
    }

    #[test]
    fn first_collect_caches_deltas() {
        let mut hw = ShadowHw::default();
        hw.counts.ldb[5] = 100;
        let mut perf = PerfUnit::new();
        perf.init(0, &mut hw).unwrap();

        hw.counts.ldb[5] = 340;
        let (_, count) = perf.collect(0, 5, true, &mut hw).unwrap();
        assert_eq!(count, 240);

        // Served from the cache: later hardware movement is invisible.
        hw.counts.ldb[5] = 9999;
        let (_, count) = perf.collect(0, 5, true, &mut hw).unwrap();
        assert_eq!(count, 240);
    }

    #[test]
    fn cq_id_out_of_range() {
        let mut hw = ShadowHw::default();
        let mut perf = PerfUnit::new();
        perf.init(0, &mut hw).unwrap();
        assert_eq!(
            perf.collect(0, NUM_LDB_PORTS, true, &mut hw),
            Err(Error::InvalidArgument)
        );
    }
}
