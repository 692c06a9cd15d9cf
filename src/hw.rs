// Copyright © 2026 The vqsched Authors
//
// SPDX-License-Identifier: Apache-2.0
//
//! Hardware access seam.
//!
//! Everything the virtualization layer needs from the scheduling silicon goes
//! through [`SchedHw`]. [`ShadowHw`] is a software stand-in backed by plain
//! state, used by the tests and by embedders running without the device.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::{NUM_DIR_PORTS, NUM_LDB_PORTS};

/// Cumulative per-CQ scheduling counts, one slot per physical port.
#[derive(Clone)]
pub struct SchedCounts {
    pub ldb: [u64; NUM_LDB_PORTS as usize],
    pub dir: [u64; NUM_DIR_PORTS as usize],
}

impl Default for SchedCounts {
    fn default() -> Self {
        SchedCounts {
            ldb: [0; NUM_LDB_PORTS as usize],
            dir: [0; NUM_DIR_PORTS as usize],
        }
    }
}

pub trait SchedHw: Send {
    /// Route a physical CQ's interrupt to the given tenant vector.
    fn configure_cq_interrupt(&mut self, phys_port: u32, is_ldb: bool, vector: u16, threshold: u16);

    /// Clear the routing installed by `configure_cq_interrupt`.
    fn clear_cq_interrupt(&mut self, phys_port: u32, is_ldb: bool);

    /// Re-arm a CQ interrupt after the tenant has serviced it.
    fn arm_cq_interrupt(&mut self, phys_port: u32, is_ldb: bool);

    /// Number of entries currently in a CQ.
    fn cq_depth(&mut self, phys_port: u32, is_ldb: bool) -> u32;

    /// Number of entries currently in a queue.
    fn queue_depth(&mut self, phys_queue: u32, is_ldb: bool) -> u32;

    /// Snapshot of the cumulative scheduling counters.
    fn sched_counts(&mut self) -> SchedCounts;

    /// Program a class-of-service arbiter weight (device encoding).
    fn set_cos_weight(&mut self, cos: usize, weight: u32);

    /// Quiesce and reinitialize a port.
    fn reset_port(&mut self, phys_port: u32, is_ldb: bool);
}

/// Software shadow of the device. CQ and queue depths read zero unless a test
/// plants values, so drains complete immediately.
#[derive(Default)]
pub struct ShadowHw {
    pub counts: SchedCounts,
    pub cq_depths: std::collections::HashMap<(u32, bool), u32>,
    pub cos_weights: [u32; crate::NUM_COS_CLASSES],
    pub cq_vectors: std::collections::HashMap<(u32, bool), u16>,
    /// Cumulative `reset_port` invocations, shared so a caller can watch the
    /// shadow after handing it off.
    pub port_resets: Arc<AtomicUsize>,
}

impl SchedHw for ShadowHw {
    fn configure_cq_interrupt(&mut self, phys_port: u32, is_ldb: bool, vector: u16, _threshold: u16) {
        self.cq_vectors.insert((phys_port, is_ldb), vector);
    }

    fn clear_cq_interrupt(&mut self, phys_port: u32, is_ldb: bool) {
        self.cq_vectors.remove(&(phys_port, is_ldb));
    }

    fn arm_cq_interrupt(&mut self, _phys_port: u32, _is_ldb: bool) {}

    fn cq_depth(&mut self, phys_port: u32, is_ldb: bool) -> u32 {
        self.cq_depths.get(&(phys_port, is_ldb)).copied().unwrap_or(0)
    }

    fn queue_depth(&mut self, _phys_queue: u32, _is_ldb: bool) -> u32 {
        0
    }

    fn sched_counts(&mut self) -> SchedCounts {
        self.counts.clone()
    }

    fn set_cos_weight(&mut self, cos: usize, weight: u32) {
        self.cos_weights[cos] = weight;
    }

    fn reset_port(&mut self, phys_port: u32, is_ldb: bool) {
        self.cq_depths.remove(&(phys_port, is_ldb));
        self.cq_vectors.remove(&(phys_port, is_ldb));
        self.port_resets.fetch_add(1, Ordering::SeqCst);
    }
}
