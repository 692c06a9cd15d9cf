// Copyright © 2026 The vqsched Authors
//
// SPDX-License-Identifier: Apache-2.0
//
//! Physical-function resource virtualization for a hardware queue scheduler.
//!
//! The physical function (PF) owns every scheduler resource and parcels them
//! out to tenants. Each tenant sees an emulated PCI function whose register
//! window, MSI-X block and mailbox are virtualized here; the only hardware
//! touchpoint is the [`hw::SchedHw`] trait.

#[macro_use]
extern crate log;

pub mod device;
pub mod hw;
pub mod interrupt;
pub mod mbox;
pub mod passthrough;
pub mod perf;
pub mod pf;
pub mod resource;
pub mod tenant;
mod worker;

use thiserror::Error;

/// Maximum number of tenants one physical function can serve.
pub const MAX_TENANTS: usize = 16;

pub const NUM_SCHED_DOMAINS: u32 = 32;
pub const NUM_LDB_QUEUES: u32 = 32;
pub const NUM_LDB_PORTS: u32 = 64;
pub const NUM_COS_CLASSES: usize = 4;
pub const NUM_LDB_PORTS_PER_COS: u32 = NUM_LDB_PORTS / NUM_COS_CLASSES as u32;
pub const NUM_DIR_PORTS: u32 = 64;
pub const NUM_LDB_CREDITS: u32 = 8192;
pub const NUM_DIR_CREDITS: u32 = 2048;
pub const NUM_HIST_LIST_ENTRIES: u32 = 2048;
pub const NUM_ATOMIC_INFLIGHTS: u32 = 2048;
pub const NUM_SN_GROUPS: usize = 2;
pub const SN_SLOTS_PER_GROUP: u32 = 1024;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("permission denied")]
    PermissionDenied,
    #[error("device or resource busy")]
    Busy,
    #[error("operation timed out")]
    Timeout,
    #[error("insufficient resources")]
    CapacityExceeded,
    #[error("resource not owned by requester")]
    NotOwned,
    #[error("operation not supported")]
    NotSupported,
    #[error("tenant not registered")]
    NotRegistered,
}

impl Error {
    /// Negative errno value reported on the passthrough surface.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument => -libc::EINVAL,
            Error::PermissionDenied => -libc::EPERM,
            Error::Busy => -libc::EBUSY,
            Error::Timeout => -libc::ETIMEDOUT,
            Error::CapacityExceeded => -libc::ENOSPC,
            Error::NotOwned => -libc::EACCES,
            Error::NotSupported => -libc::ENOTTY,
            Error::NotRegistered => -libc::ENODEV,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
