// Copyright © 2026 The vqsched Authors
//
// SPDX-License-Identifier: Apache-2.0
//
//! Background cleanup thread.
//!
//! Queue unmaps complete after the hardware stops scheduling from the queue,
//! which can lag the mailbox request. The service path records the unmap and
//! hands completion to this thread so the tenant gets its response without
//! waiting.

use std::sync::Weak;
use std::thread;

use crate::pf::PfDevice;

pub enum Job {
    CompleteUnmaps { tenant: usize, domain: u32 },
    Shutdown,
}

pub struct CleanupWorker {
    tx: flume::Sender<Job>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CleanupWorker {
    /// Holds only a weak handle so the worker never keeps the device alive.
    pub fn spawn(pf: Weak<PfDevice>) -> Self {
        let (tx, rx) = flume::unbounded();
        let handle = thread::Builder::new()
            .name("vqsched-cleanup".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    match job {
                        Job::Shutdown => break,
                        Job::CompleteUnmaps { tenant, domain } => {
                            let pf = match pf.upgrade() {
                                Some(pf) => pf,
                                None => break,
                            };
                            pf.complete_unmaps(tenant, domain);
                        }
                    }
                }
            });
        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                error!("failed to spawn cleanup thread: {e}");
                None
            }
        };
        CleanupWorker { tx, handle }
    }

    pub fn queue(&self, job: Job) {
        if self.tx.send(job).is_err() {
            warn!("cleanup thread gone, dropping job");
        }
    }
}

impl Drop for CleanupWorker {
    fn drop(&mut self) {
        let _ = self.tx.send(Job::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
