// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! One-shot fences between queues and the CPU.
//!
//! A [`Sync`] is fenced into a queue's command stream and signaled by the
//! host engine when the GPU reaches it. The CPU observes it with
//! [`Sync::wait`]; another queue with [`Queue::wait_sync`].
//!
//! [`Queue::wait_sync`]: crate::queue::Queue::wait_sync

use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};

use crate::device::Device;
use crate::finalize::Retire;
use crate::queue::{Queue, QueueError};

/// Timeout that makes [`Sync::wait`] block until the sync is signaled.
pub const WAIT_TIMEOUT_MAXIMUM: u64 = u64::MAX;

/// Pipeline point a fence waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SyncCondition {
    AllGpuCommandsComplete = 0,
    GraphicsWorldSpaceComplete = 1,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SyncFlags: u32 {
        /// Make outstanding GPU writes visible to the CPU before signaling.
        const FLUSH_FOR_CPU = 0x1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncWaitResult {
    AlreadySignaled,
    ConditionSatisfied,
    TimeoutExpired,
    /// The sync was never fenced.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncStatus {
    Unfenced,
    Pending { queue_id: u32 },
    Signaled,
}

/// Signal state shared between a [`Sync`], the device registry and the GPU.
pub(crate) struct SyncState {
    pub id: u32,
    status: Mutex<SyncStatus>,
    cond: Condvar,
}

impl SyncState {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            status: Mutex::new(SyncStatus::Unfenced),
            cond: Condvar::new(),
        }
    }

    /// Arm the sync for a fence on `queue_id`. Re-fencing a signaled sync
    /// makes it pending again.
    pub fn set_pending(&self, queue_id: u32) {
        *self.status.lock() = SyncStatus::Pending { queue_id };
    }

    pub fn signal(&self) {
        *self.status.lock() = SyncStatus::Signaled;
        self.cond.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.status.lock() == SyncStatus::Signaled
    }

    /// Signal if pending on `queue_id`; used when that queue faults.
    pub fn signal_if_pending_on(&self, queue_id: u32) -> bool {
        let mut status = self.status.lock();
        if *status != (SyncStatus::Pending { queue_id }) {
            return false;
        }
        *status = SyncStatus::Signaled;
        self.cond.notify_all();
        true
    }

    fn wait(&self, timeout_ns: u64) -> SyncWaitResult {
        let mut status = self.status.lock();
        match *status {
            SyncStatus::Unfenced => return SyncWaitResult::Failed,
            SyncStatus::Signaled => return SyncWaitResult::AlreadySignaled,
            SyncStatus::Pending { .. } if timeout_ns == 0 => return SyncWaitResult::TimeoutExpired,
            SyncStatus::Pending { .. } => {}
        }

        let deadline = match timeout_ns {
            WAIT_TIMEOUT_MAXIMUM => None,
            ns => Instant::now().checked_add(Duration::from_nanos(ns)),
        };
        while *status != SyncStatus::Signaled {
            match deadline {
                None => self.cond.wait(&mut status),
                Some(deadline) => {
                    if self.cond.wait_until(&mut status, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        if *status == SyncStatus::Signaled {
            SyncWaitResult::ConditionSatisfied
        } else {
            SyncWaitResult::TimeoutExpired
        }
    }
}

pub struct Sync {
    device: Device,
    state: Arc<SyncState>,
}

impl Sync {
    pub fn new(device: &Device) -> Self {
        let state = Arc::new(SyncState::new(device.shared.allocate_sync_id()));
        device.shared.register_sync(&state);
        log::trace!("sync: created {}", state.id);
        Self {
            device: device.clone(),
            state,
        }
    }

    /// Fence the sync at the current end of `queue`'s work and flush the
    /// queue. The sync becomes signaled once the GPU reaches the fence.
    pub fn fence(&mut self, queue: &mut Queue, condition: SyncCondition, flags: SyncFlags) -> Result<(), QueueError> {
        queue.fence_sync(self, condition, flags)
    }

    /// Wait up to `timeout_ns` for the fence. `0` polls;
    /// [`WAIT_TIMEOUT_MAXIMUM`] waits indefinitely.
    pub fn wait(&self, timeout_ns: u64) -> SyncWaitResult {
        let result = self.state.wait(timeout_ns);
        log::trace!("sync: wait {} -> {:?}", self.state.id, result);
        result
    }

    pub fn id(&self) -> u32 {
        self.state.id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub(crate) fn state(&self) -> &Arc<SyncState> {
        &self.state
    }
}

impl Drop for Sync {
    fn drop(&mut self) {
        self.device.shared.unregister_sync(self.state.id);
    }
}

impl Retire for Sync {}
