// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Device: owner of the software GPU and the capability query.
//!
//! Every size, alignment and limit used by the rest of the crate is answered
//! by [`Device::get_integer`]; a handful of global properties are available
//! through [`get_global_integer`] before a device exists.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use nvn_common::settings::{DeviceSettings, ValidationLevel};
use nvn_common::*;

use crate::gpu_memory::GpuMemory;
use crate::sync::SyncState;

pub const API_MAJOR_VERSION: i32 = 53;
pub const API_MINOR_VERSION: i32 = 311;

/// Enumerated device properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceInfo {
    ApiMajorVersion,
    ApiMinorVersion,
    MemoryPoolPageSize,
    MemoryPoolVirtualPageSize,
    TextureDescriptorSize,
    SamplerDescriptorSize,
    ReservedTextureDescriptors,
    ReservedSamplerDescriptors,
    MaxTexturePoolSize,
    MaxSamplerPoolSize,
    CommandBufferCommandAlignment,
    CommandBufferControlAlignment,
    CommandBufferMinCommandSize,
    CommandBufferMinControlSize,
    QueueCommandMemoryDefaultSize,
    QueueCommandMemoryMinSize,
    QueueComputeMemoryDefaultSize,
    QueueComputeMemoryMinSize,
    QueueControlMemoryDefaultSize,
    QueueControlMemoryMinSize,
    QueueCommandMemoryGranularity,
    IndirectDrawAlignment,
    IndirectDispatchAlignment,
    MaxTextureBindings,
    CounterReportSize,
}

/// Properties answerable without a device.
pub fn get_global_integer(info: DeviceInfo) -> Option<i32> {
    match info {
        DeviceInfo::ApiMajorVersion => Some(API_MAJOR_VERSION),
        DeviceInfo::ApiMinorVersion => Some(API_MINOR_VERSION),
        _ => None,
    }
}

pub(crate) const QUEUE_MEMORY_MIN_SIZE: u64 = 0x1000;
pub(crate) const MAX_TEXTURE_BINDINGS: u32 = 32;
pub(crate) const COUNTER_REPORT_SIZE: u64 = 16;

/// State shared by every object created from a device.
pub(crate) struct DeviceShared {
    pub settings: DeviceSettings,
    pub memory: RwLock<GpuMemory>,
    /// Origin of GPU timestamps.
    pub created: Instant,
    syncs: Mutex<HashMap<u32, Weak<SyncState>>>,
    next_sync_id: AtomicU32,
    next_queue_id: AtomicU32,
    /// Bumped whenever a GPU-visible counter changes; GPU waits sleep on it.
    epoch: Mutex<u64>,
    epoch_changed: Condvar,
}

/// Handle to the software GPU.
#[derive(Clone)]
pub struct Device {
    pub(crate) shared: Arc<DeviceShared>,
}

impl Device {
    pub fn new(settings: DeviceSettings) -> Self {
        log::info!(
            "device: API {}.{}, validation={:?}",
            API_MAJOR_VERSION,
            API_MINOR_VERSION,
            settings.validation
        );
        Self {
            shared: Arc::new(DeviceShared {
                settings,
                memory: RwLock::new(GpuMemory::new()),
                created: Instant::now(),
                syncs: Mutex::new(HashMap::new()),
                next_sync_id: AtomicU32::new(1),
                next_queue_id: AtomicU32::new(1),
                epoch: Mutex::new(0),
                epoch_changed: Condvar::new(),
            }),
        }
    }

    /// Query a device property.
    pub fn get_integer(&self, info: DeviceInfo) -> i32 {
        if let Some(value) = get_global_integer(info) {
            return value;
        }
        let s = &self.shared.settings;
        let value: u64 = match info {
            DeviceInfo::ApiMajorVersion | DeviceInfo::ApiMinorVersion => unreachable!(),
            DeviceInfo::MemoryPoolPageSize => PAGE_SIZE_U64,
            DeviceInfo::MemoryPoolVirtualPageSize => VIRTUAL_PAGE_SIZE,
            DeviceInfo::TextureDescriptorSize | DeviceInfo::SamplerDescriptorSize => {
                DESCRIPTOR_SIZE as u64
            }
            DeviceInfo::ReservedTextureDescriptors => RESERVED_TEXTURE_DESCRIPTORS as u64,
            DeviceInfo::ReservedSamplerDescriptors => RESERVED_SAMPLER_DESCRIPTORS as u64,
            DeviceInfo::MaxTexturePoolSize => MAX_TEXTURE_POOL_SIZE as u64,
            DeviceInfo::MaxSamplerPoolSize => MAX_SAMPLER_POOL_SIZE as u64,
            DeviceInfo::CommandBufferCommandAlignment => COMMAND_ALIGNMENT,
            DeviceInfo::CommandBufferControlAlignment => CONTROL_ALIGNMENT,
            DeviceInfo::CommandBufferMinCommandSize => MIN_COMMAND_SIZE,
            DeviceInfo::CommandBufferMinControlSize => MIN_CONTROL_SIZE,
            DeviceInfo::QueueCommandMemoryDefaultSize => s.queue_command_memory_size,
            DeviceInfo::QueueComputeMemoryDefaultSize => s.queue_compute_memory_size,
            DeviceInfo::QueueControlMemoryDefaultSize => s.queue_control_memory_size,
            DeviceInfo::QueueCommandMemoryMinSize
            | DeviceInfo::QueueComputeMemoryMinSize
            | DeviceInfo::QueueControlMemoryMinSize => QUEUE_MEMORY_MIN_SIZE,
            DeviceInfo::QueueCommandMemoryGranularity => PAGE_SIZE_U64,
            DeviceInfo::IndirectDrawAlignment | DeviceInfo::IndirectDispatchAlignment => {
                INDIRECT_ALIGNMENT
            }
            DeviceInfo::MaxTextureBindings => MAX_TEXTURE_BINDINGS as u64,
            DeviceInfo::CounterReportSize => COUNTER_REPORT_SIZE,
        };
        // Settings-derived sizes can exceed the query's range.
        i32::try_from(value).unwrap_or(i32::MAX)
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.shared.settings
    }

    pub fn is_strict(&self) -> bool {
        self.shared.settings.validation == ValidationLevel::Strict
    }

    pub(crate) fn same_device(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl DeviceShared {
    pub fn next_queue_id(&self) -> u32 {
        self.next_queue_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register_sync(&self, state: &Arc<SyncState>) {
        self.syncs.lock().insert(state.id, Arc::downgrade(state));
    }

    pub fn unregister_sync(&self, id: u32) {
        self.syncs.lock().remove(&id);
    }

    pub fn allocate_sync_id(&self) -> u32 {
        self.next_sync_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn lookup_sync(&self, id: u32) -> Option<Arc<SyncState>> {
        self.syncs.lock().get(&id).and_then(Weak::upgrade)
    }

    /// Signal every sync still pending on `queue_id`.
    pub fn signal_syncs_for_queue(&self, queue_id: u32) -> usize {
        let live: Vec<Arc<SyncState>> = self
            .syncs
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        let signaled = live.iter().filter(|s| s.signal_if_pending_on(queue_id)).count();
        if signaled > 0 {
            self.bump_epoch();
        }
        signaled
    }

    /// Note that a GPU-visible counter changed and wake GPU waiters.
    pub fn bump_epoch(&self) {
        let mut epoch = self.epoch.lock();
        *epoch = epoch.wrapping_add(1);
        self.epoch_changed.notify_all();
    }

    pub fn current_epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    /// Sleep until the epoch moves past `seen` or `timeout` elapses.
    pub fn wait_epoch(&self, seen: u64, timeout: Duration) {
        let mut epoch = self.epoch.lock();
        if *epoch == seen {
            self.epoch_changed.wait_for(&mut epoch, timeout);
        }
    }
}
