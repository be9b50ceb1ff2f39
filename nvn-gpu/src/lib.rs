// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Explicit GPU API core on a software GPU.
//!
//! Applications own all memory: they create [`MemoryPool`]s, carve buffers,
//! textures and descriptor pools out of them, record work with a
//! [`CommandRecorder`] into pool memory they supply, and submit the resulting
//! [`CommandHandle`]s to a [`Queue`]. Each queue runs a worker thread that
//! walks the recorded control and command streams and executes them against
//! the device's GPU address space. [`Sync`], [`Event`] and [`BarrierBits`]
//! order and observe that execution.

pub mod barrier;
pub mod command_recorder;
mod command_stream;
pub mod descriptor_pool;
mod descriptor_table;
pub mod device;
mod engines;
pub mod event;
mod executor;
pub mod fault;
pub mod finalize;
mod gpu_memory;
mod memory_manager;
pub mod memory_pool;
pub mod queue;
pub mod resource;
pub mod sync;

pub use barrier::BarrierBits;
pub use command_recorder::{CommandHandle, CommandRecorder, MemoryCallback, MemoryEvent, RecordError, RecorderMemory};
pub use descriptor_pool::{
    DescriptorKind, DescriptorPoolError, ImageHandle, SamplerDescriptor, SamplerPool, SeparateSamplerHandle,
    SeparateTextureHandle, TextureDescriptor, TextureHandle, TexturePool,
};
pub use device::{get_global_integer, Device, DeviceInfo};
pub use engines::host::CounterType;
pub use engines::threed::{DrawPrimitive, IndexType};
pub use event::{Event, EventError, EventSignalLocation, EventSignalMode, EventWaitMode};
pub use executor::{BoundTexture, ExecStats};
pub use fault::{FaultAccess, QueueErrorInfo, QueueErrorKind};
pub use finalize::{FinalizeQueue, Retire};
pub use memory_manager::StorageClass;
pub use memory_pool::{
    CpuAccess, GpuAccess, MappingRequest, MemoryPool, MemoryPoolBuilder, MemoryPoolError, MemoryPoolFlags,
    PoolMapping,
};
pub use queue::{Queue, QueueBuildError, QueueBuilder, QueueError};
pub use resource::{
    Buffer, Filter, Format, MipFilter, ResourceError, Sampler, Texture, TextureBuilder, TextureTarget, TextureView,
    WrapMode,
};
pub use sync::{Sync, SyncCondition, SyncFlags, SyncWaitResult, WAIT_TIMEOUT_MAXIMUM};
