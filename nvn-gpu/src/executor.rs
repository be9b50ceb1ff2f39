// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command execution on the software GPU.
//!
//! The executor walks a handle's control entries, fetches each command
//! segment from GPU memory, unpacks compressed method headers and dispatches
//! register writes to the engine on the addressed subchannel.
//!
//! Engine writes to memory (copies, fills) are held in a per-queue L2 write
//! queue and only reach memory when drained by a barrier, a CPU-flushing
//! fence, an event signal at the bottom of the pipe, or `finish`. Reads go
//! straight to memory and therefore observe stale data until then.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nvn_common::{align_down, GpuVAddr, PAGE_SIZE_U64};

use crate::command_recorder::CommandHandle;
use crate::command_stream::{collect_segments, words_from_bytes, CompressedMethod, SecOp, StreamError};
use crate::descriptor_pool::{SamplerDescriptor, TextureDescriptor, TextureHandle};
use crate::descriptor_table::{SamplerTable, TextureTable};
use crate::device::{DeviceShared, MAX_TEXTURE_BINDINGS};
use crate::engines::{default_engines, Engine};
use crate::fault::{FaultAccess, QueueErrorInfo, QueueErrorKind};
use crate::sync::SyncState;

/// Why execution of a batch stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecError {
    Fault(QueueErrorInfo),
    /// The owning queue is shutting down.
    Shutdown,
}

impl From<QueueErrorInfo> for ExecError {
    fn from(info: QueueErrorInfo) -> Self {
        Self::Fault(info)
    }
}

impl ExecError {
    /// Attach a stream address to an engine fault that lacks one.
    fn at(self, address: GpuVAddr) -> Self {
        match self {
            Self::Fault(mut info) if info.address.is_none() && info.kind == QueueErrorKind::EngineException => {
                info.address = Some(address);
                Self::Fault(info)
            }
            other => other,
        }
    }
}

fn stream_fault(err: StreamError) -> ExecError {
    let info = match err {
        StreamError::Unmapped(va) => QueueErrorInfo::mmu(va, FaultAccess::Read),
        StreamError::Malformed(va) | StreamError::CallDepth(va) => QueueErrorInfo::pbdma(Some(va)),
        StreamError::TooManyEntries | StreamError::BadMethod(_) => QueueErrorInfo::pbdma(None),
    };
    ExecError::Fault(info)
}

/// Execution counters of one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecStats {
    pub segments: u64,
    pub methods: u64,
    pub draws: u64,
    pub vertices: u64,
    pub dispatches: u64,
    pub workgroups: u64,
    pub copies: u64,
    pub bytes_copied: u64,
    pub fills: u64,
    pub bytes_filled: u64,
    pub barriers: u64,
    pub descriptor_invalidations: u64,
    pub write_drains: u64,
    pub events_signaled: u64,
    pub event_waits: u64,
    pub fences: u64,
    pub sync_waits: u64,
    pub reports: u64,
}

/// A texture binding as resolved by the 3D engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundTexture {
    pub slot: u32,
    pub handle: TextureHandle,
    pub texture: TextureDescriptor,
    pub sampler: Option<SamplerDescriptor>,
}

/// Pending GPU writes not yet visible in memory.
#[derive(Default)]
pub(crate) struct L2Cache {
    pending: Vec<(GpuVAddr, Vec<u8>)>,
}

impl L2Cache {
    pub fn push(&mut self, gpu_va: GpuVAddr, data: Vec<u8>) {
        self.pending.push((gpu_va, data));
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn take(&mut self) -> Vec<(GpuVAddr, Vec<u8>)> {
        std::mem::take(&mut self.pending)
    }
}

/// Ring in queue-owned memory that receives one launch record per dispatch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ComputeRing {
    pub base: GpuVAddr,
    pub size: u64,
    pub cursor: u64,
}

/// Bound GPU state of one queue.
pub(crate) struct GpuState {
    pub texture_table: TextureTable,
    pub sampler_table: SamplerTable,
    pub bound_textures: Vec<Option<BoundTexture>>,
    pub stats: ExecStats,
    pub l2: L2Cache,
    pub compute_ring: Option<ComputeRing>,
}

impl GpuState {
    fn new(compute_ring: Option<ComputeRing>) -> Self {
        Self {
            texture_table: TextureTable::new(),
            sampler_table: SamplerTable::new(),
            bound_textures: vec![None; MAX_TEXTURE_BINDINGS as usize],
            stats: ExecStats::default(),
            l2: L2Cache::default(),
            compute_ring,
        }
    }
}

/// Per-queue environment shared by every batch.
pub(crate) struct ExecEnv<'a> {
    pub shared: &'a DeviceShared,
    pub queue_id: u32,
    pub timeout: Duration,
    pub cancel: &'a AtomicBool,
    pub serial: u64,
}

/// What an engine sees while executing a method.
pub(crate) struct ExecContext<'a> {
    pub env: &'a ExecEnv<'a>,
    pub state: &'a mut GpuState,
}

impl ExecContext<'_> {
    /// Read GPU memory, bypassing pending writes.
    pub fn read(&self, gpu_va: GpuVAddr, dst: &mut [u8]) -> Result<(), ExecError> {
        self.env
            .shared
            .memory
            .read()
            .gpu_read(gpu_va, dst)
            .map_err(|va| QueueErrorInfo::mmu(va, FaultAccess::Read).into())
    }

    pub fn read_u32(&self, gpu_va: GpuVAddr) -> Result<u32, ExecError> {
        let mut buf = [0u8; 4];
        self.read(gpu_va, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Fault unless `[gpu_va, gpu_va + size)` is fully mapped. Engines call
    /// this before sizing any host buffer from GPU-supplied values.
    pub fn check_range(&self, gpu_va: GpuVAddr, size: u64, access: FaultAccess) -> Result<(), ExecError> {
        if self.env.shared.memory.read().mm.is_range_mapped(gpu_va, size) {
            return Ok(());
        }
        let fault = first_unmapped(self.env.shared, gpu_va, size);
        Err(QueueErrorInfo::mmu(fault, access).into())
    }

    /// Queue a write in L2. The destination must be mapped now.
    pub fn write(&mut self, gpu_va: GpuVAddr, data: Vec<u8>) -> Result<(), ExecError> {
        let mapped = self.env.shared.memory.read().mm.is_range_mapped(gpu_va, data.len() as u64);
        if !mapped {
            let fault = first_unmapped(self.env.shared, gpu_va, data.len() as u64);
            return Err(QueueErrorInfo::mmu(fault, FaultAccess::Write).into());
        }
        self.state.l2.push(gpu_va, data);
        Ok(())
    }

    /// Write straight to memory, visible to the CPU and to GPU waits.
    pub fn write_through(&mut self, gpu_va: GpuVAddr, data: &[u8]) -> Result<(), ExecError> {
        self.env
            .shared
            .memory
            .write()
            .write_coherent(gpu_va, data)
            .map_err(|va| ExecError::from(QueueErrorInfo::mmu(va, FaultAccess::Write)))?;
        self.env.shared.bump_epoch();
        Ok(())
    }

    /// Make every pending L2 write visible in memory.
    pub fn drain_writes(&mut self) {
        if self.state.l2.is_empty() {
            return;
        }
        let pending = self.state.l2.take();
        let mut mem = self.env.shared.memory.write();
        for (gpu_va, data) in &pending {
            if let Err(va) = mem.gpu_write(*gpu_va, data) {
                // Unmapped since it was queued.
                log::warn!("executor: dropped L2 write to unmapped VA 0x{:X}", va);
            }
        }
        drop(mem);
        self.state.stats.write_drains += 1;
        log::trace!("executor: drained {} L2 writes", pending.len());
    }

    /// Block until `ready` reports true, the device timeout elapses, or the
    /// queue shuts down. `address` is reported on timeout.
    pub fn wait_until(
        &mut self,
        address: Option<GpuVAddr>,
        mut ready: impl FnMut(&Self) -> Result<bool, ExecError>,
    ) -> Result<(), ExecError> {
        let deadline = Instant::now() + self.env.timeout;
        loop {
            let seen = self.env.shared.current_epoch();
            if ready(self)? {
                return Ok(());
            }
            if self.env.cancel.load(Ordering::Acquire) {
                return Err(ExecError::Shutdown);
            }
            let now = Instant::now();
            if now >= deadline {
                log::error!("executor: queue {} wait timed out", self.env.queue_id);
                return Err(QueueErrorInfo::timeout(address).into());
            }
            self.env.shared.wait_epoch(seen, deadline - now);
        }
    }

    pub fn lookup_sync(&self, id: u32) -> Option<std::sync::Arc<SyncState>> {
        self.env.shared.lookup_sync(id)
    }

    pub fn timestamp_ns(&self) -> u64 {
        self.env.shared.created.elapsed().as_nanos() as u64
    }

    pub fn stats(&mut self) -> &mut ExecStats {
        &mut self.state.stats
    }
}

fn first_unmapped(shared: &DeviceShared, gpu_va: GpuVAddr, size: u64) -> GpuVAddr {
    let mem = shared.memory.read();
    let end = gpu_va.saturating_add(size.max(1));
    let mut page = align_down(gpu_va, PAGE_SIZE_U64);
    while page < end {
        if mem.mm.translate(page).is_none() {
            return page.max(gpu_va);
        }
        match page.checked_add(PAGE_SIZE_U64) {
            Some(next) => page = next,
            None => break,
        }
    }
    gpu_va
}

/// Per-queue command executor.
pub(crate) struct Executor {
    engines: Vec<Option<Box<dyn Engine>>>,
    pub state: GpuState,
}

impl Executor {
    pub fn new(compute_ring: Option<ComputeRing>) -> Self {
        Self {
            engines: default_engines(),
            state: GpuState::new(compute_ring),
        }
    }

    /// Execute every command reachable from `handle`.
    pub fn execute(&mut self, env: &ExecEnv<'_>, handle: CommandHandle) -> Result<(), ExecError> {
        let segments = {
            let mem = env.shared.memory.read();
            collect_segments(&|va, buf| mem.gpu_read(va, buf), handle.address()).map_err(stream_fault)?
        };

        for segment in segments {
            let mut bytes = vec![0u8; segment.bytes() as usize];
            env.shared
                .memory
                .read()
                .gpu_read(segment.address, &mut bytes)
                .map_err(|va| ExecError::from(QueueErrorInfo::mmu(va, FaultAccess::Read)))?;
            let words = words_from_bytes(&bytes);
            self.state.stats.segments += 1;

            let mut ctx = ExecContext {
                env,
                state: &mut self.state,
            };
            process_pushbuffer(&mut self.engines, &mut ctx, segment.address, &words)?;
        }
        Ok(())
    }

    /// Drain pending writes outside of a command, e.g. at `finish`.
    pub fn drain_writes(&mut self, env: &ExecEnv<'_>) {
        let mut ctx = ExecContext {
            env,
            state: &mut self.state,
        };
        ctx.drain_writes();
    }
}

/// Process one segment of method headers and data words.
pub(crate) fn process_pushbuffer(
    engines: &mut [Option<Box<dyn Engine>>],
    ctx: &mut ExecContext<'_>,
    base: GpuVAddr,
    data: &[u32],
) -> Result<(), ExecError> {
    let mut pos = 0;

    while pos < data.len() {
        let header_va = base + pos as u64 * 4;
        let header = CompressedMethod::new(data[pos]);
        pos += 1;

        let subchannel = header.subchannel();
        let method = header.method_address();
        let count = header.method_count() as usize;

        match header.sec_op() {
            SecOp::IncMethod | SecOp::NonIncMethod | SecOp::OneInc => {
                if pos + count > data.len() {
                    log::error!("executor: method at 0x{:X} runs past its segment", header_va);
                    return Err(QueueErrorInfo::pbdma(Some(header_va)).into());
                }
                for i in 0..count {
                    let target = match header.sec_op() {
                        SecOp::IncMethod => method + i as u32,
                        SecOp::OneInc if i > 0 => method + 1,
                        _ => method,
                    };
                    dispatch(engines, ctx, subchannel, target, data[pos + i]).map_err(|e| e.at(header_va))?;
                }
                pos += count;
            }
            SecOp::ImmdDataMethod => {
                dispatch(engines, ctx, subchannel, method, header.immd_data()).map_err(|e| e.at(header_va))?;
            }
            SecOp::EndPbSegment => break,
            SecOp::Grp0UseTert | SecOp::Grp2UseTert | SecOp::Reserved6 => {
                log::error!(
                    "executor: illegal SecOp {:?} at 0x{:X}",
                    header.sec_op(),
                    header_va
                );
                return Err(QueueErrorInfo::pbdma(Some(header_va)).into());
            }
        }
    }
    Ok(())
}

fn dispatch(
    engines: &mut [Option<Box<dyn Engine>>],
    ctx: &mut ExecContext<'_>,
    subchannel: u32,
    method: u32,
    value: u32,
) -> Result<(), ExecError> {
    ctx.state.stats.methods += 1;
    match engines.get_mut(subchannel as usize).and_then(Option::as_mut) {
        Some(engine) => {
            log::trace!(
                "executor: {:?} method 0x{:X} = 0x{:X}",
                engine.class_id(),
                method,
                value
            );
            engine.write_reg(method, value, ctx)
        }
        None => {
            log::error!(
                "executor: no engine on subchannel {} (method=0x{:X}, value=0x{:X})",
                subchannel,
                method,
                value
            );
            Err(QueueErrorInfo::engine(None).into())
        }
    }
}
