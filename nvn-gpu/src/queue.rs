// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Queues: ordered submission of recorded work to a GPU worker thread.
//!
//! Submitted handles collect into a batch until the queue is flushed; each
//! flushed batch gets the next serial and is executed in order by the
//! queue's worker. Queue-level operations (fences, sync waits) are recorded
//! into memory the queue owns, split into a ring of chunks; a chunk is reused
//! only after the GPU has completed the batch that last used it.
//!
//! A GPU fault moves the queue to a terminal faulted state: later batches are
//! skipped, pending syncs fenced on the queue are signaled and `finish`
//! returns at once. Other queues keep running.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use nvn_common::settings::QueuePriority;
use nvn_common::PAGE_SIZE_U64;

use crate::command_recorder::{CommandHandle, CommandRecorder, RecordError};
use crate::command_stream::collect_segments;
use crate::device::{Device, QUEUE_MEMORY_MIN_SIZE};
use crate::executor::{BoundTexture, ComputeRing, ExecEnv, ExecError, ExecStats, Executor};
use crate::fault::QueueErrorInfo;
use crate::memory_pool::{MemoryPool, MemoryPoolBuilder, MemoryPoolError, MemoryPoolFlags};
use crate::sync::{Sync, SyncCondition, SyncFlags};

/// Chunks the queue's command and control memory are split into.
const CHUNK_COUNT: u64 = 4;

/// Free bytes a chunk must have left to take one more queue operation.
const QUEUE_OP_RESERVE: u64 = 64;

#[derive(Debug, Error)]
pub enum QueueBuildError {
    #[error("{which} memory size 0x{size:X} is below the minimum 0x{min:X}")]
    TooSmall { which: &'static str, size: u64, min: u64 },

    #[error("{which} memory size 0x{size:X} is not a multiple of the granularity")]
    BadGranularity { which: &'static str, size: u64 },

    #[error("flush threshold must be non-zero")]
    ZeroFlushThreshold,

    #[error(transparent)]
    Memory(#[from] MemoryPoolError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("failed to start queue worker: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("sync belongs to another device")]
    ForeignDevice,
}

pub struct QueueBuilder {
    device: Device,
    command_memory_size: u64,
    compute_memory_size: u64,
    control_memory_size: u64,
    priority: QueuePriority,
    flush_threshold: u64,
}

impl QueueBuilder {
    /// Start from the device's configured defaults.
    pub fn new(device: &Device) -> Self {
        let s = device.settings();
        Self {
            device: device.clone(),
            command_memory_size: s.queue_command_memory_size,
            compute_memory_size: s.queue_compute_memory_size,
            control_memory_size: s.queue_control_memory_size,
            priority: s.queue_priority,
            flush_threshold: s.queue_flush_threshold,
        }
    }

    pub fn set_command_memory_size(mut self, size: u64) -> Self {
        self.command_memory_size = size;
        self
    }

    pub fn set_compute_memory_size(mut self, size: u64) -> Self {
        self.compute_memory_size = size;
        self
    }

    pub fn set_control_memory_size(mut self, size: u64) -> Self {
        self.control_memory_size = size;
        self
    }

    pub fn set_priority(mut self, priority: QueuePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn set_flush_threshold(mut self, threshold: u64) -> Self {
        self.flush_threshold = threshold;
        self
    }

    fn check_size(which: &'static str, size: u64) -> Result<(), QueueBuildError> {
        if size < QUEUE_MEMORY_MIN_SIZE {
            return Err(QueueBuildError::TooSmall {
                which,
                size,
                min: QUEUE_MEMORY_MIN_SIZE,
            });
        }
        if size % PAGE_SIZE_U64 != 0 {
            return Err(QueueBuildError::BadGranularity { which, size });
        }
        Ok(())
    }

    pub fn build(self) -> Result<Queue, QueueBuildError> {
        Self::check_size("command", self.command_memory_size)?;
        Self::check_size("compute", self.compute_memory_size)?;
        Self::check_size("control", self.control_memory_size)?;
        if self.flush_threshold == 0 {
            return Err(QueueBuildError::ZeroFlushThreshold);
        }

        let compute_base = self.command_memory_size;
        let control_base = compute_base + self.compute_memory_size;
        let pool = MemoryPoolBuilder::new(&self.device)
            .set_size(control_base + self.control_memory_size)
            .set_flags(MemoryPoolFlags::CPU_UNCACHED | MemoryPoolFlags::GPU_CACHED)
            .build()?;
        let pool_va = pool.gpu_address().unwrap_or_default();

        let layout = QueueLayout {
            command_chunk: self.command_memory_size / CHUNK_COUNT,
            control_base,
            control_chunk: self.control_memory_size / CHUNK_COUNT,
        };
        let mut recorder = CommandRecorder::new(&self.device);
        recorder.memory_mut().attach_command(pool.reference(), 0, layout.command_chunk);
        recorder
            .memory_mut()
            .attach_control(pool.reference(), control_base, layout.control_chunk)?;

        let id = self.device.shared.next_queue_id();
        let shared = Arc::new(QueueShared::default());
        let ring = ComputeRing {
            base: pool_va + compute_base,
            size: self.compute_memory_size,
            cursor: 0,
        };
        let worker = {
            let shared = shared.clone();
            let device = self.device.clone();
            thread::Builder::new()
                .name(format!("nvn-queue-{}-{:?}", id, self.priority).to_lowercase())
                .spawn(move || worker_loop(shared, device, id, ring))?
        };

        log::info!(
            "queue {}: created (priority {:?}, command 0x{:X}, compute 0x{:X}, control 0x{:X})",
            id,
            self.priority,
            self.command_memory_size,
            self.compute_memory_size,
            self.control_memory_size
        );
        Ok(Queue {
            device: self.device,
            id,
            priority: self.priority,
            pool,
            layout,
            recorder,
            chunk: 0,
            chunk_serials: [0; CHUNK_COUNT as usize],
            pending: Vec::new(),
            unflushed_bytes: 0,
            flush_threshold: self.flush_threshold,
            shared,
            worker: Some(worker),
        })
    }
}

struct QueueLayout {
    command_chunk: u64,
    control_base: u64,
    control_chunk: u64,
}

struct Batch {
    serial: u64,
    handles: Vec<CommandHandle>,
    /// Make L2 writes visible once the batch completes.
    drain_writes: bool,
}

#[derive(Default)]
struct QueueState {
    batches: VecDeque<Batch>,
    shutdown: bool,
    /// Set once the worker thread has left its loop, normally or not.
    worker_exited: bool,
    fault: Option<QueueErrorInfo>,
}

#[derive(Default)]
struct Inspect {
    stats: ExecStats,
    bound_textures: Vec<Option<BoundTexture>>,
}

/// State shared between a [`Queue`] and its worker thread.
#[derive(Default)]
struct QueueShared {
    state: Mutex<QueueState>,
    work_ready: Condvar,
    work_done: Condvar,
    submitted: AtomicU64,
    completed: AtomicU64,
    cancel: AtomicBool,
    inspect: Mutex<Inspect>,
}

pub struct Queue {
    device: Device,
    id: u32,
    priority: QueuePriority,
    /// Backs the command, compute and control regions.
    pool: MemoryPool,
    layout: QueueLayout,
    recorder: CommandRecorder,
    chunk: u64,
    /// Serial of the batch that last used each chunk.
    chunk_serials: [u64; CHUNK_COUNT as usize],
    pending: Vec<CommandHandle>,
    unflushed_bytes: u64,
    flush_threshold: u64,
    shared: Arc<QueueShared>,
    worker: Option<JoinHandle<()>>,
}

impl Queue {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn priority(&self) -> QueuePriority {
        self.priority
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Serial of the last flushed batch.
    pub fn submitted_serial(&self) -> u64 {
        self.shared.submitted.load(Ordering::Acquire)
    }

    /// Serial of the last batch the GPU finished (or skipped after a fault).
    pub fn completed_serial(&self) -> u64 {
        self.shared.completed.load(Ordering::Acquire)
    }

    pub fn get_error(&self) -> QueueErrorInfo {
        self.shared.state.lock().fault.unwrap_or(QueueErrorInfo::NONE)
    }

    fn is_faulted(&self) -> bool {
        self.shared.state.lock().fault.is_some()
    }

    /// Execution counters as of the last completed batch.
    pub fn stats(&self) -> ExecStats {
        self.shared.inspect.lock().stats.clone()
    }

    /// Texture bindings as of the last completed batch.
    pub fn bound_textures(&self) -> Vec<BoundTexture> {
        self.shared.inspect.lock().bound_textures.iter().flatten().copied().collect()
    }

    /// Queue `handles` behind previously submitted work. Nothing runs until
    /// the queue is flushed, explicitly or once the unflushed command bytes
    /// reach the flush threshold.
    pub fn submit_commands(&mut self, handles: &[CommandHandle]) {
        if self.is_faulted() {
            log::debug!("queue {}: faulted, dropping {} handles", self.id, handles.len());
            return;
        }
        for &handle in handles {
            self.unflushed_bytes += self.command_bytes(handle);
            self.pending.push(handle);
        }
        if self.unflushed_bytes >= self.flush_threshold {
            log::debug!("queue {}: auto-flush at 0x{:X} bytes", self.id, self.unflushed_bytes);
            self.flush();
        }
    }

    /// Bytes of command words behind `handle`. Unreadable chains count as
    /// empty; the GPU reports them when it walks them.
    fn command_bytes(&self, handle: CommandHandle) -> u64 {
        let mem = self.device.shared.memory.read();
        match collect_segments(&|va, buf| mem.gpu_read(va, buf), handle.address()) {
            Ok(segments) => {
                if self.device.settings().log_commands {
                    for segment in &segments {
                        log::debug!(
                            "queue {}: handle 0x{:X} segment 0x{:X} ({} words)",
                            self.id,
                            handle.address(),
                            segment.address,
                            segment.words
                        );
                    }
                }
                segments.iter().map(|s| s.bytes()).sum()
            }
            Err(_) => 0,
        }
    }

    /// Hand the pending work to the GPU.
    pub fn flush(&mut self) {
        self.flush_batch(false);
    }

    fn flush_batch(&mut self, drain_writes: bool) -> u64 {
        if self.pending.is_empty() && !drain_writes {
            return self.submitted_serial();
        }
        let serial = self.submitted_serial() + 1;
        let handles = std::mem::take(&mut self.pending);
        log::debug!("queue {}: flush batch {} ({} handles)", self.id, serial, handles.len());
        {
            let mut state = self.shared.state.lock();
            state.batches.push_back(Batch {
                serial,
                handles,
                drain_writes,
            });
            self.shared.submitted.store(serial, Ordering::Release);
        }
        self.shared.work_ready.notify_one();
        self.unflushed_bytes = 0;
        serial
    }

    fn wait_completed(&self, serial: u64) {
        let mut state = self.shared.state.lock();
        while self.shared.completed.load(Ordering::Acquire) < serial && !state.shutdown && !state.worker_exited {
            self.shared.work_done.wait(&mut state);
        }
    }

    /// Flush and block until the GPU has finished all submitted work and its
    /// writes are visible. Returns at once on a faulted queue.
    pub fn finish(&mut self) {
        if self.is_faulted() {
            return;
        }
        let serial = self.flush_batch(true);
        self.wait_completed(serial);
    }

    /// Make the current chunk able to take one more queue operation,
    /// rotating to the next chunk once the GPU is done with it.
    fn reserve_chunk(&mut self) -> Result<(), QueueError> {
        if self.recorder.command_memory_free() >= QUEUE_OP_RESERVE
            && self.recorder.control_memory_free() >= QUEUE_OP_RESERVE
        {
            return Ok(());
        }
        let next = (self.chunk + 1) % CHUNK_COUNT;
        let reuse_serial = self.chunk_serials[next as usize];
        if reuse_serial > self.submitted_serial() {
            self.flush();
        }
        self.wait_completed(reuse_serial);
        log::trace!("queue {}: rotating to chunk {}", self.id, next);

        let layout = &self.layout;
        let memory = self.recorder.memory_mut();
        memory.attach_command(self.pool.reference(), next * layout.command_chunk, layout.command_chunk);
        memory.attach_control(
            self.pool.reference(),
            layout.control_base + next * layout.control_chunk,
            layout.control_chunk,
        )?;
        self.chunk = next;
        Ok(())
    }

    /// Record one queue operation and add it to the pending work.
    fn record_queue_op(
        &mut self,
        op: impl FnOnce(&mut CommandRecorder) -> Result<(), RecordError>,
    ) -> Result<(), QueueError> {
        self.reserve_chunk()?;
        self.recorder.begin_recording()?;
        let recorded = op(&mut self.recorder);
        let handle = self.recorder.end_recording();
        recorded?;
        self.pending.push(handle?);
        self.chunk_serials[self.chunk as usize] = self.submitted_serial() + 1;
        Ok(())
    }

    /// Fence `sync` behind all work submitted so far and flush.
    pub(crate) fn fence_sync(
        &mut self,
        sync: &Sync,
        condition: SyncCondition,
        flags: SyncFlags,
    ) -> Result<(), QueueError> {
        if !sync.device().same_device(&self.device) {
            return Err(QueueError::ForeignDevice);
        }
        let state = sync.state();
        if self.is_faulted() {
            state.set_pending(self.id);
            state.signal();
            self.device.shared.bump_epoch();
            return Ok(());
        }
        let id = state.id;
        self.record_queue_op(|rec| rec.fence(id, condition, flags))?;
        state.set_pending(self.id);
        self.flush();
        Ok(())
    }

    /// Make work submitted after this call wait on the GPU until `sync` is
    /// signaled.
    pub fn wait_sync(&mut self, sync: &Sync) -> Result<(), QueueError> {
        if !sync.device().same_device(&self.device) {
            return Err(QueueError::ForeignDevice);
        }
        if self.is_faulted() {
            return Ok(());
        }
        let id = sync.id();
        self.record_queue_op(|rec| rec.wait_sync(id))
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if !self.is_faulted() {
            self.finish();
        }
        self.shared.state.lock().shutdown = true;
        self.shared.cancel.store(true, Ordering::Release);
        self.shared.work_ready.notify_all();
        self.device.shared.bump_epoch();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("queue {}: worker panicked", self.id);
            }
        }
        self.device.shared.signal_syncs_for_queue(self.id);
        log::debug!("queue {}: destroyed", self.id);
    }
}

/// Marks the worker as gone when it leaves `worker_loop`, so waiters on
/// `work_done` stop waiting even if the thread dies.
struct WorkerExit<'a> {
    shared: &'a QueueShared,
    queue_id: u32,
}

impl Drop for WorkerExit<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if thread::panicking() && state.fault.is_none() {
            log::error!("queue {}: worker died", self.queue_id);
            state.fault = Some(QueueErrorInfo::engine(None));
        }
        state.worker_exited = true;
        self.shared.work_done.notify_all();
    }
}

fn worker_loop(shared: Arc<QueueShared>, device: Device, queue_id: u32, ring: ComputeRing) {
    let _exit = WorkerExit {
        shared: &shared,
        queue_id,
    };
    let mut executor = Executor::new(Some(ring));
    let timeout = Duration::from_millis(device.settings().gpu_timeout_ms);
    log::debug!("queue {}: worker started", queue_id);

    loop {
        let batch = {
            let mut state = shared.state.lock();
            loop {
                if let Some(batch) = state.batches.pop_front() {
                    break Some(batch);
                }
                if state.shutdown {
                    break None;
                }
                shared.work_ready.wait(&mut state);
            }
        };
        let Some(batch) = batch else {
            break;
        };

        let faulted = shared.state.lock().fault.is_some();
        if !faulted {
            let env = ExecEnv {
                shared: &device.shared,
                queue_id,
                timeout,
                cancel: &shared.cancel,
                serial: batch.serial,
            };
            let result = panic::catch_unwind(AssertUnwindSafe(|| -> Result<(), ExecError> {
                batch.handles.iter().try_for_each(|&h| executor.execute(&env, h))?;
                if batch.drain_writes {
                    executor.drain_writes(&env);
                }
                Ok(())
            }))
            .unwrap_or_else(|_| {
                log::error!("queue {}: engine panicked in batch {}", queue_id, batch.serial);
                Err(ExecError::Fault(QueueErrorInfo::engine(None)))
            });
            match result {
                Ok(()) => {}
                Err(ExecError::Fault(info)) => {
                    log::error!(
                        "queue {}: GPU fault {:?} at {:X?} ({:?}) in batch {}",
                        queue_id,
                        info.kind,
                        info.address,
                        info.access,
                        batch.serial
                    );
                    shared.state.lock().fault = Some(info);
                }
                Err(ExecError::Shutdown) => {
                    log::debug!("queue {}: batch {} cancelled", queue_id, batch.serial);
                }
            }
        }
        if shared.state.lock().fault.is_some() {
            device.shared.signal_syncs_for_queue(queue_id);
        }

        {
            let mut inspect = shared.inspect.lock();
            inspect.stats = executor.state.stats.clone();
            inspect.bound_textures = executor.state.bound_textures.clone();
        }
        let _state = shared.state.lock();
        shared.completed.store(batch.serial, Ordering::Release);
        shared.work_done.notify_all();
    }
    log::debug!("queue {}: worker stopped", queue_id);
}
