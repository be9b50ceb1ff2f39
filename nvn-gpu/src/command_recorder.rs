// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command recording into application-supplied memory.
//!
//! A recorder writes method words into its current command block and control
//! entries into its current control block (see [`crate::command_stream`]).
//! Consecutive commands extend one open segment; a segment entry is emitted
//! when the segment is closed by a call, a block switch or the end of the
//! recording. Blocks may be replaced at any time; a control block switch in
//! the middle of a recording is stitched with a link entry written into the
//! eight bytes every control block keeps in reserve.
//!
//! When a block runs out, the memory callback is asked for more. If it adds
//! nothing the recording is aborted and [`CommandRecorder::end_recording`]
//! fails.

use std::collections::VecDeque;

use thiserror::Error;

use nvn_common::{
    is_aligned, GpuVAddr, COMMAND_ALIGNMENT, CONTROL_ALIGNMENT, INDIRECT_ALIGNMENT, MIN_COMMAND_SIZE,
    MIN_CONTROL_SIZE,
};

use crate::barrier::BarrierBits;
use crate::command_stream::{
    collect_segments, push_inc_method, split_commands, words_from_bytes, words_to_bytes, GpEntry, StreamError,
    CONTROL_ENTRY_SIZE, MAX_SEGMENT_WORDS,
};
use crate::descriptor_pool::{SamplerPool, TextureHandle, TexturePool};
use crate::device::{Device, COUNTER_REPORT_SIZE, MAX_TEXTURE_BINDINGS};
use crate::engines::host::{self, CounterType};
use crate::engines::threed::{self, DrawPrimitive, IndexType};
use crate::engines::{compute, copy, split_address, SubChannel};
use crate::event::{Event, EventSignalLocation, EventSignalMode, EventWaitMode};
use crate::finalize::Retire;
use crate::memory_pool::{CpuAccess, GpuAccess, MemoryPool, MemoryPoolError, PoolRef};
use crate::sync::{SyncCondition, SyncFlags};

/// Opaque reference to recorded work: the GPU VA of its first control entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandHandle(GpuVAddr);

impl CommandHandle {
    /// Wrap a raw control VA. Nothing is validated until the GPU walks it.
    pub fn from_address(address: GpuVAddr) -> Self {
        Self(address)
    }

    pub fn address(self) -> GpuVAddr {
        self.0
    }
}

/// Which block ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryEvent {
    OutOfCommandMemory,
    OutOfControlMemory,
}

/// Called with the recorder's memory, the exhausted block kind and the
/// minimum size to add. Must add memory before returning.
pub type MemoryCallback = Box<dyn FnMut(&mut RecorderMemory, MemoryEvent, u64) + Send>;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("recorder is not recording")]
    NotRecording,

    #[error("recorder is already recording")]
    AlreadyRecording,

    #[error("recording was aborted: the memory callback supplied no memory")]
    RecordingAborted,

    #[error("offset or size 0x{0:X} violates the block alignment")]
    MisalignedMemory(u64),

    #[error("block of 0x{size:X} bytes is below the minimum 0x{min:X}")]
    MemoryTooSmall { size: u64, min: u64 },

    #[error("pool must be CPU and GPU accessible")]
    PoolNotAccessible,

    #[error(transparent)]
    Memory(#[from] MemoryPoolError),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("address 0x{0:X} is misaligned")]
    MisalignedAddress(GpuVAddr),

    #[error("address range at 0x{0:X} is not mapped")]
    UnmappedAddress(GpuVAddr),

    #[error("invalid command handle 0x{0:X}")]
    InvalidHandle(GpuVAddr),

    #[error("texture slot {0} out of range")]
    TextureSlotOutOfRange(u32),

    #[error("object belongs to another device")]
    ForeignObject,

    #[error(transparent)]
    Stream(#[from] StreamError),
}

struct Block {
    pool: PoolRef,
    offset: u64,
    size: u64,
    used: u64,
    gpu_base: GpuVAddr,
}

impl Block {
    fn free(&self) -> u64 {
        self.size - self.used
    }

    /// Copy `bytes` to the end of the block and return their VA.
    fn append(&mut self, bytes: &[u8]) -> Result<GpuVAddr, MemoryPoolError> {
        self.pool.driver_write(self.offset + self.used, bytes)?;
        let va = self.gpu_base + self.used;
        self.used += bytes.len() as u64;
        Ok(va)
    }
}

/// The command and control blocks of a recorder. Handed to the memory
/// callback so it can add blocks.
pub struct RecorderMemory {
    device: Device,
    command: Option<Block>,
    control: Option<Block>,
    /// Start and length of the segment being extended.
    open_segment: Option<(GpuVAddr, u32)>,
    /// Control entries produced where none can be written yet.
    pending: VecDeque<GpEntry>,
    /// First control entry of the current recording.
    handle: Option<GpuVAddr>,
}

impl RecorderMemory {
    fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
            command: None,
            control: None,
            open_segment: None,
            pending: VecDeque::new(),
            handle: None,
        }
    }

    fn check_block(
        &self,
        pool: &MemoryPool,
        offset: u64,
        size: u64,
        alignment: u64,
        min: u64,
    ) -> Result<PoolRef, RecordError> {
        if !pool.device().same_device(&self.device) {
            return Err(RecordError::ForeignObject);
        }
        if !is_aligned(offset, alignment) {
            return Err(RecordError::MisalignedMemory(offset));
        }
        if !is_aligned(size, alignment) {
            return Err(RecordError::MisalignedMemory(size));
        }
        if size < min {
            return Err(RecordError::MemoryTooSmall { size, min });
        }
        if pool.cpu_access() == CpuAccess::None || pool.gpu_access() == GpuAccess::None {
            return Err(RecordError::PoolNotAccessible);
        }
        let pool = pool.reference();
        pool.check_range(offset, size)?;
        Ok(pool)
    }

    /// Replace the command block. The rest of the old block is abandoned.
    pub fn add_command_memory(&mut self, pool: &MemoryPool, offset: u64, size: u64) -> Result<(), RecordError> {
        let pool = self.check_block(pool, offset, size, COMMAND_ALIGNMENT, MIN_COMMAND_SIZE)?;
        self.attach_command(pool, offset, size);
        Ok(())
    }

    /// Replace the control block. The rest of the old block is abandoned.
    pub fn add_control_memory(&mut self, pool: &MemoryPool, offset: u64, size: u64) -> Result<(), RecordError> {
        let pool = self.check_block(pool, offset, size, CONTROL_ALIGNMENT, MIN_CONTROL_SIZE)?;
        self.attach_control(pool, offset, size)
    }

    pub(crate) fn attach_command(&mut self, pool: PoolRef, offset: u64, size: u64) {
        self.close_segment();
        let gpu_base = pool.gpu_address().unwrap_or_default() + offset;
        log::debug!("recorder: command block 0x{:X} bytes at VA 0x{:X}", size, gpu_base);
        self.command = Some(Block {
            pool,
            offset,
            size,
            used: 0,
            gpu_base,
        });
    }

    pub(crate) fn attach_control(&mut self, pool: PoolRef, offset: u64, size: u64) -> Result<(), RecordError> {
        let gpu_base = pool.gpu_address().unwrap_or_default() + offset;
        if self.handle.is_some() {
            // Mid-chain: continue the walk in the new block.
            if let Some(old) = self.control.as_mut() {
                old.append(&GpEntry::link(gpu_base).to_bytes())?;
            }
        }
        log::debug!("recorder: control block 0x{:X} bytes at VA 0x{:X}", size, gpu_base);
        self.control = Some(Block {
            pool,
            offset,
            size,
            used: 0,
            gpu_base,
        });
        Ok(())
    }

    pub fn command_memory_used(&self) -> u64 {
        self.command.as_ref().map_or(0, |b| b.used)
    }

    pub fn command_memory_free(&self) -> u64 {
        self.command.as_ref().map_or(0, Block::free)
    }

    pub fn control_memory_used(&self) -> u64 {
        self.control.as_ref().map_or(0, |b| b.used)
    }

    /// Free control bytes, not counting the link reserve.
    pub fn control_memory_free(&self) -> u64 {
        self.control
            .as_ref()
            .map_or(0, |b| b.free().saturating_sub(CONTROL_ENTRY_SIZE))
    }

    fn close_segment(&mut self) {
        if let Some((address, words)) = self.open_segment.take() {
            self.pending.push_back(GpEntry::segment(address, words));
        }
    }

    /// Append a segment of `words` following the open one when contiguous.
    fn extend_segment(&mut self, address: GpuVAddr, words: u32) {
        match self.open_segment.as_mut() {
            Some((start, len)) if *start + *len as u64 * 4 == address && *len + words <= MAX_SEGMENT_WORDS => {
                *len += words;
            }
            _ => {
                self.close_segment();
                self.open_segment = Some((address, words));
            }
        }
    }

    fn push_control(&mut self, entry: GpEntry) -> Result<(), RecordError> {
        let Some(block) = self.control.as_mut() else {
            return Err(RecordError::RecordingAborted);
        };
        let va = block.append(&entry.to_bytes())?;
        self.handle.get_or_insert(va);
        Ok(())
    }

    fn reset_recording(&mut self) {
        self.open_segment = None;
        self.pending.clear();
        self.handle = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    NotRecording,
    Recording,
    Aborted,
}

pub struct CommandRecorder {
    memory: RecorderMemory,
    callback: Option<MemoryCallback>,
    state: RecordState,
}

impl CommandRecorder {
    pub fn new(device: &Device) -> Self {
        Self {
            memory: RecorderMemory::new(device),
            callback: None,
            state: RecordState::NotRecording,
        }
    }

    pub fn device(&self) -> &Device {
        &self.memory.device
    }

    pub fn set_memory_callback(&mut self, callback: MemoryCallback) {
        self.callback = Some(callback);
    }

    pub fn add_command_memory(&mut self, pool: &MemoryPool, offset: u64, size: u64) -> Result<(), RecordError> {
        self.memory.add_command_memory(pool, offset, size)
    }

    pub fn add_control_memory(&mut self, pool: &MemoryPool, offset: u64, size: u64) -> Result<(), RecordError> {
        self.memory.add_control_memory(pool, offset, size)
    }

    pub(crate) fn memory_mut(&mut self) -> &mut RecorderMemory {
        &mut self.memory
    }

    pub fn command_memory_used(&self) -> u64 {
        self.memory.command_memory_used()
    }

    pub fn command_memory_free(&self) -> u64 {
        self.memory.command_memory_free()
    }

    pub fn control_memory_used(&self) -> u64 {
        self.memory.control_memory_used()
    }

    pub fn control_memory_free(&self) -> u64 {
        self.memory.control_memory_free()
    }

    pub fn is_recording(&self) -> bool {
        self.state != RecordState::NotRecording
    }

    pub fn begin_recording(&mut self) -> Result<(), RecordError> {
        if self.state != RecordState::NotRecording {
            return Err(RecordError::AlreadyRecording);
        }
        self.memory.reset_recording();
        self.state = RecordState::Recording;
        Ok(())
    }

    /// Finish the recording and return its handle. An empty recording
    /// yields a handle that executes nothing.
    pub fn end_recording(&mut self) -> Result<CommandHandle, RecordError> {
        if self.state == RecordState::Aborted {
            self.memory.reset_recording();
            self.state = RecordState::NotRecording;
            return Err(RecordError::RecordingAborted);
        }
        self.check_recording()?;
        let result = self.finish_chain();
        self.memory.reset_recording();
        self.state = RecordState::NotRecording;
        if let Ok(handle) = result {
            log::trace!("recorder: recording ended, handle 0x{:X}", handle.address());
        }
        result
    }

    fn finish_chain(&mut self) -> Result<CommandHandle, RecordError> {
        self.memory.close_segment();
        self.flush_pending()?;
        self.emit_control(GpEntry::end())?;
        self.memory
            .handle
            .map(CommandHandle)
            .ok_or(RecordError::RecordingAborted)
    }

    fn check_recording(&mut self) -> Result<(), RecordError> {
        match self.state {
            RecordState::Recording => Ok(()),
            RecordState::NotRecording => Err(RecordError::NotRecording),
            RecordState::Aborted => Err(RecordError::RecordingAborted),
        }
    }

    fn abort(&mut self) -> RecordError {
        log::warn!("recorder: out of memory, recording aborted");
        self.state = RecordState::Aborted;
        RecordError::RecordingAborted
    }

    fn request_memory(&mut self, event: MemoryEvent, min_size: u64) {
        log::debug!("recorder: {:?}, requesting 0x{:X} bytes", event, min_size);
        if let Some(callback) = self.callback.as_mut() {
            callback(&mut self.memory, event, min_size);
        }
    }

    fn emit_control(&mut self, entry: GpEntry) -> Result<(), RecordError> {
        if self.memory.control_memory_free() < CONTROL_ENTRY_SIZE {
            self.request_memory(MemoryEvent::OutOfControlMemory, MIN_CONTROL_SIZE);
            if self.memory.control_memory_free() < CONTROL_ENTRY_SIZE {
                return Err(self.abort());
            }
        }
        match self.memory.push_control(entry) {
            Err(RecordError::RecordingAborted) => Err(self.abort()),
            result => result,
        }
    }

    fn flush_pending(&mut self) -> Result<(), RecordError> {
        while let Some(entry) = self.memory.pending.pop_front() {
            self.emit_control(entry)?;
        }
        Ok(())
    }

    /// Append one whole command.
    fn write_command(&mut self, words: &[u32]) -> Result<(), RecordError> {
        self.check_recording()?;
        let bytes = words.len() as u64 * 4;
        if self.memory.command_memory_free() < bytes {
            self.memory.close_segment();
            self.request_memory(MemoryEvent::OutOfCommandMemory, bytes.max(MIN_COMMAND_SIZE));
            if self.memory.command_memory_free() < bytes {
                return Err(self.abort());
            }
        }
        let Some(block) = self.memory.command.as_mut() else {
            return Err(self.abort());
        };
        let address = block.append(&words_to_bytes(words))?;
        self.memory.extend_segment(address, words.len() as u32);
        self.flush_pending()
    }

    // ── Validation helpers ───────────────────────────────────────────────

    /// In strict mode, fail if `[address, address + size)` is not mapped.
    fn check_mapped(&self, address: GpuVAddr, size: u64) -> Result<(), RecordError> {
        let device = &self.memory.device;
        if device.is_strict() && !device.shared.memory.read().mm.is_range_mapped(address, size.max(1)) {
            log::warn!("recorder: rejected unmapped range 0x{:X} (+0x{:X})", address, size);
            return Err(RecordError::UnmappedAddress(address));
        }
        Ok(())
    }

    fn check_device(&self, device: &Device) -> Result<(), RecordError> {
        if self.memory.device.same_device(device) {
            Ok(())
        } else {
            Err(RecordError::ForeignObject)
        }
    }

    // ── Texture state ────────────────────────────────────────────────────

    pub fn set_texture_pool(&mut self, pool: &TexturePool) -> Result<(), RecordError> {
        self.check_recording()?;
        if !pool.same_device(&self.memory.device) {
            return Err(RecordError::ForeignObject);
        }
        let [hi, lo] = split_address(pool.gpu_address());
        let mut words = Vec::with_capacity(5);
        push_inc_method(
            &mut words,
            SubChannel::Threed,
            threed::TEXTURE_POOL_ADDRESS_HIGH,
            &[hi, lo, pool.capacity(), 0],
        );
        self.write_command(&words)
    }

    pub fn set_sampler_pool(&mut self, pool: &SamplerPool) -> Result<(), RecordError> {
        self.check_recording()?;
        if !pool.same_device(&self.memory.device) {
            return Err(RecordError::ForeignObject);
        }
        let [hi, lo] = split_address(pool.gpu_address());
        let mut words = Vec::with_capacity(5);
        push_inc_method(
            &mut words,
            SubChannel::Threed,
            threed::SAMPLER_POOL_ADDRESS_HIGH,
            &[hi, lo, pool.capacity(), 0],
        );
        self.write_command(&words)
    }

    /// Bind `handle` to texture `slot`. A zero handle unbinds the slot.
    pub fn bind_texture(&mut self, slot: u32, handle: TextureHandle) -> Result<(), RecordError> {
        self.check_recording()?;
        if slot >= MAX_TEXTURE_BINDINGS {
            return Err(RecordError::TextureSlotOutOfRange(slot));
        }
        let [hi, lo] = split_address(handle.0);
        let mut words = Vec::with_capacity(4);
        push_inc_method(&mut words, SubChannel::Threed, threed::BIND_TEXTURE_SLOT, &[slot, lo, hi]);
        self.write_command(&words)
    }

    // ── Draws ────────────────────────────────────────────────────────────

    pub fn draw_arrays(&mut self, mode: DrawPrimitive, first: u32, count: u32) -> Result<(), RecordError> {
        self.draw_arrays_instanced(mode, first, count, 0, 1)
    }

    pub fn draw_arrays_instanced(
        &mut self,
        mode: DrawPrimitive,
        first: u32,
        count: u32,
        base_instance: u32,
        instance_count: u32,
    ) -> Result<(), RecordError> {
        self.check_recording()?;
        let mut words = Vec::with_capacity(6);
        push_inc_method(
            &mut words,
            SubChannel::Threed,
            threed::DRAW_FIRST,
            &[first, count, instance_count, base_instance, mode as u32],
        );
        self.write_command(&words)
    }

    pub fn draw_elements(
        &mut self,
        mode: DrawPrimitive,
        index_type: IndexType,
        count: u32,
        index_buffer: GpuVAddr,
    ) -> Result<(), RecordError> {
        self.draw_elements_instanced(mode, index_type, count, index_buffer, 0, 0, 1)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn draw_elements_instanced(
        &mut self,
        mode: DrawPrimitive,
        index_type: IndexType,
        count: u32,
        index_buffer: GpuVAddr,
        base_vertex: i32,
        base_instance: u32,
        instance_count: u32,
    ) -> Result<(), RecordError> {
        self.check_recording()?;
        let size = index_type.size() as u64;
        if !is_aligned(index_buffer, size) {
            return Err(RecordError::MisalignedAddress(index_buffer));
        }
        self.check_mapped(index_buffer, count as u64 * size)?;
        let [hi, lo] = split_address(index_buffer);
        let mut words = Vec::with_capacity(10);
        push_inc_method(
            &mut words,
            SubChannel::Threed,
            threed::INDEX_BUFFER_ADDRESS_HIGH,
            &[
                hi,
                lo,
                index_type.size(),
                count,
                instance_count,
                0,
                base_vertex as u32,
                base_instance,
                mode as u32,
            ],
        );
        self.write_command(&words)
    }

    /// Draw with `{count, instance_count, first, base_instance}` read from
    /// `indirect` when the GPU executes the draw.
    pub fn draw_arrays_indirect(&mut self, mode: DrawPrimitive, indirect: GpuVAddr) -> Result<(), RecordError> {
        self.check_recording()?;
        if !is_aligned(indirect, INDIRECT_ALIGNMENT) {
            return Err(RecordError::MisalignedAddress(indirect));
        }
        self.check_mapped(indirect, 16)?;
        let [hi, lo] = split_address(indirect);
        let mut words = Vec::with_capacity(4);
        push_inc_method(
            &mut words,
            SubChannel::Threed,
            threed::ARRAYS_INDIRECT_ADDRESS_HIGH,
            &[hi, lo, mode as u32],
        );
        self.write_command(&words)
    }

    /// Draw with `{count, instance_count, first_index, base_vertex,
    /// base_instance}` read from `indirect`.
    pub fn draw_elements_indirect(
        &mut self,
        mode: DrawPrimitive,
        index_type: IndexType,
        index_buffer: GpuVAddr,
        indirect: GpuVAddr,
    ) -> Result<(), RecordError> {
        self.check_recording()?;
        if !is_aligned(indirect, INDIRECT_ALIGNMENT) {
            return Err(RecordError::MisalignedAddress(indirect));
        }
        if !is_aligned(index_buffer, index_type.size() as u64) {
            return Err(RecordError::MisalignedAddress(index_buffer));
        }
        self.check_mapped(indirect, 20)?;
        let [ih, il] = split_address(index_buffer);
        let [hi, lo] = split_address(indirect);
        let mut words = Vec::with_capacity(8);
        push_inc_method(
            &mut words,
            SubChannel::Threed,
            threed::INDEX_BUFFER_ADDRESS_HIGH,
            &[ih, il, index_type.size()],
        );
        push_inc_method(
            &mut words,
            SubChannel::Threed,
            threed::ELEMENTS_INDIRECT_ADDRESS_HIGH,
            &[hi, lo, mode as u32],
        );
        self.write_command(&words)
    }

    // ── Compute ──────────────────────────────────────────────────────────

    pub fn dispatch_compute(&mut self, groups_x: u32, groups_y: u32, groups_z: u32) -> Result<(), RecordError> {
        self.check_recording()?;
        let mut words = Vec::with_capacity(5);
        push_inc_method(&mut words, SubChannel::Compute, compute::GROUPS_X, &[groups_x, groups_y, groups_z, 0]);
        self.write_command(&words)
    }

    /// Dispatch with `{groups_x, groups_y, groups_z}` read from `indirect`.
    pub fn dispatch_compute_indirect(&mut self, indirect: GpuVAddr) -> Result<(), RecordError> {
        self.check_recording()?;
        if !is_aligned(indirect, INDIRECT_ALIGNMENT) {
            return Err(RecordError::MisalignedAddress(indirect));
        }
        self.check_mapped(indirect, 12)?;
        let [hi, lo] = split_address(indirect);
        let mut words = Vec::with_capacity(4);
        push_inc_method(&mut words, SubChannel::Compute, compute::INDIRECT_ADDRESS_HIGH, &[hi, lo, 0]);
        self.write_command(&words)
    }

    // ── Memory ───────────────────────────────────────────────────────────

    pub fn copy_buffer_to_buffer(&mut self, src: GpuVAddr, dst: GpuVAddr, size: u64) -> Result<(), RecordError> {
        self.check_recording()?;
        if size == 0 {
            return Err(RecordError::InvalidArgument("copy size is zero"));
        }
        self.check_mapped(src, size)?;
        self.check_mapped(dst, size)?;
        let [sh, sl] = split_address(src);
        let [dh, dl] = split_address(dst);
        let [zh, zl] = split_address(size);
        let mut words = Vec::with_capacity(8);
        push_inc_method(
            &mut words,
            SubChannel::Copy,
            copy::SRC_ADDRESS_HIGH,
            &[sh, sl, dh, dl, zh, zl, 0],
        );
        self.write_command(&words)
    }

    /// Fill `size` bytes at `dst` with the 32-bit `value`.
    pub fn clear_buffer(&mut self, dst: GpuVAddr, size: u64, value: u32) -> Result<(), RecordError> {
        self.check_recording()?;
        if size == 0 || size % 4 != 0 {
            return Err(RecordError::InvalidArgument("clear size must be a non-zero multiple of 4"));
        }
        if !is_aligned(dst, 4) {
            return Err(RecordError::MisalignedAddress(dst));
        }
        self.check_mapped(dst, size)?;
        let [dh, dl] = split_address(dst);
        let [zh, zl] = split_address(size);
        let mut words = Vec::with_capacity(8);
        push_inc_method(&mut words, SubChannel::Copy, copy::DST_ADDRESS_HIGH, &[dh, dl, zh, zl]);
        push_inc_method(&mut words, SubChannel::Copy, copy::FILL_VALUE, &[value, 0]);
        self.write_command(&words)
    }

    // ── Synchronization ──────────────────────────────────────────────────

    pub fn barrier(&mut self, bits: BarrierBits) -> Result<(), RecordError> {
        self.check_recording()?;
        let mut words = Vec::with_capacity(2);
        push_inc_method(&mut words, SubChannel::Host, host::BARRIER, &[bits.bits()]);
        self.write_command(&words)
    }

    pub fn signal_event(
        &mut self,
        event: &Event,
        mode: EventSignalMode,
        value: u32,
        location: EventSignalLocation,
    ) -> Result<(), RecordError> {
        self.check_recording()?;
        self.check_device(event.pool().device())?;
        let [hi, lo] = split_address(event.address());
        let mut words = Vec::with_capacity(5);
        push_inc_method(
            &mut words,
            SubChannel::Host,
            host::EVENT_ADDRESS_HIGH,
            &[hi, lo, value, host::event_signal_arg(mode, location)],
        );
        self.write_command(&words)
    }

    /// Make the GPU wait until `event` satisfies `mode` against `value`.
    pub fn wait_event(&mut self, event: &Event, mode: EventWaitMode, value: u32) -> Result<(), RecordError> {
        self.check_recording()?;
        self.check_device(event.pool().device())?;
        let [hi, lo] = split_address(event.address());
        let mut words = Vec::with_capacity(6);
        push_inc_method(&mut words, SubChannel::Host, host::EVENT_ADDRESS_HIGH, &[hi, lo, value]);
        push_inc_method(&mut words, SubChannel::Host, host::EVENT_WAIT, &[mode as u32]);
        self.write_command(&words)
    }

    /// Write a `{u64 value, u64 timestamp_ns}` report to `dst`.
    pub fn report_counter(&mut self, counter: CounterType, dst: GpuVAddr) -> Result<(), RecordError> {
        self.check_recording()?;
        if !is_aligned(dst, COUNTER_REPORT_SIZE) {
            return Err(RecordError::MisalignedAddress(dst));
        }
        self.check_mapped(dst, COUNTER_REPORT_SIZE)?;
        let [hi, lo] = split_address(dst);
        let mut words = Vec::with_capacity(4);
        push_inc_method(&mut words, SubChannel::Host, host::REPORT_ADDRESS_HIGH, &[hi, lo, counter as u32]);
        self.write_command(&words)
    }

    pub(crate) fn fence(&mut self, sync_id: u32, condition: SyncCondition, flags: SyncFlags) -> Result<(), RecordError> {
        self.check_recording()?;
        let mut words = Vec::with_capacity(4);
        push_inc_method(
            &mut words,
            SubChannel::Host,
            host::SYNC_ID,
            &[sync_id, condition as u32, flags.bits()],
        );
        self.write_command(&words)
    }

    pub(crate) fn wait_sync(&mut self, sync_id: u32) -> Result<(), RecordError> {
        self.check_recording()?;
        let mut words = Vec::with_capacity(2);
        push_inc_method(&mut words, SubChannel::Host, host::WAIT_SYNC, &[sync_id]);
        self.write_command(&words)
    }

    // ── Composition ──────────────────────────────────────────────────────

    fn check_handle(&self, handle: CommandHandle) -> Result<(), RecordError> {
        let address = handle.address();
        if address == 0 || !is_aligned(address, CONTROL_ALIGNMENT) {
            return Err(RecordError::InvalidHandle(address));
        }
        self.check_mapped(address, CONTROL_ENTRY_SIZE)
            .map_err(|_| RecordError::InvalidHandle(address))
    }

    /// Insert calls to previously recorded work. The referenced memory must
    /// stay valid until the GPU has executed this recording.
    pub fn call_commands(&mut self, handles: &[CommandHandle]) -> Result<(), RecordError> {
        self.check_recording()?;
        for &handle in handles {
            self.check_handle(handle)?;
        }
        self.memory.close_segment();
        self.memory
            .pending
            .extend(handles.iter().map(|h| GpEntry::call(h.address())));
        self.flush_pending()
    }

    /// Copy the commands of previously recorded work, flattening its calls,
    /// into this recorder's memory.
    pub fn copy_commands(&mut self, handles: &[CommandHandle]) -> Result<(), RecordError> {
        self.check_recording()?;
        for &handle in handles {
            self.check_handle(handle)?;
        }
        let mut segments_words = Vec::new();
        {
            let mem = self.memory.device.shared.memory.read();
            let read = |va, buf: &mut [u8]| mem.gpu_read(va, buf);
            for &handle in handles {
                for segment in collect_segments(&read, handle.address())? {
                    let mut bytes = vec![0u8; segment.bytes() as usize];
                    mem.gpu_read(segment.address, &mut bytes)
                        .map_err(RecordError::UnmappedAddress)?;
                    segments_words.push(words_from_bytes(&bytes));
                }
            }
        }
        for words in &segments_words {
            for command in split_commands(words)? {
                self.write_command(command)?;
            }
        }
        Ok(())
    }
}

impl Retire for CommandRecorder {}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::command_stream::{CompressedMethod, Segment};
    use crate::memory_pool::{MemoryPoolBuilder, MemoryPoolFlags};
    use nvn_common::settings::{DeviceSettings, ValidationLevel};

    fn setup_with(settings: DeviceSettings) -> (Device, MemoryPool) {
        let device = Device::new(settings);
        let pool = MemoryPoolBuilder::new(&device)
            .set_size(0x1_0000)
            .set_flags(MemoryPoolFlags::CPU_UNCACHED | MemoryPoolFlags::GPU_CACHED)
            .build()
            .unwrap();
        (device, pool)
    }

    fn setup() -> (Device, MemoryPool) {
        setup_with(DeviceSettings::default())
    }

    fn recorder(device: &Device, pool: &MemoryPool) -> CommandRecorder {
        let mut rec = CommandRecorder::new(device);
        rec.add_command_memory(pool, 0, 0x4000).unwrap();
        rec.add_control_memory(pool, 0x8000, 0x1000).unwrap();
        rec
    }

    fn segments(device: &Device, handle: CommandHandle) -> Vec<Segment> {
        let mem = device.shared.memory.read();
        collect_segments(&|va, buf| mem.gpu_read(va, buf), handle.address()).unwrap()
    }

    fn segment_words(device: &Device, handle: CommandHandle) -> Vec<u32> {
        let mem = device.shared.memory.read();
        let mut all = Vec::new();
        for seg in collect_segments(&|va, buf| mem.gpu_read(va, buf), handle.address()).unwrap() {
            let mut bytes = vec![0u8; seg.bytes() as usize];
            mem.gpu_read(seg.address, &mut bytes).unwrap();
            all.extend(words_from_bytes(&bytes));
        }
        all
    }

    #[test]
    fn test_block_validation() {
        let (device, pool) = setup();
        let mut rec = CommandRecorder::new(&device);
        assert!(matches!(rec.add_command_memory(&pool, 2, 0x100), Err(RecordError::MisalignedMemory(2))));
        assert!(matches!(
            rec.add_command_memory(&pool, 0, 0x102),
            Err(RecordError::MisalignedMemory(0x102))
        ));
        assert!(matches!(
            rec.add_command_memory(&pool, 0, 0x80),
            Err(RecordError::MemoryTooSmall { size: 0x80, .. })
        ));
        assert!(matches!(rec.add_control_memory(&pool, 4, 0x40), Err(RecordError::MisalignedMemory(4))));
        assert!(matches!(
            rec.add_control_memory(&pool, 0xFFC0, 0x80),
            Err(RecordError::Memory(MemoryPoolError::OutOfBounds { .. }))
        ));

        let gpu_only = MemoryPoolBuilder::new(&device)
            .set_size(0x1000)
            .set_flags(MemoryPoolFlags::CPU_NO_ACCESS | MemoryPoolFlags::GPU_CACHED)
            .build()
            .unwrap();
        assert!(matches!(
            rec.add_command_memory(&gpu_only, 0, 0x100),
            Err(RecordError::PoolNotAccessible)
        ));
        assert_eq!(pool.dependents(), 0);
    }

    #[test]
    fn test_contiguous_commands_share_a_segment() {
        let (device, pool) = setup();
        let mut rec = recorder(&device, &pool);
        rec.begin_recording().unwrap();
        rec.dispatch_compute(1, 1, 1).unwrap();
        rec.barrier(BarrierBits::ORDER_PRIMITIVES).unwrap();
        let handle = rec.end_recording().unwrap();

        let segs = segments(&device, handle);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].words, 5 + 2);
        assert_eq!(rec.command_memory_used(), 28);
        // One segment entry plus the end entry.
        assert_eq!(rec.control_memory_used(), 16);
        assert!(!rec.is_recording());
    }

    #[test]
    fn test_empty_recording_is_valid() {
        let (device, pool) = setup();
        let mut rec = recorder(&device, &pool);
        rec.begin_recording().unwrap();
        let handle = rec.end_recording().unwrap();
        assert!(segments(&device, handle).is_empty());

        rec.begin_recording().unwrap();
        rec.dispatch_compute(1, 1, 1).unwrap();
        let second = rec.end_recording().unwrap();
        assert_eq!(second.address(), handle.address() + 8);
    }

    #[test]
    fn test_state_errors() {
        let (device, pool) = setup();
        let mut rec = recorder(&device, &pool);
        assert!(matches!(rec.dispatch_compute(1, 1, 1), Err(RecordError::NotRecording)));
        assert!(matches!(rec.end_recording(), Err(RecordError::NotRecording)));
        rec.begin_recording().unwrap();
        assert!(matches!(rec.begin_recording(), Err(RecordError::AlreadyRecording)));
    }

    #[test]
    fn test_argument_validation() {
        let (device, pool) = setup();
        let mut rec = recorder(&device, &pool);
        rec.begin_recording().unwrap();
        assert!(matches!(rec.bind_texture(32, TextureHandle(1)), Err(RecordError::TextureSlotOutOfRange(32))));
        assert!(matches!(rec.dispatch_compute_indirect(0x1002), Err(RecordError::MisalignedAddress(0x1002))));
        assert!(matches!(
            rec.draw_arrays_indirect(DrawPrimitive::Triangles, 0x1001),
            Err(RecordError::MisalignedAddress(0x1001))
        ));
        assert!(matches!(rec.clear_buffer(0x1000, 6, 0), Err(RecordError::InvalidArgument(_))));
        assert!(matches!(rec.copy_buffer_to_buffer(0x1000, 0x2000, 0), Err(RecordError::InvalidArgument(_))));
        assert!(matches!(rec.report_counter(CounterType::Zero, 0x1008), Err(RecordError::MisalignedAddress(0x1008))));
        assert!(matches!(rec.call_commands(&[CommandHandle::from_address(0x1004)]), Err(RecordError::InvalidHandle(_))));
        // Rejected calls record nothing.
        assert_eq!(rec.command_memory_used(), 0);
        assert!(rec.end_recording().is_ok());
    }

    #[test]
    fn test_strict_mode_rejects_unmapped_addresses() {
        let settings = DeviceSettings {
            validation: ValidationLevel::Strict,
            ..DeviceSettings::default()
        };
        let (device, pool) = setup_with(settings);
        let base = pool.gpu_address().unwrap();
        let mut rec = recorder(&device, &pool);
        rec.begin_recording().unwrap();
        assert!(rec.copy_buffer_to_buffer(base, base + 0x100, 0x100).is_ok());
        assert!(matches!(
            rec.copy_buffer_to_buffer(base, 0xDEAD_0000, 0x100),
            Err(RecordError::UnmappedAddress(0xDEAD_0000))
        ));
        assert!(matches!(
            rec.call_commands(&[CommandHandle::from_address(0xDEAD_0000)]),
            Err(RecordError::InvalidHandle(0xDEAD_0000))
        ));
        // The recording survives rejected calls.
        assert!(rec.end_recording().is_ok());
    }

    #[test]
    fn test_callback_supplies_command_memory() {
        let (device, pool) = setup();
        let pool = Arc::new(pool);
        let calls = Arc::new(AtomicUsize::new(0));
        let mut rec = CommandRecorder::new(&device);
        rec.add_command_memory(&pool, 0, 0x100).unwrap();
        rec.add_control_memory(&pool, 0x8000, 0x1000).unwrap();
        {
            let pool = pool.clone();
            let calls = calls.clone();
            rec.set_memory_callback(Box::new(move |memory, event, min| {
                assert_eq!(event, MemoryEvent::OutOfCommandMemory);
                assert!(min >= MIN_COMMAND_SIZE);
                let n = calls.fetch_add(1, Ordering::SeqCst) as u64;
                memory.add_command_memory(&pool, 0x1000 * (n + 1), 0x100).unwrap();
            }));
        }

        rec.begin_recording().unwrap();
        // 5 words each: 12 fit in 0x100 bytes, the 13th needs a new block.
        for _ in 0..13 {
            rec.dispatch_compute(2, 1, 1).unwrap();
        }
        let handle = rec.end_recording().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let segs = segments(&device, handle);
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].words, 60);
        assert_eq!(segs[1].words, 5);
        assert_eq!(segs[1].address, pool.gpu_address().unwrap() + 0x1000);
    }

    #[test]
    fn test_callback_without_memory_aborts() {
        let (device, pool) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut rec = CommandRecorder::new(&device);
        rec.add_command_memory(&pool, 0, 0x100).unwrap();
        rec.add_control_memory(&pool, 0x8000, 0x1000).unwrap();
        {
            let calls = calls.clone();
            rec.set_memory_callback(Box::new(move |_, _, _| {
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }

        rec.begin_recording().unwrap();
        for _ in 0..12 {
            rec.dispatch_compute(1, 1, 1).unwrap();
        }
        assert!(matches!(rec.dispatch_compute(1, 1, 1), Err(RecordError::RecordingAborted)));
        assert!(matches!(rec.barrier(BarrierBits::empty()), Err(RecordError::RecordingAborted)));
        assert!(matches!(rec.end_recording(), Err(RecordError::RecordingAborted)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!rec.is_recording());

        // A fresh block makes the recorder usable again.
        rec.add_command_memory(&pool, 0x1000, 0x100).unwrap();
        rec.begin_recording().unwrap();
        rec.dispatch_compute(1, 1, 1).unwrap();
        assert!(rec.end_recording().is_ok());
    }

    #[test]
    fn test_control_block_switch_links_chain() {
        let (device, pool) = setup();
        let pool = Arc::new(pool);
        let mut rec = CommandRecorder::new(&device);
        rec.add_command_memory(&pool, 0, 0x1000).unwrap();
        rec.add_control_memory(&pool, 0x8000, 0x40).unwrap();
        {
            let pool = pool.clone();
            rec.set_memory_callback(Box::new(move |memory, event, _| {
                assert_eq!(event, MemoryEvent::OutOfControlMemory);
                memory.add_control_memory(&pool, 0x9000, 0x100).unwrap();
            }));
        }

        let first = {
            rec.begin_recording().unwrap();
            rec.dispatch_compute(1, 1, 1).unwrap();
            rec.end_recording().unwrap()
        };
        rec.begin_recording().unwrap();
        // 0x40 bytes hold 8 entries minus the link reserve; calls fill it.
        rec.call_commands(&[first; 10]).unwrap();
        let handle = rec.end_recording().unwrap();

        assert!(rec.control_memory_used() > 0);
        let segs = segments(&device, handle);
        assert_eq!(segs.len(), 10);
        assert!(segs.iter().all(|s| s.words == 5));
    }

    #[test]
    fn test_many_calls_keep_submission_order() {
        let (device, pool) = setup();
        let mut rec = CommandRecorder::new(&device);
        rec.add_command_memory(&pool, 0, 0x1000).unwrap();
        rec.add_control_memory(&pool, 0x8000, 0x4000).unwrap();

        let handles: Vec<CommandHandle> = (1..=3)
            .map(|x| {
                rec.begin_recording().unwrap();
                rec.dispatch_compute(x, 1, 1).unwrap();
                rec.end_recording().unwrap()
            })
            .collect();
        let calls: Vec<CommandHandle> = handles.iter().copied().cycle().take(900).collect();

        rec.begin_recording().unwrap();
        rec.call_commands(&calls).unwrap();
        let handle = rec.end_recording().unwrap();

        let words = segment_words(&device, handle);
        assert_eq!(words.len(), 900 * 5);
        for (i, dispatch) in words.chunks(5).enumerate() {
            assert_eq!(dispatch[1], i as u32 % 3 + 1);
        }
    }

    #[test]
    fn test_copy_commands_flattens_calls() {
        let (device, pool) = setup();
        let mut rec = recorder(&device, &pool);
        rec.begin_recording().unwrap();
        rec.dispatch_compute(3, 1, 1).unwrap();
        let inner = rec.end_recording().unwrap();

        rec.begin_recording().unwrap();
        rec.call_commands(&[inner]).unwrap();
        rec.barrier(BarrierBits::INVALIDATE_TEXTURE).unwrap();
        let outer = rec.end_recording().unwrap();

        rec.begin_recording().unwrap();
        rec.copy_commands(&[outer]).unwrap();
        let copied = rec.end_recording().unwrap();

        let segs = segments(&device, copied);
        assert_eq!(segs.len(), 1);
        assert_eq!(segment_words(&device, copied), segment_words(&device, outer));

        let words = segment_words(&device, copied);
        let header = CompressedMethod::new(words[0]);
        assert_eq!(header.subchannel(), SubChannel::Compute as u32);
        assert_eq!(words[1], 3);
    }

    #[test]
    fn test_foreign_pool_rejected() {
        let (device, pool) = setup();
        let (_, other_pool) = setup();
        let mut rec = CommandRecorder::new(&device);
        assert!(matches!(rec.add_command_memory(&other_pool, 0, 0x100), Err(RecordError::ForeignObject)));
        assert!(rec.add_command_memory(&pool, 0, 0x100).is_ok());
    }
}
