// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

mod config;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

use nvn_gpu::{
    BarrierBits, Buffer, CommandHandle, CommandRecorder, CounterType, Device, DeviceInfo, DrawPrimitive, Event,
    EventSignalLocation, EventSignalMode, FinalizeQueue, MemoryEvent, MemoryPool, MemoryPoolBuilder,
    MemoryPoolFlags, Queue, QueueBuilder, QueueErrorKind, Sampler, SamplerPool, Sync, SyncCondition, SyncFlags,
    SyncWaitResult, TextureBuilder, TexturePool, WAIT_TIMEOUT_MAXIMUM,
};

/// nvn - explicit GPU API on a software GPU
#[derive(Parser, Debug)]
#[command(name = "nvn", version, about = "Runs a smoke workload through the nvn-gpu pipeline")]
struct Args {
    /// Path to config file (default: $NVN_CONFIG or ~/.config/nvn/config.ini)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Number of frames to record and submit
    #[arg(short, long, default_value_t = 3)]
    iterations: u32,

    /// Also submit a bad handle to a second queue and report its fault
    #[arg(long)]
    fault_demo: bool,
}

// Work pool layout.
const WORK_POOL_SIZE: u64 = 0x4_0000;
const COMMAND_OFFSET: u64 = 0x0;
const COMMAND_SIZE: u64 = 0x1000;
const CONTROL_OFFSET: u64 = 0x1000;
const CONTROL_SIZE: u64 = 0x1000;
const TEXTURE_POOL_OFFSET: u64 = 0x4000;
const TEXTURE_POOL_COUNT: u32 = 512;
const SAMPLER_POOL_OFFSET: u64 = 0x8000;
const SAMPLER_POOL_COUNT: u32 = 264;
const SRC_OFFSET: u64 = 0xC000;
const DST_OFFSET: u64 = 0xD000;
const BUFFER_SIZE: u64 = 0x1000;
const REPORT_OFFSET: u64 = 0xE000;
const EVENT_OFFSET: u64 = 0xE100;
const TEXTURE_OFFSET: u64 = 0x1_0000;
/// Command blocks handed out by the recorder's memory callback.
const GROWTH_OFFSET: u64 = 0x2_0000;
const GROWTH_BLOCK: u64 = 0x1000;

const TEXTURE_ID: u32 = 256;
const SAMPLER_ID: u32 = 256;

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    info!("nvn - explicit GPU API on a software GPU");
    info!("=========================================");

    let settings = config::load_config(args.config.as_ref());
    let device = Device::new(settings);
    info!(
        "Page size 0x{:X}, descriptor size {}, reserved textures {}",
        device.get_integer(DeviceInfo::MemoryPoolPageSize),
        device.get_integer(DeviceInfo::TextureDescriptorSize),
        device.get_integer(DeviceInfo::ReservedTextureDescriptors)
    );

    run_workload(&device, args.iterations)?;

    if args.fault_demo {
        run_fault_demo(&device)?;
    }

    info!("Done");
    Ok(())
}

fn work_pool(device: &Device) -> Result<Arc<MemoryPool>> {
    let pool = MemoryPoolBuilder::new(device)
        .set_size(WORK_POOL_SIZE)
        .set_flags(MemoryPoolFlags::CPU_UNCACHED | MemoryPoolFlags::GPU_CACHED)
        .build()
        .context("Failed to create work pool")?;
    Ok(Arc::new(pool))
}

/// A recorder whose memory callback hands out further command blocks from
/// the growth region of `pool`.
fn recorder(device: &Device, pool: &Arc<MemoryPool>) -> Result<CommandRecorder> {
    let mut recorder = CommandRecorder::new(device);
    recorder
        .add_command_memory(pool, COMMAND_OFFSET, COMMAND_SIZE)
        .context("Failed to add command memory")?;
    recorder
        .add_control_memory(pool, CONTROL_OFFSET, CONTROL_SIZE)
        .context("Failed to add control memory")?;

    let pool = pool.clone();
    let mut next = GROWTH_OFFSET;
    recorder.set_memory_callback(Box::new(move |memory, event, min_size| {
        let size = min_size.max(GROWTH_BLOCK);
        let offset = next;
        next += size;
        if offset + size > pool.size() {
            log::warn!("Out of growth memory for {:?}", event);
            return;
        }
        let result = match event {
            MemoryEvent::OutOfCommandMemory => memory.add_command_memory(&pool, offset, size),
            MemoryEvent::OutOfControlMemory => memory.add_control_memory(&pool, offset, size),
        };
        match result {
            Ok(()) => log::debug!("Recorder grew by 0x{:X} bytes at 0x{:X}", size, offset),
            Err(e) => log::warn!("Failed to grow recorder: {}", e),
        }
    }));
    Ok(recorder)
}

fn run_workload(device: &Device, iterations: u32) -> Result<()> {
    let pool = work_pool(device)?;
    let base = pool.gpu_address().context("Work pool has no GPU address")?;
    let mut recorder = recorder(device, &pool)?;
    let mut queue = QueueBuilder::new(device).build().context("Failed to create queue")?;

    let textures = TexturePool::new(&pool, TEXTURE_POOL_OFFSET, TEXTURE_POOL_COUNT)?;
    let samplers = SamplerPool::new(&pool, SAMPLER_POOL_OFFSET, SAMPLER_POOL_COUNT)?;
    let texture = TextureBuilder::new()
        .set_size_2d(64, 64)
        .set_levels(4)
        .build(&pool, TEXTURE_OFFSET)?;
    textures.register_texture(TEXTURE_ID, &texture, None)?;
    samplers.register_sampler(SAMPLER_ID, &Sampler::default())?;
    let handle = device.texture_handle(TEXTURE_ID, SAMPLER_ID)?;

    let event = Event::new(&pool, EVENT_OFFSET)?;
    let mut sync = Sync::new(device);
    let mut finalize = FinalizeQueue::new(device.settings().finalize_age);

    for frame in 0..iterations {
        let pattern = 0xA5A5_0000 | frame;
        let src = Buffer::new(&pool, SRC_OFFSET, BUFFER_SIZE)?;
        let dst = Buffer::new(&pool, DST_OFFSET, BUFFER_SIZE)?;

        recorder.begin_recording()?;
        recorder.clear_buffer(src.address(), BUFFER_SIZE, pattern)?;
        recorder.barrier(BarrierBits::ORDER_PRIMITIVES)?;
        recorder.copy_buffer_to_buffer(src.address(), dst.address(), BUFFER_SIZE)?;
        recorder.set_texture_pool(&textures)?;
        recorder.set_sampler_pool(&samplers)?;
        recorder.bind_texture(0, handle)?;
        recorder.draw_arrays(DrawPrimitive::Triangles, 0, 3)?;
        recorder.dispatch_compute(8, 8, 1)?;
        recorder.report_counter(CounterType::Timestamp, base + REPORT_OFFSET)?;
        recorder.signal_event(&event, EventSignalMode::Add, 1, EventSignalLocation::Bottom)?;
        let commands: CommandHandle = recorder.end_recording()?;

        queue.submit_commands(&[commands]);
        sync.fence(&mut queue, SyncCondition::AllGpuCommandsComplete, SyncFlags::FLUSH_FOR_CPU)?;
        match sync.wait(WAIT_TIMEOUT_MAXIMUM) {
            SyncWaitResult::AlreadySignaled | SyncWaitResult::ConditionSatisfied => {}
            other => bail!("Frame {} fence wait failed: {:?}", frame, other),
        }

        let error = queue.get_error();
        if error.is_error() {
            bail!("Queue faulted in frame {}: {:?}", frame, error);
        }
        let map = pool.map().context("Work pool is not CPU mapped")?;
        let copied = map.read_u32(DST_OFFSET + BUFFER_SIZE - 4)?;
        if copied != pattern {
            bail!("Frame {}: copy produced 0x{:08X}, expected 0x{:08X}", frame, copied, pattern);
        }
        info!(
            "Frame {}: event={} timestamp={}ns recorder used 0x{:X}/0x{:X}",
            frame,
            event.get_value()?,
            u64::from(map.read_u32(REPORT_OFFSET + 8)?) | (u64::from(map.read_u32(REPORT_OFFSET + 12)?) << 32),
            recorder.command_memory_used(),
            recorder.control_memory_used()
        );

        // Views are released once the GPU is past the frame that used them.
        let serial = queue.submitted_serial();
        finalize.schedule(src, serial);
        finalize.schedule(dst, serial);
        finalize.sweep(queue.completed_serial());
    }

    queue.finish();
    for _ in 0..=device.settings().finalize_age {
        finalize.sweep(queue.completed_serial());
    }
    log_stats(&queue);
    Ok(())
}

fn log_stats(queue: &Queue) {
    let stats = queue.stats();
    info!(
        "Queue {}: {} segments, {} methods, {} draws ({} vertices), {} dispatches ({} workgroups)",
        queue.id(),
        stats.segments,
        stats.methods,
        stats.draws,
        stats.vertices,
        stats.dispatches,
        stats.workgroups
    );
    info!(
        "Queue {}: {} copies ({} bytes), {} fills ({} bytes), {} barriers, {} fences, {} reports",
        queue.id(),
        stats.copies,
        stats.bytes_copied,
        stats.fills,
        stats.bytes_filled,
        stats.barriers,
        stats.fences,
        stats.reports
    );
    for bound in queue.bound_textures() {
        info!(
            "Queue {}: slot {} -> texture {}x{} at 0x{:X}",
            queue.id(),
            bound.slot,
            bound.texture.width,
            bound.texture.height,
            bound.texture.address
        );
    }
}

/// Fault one queue with an unmapped command handle and show that another
/// queue on the same device keeps working.
fn run_fault_demo(device: &Device) -> Result<()> {
    info!("Fault demo: submitting an unmapped handle");
    let pool = work_pool(device)?;
    let mut recorder = recorder(device, &pool)?;
    let mut faulty = QueueBuilder::new(device).build()?;
    let mut healthy = QueueBuilder::new(device).build()?;

    let mut sync = Sync::new(device);
    faulty.submit_commands(&[CommandHandle::from_address(0xDEAD_0000)]);
    sync.fence(&mut faulty, SyncCondition::AllGpuCommandsComplete, SyncFlags::empty())?;
    let waited = sync.wait(WAIT_TIMEOUT_MAXIMUM);
    faulty.finish();

    let error = faulty.get_error();
    info!(
        "Faulted queue {}: {:?} at {:X?} ({:?}), pending sync {:?}",
        faulty.id(),
        error.kind,
        error.address,
        error.access,
        waited
    );
    if error.kind != QueueErrorKind::MmuFault {
        bail!("Expected an MMU fault, got {:?}", error.kind);
    }

    recorder.begin_recording()?;
    recorder.dispatch_compute(1, 1, 1)?;
    let work = recorder.end_recording()?;
    healthy.submit_commands(&[work]);
    healthy.finish();
    info!("Healthy queue {}: {:?}", healthy.id(), healthy.get_error().kind);
    Ok(())
}
