// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host engine: barriers, fences, semaphores (events) and counter reports.

use byteorder::{ByteOrder, LittleEndian};

use super::{address_from, ClassId, Engine, ENGINE_REG_COUNT};
use crate::barrier::BarrierBits;
use crate::event::{EventSignalLocation, EventSignalMode, EventWaitMode};
use crate::executor::{ExecContext, ExecError};
use crate::fault::QueueErrorInfo;
use crate::sync::SyncFlags;

// ── Register constants (method addresses) ────────────────────────────────────

/// Trigger; the value is a [`BarrierBits`] set.
pub(crate) const BARRIER: u32 = 0x00;
pub(crate) const SYNC_ID: u32 = 0x01;
pub(crate) const SYNC_CONDITION: u32 = 0x02;
/// Trigger; the value is a [`SyncFlags`] set.
pub(crate) const FENCE: u32 = 0x03;
/// Trigger; the value is the sync ID to wait for.
pub(crate) const WAIT_SYNC: u32 = 0x04;
pub(crate) const EVENT_ADDRESS_HIGH: u32 = 0x05;
pub(crate) const EVENT_ADDRESS_LOW: u32 = 0x06;
pub(crate) const EVENT_VALUE: u32 = 0x07;
/// Trigger; the value is `mode | location << 8`.
pub(crate) const EVENT_SIGNAL: u32 = 0x08;
/// Trigger; the value is the wait mode.
pub(crate) const EVENT_WAIT: u32 = 0x09;
pub(crate) const REPORT_ADDRESS_HIGH: u32 = 0x0A;
pub(crate) const REPORT_ADDRESS_LOW: u32 = 0x0B;
/// Trigger; the value is the [`CounterType`].
pub(crate) const REPORT: u32 = 0x0C;

/// Counter written by a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CounterType {
    /// GPU time in nanoseconds.
    Timestamp = 0,
    Zero = 1,
    /// Draws executed so far on this queue.
    DrawCalls = 2,
    /// Compute dispatches executed so far on this queue.
    Dispatches = 3,
}

impl CounterType {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Timestamp),
            1 => Some(Self::Zero),
            2 => Some(Self::DrawCalls),
            3 => Some(Self::Dispatches),
            _ => None,
        }
    }
}

/// Encode `mode` and `location` as an [`EVENT_SIGNAL`] argument.
pub(crate) fn event_signal_arg(mode: EventSignalMode, location: EventSignalLocation) -> u32 {
    mode as u32 | (location as u32) << 8
}

pub struct Host {
    regs: Box<[u32; ENGINE_REG_COUNT]>,
}

impl Host {
    pub fn new() -> Self {
        Self {
            regs: Box::new([0u32; ENGINE_REG_COUNT]),
        }
    }

    fn event_address(&self) -> u64 {
        address_from(self.regs[EVENT_ADDRESS_HIGH as usize], self.regs[EVENT_ADDRESS_LOW as usize])
    }

    fn report_address(&self) -> u64 {
        address_from(self.regs[REPORT_ADDRESS_HIGH as usize], self.regs[REPORT_ADDRESS_LOW as usize])
    }

    // ── Trigger handlers ─────────────────────────────────────────────────

    fn handle_barrier(&mut self, bits: u32, ctx: &mut ExecContext<'_>) {
        let bits = BarrierBits::from_bits_truncate(bits);
        log::trace!("Host: barrier {:?}", bits);
        if bits.drains_writes() {
            ctx.drain_writes();
        }
        if bits.contains(BarrierBits::INVALIDATE_TEXTURE_DESCRIPTOR) {
            ctx.state.texture_table.invalidate();
            ctx.state.sampler_table.invalidate();
            ctx.stats().descriptor_invalidations += 1;
        }
        ctx.stats().barriers += 1;
    }

    fn handle_fence(&mut self, flags: u32, ctx: &mut ExecContext<'_>) {
        let id = self.regs[SYNC_ID as usize];
        if SyncFlags::from_bits_truncate(flags).contains(SyncFlags::FLUSH_FOR_CPU) {
            ctx.drain_writes();
        }
        match ctx.lookup_sync(id) {
            Some(sync) => {
                sync.signal();
                ctx.env.shared.bump_epoch();
                log::trace!("Host: fence {} signaled", id);
            }
            // The sync object was destroyed before the GPU reached it.
            None => log::debug!("Host: fence {} has no live sync", id),
        }
        ctx.stats().fences += 1;
    }

    fn handle_wait_sync(&mut self, id: u32, ctx: &mut ExecContext<'_>) -> Result<(), ExecError> {
        ctx.wait_until(None, |ctx| Ok(ctx.lookup_sync(id).map_or(true, |s| s.is_signaled())))?;
        ctx.stats().sync_waits += 1;
        Ok(())
    }

    fn handle_event_signal(&mut self, arg: u32, ctx: &mut ExecContext<'_>) -> Result<(), ExecError> {
        let (Some(mode), Some(location)) = (
            EventSignalMode::from_raw(arg & 0xFF),
            EventSignalLocation::from_raw(arg >> 8),
        ) else {
            log::error!("Host: bad event signal argument 0x{:X}", arg);
            return Err(QueueErrorInfo::engine(None).into());
        };
        let address = self.event_address();
        if location == EventSignalLocation::Bottom {
            ctx.drain_writes();
        }
        let current = ctx.read_u32(address)?;
        let next = mode.apply(current, self.regs[EVENT_VALUE as usize]);
        ctx.write_through(address, &next.to_le_bytes())?;
        log::trace!("Host: event 0x{:X} {:?} -> {}", address, mode, next);
        ctx.stats().events_signaled += 1;
        Ok(())
    }

    fn handle_event_wait(&mut self, raw_mode: u32, ctx: &mut ExecContext<'_>) -> Result<(), ExecError> {
        let Some(mode) = EventWaitMode::from_raw(raw_mode) else {
            log::error!("Host: bad event wait mode {}", raw_mode);
            return Err(QueueErrorInfo::engine(None).into());
        };
        let address = self.event_address();
        let target = self.regs[EVENT_VALUE as usize];
        log::trace!("Host: wait on event 0x{:X} {:?} {}", address, mode, target);
        ctx.wait_until(Some(address), |ctx| Ok(mode.passes(ctx.read_u32(address)?, target)))?;
        ctx.stats().event_waits += 1;
        Ok(())
    }

    fn handle_report(&mut self, raw_counter: u32, ctx: &mut ExecContext<'_>) -> Result<(), ExecError> {
        let Some(counter) = CounterType::from_raw(raw_counter) else {
            log::error!("Host: bad counter type {}", raw_counter);
            return Err(QueueErrorInfo::engine(None).into());
        };
        let timestamp = ctx.timestamp_ns();
        let value = match counter {
            CounterType::Timestamp => timestamp,
            CounterType::Zero => 0,
            CounterType::DrawCalls => ctx.state.stats.draws,
            CounterType::Dispatches => ctx.state.stats.dispatches,
        };
        let mut record = [0u8; 16];
        LittleEndian::write_u64_into(&[value, timestamp], &mut record);
        ctx.write_through(self.report_address(), &record)?;
        ctx.stats().reports += 1;
        Ok(())
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for Host {
    fn class_id(&self) -> ClassId {
        ClassId::Host
    }

    fn write_reg(&mut self, method: u32, value: u32, ctx: &mut ExecContext<'_>) -> Result<(), ExecError> {
        if method > REPORT {
            log::error!("Host: unknown method 0x{:X}", method);
            return Err(QueueErrorInfo::engine(None).into());
        }
        self.regs[method as usize] = value;

        match method {
            BARRIER => {
                self.handle_barrier(value, ctx);
                Ok(())
            }
            FENCE => {
                self.handle_fence(value, ctx);
                Ok(())
            }
            WAIT_SYNC => self.handle_wait_sync(value, ctx),
            EVENT_SIGNAL => self.handle_event_signal(value, ctx),
            EVENT_WAIT => self.handle_event_wait(value, ctx),
            REPORT => self.handle_report(value, ctx),
            _ => Ok(()),
        }
    }
}
