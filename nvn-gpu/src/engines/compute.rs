// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Compute engine.
//!
//! No shaders run on the software GPU; a dispatch is counted and a launch
//! record `{groups_x, groups_y, groups_z, serial}` is written to the queue's
//! compute ring.

use byteorder::{ByteOrder, LittleEndian};

use super::{address_from, ClassId, Engine, ENGINE_REG_COUNT};
use crate::executor::{ExecContext, ExecError};
use crate::fault::QueueErrorInfo;

// ── Register constants (method addresses) ────────────────────────────────────

pub(crate) const GROUPS_X: u32 = 0x00;
pub(crate) const GROUPS_Y: u32 = 0x01;
pub(crate) const GROUPS_Z: u32 = 0x02;
/// Trigger: dispatch with the latched group counts.
pub(crate) const DISPATCH: u32 = 0x03;
pub(crate) const INDIRECT_ADDRESS_HIGH: u32 = 0x04;
pub(crate) const INDIRECT_ADDRESS_LOW: u32 = 0x05;
/// Trigger: dispatch with `{x, y, z}` read from the indirect address.
pub(crate) const DISPATCH_INDIRECT: u32 = 0x06;

const LAUNCH_RECORD_SIZE: u64 = 16;

pub struct Compute {
    regs: Box<[u32; ENGINE_REG_COUNT]>,
}

impl Compute {
    pub fn new() -> Self {
        Self {
            regs: Box::new([0u32; ENGINE_REG_COUNT]),
        }
    }

    fn indirect_address(&self) -> u64 {
        address_from(
            self.regs[INDIRECT_ADDRESS_HIGH as usize],
            self.regs[INDIRECT_ADDRESS_LOW as usize],
        )
    }

    fn launch(&mut self, ctx: &mut ExecContext<'_>, groups: [u32; 3]) -> Result<(), ExecError> {
        log::trace!("Compute: dispatch {:?}", groups);
        let serial = ctx.env.serial;
        if let Some(ring) = ctx.state.compute_ring.as_mut() {
            if ring.cursor + LAUNCH_RECORD_SIZE > ring.size {
                ring.cursor = 0;
            }
            let va = ring.base + ring.cursor;
            ring.cursor += LAUNCH_RECORD_SIZE;
            let mut record = vec![0u8; LAUNCH_RECORD_SIZE as usize];
            LittleEndian::write_u32_into(&[groups[0], groups[1], groups[2], serial as u32], &mut record);
            ctx.write(va, record)?;
        }
        let stats = ctx.stats();
        stats.dispatches += 1;
        let total = groups.iter().fold(1u64, |acc, &g| acc.saturating_mul(g as u64));
        stats.workgroups = stats.workgroups.saturating_add(total);
        Ok(())
    }

    fn handle_dispatch(&mut self, ctx: &mut ExecContext<'_>) -> Result<(), ExecError> {
        let groups = [
            self.regs[GROUPS_X as usize],
            self.regs[GROUPS_Y as usize],
            self.regs[GROUPS_Z as usize],
        ];
        self.launch(ctx, groups)
    }

    fn handle_dispatch_indirect(&mut self, ctx: &mut ExecContext<'_>) -> Result<(), ExecError> {
        let address = self.indirect_address();
        let mut raw = [0u8; 12];
        ctx.read(address, &mut raw)?;
        let mut groups = [0u32; 3];
        LittleEndian::read_u32_into(&raw, &mut groups);
        self.launch(ctx, groups)
    }
}

impl Default for Compute {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for Compute {
    fn class_id(&self) -> ClassId {
        ClassId::Compute
    }

    fn write_reg(&mut self, method: u32, value: u32, ctx: &mut ExecContext<'_>) -> Result<(), ExecError> {
        let idx = method as usize;
        if idx > DISPATCH_INDIRECT as usize {
            log::error!("Compute: unknown method 0x{:X}", method);
            return Err(QueueErrorInfo::engine(None).into());
        }
        self.regs[idx] = value;

        match method {
            DISPATCH => self.handle_dispatch(ctx),
            DISPATCH_INDIRECT => self.handle_dispatch_indirect(ctx),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::engines::split_address;
    use crate::executor::tests::{map_scratch, with_context};
    use crate::executor::ComputeRing;
    use nvn_common::settings::DeviceSettings;

    #[test]
    fn test_dispatch_counts_workgroups() {
        let device = Device::new(DeviceSettings::default());
        with_context(&device, |ctx| {
            let mut engine = Compute::new();
            for (m, v) in [(GROUPS_X, 4), (GROUPS_Y, 2), (GROUPS_Z, 3), (DISPATCH, 0)] {
                engine.write_reg(m, v, ctx).unwrap();
            }
            assert_eq!(ctx.state.stats.dispatches, 1);
            assert_eq!(ctx.state.stats.workgroups, 24);
        });
    }

    #[test]
    fn test_huge_dispatch_saturates_stats() {
        let device = Device::new(DeviceSettings::default());
        with_context(&device, |ctx| {
            let mut engine = Compute::new();
            for (m, v) in [(GROUPS_X, u32::MAX), (GROUPS_Y, u32::MAX), (GROUPS_Z, 2), (DISPATCH, 0), (DISPATCH, 0)] {
                engine.write_reg(m, v, ctx).unwrap();
            }
            assert_eq!(ctx.state.stats.dispatches, 2);
            assert_eq!(ctx.state.stats.workgroups, u64::MAX);
        });
    }

    #[test]
    fn test_indirect_dispatch_reads_record() {
        let device = Device::new(DeviceSettings::default());
        let va = map_scratch(&device, 0x1000);
        let record: Vec<u8> = [5u32, 1, 2].iter().flat_map(|v| v.to_le_bytes()).collect();
        device.shared.memory.write().gpu_write(va, &record).unwrap();

        with_context(&device, |ctx| {
            let mut engine = Compute::new();
            let [hi, lo] = split_address(va);
            for (m, v) in [(INDIRECT_ADDRESS_HIGH, hi), (INDIRECT_ADDRESS_LOW, lo), (DISPATCH_INDIRECT, 0)] {
                engine.write_reg(m, v, ctx).unwrap();
            }
            assert_eq!(ctx.state.stats.workgroups, 10);
        });
    }

    #[test]
    fn test_launch_records_wrap_in_ring() {
        let device = Device::new(DeviceSettings::default());
        let va = map_scratch(&device, 0x1000);
        with_context(&device, |ctx| {
            ctx.state.compute_ring = Some(ComputeRing {
                base: va,
                size: 32,
                cursor: 0,
            });
            let mut engine = Compute::new();
            engine.write_reg(GROUPS_X, 7, ctx).unwrap();
            for _ in 0..3 {
                engine.write_reg(DISPATCH, 0, ctx).unwrap();
            }
            ctx.drain_writes();
            assert_eq!(ctx.read_u32(va).unwrap(), 7);
            assert_eq!(ctx.state.compute_ring.map(|r| r.cursor), Some(16));
        });
    }
}
