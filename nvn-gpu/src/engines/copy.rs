// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Copy engine: linear buffer copies and fills.
//!
//! Results are queued in L2 and become visible in memory when drained.

use super::{address_from, ClassId, Engine, ENGINE_REG_COUNT};
use crate::executor::{ExecContext, ExecError};
use crate::fault::{FaultAccess, QueueErrorInfo};

// ── Register constants (method addresses) ────────────────────────────────────

pub(crate) const SRC_ADDRESS_HIGH: u32 = 0x00;
pub(crate) const SRC_ADDRESS_LOW: u32 = 0x01;
pub(crate) const DST_ADDRESS_HIGH: u32 = 0x02;
pub(crate) const DST_ADDRESS_LOW: u32 = 0x03;
pub(crate) const SIZE_HIGH: u32 = 0x04;
pub(crate) const SIZE_LOW: u32 = 0x05;
/// Trigger: copy `size` bytes from src to dst.
pub(crate) const COPY: u32 = 0x06;
pub(crate) const FILL_VALUE: u32 = 0x07;
/// Trigger: fill `size` bytes at dst with the fill value.
pub(crate) const FILL: u32 = 0x08;

/// Largest host buffer used for one step of a copy or fill.
const CHUNK_SIZE: u64 = 0x1_0000;

pub struct CopyEngine {
    regs: Box<[u32; ENGINE_REG_COUNT]>,
}

impl CopyEngine {
    pub fn new() -> Self {
        Self {
            regs: Box::new([0u32; ENGINE_REG_COUNT]),
        }
    }

    // ── Typed accessors ──────────────────────────────────────────────────

    fn src_address(&self) -> u64 {
        address_from(self.regs[SRC_ADDRESS_HIGH as usize], self.regs[SRC_ADDRESS_LOW as usize])
    }

    fn dst_address(&self) -> u64 {
        address_from(self.regs[DST_ADDRESS_HIGH as usize], self.regs[DST_ADDRESS_LOW as usize])
    }

    fn size(&self) -> u64 {
        address_from(self.regs[SIZE_HIGH as usize], self.regs[SIZE_LOW as usize])
    }

    // ── Trigger handlers ─────────────────────────────────────────────────

    fn handle_copy(&mut self, ctx: &mut ExecContext<'_>) -> Result<(), ExecError> {
        let (src, dst, size) = (self.src_address(), self.dst_address(), self.size());
        log::trace!("CopyEngine: copy 0x{:X} -> 0x{:X} (0x{:X} bytes)", src, dst, size);
        if size > 0 {
            ctx.check_range(src, size, FaultAccess::Read)?;
            ctx.check_range(dst, size, FaultAccess::Write)?;
        }
        let mut done = 0;
        while done < size {
            let len = (size - done).min(CHUNK_SIZE);
            let mut data = vec![0u8; len as usize];
            ctx.read(src + done, &mut data)?;
            ctx.write(dst + done, data)?;
            done += len;
        }
        let stats = ctx.stats();
        stats.copies += 1;
        stats.bytes_copied = stats.bytes_copied.saturating_add(size);
        Ok(())
    }

    fn handle_fill(&mut self, ctx: &mut ExecContext<'_>) -> Result<(), ExecError> {
        let (dst, size) = (self.dst_address(), self.size());
        if size % 4 != 0 {
            log::error!("CopyEngine: fill size 0x{:X} is not word aligned", size);
            return Err(QueueErrorInfo::engine(None).into());
        }
        log::trace!("CopyEngine: fill 0x{:X} (0x{:X} bytes)", dst, size);
        if size > 0 {
            ctx.check_range(dst, size, FaultAccess::Write)?;
        }
        let pattern = self.regs[FILL_VALUE as usize].to_le_bytes();
        let mut done = 0;
        while done < size {
            let len = (size - done).min(CHUNK_SIZE);
            let data: Vec<u8> = pattern.iter().copied().cycle().take(len as usize).collect();
            ctx.write(dst + done, data)?;
            done += len;
        }
        let stats = ctx.stats();
        stats.fills += 1;
        stats.bytes_filled = stats.bytes_filled.saturating_add(size);
        Ok(())
    }
}

impl Default for CopyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for CopyEngine {
    fn class_id(&self) -> ClassId {
        ClassId::Copy
    }

    fn write_reg(&mut self, method: u32, value: u32, ctx: &mut ExecContext<'_>) -> Result<(), ExecError> {
        let idx = method as usize;
        if idx > FILL as usize {
            log::error!("CopyEngine: unknown method 0x{:X}", method);
            return Err(QueueErrorInfo::engine(None).into());
        }
        self.regs[idx] = value;

        match method {
            COPY => self.handle_copy(ctx),
            FILL => self.handle_fill(ctx),
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
    use nvn_common::settings::DeviceSettings;

    fn program(engine: &mut CopyEngine, ctx: &mut ExecContext<'_>, regs: &[(u32, u32)]) -> Result<(), ExecError> {
        regs.iter().try_for_each(|&(m, v)| engine.write_reg(m, v, ctx))
    }

    fn copy_regs(src: u64, dst: u64, size: u64) -> Vec<(u32, u32)> {
        let [sh, sl] = split_address(src);
        let [dh, dl] = split_address(dst);
        let [zh, zl] = split_address(size);
        vec![
            (SRC_ADDRESS_HIGH, sh),
            (SRC_ADDRESS_LOW, sl),
            (DST_ADDRESS_HIGH, dh),
            (DST_ADDRESS_LOW, dl),
            (SIZE_HIGH, zh),
            (SIZE_LOW, zl),
            (COPY, 0),
        ]
    }

    #[test]
    fn test_copy_visible_after_drain() {
        let device = Device::new(DeviceSettings::default());
        let va = map_scratch(&device, 0x2000);
        device.shared.memory.write().gpu_write(va, &[9, 8, 7, 6]).unwrap();

        with_context(&device, |ctx| {
            let mut engine = CopyEngine::new();
            program(&mut engine, ctx, &copy_regs(va, va + 0x1000, 4)).unwrap();
            assert_eq!(ctx.read_u32(va + 0x1000).unwrap(), 0);
            ctx.drain_writes();
            assert_eq!(ctx.read_u32(va + 0x1000).unwrap(), 0x0607_0809);
            assert_eq!(ctx.state.stats.bytes_copied, 4);
        });
    }

    #[test]
    fn test_fill_pattern() {
        let device = Device::new(DeviceSettings::default());
        let va = map_scratch(&device, 0x1000);
        with_context(&device, |ctx| {
            let mut engine = CopyEngine::new();
            let [dh, dl] = split_address(va + 8);
            program(
                &mut engine,
                ctx,
                &[(DST_ADDRESS_HIGH, dh), (DST_ADDRESS_LOW, dl), (SIZE_HIGH, 0), (SIZE_LOW, 8), (FILL_VALUE, 0xABCD_0123), (FILL, 0)],
            )
            .unwrap();
            ctx.drain_writes();
            assert_eq!(ctx.read_u32(va + 8).unwrap(), 0xABCD_0123);
            assert_eq!(ctx.read_u32(va + 12).unwrap(), 0xABCD_0123);
            assert_eq!(ctx.read_u32(va + 16).unwrap(), 0);
        });
    }

    #[test]
    fn test_copy_from_unmapped_faults() {
        let device = Device::new(DeviceSettings::default());
        let va = map_scratch(&device, 0x1000);
        let err = with_context(&device, |ctx| {
            let mut engine = CopyEngine::new();
            program(&mut engine, ctx, &copy_regs(0xDEAD_0000, va, 16))
        })
        .unwrap_err();
        assert_eq!(err, ExecError::Fault(QueueErrorInfo::mmu(0xDEAD_0000, FaultAccess::Read)));
    }

    #[test]
    fn test_oversized_copy_faults_before_allocating() {
        let device = Device::new(DeviceSettings::default());
        let va = map_scratch(&device, 0x1_0000);
        let err = with_context(&device, |ctx| {
            let mut engine = CopyEngine::new();
            program(&mut engine, ctx, &copy_regs(va, va + 0x8000, 1 << 44))
        })
        .unwrap_err();
        assert_eq!(err, ExecError::Fault(QueueErrorInfo::mmu(va + 0x1_0000, FaultAccess::Read)));
    }

    #[test]
    fn test_copy_wrapping_address_space_faults() {
        let device = Device::new(DeviceSettings::default());
        let va = map_scratch(&device, 0x1000);
        let err = with_context(&device, |ctx| {
            let mut engine = CopyEngine::new();
            program(&mut engine, ctx, &copy_regs(va, va, u64::MAX))
        })
        .unwrap_err();
        assert_eq!(err, ExecError::Fault(QueueErrorInfo::mmu(va + 0x1000, FaultAccess::Read)));
    }

    #[test]
    fn test_copy_spans_several_chunks() {
        let device = Device::new(DeviceSettings::default());
        let len = CHUNK_SIZE * 2 + 0x1000;
        let va = map_scratch(&device, len * 2);
        let src: Vec<u8> = (0..len).map(|i| (i / 0x1000) as u8).collect();
        device.shared.memory.write().gpu_write(va, &src).unwrap();

        with_context(&device, |ctx| {
            let mut engine = CopyEngine::new();
            program(&mut engine, ctx, &copy_regs(va, va + len, len)).unwrap();
            ctx.drain_writes();
            let mut out = vec![0u8; len as usize];
            ctx.read(va + len, &mut out).unwrap();
            assert_eq!(out, src);
            assert_eq!(ctx.state.stats.bytes_copied, len);
        });
    }

    #[test]
    fn test_fill_into_unmapped_tail_faults() {
        let device = Device::new(DeviceSettings::default());
        let va = map_scratch(&device, 0x1000);
        let err = with_context(&device, |ctx| {
            let mut engine = CopyEngine::new();
            let [dh, dl] = split_address(va);
            let [zh, zl] = split_address(0x4000_0000_0000);
            program(
                &mut engine,
                ctx,
                &[(DST_ADDRESS_HIGH, dh), (DST_ADDRESS_LOW, dl), (SIZE_HIGH, zh), (SIZE_LOW, zl), (FILL, 0)],
            )
        })
        .unwrap_err();
        assert_eq!(err, ExecError::Fault(QueueErrorInfo::mmu(va + 0x1000, FaultAccess::Write)));
    }

    #[test]
    fn test_unknown_method_faults() {
        let device = Device::new(DeviceSettings::default());
        let err = with_context(&device, |ctx| CopyEngine::new().write_reg(0x20, 0, ctx)).unwrap_err();
        assert_eq!(err, ExecError::Fault(QueueErrorInfo::engine(None)));
    }
}
