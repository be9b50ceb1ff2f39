// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GPU engine trait and subchannel definitions.
//!
//! Each engine owns one subchannel of the command stream. Method writes
//! latch into the engine's registers; writes to a trigger register execute
//! an operation against the execution context.

pub mod compute;
pub mod copy;
pub mod host;
pub mod threed;

use crate::executor::{ExecContext, ExecError};

/// Engine class IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ClassId {
    Threed = 0xB197,
    Compute = 0xB1C0,
    Copy = 0xB0B5,
    Host = 0xB06F,
}

/// Subchannel assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubChannel {
    Threed = 0,
    Compute = 1,
    Copy = 2,
    Host = 3,
}

impl SubChannel {
    pub fn from_raw(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Threed),
            1 => Some(Self::Compute),
            2 => Some(Self::Copy),
            3 => Some(Self::Host),
            _ => None,
        }
    }
}

/// Number of subchannels addressable by a method header.
pub const NUM_SUBCHANNELS: usize = 8;

/// Number of registers per engine.
pub const ENGINE_REG_COUNT: usize = 0x40;

/// A GPU engine that accepts method writes.
pub trait Engine: Send {
    fn class_id(&self) -> ClassId;

    /// Write a value to a method register, running the operation if the
    /// register is a trigger.
    fn write_reg(&mut self, method: u32, value: u32, ctx: &mut ExecContext<'_>) -> Result<(), ExecError>;
}

/// Combine a high/low register pair into a 64-bit address.
pub(crate) fn address_from(high: u32, low: u32) -> u64 {
    ((high as u64) << 32) | low as u64
}

/// Split a 64-bit value into the (high, low) register pair.
pub(crate) fn split_address(address: u64) -> [u32; 2] {
    [(address >> 32) as u32, address as u32]
}

/// The engines of one queue, indexed by subchannel.
pub(crate) fn default_engines() -> Vec<Option<Box<dyn Engine>>> {
    let mut engines: Vec<Option<Box<dyn Engine>>> = Vec::with_capacity(NUM_SUBCHANNELS);
    engines.push(Some(Box::new(threed::Threed::new())));
    engines.push(Some(Box::new(compute::Compute::new())));
    engines.push(Some(Box::new(copy::CopyEngine::new())));
    engines.push(Some(Box::new(host::Host::new())));
    engines.resize_with(NUM_SUBCHANNELS, || None);
    engines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subchannel_from_raw() {
        assert_eq!(SubChannel::from_raw(0), Some(SubChannel::Threed));
        assert_eq!(SubChannel::from_raw(3), Some(SubChannel::Host));
        assert_eq!(SubChannel::from_raw(4), None);
    }

    #[test]
    fn test_engines_match_subchannels() {
        let engines = default_engines();
        assert_eq!(engines.len(), NUM_SUBCHANNELS);
        let classes: Vec<_> = engines.iter().flatten().map(|e| e.class_id()).collect();
        assert_eq!(classes, vec![ClassId::Threed, ClassId::Compute, ClassId::Copy, ClassId::Host]);
    }

    #[test]
    fn test_address_split_round_trip() {
        let [hi, lo] = split_address(0xAB_1234_5678);
        assert_eq!((hi, lo), (0xAB, 0x1234_5678));
        assert_eq!(address_from(hi, lo), 0xAB_1234_5678);
    }
}
