// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Asynchronous GPU fault reporting.

use std::fmt;

use nvn_common::GpuVAddr;

/// Fault classes a queue can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueErrorKind {
    NoError,
    Unknown,
    /// Access to an unmapped GPU virtual address.
    MmuFault,
    /// Malformed control or command stream.
    PbdmaException,
    /// An engine rejected a method or its arguments.
    EngineException,
    /// A GPU-side wait exceeded the device timeout.
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultAccess {
    Read,
    Write,
}

/// Status of a queue as returned by `Queue::get_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueErrorInfo {
    pub kind: QueueErrorKind,
    pub address: Option<GpuVAddr>,
    pub access: Option<FaultAccess>,
}

impl QueueErrorInfo {
    pub const NONE: Self = Self {
        kind: QueueErrorKind::NoError,
        address: None,
        access: None,
    };

    pub fn is_error(&self) -> bool {
        self.kind != QueueErrorKind::NoError
    }

    pub(crate) fn mmu(address: GpuVAddr, access: FaultAccess) -> Self {
        Self {
            kind: QueueErrorKind::MmuFault,
            address: Some(address),
            access: Some(access),
        }
    }

    pub(crate) fn pbdma(address: Option<GpuVAddr>) -> Self {
        Self {
            kind: QueueErrorKind::PbdmaException,
            address,
            access: None,
        }
    }

    pub(crate) fn engine(address: Option<GpuVAddr>) -> Self {
        Self {
            kind: QueueErrorKind::EngineException,
            address,
            access: None,
        }
    }

    pub(crate) fn timeout(address: Option<GpuVAddr>) -> Self {
        Self {
            kind: QueueErrorKind::Timeout,
            address,
            access: None,
        }
    }
}

impl Default for QueueErrorInfo {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for QueueErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(address) = self.address {
            write!(f, " at 0x{:010X}", address)?;
        }
        if let Some(access) = self.access {
            write!(f, " ({:?})", access)?;
        }
        Ok(())
    }
}
