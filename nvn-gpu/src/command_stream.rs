// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command stream format.
//!
//! Recorded work lives in two regions. Command memory holds method words;
//! control memory holds 64-bit control entries that stitch command segments
//! together. A command handle is the GPU VA of the first control entry.
//!
//! ## Control entry (64 bits)
//!
//! | Bits    | Field                          |
//! |---------|--------------------------------|
//! | 1:0     | Kind: segment, link, call, end |
//! | 39:2    | Address >> 2                   |
//! | 41:40   | Unused                         |
//! | 62:42   | Length (in words, segment only)|
//!
//! A link continues the walk at its address, a call walks the handle at its
//! address and returns, an end finishes the current level.
//!
//! ## Compressed method header (32 bits)
//!
//! | Bits    | Field                    |
//! |---------|--------------------------|
//! | 12:0    | Method address           |
//! | 15:13   | Subchannel               |
//! | 28:16   | Method count / immediate |
//! | 31:29   | SecOp                    |

use thiserror::Error;

use nvn_common::GpuVAddr;

use crate::engines::SubChannel;

/// Size of one control entry in bytes.
pub const CONTROL_ENTRY_SIZE: u64 = 8;

/// Maximum nesting of call entries.
pub const MAX_CALL_DEPTH: usize = 8;

/// Maximum number of control entries walked for one handle.
pub const MAX_CONTROL_ENTRIES: usize = 1 << 16;

/// Longest segment a single entry can describe.
pub const MAX_SEGMENT_WORDS: u32 = 0x1F_FFFF;

const MAX_METHOD_COUNT: usize = 0x1FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EntryKind {
    Segment = 0,
    Link = 1,
    Call = 2,
    End = 3,
}

/// A 64-bit control entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpEntry {
    pub entry0: u32,
    pub entry1: u32,
}

impl GpEntry {
    fn new(kind: EntryKind, address: GpuVAddr, length: u32) -> Self {
        Self {
            entry0: (address as u32 & !0x3) | kind as u32,
            entry1: ((address >> 32) as u32 & 0xFF) | ((length & MAX_SEGMENT_WORDS) << 10),
        }
    }

    pub fn segment(address: GpuVAddr, words: u32) -> Self {
        Self::new(EntryKind::Segment, address, words)
    }

    pub fn link(address: GpuVAddr) -> Self {
        Self::new(EntryKind::Link, address, 0)
    }

    pub fn call(address: GpuVAddr) -> Self {
        Self::new(EntryKind::Call, address, 0)
    }

    pub fn end() -> Self {
        Self::new(EntryKind::End, 0, 0)
    }

    pub fn kind(&self) -> EntryKind {
        match self.entry0 & 0x3 {
            0 => EntryKind::Segment,
            1 => EntryKind::Link,
            2 => EntryKind::Call,
            _ => EntryKind::End,
        }
    }

    /// GPU virtual address (byte-aligned).
    pub fn address(&self) -> GpuVAddr {
        let lo = (self.entry0 & !0x3) as u64;
        let hi = (self.entry1 as u64 & 0xFF) << 32;
        hi | lo
    }

    /// Segment length in 32-bit words.
    pub fn length(&self) -> u32 {
        (self.entry1 >> 10) & MAX_SEGMENT_WORDS
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let mut raw = [0u8; 8];
        raw[..4].copy_from_slice(&self.entry0.to_le_bytes());
        raw[4..].copy_from_slice(&self.entry1.to_le_bytes());
        raw
    }

    pub fn from_bytes(raw: [u8; 8]) -> Self {
        Self {
            entry0: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            entry1: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        }
    }
}

/// Secondary operation type from compressed method header bits [31:29].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SecOp {
    Grp0UseTert = 0,
    IncMethod = 1,
    Grp2UseTert = 2,
    NonIncMethod = 3,
    ImmdDataMethod = 4,
    OneInc = 5,
    Reserved6 = 6,
    EndPbSegment = 7,
}

impl SecOp {
    fn from_raw(v: u32) -> Self {
        match v & 0x7 {
            0 => Self::Grp0UseTert,
            1 => Self::IncMethod,
            2 => Self::Grp2UseTert,
            3 => Self::NonIncMethod,
            4 => Self::ImmdDataMethod,
            5 => Self::OneInc,
            6 => Self::Reserved6,
            _ => Self::EndPbSegment,
        }
    }
}

/// A parsed compressed method header.
#[derive(Debug, Clone, Copy)]
pub struct CompressedMethod(u32);

impl CompressedMethod {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn encode(sec_op: SecOp, subchannel: SubChannel, method: u32, count: u32) -> Self {
        Self(
            ((sec_op as u32) << 29)
                | ((count & 0x1FFF) << 16)
                | ((subchannel as u32 & 0x7) << 13)
                | (method & 0x1FFF),
        )
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn method_address(&self) -> u32 {
        self.0 & 0x1FFF
    }

    pub fn subchannel(&self) -> u32 {
        (self.0 >> 13) & 0x7
    }

    /// Method count for IncMethod, NonIncMethod and OneInc.
    pub fn method_count(&self) -> u32 {
        (self.0 >> 16) & 0x1FFF
    }

    pub fn immd_data(&self) -> u32 {
        (self.0 >> 16) & 0x1FFF
    }

    pub fn sec_op(&self) -> SecOp {
        SecOp::from_raw(self.0 >> 29)
    }
}

/// Append an incrementing method write of `data` starting at `method`.
pub fn push_inc_method(out: &mut Vec<u32>, subchannel: SubChannel, method: u32, data: &[u32]) {
    debug_assert!(data.len() <= MAX_METHOD_COUNT);
    out.push(CompressedMethod::encode(SecOp::IncMethod, subchannel, method, data.len() as u32).raw());
    out.extend_from_slice(data);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("control entry at 0x{0:X} is not mapped")]
    Unmapped(GpuVAddr),

    #[error("malformed control entry at 0x{0:X}")]
    Malformed(GpuVAddr),

    #[error("call nesting too deep at 0x{0:X}")]
    CallDepth(GpuVAddr),

    #[error("too many control entries")]
    TooManyEntries,

    #[error("truncated or invalid method at word {0}")]
    BadMethod(usize),
}

/// A run of command words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub address: GpuVAddr,
    pub words: u32,
}

impl Segment {
    pub fn bytes(&self) -> u64 {
        self.words as u64 * 4
    }
}

type ReadFn<'a> = &'a dyn Fn(GpuVAddr, &mut [u8]) -> Result<(), GpuVAddr>;

/// Walk the control entries of `handle`, following links and flattening
/// calls, and return the command segments in execution order.
pub fn collect_segments(read: ReadFn<'_>, handle: GpuVAddr) -> Result<Vec<Segment>, StreamError> {
    let mut segments = Vec::new();
    let mut budget = MAX_CONTROL_ENTRIES;
    walk(read, handle, 0, &mut segments, &mut budget)?;
    Ok(segments)
}

fn walk(
    read: ReadFn<'_>,
    start: GpuVAddr,
    depth: usize,
    segments: &mut Vec<Segment>,
    budget: &mut usize,
) -> Result<(), StreamError> {
    if start == 0 || start % CONTROL_ENTRY_SIZE != 0 {
        return Err(StreamError::Malformed(start));
    }
    let mut pos = start;
    loop {
        if *budget == 0 {
            return Err(StreamError::TooManyEntries);
        }
        *budget -= 1;

        let mut raw = [0u8; 8];
        read(pos, &mut raw).map_err(StreamError::Unmapped)?;
        let entry = GpEntry::from_bytes(raw);
        log::trace!("control: 0x{:X} {:?} addr=0x{:X} len={}", pos, entry.kind(), entry.address(), entry.length());

        match entry.kind() {
            EntryKind::Segment => {
                if entry.length() > 0 {
                    segments.push(Segment {
                        address: entry.address(),
                        words: entry.length(),
                    });
                }
                pos += CONTROL_ENTRY_SIZE;
            }
            EntryKind::Link => {
                let target = entry.address();
                if target == 0 || target % CONTROL_ENTRY_SIZE != 0 {
                    return Err(StreamError::Malformed(pos));
                }
                pos = target;
            }
            EntryKind::Call => {
                if depth + 1 > MAX_CALL_DEPTH {
                    return Err(StreamError::CallDepth(pos));
                }
                walk(read, entry.address(), depth + 1, segments, budget)?;
                pos += CONTROL_ENTRY_SIZE;
            }
            EntryKind::End => return Ok(()),
        }
    }
}

/// Split command words into whole methods (header plus data).
pub fn split_commands(words: &[u32]) -> Result<Vec<&[u32]>, StreamError> {
    let mut commands = Vec::new();
    let mut pos = 0;
    while pos < words.len() {
        let header = CompressedMethod::new(words[pos]);
        let len = match header.sec_op() {
            SecOp::IncMethod | SecOp::NonIncMethod | SecOp::OneInc => 1 + header.method_count() as usize,
            SecOp::ImmdDataMethod | SecOp::EndPbSegment => 1,
            SecOp::Grp0UseTert | SecOp::Grp2UseTert | SecOp::Reserved6 => {
                return Err(StreamError::BadMethod(pos));
            }
        };
        if pos + len > words.len() {
            return Err(StreamError::BadMethod(pos));
        }
        commands.push(&words[pos..pos + len]);
        pos += len;
    }
    Ok(commands)
}

/// Decode little-endian words.
pub fn words_from_bytes(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}
