// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Device-wide settings, populated from the config INI by the binary.
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    // Device
    pub validation: ValidationLevel,

    // Queue
    pub queue_command_memory_size: u64,
    pub queue_compute_memory_size: u64,
    pub queue_control_memory_size: u64,
    /// Unflushed command bytes that trigger an automatic flush.
    pub queue_flush_threshold: u64,
    pub queue_priority: QueuePriority,

    // GPU
    /// How long the GPU may block on a wait before the queue faults.
    pub gpu_timeout_ms: u64,

    // Finalization
    /// Sweeps an object must sit in the finalize queue before it is freed.
    pub finalize_age: u32,

    // Debug
    pub log_commands: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            validation: ValidationLevel::Off,
            queue_command_memory_size: 0x1_0000,
            queue_compute_memory_size: 0x4_0000,
            queue_control_memory_size: 0x4000,
            queue_flush_threshold: 0x8000,
            queue_priority: QueuePriority::Normal,
            gpu_timeout_ms: 5_000,
            finalize_age: 2,
            log_commands: false,
        }
    }
}

/// How much synchronous checking the API performs beyond the basic
/// parameter contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationLevel {
    Off,
    /// Check recorded addresses against the GPU address space and skip
    /// offending calls.
    Strict,
}

impl ValidationLevel {
    pub fn from_str_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "1" | "strict" | "on" | "true" => Self::Strict,
            _ => Self::Off,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum QueuePriority {
    Low = 1,
    Normal = 2,
    High = 3,
}

impl QueuePriority {
    pub fn from_str_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "1" | "low" => Self::Low,
            "3" | "high" => Self::High,
            _ => Self::Normal,
        }
    }
}
