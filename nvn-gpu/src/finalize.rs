// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Deferred destruction of objects the GPU may still reference.
//!
//! Objects are tagged with the queue serial of the last submission that used
//! them. A sweep with the queue's completed serial drops every object whose
//! serial has completed, which has survived at least `age` sweeps, and which
//! reports it can retire.

/// An object that can be handed to a [`FinalizeQueue`].
pub trait Retire: Send {
    /// Whether the object may be dropped now. A memory pool with live views
    /// returns `false` until they are gone.
    fn can_retire(&self) -> bool {
        true
    }
}

struct Deferred {
    object: Box<dyn Retire>,
    serial: u64,
    generation: u64,
}

pub struct FinalizeQueue {
    entries: Vec<Deferred>,
    generation: u64,
    age: u64,
}

impl FinalizeQueue {
    /// `age` is the number of sweeps an object must survive before release.
    pub fn new(age: u32) -> Self {
        Self {
            entries: Vec::new(),
            generation: 0,
            age: age as u64,
        }
    }

    /// Defer dropping `object` until the GPU completes `serial`.
    pub fn schedule(&mut self, object: impl Retire + 'static, serial: u64) {
        self.entries.push(Deferred {
            object: Box::new(object),
            serial,
            generation: self.generation,
        });
    }

    /// Release every eligible object. Returns how many were dropped.
    pub fn sweep(&mut self, completed_serial: u64) -> usize {
        self.generation += 1;
        let mut released = 0;
        // Dropping an object may let another one retire (a view before its
        // pool), so repeat until a pass frees nothing.
        loop {
            let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
                .into_iter()
                .partition(|d| {
                    d.serial <= completed_serial
                        && self.generation - d.generation >= self.age
                        && d.object.can_retire()
                });
            self.entries = waiting;
            if ready.is_empty() {
                break;
            }
            released += ready.len();
            drop(ready);
        }
        if released > 0 {
            log::debug!(
                "finalize: released {} objects ({} pending, generation {})",
                released,
                self.entries.len(),
                self.generation
            );
        }
        released
    }

    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for FinalizeQueue {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            log::warn!("finalize: dropping {} objects that never retired", self.entries.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::memory_pool::{MemoryPoolBuilder, MemoryPoolFlags};
    use crate::resource::Buffer;
    use nvn_common::settings::DeviceSettings;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct DropCounter(Arc<AtomicUsize>);

    impl Retire for DropCounter {}

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_waits_for_serial_and_age() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let mut queue = FinalizeQueue::new(2);
        queue.schedule(DropCounter(dropped.clone()), 5);

        assert_eq!(queue.sweep(4), 0);
        assert_eq!(queue.sweep(5), 1);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_young_object_survives_sweep() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let mut queue = FinalizeQueue::new(1);
        queue.sweep(0);
        queue.schedule(DropCounter(dropped.clone()), 0);
        assert_eq!(queue.sweep(10), 1);
        assert_eq!(queue.generation(), 2);
    }

    #[test]
    fn test_pool_retires_after_its_views() {
        let device = Device::new(DeviceSettings::default());
        let pool = MemoryPoolBuilder::new(&device)
            .set_size(0x1000)
            .set_flags(MemoryPoolFlags::CPU_UNCACHED | MemoryPoolFlags::GPU_CACHED)
            .build()
            .unwrap();
        let buffer = Buffer::new(&pool, 0, 0x100).unwrap();

        let mut queue = FinalizeQueue::new(0);
        queue.schedule(pool, 1);
        queue.schedule(buffer, 3);
        assert_eq!(queue.sweep(1), 0);
        assert_eq!(queue.sweep(3), 2);
        assert_eq!(queue.pending(), 0);
    }
}
