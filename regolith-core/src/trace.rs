//! Per-hart record of the most recent store, for the trace/log collaborator.

use std::cell::UnsafeCell;

/// A store observed by the tracer: address, width in bytes, and the raw
/// little-endian integer of that width.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WriteRecord {
    pub address: u64,
    pub size: u32,
    pub value: u64,
}

#[derive(Debug, Default, Copy, Clone)]
struct Slot {
    /// Zero means no store since the last clear.
    size: u32,
    address: u64,
    value: u64,
    prev_value: u64,
}

/// One last-write slot per hart.
///
/// # Safety
///
/// Slots use interior mutability so the shared write path can update them
/// through `&self`. Each hart id is driven by at most one OS thread (one
/// logical hart per thread), so a slot is never touched concurrently; the
/// tracer queries a hart's slot from that same thread after the write
/// returns.
#[derive(Debug)]
pub(crate) struct WriteTrace {
    slots: Box<[UnsafeCell<Slot>]>,
}

// SAFETY: see the type-level comment; slot `i` is only accessed by the thread
// driving hart `i`.
unsafe impl Send for WriteTrace {}
unsafe impl Sync for WriteTrace {}

impl WriteTrace {
    pub(crate) fn new(hart_count: usize) -> Self {
        Self {
            slots: (0..hart_count)
                .map(|_| UnsafeCell::new(Slot::default()))
                .collect(),
        }
    }

    /// Overwrite `hart`'s record with a store of `size` bytes.
    pub(crate) fn record(&self, hart: usize, address: u64, size: u32, value: u64, prev_value: u64) {
        // SAFETY: only the thread driving `hart` accesses this slot.
        unsafe {
            *self.slots[hart].get() = Slot {
                size,
                address,
                value,
                prev_value,
            };
        }
    }

    /// The most recent store of `hart` with the value it wrote, or `None` if
    /// there was no store since the last clear.
    pub(crate) fn last_new(&self, hart: usize) -> Option<WriteRecord> {
        // SAFETY: only the thread driving `hart` accesses this slot.
        let slot = unsafe { *self.slots[hart].get() };
        (slot.size != 0).then_some(WriteRecord {
            address: slot.address,
            size: slot.size,
            value: slot.value,
        })
    }

    /// The most recent store of `hart` with the value it replaced, or `None`
    /// if there was no store since the last clear.
    pub(crate) fn last_prev(&self, hart: usize) -> Option<WriteRecord> {
        // SAFETY: only the thread driving `hart` accesses this slot.
        let slot = unsafe { *self.slots[hart].get() };
        (slot.size != 0).then_some(WriteRecord {
            address: slot.address,
            size: slot.size,
            value: slot.prev_value,
        })
    }

    /// Forget `hart`'s record.
    pub(crate) fn clear(&self, hart: usize) {
        // SAFETY: only the thread driving `hart` accesses this slot.
        unsafe {
            (*self.slots[hart].get()).size = 0;
        }
    }
}
