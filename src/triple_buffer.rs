//! Lock-free single-producer frame hand-off.
//!
//! Three [`Frame`] slots are addressed by cursors packed into one
//! `AtomicU64`; every cursor transition is a single compare-and-swap on
//! that word:
//!
//! | bits  | field                                       |
//! |-------|---------------------------------------------|
//! | 0-1   | write: preferred next slot for the writer   |
//! | 2-3   | ready: latest published slot                |
//! | 4-5   | writing: slot currently being filled        |
//! | 6-41  | readers pinning each slot, 12 bits per slot |
//! | 42    | closed                                      |
//! | 43-63 | epoch, bumped by every reopen               |
//!
//! Readers always pin the ready slot. The writer only claims a slot that
//! is neither ready nor pinned, and drops the frame when no such slot
//! exists. A claim made before a reopen can never publish.

use std::cell::UnsafeCell;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::backend::SurfaceSize;
use crate::error::{CaptureError, CaptureResult};
use crate::frame::Frame;

pub(crate) const SLOT_COUNT: u8 = 3;
const NONE: u8 = 3;

const CURSOR_MASK: u64 = 0b11;
const WRITE_SHIFT: u32 = 0;
const READY_SHIFT: u32 = 2;
const WRITING_SHIFT: u32 = 4;
const READERS_SHIFT: u32 = 6;
const READERS_BITS: u32 = 12;
const READERS_MASK: u64 = (1 << READERS_BITS) - 1;
const CLOSED_BIT: u64 = 1 << 42;
const EPOCH_SHIFT: u32 = 43;
const EPOCH_MASK: u64 = (1 << (64 - EPOCH_SHIFT)) - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Cursors {
    write: u8,
    ready: u8,
    writing: u8,
    readers: [u16; SLOT_COUNT as usize],
    closed: bool,
    epoch: u32,
}

impl Cursors {
    const INITIAL: Self = Self {
        write: 0,
        ready: NONE,
        writing: NONE,
        readers: [0; SLOT_COUNT as usize],
        closed: false,
        epoch: 0,
    };

    fn unpack(word: u64) -> Self {
        let readers_of = |slot: u32| {
            ((word >> (READERS_SHIFT + slot * READERS_BITS)) & READERS_MASK) as u16
        };
        Self {
            write: ((word >> WRITE_SHIFT) & CURSOR_MASK) as u8,
            ready: ((word >> READY_SHIFT) & CURSOR_MASK) as u8,
            writing: ((word >> WRITING_SHIFT) & CURSOR_MASK) as u8,
            readers: [readers_of(0), readers_of(1), readers_of(2)],
            closed: word & CLOSED_BIT != 0,
            epoch: ((word >> EPOCH_SHIFT) & EPOCH_MASK) as u32,
        }
    }

    fn pack(self) -> u64 {
        let mut word = (u64::from(self.write) << WRITE_SHIFT)
            | (u64::from(self.ready) << READY_SHIFT)
            | (u64::from(self.writing) << WRITING_SHIFT)
            | ((u64::from(self.epoch) & EPOCH_MASK) << EPOCH_SHIFT);
        for (slot, &count) in self.readers.iter().enumerate() {
            word |= (u64::from(count) & READERS_MASK)
                << (READERS_SHIFT + slot as u32 * READERS_BITS);
        }
        if self.closed {
            word |= CLOSED_BIT;
        }
        word
    }

    fn is_pinned(&self, slot: u8) -> bool {
        self.readers[usize::from(slot)] > 0
    }

    /// First slot at or after `write` that is neither pinned nor ready.
    fn writer_candidate(&self) -> Option<u8> {
        (0..SLOT_COUNT)
            .map(|offset| (self.write % SLOT_COUNT + offset) % SLOT_COUNT)
            .find(|&slot| slot != self.ready && !self.is_pinned(slot))
    }
}

/// Result of a [`TripleBuffer::write`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    Published { slot: u8 },
    /// Every slot other than the ready one is pinned by readers; the frame
    /// was dropped.
    NoFreeSlot,
    /// The buffer is closed, was reopened during the write, or another
    /// write is in flight; nothing was published.
    Rejected,
}

pub(crate) struct TripleBuffer {
    state: AtomicU64,
    slots: [UnsafeCell<Frame>; SLOT_COUNT as usize],
}

// SAFETY: slot access is arbitrated by `state`. A slot is mutated only by
// the writer that claimed it through `writing`, and read only while its
// reader count is non-zero; the writer never claims a pinned or ready
// slot and readers only pin the ready slot.
unsafe impl Sync for TripleBuffer {}
unsafe impl Send for TripleBuffer {}

impl TripleBuffer {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU64::new(Cursors::INITIAL.pack()),
            slots: [
                UnsafeCell::new(Frame::empty()),
                UnsafeCell::new(Frame::empty()),
                UnsafeCell::new(Frame::empty()),
            ],
        }
    }

    /// Applies `transition` with a CAS loop. `transition` returns `None`
    /// to abort.
    fn update<F>(&self, mut transition: F) -> Option<(Cursors, Cursors)>
    where
        F: FnMut(Cursors) -> Option<Cursors>,
    {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let before = Cursors::unpack(current);
            let after = transition(before)?;
            match self.state.compare_exchange_weak(
                current,
                after.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some((before, after)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Claims a free slot, resizes it to `size`, lets `fill` write the
    /// pixels and publishes it as the new ready slot.
    ///
    /// Never blocks. If `fill` fails the slot is released unpublished and
    /// the previous ready frame stays current.
    pub(crate) fn write<F>(&self, size: SurfaceSize, fill: F) -> CaptureResult<WriteOutcome>
    where
        F: FnOnce(&mut Frame) -> CaptureResult<()>,
    {
        let mut no_free_slot = false;
        let claimed = self.update(|cursors| {
            no_free_slot = false;
            if cursors.closed || cursors.writing != NONE {
                return None;
            }
            let Some(slot) = cursors.writer_candidate() else {
                no_free_slot = true;
                return None;
            };
            Some(Cursors {
                writing: slot,
                ..cursors
            })
        });
        let Some((_, claimed)) = claimed else {
            return Ok(if no_free_slot {
                WriteOutcome::NoFreeSlot
            } else {
                WriteOutcome::Rejected
            });
        };
        let slot = claimed.writing;

        // SAFETY: `slot` is claimed through `writing`; no reader can pin it
        // because it is not the ready slot, and no other writer can claim
        // it until `writing` is cleared below.
        let frame = unsafe { &mut *self.slots[usize::from(slot)].get() };
        let filled = frame
            .ensure_bgra_capacity(size.width, size.height)
            .and_then(|()| fill(frame));

        let published = self.update(|cursors| {
            let mut next = Cursors {
                writing: NONE,
                ..cursors
            };
            if filled.is_ok() && !cursors.closed && cursors.epoch == claimed.epoch {
                next.ready = slot;
                next.write = (slot + 1) % SLOT_COUNT;
            }
            Some(next)
        });

        let published = matches!(published, Some((_, after)) if after.ready == slot);
        if !published {
            // SAFETY: the slot was never published, so no reader holds it.
            unsafe { (*self.slots[usize::from(slot)].get()).clear() };
        }
        filled?;
        Ok(if published {
            WriteOutcome::Published { slot }
        } else {
            WriteOutcome::Rejected
        })
    }

    /// Pins the latest published slot. Returns `None` when nothing has
    /// been published or the buffer is closed.
    pub(crate) fn acquire(&self) -> Option<u8> {
        let (_, after) = self.update(|cursors| {
            if cursors.closed || cursors.ready == NONE {
                return None;
            }
            let mut next = cursors;
            let count = &mut next.readers[usize::from(cursors.ready)];
            if u64::from(*count) == READERS_MASK {
                return None;
            }
            *count += 1;
            Some(next)
        })?;
        Some(after.ready)
    }

    /// Drops one pin on `slot`.
    pub(crate) fn release(&self, slot: u8) -> CaptureResult<()> {
        let released = self.update(|cursors| {
            if slot >= SLOT_COUNT || !cursors.is_pinned(slot) {
                return None;
            }
            let mut next = cursors;
            next.readers[usize::from(slot)] -= 1;
            Some(next)
        });
        match released {
            Some(_) => Ok(()),
            None => Err(CaptureError::InvalidConfig(format!(
                "frame slot {slot} is not pinned"
            ))),
        }
    }

    /// # Safety
    ///
    /// `slot` must be pinned by the caller through [`acquire`](Self::acquire)
    /// and not yet released.
    pub(crate) unsafe fn slot(&self, slot: u8) -> &Frame {
        // SAFETY: upheld by the caller; the writer never targets a pinned
        // slot.
        unsafe { &*self.slots[usize::from(slot)].get() }
    }

    /// Pins the latest frame for the lifetime of the returned guard.
    pub(crate) fn read(&self) -> Option<ReadGuard<'_>> {
        let slot = self.acquire()?;
        Some(ReadGuard { buffer: self, slot })
    }

    /// Stops accepting writes and readers, drops the ready frame and frees
    /// every slot that is not pinned or mid-write.
    pub(crate) fn close_and_clear(&self) {
        let closed = self.update(|cursors| {
            Some(Cursors {
                closed: true,
                ready: NONE,
                ..cursors
            })
        });
        let Some((_, snapshot)) = closed else {
            return;
        };
        for slot in 0..SLOT_COUNT {
            if snapshot.is_pinned(slot) || snapshot.writing == slot {
                continue;
            }
            // SAFETY: closed buffers accept no new claims or pins, and this
            // slot was neither claimed nor pinned when the buffer closed.
            unsafe { (*self.slots[usize::from(slot)].get()).clear() };
        }
    }

    /// Accepts writes and readers again after [`close_and_clear`](Self::close_and_clear).
    /// A write still in flight from before keeps its slot until it
    /// finishes, but its frame is discarded.
    pub(crate) fn reopen(&self) {
        let _ = self.update(|cursors| {
            Some(Cursors {
                closed: false,
                ready: NONE,
                write: 0,
                epoch: (cursors.epoch + 1) & EPOCH_MASK as u32,
                ..cursors
            })
        });
    }

    #[cfg(test)]
    fn cursors(&self) -> Cursors {
        Cursors::unpack(self.state.load(Ordering::Acquire))
    }
}

/// A pinned frame slot, unpinned on drop.
pub(crate) struct ReadGuard<'a> {
    buffer: &'a TripleBuffer,
    slot: u8,
}

impl Deref for ReadGuard<'_> {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        // SAFETY: the guard holds the pin until it is dropped.
        unsafe { self.buffer.slot(self.slot) }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.buffer.release(self.slot) {
            tracing::warn!("failed to unpin frame slot: {err}");
        }
    }
}
