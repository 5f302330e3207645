//! Hashed timing wheel with O(1) schedule/cancel.
//!
//! Single level, power-of-two slots, 1 ms per tick. A timer's slot is its
//! absolute deadline masked by the slot count, so deadlines further out than
//! one rotation simply stay parked in their slot until the cursor passes them
//! on a later lap. Owned by one thread; nothing here is shared.

use core::num::NonZeroUsize;

use thiserror::Error;

use super::slab::Slab;
use super::time::MonoInstant;

/// Handle to a scheduled timer. Stale after the timer fires or is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    index: u32,
    generation: u32,
}

/// Errors from [`TimerWheel::schedule_at`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WheelError {
    /// Every timer slot is in use.
    #[error("timer wheel is full ({capacity} timers)")]
    Capacity { capacity: usize },
}

struct Node<T> {
    payload: T,
    deadline: u64,
    prev: Option<u32>,
    next: Option<u32>,
}

/// Timer wheel keyed on [`MonoInstant`] milliseconds.
pub struct TimerWheel<T> {
    slots: Vec<Option<u32>>,
    slab: Slab<Node<T>>,
    mask: u64,
    /// Last tick already processed.
    cursor: u64,
}

impl<T> TimerWheel<T> {
    /// Creates a wheel whose cursor starts at `now`.
    ///
    /// `slots` is rounded up to a power of two.
    #[must_use]
    pub fn new(slots: usize, capacity: NonZeroUsize, now: MonoInstant) -> Self {
        let slots = slots.max(1).next_power_of_two();
        Self {
            slots: vec![None; slots],
            slab: Slab::with_capacity(capacity),
            mask: (slots - 1) as u64,
            cursor: now.as_millis(),
        }
    }

    /// Number of pending timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slab.len()
    }

    /// `true` when no timers are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slab.len() == 0
    }

    /// Schedules `payload` for `deadline`.
    ///
    /// Deadlines at or before the last processed tick fire on the next
    /// [`advance`](Self::advance) past it, never within the current one.
    ///
    /// # Errors
    ///
    /// Returns [`WheelError::Capacity`] when the wheel is full.
    pub fn schedule_at(
        &mut self,
        deadline: MonoInstant,
        payload: T,
    ) -> Result<TimerHandle, WheelError> {
        let deadline = deadline.as_millis().max(self.cursor + 1);
        let slot = self.slot_of(deadline);
        let head = self.slots[slot];
        let (index, generation) = self
            .slab
            .insert(Node {
                payload,
                deadline,
                prev: None,
                next: head,
            })
            .ok_or(WheelError::Capacity {
                capacity: self.slab.capacity(),
            })?;
        if let Some(head) = head.and_then(|h| self.slab.get_mut(h)) {
            head.prev = Some(index);
        }
        self.slots[slot] = Some(index);
        Ok(TimerHandle { index, generation })
    }

    /// Cancels a pending timer. Returns `false` for stale handles.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        if self.slab.generation(handle.index) != Some(handle.generation) {
            return false;
        }
        self.unlink(handle.index);
        self.slab.remove(handle.index).is_some()
    }

    /// Earliest pending deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<MonoInstant> {
        self.slab
            .values()
            .map(|node| node.deadline)
            .min()
            .map(MonoInstant::from_millis)
    }

    /// Moves the cursor to `now`, handing every due timer to `on_fire`.
    ///
    /// Returns the number of timers fired.
    pub fn advance(&mut self, now: MonoInstant, mut on_fire: impl FnMut(TimerHandle, T)) -> usize {
        let now_tick = now.as_millis();
        if now_tick <= self.cursor {
            return 0;
        }

        // A gap longer than one rotation still only needs one lap.
        let steps = (now_tick - self.cursor).min(self.slots.len() as u64);
        let mut fired = 0;
        for step in 1..=steps {
            let slot = self.slot_of(self.cursor + step);
            let mut cursor = self.slots[slot];
            while let Some(index) = cursor {
                let Some(node) = self.slab.get(index) else {
                    break;
                };
                cursor = node.next;
                if node.deadline > now_tick {
                    continue;
                }
                let Some(generation) = self.slab.generation(index) else {
                    continue;
                };
                self.unlink(index);
                if let Some(node) = self.slab.remove(index) {
                    on_fire(TimerHandle { index, generation }, node.payload);
                    fired += 1;
                }
            }
        }
        self.cursor = now_tick;
        fired
    }

    fn slot_of(&self, tick: u64) -> usize {
        (tick & self.mask) as usize
    }

    fn unlink(&mut self, index: u32) {
        let Some(node) = self.slab.get(index) else {
            return;
        };
        let (prev, next, deadline) = (node.prev, node.next, node.deadline);
        match prev.and_then(|p| self.slab.get_mut(p)) {
            Some(prev) => prev.next = next,
            None => {
                let slot = self.slot_of(deadline);
                self.slots[slot] = next;
            }
        }
        if let Some(next) = next.and_then(|n| self.slab.get_mut(n)) {
            next.prev = prev;
        }
    }
}
