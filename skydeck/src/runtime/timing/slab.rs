//! Fixed-capacity generational slab backing the timer wheel.

use core::num::NonZeroUsize;

enum Entry<T> {
    Occupied { value: T, generation: u32 },
    Free { next: Option<u32>, generation: u32 },
}

/// Slab with an intrusive free list. A slot's generation is bumped every
/// time it is freed so stale handles can be told apart from live ones.
pub(crate) struct Slab<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<u32>,
    occupied: usize,
}

impl<T> Slab<T> {
    /// Creates a slab with every slot free.
    ///
    /// Capacity is clamped to `u32::MAX` slots.
    pub(crate) fn with_capacity(capacity: NonZeroUsize) -> Self {
        let capacity = u32::try_from(capacity.get()).unwrap_or(u32::MAX);
        let entries = (0..capacity)
            .map(|i| Entry::Free {
                next: i.checked_add(1).filter(|&next| next < capacity),
                generation: 0,
            })
            .collect();
        Self {
            entries,
            free_head: Some(0),
            occupied: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.occupied
    }

    /// Stores `value`, returning `(index, generation)`, or `None` when full.
    pub(crate) fn insert(&mut self, value: T) -> Option<(u32, u32)> {
        let index = self.free_head?;
        let slot = &mut self.entries[index as usize];
        let (next, generation) = match slot {
            Entry::Free { next, generation } => (*next, *generation),
            Entry::Occupied { .. } => return None,
        };
        *slot = Entry::Occupied { value, generation };
        self.free_head = next;
        self.occupied += 1;
        Some((index, generation))
    }

    /// Frees `index` and hands back its value.
    pub(crate) fn remove(&mut self, index: u32) -> Option<T> {
        let slot = self.entries.get_mut(index as usize)?;
        let generation = match slot {
            Entry::Occupied { generation, .. } => *generation,
            Entry::Free { .. } => return None,
        };
        let freed = core::mem::replace(
            slot,
            Entry::Free {
                next: self.free_head,
                generation: generation.wrapping_add(1),
            },
        );
        self.free_head = Some(index);
        self.occupied -= 1;
        match freed {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Free { .. } => None,
        }
    }

    /// Generation of an occupied slot.
    pub(crate) fn generation(&self, index: u32) -> Option<u32> {
        match self.entries.get(index as usize)? {
            Entry::Occupied { generation, .. } => Some(*generation),
            Entry::Free { .. } => None,
        }
    }

    pub(crate) fn get(&self, index: u32) -> Option<&T> {
        match self.entries.get(index as usize)? {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Free { .. } => None,
        }
    }

    pub(crate) fn get_mut(&mut self, index: u32) -> Option<&mut T> {
        match self.entries.get_mut(index as usize)? {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Free { .. } => None,
        }
    }

    /// Occupied values in slot order.
    pub(crate) fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Free { .. } => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slab(capacity: usize) -> Slab<&'static str> {
        Slab::with_capacity(NonZeroUsize::new(capacity).unwrap())
    }

    #[test]
    fn insert_until_full() {
        let mut s = slab(2);
        assert_eq!(s.insert("a"), Some((0, 0)));
        assert_eq!(s.insert("b"), Some((1, 0)));
        assert_eq!(s.insert("c"), None);
        assert_eq!(s.len(), 2);
        assert_eq!(s.capacity(), 2);
    }

    #[test]
    fn remove_bumps_generation_and_recycles_slot() {
        let mut s = slab(1);
        let (index, generation) = s.insert("a").unwrap();
        assert_eq!(s.remove(index), Some("a"));
        assert_eq!(s.remove(index), None);
        assert_eq!(s.generation(index), None);

        let (again, next_generation) = s.insert("b").unwrap();
        assert_eq!(again, index);
        assert_eq!(next_generation, generation + 1);
        assert_eq!(s.get(again), Some(&"b"));
    }

    #[test]
    fn values_skip_free_slots() {
        let mut s = slab(3);
        s.insert("a");
        let (b, _) = s.insert("b").unwrap();
        s.insert("c");
        s.remove(b);
        assert_eq!(s.values().copied().collect::<Vec<_>>(), vec!["a", "c"]);
    }
}
