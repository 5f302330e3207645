//! Index-addressed subscription table.
//!
//! Append-only while the link is live: a subscription's index is its
//! position in the table, so indices stay dense in `[0, len)` and every
//! value record from the simulator resolves with one bounds check.

use std::fmt;

use super::protocol::{Frequency, SubscriptionIndex};

/// Callback receiving each new value of a subscription.
pub type ValueHandler = Box<dyn FnMut(f32) + Send>;

/// One live subscription.
pub struct Subscription {
    index: SubscriptionIndex,
    data_ref: String,
    frequency: Frequency,
    last_value: Option<f32>,
    handler: ValueHandler,
}

impl Subscription {
    #[must_use]
    pub const fn index(&self) -> SubscriptionIndex {
        self.index
    }

    #[must_use]
    pub fn data_ref(&self) -> &str {
        &self.data_ref
    }

    #[must_use]
    pub const fn frequency(&self) -> Frequency {
        self.frequency
    }

    /// Most recent value received, if any.
    #[must_use]
    pub const fn last_value(&self) -> Option<f32> {
        self.last_value
    }

    /// Records `value` and hands it to the handler.
    pub(crate) fn deliver(&mut self, value: f32) {
        self.last_value = Some(value);
        (self.handler)(value);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("index", &self.index)
            .field("data_ref", &self.data_ref)
            .field("frequency", &self.frequency)
            .field("last_value", &self.last_value)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionTable {
    entries: Vec<Subscription>,
}

impl SubscriptionTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Appends a subscription at the next free index.
    ///
    /// Returns `None` once the wire index space is exhausted.
    pub fn push(
        &mut self,
        data_ref: String,
        frequency: Frequency,
        handler: ValueHandler,
    ) -> Option<SubscriptionIndex> {
        let index = u32::try_from(self.entries.len())
            .ok()
            .and_then(SubscriptionIndex::new)?;
        self.entries.push(Subscription {
            index,
            data_ref,
            frequency,
            last_value: None,
            handler,
        });
        Some(index)
    }

    /// Resolves a raw wire index. Negative or out-of-range indices miss.
    pub fn lookup_mut(&mut self, wire_index: i32) -> Option<&mut Subscription> {
        let index = SubscriptionIndex::from_wire(wire_index)?;
        self.entries.get_mut(index.as_usize())
    }

    #[must_use]
    pub fn get(&self, index: SubscriptionIndex) -> Option<&Subscription> {
        self.entries.get(index.as_usize())
    }

    /// Live subscriptions in index order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &Subscription> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
