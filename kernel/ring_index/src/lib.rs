//! A cursor type for power-of-two sized rings shared between a producer and a consumer.
//!
//! Hardware rings are usually addressed with a monotonically increasing counter that is
//! reduced to a slot index with `count & (capacity - 1)`. Scattering that arithmetic
//! across a driver is a reliable source of off-by-one and wrap-around bugs, so this crate
//! owns it: the raw counter wraps modulo 2^32, the slot index wraps modulo the capacity,
//! and fullness is decided by comparing the producer counter against the consumer's
//! counter through the mask.

#![no_std]

/// A monotonically increasing producer position on a power-of-two sized ring.
#[derive(Debug, Clone, Copy)]
pub struct RingCursor {
    count: u32,
    mask: u32,
}

impl RingCursor {
    /// Creates a cursor for a ring with `capacity` slots.
    ///
    /// `capacity` must be a nonzero power of two so that `capacity - 1` is usable as a
    /// bit mask over the raw counter.
    pub fn new(capacity: u32) -> Result<RingCursor, &'static str> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err("ring capacity must be a nonzero power of two");
        }
        Ok(RingCursor { count: 0, mask: capacity - 1 })
    }

    /// The number of slots in the ring.
    pub fn capacity(&self) -> u32 {
        self.mask + 1
    }

    /// The raw monotonic counter.
    ///
    /// Wraps modulo 2^32. The wrap is harmless as long as positions are only ever
    /// compared through [`RingCursor::slot_of`] or [`RingCursor::is_full_against`].
    pub fn count(&self) -> u32 {
        self.count
    }

    /// The slot index the cursor currently points at.
    pub fn slot(&self) -> usize {
        (self.count & self.mask) as usize
    }

    /// The slot index a given raw counter value maps to on this ring.
    pub fn slot_of(&self, count: u32) -> usize {
        (count & self.mask) as usize
    }

    /// Advances the cursor by one slot.
    pub fn advance(&mut self) {
        self.count = self.count.wrapping_add(1);
    }

    /// Returns true if advancing this producer cursor by one slot would make it collide
    /// with `consumer_count`, i.e. the ring has no free slot left.
    ///
    /// A ring managed this way holds at most `capacity - 1` outstanding entries: the
    /// producer is never allowed to advance onto the consumer's position, since that
    /// state would be indistinguishable from an empty ring.
    pub fn is_full_against(&self, consumer_count: u32) -> bool {
        (self.count.wrapping_add(1) & self.mask) == (consumer_count & self.mask)
    }

    /// Resets the raw counter to zero (used when the ring itself is re-initialized).
    pub fn reset(&mut self) {
        self.count = 0;
    }
}
