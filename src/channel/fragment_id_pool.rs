use std::sync::atomic::{AtomicU32, Ordering};

use tracing::warn;

/// Bit position lookup for an isolated bit `b`: `DE_BRUIJN_BIT_POSITION[(b * 0x077CB531) >> 27]`
const DE_BRUIJN_BIT_POSITION: [u16; 32] = [
    0, 1, 28, 2, 29, 14, 24, 3, 30, 22, 20, 15, 25, 17, 4, 8,
    31, 27, 13, 23, 21, 19, 16, 7, 26, 12, 18, 6, 11, 5, 10, 9,
];
const DE_BRUIJN_SEQUENCE: u32 = 0x077C_B531;

/// Hands out the ids of fragments that are in flight on a single connection. There are only
///  [FragmentIdPool::CAPACITY] of them, which bounds the number of concurrent sends per
///  connection - callers beyond that are rejected rather than queued.
///
/// The pool is a lock-free bit mask: bit `n` is set while id `n` is in use.
#[derive(Debug, Default)]
pub struct FragmentIdPool {
    used: AtomicU32,
}

impl FragmentIdPool {
    pub const CAPACITY: usize = u32::BITS as usize;

    pub fn new() -> FragmentIdPool {
        FragmentIdPool::default()
    }

    /// Returns the lowest unused id, or `None` if all ids are in use. The id is released when
    ///  the returned guard is dropped.
    pub fn allocate(&self) -> Option<FragmentId<'_>> {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let free = !current;
            if free == 0 {
                return None;
            }
            let lowest_free_bit = free & free.wrapping_neg();

            match self.used.compare_exchange_weak(current, current | lowest_free_bit, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    return Some(FragmentId {
                        pool: self,
                        id: bit_position(lowest_free_bit),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, id: u16) {
        let mask = 1u32 << id;
        let prev = self.used.fetch_and(!mask, Ordering::AcqRel);
        if prev & mask == 0 {
            warn!("released fragment id {} which was not in use", id);
        }
    }

    pub fn num_in_use(&self) -> usize {
        self.used.load(Ordering::Acquire).count_ones() as usize
    }
}

/// NB: `bit` must have exactly one bit set
fn bit_position(bit: u32) -> u16 {
    DE_BRUIJN_BIT_POSITION[(bit.wrapping_mul(DE_BRUIJN_SEQUENCE) >> 27) as usize]
}

/// An allocated fragment id, returned to its pool on drop
#[derive(Debug)]
pub struct FragmentId<'a> {
    pool: &'a FragmentIdPool,
    id: u16,
}

impl FragmentId<'_> {
    pub fn id(&self) -> u16 {
        self.id
    }
}

impl Drop for FragmentId<'_> {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}
