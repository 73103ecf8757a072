//! Index-based intrusive stack and walkable pool.
//!
//! Slots are addressed by `u32` indices instead of pointers; the "intrusive"
//! link of each node is an atomic index living inside the node, reached
//! through the [`StackSlots`] trait. The pool never deallocates a slot while
//! it is alive, which is half of the stack's ABA defense; a per-head tag is
//! the other half.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;

/// The null slot index.
pub const NIL: u32 = u32::MAX;

/// Access to the intrusive free-list link of a slot.
pub trait StackSlots {
    /// The link stored inside slot `index`.
    fn next_free(&self, index: u32) -> &AtomicU32;
}

#[allow(clippy::cast_lossless)]
const fn pack(tag: u32, head: u32) -> u64 {
    ((tag as u64) << 32) | head as u64
}

#[allow(clippy::cast_possible_truncation)]
const fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// Treiber stack of slot indices with a tagged head.
///
/// Safe against ABA under the pool discipline (slots are never freed while
/// the stack is alive): the head carries a tag bumped on every pop, so a
/// push-pop-push of the same index between an observer's load and CAS fails
/// the CAS.
pub struct IntrusiveStack {
    /// Packed {tag, head index}.
    head: AtomicU64,
}

impl IntrusiveStack {
    /// An empty stack.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: AtomicU64::new(pack(0, NIL)),
        }
    }

    /// Pushes slot `index`, storing the old head into its link.
    pub fn push(&self, slots: &impl StackSlots, index: u32) {
        let mut cur = self.head.load(Ordering::Acquire);
        loop {
            let (tag, head) = unpack(cur);
            slots.next_free(index).store(head, Ordering::Release);
            match self.head.compare_exchange_weak(
                cur,
                pack(tag, index),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Pops the most recently pushed slot index, if any.
    pub fn try_pop(&self, slots: &impl StackSlots) -> Option<u32> {
        let mut cur = self.head.load(Ordering::Acquire);
        loop {
            let (tag, head) = unpack(cur);
            if head == NIL {
                return None;
            }
            let next = slots.next_free(head).load(Ordering::Acquire);
            match self.head.compare_exchange_weak(
                cur,
                pack(tag.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(head),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Whether the stack looked empty at the moment of the load.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        unpack(self.head.load(Ordering::Acquire)).1 == NIL
    }
}

impl Default for IntrusiveStack {
    fn default() -> Self {
        Self::new()
    }
}

const SEGMENT_COUNT: usize = 27;
const BASE: u32 = 32;

/// Maps a slot index to its (segment, offset). Segment sizes double from
/// [`BASE`], so the map is a single log2.
#[allow(clippy::cast_possible_truncation)]
const fn locate(index: u32) -> (usize, usize) {
    let shifted = index + BASE;
    let segment = (shifted.ilog2() - BASE.trailing_zeros()) as usize;
    let offset = (shifted - (BASE << segment)) as usize;
    (segment, offset)
}

struct PoolSlot<T> {
    value: OnceLock<T>,
    next_free: AtomicU32,
    /// Whether the slot currently sits on the free list. Catches
    /// double-release in debug builds.
    on_free_list: AtomicBool,
}

impl<T> Default for PoolSlot<T> {
    fn default() -> Self {
        Self {
            value: OnceLock::new(),
            next_free: AtomicU32::new(NIL),
            on_free_list: AtomicBool::new(false),
        }
    }
}

/// Append-only slab of `T` slots with a lock-free free list and a lock-free
/// walk.
///
/// Slots are allocated in doubling segments and never deallocated while the
/// pool lives; [`release`](Self::release) only returns an index to the free
/// list, the payload stays constructed and is handed out again by the next
/// [`acquire`](Self::acquire). [`walk`](Self::walk) visits every slot ever
/// initialized (acquired or currently free) without taking any exclusive
/// lock, and can never observe a destroyed or dangling node.
pub struct IntrusiveWalkablePool<T> {
    segments: [OnceLock<Box<[PoolSlot<T>]>>; SEGMENT_COUNT],
    free: IntrusiveStack,
    /// Slots with indices below this have been handed out at least once.
    live_end: AtomicU32,
}

impl<T> IntrusiveWalkablePool<T> {
    /// An empty pool; segments materialize on first use.
    #[must_use]
    pub fn new() -> Self {
        Self {
            segments: std::array::from_fn(|_| OnceLock::new()),
            free: IntrusiveStack::new(),
            live_end: AtomicU32::new(0),
        }
    }

    /// Hands out a slot index: a recycled one if the free list has any,
    /// otherwise a fresh slot initialized with `init`. A recycled slot keeps
    /// its existing payload; `init` is not called for it.
    pub fn acquire(&self, init: impl FnOnce() -> T) -> u32 {
        if let Some(index) = self.free.try_pop(self) {
            let was_free = self.slot(index).on_free_list.swap(false, Ordering::AcqRel);
            debug_assert!(was_free, "pool slot {index} popped while not marked free");
            return index;
        }
        let index = self.live_end.fetch_add(1, Ordering::AcqRel);
        let (segment, offset) = locate(index);
        let slots = self.segments[segment].get_or_init(|| {
            (0..(BASE << segment)).map(|_| PoolSlot::default()).collect()
        });
        slots[offset].value.get_or_init(init);
        index
    }

    /// Returns `index` to the free list. The payload stays alive and
    /// walkable. Releasing an index twice would corrupt the free list; the
    /// caller owns that invariant, and debug builds assert it.
    pub fn release(&self, index: u32) {
        let was_free = self.slot(index).on_free_list.swap(true, Ordering::AcqRel);
        debug_assert!(!was_free, "pool slot {index} released twice");
        self.free.push(self, index);
    }

    /// The payload of slot `index`.
    #[must_use]
    pub fn get(&self, index: u32) -> &T {
        self.slot(index)
            .value
            .get()
            .expect("pool slot accessed before initialization")
    }

    /// Visits every initialized slot in index order.
    pub fn walk(&self, mut visitor: impl FnMut(u32, &T)) {
        let live_end = self.live_end.load(Ordering::Acquire);
        for index in 0..live_end {
            let (segment, offset) = locate(index);
            let Some(slots) = self.segments[segment].get() else {
                continue;
            };
            if let Some(value) = slots[offset].value.get() {
                visitor(index, value);
            }
        }
    }

    fn slot(&self, index: u32) -> &PoolSlot<T> {
        let (segment, offset) = locate(index);
        let slots = self.segments[segment]
            .get()
            .expect("pool slot index out of range");
        &slots[offset]
    }
}

impl<T> StackSlots for IntrusiveWalkablePool<T> {
    fn next_free(&self, index: u32) -> &AtomicU32 {
        &self.slot(index).next_free
    }
}

impl<T> Default for IntrusiveWalkablePool<T> {
    fn default() -> Self {
        Self::new()
    }
}
