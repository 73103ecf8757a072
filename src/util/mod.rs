//! Lock-free intrusive building blocks.

mod intrusive;

pub use intrusive::{IntrusiveStack, IntrusiveWalkablePool, StackSlots, NIL};
