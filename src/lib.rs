//! Lock-free concurrent collections built on two different memory
//! reclamation schemes: an ordered set reclaimed via hazard pointers, and a
//! doubly-linked deque reclaimed via per-node reference counting.
//!
//! See [`hp`] for the hazard pointer registry, [`ordered_set`] for the
//! sorted set built on top of it, and [`deque`] for the reference-counted
//! deque.

mod tagged;
mod thread_id;

pub mod deque;
pub mod hp;
pub mod ordered_set;

pub use crate::deque::Deque;
pub use crate::hp::{Config, ConfigBuilder, HazardPointers};
pub use crate::ordered_set::OrderedSet;
