//! Concurrent work-stealing marking engine.
//!
//! The crate marks every object reachable from a root set while mutator threads keep running.
//! Work is split between a fixed pool of workers that pop from their own Chase-Lev deques, steal
//! from each other and agree on termination through [`heap::terminator::TaskTerminator`].
//! Stale references recorded by the SATB write barrier are fed back into marking through
//! [`heap::satb_mark_queue::SatbFeed`].
//!
//! The heap itself is an external collaborator described by [`heap::heap::MarkHeap`] and
//! [`traits::ObjectModel`].

pub mod env;
pub mod heap;
pub mod object;
pub mod sync;
pub mod traits;
pub mod utils;

#[cfg(any(test, feature = "test-util"))]
pub mod test_heap;

pub use heap::concurrent_mark::{ConcurrentMark, MarkOutcome};
pub use heap::mark::{Mark, MarkLoopOutcome};
pub use heap::options::MarkOptions;
pub use object::{ObjectKind, ObjectRef, ReferenceType};

#[cfg(test)]
pub mod tests;
