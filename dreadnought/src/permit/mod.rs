//! Worker pool and leases.
//!
//! `checkout` hands out a [`Lease`] for one worker; dropping the lease checks
//! the worker back in. A worker returned dead, or mid-stream, poisons its slot:
//! the pool shrinks by one and never reuses that slot.

mod pool;
mod slot;

pub use pool::{ForkedPool, Pool, PoolError, PoolSnapshot};
pub use slot::{Lease, SlotIndex};
