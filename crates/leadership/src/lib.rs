//! Who produces blocks, and what everyone else does meanwhile.
//!
//! A [`LeaderLease`] decides which instance may lead; its decisions arrive as
//! [`LeaseEvent`]s. The [`Manager`] turns them into a role: followers replay
//! the shared log into their engine, the leader builds and finalizes blocks.
//! An instance only starts leading once it has applied everything in the
//! log, and it hands the lease back as soon as its engine stops answering.

mod lease;
mod manager;

pub use lease::{
    LEASE_KEY, LeaderLease, Lease, LeaseConfig, LeaseEvent, LeaseStore, LocalLease,
    MemoryLeaseStore, RedisLease, RedisLeaseStore,
};
pub use manager::{Config, EMPTY_BLOCK_POLL, Manager, ManagerHandle, Role};
