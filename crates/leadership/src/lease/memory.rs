use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::time::Instant;

use super::LeaseStore;

/// A lease shared by the instances of one process.
#[derive(Clone, Debug, Default)]
pub struct MemoryLeaseStore {
    lease: Arc<Mutex<Option<Held>>>,
    unavailable: Arc<AtomicBool>,
}

#[derive(Debug)]
struct Held {
    holder: String,
    expires_at: Instant,
}

impl MemoryLeaseStore {
    /// The current holder, if the lease has not expired.
    pub fn holder(&self) -> Option<String> {
        self.lease
            .lock()
            .as_ref()
            .filter(|held| held.expires_at > Instant::now())
            .map(|held| held.holder.clone())
    }

    /// Drops the lease regardless of who holds it.
    pub fn revoke(&self) {
        self.lease.lock().take();
    }

    /// Every operation fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    fn check_available(&self) -> eyre::Result<()> {
        eyre::ensure!(
            !self.unavailable.load(Ordering::Relaxed),
            "lease store unavailable"
        );
        Ok(())
    }
}

impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(&self, holder: &str, ttl: Duration) -> eyre::Result<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut lease = self.lease.lock();
        if lease.as_ref().is_some_and(|held| held.expires_at > now) {
            return Ok(false);
        }
        *lease = Some(Held {
            holder: holder.to_owned(),
            expires_at: now + ttl,
        });
        Ok(true)
    }

    async fn renew(&self, holder: &str, ttl: Duration) -> eyre::Result<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut lease = self.lease.lock();
        match lease.as_mut() {
            Some(held) if held.holder == holder && held.expires_at > now => {
                held.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, holder: &str) -> eyre::Result<bool> {
        self.check_available()?;
        let mut lease = self.lease.lock();
        if lease.as_ref().is_some_and(|held| held.holder == holder) {
            *lease = None;
            return Ok(true);
        }
        Ok(false)
    }
}
