use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tandem_telemetry_util::{display_duration, error_field};
use tokio::{
    sync::{Mutex, Notify, mpsc},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

mod memory;
mod redis_store;

pub use memory::MemoryLeaseStore;
pub use redis_store::{LEASE_KEY, RedisLeaseStore};

pub type RedisLease = Lease<RedisLeaseStore>;
pub type LocalLease = Lease<MemoryLeaseStore>;

#[derive(Debug)]
pub enum LeaseEvent {
    /// The lease was acquired.
    Promoted,
    /// The lease was lost, expired or given up.
    Demoted,
    /// The store could not be reached. Does not change who holds the lease.
    Error(eyre::Report),
}

/// The instance's side of a leadership lease.
///
/// Role changes are reported as [`LeaseEvent`]s on a channel handed out when
/// the lease is created.
pub trait LeaderLease: Send + Sync + 'static {
    /// Starts competing for the lease. Does nothing if already competing.
    fn start(&self);

    /// Releases the lease if held and stops competing until the next
    /// [`Self::start`].
    fn resign(&self) -> impl Future<Output = eyre::Result<()>> + Send;
}

impl<T: LeaderLease> LeaderLease for Arc<T> {
    fn start(&self) {
        (**self).start();
    }

    fn resign(&self) -> impl Future<Output = eyre::Result<()>> + Send {
        (**self).resign()
    }
}

/// Storage for a lease that expires unless renewed in time.
pub trait LeaseStore: Send + Sync + 'static {
    /// Takes the lease for `holder` if nobody holds it.
    fn try_acquire(
        &self,
        holder: &str,
        ttl: Duration,
    ) -> impl Future<Output = eyre::Result<bool>> + Send;

    /// Extends the lease if `holder` still holds it.
    fn renew(&self, holder: &str, ttl: Duration) -> impl Future<Output = eyre::Result<bool>> + Send;

    /// Drops the lease if `holder` holds it.
    fn release(&self, holder: &str) -> impl Future<Output = eyre::Result<bool>> + Send;
}

#[derive(Clone, Debug)]
pub struct LeaseConfig {
    /// Written into the lease while held. Must be unique in the cluster.
    pub holder: String,
    pub ttl: Duration,
    /// How often the lease is renewed, or acquisition is retried. Must be
    /// well below `ttl`.
    pub poll_interval: Duration,
}

/// A [`LeaderLease`] kept by polling a [`LeaseStore`].
///
/// The holder renews every poll interval. A renewal that is refused, or that
/// keeps failing for longer than the TTL, demotes the holder.
pub struct Lease<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Lease<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<S> {
    store: S,
    config: LeaseConfig,
    competing: AtomicBool,
    wake: Notify,
    /// Last successful acquisition or renewal, while held. Locked for the
    /// whole of a poll or a resignation so the two never interleave.
    held_since: Mutex<Option<Instant>>,
    events: mpsc::UnboundedSender<LeaseEvent>,
}

impl<S: LeaseStore> Lease<S> {
    pub fn new(store: S, config: LeaseConfig) -> (Self, mpsc::UnboundedReceiver<LeaseEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let lease = Self {
            inner: Arc::new(Inner {
                store,
                config,
                competing: AtomicBool::new(false),
                wake: Notify::new(),
                held_since: Mutex::new(None),
                events,
            }),
        };
        (lease, rx)
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Spawns the task that acquires and renews the lease until `shutdown`
    /// fires.
    ///
    /// The task stops renewing on shutdown but does not release the lease;
    /// that is left to [`LeaderLease::resign`].
    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            info!(
                holder = %inner.config.holder,
                ttl = %display_duration(inner.config.ttl),
                poll_interval = %display_duration(inner.config.poll_interval),
                "polling leadership lease",
            );
            loop {
                if inner.competing.load(Ordering::Acquire) {
                    tokio::select! {
                        biased;
                        () = shutdown.cancelled() => break,
                        () = inner.poll() => {}
                    }
                    tokio::select! {
                        biased;
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(inner.config.poll_interval) => {}
                    }
                } else {
                    tokio::select! {
                        biased;
                        () = shutdown.cancelled() => break,
                        () = inner.wake.notified() => {}
                    }
                }
            }
            debug!("stopped polling leadership lease");
        })
    }
}

impl<S: LeaseStore> Inner<S> {
    async fn poll(&self) {
        let mut held_since = self.held_since.lock().await;
        if !self.competing.load(Ordering::Acquire) {
            return;
        }
        let LeaseConfig { holder, ttl, .. } = &self.config;

        match *held_since {
            Some(since) => match self.store.renew(holder, *ttl).await {
                Ok(true) => *held_since = Some(Instant::now()),
                Ok(false) => {
                    warn!(%holder, "leadership lease was lost");
                    *held_since = None;
                    self.emit(LeaseEvent::Demoted);
                }
                Err(error) => {
                    let expired = since.elapsed() >= *ttl;
                    warn!(
                        %holder,
                        error = error_field(&error),
                        expired,
                        "failed renewing leadership lease",
                    );
                    self.emit(LeaseEvent::Error(error));
                    if expired {
                        *held_since = None;
                        self.emit(LeaseEvent::Demoted);
                    }
                }
            },
            None => match self.store.try_acquire(holder, *ttl).await {
                Ok(true) => {
                    info!(%holder, "acquired leadership lease");
                    *held_since = Some(Instant::now());
                    self.emit(LeaseEvent::Promoted);
                }
                Ok(false) => {}
                Err(error) => self.emit(LeaseEvent::Error(error)),
            },
        }
    }

    fn emit(&self, event: LeaseEvent) {
        // nobody listening means the lifecycle is gone; the lease just expires
        let _ = self.events.send(event);
    }
}

impl<S: LeaseStore> LeaderLease for Lease<S> {
    fn start(&self) {
        if !self.inner.competing.swap(true, Ordering::AcqRel) {
            debug!(holder = %self.inner.config.holder, "competing for leadership lease");
            self.inner.wake.notify_one();
        }
    }

    #[instrument(skip_all, fields(holder = %self.inner.config.holder), err)]
    async fn resign(&self) -> eyre::Result<()> {
        self.inner.competing.store(false, Ordering::Release);
        let mut held_since = self.inner.held_since.lock().await;
        if held_since.take().is_none() {
            return Ok(());
        }
        // demoted either way: without renewals the lease expires on its own
        self.inner.emit(LeaseEvent::Demoted);
        let released = self.inner.store.release(&self.inner.config.holder).await?;
        info!(released, "resigned leadership lease");
        Ok(())
    }
}
