//! The leader/follower state machine.
//!
//! Two tasks cooperate. The election task consumes [`LeaseEvent`]s and does
//! nothing but flip a leader flag. The work task owns the [`BlockBuilder`]
//! and acts on that flag between units of work, so a role change never
//! interrupts a half-applied block.

use std::{
    fmt,
    time::{Duration, SystemTime},
};

use eyre::WrapErr as _;
use metrics::{counter, gauge};
use tandem_block_builder::{BlockBuilder, Error};
use tandem_engine::ExecutionEngine;
use tandem_primitives::{BuildState, BuildStep};
use tandem_replication::{ReadKind, ReplicatedState, StreamEntry};
use tandem_retry::{Outcome, Policy, RetryError, retry, sleep_or_cancel};
use tandem_telemetry_util::{display_duration, error_field};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{LeaderLease, LeaseEvent};

/// Longest a leader idles before asking the pool again when the empty-block
/// throttle holds it back.
pub const EMPTY_BLOCK_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    /// Holds the lease but has not confirmed it is caught up with the log.
    Promoting,
    Leader,
    /// Gave up or lost the lease and is settling its own state.
    Demoting,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Follower => f.write_str("follower"),
            Self::Promoting => f.write_str("promoting"),
            Self::Leader => f.write_str("leader"),
            Self::Demoting => f.write_str("demoting"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Retries for state reads and resets that have to succeed eventually.
    pub state_retry: Policy,
    /// Pause after a failed log read, or after an entry that could not be
    /// applied.
    pub error_pause: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_retry: Policy::unbounded(),
            error_pause: Duration::from_secs(1),
        }
    }
}

pub struct Manager<E, S, L> {
    builder: BlockBuilder<E, S>,
    lease: L,
    events: mpsc::UnboundedReceiver<LeaseEvent>,
    config: Config,
}

impl<E, S, L> Manager<E, S, L>
where
    E: ExecutionEngine,
    S: ReplicatedState,
    L: LeaderLease + Clone,
{
    /// The builder's cancellation token doubles as the manager's shutdown
    /// signal.
    pub fn new(
        builder: BlockBuilder<E, S>,
        lease: L,
        events: mpsc::UnboundedReceiver<LeaseEvent>,
        config: Config,
    ) -> Self {
        Self {
            builder,
            lease,
            events,
            config,
        }
    }

    pub fn spawn(self) -> ManagerHandle<L> {
        let cancel = self.builder.cancellation().clone();
        let (leader_tx, leader_rx) = watch::channel(false);
        let (role_tx, role_rx) = watch::channel(Role::Follower);

        let election = tokio::spawn(elect(self.events, leader_tx, cancel.clone()));
        let worker = Worker {
            instance_id: self.builder.state().instance_id().to_owned(),
            builder: self.builder,
            lease: self.lease.clone(),
            leader: leader_rx,
            role: role_tx,
            config: self.config,
            cancel: cancel.clone(),
        };
        let worker = tokio::spawn(worker.run());

        ManagerHandle {
            role: role_rx,
            lease: self.lease,
            cancel,
            worker,
            election,
        }
    }
}

/// Controls a running [`Manager`].
pub struct ManagerHandle<L> {
    role: watch::Receiver<Role>,
    lease: L,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
    election: JoinHandle<()>,
}

impl<L: LeaderLease> ManagerHandle<L> {
    pub fn role(&self) -> Role {
        *self.role.borrow()
    }

    pub fn subscribe_role(&self) -> watch::Receiver<Role> {
        self.role.clone()
    }

    /// Stops the work loop, waiting at most `timeout` for it, then gives up
    /// the lease.
    #[instrument(skip_all, fields(timeout = %display_duration(timeout)), err)]
    pub async fn shutdown(self, timeout: Duration) -> eyre::Result<()> {
        self.cancel.cancel();
        let mut worker = self.worker;
        match tokio::time::timeout(timeout, &mut worker).await {
            Ok(Ok(())) => debug!("work loop stopped"),
            Ok(Err(error)) => warn!(error = error_field(&error), "work loop panicked"),
            Err(_) => {
                warn!("work loop did not stop in time; aborting it");
                worker.abort();
            }
        }
        self.election.abort();
        gauge!("tandem_is_leader").set(0.0);
        self.lease
            .resign()
            .await
            .wrap_err("failed giving up the leadership lease on shutdown")
    }
}

async fn elect(
    mut events: mpsc::UnboundedReceiver<LeaseEvent>,
    leader: watch::Sender<bool>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            LeaseEvent::Promoted => {
                info!("leadership lease acquired");
                leader.send_replace(true);
            }
            LeaseEvent::Demoted => {
                info!("leadership lease released");
                leader.send_replace(false);
            }
            LeaseEvent::Error(error) => {
                warn!(error = error_field(&error), "leadership lease reported an error");
            }
        }
    }
    debug!("election task stopped");
}

/// The work loop was cancelled.
struct Stopped;

struct Worker<E, S, L> {
    instance_id: String,
    builder: BlockBuilder<E, S>,
    lease: L,
    leader: watch::Receiver<bool>,
    role: watch::Sender<Role>,
    config: Config,
    cancel: CancellationToken,
}

impl<E, S, L> Worker<E, S, L>
where
    E: ExecutionEngine,
    S: ReplicatedState,
    L: LeaderLease,
{
    #[instrument(skip_all, fields(instance_id = %self.instance_id))]
    async fn run(mut self) {
        if self.run_until_stopped().await.is_err() {
            info!("work loop cancelled");
        }
        gauge!("tandem_is_leader").set(0.0);
    }

    async fn run_until_stopped(&mut self) -> Result<(), Stopped> {
        self.enter(Role::Follower);
        self.recover().await?;
        self.lease.start();

        let mut role = Role::Follower;
        loop {
            role = match role {
                Role::Follower => self.follow().await?,
                Role::Promoting => self.promote().await?,
                Role::Leader => self.lead().await?,
                Role::Demoting => self.demote().await?,
            };
            self.enter(role);
        }
    }

    fn enter(&self, role: Role) {
        let previous = self.role.send_replace(role);
        if previous != role {
            info!(from = %previous, to = %role, "role changed");
        }
        gauge!("tandem_is_leader").set(if role == Role::Leader { 1.0 } else { 0.0 });
    }

    fn is_leader(&self) -> bool {
        *self.leader.borrow()
    }

    /// Replays the log until the lease is acquired.
    async fn follow(&mut self) -> Result<Role, Stopped> {
        loop {
            if self.is_leader() {
                return Ok(Role::Promoting);
            }
            self.follow_once().await?;
        }
    }

    /// Leads only after reads for pending and for new entries both came back
    /// empty; otherwise hands the lease back until caught up.
    async fn promote(&mut self) -> Result<Role, Stopped> {
        info!("leadership lease acquired; checking the log is fully applied");
        if !self.follow_once().await? {
            info!("log has unapplied entries; resigning until caught up");
            self.resign().await?;
            while !self.follow_once().await? {}
            info!("caught up with the log; competing for leadership again");
            self.lease.start();
            return Ok(Role::Follower);
        }
        if !self.is_leader() {
            return Ok(Role::Follower);
        }

        let state = self.load_build_state().await?;
        info!(step = %state.step, "leading");
        Ok(Role::Leader)
    }

    async fn lead(&mut self) -> Result<Role, Stopped> {
        loop {
            if !self.is_leader() {
                info!("leadership lease lost; stopping block production");
                return Ok(Role::Demoting);
            }
            if self.cancel.is_cancelled() {
                return Err(Stopped);
            }

            let state = match self.builder.state().build_state().await {
                Ok(state) => state,
                Err(error) => {
                    warn!(error = error_field(&error), "failed reading build state");
                    self.pause(self.config.error_pause).await?;
                    continue;
                }
            };

            let result = match state.step {
                BuildStep::BuildBlock => self.build().await,
                BuildStep::FinalizeBlock => self.finalize_own(&state).await,
                BuildStep::Unrecognized(step) => {
                    warn!(step, "build state has an unknown step; resetting it");
                    self.reset().await.map(|()| None)
                }
            };
            if let Some(role) = result? {
                return Ok(role);
            }
        }
    }

    async fn build(&mut self) -> Result<Option<Role>, Stopped> {
        match self.builder.build_block(SystemTime::now()).await {
            Ok(_) => Ok(None),
            Err(Error::EmptyBlock { retry_after }) => {
                let idle = retry_after.min(self.builder.config().build_delay.max(EMPTY_BLOCK_POLL));
                debug!(idle = %display_duration(idle), "nothing to build yet");
                self.pause(idle).await?;
                Ok(None)
            }
            Err(error) => self.leader_failure(error).await,
        }
    }

    async fn finalize_own(&mut self, state: &BuildState) -> Result<Option<Role>, Stopped> {
        match self
            .builder
            .finalize_block(&state.payload_id, &state.encoded_payload, None)
            .await
        {
            Ok(_) => {
                self.reset().await?;
                Ok(None)
            }
            Err(error) if error.is_already_applied() => {
                info!(payload_id = %state.payload_id, "block was already applied; resetting build state");
                self.reset().await?;
                Ok(None)
            }
            Err(error) => self.leader_failure(error).await,
        }
    }

    async fn leader_failure(&mut self, error: Error) -> Result<Option<Role>, Stopped> {
        match error {
            Error::Cancelled => Err(Stopped),
            // the write may have landed even though it reported failure, so
            // the cached build state can no longer be trusted
            error @ Error::State(_) => {
                warn!(error = error_field(&error), "publishing block failed; reloading build state");
                self.pause(self.config.error_pause).await?;
                let state = self.load_build_state().await?;
                info!(step = %state.step, "reloaded build state");
                Ok(None)
            }
            error if error.is_retries_exhausted() => {
                error!(
                    error = error_field(&error),
                    "execution engine unreachable; giving up leadership",
                );
                self.builder.reset_pacing();
                self.resign().await?;
                Ok(Some(Role::Demoting))
            }
            error if error.is_permanent() => {
                error!(error = error_field(&error), "block can never be produced; resetting build state");
                self.reset().await?;
                Ok(None)
            }
            error => {
                warn!(error = error_field(&error), "block production failed; retrying");
                self.pause(self.config.error_pause).await?;
                Ok(None)
            }
        }
    }

    /// Settles the durable build state after leading, then competes for the
    /// lease again.
    async fn demote(&mut self) -> Result<Role, Stopped> {
        self.load_build_state().await?;
        self.recover().await?;
        self.lease.start();
        Ok(Role::Follower)
    }

    /// Reads one batch of entries and applies it. Returns whether both the
    /// pending and the new read came back empty.
    async fn follow_once(&mut self) -> Result<bool, Stopped> {
        let Some(pending) = self.read(ReadKind::Pending).await? else {
            return Ok(false);
        };
        let entries = if pending.is_empty() {
            let Some(new) = self.read(ReadKind::New).await? else {
                return Ok(false);
            };
            if new.is_empty() {
                return Ok(true);
            }
            new
        } else {
            pending
        };

        for entry in entries {
            self.apply(entry).await?;
        }
        Ok(false)
    }

    /// `None` if the read failed.
    async fn read(&mut self, kind: ReadKind) -> Result<Option<Vec<StreamEntry>>, Stopped> {
        let read = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(Stopped),
            read = self.builder.state().read_entries(kind) => read,
        };
        match read {
            Ok(entries) => Ok(Some(entries)),
            Err(error) => {
                warn!(%kind, error = error_field(&error), "failed reading log entries");
                self.pause(self.config.error_pause).await?;
                Ok(None)
            }
        }
    }

    #[instrument(skip_all, fields(entry_id = %entry.id))]
    async fn apply(&mut self, entry: StreamEntry) -> Result<(), Stopped> {
        let parsed = match entry.parse() {
            Ok(parsed) => parsed,
            Err(malformed) => {
                warn!(error = error_field(&malformed), "discarding malformed log entry");
                counter!("tandem_log_entries_discarded_total", "reason" => "malformed").increment(1);
                self.ack(&entry).await;
                return Ok(());
            }
        };

        if parsed.sender_instance_id == self.instance_id {
            debug!("skipping entry published by this instance");
            self.ack(&entry).await;
            return Ok(());
        }

        match self
            .builder
            .finalize_block(&parsed.payload_id, &parsed.encoded_payload, Some(&parsed.id))
            .await
        {
            Ok(_) => self.ack(&entry).await,
            Err(error) if error.is_already_applied() => {
                info!(payload_id = %parsed.payload_id, "entry was already applied");
                self.ack(&entry).await;
            }
            Err(Error::Cancelled) => return Err(Stopped),
            Err(error) => {
                error!(
                    payload_id = %parsed.payload_id,
                    sender = %parsed.sender_instance_id,
                    error = error_field(&error),
                    "failed applying log entry; leaving it for redelivery",
                );
                self.pause(self.config.error_pause).await?;
            }
        }
        Ok(())
    }

    /// Failures are only logged; an unacknowledged entry is delivered again
    /// and then recognized as applied.
    async fn ack(&self, entry: &StreamEntry) {
        if let Err(error) = self.builder.state().ack_entry(&entry.id).await {
            warn!(entry_id = %entry.id, error = error_field(&error), "failed acknowledging log entry");
        }
    }

    async fn recover(&mut self) -> Result<(), Stopped> {
        match self.builder.recover_last_payload().await {
            Ok(()) => Ok(()),
            Err(Error::Cancelled) => Err(Stopped),
            Err(error) => {
                error!(error = error_field(&error), "failed recovering the last built block");
                Ok(())
            }
        }
    }

    async fn load_build_state(&self) -> Result<BuildState, Stopped> {
        let state = self.builder.state();
        retry(&self.config.state_retry, &self.cancel, || async move {
            Outcome::from(state.load_build_state().await.map_err(Error::State))
        })
        .await
        .map_err(|error| self.state_failure("load_build_state", error))
    }

    async fn reset(&self) -> Result<(), Stopped> {
        let state = self.builder.state();
        retry(&self.config.state_retry, &self.cancel, || async move {
            Outcome::from(state.reset_build_state().await.map_err(Error::State))
        })
        .await
        .map_err(|error| self.state_failure("reset_build_state", error))
    }

    fn state_failure(&self, operation: &'static str, error: RetryError<Error>) -> Stopped {
        if !error.is_cancelled() {
            error!(operation, error = error_field(&error), "giving up on the replicated state");
        }
        Stopped
    }

    async fn resign(&mut self) -> Result<(), Stopped> {
        if let Err(error) = self.lease.resign().await {
            warn!(error = error_field(&error), "failed releasing the leadership lease");
        }
        self.wait_until_not_leader().await
    }

    async fn wait_until_not_leader(&mut self) -> Result<(), Stopped> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Stopped),
            changed = self.leader.wait_for(|leader| !leader) => changed.map(|_| ()).map_err(|_| Stopped),
        }
    }

    async fn pause(&self, duration: Duration) -> Result<(), Stopped> {
        if sleep_or_cancel(duration, &self.cancel).await {
            Ok(())
        } else {
            Err(Stopped)
        }
    }
}
