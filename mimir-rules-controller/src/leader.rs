//! Leader election over a `coordination.k8s.io/v1` Lease.
//!
//! Only one replica holds the lease at a time. Every write is a conditional
//! write guarded by the lease's resourceVersion: if the record changed between
//! read and write the update fails with a conflict and nothing is acquired.
//! Correctness depends on the lease store's consistency and on roughly
//! synchronized clocks, not on any in-process arbitration.
//!
//! The coordinator does not call back into the controller. It reports its
//! [`LeaderState`] transitions and observed leader changes as [`LeaderEvent`]s
//! over a channel and leaves it to the supervisor to start or stop work.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta},
    chrono::{self, DateTime, Utc},
};
use kube::{
    Api, Client,
    api::PostParams,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{MANAGER, errors::ExtKubeApiError};

#[derive(thiserror::Error, Debug)]
pub(crate) enum LeaderElectionError {
    /// The lease was modified concurrently, the conditional write was rejected.
    #[error("lease was modified concurrently")]
    Conflict,
    #[error("invalid leader election configuration: {0}")]
    Config(String),
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// Store independent view of a lease.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct LeaseRecord {
    pub holder: Option<String>,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    pub lease_duration: Duration,
    pub transitions: i32,
    /// Version the record was read at, `None` if it was never stored.
    pub version: Option<String>,
}

impl LeaseRecord {
    /// `true` if someone holds the lease and it has not expired at `now`.
    pub fn is_held(&self, now: DateTime<Utc>) -> bool {
        let holder = self.holder.as_deref().is_some_and(|h| !h.is_empty());
        let lease_duration = chrono::Duration::milliseconds(self.lease_duration.as_millis() as i64);
        match self.renew_time {
            Some(renewed) => holder && now < renewed + lease_duration,
            None => false,
        }
    }

    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder.as_deref() == Some(identity)
    }
}

/// Lease store with compare-and-swap writes.
#[async_trait]
pub(crate) trait LeaseStore: Send + Sync {
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaderElectionError>;

    /// Create the lease, fails with [`LeaderElectionError::Conflict`] if it exists.
    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord, LeaderElectionError>;

    /// Update the lease, fails with [`LeaderElectionError::Conflict`] unless
    /// `record.version` is the current version.
    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord, LeaderElectionError>;
}

pub(crate) trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub(crate) struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub(crate) struct KubeLeaseStore {
    api: Api<Lease>,
    name: String,
}

impl KubeLeaseStore {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }

    fn to_lease(&self, record: &LeaseRecord) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                resource_version: record.version.clone(),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: record.holder.clone(),
                acquire_time: record.acquire_time.map(MicroTime),
                renew_time: record.renew_time.map(MicroTime),
                lease_duration_seconds: Some(record.lease_duration.as_secs() as i32),
                lease_transitions: Some(record.transitions),
                ..Default::default()
            }),
        }
    }
}

fn from_lease(lease: Lease) -> LeaseRecord {
    let spec = lease.spec.unwrap_or_default();
    LeaseRecord {
        holder: spec.holder_identity.filter(|h| !h.is_empty()),
        acquire_time: spec.acquire_time.map(|t| t.0),
        renew_time: spec.renew_time.map(|t| t.0),
        lease_duration: Duration::from_secs(spec.lease_duration_seconds.unwrap_or(0).max(0) as u64),
        transitions: spec.lease_transitions.unwrap_or(0),
        version: lease.metadata.resource_version,
    }
}

fn conflict_or(e: kube::Error) -> LeaderElectionError {
    if e.is_conflict() {
        LeaderElectionError::Conflict
    } else {
        LeaderElectionError::Kube(e)
    }
}

fn post_params() -> PostParams {
    let mut pp = PostParams::default();
    pp.field_manager = Some(MANAGER.to_string());
    pp
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaderElectionError> {
        Ok(self.api.get_opt(self.name.as_str()).await?.map(from_lease))
    }

    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord, LeaderElectionError> {
        let mut lease = self.to_lease(record);
        lease.metadata.resource_version = None;
        self.api
            .create(&post_params(), &lease)
            .await
            .map(from_lease)
            .map_err(conflict_or)
    }

    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord, LeaderElectionError> {
        if record.version.is_none() {
            return Err(LeaderElectionError::Conflict);
        }
        self.api
            .replace(self.name.as_str(), &post_params(), &self.to_lease(record))
            .await
            .map(from_lease)
            .map_err(conflict_or)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct LeaderConfig {
    pub identity: String,
    pub lease_duration: Duration,
    /// Give up leadership if the lease could not be renewed for this long.
    pub renew_deadline: Duration,
    /// Pause between acquire and renew attempts.
    pub retry_period: Duration,
}

impl LeaderConfig {
    pub fn validate(&self) -> Result<(), LeaderElectionError> {
        if self.identity.is_empty() {
            return Err(LeaderElectionError::Config("identity must not be empty".to_string()));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(LeaderElectionError::Config(format!(
                "lease duration ({:?}) must be greater than renew deadline ({:?})",
                self.lease_duration, self.renew_deadline
            )));
        }
        if self.retry_period.is_zero() || self.renew_deadline <= self.retry_period {
            return Err(LeaderElectionError::Config(format!(
                "renew deadline ({:?}) must be greater than retry period ({:?}) and the retry period must not be zero",
                self.renew_deadline, self.retry_period
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LeaderState {
    /// Waiting to acquire the lease.
    Standby,
    /// Holding the lease.
    Leading,
    /// Leadership ended (lost or released), the coordinator does not try again.
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum LeaderEvent {
    Transition(LeaderState),
    /// The observed lease holder changed, reported for every participant including ourselves.
    NewLeader(String),
}

pub(crate) struct LeaderCoordinator {
    config: LeaderConfig,
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    observed_holder: Option<String>,
    events: mpsc::UnboundedSender<LeaderEvent>,
}

impl LeaderCoordinator {
    pub fn new(
        config: LeaderConfig,
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LeaderEvent>), LeaderElectionError> {
        config.validate()?;
        let (events, rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                config,
                store,
                clock,
                observed_holder: None,
                events,
            },
            rx,
        ))
    }

    fn emit(&self, event: LeaderEvent) {
        if self.events.send(event).is_err() {
            debug!("no receiver for leader events");
        }
    }

    fn observe(&mut self, record: &LeaseRecord) {
        let holder = record.holder.clone().filter(|_| record.is_held(self.clock.now()));
        if holder != self.observed_holder {
            self.observed_holder = holder.clone();
            if let Some(holder) = holder {
                self.emit(LeaderEvent::NewLeader(holder));
            }
        }
    }

    /// Acquire the lease if it is free or expired, renew it if we hold it.
    ///
    /// Returns `Ok(false)` if someone else holds an unexpired lease.
    pub async fn try_acquire_or_renew(&mut self) -> Result<bool, LeaderElectionError> {
        let now = self.clock.now();
        let identity = self.config.identity.clone();
        let identity = identity.as_str();
        let stored = match self.store.get().await? {
            None => {
                let record = LeaseRecord {
                    holder: Some(identity.to_string()),
                    acquire_time: Some(now),
                    renew_time: Some(now),
                    lease_duration: self.config.lease_duration,
                    transitions: 0,
                    version: None,
                };
                self.store.create(&record).await?
            }
            Some(current) => {
                self.observe(&current);
                let held_by_us = current.is_held_by(identity);
                if !held_by_us && current.is_held(now) {
                    return Ok(false);
                }
                let mut next = current.clone();
                if !held_by_us {
                    next.holder = Some(identity.to_string());
                    next.acquire_time = Some(now);
                    next.transitions = current.transitions.saturating_add(1);
                }
                next.renew_time = Some(now);
                next.lease_duration = self.config.lease_duration;
                self.store.update(&next).await?
            }
        };
        self.observe(&stored);
        Ok(true)
    }

    /// Clear the holder so a standby replica can take over without waiting for expiry.
    async fn release(&mut self) -> Result<(), LeaderElectionError> {
        let Some(current) = self.store.get().await? else {
            return Ok(());
        };
        if !current.is_held_by(self.config.identity.as_str()) {
            return Ok(());
        }
        let mut released = current;
        released.holder = None;
        released.renew_time = Some(self.clock.now());
        self.store.update(&released).await?;
        self.observed_holder = None;
        Ok(())
    }

    /// Sleep for one retry period, returns `false` if cancelled meanwhile.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.retry_period) => true,
        }
    }

    /// Run one leadership lifecycle: wait for the lease, hold it until it is
    /// lost or `cancel` fires, then stop.
    ///
    /// Fails only if the lease store cannot be reached at startup.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), LeaderElectionError> {
        self.store.get().await?;
        self.emit(LeaderEvent::Transition(LeaderState::Standby));
        info!("{} waiting for leadership", self.config.identity);
        loop {
            if cancel.is_cancelled() {
                self.emit(LeaderEvent::Transition(LeaderState::Stopped));
                return Ok(());
            }
            match self.try_acquire_or_renew().await {
                Ok(true) => break,
                Ok(false) => debug!(
                    "lease held by {}",
                    self.observed_holder.as_deref().unwrap_or("?")
                ),
                Err(LeaderElectionError::Conflict) => debug!("lease acquisition conflict, retrying"),
                Err(e) => warn!("failed to acquire lease, retrying: {}", e),
            }
            if !self.pause(&cancel).await {
                self.emit(LeaderEvent::Transition(LeaderState::Stopped));
                return Ok(());
            }
        }

        info!("{} acquired leadership", self.config.identity);
        self.emit(LeaderEvent::Transition(LeaderState::Leading));
        let mut last_renewal = tokio::time::Instant::now();
        loop {
            if !self.pause(&cancel).await {
                match self.release().await {
                    Ok(()) => info!("{} released leadership", self.config.identity),
                    Err(e) => warn!("failed to release lease: {}", e),
                }
                break;
            }
            let attempt =
                tokio::time::timeout(self.config.renew_deadline, self.try_acquire_or_renew()).await;
            match attempt {
                Ok(Ok(true)) => {
                    debug!("lease renewed");
                    last_renewal = tokio::time::Instant::now();
                    continue;
                }
                Ok(Ok(false)) => {
                    error!(
                        "lease taken over by {}, stopping",
                        self.observed_holder.as_deref().unwrap_or("?")
                    );
                    break;
                }
                Ok(Err(e)) => warn!("failed to renew lease: {}", e),
                Err(_) => warn!("lease renewal timed out"),
            }
            if last_renewal.elapsed() >= self.config.renew_deadline {
                error!(
                    "could not renew lease within {:?}, stopping",
                    self.config.renew_deadline
                );
                break;
            }
        }
        self.emit(LeaderEvent::Transition(LeaderState::Stopped));
        Ok(())
    }
}
