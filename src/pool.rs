//! Pool of ephemeral proxy leases.

use crate::clock::{self, Clock};
use crate::config::LeasePoolConfig;
use crate::error::PoolError;
use crate::lease::ProxyLease;
use crate::provider::{LeaseGrant, LeaseProvider};
use crate::task::BackgroundTask;

use futures::future::{self, BoxFuture, FutureExt, Shared};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;

type InitFuture = Shared<BoxFuture<'static, Result<usize, PoolError>>>;

enum InitState {
    Uninitialized,
    Initializing(InitFuture),
    Ready,
}

/// Observable lifecycle of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Uninitialized,
    Initializing,
    Ready,
}

/// A warm set of short-lived proxy leases kept alive by periodic renewal.
pub struct LeasePool {
    /// All leases, live or not.
    leases: RwLock<Vec<ProxyLease>>,
    /// Configuration for the pool.
    pub config: LeasePoolConfig,
    provider: Arc<dyn LeaseProvider>,
    clock: Arc<dyn Clock>,
    init: Mutex<InitState>,
    renewal: Mutex<Option<BackgroundTask>>,
}

impl LeasePool {
    /// Create an empty pool. Nothing is acquired until `initialize` is called.
    pub fn new(
        provider: Arc<dyn LeaseProvider>,
        clock: Arc<dyn Clock>,
        config: LeasePoolConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            leases: RwLock::new(Vec::new()),
            config,
            provider,
            clock,
            init: Mutex::new(InitState::Uninitialized),
            renewal: Mutex::new(None),
        })
    }

    /// Acquire the pool's leases and start renewal, once.
    ///
    /// Concurrent callers share the same in-flight warm-up. Returns the number of
    /// leases held. A warm-up that acquires nothing leaves the pool uninitialized,
    /// so a later call starts over.
    pub async fn initialize(self: &Arc<Self>) -> Result<usize, PoolError> {
        let in_flight = {
            let mut init = self.init.lock();
            match &*init {
                InitState::Ready => return Ok(self.leases.read().len()),
                InitState::Initializing(fut) => fut.clone(),
                InitState::Uninitialized => {
                    let pool = Arc::clone(self);
                    let fut = async move { pool.warm_up().await }.boxed().shared();
                    *init = InitState::Initializing(fut.clone());
                    fut
                }
            }
        };

        in_flight.await
    }

    async fn warm_up(self: Arc<Self>) -> Result<usize, PoolError> {
        let size = self.config.pool_size;
        info!("Acquiring {} proxy leases", size);

        let results = future::join_all((0..size).map(|_| self.provider.acquire())).await;

        let mut acquired = Vec::with_capacity(size);
        for result in results {
            match result {
                Ok(grant) => acquired.push(self.lease_from(grant)),
                Err(e) => warn!("Failed to acquire proxy lease: {}", e),
            }
        }

        if acquired.is_empty() {
            error!("Proxy pool warm-up failed: 0/{} leases acquired", size);
            *self.init.lock() = InitState::Uninitialized;
            return Err(PoolError::NoLeasesAcquired { attempted: size });
        }

        let count = acquired.len();
        if count < size {
            warn!("Proxy pool running short: {}/{} leases acquired", count, size);
        }

        *self.leases.write() = acquired;
        *self.init.lock() = InitState::Ready;
        self.start_renewal();

        info!("Proxy pool ready with {} leases", count);
        Ok(count)
    }

    fn lease_from(&self, grant: LeaseGrant) -> ProxyLease {
        ProxyLease::new(
            grant.id,
            grant.host,
            grant.port,
            grant.expires_at,
            self.config.max_requests_per_second,
        )
        .with_location(grant.country, grant.country_code)
    }

    fn start_renewal(self: &Arc<Self>) {
        let task = BackgroundTask::spawn_periodic(
            "lease-renewal",
            self.config.renewal_interval,
            Arc::downgrade(self),
            |pool: Arc<LeasePool>| async move {
                pool.renew_expiring().await;
            },
        );
        *self.renewal.lock() = Some(task);
    }

    /// Extend every lease closer to expiry than the renewal margin.
    ///
    /// Failed renewals keep their old expiry and come up again next cycle.
    /// Returns the number of leases renewed.
    pub async fn renew_expiring(&self) -> usize {
        let now = self.clock.now();
        let margin = clock::delta(self.config.renewal_margin);

        let due: Vec<String> = self
            .leases
            .read()
            .iter()
            .filter(|lease| lease.remaining_at(now) < margin)
            .map(|lease| lease.id.clone())
            .collect();

        if due.is_empty() {
            debug!("No proxy leases due for renewal");
            return 0;
        }

        info!("Renewing {} proxy leases", due.len());

        let results = future::join_all(due.iter().map(|id| async move {
            (id, self.provider.extend(id).await)
        }))
        .await;

        let mut renewed = 0;
        let mut leases = self.leases.write();
        for (id, result) in results {
            match result {
                Ok(grant) => {
                    if let Some(lease) = leases.iter_mut().find(|l| &l.id == id) {
                        lease.expires_at = lease.expires_at.max(grant.expires_at);
                        renewed += 1;
                    }
                }
                Err(e) => warn!("Failed to renew proxy lease {}: {}", id, e),
            }
        }

        info!("Lease renewal completed: {}/{} renewed", renewed, due.len());
        renewed
    }

    /// A uniformly random unexpired lease.
    pub fn get_random_proxy(&self) -> Result<ProxyLease, PoolError> {
        self.get_random_proxy_excluding(&HashSet::new())
    }

    /// A uniformly random unexpired lease whose id is not in `tried`.
    pub fn get_random_proxy_excluding(
        &self,
        tried: &HashSet<String>,
    ) -> Result<ProxyLease, PoolError> {
        let now = self.clock.now();
        let leases = self.leases.read();

        let live: Vec<&ProxyLease> = leases
            .iter()
            .filter(|l| l.is_live_at(now) && !tried.contains(&l.id))
            .collect();

        if live.is_empty() {
            return Err(PoolError::NoValidProxies);
        }

        let idx = rand::rng().random_range(0..live.len());
        Ok(live[idx].clone())
    }

    /// Get statistics about the pool as `(total, live)`.
    pub fn get_stats(&self) -> (usize, usize) {
        let now = self.clock.now();
        let leases = self.leases.read();
        let live = leases.iter().filter(|l| l.is_live_at(now)).count();
        (leases.len(), live)
    }

    pub fn state(&self) -> PoolState {
        match &*self.init.lock() {
            InitState::Uninitialized => PoolState::Uninitialized,
            InitState::Initializing(_) => PoolState::Initializing,
            InitState::Ready => PoolState::Ready,
        }
    }

    /// Stop the renewal task. Leases stay in place until they expire.
    pub fn shutdown(&self) {
        if let Some(mut task) = self.renewal.lock().take() {
            task.shutdown();
        }
    }
}
