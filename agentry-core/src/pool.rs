// ABOUTME: Per-backend bounded pools of constructed instances with exclusive checkout.
// ABOUTME: Guards return instances on drop; unhealthy or quarantined instances are destroyed instead.

use crate::descriptor::AgentDescriptor;
use crate::error::{RuntimeError, RuntimeResult};
use crate::factory::{AgentFactory, AgentInstance};
use crate::metrics;
use agentry_agent::{AgentConfig, HealthState, HealthStatus};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use uuid::Uuid;

pub const DEFAULT_MAX_POOL_SIZE: usize = 5;
pub const DEFAULT_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-backend pool configuration
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_size: usize,
    /// Caller configuration handed to the factory for every instance
    pub config: AgentConfig,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_POOL_SIZE,
            config: AgentConfig::new(),
        }
    }
}

impl PoolSettings {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }
}

/// Point-in-time view of one pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub backend_id: String,
    pub max_size: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Instances alive in any state, including ones being built
    pub live: usize,
    pub created: u64,
    pub destroyed: u64,
    pub checkouts: u64,
    pub exhausted: u64,
    pub evicted: u64,
}

/// Latest health sample for one pooled instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceHealth {
    pub instance_id: Uuid,
    pub status: HealthStatus,
}

/// Outcome of probing a pool's idle instances
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeSummary {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub evicted: usize,
}

struct BackendPool {
    backend_id: String,
    /// Registration this pool builds instances from
    descriptor: Arc<AgentDescriptor>,
    settings: PoolSettings,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<AgentInstance>>,
    live: AtomicUsize,
    in_use: AtomicUsize,
    /// Woken whenever an instance is returned or a slot frees up
    changed: Notify,
    health_board: Mutex<HashMap<Uuid, HealthStatus>>,
    /// Set once the pool has been replaced or shut down; returns are destroyed
    retired: AtomicBool,
    created: AtomicU64,
    destroyed: AtomicU64,
    checkouts: AtomicU64,
    exhausted: AtomicU64,
    evicted: AtomicU64,
}

enum Claim {
    Idle(AgentInstance),
    Construct,
    Replace(AgentInstance),
    Wait,
}

impl BackendPool {
    fn new(descriptor: Arc<AgentDescriptor>, settings: PoolSettings) -> Self {
        let max_size = settings.max_size.max(1);
        Self {
            backend_id: descriptor.id.clone(),
            descriptor,
            settings: PoolSettings {
                max_size,
                ..settings
            },
            permits: Arc::new(Semaphore::new(max_size)),
            idle: Mutex::new(VecDeque::new()),
            live: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            changed: Notify::new(),
            health_board: Mutex::new(HashMap::new()),
            retired: AtomicBool::new(false),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            checkouts: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, VecDeque<AgentInstance>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_board(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, HealthStatus>> {
        self.health_board.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Decide what a permit holder should do next. Slot accounting happens
    /// under the idle lock so two claimers cannot both take the last slot.
    fn claim(&self) -> Claim {
        let mut idle = self.lock_idle();
        if let Some(pos) = idle.iter().position(|i| i.is_eligible()) {
            if let Some(instance) = idle.remove(pos) {
                return Claim::Idle(instance);
            }
        }
        if self.live.load(Ordering::SeqCst) < self.settings.max_size {
            self.live.fetch_add(1, Ordering::SeqCst);
            return Claim::Construct;
        }
        match idle.pop_front() {
            Some(stale) => Claim::Replace(stale),
            None => Claim::Wait,
        }
    }

    fn push_idle(&self, instance: AgentInstance) {
        self.lock_idle().push_back(instance);
        self.publish_occupancy();
        self.changed.notify_waiters();
    }

    fn record_health(&self, instance_id: Uuid, status: HealthStatus) {
        self.lock_board().insert(instance_id, status);
    }

    /// Bookkeeping after an instance has been torn down
    fn forget(&self, instance_id: Uuid) {
        self.lock_board().remove(&instance_id);
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn release_slot(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.publish_occupancy();
        self.changed.notify_waiters();
    }

    fn publish_occupancy(&self) {
        let idle = self.lock_idle().len();
        metrics::pool_occupancy(&self.backend_id, idle, self.in_use.load(Ordering::SeqCst));
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            backend_id: self.backend_id.clone(),
            max_size: self.settings.max_size,
            idle: self.lock_idle().len(),
            in_use: self.in_use.load(Ordering::SeqCst),
            live: self.live.load(Ordering::SeqCst),
            created: self.created.load(Ordering::SeqCst),
            destroyed: self.destroyed.load(Ordering::SeqCst),
            checkouts: self.checkouts.load(Ordering::SeqCst),
            exhausted: self.exhausted.load(Ordering::SeqCst),
            evicted: self.evicted.load(Ordering::SeqCst),
        }
    }

    fn should_recycle(&self, instance: &AgentInstance) -> bool {
        instance.is_eligible() && !self.retired.load(Ordering::SeqCst)
    }
}

/// A live-slot reservation that is given back unless the instance it was
/// reserved for makes it into the pool's accounting
struct SlotReservation<'a> {
    pool: &'a BackendPool,
    armed: bool,
}

impl<'a> SlotReservation<'a> {
    fn new(pool: &'a BackendPool) -> Self {
        Self { pool, armed: true }
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release_slot();
        }
    }
}

/// Exclusive lease on a pooled instance.
///
/// Dropping the guard returns the instance on every exit path; prefer
/// [`PooledAgent::checkin`] where an async context is available so teardown
/// of a failing instance completes before the caller moves on.
pub struct PooledAgent {
    instance: Option<AgentInstance>,
    pool: Arc<BackendPool>,
    factory: Arc<AgentFactory>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledAgent").finish_non_exhaustive()
    }
}

impl PooledAgent {
    fn new(
        pool: Arc<BackendPool>,
        factory: Arc<AgentFactory>,
        instance: AgentInstance,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        pool.in_use.fetch_add(1, Ordering::SeqCst);
        pool.checkouts.fetch_add(1, Ordering::SeqCst);
        pool.publish_occupancy();
        Self {
            instance: Some(instance),
            pool,
            factory,
            _permit: permit,
        }
    }

    fn inner(&self) -> &AgentInstance {
        self.instance
            .as_ref()
            .expect("pooled instance is present until released")
    }

    fn inner_mut(&mut self) -> &mut AgentInstance {
        self.instance
            .as_mut()
            .expect("pooled instance is present until released")
    }

    /// Probe the leased instance now and record the result
    pub async fn probe(&mut self) -> HealthStatus {
        let factory = self.factory.clone();
        let status = factory.probe(self.inner_mut()).await;
        let instance_id = self.inner().instance_id();
        self.pool.record_health(instance_id, status.clone());
        status
    }

    /// Return the instance, destroying it first if it is no longer fit
    pub async fn checkin(mut self) {
        let Some(mut instance) = self.instance.take() else {
            return;
        };
        self.pool.in_use.fetch_sub(1, Ordering::SeqCst);
        if self.pool.should_recycle(&instance) {
            self.pool.push_idle(instance);
            return;
        }
        tracing::info!(
            backend = %self.pool.backend_id,
            instance = %instance.instance_id(),
            consecutive_failures = instance.health().consecutive_failures(),
            "Destroying instance on checkin"
        );
        self.factory.destroy(&mut instance).await;
        self.pool.forget(instance.instance_id());
        self.pool.release_slot();
    }
}

impl Deref for PooledAgent {
    type Target = AgentInstance;

    fn deref(&self) -> &Self::Target {
        self.inner()
    }
}

impl DerefMut for PooledAgent {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner_mut()
    }
}

impl Drop for PooledAgent {
    fn drop(&mut self) {
        let Some(mut instance) = self.instance.take() else {
            return;
        };
        self.pool.in_use.fetch_sub(1, Ordering::SeqCst);
        if self.pool.should_recycle(&instance) {
            self.pool.push_idle(instance);
            return;
        }

        let pool = self.pool.clone();
        let factory = self.factory.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    factory.destroy(&mut instance).await;
                    pool.forget(instance.instance_id());
                    pool.release_slot();
                });
            }
            Err(_) => {
                tracing::warn!(
                    backend = %pool.backend_id,
                    instance = %instance.instance_id(),
                    "No runtime available, dropping instance without shutdown"
                );
                pool.forget(instance.instance_id());
                pool.release_slot();
            }
        }
    }
}

/// Owns one bounded pool per backend id
pub struct PoolManager {
    factory: Arc<AgentFactory>,
    pools: DashMap<String, Arc<BackendPool>>,
    settings: DashMap<String, PoolSettings>,
    default_max_size: usize,
    checkout_timeout: Duration,
}

impl PoolManager {
    pub fn new(factory: Arc<AgentFactory>) -> Self {
        Self {
            factory,
            pools: DashMap::new(),
            settings: DashMap::new(),
            default_max_size: DEFAULT_MAX_POOL_SIZE,
            checkout_timeout: DEFAULT_CHECKOUT_TIMEOUT,
        }
    }

    pub fn with_default_max_size(mut self, max_size: usize) -> Self {
        self.default_max_size = max_size.max(1);
        self
    }

    pub fn with_checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }

    pub fn factory(&self) -> &Arc<AgentFactory> {
        &self.factory
    }

    pub fn checkout_timeout(&self) -> Duration {
        self.checkout_timeout
    }

    fn settings_for(&self, id: &str) -> PoolSettings {
        self.settings
            .get(id)
            .map(|s| s.value().clone())
            .unwrap_or_else(|| PoolSettings::default().with_max_size(self.default_max_size))
    }

    /// Pool for the registration currently held under `id`. A pool built
    /// for an earlier registration of the same id is swapped out and
    /// returned so the caller can retire it.
    fn pool_for(&self, descriptor: Arc<AgentDescriptor>) -> (Arc<BackendPool>, Option<Arc<BackendPool>>) {
        let id = descriptor.id.clone();
        if let Some(pool) = self.pools.get(&id) {
            if Arc::ptr_eq(&pool.descriptor, &descriptor) {
                return (pool.value().clone(), None);
            }
        }
        match self.pools.entry(id.clone()) {
            Entry::Occupied(mut slot) if !Arc::ptr_eq(&slot.get().descriptor, &descriptor) => {
                let fresh = Arc::new(BackendPool::new(descriptor, self.settings_for(&id)));
                let stale = slot.insert(fresh.clone());
                (fresh, Some(stale))
            }
            Entry::Occupied(slot) => (slot.get().clone(), None),
            Entry::Vacant(slot) => {
                let fresh = Arc::new(BackendPool::new(descriptor, self.settings_for(&id)));
                slot.insert(fresh.clone());
                (fresh, None)
            }
        }
    }

    /// Resolve `id` in the registry and return its pool, retiring any pool
    /// left over from a previous registration
    async fn current_pool(&self, id: &str) -> RuntimeResult<Arc<BackendPool>> {
        let descriptor = self.factory.registry().get(id)?;
        let (pool, stale) = self.pool_for(descriptor);
        if let Some(stale) = stale {
            tracing::info!(backend = %id, "Backend re-registered, retiring previous pool");
            self.retire(&stale).await;
        }
        Ok(pool)
    }

    /// Set pool size and caller configuration for one backend. An existing
    /// pool is retired: idle instances are destroyed now, leased ones when
    /// they come back.
    pub async fn configure(&self, id: &str, settings: PoolSettings) {
        tracing::debug!(backend = %id, max_size = settings.max_size, "Configuring pool");
        self.settings.insert(id.to_string(), settings);
        if let Some((_, old)) = self.pools.remove(id) {
            self.retire(&old).await;
        }
    }

    /// Lease an instance of backend `id`, constructing one if the pool has
    /// room, otherwise waiting up to the checkout timeout
    pub async fn checkout(&self, id: &str) -> RuntimeResult<PooledAgent> {
        let pool = self.current_pool(id).await?;
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.checkout_timeout;

        let permit = match tokio::time::timeout_at(deadline, pool.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => return Err(self.exhausted(&pool, started)),
        };

        loop {
            let changed = pool.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            match pool.claim() {
                Claim::Idle(instance) => {
                    metrics::checkout(id, "reused", started.elapsed());
                    return Ok(PooledAgent::new(pool.clone(), self.factory.clone(), instance, permit));
                }
                Claim::Construct => {
                    let slot = SlotReservation::new(&pool);
                    let instance = self.construct(&pool, started).await?;
                    slot.keep();
                    return Ok(PooledAgent::new(pool.clone(), self.factory.clone(), instance, permit));
                }
                Claim::Replace(mut stale) => {
                    let slot = SlotReservation::new(&pool);
                    tracing::debug!(
                        backend = %id,
                        instance = %stale.instance_id(),
                        "Replacing ineligible idle instance"
                    );
                    self.factory.destroy(&mut stale).await;
                    pool.forget(stale.instance_id());
                    let instance = self.construct(&pool, started).await?;
                    slot.keep();
                    return Ok(PooledAgent::new(pool.clone(), self.factory.clone(), instance, permit));
                }
                Claim::Wait => {
                    if tokio::time::timeout_at(deadline, changed).await.is_err() {
                        return Err(self.exhausted(&pool, started));
                    }
                }
            }
        }
    }

    async fn construct(&self, pool: &BackendPool, started: Instant) -> RuntimeResult<AgentInstance> {
        match self
            .factory
            .create_from(pool.descriptor.clone(), &pool.settings.config)
            .await
        {
            Ok(instance) => {
                pool.created.fetch_add(1, Ordering::SeqCst);
                if let Some(status) = instance.health().latest() {
                    pool.record_health(instance.instance_id(), status.clone());
                }
                metrics::checkout(&pool.backend_id, "constructed", started.elapsed());
                Ok(instance)
            }
            Err(e) => {
                metrics::checkout(&pool.backend_id, "failed", started.elapsed());
                Err(e)
            }
        }
    }

    fn exhausted(&self, pool: &BackendPool, started: Instant) -> RuntimeError {
        let waited = started.elapsed();
        pool.exhausted.fetch_add(1, Ordering::SeqCst);
        metrics::checkout(&pool.backend_id, "exhausted", waited);
        tracing::warn!(
            backend = %pool.backend_id,
            waited_ms = waited.as_millis() as u64,
            in_use = pool.in_use.load(Ordering::SeqCst),
            "Pool exhausted"
        );
        RuntimeError::PoolExhausted {
            backend: pool.backend_id.clone(),
            waited,
        }
    }

    /// Eagerly construct up to `count` idle instances, bounded by free
    /// capacity. Returns how many were built.
    pub async fn warm_up(&self, id: &str, count: usize) -> RuntimeResult<usize> {
        let pool = self.current_pool(id).await?;
        let started = Instant::now();
        let mut built = 0;

        while built < count {
            {
                let _idle = pool.lock_idle();
                if pool.live.load(Ordering::SeqCst) >= pool.settings.max_size {
                    break;
                }
                pool.live.fetch_add(1, Ordering::SeqCst);
            }
            let slot = SlotReservation::new(&pool);
            let instance = self.construct(&pool, started).await?;
            slot.keep();
            pool.push_idle(instance);
            built += 1;
        }

        tracing::info!(backend = %id, requested = count, built, "Warmed pool");
        Ok(built)
    }

    pub fn stats(&self, id: &str) -> Option<PoolStats> {
        self.pools.get(id).map(|p| p.value().stats())
    }

    /// Stats for every pool, sorted by backend id
    pub fn all_stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<_> = self.pools.iter().map(|p| p.value().stats()).collect();
        stats.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));
        stats
    }

    /// Latest recorded health of every live instance of backend `id`
    pub fn health_board(&self, id: &str) -> Vec<InstanceHealth> {
        let Some(pool) = self.pools.get(id).map(|p| p.value().clone()) else {
            return Vec::new();
        };
        let board = pool.lock_board();
        let mut entries: Vec<_> = board
            .iter()
            .map(|(instance_id, status)| InstanceHealth {
                instance_id: *instance_id,
                status: status.clone(),
            })
            .collect();
        entries.sort_by_key(|e| e.instance_id);
        entries
    }

    /// Backend ids that currently have a pool, sorted
    pub fn pool_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.pools.iter().map(|p| p.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Probe every idle instance of backend `id`. Instances that have now
    /// failed twice in a row are destroyed; the rest go back to idle.
    pub async fn probe_idle(&self, id: &str) -> ProbeSummary {
        let Some(pool) = self.pools.get(id).map(|p| p.value().clone()) else {
            return ProbeSummary::default();
        };
        let drained: Vec<AgentInstance> = pool.lock_idle().drain(..).collect();
        if drained.is_empty() {
            return ProbeSummary::default();
        }

        let factory = &self.factory;
        let probed = futures::future::join_all(drained.into_iter().map(|mut instance| async move {
            let status = factory.probe(&mut instance).await;
            (instance, status)
        }))
        .await;

        let mut summary = ProbeSummary::default();
        for (mut instance, status) in probed {
            match status.state {
                HealthState::Healthy => summary.healthy += 1,
                HealthState::Degraded => summary.degraded += 1,
                HealthState::Unhealthy => summary.unhealthy += 1,
            }

            if instance.health().is_quarantined() || pool.retired.load(Ordering::SeqCst) {
                summary.evicted += 1;
                pool.evicted.fetch_add(1, Ordering::SeqCst);
                metrics::eviction(id);
                tracing::warn!(
                    backend = %id,
                    instance = %instance.instance_id(),
                    consecutive_failures = instance.health().consecutive_failures(),
                    "Evicting instance after repeated health failures"
                );
                self.factory.destroy(&mut instance).await;
                pool.forget(instance.instance_id());
                pool.release_slot();
            } else {
                pool.record_health(instance.instance_id(), status);
                pool.push_idle(instance);
            }
        }
        summary
    }

    async fn retire(&self, pool: &BackendPool) {
        pool.retired.store(true, Ordering::SeqCst);
        let drained: Vec<AgentInstance> = pool.lock_idle().drain(..).collect();
        for mut instance in drained {
            self.factory.destroy(&mut instance).await;
            pool.forget(instance.instance_id());
            pool.release_slot();
        }
    }

    /// Drop the pool of backend `id`, typically after it was unregistered.
    /// Idle instances are destroyed now, leased ones when they come back.
    /// Returns whether a pool existed.
    pub async fn remove(&self, id: &str) -> bool {
        let Some((_, pool)) = self.pools.remove(id) else {
            return false;
        };
        let in_use = pool.in_use.load(Ordering::SeqCst);
        self.retire(&pool).await;
        tracing::info!(backend = %id, still_leased = in_use, "Pool removed");
        true
    }

    /// Destroy every idle instance and retire all pools
    pub async fn shutdown(&self) {
        let ids = self.pool_ids();
        for id in ids {
            if let Some((_, pool)) = self.pools.remove(&id) {
                let in_use = pool.in_use.load(Ordering::SeqCst);
                self.retire(&pool).await;
                tracing::info!(backend = %id, still_leased = in_use, "Pool shut down");
            }
        }
    }
}
