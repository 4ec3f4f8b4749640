//! PostgreSQL connection pool.
//!
//! This module provides a connection pool built on top of [`ResourcePool`].
//! On top of capacity limits it decides, every time a connection comes back,
//! whether it can be reused, has outlived its lifetime, or must be destroyed,
//! and runs a background health check that keeps the pool at its minimum size
//! and retires expired or long-idle connections.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::batch::{Batch, BatchItem};
use super::connection::{url_params, CommandTag, PgConfig, PgConnection, QueryResult};
use super::context::{deadline_check, Context};
use super::error::{PgError, PgResult};
use super::protocol::TransactionStatus;
use super::resource::{Acquired, Resource, ResourcePool};
use super::transaction::TxOptions;
use super::types::PgValue;

/// Pause between health-check rounds that destroyed something.
const HEALTH_RECHECK_DELAY: Duration = Duration::from_millis(500);

/// Validation run on a spawned task after a connection is released.
/// Returning `false` destroys the connection.
pub type AfterReleaseHook =
    Arc<dyn for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, bool> + Send + Sync>;

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration.
#[derive(Clone)]
pub struct PgPoolConfig {
    /// Settings for each new connection
    pub connect: PgConfig,
    /// Minimum number of connections
    pub min_connections: u32,
    /// Maximum number of connections
    pub max_connections: u32,
    /// Connections older than this are destroyed instead of reused
    pub max_conn_lifetime: Duration,
    /// Idle connections unused for this long are destroyed while above the minimum
    pub max_conn_idle_time: Duration,
    /// How often the background health check runs
    pub health_check_period: Duration,
    /// Optional validation after release
    pub after_release: Option<AfterReleaseHook>,
}

impl PgPoolConfig {
    /// Pool configuration with default limits around `connect`.
    pub fn new(connect: PgConfig) -> Self {
        Self {
            connect,
            min_connections: 1,
            max_connections: 10,
            max_conn_lifetime: Duration::from_secs(60 * 60),
            max_conn_idle_time: Duration::from_secs(30 * 60),
            health_check_period: Duration::from_secs(60),
            after_release: None,
        }
    }

    /// Parse a connection URL, including `pool_*` parameters:
    /// `pool_min_conns`, `pool_max_conns`, `pool_max_conn_lifetime`,
    /// `pool_max_conn_idle_time`, `pool_health_check_period`.
    ///
    /// Durations use Go syntax, e.g. `90s`, `1h30m`, `250ms`.
    pub fn from_url(url: &str) -> PgResult<Self> {
        let mut config = Self::new(PgConfig::from_url(url)?);
        for (key, value) in url_params(url) {
            match key {
                "pool_min_conns" => config.min_connections = parse_count(key, value)?,
                "pool_max_conns" => config.max_connections = parse_count(key, value)?,
                "pool_max_conn_lifetime" => {
                    config.max_conn_lifetime = parse_duration_param(key, value)?
                }
                "pool_max_conn_idle_time" => {
                    config.max_conn_idle_time = parse_duration_param(key, value)?
                }
                "pool_health_check_period" => {
                    config.health_check_period = parse_duration_param(key, value)?
                }
                _ => {}
            }
        }
        Ok(config)
    }

    /// Set the minimum number of connections.
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Set the maximum number of connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn max_conn_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_conn_lifetime = lifetime;
        self
    }

    pub fn max_conn_idle_time(mut self, idle_time: Duration) -> Self {
        self.max_conn_idle_time = idle_time;
        self
    }

    pub fn health_check_period(mut self, period: Duration) -> Self {
        self.health_check_period = period;
        self
    }

    /// Set the statement cache capacity per connection.
    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.connect.statement_cache_capacity = capacity;
        self
    }

    /// Validate each released connection on a background task.
    ///
    /// ```ignore
    /// let config = config.after_release(|conn| Box::pin(async move { conn.ping().await.is_ok() }));
    /// ```
    pub fn after_release<F>(mut self, hook: F) -> Self
    where
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, bool> + Send + Sync + 'static,
    {
        self.after_release = Some(Arc::new(hook));
        self
    }

    fn validate(&self) -> PgResult<()> {
        if self.max_connections == 0 {
            return Err(PgError::Config("max_connections must be at least 1".to_string()));
        }
        if self.min_connections > self.max_connections {
            return Err(PgError::Config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.health_check_period.is_zero() {
            return Err(PgError::Config("health_check_period must be positive".to_string()));
        }
        Ok(())
    }
}

impl fmt::Debug for PgPoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgPoolConfig")
            .field("connect", &self.connect)
            .field("min_connections", &self.min_connections)
            .field("max_connections", &self.max_connections)
            .field("max_conn_lifetime", &self.max_conn_lifetime)
            .field("max_conn_idle_time", &self.max_conn_idle_time)
            .field("health_check_period", &self.health_check_period)
            .field("after_release", &self.after_release.is_some())
            .finish()
    }
}

fn parse_count(key: &str, value: &str) -> PgResult<u32> {
    value
        .parse()
        .map_err(|_| PgError::Config(format!("Invalid {}: {}", key, value)))
}

fn parse_duration_param(key: &str, value: &str) -> PgResult<Duration> {
    parse_duration(value).ok_or_else(|| PgError::Config(format!("Invalid {}: {}", key, value)))
}

/// Parse a Go-style duration: a sequence of decimal numbers, each with a
/// unit suffix (`ns`, `us`, `µs`, `ms`, `s`, `m`, `h`). A bare `0` is allowed.
pub(crate) fn parse_duration(text: &str) -> Option<Duration> {
    let mut rest = text.trim();
    if rest == "0" {
        return Some(Duration::ZERO);
    }
    if rest.is_empty() {
        return None;
    }

    let mut total_nanos: u128 = 0;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let number = &rest[..number_len];
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit_nanos: u128 = match &rest[..unit_len] {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            _ => return None,
        };
        rest = &rest[unit_len..];

        let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && frac.is_empty() {
            return None;
        }
        let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
        let mut nanos = whole.checked_mul(unit_nanos)?;
        if !frac.is_empty() {
            let digits: u128 = frac.parse().ok()?;
            let scale = 10u128.checked_pow(u32::try_from(frac.len()).ok()?)?;
            nanos += digits.checked_mul(unit_nanos)? / scale;
        }
        total_nanos = total_nanos.checked_add(nanos)?;
    }
    Some(Duration::from_nanos(u64::try_from(total_nanos).ok()?))
}

// ============================================================================
// Pool Statistics
// ============================================================================

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStat {
    pub total_conns: u32,
    pub idle_conns: u32,
    pub acquired_conns: u32,
    pub max_conns: u32,
    pub acquire_count: u64,
    pub new_conns_count: u64,
    pub lifetime_destroy_count: u64,
    pub idle_destroy_count: u64,
}

// ============================================================================
// Health-check signal
// ============================================================================

/// Wakes the health-check loop. Signals sent while one is already pending
/// collapse into it, so triggering never blocks.
#[derive(Clone)]
pub(crate) struct HealthSignal {
    tx: mpsc::Sender<()>,
}

impl HealthSignal {
    pub(crate) fn new() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    pub(crate) fn trigger(&self) {
        // Full means a check is already pending; closed means the loop is gone.
        let _ = self.tx.try_send(());
    }
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from the pool.
///
/// When dropped, the connection is released back to the pool.
pub struct PooledConnection {
    /// The checked-out resource (None once released or hijacked)
    res: Option<Resource<PgConnection>>,
    /// Reference back to the pool
    pool: Arc<PgPoolInner>,
}

impl PooledConnection {
    fn new(res: Resource<PgConnection>, pool: Arc<PgPoolInner>) -> Self {
        Self {
            res: Some(res),
            pool,
        }
    }

    /// The underlying connection, while still held.
    pub fn connection(&self) -> Option<&PgConnection> {
        self.res.as_ref().map(Resource::value)
    }

    pub fn connection_mut(&mut self) -> PgResult<&mut PgConnection> {
        self.res
            .as_mut()
            .map(Resource::value_mut)
            .ok_or(PgError::ConnectionClosed)
    }

    /// Return the connection to the pool. Calling it again is a no-op.
    pub fn release(&mut self) {
        if let Some(res) = self.res.take() {
            self.pool.release(res);
        }
    }

    /// Take the connection out of the pool for good.
    ///
    /// # Panics
    ///
    /// Panics if the connection was already released or hijacked.
    pub fn hijack(&mut self) -> PgConnection {
        match self.res.take() {
            Some(res) => {
                tracing::debug!(pid = res.value().backend_pid(), "connection hijacked");
                res.hijack()
            }
            None => panic!("cannot hijack a connection that was already released or hijacked"),
        }
    }

    /// Execute a statement with the simple protocol.
    pub async fn exec(&mut self, ctx: &Context, sql: &str) -> PgResult<CommandTag> {
        deadline_check(ctx, sql);
        let result = ctx.run(self.connection_mut()?.exec(sql)).await;
        self.interrupted(&result);
        result
    }

    /// Execute one or more statements with the simple protocol.
    pub async fn simple_query(&mut self, ctx: &Context, sql: &str) -> PgResult<Vec<QueryResult>> {
        deadline_check(ctx, sql);
        let result = ctx.run(self.connection_mut()?.simple_query(sql)).await;
        self.interrupted(&result);
        result
    }

    /// Execute a parameterized query.
    pub async fn query(
        &mut self,
        ctx: &Context,
        sql: &str,
        params: &[PgValue],
    ) -> PgResult<QueryResult> {
        deadline_check(ctx, sql);
        let result = ctx.run(self.connection_mut()?.query(sql, params)).await;
        self.interrupted(&result);
        result
    }

    /// First row of a parameterized query.
    pub async fn query_row(
        &mut self,
        ctx: &Context,
        sql: &str,
        params: &[PgValue],
    ) -> PgResult<Vec<PgValue>> {
        deadline_check(ctx, sql);
        let result = ctx.run(self.connection_mut()?.query_row(sql, params)).await;
        self.interrupted(&result);
        result
    }

    /// Begin a transaction.
    pub async fn begin(&mut self, ctx: &Context) -> PgResult<()> {
        self.begin_tx(ctx, &TxOptions::default()).await
    }

    pub async fn begin_tx(&mut self, ctx: &Context, options: &TxOptions) -> PgResult<()> {
        let sql = options.begin_sql();
        deadline_check(ctx, &sql);
        let result = ctx.run(self.connection_mut()?.begin_tx(options)).await;
        self.interrupted(&result);
        result
    }

    /// Commit the transaction.
    pub async fn commit(&mut self, ctx: &Context) -> PgResult<()> {
        deadline_check(ctx, "commit");
        let result = ctx.run(self.connection_mut()?.commit()).await;
        self.interrupted(&result);
        result
    }

    /// Rollback the transaction.
    pub async fn rollback(&mut self, ctx: &Context) -> PgResult<()> {
        deadline_check(ctx, "rollback");
        let result = ctx.run(self.connection_mut()?.rollback()).await;
        self.interrupted(&result);
        result
    }

    /// Check the connection with a round trip.
    pub async fn ping(&mut self, ctx: &Context) -> PgResult<()> {
        deadline_check(ctx, ";");
        let result = ctx.run(self.connection_mut()?.ping()).await;
        self.interrupted(&result);
        result
    }

    /// Run `f` inside a transaction: commit when it returns `Ok`, roll back
    /// when it returns `Err`.
    pub async fn begin_func<T, F>(&mut self, ctx: &Context, f: F) -> PgResult<T>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, PgResult<T>>,
    {
        self.begin_tx_func(ctx, &TxOptions::default(), f).await
    }

    /// [`begin_func`](Self::begin_func) with explicit transaction options.
    pub async fn begin_tx_func<T, F>(
        &mut self,
        ctx: &Context,
        options: &TxOptions,
        f: F,
    ) -> PgResult<T>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, PgResult<T>>,
    {
        deadline_check(ctx, &options.begin_sql());
        let conn = self.connection_mut()?;
        let result = ctx
            .run(async move {
                conn.begin_tx(options).await?;
                match f(&mut *conn).await {
                    Ok(value) => conn.commit().await.map(|()| value),
                    Err(err) => {
                        // A transaction left open is destroyed on release.
                        if let Err(rollback_err) = conn.rollback().await {
                            tracing::debug!(error = %rollback_err, "rollback failed");
                        }
                        Err(err)
                    }
                }
            })
            .await;
        self.interrupted(&result);
        result
    }

    /// Run a parameterized query and call `f` with each row in order.
    /// Stops at the first error `f` returns.
    pub async fn query_func<F>(
        &mut self,
        ctx: &Context,
        sql: &str,
        params: &[PgValue],
        mut f: F,
    ) -> PgResult<CommandTag>
    where
        F: FnMut(&[PgValue]) -> PgResult<()>,
    {
        let result = self.query(ctx, sql, params).await?;
        for row in &result.rows {
            f(row)?;
        }
        Ok(result.command_tag)
    }

    /// Start a batch that owns this connection and releases it on close.
    pub fn begin_batch(self) -> Batch<'static> {
        Batch::pooled(self)
    }

    /// Queue `items` into a batch owning this connection and send it.
    pub async fn send_batch(
        self,
        ctx: &Context,
        tx_options: Option<&TxOptions>,
        items: impl IntoIterator<Item = BatchItem>,
    ) -> PgResult<Batch<'static>> {
        let mut batch = self.begin_batch();
        for item in items {
            batch.queue_item(item);
        }
        batch.send(ctx, tx_options).await?;
        Ok(batch)
    }

    /// Check if the connection is healthy.
    pub fn is_healthy(&self) -> bool {
        self.connection().is_some_and(|c| !c.is_closed())
    }

    /// An operation abandoned by its context may still be running on the
    /// server; ask the server to stop it.
    fn interrupted<T>(&mut self, result: &PgResult<T>) {
        if let Err(PgError::Cancelled | PgError::Timeout) = result {
            if let Some(conn) = self.res.as_mut().map(Resource::value_mut) {
                if conn.is_busy() {
                    conn.cancel_request();
                }
            }
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

/// Internal pool state.
struct PgPoolInner {
    /// Pool configuration
    config: PgPoolConfig,
    /// Capacity, idle set and total count
    resources: Arc<ResourcePool<PgConnection>>,
    health: HealthSignal,
    /// Stops the health-check loop
    shutdown: CancellationToken,
    closed: AtomicBool,
    acquire_count: AtomicU64,
    new_conns_count: AtomicU64,
    lifetime_destroy_count: AtomicU64,
    idle_destroy_count: AtomicU64,
}

impl PgPoolInner {
    /// Create a new connection with the pool's configuration.
    async fn create_connection(&self) -> PgResult<PgConnection> {
        let conn = PgConnection::connect_with_config(self.config.connect.clone()).await?;
        self.new_conns_count.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    /// Decide what happens to a connection coming back from a caller.
    fn release(self: &Arc<Self>, res: Resource<PgConnection>) {
        let conn = res.value();
        if conn.is_closed() || conn.is_busy() || conn.transaction_status() != TransactionStatus::Idle {
            tracing::debug!(
                pid = conn.backend_pid(),
                closed = conn.is_closed(),
                busy = conn.is_busy(),
                status = ?conn.transaction_status(),
                "destroying unreusable connection"
            );
            self.destroy(res);
            self.health.trigger();
            return;
        }

        if res.age() > self.config.max_conn_lifetime {
            tracing::debug!(pid = conn.backend_pid(), "destroying expired connection");
            self.lifetime_destroy_count.fetch_add(1, Ordering::Relaxed);
            self.destroy(res);
            self.health.trigger();
            return;
        }

        let Some(hook) = self.config.after_release.clone() else {
            res.release();
            return;
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // Nowhere to run the validation.
            self.destroy(res);
            self.health.trigger();
            return;
        };

        let pool = Arc::clone(self);
        runtime.spawn(async move {
            let mut res = res;
            if hook(res.value_mut()).await {
                res.release();
            } else {
                tracing::debug!(pid = res.value().backend_pid(), "after-release hook rejected connection");
                pool.destroy(res);
                pool.health.trigger();
            }
        });
    }

    fn destroy(&self, res: Resource<PgConnection>) {
        close_in_background(res.destroy());
    }

    /// Create connections until the pool holds `min_connections`.
    async fn replenish(&self) -> PgResult<()> {
        let min = self.config.min_connections as usize;
        while self.resources.total() < min {
            let Some(slot) = self.resources.try_reserve() else {
                break;
            };
            let conn = self.create_connection().await?;
            slot.fill(conn).release();
        }
        Ok(())
    }

    /// Destroy idle connections past their lifetime, and those idle too long
    /// while the pool is above its minimum. Returns how many were destroyed.
    fn retire_idle(&self) -> usize {
        let min = self.config.min_connections as usize;
        let lifetime = self.config.max_conn_lifetime;
        let idle_time = self.config.max_conn_idle_time;
        let now = Instant::now();
        let mut remaining = self.resources.total();
        let mut expired = 0;
        let mut idled = 0;

        let removed = self.resources.remove_idle(|_, info| {
            let destroy = if now.duration_since(info.created_at) > lifetime {
                expired += 1;
                true
            } else if remaining > min && now.duration_since(info.idle_since) > idle_time {
                idled += 1;
                true
            } else {
                false
            };
            if destroy {
                remaining = remaining.saturating_sub(1);
            }
            destroy
        });

        self.lifetime_destroy_count.fetch_add(expired, Ordering::Relaxed);
        self.idle_destroy_count.fetch_add(idled, Ordering::Relaxed);
        if !removed.is_empty() {
            tracing::debug!(expired, idled, "health check retired idle connections");
        }
        let count = removed.len();
        removed.into_iter().for_each(close_in_background);
        count
    }

    async fn check_health(&self) {
        loop {
            let replenished = self.replenish().await;
            let retired = self.retire_idle();
            if let Err(err) = replenished {
                tracing::warn!(error = %err, "failed to create connection for minimum pool size");
                return;
            }
            if retired == 0 {
                return;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(HEALTH_RECHECK_DELAY) => {}
            }
        }
    }
}

impl Drop for PgPoolInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Send Terminate on a spawned task if a runtime is available; otherwise
/// dropping the connection closes its socket.
fn close_in_background(mut conn: PgConnection) {
    if conn.is_closed() {
        return;
    }
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            let _ = conn.close().await;
        });
    }
}

async fn health_check_loop(
    pool: Weak<PgPoolInner>,
    mut trigger: mpsc::Receiver<()>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
            signal = trigger.recv() => {
                if signal.is_none() {
                    break;
                }
            }
        }
        let Some(inner) = pool.upgrade() else {
            break;
        };
        inner.check_health().await;
    }
    tracing::trace!("health check loop stopped");
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A PostgreSQL connection pool.
///
/// The pool maintains a set of reusable connections, each with its own
/// prepared statement cache.
#[derive(Clone)]
pub struct PgPool {
    inner: Arc<PgPoolInner>,
}

impl PgPool {
    /// Create a new connection pool.
    ///
    /// Creates `min_connections` connections up front and starts the
    /// background health check.
    pub async fn connect(config: PgPoolConfig) -> PgResult<Self> {
        config.validate()?;
        let (health, trigger) = HealthSignal::new();
        let inner = Arc::new(PgPoolInner {
            resources: ResourcePool::new(config.max_connections as usize),
            config,
            health,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            acquire_count: AtomicU64::new(0),
            new_conns_count: AtomicU64::new(0),
            lifetime_destroy_count: AtomicU64::new(0),
            idle_destroy_count: AtomicU64::new(0),
        });

        inner.replenish().await?;

        tokio::spawn(health_check_loop(
            Arc::downgrade(&inner),
            trigger,
            inner.config.health_check_period,
            inner.shutdown.clone(),
        ));

        tracing::info!(
            host = %inner.config.connect.host,
            min = inner.config.min_connections,
            max = inner.config.max_connections,
            "connection pool created"
        );
        Ok(Self { inner })
    }

    /// Get a connection from the pool, waiting for capacity if needed.
    pub async fn acquire(&self) -> PgResult<PooledConnection> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PgError::PoolClosed);
        }
        self.inner.acquire_count.fetch_add(1, Ordering::Relaxed);

        loop {
            match self.inner.resources.acquire().await? {
                Acquired::Idle(res) => {
                    if res.age() > self.inner.config.max_conn_lifetime {
                        self.inner
                            .lifetime_destroy_count
                            .fetch_add(1, Ordering::Relaxed);
                        self.inner.destroy(res);
                        self.inner.health.trigger();
                        continue;
                    }
                    return Ok(PooledConnection::new(res, Arc::clone(&self.inner)));
                }
                Acquired::Vacant(slot) => {
                    let conn = self.inner.create_connection().await?;
                    return Ok(PooledConnection::new(
                        slot.fill(conn),
                        Arc::clone(&self.inner),
                    ));
                }
            }
        }
    }

    /// [`acquire`](Self::acquire) bounded by a context.
    pub async fn acquire_with(&self, ctx: &Context) -> PgResult<PooledConnection> {
        ctx.run(self.acquire()).await
    }

    /// Acquire a connection and start a batch that releases it on close.
    pub async fn begin_batch(&self) -> PgResult<Batch<'static>> {
        Ok(self.acquire().await?.begin_batch())
    }

    /// Execute a statement on a pooled connection.
    pub async fn exec(&self, ctx: &Context, sql: &str) -> PgResult<CommandTag> {
        let mut conn = self.acquire_with(ctx).await?;
        conn.exec(ctx, sql).await
    }

    /// Execute a parameterized query on a pooled connection.
    pub async fn query(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[PgValue],
    ) -> PgResult<QueryResult> {
        let mut conn = self.acquire_with(ctx).await?;
        conn.query(ctx, sql, params).await
    }

    /// Wake the health check without waiting for its period.
    pub fn trigger_health_check(&self) {
        self.inner.health.trigger();
    }

    /// Close the pool and all idle connections. Connections still checked
    /// out are closed when they are released.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();
        for mut conn in self.inner.resources.close() {
            let _ = conn.close().await;
        }
        tracing::info!("connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Snapshot of pool counters.
    pub fn stat(&self) -> PoolStat {
        let total = self.inner.resources.total() as u32;
        let idle = self.inner.resources.idle_len() as u32;
        PoolStat {
            total_conns: total,
            idle_conns: idle,
            acquired_conns: total.saturating_sub(idle),
            max_conns: self.inner.config.max_connections,
            acquire_count: self.inner.acquire_count.load(Ordering::Relaxed),
            new_conns_count: self.inner.new_conns_count.load(Ordering::Relaxed),
            lifetime_destroy_count: self.inner.lifetime_destroy_count.load(Ordering::Relaxed),
            idle_destroy_count: self.inner.idle_destroy_count.load(Ordering::Relaxed),
        }
    }

    /// Number of connections destroyed for exceeding `max_conn_lifetime`.
    pub fn lifetime_destroy_count(&self) -> u64 {
        self.inner.lifetime_destroy_count.load(Ordering::Relaxed)
    }

    /// Get the current number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.inner.resources.idle_len()
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PgPoolConfig {
        &self.inner.config
    }
}
