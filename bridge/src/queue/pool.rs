//! Bounded channel pool for publishing to RabbitMQ.
//!
//! The pool owns every broker channel in the process: handlers check a
//! channel out for exactly one publish and the lease returns it (or
//! discards it, if the publish failed) when dropped. Capacity is bounded
//! by a semaphore, so a burst of requests waits for a free channel
//! instead of opening an unbounded number of them, and the wait itself is
//! bounded by the checkout timeout.
//!
//! Bookkeeping (idle set, size counters) is split into [`PoolCore`],
//! which is generic over the pooled resource so the checkout/return/close
//! contract can be tested without a broker.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{info, warn};

use super::types::OutboundMessage;
use crate::config::Config;

/// Errors surfaced by pool checkout and publish operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every channel is checked out and none came back within the
    /// checkout timeout.
    #[error("channel pool exhausted")]
    Exhausted,

    /// The pool is draining or closed; shutdown is in progress.
    #[error("channel pool closed")]
    Closed,

    /// The broker rejected a connect, channel open or publish.
    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),
}

/// Transport-free pool bookkeeping: semaphore-bounded capacity, an idle
/// set, and size/in-use counters.
///
/// `current_size` counts live resources (idle + leased), `in_use` counts
/// outstanding leases. Invariant: `in_use <= current_size <= max_size`.
struct PoolCore<T> {
    permits: Arc<tokio::sync::Semaphore>,
    idle: Mutex<Vec<T>>,
    current_size: AtomicUsize,
    in_use: AtomicUsize,
    closed: AtomicBool,
    torn_down: AtomicBool,
    max_size: usize,
    checkout_timeout: Duration,
}

impl<T> PoolCore<T> {
    fn new(max_size: usize, checkout_timeout: Duration) -> Self {
        Self {
            permits: Arc::new(tokio::sync::Semaphore::new(max_size)),
            idle: Mutex::new(Vec::with_capacity(max_size)),
            current_size: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            max_size,
            checkout_timeout,
        }
    }

    /// Add pre-created resources to the idle set.
    fn seed(&self, values: Vec<T>) {
        self.current_size.fetch_add(values.len(), Ordering::SeqCst);
        self.idle.lock().expect("pool lock poisoned").extend(values);
    }

    /// Check a resource out of the pool, creating one via `create` if the
    /// idle set is empty and capacity remains.
    ///
    /// Waits at most `checkout_timeout` for a permit; concurrent callers
    /// never receive the same resource because a resource is either in
    /// the idle set or owned by exactly one lease.
    async fn checkout<F, Fut>(self: &Arc<Self>, create: F) -> Result<Lease<T>, PoolError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PoolError>>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }

        let permit = match timeout(
            self.checkout_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            // Semaphore closed: shutdown won the race.
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => return Err(PoolError::Exhausted),
        };

        // Re-check after the wait; close() may have started meanwhile.
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }

        let idle = self.idle.lock().expect("pool lock poisoned").pop();
        let value = match idle {
            Some(value) => value,
            None => {
                // Holding a permit guarantees current_size < max_size here.
                let value = create().await?;
                self.current_size.fetch_add(1, Ordering::SeqCst);
                value
            }
        };

        self.in_use.fetch_add(1, Ordering::SeqCst);

        Ok(Lease {
            value: Some(value),
            healthy: true,
            core: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Refuse all further checkouts; outstanding leases are honored.
    fn begin_drain(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Stop handing out resources and wait (up to `drain_timeout`) for
    /// outstanding leases to come back, then hand the remaining idle set
    /// to the caller for closing.
    ///
    /// Returns `None` if teardown already ran.
    async fn close(&self, drain_timeout: Duration) -> Option<Vec<T>> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.closed.store(true, Ordering::SeqCst);

        // Holding every permit means no lease is outstanding.
        match timeout(
            drain_timeout,
            self.permits.acquire_many(self.max_size as u32),
        )
        .await
        {
            Ok(Ok(all)) => all.forget(),
            Ok(Err(_)) => {}
            Err(_) => warn!(
                in_use = self.in_use.load(Ordering::SeqCst),
                "pool_drain_timeout"
            ),
        }
        self.permits.close();

        let mut idle = self.idle.lock().expect("pool lock poisoned");
        let drained: Vec<T> = idle.drain(..).collect();
        self.current_size.fetch_sub(drained.len(), Ordering::SeqCst);
        Some(drained)
    }

    fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    fn current_size(&self) -> usize {
        self.current_size.load(Ordering::SeqCst)
    }
}

/// Scoped checkout of one pooled resource.
///
/// Dropping the lease returns a healthy resource to the idle set and
/// discards an unhealthy one, so the checkout/return pairing holds on
/// every exit path, including panics mid-publish.
pub struct Lease<T> {
    value: Option<T>,
    healthy: bool,
    core: Arc<PoolCore<T>>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl<T> std::fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("healthy", &self.healthy)
            .finish_non_exhaustive()
    }
}

impl<T> Lease<T> {
    fn get(&self) -> &T {
        self.value.as_ref().expect("lease holds a value until drop")
    }

    /// Prevent this resource from being reused after return.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            // The closed check happens under the idle lock so a return
            // cannot slip in behind close()'s drain of the idle set.
            let mut idle = self.core.idle.lock().expect("pool lock poisoned");
            if self.healthy && !self.core.closed.load(Ordering::SeqCst) {
                idle.push(value);
            } else {
                self.core.current_size.fetch_sub(1, Ordering::SeqCst);
            }
        }
        self.core.in_use.fetch_sub(1, Ordering::SeqCst);
        // _permit drops after this body, releasing capacity.
    }
}

impl Lease<Channel> {
    /// Publish one message on the leased channel.
    ///
    /// A broker error marks the lease unhealthy so the channel is
    /// discarded instead of returned; no retry happens here, the webhook
    /// provider retries on a non-2xx response.
    pub async fn publish(&mut self, message: &OutboundMessage) -> Result<(), PoolError> {
        let result = self.publish_inner(message).await;
        if result.is_err() {
            self.healthy = false;
        }
        result
    }

    async fn publish_inner(&self, message: &OutboundMessage) -> Result<(), PoolError> {
        self.get()
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type(message.content_type.clone().into()),
            )
            .await?
            .await?;
        Ok(())
    }
}

/// Bounded pool of RabbitMQ channels over a single broker connection.
///
/// Cheap to clone; all clones share the same connection and bookkeeping.
#[derive(Clone)]
pub struct ChannelPool {
    inner: Arc<ChannelPoolInner>,
}

struct ChannelPoolInner {
    connection: Connection,
    core: Arc<PoolCore<Channel>>,
    drain_timeout: Duration,
}

impl ChannelPool {
    /// Connect to the broker, declare the exchange and pre-open
    /// `pool_min` channels.
    ///
    /// Failure here is fatal: the bridge must not accept webhooks it
    /// cannot republish.
    pub async fn open(config: &Config) -> Result<Self, PoolError> {
        info!(exchange = %config.exchange_name, "pool_connecting");

        let connection =
            Connection::connect(&config.amqp_url, ConnectionProperties::default()).await?;

        let setup = connection.create_channel().await?;

        // Idempotent on the broker side.
        setup
            .exchange_declare(
                &config.exchange_name,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        // The declaration channel becomes the first pooled channel.
        let mut channels = vec![setup];
        for _ in 1..config.pool_min {
            channels.push(connection.create_channel().await?);
        }

        let core = Arc::new(PoolCore::new(config.pool_max, config.checkout_timeout));
        core.seed(channels);

        info!(
            exchange = %config.exchange_name,
            pool_min = config.pool_min,
            pool_max = config.pool_max,
            "pool_opened"
        );

        Ok(Self {
            inner: Arc::new(ChannelPoolInner {
                connection,
                core,
                drain_timeout: config.drain_timeout,
            }),
        })
    }

    /// Check out a channel for one publish.
    pub async fn checkout(&self) -> Result<Lease<Channel>, PoolError> {
        let inner = &self.inner;
        inner
            .core
            .checkout(|| async move {
                let channel = inner.connection.create_channel().await?;
                Ok(channel)
            })
            .await
    }

    /// Start draining: in-flight publishes keep their channels, new
    /// checkouts fail with [`PoolError::Closed`] immediately.
    ///
    /// Called when the shutdown signal arrives, before the web server has
    /// finished turning away in-flight requests.
    pub fn begin_drain(&self) {
        self.inner.core.begin_drain();
        info!("pool_draining");
    }

    /// Drain and close the pool, then the broker connection.
    ///
    /// New checkouts fail with [`PoolError::Closed`] from the moment this
    /// is called; in-flight leases are honored up to the drain timeout.
    /// Calling this twice has no additional effect.
    pub async fn close(&self) {
        let Some(channels) = self.inner.core.close(self.inner.drain_timeout).await else {
            return;
        };

        info!(channels = channels.len(), "pool_draining_complete");

        for channel in channels {
            if let Err(e) = channel.close(200, "Normal shutdown").await {
                warn!(error = %e, "pool_channel_close_error");
            }
        }

        if let Err(e) = self.inner.connection.close(200, "Normal shutdown").await {
            warn!(error = %e, "pool_connection_close_error");
        }

        info!("pool_closed");
    }

    /// Number of leases currently checked out.
    pub fn in_use(&self) -> usize {
        self.inner.core.in_use()
    }

    /// Number of live channels owned by the pool (idle + leased).
    pub fn current_size(&self) -> usize {
        self.inner.core.current_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core(max: usize, checkout_ms: u64) -> Arc<PoolCore<u32>> {
        Arc::new(PoolCore::new(max, Duration::from_millis(checkout_ms)))
    }

    async fn make(n: u32) -> Result<u32, PoolError> {
        Ok(n)
    }

    #[tokio::test]
    async fn test_checkout_return_restores_counters() {
        let pool = core(4, 100);

        let lease = pool.checkout(|| make(1)).await.unwrap();
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.current_size(), 1);

        drop(lease);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.current_size(), 1, "healthy channel stays pooled");
    }

    #[tokio::test]
    async fn test_unhealthy_return_shrinks_pool() {
        let pool = core(4, 100);

        let mut lease = pool.checkout(|| make(1)).await.unwrap();
        lease.mark_unhealthy();
        drop(lease);

        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.current_size(), 0, "unhealthy channel is discarded");

        // Capacity is recreated lazily on the next checkout.
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let _lease = pool
            .checkout(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            })
            .await
            .unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idle_resource_reused_not_recreated() {
        let pool = core(4, 100);

        let lease = pool.checkout(|| make(7)).await.unwrap();
        drop(lease);

        let lease = pool.checkout(|| make(99)).await.unwrap();
        assert_eq!(*lease.get(), 7, "idle resource should be reused");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_pool_times_out() {
        let pool = core(1, 50);

        let _held = pool.checkout(|| make(1)).await.unwrap();

        // Only one channel exists and it is checked out; the second
        // caller must wait and then fail rather than receive it.
        let err = pool.checkout(|| make(2)).await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted));
        assert_eq!(pool.in_use(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_proceeds_after_return() {
        let pool = core(2, 1_000);

        let a = pool.checkout(|| make(1)).await.unwrap();
        let b = pool.checkout(|| make(2)).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let lease = pool.checkout(|| make(3)).await.unwrap();
                drop(lease);
            })
        };

        // Third caller is blocked until one of the first two returns.
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(a);

        waiter.await.unwrap();
        drop(b);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.current_size(), 2);
    }

    #[tokio::test]
    async fn test_checkout_after_close_fails() {
        let pool = core(2, 50);
        let lease = pool.checkout(|| make(1)).await.unwrap();
        drop(lease);

        pool.close(Duration::from_millis(100)).await.unwrap();

        let err = pool.checkout(|| make(2)).await.unwrap_err();
        assert!(matches!(err, PoolError::Closed));
        assert_eq!(pool.current_size(), 0);
    }

    #[tokio::test]
    async fn test_begin_drain_refuses_checkouts_but_honors_leases() {
        let pool = core(2, 50);

        let mut held = pool.checkout(|| make(1)).await.unwrap();
        pool.begin_drain();

        let err = pool.checkout(|| make(2)).await.unwrap_err();
        assert!(matches!(err, PoolError::Closed));

        // The outstanding lease still works and still returns cleanly.
        held.mark_unhealthy();
        drop(held);
        assert_eq!(pool.in_use(), 0);

        let drained = pool.close(Duration::from_millis(100)).await;
        assert_eq!(drained, Some(vec![]));
        assert_eq!(pool.current_size(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let pool = core(2, 50);
        let lease = pool.checkout(|| make(1)).await.unwrap();
        drop(lease);

        let first = pool.close(Duration::from_millis(100)).await;
        assert_eq!(first, Some(vec![1]));

        let second = pool.close(Duration::from_millis(100)).await;
        assert_eq!(second, None);
        assert_eq!(pool.current_size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_outstanding_lease() {
        let pool = core(2, 1_000);

        let lease = pool.checkout(|| make(1)).await.unwrap();
        let holder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(lease);
        });

        pool.close(Duration::from_secs(5)).await.unwrap();
        holder.await.unwrap();

        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.current_size(), 0, "late return is discarded once closed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_callers_two_channels() {
        let pool = core(2, 1_000);
        let completed = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for n in 0..3u32 {
            let pool = Arc::clone(&pool);
            let completed = Arc::clone(&completed);
            tasks.push(tokio::spawn(async move {
                let lease = pool.checkout(|| make(n)).await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
                drop(lease);
                completed.fetch_add(1, Ordering::SeqCst);
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(completed.load(Ordering::SeqCst), 3);
        assert_eq!(pool.in_use(), 0);
        assert!(pool.current_size() <= 2);
    }

    #[tokio::test]
    async fn test_failed_create_releases_capacity() {
        let pool = core(1, 50);

        let err = pool
            .checkout(|| async { Err(PoolError::Broker(lapin::Error::ChannelsLimitReached)) })
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Broker(_)));

        // The permit from the failed checkout must not leak.
        let lease = pool.checkout(|| make(1)).await.unwrap();
        assert_eq!(pool.in_use(), 1);
        drop(lease);
    }
}
