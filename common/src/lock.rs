// Run lease: at most one run per source at a time
//
// RedisRunLock coordinates several processes with SET NX EX; renew and
// release only touch the key while it still holds our token. LocalRunLock covers the single-process
// deployment. Acquisition never waits: an overlapping trigger is skipped.

use crate::db::RedisPool;
use crate::errors::LockError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// RunLock hands out exclusive leases on a named resource
#[async_trait]
pub trait RunLock: Send + Sync {
    /// Take the lease or fail with `LockError::AlreadyHeld` immediately
    async fn try_acquire(&self, resource: &str, ttl: Duration) -> Result<RunLease, LockError>;
}

/// Backend side of a held lease
#[async_trait]
pub trait LeaseHandle: Send + Sync {
    /// Push the expiry out to `ttl` from now, if the lease is still ours
    async fn renew(&self, ttl: Duration) -> Result<(), LockError>;

    async fn release(&mut self) -> Result<(), LockError>;
}

/// Exclusive right to run against one resource.
///
/// Call `release` when the run ends. Dropping an unreleased lease only
/// schedules a best-effort release; the TTL is the backstop.
pub struct RunLease {
    resource: String,
    acquired_at: Instant,
    handle: Box<dyn LeaseHandle>,
}

impl RunLease {
    pub fn new(resource: impl Into<String>, handle: Box<dyn LeaseHandle>) -> Self {
        Self {
            resource: resource.into(),
            acquired_at: Instant::now(),
            handle,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Time since the lease was taken
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub async fn renew(&self, ttl: Duration) -> Result<(), LockError> {
        self.handle.renew(ttl).await
    }

    pub async fn release(mut self) -> Result<(), LockError> {
        self.handle.release().await
    }
}

struct RedisLease {
    pool: RedisPool,
    resource: String,
    value: String,
    released: bool,
}

#[async_trait]
impl LeaseHandle for RedisLease {
    async fn renew(&self, ttl: Duration) -> Result<(), LockError> {
        let mut conn = self.pool.get_connection();
        let script = r#"
            if redis.call("get", KEYS[1]) == ARGV[1] then
                return redis.call("pexpire", KEYS[1], ARGV[2])
            else
                return 0
            end
        "#;

        let renewed: i32 = redis::Script::new(script)
            .key(lease_key(&self.resource))
            .arg(&self.value)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        if renewed == 1 {
            debug!(resource = %self.resource, ttl_seconds = ttl.as_secs(), "Run lease renewed");
            Ok(())
        } else {
            Err(LockError::NotOwned(self.resource.clone()))
        }
    }

    async fn release(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        release_lease(&self.pool, &self.resource, &self.value).await
    }
}

impl Drop for RedisLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let (pool, resource, value) = (self.pool.clone(), self.resource.clone(), self.value.clone());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = release_lease(&pool, &resource, &value).await {
                        warn!(resource = %resource, error = %e, "Failed to release dropped run lease");
                    }
                });
            }
            Err(_) => warn!(
                resource = %self.resource,
                "No runtime to release run lease; it will expire with its TTL"
            ),
        }
    }
}

/// Redis-backed lease for multi-process deployments
pub struct RedisRunLock {
    pool: RedisPool,
}

impl RedisRunLock {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

fn lease_key(resource: &str) -> String {
    format!("taxbot:lease:{}", resource)
}

#[async_trait]
impl RunLock for RedisRunLock {
    #[instrument(skip(self), fields(resource = %resource, ttl_seconds = ?ttl.as_secs()))]
    async fn try_acquire(&self, resource: &str, ttl: Duration) -> Result<RunLease, LockError> {
        let mut conn = self.pool.get_connection();
        let value = Uuid::new_v4().to_string();

        // SET NX EX: only if absent, with expiry
        let result: Option<String> = redis::cmd("SET")
            .arg(lease_key(resource))
            .arg(&value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        if result.is_none() {
            return Err(LockError::AlreadyHeld(resource.to_string()));
        }

        debug!(lease = %value, "Run lease acquired");
        Ok(RunLease::new(
            resource,
            Box::new(RedisLease {
                pool: self.pool.clone(),
                resource: resource.to_string(),
                value,
                released: false,
            }),
        ))
    }
}

/// Release a lease only if we still own it
async fn release_lease(pool: &RedisPool, resource: &str, value: &str) -> Result<(), LockError> {
    let mut conn = pool.get_connection();

    let script = r#"
        if redis.call("get", KEYS[1]) == ARGV[1] then
            return redis.call("del", KEYS[1])
        else
            return 0
        end
    "#;

    let released: i32 = redis::Script::new(script)
        .key(lease_key(resource))
        .arg(value)
        .invoke_async(&mut conn)
        .await?;

    if released == 1 {
        debug!(resource = %resource, "Run lease released");
        Ok(())
    } else {
        Err(LockError::NotOwned(resource.to_string()))
    }
}

/// Holding the guard is the lease
struct LocalLease(Option<OwnedMutexGuard<()>>);

#[async_trait]
impl LeaseHandle for LocalLease {
    async fn renew(&self, _ttl: Duration) -> Result<(), LockError> {
        Ok(())
    }

    async fn release(&mut self) -> Result<(), LockError> {
        self.0.take();
        Ok(())
    }
}

/// In-process lease. The TTL is ignored: the lease lives exactly as long as the run.
#[derive(Default)]
pub struct LocalRunLock {
    resources: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LocalRunLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunLock for LocalRunLock {
    async fn try_acquire(&self, resource: &str, _ttl: Duration) -> Result<RunLease, LockError> {
        let slot = {
            let mut resources = self.resources.lock().await;
            resources
                .entry(resource.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let guard = slot
            .try_lock_owned()
            .map_err(|_| LockError::AlreadyHeld(resource.to_string()))?;

        Ok(RunLease::new(resource, Box::new(LocalLease(Some(guard)))))
    }
}
