// Redis connection and health check for the distributed run lease

use crate::errors::LockError;
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::{info, instrument};

/// Redis connection wrapper
#[derive(Clone)]
pub struct RedisPool {
    manager: ConnectionManager,
}

impl RedisPool {
    /// Connect to Redis
    #[instrument(skip(url))]
    pub async fn new(url: &str) -> Result<Self, LockError> {
        info!("Initializing Redis connection");

        let client = Client::open(url)
            .map_err(|e| LockError::RedisError(format!("Failed to create Redis client: {}", e)))?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            LockError::RedisError(format!("Failed to create connection manager: {}", e))
        })?;

        info!("Redis connection initialized successfully");

        Ok(Self { manager })
    }

    /// Get a connection handle
    pub fn get_connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Health check - verify Redis connection is working
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), LockError> {
        let mut conn = self.get_connection();

        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::RedisError(format!("Health check failed: {}", e)))?;

        if response != "PONG" {
            return Err(LockError::RedisError(format!(
                "Unexpected PING response: {}",
                response
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_redis_health_check() {
        let pool = RedisPool::new("redis://localhost:6379").await.unwrap();
        assert!(pool.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_redis_pool_invalid_url() {
        let result = RedisPool::new("not-a-redis-url").await;
        assert!(result.is_err());
    }
}
