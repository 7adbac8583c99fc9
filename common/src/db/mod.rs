// Database layer module
// PostgreSQL pool for the obligation store, Redis connection for the run lease

pub mod pool;
pub mod redis;

pub use pool::DbPool;
pub use redis::RedisPool;
