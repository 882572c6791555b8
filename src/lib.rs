// src/lib.rs
pub mod cache;
pub mod config;
pub mod conn;
pub mod epoll;
pub mod error;
pub mod files;
pub mod logging;
pub mod pool;
pub mod rate_limit;
pub mod request;
pub mod response;
pub mod server;
pub mod sock;

// Re-exports for users
pub use cache::{CacheEntry, CacheStats, LruCache};
pub use config::Config;
pub use error::{ServerError, ServerResult};
pub use files::FileResponder;
pub use pool::WorkerPool;
pub use rate_limit::{RateLimiter, RateLimiterStats};
pub use request::{Method, Request};
pub use response::{Response, Status};
pub use server::{RateLimitOptions, Server, ServerOptions};
