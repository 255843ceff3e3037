//! Adapters around the kernel: HTTP surfaces and worker runtimes.

pub mod http;
pub mod pool_handler;
pub mod worker;

pub use pool_handler::PoolTaskHandler;
