//! Domain layer: models, errors, and adapter ports.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{KernelError, KernelResult};
