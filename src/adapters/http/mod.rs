//! Inbound HTTP surfaces.

pub mod a2a;
pub mod cadp;

pub use a2a::{A2aGateway, GatewayConfig, GatewayStats};
pub use cadp::CadpServer;
