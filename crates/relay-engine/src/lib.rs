//! Dispatch engine for chat message jobs
//!
//! - [`phone`]: phone number normalization
//! - [`template`]: `{{ name }}` placeholder expansion
//! - [`gateway`]: the messaging gateway seam and its HTTP implementation
//! - [`engine`]: runs Single, Bulk and MultiBlock jobs against a gateway
//! - [`pool`]: worker loops that lease jobs from a queue and run them

pub mod engine;
pub mod error;
pub mod gateway;
pub mod job_metrics;
pub mod phone;
pub mod pool;
pub mod template;

pub use engine::{personalize, DispatchEngine, EngineConfig};
pub use error::EngineError;
pub use gateway::{
    Endpoint, Gateway, GatewayError, HttpGateway, HttpGatewayConfig, OutboundMessage,
    ProviderResponse,
};
pub use pool::{PoolConfig, PoolHandle, WorkerPool};

pub type Result<T> = std::result::Result<T, EngineError>;
