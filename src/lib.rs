// Infrastructure layer (shared components)
pub mod infrastructure;

// Re-export infrastructure modules for convenience
pub use infrastructure::batching;
pub use infrastructure::bitring;
pub use infrastructure::config;
pub use infrastructure::dlock;
pub use infrastructure::error;
pub use infrastructure::loopjob;
pub use infrastructure::metrics;
pub use infrastructure::postgres;
pub use infrastructure::redis;
pub use infrastructure::sharding;

// Domain layer (entities and value objects)
pub mod domain;

// Repository layer (durable state + caches)
pub mod repository;

// Service layer (the send pipeline)
pub mod service;

// Application layer
pub mod api;
pub mod server;

// Supporting modules
pub mod telemetry;
