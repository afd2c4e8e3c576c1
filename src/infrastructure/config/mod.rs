pub mod settings;

pub use settings::{
    DatabaseConfig, JwtConfig, RedisConfig, SchedulerConfig, ServerConfig, Settings,
    ShardingConfig, StorageBackend, StorageConfig, TaskConfig, TenantEndpoints,
};
