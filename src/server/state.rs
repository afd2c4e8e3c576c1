//! Assembly of the platform: storage backends, the send pipeline, and the
//! background loop jobs, wired according to the settings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::batching::RingBufferAdjuster;
use crate::config::{JwtConfig, Settings, StorageBackend};
use crate::dlock::{LockClient, MemoryLockClient, RedisLockClient};
use crate::domain::Channel;
use crate::error::{AppError, Result};
use crate::loopjob::{InfiniteLoop, ResourceSemaphore, ShardingLoopJob};
use crate::postgres::ShardedPools;
use crate::repository::memory::{
    MemoryBusinessConfigStore, MemoryCallbackLogRepository, MemoryNotificationRepository,
    MemoryQuotaCache, MemoryQuotaStore, MemoryStore, MemoryTxNotificationRepository,
};
use crate::repository::{
    run_invalidation_listener, BusinessConfigService, CachedBusinessConfigService,
    CallbackLogRepository, NotificationRepository, PgBusinessConfigStore, QuotaCache, QuotaStore,
    TxNotificationRepository,
};
use crate::repository::callback_pg::PgCallbackLogRepository;
use crate::repository::notification_pg::PgNotificationRepository;
use crate::repository::quota_pg::PgQuotaStore;
use crate::repository::quota_redis::RedisQuotaCache;
use crate::repository::tx_pg::PgTxNotificationRepository;
use crate::service::callback::{AsyncRequestResultCallbackTask, CallbackService};
use crate::service::channel::ChannelDispatcher;
use crate::service::client::HttpTenantGateway;
use crate::service::provider::console::ConsoleProvider;
use crate::service::provider::health::RoundRobinSelectorBuilder;
use crate::service::provider::{Provider, SelectorBuilder};
use crate::service::quota::QuotaService;
use crate::service::ratelimit::TenantRateLimiter;
use crate::service::scheduler::ShardingScheduler;
use crate::service::send::SendService;
use crate::service::sender::Sender;
use crate::service::strategy::{DefaultStrategy, ImmediateStrategy, SendStrategyDispatcher};
use crate::service::timeout::SendingTimeoutTask;
use crate::service::tx::{TxCheckTask, TxNotificationService, TxService};
use crate::sharding::{IdGenerator, ShardingStrategy};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub send_service: Arc<SendService>,
    pub tx_service: Arc<dyn TxNotificationService>,
    pub rate_limiter: Arc<TenantRateLimiter>,
    pub id_generator: Arc<IdGenerator>,
    pub jwt: JwtConfig,
}

/// The assembled platform: API state plus the background jobs that drive
/// deferred delivery, check-backs, callbacks, and the timeout sweep.
pub struct Platform {
    pub state: AppState,
    pub shard_semaphore: Arc<ResourceSemaphore>,
    /// Quota provisioning entry point, invoked by the external reset cron.
    pub quota_service: Arc<QuotaService>,
    scheduler_job: Arc<ShardingLoopJob>,
    tx_check_loop: Arc<InfiniteLoop>,
    callback_loop: Arc<InfiniteLoop>,
    timeout_loop: Arc<InfiniteLoop>,
    invalidation: Option<InvalidationWiring>,
}

struct InvalidationWiring {
    client: redis::Client,
    channel: String,
    service: Arc<CachedBusinessConfigService>,
}

struct Repositories {
    notifications: Arc<dyn NotificationRepository>,
    callback_logs: Arc<dyn CallbackLogRepository>,
    tx_notifications: Arc<dyn TxNotificationRepository>,
    config_service: Arc<CachedBusinessConfigService>,
    quota_store: Arc<dyn QuotaStore>,
    quota_cache: Arc<dyn QuotaCache>,
    lock_client: Arc<dyn LockClient>,
    invalidation: Option<InvalidationWiring>,
}

async fn build_memory_backend(strategy: &ShardingStrategy) -> Repositories {
    let store = Arc::new(MemoryStore::new(strategy.clone()));
    let quota: Arc<dyn QuotaCache> = Arc::new(MemoryQuotaCache::new());
    let notifications = Arc::new(MemoryNotificationRepository::new(
        store.clone(),
        quota.clone(),
    ));
    let callback_logs = Arc::new(MemoryCallbackLogRepository::new(store.clone()));
    let tx_notifications = Arc::new(MemoryTxNotificationRepository::new(
        store,
        quota.clone(),
        notifications.clone(),
    ));
    let config_service = Arc::new(CachedBusinessConfigService::new(
        Arc::new(MemoryBusinessConfigStore::new()),
        None,
    ));
    Repositories {
        notifications,
        callback_logs,
        tx_notifications,
        config_service,
        quota_store: Arc::new(MemoryQuotaStore::new()),
        quota_cache: quota,
        lock_client: Arc::new(MemoryLockClient::new()),
        invalidation: None,
    }
}

async fn build_postgres_backend(
    settings: &Settings,
    strategy: &ShardingStrategy,
) -> Result<Repositories> {
    let pools = ShardedPools::connect(&settings.database).await?;
    if (pools.shard_count() as u32) < settings.sharding.db_count {
        return Err(AppError::Internal(format!(
            "{} database shards configured but only {} DSNs provided",
            settings.sharding.db_count,
            pools.shard_count()
        )));
    }

    let (redis_client, redis_conn) = crate::redis::connect(&settings.redis).await?;
    let quota: Arc<dyn QuotaCache> = Arc::new(RedisQuotaCache::new(redis_conn.clone()));

    let notifications: Arc<dyn NotificationRepository> = Arc::new(PgNotificationRepository::new(
        pools.clone(),
        strategy.clone(),
        quota.clone(),
    ));
    let callback_logs = Arc::new(PgCallbackLogRepository::new(pools.clone(), strategy.clone()));
    let tx_notifications = Arc::new(PgTxNotificationRepository::new(
        pools.clone(),
        strategy.clone(),
        quota.clone(),
        notifications.clone(),
    ));
    let config_service = Arc::new(CachedBusinessConfigService::new(
        Arc::new(PgBusinessConfigStore::new(pools.clone())),
        Some(redis_conn.clone()),
    ));

    Ok(Repositories {
        notifications,
        callback_logs,
        tx_notifications,
        config_service: config_service.clone(),
        quota_store: Arc::new(PgQuotaStore::new(pools)),
        quota_cache: quota,
        lock_client: Arc::new(RedisLockClient::new(redis_conn)),
        invalidation: Some(InvalidationWiring {
            client: redis_client,
            channel: settings.redis.config_invalidation_channel.clone(),
            service: config_service,
        }),
    })
}

/// Default provider wiring: two console providers per channel behind the
/// health-aware round-robin selector. Real vendor adapters slot in here.
fn default_selectors() -> HashMap<Channel, Arc<dyn SelectorBuilder>> {
    let mut selectors: HashMap<Channel, Arc<dyn SelectorBuilder>> = HashMap::new();
    for channel in [Channel::Sms, Channel::Email, Channel::InApp] {
        let tag = channel.as_str().to_lowercase();
        let providers: Vec<Arc<dyn Provider>> = vec![
            Arc::new(ConsoleProvider::new(&format!("{tag}-primary"))),
            Arc::new(ConsoleProvider::new(&format!("{tag}-secondary"))),
        ];
        selectors.insert(channel, Arc::new(RoundRobinSelectorBuilder::new(providers, 1)));
    }
    selectors
}

impl Platform {
    pub async fn build(settings: &Settings) -> Result<Self> {
        let strategy = ShardingStrategy::new(
            &settings.sharding.db_prefix,
            &settings.sharding.table_prefix,
            settings.sharding.db_count,
            settings.sharding.table_count,
        );
        let id_generator = Arc::new(IdGenerator::new());

        let repos = match settings.storage.backend {
            StorageBackend::Memory => build_memory_backend(&strategy).await,
            StorageBackend::Postgres => build_postgres_backend(settings, &strategy).await?,
        };
        let config_service: Arc<dyn BusinessConfigService> = repos.config_service.clone();

        let gateway = Arc::new(HttpTenantGateway::new(settings.tenants.clone()));
        let callbacks = Arc::new(CallbackService::new(
            config_service.clone(),
            repos.callback_logs,
            repos.notifications.clone(),
            gateway.clone(),
        ));

        let channel_dispatcher = Arc::new(ChannelDispatcher::new(default_selectors()));
        let sender = Arc::new(Sender::new(
            repos.notifications.clone(),
            channel_dispatcher,
            callbacks.clone(),
        ));

        let immediate = Arc::new(ImmediateStrategy::new(
            repos.notifications.clone(),
            config_service.clone(),
            sender.clone(),
        ));
        let default_strategy = Arc::new(DefaultStrategy::new(
            repos.notifications.clone(),
            config_service.clone(),
        ));
        let strategy_dispatcher = Arc::new(SendStrategyDispatcher::new(immediate, default_strategy));
        let send_service = Arc::new(SendService::new(
            strategy_dispatcher,
            repos.notifications.clone(),
            id_generator.clone(),
        ));

        let tx_service: Arc<dyn TxNotificationService> = Arc::new(TxService::new(
            repos.tx_notifications.clone(),
            repos.notifications.clone(),
            config_service.clone(),
            sender.clone(),
        ));
        let rate_limiter = Arc::new(TenantRateLimiter::new(config_service.clone()));
        let quota_service = Arc::new(QuotaService::new(
            repos.quota_store.clone(),
            repos.quota_cache.clone(),
        ));

        // Scheduler: one sharded loop job, capped by the shard semaphore.
        let shard_semaphore = Arc::new(ResourceSemaphore::new(
            settings.scheduler.max_locked_shards,
        ));
        let scheduler_config = settings.scheduler.clone();
        let adjuster_config = scheduler_config.clone();
        let scheduler = Arc::new(ShardingScheduler::new(
            repos.notifications.clone(),
            sender,
            scheduler_config,
            Box::new(move || {
                Box::new(RingBufferAdjuster::new(
                    adjuster_config.batch_size,
                    adjuster_config.min_batch_size,
                    adjuster_config.max_batch_size,
                    adjuster_config.adjust_step,
                    Duration::from_millis(adjuster_config.adjust_cooldown_ms),
                    adjuster_config.response_buffer_size,
                ))
            }),
        ));
        let scheduler_job = Arc::new(ShardingLoopJob::new(
            repos.lock_client.clone(),
            ShardingScheduler::LOCK_KEY,
            scheduler,
            strategy,
            shard_semaphore.clone(),
        ));

        let tx_check_loop = Arc::new(InfiniteLoop::new(
            repos.lock_client.clone(),
            Arc::new(TxCheckTask::new(
                repos.tx_notifications,
                config_service.clone(),
                gateway,
                settings.tasks.tx_check_batch,
            )),
            TxCheckTask::LOCK_KEY,
        ));
        let callback_loop = Arc::new(InfiniteLoop::new(
            repos.lock_client.clone(),
            Arc::new(AsyncRequestResultCallbackTask::new(
                callbacks,
                settings.tasks.callback_batch,
            )),
            AsyncRequestResultCallbackTask::LOCK_KEY,
        ));
        let timeout_loop = Arc::new(InfiniteLoop::new(
            repos.lock_client,
            Arc::new(SendingTimeoutTask::new(
                repos.notifications,
                settings.tasks.timeout_batch,
            )),
            SendingTimeoutTask::LOCK_KEY,
        ));

        Ok(Self {
            state: AppState {
                send_service,
                tx_service,
                rate_limiter,
                id_generator,
                jwt: settings.jwt.clone(),
            },
            shard_semaphore,
            quota_service,
            scheduler_job,
            tx_check_loop,
            callback_loop,
            timeout_loop,
            invalidation: repos.invalidation,
        })
    }

    /// Spawn every background loop. They all stop on `cancel`.
    pub fn spawn_background(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let scheduler_job = self.scheduler_job.clone();
        let scheduler_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            scheduler_job.run(scheduler_cancel).await;
        }));

        for job in [
            self.tx_check_loop.clone(),
            self.callback_loop.clone(),
            self.timeout_loop.clone(),
        ] {
            let job_cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                job.run(job_cancel).await;
            }));
        }

        if let Some(wiring) = &self.invalidation {
            let client = wiring.client.clone();
            let channel = wiring.channel.clone();
            let service = wiring.service.clone();
            handles.push(tokio::spawn(async move {
                run_invalidation_listener(client, channel, service, cancel).await;
            }));
        }

        handles
    }
}
