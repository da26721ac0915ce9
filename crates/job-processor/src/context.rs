//! [`JobContext`]: the dependency bundle every handler closes over,
//! replacing the teacher's module-scope globals (§9 design notes) with
//! explicit construction and `Arc`-shared ownership.

use crate::captcha::CaptchaSolver;
use crate::client_registry::ClientRegistry;
use account_pool::AccountPool;
use queue_manager::QueueManager;
use resource_cache::ResourceCache;
use session_cache::{SessionCache, SharedStore};
use std::sync::Arc;
use std::time::Duration;
use upstream_client::UpstreamClient;
use worker_core::Config;
use worker_db::DatabasePool;

/// Everything a job handler needs, bundled so `JobProcessorWorker` can
/// construct it once and hand every handler a cheap `Arc` clone.
pub struct JobContext<C, F>
where
    C: UpstreamClient,
    F: Fn() -> C + Send + Sync,
{
    pub db: Arc<DatabasePool>,
    pub store: Arc<dyn SharedStore>,
    pub session_cache: SessionCache,
    /// `Arc`-wrapped so the dispatch wrapper's lease-renewal heartbeat
    /// task can hold its own handle independent of the handler's future.
    pub account_pool: Arc<AccountPool>,
    pub queue: QueueManager,
    pub resource_cache: ResourceCache,
    pub clients: ClientRegistry<C, F>,
    pub ledger: Arc<dyn ledger_core::Ledger>,
    pub notifier: Arc<dyn notify_adapter::Notifier>,
    pub captcha_solver: Option<Arc<dyn CaptchaSolver>>,
    pub worker_id: String,
    pub captcha_timeout: Duration,
    pub pre_login_timeout: Duration,
}

impl<C, F> JobContext<C, F>
where
    C: UpstreamClient,
    F: Fn() -> C + Send + Sync,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DatabasePool>,
        store: Arc<dyn SharedStore>,
        client_factory: F,
        ledger: Arc<dyn ledger_core::Ledger>,
        notifier: Arc<dyn notify_adapter::Notifier>,
        captcha_solver: Option<Arc<dyn CaptchaSolver>>,
        config: &Config,
    ) -> Self {
        let account_pool = Arc::new(AccountPool::new(Arc::clone(&db), Arc::clone(&store)));
        let queue_pool = AccountPool::new(Arc::clone(&db), Arc::clone(&store));
        Self {
            session_cache: SessionCache::new(Arc::clone(&store)),
            account_pool,
            queue: QueueManager::new(queue_pool, Arc::clone(&store)),
            resource_cache: ResourceCache::new(Arc::clone(&store)),
            clients: ClientRegistry::new(client_factory),
            ledger,
            notifier,
            captcha_solver,
            worker_id: config.worker_id.clone(),
            captcha_timeout: Duration::from_secs(config.captcha_timeout_secs),
            pre_login_timeout: Duration::from_secs(config.pre_login_timeout_secs),
            db,
            store,
        }
    }
}
