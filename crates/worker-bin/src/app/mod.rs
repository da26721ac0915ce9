//! Process entry points for the three CLI subcommands (§5.1 "Process
//! lifecycle"): `run` starts the worker and keep-alive cycle in the
//! foreground and blocks until SIGINT/SIGTERM; `stop`/`status` are
//! lightweight checks against the PID/socket pair a running worker left
//! behind.

mod consume;

use anyhow::{anyhow, Context as _, Result};
use futures_util::stream::StreamExt;
use job_processor::{JobContext, JobSource, RateLimiter, RedisJobBroker};
use keepalive_service::KeepAliveService;
use notify_adapter::LoggingNotifier;
use refund_adapter::SqliteLedger;
use session_cache::RedisStore;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use upstream_client::ScriptedUpstreamClient;
use worker_core::{Config, Paths};

const ROLE: &str = "job-processor";

fn db_path(database_url: &str) -> &str {
    database_url.strip_prefix("sqlite://").unwrap_or(database_url)
}

pub async fn run(config: Config) -> Result<()> {
    let paths = Paths::for_role(ROLE).context("resolving runtime paths")?;
    paths.ensure_all().context("creating runtime directories")?;

    match worker_lifecycle::check_singleton(&paths.socket_file()) {
        worker_lifecycle::SingletonCheck::AlreadyRunning => {
            return Err(anyhow!("a worker is already running (socket {:?} is live)", paths.socket_file()));
        }
        worker_lifecycle::SingletonCheck::StaleSocketCleaned => {
            info!("cleaned up a stale socket from a previous run");
        }
        worker_lifecycle::SingletonCheck::Available => {}
    }

    let listener = std::os::unix::net::UnixListener::bind(paths.socket_file())
        .context("binding the singleton-check socket")?;
    listener.set_nonblocking(true).context("setting socket non-blocking")?;
    let listener = tokio::net::UnixListener::from_std(listener).context("handing the socket to tokio")?;
    let accept_loop = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => drop(stream),
                Err(err) => {
                    warn!(error = %err, "singleton-check socket accept failed");
                    break;
                }
            }
        }
    });

    let pid = worker_lifecycle::write_pid_file(&paths.pid_file()).context("writing PID file")?;
    info!(pid, worker_id = %config.worker_id, "worker starting");

    let db = Arc::new(
        worker_db::DatabasePool::open(
            Path::new(db_path(&config.database_url)),
            worker_db::PoolConfig {
                max_size: config.db_pool_max_size,
                ..Default::default()
            },
        )
        .context("opening the relational store")?,
    );
    let store: Arc<dyn session_cache::SharedStore> = Arc::new(
        RedisStore::connect(&config.shared_store_url)
            .await
            .context("connecting to the shared store")?,
    );
    let ledger = Arc::new(SqliteLedger::new(Arc::clone(&db)));
    let notifier = Arc::new(LoggingNotifier);

    // No concrete upstream-client binding ships in this workspace (§4.5:
    // "treated as an interface; implementation is out of scope") — a real
    // deployment supplies its own `UpstreamClient` via this factory.
    let client_factory = ScriptedUpstreamClient::new;

    let ctx = Arc::new(JobContext::new(
        Arc::clone(&db),
        Arc::clone(&store),
        client_factory,
        ledger,
        Arc::clone(&notifier) as Arc<dyn notify_adapter::Notifier>,
        None,
        &config,
    ));

    let keepalive = Arc::new(KeepAliveService::new(
        Arc::clone(&db),
        Arc::clone(&store),
        Arc::clone(&ctx.account_pool),
        client_factory,
        Arc::clone(&notifier) as Arc<dyn notify_adapter::Notifier>,
        None,
        &config,
    ));

    let broker: Arc<dyn JobSource> = Arc::new(
        RedisJobBroker::connect(&config.shared_store_url, config.worker_id.clone())
            .await
            .context("connecting the job broker")?,
    );
    let rate_limiter = Arc::new(RateLimiter::new(config.worker_rate_limit_per_minute));
    let running = Arc::new(AtomicBool::new(true));

    let mut handles = Vec::new();
    for _ in 0..config.worker_concurrency {
        handles.push(tokio::spawn(consume::run_handler_loop(
            Arc::clone(&ctx),
            Arc::clone(&broker),
            Arc::clone(&rate_limiter),
            Arc::clone(&running),
        )));
    }
    handles.push(tokio::spawn(consume::run_reclaim_loop(
        Arc::clone(&broker),
        config.worker_id.clone(),
        Arc::clone(&running),
    )));

    let keepalive_for_task = Arc::clone(&keepalive);
    let keepalive_handle = tokio::spawn(async move { keepalive_for_task.run_forever().await });

    wait_for_shutdown_signal().await?;
    info!("shutdown signal received, draining in-flight work");

    running.store(false, Ordering::SeqCst);
    keepalive.stop();
    for handle in handles {
        let _ = handle.await;
    }
    let _ = keepalive_handle.await;
    accept_loop.abort();

    worker_lifecycle::cleanup_pid_file(&paths.pid_file()).ok();
    worker_lifecycle::cleanup_socket_file(&paths.socket_file()).ok();
    info!("worker stopped cleanly");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM]).context("registering signal handlers")?;
    signals.next().await;
    Ok(())
}

pub fn stop(config: &Config) -> Result<()> {
    let paths = Paths::for_role(ROLE)?;
    let pid = worker_lifecycle::read_pid_file(&paths.pid_file())?;
    match pid {
        Some(pid) => {
            info!(pid, worker_id = %config.worker_id, "sending SIGTERM to worker");
            // SAFETY: `pid` was read from our own PID file; signalling it is
            // the documented way to ask the worker to shut down gracefully.
            let result = unsafe { libc::kill(pid as i32, SIGTERM) };
            if result != 0 {
                warn!(pid, "worker process did not respond to SIGTERM (already stopped?)");
            }
            Ok(())
        }
        None => Err(anyhow!("no PID file found at {:?}; is a worker running?", paths.pid_file())),
    }
}

pub fn status(config: &Config) -> Result<()> {
    let paths = Paths::for_role(ROLE)?;
    let running = worker_lifecycle::check_singleton(&paths.socket_file()) == worker_lifecycle::SingletonCheck::AlreadyRunning;
    let pid = worker_lifecycle::read_pid_file(&paths.pid_file())?;
    match (running, pid) {
        (true, Some(pid)) => println!("worker {} running (pid {pid})", config.worker_id),
        (true, None) => println!("worker running, but no PID file was found"),
        (false, _) => println!("worker not running"),
    }
    Ok(())
}
