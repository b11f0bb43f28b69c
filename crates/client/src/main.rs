mod cli;
mod constants;
mod shutdown;
mod ui;

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pubforge_client_core::credentials::{
    Credentials, clear_credentials, credentials_path, save_credentials,
};
use pubforge_client_core::token::{FileTokenStore, StaticTokenStore, TokenStore};
use pubforge_client_engine::{
    ActiveJobStore, Coordinator, HttpBackend, InvalidationEvent, Job, JobBackend, JobStatus,
    QueueCache, QueueCacheFile, QueueConfig, QueueStore,
};

use crate::cli::{Cli, Command, QueueArgs};
use crate::constants::{EXIT_CANCELLED, EXIT_ERROR, EXIT_INTERRUPTED};
use crate::shutdown::{Interrupt, InterruptCounter, spawn_ctrl_c_handler};
use crate::ui::{JobView, summary_line};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Follow {
    Start,
    Recover,
    Stop,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pubforge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let code = match &cli.command {
        Command::Generate => follow_job(&cli, Follow::Start).await?,
        Command::Recover => follow_job(&cli, Follow::Recover).await?,
        Command::Stop => follow_job(&cli, Follow::Stop).await?,
        Command::Status { json } => {
            print_status(&cli, *json).await?;
            0
        }
        Command::Queue(args) => {
            print_queue(&cli, args).await?;
            0
        }
        Command::Login => {
            login(&cli).await?;
            0
        }
        Command::Logout => {
            logout().await?;
            0
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn token_store(cli: &Cli) -> anyhow::Result<Arc<dyn TokenStore>> {
    if let Some(token) = &cli.token {
        return Ok(Arc::new(StaticTokenStore::new(Some(token.clone()))));
    }
    Ok(Arc::new(FileTokenStore::new(credentials_path()?)))
}

/// Queue pages cached by earlier runs, if the state dir is usable.
fn load_queue_cache() -> (Arc<QueueCache>, Option<QueueCacheFile>) {
    let cache = Arc::new(QueueCache::new());
    let file = match QueueCacheFile::load_default() {
        Ok(file) => file,
        Err(err) => {
            tracing::warn!("queue cache disabled: {err:#}");
            return (cache, None);
        }
    };
    match file.restore_into(&cache) {
        Ok(restored) => tracing::debug!(restored, "queue cache restored"),
        Err(err) => tracing::warn!(path = %file.path().display(), "ignoring unreadable queue cache: {err:#}"),
    }
    (cache, Some(file))
}

async fn save_queue_cache(cache: &QueueCache, file: Option<&QueueCacheFile>) {
    let Some(file) = file else { return };
    if let Err(err) = file.save_from(cache).await {
        tracing::warn!(path = %file.path().display(), "failed to save queue cache: {err:#}");
    }
}

/// Drop cached pages tied to the old identity before the next run can read them.
async fn fire_queue_event(event: InvalidationEvent) {
    let (cache, file) = load_queue_cache();
    let dropped = cache.invalidate(event);
    tracing::debug!(?event, dropped, "queue cache invalidated");
    save_queue_cache(&cache, file.as_ref()).await;
}

fn exit_code(status: JobStatus) -> i32 {
    match status {
        JobStatus::Complete => 0,
        JobStatus::Cancelled => EXIT_CANCELLED,
        JobStatus::Idle | JobStatus::Running | JobStatus::Error => EXIT_ERROR,
    }
}

async fn follow_job(cli: &Cli, mode: Follow) -> anyhow::Result<i32> {
    let cfg = cli.coordinator_config();
    let backend = HttpBackend::new(cfg.backend_url.clone(), cfg.request_timeout)?;

    let job_store = match ActiveJobStore::load_default() {
        Ok(store) => Some(store),
        Err(err) => {
            tracing::warn!("failed to load active job record (recovery disabled): {err:#}");
            None
        }
    };
    if mode != Follow::Start && job_store.as_ref().and_then(|s| s.current()).is_none() {
        anyhow::bail!("no job recorded on this machine; start one with `pubforge generate`");
    }

    let (queue_cache, queue_file) = load_queue_cache();
    let _sweeper = queue_cache.spawn_sweeper(Duration::from_secs(60));

    let mut coordinator = Coordinator::new(cfg, backend, token_store(cli)?)
        .with_queue_cache(queue_cache.clone());
    if let Some(store) = job_store {
        coordinator = coordinator.with_job_store(store);
    }
    let handle = coordinator.spawn();

    let progress_bar = !cli.no_progress && std::io::stdout().is_terminal();
    let mut view = JobView::new(progress_bar)?;

    let mut watch = handle.watch();
    match mode {
        Follow::Start => handle.start(),
        Follow::Recover => handle.recover_connection(),
        Follow::Stop => {
            handle.recover_connection();
            handle.stop();
        }
    }

    let (interrupt_tx, mut interrupt_rx) = mpsc::unbounded_channel();
    spawn_ctrl_c_handler(Arc::new(InterruptCounter::default()), interrupt_tx);
    let mut interrupts_open = true;

    let finished: Job = loop {
        tokio::select! {
            interrupt = interrupt_rx.recv(), if interrupts_open => match interrupt {
                Some(Interrupt::StopJob) => {
                    view.set_stop_message(
                        "Stop requested, waiting for the backend (press CTRL+C again to exit immediately).",
                    );
                    handle.stop();
                }
                Some(Interrupt::Exit) => {
                    view.set_stop_message("Exiting now; the job keeps running. Use `pubforge recover` to reattach.");
                    view.freeze();
                    std::process::exit(EXIT_INTERRUPTED);
                }
                None => interrupts_open = false,
            },
            job = watch.changed() => {
                let Some(job) = job else {
                    break handle.state();
                };
                view.render(&job);
                if job.is_terminal() {
                    break job;
                }
            }
        }
    };

    view.freeze();
    println!("{}", summary_line(&finished));
    handle.shutdown().await?;
    save_queue_cache(&queue_cache, queue_file.as_ref()).await;
    Ok(exit_code(finished.status))
}

async fn print_status(cli: &Cli, json: bool) -> anyhow::Result<()> {
    let store = ActiveJobStore::load_default()?;
    let Some(record) = store.current() else {
        println!("No job recorded on this machine.");
        return Ok(());
    };
    let token = token_store(cli)?
        .access_token()
        .ok_or_else(|| anyhow::anyhow!("not authenticated; run `pubforge login --token <TOKEN>`"))?;

    let cfg = cli.coordinator_config();
    let backend = HttpBackend::new(cfg.backend_url, cfg.request_timeout)?;
    let frame = backend.job_frame(&record.job_id, &token).await?;
    let delta = frame.to_delta(0);

    if json {
        let out = serde_json::json!({
            "job_id": record.job_id,
            "started_at": record.started_at,
            "status": frame.status.as_str(),
            "progress": delta,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("job        {}", record.job_id);
    println!("started    {}", record.started_at.to_rfc3339());
    println!("status     {}", frame.status.as_str());
    if let Some(progress) = delta.progress {
        println!("progress   {progress:.1}%");
    }
    let count = |v: Option<u32>| v.map_or_else(|| "-".to_string(), |n| n.to_string());
    println!(
        "books      {} processed / {} total ({} ok, {} failed)",
        count(delta.processed_books),
        count(delta.total_books),
        count(delta.successful_books),
        count(delta.failed_books),
    );
    if let Some(step) = &delta.current_step {
        println!("step       {step}");
    }
    if let Some(err) = &frame.error {
        println!("error      {err}");
    }
    Ok(())
}

async fn print_queue(cli: &Cli, args: &QueueArgs) -> anyhow::Result<()> {
    let cfg = cli.coordinator_config();
    let backend = HttpBackend::new(cfg.backend_url, cfg.request_timeout)?;
    let (cache, file) = load_queue_cache();
    let store = QueueStore::new(
        backend,
        cache.clone(),
        token_store(cli)?,
        QueueConfig::default(),
    );

    let fetched = store.fetch(args.page, args.per_page, !args.refresh).await;
    save_queue_cache(&cache, file.as_ref()).await;
    let snapshot = fetched?;
    let stats = snapshot.stats();
    let health = store.health(&snapshot);

    if args.json {
        let out = serde_json::json!({
            "queue": snapshot,
            "stats": stats,
            "health": health,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    for item in &snapshot.items {
        println!("{:<10} {:<10} {}", item.id, item.status, item.title);
    }
    println!(
        "page {} ({} per page), {} total: {} pending, {} review, {} uploaded, {} failed",
        snapshot.page,
        snapshot.per_page,
        snapshot.total,
        stats.pending,
        stats.review,
        stats.uploaded,
        stats.failed,
    );
    if health.is_healthy {
        println!("queue looks healthy");
    }
    for (issue, hint) in health.issues.iter().zip(&health.recommendations) {
        println!("warning: {issue} ({hint})");
    }
    Ok(())
}

async fn login(cli: &Cli) -> anyhow::Result<()> {
    let Some(token) = cli.token.as_deref() else {
        anyhow::bail!("usage: pubforge login --token <TOKEN>");
    };
    let creds = Credentials::new(token);
    if creds.access_token.is_none() {
        anyhow::bail!("token must not be empty");
    }
    let path = credentials_path()?;
    save_credentials(&path, &creds)?;
    fire_queue_event(InvalidationEvent::UserLogin).await;
    println!("Saved credentials to {}", path.display());
    Ok(())
}

async fn logout() -> anyhow::Result<()> {
    let path = credentials_path()?;
    let removed = clear_credentials(&path)?;
    fire_queue_event(InvalidationEvent::UserLogout).await;
    if removed {
        println!("Removed {}", path.display());
    } else {
        println!("Not logged in.");
    }
    Ok(())
}
