use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tokio::signal::unix::SignalKind;
use tokio::signal::unix::signal;
use tokio_util::sync::CancellationToken;

use pvrd_core::config;
use pvrd_core::config::Config;
use pvrd_core::epg::EpgStore;
use pvrd_core::error::Error;
use pvrd_core::events::EventEmitter;
use pvrd_core::recording::RecordingManager;
use pvrd_core::recording::StatvfsProbe;
use pvrd_core::timers::TimerTable;
use pvrd_core::tracing_ext::init_tracing;
use pvrd_core::tuner::LocalTunerPool;

#[derive(Parser)]
#[command(about)]
struct Opt {
    /// Path to a configuration file in a YAML format.
    ///
    /// The PVRD_CONFIG environment variable is used if this option is not
    /// specified.  Its value has to be an absolute path.
    #[arg(short, long, env = "PVRD_CONFIG")]
    config: PathBuf,

    /// Logging format.
    #[arg(long, env = "PVRD_LOG_FORMAT", value_parser = ["text", "json"], default_value = "text")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let opt = Opt::parse();

    init_tracing(&opt.log_format);

    let config = config::load(&opt.config);

    let emitter = EventEmitter::default();
    let epg = Arc::new(EpgStore::new());
    let timers = Arc::new(TimerTable::new(emitter.clone()));
    timers.load(&config.scheduler.timers_file).await?;

    let pool = LocalTunerPool::new(&config);
    let capacity = pool.capacity();
    let manager = Arc::new(RecordingManager::new(
        config.clone(),
        pool,
        epg.clone(),
        timers.clone(),
        Box::new(StatvfsProbe),
        capacity,
        emitter,
    ));

    tracing::info!(
        tick = %humantime::format_duration(config.scheduler.tick_interval),
        maintain = %humantime::format_duration(config.scheduler.maintain_interval),
        "Starting scheduler"
    );

    let token = CancellationToken::new();
    let driver = tokio::spawn(drive(
        config.clone(),
        manager.clone(),
        timers.clone(),
        epg,
        token.clone(),
    ));

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {
            tracing::info!("SIGINT received");
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received");
        }
    }

    tracing::info!("Stopping...");
    token.cancel();
    driver.await.ok();
    manager.shutdown().await;
    timers.save(&config.scheduler.timers_file).await;
    Ok(())
}

/// The periodic driver: a fast tick for admission and session polling, and a
/// slower one for registry housekeeping and event binding.
async fn drive(
    config: Arc<Config>,
    manager: Arc<RecordingManager<LocalTunerPool>>,
    timers: Arc<TimerTable>,
    epg: Arc<EpgStore>,
    token: CancellationToken,
) {
    let mut tick = tokio::time::interval(config.scheduler.tick_interval);
    let mut maintain = tokio::time::interval(config.scheduler.maintain_interval);
    let grace = chrono::Duration::from_std(config.scheduler.expire_grace)
        .unwrap_or_else(|_| chrono::Duration::seconds(60));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = Utc::now();
                manager.tick(now).await;
                if timers.is_modified() {
                    timers.save(&config.scheduler.timers_file).await;
                }
            }
            _ = maintain.tick() => {
                let now = Utc::now();
                timers.maintain(now).await;
                timers.expire(now, grace).await;
                timers.bind_events(&epg, now).await;
            }
            _ = token.cancelled() => {
                break;
            }
        }
    }
}
